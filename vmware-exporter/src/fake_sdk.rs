//! Local vim25 endpoint answering with canned responses.
//!
//! Serves plain HTTP on a loopback port. Replies are queued per operation
//! (the local name of the element inside `Body`); the last queued reply of an
//! operation keeps being served once the earlier ones are used up. A
//! successful `Login` sets [`SESSION_COOKIE`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use tokio::task::JoinHandle;

use crate::soap;

/// Cookie handed out by a successful `Login`.
pub(crate) const SESSION_COOKIE: &str = "vmware_soap_session=52f1a3c0";

/// One request as seen by the endpoint.
#[derive(Debug, Clone)]
pub(crate) struct Recorded {
    pub operation: String,
    pub cookie: Option<String>,
    pub body: String,
}

#[derive(Default)]
struct Sdk {
    replies: Mutex<HashMap<String, VecDeque<(StatusCode, String)>>>,
    requests: Mutex<Vec<Recorded>>,
}

impl Sdk {
    fn next_reply(&self, operation: &str) -> (StatusCode, String) {
        let mut replies = self.replies.lock().unwrap();
        match replies.get_mut(operation) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) if !queue.is_empty() => queue[0].clone(),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                fault("ServerFaultCode", &format!("no reply for {operation}")),
            ),
        }
    }
}

pub(crate) struct FakeSdk {
    sdk: Arc<Sdk>,
    url: reqwest::Url,
    server: JoinHandle<()>,
}

impl FakeSdk {
    pub(crate) async fn start() -> Self {
        let sdk = Arc::new(Sdk::default());
        let app = Router::new()
            .route("/sdk", post(handle))
            .with_state(Arc::clone(&sdk));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = reqwest::Url::parse(&format!("http://{}/sdk", listener.local_addr().unwrap()))
            .unwrap();
        let server = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { sdk, url, server }
    }

    pub(crate) fn url(&self) -> reqwest::Url {
        self.url.clone()
    }

    /// Queues a `200 OK` reply wrapping `inner` in an envelope.
    pub(crate) fn reply(&self, operation: &str, inner: &str) {
        self.reply_with(operation, StatusCode::OK, envelope(inner));
    }

    pub(crate) fn reply_with(&self, operation: &str, status: StatusCode, body: String) {
        self.sdk
            .replies
            .lock()
            .unwrap()
            .entry(operation.to_string())
            .or_default()
            .push_back((status, body));
    }

    pub(crate) fn requests(&self) -> Vec<Recorded> {
        self.sdk.requests.lock().unwrap().clone()
    }

    pub(crate) fn operations(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.operation).collect()
    }
}

impl Drop for FakeSdk {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Wraps a response element in a SOAP envelope.
pub(crate) fn envelope(inner: &str) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
            r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">"#,
            "<soapenv:Body>{}</soapenv:Body></soapenv:Envelope>"
        ),
        inner
    )
}

/// A SOAP fault document.
pub(crate) fn fault(code: &str, message: &str) -> String {
    envelope(&format!(
        "<soapenv:Fault><faultcode>{}</faultcode><faultstring>{}</faultstring></soapenv:Fault>",
        soap::escape(code),
        soap::escape(message)
    ))
}

async fn handle(State(sdk): State<Arc<Sdk>>, headers: HeaderMap, body: String) -> Response {
    let operation = operation(&body).unwrap_or_default();
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    sdk.requests.lock().unwrap().push(Recorded {
        operation: operation.clone(),
        cookie,
        body,
    });

    let (status, text) = sdk.next_reply(&operation);
    let mut response = (
        status,
        [(header::CONTENT_TYPE, "text/xml; charset=utf-8")],
        text,
    )
        .into_response();
    if operation == "Login" && status.is_success() {
        response.headers_mut().insert(
            header::SET_COOKIE,
            HeaderValue::from_str(&format!("{SESSION_COOKIE}; Path=/; HttpOnly")).unwrap(),
        );
    }
    response
}

fn operation(body: &str) -> Option<String> {
    let doc = roxmltree::Document::parse(body).ok()?;
    let body = soap::child(doc.root_element(), "Body")?;
    body.children()
        .find(roxmltree::Node::is_element)
        .map(|n| n.tag_name().name().to_string())
}
