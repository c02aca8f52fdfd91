//! HTTP surface: landing page, metrics and health.

use std::sync::{Arc, PoisonError, RwLock};

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use vmware_exporter::sink::TEXT_CONTENT_TYPE;
use vmware_exporter::{ScrapeReport, Scraper};

/// Paths the metrics path may not take.
pub const RESERVED_PATHS: [&str; 2] = ["/", "/health"];

/// Shared server state.
pub struct AppState {
    scraper: Scraper,
    metrics_path: String,
    last_report: RwLock<Option<ScrapeReport>>,
}

impl AppState {
    /// Wraps `scraper` for sharing between handlers.
    pub fn new(scraper: Scraper, metrics_path: String) -> Arc<Self> {
        Arc::new(Self {
            scraper,
            metrics_path,
            last_report: RwLock::new(None),
        })
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    last_scrape: Option<ScrapeReport>,
}

/// Build the axum router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route(&state.metrics_path, get(handle_metrics))
        .route("/health", get(handle_health))
        .with_state(state)
}

async fn handle_index(State(state): State<Arc<AppState>>) -> Html<String> {
    Html(format!(
        concat!(
            "<html>\n<head><title>VMware Exporter</title></head>\n<body>\n",
            "<h1>VMware Exporter</h1>\n<p><a href=\"{0}\">{0}</a></p>\n",
            "</body>\n</html>\n"
        ),
        state.metrics_path
    ))
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.scraper.collect().await {
        Ok((report, body)) => {
            *state
                .last_report
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(report);
            ([(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)], body).into_response()
        }
        Err(e) => {
            tracing::error!("failed to serve metrics: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let last_scrape = state
        .last_report
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    Json(HealthResponse {
        status: "ok",
        last_scrape,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;
    use vmware_exporter::error::ConnectionError;
    use vmware_exporter::{Connector, Endpoint, MetricSink, ScrapeConfig, Session};

    /// Connector for an endpoint that is down.
    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Session>, ConnectionError> {
            Err(ConnectionError::InvalidEndpoint {
                host: endpoint.host.clone(),
                reason: "unreachable".to_string(),
            })
        }
    }

    fn app(metrics_path: &str) -> Router {
        let sink = Arc::new(MetricSink::new());
        sink.register_build_info("0.1.0").unwrap();
        let scraper = Scraper::new(
            Arc::new(Unreachable),
            Endpoint::new("vc.test", "u", "p"),
            ScrapeConfig::default(),
            sink,
        );
        router(AppState::new(scraper, metrics_path.to_string()))
    }

    async fn fetch(app: &Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_landing_page_links_metrics_path() {
        let app = app("/vsphere");
        let (status, _, body) = fetch(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#"<a href="/vsphere">"#));
    }

    #[tokio::test]
    async fn test_metrics_is_served_even_when_the_scrape_fails() {
        let app = app("/metrics");
        let (status, content_type, body) = fetch(&app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some(TEXT_CONTENT_TYPE));
        assert!(body.contains(r#"vmware_exporter_build_info{version="0.1.0"} 1"#));
    }

    #[tokio::test]
    async fn test_health_reports_last_scrape() {
        let app = app("/metrics");
        let (_, _, before) = fetch(&app, "/health").await;
        let before: serde_json::Value = serde_json::from_str(&before).unwrap();
        assert_eq!(before["status"], "ok");
        assert!(before["last_scrape"].is_null());

        fetch(&app, "/metrics").await;
        let (_, _, after) = fetch(&app, "/health").await;
        let after: serde_json::Value = serde_json::from_str(&after).unwrap();
        assert_eq!(after["last_scrape"]["state"], "idle");
        assert_eq!(after["last_scrape"]["vms_collected"], 0);
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let app = app("/metrics");
        let (status, _, _) = fetch(&app, "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
