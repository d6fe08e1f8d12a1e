//! Axum JSON API over the complaint reconciliation service.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::JsonRejection, Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use grv_core::{BatchItemResult, BatchPayload, RawRecord};
use grv_reconcile::{Backend, ServiceConfig};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "grv-web";

#[derive(Clone)]
pub struct AppState {
    pub backend: Backend,
}

impl AppState {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }
}

#[derive(Debug, Serialize)]
struct BatchReportResponse {
    message: String,
    results: Vec<BatchItemResult>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/complaints", get(merged_complaints_handler))
        .route("/api/complaints/report", get(report_handler))
        .route("/api/complaints/batch-report", post(batch_report_handler))
        .route("/api/complaints/{id}", get(complaint_detail_handler))
        .fallback(not_found_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve(config: &ServiceConfig) -> anyhow::Result<()> {
    let backend = Backend::connect(config).await?;
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding port {}", config.web_port))?;
    info!(port = config.web_port, "complaint service listening");
    axum::serve(listener, app(AppState::new(backend)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    serve(&ServiceConfig::from_env()).await
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
    }
    info!("shutting down");
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn merged_complaints_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.backend.reconciler.merged().await).into_response()
}

async fn report_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.backend.reconciler.store_report().await {
        Ok(complaints) => Json(complaints).into_response(),
        Err(err) => server_error("Server error", err),
    }
}

async fn complaint_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    match state.backend.store.find_complaint(&id).await {
        Ok(Some(row)) => {
            Json(state.backend.reconciler.canonicalize(&RawRecord::Store(row))).into_response()
        }
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Complaint not found", None),
        Err(err) => server_error("Server error", err),
    }
}

async fn batch_report_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<BatchPayload>, JsonRejection>,
) -> Response {
    let items = match payload {
        Ok(Json(payload)) => payload.into_items(),
        Err(rejection) => {
            info!(error = %rejection.body_text(), "rejected batch payload");
            return error_response(
                rejection.status(),
                "Invalid batch payload",
                Some(rejection.body_text()),
            );
        }
    };
    match state.backend.store.apply_batch(&items).await {
        Ok(results) => {
            let succeeded = results.iter().filter(|r| r.is_success()).count();
            let message = format!(
                "Processed {} complaint(s): {} succeeded, {} failed",
                results.len(),
                succeeded,
                results.len() - succeeded
            );
            (
                StatusCode::CREATED,
                Json(BatchReportResponse { message, results }),
            )
                .into_response()
        }
        Err(err) => server_error("Batch transaction failed", err),
    }
}

async fn not_found_handler() -> Response {
    error_response(StatusCode::NOT_FOUND, "Not found", None)
}

fn error_response(status: StatusCode, error: &str, details: Option<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
            details,
        }),
    )
        .into_response()
}

fn server_error(message: &str, err: impl std::fmt::Display) -> Response {
    error!(error = %err, "{message}");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        message,
        Some(err.to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use grv_reconcile::SnapshotLocation;
    use grv_storage::ComplaintStore;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct Harness {
        app: Router,
        store: ComplaintStore,
        facilities: i64,
        _dir: TempDir,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let snapshot = dir.path().join("complaints.json");
        std::fs::write(
            &snapshot,
            json!([
                {"id": "c1", "student_view": {"complaint": "stale copy", "severity": 1}},
                {"id": "s2", "student_view": {"complaint": "hostel wifi"}, "admin_view": {"departments": ["Hostel & Mess"]}}
            ])
            .to_string(),
        )
        .unwrap();

        let store = ComplaintStore::in_memory().await.unwrap();
        let facilities = store.upsert_department("Facilities", None).await.unwrap();
        let backend = Backend::from_parts(store.clone(), SnapshotLocation::single(snapshot), "Test Institute");
        Harness {
            app: app(AppState::new(backend)),
            store,
            facilities,
            _dir: dir,
        }
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let h = harness().await;
        let (status, body) = send(&h.app, get_req("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn batch_report_then_merged_view() {
        let h = harness().await;
        let (status, body) = send(
            &h.app,
            post_json(
                "/api/complaints/batch-report",
                &json!([{
                    "id": "c1",
                    "student_view": {"complaint": "broken AC", "severity": 2, "status": "Pending"},
                    "admin_view": {"departments": ["Facilities"]}
                }]),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(
            body["results"],
            json!([{"complaint_id": "c1", "status": "success", "dept_id": h.facilities}])
        );
        assert!(body["message"].as_str().unwrap().contains("1 succeeded"));

        let (status, merged) = send(&h.app, get_req("/api/complaints")).await;
        assert_eq!(status, StatusCode::OK);
        let merged = merged.as_array().unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0]["id"], "c1");
        assert_eq!(merged[0]["category"], "facilities");
        assert_eq!(merged[0]["studentView"]["severity"], 2);
        assert_eq!(merged[0]["studentView"]["complaint"], "broken AC");
        assert!(merged[0].get("source").is_none());
        assert_eq!(merged[1]["id"], "s2");
        assert_eq!(merged[1]["category"], "hostel_mess");
    }

    #[tokio::test]
    async fn report_is_store_only() {
        let h = harness().await;
        let (status, body) = send(&h.app, get_req("/api/complaints/report")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn single_object_body_and_partial_failure() {
        let h = harness().await;
        let (status, body) = send(
            &h.app,
            post_json(
                "/api/complaints/batch-report",
                &json!({"id": "x1", "student_view": {"complaint": "?"}, "admin_view": {"departments": ["Astrology"]}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["results"][0]["status"], "failed");
        assert_eq!(body["results"][0]["reason"], "department not found");
    }

    #[tokio::test]
    async fn detail_lookup_found_and_missing() {
        let h = harness().await;
        send(
            &h.app,
            post_json(
                "/api/complaints/batch-report",
                &json!({"id": "c7", "student_view": {"complaint": "door jammed"}, "admin_view": {"departments": ["facilities"]}}),
            ),
        )
        .await;

        let (status, body) = send(&h.app, get_req("/api/complaints/c7")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["adminView"]["complaint"], "door jammed");
        assert_eq!(body["studentView"]["institute"], "Test Institute");

        let (status, body) = send(&h.app, get_req("/api/complaints/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Complaint not found");
    }

    #[tokio::test]
    async fn rolled_back_batch_is_a_500() {
        let h = harness().await;
        install_poison_trigger(&h.store).await;
        let (status, body) = send(
            &h.app,
            post_json(
                "/api/complaints/batch-report",
                &json!([
                    {"id": "ok1", "student_view": {"complaint": "a"}, "admin_view": {"departments": ["Facilities"]}},
                    {"id": "poison", "student_view": {"complaint": "b"}, "admin_view": {"departments": ["Facilities"]}}
                ]),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Batch transaction failed");
        assert!(body["details"].as_str().unwrap().contains("batch item 1"));

        let (_, report) = send(&h.app, get_req("/api/complaints/report")).await;
        assert_eq!(report, json!([]));
    }

    #[tokio::test]
    async fn malformed_body_is_a_client_error() {
        let h = harness().await;
        let bad = Request::builder()
            .method("POST")
            .uri("/api/complaints/batch-report")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("[{"))
            .unwrap();
        let (status, body) = send(&h.app, bad).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid batch payload");
    }

    #[tokio::test]
    async fn empty_batch_is_created_with_no_results() {
        let h = harness().await;
        let (status, body) = send(&h.app, post_json("/api/complaints/batch-report", &json!([]))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["results"], json!([]));
        assert_eq!(body["message"], "Processed 0 complaint(s): 0 succeeded, 0 failed");

        let (_, report) = send(&h.app, get_req("/api/complaints/report")).await;
        assert_eq!(report, json!([]));
    }

    #[tokio::test]
    async fn unknown_route_is_json_404() {
        let h = harness().await;
        let (status, body) = send(&h.app, get_req("/api/bookings")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "Not found");
    }

    async fn install_poison_trigger(store: &ComplaintStore) {
        sqlx::query(
            "CREATE TRIGGER reject_poison BEFORE INSERT ON complaints \
             WHEN NEW.complaint_id = 'poison' \
             BEGIN SELECT RAISE(ABORT, 'injected failure'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();
    }
}
