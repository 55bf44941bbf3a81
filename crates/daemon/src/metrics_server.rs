//! Metrics HTTP Server for recstation
//!
//! Exposes the daemon status snapshot for monitoring tools.

use axum::{extract::State, routing::get, Json, Router};
use thiserror::Error;
use tracing::info;

use crate::metrics::{SharedStatus, StatusSnapshot};

/// Errors that can occur when running the metrics server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handler for GET /metrics endpoint
/// Returns the current StatusSnapshot as JSON
async fn get_metrics(State(status): State<SharedStatus>) -> Json<StatusSnapshot> {
    let snapshot = status.read().await.clone();
    Json(snapshot)
}

/// Creates the axum Router with metrics endpoint
pub fn create_metrics_router(status: SharedStatus) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(status)
}

/// Runs the metrics HTTP server on `listen`
pub async fn run_metrics_server(status: SharedStatus, listen: &str) -> Result<(), ServerError> {
    let app = create_metrics_router(status);

    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(listen, "metrics server listening");
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{new_shared_status, EncodeCounts, ReservationCounts};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_get_metrics_returns_json() {
        let status = new_shared_status();
        {
            let mut snapshot = status.write().await;
            snapshot.timestamp_unix_ms = 1701388800000;
            snapshot.worker_running = true;
            snapshot.reservations = ReservationCounts {
                reserved: 4,
                recording: 1,
                conflict: 2,
                skipped: 0,
            };
            snapshot.encode = EncodeCounts {
                queued: 3,
                running: 1,
                succeeded: 42,
                failed: 2,
                cancelled: 1,
            };
            snapshot.active_streams = 2;
        }

        let app = create_metrics_router(status.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let content_type = response
            .headers()
            .get("content-type")
            .expect("should have content-type header");
        assert!(content_type
            .to_str()
            .unwrap()
            .contains("application/json"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let snapshot: StatusSnapshot =
            serde_json::from_slice(&body).expect("should deserialize to StatusSnapshot");

        assert_eq!(snapshot.timestamp_unix_ms, 1701388800000);
        assert!(snapshot.worker_running);
        assert_eq!(snapshot.reservations.conflict, 2);
        assert_eq!(snapshot.encode.succeeded, 42);
        assert_eq!(snapshot.active_streams, 2);
    }

    #[tokio::test]
    async fn test_get_metrics_empty_snapshot() {
        let app = create_metrics_router(new_shared_status());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let snapshot: StatusSnapshot = serde_json::from_slice(&body).unwrap();
        assert_eq!(snapshot, StatusSnapshot::default());
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let app = create_metrics_router(new_shared_status());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/reserves")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
