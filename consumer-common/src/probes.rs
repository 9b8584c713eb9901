//! Kubernetes style probe endpoints.
//!
//! Liveness only tells the orchestrator the HTTP server is up. Readiness is
//! delegated to the caller, which knows whether its consumer reached the
//! broker.

use axum::http::StatusCode;
use axum::{routing::get, Router};

pub fn probes_router<F>(is_ready: F) -> Router
where
    F: Fn() -> bool + Clone + Send + Sync + 'static,
{
    Router::new()
        .route("/_liveness", get(|| async { "ok" }))
        .route(
            "/_readiness",
            get(move || {
                let ready = is_ready();
                async move {
                    if ready {
                        (StatusCode::OK, "ready")
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
                    }
                }
            }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn status_of(router: Router, path: &str) -> StatusCode {
        router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn liveness_is_always_ok() {
        let router = probes_router(|| false);
        assert_eq!(status_of(router, "/_liveness").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_follows_callback() {
        let flag = Arc::new(AtomicBool::new(false));
        let probe_flag = flag.clone();
        let router = probes_router(move || probe_flag.load(Ordering::SeqCst));

        assert_eq!(
            status_of(router.clone(), "/_readiness").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        flag.store(true, Ordering::SeqCst);
        assert_eq!(status_of(router, "/_readiness").await, StatusCode::OK);
    }
}
