//! HTTP front door: `/api/<cmd>/<arg>..` runs the command menu, `/health`
//! reports liveness.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    body::Body,
    extract::Extension,
    http::{HeaderName, HeaderValue, Method, Request},
    routing::get,
    Router,
};
use tokio::{net::TcpListener, signal};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::PropagateRequestIdLayer,
    set_header::SetRequestHeaderLayer,
    trace::TraceLayer,
};
use tracing::{debug_span, info, Span};
use uuid::Uuid;

use crate::Core;

pub mod handlers;

/// The service router, without a listener.
pub fn router(core: Arc<Core>) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_origin(Any);

    Router::new()
        .route("/api", get(handlers::command).post(handlers::command))
        .route("/api/", get(handlers::command).post(handlers::command))
        .route("/api/*cmd", get(handlers::command).post(handlers::command))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestHeaderLayer::if_not_present(
                    HeaderName::from_static("x-request-id"),
                    |_req: &_| HeaderValue::from_str(Uuid::new_v4().to_string().as_str()).ok(),
                ))
                .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
                    "x-request-id",
                )))
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(cors),
        )
        .route("/health", get(handlers::health).options(handlers::health))
        .layer(Extension(core))
}

/// Serves on `port` until interrupted, with the core's background workers
/// running alongside.
/// # Errors
/// Returns an error if the listener cannot be bound or the server fails.
pub async fn serve(port: u16, core: Arc<Core>) -> Result<()> {
    let workers = core.start_workers();
    let app = router(core);

    let listener = TcpListener::bind(format!("::0:{port}")).await?;

    info!("Listening on [::]:{}", port);

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    workers.stop().await;
    info!("Gracefully shutdown");

    Ok(served?)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!("Could not install Ctrl-C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!("Could not install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

// span
fn make_span(request: &Request<Body>) -> Span {
    let headers = request.headers();
    let path = request.uri().path();
    let request_id = headers
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");

    // Arguments travel in the path, keep passwords out of the logs.
    let command = path
        .strip_prefix("/api/")
        .and_then(|rest| rest.split('/').next())
        .unwrap_or(path);

    debug_span!("http-request", command, request_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::offline_core;
    use axum::http::StatusCode;
    use tower::ServiceExt;

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn whoami_without_token() {
        let app = router(offline_core().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/system/whoami")
                    .header("x-forwarded-for", "192.0.2.1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-request-id").is_some());
        assert!(response.headers().get("X-ReturnCode").is_none());
        assert_eq!(body_text(response).await, "Not authenticated\n");
    }

    #[tokio::test]
    async fn garbage_token_gets_a_bare_challenge() {
        let app = router(offline_core().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/system/whoami")
                    .header("authorization", "Bearer garbage")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let challenge = response
            .headers()
            .get("www-authenticate")
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert!(challenge.starts_with("Bearer realm="));
        assert!(!challenge.contains("access_token"));
    }

    #[tokio::test]
    async fn unknown_command_sets_return_code() {
        let app = router(offline_core().await);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/nosuchthing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers().get("X-ReturnCode").unwrap(), "1");
        assert!(body_text(response)
            .await
            .starts_with("An error occurred: Unknown command: nosuchthing"));
    }
}
