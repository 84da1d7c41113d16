//! Router setup with all API routes and middleware.

use std::future::Future;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use compass_core::config::CompassConfig;
use compass_core::error::CompassError;

use crate::handlers;
use crate::rate_limit::RateLimiter;
use crate::state::AppState;

/// Requests per second allowed on the non-streaming routes.
const RATE_LIMIT_PER_SEC: u64 = 100;

/// Create the axum Router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // Allow localhost origins on the configured port and the dev port above it.
    let port = state.config.general.port;
    let dev_port = port.saturating_add(1);
    let origins: Vec<HeaderValue> = [port, dev_port]
        .iter()
        .flat_map(|p| [format!("http://127.0.0.1:{}", p), format!("http://localhost:{}", p)])
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    let public_routes = Router::new().route("/health", get(handlers::health));

    let limiter = RateLimiter::new(RATE_LIMIT_PER_SEC);

    let rate_limited_routes = Router::new()
        .route(
            "/conversations/{id}/turns",
            get(handlers::conversation_turns),
        )
        .layer(axum::middleware::from_fn(
            crate::rate_limit::rate_limit_middleware,
        ))
        .layer(axum::Extension(limiter));

    // Streams are long-lived and exempt from rate limiting.
    let stream_routes = Router::new().route("/chat/stream", post(handlers::chat_stream));

    let protected_routes =
        rate_limited_routes
            .merge(stream_routes)
            .route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                crate::auth::require_auth,
            ));

    public_routes
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(64 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API on 127.0.0.1 at the configured port until `shutdown` resolves.
pub async fn start_server<F>(
    config: &CompassConfig,
    state: AppState,
    shutdown: F,
) -> Result<(), CompassError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("127.0.0.1:{}", config.general.port);
    let router = create_router(state);

    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("API server stopped");
    Ok(())
}
