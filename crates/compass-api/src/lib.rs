//! Compass API crate - axum HTTP server, bearer auth, SSE chat streaming.
//!
//! `POST /chat/stream` relays the conversation pipeline as `data: <json>`
//! frames; `GET /conversations/{id}/turns` serves history for the client
//! retry path; `GET /health` reports liveness.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod rate_limit;
pub mod routes;
pub mod state;

pub use auth::{Authenticator, AuthedUser, TokenTable};
pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
