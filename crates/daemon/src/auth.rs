//! HTTP Ingress bearer-token authentication.
//!
//! Unlike a "dev mode" auth layer, there is no way to run this middleware
//! without a configured token — `AppState::new` is only ever built from an
//! `HttpConfig` that already refused to come into existence without one.
//! Missing/malformed headers are 401; a well-formed but wrong token is 403.

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::state::AppState;

pub async fn require_api_token(State(state): State<AppState>, req: Request<Body>, next: Next) -> Response {
    let provided = match req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        Some(token) if !token.is_empty() => token,
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                axum::Json(serde_json::json!({ "error": "missing bearer token" })),
            )
                .into_response();
        }
    };

    let provided_hash = Sha256::digest(provided.as_bytes());
    if !bool::from(provided_hash.ct_eq(&state.api_token_hash)) {
        return (
            StatusCode::FORBIDDEN,
            axum::Json(serde_json::json!({ "error": "invalid bearer token" })),
        )
            .into_response();
    }

    next.run(req).await
}
