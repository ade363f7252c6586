use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use club_core::document_store::DocumentStore;
use club_core::id_token::TokenSigner;
use club_core::model::USERS;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, warn};

pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub signer: TokenSigner,
}

pub fn router(state: Arc<AppState>, allowed_origin: Option<HeaderValue>) -> Router {
    let router = Router::new()
        .route("/api/userinfo", get(userinfo))
        .route("/health", get(health))
        .with_state(state);

    match allowed_origin {
        Some(origin) => router.layer(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET])
                .allow_headers([header::AUTHORIZATION]),
        ),
        None => router,
    }
}

fn message(status: StatusCode, msg: &str) -> Response {
    (status, Json(json!({ "message": msg }))).into_response()
}

fn unauthorized() -> Response {
    message(StatusCode::UNAUTHORIZED, "Unauthorized")
}

/// The token from `Authorization: Bearer <token>`, if well-formed.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

async fn userinfo(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(token) = bearer_token(&headers) else {
        debug!("userinfo: missing or malformed Authorization header");
        return unauthorized();
    };

    let claims = match state.signer.verify(token) {
        Ok(claims) => claims,
        Err(e) => {
            warn!("userinfo: rejected token: {e}");
            return unauthorized();
        }
    };

    match state.store.get(USERS, &claims.uid).await {
        Ok(Some(doc)) => {
            let mut profile = doc.fields;
            profile.insert("uid".to_string(), Value::String(claims.uid));
            Json(Value::Object(profile)).into_response()
        }
        Ok(None) => {
            debug!("userinfo: no profile for {}", claims.uid);
            message(StatusCode::NOT_FOUND, "User not found")
        }
        Err(e) => {
            error!("userinfo: failed to read profile for {}: {e}", claims.uid);
            message(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
