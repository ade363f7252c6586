use reqwest::StatusCode;
use tracing::{debug, warn};

use crate::model::UserProfile;

/// A client for the identity-verification endpoint (`GET /api/userinfo`).
#[derive(Clone)]
pub struct IdentityClient {
    api_url: String,
    http: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("token rejected")]
    Unauthorized,
    #[error("no profile for this account")]
    NotFound,
    #[error("identity server error (status {0})")]
    Server(u16),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl IdentityClient {
    pub fn new(api_url: &str) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn fetch_profile(&self, token: &str) -> Result<UserProfile, IdentityError> {
        let url = format!("{}/api/userinfo", self.api_url);
        debug!("GET {}", url);

        let resp = self.http.get(&url).bearer_auth(token).send().await?;
        match resp.status() {
            StatusCode::OK => Ok(resp.json::<UserProfile>().await?),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(IdentityError::Unauthorized),
            StatusCode::NOT_FOUND => Err(IdentityError::NotFound),
            status => {
                warn!("userinfo returned {}", status);
                Err(IdentityError::Server(status.as_u16()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{HeaderMap, StatusCode},
        response::IntoResponse,
        routing::get,
        Json, Router,
    };
    use serde_json::json;

    async fn userinfo(headers: HeaderMap) -> impl IntoResponse {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        match auth.as_str() {
            "Bearer admin-token" => (
                StatusCode::OK,
                Json(json!({"uid": "u1", "email": "a@club.test", "role": "admin", "promo": 2024})),
            ),
            "Bearer orphan-token" => (
                StatusCode::NOT_FOUND,
                Json(json!({"message": "User not found"})),
            ),
            "Bearer broken-token" => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"message": "Internal Server Error"})),
            ),
            _ => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"message": "Unauthorized"})),
            ),
        }
    }

    async fn client() -> IdentityClient {
        let app = Router::new().route("/api/userinfo", get(userinfo));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        IdentityClient::new(&format!("http://{addr}/"))
    }

    #[tokio::test]
    async fn test_profile() {
        let profile = client().await.fetch_profile("admin-token").await.unwrap();
        assert_eq!(profile.uid, "u1");
        assert!(profile.is_admin());
        assert_eq!(profile.extra["promo"], json!(2024));
    }

    #[tokio::test]
    async fn test_status_mapping() {
        let client = client().await;
        assert!(matches!(
            client.fetch_profile("nope").await,
            Err(IdentityError::Unauthorized)
        ));
        assert!(matches!(
            client.fetch_profile("orphan-token").await,
            Err(IdentityError::NotFound)
        ));
        assert!(matches!(
            client.fetch_profile("broken-token").await,
            Err(IdentityError::Server(500))
        ));
    }
}
