//! The signed-in user, passed explicitly to whatever needs to know who is
//! acting.
use std::io::ErrorKind;

use thiserror::Error;
use tracing::{info, warn};

use crate::app_dir::AppDir;
use crate::identity::{IdentityClient, IdentityError};
use crate::model::UserProfile;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Only admins can {action}")]
pub struct Forbidden {
    pub action: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    token: String,
    profile: UserProfile,
}

impl Session {
    pub fn new(token: impl Into<String>, profile: UserProfile) -> Self {
        Self {
            token: token.into(),
            profile,
        }
    }

    /// Resolve a bearer token into a session via the identity endpoint.
    pub async fn login(client: &IdentityClient, token: &str) -> Result<Self, IdentityError> {
        let profile = client.fetch_profile(token).await?;
        info!("Signed in as {}", profile.uid);
        Ok(Self::new(token, profile))
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn uid(&self) -> &str {
        &self.profile.uid
    }

    pub fn is_admin(&self) -> bool {
        self.profile.is_admin()
    }

    pub fn require_admin(&self, action: &str) -> Result<(), Forbidden> {
        if self.is_admin() {
            Ok(())
        } else {
            warn!("{} tried to {} without admin role", self.uid(), action);
            Err(Forbidden {
                action: action.to_string(),
            })
        }
    }

    /// Remember the token so the next launch can skip the login form.
    pub fn persist(&self, dir: &AppDir) -> std::io::Result<()> {
        std::fs::create_dir_all(&**dir)?;
        std::fs::write(dir.session_token_path(), &self.token)
    }

    /// The token saved by [`persist`](Self::persist), if any.
    pub fn saved_token(dir: &AppDir) -> std::io::Result<Option<String>> {
        match std::fs::read_to_string(dir.session_token_path()) {
            Ok(token) if token.trim().is_empty() => Ok(None),
            Ok(token) => Ok(Some(token.trim().to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Revalidate a saved token. `Ok(None)` when there is none or the
    /// identity server no longer accepts it.
    pub async fn restore(
        dir: &AppDir,
        client: &IdentityClient,
    ) -> Result<Option<Self>, IdentityError> {
        let Some(token) = Self::saved_token(dir).unwrap_or_else(|e| {
            warn!("Could not read saved session: {}", e);
            None
        }) else {
            return Ok(None);
        };

        match Self::login(client, &token).await {
            Ok(session) => Ok(Some(session)),
            Err(IdentityError::Unauthorized) | Err(IdentityError::NotFound) => {
                info!("Saved session is no longer valid");
                Self::logout(dir);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn logout(dir: &AppDir) {
        if let Err(e) = std::fs::remove_file(dir.session_token_path()) {
            if e.kind() != ErrorKind::NotFound {
                warn!("Could not remove saved session: {}", e);
            }
        }
    }
}
