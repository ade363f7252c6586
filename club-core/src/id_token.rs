use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const EXPIRY_LEN: usize = 8;
const SIGNATURE_LEN: usize = 32;
pub const SECRET_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub uid: String,
    /// Unix seconds.
    pub expires_at: u64,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("Signing secret must be {SECRET_LEN} bytes of hex")]
    InvalidSecret,
    #[error("Invalid user id: {0:?}")]
    InvalidUid(String),
    #[error("Invalid token")]
    InvalidToken,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Token has expired")]
    Expired,
}

/// Issues and verifies bearer tokens naming a user.
///
/// A token is a base64url-encoded binary blob:
/// `[expiry: 8 bytes u64 BE] [uid: utf-8] [signature: 32 bytes HMAC-SHA256]`
#[derive(Clone)]
pub struct TokenSigner {
    secret: [u8; SECRET_LEN],
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    pub fn new(secret: [u8; SECRET_LEN]) -> Self {
        Self { secret }
    }

    pub fn from_hex(secret: &str) -> Result<Self, TokenError> {
        let bytes = hex::decode(secret.trim()).map_err(|_| TokenError::InvalidSecret)?;
        let secret: [u8; SECRET_LEN] = bytes.try_into().map_err(|_| TokenError::InvalidSecret)?;
        Ok(Self::new(secret))
    }

    pub fn issue(&self, uid: &str, ttl: Duration) -> Result<String, TokenError> {
        self.issue_until(uid, now_secs().saturating_add(ttl.as_secs()))
    }

    pub fn issue_until(&self, uid: &str, expires_at: u64) -> Result<String, TokenError> {
        if uid.is_empty() {
            return Err(TokenError::InvalidUid(uid.to_string()));
        }

        let mut payload = Vec::with_capacity(EXPIRY_LEN + uid.len() + SIGNATURE_LEN);
        payload.extend_from_slice(&expires_at.to_be_bytes());
        payload.extend_from_slice(uid.as_bytes());

        let signature = self.mac(&payload)?.finalize().into_bytes();
        payload.extend_from_slice(&signature);

        Ok(URL_SAFE_NO_PAD.encode(&payload))
    }

    pub fn verify(&self, token: &str) -> Result<TokenClaims, TokenError> {
        self.verify_at(token, now_secs())
    }

    pub fn verify_at(&self, token: &str, now: u64) -> Result<TokenClaims, TokenError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| TokenError::InvalidToken)?;

        if bytes.len() <= EXPIRY_LEN + SIGNATURE_LEN {
            return Err(TokenError::InvalidToken);
        }

        let (payload, signature) = bytes.split_at(bytes.len() - SIGNATURE_LEN);
        let mac = self.mac(payload)?;
        mac.verify_slice(signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let (expiry, uid) = payload.split_at(EXPIRY_LEN);
        let mut expiry_bytes = [0u8; EXPIRY_LEN];
        expiry_bytes.copy_from_slice(expiry);
        let expires_at = u64::from_be_bytes(expiry_bytes);

        if now > expires_at {
            return Err(TokenError::Expired);
        }

        let uid = String::from_utf8(uid.to_vec()).map_err(|_| TokenError::InvalidToken)?;
        Ok(TokenClaims { uid, expires_at })
    }

    fn mac(&self, data: &[u8]) -> Result<HmacSha256, TokenError> {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenError::InvalidSecret)?;
        mac.update(data);
        Ok(mac)
    }
}

fn now_secs() -> u64 {
    Utc::now().timestamp().max(0) as u64
}
