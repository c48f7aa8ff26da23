use super::{config::SESSION_TTL_SECS, crypto, models::ObjectId};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

/// HMAC-secured bearer token, signed by $SESSION_SECRET.
///
/// Only the user id goes in; the user is reloaded on every request so role
/// changes and deletions take effect immediately.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user_id: ObjectId,
    /// Unix seconds
    pub issued_at: u64,
}

impl Session {
    pub fn new(user_id: ObjectId, issued_at: u64) -> Self {
        Self { user_id, issued_at }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.issued_at) > SESSION_TTL_SECS
    }
}

pub fn serialize_session(
    session: &Session,
    secret: &[u8],
) -> serde_json::Result<String> {
    let json_bytes = serde_json::to_vec(session)?;
    let b64 = general_purpose::STANDARD_NO_PAD.encode(json_bytes);
    let raw_digest = crypto::get_digest(secret, b64.as_bytes());
    let digest = general_purpose::STANDARD_NO_PAD.encode(raw_digest);

    Ok(format!("{b64}:{digest}"))
}

/// Check the signature and expiry of `token` as of `now` (unix seconds).
pub fn deserialize_session(
    token: &str,
    secret: &[u8],
    now: u64,
) -> Result<Session, &'static str> {
    let Some((b64_json, b64_digest)) = token.split_once(':') else {
        return Err("Invalid session");
    };
    let digest = general_purpose::STANDARD_NO_PAD
        .decode(b64_digest)
        .map_err(|_| "Cannot base64 decode the digest")?;
    if !crypto::is_valid(secret, b64_json.as_bytes(), &digest) {
        return Err("Failed to validate session signature");
    }
    let json = general_purpose::STANDARD_NO_PAD
        .decode(b64_json)
        .map_err(|_| "Cannot base64 decode session string")?;
    let session: Session = serde_json::from_slice(&json)
        .map_err(|_| "Cannot deserialize session JSON")?;

    if session.is_expired(now) {
        Err("Session expired")
    } else {
        Ok(session)
    }
}
