//! Shared-token authentication for upgrade requests.

use chunkferry_protocol::query::{percent_decode, query_pairs};
use rand::Rng;
use tokio_tungstenite::tungstenite::handshake::server::Request;

/// Token length in bytes (produces 32 hex characters).
const TOKEN_BYTES: usize = 16;

/// Decides whether a presented credential may use the protected routes.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: Option<&str>) -> bool;
}

/// Accepts exactly one shared access token.
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    token: String,
}

impl TokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Authenticator for TokenAuthenticator {
    fn authenticate(&self, token: Option<&str>) -> bool {
        token.is_some_and(|t| validate_token(t, &self.token))
    }
}

/// Generates a CSPRNG token as a 32-character lowercase hex string.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Validates a received token against the expected value.
///
/// Uses constant-time comparison to prevent timing attacks.
pub fn validate_token(received: &str, expected: &str) -> bool {
    if received.len() != expected.len() {
        return false;
    }
    let mut diff = 0u8;
    for (a, b) in received.bytes().zip(expected.bytes()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// Token from `Authorization: Bearer <token>` or the `token` query parameter.
pub(crate) fn request_token(req: &Request) -> Option<String> {
    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string());
    if header.is_some() {
        return header;
    }
    let query = req.uri().query()?;
    query_pairs(query)
        .find(|(k, _)| *k == "token")
        .and_then(|(_, v)| percent_decode(v))
}
