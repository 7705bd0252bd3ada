use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use chunkferry_protocol::constants::WS_MAX_MESSAGE_SIZE;

use crate::UploadError;

/// Server address plus the access token sent with every upgrade.
#[derive(Clone)]
pub struct Endpoint {
    base_url: String,
    token: String,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// `base_url` is `ws://host:port` or `wss://host:port`, without a path.
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, UploadError> {
        let base_url = base_url.trim_end_matches('/');
        if !(base_url.starts_with("ws://") || base_url.starts_with("wss://")) {
            return Err(UploadError::InvalidUrl(format!(
                "{base_url}: expected a ws:// or wss:// URL"
            )));
        }
        Ok(Self {
            base_url: base_url.to_string(),
            token: token.into(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Builds an upgrade request for `path` carrying the bearer token.
    pub(crate) fn request(&self, path: &str, query: Option<&str>) -> Result<Request, UploadError> {
        let url = match query {
            Some(q) => format!("{}{path}?{q}", self.base_url),
            None => format!("{}{path}", self.base_url),
        };
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| UploadError::InvalidUrl(format!("{url}: {e}")))?;
        if !self.token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {}", self.token))
                .map_err(|_| UploadError::InvalidUrl("token is not a valid header value".into()))?;
            request.headers_mut().insert("authorization", value);
        }
        Ok(request)
    }
}

pub(crate) fn ws_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(WS_MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(WS_MAX_MESSAGE_SIZE);
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_websocket_urls() {
        assert!(matches!(
            Endpoint::new("http://localhost:1", "t"),
            Err(UploadError::InvalidUrl(_))
        ));
        assert!(Endpoint::new("ws://localhost:1/", "t").is_ok());
    }

    #[test]
    fn request_carries_bearer_token() {
        let endpoint = Endpoint::new("ws://127.0.0.1:9000/", "abc").unwrap();
        let req = endpoint
            .request("/ws/transfer", Some("fileHash=x&size=1"))
            .unwrap();
        assert_eq!(
            req.uri().to_string(),
            "ws://127.0.0.1:9000/ws/transfer?fileHash=x&size=1"
        );
        assert_eq!(req.headers()["authorization"], "Bearer abc");
    }

    #[test]
    fn debug_hides_token() {
        let endpoint = Endpoint::new("ws://h:1", "secret-token").unwrap();
        assert!(!format!("{endpoint:?}").contains("secret-token"));
    }
}
