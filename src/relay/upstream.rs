//! Authenticated connection to the upstream speech-to-text WebSocket.
//!
//! The client's query string is appended to the configured endpoint exactly
//! as received. No parameter is checked or filtered here; the upstream
//! service is the authority on which parameters it accepts.

use crate::error::ConnectError;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Endpoint plus the client's raw query string.
pub fn build_upstream_url(endpoint: &str, query: &str) -> String {
    let query = query.trim_start_matches('?');
    if query.is_empty() {
        return endpoint.to_string();
    }
    let separator = if endpoint.contains('?') { '&' } else { '?' };
    format!("{}{}{}", endpoint, separator, query)
}

/// Handshake request carrying the credential as the only added header.
pub fn build_request(url: &str, credential: &str, scheme: &str) -> Result<Request<()>, ConnectError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ConnectError::InvalidRequest(e.to_string()))?;

    let mut value = HeaderValue::from_str(&format!("{} {}", scheme, credential))
        .map_err(|_| ConnectError::InvalidRequest("credential is not a valid header value".to_string()))?;
    value.set_sensitive(true);
    request.headers_mut().insert(AUTHORIZATION, value);

    Ok(request)
}

/// Open the upstream socket. Resolves once the handshake has completed.
pub async fn connect(url: &str, credential: &str, scheme: &str) -> Result<UpstreamSocket, ConnectError> {
    let request = build_request(url, credential, scheme)?;
    let (socket, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(classify)?;
    Ok(socket)
}

fn classify(err: WsError) -> ConnectError {
    match err {
        WsError::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                ConnectError::Unauthorized(status)
            } else {
                ConnectError::Rejected(status)
            }
        }
        WsError::Url(e) => ConnectError::InvalidRequest(e.to_string()),
        other => ConnectError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_appended_verbatim() {
        let url = build_upstream_url(
            "wss://api.deepgram.com/v2/listen",
            "model=flux-general-en&sample_rate=16000",
        );
        assert_eq!(url, "wss://api.deepgram.com/v2/listen?model=flux-general-en&sample_rate=16000");
    }

    #[test]
    fn test_unknown_and_encoded_params_untouched() {
        let url = build_upstream_url("wss://stt.example/listen", "?keyterm=a%20b&x=1&x=2&weird");
        assert_eq!(url, "wss://stt.example/listen?keyterm=a%20b&x=1&x=2&weird");
    }

    #[test]
    fn test_endpoint_with_existing_query() {
        let url = build_upstream_url("wss://stt.example/listen?tier=fast", "model=nova");
        assert_eq!(url, "wss://stt.example/listen?tier=fast&model=nova");
        assert_eq!(build_upstream_url("wss://stt.example/listen", ""), "wss://stt.example/listen");
    }

    #[test]
    fn test_request_carries_single_authorization_header() {
        let request = build_request("wss://api.deepgram.com/v2/listen?model=x", "secret", "Token").unwrap();
        let values: Vec<_> = request.headers().get_all(AUTHORIZATION).iter().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0], "Token secret");
        assert_eq!(request.uri().query(), Some("model=x"));
    }

    #[test]
    fn test_default_scheme_is_token_and_bearer_is_accepted() {
        let config = crate::config::AppConfig::default();
        assert_eq!(config.upstream.auth_scheme, "Token");

        let request = build_request("wss://stt.example/listen", "jwt-value", "Bearer").unwrap();
        assert_eq!(request.headers()[AUTHORIZATION], "Bearer jwt-value");
    }

    #[test]
    fn test_invalid_credential_rejected() {
        let err = build_request("wss://api.deepgram.com/v2/listen", "bad\nkey", "Token").unwrap_err();
        assert_eq!(err.kind(), "invalid_request");
    }
}
