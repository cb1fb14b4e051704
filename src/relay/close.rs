//! Translation of terminal events into the close frame the client receives.
//!
//! Close codes exposed to clients:
//! - `1000` normal closure, also used for upstream transport errors,
//!   authentication failures and upstream closes without a usable code
//!   (for codes the websocket library rejects, the upstream's reason is lost)
//! - `1002` the upstream host could not be reached
//! - `1003` unsupported data (a fragmented client message that is not valid UTF-8 text)
//! - `1009` a fragmented client message exceeding the reassembly limit
//! - `4000..=4999` upstream-specific codes, passed through with their reason

use crate::error::{ConnectError, ProbeError};

pub const NORMAL: u16 = 1000;
pub const PROTOCOL_ERROR: u16 = 1002;
pub const UNSUPPORTED_DATA: u16 = 1003;
pub const MESSAGE_TOO_BIG: u16 = 1009;

/// A close reason may not exceed 123 bytes (125-byte control payload minus the code).
pub const MAX_REASON_BYTES: usize = 123;

/// Close code and reason to send to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientClose {
    pub code: u16,
    pub reason: String,
}

impl ClientClose {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: truncate_reason(reason.into()),
        }
    }

    pub fn normal() -> Self {
        Self::new(NORMAL, "")
    }
}

/// Whether `code` may legally appear in a close frame sent by an endpoint.
///
/// 1004-1006 and 1015 are reserved, 1016-2999 are unassigned and
/// 5000+ are outside the registered ranges.
pub fn is_valid_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// Frame tungstenite hands over in place of a peer close whose code it
/// refuses (0-999, 1004-1006, 1015, 1016-2999, 5000+). The original reason is
/// discarded before it reaches us.
const REPLACED_CLOSE_REASON: &str = "Protocol violation";

/// Reason sent to the client when the upstream used an unusable close code.
pub const INVALID_UPSTREAM_CODE_REASON: &str = "upstream closed with an invalid close code";

/// Upstream closed its socket: forward a valid code unchanged, otherwise
/// fall back to a normal closure while keeping the reason text.
pub fn translate_upstream_close(code: Option<u16>, reason: Option<&str>) -> ClientClose {
    let reason = reason.unwrap_or_default();
    match code {
        Some(PROTOCOL_ERROR) if reason == REPLACED_CLOSE_REASON => {
            ClientClose::new(NORMAL, INVALID_UPSTREAM_CODE_REASON)
        }
        Some(code) if is_valid_close_code(code) => ClientClose::new(code, reason),
        _ => ClientClose::new(NORMAL, reason),
    }
}

/// Upstream socket failed at the transport level (no close frame).
pub fn upstream_transport_error(message: &str) -> ClientClose {
    ClientClose::new(NORMAL, format!("upstream error: {}", message))
}

pub fn probe_failure(err: &ProbeError) -> ClientClose {
    ClientClose::new(PROTOCOL_ERROR, format!("upstream unreachable: {}", err))
}

pub fn connect_failure(err: &ConnectError) -> ClientClose {
    ClientClose::new(NORMAL, err.to_string())
}

/// Cut `reason` to the close-frame limit without splitting a UTF-8 sequence.
fn truncate_reason(mut reason: String) -> String {
    if reason.len() <= MAX_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason.truncate(end);
    reason
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_close_codes() {
        for code in [1000, 1001, 1002, 1003, 1007, 1011, 1014, 3000, 4000, 4011, 4999] {
            assert!(is_valid_close_code(code), "{} should be valid", code);
        }
        for code in [0, 999, 1004, 1005, 1006, 1015, 1016, 2999, 5000, u16::MAX] {
            assert!(!is_valid_close_code(code), "{} should be invalid", code);
        }
    }

    #[test]
    fn test_provider_code_passes_through() {
        let close = translate_upstream_close(Some(4011), Some("insufficient credits"));
        assert_eq!(close, ClientClose::new(4011, "insufficient credits"));
    }

    #[test]
    fn test_invalid_or_missing_code_becomes_normal() {
        let close = translate_upstream_close(Some(0), Some("odd"));
        assert_eq!(close.code, NORMAL);
        assert_eq!(close.reason, "odd");

        let close = translate_upstream_close(None, None);
        assert_eq!(close, ClientClose::normal());

        let close = translate_upstream_close(Some(1006), Some("abnormal"));
        assert_eq!(close.code, NORMAL);
        assert_eq!(close.reason, "abnormal");
    }

    #[test]
    fn test_replaced_invalid_code_becomes_normal() {
        // What the websocket library yields after the peer sent e.g. code 0
        let close = translate_upstream_close(Some(PROTOCOL_ERROR), Some("Protocol violation"));
        assert_eq!(close, ClientClose::new(NORMAL, INVALID_UPSTREAM_CODE_REASON));

        // A genuine 1002 with its own reason still passes through
        let close = translate_upstream_close(Some(PROTOCOL_ERROR), Some("bad audio header"));
        assert_eq!(close, ClientClose::new(PROTOCOL_ERROR, "bad audio header"));
    }

    #[test]
    fn test_probe_failure_is_protocol_error_with_detail() {
        let close = probe_failure(&ProbeError::Dns("no such host".to_string()));
        assert_eq!(close.code, PROTOCOL_ERROR);
        assert!(close.reason.contains("no such host"));
    }

    #[test]
    fn test_transport_error_embeds_message() {
        let close = upstream_transport_error("Connection reset without closing handshake");
        assert_eq!(close.code, NORMAL);
        assert_eq!(close.reason, "upstream error: Connection reset without closing handshake");
    }

    #[test]
    fn test_connect_failure_names_class() {
        let close = connect_failure(&ConnectError::Unauthorized(401));
        assert_eq!(close.code, NORMAL);
        assert!(close.reason.contains("authentication failed"));
    }

    #[test]
    fn test_long_reason_truncated_on_char_boundary() {
        let long = "é".repeat(100); // 200 bytes
        let close = ClientClose::new(NORMAL, long);
        assert!(close.reason.len() <= MAX_REASON_BYTES);
        assert_eq!(close.reason.len(), 122);
        assert!(close.reason.chars().all(|c| c == 'é'));
    }
}
