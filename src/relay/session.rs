//! # Relay Session State
//!
//! One `RelaySession` exists per accepted client connection. It is owned by the
//! client's WebSocket actor, so every mutation happens on that actor's thread
//! and no locking is needed.
//!
//! ## Session Lifecycle:
//! 1. **Probing**: Checking that the upstream host is reachable
//! 2. **Connecting**: Opening the authenticated upstream WebSocket
//! 3. **Relaying**: Forwarding frames in both directions
//! 4. **Closing**: One side has terminated, the other is being closed
//! 5. **Closed**: Both sides are done

use chrono::{DateTime, Utc};
use std::fmt;
use std::time::{Duration, Instant};

/// Process-unique session identifier, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Probing,
    Connecting,
    Relaying,
    Closing,
    Closed,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Probing => "probing",
            SessionPhase::Connecting => "connecting",
            SessionPhase::Relaying => "relaying",
            SessionPhase::Closing => "closing",
            SessionPhase::Closed => "closed",
        }
    }

    /// Allowed edges of the phase graph.
    pub fn can_transition_to(self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (Probing, Connecting)
                | (Connecting, Relaying)
                | (Probing, Closing)
                | (Connecting, Closing)
                | (Relaying, Closing)
                | (Closing, Closed)
        )
    }
}

/// Rejected phase change. Callers treat it as a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: SessionPhase,
    pub to: SessionPhase,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid phase transition {} -> {}", self.from.as_str(), self.to.as_str())
    }
}

impl std::error::Error for InvalidTransition {}

/// Per-direction frame counters (diagnostics only).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameCounters {
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
    /// Client frames discarded because the upstream was not open or its queue was full
    pub dropped: u64,
}

#[derive(Debug)]
pub struct RelaySession {
    pub id: SessionId,
    /// Raw query string of the client's request, forwarded upstream verbatim
    params: String,
    phase: SessionPhase,
    pub counters: FrameCounters,
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl RelaySession {
    pub fn new(id: SessionId, params: impl Into<String>) -> Self {
        Self {
            id,
            params: params.into(),
            phase: SessionPhase::Probing,
            counters: FrameCounters::default(),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn params(&self) -> &str {
        &self.params
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn is_relaying(&self) -> bool {
        self.phase == SessionPhase::Relaying
    }

    /// Whether a close/error has already been handled for this session.
    pub fn is_terminating(&self) -> bool {
        matches!(self.phase, SessionPhase::Closing | SessionPhase::Closed)
    }

    pub fn transition(&mut self, next: SessionPhase) -> Result<(), InvalidTransition> {
        if !self.phase.can_transition_to(next) {
            return Err(InvalidTransition { from: self.phase, to: next });
        }
        self.phase = next;
        Ok(())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut session = RelaySession::new(SessionId(1), "model=flux-general-en");
        assert_eq!(session.phase(), SessionPhase::Probing);
        session.transition(SessionPhase::Connecting).unwrap();
        session.transition(SessionPhase::Relaying).unwrap();
        assert!(session.is_relaying());
        session.transition(SessionPhase::Closing).unwrap();
        assert!(session.is_terminating());
        session.transition(SessionPhase::Closed).unwrap();
        assert_eq!(session.params(), "model=flux-general-en");
    }

    #[test]
    fn test_probe_failure_skips_to_closing() {
        let mut session = RelaySession::new(SessionId(2), "");
        session.transition(SessionPhase::Closing).unwrap();
        assert!(!session.is_relaying());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut session = RelaySession::new(SessionId(3), "");
        let err = session.transition(SessionPhase::Relaying).unwrap_err();
        assert_eq!(err.from, SessionPhase::Probing);
        assert_eq!(session.phase(), SessionPhase::Probing);

        session.transition(SessionPhase::Closing).unwrap();
        // A second terminal event must not re-enter closing
        assert!(session.transition(SessionPhase::Closing).is_err());
        assert!(session.transition(SessionPhase::Relaying).is_err());
    }
}
