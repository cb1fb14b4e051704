//! # Relay Core
//!
//! Everything a single client-to-upstream session needs, apart from the
//! WebSocket actor itself (see `crate::websocket`).
//!
//! ## Key Components:
//! - **Probe**: One-shot reachability check of the upstream host
//! - **Upstream**: URL building, credential injection and the upstream handshake
//! - **Close**: Translation of terminal events into client close frames
//! - **Session**: Per-session phase machine and frame counters
//! - **Registry**: Process-wide set of live sessions, drained on shutdown
//!
//! ## Session flow:
//! `probing` → `connecting` → `relaying` → `closing` → `closed`

pub mod close;     // Close-code validation and client close reasons
pub mod probe;     // Upstream reachability probe
pub mod registry;  // Active session registry and drain
pub mod session;   // Session phases and counters
pub mod upstream;  // Authenticated upstream connection
