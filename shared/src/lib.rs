//! RemoteLED Shared Protocol Types
//!
//! This crate provides the domain types, the LED characteristic codec, the session
//! state machine and the backend request/response bodies used by the client.

pub mod api;
pub mod codec;
pub mod state_machine;
pub mod types;

use std::time::{SystemTime, UNIX_EPOCH};

pub use types::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Get current timestamp in seconds since Unix epoch
pub fn now_secs() -> u64 {
    now_ms() / 1000
}

/// Timing and sizing parameters for sessions
pub mod timing {
    /// Order status poll interval in milliseconds
    pub const POLL_INTERVAL_MS: u64 = 3000;

    /// Pause between a write completion and the next write
    pub const WRITE_SETTLE_DELAY_MS: u64 = 100;

    /// Retries for a failed write before the command is dropped
    pub const WRITE_MAX_RETRIES: u32 = 3;

    /// Maximum commands waiting behind the in-flight one
    pub const MAX_QUEUE_DEPTH: usize = 16;

    /// Countdown tick period in milliseconds
    pub const COUNTDOWN_TICK_MS: u64 = 1000;

    /// Nominal length of a TRIGGER session
    pub const TRIGGER_SESSION_SECS: u32 = 2;

    /// Blink count the peripheral treats as "until turned off"
    pub const INFINITE_BLINK_TIMES: u32 = 9999;

    /// Blink half-period in seconds
    pub const BLINK_INTERVAL_SECS: f32 = 0.5;
}

/// Format a remaining duration as `mm:ss`
pub fn format_mm_ss(remaining_secs: u64) -> String {
    format!("{:02}:{:02}", remaining_secs / 60, remaining_secs % 60)
}
