//! Domain types shared by the client and the peripheral protocol

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::timing;

/// Kind of service a device sells
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceType {
    /// Single short activation
    Trigger,
    /// Fixed-length session
    Fixed,
    /// Length proportional to the amount paid
    Variable,
}

impl ServiceType {
    /// Wire name as used by the backend
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Trigger => "TRIGGER",
            ServiceType::Fixed => "FIXED",
            ServiceType::Variable => "VARIABLE",
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServiceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRIGGER" => Ok(ServiceType::Trigger),
            "FIXED" => Ok(ServiceType::Fixed),
            "VARIABLE" => Ok(ServiceType::Variable),
            other => Err(format!("unknown service type: {}", other)),
        }
    }
}

/// Order status as reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Paid,
    Running,
    Done,
    Failed,
}

impl OrderStatus {
    /// DONE and FAILED end polling for an order
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Done | OrderStatus::Failed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::Paid => "PAID",
            OrderStatus::Running => "RUNNING",
            OrderStatus::Done => "DONE",
            OrderStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// LED colors understood by the peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedColor {
    Red,
    Yellow,
    Green,
    Blue,
    Amber,
    /// Every LED at once (only meaningful with OFF)
    All,
}

impl LedColor {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedColor::Red => "red",
            LedColor::Yellow => "yellow",
            LedColor::Green => "green",
            LedColor::Blue => "blue",
            LedColor::Amber => "amber",
            LedColor::All => "all",
        }
    }
}

/// What the peripheral should do with the LED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandKind {
    On,
    Off,
    Blink,
}

/// A single peripheral command. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq)]
pub struct LedCommand {
    pub kind: CommandKind,
    pub color: LedColor,
    /// Number of blinks; 0 means "not a repeating command"
    pub repeat_count: u32,
    /// Seconds between blink edges
    pub interval_secs: f32,
    /// Seconds the peripheral keeps the LED on by itself; 0 means indefinitely
    pub duration_secs: u32,
    /// Shared static key, sent in every payload
    pub key: String,
}

impl LedCommand {
    /// Solid on until told otherwise
    pub fn on(color: LedColor, key: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::On,
            color,
            repeat_count: 0,
            interval_secs: 0.0,
            duration_secs: 0,
            key: key.into(),
        }
    }

    /// Solid on for a bounded time
    pub fn on_for(color: LedColor, duration_secs: u32, key: impl Into<String>) -> Self {
        Self {
            duration_secs,
            ..Self::on(color, key)
        }
    }

    /// Blink `times` times with the given half-period
    pub fn blink(color: LedColor, times: u32, interval_secs: f32, key: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::Blink,
            color,
            repeat_count: times,
            interval_secs,
            duration_secs: 0,
            key: key.into(),
        }
    }

    /// Blink until explicitly turned off
    pub fn blink_forever(color: LedColor, key: impl Into<String>) -> Self {
        Self::blink(
            color,
            timing::INFINITE_BLINK_TIMES,
            timing::BLINK_INTERVAL_SECS,
            key,
        )
    }

    /// Everything off
    pub fn off_all(key: impl Into<String>) -> Self {
        Self {
            kind: CommandKind::Off,
            color: LedColor::All,
            repeat_count: 0,
            interval_secs: 0.0,
            duration_secs: 0,
            key: key.into(),
        }
    }

    /// The command that marks a session as running for a service type
    pub fn running_indicator(service_type: ServiceType, key: impl Into<String>) -> Self {
        match service_type {
            ServiceType::Trigger => Self::blink_forever(LedColor::Blue, key),
            ServiceType::Fixed => Self::on(LedColor::Green, key),
            ServiceType::Variable => Self::on(LedColor::Amber, key),
        }
    }
}

impl fmt::Display for LedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            CommandKind::On => "ON",
            CommandKind::Off => "OFF",
            CommandKind::Blink => "BLINK",
        };
        write!(f, "{}({})", kind, self.color.as_str())?;
        if self.duration_secs > 0 {
            write!(f, " for {}s", self.duration_secs)?;
        }
        Ok(())
    }
}

/// LED state reported by the peripheral on read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    On,
    Off,
    /// Any token we do not recognise
    Unknown,
}

/// Session lifecycle states driven by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Created,
    Authorizing,
    Relaying,
    Verifying,
    Running,
    Done,
    Error,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Error)
    }
}

/// One paid usage cycle, from order creation to terminal status
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// Equal to the backend order id
    pub session_id: String,
    pub device_id: String,
    pub service_type: ServiceType,
    pub authorized_seconds: u32,
    pub state: SessionState,
    /// Unix ms when the session entered RUNNING
    pub started_at: Option<u64>,
    /// Unix ms when the session reached a terminal state
    pub ended_at: Option<u64>,
}

impl Session {
    /// Create a session for a freshly placed order
    pub fn new(
        session_id: impl Into<String>,
        device_id: impl Into<String>,
        service_type: ServiceType,
        authorized_seconds: u32,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            device_id: device_id.into(),
            service_type,
            authorized_seconds,
            state: SessionState::Created,
            started_at: None,
            ended_at: None,
        }
    }
}
