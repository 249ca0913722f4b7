//! Link trait abstraction for pluggable peripheral backends

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::pairing::PairingInfo;

/// Errors reported by a link
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("peripheral {0} not found")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid peripheral address: {0}")]
    InvalidAddress(String),

    #[error("link is not ready")]
    NotReady,

    #[error("attribute {0} not found on peripheral")]
    AttributeNotFound(Uuid),

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection attempt cancelled")]
    Cancelled,
}

/// Connection state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Attribute resolved, writes may be submitted
    Ready { characteristic: Uuid },
}

impl LinkState {
    pub fn is_ready(&self) -> bool {
        matches!(self, LinkState::Ready { .. })
    }
}

/// Asynchronous notifications from a link
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// Exactly one per accepted `submit_write`, echoing its `write_id`
    WriteComplete { write_id: u64, success: bool },
    /// The peripheral dropped the connection
    Disconnected { reason: String },
}

/// A connection to one peripheral.
///
/// Write completion is never a return value: a link accepts the bytes and later
/// reports the outcome as [`LinkEvent::WriteComplete`] on the event channel it was
/// built with.
#[async_trait]
pub trait Link: Send + 'static {
    /// Connect and resolve the command characteristic
    async fn connect(&mut self, pairing: &PairingInfo) -> Result<(), LinkError>;

    /// Submit a write; fails fast with `NotReady` unless the link is ready.
    /// The completion event carries `write_id` back unchanged.
    async fn submit_write(&mut self, write_id: u64, payload: Bytes) -> Result<(), LinkError>;

    /// Read the characteristic value once
    async fn read_value(&mut self) -> Result<Bytes, LinkError>;

    /// Release the characteristic and disconnect. Safe to call in any state.
    async fn disconnect(&mut self);

    fn state(&self) -> LinkState;

    /// Human-readable name for this link
    fn name(&self) -> &'static str;
}
