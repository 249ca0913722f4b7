//! Serialized command channel to the peripheral
//!
//! One task owns the link and the queue; everyone else talks to it through a
//! [`QueueHandle`]. Outcomes come back as [`QueueEvent`]s on a single-consumer channel.

mod command_queue;
mod worker;

pub use command_queue::{CommandQueue, QueueSettings};
pub use worker::{QueueHandle, QueueWorker};

use remoteled_shared::{codec::CodecError, LedCommand};
use thiserror::Error;

use crate::config::LinkConfig;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("link is not ready")]
    LinkNotReady,

    #[error("queue is full ({0} commands)")]
    Full(usize),

    #[error("command could not be encoded: {0}")]
    Encode(#[from] CodecError),

    #[error("queue worker has stopped")]
    Closed,
}

/// Notifications from the queue worker
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    /// The peripheral acknowledged the command
    Transmitted(LedCommand),
    /// Retried past the bound and discarded
    Dropped { command: LedCommand, attempts: u32 },
    /// The link went away; queued commands were discarded
    LinkLost { reason: String },
}

impl From<&LinkConfig> for QueueSettings {
    fn from(config: &LinkConfig) -> Self {
        Self {
            settle_delay: config.settle_delay(),
            max_retries: config.max_write_retries,
            max_depth: config.max_queue_depth,
        }
    }
}
