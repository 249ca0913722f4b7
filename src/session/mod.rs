//! Session orchestration
//!
//! This module handles:
//! - Order placement and payment
//! - The CREATED -> ... -> RUNNING -> DONE lifecycle, with ERROR from any live state
//! - LED commands at state boundaries
//! - Telemetry milestones
//! - Ordered, idempotent teardown

mod controller;
mod telemetry;
mod verifier;

pub use controller::{OrderRequest, SessionController, SessionHandle, SessionStatus};
pub use telemetry::TelemetryEmitter;
pub use verifier::{AuthorizationVerifier, StructuralVerifier, VerificationError};

use remoteled_shared::OrderStatus;
use thiserror::Error;

use crate::backend::BackendError;
use crate::link::LinkError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("{stage} failed: {source}")]
    Backend {
        stage: &'static str,
        source: BackendError,
    },

    #[error("peripheral link failed: {0}")]
    Link(#[from] LinkError),

    #[error("authorization rejected: {0}")]
    Verification(#[from] VerificationError),

    #[error("session cancelled")]
    Cancelled,

    #[error("order ended with status {status}")]
    Failed { status: OrderStatus },

    #[error("session task ended unexpectedly: {0}")]
    Aborted(String),
}

impl SessionError {
    pub(crate) fn backend(stage: &'static str) -> impl FnOnce(BackendError) -> Self {
        move |source| SessionError::Backend { stage, source }
    }
}
