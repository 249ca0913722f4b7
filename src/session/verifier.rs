//! Authorization checks before a session may run
//!
//! The backend signs with a key the client does not hold, so the default verifier
//! only checks that the authorization belongs to this session, is unexpired, and
//! carries a DER-encoded signature.

use remoteled_shared::api::Authorization;
use remoteled_shared::Session;
use thiserror::Error;

/// ASN.1 SEQUENCE tag that starts a DER ECDSA signature
const DER_SEQUENCE: u8 = 0x30;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum VerificationError {
    #[error("authorization is for order {found}, expected {expected}")]
    OrderMismatch { expected: String, found: String },

    #[error("authorization is for device {found}, expected {expected}")]
    DeviceMismatch { expected: String, found: String },

    #[error("authorization expired at {exp} (now {now})")]
    Expired { exp: u64, now: u64 },

    #[error("malformed signature: {0}")]
    MalformedSignature(String),
}

pub trait AuthorizationVerifier: Send + Sync {
    fn verify(
        &self,
        session: &Session,
        authorization: &Authorization,
        now_secs: u64,
    ) -> Result<(), VerificationError>;
}

/// Checks the shape of an authorization without the signing key
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuralVerifier;

impl AuthorizationVerifier for StructuralVerifier {
    fn verify(
        &self,
        session: &Session,
        authorization: &Authorization,
        now_secs: u64,
    ) -> Result<(), VerificationError> {
        let payload = &authorization.payload;

        if payload.order_id != session.session_id {
            return Err(VerificationError::OrderMismatch {
                expected: session.session_id.clone(),
                found: payload.order_id.clone(),
            });
        }
        if payload.device_id != session.device_id {
            return Err(VerificationError::DeviceMismatch {
                expected: session.device_id.clone(),
                found: payload.device_id.clone(),
            });
        }
        if payload.exp <= now_secs {
            return Err(VerificationError::Expired {
                exp: payload.exp,
                now: now_secs,
            });
        }

        let signature = hex::decode(authorization.signature_hex.trim())
            .map_err(|e| VerificationError::MalformedSignature(e.to_string()))?;
        match signature.first() {
            Some(&DER_SEQUENCE) => Ok(()),
            Some(other) => Err(VerificationError::MalformedSignature(format!(
                "expected DER sequence, found tag {:#04x}",
                other
            ))),
            None => Err(VerificationError::MalformedSignature("empty".into())),
        }
    }
}
