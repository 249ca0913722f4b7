//! Backend request/response bodies
//!
//! Field names follow the backend's snake_case JSON, except the signed authorization
//! payload which uses camelCase.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::types::{OrderStatus, ServiceType};

/// `POST /orders`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    pub device_id: String,
    pub service_id: String,
    pub amount_cents: u32,
}

/// Order as returned by `POST /orders` and `GET /orders/{id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub device_id: String,
    #[serde(default)]
    pub service_id: Option<String>,
    pub amount_cents: u32,
    pub authorized_minutes: u32,
    pub status: OrderStatus,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Order {
    pub fn authorized_seconds(&self) -> u32 {
        self.authorized_minutes.saturating_mul(60)
    }
}

/// Payment + trigger request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub amount_cents: u32,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub device_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<u32>,
    #[serde(default)]
    pub order_id: Option<String>,
    pub skip_led: bool,
}

/// Payment + trigger response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub payment_intent_id: String,
    #[serde(default)]
    pub amount_cents: u32,
    #[serde(default)]
    pub payment_status: String,
    #[serde(default)]
    pub led_triggered: bool,
}

impl PaymentReceipt {
    /// Whether the provider reported a usable payment
    pub fn is_success(&self) -> bool {
        !matches!(
            self.payment_status.as_str(),
            "failed" | "canceled" | "requires_payment_method"
        )
    }
}

/// `POST /authorizations`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateAuthorizationRequest {
    pub order_id: String,
}

/// The signed part of an authorization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationPayload {
    pub device_id: String,
    pub order_id: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub seconds: u32,
    pub nonce: String,
    /// Unix seconds
    pub exp: u64,
}

impl AuthorizationPayload {
    /// Canonical `key=value` form, keys sorted, joined with `&`
    pub fn canonical_string(&self) -> String {
        // Keys in lexical order
        format!(
            "deviceId={}&exp={}&nonce={}&orderId={}&seconds={}&type={}",
            self.device_id, self.exp, self.nonce, self.order_id, self.seconds, self.service_type
        )
    }

    /// SHA-256 of the canonical form, lowercase hex
    pub fn payload_hash(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_string().as_bytes()))
    }
}

/// Signed authorization for a paid order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Authorization {
    pub id: String,
    pub order_id: String,
    pub device_id: String,
    pub payload: AuthorizationPayload,
    pub signature_hex: String,
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Session milestones reported to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TelemetryEvent {
    Started,
    Done,
    Error,
}

impl fmt::Display for TelemetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TelemetryEvent::Started => "STARTED",
            TelemetryEvent::Done => "DONE",
            TelemetryEvent::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// `POST /devices/{id}/telemetry`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRequest {
    pub event: TelemetryEvent,
    pub order_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_hash: Option<String>,
}

impl TelemetryRequest {
    /// Create a telemetry request for an order
    pub fn new(event: TelemetryEvent, order_id: impl Into<String>) -> Self {
        Self {
            event,
            order_id: Some(order_id.into()),
            details: None,
            payload_hash: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_payload_hash(mut self, hash: Option<String>) -> Self {
        self.payload_hash = hash;
        self
    }
}
