//! Backend order/authorization service

mod http;
#[cfg(test)]
pub mod memory;

pub use http::HttpBackend;

use async_trait::async_trait;
use remoteled_shared::api::{
    Authorization, CreateOrderRequest, Order, PaymentReceipt, PaymentRequest, TelemetryRequest,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("backend transport error: {0}")]
    Transport(String),

    #[error("invalid backend URL: {0}")]
    InvalidUrl(String),
}

/// REST surface the client consumes
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// `POST /orders`
    async fn create_order(&self, request: &CreateOrderRequest) -> Result<Order, BackendError>;

    /// `GET /orders/{id}`
    async fn get_order(&self, order_id: &str) -> Result<Order, BackendError>;

    /// `POST /authorizations`
    async fn create_authorization(&self, order_id: &str) -> Result<Authorization, BackendError>;

    /// Payment + trigger
    async fn trigger_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentReceipt, BackendError>;

    /// `POST /devices/{id}/telemetry`
    async fn send_telemetry(
        &self,
        device_id: &str,
        request: &TelemetryRequest,
    ) -> Result<(), BackendError>;
}
