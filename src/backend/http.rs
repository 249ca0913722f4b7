//! reqwest implementation of the backend

use async_trait::async_trait;
use remoteled_shared::api::{
    Authorization, CreateAuthorizationRequest, CreateOrderRequest, Order, PaymentReceipt,
    PaymentRequest, TelemetryRequest,
};
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{Backend, BackendError};
use crate::config::BackendConfig;

/// HTTP client for the backend REST API
pub struct HttpBackend {
    client: Client,
    base: Url,
    payment_path: String,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        // `Url::join` drops the last segment unless the base ends with '/'
        let mut base_url = config.base_url.trim().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        let base = Url::parse(&base_url).map_err(|e| BackendError::InvalidUrl(e.to_string()))?;

        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(transport)?;

        Ok(Self {
            client,
            base,
            payment_path: config.payment_path.trim_start_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> Result<Url, BackendError> {
        self.base
            .join(path)
            .map_err(|e| BackendError::InvalidUrl(e.to_string()))
    }

    /// `GET /health`
    pub async fn health(&self) -> Result<(), BackendError> {
        let response = self
            .client
            .get(self.url("health")?)
            .send()
            .await
            .map_err(transport)?;
        check_status(response).await.map(|_| ())
    }
}

fn transport(err: reqwest::Error) -> BackendError {
    BackendError::Transport(err.to_string())
}

/// Turn a non-2xx response into `Rejected`, preferring the `detail` field of the body
async fn check_status(response: Response) -> Result<Response, BackendError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or(body);

    Err(BackendError::Rejected {
        status: status.as_u16(),
        message,
    })
}

async fn parse<T: DeserializeOwned>(response: Response) -> Result<T, BackendError> {
    check_status(response).await?.json::<T>().await.map_err(transport)
}

#[async_trait]
impl Backend for HttpBackend {
    async fn create_order(&self, request: &CreateOrderRequest) -> Result<Order, BackendError> {
        debug!("[BACKEND] POST orders for device {}", request.device_id);
        let response = self
            .client
            .post(self.url("orders")?)
            .json(request)
            .send()
            .await
            .map_err(transport)?;
        parse(response).await
    }

    async fn get_order(&self, order_id: &str) -> Result<Order, BackendError> {
        let response = self
            .client
            .get(self.url(&format!("orders/{}", order_id))?)
            .send()
            .await
            .map_err(transport)?;
        parse(response).await
    }

    async fn create_authorization(&self, order_id: &str) -> Result<Authorization, BackendError> {
        debug!("[BACKEND] POST authorizations for order {}", order_id);
        let body = CreateAuthorizationRequest {
            order_id: order_id.to_string(),
        };
        let response = self
            .client
            .post(self.url("authorizations")?)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        parse(response).await
    }

    async fn trigger_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentReceipt, BackendError> {
        debug!("[BACKEND] POST {} ({} cents)", self.payment_path, request.amount_cents);
        let response = self
            .client
            .post(self.url(&self.payment_path)?)
            .json(request)
            .send()
            .await
            .map_err(transport)?;
        parse(response).await
    }

    async fn send_telemetry(
        &self,
        device_id: &str,
        request: &TelemetryRequest,
    ) -> Result<(), BackendError> {
        let response = self
            .client
            .post(self.url(&format!("devices/{}/telemetry", device_id))?)
            .json(request)
            .send()
            .await
            .map_err(transport)?;
        check_status(response).await.map(|_| ())
    }
}
