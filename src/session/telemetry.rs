//! Session milestone telemetry
//!
//! Each event is sent at most once per session. Delivery runs in the background and
//! failures are only logged.

use remoteled_shared::api::{TelemetryEvent, TelemetryRequest};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::Backend;

pub struct TelemetryEmitter {
    backend: Arc<dyn Backend>,
    device_id: String,
    order_id: String,
    payload_hash: Option<String>,
    sent: HashSet<TelemetryEvent>,
    deliveries: Vec<JoinHandle<()>>,
}

impl TelemetryEmitter {
    pub fn new(
        backend: Arc<dyn Backend>,
        device_id: impl Into<String>,
        order_id: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            device_id: device_id.into(),
            order_id: order_id.into(),
            payload_hash: None,
            sent: HashSet::new(),
            deliveries: Vec::new(),
        }
    }

    /// Hash of the signed authorization payload, attached to later events
    pub fn set_payload_hash(&mut self, hash: String) {
        self.payload_hash = Some(hash);
    }

    pub fn has_sent(&self, event: TelemetryEvent) -> bool {
        self.sent.contains(&event)
    }

    /// Send `event` unless it was already sent. Returns whether a request went out.
    pub fn emit(&mut self, event: TelemetryEvent, details: Option<String>) -> bool {
        if !self.sent.insert(event) {
            debug!("[TELEMETRY] {} already sent for {}, skipping", event, self.order_id);
            return false;
        }

        let mut request = TelemetryRequest::new(event, self.order_id.clone())
            .with_payload_hash(self.payload_hash.clone());
        if let Some(details) = details {
            request = request.with_details(details);
        }

        let backend = self.backend.clone();
        let device_id = self.device_id.clone();
        self.deliveries.retain(|d| !d.is_finished());
        self.deliveries.push(tokio::spawn(async move {
            match backend.send_telemetry(&device_id, &request).await {
                Ok(()) => info!("[TELEMETRY] {} delivered for {}", request.event, device_id),
                Err(e) => warn!("[TELEMETRY] {} delivery failed: {}", request.event, e),
            }
        }));
        true
    }

    /// Wait for outstanding deliveries, up to `limit`
    pub async fn flush(&mut self, limit: Duration) {
        let pending = std::mem::take(&mut self.deliveries);
        let all = futures::future::join_all(pending);
        if tokio::time::timeout(limit, all).await.is_err() {
            warn!("[TELEMETRY] Gave up waiting for deliveries after {:?}", limit);
        }
    }
}
