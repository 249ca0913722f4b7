//! Bluetooth LE discovery for the paired peripheral

use bluer::{Adapter, AdapterEvent, Address, Device, ErrorKind};
use futures::StreamExt;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

use super::traits::LinkError;

/// Configuration for peripheral discovery
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Adapter to use, `None` for the default adapter
    pub adapter_name: Option<String>,
    /// How long to scan before giving up
    pub scan_duration: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            adapter_name: None,
            scan_duration: Duration::from_secs(10),
        }
    }
}

/// Locates one peripheral by address
pub struct PeripheralDiscovery {
    config: DiscoveryConfig,
}

impl PeripheralDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self { config }
    }

    /// Get the configured Bluetooth adapter, powered on
    pub async fn get_adapter(&self) -> Result<Adapter, LinkError> {
        let session = bluer::Session::new().await.map_err(map_bluer_error)?;
        let adapter = match &self.config.adapter_name {
            Some(name) => session.adapter(name).map_err(map_bluer_error)?,
            None => session.default_adapter().await.map_err(map_bluer_error)?,
        };
        adapter.set_powered(true).await.map_err(map_bluer_error)?;
        Ok(adapter)
    }

    /// Find the peripheral, scanning only if BlueZ does not already know it
    pub async fn find(&self, adapter: &Adapter, address: &str) -> Result<Device, LinkError> {
        let target: Address = address
            .parse()
            .map_err(|_| LinkError::InvalidAddress(address.to_string()))?;

        // Already known (bonded or recently seen)
        if adapter.device_addresses().await.map_err(map_bluer_error)?.contains(&target) {
            debug!("[LINK] {} already known to adapter", target);
            return adapter.device(target).map_err(map_bluer_error);
        }

        let discover = adapter.discover_devices().await.map_err(map_bluer_error)?;
        tokio::pin!(discover);

        let found = timeout(self.config.scan_duration, async {
            while let Some(evt) = discover.next().await {
                if let AdapterEvent::DeviceAdded(addr) = evt {
                    if addr == target {
                        return true;
                    }
                }
            }
            false
        })
        .await;

        match found {
            Ok(true) => {
                info!("[LINK] Discovered {}", target);
                adapter.device(target).map_err(map_bluer_error)
            }
            // Timeout or the stream ended
            _ => Err(LinkError::NotFound(address.to_string())),
        }
    }
}

/// Map a BlueZ error onto the link taxonomy
pub fn map_bluer_error(err: bluer::Error) -> LinkError {
    match &err.kind {
        ErrorKind::NotAuthorized
        | ErrorKind::NotPermitted
        | ErrorKind::AuthenticationRejected
        | ErrorKind::AuthenticationFailed => LinkError::PermissionDenied(err.to_string()),
        ErrorKind::DoesNotExist | ErrorKind::NotFound => LinkError::NotFound(err.to_string()),
        ErrorKind::InvalidAddress(addr) => LinkError::InvalidAddress(addr.clone()),
        ErrorKind::NotReady => LinkError::NotReady,
        _ => LinkError::Transport(err.to_string()),
    }
}
