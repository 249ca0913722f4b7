//! BLE GATT link using BlueZ
//!
//! Connects to the peripheral, resolves the command characteristic inside the paired
//! service, and performs writes in a background task so completion can be reported
//! as an event.

use async_trait::async_trait;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, Device, DeviceEvent, DeviceProperty};
use bytes::Bytes;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::discovery::{map_bluer_error, DiscoveryConfig, PeripheralDiscovery};
use super::traits::{Link, LinkError, LinkEvent, LinkState};
use crate::pairing::PairingInfo;

/// Interval between service-resolution checks
const RESOLVE_POLL: Duration = Duration::from_millis(100);

/// BLE link configuration
#[derive(Debug, Clone)]
pub struct BleLinkConfig {
    pub discovery: DiscoveryConfig,
    /// Upper bound for connect + service resolution
    pub connect_timeout: Duration,
}

impl Default for BleLinkConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

/// Link to a peripheral over BlueZ
pub struct BleLink {
    config: BleLinkConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: LinkState,
    adapter: Option<Adapter>,
    device: Option<Device>,
    characteristic: Option<Characteristic>,
    write_task: Option<JoinHandle<()>>,
    monitor_task: Option<JoinHandle<()>>,
}

impl BleLink {
    pub fn new(config: BleLinkConfig, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            config,
            events,
            state: LinkState::Disconnected,
            adapter: None,
            device: None,
            characteristic: None,
            write_task: None,
            monitor_task: None,
        }
    }

    async fn establish(&mut self, pairing: &PairingInfo) -> Result<Characteristic, LinkError> {
        let discovery = PeripheralDiscovery::new(self.config.discovery.clone());
        let adapter = match self.adapter.take() {
            Some(adapter) => adapter,
            None => discovery.get_adapter().await?,
        };
        info!("[LINK] Using adapter {}", adapter.name());

        let device = discovery.find(&adapter, &pairing.address).await;
        self.adapter = Some(adapter);
        let device = device?;

        let deadline = Instant::now() + self.config.connect_timeout;

        if !device.is_connected().await.map_err(map_bluer_error)? {
            timeout(self.config.connect_timeout, device.connect())
                .await
                .map_err(|_| LinkError::Timeout("connecting"))?
                .map_err(map_bluer_error)?;
        }
        self.state = LinkState::Connected;
        self.device = Some(device.clone());
        info!("[LINK] Connected to {}", pairing.address);

        // GATT services are resolved asynchronously after connect
        while !device.is_services_resolved().await.map_err(map_bluer_error)? {
            if Instant::now() >= deadline {
                return Err(LinkError::Timeout("resolving services"));
            }
            sleep(RESOLVE_POLL).await;
        }

        find_characteristic(&device, pairing.service_uuid, pairing.characteristic_uuid).await
    }

    fn spawn_monitor(&mut self, device: Device) {
        let events = self.events.clone();
        self.monitor_task = Some(tokio::spawn(async move {
            let stream = match device.events().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("[LINK] Cannot watch device events: {}", e);
                    return;
                }
            };
            tokio::pin!(stream);

            while let Some(evt) = stream.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = evt {
                    warn!("[LINK] Peripheral {} dropped the connection", device.address());
                    let _ = events.send(LinkEvent::Disconnected {
                        reason: "peripheral disconnected".into(),
                    });
                    break;
                }
            }
        }));
    }
}

async fn find_characteristic(
    device: &Device,
    service_uuid: Uuid,
    characteristic_uuid: Uuid,
) -> Result<Characteristic, LinkError> {
    for service in device.services().await.map_err(map_bluer_error)? {
        if service.uuid().await.map_err(map_bluer_error)? != service_uuid {
            continue;
        }
        for characteristic in service.characteristics().await.map_err(map_bluer_error)? {
            if characteristic.uuid().await.map_err(map_bluer_error)? == characteristic_uuid {
                return Ok(characteristic);
            }
        }
        return Err(LinkError::AttributeNotFound(characteristic_uuid));
    }
    Err(LinkError::AttributeNotFound(service_uuid))
}

#[async_trait]
impl Link for BleLink {
    async fn connect(&mut self, pairing: &PairingInfo) -> Result<(), LinkError> {
        self.disconnect().await;
        self.state = LinkState::Connecting;

        match self.establish(pairing).await {
            Ok(characteristic) => {
                self.characteristic = Some(characteristic);
                self.state = LinkState::Ready {
                    characteristic: pairing.characteristic_uuid,
                };
                if let Some(device) = self.device.clone() {
                    self.spawn_monitor(device);
                }
                info!("[LINK] Characteristic {} ready", pairing.characteristic_uuid);
                Ok(())
            }
            Err(e) => {
                self.disconnect().await;
                Err(e)
            }
        }
    }

    async fn submit_write(&mut self, write_id: u64, payload: Bytes) -> Result<(), LinkError> {
        if !self.state.is_ready() {
            return Err(LinkError::NotReady);
        }
        let characteristic = self.characteristic.clone().ok_or(LinkError::NotReady)?;

        let events = self.events.clone();
        self.write_task = Some(tokio::spawn(async move {
            let success = match characteristic.write(&payload).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("[LINK] Write failed: {}", e);
                    false
                }
            };
            let _ = events.send(LinkEvent::WriteComplete { write_id, success });
        }));

        debug!("[LINK] Write {} submitted", write_id);
        Ok(())
    }

    async fn read_value(&mut self) -> Result<Bytes, LinkError> {
        let characteristic = match (&self.state, &self.characteristic) {
            (LinkState::Ready { .. }, Some(c)) => c,
            _ => return Err(LinkError::NotReady),
        };
        let value = characteristic.read().await.map_err(map_bluer_error)?;
        Ok(Bytes::from(value))
    }

    async fn disconnect(&mut self) {
        if let Some(task) = self.write_task.take() {
            task.abort();
        }
        if let Some(task) = self.monitor_task.take() {
            task.abort();
        }
        self.characteristic = None;

        if let Some(device) = self.device.take() {
            if let Err(e) = device.disconnect().await {
                debug!("[LINK] Disconnect: {}", e);
            }
            info!("[LINK] Disconnected from {}", device.address());
        }
        self.state = LinkState::Disconnected;
    }

    fn state(&self) -> LinkState {
        self.state
    }

    fn name(&self) -> &'static str {
        "BLE"
    }
}
