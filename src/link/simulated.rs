//! In-process simulated peripheral (for development and tests)
//!
//! Stands in for a real BLE peripheral: decodes every write, keeps an LED state,
//! and answers reads with the `on`/`off` token. Write outcomes can be scripted.

use async_trait::async_trait;
use bytes::Bytes;
use remoteled_shared::{codec, CommandKind, LedCommand, LedState};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::traits::{Link, LinkError, LinkEvent, LinkState};
use crate::pairing::PairingInfo;

/// Default time the simulated peripheral takes to acknowledge a write
pub const DEFAULT_COMPLETION_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug)]
struct Peripheral {
    reachable: bool,
    connected: bool,
    led: LedState,
    /// Every submitted payload, decoded, including failed attempts
    attempts: Vec<LedCommand>,
    /// Payloads the peripheral acknowledged
    applied: Vec<LedCommand>,
    outstanding: usize,
    max_outstanding: usize,
    connects: usize,
    /// Scripted outcomes for upcoming writes, `true` = success
    script: VecDeque<bool>,
    completion_delay: Duration,
    /// How long `connect` takes before it succeeds or fails
    connect_delay: Duration,
    events: Option<mpsc::UnboundedSender<LinkEvent>>,
}

/// Shared handle onto the simulated device, used to script and inspect it
#[derive(Debug, Clone)]
pub struct SimulatedPeripheral {
    inner: Arc<Mutex<Peripheral>>,
}

impl Default for SimulatedPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPeripheral {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Peripheral {
                reachable: true,
                connected: false,
                led: LedState::Off,
                attempts: Vec::new(),
                applied: Vec::new(),
                outstanding: 0,
                max_outstanding: 0,
                connects: 0,
                script: VecDeque::new(),
                completion_delay: DEFAULT_COMPLETION_DELAY,
                connect_delay: Duration::ZERO,
                events: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Peripheral> {
        // A panicked test thread must not hide the recorded trace
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_completion_delay(self, delay: Duration) -> Self {
        self.lock().completion_delay = delay;
        self
    }

    pub fn with_led(self, led: LedState) -> Self {
        self.lock().led = led;
        self
    }

    /// Queue outcomes for the next writes; unscripted writes succeed
    pub fn script_writes(&self, outcomes: impl IntoIterator<Item = bool>) {
        self.lock().script.extend(outcomes);
    }

    /// Make later connects slow, like a long BLE scan
    pub fn set_connect_delay(&self, delay: Duration) {
        self.lock().connect_delay = delay;
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Simulate the peripheral dropping the connection
    pub fn drop_link(&self, reason: &str) {
        let mut p = self.lock();
        if !p.connected {
            return;
        }
        p.connected = false;
        if let Some(events) = &p.events {
            let _ = events.send(LinkEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }

    /// Every write attempt in submission order
    pub fn attempts(&self) -> Vec<LedCommand> {
        self.lock().attempts.clone()
    }

    /// Writes the peripheral acknowledged
    pub fn applied(&self) -> Vec<LedCommand> {
        self.lock().applied.clone()
    }

    pub fn max_outstanding(&self) -> usize {
        self.lock().max_outstanding
    }

    pub fn led(&self) -> LedState {
        self.lock().led
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }
}

/// Link onto a [`SimulatedPeripheral`]
pub struct SimulatedLink {
    peripheral: SimulatedPeripheral,
    events: mpsc::UnboundedSender<LinkEvent>,
    state: LinkState,
    write_task: Option<JoinHandle<()>>,
}

impl SimulatedLink {
    pub fn new(peripheral: SimulatedPeripheral, events: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self {
            peripheral,
            events,
            state: LinkState::Disconnected,
            write_task: None,
        }
    }
}

#[async_trait]
impl Link for SimulatedLink {
    async fn connect(&mut self, pairing: &PairingInfo) -> Result<(), LinkError> {
        self.state = LinkState::Connecting;
        let delay = self.peripheral.lock().connect_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        {
            let mut p = self.peripheral.lock();
            if !p.reachable {
                self.state = LinkState::Disconnected;
                return Err(LinkError::NotFound(pairing.address.clone()));
            }
            p.connected = true;
            p.connects += 1;
            p.events = Some(self.events.clone());
        }

        self.state = LinkState::Ready {
            characteristic: pairing.characteristic_uuid,
        };
        info!("[LINK] Simulated peripheral {} ready", pairing.address);
        Ok(())
    }

    async fn submit_write(&mut self, write_id: u64, payload: Bytes) -> Result<(), LinkError> {
        if !self.state.is_ready() {
            return Err(LinkError::NotReady);
        }

        let (success, delay) = {
            let mut p = self.peripheral.lock();
            if !p.connected {
                return Err(LinkError::NotReady);
            }
            match codec::decode_command(&payload) {
                Ok(cmd) => p.attempts.push(cmd),
                Err(e) => warn!("[LINK] Simulated peripheral got undecodable payload: {}", e),
            }
            p.outstanding += 1;
            p.max_outstanding = p.max_outstanding.max(p.outstanding);
            (p.script.pop_front().unwrap_or(true), p.completion_delay)
        };

        let peripheral = self.peripheral.clone();
        let events = self.events.clone();
        self.write_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut p = peripheral.lock();
                p.outstanding = p.outstanding.saturating_sub(1);
                if success {
                    if let Ok(cmd) = codec::decode_command(&payload) {
                        p.led = match cmd.kind {
                            CommandKind::On | CommandKind::Blink => LedState::On,
                            CommandKind::Off => LedState::Off,
                        };
                        debug!("[LINK] Simulated peripheral applied {}", cmd);
                        p.applied.push(cmd);
                    }
                }
            }
            let _ = events.send(LinkEvent::WriteComplete { write_id, success });
        }));

        Ok(())
    }

    async fn read_value(&mut self) -> Result<Bytes, LinkError> {
        if !self.state.is_ready() {
            return Err(LinkError::NotReady);
        }
        Ok(codec::encode_state(self.peripheral.led()))
    }

    async fn disconnect(&mut self) {
        if let Some(task) = self.write_task.take() {
            task.abort();
        }
        {
            let mut p = self.peripheral.lock();
            p.connected = false;
            p.outstanding = 0;
        }
        if self.state != LinkState::Disconnected {
            info!("[LINK] Simulated peripheral disconnected");
        }
        self.state = LinkState::Disconnected;
    }

    fn state(&self) -> LinkState {
        self.state
    }

    fn name(&self) -> &'static str {
        "Simulated"
    }
}
