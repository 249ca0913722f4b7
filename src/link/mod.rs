//! Peripheral link layer
//!
//! This module handles:
//! - Discovery and connection of the paired BLE peripheral
//! - Resolution of the command characteristic
//! - Raw writes with asynchronous completion events
//! - A simulated peripheral for development

mod ble;
mod discovery;
mod simulated;
mod traits;

pub use ble::{BleLink, BleLinkConfig};
pub use discovery::DiscoveryConfig;
pub use simulated::{SimulatedLink, SimulatedPeripheral};
pub use traits::{Link, LinkError, LinkEvent, LinkState};

use tokio::sync::mpsc;

use crate::config::{LinkConfig, LinkMode};

/// Build the link selected by configuration
pub fn build_link(
    config: &LinkConfig,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> Box<dyn Link> {
    match config.mode {
        LinkMode::Ble => Box::new(BleLink::new(
            BleLinkConfig {
                discovery: DiscoveryConfig {
                    adapter_name: config.adapter.clone(),
                    scan_duration: config.scan_timeout(),
                },
                connect_timeout: config.connect_timeout(),
            },
            events,
        )),
        LinkMode::Simulated => Box::new(SimulatedLink::new(SimulatedPeripheral::new(), events)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_link_by_mode() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut config = LinkConfig::default();
        assert_eq!(build_link(&config, tx.clone()).name(), "BLE");

        config.mode = LinkMode::Simulated;
        let link = build_link(&config, tx);
        assert_eq!(link.name(), "Simulated");
        assert_eq!(link.state(), LinkState::Disconnected);
    }
}
