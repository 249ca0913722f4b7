//! Order status poller
//!
//! Fetch, hand the status to the callback, then sleep one interval. The next fetch
//! never starts before the previous callback returned.

use remoteled_shared::OrderStatus;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::Backend;

/// What the status callback wants the poller to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollControl {
    Continue,
    Stop,
}

impl From<OrderStatus> for PollControl {
    fn from(status: OrderStatus) -> Self {
        if status.is_terminal() {
            PollControl::Stop
        } else {
            PollControl::Continue
        }
    }
}

/// Handle onto a running poll loop
pub struct OrderPoller {
    order_id: String,
    task: Option<JoinHandle<()>>,
}

impl OrderPoller {
    /// Start polling `order_id` every `interval`
    pub fn start<F>(
        order_id: impl Into<String>,
        backend: Arc<dyn Backend>,
        interval: Duration,
        mut on_status: F,
    ) -> Self
    where
        F: FnMut(OrderStatus) -> PollControl + Send + 'static,
    {
        let order_id = order_id.into();
        let id = order_id.clone();

        let task = tokio::spawn(async move {
            info!("[POLL] Polling order {} every {:?}", id, interval);
            loop {
                match backend.get_order(&id).await {
                    Ok(order) => {
                        debug!("[POLL] Order {} is {}", id, order.status);
                        if on_status(order.status) == PollControl::Stop {
                            info!("[POLL] Order {} reached {}, polling stopped", id, order.status);
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("[POLL] Status fetch for {} failed: {}", id, e);
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });

        Self {
            order_id,
            task: Some(task),
        }
    }

    /// Stop polling. Safe to call any number of times.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                debug!("[POLL] Stopping poller for {}", self.order_id);
            }
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for OrderPoller {
    fn drop(&mut self) {
        self.stop();
    }
}
