//! Local session countdown
//!
//! Display only: it reports ticks and a final `Finished`, nothing more.

use remoteled_shared::format_mm_ss;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

const MIN_TICK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownEvent {
    Tick { remaining_secs: u64 },
    Finished,
}

pub struct Countdown {
    task: Option<JoinHandle<()>>,
}

impl Countdown {
    /// Count down from `total_secs`, one step per `tick` (at least 1ms)
    pub fn start<F>(total_secs: u64, tick: Duration, mut on_event: F) -> Self
    where
        F: FnMut(CountdownEvent) + Send + 'static,
    {
        let task = tokio::spawn(async move {
            let mut ticker = interval(tick.max(MIN_TICK));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let mut remaining = total_secs;
            loop {
                ticker.tick().await;
                debug!("[SESSION] Remaining {}", format_mm_ss(remaining));
                on_event(CountdownEvent::Tick {
                    remaining_secs: remaining,
                });
                if remaining == 0 {
                    on_event(CountdownEvent::Finished);
                    break;
                }
                remaining -= 1;
            }
        });

        Self { task: Some(task) }
    }

    /// Stop ticking. Safe to call any number of times.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.cancel();
    }
}
