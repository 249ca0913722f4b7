//! Single-owner command queue
//!
//! Pure bookkeeping: the owner feeds it the current instant and link outcomes, and
//! asks it which payload, if any, to transmit next. At most one command is in flight.

use bytes::Bytes;
use remoteled_shared::{codec, LedCommand};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{QueueError, QueueEvent};

/// Queue tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Gap between a completion and the next transmission
    pub settle_delay: Duration,
    /// Retries after the first failed attempt
    pub max_retries: u32,
    /// Pending + in-flight capacity
    pub max_depth: usize,
}

/// A payload handed to the link, tagged with the id its completion must echo
#[derive(Debug, Clone, PartialEq)]
pub struct Transmit {
    pub write_id: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone)]
struct Queued {
    command: LedCommand,
    payload: Bytes,
    attempts: u32,
    /// Id of the current attempt, set when it goes in flight
    write_id: u64,
}

#[derive(Debug)]
pub struct CommandQueue {
    settings: QueueSettings,
    pending: VecDeque<Queued>,
    in_flight: Option<Queued>,
    /// Earliest instant the next transmission may start
    ready_at: Option<Instant>,
    link_ready: bool,
    next_write_id: u64,
}

impl CommandQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            settings,
            pending: VecDeque::new(),
            in_flight: None,
            ready_at: None,
            link_ready: false,
            next_write_id: 1,
        }
    }

    /// Track link readiness; losing the link discards everything queued
    pub fn set_link_ready(&mut self, ready: bool) -> usize {
        self.link_ready = ready;
        if ready {
            return 0;
        }
        let discarded = self.pending.len() + usize::from(self.in_flight.is_some());
        self.pending.clear();
        self.in_flight = None;
        self.ready_at = None;
        discarded
    }

    pub fn is_link_ready(&self) -> bool {
        self.link_ready
    }

    /// Append a command; fails fast when the link is not ready or the queue is full
    pub fn enqueue(&mut self, command: LedCommand) -> Result<(), QueueError> {
        if !self.link_ready {
            return Err(QueueError::LinkNotReady);
        }
        if self.len() >= self.settings.max_depth {
            return Err(QueueError::Full(self.settings.max_depth));
        }

        let payload = codec::encode(&command)?;
        self.pending.push_back(Queued {
            command,
            payload,
            attempts: 0,
            write_id: 0,
        });
        Ok(())
    }

    /// Discard pending commands, then enqueue `command`. The in-flight write is kept.
    pub fn replace(&mut self, command: LedCommand) -> Result<(), QueueError> {
        if !self.link_ready {
            return Err(QueueError::LinkNotReady);
        }
        let flushed = self.clear();
        if flushed > 0 {
            debug!("[QUEUE] Flushed {} pending command(s)", flushed);
        }
        self.enqueue(command)
    }

    /// Discard pending commands, returning how many were dropped
    pub fn clear(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    /// Next payload to hand to the link, if one may be transmitted at `now`
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Transmit> {
        if self.in_flight.is_some() || !self.link_ready {
            return None;
        }
        if matches!(self.ready_at, Some(at) if now < at) {
            return None;
        }

        let mut next = self.pending.pop_front()?;
        next.attempts += 1;
        next.write_id = self.next_write_id;
        self.next_write_id += 1;
        debug!(
            "[QUEUE] Transmitting {} (write {}, attempt {})",
            next.command, next.write_id, next.attempts
        );
        let transmit = Transmit {
            write_id: next.write_id,
            payload: next.payload.clone(),
        };
        self.in_flight = Some(next);
        Some(transmit)
    }

    /// Record the outcome of write `write_id`. Completions for anything other than
    /// the current in-flight write are ignored.
    pub fn on_write_complete(
        &mut self,
        write_id: u64,
        success: bool,
        now: Instant,
    ) -> Option<QueueEvent> {
        match &self.in_flight {
            Some(current) if current.write_id == write_id => {}
            Some(current) => {
                warn!(
                    "[QUEUE] Stale completion for write {} (write {} in flight), ignoring",
                    write_id, current.write_id
                );
                return None;
            }
            None => {
                warn!("[QUEUE] Completion for write {} with nothing in flight, ignoring", write_id);
                return None;
            }
        }
        let done = self.in_flight.take()?;
        self.ready_at = Some(now + self.settings.settle_delay);

        if success {
            return Some(QueueEvent::Transmitted(done.command));
        }

        if done.attempts > self.settings.max_retries {
            warn!(
                "[QUEUE] {} dropped after {} attempts",
                done.command, done.attempts
            );
            return Some(QueueEvent::Dropped {
                command: done.command,
                attempts: done.attempts,
            });
        }

        warn!(
            "[QUEUE] Write of {} failed, retrying ({}/{})",
            done.command, done.attempts, self.settings.max_retries
        );
        // A retried command keeps its place at the head
        self.pending.push_front(done);
        None
    }

    /// When the owner should wake up to transmit, if it is waiting on the settle delay
    pub fn next_transmit_at(&self) -> Option<Instant> {
        if self.in_flight.is_some() || !self.link_ready || self.pending.is_empty() {
            return None;
        }
        self.ready_at
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    pub fn has_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Pending plus in-flight
    pub fn len(&self) -> usize {
        self.pending.len() + usize::from(self.in_flight.is_some())
    }
}
