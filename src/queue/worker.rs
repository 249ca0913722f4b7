//! Queue worker: the single task that owns the link

use remoteled_shared::{codec, LedCommand, LedState};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::{CommandQueue, QueueError, QueueEvent, QueueSettings};
use crate::link::{Link, LinkError, LinkEvent, LinkState};
use crate::pairing::PairingInfo;

const REQUEST_CHANNEL_SIZE: usize = 32;

enum QueueRequest {
    Connect {
        pairing: PairingInfo,
        reply: oneshot::Sender<Result<LedState, LinkError>>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<LedState, LinkError>>,
    },
    Enqueue {
        command: LedCommand,
        replace: bool,
        reply: oneshot::Sender<Result<(), QueueError>>,
    },
    Clear {
        reply: oneshot::Sender<usize>,
    },
    Drain {
        reply: oneshot::Sender<()>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
    State {
        reply: oneshot::Sender<LinkState>,
    },
}

/// Cloneable handle onto the queue worker
#[derive(Clone)]
pub struct QueueHandle {
    tx: mpsc::Sender<QueueRequest>,
}

impl QueueHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> QueueRequest,
    ) -> Option<T> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(build(reply)).await.ok()?;
        rx.await.ok()
    }

    /// Connect the link and read the peripheral's LED state once
    pub async fn connect(&self, pairing: PairingInfo) -> Result<LedState, LinkError> {
        self.request(|reply| QueueRequest::Connect { pairing, reply })
            .await
            .unwrap_or_else(|| Err(worker_gone()))
    }

    /// Connect again with the last pairing
    pub async fn reconnect(&self) -> Result<LedState, LinkError> {
        self.request(|reply| QueueRequest::Reconnect { reply })
            .await
            .unwrap_or_else(|| Err(worker_gone()))
    }

    pub async fn enqueue(&self, command: LedCommand) -> Result<(), QueueError> {
        self.request(|reply| QueueRequest::Enqueue {
            command,
            replace: false,
            reply,
        })
        .await
        .unwrap_or(Err(QueueError::Closed))
    }

    /// Flush pending commands and enqueue `command` in one step
    pub async fn replace(&self, command: LedCommand) -> Result<(), QueueError> {
        self.request(|reply| QueueRequest::Enqueue {
            command,
            replace: true,
            reply,
        })
        .await
        .unwrap_or(Err(QueueError::Closed))
    }

    pub async fn clear(&self) -> Result<usize, QueueError> {
        self.request(|reply| QueueRequest::Clear { reply })
            .await
            .ok_or(QueueError::Closed)
    }

    /// Wait until nothing is pending or in flight
    pub async fn drain(&self) -> Result<(), QueueError> {
        self.request(|reply| QueueRequest::Drain { reply })
            .await
            .ok_or(QueueError::Closed)
    }

    /// Disconnect the link. Safe to call repeatedly or after the worker stopped.
    pub async fn disconnect(&self) {
        let _ = self.request(|reply| QueueRequest::Disconnect { reply }).await;
    }

    pub async fn link_state(&self) -> LinkState {
        self.request(|reply| QueueRequest::State { reply })
            .await
            .unwrap_or(LinkState::Disconnected)
    }
}

fn worker_gone() -> LinkError {
    LinkError::Transport("queue worker has stopped".into())
}

/// Owns the link and the command queue
pub struct QueueWorker {
    link: Box<dyn Link>,
    queue: CommandQueue,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    events: mpsc::UnboundedSender<QueueEvent>,
    pairing: Option<PairingInfo>,
    drain_waiters: Vec<oneshot::Sender<()>>,
}

impl QueueWorker {
    /// Start the worker. `link_events` must be the receiver paired with the sender
    /// the link was built with.
    pub fn spawn(
        link: Box<dyn Link>,
        link_events: mpsc::UnboundedReceiver<LinkEvent>,
        settings: QueueSettings,
    ) -> (QueueHandle, mpsc::UnboundedReceiver<QueueEvent>) {
        let (tx, rx) = mpsc::channel(REQUEST_CHANNEL_SIZE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let worker = Self {
            link,
            queue: CommandQueue::new(settings),
            link_events,
            events: events_tx,
            pairing: None,
            drain_waiters: Vec::new(),
        };
        tokio::spawn(worker.run(rx));

        (QueueHandle { tx }, events_rx)
    }

    async fn run(mut self, mut requests: mpsc::Receiver<QueueRequest>) {
        info!("[QUEUE] Worker started ({} link)", self.link.name());

        loop {
            let wake_at = self.queue.next_transmit_at();

            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request, &mut requests).await,
                    None => break,
                },
                Some(event) = self.link_events.recv() => self.handle_link_event(event).await,
                _ = wait_until(wake_at) => {}
            }

            self.pump().await;
            self.notify_drained();
        }

        self.link.disconnect().await;
        info!("[QUEUE] Worker stopped");
    }

    async fn handle_request(
        &mut self,
        request: QueueRequest,
        requests: &mut mpsc::Receiver<QueueRequest>,
    ) {
        match request {
            QueueRequest::Connect { pairing, reply } => {
                let result = self.connect(pairing, requests).await;
                let _ = reply.send(result);
            }
            QueueRequest::Reconnect { reply } => {
                let result = match self.pairing.clone() {
                    Some(pairing) => self.connect(pairing, requests).await,
                    None => Err(LinkError::NotReady),
                };
                let _ = reply.send(result);
            }
            QueueRequest::Enqueue {
                command,
                replace,
                reply,
            } => {
                let result = if replace {
                    self.queue.replace(command)
                } else {
                    self.queue.enqueue(command)
                };
                let _ = reply.send(result);
            }
            QueueRequest::Clear { reply } => {
                let _ = reply.send(self.queue.clear());
            }
            QueueRequest::Drain { reply } => {
                self.drain_waiters.push(reply);
            }
            QueueRequest::Disconnect { reply } => {
                self.link.disconnect().await;
                let discarded = self.queue.set_link_ready(false);
                if discarded > 0 {
                    debug!("[QUEUE] Discarded {} command(s) on disconnect", discarded);
                }
                let _ = reply.send(());
            }
            QueueRequest::State { reply } => {
                let _ = reply.send(self.link.state());
            }
        }
    }

    /// Connect while still answering requests. A `Disconnect` that arrives
    /// mid-connect abandons the attempt.
    async fn connect(
        &mut self,
        pairing: PairingInfo,
        requests: &mut mpsc::Receiver<QueueRequest>,
    ) -> Result<LedState, LinkError> {
        self.queue.set_link_ready(false);
        self.pairing = Some(pairing.clone());

        let mut abandoned = None;
        let outcome = {
            let connect = self.link.connect(&pairing);
            tokio::pin!(connect);
            loop {
                tokio::select! {
                    result = &mut connect => break Some(result),
                    Some(request) = requests.recv() => match request {
                        QueueRequest::Disconnect { reply } => {
                            abandoned = Some(reply);
                            break None;
                        }
                        other => answer_while_connecting(&mut self.queue, other),
                    },
                }
            }
        };

        let Some(result) = outcome else {
            info!("[QUEUE] Connect abandoned on disconnect request");
            self.link.disconnect().await;
            self.queue.set_link_ready(false);
            if let Some(reply) = abandoned {
                let _ = reply.send(());
            }
            return Err(LinkError::Cancelled);
        };
        result?;
        self.queue.set_link_ready(self.link.state().is_ready());

        // One read at ready time to resync the displayed LED state
        let state = match self.link.read_value().await {
            Ok(value) => codec::decode_state(&value),
            Err(e) => {
                warn!("[QUEUE] Could not read LED state: {}", e);
                LedState::Unknown
            }
        };
        info!("[QUEUE] Link ready, peripheral reports LED {:?}", state);
        Ok(state)
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::WriteComplete { write_id, success } => {
                if let Some(event) = self.queue.on_write_complete(write_id, success, Instant::now())
                {
                    self.emit(event);
                }
            }
            LinkEvent::Disconnected { reason } => {
                warn!("[QUEUE] Link lost: {}", reason);
                self.link.disconnect().await;
                let discarded = self.queue.set_link_ready(false);
                if discarded > 0 {
                    warn!("[QUEUE] Discarded {} command(s) after link loss", discarded);
                }
                self.emit(QueueEvent::LinkLost { reason });
            }
        }
    }

    /// Hand the head of the queue to the link if it may go now
    async fn pump(&mut self) {
        let Some(transmit) = self.queue.poll_transmit(Instant::now()) else {
            return;
        };
        let write_id = transmit.write_id;

        if let Err(e) = self.link.submit_write(write_id, transmit.payload).await {
            // Counts as a failed attempt
            warn!("[QUEUE] Link refused write {}: {}", write_id, e);
            if let Some(event) = self.queue.on_write_complete(write_id, false, Instant::now()) {
                self.emit(event);
            }
        }
    }

    fn notify_drained(&mut self) {
        if self.drain_waiters.is_empty() || !self.queue.is_idle() {
            return;
        }
        for waiter in self.drain_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events.send(event);
    }
}

/// Requests other than `Disconnect` arriving during a connect. The queue is not
/// ready yet, so none of them can wait on the link.
fn answer_while_connecting(queue: &mut CommandQueue, request: QueueRequest) {
    match request {
        QueueRequest::Connect { reply, .. } | QueueRequest::Reconnect { reply } => {
            let _ = reply.send(Err(LinkError::Transport("connect already in progress".into())));
        }
        QueueRequest::Enqueue {
            command,
            replace,
            reply,
        } => {
            let result = if replace {
                queue.replace(command)
            } else {
                queue.enqueue(command)
            };
            let _ = reply.send(result);
        }
        QueueRequest::Clear { reply } => {
            let _ = reply.send(queue.clear());
        }
        QueueRequest::Drain { reply } => {
            let _ = reply.send(());
        }
        QueueRequest::State { reply } => {
            let _ = reply.send(LinkState::Connecting);
        }
        QueueRequest::Disconnect { reply } => {
            let _ = reply.send(());
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
