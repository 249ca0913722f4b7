//! Session controller
//!
//! One task per session consumes order polls, countdown ticks, queue events and
//! cancellation from channels, in whatever order they arrive. The backend poll is
//! the only signal that ends a running session; the countdown only triggers an
//! early DONE telemetry hint.

use remoteled_shared::api::{CreateOrderRequest, PaymentRequest, TelemetryEvent};
use remoteled_shared::state_machine::{SessionEvent, SessionStateMachine, TransitionResult};
use remoteled_shared::{
    now_ms, now_secs, LedColor, LedCommand, LedState, OrderStatus, ServiceType, Session,
    SessionState,
};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use super::telemetry::TelemetryEmitter;
use super::verifier::{AuthorizationVerifier, StructuralVerifier};
use super::SessionError;
use crate::backend::{Backend, BackendError};
use crate::config::SessionConfig;
use crate::countdown::{Countdown, CountdownEvent};
use crate::link::LinkError;
use crate::pairing::PairingInfo;
use crate::poller::{OrderPoller, PollControl};
use crate::queue::{QueueError, QueueEvent, QueueHandle};

/// What the user is buying
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub device_id: String,
    pub service_id: String,
    pub amount_cents: u32,
    pub service_type: ServiceType,
}

/// Observable session state for display
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub state: SessionState,
    /// Countdown value, once the session is running
    pub remaining_secs: Option<u64>,
    /// Last LED state read from the peripheral
    pub led: LedState,
}

#[derive(Debug)]
enum ControllerEvent {
    Poll(OrderStatus),
    Countdown(CountdownEvent),
    /// Outcome of the one reconnect attempt after link loss
    Reconnected(Result<LedState, LinkError>),
    Cancel,
}

/// Places orders and runs sessions against one paired peripheral
pub struct SessionController {
    backend: Arc<dyn Backend>,
    queue: QueueHandle,
    queue_events: mpsc::UnboundedReceiver<QueueEvent>,
    pairing: PairingInfo,
    config: SessionConfig,
    skip_backend_led: bool,
    verifier: Box<dyn AuthorizationVerifier>,
}

impl SessionController {
    pub fn new(
        backend: Arc<dyn Backend>,
        queue: QueueHandle,
        queue_events: mpsc::UnboundedReceiver<QueueEvent>,
        pairing: PairingInfo,
        config: SessionConfig,
    ) -> Self {
        Self {
            backend,
            queue,
            queue_events,
            pairing,
            config,
            skip_backend_led: false,
            verifier: Box::new(StructuralVerifier),
        }
    }

    pub fn with_verifier(mut self, verifier: Box<dyn AuthorizationVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    /// Ask the backend not to drive the LED itself when the payment goes through
    pub fn skip_backend_led(mut self, skip: bool) -> Self {
        self.skip_backend_led = skip;
        self
    }

    /// Create the order and pay for it. The returned session is in CREATED.
    pub async fn place_order(&self, request: &OrderRequest) -> Result<Session, SessionError> {
        info!(
            "[SESSION] Placing {} order on {} ({} cents)",
            request.service_type, request.device_id, request.amount_cents
        );

        let order = self
            .backend
            .create_order(&CreateOrderRequest {
                device_id: request.device_id.clone(),
                service_id: request.service_id.clone(),
                amount_cents: request.amount_cents,
            })
            .await
            .map_err(SessionError::backend("create_order"))?;

        let authorized_seconds = match request.service_type {
            ServiceType::Trigger => self.config.trigger_countdown_secs,
            _ => order.authorized_seconds(),
        };

        let receipt = self
            .backend
            .trigger_payment(&PaymentRequest {
                amount_cents: request.amount_cents,
                customer_id: None,
                device_id: order.device_id.clone(),
                description: Some(format!(
                    "{} service on {}",
                    request.service_type, order.device_id
                )),
                duration_seconds: Some(authorized_seconds),
                order_id: Some(order.id.clone()),
                skip_led: self.skip_backend_led,
            })
            .await
            .map_err(SessionError::backend("payment"))?;

        if !receipt.is_success() {
            return Err(SessionError::Backend {
                stage: "payment",
                source: BackendError::Rejected {
                    status: 402,
                    message: format!("payment {}", receipt.payment_status),
                },
            });
        }
        info!(
            "[SESSION] Order {} paid ({}), {}s authorized",
            order.id, receipt.payment_intent_id, authorized_seconds
        );

        Ok(Session::new(
            order.id,
            order.device_id,
            request.service_type,
            authorized_seconds,
        ))
    }

    /// Drive `session` to a terminal state in the background
    pub fn start(self, session: Session) -> SessionHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            state: session.state,
            remaining_secs: None,
            led: LedState::Unknown,
        });
        let telemetry = TelemetryEmitter::new(
            self.backend.clone(),
            session.device_id.clone(),
            session.session_id.clone(),
        );

        let run = SessionRun {
            session,
            fsm: SessionStateMachine::new(),
            backend: self.backend,
            queue: self.queue,
            queue_events: self.queue_events,
            pairing: self.pairing,
            config: self.config,
            verifier: self.verifier,
            telemetry,
            events_tx: events_tx.clone(),
            events_rx,
            status: status_tx,
            poller: None,
            countdown: None,
            running_confirmed: false,
            commands_sealed: false,
            reconnect_attempted: false,
            reconnect: None,
            link_released: false,
        };

        SessionHandle {
            events: events_tx,
            status: status_rx,
            task: tokio::spawn(run.run()),
        }
    }
}

/// Handle onto a running session
pub struct SessionHandle {
    events: mpsc::UnboundedSender<ControllerEvent>,
    status: watch::Receiver<SessionStatus>,
    task: JoinHandle<Result<Session, SessionError>>,
}

impl SessionHandle {
    /// Abort the session: it moves to ERROR, turns the LED off and tears down
    pub fn cancel(&self) {
        if self.events.send(ControllerEvent::Cancel).is_ok() {
            info!("[SESSION] Cancellation requested");
        }
    }

    pub fn status(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Wait for the session to finish
    pub async fn wait(&mut self) -> Result<Session, SessionError> {
        match (&mut self.task).await {
            Ok(result) => result,
            Err(e) => Err(SessionError::Aborted(e.to_string())),
        }
    }
}

struct SessionRun {
    session: Session,
    fsm: SessionStateMachine,
    backend: Arc<dyn Backend>,
    queue: QueueHandle,
    queue_events: mpsc::UnboundedReceiver<QueueEvent>,
    pairing: PairingInfo,
    config: SessionConfig,
    verifier: Box<dyn AuthorizationVerifier>,
    telemetry: TelemetryEmitter,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    events_rx: mpsc::UnboundedReceiver<ControllerEvent>,
    status: watch::Sender<SessionStatus>,
    poller: Option<OrderPoller>,
    countdown: Option<Countdown>,
    /// First RUNNING poll seen
    running_confirmed: bool,
    /// OFF issued, no more LED commands
    commands_sealed: bool,
    reconnect_attempted: bool,
    reconnect: Option<JoinHandle<()>>,
    link_released: bool,
}

impl SessionRun {
    async fn run(mut self) -> Result<Session, SessionError> {
        info!(
            "[SESSION] Session {} started ({}, {}s)",
            self.session.session_id, self.session.service_type, self.session.authorized_seconds
        );

        let outcome = self.drive().await;
        if let Err(e) = &outcome {
            self.fail(e).await;
        }
        self.teardown().await;
        self.telemetry.flush(self.config.drain_timeout()).await;

        match outcome {
            Ok(()) => {
                info!("[SESSION] Session {} completed", self.session.session_id);
                Ok(self.session)
            }
            Err(e) => {
                error!("[SESSION] Session {} failed: {}", self.session.session_id, e);
                Err(e)
            }
        }
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        let order_id = self.session.session_id.clone();

        self.transition(SessionEvent::AuthorizationRequested);
        let authorization = cancellable(
            &mut self.events_rx,
            self.backend.create_authorization(&order_id),
        )
        .await?
        .map_err(SessionError::backend("authorization"))?;

        let seconds = authorization.payload.seconds;
        if seconds != self.session.authorized_seconds {
            info!(
                "[SESSION] Authorization grants {}s (order said {}s)",
                seconds, self.session.authorized_seconds
            );
            self.session.authorized_seconds = seconds;
        }
        self.telemetry
            .set_payload_hash(authorization.payload.payload_hash());
        self.transition(SessionEvent::AuthorizationGranted);

        let led = self.relay().await?;
        self.status.send_modify(|s| s.led = led);
        self.transition(SessionEvent::RelayConfirmed);

        self.verifier
            .verify(&self.session, &authorization, now_secs())?;
        self.transition(SessionEvent::SignatureVerified);

        self.enter_running().await;
        self.event_loop().await
    }

    /// Make sure the link is ready, with one reconnect attempt
    async fn relay(&mut self) -> Result<LedState, SessionError> {
        if self.queue.link_state().await.is_ready() {
            debug!("[SESSION] Link already ready");
            return Ok(self.status.borrow().led);
        }

        let first = cancellable(&mut self.events_rx, self.queue.connect(self.pairing.clone())).await?;
        match first {
            Ok(led) => Ok(led),
            Err(e) => {
                warn!("[SESSION] Relay failed ({}), reconnecting once", e);
                Ok(cancellable(&mut self.events_rx, self.queue.reconnect()).await??)
            }
        }
    }

    async fn enter_running(&mut self) {
        self.session.started_at = Some(now_ms());

        let indicator =
            LedCommand::running_indicator(self.session.service_type, self.pairing.ble_key.clone());
        self.send_command(indicator).await;
        self.telemetry.emit(TelemetryEvent::Started, None);

        let events = self.events_tx.clone();
        self.poller = Some(OrderPoller::start(
            self.session.session_id.clone(),
            self.backend.clone(),
            self.config.poll_interval(),
            move |status| {
                let _ = events.send(ControllerEvent::Poll(status));
                PollControl::from(status)
            },
        ));

        let events = self.events_tx.clone();
        self.countdown = Some(Countdown::start(
            u64::from(self.session.authorized_seconds),
            self.config.countdown_tick(),
            move |evt| {
                let _ = events.send(ControllerEvent::Countdown(evt));
            },
        ));
    }

    async fn event_loop(&mut self) -> Result<(), SessionError> {
        while !self.session.state.is_terminal() {
            tokio::select! {
                Some(event) = self.events_rx.recv() => self.on_event(event).await?,
                Some(event) = self.queue_events.recv() => self.on_queue_event(event),
                else => return Err(SessionError::Aborted("event channels closed".into())),
            }
        }
        Ok(())
    }

    async fn on_event(&mut self, event: ControllerEvent) -> Result<(), SessionError> {
        match event {
            ControllerEvent::Poll(status) => self.on_order_status(status).await,
            ControllerEvent::Countdown(CountdownEvent::Tick { remaining_secs }) => {
                self.status
                    .send_modify(|s| s.remaining_secs = Some(remaining_secs));
                Ok(())
            }
            ControllerEvent::Countdown(CountdownEvent::Finished) => {
                info!("[SESSION] Countdown elapsed, waiting for backend confirmation");
                self.telemetry
                    .emit(TelemetryEvent::Done, Some("countdown elapsed".into()));
                Ok(())
            }
            ControllerEvent::Reconnected(Ok(led)) => {
                info!("[SESSION] Link restored");
                self.status.send_modify(|s| s.led = led);
                Ok(())
            }
            ControllerEvent::Reconnected(Err(e)) => {
                warn!("[SESSION] Reconnect failed: {}; following backend status only", e);
                Ok(())
            }
            ControllerEvent::Cancel => Err(SessionError::Cancelled),
        }
    }

    async fn on_order_status(&mut self, status: OrderStatus) -> Result<(), SessionError> {
        match status {
            OrderStatus::Running if !self.running_confirmed => {
                self.running_confirmed = true;
                info!("[SESSION] Backend confirmed RUNNING");
                let confirmation = LedCommand::on_for(
                    LedColor::Green,
                    self.session.authorized_seconds,
                    self.pairing.ble_key.clone(),
                );
                self.send_command(confirmation).await;
                Ok(())
            }
            OrderStatus::Done => {
                self.complete().await;
                Ok(())
            }
            OrderStatus::Failed => Err(SessionError::Failed { status }),
            _ => {
                debug!("[SESSION] Order is {}", status);
                Ok(())
            }
        }
    }

    fn on_queue_event(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::Transmitted(command) => {
                debug!("[SESSION] Peripheral acknowledged {}", command);
            }
            QueueEvent::Dropped { command, attempts } => {
                warn!(
                    "[SESSION] {} dropped after {} attempts, continuing without it",
                    command, attempts
                );
            }
            QueueEvent::LinkLost { reason } => {
                if self.reconnect_attempted || self.commands_sealed {
                    warn!("[SESSION] Link lost ({}), not reconnecting", reason);
                    return;
                }
                self.reconnect_attempted = true;
                warn!("[SESSION] Link lost ({}), reconnecting once", reason);

                // Polls, ticks and cancel keep flowing while this runs
                let queue = self.queue.clone();
                let events = self.events_tx.clone();
                self.reconnect = Some(tokio::spawn(async move {
                    let result = queue.reconnect().await;
                    let _ = events.send(ControllerEvent::Reconnected(result));
                }));
            }
        }
    }

    /// Authoritative completion
    async fn complete(&mut self) {
        self.issue_off().await;
        self.transition(SessionEvent::OrderCompleted);
        self.session.ended_at = Some(now_ms());
        self.stop_timers();
        self.telemetry.emit(TelemetryEvent::Done, None);
    }

    async fn fail(&mut self, err: &SessionError) {
        if self.session.state.is_terminal() {
            return;
        }
        self.transition(SessionEvent::Failure {
            reason: err.to_string(),
        });
        self.session.ended_at = Some(now_ms());
        self.stop_timers();
        self.issue_off().await;

        if self.telemetry.has_sent(TelemetryEvent::Started) {
            self.telemetry
                .emit(TelemetryEvent::Error, Some(err.to_string()));
        }
    }

    async fn send_command(&mut self, command: LedCommand) {
        if self.commands_sealed {
            debug!("[SESSION] Not sending {} after OFF", command);
            return;
        }
        let label = command.to_string();
        match self.queue.enqueue(command).await {
            Ok(()) => debug!("[SESSION] Queued {}", label),
            Err(e) => warn!("[SESSION] Could not queue {}: {}", label, e),
        }
    }

    /// OFF replaces anything still pending and is the last command of the session
    async fn issue_off(&mut self) {
        if self.commands_sealed {
            return;
        }
        self.commands_sealed = true;

        match self
            .queue
            .replace(LedCommand::off_all(self.pairing.ble_key.clone()))
            .await
        {
            Ok(()) => info!("[SESSION] OFF(all) queued"),
            Err(QueueError::LinkNotReady) => debug!("[SESSION] Link not ready, OFF skipped"),
            Err(e) => warn!("[SESSION] Could not queue OFF: {}", e),
        }
    }

    fn stop_timers(&mut self) {
        if let Some(mut poller) = self.poller.take() {
            poller.stop();
        }
        if let Some(mut countdown) = self.countdown.take() {
            countdown.cancel();
        }
    }

    /// Stop poller, cancel countdown, drain and clear the queue, disconnect
    async fn teardown(&mut self) {
        self.stop_timers();
        if self.link_released {
            return;
        }
        self.link_released = true;

        // A reconnect not yet handed to the worker must not outlive the session
        if let Some(reconnect) = self.reconnect.take() {
            reconnect.abort();
        }

        let limit = self.config.drain_timeout();
        if timeout(limit, self.queue.drain()).await.is_err() {
            warn!("[SESSION] Queue did not drain within {:?}", limit);
        }
        if let Ok(discarded) = self.queue.clear().await {
            if discarded > 0 {
                debug!("[SESSION] Cleared {} pending command(s)", discarded);
            }
        }
        self.queue.disconnect().await;
        info!("[SESSION] Session {} torn down", self.session.session_id);
    }

    fn transition(&mut self, event: SessionEvent) {
        let from = self.fsm.state();
        match self.fsm.process_event(event) {
            TransitionResult::Success(to) => info!("[SESSION] {:?} -> {:?}", from, to),
            TransitionResult::Failed { from, reason } => {
                warn!("[SESSION] {:?} -> Error: {}", from, reason)
            }
            TransitionResult::Invalid { from, event } => {
                warn!("[SESSION] Ignoring {:?} in {:?}", event, from);
                return;
            }
        }

        let state = self.fsm.state();
        self.session.state = state;
        self.status.send_modify(|s| s.state = state);
    }
}

/// Run `fut` unless the session is cancelled first
async fn cancellable<T>(
    events: &mut mpsc::UnboundedReceiver<ControllerEvent>,
    fut: impl Future<Output = T>,
) -> Result<T, SessionError> {
    tokio::pin!(fut);
    loop {
        tokio::select! {
            out = &mut fut => return Ok(out),
            event = events.recv() => match event {
                Some(ControllerEvent::Cancel) | None => return Err(SessionError::Cancelled),
                Some(other) => debug!("[SESSION] Ignoring {:?} before RUNNING", other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryBackend, DEVICE_ID, ORDER_ID};
    use crate::link::{LinkError, SimulatedLink, SimulatedPeripheral};
    use crate::queue::{QueueSettings, QueueWorker};
    use crate::session::VerificationError;
    use std::time::Duration;

    const KEY: &str = "9F64";
    const WAIT: Duration = Duration::from_secs(5);

    struct Harness {
        peripheral: SimulatedPeripheral,
        backend: Arc<MemoryBackend>,
        controller: SessionController,
    }

    fn pairing() -> PairingInfo {
        PairingInfo::parse("remoteled://connect/B8:27:EB:12:34:56/7514/DE40/9F64").unwrap()
    }

    fn fast_config() -> SessionConfig {
        SessionConfig {
            poll_interval_ms: 20,
            countdown_tick_ms: 10,
            trigger_countdown_secs: 2,
            drain_timeout_ms: 2_000,
        }
    }

    fn harness_with(backend: MemoryBackend, peripheral: SimulatedPeripheral) -> Harness {
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let link = SimulatedLink::new(peripheral.clone(), link_tx);
        let (queue, queue_events) = QueueWorker::spawn(
            Box::new(link),
            link_rx,
            QueueSettings {
                settle_delay: Duration::from_millis(5),
                max_retries: 3,
                max_depth: 16,
            },
        );

        let backend = Arc::new(backend);
        let controller = SessionController::new(
            backend.clone(),
            queue,
            queue_events,
            pairing(),
            fast_config(),
        );
        Harness {
            peripheral,
            backend,
            controller,
        }
    }

    fn harness(backend: MemoryBackend) -> Harness {
        let peripheral = SimulatedPeripheral::new().with_completion_delay(Duration::from_millis(5));
        harness_with(backend, peripheral)
    }

    fn order(service_type: ServiceType) -> OrderRequest {
        OrderRequest {
            device_id: DEVICE_ID.into(),
            service_id: "svc-1".into(),
            amount_cents: 250,
            service_type,
        }
    }

    async fn run_to_end(
        harness: Harness,
        service_type: ServiceType,
    ) -> (Result<Session, SessionError>, SimulatedPeripheral, Arc<MemoryBackend>) {
        let session = harness
            .controller
            .place_order(&order(service_type))
            .await
            .expect("order placement failed");
        let mut handle = harness.controller.start(session);
        let result = timeout(WAIT, handle.wait()).await.expect("session timed out");
        (result, harness.peripheral, harness.backend)
    }

    async fn wait_for_state(handle: &SessionHandle, state: SessionState) {
        let mut status = handle.status();
        timeout(WAIT, status.wait_for(|s| s.state == state))
            .await
            .expect("state not reached")
            .expect("status channel closed");
    }

    #[tokio::test]
    async fn test_fixed_session_scenario() {
        let backend = MemoryBackend::new(ServiceType::Fixed, 30).with_statuses([
            OrderStatus::Created,
            OrderStatus::Paid,
            OrderStatus::Running,
            OrderStatus::Running,
            OrderStatus::Running,
            OrderStatus::Done,
        ]);
        let (result, peripheral, backend) = run_to_end(harness(backend), ServiceType::Fixed).await;

        let session = result.expect("session failed");
        assert_eq!(session.state, SessionState::Done);
        assert_eq!(session.authorized_seconds, 1800);
        assert!(session.started_at.is_some());
        assert!(session.ended_at.is_some());

        // Indicator on entering RUNNING, bounded ON on the first RUNNING poll, OFF on DONE
        assert_eq!(
            peripheral.applied(),
            vec![
                LedCommand::on(LedColor::Green, KEY),
                LedCommand::on_for(LedColor::Green, 1800, KEY),
                LedCommand::off_all(KEY),
            ]
        );
        assert_eq!(peripheral.max_outstanding(), 1);
        assert_eq!(
            backend.telemetry(),
            vec![TelemetryEvent::Started, TelemetryEvent::Done]
        );
        assert!(!peripheral.is_connected());

        // No polling once DONE was seen
        let polls = backend.polls();
        assert_eq!(polls, 6);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(backend.polls(), polls);
    }

    #[tokio::test]
    async fn test_command_table_per_service_type() {
        let cases = [
            (ServiceType::Trigger, LedCommand::blink_forever(LedColor::Blue, KEY)),
            (ServiceType::Fixed, LedCommand::on(LedColor::Green, KEY)),
            (ServiceType::Variable, LedCommand::on(LedColor::Amber, KEY)),
        ];

        for (service_type, indicator) in cases {
            let backend = MemoryBackend::new(service_type, 10)
                .with_statuses([OrderStatus::Paid, OrderStatus::Done]);
            let (result, peripheral, backend) = run_to_end(harness(backend), service_type).await;

            assert_eq!(result.expect("session failed").state, SessionState::Done);
            assert_eq!(
                peripheral.applied(),
                vec![indicator, LedCommand::off_all(KEY)],
                "{} command trace",
                service_type
            );
            assert_eq!(
                backend.telemetry(),
                vec![TelemetryEvent::Started, TelemetryEvent::Done]
            );
        }
    }

    #[tokio::test]
    async fn test_countdown_and_poll_send_done_once() {
        // TRIGGER sessions count down 2 ticks, racing the DONE poll
        let backend = MemoryBackend::new(ServiceType::Trigger, 1).with_statuses([
            OrderStatus::Running,
            OrderStatus::Running,
            OrderStatus::Running,
            OrderStatus::Done,
        ]);
        let (result, peripheral, backend) = run_to_end(harness(backend), ServiceType::Trigger).await;

        let session = result.expect("session failed");
        assert_eq!(session.authorized_seconds, 2);
        assert_eq!(
            backend.telemetry(),
            vec![TelemetryEvent::Started, TelemetryEvent::Done]
        );
        assert_eq!(
            peripheral.applied(),
            vec![
                LedCommand::blink_forever(LedColor::Blue, KEY),
                LedCommand::on_for(LedColor::Green, 2, KEY),
                LedCommand::off_all(KEY),
            ]
        );
    }

    #[tokio::test]
    async fn test_done_while_on_in_flight() {
        let backend = MemoryBackend::new(ServiceType::Fixed, 30)
            .with_statuses([OrderStatus::Running, OrderStatus::Done]);
        let peripheral =
            SimulatedPeripheral::new().with_completion_delay(Duration::from_millis(150));
        let (result, peripheral, _backend) =
            run_to_end(harness_with(backend, peripheral), ServiceType::Fixed).await;

        assert_eq!(result.expect("session failed").state, SessionState::Done);

        // The bounded ON queued behind the indicator is flushed by OFF
        let attempts = peripheral.attempts();
        assert_eq!(
            attempts,
            vec![LedCommand::on(LedColor::Green, KEY), LedCommand::off_all(KEY)]
        );
        assert_eq!(peripheral.max_outstanding(), 1);
    }

    #[tokio::test]
    async fn test_failed_order_moves_to_error() {
        let backend = MemoryBackend::new(ServiceType::Fixed, 30)
            .with_statuses([OrderStatus::Running, OrderStatus::Failed]);
        let (result, peripheral, backend) = run_to_end(harness(backend), ServiceType::Fixed).await;

        assert_eq!(
            result,
            Err(SessionError::Failed {
                status: OrderStatus::Failed
            })
        );
        assert_eq!(peripheral.applied().last(), Some(&LedCommand::off_all(KEY)));
        assert_eq!(
            backend.telemetry(),
            vec![TelemetryEvent::Started, TelemetryEvent::Error]
        );
    }

    #[tokio::test]
    async fn test_authorization_rejected() {
        let backend = MemoryBackend::new(ServiceType::Fixed, 30).reject("authorization");
        let harness = harness(backend);
        let session = harness
            .controller
            .place_order(&order(ServiceType::Fixed))
            .await
            .unwrap();
        let mut handle = harness.controller.start(session);
        let result = timeout(WAIT, handle.wait()).await.unwrap();

        assert!(matches!(
            result,
            Err(SessionError::Backend {
                stage: "authorization",
                ..
            })
        ));
        assert_eq!(handle.status().borrow().state, SessionState::Error);
        assert!(harness.peripheral.attempts().is_empty());
        assert!(harness.backend.telemetry().is_empty());
    }

    #[tokio::test]
    async fn test_verification_failure_turns_led_off() {
        let backend = MemoryBackend::new(ServiceType::Fixed, 30).with_signature("0402abcd");
        let (result, peripheral, backend) = run_to_end(harness(backend), ServiceType::Fixed).await;

        assert!(matches!(
            result,
            Err(SessionError::Verification(
                VerificationError::MalformedSignature(_)
            ))
        ));
        assert_eq!(peripheral.applied(), vec![LedCommand::off_all(KEY)]);
        assert!(backend.telemetry().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_peripheral() {
        let peripheral = SimulatedPeripheral::new();
        peripheral.set_reachable(false);
        let backend = MemoryBackend::new(ServiceType::Fixed, 30);
        let (result, peripheral, _backend) =
            run_to_end(harness_with(backend, peripheral), ServiceType::Fixed).await;

        assert!(matches!(
            result,
            Err(SessionError::Link(LinkError::NotFound(_)))
        ));
        assert_eq!(peripheral.connects(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_running() {
        let backend = MemoryBackend::new(ServiceType::Variable, 30)
            .with_statuses([OrderStatus::Running]);
        let harness = harness(backend);
        let session = harness
            .controller
            .place_order(&order(ServiceType::Variable))
            .await
            .unwrap();
        let mut handle = harness.controller.start(session);

        wait_for_state(&handle, SessionState::Running).await;
        handle.cancel();
        let result = timeout(WAIT, handle.wait()).await.unwrap();

        assert_eq!(result, Err(SessionError::Cancelled));
        assert_eq!(handle.status().borrow().state, SessionState::Error);
        assert_eq!(
            harness.peripheral.applied().last(),
            Some(&LedCommand::off_all(KEY))
        );
        assert_eq!(
            harness.backend.telemetry(),
            vec![TelemetryEvent::Started, TelemetryEvent::Error]
        );
        assert!(!harness.peripheral.is_connected());
    }

    #[tokio::test]
    async fn test_link_loss_reconnects_once() {
        let backend = MemoryBackend::new(ServiceType::Fixed, 30)
            .with_statuses([OrderStatus::Running]);
        let harness = harness(backend);
        let session = harness
            .controller
            .place_order(&order(ServiceType::Fixed))
            .await
            .unwrap();
        let mut handle = harness.controller.start(session);

        wait_for_state(&handle, SessionState::Running).await;
        harness.peripheral.drop_link("out of range");
        timeout(WAIT, async {
            while harness.peripheral.connects() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("no reconnect");

        harness.backend.push_status(OrderStatus::Done);
        let session = timeout(WAIT, handle.wait()).await.unwrap().expect("session failed");

        assert_eq!(session.state, SessionState::Done);
        assert_eq!(harness.peripheral.connects(), 2);
        assert_eq!(
            harness.peripheral.applied().last(),
            Some(&LedCommand::off_all(KEY))
        );
    }

    /// Start a session and, once RUNNING, drop the link with reconnects made slow
    async fn running_with_slow_reconnect(
        harness: Harness,
    ) -> (SessionHandle, SimulatedPeripheral, Arc<MemoryBackend>) {
        let session = harness
            .controller
            .place_order(&order(ServiceType::Fixed))
            .await
            .unwrap();
        let handle = harness.controller.start(session);
        wait_for_state(&handle, SessionState::Running).await;

        harness.peripheral.set_connect_delay(Duration::from_secs(3));
        harness.peripheral.drop_link("out of range");
        // Let the reconnect reach the worker
        tokio::time::sleep(Duration::from_millis(50)).await;
        (handle, harness.peripheral, harness.backend)
    }

    #[tokio::test]
    async fn test_cancel_during_slow_reconnect() {
        let backend = MemoryBackend::new(ServiceType::Fixed, 30)
            .with_statuses([OrderStatus::Running]);
        let (mut handle, peripheral, _backend) = running_with_slow_reconnect(harness(backend)).await;

        handle.cancel();
        let result = timeout(Duration::from_millis(500), handle.wait())
            .await
            .expect("cancel held up by reconnect");

        assert!(matches!(result, Err(SessionError::Cancelled)));
        assert_eq!(peripheral.connects(), 1);
        assert!(!peripheral.is_connected());
    }

    #[tokio::test]
    async fn test_done_during_slow_reconnect() {
        let backend = MemoryBackend::new(ServiceType::Fixed, 30)
            .with_statuses([OrderStatus::Running]);
        let (mut handle, peripheral, backend) = running_with_slow_reconnect(harness(backend)).await;

        backend.push_status(OrderStatus::Done);
        let session = timeout(Duration::from_millis(500), handle.wait())
            .await
            .expect("DONE held up by reconnect")
            .expect("session failed");

        assert_eq!(session.state, SessionState::Done);
        assert_eq!(peripheral.connects(), 1);
        assert!(!peripheral.is_connected());
        assert!(backend.telemetry().contains(&TelemetryEvent::Done));
    }

    #[tokio::test]
    async fn test_place_order_pays_for_session_length() {
        let harness = harness(MemoryBackend::new(ServiceType::Fixed, 30));
        let session = harness
            .controller
            .place_order(&order(ServiceType::Fixed))
            .await
            .unwrap();

        assert_eq!(session.session_id, ORDER_ID);
        assert_eq!(session.state, SessionState::Created);
        assert_eq!(session.authorized_seconds, 1800);

        let payments = harness.backend.payments();
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].duration_seconds, Some(1800));
        assert_eq!(payments[0].order_id.as_deref(), Some(ORDER_ID));
        assert!(!payments[0].skip_led);
    }

    #[tokio::test]
    async fn test_place_order_rejected() {
        let harness = harness(MemoryBackend::new(ServiceType::Fixed, 30).reject("payment"));
        let err = harness
            .controller
            .place_order(&order(ServiceType::Fixed))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Backend { stage: "payment", .. }));
    }
}
