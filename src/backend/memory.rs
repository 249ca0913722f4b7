//! Scripted in-memory backend for tests

use async_trait::async_trait;
use remoteled_shared::api::{
    Authorization, AuthorizationPayload, CreateOrderRequest, Order, PaymentReceipt,
    PaymentRequest, TelemetryEvent, TelemetryRequest,
};
use remoteled_shared::{now_secs, OrderStatus, ServiceType};
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{Backend, BackendError};

pub const ORDER_ID: &str = "ord-1";
pub const DEVICE_ID: &str = "dev-1";

struct State {
    service_type: ServiceType,
    authorized_minutes: u32,
    /// Answers for successive polls; the last status repeats once exhausted
    statuses: VecDeque<Result<OrderStatus, BackendError>>,
    last_status: OrderStatus,
    rejected: HashSet<&'static str>,
    signature_hex: String,
    poll_delay: Duration,
    polls: usize,
    in_flight: usize,
    max_in_flight: usize,
    telemetry: Vec<TelemetryRequest>,
    payments: Vec<PaymentRequest>,
}

pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new(service_type: ServiceType, authorized_minutes: u32) -> Self {
        Self {
            state: Mutex::new(State {
                service_type,
                authorized_minutes,
                statuses: VecDeque::new(),
                last_status: OrderStatus::Paid,
                rejected: HashSet::new(),
                signature_hex: "3045022100aabbccdd".into(),
                poll_delay: Duration::ZERO,
                polls: 0,
                in_flight: 0,
                max_in_flight: 0,
                telemetry: Vec::new(),
                payments: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn with_statuses(self, statuses: impl IntoIterator<Item = OrderStatus>) -> Self {
        self.lock().statuses.extend(statuses.into_iter().map(Ok));
        self
    }

    pub fn push_poll_error(&self, err: BackendError) {
        self.lock().statuses.push_back(Err(err));
    }

    pub fn push_status(&self, status: OrderStatus) {
        self.lock().statuses.push_back(Ok(status));
    }

    /// Reject one stage: `create_order`, `authorization`, `payment`, `telemetry`
    pub fn reject(self, stage: &'static str) -> Self {
        self.lock().rejected.insert(stage);
        self
    }

    pub fn with_signature(self, signature_hex: &str) -> Self {
        self.lock().signature_hex = signature_hex.to_string();
        self
    }

    pub fn with_poll_delay(self, delay: Duration) -> Self {
        self.lock().poll_delay = delay;
        self
    }

    pub fn polls(&self) -> usize {
        self.lock().polls
    }

    pub fn max_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    pub fn telemetry(&self) -> Vec<TelemetryEvent> {
        self.lock().telemetry.iter().map(|t| t.event).collect()
    }

    pub fn telemetry_requests(&self) -> Vec<TelemetryRequest> {
        self.lock().telemetry.clone()
    }

    pub fn payments(&self) -> Vec<PaymentRequest> {
        self.lock().payments.clone()
    }

    fn check(&self, stage: &'static str) -> Result<(), BackendError> {
        if self.lock().rejected.contains(stage) {
            return Err(BackendError::Rejected {
                status: 400,
                message: format!("{} rejected", stage),
            });
        }
        Ok(())
    }

    fn order(&self, status: OrderStatus) -> Order {
        let state = self.lock();
        Order {
            id: ORDER_ID.into(),
            device_id: DEVICE_ID.into(),
            service_id: Some("svc-1".into()),
            amount_cents: 250,
            authorized_minutes: state.authorized_minutes,
            status,
            created_at: None,
            updated_at: None,
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn create_order(&self, request: &CreateOrderRequest) -> Result<Order, BackendError> {
        self.check("create_order")?;
        let mut order = self.order(OrderStatus::Created);
        order.device_id = request.device_id.clone();
        order.amount_cents = request.amount_cents;
        Ok(order)
    }

    async fn get_order(&self, _order_id: &str) -> Result<Order, BackendError> {
        let delay = {
            let mut state = self.lock();
            state.polls += 1;
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            state.poll_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let next = {
            let mut state = self.lock();
            state.in_flight -= 1;
            match state.statuses.pop_front() {
                Some(Ok(status)) => {
                    state.last_status = status;
                    Ok(status)
                }
                Some(Err(e)) => Err(e),
                None => Ok(state.last_status),
            }
        };
        next.map(|status| self.order(status))
    }

    async fn create_authorization(&self, order_id: &str) -> Result<Authorization, BackendError> {
        self.check("authorization")?;
        let state = self.lock();
        let seconds = match state.service_type {
            ServiceType::Trigger => 2,
            _ => state.authorized_minutes * 60,
        };
        Ok(Authorization {
            id: "auth-1".into(),
            order_id: order_id.into(),
            device_id: DEVICE_ID.into(),
            payload: AuthorizationPayload {
                device_id: DEVICE_ID.into(),
                order_id: order_id.into(),
                service_type: state.service_type,
                seconds,
                nonce: "0f1e2d3c".into(),
                exp: now_secs() + 300,
            },
            signature_hex: state.signature_hex.clone(),
            expires_at: None,
            created_at: None,
        })
    }

    async fn trigger_payment(
        &self,
        request: &PaymentRequest,
    ) -> Result<PaymentReceipt, BackendError> {
        self.check("payment")?;
        self.lock().payments.push(request.clone());
        Ok(PaymentReceipt {
            payment_intent_id: "pi_test".into(),
            amount_cents: request.amount_cents,
            payment_status: "succeeded".into(),
            led_triggered: false,
        })
    }

    async fn send_telemetry(
        &self,
        _device_id: &str,
        request: &TelemetryRequest,
    ) -> Result<(), BackendError> {
        self.lock().telemetry.push(request.clone());
        self.check("telemetry")
    }
}
