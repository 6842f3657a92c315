//! Message types and bus builders shared by the integration tests.

use ddd_bus::{
    command_handler, event_handler, BusConfig, CommandHandler, CommandResponse, DomainMessageBus,
    ErrorClass, EventHandler, HandlerError, InMemoryBroker, Message,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// BILLING
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateInvoice {
    pub amount: u64,
}
ddd_types::domain_command!(CreateInvoice, "billing");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundInvoice {
    pub amount: u64,
}
ddd_types::domain_command!(RefundInvoice, "billing");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceCreated {
    pub invoice: u64,
    pub amount: u64,
}
ddd_types::domain_event!(InvoiceCreated, "billing");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoicePaid {
    pub invoice: u64,
}
ddd_types::domain_event!(InvoicePaid, "billing");

pub const INSUFFICIENT_FUNDS: ErrorClass = ErrorClass::new(
    "billing",
    "InsufficientFundsError",
    "0102",
    "Insufficient funds: {amount} requested",
);

// =============================================================================
// OTHER DOMAINS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipOrder {
    pub order: u64,
}
ddd_types::domain_command!(ShipOrder, "shipping");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReserveStock {
    pub sku: String,
}
ddd_types::domain_command!(ReserveStock, "inventory");

// =============================================================================
// HARNESS
// =============================================================================

/// One broker shared by every bus a test builds.
#[derive(Clone, Default)]
pub struct Harness {
    pub broker: InMemoryBroker,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(domain: &str) -> BusConfig {
        BusConfig::new(domain).with_permanent_consume(false)
    }

    /// Unstarted bus for `domain`.
    pub fn bus(&self, domain: &str) -> DomainMessageBus {
        DomainMessageBus::new(Self::config(domain), Arc::new(self.broker.clone()))
    }

    /// Billing bus serving `CreateInvoice` with `handler` for `allowed`
    /// callers, and `RefundInvoice` for `orders` only.
    pub fn billing(&self, handler: Arc<dyn CommandHandler>, allowed: &[&str]) -> DomainMessageBus {
        let mut bus = self.bus("billing");
        bus.register_command::<CreateInvoice, _>(Some(handler), allowed.iter().copied())
            .unwrap();
        bus.register_command::<RefundInvoice, _>(Some(accepting_handler()), ["orders"])
            .unwrap();
        bus.register_error(INSUFFICIENT_FUNDS).unwrap();
        bus
    }

    /// Bus for `domain` that may send billing commands.
    pub fn billing_client(&self, domain: &str) -> DomainMessageBus {
        let mut bus = self.bus(domain);
        bus.register_command::<CreateInvoice, String>(None, []).unwrap();
        bus.register_command::<RefundInvoice, String>(None, []).unwrap();
        bus.register_error(INSUFFICIENT_FUNDS).unwrap();
        bus
    }
}

// =============================================================================
// HANDLERS
// =============================================================================

/// Answers every `RefundInvoice` with an empty response.
pub fn accepting_handler() -> Arc<dyn CommandHandler> {
    command_handler(|cmd: Message<RefundInvoice>| async move {
        Ok::<_, HandlerError>(CommandResponse::new(cmd.reference, None))
    })
}

/// Answers `CreateInvoice` after `amount` milliseconds, counting calls.
pub fn invoicing_handler(calls: Arc<AtomicUsize>) -> Arc<dyn CommandHandler> {
    command_handler(move |cmd: Message<CreateInvoice>| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(cmd.data.amount)).await;
            Ok::<_, HandlerError>(CommandResponse::new(cmd.reference, None))
        }
    })
}

/// Records every delivered event of type `E`.
pub fn recording_handler<E>(seen: Arc<Mutex<Vec<Message<E>>>>) -> Arc<dyn EventHandler>
where
    E: ddd_bus::DomainPayload,
{
    event_handler(move |event: Message<E>| {
        let seen = seen.clone();
        async move {
            seen.lock().push(event);
            Ok::<(), HandlerError>(())
        }
    })
}

/// Polls `check` for up to a second.
pub async fn wait_until(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
