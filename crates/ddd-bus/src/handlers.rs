//! # Handlers
//!
//! Application callbacks invoked by the bus, and the single boundary where
//! their failures become wire-safe data.
//!
//! Handlers receive the type-erased [`DomainMessage`]. The [`command_handler`]
//! and [`event_handler`] adapters wrap typed closures so application code
//! works with `Message<T>` directly:
//!
//! ```rust,ignore
//! let handler = command_handler(|cmd: Message<CreateInvoice>| async move {
//!     let invoice = invoices.create(cmd.data.amount).await?;
//!     Ok(CommandResponse::new(cmd.reference, Some(invoice.id)))
//! });
//! ```

use async_trait::async_trait;
use ddd_telemetry::metrics::HANDLER_FAILURES;
use ddd_types::{
    CommandResponse, DomainError, DomainMessage, DomainPayload, Message, INTERNAL_SERVICE_ERROR,
};
use futures::FutureExt;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

/// How a handler can fail.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// A declared domain error; sent to the caller as-is.
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Anything else; the caller sees an internal service error.
    #[error("Unclassified handler failure: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Handles one command type of the local domain.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: DomainMessage) -> Result<CommandResponse, HandlerError>;
}

/// Handles one event type, own or foreign.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: DomainMessage) -> Result<(), HandlerError>;
}

// =============================================================================
// TYPED ADAPTERS
// =============================================================================

struct FnCommandHandler<C, F> {
    f: F,
    _payload: PhantomData<fn(C)>,
}

#[async_trait]
impl<C, F, Fut> CommandHandler for FnCommandHandler<C, F>
where
    C: DomainPayload,
    F: Fn(Message<C>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CommandResponse, HandlerError>> + Send,
{
    async fn handle(&self, command: DomainMessage) -> Result<CommandResponse, HandlerError> {
        let typed = command.downcast::<C>().cloned().ok_or_else(|| {
            anyhow::anyhow!(
                "handler for {} received {}",
                C::class_key(),
                command.class_key()
            )
        })?;
        (self.f)(typed).await
    }
}

/// Wraps a typed async closure as a [`CommandHandler`].
pub fn command_handler<C, F, Fut>(f: F) -> Arc<dyn CommandHandler>
where
    C: DomainPayload,
    F: Fn(Message<C>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CommandResponse, HandlerError>> + Send + 'static,
{
    Arc::new(FnCommandHandler {
        f,
        _payload: PhantomData,
    })
}

struct FnEventHandler<E, F> {
    f: F,
    _payload: PhantomData<fn(E)>,
}

#[async_trait]
impl<E, F, Fut> EventHandler for FnEventHandler<E, F>
where
    E: DomainPayload,
    F: Fn(Message<E>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: DomainMessage) -> Result<(), HandlerError> {
        let typed = event.downcast::<E>().cloned().ok_or_else(|| {
            anyhow::anyhow!(
                "handler for {} received {}",
                E::class_key(),
                event.class_key()
            )
        })?;
        (self.f)(typed).await
    }
}

/// Wraps a typed async closure as an [`EventHandler`].
pub fn event_handler<E, F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    E: DomainPayload,
    F: Fn(Message<E>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnEventHandler {
        f,
        _payload: PhantomData,
    })
}

// =============================================================================
// EXECUTION BOUNDARY
// =============================================================================

/// Runs a command handler and converts every outcome into a reply.
///
/// The reply always carries the command's reference. Unclassified failures
/// and panics become [`INTERNAL_SERVICE_ERROR`]; nothing escapes.
pub async fn execute_command(
    handler: &Arc<dyn CommandHandler>,
    command: DomainMessage,
) -> Result<CommandResponse, DomainError> {
    let reference = command.reference();
    let key = command.class_key();

    match AssertUnwindSafe(handler.handle(command)).catch_unwind().await {
        Ok(Ok(response)) => Ok(response.with_reference(reference)),
        Ok(Err(HandlerError::Domain(err))) => {
            HANDLER_FAILURES
                .with_label_values(&["command", "domain_error"])
                .inc();
            Err(err.with_reference(reference))
        }
        Ok(Err(HandlerError::Internal(err))) => {
            HANDLER_FAILURES
                .with_label_values(&["command", "internal"])
                .inc();
            warn!(command = %key, %reference, error = %err, "Command handler failed");
            Err(INTERNAL_SERVICE_ERROR.raise().with_reference(reference))
        }
        Err(_) => {
            HANDLER_FAILURES
                .with_label_values(&["command", "panic"])
                .inc();
            error!(command = %key, %reference, "Command handler panicked");
            Err(INTERNAL_SERVICE_ERROR.raise().with_reference(reference))
        }
    }
}

/// Runs every handler for an event in order.
///
/// A failing or panicking handler is logged and does not stop the others.
/// Returns the number of handlers that failed.
pub async fn dispatch_event(handlers: &[Arc<dyn EventHandler>], event: &DomainMessage) -> usize {
    let mut failures = 0;
    for handler in handlers {
        let outcome = AssertUnwindSafe(handler.handle(event.clone()))
            .catch_unwind()
            .await;
        let label = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(HandlerError::Domain(err))) => {
                warn!(event = %event.class_key(), reference = %event.reference(), error = %err, "Event handler failed");
                "domain_error"
            }
            Ok(Err(HandlerError::Internal(err))) => {
                warn!(event = %event.class_key(), reference = %event.reference(), error = %err, "Event handler failed");
                "internal"
            }
            Err(_) => {
                error!(event = %event.class_key(), reference = %event.reference(), "Event handler panicked");
                "panic"
            }
        };
        HANDLER_FAILURES.with_label_values(&["event", label]).inc();
        failures += 1;
    }
    failures
}
