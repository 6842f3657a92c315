//! # Correlation Table
//!
//! Pairs command replies with the callers waiting for them.
//!
//! Flow:
//! 1. The sending path calls [`CorrelationTable::register`] with the command's
//!    reference *before* publishing, so a reply racing the publish still finds
//!    its slot.
//! 2. The reply consumer calls [`CorrelationTable::complete`] with the
//!    `correlation_id` of the RESPONSE or ERROR.
//! 3. The caller awaits the receiver, bounded by its timeout.
//!
//! Replies for references that are no longer pending (timed out, cancelled,
//! never sent from here) are discarded.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ddd_telemetry::metrics::PENDING_REQUESTS;
use ddd_types::{CommandResponse, DomainError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

/// What a pending command resolves to.
pub type Reply = Result<CommandResponse, DomainError>;

/// A command waiting for its reply.
struct PendingRequest {
    sender: oneshot::Sender<Reply>,
    created_at: Instant,
    /// Class key of the command (for logging).
    command: String,
    /// `None` waits forever; the sweep only removes it once the caller is gone.
    timeout: Option<Duration>,
}

/// Reference → reply slot map shared by the send path and the reply consumer.
#[derive(Default)]
pub struct CorrelationTable {
    pending: DashMap<Uuid, PendingRequest>,
}

/// Removes the pending entry when the waiting caller goes away.
///
/// Completion removes the entry first, so dropping the guard afterwards is a
/// no-op.
pub struct PendingGuard {
    table: Arc<CorrelationTable>,
    reference: Uuid,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.table.cancel(&self.reference);
    }
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot for `reference`.
    ///
    /// Returns `None` if the reference is already pending.
    pub fn register(
        self: &Arc<Self>,
        reference: Uuid,
        command: &str,
        timeout: Option<Duration>,
    ) -> Option<(PendingGuard, oneshot::Receiver<Reply>)> {
        let (tx, rx) = oneshot::channel();

        match self.pending.entry(reference) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(slot) => {
                slot.insert(PendingRequest {
                    sender: tx,
                    created_at: Instant::now(),
                    command: command.to_string(),
                    timeout,
                });
            }
        }
        PENDING_REQUESTS.inc();

        debug!(%reference, command, "Registered pending request");

        let guard = PendingGuard {
            table: Arc::clone(self),
            reference,
        };
        Some((guard, rx))
    }

    /// Resolves the slot for `reference`.
    ///
    /// Returns false when the reference is unknown or its caller is gone.
    pub fn complete(&self, reference: Uuid, reply: Reply) -> bool {
        let Some((_, pending)) = self.pending.remove(&reference) else {
            debug!(%reference, "Discarding reply for unknown or expired reference");
            return false;
        };
        PENDING_REQUESTS.dec();

        let elapsed = pending.created_at.elapsed();
        if pending.sender.send(reply).is_err() {
            debug!(%reference, command = pending.command, "Pending request receiver dropped");
            return false;
        }

        debug!(
            %reference,
            command = pending.command,
            elapsed_ms = elapsed.as_millis() as u64,
            "Completed pending request"
        );
        true
    }

    /// Drops the slot for `reference`. Its receiver observes a closed channel.
    pub fn cancel(&self, reference: &Uuid) -> bool {
        if self.pending.remove(reference).is_some() {
            PENDING_REQUESTS.dec();
            true
        } else {
            false
        }
    }

    /// Drops every slot. Waiting callers observe a closed channel.
    pub fn cancel_all(&self) -> usize {
        let references: Vec<Uuid> = self.pending.iter().map(|entry| *entry.key()).collect();
        references
            .iter()
            .filter(|reference| self.cancel(reference))
            .count()
    }

    /// Removes entries past their timeout or whose caller is gone.
    ///
    /// Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        self.pending.retain(|reference, request| {
            let expired = request
                .timeout
                .is_some_and(|timeout| now.duration_since(request.created_at) > timeout);
            if expired || request.sender.is_closed() {
                debug!(
                    %reference,
                    command = request.command,
                    expired,
                    "Sweeping orphaned pending request"
                );
                removed += 1;
                false
            } else {
                true
            }
        });

        if removed > 0 {
            PENDING_REQUESTS.sub(removed as f64);
        }
        removed
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, reference: &Uuid) -> bool {
        self.pending.contains_key(reference)
    }
}

/// Periodically sweeps orphaned entries until the task is aborted.
pub async fn sweep_task(table: Arc<CorrelationTable>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        let removed = table.sweep();
        if removed > 0 {
            debug!(removed, "Swept orphaned pending requests");
        }
    }
}
