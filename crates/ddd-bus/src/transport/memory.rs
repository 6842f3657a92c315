//! # In-Memory Broker
//!
//! An in-process broker with the AMQP semantics the bus relies on:
//!
//! - one isolated namespace per virtual host;
//! - topic/direct exchanges plus the default exchange (`""`), which routes to
//!   the queue named by the routing key;
//! - exclusive queues owned by their connection, auto-delete queues removed
//!   with their last consumer, server-named `amq.gen-*` queues;
//! - round-robin delivery across competing consumers, with a backlog while a
//!   queue has none;
//! - `user_id` must equal the connection user, as RabbitMQ enforces;
//! - per-consumer prefetch bounding concurrent deliveries.
//!
//! Deliveries are acknowledged as soon as they are handed to a consumer, so
//! `no_ack` makes no difference here.
//!
//! Test hooks: [`InMemoryBroker::refuse_vhost`] makes connections to a
//! virtual host fail, and the inspection methods expose queues, bindings and
//! open connections.

use super::{
    topic_matches, Broker, BrokerChannel, BrokerConnection, ConsumeOptions, DeliveryHandler,
    ExchangeKind, QueueOptions, TransportError,
};
use crate::envelope::Envelope;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

// =============================================================================
// BROKER STATE
// =============================================================================

#[derive(Default)]
struct BrokerState {
    vhosts: Mutex<HashMap<String, VirtualHost>>,
    refused: Mutex<HashMap<String, String>>,
    open_connections: AtomicUsize,
    next_id: AtomicU64,
}

impl BrokerState {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Default)]
struct VirtualHost {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    published: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

struct Queue {
    options: QueueOptions,
    owner: u64,
    consumers: Vec<ConsumerSlot>,
    backlog: VecDeque<Envelope>,
    next_consumer: usize,
}

struct ConsumerSlot {
    tag: String,
    connection: u64,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Queue {
    fn accessible_by(&self, connection: u64) -> bool {
        !self.options.exclusive || self.owner == connection
    }

    /// Hands the envelope to the next live consumer, or parks it.
    fn deliver(&mut self, mut envelope: Envelope) {
        while !self.consumers.is_empty() {
            let index = self.next_consumer % self.consumers.len();
            self.next_consumer = index + 1;
            match self.consumers[index].tx.send(envelope) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    self.consumers.remove(index);
                    envelope = returned;
                }
            }
        }
        self.backlog.push_back(envelope);
    }
}

impl VirtualHost {
    fn route(&mut self, exchange: &str, envelope: Envelope) -> Result<usize, TransportError> {
        let targets: BTreeSet<String> = if exchange.is_empty() {
            self.queues
                .contains_key(&envelope.routing_key)
                .then(|| envelope.routing_key.clone())
                .into_iter()
                .collect()
        } else {
            let kind = *self
                .exchanges
                .get(exchange)
                .ok_or_else(|| TransportError::ExchangeNotFound(exchange.to_string()))?;
            self.bindings
                .iter()
                .filter(|binding| binding.exchange == exchange)
                .filter(|binding| match kind {
                    ExchangeKind::Topic => topic_matches(&binding.routing_key, &envelope.routing_key),
                    ExchangeKind::Direct => binding.routing_key == envelope.routing_key,
                })
                .map(|binding| binding.queue.clone())
                .collect()
        };

        self.published += 1;
        if targets.is_empty() {
            trace!(exchange, routing_key = %envelope.routing_key, "Unroutable envelope dropped");
        }
        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.deliver(envelope.clone());
            }
        }
        Ok(targets.len())
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        self.bindings.retain(|binding| binding.queue != name);
        debug!(queue = name, "Queue deleted");
    }

    /// Removes a consumer; an auto-delete queue goes with its last consumer.
    fn remove_consumer(&mut self, queue_name: &str, tag: &str) {
        let delete = match self.queues.get_mut(queue_name) {
            Some(queue) => {
                queue.consumers.retain(|slot| slot.tag != tag);
                queue.options.auto_delete && queue.consumers.is_empty()
            }
            None => false,
        };
        if delete {
            self.delete_queue(queue_name);
        }
    }

    /// Drops everything `connection` owned.
    fn release_connection(&mut self, connection: u64) {
        let mut doomed = Vec::new();
        for (name, queue) in &mut self.queues {
            let had_consumers = !queue.consumers.is_empty();
            queue.consumers.retain(|slot| slot.connection != connection);
            let orphaned = had_consumers && queue.consumers.is_empty() && queue.options.auto_delete;
            let owned = queue.options.exclusive && queue.owner == connection;
            if orphaned || owned {
                doomed.push(name.clone());
            }
        }
        for name in doomed {
            self.delete_queue(&name);
        }
    }
}

// =============================================================================
// BROKER
// =============================================================================

/// In-process broker. Clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes future connections to `vhost` fail with `reason`.
    pub fn refuse_vhost(&self, vhost: &str, reason: &str) {
        self.state
            .refused
            .lock()
            .insert(vhost.to_string(), reason.to_string());
    }

    /// Undoes [`InMemoryBroker::refuse_vhost`].
    pub fn accept_vhost(&self, vhost: &str) {
        self.state.refused.lock().remove(vhost);
    }

    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::SeqCst)
    }

    /// Queue names of `vhost`, sorted.
    pub fn queue_names(&self, vhost: &str) -> Vec<String> {
        let vhosts = self.state.vhosts.lock();
        let mut names: Vec<String> = vhosts
            .get(vhost)
            .map(|v| v.queues.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn consumer_count(&self, vhost: &str, queue: &str) -> usize {
        self.with_queue(vhost, queue, |q| q.consumers.len())
            .unwrap_or_default()
    }

    /// Envelopes parked in `queue` for lack of consumers.
    pub fn queue_depth(&self, vhost: &str, queue: &str) -> usize {
        self.with_queue(vhost, queue, |q| q.backlog.len())
            .unwrap_or_default()
    }

    /// `(exchange, routing key)` bindings of `queue`, sorted.
    pub fn bindings(&self, vhost: &str, queue: &str) -> Vec<(String, String)> {
        let vhosts = self.state.vhosts.lock();
        let mut bindings: Vec<(String, String)> = vhosts
            .get(vhost)
            .map(|v| {
                v.bindings
                    .iter()
                    .filter(|b| b.queue == queue)
                    .map(|b| (b.exchange.clone(), b.routing_key.clone()))
                    .collect()
            })
            .unwrap_or_default();
        bindings.sort();
        bindings
    }

    /// Number of publishes accepted by `vhost`.
    pub fn published(&self, vhost: &str) -> u64 {
        self.state
            .vhosts
            .lock()
            .get(vhost)
            .map(|v| v.published)
            .unwrap_or_default()
    }

    /// Publishes without a connection, bypassing the `user_id` check.
    /// Returns the number of queues the envelope was routed to.
    pub fn inject(
        &self,
        vhost: &str,
        exchange: &str,
        envelope: Envelope,
    ) -> Result<usize, TransportError> {
        self.state
            .vhosts
            .lock()
            .entry(vhost.to_string())
            .or_default()
            .route(exchange, envelope)
    }

    fn with_queue<R>(&self, vhost: &str, queue: &str, f: impl FnOnce(&Queue) -> R) -> Option<R> {
        let vhosts = self.state.vhosts.lock();
        vhosts.get(vhost).and_then(|v| v.queues.get(queue)).map(f)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn connect(
        &self,
        vhost: &str,
        user: &str,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        if let Some(reason) = self.state.refused.lock().get(vhost) {
            return Err(TransportError::ConnectionRefused {
                vhost: vhost.to_string(),
                reason: reason.clone(),
            });
        }

        self.state.vhosts.lock().entry(vhost.to_string()).or_default();
        self.state.open_connections.fetch_add(1, Ordering::SeqCst);
        let id = self.state.next_id();
        debug!(vhost, user, connection = id, "Connection opened");

        Ok(Arc::new(MemoryConnection {
            shared: Arc::new(ConnectionShared {
                state: Arc::clone(&self.state),
                id,
                vhost: vhost.to_string(),
                user: user.to_string(),
                closed: AtomicBool::new(false),
                consumers: Mutex::new(HashMap::new()),
            }),
        }))
    }
}

// =============================================================================
// CONNECTION & CHANNEL
// =============================================================================

struct ConsumerTask {
    queue: String,
    task: JoinHandle<()>,
}

struct ConnectionShared {
    state: Arc<BrokerState>,
    id: u64,
    vhost: String,
    user: String,
    closed: AtomicBool,
    consumers: Mutex<HashMap<String, ConsumerTask>>,
}

impl ConnectionShared {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TransportError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn with_vhost<R>(&self, f: impl FnOnce(&mut VirtualHost) -> R) -> R {
        let mut vhosts = self.state.vhosts.lock();
        f(vhosts.entry(self.vhost.clone()).or_default())
    }
}

struct MemoryConnection {
    shared: Arc<ConnectionShared>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        self.shared.ensure_open()?;
        Ok(Arc::new(MemoryChannel {
            shared: Arc::clone(&self.shared),
            prefetch: AtomicU16::new(0),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let consumers: Vec<ConsumerTask> = self
            .shared
            .consumers
            .lock()
            .drain()
            .map(|(_, consumer)| consumer)
            .collect();
        for consumer in consumers {
            consumer.task.abort();
        }

        let id = self.shared.id;
        self.shared.with_vhost(|vhost| vhost.release_connection(id));
        self.shared.state.open_connections.fetch_sub(1, Ordering::SeqCst);
        debug!(vhost = %self.shared.vhost, connection = id, "Connection closed");
        Ok(())
    }
}

struct MemoryChannel {
    shared: Arc<ConnectionShared>,
    prefetch: AtomicU16,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError> {
        self.shared.ensure_open()?;
        self.shared.with_vhost(|vhost| {
            match vhost.exchanges.get(name) {
                Some(existing) if *existing != kind => {
                    return Err(TransportError::PreconditionFailed(format!(
                        "exchange {name} already declared as {existing:?}"
                    )))
                }
                Some(_) => {}
                None => {
                    vhost.exchanges.insert(name.to_string(), kind);
                }
            }
            Ok(())
        })
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, TransportError> {
        self.shared.ensure_open()?;
        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };
        let connection = self.shared.id;

        self.shared.with_vhost(|vhost| {
            if let Some(existing) = vhost.queues.get(&name) {
                if !existing.accessible_by(connection) {
                    return Err(TransportError::ResourceLocked(name.clone()));
                }
                if existing.options != options {
                    return Err(TransportError::PreconditionFailed(format!(
                        "queue {name} already declared with {:?}",
                        existing.options
                    )));
                }
                return Ok(name.clone());
            }

            vhost.queues.insert(
                name.clone(),
                Queue {
                    options,
                    owner: connection,
                    consumers: Vec::new(),
                    backlog: VecDeque::new(),
                    next_consumer: 0,
                },
            );
            Ok(name.clone())
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.shared.ensure_open()?;
        let connection = self.shared.id;

        self.shared.with_vhost(|vhost| {
            let target = vhost
                .queues
                .get(queue)
                .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;
            if !target.accessible_by(connection) {
                return Err(TransportError::ResourceLocked(queue.to_string()));
            }
            if !vhost.exchanges.contains_key(exchange) {
                return Err(TransportError::ExchangeNotFound(exchange.to_string()));
            }

            let binding = Binding {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                queue: queue.to_string(),
            };
            if !vhost.bindings.contains(&binding) {
                vhost.bindings.push(binding);
            }
            Ok(())
        })
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.shared.ensure_open()?;
        self.prefetch.store(count, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<(), TransportError> {
        self.shared.ensure_open()?;
        if let Some(claimed) = envelope.publisher() {
            if claimed != self.shared.user {
                return Err(TransportError::PreconditionFailed(format!(
                    "user_id {claimed} does not match authenticated user {}",
                    self.shared.user
                )));
            }
        }

        let routed = self.shared.with_vhost(|vhost| vhost.route(exchange, envelope))?;
        trace!(vhost = %self.shared.vhost, exchange, routed, "Envelope published");
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        _options: ConsumeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, TransportError> {
        self.shared.ensure_open()?;
        let tag = format!("ctag-{}", self.shared.state.next_id());
        let connection = self.shared.id;
        let (tx, rx) = mpsc::unbounded_channel();

        self.shared.with_vhost(|vhost| {
            let target = vhost
                .queues
                .get_mut(queue)
                .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;
            if !target.accessible_by(connection) {
                return Err(TransportError::ResourceLocked(queue.to_string()));
            }
            while let Some(parked) = target.backlog.pop_front() {
                // The receiver is alive until this function returns.
                let _ = tx.send(parked);
            }
            target.consumers.push(ConsumerSlot {
                tag: tag.clone(),
                connection,
                tx,
            });
            Ok(())
        })?;

        let prefetch = self.prefetch.load(Ordering::SeqCst);
        let task = tokio::spawn(consumer_loop(rx, handler, prefetch));
        self.shared.consumers.lock().insert(
            tag.clone(),
            ConsumerTask {
                queue: queue.to_string(),
                task,
            },
        );

        debug!(vhost = %self.shared.vhost, queue, consumer_tag = %tag, prefetch, "Consumer started");
        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let Some(consumer) = self.shared.consumers.lock().remove(consumer_tag) else {
            return Ok(());
        };
        consumer.task.abort();
        self.shared
            .with_vhost(|vhost| vhost.remove_consumer(&consumer.queue, consumer_tag));
        debug!(vhost = %self.shared.vhost, queue = %consumer.queue, consumer_tag, "Consumer cancelled");
        Ok(())
    }
}

/// Runs each delivery as its own task, at most `prefetch` at a time.
async fn consumer_loop(
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    handler: Arc<dyn DeliveryHandler>,
    prefetch: u16,
) {
    let permits = (prefetch > 0).then(|| Arc::new(Semaphore::new(usize::from(prefetch))));

    while let Some(envelope) = rx.recv().await {
        let permit = match &permits {
            Some(semaphore) => match Arc::clone(semaphore).acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => break,
            },
            None => None,
        };
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            handler.on_delivery(envelope).await;
            drop(permit);
        });
    }
}
