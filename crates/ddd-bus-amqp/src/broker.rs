//! RabbitMQ broker over lapin.

use crate::properties::{envelope_of, to_basic_properties};
use async_trait::async_trait;
use ddd_bus::{
    Broker, BrokerChannel, BrokerConnection, BusConfig, ConsumeOptions, DeliveryHandler, Envelope,
    ExchangeKind, QueueOptions, TransportError,
};
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::AMQPUri;
use lapin::{Channel, Connection, ConnectionProperties};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reply code for a normal connection close.
const REPLY_SUCCESS: u16 = 200;

fn channel_error(e: lapin::Error) -> TransportError {
    TransportError::Channel(e.to_string())
}

/// Connects to RabbitMQ virtual hosts.
#[derive(Debug, Clone)]
pub struct AmqpBroker {
    base: AMQPUri,
    password: Option<String>,
}

impl AmqpBroker {
    /// Broker at `url`. The URL's virtual host and user are replaced on each
    /// connect; `password`, when set, replaces the URL's password.
    pub fn new(url: &str, password: Option<String>) -> Result<Self, TransportError> {
        let base = AMQPUri::from_str(url).map_err(|reason| TransportError::ConnectionRefused {
            vhost: String::new(),
            reason: format!("invalid broker url: {reason}"),
        })?;
        Ok(Self { base, password })
    }

    pub fn from_config(config: &BusConfig) -> Result<Self, TransportError> {
        Self::new(&config.broker_url, config.password.clone())
    }

    /// URI for `vhost`, authenticated as `user`.
    pub fn uri_for(&self, vhost: &str, user: &str) -> AMQPUri {
        let mut uri = self.base.clone();
        uri.vhost = vhost.to_string();
        uri.authority.userinfo.username = user.to_string();
        if let Some(password) = &self.password {
            uri.authority.userinfo.password = password.clone();
        }
        uri
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(
        &self,
        vhost: &str,
        user: &str,
    ) -> Result<Arc<dyn BrokerConnection>, TransportError> {
        let uri = self.uri_for(vhost, user);
        let connection = Connection::connect_uri(uri, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::ConnectionRefused {
                vhost: vhost.to_string(),
                reason: e.to_string(),
            })?;
        info!(vhost, user, "RabbitMQ connected");

        Ok(Arc::new(AmqpConnection {
            vhost: vhost.to_string(),
            connection,
            consumers: Arc::new(Mutex::new(HashMap::new())),
        }))
    }
}

type ConsumerTasks = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

struct AmqpConnection {
    vhost: String,
    connection: Connection,
    /// Consumer loops of every channel on this connection.
    consumers: ConsumerTasks,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, TransportError> {
        let channel = self.connection.create_channel().await.map_err(channel_error)?;
        Ok(Arc::new(AmqpChannel {
            channel,
            consumers: Arc::clone(&self.consumers),
        }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        let tasks: Vec<JoinHandle<()>> = self.consumers.lock().drain().map(|(_, task)| task).collect();
        for task in tasks {
            task.abort();
        }

        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| match e {
                lapin::Error::InvalidConnectionState(_) => TransportError::ConnectionClosed,
                other => channel_error(other),
            })?;
        debug!(vhost = %self.vhost, "RabbitMQ connection closed");
        Ok(())
    }
}

struct AmqpChannel {
    channel: Channel,
    consumers: ConsumerTasks,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), TransportError> {
        let kind = match kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        };
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<String, TransportError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), TransportError> {
        self.channel
            .basic_qos(count, BasicQosOptions::default())
            .await
            .map_err(channel_error)
    }

    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<(), TransportError> {
        let properties = to_basic_properties(&envelope.properties);
        self.channel
            .basic_publish(
                exchange,
                &envelope.routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumeOptions,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<String, TransportError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(channel_error)?;
        let tag = consumer.tag().as_str().to_string();

        let no_ack = options.no_ack;
        let queue_name = queue.to_string();
        let mut stream = consumer;
        let task = tokio::spawn(async move {
            while let Some(delivery) = stream.next().await {
                let delivery = match delivery {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        error!(queue = %queue_name, error = %e, "Delivery error; consumer stopped");
                        break;
                    }
                };
                let handler = Arc::clone(&handler);
                // Broker-side prefetch bounds how many of these run at once.
                tokio::spawn(async move {
                    handler.on_delivery(envelope_of(&delivery)).await;
                    if !no_ack {
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            warn!(error = %e, "Failed to acknowledge delivery");
                        }
                    }
                });
            }
        });
        self.consumers.lock().insert(tag.clone(), task);

        debug!(queue, consumer_tag = %tag, no_ack, "Consumer started");
        Ok(tag)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let task = self.consumers.lock().remove(consumer_tag);
        let cancelled = self
            .channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(channel_error);
        if let Some(task) = task {
            task.abort();
        }
        cancelled
    }
}
