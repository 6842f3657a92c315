//! # DDD Bus AMQP
//!
//! RabbitMQ transport for `ddd-bus`.
//!
//! Each endpoint connection targets the virtual host of the domain it talks
//! to and authenticates as the bus's own domain. RabbitMQ rejects a
//! `user_id` property that differs from the connection user, which is what
//! makes the publisher identity trustworthy for permission checks.
//!
//! ```rust,ignore
//! let config = BusConfig::for_domain("billing");
//! let broker = Arc::new(AmqpBroker::from_config(&config)?);
//! let mut bus = DomainMessageBus::new(config, broker);
//! ```

#![cfg_attr(test, allow(clippy::unwrap_used))]

mod broker;
pub mod properties;

pub use broker::AmqpBroker;
