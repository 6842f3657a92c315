//! # Cross-Domain Integration Tests
//!
//! Every test wires real [`ddd_bus::DomainMessageBus`] instances for several
//! domains onto one [`ddd_bus::InMemoryBroker`], so commands, replies and
//! events take the same path through virtual hosts, exchanges and queues as
//! they would on RabbitMQ.
//!
//! ```text
//!   orders bus ──CreateInvoice──► vhost "billing" ──► billing bus
//!        ▲                              │
//!        └──────── reply (amq.gen-*) ◄──┘
//!
//!   billing bus ──InvoiceCreated──► events ──► queue "orders" ──► orders handler
//!                                         └──► queue "shipping" (InvoicePaid only)
//! ```

#[cfg(test)]
mod fixtures;

mod failures;
mod lifecycle;
mod scenarios;
