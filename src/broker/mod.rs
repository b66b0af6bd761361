//! Broker module for the audit pipeline
//!
//! This module owns the broker connection lifecycle and the wire unit
//! handed to the broker. Backends implement [`BrokerConnector`]; the
//! AMQP backend talks to RabbitMQ, the in-memory backend serves local
//! runs and tests.

mod amqp;
mod connection;
mod memory;

use async_trait::async_trait;
use config::ConfigError;
use std::sync::Arc;

use crate::config::{BrokerConfig, BrokerKind};
use crate::error::BrokerError;

pub use amqp::AmqpConnector;
pub use connection::{ConnectionProvider, ScopedConnection};
pub use memory::{InMemoryBroker, PublishedMessage};

pub const CONTENT_TYPE_TEXT: &str = "text/plain";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Transient,
    Persistent,
}

impl DeliveryMode {
    /// AMQP 0-9-1 `delivery-mode` property value.
    pub fn as_amqp(&self) -> u8 {
        match self {
            DeliveryMode::Transient => 1,
            DeliveryMode::Persistent => 2,
        }
    }
}

/// Wire unit handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: Vec<u8>,
    pub delivery_mode: DeliveryMode,
    pub content_type: String,
}

impl Message {
    /// Persistent plain-text message carrying the UTF-8 bytes of `payload`.
    pub fn persistent_text(payload: &str) -> Self {
        Self {
            body: payload.as_bytes().to_vec(),
            delivery_mode: DeliveryMode::Persistent,
            content_type: CONTENT_TYPE_TEXT.to_string(),
        }
    }

    pub fn body_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.body).ok()
    }
}

/// An exclusively owned broker connection with one open channel.
#[async_trait]
pub trait BrokerConnection: Send {
    async fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<(), BrokerError>;

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Hands the message to the connection. Returns once the broker
    /// accepted it, or once it is buffered when confirms are off.
    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError>;

    /// Best-effort release without awaiting, used when a guard is dropped
    /// before `close` ran.
    fn abort(&mut self);
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError>;
}

/// Builds the connector selected by `broker.kind`.
pub fn connector_from_config(config: &BrokerConfig) -> Result<Arc<dyn BrokerConnector>, ConfigError> {
    let connector: Arc<dyn BrokerConnector> = match config.kind {
        BrokerKind::Amqp => Arc::new(AmqpConnector::new(config)?),
        BrokerKind::Memory => Arc::new(InMemoryBroker::new()),
    };
    Ok(connector)
}
