//! In-memory broker for local runs and tests.
//!
//! Mirrors the broker-side rules the audit pipeline relies on: durable
//! declarations are idempotent, conflicting re-declarations fail, direct
//! exchanges route by exact routing key. Faults can be injected to
//! exercise connection and publish failures.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{BrokerConnection, BrokerConnector, ExchangeKind, ExchangeSpec, Message, QueueSpec};
use crate::error::BrokerError;

/// A message as recorded by the in-memory broker.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    /// Queues the message was routed to.
    pub queues: Vec<String>,
    pub message: Message,
}

#[derive(Default)]
struct BrokerState {
    unreachable: bool,
    failing_publishes: u32,
    failing_closes: u32,
    publish_always_fails: bool,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueSpec>,
    bindings: HashSet<(String, String, String)>,
    published: Vec<PublishedMessage>,
    open_connections: usize,
    total_connections: usize,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// When unreachable, every connect attempt fails with `ConnectionError`.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Fails the next `n` publishes with `PublishError`.
    pub fn fail_next_publishes(&self, n: u32) {
        self.lock().failing_publishes = n;
    }

    /// Fails the next `n` closes with `ConnectionError`. The connection is
    /// still torn down.
    pub fn fail_next_closes(&self, n: u32) {
        self.lock().failing_closes = n;
    }

    pub fn set_publish_failing(&self, failing: bool) {
        self.lock().publish_always_fails = failing;
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    pub fn published_to(&self, queue: &str) -> Vec<PublishedMessage> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.queues.iter().any(|q| q == queue))
            .cloned()
            .collect()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.lock().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.lock().queues.get(name).cloned()
    }

    pub fn exchange_count(&self) -> usize {
        self.lock().exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.lock().queues.len()
    }

    pub fn is_bound(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.lock().bindings.contains(&(
            exchange.to_string(),
            queue.to_string(),
            routing_key.to_string(),
        ))
    }

    pub fn open_connections(&self) -> usize {
        self.lock().open_connections
    }

    pub fn total_connections(&self) -> usize {
        self.lock().total_connections
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let mut state = self.lock();
        if state.unreachable {
            return Err(BrokerError::ConnectionError(
                "in-memory broker is unreachable".into(),
            ));
        }
        state.open_connections += 1;
        state.total_connections += 1;
        Ok(Box::new(InMemoryConnection {
            broker: self.clone(),
            open: true,
        }))
    }
}

struct InMemoryConnection {
    broker: InMemoryBroker,
    open: bool,
}

impl InMemoryConnection {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open {
            Ok(())
        } else {
            Err(BrokerError::PublishError("connection is closed".into()))
        }
    }

    fn shut(&mut self) {
        if self.open {
            self.open = false;
            let mut state = self.broker.lock();
            state.open_connections = state.open_connections.saturating_sub(1);
        }
    }
}

#[async_trait]
impl BrokerConnection for InMemoryConnection {
    async fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(BrokerError::TopologyConflict {
                resource: format!("exchange {}", spec.name),
                reason: format!(
                    "declared as {} (durable={}), exists as {} (durable={})",
                    spec.kind.as_str(),
                    spec.durable,
                    existing.kind.as_str(),
                    existing.durable
                ),
            }),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        match state.queues.get(&spec.name) {
            Some(existing) if existing != spec => Err(BrokerError::TopologyConflict {
                resource: format!("queue {}", spec.name),
                reason: format!(
                    "declared durable={}, exists durable={}",
                    spec.durable, existing.durable
                ),
            }),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if !state.exchanges.contains_key(exchange) || !state.queues.contains_key(queue) {
            return Err(BrokerError::PublishError(format!(
                "cannot bind {} to {}: not declared",
                queue, exchange
            )));
        }
        state.bindings.insert((
            exchange.to_string(),
            queue.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.lock();
        if state.publish_always_fails {
            return Err(BrokerError::PublishError("channel closed by broker".into()));
        }
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BrokerError::PublishError("channel closed by broker".into()));
        }
        let kind = match state.exchanges.get(exchange) {
            Some(spec) => spec.kind,
            None => {
                return Err(BrokerError::PublishError(format!(
                    "no exchange '{}'",
                    exchange
                )))
            }
        };
        let mut queues: Vec<String> = state
            .bindings
            .iter()
            .filter(|(ex, _, key)| {
                ex == exchange && (kind != ExchangeKind::Direct || key == routing_key)
            })
            .map(|(_, queue, _)| queue.clone())
            .collect();
        queues.sort();
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            queues,
            message: message.clone(),
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.shut();
        let mut state = self.broker.lock();
        if state.failing_closes > 0 {
            state.failing_closes -= 1;
            return Err(BrokerError::ConnectionError("close handshake failed".into()));
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.shut();
    }
}
