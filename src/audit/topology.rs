use tracing::debug;

use super::Category;
use crate::broker::{BrokerConnection, ExchangeKind, ExchangeSpec, QueueSpec};
use crate::error::BrokerError;

/// Broker resources backing one audit category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: &'static str,
    pub kind: ExchangeKind,
    pub queue: &'static str,
    pub routing_key: &'static str,
}

impl Topology {
    pub fn for_category(category: Category) -> Self {
        match category {
            Category::RateLimit => Self {
                exchange: "rate_limit_exchange",
                kind: ExchangeKind::Direct,
                queue: "rate_limit_queue",
                routing_key: "rate_limit",
            },
            Category::LoginAttempt => Self {
                exchange: "login_attempt_exchange",
                kind: ExchangeKind::Direct,
                queue: "login_attempt_queue",
                routing_key: "login_attempt",
            },
        }
    }

    fn exchange_spec(&self) -> ExchangeSpec {
        ExchangeSpec {
            name: self.exchange.to_string(),
            kind: self.kind,
            durable: true,
        }
    }

    fn queue_spec(&self) -> QueueSpec {
        QueueSpec {
            name: self.queue.to_string(),
            durable: true,
        }
    }
}

/// Declares a category's exchange, queue and binding. Runs on every
/// publish, so it relies on the broker treating identical declarations
/// as no-ops.
pub struct TopologyEnsurer;

impl TopologyEnsurer {
    pub async fn ensure(
        conn: &mut dyn BrokerConnection,
        category: Category,
    ) -> Result<Topology, BrokerError> {
        let topology = Topology::for_category(category);
        conn.declare_exchange(&topology.exchange_spec()).await?;
        conn.declare_queue(&topology.queue_spec()).await?;
        conn.bind_queue(topology.queue, topology.exchange, topology.routing_key)
            .await?;
        debug!(
            category = %category,
            exchange = topology.exchange,
            queue = topology.queue,
            "Topology ready"
        );
        Ok(topology)
    }
}
