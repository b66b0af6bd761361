use tracing::{debug, warn};

use super::{Category, TopologyEnsurer};
use crate::broker::{ConnectionProvider, Message};
use crate::error::BrokerError;

/// Lifecycle of a single publish call. `Done` and `Failed` are terminal;
/// the connection is released on entering either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishState {
    Idle,
    Connecting,
    TopologyReady,
    Publishing,
    Done,
    Failed,
}

struct Transitions {
    category: Category,
    trail: Vec<PublishState>,
}

impl Transitions {
    fn new(category: Category) -> Self {
        Self {
            category,
            trail: vec![PublishState::Idle],
        }
    }

    fn advance(&mut self, next: PublishState) {
        debug!(category = %self.category, state = ?next, "Publish state");
        self.trail.push(next);
    }
}

pub struct EventPublisher {
    provider: ConnectionProvider,
}

impl EventPublisher {
    pub fn new(provider: ConnectionProvider) -> Self {
        Self { provider }
    }

    /// Acquires a dedicated connection, publishes, and releases it on
    /// every exit path. Not retried here.
    pub async fn publish(&self, category: Category, payload: &str) -> Result<(), BrokerError> {
        let mut transitions = Transitions::new(category);
        let result = self.run(category, payload, &mut transitions).await;
        if let Err(e) = &result {
            warn!(category = %category, "Audit publish failed: {}", e);
        }
        result
    }

    async fn run(
        &self,
        category: Category,
        payload: &str,
        transitions: &mut Transitions,
    ) -> Result<(), BrokerError> {
        transitions.advance(PublishState::Connecting);
        let mut conn = match self.provider.acquire().await {
            Ok(conn) => conn,
            Err(e) => {
                transitions.advance(PublishState::Failed);
                return Err(e);
            }
        };

        let outcome = async {
            let topology = TopologyEnsurer::ensure(&mut *conn, category).await?;
            transitions.advance(PublishState::TopologyReady);

            transitions.advance(PublishState::Publishing);
            let message = Message::persistent_text(payload);
            conn.publish(topology.exchange, topology.routing_key, &message)
                .await
        }
        .await;

        match outcome {
            Ok(()) => {
                // Without confirms, close flushes buffered frames; a failed
                // close is reported so the event gets retried. The message may
                // already be on the broker, so delivery is at-least-once.
                let released = conn.release().await;
                transitions.advance(if released.is_ok() {
                    PublishState::Done
                } else {
                    PublishState::Failed
                });
                released
            }
            Err(e) => {
                let _ = conn.release().await;
                transitions.advance(PublishState::Failed);
                Err(e)
            }
        }
    }
}
