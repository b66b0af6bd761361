use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::{BrokerConnection, BrokerConnector};
use crate::error::BrokerError;

/// Hands out one fresh connection per caller. Connections are never
/// shared between concurrent publishes.
#[derive(Clone)]
pub struct ConnectionProvider {
    connector: Arc<dyn BrokerConnector>,
    connect_timeout: Duration,
}

impl ConnectionProvider {
    pub fn new(connector: Arc<dyn BrokerConnector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connect_timeout,
        }
    }

    /// Opens a connection. Failures are returned as-is; no retry here.
    pub async fn acquire(&self) -> Result<ScopedConnection, BrokerError> {
        let conn = tokio::time::timeout(self.connect_timeout, self.connector.connect())
            .await
            .map_err(|_| {
                BrokerError::ConnectionError(format!(
                    "timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            })??;
        debug!("Broker connection acquired");
        Ok(ScopedConnection { inner: Some(conn) })
    }
}

/// Connection guard. `release` closes it; dropping it unreleased aborts it.
pub struct ScopedConnection {
    inner: Option<Box<dyn BrokerConnection>>,
}

impl ScopedConnection {
    pub async fn release(mut self) -> Result<(), BrokerError> {
        match self.inner.take() {
            Some(mut conn) => {
                let result = conn.close().await;
                if let Err(e) = &result {
                    warn!("Broker connection did not close cleanly: {}", e);
                }
                result
            }
            None => Ok(()),
        }
    }
}

impl Deref for ScopedConnection {
    type Target = dyn BrokerConnection;

    fn deref(&self) -> &Self::Target {
        // `inner` is only taken by `release`, which consumes the guard.
        self.inner.as_deref().expect("scoped connection already released")
    }
}

impl DerefMut for ScopedConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.inner
            .as_deref_mut()
            .expect("scoped connection already released")
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        if let Some(mut conn) = self.inner.take() {
            debug!("Broker connection dropped before release, aborting");
            conn.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ExchangeKind, ExchangeSpec, InMemoryBroker};
    use async_trait::async_trait;

    #[tokio::test]
    async fn test_release_closes_connection() {
        let broker = InMemoryBroker::new();
        let provider = ConnectionProvider::new(Arc::new(broker.clone()), Duration::from_secs(1));

        let conn = provider.acquire().await.unwrap();
        assert_eq!(broker.open_connections(), 1);

        conn.release().await.unwrap();
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_on_error_path() {
        let broker = InMemoryBroker::new();
        let provider = ConnectionProvider::new(Arc::new(broker.clone()), Duration::from_secs(1));

        async fn failing_body(provider: &ConnectionProvider) -> Result<(), BrokerError> {
            let mut conn = provider.acquire().await?;
            conn.declare_exchange(&ExchangeSpec {
                name: "x".into(),
                kind: ExchangeKind::Direct,
                durable: true,
            })
            .await?;
            conn.declare_exchange(&ExchangeSpec {
                name: "x".into(),
                kind: ExchangeKind::Fanout,
                durable: true,
            })
            .await?;
            conn.release().await
        }

        let result = failing_body(&provider).await;
        assert!(matches!(result, Err(BrokerError::TopologyConflict { .. })));
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_connection_error() {
        let broker = InMemoryBroker::new();
        broker.set_reachable(false);
        let provider = ConnectionProvider::new(Arc::new(broker.clone()), Duration::from_secs(1));

        let result = provider.acquire().await;
        assert!(matches!(result, Err(BrokerError::ConnectionError(_))));
        assert_eq!(broker.open_connections(), 0);
    }

    struct HangingConnector;

    #[async_trait]
    impl BrokerConnector for HangingConnector {
        async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let provider = ConnectionProvider::new(Arc::new(HangingConnector), Duration::from_millis(20));
        match provider.acquire().await {
            Err(BrokerError::ConnectionError(msg)) => assert!(msg.contains("timed out")),
            other => panic!("expected connection timeout, got {:?}", other.map(|_| ())),
        }
    }
}
