use async_trait::async_trait;
use lapin::options::{
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, warn};

use super::{BrokerConnection, BrokerConnector, ExchangeKind, ExchangeSpec, Message, QueueSpec};
use crate::config::BrokerConfig;
use config::ConfigError;
use crate::error::BrokerError;

const REPLY_SUCCESS: u16 = 200;

/// Opens RabbitMQ connections over AMQP 0-9-1.
pub struct AmqpConnector {
    uri: String,
    confirm_delivery: bool,
}

impl AmqpConnector {
    pub fn new(config: &BrokerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            uri: config.amqp_uri()?,
            confirm_delivery: config.confirm_delivery,
        })
    }
}

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerConnection>, BrokerError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|e| BrokerError::ConnectionError(e.to_string()))?;

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                let _ = connection.close(REPLY_SUCCESS, "channel open failed").await;
                return Err(BrokerError::ConnectionError(e.to_string()));
            }
        };

        if self.confirm_delivery {
            if let Err(e) = channel.confirm_select(ConfirmSelectOptions::default()).await {
                let _ = connection.close(REPLY_SUCCESS, "confirm select failed").await;
                return Err(BrokerError::ConnectionError(e.to_string()));
            }
        }

        Ok(Box::new(AmqpConnection {
            connection: Some(connection),
            channel,
            confirm_delivery: self.confirm_delivery,
        }))
    }
}

struct AmqpConnection {
    /// `None` once closed or aborted.
    connection: Option<Connection>,
    channel: Channel,
    confirm_delivery: bool,
}

/// Declaration failures: PRECONDITION_FAILED means the resource exists
/// with different properties.
fn declare_error(resource: String, err: lapin::Error) -> BrokerError {
    if let lapin::Error::ProtocolError(amqp_err) = &err {
        if matches!(
            amqp_err.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        ) {
            return BrokerError::TopologyConflict {
                resource,
                reason: amqp_err.to_string(),
            };
        }
    }
    BrokerError::PublishError(format!("declaring {} failed: {}", resource, err))
}

fn to_lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(&spec.name, to_lapin_kind(spec.kind), options, FieldTable::default())
            .await
            .map_err(|e| declare_error(format!("exchange {}", spec.name), e))
    }

    async fn declare_queue(&mut self, spec: &QueueSpec) -> Result<(), BrokerError> {
        let options = QueueDeclareOptions {
            durable: spec.durable,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(&spec.name, options, FieldTable::default())
            .await
            .map(|_| ())
            .map_err(|e| declare_error(format!("queue {}", spec.name), e))
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| declare_error(format!("binding {}->{}", exchange, queue), e))
    }

    async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: &Message,
    ) -> Result<(), BrokerError> {
        let properties = BasicProperties::default()
            .with_delivery_mode(message.delivery_mode.as_amqp())
            .with_content_type(message.content_type.as_str().into());

        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BrokerError::PublishError(e.to_string()))?;

        if self.confirm_delivery {
            let confirmation = confirm
                .await
                .map_err(|e| BrokerError::PublishError(e.to_string()))?;
            if confirmation.is_nack() {
                return Err(BrokerError::PublishError(format!(
                    "broker nacked message on {}/{}",
                    exchange, routing_key
                )));
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        let Some(connection) = self.connection.take() else {
            return Ok(());
        };
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "OK").await {
            debug!("Channel close failed: {}", e);
        }
        connection
            .close(REPLY_SUCCESS, "OK")
            .await
            .map_err(|e| BrokerError::ConnectionError(e.to_string()))
    }

    fn abort(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = connection.close(REPLY_SUCCESS, "aborted").await {
                        debug!("Aborted broker connection close failed: {}", e);
                    }
                });
            }
            Err(_) => warn!("No runtime to close abandoned broker connection"),
        }
    }
}
