use chrono::Utc;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    options::{BasicPublishOptions, ExchangeDeclareOptions},
    types::FieldTable,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::{sync::Mutex, time::timeout};

const CONNECT_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum PublisherError {
    #[error("Failed to connect to RabbitMQ: {0}")]
    ConnectionFailed(String),
    #[error("Failed to open channel: {0}")]
    ChannelFailed(String),
    #[error("Failed to declare exchange: {0}")]
    ExchangeDeclarationFailed(String),
    #[error("Failed to serialize message: {0}")]
    SerializationFailed(String),
    #[error("Failed to publish message: {0}")]
    PublishFailed(String),
    #[error("Context timeout: {0}")]
    Timeout(String),
    #[error("Failed to close publisher: {0}")]
    CloseFailed(String),
}

struct PublisherState {
    connection: Option<Connection>,
    channel: Option<Channel>,
}

/// Publisher represents a RabbitMQ publisher instance.
///
/// Messages are serialized as JSON and published persistent to a direct,
/// durable exchange. The producing peer of [`crate::Subscriber`]; it carries
/// no retry semantics of its own.
pub struct Publisher {
    // Channel operations are serialized; the AMQP channel is not safe for
    // concurrent use.
    state: Mutex<PublisherState>,
    exchange: String,
    routing_key: String,
    connected: AtomicBool,
}

impl Publisher {
    /// Creates a new RabbitMQ publisher instance
    pub async fn new(
        amqp_url: &str,
        exchange_name: &str,
        routing_key: &str,
    ) -> Result<Self, PublisherError> {
        let setup = async {
            let connection = Connection::connect(amqp_url, ConnectionProperties::default())
                .await
                .map_err(|e| PublisherError::ConnectionFailed(e.to_string()))?;

            let channel = match connection.create_channel().await {
                Ok(channel) => channel,
                Err(e) => {
                    let _ = connection.close(200, "setup failed").await;
                    return Err(PublisherError::ChannelFailed(e.to_string()));
                }
            };

            // Declare exchange with specified parameters (same as subscriber)
            if let Err(e) = channel
                .exchange_declare(
                    exchange_name,
                    ExchangeKind::Direct,
                    ExchangeDeclareOptions {
                        durable: true,
                        auto_delete: false,
                        internal: false,
                        nowait: false,
                        passive: false,
                    },
                    FieldTable::default(),
                )
                .await
            {
                let _ = connection.close(200, "setup failed").await;
                return Err(PublisherError::ExchangeDeclarationFailed(e.to_string()));
            }

            Ok((connection, channel))
        };

        let (connection, channel) = timeout(CONNECT_DEADLINE, setup)
            .await
            .map_err(|_| PublisherError::Timeout("connect deadline exceeded".to_string()))??;

        Ok(Publisher {
            state: Mutex::new(PublisherState {
                connection: Some(connection),
                channel: Some(channel),
            }),
            exchange: exchange_name.to_string(),
            routing_key: routing_key.to_string(),
            connected: AtomicBool::new(true),
        })
    }

    /// Publishes a message with the default routing key
    pub async fn publish<T: Serialize>(&self, message: &T) -> Result<(), PublisherError> {
        let routing_key = self.routing_key.clone();
        self.publish_with_routing_key(&routing_key, message).await
    }

    /// Publishes a message with a custom routing key
    pub async fn publish_with_routing_key<T: Serialize>(
        &self,
        routing_key: &str,
        message: &T,
    ) -> Result<(), PublisherError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| PublisherError::SerializationFailed(e.to_string()))?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_timestamp(Utc::now().timestamp().max(0) as u64);

        let state = self.state.lock().await;
        let channel = state
            .channel
            .as_ref()
            .ok_or_else(|| PublisherError::ChannelFailed("channel is closed".to_string()))?;

        channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| PublisherError::PublishFailed(e.to_string()))?;

        log::debug!(
            "rabbitmq published exchange={} routing_key={} bytes={}",
            self.exchange,
            routing_key,
            payload.len()
        );

        Ok(())
    }

    /// Checks if the publisher is still connected
    pub fn is_connected(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        match self.state.try_lock() {
            Ok(state) => match (&state.connection, &state.channel) {
                (Some(connection), Some(channel)) => {
                    connection.status().connected() && channel.status().connected()
                }
                _ => false,
            },
            // A publish in progress holds the channel, so it exists.
            Err(_) => true,
        }
    }

    /// Returns the exchange name
    pub fn get_exchange(&self) -> &str {
        &self.exchange
    }

    /// Closes the publisher connection and channel.
    /// Returns the first close error encountered.
    pub async fn close(self) -> Result<(), PublisherError> {
        self.connected.store(false, Ordering::SeqCst);
        let mut state = self.state.lock().await;

        let mut first_error: Option<String> = None;
        if let Some(channel) = state.channel.take() {
            if let Err(e) = channel.close(200, "shutdown").await {
                first_error = Some(e.to_string());
            }
        }
        if let Some(connection) = state.connection.take() {
            if let Err(e) = connection.close(200, "shutdown").await {
                if first_error.is_none() {
                    first_error = Some(e.to_string());
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(PublisherError::CloseFailed(e)),
        }
    }
}
