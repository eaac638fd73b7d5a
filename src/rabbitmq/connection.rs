// src/rabbitmq/connection.rs
// Broker connection handling and the lapin-backed channel.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, error, info, warn};

use super::amqp_client::{AmqpChannel, DeliveryStream, Queue, QueueOptions};
use super::errors::{RabbitMQError, Result};
use crate::config::RpcConfig;
use crate::message::{Delivery, Message};

const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// [`AmqpChannel`] over a lapin channel.
#[derive(Clone)]
pub struct LapinChannel {
    channel: Channel,
}

impl LapinChannel {
    pub fn new(channel: Channel) -> Self {
        Self { channel }
    }

    pub fn inner(&self) -> &Channel {
        &self.channel
    }
}

fn properties_for(message: &Message) -> BasicProperties {
    let mut properties = BasicProperties::default();
    if let Some(content_type) = &message.content_type {
        properties = properties.with_content_type(content_type.as_str().into());
    }
    if message.persistent {
        properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if let Some(correlation_id) = &message.correlation_id {
        properties = properties.with_correlation_id(correlation_id.as_str().into());
    }
    if let Some(reply_to) = &message.reply_to {
        properties = properties.with_reply_to(reply_to.as_str().into());
    }
    properties
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(delivery: lapin::message::Delivery) -> Self {
        let properties = &delivery.properties;
        let message = Message {
            content_type: properties.content_type().as_ref().map(|s| s.as_str().to_string()),
            correlation_id: properties.correlation_id().as_ref().map(|s| s.as_str().to_string()),
            reply_to: properties.reply_to().as_ref().map(|s| s.as_str().to_string()),
            persistent: *properties.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
            body: delivery.data,
        };

        Delivery {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            message,
        }
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<Queue> {
        let declare_options = QueueDeclareOptions {
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            ..QueueDeclareOptions::default()
        };

        let queue = self
            .channel
            .queue_declare(name, declare_options, FieldTable::default())
            .await
            .map_err(|e| RabbitMQError::from_queue_declare(name, e))?;

        Ok(Queue::new(
            queue.name().as_str(),
            queue.message_count(),
            queue.consumer_count(),
        ))
    }

    async fn basic_publish(&self, routing_key: &str, message: Message) -> Result<()> {
        let properties = properties_for(&message);

        let confirmation = self
            .channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?
            .await
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))?;

        // Only reachable with publisher confirms enabled on the channel.
        if confirmation.is_nack() {
            return Err(RabbitMQError::PublishError(format!(
                "broker nacked message for '{}'",
                routing_key
            )));
        }

        Ok(())
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RabbitMQError::ConsumeError(format!("queue '{}': {}", queue, e)))?;

        let deliveries = consumer
            .map(|delivery| {
                delivery
                    .map(Delivery::from)
                    .map_err(|e| RabbitMQError::ChannelError(e.to_string()))
            })
            .boxed();

        Ok(deliveries)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..BasicNackOptions::default()
                },
            )
            .await
            .map_err(|e| RabbitMQError::AckError(e.to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.channel
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| RabbitMQError::ChannelError(e.to_string()))
    }
}

/// Owns the broker connection behind a channel returned by [`create_connection`].
///
/// Nothing is closed on drop; call [`Release::release`].
pub struct Release {
    connection: Connection,
    channel: LapinChannel,
}

impl Release {
    /// Close the channel, then the connection.
    pub async fn release(self) {
        if let Err(e) = self.channel.close().await {
            warn!(error = %e, "Failed to close channel");
        }
        match self.connection.close(200, "Normal shutdown").await {
            Ok(()) => debug!("Connection closed"),
            Err(e) => warn!(error = %e, "Failed to close connection"),
        }
    }
}

/// Open a connection and one channel using the default [`RpcConfig`].
pub async fn create_connection(url: &str) -> Result<(LapinChannel, Release)> {
    create_connection_with(url, &RpcConfig::default()).await
}

/// Open a connection and one channel.
///
/// Dialing is bounded by `config.connection_timeout()`. If the channel
/// cannot be opened the connection is closed before returning.
pub async fn create_connection_with(
    url: &str,
    config: &RpcConfig,
) -> Result<(LapinChannel, Release)> {
    info!("Connecting to RabbitMQ");

    let connection = tokio::time::timeout(
        config.connection_timeout(),
        Connection::connect(url, ConnectionProperties::default()),
    )
    .await?
    .map_err(|e| {
        error!(error = %e, "Failed to connect to RabbitMQ");
        RabbitMQError::ConnectionError(e.to_string())
    })?;

    let channel = match open_channel(&connection, config).await {
        Ok(channel) => channel,
        Err(e) => {
            if let Err(close_err) = connection.close(200, "Channel setup failed").await {
                warn!(error = %close_err, "Failed to close connection after channel error");
            }
            return Err(e);
        }
    };

    info!(channel_id = channel.id(), "Connected to RabbitMQ");

    let channel = LapinChannel::new(channel);
    let release = Release {
        connection,
        channel: channel.clone(),
    };
    Ok((channel, release))
}

async fn open_channel(connection: &Connection, config: &RpcConfig) -> Result<Channel> {
    let channel = connection
        .create_channel()
        .await
        .map_err(|e| RabbitMQError::ChannelError(format!("Failed to create channel: {}", e)))?;

    if config.publisher_confirms {
        debug!(channel_id = channel.id(), "Enabling confirm mode");
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                RabbitMQError::ChannelError(format!("Failed to enable confirm mode: {}", e))
            })?;
    }

    Ok(channel)
}
