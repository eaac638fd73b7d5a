// src/rabbitmq/consumer.rs
//! Subscribe-and-optionally-reply consumption loop.
//!
//! Registration and consumption are separate phases. [`Subscription::register`]
//! is the only step that can fail; once registered, the loop runs until the
//! delivery stream ends or a shutdown signal fires.

use async_trait::async_trait;
use futures::StreamExt;
use std::future::Future;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::amqp_client::{AmqpChannel, DeliveryStream, Queue};
use super::errors::{RabbitMQError, Result};
use crate::message::{Delivery, Message};

/// Handler outcome. `Ok(Some(body))` with a non-empty body is published back
/// when the delivery carries reply routing.
pub type HandlerResult = anyhow::Result<Option<Vec<u8>>>;

/// Called once per delivery, sequentially, in delivery order.
#[async_trait]
pub trait DeliveryHandler: Send {
    async fn handle(&mut self, delivery: &Delivery) -> HandlerResult;
}

#[async_trait]
impl<F> DeliveryHandler for F
where
    F: FnMut(&Delivery) -> HandlerResult + Send,
{
    async fn handle(&mut self, delivery: &Delivery) -> HandlerResult {
        (self)(delivery)
    }
}

/// How deliveries are settled with the broker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// The broker considers a message handled once delivered.
    #[default]
    Auto,
    /// Ack after the handler (and any reply) succeeds, otherwise nack
    /// without requeue.
    AckOnSuccess,
    /// Ack after the handler (and any reply) succeeds, otherwise nack and
    /// requeue for redelivery.
    NackRequeueOnError,
}

impl AckPolicy {
    fn no_ack(self) -> bool {
        self == AckPolicy::Auto
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub ack_policy: AckPolicy,
    /// Defaults to `consumer-<uuid>`.
    pub consumer_tag: Option<String>,
}

impl SubscribeOptions {
    pub fn with_ack_policy(mut self, ack_policy: AckPolicy) -> Self {
        self.ack_policy = ack_policy;
        self
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }
}

/// Why a consumption loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The broker ended the stream, or the channel closed.
    StreamEnded,
    /// The shutdown signal fired and the consumer was cancelled.
    Cancelled,
}

/// A registered consumer that has not started consuming yet.
pub struct Subscription<C: AmqpChannel> {
    channel: C,
    queue: String,
    consumer_tag: String,
    ack_policy: AckPolicy,
    deliveries: DeliveryStream,
}

impl<C: AmqpChannel> Subscription<C> {
    /// Register a consumer on `queue`. Failures surface as
    /// [`RabbitMQError::ConsumeError`].
    pub async fn register(channel: &C, queue: &Queue, options: SubscribeOptions) -> Result<Self> {
        let consumer_tag = options
            .consumer_tag
            .unwrap_or_else(|| format!("consumer-{}", Uuid::new_v4()));

        let deliveries = channel
            .basic_consume(queue.name(), &consumer_tag, options.ack_policy.no_ack())
            .await
            .map_err(|e| match e {
                RabbitMQError::ConsumeError(_) => e,
                other => RabbitMQError::ConsumeError(other.to_string()),
            })?;

        info!(
            queue = %queue.name(),
            consumer_tag = %consumer_tag,
            ack_policy = ?options.ack_policy,
            "Consumer registered"
        );

        Ok(Self {
            channel: channel.clone(),
            queue: queue.name().to_string(),
            consumer_tag,
            ack_policy: options.ack_policy,
            deliveries,
        })
    }

    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Consume until the stream ends.
    pub async fn run<H: DeliveryHandler>(self, handler: H) -> LoopExit {
        self.run_until(handler, std::future::pending::<()>()).await
    }

    /// Consume until the stream ends or `shutdown` completes. On shutdown the
    /// consumer is cancelled with the broker before returning.
    pub async fn run_until<H, S>(self, mut handler: H, shutdown: S) -> LoopExit
    where
        H: DeliveryHandler,
        S: Future<Output = ()> + Send,
    {
        let Subscription {
            channel,
            queue,
            consumer_tag,
            ack_policy,
            mut deliveries,
        } = self;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    if let Err(e) = channel.basic_cancel(&consumer_tag).await {
                        warn!(
                            queue = %queue,
                            consumer_tag = %consumer_tag,
                            error = %e,
                            "Failed to cancel consumer"
                        );
                    }
                    debug!(queue = %queue, consumer_tag = %consumer_tag, "Consumer cancelled");
                    return LoopExit::Cancelled;
                }

                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => {
                        handle_delivery(&channel, ack_policy, &mut handler, delivery).await;
                    }
                    Some(Err(e)) => {
                        error!(queue = %queue, error = %e, "Error receiving message");
                        return LoopExit::StreamEnded;
                    }
                    None => {
                        info!(
                            queue = %queue,
                            consumer_tag = %consumer_tag,
                            "Delivery stream ended"
                        );
                        return LoopExit::StreamEnded;
                    }
                },
            }
        }
    }
}

async fn handle_delivery<C, H>(
    channel: &C,
    ack_policy: AckPolicy,
    handler: &mut H,
    delivery: Delivery,
) where
    C: AmqpChannel,
    H: DeliveryHandler,
{
    debug!(
        delivery_tag = delivery.delivery_tag,
        redelivered = delivery.redelivered,
        correlation_id = ?delivery.message.correlation_id,
        "Received message"
    );

    let outcome = match handler.handle(&delivery).await {
        Ok(Some(body)) if !body.is_empty() => send_reply(channel, &delivery, body).await,
        Ok(_) => Ok(()),
        Err(e) => Err(e),
    };

    let settled = match (ack_policy, outcome) {
        (AckPolicy::Auto, Ok(())) => Ok(()),
        (AckPolicy::Auto, Err(e)) => {
            warn!(delivery_tag = delivery.delivery_tag, error = %e, "Error processing message");
            Ok(())
        }
        (_, Ok(())) => channel.basic_ack(delivery.delivery_tag).await,
        (policy, Err(e)) => {
            let requeue = policy == AckPolicy::NackRequeueOnError;
            warn!(
                delivery_tag = delivery.delivery_tag,
                requeue,
                error = %e,
                "Error processing message, rejecting"
            );
            channel.basic_nack(delivery.delivery_tag, requeue).await
        }
    };

    if let Err(e) = settled {
        error!(delivery_tag = delivery.delivery_tag, error = %e, "Failed to settle message");
    }
}

async fn send_reply<C: AmqpChannel>(
    channel: &C,
    delivery: &Delivery,
    body: Vec<u8>,
) -> anyhow::Result<()> {
    let Some((reply_to, correlation_id)) = delivery.message.reply_route() else {
        debug!(delivery_tag = delivery.delivery_tag, "No reply route, result dropped");
        return Ok(());
    };

    channel
        .basic_publish(reply_to, Message::reply(body, correlation_id))
        .await?;
    debug!(reply_to = %reply_to, correlation_id = %correlation_id, "Reply published");
    Ok(())
}

/// Register a consumer on `queue` with the default options and process
/// deliveries until the stream ends.
///
/// Returns `Err` only when registration fails.
pub async fn subscribe<C, H>(channel: &C, queue: &Queue, handler: H) -> Result<()>
where
    C: AmqpChannel,
    H: DeliveryHandler,
{
    subscribe_with(channel, queue, SubscribeOptions::default(), handler).await
}

pub async fn subscribe_with<C, H>(
    channel: &C,
    queue: &Queue,
    options: SubscribeOptions,
    handler: H,
) -> Result<()>
where
    C: AmqpChannel,
    H: DeliveryHandler,
{
    let subscription = Subscription::register(channel, queue, options).await?;
    subscription.run(handler).await;
    Ok(())
}
