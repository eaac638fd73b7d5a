// src/rabbitmq/request_response.rs
//! Correlated request/response over a fresh exclusive reply queue.
//!
//! Each call declares its own anonymous reply queue, tags the request with a
//! new correlation id and waits for the first reply carrying that id, up to
//! the configured reply timeout. The reply listener runs in its own task and
//! is cancelled before the call returns, whatever the outcome. Cancelling the
//! only consumer of the auto-delete reply queue deletes it, so a reply that
//! shows up after a timeout is dropped by the broker.

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::amqp_client::{AmqpChannel, Queue, QueueOptions};
use super::connection::create_connection_with;
use super::consumer::{DeliveryHandler, HandlerResult, SubscribeOptions, Subscription};
use super::correlation::{CorrelationId, CorrelationIdGenerator, RandomCorrelationIds};
use super::errors::{RabbitMQError, Result};
use super::publisher;
use super::queue::create_queue;
use crate::config::RpcConfig;
use crate::message::{Delivery, Message};

/// Issues calls and publishes with a fixed configuration and id generator.
#[derive(Debug, Clone, Default)]
pub struct RpcClient<G = RandomCorrelationIds> {
    config: RpcConfig,
    ids: G,
}

impl RpcClient {
    pub fn new(config: RpcConfig) -> Self {
        Self {
            config,
            ids: RandomCorrelationIds,
        }
    }
}

impl<G: CorrelationIdGenerator> RpcClient<G> {
    /// Use `ids` for correlation ids instead of the thread RNG.
    pub fn with_generator(config: RpcConfig, ids: G) -> Self {
        Self { config, ids }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Open a connection, perform [`RpcClient::call_with_conn`] and release
    /// the connection.
    pub async fn call(
        &self,
        url: &str,
        queue_name: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let (channel, release) = create_connection_with(url, &self.config).await?;
        let result = self.call_with_conn(&channel, queue_name, body).await;
        release.release().await;
        result
    }

    /// Send `body` to `queue_name` and wait for the correlated reply. The
    /// request is routed to the name the broker declared, so an empty
    /// `queue_name` targets a fresh server-named queue.
    ///
    /// Fails with [`RabbitMQError::Timeout`] if no matching reply arrives
    /// within the reply timeout, and with
    /// [`RabbitMQError::ResponseChannelClosed`] if the reply stream ends first.
    pub async fn call_with_conn<C: AmqpChannel>(
        &self,
        channel: &C,
        queue_name: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        let target = create_queue(channel, queue_name).await?;
        let reply_queue = channel.queue_declare("", QueueOptions::reply()).await?;
        let correlation_id = self.ids.next_id();

        // Listen before sending so the request is never published without a
        // consumer able to take its reply.
        let subscription =
            Subscription::register(channel, &reply_queue, SubscribeOptions::default()).await?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let listener = tokio::spawn(subscription.run_until(
            reply_matcher(correlation_id.clone(), reply_tx),
            async move {
                stop_rx.await.ok();
            },
        ));

        let request = Message::request(body.into(), &correlation_id, reply_queue.name());
        let outcome = match channel.basic_publish(target.name(), request).await {
            Ok(()) => {
                debug!(
                    queue = %target.name(),
                    reply_to = %reply_queue.name(),
                    correlation_id = %correlation_id,
                    "Request published"
                );
                self.await_reply(reply_rx, &correlation_id).await
            }
            Err(e) => Err(e),
        };

        stop_tx.send(()).ok();
        if let Err(e) = listener.await {
            warn!(correlation_id = %correlation_id, error = %e, "Reply listener task failed");
        }

        outcome
    }

    async fn await_reply(
        &self,
        reply_rx: oneshot::Receiver<Vec<u8>>,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<u8>> {
        let timeout = self.config.reply_timeout();

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(body)) => {
                debug!(correlation_id = %correlation_id, bytes = body.len(), "Reply received");
                Ok(body)
            }
            Ok(Err(_)) => {
                warn!(
                    correlation_id = %correlation_id,
                    "Reply listener stopped before a reply arrived"
                );
                Err(RabbitMQError::ResponseChannelClosed)
            }
            Err(_) => {
                warn!(correlation_id = %correlation_id, ?timeout, "Request timed out");
                Err(RabbitMQError::Timeout(timeout))
            }
        }
    }

    /// Open a connection, perform [`publisher::publish_with_conn`] and
    /// release the connection.
    pub async fn publish(
        &self,
        url: &str,
        queue_name: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<Queue> {
        let (channel, release) = create_connection_with(url, &self.config).await?;
        let result = publisher::publish_with_conn(&channel, queue_name, body).await;
        release.release().await;
        result
    }

    pub async fn publish_with_conn<C: AmqpChannel>(
        &self,
        channel: &C,
        queue_name: &str,
        body: impl Into<Vec<u8>>,
    ) -> Result<Queue> {
        publisher::publish_with_conn(channel, queue_name, body).await
    }
}

/// Forwards the body of the first delivery carrying `expected` and never
/// asks the loop to publish anything.
fn reply_matcher(
    expected: CorrelationId,
    reply_tx: oneshot::Sender<Vec<u8>>,
) -> impl DeliveryHandler + 'static {
    let mut reply_tx = Some(reply_tx);

    move |delivery: &Delivery| -> HandlerResult {
        if !delivery.message.has_correlation_id(&expected) {
            debug!(
                expected = %expected,
                received = ?delivery.message.correlation_id,
                "Ignoring reply for another request"
            );
            return Ok(None);
        }

        match reply_tx.take() {
            // The caller may have given up already.
            Some(tx) => {
                tx.send(delivery.body().to_vec()).ok();
            }
            None => debug!(correlation_id = %expected, "Duplicate reply ignored"),
        }
        Ok(None)
    }
}

/// Call with the default configuration over a connection opened for this call.
pub async fn call(url: &str, queue_name: &str, body: impl Into<Vec<u8>>) -> Result<Vec<u8>> {
    RpcClient::new(RpcConfig::default()).call(url, queue_name, body).await
}

/// Call with the default configuration over an existing channel.
pub async fn call_with_conn<C: AmqpChannel>(
    channel: &C,
    queue_name: &str,
    body: impl Into<Vec<u8>>,
) -> Result<Vec<u8>> {
    RpcClient::new(RpcConfig::default()).call_with_conn(channel, queue_name, body).await
}

/// Publish with the default configuration over a connection opened for this
/// publish.
pub async fn publish(url: &str, queue_name: &str, body: impl Into<Vec<u8>>) -> Result<Queue> {
    RpcClient::new(RpcConfig::default()).publish(url, queue_name, body).await
}
