// src/rabbitmq/amqp_client.rs

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::Result;
use crate::message::{Delivery, Message};

/// Stream of deliveries for one consumer. Ends when the consumer is
/// cancelled or the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Parameters of a `queue.declare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Named work queue: durable, shared, kept when unused.
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// Private reply queue: transient, exclusive, deleted when unused.
    pub fn reply() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Queue descriptor returned by a declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    name: String,
    message_count: u32,
    consumer_count: u32,
}

impl Queue {
    pub fn new(name: impl Into<String>, message_count: u32, consumer_count: u32) -> Self {
        Self {
            name: name.into(),
            message_count,
            consumer_count,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_count(&self) -> u32 {
        self.message_count
    }

    pub fn consumer_count(&self) -> u32 {
        self.consumer_count
    }
}

/// The channel operations the request/response and publish helpers need.
///
/// Implemented over lapin for a real broker and by the in-memory broker for
/// tests. Clones share the same underlying channel.
#[async_trait]
pub trait AmqpChannel: Clone + Send + Sync + 'static {
    /// Declare a queue. An empty name asks the broker to pick one.
    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<Queue>;

    /// Publish on the default exchange, so `routing_key` is a queue name.
    async fn basic_publish(&self, routing_key: &str, message: Message) -> Result<()>;

    /// Register a consumer. `no_ack` hands settlement to the broker.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
