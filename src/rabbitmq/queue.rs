// src/rabbitmq/queue.rs

use tracing::info;

use super::amqp_client::{AmqpChannel, Queue, QueueOptions};
use super::errors::Result;

/// Make sure a durable, shared, non-auto-delete queue named `name` exists.
///
/// Idempotent for identical parameters. An existing queue declared with
/// different parameters yields [`RabbitMQError::QueueConflict`].
///
/// [`RabbitMQError::QueueConflict`]: super::errors::RabbitMQError::QueueConflict
pub async fn create_queue<C: AmqpChannel>(channel: &C, name: &str) -> Result<Queue> {
    let queue = channel.queue_declare(name, QueueOptions::durable()).await?;

    info!(
        queue = %queue.name(),
        messages = queue.message_count(),
        consumers = queue.consumer_count(),
        "Queue declared"
    );
    Ok(queue)
}
