// src/rabbitmq/publisher.rs
// Fire-and-forget publishing.

use tracing::{debug, error};

use super::amqp_client::{AmqpChannel, Queue};
use super::errors::Result;
use super::queue::create_queue;
use crate::message::Message;

/// Ensure `queue_name` exists, then publish `body` as a persistent message
/// without reply metadata. Returns the declared queue; with an empty
/// `queue_name` that is the server-named queue the message went to.
///
/// Success means the broker accepted the publish, not that anyone handled it.
pub async fn publish_with_conn<C: AmqpChannel>(
    channel: &C,
    queue_name: &str,
    body: impl Into<Vec<u8>>,
) -> Result<Queue> {
    let queue = create_queue(channel, queue_name).await?;

    let body = body.into();
    let size = body.len();
    channel
        .basic_publish(queue.name(), Message::persistent(body))
        .await
        .map_err(|e| {
            error!(queue = %queue.name(), error = %e, "Failed to publish message");
            e
        })?;

    debug!(queue = %queue.name(), bytes = size, "Message published");
    Ok(queue)
}
