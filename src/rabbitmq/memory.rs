// src/rabbitmq/memory.rs
//! In-process broker.
//!
//! Implements [`AmqpChannel`] without a network so the request/response and
//! consumer logic can be exercised deterministically. Only the default
//! exchange exists: publishing routes by queue name.
//!
//! Behaviour follows RabbitMQ where this crate depends on it:
//!
//! - Re-declaring a queue with the same options is a no-op. Different
//!   options fail with [`RabbitMQError::QueueConflict`] and close the
//!   declaring channel, as PRECONDITION_FAILED does.
//! - Exclusive queues belong to the declaring channel (this crate uses one
//!   channel per connection) and are deleted when it closes.
//! - Messages routed to a missing queue are dropped.
//! - Ready messages go round-robin to consumers in FIFO order.
//! - Manual-ack deliveries stay unacked until settled. Requeued or orphaned
//!   messages go back to the head of their queue flagged `redelivered`.
//! - An auto-delete queue is deleted once its last consumer goes away.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

use super::amqp_client::{AmqpChannel, DeliveryStream, Queue, QueueOptions};
use super::errors::{RabbitMQError, Result};
use crate::message::{Delivery, Message};

type DeliverySender = mpsc::UnboundedSender<Result<Delivery>>;

struct QueuedMessage {
    message: Message,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    channel_id: u64,
    no_ack: bool,
    sender: DeliverySender,
}

struct QueueState {
    options: QueueOptions,
    owner: Option<u64>,
    ready: VecDeque<QueuedMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
}

impl QueueState {
    fn new(options: QueueOptions, owner: Option<u64>) -> Self {
        Self {
            options,
            owner,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
        }
    }

    fn locked_for(&self, channel_id: u64) -> bool {
        matches!(self.owner, Some(owner) if owner != channel_id)
    }

    fn descriptor(&self, name: &str) -> Queue {
        Queue::new(name, self.ready.len() as u32, self.consumers.len() as u32)
    }
}

struct Unacked {
    queue: String,
    message: Message,
}

#[derive(Default)]
struct ChannelState {
    next_delivery_tag: u64,
    unacked: BTreeMap<u64, Unacked>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    next_channel_id: u64,
}

impl BrokerState {
    fn ensure_open(&self, channel_id: u64) -> Result<()> {
        if self.channels.contains_key(&channel_id) {
            Ok(())
        } else {
            Err(RabbitMQError::ChannelError(format!("channel {} is closed", channel_id)))
        }
    }

    fn open_channel(&mut self) -> u64 {
        self.next_channel_id += 1;
        let id = self.next_channel_id;
        self.channels.insert(id, ChannelState::default());
        id
    }

    fn declare(&mut self, channel_id: u64, name: &str, options: QueueOptions) -> Result<Queue> {
        self.ensure_open(channel_id)?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            name.to_string()
        };

        let conflict = match self.queues.get(&name) {
            Some(existing) if existing.locked_for(channel_id) => {
                return Err(RabbitMQError::QueueDeclareError(format!(
                    "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                    name
                )));
            }
            Some(existing) if existing.options == options => {
                return Ok(existing.descriptor(&name));
            }
            Some(existing) => format!(
                "PRECONDITION_FAILED - inequivalent arguments for queue '{}': \
                 declared {:?}, existing {:?}",
                name, options, existing.options
            ),
            None => {
                let owner = options.exclusive.then_some(channel_id);
                self.queues.insert(name.clone(), QueueState::new(options, owner));
                debug!(queue = %name, ?options, "Declared queue");
                return Ok(Queue::new(name, 0, 0));
            }
        };

        self.close_channel(channel_id);
        Err(RabbitMQError::QueueConflict(conflict))
    }

    fn publish(&mut self, channel_id: u64, routing_key: &str, message: Message) -> Result<()> {
        self.ensure_open(channel_id)?;

        match self.queues.get_mut(routing_key) {
            Some(queue) => queue.ready.push_back(QueuedMessage {
                message,
                redelivered: false,
            }),
            None => {
                debug!(queue = %routing_key, "Dropping unroutable message");
                return Ok(());
            }
        }

        self.dispatch(routing_key);
        Ok(())
    }

    fn consume(
        &mut self,
        channel_id: u64,
        queue_name: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<mpsc::UnboundedReceiver<Result<Delivery>>> {
        self.ensure_open(channel_id)?;

        let tag_in_use = self.queues.values().any(|queue| {
            queue
                .consumers
                .iter()
                .any(|c| c.channel_id == channel_id && c.tag == consumer_tag)
        });
        if tag_in_use {
            return Err(RabbitMQError::ConsumeError(format!(
                "NOT_ALLOWED - attempt to reuse consumer tag '{}'",
                consumer_tag
            )));
        }

        let queue = self.queues.get_mut(queue_name).ok_or_else(|| {
            RabbitMQError::ConsumeError(format!("NOT_FOUND - no queue '{}'", queue_name))
        })?;
        if queue.locked_for(channel_id) {
            return Err(RabbitMQError::ConsumeError(format!(
                "RESOURCE_LOCKED - cannot obtain exclusive access to locked queue '{}'",
                queue_name
            )));
        }

        let (sender, receiver) = mpsc::unbounded();
        queue.consumers.push(ConsumerSlot {
            tag: consumer_tag.to_string(),
            channel_id,
            no_ack,
            sender,
        });

        self.dispatch(queue_name);
        Ok(receiver)
    }

    fn cancel(&mut self, channel_id: u64, consumer_tag: &str) -> Result<()> {
        self.ensure_open(channel_id)?;
        self.remove_consumers(|c| c.channel_id == channel_id && c.tag == consumer_tag);
        Ok(())
    }

    fn take_unacked(&mut self, channel_id: u64, delivery_tag: u64) -> Result<Unacked> {
        self.ensure_open(channel_id)?;
        self.channels
            .get_mut(&channel_id)
            .and_then(|channel| channel.unacked.remove(&delivery_tag))
            .ok_or_else(|| {
                RabbitMQError::AckError(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {}",
                    delivery_tag
                ))
            })
    }

    fn ack(&mut self, channel_id: u64, delivery_tag: u64) -> Result<()> {
        self.take_unacked(channel_id, delivery_tag).map(|_| ())
    }

    fn nack(&mut self, channel_id: u64, delivery_tag: u64, requeue: bool) -> Result<()> {
        let unacked = self.take_unacked(channel_id, delivery_tag)?;
        if requeue {
            let queue = unacked.queue.clone();
            self.requeue_front(unacked);
            self.dispatch(&queue);
        }
        Ok(())
    }

    fn requeue_front(&mut self, unacked: Unacked) {
        if let Some(queue) = self.queues.get_mut(&unacked.queue) {
            queue.ready.push_front(QueuedMessage {
                message: unacked.message,
                redelivered: true,
            });
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return;
        };

        self.remove_consumers(|c| c.channel_id == channel_id);
        self.queues.retain(|_, queue| queue.owner != Some(channel_id));

        // Reverse tag order so push_front restores the original order.
        let mut touched: Vec<String> = Vec::new();
        for (_, unacked) in channel.unacked.into_iter().rev() {
            if !touched.contains(&unacked.queue) {
                touched.push(unacked.queue.clone());
            }
            self.requeue_front(unacked);
        }
        for queue in touched {
            self.dispatch(&queue);
        }

        debug!(channel_id, "Closed channel");
    }

    fn remove_consumers<P>(&mut self, predicate: P)
    where
        P: Fn(&ConsumerSlot) -> bool,
    {
        let mut emptied = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| !predicate(c));
            let emptied_now = queue.consumers.len() != before && queue.consumers.is_empty();
            if emptied_now && queue.options.auto_delete {
                emptied.push(name.clone());
            }
        }
        for name in emptied {
            debug!(queue = %name, "Auto-deleting queue");
            self.queues.remove(&name);
        }
    }

    fn dispatch(&mut self, queue_name: &str) {
        let BrokerState { queues, channels, .. } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        let mut lost_consumer = false;
        while !queue.consumers.is_empty() {
            let Some(queued) = queue.ready.pop_front() else {
                break;
            };

            let index = queue.next_consumer % queue.consumers.len();
            let (channel_id, no_ack) = {
                let consumer = &queue.consumers[index];
                (consumer.channel_id, consumer.no_ack)
            };
            let Some(channel) = channels.get_mut(&channel_id) else {
                queue.consumers.remove(index);
                queue.ready.push_front(queued);
                lost_consumer = true;
                continue;
            };

            let delivery_tag = channel.next_delivery_tag + 1;
            let delivery = Delivery {
                delivery_tag,
                redelivered: queued.redelivered,
                message: queued.message.clone(),
            };

            if queue.consumers[index].sender.unbounded_send(Ok(delivery)).is_err() {
                // Stream dropped without a cancel.
                queue.consumers.remove(index);
                queue.ready.push_front(queued);
                lost_consumer = true;
                continue;
            }

            channel.next_delivery_tag = delivery_tag;
            if !no_ack {
                channel.unacked.insert(
                    delivery_tag,
                    Unacked {
                        queue: queue_name.to_string(),
                        message: queued.message,
                    },
                );
            }
            queue.next_consumer = index + 1;
        }

        if lost_consumer && queue.consumers.is_empty() && queue.options.auto_delete {
            queues.remove(queue_name);
        }
    }
}

/// Handle to an in-memory broker. Clones share the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Open a new channel on this broker.
    pub fn create_channel(&self) -> MemoryChannel {
        let id = self.lock().open_channel();
        MemoryChannel {
            broker: self.clone(),
            id,
        }
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.lock().queues.contains_key(name)
    }

    /// Messages waiting in the queue, not counting unacked deliveries.
    pub fn message_count(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|q| q.ready.len())
    }

    pub fn consumer_count(&self, name: &str) -> Option<usize> {
        self.lock().queues.get(name).map(|q| q.consumers.len())
    }
}

/// A channel on a [`MemoryBroker`]. Clones share the channel.
#[derive(Clone)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    id: u64,
}

impl MemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.broker.lock().channels.contains_key(&self.id)
    }

    /// Messages delivered on this channel and not yet settled.
    pub fn unacked_count(&self) -> usize {
        self.broker
            .lock()
            .channels
            .get(&self.id)
            .map_or(0, |c| c.unacked.len())
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    async fn queue_declare(&self, name: &str, options: QueueOptions) -> Result<Queue> {
        self.broker.lock().declare(self.id, name, options)
    }

    async fn basic_publish(&self, routing_key: &str, message: Message) -> Result<()> {
        self.broker
            .lock()
            .publish(self.id, routing_key, message)
            .map_err(|e| RabbitMQError::PublishError(e.to_string()))
    }

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        no_ack: bool,
    ) -> Result<DeliveryStream> {
        let receiver = self
            .broker
            .lock()
            .consume(self.id, queue, consumer_tag, no_ack)
            .map_err(|e| match e {
                RabbitMQError::ChannelError(msg) => RabbitMQError::ConsumeError(msg),
                other => other,
            })?;
        Ok(receiver.boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.broker.lock().cancel(self.id, consumer_tag)
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.broker.lock().ack(self.id, delivery_tag)
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.broker.lock().nack(self.id, delivery_tag, requeue)
    }

    async fn close(&self) -> Result<()> {
        self.broker.lock().close_channel(self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn body(delivery: &Delivery) -> &str {
        std::str::from_utf8(delivery.body()).unwrap()
    }

    async fn next(stream: &mut DeliveryStream) -> Delivery {
        stream
            .next()
            .now_or_never()
            .expect("no delivery ready")
            .expect("stream ended")
            .expect("delivery error")
    }

    fn nothing_ready(stream: &mut DeliveryStream) -> bool {
        stream.next().now_or_never().is_none()
    }

    #[tokio::test]
    async fn redeclare_is_idempotent_and_conflicts_close_the_channel() {
        let broker = MemoryBroker::new();
        let channel = broker.create_channel();

        let first = channel.queue_declare("jobs", QueueOptions::durable()).await.unwrap();
        let second = channel.queue_declare("jobs", QueueOptions::durable()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.name(), "jobs");

        let transient = QueueOptions {
            durable: false,
            ..QueueOptions::durable()
        };
        let err = channel.queue_declare("jobs", transient).await.unwrap_err();
        assert!(matches!(err, RabbitMQError::QueueConflict(_)));
        assert!(!channel.is_open());
        assert!(broker.queue_exists("jobs"));

        let err = channel.queue_declare("other", QueueOptions::durable()).await.unwrap_err();
        assert!(matches!(err, RabbitMQError::ChannelError(_)));
    }

    #[tokio::test]
    async fn anonymous_queues_get_unique_names() {
        let broker = MemoryBroker::new();
        let channel = broker.create_channel();

        let a = channel.queue_declare("", QueueOptions::reply()).await.unwrap();
        let b = channel.queue_declare("", QueueOptions::reply()).await.unwrap();

        assert!(a.name().starts_with("amq.gen-"));
        assert_ne!(a.name(), b.name());
    }

    #[tokio::test]
    async fn exclusive_queues_are_private_and_die_with_their_channel() {
        let broker = MemoryBroker::new();
        let owner = broker.create_channel();
        let other = broker.create_channel();

        let queue = owner.queue_declare("", QueueOptions::reply()).await.unwrap();

        let err = other.queue_declare(queue.name(), QueueOptions::reply()).await.unwrap_err();
        assert!(matches!(err, RabbitMQError::QueueDeclareError(_)));
        let err = other.basic_consume(queue.name(), "c1", true).await.err().unwrap();
        assert!(matches!(err, RabbitMQError::ConsumeError(_)));

        // Anyone may still publish to it.
        other
            .basic_publish(queue.name(), Message::reply(b"hi".to_vec(), "X"))
            .await
            .unwrap();
        assert_eq!(broker.message_count(queue.name()), Some(1));

        owner.close().await.unwrap();
        assert!(!broker.queue_exists(queue.name()));
    }

    #[tokio::test]
    async fn unroutable_messages_are_dropped() {
        let broker = MemoryBroker::new();
        let channel = broker.create_channel();

        channel
            .basic_publish("nowhere", Message::persistent(b"lost".to_vec()))
            .await
            .unwrap();

        assert!(!broker.queue_exists("nowhere"));
    }

    #[tokio::test]
    async fn backlog_is_delivered_in_order_and_round_robin() {
        let broker = MemoryBroker::new();
        let channel = broker.create_channel();
        channel.queue_declare("work", QueueOptions::durable()).await.unwrap();

        for text in ["one", "two", "three"] {
            channel
                .basic_publish("work", Message::persistent(text.as_bytes().to_vec()))
                .await
                .unwrap();
        }
        assert_eq!(broker.message_count("work"), Some(3));

        let mut first = channel.basic_consume("work", "first", true).await.unwrap();
        assert_eq!(body(&next(&mut first).await), "one");
        assert_eq!(body(&next(&mut first).await), "two");
        assert_eq!(body(&next(&mut first).await), "three");

        let mut second = channel.basic_consume("work", "second", true).await.unwrap();
        for text in ["a", "b"] {
            channel
                .basic_publish("work", Message::persistent(text.as_bytes().to_vec()))
                .await
                .unwrap();
        }

        assert_eq!(body(&next(&mut second).await), "a");
        assert_eq!(body(&next(&mut first).await), "b");
        assert!(nothing_ready(&mut first));
        assert!(nothing_ready(&mut second));
    }

    #[tokio::test]
    async fn nack_with_requeue_redelivers() {
        let broker = MemoryBroker::new();
        let channel = broker.create_channel();
        channel.queue_declare("work", QueueOptions::durable()).await.unwrap();
        let mut stream = channel.basic_consume("work", "c", false).await.unwrap();

        channel
            .basic_publish("work", Message::persistent(b"retry me".to_vec()))
            .await
            .unwrap();

        let delivery = next(&mut stream).await;
        assert!(!delivery.redelivered);
        assert_eq!(channel.unacked_count(), 1);

        channel.basic_nack(delivery.delivery_tag, true).await.unwrap();
        let again = next(&mut stream).await;
        assert!(again.redelivered);
        assert_ne!(again.delivery_tag, delivery.delivery_tag);

        channel.basic_ack(again.delivery_tag).await.unwrap();
        assert_eq!(channel.unacked_count(), 0);

        let err = channel.basic_ack(again.delivery_tag).await.unwrap_err();
        assert!(matches!(err, RabbitMQError::AckError(_)));
    }

    #[tokio::test]
    async fn nack_without_requeue_discards() {
        let broker = MemoryBroker::new();
        let channel = broker.create_channel();
        channel.queue_declare("work", QueueOptions::durable()).await.unwrap();
        let mut stream = channel.basic_consume("work", "c", false).await.unwrap();

        channel
            .basic_publish("work", Message::persistent(b"poison".to_vec()))
            .await
            .unwrap();
        let delivery = next(&mut stream).await;
        channel.basic_nack(delivery.delivery_tag, false).await.unwrap();

        assert!(nothing_ready(&mut stream));
        assert_eq!(broker.message_count("work"), Some(0));
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_unacked_and_ends_streams() {
        let broker = MemoryBroker::new();
        let publisher = broker.create_channel();
        let consumer = broker.create_channel();
        publisher.queue_declare("work", QueueOptions::durable()).await.unwrap();

        let mut stream = consumer.basic_consume("work", "c", false).await.unwrap();
        for text in ["x", "y"] {
            publisher
                .basic_publish("work", Message::persistent(text.as_bytes().to_vec()))
                .await
                .unwrap();
        }
        next(&mut stream).await;
        next(&mut stream).await;

        consumer.close().await.unwrap();
        assert!(stream.next().now_or_never().expect("stream should be finished").is_none());
        assert_eq!(broker.message_count("work"), Some(2));

        let replacement = broker.create_channel();
        let mut stream = replacement.basic_consume("work", "c", true).await.unwrap();
        let first = next(&mut stream).await;
        assert!(first.redelivered);
        assert_eq!(body(&first), "x");
        assert_eq!(body(&next(&mut stream).await), "y");
    }

    #[tokio::test]
    async fn cancelling_last_consumer_deletes_auto_delete_queue() {
        let broker = MemoryBroker::new();
        let channel = broker.create_channel();
        let reply = channel.queue_declare("", QueueOptions::reply()).await.unwrap();
        let durable = channel.queue_declare("kept", QueueOptions::durable()).await.unwrap();

        let mut reply_stream = channel.basic_consume(reply.name(), "r", true).await.unwrap();
        let _kept_stream = channel.basic_consume(durable.name(), "k", true).await.unwrap();
        assert_eq!(broker.consumer_count(reply.name()), Some(1));

        channel.basic_cancel("r").await.unwrap();
        channel.basic_cancel("k").await.unwrap();

        assert!(reply_stream.next().now_or_never().expect("stream should be finished").is_none());
        assert!(!broker.queue_exists(reply.name()));
        assert!(broker.queue_exists("kept"));
        assert_eq!(broker.consumer_count("kept"), Some(0));
    }

    #[tokio::test]
    async fn consumer_tags_are_unique_per_channel() {
        let broker = MemoryBroker::new();
        let channel = broker.create_channel();
        channel.queue_declare("work", QueueOptions::durable()).await.unwrap();

        let _stream = channel.basic_consume("work", "dup", true).await.unwrap();
        let err = channel.basic_consume("work", "dup", true).await.err().unwrap();
        assert!(matches!(err, RabbitMQError::ConsumeError(_)));

        let err = channel.basic_consume("missing", "other", true).await.err().unwrap();
        assert!(matches!(err, RabbitMQError::ConsumeError(_)));
    }
}
