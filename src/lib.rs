//! Request/response and fire-and-forget messaging over RabbitMQ.
//!
//! [`call`] publishes a request tagged with a fresh correlation id and a
//! private reply queue, then waits for the matching reply up to
//! [`RpcConfig::reply_timeout`]. [`publish`] sends without waiting for
//! anything. [`subscribe`] runs a handler over a queue and publishes
//! non-empty results back to the requester.
//!
//! The `*_with_conn` variants take any [`AmqpChannel`]: a [`LapinChannel`]
//! from [`create_connection`] for a real broker, or a [`MemoryChannel`] for
//! tests and local runs.
//!
//! Logging goes through `tracing`; installing a subscriber is up to the
//! application.

pub mod config;
pub mod message;
pub mod rabbitmq;

pub use config::{broker_url_from_env, RpcConfig, DEFAULT_BROKER_URL};
pub use message::{Delivery, Message, CONTENT_TYPE_JSON};
pub use rabbitmq::{
    call, call_with_conn, create_connection, create_connection_with, create_queue, publish,
    publish_with_conn, subscribe, subscribe_with, AckPolicy, AmqpChannel, CorrelationId,
    CorrelationIdGenerator, DeliveryHandler, HandlerResult, LapinChannel, LoopExit, MemoryBroker,
    MemoryChannel, Queue, QueueOptions, RabbitMQError, RandomCorrelationIds, Release, Result,
    RpcClient, SeededCorrelationIds, SubscribeOptions, Subscription,
};
