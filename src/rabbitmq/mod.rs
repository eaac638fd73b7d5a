// src/rabbitmq/mod.rs
// RabbitMQ request/response and publish helpers

pub mod errors;
pub mod connection; // lapin-backed channel and connection lifecycle
pub mod memory; // in-process broker

mod amqp_client;
mod consumer;
mod correlation;
mod publisher;
mod queue;
mod request_response;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::{AmqpChannel, DeliveryStream, Queue, QueueOptions};
pub use connection::{create_connection, create_connection_with, LapinChannel, Release};
pub use consumer::{
    subscribe, subscribe_with, AckPolicy, DeliveryHandler, HandlerResult, LoopExit,
    SubscribeOptions, Subscription,
};
pub use correlation::{
    CorrelationId, CorrelationIdGenerator, RandomCorrelationIds, SeededCorrelationIds,
    CORRELATION_ID_LEN,
};
pub use errors::{RabbitMQError, Result};
pub use memory::{MemoryBroker, MemoryChannel};
pub use publisher::publish_with_conn;
pub use queue::create_queue;
pub use request_response::{call, call_with_conn, publish, RpcClient};
