// src/rabbitmq/errors.rs

use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::Error as LapinError;
use std::time::Duration;
use thiserror::Error;
use tokio::time::error::Elapsed;

#[derive(Debug, Error)]
pub enum RabbitMQError {
    #[error("RabbitMQ connection error: {0}")]
    ConnectionError(String),

    #[error("RabbitMQ channel error: {0}")]
    ChannelError(String),

    #[error("Queue declare error: {0}")]
    QueueDeclareError(String),

    /// The queue already exists with different parameters.
    #[error("Queue conflict: {0}")]
    QueueConflict(String),

    #[error("RabbitMQ publish error: {0}")]
    PublishError(String),

    /// Consumer registration failed. Never used for a consumer that simply stopped.
    #[error("RabbitMQ consume error: {0}")]
    ConsumeError(String),

    #[error("RabbitMQ acknowledge error: {0}")]
    AckError(String),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Response channel closed")]
    ResponseChannelClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

// Custom Result type for RabbitMQ operations
pub type Result<T> = std::result::Result<T, RabbitMQError>;

impl RabbitMQError {
    /// Classify a failed `queue.declare`.
    ///
    /// RabbitMQ answers a re-declare with inequivalent arguments with
    /// PRECONDITION_FAILED, everything else is a plain declare failure.
    pub fn from_queue_declare(queue: &str, error: LapinError) -> Self {
        if is_precondition_failed(&error) {
            RabbitMQError::QueueConflict(format!("queue '{}': {}", queue, error))
        } else {
            RabbitMQError::QueueDeclareError(format!("queue '{}': {}", queue, error))
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, RabbitMQError::Timeout(_))
    }
}

fn is_precondition_failed(error: &LapinError) -> bool {
    match error {
        LapinError::ProtocolError(amqp_error) => matches!(
            amqp_error.kind(),
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
        ),
        _ => false,
    }
}

impl From<serde_json::Error> for RabbitMQError {
    fn from(error: serde_json::Error) -> Self {
        RabbitMQError::ConfigError(error.to_string())
    }
}

impl From<std::num::ParseIntError> for RabbitMQError {
    fn from(err: std::num::ParseIntError) -> Self {
        RabbitMQError::ConfigError(format!("Parse error: {}", err))
    }
}

impl From<std::str::ParseBoolError> for RabbitMQError {
    fn from(err: std::str::ParseBoolError) -> Self {
        RabbitMQError::ConfigError(format!("Parse error: {}", err))
    }
}

impl From<Elapsed> for RabbitMQError {
    fn from(_: Elapsed) -> Self {
        RabbitMQError::ConnectionError("Connection timed out".to_string())
    }
}
