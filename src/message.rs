use crate::rabbitmq::CorrelationId;

/// Content type stamped on every outgoing message. Bodies are opaque and
/// never validated as JSON.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A broker message: opaque body plus the properties this crate cares about.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// Links a reply to the request that caused it.
    pub correlation_id: Option<String>,
    /// Queue a responder must publish its answer to.
    pub reply_to: Option<String>,
    /// Delivery mode 2 on the wire.
    pub persistent: bool,
}

impl Message {
    /// A persistent request expecting an answer on `reply_to`.
    pub fn request(body: Vec<u8>, correlation_id: &CorrelationId, reply_to: &str) -> Self {
        Message {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            body,
            correlation_id: Some(correlation_id.as_str().to_string()),
            reply_to: Some(reply_to.to_string()),
            persistent: true,
        }
    }

    /// A persistent fire-and-forget message with no reply metadata.
    pub fn persistent(body: Vec<u8>) -> Self {
        Message {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            body,
            correlation_id: None,
            reply_to: None,
            persistent: true,
        }
    }

    /// A transient reply carrying the correlation id of the request.
    pub fn reply(body: Vec<u8>, correlation_id: &str) -> Self {
        Message {
            content_type: Some(CONTENT_TYPE_JSON.to_string()),
            body,
            correlation_id: Some(correlation_id.to_string()),
            reply_to: None,
            persistent: false,
        }
    }

    /// Reply routing, present only when both reply-to and correlation id are set
    /// and non-empty.
    pub fn reply_route(&self) -> Option<(&str, &str)> {
        let reply_to = self.reply_to.as_deref().filter(|s| !s.is_empty())?;
        let correlation_id = self.correlation_id.as_deref().filter(|s| !s.is_empty())?;
        Some((reply_to, correlation_id))
    }

    pub fn has_correlation_id(&self, correlation_id: &CorrelationId) -> bool {
        self.correlation_id.as_deref() == Some(correlation_id.as_str())
    }
}

/// A message as handed out by a consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub message: Message,
}

impl Delivery {
    pub fn body(&self) -> &[u8] {
        &self.message.body
    }
}
