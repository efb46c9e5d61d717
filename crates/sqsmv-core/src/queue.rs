//! Queue service contract used by the transfer loop.
//!
//! The loop never talks to SQS directly. It only needs the four operations of
//! [`QueueService`], which keeps the transfer semantics testable without a
//! live queue.

use std::fmt;

use async_trait::async_trait;

/// Upper bound on messages per receive, send or delete call.
pub const MAX_BATCH_SIZE: i32 = 10;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Resolved locator of a queue (the queue URL for SQS).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueAddress(String);

impl QueueAddress {
    /// Wraps an already resolved address, typically the URL returned by
    /// [`QueueService::resolve`].
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier assigned by the source queue. Only unique within one received batch.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps an id reported by the queue service. The id doubles as the
    /// batch entry id of the send and delete requests for the same message.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for MessageId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Single-use token tied to one delivery of a message.
///
/// Becomes invalid once the message is deleted or its visibility timeout
/// expires and the message is delivered again.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    /// Wraps the opaque handle returned with a received message.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A message read from the source queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub receipt: ReceiptHandle,
    pub body: String,
}

/// Entry of a send-batch request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ForwardEntry {
    pub id: MessageId,
    pub body: String,
}

/// Entry of a delete-batch request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeleteEntry {
    pub id: MessageId,
    pub receipt: ReceiptHandle,
}

/// Parameters of a single receive call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// 1..=[`MAX_BATCH_SIZE`]
    pub max_messages: i32,
    /// Long-poll wait in seconds.
    pub wait_seconds: i32,
    /// Seconds the received messages stay hidden from other consumers.
    pub visibility_timeout: i32,
}

/// Per-item failure of a batch call.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct BatchFailure {
    pub id: MessageId,
    pub code: String,
    pub message: Option<String>,
    pub sender_fault: bool,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}", self.id, self.code)?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        f.write_str(")")
    }
}

/// Per-item outcome of a send-batch or delete-batch call, correlated by id.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub successful: Vec<MessageId>,
    pub failed: Vec<BatchFailure>,
}

/// Errors raised by a [`QueueService`] call as a whole.
///
/// Per-item failures inside a batch are not errors; they are reported through
/// [`BatchOutcome::failed`].
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue `{queue}` does not exist")]
    NotFound { queue: String },

    #[error("permission denied during {operation}: {message}")]
    PermissionDenied {
        operation: &'static str,
        message: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid response from queue service: {0}")]
    InvalidResponse(String),

    #[error("{operation} failed: {source}")]
    Service {
        operation: &'static str,
        #[source]
        source: BoxError,
        transient: bool,
    },
}

impl QueueError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Service { transient, .. } => *transient,
            Self::NotFound { .. }
            | Self::PermissionDenied { .. }
            | Self::InvalidRequest(_)
            | Self::InvalidResponse(_) => false,
        }
    }
}

/// The queue operations the transfer loop depends on.
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Resolves a queue name to its address.
    async fn resolve(&self, queue_name: &str) -> Result<QueueAddress, QueueError>;

    /// Receives up to `options.max_messages` messages. An empty result is not an error.
    async fn receive(
        &self,
        address: &QueueAddress,
        options: &ReceiveOptions,
    ) -> Result<Vec<Message>, QueueError>;

    /// Sends a batch of messages to `address`.
    async fn send_batch(
        &self,
        address: &QueueAddress,
        entries: Vec<ForwardEntry>,
    ) -> Result<BatchOutcome, QueueError>;

    /// Deletes a batch of deliveries from `address`.
    async fn delete_batch(
        &self,
        address: &QueueAddress,
        entries: Vec<DeleteEntry>,
    ) -> Result<BatchOutcome, QueueError>;
}
