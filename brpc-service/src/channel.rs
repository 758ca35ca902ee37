use async_trait::async_trait;
use brpc_proto::message::ServiceMessage;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,
    #[error("channel is not writable")]
    NotWritable,
    #[error("connect failed: {0}")]
    Connect(String),
}

/// A connection to one peer.
///
/// Framing, reconnection and load balancing belong to the implementation.
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Makes sure the channel is connected. Implementations report failure
    /// instead of retrying.
    async fn connect(&self) -> Result<(), ChannelError>;

    fn is_active(&self) -> bool;

    fn is_writable(&self) -> bool;

    /// Queues a message for writing without waiting.
    fn write_and_flush(&self, message: ServiceMessage) -> Result<(), ChannelError>;

    /// Queues a message, waiting for room in the outgoing queue.
    async fn send(&self, message: ServiceMessage) -> Result<(), ChannelError>;
}
