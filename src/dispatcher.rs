use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;

/// Callback surface for completed inbound data. Implementations must not
/// block; long-running work belongs on a separate task.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReceiveDispatcher: Send + Sync + 'static {
    /// A complete block arrived on `connection_id`.
    async fn on_block(&self, connection_id: u64, data: Bytes);

    /// A contiguous chunk of stream data arrived. `data_id` is the
    /// application-chosen identifier from the stream's first gene.
    async fn on_stream_data(&self, connection_id: u64, data_id: u64, chunk: Bytes);

    /// The sender closed the stream; all data was delivered via
    /// `on_stream_data`.
    async fn on_stream_end(&self, connection_id: u64, data_id: u64);
}
