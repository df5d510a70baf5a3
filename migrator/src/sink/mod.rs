pub mod index_sink;
pub mod jsonl_sink;

use crate::model::{Document, WriteOutcome};
use async_trait::async_trait;
use migrator_core::Result;

#[async_trait]
pub trait DocumentSink: Send {
    /// Make the destination ready before the first batch
    async fn prepare(&mut self) -> Result<()>;

    /// Deliver one batch, keeping its order
    async fn write_batch(&mut self, documents: &[Document]) -> Result<WriteOutcome>;

    /// Flush anything still buffered
    async fn finish(&mut self) -> Result<()>;

    /// Get the destination identifier
    fn sink_id(&self) -> &str;
}

pub use index_sink::IndexSink;
pub use jsonl_sink::JsonlSink;
