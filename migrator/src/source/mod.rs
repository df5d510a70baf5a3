pub mod elastic_source;

use crate::model::Batch;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use migrator_core::Result;
use std::sync::Arc;
use tracing::debug;

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Number of documents the scan is expected to yield
    async fn count(&self) -> Result<u64>;

    /// Fetch the page after `cursor`, or the first page when `cursor` is `None`
    async fn fetch_page(&self, cursor: Option<String>) -> Result<Batch>;

    /// Release server-side state held for `cursor`
    async fn release(&self, cursor: String) -> Result<()>;

    /// Get the source identifier
    fn source_id(&self) -> &str;

    /// Check if the source is healthy
    async fn health_check(&self) -> Result<()>;
}

pub use elastic_source::ElasticSource;

enum ScanState {
    Start,
    Next(Option<String>),
    Release(Option<String>),
}

/// Lazily page through `source`. The stream is finite and single-use: it
/// ends at the first empty page, releasing the cursor on the way out.
///
/// The cursor of every yielded batch stays open until the stream is polled
/// again; a consumer that stops early must release `batch.cursor` itself.
pub fn scan(source: Arc<dyn DocumentSource>) -> BoxStream<'static, Result<Batch>> {
    stream::try_unfold(ScanState::Start, move |state| {
        let source = Arc::clone(&source);
        async move {
            let cursor = match state {
                ScanState::Start => None,
                ScanState::Next(cursor) => cursor,
                ScanState::Release(cursor) => {
                    close(source.as_ref(), cursor).await?;
                    return Ok(None);
                }
            };

            let batch = source.fetch_page(cursor).await?;

            if batch.documents.is_empty() {
                close(source.as_ref(), batch.cursor).await?;
                return Ok(None);
            }

            let next = if batch.has_more {
                ScanState::Next(batch.cursor.clone())
            } else {
                ScanState::Release(batch.cursor.clone())
            };
            Ok(Some((batch, next)))
        }
    })
    .boxed()
}

async fn close(source: &dyn DocumentSource, cursor: Option<String>) -> Result<()> {
    if let Some(cursor) = cursor {
        source.release(cursor).await?;
    }
    debug!(source = source.source_id(), "Scan exhausted");
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::testing::VecSource;
    use super::*;
    use crate::model::Document;
    use futures::TryStreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn doc(id: u32) -> Document {
        Document::new(id.to_string(), json!({ "id": id }))
    }

    #[tokio::test]
    async fn scan_yields_pages_in_order_and_releases_cursor() {
        let source = Arc::new(VecSource::new(vec![vec![doc(1), doc(2)], vec![doc(3)]]));

        let batches: Vec<Batch> = scan(source.clone()).try_collect().await.unwrap();

        let ids: Vec<Vec<String>> = batches
            .iter()
            .map(|b| b.documents.iter().map(|d| d.id.clone()).collect())
            .collect();
        assert_eq!(ids, vec![vec!["1", "2"], vec!["3"]]);
        assert_eq!(
            *source.fetched.lock().unwrap(),
            vec![None, Some("1".to_string()), Some("2".to_string())]
        );
        assert_eq!(*source.released.lock().unwrap(), vec!["3".to_string()]);
    }

    #[tokio::test]
    async fn scan_of_empty_source_yields_nothing() {
        let source = Arc::new(VecSource::new(vec![]));

        let batches: Vec<Batch> = scan(source.clone()).try_collect().await.unwrap();

        assert!(batches.is_empty());
        assert_eq!(*source.released.lock().unwrap(), vec!["1".to_string()]);
    }

    #[tokio::test]
    async fn scan_releases_final_page_cursor_once_consumed() {
        let source = Arc::new(VecSource::new(vec![vec![doc(1)], vec![doc(2)]]).ending_on_last_page());
        let mut batches = scan(source.clone());

        assert_eq!(batches.try_next().await.unwrap().unwrap().documents.len(), 1);
        let last = batches.try_next().await.unwrap().unwrap();
        assert!(!last.has_more);
        assert!(source.released.lock().unwrap().is_empty());

        assert!(batches.try_next().await.unwrap().is_none());
        assert_eq!(*source.released.lock().unwrap(), vec!["2".to_string()]);
        assert_eq!(source.fetched.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn scan_surfaces_fetch_errors() {
        let source = Arc::new(VecSource::new(vec![vec![doc(1)], vec![doc(2)]]).failing_at(1));
        let mut batches = scan(source);

        assert_eq!(batches.try_next().await.unwrap().unwrap().documents.len(), 1);
        assert!(matches!(
            batches.try_next().await,
            Err(migrator_core::Error::Elastic { status: 503, .. })
        ));
    }
}
