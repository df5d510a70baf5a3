use super::DocumentSink;
use crate::elastic::ElasticApi;
use crate::model::{Document, IndexTemplate, WriteOutcome};
use async_trait::async_trait;
use metrics::counter;
use migrator_core::Result;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Bulk-indexes batches into an index on the destination cluster.
pub struct IndexSink {
    client: Arc<dyn ElasticApi>,
    index: String,
    template: Option<IndexTemplate>,
}

impl IndexSink {
    /// `template` is used to create `index` when it does not exist yet.
    /// Without one, the cluster creates it on first write.
    pub fn new(client: Arc<dyn ElasticApi>, index: String, template: Option<IndexTemplate>) -> Self {
        Self {
            client,
            index,
            template,
        }
    }
}

#[async_trait]
impl DocumentSink for IndexSink {
    #[instrument(skip(self), fields(index = %self.index))]
    async fn prepare(&mut self) -> Result<()> {
        let Some(template) = &self.template else {
            return Ok(());
        };

        if self.client.index_exists(&self.index).await? {
            info!("Destination index exists, keeping its settings and mappings");
            return Ok(());
        }

        info!("Creating destination index from source settings and mappings");
        self.client.create_index(&self.index, template).await
    }

    async fn write_batch(&mut self, documents: &[Document]) -> Result<WriteOutcome> {
        let outcome = self.client.bulk_index(&self.index, documents).await?;

        counter!("migrator_documents_written", "sink" => "index").increment(outcome.written as u64);

        if let Some(first) = outcome.failures.first() {
            counter!("migrator_bulk_failures").increment(outcome.failures.len() as u64);
            warn!(
                index = %self.index,
                failed = outcome.failures.len(),
                first_id = ?first.id,
                first_status = first.status,
                first_reason = %first.reason,
                "Bulk request reported failed items"
            );
        }

        Ok(outcome)
    }

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    fn sink_id(&self) -> &str {
        &self.index
    }
}
