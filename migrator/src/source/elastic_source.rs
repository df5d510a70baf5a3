use super::DocumentSource;
use crate::elastic::ElasticApi;
use crate::model::Batch;
use async_trait::async_trait;
use metrics::{counter, histogram};
use migrator_core::Result;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

/// Scroll cursor over one index, filtered by a search body.
pub struct ElasticSource {
    client: Arc<dyn ElasticApi>,
    index: String,
    query: Value,
    docs_per_request: usize,
    keepalive: String,
}

impl ElasticSource {
    pub fn new(
        client: Arc<dyn ElasticApi>,
        index: String,
        query: Value,
        docs_per_request: usize,
        keepalive: String,
    ) -> Self {
        Self {
            client,
            index,
            query,
            docs_per_request,
            keepalive,
        }
    }
}

/// Search body for the scroll: the user query, paged, in index order unless
/// the query asks for a sort.
pub fn scan_body(query: &Value, docs_per_request: usize) -> Value {
    let mut body = query.clone();
    if let Some(fields) = body.as_object_mut() {
        fields.insert("size".to_string(), json!(docs_per_request));
        fields
            .entry("sort")
            .or_insert_with(|| json!(["_doc"]));
    }
    body
}

/// `_count` only accepts the `query` clause of a search body.
pub fn count_body(query: &Value) -> Value {
    match query.get("query") {
        Some(clause) => json!({ "query": clause }),
        None => json!({}),
    }
}

#[async_trait]
impl DocumentSource for ElasticSource {
    async fn count(&self) -> Result<u64> {
        self.client.count(&self.index, &count_body(&self.query)).await
    }

    #[instrument(skip(self, cursor), fields(index = %self.index))]
    async fn fetch_page(&self, cursor: Option<String>) -> Result<Batch> {
        let start = Instant::now();

        let page = match &cursor {
            None => {
                let body = scan_body(&self.query, self.docs_per_request);
                self.client
                    .open_scroll(&self.index, &body, &self.keepalive)
                    .await?
            }
            Some(scroll_id) => {
                self.client
                    .continue_scroll(&self.index, scroll_id, &self.keepalive)
                    .await?
            }
        };

        histogram!("migrator_fetch_duration_ms").record(start.elapsed().as_millis() as f64);
        counter!("migrator_documents_read", "index" => self.index.clone())
            .increment(page.documents.len() as u64);

        debug!(
            fetched = page.documents.len(),
            duration_ms = start.elapsed().as_millis(),
            "Fetched scroll page"
        );

        // The scroll id may change between pages; fall back to the last known one
        let has_more = !page.documents.is_empty();
        Ok(Batch {
            documents: page.documents,
            cursor: page.scroll_id.or(cursor),
            has_more,
        })
    }

    async fn release(&self, cursor: String) -> Result<()> {
        self.client.clear_scroll(&cursor).await
    }

    fn source_id(&self) -> &str {
        &self.index
    }

    async fn health_check(&self) -> Result<()> {
        self.client.ping().await
    }
}
