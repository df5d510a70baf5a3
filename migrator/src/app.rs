use crate::elastic::{ElasticApi, ElasticClient};
use crate::model::TransferReport;
use crate::pipeline::Pipeline;
use crate::sink::{IndexSink, JsonlSink};
use crate::source::{DocumentSource, ElasticSource};
use migrator_core::{Config, Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

pub struct App {
    config: Config,
    source_client: Arc<ElasticClient>,
}

impl App {
    #[instrument(skip(config))]
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing application");

        let source_client = Arc::new(ElasticClient::new(&config.source)?);

        Ok(Self {
            config,
            source_client,
        })
    }

    async fn pipeline(&self, src_index: &str) -> Result<Pipeline> {
        let query = self
            .config
            .transfer
            .query_body()
            .map_err(|e| Error::Validation(e.to_string()))?;

        let source = ElasticSource::new(
            Arc::clone(&self.source_client) as Arc<dyn ElasticApi>,
            src_index.to_string(),
            query,
            self.config.transfer.docs_per_request,
            self.config.transfer.scroll_keepalive.clone(),
        );

        info!(hosts = ?self.source_client.hosts(), "Performing health checks");
        source.health_check().await?;

        Ok(Pipeline::new(
            Arc::new(source),
            Duration::from_secs(self.config.transfer.progress_interval_secs),
        ))
    }

    pub async fn run_migrate(&self, src_index: &str, dst_index: &str) -> Result<TransferReport> {
        let pipeline = self.pipeline(src_index).await?;

        let destination = Arc::new(ElasticClient::new(&self.config.destination)?);
        destination.ping().await?;

        let template = if self.config.transfer.copy_index_settings {
            Some(self.source_client.index_template(src_index).await?)
        } else {
            None
        };

        let mut sink = IndexSink::new(destination, dst_index.to_string(), template);
        pipeline.run(&mut sink).await
    }

    pub async fn run_dump(&self, src_index: &str) -> Result<TransferReport> {
        let pipeline = self.pipeline(src_index).await?;

        let mut sink = JsonlSink::new(
            self.config.dump.dir.clone(),
            src_index.to_string(),
            self.config.dump.max_docs_per_file,
        );
        let report = pipeline.run(&mut sink).await?;

        info!(files = ?sink.files(), "Dump complete");
        Ok(report)
    }
}
