use super::DocumentSink;
use crate::model::{Document, WriteOutcome};
use async_trait::async_trait;
use metrics::counter;
use migrator_core::Result;
use std::path::PathBuf;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info};

/// Appends documents as JSON lines to `<prefix>-<n>.jsonl` files, starting a
/// new file every `max_docs_per_file` documents.
pub struct JsonlSink {
    dir: PathBuf,
    prefix: String,
    label: String,
    max_docs_per_file: usize,
    writer: Option<BufWriter<File>>,
    docs_in_file: usize,
    files: Vec<PathBuf>,
}

impl JsonlSink {
    pub fn new(dir: impl Into<PathBuf>, prefix: String, max_docs_per_file: usize) -> Self {
        let dir = dir.into();
        Self {
            label: dir.display().to_string(),
            dir,
            prefix,
            max_docs_per_file: max_docs_per_file.max(1),
            writer: None,
            docs_in_file: 0,
            files: Vec::new(),
        }
    }

    /// Files written so far, in write order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    fn file_path(&self, number: usize) -> PathBuf {
        self.dir.join(format!("{}-{}.jsonl", self.prefix, number))
    }

    async fn open_next_file(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
        }

        let path = self.file_path(self.files.len() + 1);
        let file = File::create(&path).await?;
        debug!(path = %path.display(), "Opened dump file");

        self.files.push(path);
        self.writer = Some(BufWriter::new(file));
        self.docs_in_file = 0;
        Ok(())
    }
}

#[async_trait]
impl DocumentSink for JsonlSink {
    async fn prepare(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    async fn write_batch(&mut self, documents: &[Document]) -> Result<WriteOutcome> {
        for doc in documents {
            if self.writer.is_none() || self.docs_in_file >= self.max_docs_per_file {
                self.open_next_file().await?;
            }

            let mut line = serde_json::to_vec(doc)?;
            line.push(b'\n');
            if let Some(writer) = self.writer.as_mut() {
                writer.write_all(&line).await?;
            }
            self.docs_in_file += 1;
        }

        counter!("migrator_documents_written", "sink" => "jsonl").increment(documents.len() as u64);

        Ok(WriteOutcome {
            written: documents.len(),
            failures: Vec::new(),
        })
    }

    async fn finish(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.shutdown().await?;
        }

        info!(
            dir = %self.dir.display(),
            files = self.files.len(),
            "Dump files written"
        );
        Ok(())
    }

    fn sink_id(&self) -> &str {
        &self.label
    }
}
