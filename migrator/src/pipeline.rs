use crate::model::TransferReport;
use crate::sink::DocumentSink;
use crate::source::{scan, DocumentSource};
use chrono::Utc;
use futures::TryStreamExt;
use metrics::{gauge, histogram};
use migrator_core::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Streams every document of a source into a sink, one batch at a time.
pub struct Pipeline {
    source: Arc<dyn DocumentSource>,
    progress_interval: Duration,
}

impl Pipeline {
    pub fn new(source: Arc<dyn DocumentSource>, progress_interval: Duration) -> Self {
        Self {
            source,
            progress_interval,
        }
    }

    #[instrument(skip(self, sink), fields(source = self.source.source_id(), destination = sink.sink_id()))]
    pub async fn run(&self, sink: &mut dyn DocumentSink) -> Result<TransferReport> {
        let started_at = Utc::now();
        let start = Instant::now();

        let expected_total = self.source.count().await?;
        info!(expected_total, "Starting transfer");

        sink.prepare().await?;

        let mut report = TransferReport {
            source_index: self.source.source_id().to_string(),
            destination: sink.sink_id().to_string(),
            expected_total,
            documents_read: 0,
            documents_written: 0,
            batches: 0,
            failures: Vec::new(),
            started_at,
            elapsed: Duration::ZERO,
        };
        let mut progress = Progress::new(expected_total, self.progress_interval);

        let mut open_cursor = None;
        if let Err(e) = self
            .transfer(sink, &mut report, &mut progress, &mut open_cursor)
            .await
        {
            if let Some(cursor) = open_cursor {
                if let Err(release_err) = self.source.release(cursor).await {
                    warn!(error = %release_err, "Failed to release scroll cursor");
                }
            }
            return Err(e);
        }

        sink.finish().await?;

        report.elapsed = start.elapsed();
        progress.finish();

        Ok(report)
    }

    /// Scan the source into `sink`. `open_cursor` holds the cursor of the last
    /// batch taken from the scan until the scan has released it.
    async fn transfer(
        &self,
        sink: &mut dyn DocumentSink,
        report: &mut TransferReport,
        progress: &mut Progress,
        open_cursor: &mut Option<String>,
    ) -> Result<()> {
        let mut batches = scan(Arc::clone(&self.source));
        while let Some(batch) = batches.try_next().await? {
            open_cursor.clone_from(&batch.cursor);

            let batch_size = batch.documents.len();
            histogram!("migrator_batch_size").record(batch_size as f64);

            let outcome = sink.write_batch(&batch.documents).await?;

            report.batches += 1;
            report.documents_read += batch_size as u64;
            report.documents_written += outcome.written as u64;
            report.failures.extend(outcome.failures);

            progress.advance(batch_size as u64);
        }
        *open_cursor = None;

        Ok(())
    }
}

/// Tracks `done/total` and logs it at most once per interval.
struct Progress {
    total: u64,
    done: u64,
    interval: Duration,
    last_log: Option<Instant>,
}

impl Progress {
    fn new(total: u64, interval: Duration) -> Self {
        Self {
            total,
            done: 0,
            interval,
            last_log: None,
        }
    }

    fn ratio(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.done as f64 / self.total as f64).min(1.0)
    }

    fn advance(&mut self, count: u64) {
        self.done += count;
        gauge!("migrator_progress_ratio").set(self.ratio());

        let due = self
            .last_log
            .map_or(true, |last| last.elapsed() >= self.interval);
        if due {
            self.log();
            self.last_log = Some(Instant::now());
        }
    }

    fn finish(&self) {
        self.log();
    }

    fn log(&self) {
        info!(
            done = self.done,
            total = self.total,
            "Progress: {}/{} ({:.1}%)",
            self.done,
            self.total,
            self.ratio() * 100.0
        );
    }
}
