mod app;
mod elastic;
mod model;
mod pipeline;
mod sink;
mod source;

use clap::{Parser, Subcommand};
use crate::model::TransferReport;
use migrator_core::{telemetry, Config};
use std::path::PathBuf;
use std::process;
use tracing::{error, info, warn};

/// Number of rejected documents spelled out in the final report
const LOGGED_FAILURES: usize = 10;

#[derive(Parser)]
#[clap(name = "migrator")]
#[clap(about = "Copy an Elasticsearch index into another index or dump it to JSONL", version)]
struct Cli {
    /// Source Elasticsearch hosts (comma-separated)
    #[clap(long, global = true, env = "SRC_ES_HOSTS")]
    src_hosts: Option<String>,

    /// Search body selecting the documents to transfer, as JSON
    #[clap(long, global = true)]
    query: Option<String>,

    /// Max docs per scroll request
    #[clap(long, global = true)]
    docs_per_request: Option<usize>,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy documents into an index, creating it like the source if missing
    Migrate {
        #[clap(long)]
        src_index: String,

        #[clap(long)]
        dst_index: String,

        /// Destination Elasticsearch hosts (comma-separated)
        #[clap(long, env = "DST_ES_HOSTS")]
        dst_hosts: Option<String>,
    },

    /// Dump documents to JSONL files
    Dump {
        #[clap(long)]
        src_index: String,

        /// Destination directory
        #[clap(long)]
        dst_dir: Option<PathBuf>,

        /// Max docs per dump file
        #[clap(long)]
        max_docs_per_file: Option<usize>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        error!(error = %e, "Fatal error");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration; telemetry falls back to defaults so load errors are still logged
    let loaded = Config::load();
    let telemetry_config = match &loaded {
        Ok(config) => config.telemetry.clone(),
        Err(_) => Config::default().telemetry,
    };
    telemetry::init(&telemetry_config)?;

    let mut config = loaded.map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;

    // Override config with CLI args
    if let Some(hosts) = cli.src_hosts {
        config.source.hosts = hosts;
    }
    if let Some(query) = cli.query {
        config.transfer.query = query;
    }
    if let Some(docs_per_request) = cli.docs_per_request {
        config.transfer.docs_per_request = docs_per_request;
    }

    let (src_index, command) = match cli.command {
        Commands::Migrate {
            src_index,
            dst_index,
            dst_hosts,
        } => {
            if let Some(hosts) = dst_hosts {
                config.destination.hosts = hosts;
            }
            (src_index, Some(dst_index))
        }
        Commands::Dump {
            src_index,
            dst_dir,
            max_docs_per_file,
        } => {
            if let Some(dir) = dst_dir {
                config.dump.dir = dir;
            }
            if let Some(max) = max_docs_per_file {
                config.dump.max_docs_per_file = max;
            }
            (src_index, None)
        }
    };

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid settings: {}", e))?;

    let app = app::App::new(config).await?;

    let report = match command {
        Some(dst_index) => {
            info!(src = %src_index, dst = %dst_index, "Migrating index");
            app.run_migrate(&src_index, &dst_index).await?
        }
        None => {
            info!(src = %src_index, "Dumping index");
            app.run_dump(&src_index).await?
        }
    };

    log_report(&report);
    telemetry::shutdown();

    if !report.failures.is_empty() {
        anyhow::bail!(
            "{} of {} documents were rejected by {}",
            report.failures.len(),
            report.documents_read,
            report.destination
        );
    }

    Ok(())
}

fn log_report(report: &TransferReport) {
    for failure in report.failures.iter().take(LOGGED_FAILURES) {
        warn!(
            id = ?failure.id,
            status = failure.status,
            reason = %failure.reason,
            "Document rejected"
        );
    }

    if report.documents_read != report.expected_total {
        warn!(
            expected = report.expected_total,
            read = report.documents_read,
            "Document count changed while scanning"
        );
    }

    info!(
        source = %report.source_index,
        destination = %report.destination,
        read = report.documents_read,
        written = report.documents_written,
        failed = report.failures.len(),
        batches = report.batches,
        started_at = %report.started_at,
        elapsed_ms = report.elapsed.as_millis() as u64,
        complete = report.is_complete(),
        "Transfer finished"
    );
}
