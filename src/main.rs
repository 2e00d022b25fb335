use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use tunnel::config::ClientConfig;
use tunnel::tus::{LoggingDelegate, TusClient, UploadEvent, UploadId};

/// Upload files to a tus server, resuming anything a previous run left unfinished
#[derive(Debug, Parser)]
#[command(name = "tunnel-upload", version)]
struct Cli {
    /// Path to the client configuration
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Metadata attached to every upload, as key=value
    #[arg(short, long = "meta", value_parser = parse_meta)]
    meta: Vec<(String, String)>,

    /// Files to upload
    files: Vec<PathBuf>,
}

/// Uploads this run waits for, and how many of them did not complete
#[derive(Debug, Default)]
struct Tracker {
    pending: HashSet<UploadId>,
    failed: usize,
}

impl Tracker {
    fn track(&mut self, upload_id: UploadId) {
        self.pending.insert(upload_id);
    }

    fn observe(&mut self, event: &UploadEvent) {
        match event {
            UploadEvent::Completed { upload_id, .. } => {
                self.pending.remove(upload_id);
            }
            UploadEvent::Failed { upload_id: Some(upload_id), .. } | UploadEvent::Canceled { upload_id } => {
                self.pending.remove(upload_id);
                self.failed += 1;
            }
            _ => {}
        }
    }

    /// Gives up on tracked uploads that left the queue without an observed
    /// outcome; they count as not completed.
    fn forget_unqueued(&mut self, queued: &HashSet<UploadId>) {
        let before = self.pending.len();
        self.pending.retain(|upload_id| queued.contains(upload_id));
        let lost = before - self.pending.len();
        if lost > 0 {
            tracing::warn!(lost, "Upload outcome unknown");
            self.failed += lost;
        }
    }

    fn is_done(&self) -> bool {
        self.pending.is_empty()
    }
}

fn parse_meta(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got `{}`", raw))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ClientConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let client = TusClient::new(config, Arc::new(LoggingDelegate))
        .await
        .context("starting upload client")?;

    // subscribe before enqueueing so no terminal event is missed
    let mut events = client.manager().subscribe_filtered(|event: &UploadEvent| {
        matches!(
            event,
            UploadEvent::Completed { .. } | UploadEvent::Failed { .. } | UploadEvent::Canceled { .. }
        )
    });

    let mut tracker = Tracker::default();
    // uploads resumed from the state file
    for record in client.uploads().await? {
        tracker.track(record.id);
    }

    let metadata: BTreeMap<String, String> = cli.meta.into_iter().collect();
    for path in &cli.files {
        let upload_id = client
            .upload_file(path, metadata.clone())
            .await
            .with_context(|| format!("queueing {}", path.display()))?;
        tracker.track(upload_id);
    }

    if tracker.is_done() {
        tracing::info!("Nothing to upload");
    }

    while !tracker.is_done() {
        match events.recv().await {
            Ok(event) => {
                if let UploadEvent::Completed { upload_id, upload_url: Some(url) } = &event {
                    println!("{} {}", upload_id, url);
                }
                tracker.observe(&event);
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Missed upload events");
                let mut queued = HashSet::new();
                for record in client.uploads().await? {
                    queued.insert(record.id);
                }
                tracker.forget_unqueued(&queued);
            }
            Err(RecvError::Closed) => {
                tracker.forget_unqueued(&HashSet::new());
            }
        }
    }
    let failed = tracker.failed;

    client.shutdown().await?;

    if failed > 0 {
        bail!("{} upload(s) did not complete", failed);
    }
    Ok(())
}
