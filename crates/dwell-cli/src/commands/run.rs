//! Run command: the long-lived engine process.
//!
//! Signals and host envelopes arrive as JSON lines on stdin. Host messages
//! leave over HTTP when `host_url` is configured, otherwise as JSON lines on
//! stdout. Logs go to stderr.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use dwell_core::{Clock, Engine, MemoryStore, StateStore, SystemClock};
use dwell_db::Database;
use dwell_sync::{Bridge, HostChannel, HttpChannel, JsonLinesChannel};
use fs2::FileExt;
use tokio::io::BufReader;

use crate::Config;
use crate::runtime::{InitLock, Runtime, forward_lines};

/// Takes the exclusive engine lock, creating the lock file if needed.
///
/// The lock is held until the returned file is dropped.
pub fn acquire_lock(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("failed to create data directory")?;
    }
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.try_lock_exclusive()
        .with_context(|| format!("another dwell engine holds {}", path.display()))?;
    Ok(file)
}

fn host_channel(config: &Config) -> Result<HostChannel> {
    match &config.host_url {
        Some(url) => {
            let channel = HttpChannel::new(url).context("failed to set up host channel")?;
            tracing::info!(endpoint = channel.endpoint(), "delivering host messages over HTTP");
            Ok(HostChannel::Http(channel))
        }
        None => Ok(HostChannel::Stdout(JsonLinesChannel::stdout())),
    }
}

pub async fn run(config: &Config, ephemeral: bool) -> Result<()> {
    config.engine.validate().context("invalid engine configuration")?;
    let channel = host_channel(config)?;

    if ephemeral {
        tracing::info!("running with in-memory storage");
        return serve(config, MemoryStore::new(), channel).await;
    }

    let _lock = acquire_lock(&config.lock_path())?;
    let db = Database::open(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    serve(config, db, channel).await
}

async fn serve<S>(config: &Config, store: S, channel: HostChannel) -> Result<()>
where
    S: StateStore + Send + 'static,
{
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let engine_config = config.engine.clone();
    let lock = InitLock::new();
    let handle = lock
        .get_or_init(move || async move {
            let (engine, report) = Engine::boot(engine_config.clone(), store, Arc::clone(&clock))
                .context("recovery failed")?;
            tracing::info!(
                reattached = ?report.reattached,
                stale = report.stale_finalized.len(),
                inconsistencies = report.inconsistencies_resolved.len(),
                unsynced = report.unsynced,
                "recovery complete"
            );
            let bridge = Bridge::new(channel, &engine_config, Arc::clone(&clock));
            anyhow::Ok(Runtime::new(engine, bridge, clock))
        })
        .await?;

    let reader = tokio::spawn(forward_lines(BufReader::new(tokio::io::stdin()), handle.sender()));
    let engine = handle.join().await?;
    match reader.await {
        Ok(result) => result?,
        Err(err) => tracing::warn!(error = %err, "input reader did not finish"),
    }

    if let Some(engine) = engine {
        tracing::info!(pending_writes = engine.pending_writes(), "engine stopped");
    }
    Ok(())
}
