//! Periodic device discovery.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::hub::HubEvent;

/// Names of the entries in `class_dir`, sorted.
pub async fn scan(class_dir: &Path) -> io::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(class_dir).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Rescan `class_dir` every `interval` and report the result to the hub.
///
/// An unreadable directory reports no devices.
pub async fn run(
    class_dir: PathBuf,
    interval: Duration,
    events: mpsc::Sender<HubEvent>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let names = scan(&class_dir).await.unwrap_or_else(|e| {
                    debug!(dir = %class_dir.display(), error = %e, "device scan failed");
                    Vec::new()
                });
                if events.send(HubEvent::DevicesScanned(names)).await.is_err() {
                    break;
                }
            }
        }
    }
}
