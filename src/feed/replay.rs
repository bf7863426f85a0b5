//! Recorded-feed replay from newline-delimited JSON.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Stream non-empty lines of `path` into a channel.
///
/// The reader stops early once the receiver is dropped (feed closed).
/// The task yields the number of lines sent.
pub fn spawn_replay(path: PathBuf, buffer: usize) -> (mpsc::Receiver<String>, JoinHandle<Result<u64>>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));

    let handle = tokio::spawn(async move {
        let file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open feed recording {}", path.display()))?;
        let mut lines = BufReader::new(file).lines();
        let mut sent = 0u64;

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if tx.send(line.to_string()).await.is_err() {
                debug!(sent, "Replay receiver closed");
                break;
            }
            sent += 1;
        }

        info!(path = %path.display(), lines = sent, "Replay finished");
        Ok(sent)
    });

    (rx, handle)
}
