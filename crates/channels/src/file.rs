//! File-drop transport: one JSON file per envelope in a shared directory.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use proto::{ChannelAddress, ChannelError, Envelope};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{
    Acknowledgement, ChannelReceiver, ChannelSender, InboundDelivery, dispatch, wait_for_stop,
};

/// Transport tag of the file-drop channel.
pub const FILE_TRANSPORT: &str = "file";

/// Default interval between directory scans.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const ENVELOPE_EXT: &str = "json";
const POISON_EXT: &str = "poison";

/// Expands `~` at the start of a path to `$HOME`.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix('~') {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(format!("{home}{rest}"))
    } else {
        PathBuf::from(path)
    }
}

/// Drop-file name; the millisecond prefix keeps name order close to arrival order.
fn drop_file_name() -> String {
    format!(
        "{:013}-{}.{ENVELOPE_EXT}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4()
    )
}

fn is_envelope_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == ENVELOPE_EXT)
}

// ─── Sender ────────────────────────────────────────────────

/// Writes envelopes atomically (temp file + rename) into the address directory.
#[derive(Default)]
pub struct FileSender;

impl FileSender {
    /// Creates a file-drop sender.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChannelSender for FileSender {
    fn transport(&self) -> &str {
        FILE_TRANSPORT
    }

    async fn send(
        &self,
        address: &ChannelAddress,
        envelope: &Envelope,
    ) -> Result<(), ChannelError> {
        let dir = expand_tilde(address.location());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ChannelError::SendFailed(format!("create {}: {e}", dir.display())))?;

        let payload = envelope
            .to_wire()
            .map_err(|e| ChannelError::Serialization(e.to_string()))?;

        let name = drop_file_name();
        let tmp = dir.join(format!("{name}.tmp"));
        let target = dir.join(&name);
        tokio::fs::write(&tmp, payload)
            .await
            .map_err(|e| ChannelError::SendFailed(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| ChannelError::SendFailed(format!("rename {}: {e}", tmp.display())))?;

        debug!(message_id = %envelope.id, file = %target.display(), "Envelope dropped");
        Ok(())
    }
}

// ─── Receiver ──────────────────────────────────────────────

/// Polls the address directory and deletes files once accepted.
pub struct FileReceiver {
    address: ChannelAddress,
    dir: PathBuf,
    poll_interval: Duration,
}

impl FileReceiver {
    /// Creates a receiver scanning the address directory every `poll_interval`.
    pub fn new(address: ChannelAddress, poll_interval: Duration) -> Self {
        let dir = expand_tilde(address.location());
        Self {
            address,
            dir,
            poll_interval,
        }
    }

    /// Envelope files currently waiting, in name order.
    async fn pending_files(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_envelope_file(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Moves an undecodable file aside so it is not rescanned.
    async fn quarantine(&self, path: &Path) {
        let poison = path.with_extension(POISON_EXT);
        if let Err(e) = tokio::fs::rename(path, &poison).await {
            error!(file = %path.display(), "Failed to quarantine envelope file: {e}");
        }
    }

    /// Delivers every pending file; stops at the first rejection so order holds.
    async fn drain(
        &self,
        tx: &mpsc::Sender<InboundDelivery>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), ChannelError> {
        let files = match self.pending_files().await {
            Ok(files) => files,
            Err(e) => {
                warn!(dir = %self.dir.display(), "Failed to scan drop directory: {e}");
                return Ok(());
            }
        };

        for path in files {
            if *shutdown.borrow() {
                break;
            }

            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(file = %path.display(), "Failed to read envelope file: {e}");
                    continue;
                }
            };
            let envelope = match Envelope::from_wire(&bytes) {
                Ok(envelope) => envelope,
                Err(e) => {
                    error!(file = %path.display(), "Malformed envelope file: {e}");
                    self.quarantine(&path).await;
                    continue;
                }
            };

            match dispatch(tx, &self.address, envelope).await? {
                Acknowledgement::Accepted => {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!(file = %path.display(), "Failed to remove delivered file: {e}");
                    }
                }
                Acknowledgement::Rejected(reason) => {
                    debug!(file = %path.display(), "Delivery rejected, retrying later: {reason}");
                    break;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelReceiver for FileReceiver {
    fn address(&self) -> &ChannelAddress {
        &self.address
    }

    async fn run(
        self: Box<Self>,
        tx: mpsc::Sender<InboundDelivery>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ChannelError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            ChannelError::ConnectionFailed(format!("create {}: {e}", self.dir.display()))
        })?;
        info!(address = %self.address, "File channel watching");

        let probe = shutdown.clone();
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = wait_for_stop(&mut shutdown) => break,
                _ = ticker.tick() => {
                    if self.drain(&tx, &probe).await.is_err() {
                        debug!(address = %self.address, "Gateway queue closed");
                        break;
                    }
                }
            }
        }

        info!(address = %self.address, "File channel stopped");
        Ok(())
    }
}
