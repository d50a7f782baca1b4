/// Bounded, persisted FIFO of readings awaiting delivery
///
/// Storage is a JSON Lines file, one `QueueEntry` per line, oldest first.
/// Plain enqueues append a line; trims and acknowledgements rewrite the
/// file through a temporary sibling and an atomic rename. The in-memory
/// copy mirrors the file and is the source for reads.
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io;
use std::iter;
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::models::Reading;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Enqueue order, strictly increasing across restarts
    pub seq: u64,
    #[serde(with = "crate::utils::timestamp")]
    pub enqueued_at: OffsetDateTime,
    pub reading: Reading,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    pub count: usize,
    pub approx_size_bytes: u64,
    pub oldest: Option<OffsetDateTime>,
    pub newest: Option<OffsetDateTime>,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to persist queue to {path}: {source}")]
    PersistFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to load queue from {path}: {source}")]
    LoadFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub struct DurableQueue {
    path: PathBuf,
    capacity: usize,
    entries: VecDeque<QueueEntry>,
    next_seq: u64,
}

impl DurableQueue {
    /// Open the queue at `path`, loading whatever survived the last run
    pub async fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self, QueueError> {
        let path = path.into();
        let capacity = capacity.max(1);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = fs::create_dir_all(parent).await {
                warn!("Cannot create queue directory {}: {}", parent.display(), e);
            }
        }

        let entries = load_entries(&path).await.map_err(|source| QueueError::LoadFailed {
            path: path.clone(),
            source,
        })?;
        let next_seq = entries.back().map_or(0, |entry| entry.seq + 1);

        let mut queue = DurableQueue {
            path,
            capacity,
            entries,
            next_seq,
        };

        if queue.entries.len() > capacity {
            let excess = queue.entries.len() - capacity;
            queue.entries.drain(..excess);
            if let Err(e) = queue.rewrite().await {
                error!("Failed to trim offline storage on load: {}", e);
            }
            info!("Trimmed offline storage to {} records", capacity);
        }

        info!(
            "Offline storage initialized: {} ({} pending, capacity {})",
            queue.path.display(),
            queue.entries.len(),
            capacity
        );
        Ok(queue)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append a reading, evicting the oldest entries past capacity
    ///
    /// The reading is only kept if it reached storage; on
    /// `PersistFailed` the queue is left exactly as it was.
    pub async fn enqueue(&mut self, reading: Reading) -> Result<(), QueueError> {
        let entry = QueueEntry {
            seq: self.next_seq,
            enqueued_at: OffsetDateTime::now_utc(),
            reading,
        };
        let overflow = (self.entries.len() + 1).saturating_sub(self.capacity);

        let persisted = if overflow == 0 {
            self.append(&entry).await
        } else {
            let survivors = self.entries.iter().skip(overflow);
            write_atomically(&self.path, survivors.chain(iter::once(&entry))).await
        };
        persisted.map_err(|source| QueueError::PersistFailed {
            path: self.path.clone(),
            source,
        })?;

        if overflow > 0 {
            self.entries.drain(..overflow);
            info!("Trimmed offline storage to {} records", self.capacity);
        }
        self.entries.push_back(entry);
        self.next_seq += 1;
        info!("Stored offline (total: {})", self.entries.len());
        Ok(())
    }

    /// Up to `n` oldest entries, oldest first, without removing them
    pub fn peek_batch(&self, n: usize) -> Vec<QueueEntry> {
        self.entries.iter().take(n).cloned().collect()
    }

    /// Remove the `n` oldest entries after the caller confirmed delivery
    ///
    /// The in-memory prefix is dropped even when the rewrite fails, so the
    /// same entries are not replayed again in this process; after a restart
    /// they may be delivered a second time.
    pub async fn acknowledge(&mut self, n: usize) -> Result<(), QueueError> {
        let n = n.min(self.entries.len());
        if n == 0 {
            return Ok(());
        }

        self.entries.drain(..n);
        let result = if self.entries.is_empty() {
            match fs::remove_file(&self.path).await {
                Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            }
        } else {
            self.rewrite().await
        };
        result.map_err(|source| QueueError::PersistFailed {
            path: self.path.clone(),
            source,
        })?;

        if self.entries.is_empty() {
            info!("All {} records synced, offline storage cleared", n);
        } else {
            info!(
                "Removed {} synced records, {} remaining",
                n,
                self.entries.len()
            );
        }
        Ok(())
    }

    pub async fn stats(&self) -> QueueStats {
        let timestamps = self.entries.iter().map(|e| e.reading.captured_at());
        QueueStats {
            count: self.entries.len(),
            approx_size_bytes: fs::metadata(&self.path).await.map_or(0, |m| m.len()),
            oldest: timestamps.clone().min(),
            newest: timestamps.max(),
        }
    }

    async fn append(&self, entry: &QueueEntry) -> io::Result<()> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await
    }

    async fn rewrite(&self) -> io::Result<()> {
        write_atomically(&self.path, self.entries.iter()).await
    }
}

async fn load_entries(path: &Path) -> io::Result<VecDeque<QueueEntry>> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(VecDeque::new()),
        Err(e) => return Err(e),
    };

    let mut entries = VecDeque::new();
    for (number, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<QueueEntry>(line) {
            Ok(entry) => entries.push_back(entry),
            Err(e) => warn!(
                "Skipping unreadable queue record at {}:{}: {}",
                path.display(),
                number + 1,
                e
            ),
        }
    }
    Ok(entries)
}

fn encode<'a>(entries: impl Iterator<Item = &'a QueueEntry>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    for entry in entries {
        serde_json::to_writer(&mut buf, entry)?;
        buf.push(b'\n');
    }
    Ok(buf)
}

/// Replace the file with `entries` through a temporary sibling and a rename
async fn write_atomically<'a>(
    path: &Path,
    entries: impl Iterator<Item = &'a QueueEntry>,
) -> io::Result<()> {
    let contents = encode(entries)?;
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = File::create(&tmp).await?;
    file.write_all(&contents).await?;
    file.sync_data().await?;
    drop(file);
    fs::rename(&tmp, path).await
}
