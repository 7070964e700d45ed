//! Chunked attachment uploads.
//!
//! Clients upload large attachments as a series of `(offset, bytes)` pieces
//! keyed by a transfer id. Each piece is written in place into a per-transfer
//! file under `<data_dir>/chunks`, named by the SHA-256 of the id, so pieces
//! may arrive in any order and a repeated piece rewrites the same bytes. The
//! terminal piece finalizes the transfer: the assembled bytes go to a
//! [`CompletionSink`], and only once the sink accepts them is the backing
//! file removed.
//!
//! Transfers that never see a terminal piece are evicted after the configured
//! idle TTL by [`ChunkAssembler::evict_expired`].

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;

use crate::bridge::BridgeError;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("No attachment name provided")]
    MissingTransferName,

    #[error("No temp GUID provided with message!")]
    MissingCorrelationId,

    #[error("Invalid attachment transfer id")]
    InvalidTransferId,

    #[error("Attachment transfer {0} already completed")]
    AlreadyFinalized(String),

    #[error("chunk storage error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Sink(#[from] BridgeError),
}

impl ChunkError {
    /// Errors the client caused and can correct.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ChunkError::MissingTransferName
                | ChunkError::MissingCorrelationId
                | ChunkError::InvalidTransferId
                | ChunkError::AlreadyFinalized(_)
        )
    }
}

/// Metadata that must be present by the time a transfer finalizes.
#[derive(Debug, Clone, Default)]
pub struct TransferSidecar {
    pub transfer_name: Option<String>,
    pub correlation_id: Option<String>,
    /// The transfer belongs to an outgoing message and needs a correlation id.
    pub carries_message: bool,
}

impl TransferSidecar {
    fn validate(&self) -> Result<String, ChunkError> {
        let name = self
            .transfer_name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or(ChunkError::MissingTransferName)?;
        if self.carries_message && self.correlation_id.as_deref().is_none_or(str::is_empty) {
            return Err(ChunkError::MissingCorrelationId);
        }
        Ok(name.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledTransfer {
    pub transfer_id: String,
    pub transfer_name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Piece stored, more expected.
    Saved,
    /// Terminal piece processed and the transfer handed to the sink.
    Completed,
}

/// Receives a fully assembled transfer.
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn complete(&self, transfer: AssembledTransfer) -> Result<(), BridgeError>;
}

struct TransferState {
    finalized: bool,
}

struct TransferEntry {
    state: Arc<tokio::sync::Mutex<TransferState>>,
    last_touched: Instant,
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, TransferEntry>,
    /// Finalized ids, kept for one TTL so late duplicates are refused.
    finished: HashMap<String, Instant>,
}

pub struct ChunkAssembler {
    dir: PathBuf,
    ttl: Duration,
    registry: Mutex<Registry>,
}

impl ChunkAssembler {
    /// Create the assembler, discarding any buffers left by a previous run.
    pub async fn new(dir: PathBuf, ttl: Duration) -> Result<Self, ChunkError> {
        if fs::try_exists(&dir).await? {
            fs::remove_dir_all(&dir).await?;
        }
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            ttl,
            registry: Mutex::new(Registry::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pending_count(&self) -> usize {
        self.registry.lock().active.len()
    }

    /// Apply one piece of a transfer.
    ///
    /// `is_final == Some(false)` stores the piece and returns
    /// [`ChunkOutcome::Saved`]. `Some(true)` or `None` finalizes. A sidecar
    /// validation failure leaves the transfer in place.
    pub async fn ingest(
        &self,
        transfer_id: &str,
        offset: u64,
        bytes: &[u8],
        is_final: Option<bool>,
        sidecar: &TransferSidecar,
        sink: &dyn CompletionSink,
    ) -> Result<ChunkOutcome, ChunkError> {
        let key = validate_transfer_id(transfer_id)?;
        let state = self.touch(key)?;
        let mut guard = state.lock().await;
        if guard.finalized {
            return Err(ChunkError::AlreadyFinalized(transfer_id.to_string()));
        }

        let path = self.buffer_path(key);
        write_at(&path, offset, bytes).await?;
        tracing::debug!(
            target: "chunks",
            transfer = key,
            offset,
            len = bytes.len(),
            "stored chunk"
        );

        if is_final == Some(false) {
            return Ok(ChunkOutcome::Saved);
        }

        let transfer_name = sidecar.validate()?;
        let assembled = fs::read(&path).await?;
        let len = assembled.len();

        // The transfer stays retryable until the sink takes it.
        sink.complete(AssembledTransfer {
            transfer_id: transfer_id.to_string(),
            transfer_name,
            bytes: assembled,
        })
        .await?;

        guard.finalized = true;
        {
            let mut registry = self.registry.lock();
            registry.active.remove(key);
            registry.finished.insert(key.to_string(), Instant::now());
        }
        drop(guard);
        if let Err(e) = fs::remove_file(&path).await {
            tracing::warn!(
                target: "chunks",
                transfer = key,
                error = %e,
                "failed to remove transfer buffer"
            );
        }

        tracing::info!(target: "chunks", transfer = key, bytes = len, "transfer assembled");
        Ok(ChunkOutcome::Completed)
    }

    fn buffer_path(&self, transfer_id: &str) -> PathBuf {
        self.dir.join(buffer_name(transfer_id))
    }

    fn touch(&self, key: &str) -> Result<Arc<tokio::sync::Mutex<TransferState>>, ChunkError> {
        let mut registry = self.registry.lock();
        if registry.finished.contains_key(key) {
            return Err(ChunkError::AlreadyFinalized(key.to_string()));
        }
        let entry = registry
            .active
            .entry(key.to_string())
            .or_insert_with(|| TransferEntry {
                state: Arc::new(tokio::sync::Mutex::new(TransferState { finalized: false })),
                last_touched: Instant::now(),
            });
        entry.last_touched = Instant::now();
        Ok(entry.state.clone())
    }

    /// Drop transfers idle for longer than the TTL. Returns how many went.
    pub async fn evict_expired(&self) -> usize {
        let expired: Vec<String> = {
            let mut registry = self.registry.lock();
            let ttl = self.ttl;
            registry.finished.retain(|_, at| at.elapsed() < ttl);
            let keys: Vec<String> = registry
                .active
                .iter()
                .filter(|(_, entry)| entry.last_touched.elapsed() >= ttl)
                // A transfer mid-write is not idle.
                .filter(|(_, entry)| entry.state.try_lock().is_ok())
                .map(|(key, _)| key.clone())
                .collect();
            for key in &keys {
                registry.active.remove(key);
            }
            keys
        };

        for key in &expired {
            let path = self.buffer_path(key);
            match fs::remove_file(&path).await {
                Ok(()) => tracing::debug!(target: "chunks", transfer = %key, "evicted idle transfer"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    target: "chunks",
                    transfer = %key,
                    error = %e,
                    "failed to remove idle transfer buffer"
                ),
            }
        }
        if !expired.is_empty() {
            tracing::info!(target: "chunks", count = expired.len(), "evicted idle transfers");
        }
        expired.len()
    }

    /// Run [`evict_expired`](Self::evict_expired) every `interval` until shutdown.
    pub fn start_sweep_task(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.evict_expired().await;
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

async fn write_at(path: &Path, offset: u64, bytes: &[u8]) -> Result<(), std::io::Error> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(bytes).await?;
    file.flush().await
}

fn validate_transfer_id(id: &str) -> Result<&str, ChunkError> {
    if id.trim().is_empty() || id.len() > 200 {
        return Err(ChunkError::InvalidTransferId);
    }
    Ok(id)
}

/// Buffer file name for a transfer id. Distinct ids never share a file and
/// the name never leaves the chunk directory.
fn buffer_name(id: &str) -> String {
    format!("{:x}", Sha256::digest(id.as_bytes()))
}

/// Coerce a client-supplied offset: non-integers and negatives become 0.
pub fn normalize_offset(value: &Value) -> u64 {
    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_u64() {
                v
            } else if let Some(f) = n.as_f64() {
                if f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 {
                    f as u64
                } else {
                    0
                }
            } else {
                0
            }
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSink {
        completed: Mutex<Vec<AssembledTransfer>>,
    }

    #[async_trait]
    impl CompletionSink for RecordingSink {
        async fn complete(&self, transfer: AssembledTransfer) -> Result<(), BridgeError> {
            self.completed.lock().push(transfer);
            Ok(())
        }
    }

    fn named(name: &str) -> TransferSidecar {
        TransferSidecar {
            transfer_name: Some(name.to_string()),
            correlation_id: Some("temp-1".to_string()),
            carries_message: true,
        }
    }

    async fn assembler(ttl: Duration) -> (ChunkAssembler, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let a = ChunkAssembler::new(dir.path().join("chunks"), ttl)
            .await
            .unwrap();
        (a, dir)
    }

    #[tokio::test]
    async fn test_out_of_order_pieces_assemble() {
        let (a, _dir) = assembler(Duration::from_secs(60)).await;
        let sink = RecordingSink::default();
        let sidecar = named("photo.jpg");

        let out = a
            .ingest("att-1", 5, b"world", Some(false), &sidecar, &sink)
            .await
            .unwrap();
        assert_eq!(out, ChunkOutcome::Saved);
        let out = a
            .ingest("att-1", 0, b"hello", Some(true), &sidecar, &sink)
            .await
            .unwrap();
        assert_eq!(out, ChunkOutcome::Completed);

        let completed = sink.completed.lock();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].bytes, b"helloworld");
        assert_eq!(completed[0].transfer_name, "photo.jpg");
        assert_eq!(a.pending_count(), 0);
        assert!(!a.buffer_path("att-1").exists());
    }

    #[tokio::test]
    async fn test_repeated_piece_is_idempotent() {
        let (a, _dir) = assembler(Duration::from_secs(60)).await;
        let sink = RecordingSink::default();
        let sidecar = named("a.bin");
        for _ in 0..3 {
            a.ingest("t", 0, b"abc", Some(false), &sidecar, &sink)
                .await
                .unwrap();
        }
        a.ingest("t", 3, b"def", None, &sidecar, &sink).await.unwrap();
        assert_eq!(sink.completed.lock()[0].bytes, b"abcdef");
    }

    #[tokio::test]
    async fn test_terminal_piece_finalizes_once() {
        let (a, _dir) = assembler(Duration::from_secs(60)).await;
        let sink = RecordingSink::default();
        let sidecar = named("a.bin");
        a.ingest("t", 0, b"x", Some(true), &sidecar, &sink)
            .await
            .unwrap();
        let err = a
            .ingest("t", 0, b"x", Some(true), &sidecar, &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkError::AlreadyFinalized(_)));
        assert!(err.is_client_error());
        assert_eq!(sink.completed.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_sidecar_failure_keeps_transfer() {
        let (a, _dir) = assembler(Duration::from_secs(60)).await;
        let sink = RecordingSink::default();
        let err = a
            .ingest("t", 0, b"abc", Some(true), &TransferSidecar::default(), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkError::MissingTransferName));
        assert_eq!(a.pending_count(), 1);

        let no_temp = TransferSidecar {
            transfer_name: Some("a".to_string()),
            correlation_id: None,
            carries_message: true,
        };
        let err = a
            .ingest("t", 3, b"", Some(true), &no_temp, &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkError::MissingCorrelationId));

        a.ingest("t", 3, b"d", Some(true), &named("a"), &sink)
            .await
            .unwrap();
        assert_eq!(sink.completed.lock()[0].bytes, b"abcd");
    }

    #[tokio::test]
    async fn test_idle_transfers_evicted() {
        let (a, _dir) = assembler(Duration::ZERO).await;
        let sink = RecordingSink::default();
        a.ingest("stale", 0, b"abc", Some(false), &named("a"), &sink)
            .await
            .unwrap();
        assert!(a.buffer_path("stale").exists());
        assert_eq!(a.evict_expired().await, 1);
        assert_eq!(a.pending_count(), 0);
        assert!(!a.buffer_path("stale").exists());
    }

    #[tokio::test]
    async fn test_transfer_id_cannot_escape_dir() {
        let (a, dir) = assembler(Duration::from_secs(60)).await;
        let sink = RecordingSink::default();
        a.ingest("../../escape", 0, b"x", Some(false), &named("a"), &sink)
            .await
            .unwrap();
        assert!(!dir.path().join("escape").exists());
        let buffer = a.buffer_path("../../escape");
        assert!(buffer.exists());
        assert_eq!(buffer.parent(), Some(a.dir()));

        let err = a
            .ingest("   ", 0, b"x", Some(false), &named("a"), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkError::InvalidTransferId));
    }

    #[tokio::test]
    async fn test_similar_ids_are_separate_transfers() {
        let (a, _dir) = assembler(Duration::from_secs(60)).await;
        let sink = RecordingSink::default();
        a.ingest("photo.1", 0, b"AAAA", Some(false), &named("a"), &sink)
            .await
            .unwrap();
        a.ingest("photo_1", 0, b"BB", Some(true), &named("b"), &sink)
            .await
            .unwrap();
        a.ingest("photo/1", 0, b"C", Some(true), &named("c"), &sink)
            .await
            .unwrap();
        a.ingest("photo.1", 4, b"Z", Some(true), &named("a"), &sink)
            .await
            .unwrap();

        let completed = sink.completed.lock();
        let bytes_of = |id: &str| {
            completed
                .iter()
                .find(|t| t.transfer_id == id)
                .map(|t| t.bytes.clone())
                .unwrap()
        };
        assert_eq!(bytes_of("photo_1"), b"BB");
        assert_eq!(bytes_of("photo/1"), b"C");
        assert_eq!(bytes_of("photo.1"), b"AAAAZ");
    }

    struct FlakySink {
        down: Mutex<bool>,
        completed: Mutex<Vec<AssembledTransfer>>,
    }

    #[async_trait]
    impl CompletionSink for FlakySink {
        async fn complete(&self, transfer: AssembledTransfer) -> Result<(), BridgeError> {
            if *self.down.lock() {
                return Err(BridgeError::Unavailable("queue down".to_string()));
            }
            self.completed.lock().push(transfer);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_handoff_can_be_retried() {
        let (a, _dir) = assembler(Duration::from_secs(60)).await;
        let sink = FlakySink {
            down: Mutex::new(true),
            completed: Mutex::new(Vec::new()),
        };
        a.ingest("up", 0, b"abc", Some(false), &named("a"), &sink)
            .await
            .unwrap();
        let err = a
            .ingest("up", 3, b"def", Some(true), &named("a"), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ChunkError::Sink(_)));
        assert!(!err.is_client_error());
        assert_eq!(a.pending_count(), 1);
        assert!(a.buffer_path("up").exists());

        *sink.down.lock() = false;
        let out = a
            .ingest("up", 3, b"def", Some(true), &named("a"), &sink)
            .await
            .unwrap();
        assert_eq!(out, ChunkOutcome::Completed);
        assert_eq!(sink.completed.lock()[0].bytes, b"abcdef");
        assert!(!a.buffer_path("up").exists());
    }

    #[test]
    fn test_normalize_offset() {
        assert_eq!(normalize_offset(&json!(4096)), 4096);
        assert_eq!(normalize_offset(&json!(8.0)), 8);
        assert_eq!(normalize_offset(&json!(-3)), 0);
        assert_eq!(normalize_offset(&json!(1.5)), 0);
        assert_eq!(normalize_offset(&json!("12")), 0);
        assert_eq!(normalize_offset(&Value::Null), 0);
    }
}
