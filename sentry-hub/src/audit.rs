//! # audit
//!
//! SHA-256 chained append-only log of escalations.
//!
//! Every submission to the confirmation service, every verdict, every failed
//! submission and every verdict ignored because the wearable had disconnected
//! is appended as a block that hashes the previous block's hash. Editing or
//! removing a line breaks the chain, which [`verify_chain`] detects.
//!
//! ## Rotation
//! With a size cap set, a file that has reached the cap is renamed to
//! `<path>.1` (replacing any earlier one) before the next block is written,
//! and the new file starts a fresh chain from [`GENESIS_HASH`]. Each file
//! verifies on its own.
//!
//! ## Invariant
//! Writing the log never blocks detection: I/O failures are logged and the
//! block is dropped.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

// ── Audit Event Types ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    /// Alert envelope handed to the confirmation service
    EscalationSubmitted,
    /// Verdict stored
    VerdictReceived,
    /// Network error, bad status, malformed body or timeout
    EscalationFailed,
    /// Verdict arrived after the wearable disconnected
    VerdictDiscarded,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditEventType::EscalationSubmitted => "ESCALATION_SUBMITTED",
            AuditEventType::VerdictReceived => "VERDICT_RECEIVED",
            AuditEventType::EscalationFailed => "ESCALATION_FAILED",
            AuditEventType::VerdictDiscarded => "VERDICT_DISCARDED",
        };
        f.write_str(s)
    }
}

// ── Audit Block ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditBlock {
    pub block_seq: u64,
    pub session_id: String,
    pub timestamp_ms: u64,
    /// Hash of the previous block; the first block of a log uses [`GENESIS_HASH`]
    pub prev_hash: String,
    pub event_type: AuditEventType,
    pub payload_json: String,
    /// SHA-256 of (prev_hash || timestamp_ms || event_type || payload_json)
    pub block_hash: String,
}

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

impl AuditBlock {
    fn compute_hash(
        prev_hash: &str,
        timestamp_ms: u64,
        event_type: AuditEventType,
        payload_json: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(prev_hash.as_bytes());
        hasher.update(timestamp_ms.to_le_bytes());
        hasher.update(event_type.to_string().as_bytes());
        hasher.update(payload_json.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn new(
        block_seq: u64,
        session_id: String,
        timestamp_ms: u64,
        prev_hash: String,
        event_type: AuditEventType,
        payload_json: String,
    ) -> Self {
        let block_hash = Self::compute_hash(&prev_hash, timestamp_ms, event_type, &payload_json);
        Self {
            block_seq,
            session_id,
            timestamp_ms,
            prev_hash,
            event_type,
            payload_json,
            block_hash,
        }
    }

    pub fn verify(&self) -> bool {
        Self::compute_hash(&self.prev_hash, self.timestamp_ms, self.event_type, &self.payload_json)
            == self.block_hash
    }
}

/// Index of the first block that fails its own hash or does not link to its
/// predecessor; `None` for an intact chain.
pub fn verify_chain(blocks: &[AuditBlock]) -> Option<usize> {
    let mut prev = GENESIS_HASH;
    for (i, block) in blocks.iter().enumerate() {
        if !block.verify() || block.prev_hash != prev {
            return Some(i);
        }
        prev = &block.block_hash;
    }
    None
}

/// Read every block of a JSON-lines audit file.
pub async fn read_chain(path: &Path) -> anyhow::Result<Vec<AuditBlock>> {
    let data = tokio::fs::read_to_string(path).await?;
    let mut blocks = Vec::new();
    for line in data.lines().filter(|l| !l.trim().is_empty()) {
        blocks.push(serde_json::from_str(line)?);
    }
    Ok(blocks)
}

// ── Audit Logger ──────────────────────────────────────────────────────────────

struct AuditState {
    block_seq: u64,
    last_hash: String,
}

/// Append-only chained logger. Without a path blocks are only traced.
#[derive(Clone)]
pub struct AuditLogger {
    state: Arc<RwLock<AuditState>>,
    session_id: String,
    path: Option<PathBuf>,
    max_bytes: Option<u64>,
}

impl AuditLogger {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            state: Arc::new(RwLock::new(AuditState {
                block_seq: 0,
                last_hash: GENESIS_HASH.to_string(),
            })),
            session_id: uuid::Uuid::new_v4().to_string(),
            path,
            max_bytes: None,
        }
    }

    /// Rotate the file once it reaches `max_bytes`. Zero leaves it unbounded.
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = (max_bytes > 0).then_some(max_bytes);
        self
    }

    /// Continue the chain of an existing log so a restart does not fork it.
    pub async fn resume(path: PathBuf) -> Self {
        let logger = Self::new(Some(path.clone()));
        match read_chain(&path).await {
            Ok(blocks) => {
                if let Some(i) = verify_chain(&blocks) {
                    warn!("Audit: chain in {} broken at block {i}", path.display());
                }
                if let Some(last) = blocks.last() {
                    let mut state = logger.state.write().await;
                    state.block_seq = last.block_seq + 1;
                    state.last_hash = last.block_hash.clone();
                }
            }
            Err(e) => debug!("Audit: starting new chain at {} ({e})", path.display()),
        }
        logger
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Append one block. This is the single write path.
    pub async fn append(&self, event_type: AuditEventType, payload: serde_json::Value) -> AuditBlock {
        let timestamp_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        let payload_json = payload.to_string();

        // the lock is held across the write so blocks land in chain order
        let mut state = self.state.write().await;
        if let (Some(path), Some(max)) = (&self.path, self.max_bytes) {
            if rotate_if_full(path, max).await {
                state.block_seq = 0;
                state.last_hash = GENESIS_HASH.to_string();
            }
        }
        let block = AuditBlock::new(
            state.block_seq,
            self.session_id.clone(),
            timestamp_ms,
            state.last_hash.clone(),
            event_type,
            payload_json,
        );
        state.last_hash = block.block_hash.clone();
        state.block_seq += 1;

        debug!("Audit[{}]: {} {}", block.block_seq, block.event_type, block.block_hash);
        if let Some(path) = &self.path {
            write_line(path, &block).await;
        }
        block
    }
}

/// Path the full log is moved to on rotation.
pub fn rotated_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".1");
    PathBuf::from(name)
}

/// Returns whether the file was moved aside.
async fn rotate_if_full(path: &Path, max: u64) -> bool {
    let len = match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len(),
        Err(_) => return false,
    };
    if len < max {
        return false;
    }
    let rotated = rotated_path(path);
    match tokio::fs::rename(path, &rotated).await {
        Ok(()) => {
            info!("🗄️ Audit log reached {len} bytes, rotated to {}", rotated.display());
            true
        }
        Err(e) => {
            warn!("Audit: rotation of {} failed: {e}", path.display());
            false
        }
    }
}

async fn write_line(path: &Path, block: &AuditBlock) {
    let line = match serde_json::to_string(block) {
        Ok(l) => format!("{l}\n"),
        Err(e) => {
            warn!("Audit: failed to serialize block: {e}");
            return;
        }
    };
    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(mut f) => {
            if let Err(e) = f.write_all(line.as_bytes()).await {
                warn!("Audit: write failed: {e}");
            }
        }
        Err(e) => warn!("Audit: could not open {}: {e}", path.display()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_chain_links_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLogger::new(Some(path.clone()));

        let first = log.append(AuditEventType::EscalationSubmitted, json!({"device_id": "dev"})).await;
        let second = log.append(AuditEventType::VerdictReceived, json!({"is_crash": true})).await;
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.prev_hash, first.block_hash);
        assert_eq!(second.block_seq, 1);

        let blocks = read_chain(&path).await.unwrap();
        assert_eq!(blocks, vec![first, second]);
        assert_eq!(verify_chain(&blocks), None);
    }

    #[tokio::test]
    async fn test_tampering_is_detected() {
        let log = AuditLogger::new(None);
        let mut blocks = Vec::new();
        for i in 0..3 {
            blocks.push(log.append(AuditEventType::EscalationFailed, json!({ "n": i })).await);
        }
        blocks[1].payload_json = json!({ "n": 99 }).to_string();
        assert!(!blocks[1].verify());
        assert_eq!(verify_chain(&blocks), Some(1));

        blocks.remove(1);
        assert_eq!(verify_chain(&blocks), Some(1));
    }

    #[tokio::test]
    async fn test_resume_continues_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let last = {
            let log = AuditLogger::new(Some(path.clone()));
            log.append(AuditEventType::EscalationSubmitted, json!({})).await
        };

        let log = AuditLogger::resume(path.clone()).await;
        let next = log.append(AuditEventType::VerdictDiscarded, json!({})).await;
        assert_eq!(next.prev_hash, last.block_hash);
        assert_eq!(next.block_seq, 1);
        assert_eq!(verify_chain(&read_chain(&path).await.unwrap()), None);
    }

    #[tokio::test]
    async fn test_full_log_rotates_into_fresh_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLogger::new(Some(path.clone())).with_max_bytes(1);

        let first = log.append(AuditEventType::EscalationSubmitted, json!({"n": 1})).await;
        let second = log.append(AuditEventType::VerdictReceived, json!({"n": 2})).await;
        assert_eq!(second.block_seq, 0);
        assert_eq!(second.prev_hash, GENESIS_HASH);

        let rotated = read_chain(&rotated_path(&path)).await.unwrap();
        assert_eq!(rotated, vec![first]);
        let current = read_chain(&path).await.unwrap();
        assert_eq!(current, vec![second]);
        assert_eq!(verify_chain(&current), None);

        // a restart continues the current file, not the rotated one
        let log = AuditLogger::resume(path.clone()).await.with_max_bytes(1 << 20);
        let third = log.append(AuditEventType::EscalationFailed, json!({})).await;
        assert_eq!(third.prev_hash, current[0].block_hash);
        assert_eq!(verify_chain(&read_chain(&path).await.unwrap()), None);
    }

    #[tokio::test]
    async fn test_zero_cap_never_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLogger::new(Some(path.clone())).with_max_bytes(0);
        for i in 0..3 {
            log.append(AuditEventType::EscalationSubmitted, json!({ "n": i })).await;
        }
        assert_eq!(read_chain(&path).await.unwrap().len(), 3);
        assert!(!rotated_path(&path).exists());
    }

    #[test]
    fn test_event_type_wire_name_matches_display() {
        let wire = serde_json::to_string(&AuditEventType::VerdictDiscarded).unwrap();
        assert_eq!(wire.trim_matches('"'), AuditEventType::VerdictDiscarded.to_string());
    }
}
