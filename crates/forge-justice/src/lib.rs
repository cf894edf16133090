use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use forge_protocol::{AgentId, GENESIS_HASH, IntegrityReport, JusticeLogEntry, SealManifest};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Event type names written by the harness.
pub mod event_type {
    pub const SEEDED: &str = "seeded";
    pub const SESSION_CONFIGURED: &str = "session_configured";
    pub const SESSION_STARTED: &str = "session_started";
    pub const SESSION_PAUSED: &str = "session_paused";
    pub const SESSION_RESUMED: &str = "session_resumed";
    pub const SESSION_STOPPED: &str = "session_stopped";
    pub const SESSION_FAILED: &str = "session_failed";
    pub const STEP: &str = "step";
    pub const SYNTHETIC_FAILURE: &str = "synthetic_failure";
    pub const RISK_ESCALATED: &str = "risk_escalated";
    pub const MESSAGE_SENT: &str = "message_sent";
    pub const MESSAGE_RECEIVED: &str = "message_received";
    pub const MESSAGE_DROPPED: &str = "message_dropped";
    pub const MESSAGE_REJECTED: &str = "message_rejected";
    pub const STRESS_UPDATED: &str = "stress_updated";
}

#[derive(Serialize)]
struct HashInput<'a> {
    prev_hash: &'a str,
    sequence_index: u64,
    timestamp: &'a DateTime<Utc>,
    event_type: &'a str,
    agent_id: Option<&'a AgentId>,
    payload: &'a Value,
}

/// SHA-256 over the canonical JSON encoding of the hashed fields.
pub fn compute_entry_hash(
    prev_hash: &str,
    sequence_index: u64,
    timestamp: &DateTime<Utc>,
    event_type: &str,
    agent_id: Option<&AgentId>,
    payload: &Value,
) -> Result<String> {
    let input = HashInput {
        prev_hash,
        sequence_index,
        timestamp,
        event_type,
        agent_id,
        payload,
    };
    let bytes = serde_json::to_vec(&input).context("failed serializing hash input")?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Recompute `entries` from genesis and report the first broken link.
pub fn verify_chain(entries: &[JusticeLogEntry]) -> IntegrityReport {
    let total = entries.len() as u64;
    let mut expected_prev = GENESIS_HASH.to_owned();

    for (index, entry) in entries.iter().enumerate() {
        let index = index as u64;
        if entry.sequence_index != index {
            return IntegrityReport::broken(
                total,
                index,
                format!(
                    "sequence gap at entry {index}: recorded index {}",
                    entry.sequence_index
                ),
            );
        }
        if entry.prev_hash != expected_prev {
            return IntegrityReport::broken(
                total,
                index,
                format!(
                    "hash chain broken at entry {index}: expected prev_hash={expected_prev}, got={}",
                    entry.prev_hash
                ),
            );
        }
        let recomputed = compute_entry_hash(
            &entry.prev_hash,
            entry.sequence_index,
            &entry.timestamp,
            &entry.event_type,
            entry.agent_id.as_ref(),
            &entry.payload,
        );
        match recomputed {
            Ok(hash) if hash == entry.entry_hash => {}
            Ok(_) => {
                return IntegrityReport::broken(
                    total,
                    index,
                    format!("entry hash mismatch at entry {index}: entry has been tampered with"),
                );
            }
            Err(error) => {
                return IntegrityReport::broken(
                    total,
                    index,
                    format!("entry {index} cannot be re-hashed: {error}"),
                );
            }
        }
        expected_prev = entry.entry_hash.clone();
    }

    IntegrityReport::intact(total)
}

/// Default manifest location next to a log file: `<stem>_manifest.json`.
pub fn default_manifest_path(log_path: &Path) -> PathBuf {
    let stem = log_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "justice_log".to_owned());
    log_path.with_file_name(format!("{stem}_manifest.json"))
}

#[derive(Debug)]
struct Chain {
    entries: Vec<JusticeLogEntry>,
    last_hash: String,
}

/// Append-only, hash-chained audit log.
///
/// Backed either by memory alone or by a JSONL file that is appended to on
/// every write and reloaded on open. There is no update or delete path.
#[derive(Debug)]
pub struct JusticeLog {
    path: Option<PathBuf>,
    chain: Mutex<Chain>,
}

impl JusticeLog {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            chain: Mutex::new(Chain {
                entries: Vec::new(),
                last_hash: GENESIS_HASH.to_owned(),
            }),
        }
    }

    /// Open a file-backed log, reloading any chain already persisted at `path`.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create justice log dir {parent:?}"))?;
        }

        let entries = if fs::try_exists(&path).await.unwrap_or(false) {
            let raw = fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed reading justice log {path:?}"))?;
            let mut entries = Vec::new();
            for (line_no, line) in raw.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: JusticeLogEntry = serde_json::from_str(line).with_context(|| {
                    format!("failed parsing justice log line {} in {path:?}", line_no + 1)
                })?;
                entries.push(entry);
            }
            entries
        } else {
            Vec::new()
        };

        let last_hash = entries
            .last()
            .map(|entry| entry.entry_hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_owned());
        info!(entries = entries.len(), "justice log opened");

        Ok(Self {
            path: Some(path),
            chain: Mutex::new(Chain { entries, last_hash }),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one entry chained to the current tail.
    #[instrument(skip(self, agent_id, payload), fields(agent_id = ?agent_id.map(AgentId::as_str)))]
    pub async fn log(
        &self,
        event_type: &str,
        agent_id: Option<&AgentId>,
        payload: Value,
    ) -> Result<JusticeLogEntry> {
        let mut chain = self.chain.lock().await;
        let sequence_index = chain.entries.len() as u64;
        let timestamp = Utc::now();
        let entry_hash = compute_entry_hash(
            &chain.last_hash,
            sequence_index,
            &timestamp,
            event_type,
            agent_id,
            &payload,
        )?;
        let entry = JusticeLogEntry {
            sequence_index,
            timestamp,
            event_type: event_type.to_owned(),
            agent_id: agent_id.cloned(),
            payload,
            prev_hash: chain.last_hash.clone(),
            entry_hash,
        };

        if let Some(path) = &self.path {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await
                .with_context(|| format!("failed opening justice log {path:?}"))?;
            let line = serde_json::to_string(&entry).context("failed serializing log entry")?;
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await?;
        }

        chain.last_hash = entry.entry_hash.clone();
        chain.entries.push(entry.clone());
        debug!(sequence_index, "justice log entry appended");
        Ok(entry)
    }

    pub async fn len(&self) -> usize {
        self.chain.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn last_hash(&self) -> String {
        self.chain.lock().await.last_hash.clone()
    }

    /// Paginated read. `limit = None` reads to the end.
    pub async fn entries(&self, offset: usize, limit: Option<usize>) -> Vec<JusticeLogEntry> {
        let chain = self.chain.lock().await;
        let tail = chain.entries.iter().skip(offset);
        match limit {
            Some(limit) => tail.take(limit).cloned().collect(),
            None => tail.cloned().collect(),
        }
    }

    pub async fn entry(&self, index: usize) -> Option<JusticeLogEntry> {
        self.chain.lock().await.entries.get(index).cloned()
    }

    pub async fn count_of(&self, event_type: &str) -> usize {
        self.chain
            .lock()
            .await
            .entries
            .iter()
            .filter(|entry| entry.event_type == event_type)
            .count()
    }

    /// Recompute the chain from genesis.
    ///
    /// File-backed logs are verified from what is persisted on disk, so edits
    /// made to the file after the fact are caught. A persisted chain shorter
    /// than the one written by this process is reported at the first missing
    /// index.
    #[instrument(skip(self))]
    pub async fn verify_integrity(&self) -> Result<IntegrityReport> {
        let chain = self.chain.lock().await;
        let Some(path) = &self.path else {
            return Ok(verify_chain(&chain.entries));
        };

        let raw = fs::read_to_string(path).await.unwrap_or_default();
        let mut persisted = Vec::new();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            match serde_json::from_str::<JusticeLogEntry>(line) {
                Ok(entry) => persisted.push(entry),
                Err(error) => {
                    let index = persisted.len() as u64;
                    warn!(index, %error, "unreadable justice log entry");
                    return Ok(IntegrityReport::broken(
                        chain.entries.len() as u64,
                        index,
                        format!("entry {index} is unreadable: {error}"),
                    ));
                }
            }
        }

        let report = verify_chain(&persisted);
        if !report.valid {
            warn!(failed_at_index = ?report.failed_at_index, "justice log integrity check failed");
            return Ok(report);
        }
        if persisted.len() < chain.entries.len() {
            let index = persisted.len() as u64;
            warn!(index, "justice log truncated on disk");
            return Ok(IntegrityReport::broken(
                chain.entries.len() as u64,
                index,
                format!("persisted log ends before entry {index}"),
            ));
        }
        Ok(report)
    }

    /// Snapshot the current tail hash into a manifest.
    ///
    /// The manifest is written to `manifest_path` when given, otherwise next
    /// to a file-backed log. In-memory logs without a path only return it.
    #[instrument(skip(self))]
    pub async fn seal(&self, manifest_path: Option<&Path>) -> Result<SealManifest> {
        let manifest = {
            let chain = self.chain.lock().await;
            SealManifest {
                total_entries: chain.entries.len() as u64,
                chain_hash: chain.last_hash.clone(),
                log_file: self
                    .path
                    .as_ref()
                    .map(|path| path.to_string_lossy().into_owned()),
                sealed_at: Utc::now(),
            }
        };

        let target = manifest_path
            .map(Path::to_path_buf)
            .or_else(|| self.path.as_deref().map(default_manifest_path));
        if let Some(target) = target {
            if let Some(parent) = target.parent()
                && !parent.as_os_str().is_empty()
            {
                fs::create_dir_all(parent).await?;
            }
            let body = serde_json::to_string_pretty(&manifest)?;
            fs::write(&target, body)
                .await
                .with_context(|| format!("failed writing manifest {target:?}"))?;
            info!(
                manifest = %target.display(),
                total_entries = manifest.total_entries,
                "justice log sealed"
            );
        }
        Ok(manifest)
    }

    /// Verify the chain and check it still contains the sealed tail.
    pub async fn verify_against_manifest(&self, manifest: &SealManifest) -> Result<IntegrityReport> {
        let report = self.verify_integrity().await?;
        if !report.valid {
            return Ok(report);
        }
        if manifest.total_entries == 0 {
            return Ok(report);
        }
        if report.total_entries < manifest.total_entries {
            return Ok(IntegrityReport::broken(
                report.total_entries,
                report.total_entries,
                format!(
                    "log truncated: sealed with {} entries, found {}",
                    manifest.total_entries, report.total_entries
                ),
            ));
        }

        let index = manifest.total_entries - 1;
        let sealed_tail = self.entry(index as usize).await;
        match sealed_tail {
            Some(entry) if entry.entry_hash == manifest.chain_hash => Ok(report),
            _ => Ok(IntegrityReport::broken(
                report.total_entries,
                index,
                format!("entry {index} no longer matches the sealed chain hash"),
            )),
        }
    }
}
