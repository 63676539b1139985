//! Append-only audit log with a single writer task.
//!
//! Producers enqueue through a bounded channel; the sequence number is
//! assigned inside the producer-side critical section, so channel order and
//! sequence order agree. A full queue blocks producers — records are never
//! dropped. The writer appends one JSON line per event; durability is "up
//! to the OS page cache" by design.
//!
//! Retention trimming happens only at startup or via an explicit
//! [`AuditLog::rotate`]: oldest lines drop until the file fits the budget,
//! rewritten through a temp file and a rename. Never mid-write.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use nacc_protocol::{AuditAction, AuditEvent, AuditOutcome};
use tokio::sync::{Mutex, mpsc};

/// Bound on the producer queue; producers block once it fills.
const QUEUE_BOUND: usize = 1024;

/// Everything but the writer-assigned fields of an event.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub actor: String,
    pub action: AuditAction,
    pub target: String,
    pub fingerprint: String,
    pub outcome: AuditOutcome,
    pub detail: BTreeMap<String, serde_json::Value>,
}

impl AuditRecord {
    pub fn new(action: AuditAction, target: impl Into<String>) -> Self {
        Self {
            actor: "system".to_string(),
            action,
            target: target.into(),
            fingerprint: nacc_protocol::request_fingerprint(&serde_json::Value::Null),
            outcome: AuditOutcome::Success,
            detail: BTreeMap::new(),
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn fingerprint_of(mut self, input: &serde_json::Value) -> Self {
        self.fingerprint = nacc_protocol::request_fingerprint(input);
        self
    }

    pub fn error(mut self, message: impl Into<String>) -> Self {
        self.outcome = AuditOutcome::Error {
            message: message.into(),
        };
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.detail.insert(key.to_string(), value.into());
        self
    }
}

struct Producer {
    next_seq: u64,
    tx: mpsc::Sender<AuditEvent>,
}

/// Cloneable handle; all clones feed the same writer task.
#[derive(Clone)]
pub struct AuditLog {
    producer: Arc<Mutex<Producer>>,
    path: PathBuf,
    max_bytes: u64,
}

impl AuditLog {
    /// Open (or create) the log, recover from a torn tail, trim to budget,
    /// and start the writer task.
    pub fn open(path: &Path, max_bytes: u64) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let last_seq = recover(path)?;
        trim_to_budget(path, max_bytes)?;

        let (tx, mut rx) = mpsc::channel::<AuditEvent>(QUEUE_BOUND);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => {
                        if let Err(err) = writeln!(file, "{line}").and_then(|_| file.flush()) {
                            tracing::error!(seq = event.seq, error = %err, "audit write failed");
                        }
                    }
                    Err(err) => {
                        tracing::error!(seq = event.seq, error = %err, "audit serialize failed");
                    }
                }
            }
        });

        Ok(Self {
            producer: Arc::new(Mutex::new(Producer {
                next_seq: last_seq + 1,
                tx,
            })),
            path: path.to_path_buf(),
            max_bytes,
        })
    }

    /// Enqueue one record. Sequence assignment and the send happen under
    /// the same lock, so sequence order is channel order. Blocks when the
    /// queue is full.
    pub async fn record(&self, record: AuditRecord) {
        let mut producer = self.producer.lock().await;
        let seq = producer.next_seq;
        producer.next_seq += 1;
        let event = AuditEvent {
            seq,
            timestamp: Utc::now(),
            actor: record.actor,
            action: record.action,
            target: record.target,
            fingerprint: record.fingerprint,
            outcome: record.outcome,
            detail: record.detail,
        };
        if producer.tx.send(event).await.is_err() {
            tracing::error!("audit writer task is gone; event lost");
        }
    }

    /// Explicit retention pass. Safe only because the writer appends
    /// whole lines and trimming rewrites through a rename.
    pub async fn rotate(&self) -> std::io::Result<()> {
        // Hold the producer lock so no new lines land mid-rewrite.
        let _guard = self.producer.lock().await;
        trim_to_budget(&self.path, self.max_bytes)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Drop a torn trailing line (crash recovery) and return the last sequence
/// number present.
fn recover(path: &Path) -> std::io::Result<u64> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Ok(0);
    };
    let mut valid_len = 0usize;
    let mut last_seq = 0u64;
    for line in raw.split_inclusive('\n') {
        if !line.ends_with('\n') {
            break;
        }
        match serde_json::from_str::<AuditEvent>(line.trim_end()) {
            Ok(event) => {
                last_seq = event.seq;
                valid_len += line.len();
            }
            Err(_) => break,
        }
    }
    if valid_len < raw.len() {
        tracing::warn!(
            path = %path.display(),
            dropped = raw.len() - valid_len,
            "audit log had a torn tail; truncating to last full line"
        );
        write_atomically(path, &raw[..valid_len])?;
    }
    Ok(last_seq)
}

/// Oldest-first trim until the file fits the budget.
fn trim_to_budget(path: &Path, max_bytes: u64) -> std::io::Result<()> {
    let Ok(metadata) = std::fs::metadata(path) else {
        return Ok(());
    };
    if metadata.len() <= max_bytes {
        return Ok(());
    }
    let raw = std::fs::read_to_string(path)?;
    let mut keep_from = 0usize;
    let mut remaining = raw.len() as u64;
    for line in raw.split_inclusive('\n') {
        if remaining <= max_bytes {
            break;
        }
        keep_from += line.len();
        remaining -= line.len() as u64;
    }
    write_atomically(path, &raw[keep_from..])
}

fn write_atomically(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn read_events(path: &Path) -> Vec<AuditEvent> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    async fn drain(log: &AuditLog) {
        // The writer runs on its own task; give it a beat to flush.
        for _ in 0..50 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if log.producer.lock().await.tx.capacity() == QUEUE_BOUND {
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn sequences_are_gap_free_under_concurrency() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path, u64::MAX).unwrap();

        let mut handles = Vec::new();
        for i in 0..100 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.record(
                    AuditRecord::new(AuditAction::ListFiles, format!("node-{}", i % 3)),
                )
                .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        drain(&log).await;

        let events = read_events(&path);
        assert_eq!(events.len(), 100);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, i as u64 + 1);
        }
        for pair in events.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn torn_tail_is_truncated_on_open() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = AuditLog::open(&path, u64::MAX).unwrap();
            log.record(AuditRecord::new(AuditAction::AgentProbe, "*")).await;
            drain(&log).await;
        }
        // Simulate a crash mid-write.
        {
            use std::io::Write as _;
            let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            write!(file, "{{\"seq\":2,\"timest").unwrap();
        }

        let log = AuditLog::open(&path, u64::MAX).unwrap();
        log.record(AuditRecord::new(AuditAction::AgentProbe, "*")).await;
        drain(&log).await;

        let events = read_events(&path);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[1].seq, 2);
    }

    #[tokio::test]
    async fn trim_drops_oldest_first() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = AuditLog::open(&path, u64::MAX).unwrap();
            for _ in 0..50 {
                log.record(AuditRecord::new(AuditAction::ListFiles, "node-a")).await;
            }
            drain(&log).await;
        }
        let full_size = std::fs::metadata(&path).unwrap().len();

        let log = AuditLog::open(&path, full_size / 2).unwrap();
        drain(&log).await;
        let events = read_events(&path);
        assert!(!events.is_empty());
        assert!(events.len() < 50);
        // The survivors are the newest records.
        assert_eq!(events.last().unwrap().seq, 50);
        for pair in events.windows(2) {
            assert_eq!(pair[1].seq, pair[0].seq + 1);
        }
    }

    #[tokio::test]
    async fn reopen_continues_the_sequence() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = AuditLog::open(&path, u64::MAX).unwrap();
            log.record(AuditRecord::new(AuditAction::ExecuteCommand, "node-a")).await;
            drain(&log).await;
        }
        let log = AuditLog::open(&path, u64::MAX).unwrap();
        log.record(AuditRecord::new(AuditAction::ExecuteCommand, "node-a")).await;
        drain(&log).await;
        let events = read_events(&path);
        assert_eq!(events.last().unwrap().seq, 2);
    }
}
