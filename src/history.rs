use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tokio::{fs::{self, OpenOptions}, io::{AsyncBufReadExt, AsyncWriteExt}, sync::Mutex};

use crate::messages::{RunRecord, RunSummary};

pub const DEFAULT_HISTORY_CAPACITY: usize = 32;

/// Finished runs, newest last. Optionally mirrored to a JSONL log so
/// `GET /api/runs/{id}` survives a restart.
pub struct RunHistory {
    capacity: usize,
    records: parking_lot::Mutex<VecDeque<RunRecord>>,
    log: Option<HistoryLog>,
}

struct HistoryLog {
    file: Mutex<tokio::fs::File>,
    path: PathBuf,
}

impl RunHistory {
    pub fn in_memory(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), records: parking_lot::Mutex::new(VecDeque::new()), log: None }
    }

    /// Reload the tail of an existing log, then keep appending to it.
    pub async fn open(path: PathBuf, capacity: usize) -> anyhow::Result<Self> {
        let capacity = capacity.max(1);
        if let Some(parent) = path.parent() { fs::create_dir_all(parent).await?; }
        let records = load(&path, capacity).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening run history {}", path.display()))?;
        tracing::info!(path = %path.display(), restored = records.len(), "run history opened");
        Ok(Self {
            capacity,
            records: parking_lot::Mutex::new(records),
            log: Some(HistoryLog { file: Mutex::new(file), path }),
        })
    }

    pub fn record(&self, record: RunRecord) {
        let mut records = self.records.lock();
        records.push_back(record);
        while records.len() > self.capacity { records.pop_front(); }
    }

    pub async fn persist(&self, record: &RunRecord) -> anyhow::Result<()> {
        let Some(log) = &self.log else { return Ok(()) };
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut f = log.file.lock().await;
        f.write_all(&line).await?;
        f.flush().await?;
        Ok(())
    }

    /// Latest record for `run_id`; ids may be reused across runs.
    pub fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.records.lock().iter().rev().find(|r| r.run_id == run_id).cloned()
    }

    /// Newest first.
    pub fn list(&self) -> Vec<RunSummary> {
        self.records
            .lock()
            .iter()
            .rev()
            .map(|r| RunSummary {
                run_id: r.run_id.clone(),
                script: r.script.clone(),
                status: r.status,
                started_at: r.started_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize { self.records.lock().len() }

    pub fn is_empty(&self) -> bool { self.records.lock().is_empty() }

    pub fn log_path(&self) -> Option<&Path> { self.log.as_ref().map(|l| l.path.as_path()) }
}

/// Last `capacity` records of a JSONL log. A missing file is an empty history;
/// unreadable lines are skipped.
pub async fn load(path: &Path, capacity: usize) -> anyhow::Result<VecDeque<RunRecord>> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(VecDeque::new()),
        Err(e) => return Err(e).with_context(|| format!("reading run history {}", path.display())),
    };
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut records = VecDeque::new();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        if line.trim().is_empty() { continue; }
        match serde_json::from_str::<RunRecord>(&line) {
            Ok(record) => {
                records.push_back(record);
                if records.len() > capacity { records.pop_front(); }
            }
            Err(e) => tracing::warn!(line = line_no, error = %e, "skipping malformed history line"),
        }
    }
    Ok(records)
}
