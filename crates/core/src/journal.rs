//! Append-only JSON-lines journal of attempts, settlements and sweeps.
//!
//! Replayed on startup so pending transactions are polled again and
//! confirmed settlements are not counted twice.

use crate::coordinator::{AttemptStatus, ExecutionAttempt};
use crate::error::EngineResult;
use crate::settlement::{SettlementRecord, SweepRecord};
use alloy::primitives::B256;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    Attempt(ExecutionAttempt),
    Settlement(SettlementRecord),
    Sweep(SweepRecord),
}

/// What a replay recovered.
#[derive(Debug, Default)]
pub struct JournalState {
    /// Latest record per transaction hash.
    pub attempts: HashMap<B256, ExecutionAttempt>,
    /// In file order.
    pub settlements: Vec<SettlementRecord>,
    /// In file order.
    pub sweeps: Vec<SweepRecord>,
    pub skipped_lines: usize,
}

impl JournalState {
    /// Attempts still pending when the journal was last written, by nonce.
    pub fn pending_attempts(&self) -> Vec<ExecutionAttempt> {
        let mut pending: Vec<_> = self
            .attempts
            .values()
            .filter(|a| a.status == AttemptStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|a| a.nonce);
        pending
    }

    fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Attempt(attempt) => {
                self.attempts.insert(attempt.tx_hash, attempt);
            }
            JournalEntry::Settlement(record) => self.settlements.push(record),
            JournalEntry::Sweep(record) => self.sweeps.push(record),
        }
    }
}

pub struct Journal {
    path: Option<PathBuf>,
    file: Option<Mutex<File>>,
}

impl Journal {
    /// Replay `path` if it exists, then open it for appending.
    pub fn open(path: impl AsRef<Path>) -> EngineResult<(Self, JournalState)> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }

        let mut state = JournalState::default();
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for (index, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalEntry>(&line) {
                    Ok(entry) => state.apply(entry),
                    Err(e) => {
                        state.skipped_lines += 1;
                        warn!(line = index + 1, error = %e, "Skipping unreadable journal line");
                    }
                }
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(
            path = %path.display(),
            attempts = state.attempts.len(),
            settlements = state.settlements.len(),
            sweeps = state.sweeps.len(),
            "Journal opened"
        );

        Ok((
            Self {
                path: Some(path.to_path_buf()),
                file: Some(Mutex::new(file)),
            },
            state,
        ))
    }

    /// Journal that records nothing.
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn append(&self, entry: &JournalEntry) -> EngineResult<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = file.lock();
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}
