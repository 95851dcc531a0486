// Run record storage and incremental step journal
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::backtest::{DecisionRecord, RunResult};
use crate::error::Error;
use crate::models::{EquityPoint, Trade};
use crate::Result;

/// Saves and loads complete run records as pretty JSON
///
/// Records live at `{dir}/{name}.json`. Writes go to a temporary sibling file
/// that is renamed into place, so a crash never leaves a truncated record.
#[derive(Debug, Clone)]
pub struct ResultsStore {
    dir: PathBuf,
}

impl ResultsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    pub fn journal_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.journal.jsonl", name))
    }

    /// Persist `result` under `name`, returning the written path
    pub fn save(&self, name: &str, result: &RunResult) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::persistence(&self.dir, e))?;

        let path = self.record_path(name);
        let tmp = self.dir.join(format!(".{}.json.tmp", name));
        let json = serde_json::to_string_pretty(result)?;

        fs::write(&tmp, json).map_err(|e| Error::persistence(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| Error::persistence(&path, e))?;

        tracing::info!(
            "Saved run '{}' ({} trades, {} equity points) to {}",
            name,
            result.trades.len(),
            result.equity_curve.len(),
            path.display()
        );

        Ok(path)
    }

    pub fn load(&self, name: &str) -> Result<RunResult> {
        let path = self.record_path(name);
        let json = fs::read_to_string(&path).map_err(|e| Error::persistence(&path, e))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Open (truncating) the step journal for run `name`
    pub fn journal(&self, name: &str) -> Result<JournalWriter> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::persistence(&self.dir, e))?;
        JournalWriter::create(self.journal_path(name))
    }
}

/// One line of the step journal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    Trade(Trade),
    Equity(EquityPoint),
    Decision(DecisionRecord),
}

/// Append-only JSONL journal written while a run is in progress
pub struct JournalWriter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JournalWriter {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::persistence(&path, e))?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        writeln!(self.writer, "{}", line).map_err(|e| Error::persistence(&self.path, e))
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| Error::persistence(&self.path, e))
    }
}

/// Read back a journal; a torn final line from a crash is ignored
pub fn read_journal(path: impl AsRef<Path>) -> Result<Vec<JournalEntry>> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::persistence(path, e))?;

    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<_>>()
        .map_err(|e| Error::persistence(path, e))?;

    let mut entries = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(entry) => entries.push(entry),
            Err(e) if i + 1 == lines.len() => {
                tracing::warn!("Ignoring torn journal line in {}: {}", path.display(), e);
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(entries)
}
