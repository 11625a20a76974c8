//! Per-run attempt reports.
//!
//! Every promotion attempt produces one [`AttemptReport`]. The JSON-lines
//! writer appends one line per attempt so a run can be audited afterwards.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::records::{Backend, BackendOutcome};

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Promoted,
    DryRun,
    CriteriaNotMet,
    Failed,
    Aborted,
}

/// Inputs and outcome of one promotion attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptReport {
    pub run_id: String,
    pub config_digest: String,
    pub recorded_at: DateTime<Utc>,
    pub target: String,
    pub candidate_label: String,
    pub candidate: String,
    pub aggregate: bool,
    pub outcome: AttemptOutcome,
    pub passed_jobs: Vec<String>,
    pub missing_jobs: Vec<String>,
    pub backend: Option<Backend>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    pub outcomes: Vec<BackendOutcome>,
}

/// Destination for attempt reports.
pub trait AttemptSink: Send + Sync {
    fn record(&self, report: &AttemptReport) -> Result<()>;
}

/// Appends one JSON object per line.
pub struct JsonLinesReporter {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesReporter {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create {:?}", parent))?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {:?}", path))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AttemptSink for JsonLinesReporter {
    fn record(&self, report: &AttemptReport) -> Result<()> {
        let mut line = serde_json::to_string(report).context("serialize attempt report")?;
        line.push('\n');
        let mut file = self
            .file
            .lock()
            .map_err(|_| anyhow::anyhow!("attempt report writer poisoned"))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("write {:?}", self.path))?;
        Ok(())
    }
}

/// Keeps reports in memory.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    reports: Mutex<Vec<AttemptReport>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<AttemptReport> {
        self.reports
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl AttemptSink for MemoryReporter {
    fn record(&self, report: &AttemptReport) -> Result<()> {
        self.reports
            .lock()
            .map_err(|_| anyhow::anyhow!("memory reporter poisoned"))?
            .push(report.clone());
        Ok(())
    }
}

/// Read back a JSON-lines report file.
pub fn read_attempt_reports(path: &Path) -> Result<Vec<AttemptReport>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("read {:?}", path))?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).context("parse attempt report"))
        .collect()
}
