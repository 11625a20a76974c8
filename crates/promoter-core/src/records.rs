//! Records exchanged between the orchestrator, the DLRN client and the
//! artifact backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PromoterError;
use crate::hash::{deserialize_timestamp, BuildHash};

/// A promotion backend. Variants are declared in promotion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Backend {
    #[serde(rename = "registries_client")]
    Registry,
    #[serde(rename = "qcow_client")]
    Qcow,
    #[serde(rename = "dlrn_client")]
    Dlrn,
}

impl Backend {
    /// Registry push, then qcow flip, then the DLRN record.
    pub const ORDER: [Backend; 3] = [Backend::Registry, Backend::Qcow, Backend::Dlrn];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Registry => "registries_client",
            Backend::Qcow => "qcow_client",
            Backend::Dlrn => "dlrn_client",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = PromoterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "registries_client" => Ok(Backend::Registry),
            "qcow_client" => Ok(Backend::Qcow),
            "dlrn_client" => Ok(Backend::Dlrn),
            other => Err(PromoterError::Config(format!("unknown client '{other}'"))),
        }
    }
}

/// A CI job report for a build, as returned by the DLRN status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub url: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Outcome of one backend during a successful promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendOutcome {
    pub backend: Backend,
    pub detail: String,
}

impl BackendOutcome {
    pub fn new(backend: Backend, detail: impl Into<String>) -> Self {
        Self {
            backend,
            detail: detail.into(),
        }
    }
}

/// Produced per successful promotion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionRecord {
    pub hash: BuildHash,
    pub target: String,
    pub candidate_label: Option<String>,
    /// Hash moved to `previous-<target>`, if any.
    pub previous: Option<BuildHash>,
    pub promoted_at: DateTime<Utc>,
    pub outcomes: Vec<BackendOutcome>,
}

/// Label holding the hash replaced at `target`.
pub fn previous_label(target: &str) -> String {
    format!("previous-{target}")
}
