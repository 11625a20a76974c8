//! Promotion criteria evaluation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Jobs that must succeed for a candidate to qualify for a target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromotionCriteria {
    /// Required job ids.
    pub required: BTreeSet<String>,

    /// Jobs that may stand in for a required job.
    pub alternatives: BTreeMap<String, Vec<String>>,
}

/// Outcome of a criteria evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriteriaVerdict {
    /// Whether the candidate qualifies.
    pub met: bool,

    /// Required jobs neither passed nor covered by an alternative.
    pub missing: BTreeSet<String>,

    /// Required jobs satisfied through an alternative, with the job used.
    pub substituted: BTreeMap<String, String>,
}

impl PromotionCriteria {
    pub fn new<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            alternatives: BTreeMap::new(),
        }
    }

    pub fn with_alternative(mut self, job: &str, alternatives: &[&str]) -> Self {
        self.alternatives.insert(
            job.to_string(),
            alternatives.iter().map(|a| a.to_string()).collect(),
        );
        self
    }

    pub fn is_empty(&self) -> bool {
        self.required.is_empty()
    }

    /// A required job is satisfied when it passed, or when any of its
    /// alternatives passed.
    pub fn evaluate(&self, passed: &BTreeSet<String>) -> CriteriaVerdict {
        let mut missing = BTreeSet::new();
        let mut substituted = BTreeMap::new();

        for job in &self.required {
            if passed.contains(job) {
                continue;
            }
            let alternative = self
                .alternatives
                .get(job)
                .and_then(|alts| alts.iter().find(|alt| passed.contains(*alt)));
            match alternative {
                Some(alt) => {
                    substituted.insert(job.clone(), alt.clone());
                }
                None => {
                    missing.insert(job.clone());
                }
            }
        }

        CriteriaVerdict {
            met: missing.is_empty() && !self.required.is_empty(),
            missing,
            substituted,
        }
    }
}
