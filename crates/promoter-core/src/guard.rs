//! Staleness guard.
//!
//! Captures the hash currently promoted to every configured target label at
//! the start of a run and re-checks it before every backend write. A label
//! moved by somebody else aborts the run with `HashChanged`. There is no
//! distributed lock: DLRN is the synchronization point and concurrent
//! promoters detect each other through this snapshot compare.

use std::collections::BTreeMap;
use tracing::{debug, error, warn};

use crate::error::{PromoterError, PromoterResult};
use crate::hash::BuildHash;
use crate::metrics::METRICS;
use crate::traits::DlrnApi;

/// Label to hash mapping captured at orchestrator start.
pub type NamedHashSnapshot = BTreeMap<String, BuildHash>;

/// Snapshot-compare guard over a fixed set of labels.
#[derive(Debug, Clone, Default)]
pub struct StalenessGuard {
    labels: Vec<String>,
    snapshot: NamedHashSnapshot,
}

async fn fetch_named(dlrn: &dyn DlrnApi, labels: &[String]) -> PromoterResult<NamedHashSnapshot> {
    let mut named = NamedHashSnapshot::new();
    for label in labels {
        match dlrn.fetch_current(label).await? {
            Some(hash) => {
                debug!(label = %label, hash = %hash.short(), "Fetched named hash");
                named.insert(label.clone(), hash);
            }
            None => warn!(label = %label, "No promotions named {}", label),
        }
    }
    Ok(named)
}

impl StalenessGuard {
    /// Fetch the current promotee of every label and store it.
    pub async fn capture(dlrn: &dyn DlrnApi, labels: &[String]) -> PromoterResult<Self> {
        let snapshot = fetch_named(dlrn, labels).await?;
        Ok(Self {
            labels: labels.to_vec(),
            snapshot,
        })
    }

    /// Re-fetch the labels and fail if any stored entry moved.
    ///
    /// Labels that had no promotion at capture time are ignored. Timestamps
    /// are not compared: DLRN stamps each promotion record.
    pub async fn check_unchanged(&self, dlrn: &dyn DlrnApi) -> PromoterResult<()> {
        METRICS.inc_guard_checks();
        let latest = fetch_named(dlrn, &self.labels).await?;
        for (label, stored) in &self.snapshot {
            let Some(fetched) = latest.get(label) else {
                continue;
            };
            if !fetched.same_identity(stored) {
                error!(
                    label = %label,
                    stored = %stored.full_hash(),
                    fetched = %fetched.full_hash(),
                    "Named hash changed since promotion start"
                );
                return Err(PromoterError::HashChanged {
                    label: label.clone(),
                    stored: stored.full_hash(),
                    fetched: fetched.full_hash(),
                });
            }
        }
        Ok(())
    }

    /// Record a transition made by this run so it does not trip the guard.
    pub fn update(&mut self, label: &str, hash: &BuildHash) {
        debug!(label = %label, hash = %hash.short(), "Updating stored named hash");
        self.snapshot.insert(label.to_string(), hash.clone());
        if !self.labels.iter().any(|l| l == label) {
            self.labels.push(label.to_string());
        }
    }

    pub fn snapshot(&self) -> &NamedHashSnapshot {
        &self.snapshot
    }

    pub fn get(&self, label: &str) -> Option<&BuildHash> {
        self.snapshot.get(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{sample_hash, MemoryDlrn};

    fn labels() -> Vec<String> {
        vec!["current-tripleo".to_string(), "current-tripleo-rdo".to_string()]
    }

    #[tokio::test]
    async fn test_capture_skips_labels_without_promotions() {
        let dlrn = MemoryDlrn::new();
        dlrn.add_promotion("current-tripleo", &sample_hash(1));
        let guard = StalenessGuard::capture(&dlrn, &labels()).await.unwrap();
        assert_eq!(guard.snapshot().len(), 1);
        assert!(guard.get("current-tripleo-rdo").is_none());
    }

    #[tokio::test]
    async fn test_unchanged_passes_and_external_change_fails() {
        let dlrn = MemoryDlrn::new();
        dlrn.add_promotion("current-tripleo", &sample_hash(1));
        let guard = StalenessGuard::capture(&dlrn, &labels()).await.unwrap();
        guard.check_unchanged(&dlrn).await.expect("nothing changed");

        dlrn.add_promotion("current-tripleo", &sample_hash(9));
        let err = guard.check_unchanged(&dlrn).await.unwrap_err();
        assert!(matches!(err, PromoterError::HashChanged { ref label, .. } if label == "current-tripleo"));
    }

    #[tokio::test]
    async fn test_new_labels_are_ignored() {
        let dlrn = MemoryDlrn::new();
        dlrn.add_promotion("current-tripleo", &sample_hash(1));
        let guard = StalenessGuard::capture(&dlrn, &labels()).await.unwrap();
        dlrn.add_promotion("current-tripleo-rdo", &sample_hash(2));
        guard.check_unchanged(&dlrn).await.expect("new label is not a change");
    }

    #[tokio::test]
    async fn test_update_follows_own_promotions() {
        let dlrn = MemoryDlrn::new();
        dlrn.add_promotion("current-tripleo", &sample_hash(1));
        let mut guard = StalenessGuard::capture(&dlrn, &labels()).await.unwrap();
        dlrn.add_promotion("current-tripleo", &sample_hash(2));
        guard.update("current-tripleo", &sample_hash(2));
        guard.check_unchanged(&dlrn).await.expect("own promotion is tracked");
    }
}
