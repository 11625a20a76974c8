//! Seams between the orchestrator and its collaborators.
//!
//! - `DlrnApi`: the DLRN build service (promotions, CI votes)
//! - `ArtifactPromoter`: a backend holding promoted artifacts (registry, qcow)
//! - `ContainersResolver`: maps a build to its container short names
//!
//! All traits are async and transport-agnostic. In-memory fakes live in
//! the `fakes` module.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::{PromoterError, PromoterResult};
use crate::hash::BuildHash;
use crate::records::{previous_label, Backend, BackendOutcome, JobResult, PromotionRecord};

/// Typed access to the DLRN API.
///
/// Implementors provide the primitive calls. `promote` is provided and
/// handles the previous-label bookkeeping on top of `promote_one`.
#[async_trait]
pub trait DlrnApi: Send + Sync {
    /// Hashes promoted to `label`, newest first, at most `count`.
    async fn fetch_promotions(
        &self,
        label: &str,
        count: Option<usize>,
    ) -> PromoterResult<Vec<BuildHash>>;

    /// Promotions of the given build identity, newest first.
    async fn fetch_promotions_from_hash(
        &self,
        hash: &BuildHash,
        count: Option<usize>,
    ) -> PromoterResult<Vec<BuildHash>>;

    /// Successful CI job reports for `hash`.
    async fn fetch_job_results(&self, hash: &BuildHash) -> PromoterResult<Vec<JobResult>>;

    /// Attach `target` to `hash` without any previous-label handling.
    ///
    /// Returns the hash as recorded by DLRN.
    async fn promote_one(
        &self,
        hash: &BuildHash,
        target: &str,
        candidate: Option<&str>,
    ) -> PromoterResult<BuildHash>;

    /// Record a CI vote for `hash`.
    async fn vote(
        &self,
        hash: &BuildHash,
        job_id: &str,
        url: &str,
        success: bool,
    ) -> PromoterResult<JobResult>;

    /// Where to look at the CI votes of `hash`.
    fn civotes_info(&self, hash: &BuildHash) -> String;

    /// Ids of the jobs reported successful for `hash`.
    async fn fetch_jobs(&self, hash: &BuildHash) -> PromoterResult<Vec<String>> {
        let jobs = self.fetch_job_results(hash).await?;
        Ok(jobs
            .into_iter()
            .filter(|job| job.success)
            .map(|job| job.job_id)
            .collect())
    }

    /// The hash currently promoted to `label`, if any.
    async fn fetch_current(&self, label: &str) -> PromoterResult<Option<BuildHash>> {
        Ok(self.fetch_promotions(label, Some(1)).await?.into_iter().next())
    }

    /// Promote `hash` to `target`, moving the incumbent to `previous-<target>`
    /// first when `create_previous` is set.
    ///
    /// Refuses with `AlreadyPromoted` when the incumbent has the same identity.
    async fn promote(
        &self,
        hash: &BuildHash,
        target: &str,
        candidate: Option<&str>,
        create_previous: bool,
    ) -> PromoterResult<PromotionRecord> {
        let incumbent = self.fetch_current(target).await?;
        if let Some(current) = &incumbent {
            if current.same_identity(hash) {
                error!(
                    severity = "critical",
                    target_label = %target,
                    candidate = %hash.short(),
                    "Hash seems to already have been promoted and all checks to avoid this failed"
                );
                return Err(PromoterError::AlreadyPromoted {
                    hash: hash.full_hash(),
                    target: target.to_string(),
                });
            }
        }

        let mut previous = None;
        if create_previous {
            match incumbent {
                Some(current) => {
                    let current = current.with_label(target);
                    let previous_target = previous_label(target);
                    info!(
                        target_label = %target,
                        previous = %current.short(),
                        "Moving previous promoted hash to {}",
                        previous_target
                    );
                    self.promote_one(&current, &previous_target, Some(target))
                        .await?;
                    previous = Some(current);
                }
                None => warn!(target_label = %target, "No previous promotion found"),
            }
        }

        info!(target_label = %target, candidate = %hash.short(), "Attempting DLRN promotion");
        let promoted = self.promote_one(hash, target, candidate).await?;

        Ok(PromotionRecord {
            hash: promoted,
            target: target.to_string(),
            candidate_label: candidate.map(str::to_string),
            previous,
            promoted_at: Utc::now(),
            outcomes: vec![BackendOutcome::new(
                Backend::Dlrn,
                format!("{} promoted to {}", hash.full_hash(), target),
            )],
        })
    }
}

/// A backend holding promoted artifacts.
#[async_trait]
pub trait ArtifactPromoter: Send + Sync {
    fn backend(&self) -> Backend;

    /// Make `target` point at the artifacts of `hash`.
    async fn promote(
        &self,
        hash: &BuildHash,
        target: &str,
        candidate: &str,
        create_previous: bool,
    ) -> PromoterResult<BackendOutcome>;
}

/// Container short names built for a hash, per architecture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainersList {
    pub containers: Vec<String>,
    pub ppc_containers: Vec<String>,
}

/// Resolves the containers built for a hash.
#[async_trait]
pub trait ContainersResolver: Send + Sync {
    async fn resolve_containers(
        &self,
        hash: &BuildHash,
        candidate_label: &str,
    ) -> PromoterResult<ContainersList>;
}
