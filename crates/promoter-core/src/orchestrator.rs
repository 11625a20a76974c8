//! Promotion orchestrator.
//!
//! Drives every configured target through
//! `Scanning -> Evaluating(candidate) -> Promoting(candidate) -> Promoted | Skipped`.
//! Targets run strictly in configuration order and candidates newest first,
//! with no internal parallelism. For one candidate the backends are written
//! in a fixed order (registry, qcow, DLRN) and the staleness guard is
//! re-checked before each write.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::config::{PromoterConfig, PromotionTarget};
use crate::error::{AttemptError, PromoterError, PromoterResult};
use crate::guard::StalenessGuard;
use crate::hash::{sort_newest_first, BuildHash};
use crate::metrics::METRICS;
use crate::obs;
use crate::records::{Backend, PromotionRecord};
use crate::reporting::{AttemptOutcome, AttemptReport, AttemptSink};
use crate::traits::{ArtifactPromoter, DlrnApi};

/// Per-target progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "candidate", rename_all = "snake_case")]
pub enum TargetState {
    Scanning,
    Evaluating(String),
    Promoting(String),
    Promoted(String),
    Skipped,
}

impl fmt::Display for TargetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetState::Scanning => write!(f, "scanning"),
            TargetState::Evaluating(c) => write!(f, "evaluating({c})"),
            TargetState::Promoting(c) => write!(f, "promoting({c})"),
            TargetState::Promoted(c) => write!(f, "promoted({c})"),
            TargetState::Skipped => write!(f, "skipped"),
        }
    }
}

/// Final state of one target after a run.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    pub target: String,
    pub state: TargetState,
    /// Last error observed while trying candidates, if any.
    pub last_error: Option<String>,
}

/// Result of a `promote_all` run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PromotionSummary {
    pub run_id: String,
    /// `(hash, target)` pairs promoted this run.
    pub promoted: Vec<(BuildHash, String)>,
    pub records: Vec<PromotionRecord>,
    /// Candidates that qualified during a dry run.
    pub dry_run_picks: Vec<(BuildHash, String)>,
    pub targets: Vec<TargetStatus>,
    pub cancelled: bool,
}

impl PromotionSummary {
    /// Targets that saw at least one failed attempt and were not promoted.
    pub fn failed(&self) -> Vec<&TargetStatus> {
        self.targets
            .iter()
            .filter(|t| t.state == TargetState::Skipped && t.last_error.is_some())
            .collect()
    }
}

enum Attempt {
    Promoted(Box<PromotionRecord>),
    DryRun,
    NotQualified,
}

#[derive(Default)]
struct AttemptContext {
    passed: Vec<String>,
    missing: Vec<String>,
}

/// Promotion orchestrator. One instance drives one run.
pub struct Promoter {
    config: Arc<PromoterConfig>,
    dlrn: Arc<dyn DlrnApi>,
    backends: Vec<Arc<dyn ArtifactPromoter>>,
    reporter: Option<Arc<dyn AttemptSink>>,
    cancel: Arc<AtomicBool>,
    run_id: String,
}

impl Promoter {
    /// Backends are kept in promotion order and filtered by `allowed_clients`.
    pub fn new(
        config: Arc<PromoterConfig>,
        dlrn: Arc<dyn DlrnApi>,
        backends: Vec<Arc<dyn ArtifactPromoter>>,
    ) -> Self {
        let mut backends: Vec<_> = backends
            .into_iter()
            .filter(|b| b.backend() != Backend::Dlrn && config.is_allowed(b.backend()))
            .collect();
        backends.sort_by_key(|b| b.backend());
        Self {
            config,
            dlrn,
            backends,
            reporter: None,
            cancel: Arc::new(AtomicBool::new(false)),
            run_id: format!("run-{}", Uuid::new_v4()),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn AttemptSink>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Flag checked between targets and between candidates.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn target_labels(&self) -> Vec<String> {
        self.config.promotions.iter().map(|t| t.name.clone()).collect()
    }

    /// Promote every configured target once.
    ///
    /// Returns `Err` only for `HashChanged` or when the initial snapshot
    /// cannot be taken. Per-candidate failures end up in the summary.
    pub async fn promote_all(&self) -> PromoterResult<PromotionSummary> {
        let span = obs::run_span(&self.run_id);
        self.run_all().instrument(span).await
    }

    async fn run_all(&self) -> PromoterResult<PromotionSummary> {
        let started = Instant::now();
        obs::emit_run_started(
            &self.run_id,
            &self.config.digest(),
            self.config.promotions.len(),
            self.config.dry_run,
        );

        let mut guard = StalenessGuard::capture(self.dlrn.as_ref(), &self.target_labels()).await?;
        let mut summary = PromotionSummary {
            run_id: self.run_id.clone(),
            ..Default::default()
        };

        info!("Starting promotion attempts for all labels");
        for target in &self.config.promotions {
            if self.cancelled() {
                warn!("Cancellation requested, stopping before target {}", target.name);
                summary.cancelled = true;
                break;
            }
            let span = obs::target_span(&target.name, &target.candidate_label);
            let status = self
                .promote_target(target, &mut guard, &mut summary)
                .instrument(span)
                .await;
            match status {
                Ok(status) => summary.targets.push(status),
                Err(err) => {
                    error!(error = %err, "Promotion run aborted");
                    info!("Summary: Promoted {} hashes this round", summary.promoted.len());
                    METRICS.flush();
                    return Err(err);
                }
            }
        }

        info!("Summary: Promoted {} hashes this round", summary.promoted.len());
        for failed in summary.failed() {
            warn!(
                target_label = %failed.target,
                last_error = failed.last_error.as_deref().unwrap_or_default(),
                "Target not promoted"
            );
        }
        obs::emit_run_finished(
            &self.run_id,
            started.elapsed().as_millis() as u64,
            summary.promoted.len(),
            summary.failed().len(),
        );
        METRICS.flush();
        info!("Promoter terminated normally");
        Ok(summary)
    }

    /// Candidates for `target`, newest first.
    ///
    /// The list is cut at the first hash already promoted to the target
    /// (the current promotee or an earlier one), any other hash that was
    /// promoted to the target before is dropped, and so is any hash older
    /// than the current promotee.
    pub async fn select_candidates(
        &self,
        target: &PromotionTarget,
    ) -> PromoterResult<Vec<BuildHash>> {
        let mut candidates = self
            .dlrn
            .fetch_promotions(&target.candidate_label, Some(self.config.latest_hashes_count))
            .await?;
        if candidates.is_empty() {
            warn!("Candidate label '{}': No hashes fetched", target.candidate_label);
            return Ok(candidates);
        }
        info!(
            "Candidate label '{}': Fetched {} hashes",
            target.candidate_label,
            candidates.len()
        );
        sort_newest_first(&mut candidates);

        let history = self.dlrn.fetch_promotions(&target.name, None).await?;
        if history.is_empty() {
            warn!(
                "Target label '{}': No hashes fetched, the target label is new or wrong",
                target.name
            );
            return Ok(candidates);
        }
        let promoted: HashSet<_> = history.iter().map(BuildHash::by_identity).collect();
        if let Some(position) = candidates
            .iter()
            .position(|c| promoted.contains(&c.by_identity()))
        {
            info!(
                "Target label '{}': current hash is {}",
                target.name, candidates[position]
            );
            candidates.truncate(position);
        }
        candidates.retain(|c| !promoted.contains(&c.by_identity()));

        // The current promotee may sit outside the candidate window.
        if let Some(current_ts) = history.first().and_then(BuildHash::timestamp) {
            let before = candidates.len();
            candidates.retain(|c| c.timestamp().map_or(true, |ts| ts > current_ts));
            if candidates.len() < before {
                info!(
                    "Target label '{}': dropped {} candidates older than {}",
                    target.name,
                    before - candidates.len(),
                    history[0]
                );
            }
        }

        if candidates.is_empty() {
            info!("Candidate hashes: none found younger than target label current");
        } else {
            debug!(count = candidates.len(), "Candidate hashes younger than target label current");
        }
        Ok(candidates)
    }

    async fn promote_target(
        &self,
        target: &PromotionTarget,
        guard: &mut StalenessGuard,
        summary: &mut PromotionSummary,
    ) -> PromoterResult<TargetStatus> {
        let mut status = TargetStatus {
            target: target.name.clone(),
            state: TargetState::Scanning,
            last_error: None,
        };
        info!(
            "Candidate label '{}': Attempting promotion to '{}'",
            target.candidate_label, target.name
        );

        if target.criteria.is_empty() {
            warn!("Target '{}' has no criteria, skipping", target.name);
            status.state = TargetState::Skipped;
            return Ok(status);
        }

        let candidates = match self.select_candidates(target).await {
            Ok(candidates) => candidates,
            Err(err) => {
                error!(error = %err, "Unable to select candidates");
                status.state = TargetState::Skipped;
                status.last_error = Some(
                    AttemptError::new(&target.name, "-", Backend::Dlrn, err).to_string(),
                );
                return Ok(status);
            }
        };
        if candidates.is_empty() {
            warn!("Candidate label '{}': No candidate hashes", target.candidate_label);
        }

        for candidate in candidates {
            if self.cancelled() {
                warn!("Cancellation requested, stopping candidate scan");
                summary.cancelled = true;
                break;
            }
            status.state = TargetState::Evaluating(candidate.short());
            debug!(state = %status.state, "Target state changed");

            let span = obs::candidate_span(&candidate.short());
            let result = self
                .attempt(target, &candidate, guard, &mut status)
                .instrument(span)
                .await;
            match result {
                Ok(Attempt::Promoted(record)) => {
                    guard.update(&target.name, &record.hash);
                    info!(
                        "Candidate hash '{}': SUCCESSFUL promotion to {}",
                        candidate, target.name
                    );
                    METRICS.inc_promotions();
                    status.state = TargetState::Promoted(candidate.short());
                    summary.promoted.push((candidate.clone(), target.name.clone()));
                    summary.records.push(*record);
                    return Ok(status);
                }
                Ok(Attempt::DryRun) => {
                    info!(
                        "Candidate hash '{}': dry run, would promote to {}",
                        candidate, target.name
                    );
                    summary.dry_run_picks.push((candidate.clone(), target.name.clone()));
                    status.state = TargetState::Skipped;
                    return Ok(status);
                }
                Ok(Attempt::NotQualified) => continue,
                Err(err) if err.source.is_fatal() => return Err(err.source),
                Err(err) => {
                    METRICS.inc_failed_attempts();
                    error!(error = %err, "Candidate hash '{}': FAILED promotion attempt", candidate);
                    status.last_error = Some(err.to_string());
                }
            }
        }

        status.state = TargetState::Skipped;
        warn!(
            "Candidate label '{}': NO candidate hash promoted to {}",
            target.candidate_label, target.name
        );
        Ok(status)
    }

    async fn attempt(
        &self,
        target: &PromotionTarget,
        candidate: &BuildHash,
        guard: &StalenessGuard,
        status: &mut TargetStatus,
    ) -> Result<Attempt, AttemptError> {
        METRICS.inc_candidates_evaluated();
        let mut ctx = AttemptContext::default();
        let result = self
            .evaluate_and_promote(target, candidate, guard, status, &mut ctx)
            .await;

        let (outcome, backend, error, outcomes) = match &result {
            Ok(Attempt::Promoted(record)) => {
                (AttemptOutcome::Promoted, None, None, record.outcomes.clone())
            }
            Ok(Attempt::DryRun) => (AttemptOutcome::DryRun, None, None, Vec::new()),
            Ok(Attempt::NotQualified) => (AttemptOutcome::CriteriaNotMet, None, None, Vec::new()),
            Err(err) => {
                let outcome = if err.source.is_fatal() {
                    AttemptOutcome::Aborted
                } else {
                    AttemptOutcome::Failed
                };
                (outcome, Some(err.backend), Some(&err.source), Vec::new())
            }
        };
        self.report(AttemptReport {
            run_id: self.run_id.clone(),
            config_digest: self.config.digest(),
            recorded_at: Utc::now(),
            target: target.name.clone(),
            candidate_label: target.candidate_label.clone(),
            candidate: candidate.full_hash(),
            aggregate: candidate.is_aggregate(),
            outcome,
            passed_jobs: ctx.passed,
            missing_jobs: ctx.missing,
            backend,
            error_kind: error.map(|e| e.kind().to_string()),
            error: error.map(|e| e.to_string()),
            outcomes,
        });
        result
    }

    async fn evaluate_and_promote(
        &self,
        target: &PromotionTarget,
        candidate: &BuildHash,
        guard: &StalenessGuard,
        status: &mut TargetStatus,
        ctx: &mut AttemptContext,
    ) -> Result<Attempt, AttemptError> {
        let short = candidate.short();
        let fail = |backend: Backend| {
            let target = target.name.clone();
            let short = short.clone();
            move |err: PromoterError| AttemptError::new(&target, &short, backend, err)
        };

        info!(
            "Candidate hash '{}' vote details page: {}",
            candidate,
            self.dlrn.civotes_info(candidate)
        );
        guard
            .check_unchanged(self.dlrn.as_ref())
            .await
            .map_err(fail(Backend::Dlrn))?;

        let jobs = self
            .dlrn
            .fetch_jobs(candidate)
            .await
            .map_err(fail(Backend::Dlrn))?;
        let passed: BTreeSet<String> = jobs.into_iter().collect();
        if passed.is_empty() {
            warn!("Candidate hash '{}': NO successful jobs", candidate);
        } else {
            info!("Candidate hash '{}': successful jobs {:?}", candidate, passed);
        }

        let verdict = target.criteria.evaluate(&passed);
        obs::emit_criteria_evaluated(verdict.met, verdict.missing.len(), verdict.substituted.len());
        ctx.passed = passed.into_iter().collect();
        ctx.missing = verdict.missing.iter().cloned().collect();
        for (job, alternative) in &verdict.substituted {
            info!("Candidate hash '{}': {} satisfied by {}", candidate, job, alternative);
        }
        if !verdict.met {
            warn!(
                "Candidate hash '{}': missing jobs {:?}, criteria NOT met for promotion to {}",
                candidate, verdict.missing, target.name
            );
            return Ok(Attempt::NotQualified);
        }
        info!(
            "Candidate hash '{}': criteria met, attempting promotion to {}",
            candidate, target.name
        );

        if self.config.dry_run {
            return Ok(Attempt::DryRun);
        }

        status.state = TargetState::Promoting(short.clone());
        debug!(state = %status.state, "Target state changed");
        let record = self
            .promote_candidate(&target.name, &target.candidate_label, candidate, guard)
            .await?;
        Ok(Attempt::Promoted(Box::new(record)))
    }

    /// Write `candidate` to every allowed backend in promotion order.
    ///
    /// The guard is re-checked before each backend. No cross-backend
    /// rollback happens on failure.
    pub async fn promote_candidate(
        &self,
        target: &str,
        candidate_label: &str,
        candidate: &BuildHash,
        guard: &StalenessGuard,
    ) -> Result<PromotionRecord, AttemptError> {
        let short = candidate.short();
        let candidate = candidate.with_label(candidate_label);
        info!("Candidate hash '{}': attempting promotion", candidate);
        debug!(
            "Candidate hash '{}': clients allowed to promote: {:?}",
            candidate, self.config.allowed_clients
        );

        let mut outcomes = Vec::new();
        for backend in &self.backends {
            let kind = backend.backend();
            guard
                .check_unchanged(self.dlrn.as_ref())
                .await
                .map_err(|e| AttemptError::new(target, &short, kind, e))?;
            obs::emit_backend_started(kind);
            match backend
                .promote(&candidate, target, candidate_label, self.config.create_previous)
                .await
            {
                Ok(outcome) => {
                    obs::emit_backend_succeeded(kind, &outcome.detail);
                    outcomes.push(outcome);
                }
                Err(err) => {
                    obs::emit_backend_failed(kind, &err);
                    return Err(AttemptError::new(target, &short, kind, err));
                }
            }
        }

        if !self.config.is_allowed(Backend::Dlrn) {
            return Ok(PromotionRecord {
                hash: candidate,
                target: target.to_string(),
                candidate_label: Some(candidate_label.to_string()),
                previous: None,
                promoted_at: Utc::now(),
                outcomes,
            });
        }

        let fail = |e| AttemptError::new(target, &short, Backend::Dlrn, e);
        guard.check_unchanged(self.dlrn.as_ref()).await.map_err(fail)?;
        obs::emit_backend_started(Backend::Dlrn);
        let mut record = match self
            .dlrn
            .promote(
                &candidate,
                target,
                Some(candidate_label),
                self.config.create_previous,
            )
            .await
        {
            Ok(record) => record,
            Err(err) => {
                obs::emit_backend_failed(Backend::Dlrn, &err);
                return Err(fail(err));
            }
        };
        obs::emit_backend_succeeded(Backend::Dlrn, &format!("{} -> {}", target, candidate.full_hash()));
        outcomes.append(&mut record.outcomes);
        record.outcomes = outcomes;
        Ok(record)
    }

    /// Promote a given hash, bypassing candidate selection and criteria.
    ///
    /// The staleness guard and the already-promoted check still apply.
    pub async fn force_promote(
        &self,
        hash: &BuildHash,
        candidate_label: &str,
        target: &str,
    ) -> PromoterResult<PromotionRecord> {
        let span = obs::run_span(&self.run_id);
        self.run_forced(hash, candidate_label, target)
            .instrument(span)
            .await
    }

    async fn run_forced(
        &self,
        hash: &BuildHash,
        candidate_label: &str,
        target: &str,
    ) -> PromoterResult<PromotionRecord> {
        let mut labels = self.target_labels();
        if !labels.iter().any(|l| l == target) {
            labels.push(target.to_string());
        }
        let guard = StalenessGuard::capture(self.dlrn.as_ref(), &labels).await?;

        if let Some(current) = guard.get(target) {
            if current.same_identity(hash) {
                warn!("Hash {} is already promoted to {}", hash, target);
                return Err(PromoterError::AlreadyPromoted {
                    hash: hash.full_hash(),
                    target: target.to_string(),
                });
            }
        }

        let span = obs::target_span(target, candidate_label);
        let result = self
            .promote_candidate(target, candidate_label, hash, &guard)
            .instrument(span)
            .await;
        let record = result.map_err(|err| {
            error!(error = %err, "Forced promotion failed");
            err.source
        })?;
        METRICS.inc_promotions();
        info!("Forced promotion of {} to {} completed", hash, target);
        Ok(record)
    }

    fn report(&self, report: AttemptReport) {
        if let Some(reporter) = &self.reporter {
            if let Err(err) = reporter.record(&report) {
                warn!(error = %err, "Unable to record attempt report");
            }
        }
    }
}
