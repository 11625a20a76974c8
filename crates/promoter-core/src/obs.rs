//! Structured observability hooks for promotion runs.
//!
//! Spans nest as run > target > candidate, so every event emitted inside a
//! promotion attempt carries `run_id`, `target_label` and `candidate`.
//! Backend events add a `backend` field.

use tracing::{info, warn};

use crate::records::Backend;

/// Span covering a whole promoter run.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("promoter.run", run_id = %run_id)
}

/// Span covering the work on one target label.
pub fn target_span(target: &str, candidate_label: &str) -> tracing::Span {
    tracing::info_span!(
        "promoter.target",
        target_label = %target,
        candidate_label = %candidate_label
    )
}

/// Span covering the evaluation and promotion of one candidate.
pub fn candidate_span(short_hash: &str) -> tracing::Span {
    tracing::info_span!("promoter.candidate", candidate = %short_hash)
}

pub fn emit_run_started(run_id: &str, config_digest: &str, targets: usize, dry_run: bool) {
    info!(
        event = "run.started",
        run_id = %run_id,
        config_digest = %config_digest,
        targets = targets,
        dry_run = dry_run,
    );
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, promoted: usize, failed: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        promoted = promoted,
        failed = failed,
    );
}

pub fn emit_backend_started(backend: Backend) {
    info!(event = "backend.started", backend = %backend, "Attempting promotion");
}

pub fn emit_backend_succeeded(backend: Backend, detail: &str) {
    info!(event = "backend.succeeded", backend = %backend, detail = %detail, "Successful promotion");
}

pub fn emit_backend_failed(backend: Backend, error: &dyn std::fmt::Display) {
    warn!(event = "backend.failed", backend = %backend, error = %error, "Failed promotion");
}

pub fn emit_criteria_evaluated(met: bool, missing: usize, substituted: usize) {
    info!(
        event = "criteria.evaluated",
        met = met,
        missing = missing,
        substituted = substituted,
    );
}
