use std::path::PathBuf;

use tracing::{error, info};

use super::fs::RemoteFs;

/// One undo action for a link change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackStep {
    /// Point `link` back at `target`.
    RestoreLink { link: PathBuf, target: PathBuf },
    /// Remove a link created during the promotion.
    RemoveLink { link: PathBuf },
}

/// Undo actions recorded while flipping links, executed newest first.
#[derive(Debug, Default)]
pub struct RollbackPlan {
    steps: Vec<RollbackStep>,
}

impl RollbackPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, step: RollbackStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[RollbackStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Attempt every step, newest first. A failing step is logged and does
    /// not stop the others. Returns the number of failed steps.
    pub fn execute(self, fs: &mut dyn RemoteFs) -> usize {
        let mut failures = 0;
        for step in self.steps.into_iter().rev() {
            let result = match &step {
                RollbackStep::RemoveLink { link } => fs.remove(link),
                RollbackStep::RestoreLink { link, target } => {
                    // The link may already be gone.
                    let _ = fs.remove(link);
                    fs.symlink(target, link)
                }
            };
            match result {
                Ok(()) => info!(step = ?step, "Rollback step applied"),
                Err(e) => {
                    failures += 1;
                    error!(step = ?step, error = %e, "Rollback step failed");
                }
            }
        }
        failures
    }
}
