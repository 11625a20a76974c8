//! In-memory fakes for the promoter traits (testing only)
//!
//! Provides `MemoryDlrn`, `RecordingBackend` and `StaticResolver` that
//! satisfy the trait contracts without any external service.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{PromoterError, PromoterResult};
use crate::hash::{BuildHash, HashIdentity, HashParams};
use crate::records::{Backend, BackendOutcome, JobResult};
use crate::traits::{ArtifactPromoter, ContainersList, ContainersResolver, DlrnApi};

/// Build a valid commit/distro hash derived from `n`, with timestamp `n`.
pub fn sample_hash(n: u64) -> BuildHash {
    BuildHash::from_source(&HashParams {
        commit_hash: Some(format!("{:040x}", n)),
        distro_hash: Some(format!("{:040x}", n + 0xd000)),
        timestamp: Some(n as i64),
        ..Default::default()
    })
    .expect("sample hash is valid")
}

/// Callback run from inside a fake, used to simulate external actors.
pub type Hook = Box<dyn Fn() + Send + Sync>;

// ---------------------------------------------------------------------------
// MemoryDlrn
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct DlrnState {
    /// (label, hash) in promotion order, oldest first.
    promotions: Vec<(String, BuildHash)>,
    jobs: HashMap<HashIdentity, Vec<JobResult>>,
    /// (target, full_hash) for every `promote_one` call.
    promote_calls: Vec<(String, String)>,
    failing_targets: HashSet<String>,
}

/// In-memory DLRN service.
#[derive(Debug, Default)]
pub struct MemoryDlrn {
    state: Mutex<DlrnState>,
}

impl MemoryDlrn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a promotion as if done by an external actor.
    pub fn add_promotion(&self, label: &str, hash: &BuildHash) {
        let mut state = self.state.lock().unwrap();
        state.promotions.push((label.to_string(), hash.clone()));
    }

    /// Report jobs as successful for `hash`.
    pub fn add_successful_jobs(&self, hash: &BuildHash, jobs: &[&str]) {
        let mut state = self.state.lock().unwrap();
        let entry = state.jobs.entry(hash.by_identity()).or_default();
        for job in jobs {
            entry.push(JobResult {
                job_id: job.to_string(),
                timestamp: hash.timestamp(),
                url: Some(format!("https://logs.example.org/{job}")),
                success: true,
                notes: None,
            });
        }
    }

    /// Make every `promote_one` towards `target` fail with an upstream error.
    pub fn fail_promotions_to(&self, target: &str) {
        let mut state = self.state.lock().unwrap();
        state.failing_targets.insert(target.to_string());
    }

    /// `(target, full_hash)` of every write, in call order.
    pub fn promote_calls(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().promote_calls.clone()
    }

    pub fn current(&self, label: &str) -> Option<BuildHash> {
        let state = self.state.lock().unwrap();
        state
            .promotions
            .iter()
            .rev()
            .find(|(l, _)| l == label)
            .map(|(_, h)| h.clone())
    }

    fn select(
        &self,
        count: Option<usize>,
        predicate: impl Fn(&str, &BuildHash) -> bool,
    ) -> Vec<BuildHash> {
        let state = self.state.lock().unwrap();
        let mut seen = HashSet::new();
        let mut hashes = Vec::new();
        for (label, hash) in state.promotions.iter().rev() {
            if predicate(label, hash) && seen.insert(hash.by_identity()) {
                hashes.push(hash.clone());
            }
        }
        if let Some(count) = count {
            hashes.truncate(count);
        }
        hashes
    }
}

#[async_trait]
impl DlrnApi for MemoryDlrn {
    async fn fetch_promotions(
        &self,
        label: &str,
        count: Option<usize>,
    ) -> PromoterResult<Vec<BuildHash>> {
        Ok(self.select(count, |l, _| l == label))
    }

    async fn fetch_promotions_from_hash(
        &self,
        hash: &BuildHash,
        count: Option<usize>,
    ) -> PromoterResult<Vec<BuildHash>> {
        let identity = hash.by_identity();
        Ok(self.select(count, |_, h| h.by_identity() == identity))
    }

    async fn fetch_job_results(&self, hash: &BuildHash) -> PromoterResult<Vec<JobResult>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .jobs
            .get(&hash.by_identity())
            .cloned()
            .unwrap_or_default())
    }

    async fn promote_one(
        &self,
        hash: &BuildHash,
        target: &str,
        _candidate: Option<&str>,
    ) -> PromoterResult<BuildHash> {
        let mut state = self.state.lock().unwrap();
        if state.failing_targets.contains(target) {
            return Err(PromoterError::Upstream {
                status: 500,
                message: format!("promotion to {target} refused"),
            });
        }
        state
            .promote_calls
            .push((target.to_string(), hash.full_hash()));
        state.promotions.push((target.to_string(), hash.clone()));
        Ok(hash.clone())
    }

    async fn vote(
        &self,
        hash: &BuildHash,
        job_id: &str,
        url: &str,
        success: bool,
    ) -> PromoterResult<JobResult> {
        let job = JobResult {
            job_id: job_id.to_string(),
            timestamp: hash.timestamp(),
            url: Some(url.to_string()),
            success,
            notes: None,
        };
        let mut state = self.state.lock().unwrap();
        state
            .jobs
            .entry(hash.by_identity())
            .or_default()
            .push(job.clone());
        Ok(job)
    }

    fn civotes_info(&self, hash: &BuildHash) -> String {
        format!("memory://civotes/{}", hash.full_hash())
    }
}

// ---------------------------------------------------------------------------
// RecordingBackend
// ---------------------------------------------------------------------------

/// Artifact backend that records promotions and can be told to fail.
pub struct RecordingBackend {
    backend: Backend,
    calls: Mutex<Vec<(String, String)>>,
    fail_always: AtomicBool,
    failing_hashes: Mutex<HashSet<String>>,
    on_promote: Mutex<Option<Hook>>,
}

impl RecordingBackend {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            calls: Mutex::new(Vec::new()),
            fail_always: AtomicBool::new(false),
            failing_hashes: Mutex::new(HashSet::new()),
            on_promote: Mutex::new(None),
        }
    }

    /// Fail every promotion.
    pub fn fail_always(&self) {
        self.fail_always.store(true, Ordering::SeqCst);
    }

    /// Fail promotions of this hash only.
    pub fn fail_for(&self, hash: &BuildHash) {
        self.failing_hashes.lock().unwrap().insert(hash.full_hash());
    }

    /// Run `hook` after every successful promotion.
    pub fn on_promote(&self, hook: Hook) {
        *self.on_promote.lock().unwrap() = Some(hook);
    }

    /// `(target, full_hash)` of every successful promotion.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactPromoter for RecordingBackend {
    fn backend(&self) -> Backend {
        self.backend
    }

    async fn promote(
        &self,
        hash: &BuildHash,
        target: &str,
        _candidate: &str,
        _create_previous: bool,
    ) -> PromoterResult<BackendOutcome> {
        let full_hash = hash.full_hash();
        if self.fail_always.load(Ordering::SeqCst)
            || self.failing_hashes.lock().unwrap().contains(&full_hash)
        {
            return Err(PromoterError::Promotion(format!(
                "{} refused {}",
                self.backend, full_hash
            )));
        }
        self.calls
            .lock()
            .unwrap()
            .push((target.to_string(), full_hash.clone()));
        if let Some(hook) = self.on_promote.lock().unwrap().as_ref() {
            hook();
        }
        Ok(BackendOutcome::new(
            self.backend,
            format!("{target} -> {full_hash}"),
        ))
    }
}

// ---------------------------------------------------------------------------
// StaticResolver
// ---------------------------------------------------------------------------

/// Resolver returning the same containers for every hash.
#[derive(Debug, Default)]
pub struct StaticResolver {
    pub list: ContainersList,
}

impl StaticResolver {
    pub fn new(containers: &[&str]) -> Self {
        Self {
            list: ContainersList {
                containers: containers.iter().map(|c| c.to_string()).collect(),
                ppc_containers: Vec::new(),
            },
        }
    }
}

#[async_trait]
impl ContainersResolver for StaticResolver {
    async fn resolve_containers(
        &self,
        _hash: &BuildHash,
        _candidate_label: &str,
    ) -> PromoterResult<ContainersList> {
        Ok(self.list.clone())
    }
}
