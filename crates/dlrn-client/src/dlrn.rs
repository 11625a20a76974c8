//! DLRN API client.
//!
//! Read endpoints are anonymous, write endpoints use HTTP Basic auth.
//! Every non-success answer surfaces as `Upstream` with the status and the
//! `message` of the error body. There are no retries here: the orchestrator
//! moves on to the next candidate instead.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use promoter_core::{
    BuildHash, DlrnApi, HashParams, JobResult, PromoterConfig, PromoterError, PromoterResult,
};

use crate::aggregate::{parse_commit_yaml, parse_repo_index, sort_components};
use crate::http::{build_client, check_status, get_text, transport};

/// Connection settings for [`DlrnClient`].
#[derive(Debug, Clone)]
pub struct DlrnClientConfig {
    pub api_url: String,
    /// Root of the DLRN repositories, used to assemble aggregate promotions.
    pub repo_url: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

impl DlrnClientConfig {
    pub fn from_config(config: &PromoterConfig) -> Self {
        Self {
            api_url: config.api_url.clone(),
            repo_url: config.repo_url.clone(),
            username: config.dlrnauth_username.clone(),
            password: config.dlrnauth_password.clone(),
            timeout: config.http_timeout,
        }
    }
}

/// Body of `POST /api/promotions` and of each `/api/promotions_batch` item.
#[derive(Debug, Serialize)]
struct PromotionRequest {
    #[serde(flatten)]
    params: HashParams,
    promote_name: String,
}

impl PromotionRequest {
    fn new(hash: &BuildHash, target: &str) -> Self {
        let mut params = hash.without_timestamp().dump_to_params();
        params.aggregate_hash = None;
        params.component = None;
        Self {
            params,
            promote_name: target.to_string(),
        }
    }
}

/// Body of `POST /api/report_result`.
#[derive(Debug, Serialize)]
struct VoteRequest {
    #[serde(flatten)]
    params: HashParams,
    job_id: String,
    url: String,
    success: bool,
}

fn same_build(a: &BuildHash, b: &BuildHash) -> bool {
    a.commit_hash() == b.commit_hash()
        && a.distro_hash() == b.distro_hash()
        && a.extended_hash() == b.extended_hash()
}

/// Client for the DLRN REST API.
pub struct DlrnClient {
    config: DlrnClientConfig,
    http: reqwest::Client,
}

impl DlrnClient {
    pub fn new(config: DlrnClientConfig) -> PromoterResult<Self> {
        let http = build_client(config.timeout)?;
        debug!(
            api_url = %config.api_url,
            user = %config.username,
            "Promoter DLRN client created"
        );
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &DlrnClientConfig {
        &self.config
    }

    fn api(&self, endpoint: &str) -> String {
        format!("{}/api/{}", self.config.api_url.trim_end_matches('/'), endpoint)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> PromoterResult<T> {
        let response = self
            .http
            .get(self.api(endpoint))
            .query(query)
            .send()
            .await
            .map_err(transport)?;
        let response = check_status(response).await.inspect_err(|e| {
            error!(endpoint = endpoint, error = %e, "Exception while querying API endpoint");
        })?;
        response.json().await.map_err(transport)
    }

    async fn post_json<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> PromoterResult<serde_json::Value> {
        let response = self
            .http
            .post(self.api(endpoint))
            .basic_auth(&self.config.username, Some(&self.config.password))
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        let response = check_status(response).await.inspect_err(|e| {
            error!(endpoint = endpoint, error = %e, "Exception while posting to API endpoint");
        })?;
        let text = response.text().await.map_err(transport)?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// GET promotions, newest first, duplicates collapsed to their newest entry.
    ///
    /// Records that do not form a valid hash are logged and skipped.
    async fn fetch_hashes(
        &self,
        mut query: Vec<(&str, String)>,
        count: Option<usize>,
    ) -> PromoterResult<Vec<BuildHash>> {
        if let Some(count) = count {
            query.push(("limit", count.to_string()));
        }
        debug!(criteria = ?query, "Fetching hashes");
        let records: Vec<HashParams> = self.get_json("promotions", &query).await?;

        let mut seen = HashSet::new();
        let mut hashes = Vec::new();
        for (position, record) in records.iter().enumerate() {
            let hash = match BuildHash::from_source(record) {
                Ok(hash) => hash,
                Err(err) => {
                    error!(position, error = %err, record = ?record, "Skipping malformed promotion record");
                    continue;
                }
            };
            if seen.insert(hash.by_identity()) {
                hashes.push(hash);
            }
        }
        if let Some(count) = count {
            hashes.truncate(count);
        }
        if hashes.is_empty() {
            debug!(criteria = ?query, "No hashes fetched");
        } else {
            debug!(count = hashes.len(), "Fetched hashes");
        }
        Ok(hashes)
    }

    /// Component builds that make up an aggregate, oldest first.
    ///
    /// Reads `<repo_url>/<commit_dir>/delorean.repo` and each component's
    /// `commit.yaml`. Fetch failures surface as `Promotion`.
    pub async fn aggregate_components(&self, hash: &BuildHash) -> PromoterResult<Vec<BuildHash>> {
        let repo_url = format!(
            "{}/{}/delorean.repo",
            self.config.repo_url.trim_end_matches('/'),
            hash.commit_dir()
        );
        debug!(url = %repo_url, "Aggregate repo index");
        let index = get_text(&self.http, &repo_url).await.map_err(|e| {
            error!(url = %repo_url, error = %e, "Error downloading delorean repo");
            PromoterError::Promotion(format!("unable to fetch repo from {repo_url}: {e}"))
        })?;

        let components = parse_repo_index(&index)?;
        if components.is_empty() {
            error!(url = %repo_url, "DLRN aggregate repo contains no components");
            return Err(PromoterError::Promotion(
                "DLRN aggregate repo is empty".to_string(),
            ));
        }
        info!(
            url = %repo_url,
            components = ?components.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
            "DLRN aggregate repo components"
        );

        let mut hashes = Vec::with_capacity(components.len());
        for component in components {
            let commits_url = format!("{}/commit.yaml", component.baseurl);
            let content = get_text(&self.http, &commits_url).await.map_err(|e| {
                PromoterError::Promotion(format!("unable to fetch {commits_url}: {e}"))
            })?;
            let component_hash = parse_commit_yaml(&content)?;
            debug!(
                component = %component.name,
                hash = %component_hash,
                "Adding component hash to promotion list"
            );
            hashes.push(component_hash);
        }
        sort_components(&mut hashes);
        Ok(hashes)
    }

    async fn promote_commit_distro(
        &self,
        hash: &BuildHash,
        target: &str,
    ) -> PromoterResult<BuildHash> {
        let value = self
            .post_json("promotions", &PromotionRequest::new(hash, target))
            .await?;
        let params: HashParams = serde_json::from_value(value)?;
        let promoted = BuildHash::from_source(&params)?;
        if same_build(&promoted, hash) {
            info!(hash = %hash, target_label = %target, "Successfully promoted");
        } else {
            // Logged only: the effective expectation on the response is not
            // well defined for every DLRN deployment.
            error!(
                hash = %hash,
                target_label = %target,
                returned = %promoted,
                "API returned different promoted hash"
            );
        }
        Ok(promoted.with_label(target))
    }

    async fn promote_aggregate(
        &self,
        hash: &BuildHash,
        target: &str,
    ) -> PromoterResult<BuildHash> {
        let components = self.aggregate_components(hash).await?;
        let batch: Vec<_> = components
            .iter()
            .map(|c| PromotionRequest::new(c, target))
            .collect();
        let value = self.post_json("promotions_batch", &batch).await?;
        let params: HashParams = serde_json::from_value(value)?;
        let promoted = BuildHash::from_source(&params)?;

        if let Some(last) = components.last() {
            if !same_build(&promoted, last) {
                error!(
                    hash = %hash,
                    target_label = %target,
                    returned = %promoted,
                    "API returned different promoted hash"
                );
            }
        }
        if promoted.is_aggregate() {
            info!(hash = %hash, target_label = %target, "Successfully promoted aggregate");
            Ok(promoted.with_label(target))
        } else {
            warn!(hash = %hash, "Batch promotion answer carries no aggregate hash");
            Ok(hash.with_label(target))
        }
    }
}

fn identity_query(hash: &BuildHash) -> Vec<(&'static str, String)> {
    match hash {
        BuildHash::Aggregate(h) => vec![("aggregate_hash", h.aggregate_hash.clone())],
        BuildHash::CommitDistro(h) => {
            let mut query = vec![
                ("commit_hash", h.commit_hash.clone()),
                ("distro_hash", h.distro_hash.clone()),
            ];
            if let Some(extended) = &h.extended_hash {
                query.push(("extended_hash", extended.clone()));
            }
            query
        }
    }
}

#[async_trait]
impl DlrnApi for DlrnClient {
    async fn fetch_promotions(
        &self,
        label: &str,
        count: Option<usize>,
    ) -> PromoterResult<Vec<BuildHash>> {
        debug!(label = %label, "Fetching promotion hashes from label");
        self.fetch_hashes(vec![("promote_name", label.to_string())], count)
            .await
    }

    async fn fetch_promotions_from_hash(
        &self,
        hash: &BuildHash,
        count: Option<usize>,
    ) -> PromoterResult<Vec<BuildHash>> {
        debug!(hash = %hash, "Fetching promotion hashes from hash");
        self.fetch_hashes(identity_query(hash), count).await
    }

    async fn fetch_job_results(&self, hash: &BuildHash) -> PromoterResult<Vec<JobResult>> {
        let endpoint = if hash.is_aggregate() {
            "agg_status"
        } else {
            "repo_status"
        };
        let mut query = identity_query(hash);
        query.push(("success", "true".to_string()));
        debug!(hash = %hash, "Fetching list of successful jobs");
        let jobs: Vec<JobResult> = self.get_json(endpoint, &query).await?;
        if jobs.is_empty() {
            debug!(hash = %hash, "No successful jobs");
        }
        for job in &jobs {
            debug!(
                job_id = %job.job_id,
                timestamp = ?job.timestamp,
                url = job.url.as_deref().unwrap_or_default(),
                "Job passed"
            );
        }
        Ok(jobs)
    }

    async fn promote_one(
        &self,
        hash: &BuildHash,
        target: &str,
        candidate: Option<&str>,
    ) -> PromoterResult<BuildHash> {
        debug!(
            hash = %hash,
            candidate_label = candidate.unwrap_or_default(),
            target_label = %target,
            aggregate = hash.is_aggregate(),
            "Dlrn promote"
        );
        match hash {
            BuildHash::CommitDistro(_) => self.promote_commit_distro(hash, target).await,
            BuildHash::Aggregate(_) => self.promote_aggregate(hash, target).await,
        }
    }

    async fn vote(
        &self,
        hash: &BuildHash,
        job_id: &str,
        url: &str,
        success: bool,
    ) -> PromoterResult<JobResult> {
        let params = match hash {
            BuildHash::CommitDistro(_) => hash.dump_to_params(),
            // Aggregate votes carry only the aggregate hash.
            BuildHash::Aggregate(h) => HashParams {
                aggregate_hash: Some(h.aggregate_hash.clone()),
                timestamp: h.timestamp,
                ..Default::default()
            },
        };
        let request = VoteRequest {
            params,
            job_id: job_id.to_string(),
            url: url.to_string(),
            success,
        };
        info!(hash = %hash, job_id = %job_id, success = success, "Dlrn voting");
        let value = self.post_json("report_result", &request).await?;
        if value.is_null() || value.as_object().is_some_and(|o| o.is_empty()) {
            error!(hash = %hash, job_id = %job_id, "API vote response is empty");
            return Err(PromoterError::Promotion("Dlrn vote failed".to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    fn civotes_info(&self, hash: &BuildHash) -> String {
        let api_url = self.config.api_url.trim_end_matches('/');
        match hash {
            BuildHash::CommitDistro(h) => format!(
                "{api_url}/api/civotes_detail.html?commit_hash={}&distro_hash={}",
                h.commit_hash, h.distro_hash
            ),
            BuildHash::Aggregate(h) => format!(
                "{api_url}/api/civotes_agg_detail.html?ref_hash={}",
                h.aggregate_hash
            ),
        }
    }
}
