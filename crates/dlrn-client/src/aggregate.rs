//! Aggregate repository parsing.
//!
//! An aggregate build is published as a `delorean.repo` index with one
//! section per component, each pointing at the component repository via
//! `baseurl`. Each component repository carries a `commit.yaml` whose first
//! entry names the build that went into the aggregate.

use ini::Ini;
use serde::Deserialize;

use promoter_core::hash::deserialize_timestamp;
use promoter_core::{BuildHash, HashParams, PromoterError, PromoterResult};

/// One `[section]` of a `delorean.repo` index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoComponent {
    pub name: String,
    pub baseurl: String,
}

/// Components listed in a `delorean.repo` index, in file order.
pub fn parse_repo_index(content: &str) -> PromoterResult<Vec<RepoComponent>> {
    let index = Ini::load_from_str(content)
        .map_err(|e| PromoterError::Promotion(format!("invalid aggregate repo index: {e}")))?;

    let mut components = Vec::new();
    for (section, properties) in index.iter() {
        let Some(name) = section else {
            continue;
        };
        let baseurl = properties.get("baseurl").ok_or_else(|| {
            PromoterError::Promotion(format!("aggregate component {name} has no baseurl"))
        })?;
        components.push(RepoComponent {
            name: name.to_string(),
            baseurl: baseurl.trim().trim_end_matches('/').to_string(),
        });
    }
    Ok(components)
}

#[derive(Debug, Deserialize)]
struct CommitsFile {
    #[serde(default)]
    commits: Vec<CommitEntry>,
}

#[derive(Debug, Deserialize)]
struct CommitEntry {
    commit_hash: String,
    distro_hash: String,
    #[serde(default)]
    extended_hash: Option<String>,
    #[serde(default)]
    component: Option<String>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    dt_commit: Option<i64>,
}

/// The build named by the first entry of a component `commit.yaml`.
///
/// `dt_commit` becomes the hash timestamp.
pub fn parse_commit_yaml(content: &str) -> PromoterResult<BuildHash> {
    let file: CommitsFile = serde_yaml::from_str(content)
        .map_err(|e| PromoterError::Promotion(format!("invalid commit.yaml: {e}")))?;
    let entry = file
        .commits
        .into_iter()
        .next()
        .ok_or_else(|| PromoterError::Promotion("commit.yaml lists no commits".to_string()))?;
    BuildHash::from_source(&HashParams {
        commit_hash: Some(entry.commit_hash),
        distro_hash: Some(entry.distro_hash),
        extended_hash: entry.extended_hash,
        aggregate_hash: None,
        component: entry.component,
        timestamp: entry.dt_commit,
    })
}

/// Oldest component first, the order they were originally promoted in.
pub fn sort_components(hashes: &mut [BuildHash]) {
    hashes.sort_by_key(|h| h.timestamp().unwrap_or(i64::MIN));
}
