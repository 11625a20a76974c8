//! DLRN repository and container template client.
//!
//! The containers built for a hash are found by reading the hash's
//! `versions.csv`, taking the tripleo-common commit it was built with, and
//! parsing the container template of that commit.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use promoter_core::{
    release_map, BuildHash, ContainersList, ContainersResolver, PromoterConfig, PromoterError,
    PromoterResult,
};

use crate::http::{build_client, get_text};

/// Releases whose templates name containers `<distro>-binary-<name>`.
const LEGACY_RELEASES: [&str; 5] = ["queens", "stein", "train", "ussuri", "osp16-2"];
const LEGACY_PREFIX: &str = "centos-binary-";
const DEFAULT_PREFIX: &str = "openstack-";

/// One `versions.csv` row keyed by header name.
pub type VersionRow = HashMap<String, String>;

/// Settings for [`RepoClient`].
#[derive(Debug, Clone)]
pub struct RepoClientConfig {
    pub repo_url: String,
    pub containers_list_base_url: String,
    pub containers_list_path: String,
    pub containers_list_exclude_config: Option<String>,
    pub release: String,
    pub container_prefix: Option<String>,
    pub tripleo_common_project: String,
    pub timeout: Duration,
}

impl RepoClientConfig {
    pub fn from_config(config: &PromoterConfig) -> Self {
        Self {
            repo_url: config.repo_url.clone(),
            containers_list_base_url: config.containers_list_base_url.clone(),
            containers_list_path: config.containers_list_path.clone(),
            containers_list_exclude_config: config.containers_list_exclude_config.clone(),
            release: config.release.clone(),
            container_prefix: config.container_prefix.clone(),
            tripleo_common_project: config.tripleo_common_project.clone(),
            timeout: config.http_timeout,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ContainerTemplate {
    #[serde(default)]
    container_images: Vec<ContainerImage>,
}

#[derive(Debug, Deserialize)]
struct ContainerImage {
    imagename: String,
    #[serde(default)]
    image_source: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ExcludeConfig {
    #[serde(default)]
    exclude_containers: HashMap<String, Vec<String>>,
    #[serde(default)]
    exclude_ppc_containers: HashMap<String, Vec<String>>,
}

/// `Source Sha` of the row whose `Project` is `project_name`.
pub fn get_commit_sha(rows: &[VersionRow], project_name: &str) -> Option<String> {
    let sha = rows
        .iter()
        .find(|row| row.get("Project").map(String::as_str) == Some(project_name))
        .and_then(|row| row.get("Source Sha").cloned());
    if sha.is_none() {
        error!(project = %project_name, "Unable to find commit sha for project");
    }
    sha
}

/// `quay.io/tripleomaster/openstack-base:current-tripleo` -> `openstack-base`
fn image_short_name(imagename: &str) -> &str {
    let name = imagename.rsplit('/').next().unwrap_or(imagename);
    name.split(':').next().unwrap_or(name)
}

/// Names matching an exclude entry, taken literally or as an anchored regex.
fn exclusion(entries: &[String]) -> impl Fn(&str) -> bool + '_ {
    let patterns: Vec<Regex> = entries
        .iter()
        .filter_map(|e| Regex::new(&format!("^(?:{e})$")).ok())
        .collect();
    move |name: &str| entries.iter().any(|e| e == name) || patterns.iter().any(|p| p.is_match(name))
}

fn apply_excludes(full_list: &[String], entries: &[String], arch: &str) -> Vec<String> {
    let excluded = exclusion(entries);
    full_list
        .iter()
        .filter(|name| {
            let skip = excluded(name.as_str());
            if skip {
                info!(container = %name, arch = arch, "Excluding container from the list");
            }
            !skip
        })
        .cloned()
        .collect()
}

/// Client for DLRN repositories and container templates.
pub struct RepoClient {
    config: RepoClientConfig,
    http: reqwest::Client,
}

impl RepoClient {
    pub fn new(config: RepoClientConfig) -> PromoterResult<Self> {
        let http = build_client(config.timeout)?;
        Ok(Self { config, http })
    }

    fn is_legacy(&self) -> bool {
        LEGACY_RELEASES.contains(&self.config.release.as_str())
    }

    fn container_prefix(&self) -> &str {
        if self.is_legacy() {
            LEGACY_PREFIX
        } else {
            self.config.container_prefix.as_deref().unwrap_or(DEFAULT_PREFIX)
        }
    }

    /// Rows of the `versions.csv` built with `hash`.
    ///
    /// Tries `<repo_url>/<commit_dir>/versions.csv`, then
    /// `<repo_url>/<candidate_label>/versions.csv`.
    pub async fn get_versions_csv(
        &self,
        hash: &BuildHash,
        candidate_label: &str,
    ) -> PromoterResult<Vec<VersionRow>> {
        let root = self.config.repo_url.trim_end_matches('/');
        let urls = [
            format!("{root}/{}/versions.csv", hash.commit_dir()),
            format!("{root}/{candidate_label}/versions.csv"),
        ];
        for url in &urls {
            debug!(url = %url, "Accessing versions");
            match get_text(&self.http, url).await {
                Ok(content) => return parse_versions_csv(&content),
                Err(e) => warn!(url = %url, error = %e, "Error downloading versions.csv file"),
            }
        }
        Err(PromoterError::MissingArtifact(format!(
            "versions.csv for {} not found",
            hash.short()
        )))
    }

    /// Container short names listed in the template of a tripleo-common commit.
    pub async fn get_containers_list(
        &self,
        tripleo_common_sha: &str,
        load_excludes: bool,
    ) -> PromoterResult<ContainersList> {
        let url = format!(
            "{}/{}/{}",
            self.config.containers_list_base_url.trim_end_matches('/'),
            tripleo_common_sha,
            self.config.containers_list_path.trim_start_matches('/')
        );
        debug!(url = %url, "Attempting download of containers template");
        let content = get_text(&self.http, &url).await.map_err(|e| {
            error!(url = %url, error = %e, "Unable to download containers template");
            PromoterError::MissingArtifact(format!("containers template at {url}: {e}"))
        })?;
        let template: Option<ContainerTemplate> = serde_yaml::from_str(&content)?;
        let images = template.map(|t| t.container_images).unwrap_or_default();
        if images.is_empty() {
            error!(url = %url, "No containers name found");
        }

        let legacy = self.is_legacy();
        let prefix = self.container_prefix();
        let full_list: Vec<String> = images
            .iter()
            .filter(|image| {
                legacy
                    || matches!(image.image_source.as_deref(), Some("tripleo") | Some("kolla"))
            })
            .map(|image| image_short_name(&image.imagename))
            .filter(|name| name.contains(prefix))
            .filter_map(|name| name.rsplit(prefix).next())
            .map(str::to_string)
            .collect();

        if !load_excludes {
            return Ok(ContainersList {
                containers: full_list,
                ppc_containers: Vec::new(),
            });
        }
        Ok(self.load_excludes(full_list).await)
    }

    /// Apply the release exclude lists. Any failure keeps the full list.
    async fn load_excludes(&self, full_list: Vec<String>) -> ContainersList {
        let excludes = match &self.config.containers_list_exclude_config {
            Some(url) => match get_text(&self.http, url).await {
                Ok(content) => serde_yaml::from_str::<ExcludeConfig>(&content)
                    .map_err(|e| error!(error = %e, "Unable to read container exclude config"))
                    .unwrap_or_default(),
                Err(e) => {
                    warn!(url = %url, error = %e, "Unable to download containers exclude config, no exclusion");
                    ExcludeConfig::default()
                }
            },
            None => ExcludeConfig::default(),
        };

        let release = release_map(&self.config.release);
        let exclude_list = excludes.exclude_containers.get(&release);
        if exclude_list.is_none() {
            warn!(release = %release, "Unable to find container exclude list");
        }
        let ppc_exclude_list = excludes.exclude_ppc_containers.get(&release);

        let containers = apply_excludes(
            &full_list,
            exclude_list.map(Vec::as_slice).unwrap_or_default(),
            "x86_64",
        );
        let ppc_containers = match ppc_exclude_list {
            Some(entries) if !entries.is_empty() => apply_excludes(&full_list, entries, "ppc64le"),
            _ => {
                debug!(release = %release, "No ppc container exclude list");
                Vec::new()
            }
        };
        ContainersList {
            containers,
            ppc_containers,
        }
    }
}

fn parse_versions_csv(content: &str) -> PromoterResult<Vec<VersionRow>> {
    let mut reader = csv::Reader::from_reader(content.as_bytes());
    let mut rows = Vec::new();
    for record in reader.deserialize::<VersionRow>() {
        let row = record
            .map_err(|e| PromoterError::MissingArtifact(format!("malformed versions.csv: {e}")))?;
        rows.push(row);
    }
    Ok(rows)
}

#[async_trait]
impl ContainersResolver for RepoClient {
    async fn resolve_containers(
        &self,
        hash: &BuildHash,
        candidate_label: &str,
    ) -> PromoterResult<ContainersList> {
        let rows = self.get_versions_csv(hash, candidate_label).await?;
        let project = &self.config.tripleo_common_project;
        let sha = get_commit_sha(&rows, project).ok_or_else(|| {
            PromoterError::MissingArtifact(format!(
                "no {project} commit in versions.csv of {}",
                hash.short()
            ))
        })?;
        let list = self.get_containers_list(&sha, true).await?;
        if list.containers.is_empty() {
            return Err(PromoterError::MissingArtifact(format!(
                "empty containers list for {}",
                hash.short()
            )));
        }
        info!(
            hash = %hash.short(),
            containers = list.containers.len(),
            ppc_containers = list.ppc_containers.len(),
            "Resolved containers list"
        );
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERSIONS: &str = "\
Project,Source Repo,Source Sha,Dist Repo,Dist Sha,Status,Last Success Timestamp,Component,Extended Sha,Pkg NVR
openstack-tripleo-common,https://opendev.org/openstack/tripleo-common,163d4b3b4b211358512fa9ee7f49d9fb930ecd8f,https://github.com/rdo-packages/tripleo-common-distgit.git,e3b2f5c0d3e4f1a6b7c8d9e0f1a2b3c4d5e6f7a8,SUCCESS,1591372963,tripleo,,openstack-tripleo-common-12.4.1-0.20200605160208.163d4b3.el8
python-tripleoclient,https://opendev.org/openstack/python-tripleoclient,a1b2c3d4e5f60718293a4b5c6d7e8f9012345678,https://github.com/rdo-packages/tripleoclient-distgit.git,0123456789abcdef0123456789abcdef01234567,SUCCESS,1591372963,tripleo,,python3-tripleoclient-13.4.1-0.el8
";

    #[test]
    fn test_versions_csv_and_commit_sha() {
        let rows = parse_versions_csv(VERSIONS).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            get_commit_sha(&rows, "openstack-tripleo-common").as_deref(),
            Some("163d4b3b4b211358512fa9ee7f49d9fb930ecd8f")
        );
        assert_eq!(get_commit_sha(&rows, "openstack-nova"), None);
    }

    #[test]
    fn test_image_short_name() {
        assert_eq!(
            image_short_name("quay.io/tripleomaster/openstack-base:current-tripleo"),
            "openstack-base"
        );
        assert_eq!(
            image_short_name("docker.io/tripleo/centos-binary-aodh-api:current"),
            "centos-binary-aodh-api"
        );
        assert_eq!(image_short_name("openstack-nova"), "openstack-nova");
    }

    #[test]
    fn test_excludes_literal_and_regex() {
        let full: Vec<String> = ["base", "nova-api", "nova-compute", "ironic-pxe"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let entries = vec!["base".to_string(), "nova-.*".to_string()];
        assert_eq!(apply_excludes(&full, &entries, "x86_64"), vec!["ironic-pxe"]);
        assert_eq!(apply_excludes(&full, &[], "x86_64"), full);
    }
}
