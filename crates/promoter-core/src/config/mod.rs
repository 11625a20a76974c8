//! Promoter configuration.
//!
//! [`ConfigBuilder`] collects the layers (global defaults, environment
//! defaults, release settings, CLI overrides, extra settings) and produces a
//! fully rendered, validated and immutable [`PromoterConfig`].

mod defaults;
mod layers;

pub use defaults::GLOBAL_DEFAULTS;
pub use layers::{parse_mapping, ConfigBuilder, Layer, PASSWORD_ENV};

use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use crate::criteria::PromotionCriteria;
use crate::error::{PromoterError, PromoterResult};
use crate::records::Backend;

const LOG_LEVELS: [&str; 7] = ["TRACE", "DEBUG", "INFO", "WARN", "WARNING", "ERROR", "CRITICAL"];

/// A configured promotion step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromotionTarget {
    /// Label to promote to, e.g. `current-tripleo`.
    pub name: String,
    /// Label whose hashes are candidates, e.g. `tripleo-ci-testing`.
    pub candidate_label: String,
    pub criteria: PromotionCriteria,
}

/// How the qcow server is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QcowClientKind {
    /// Local filesystem
    Os,
    /// Remote server over SSH
    Sftp,
}

/// A host serving overcloud images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcowServer {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub keypath: Option<String>,
    pub root: String,
    pub client: QcowClientKind,
}

fn default_ssh_port() -> u16 {
    22
}

/// Overcloud image settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OvercloudImages {
    #[serde(default)]
    pub qcow_servers: BTreeMap<String, QcowServer>,
    #[serde(default)]
    pub qcow_images: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    String(String),
    List(Vec<String>),
}

impl StringOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StringOrList::String(s) => s
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            StringOrList::List(items) => items,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawTarget {
    candidate_label: Option<String>,
    #[serde(default)]
    criteria: Option<Vec<String>>,
    #[serde(default)]
    alternative_criteria: BTreeMap<String, StringOrList>,
}

/// Merged and rendered settings before derivation and validation.
#[derive(Debug, Deserialize)]
pub(crate) struct RawConfig {
    release: Option<String>,
    distro_name: Option<String>,
    distro_version: Option<serde_yaml::Value>,
    distro: Option<String>,
    api_url: Option<String>,
    dlrn_api_host: Option<String>,
    dlrn_api_port: Option<u16>,
    dlrn_api_scheme: Option<String>,
    dlrn_api_endpoint: Option<String>,
    dlrnauth_username: Option<String>,
    repo_url: Option<String>,
    containers_list_base_url: Option<String>,
    containers_list_path: Option<String>,
    containers_list_exclude_config: Option<String>,
    container_prefix: Option<String>,
    tripleo_common_project: Option<String>,
    promotions: Option<Mapping>,
    latest_hashes_count: Option<usize>,
    log_file: Option<String>,
    log_level: Option<String>,
    allowed_clients: Option<StringOrList>,
    create_previous: Option<bool>,
    manifest_push: Option<bool>,
    target_registries_push: Option<bool>,
    dry_run: Option<bool>,
    source_namespace: Option<String>,
    target_namespace: Option<String>,
    script_root: Option<String>,
    container_push_playbook: Option<String>,
    container_push_logdir: Option<String>,
    playbook_command: Option<String>,
    http_timeout_secs: Option<u64>,
    subprocess_timeout_secs: Option<u64>,
    qcow_validation: Option<bool>,
    default_qcow_server: Option<String>,
    overcloud_images: Option<OvercloudImages>,
}

/// Fully rendered promoter configuration. Immutable once built.
#[derive(Debug, Clone, Serialize)]
pub struct PromoterConfig {
    pub release: String,
    pub distro_name: String,
    pub distro_version: String,
    /// `distro_name` + `distro_version`, e.g. `centos8`.
    pub distro: String,
    pub api_url: String,
    pub dlrnauth_username: String,
    #[serde(skip_serializing)]
    pub dlrnauth_password: String,
    pub repo_url: String,
    pub containers_list_base_url: String,
    pub containers_list_path: String,
    pub containers_list_exclude_config: Option<String>,
    pub container_prefix: Option<String>,
    pub tripleo_common_project: String,
    /// In configuration order.
    pub promotions: Vec<PromotionTarget>,
    pub latest_hashes_count: usize,
    pub log_file: Option<PathBuf>,
    pub log_level: String,
    /// In promotion order.
    pub allowed_clients: Vec<Backend>,
    pub create_previous: bool,
    pub manifest_push: bool,
    pub target_registries_push: bool,
    pub dry_run: bool,
    pub source_namespace: String,
    pub target_namespace: String,
    pub script_root: PathBuf,
    pub container_push_playbook: PathBuf,
    pub container_push_logdir: PathBuf,
    pub playbook_command: String,
    pub http_timeout: Duration,
    pub subprocess_timeout: Duration,
    pub qcow_validation: bool,
    pub default_qcow_server: String,
    pub overcloud_images: OvercloudImages,
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    } else if path == "~" {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home);
        }
    }
    PathBuf::from(path)
}

/// Downstream release names used in server paths and exclude lists.
pub fn release_map(release: &str) -> String {
    match release {
        "osp16-2" => "rhos-16.2".to_string(),
        "osp17" => "rhos-17".to_string(),
        other => other.to_string(),
    }
}

/// Container namespace for a release.
pub fn release_namespace(release: &str) -> String {
    if release == "ussuri" {
        "tripleou".to_string()
    } else {
        format!("tripleo{release}")
    }
}

fn scalar_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn required(value: Option<String>, name: &str, errors: &mut Vec<String>) -> String {
    match value {
        Some(v) if !v.is_empty() => v,
        _ => {
            errors.push(format!("missing setting '{name}'"));
            String::new()
        }
    }
}

/// `scheme://host[:port]/endpoint`, default ports omitted.
fn construct_api_url(
    scheme: &str,
    host: &str,
    port: Option<u16>,
    endpoint: Option<&str>,
    distro_name: &str,
    distro_version: &str,
    release: &str,
) -> String {
    let endpoint = match endpoint {
        Some(e) => e.to_string(),
        None => {
            let mut distro_endpoint = distro_name.to_string();
            if distro_version == "8" {
                distro_endpoint.push_str(distro_version);
            }
            let release_endpoint = if release == "master" {
                "master-uc"
            } else {
                release
            };
            format!("api-{distro_endpoint}-{release_endpoint}")
        }
    };
    let port = match (scheme, port) {
        (_, None) | ("https", Some(443)) | ("http", Some(80)) => String::new(),
        (_, Some(p)) => format!(":{p}"),
    };
    let endpoint = endpoint.trim_matches('/');
    if endpoint.is_empty() {
        format!("{scheme}://{host}{port}")
    } else {
        format!("{scheme}://{host}{port}/{endpoint}")
    }
}

fn parse_promotions(
    promotions: Option<Mapping>,
    errors: &mut Vec<String>,
) -> Vec<PromotionTarget> {
    let promotions = match promotions {
        Some(p) if !p.is_empty() => p,
        Some(_) => {
            errors.push("empty promotions section".to_string());
            return Vec::new();
        }
        None => {
            errors.push("missing promotions section".to_string());
            return Vec::new();
        }
    };

    let mut targets = Vec::new();
    for (key, value) in promotions {
        let Some(name) = key.as_str().map(str::to_string) else {
            errors.push(format!("promotion target name {key:?} is not a string"));
            continue;
        };
        if name.starts_with("previous-") {
            errors.push(format!("target name '{name}' uses the reserved previous- prefix"));
            continue;
        }
        let raw: RawTarget = match serde_yaml::from_value(value) {
            Ok(raw) => raw,
            Err(e) => {
                errors.push(format!("invalid promotion target {name}: {e}"));
                continue;
            }
        };
        let Some(candidate_label) = raw.candidate_label.filter(|c| !c.is_empty()) else {
            errors.push(format!("missing candidate label for target {name}"));
            continue;
        };
        let required = raw.criteria.unwrap_or_default();
        if required.is_empty() {
            warn!(target_label = %name, "Empty criteria for target, it will never be promoted");
        }
        let criteria = PromotionCriteria {
            required: required.into_iter().collect(),
            alternatives: raw
                .alternative_criteria
                .into_iter()
                .map(|(job, alts)| (job, alts.into_vec()))
                .collect(),
        };
        targets.push(PromotionTarget {
            name,
            candidate_label,
            criteria,
        });
    }
    targets
}

impl PromoterConfig {
    /// Derive constructed values and validate.
    pub(crate) fn from_raw(raw: RawConfig, password: Option<String>) -> PromoterResult<Self> {
        let mut errors = Vec::new();

        let release = required(raw.release, "release", &mut errors);
        let distro_name = required(raw.distro_name, "distro_name", &mut errors).to_lowercase();
        let distro_version = required(
            raw.distro_version.as_ref().and_then(scalar_string),
            "distro_version",
            &mut errors,
        );
        let distro = raw
            .distro
            .unwrap_or_else(|| format!("{distro_name}{distro_version}"));

        let api_url = match (raw.api_url, raw.dlrn_api_host) {
            (Some(url), _) if !url.is_empty() => url,
            (_, Some(host)) if !host.is_empty() => construct_api_url(
                raw.dlrn_api_scheme.as_deref().unwrap_or("https"),
                &host,
                raw.dlrn_api_port,
                raw.dlrn_api_endpoint.as_deref(),
                &distro_name,
                &distro_version,
                &release,
            ),
            _ => {
                errors.push("no valid API url found, set dlrn_api_host".to_string());
                String::new()
            }
        };

        let dlrnauth_password = match password {
            Some(p) if !p.is_empty() => p,
            _ => {
                errors.push(format!("no dlrnapi password found in env ({PASSWORD_ENV})"));
                String::new()
            }
        };

        let log_level = raw.log_level.unwrap_or_else(|| "INFO".to_string()).to_uppercase();
        if !LOG_LEVELS.contains(&log_level.as_str()) {
            errors.push(format!("unrecognized log level: {log_level}"));
        }

        let mut allowed_clients = Vec::new();
        let clients = raw
            .allowed_clients
            .map(StringOrList::into_vec)
            .unwrap_or_else(|| Backend::ORDER.iter().map(|b| b.to_string()).collect());
        for client in clients {
            match client.parse::<Backend>() {
                Ok(backend) if !allowed_clients.contains(&backend) => allowed_clients.push(backend),
                Ok(_) => {}
                Err(e) => errors.push(e.to_string()),
            }
        }
        allowed_clients.sort();

        let promotions = parse_promotions(raw.promotions, &mut errors);

        let default_qcow_server = raw.default_qcow_server.unwrap_or_else(|| "local".to_string());
        let overcloud_images = raw.overcloud_images.unwrap_or(OvercloudImages {
            qcow_servers: BTreeMap::new(),
            qcow_images: Vec::new(),
        });
        if allowed_clients.contains(&Backend::Qcow)
            && !overcloud_images.qcow_servers.contains_key(&default_qcow_server)
        {
            errors.push(format!(
                "qcow server '{default_qcow_server}' not found in overcloud_images.qcow_servers"
            ));
        }

        let script_root = expand_home(raw.script_root.as_deref().unwrap_or("."));
        let container_push_playbook = raw
            .container_push_playbook
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| script_root.join("container-push").join("container-push.yml"));

        if !errors.is_empty() {
            return Err(PromoterError::Config(errors.join(", ")));
        }

        let namespace = release_namespace(&release);
        let config = PromoterConfig {
            source_namespace: raw.source_namespace.unwrap_or_else(|| namespace.clone()),
            target_namespace: raw.target_namespace.unwrap_or(namespace),
            repo_url: raw.repo_url.unwrap_or_default().trim_end_matches('/').to_string(),
            containers_list_base_url: raw.containers_list_base_url.unwrap_or_default(),
            containers_list_path: raw.containers_list_path.unwrap_or_default(),
            containers_list_exclude_config: raw
                .containers_list_exclude_config
                .filter(|s| !s.is_empty()),
            container_prefix: raw.container_prefix.filter(|s| !s.is_empty()),
            tripleo_common_project: raw
                .tripleo_common_project
                .unwrap_or_else(|| "openstack-tripleo-common".to_string()),
            dlrnauth_username: raw.dlrnauth_username.unwrap_or_else(|| "ciuser".to_string()),
            latest_hashes_count: raw.latest_hashes_count.unwrap_or(10),
            log_file: raw.log_file.as_deref().filter(|s| !s.is_empty()).map(expand_home),
            create_previous: raw.create_previous.unwrap_or(true),
            manifest_push: raw.manifest_push.unwrap_or(false),
            target_registries_push: raw.target_registries_push.unwrap_or(true),
            dry_run: raw.dry_run.unwrap_or(false),
            container_push_logdir: expand_home(
                raw.container_push_logdir
                    .as_deref()
                    .unwrap_or("~/web/promoter_logs/container-push"),
            ),
            playbook_command: raw
                .playbook_command
                .unwrap_or_else(|| "ansible-playbook".to_string()),
            http_timeout: Duration::from_secs(raw.http_timeout_secs.unwrap_or(60)),
            subprocess_timeout: Duration::from_secs(raw.subprocess_timeout_secs.unwrap_or(300)),
            qcow_validation: raw.qcow_validation.unwrap_or(true),
            release,
            distro_name,
            distro_version,
            distro,
            api_url,
            dlrnauth_password,
            promotions,
            log_level,
            allowed_clients,
            script_root,
            container_push_playbook,
            default_qcow_server,
            overcloud_images,
        };
        debug!(api_url = %config.api_url, targets = config.promotions.len(), "Configuration materialized");
        Ok(config)
    }

    /// Settings of the default qcow server.
    pub fn qcow_server(&self) -> PromoterResult<&QcowServer> {
        self.overcloud_images
            .qcow_servers
            .get(&self.default_qcow_server)
            .ok_or_else(|| {
                PromoterError::Config(format!(
                    "qcow server '{}' not configured",
                    self.default_qcow_server
                ))
            })
    }

    pub fn target(&self, name: &str) -> Option<&PromotionTarget> {
        self.promotions.iter().find(|t| t.name == name)
    }

    pub fn is_allowed(&self, backend: Backend) -> bool {
        self.allowed_clients.contains(&backend)
    }

    /// Stable digest of the materialized configuration, password excluded.
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELEASE: &str = r#"
release: master
distro_name: CentOS
distro_version: 8
dlrn_api_host: trunk.rdoproject.org
promotions:
  current-tripleo:
    candidate_label: tripleo-ci-testing
    criteria:
      - job1
      - job2
    alternative_criteria:
      job2: job2-alt
  current-tripleo-rdo:
    candidate_label: current-tripleo
    criteria: [job3]
"#;

    fn builder(release: &str) -> ConfigBuilder {
        ConfigBuilder::new().layer(Layer::Release, parse_mapping(release, "release").unwrap())
    }

    #[test]
    fn test_build_with_derived_values() {
        let config = builder(RELEASE)
            .build_with_password(Some("secret".into()))
            .expect("valid config");
        assert_eq!(config.distro_name, "centos");
        assert_eq!(config.distro, "centos8");
        assert_eq!(config.api_url, "https://trunk.rdoproject.org/api-centos8-master-uc");
        assert_eq!(config.repo_url, "https://trunk.rdoproject.org/centos8-master");
        assert_eq!(config.source_namespace, "tripleomaster");
        assert_eq!(config.latest_hashes_count, 10);
        assert_eq!(config.allowed_clients, Backend::ORDER.to_vec());
        assert_eq!(config.http_timeout, Duration::from_secs(60));
        assert_eq!(config.subprocess_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_promotions_keep_insertion_order() {
        let config = builder(RELEASE).build_with_password(Some("x".into())).unwrap();
        let names: Vec<_> = config.promotions.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["current-tripleo", "current-tripleo-rdo"]);
        let target = config.target("current-tripleo").unwrap();
        assert_eq!(target.candidate_label, "tripleo-ci-testing");
        assert_eq!(
            target.criteria.alternatives.get("job2"),
            Some(&vec!["job2-alt".to_string()])
        );
    }

    #[test]
    fn test_missing_password_is_config_error() {
        let err = builder(RELEASE).build_with_password(None).unwrap_err();
        assert!(matches!(&err, PromoterError::Config(m) if m.contains(PASSWORD_ENV)));
    }

    #[test]
    fn test_missing_promotions_is_config_error() {
        let release = "release: master\ndistro_name: centos\ndistro_version: 8\ndlrn_api_host: h";
        let err = builder(release).build_with_password(Some("x".into())).unwrap_err();
        assert!(matches!(&err, PromoterError::Config(m) if m.contains("promotions")));
    }

    #[test]
    fn test_reserved_previous_target_rejected() {
        let release = format!("{RELEASE}  previous-current-tripleo:\n    candidate_label: x\n    criteria: [a]\n");
        let err = builder(&release).build_with_password(Some("x".into())).unwrap_err();
        assert!(matches!(&err, PromoterError::Config(m) if m.contains("previous-")));
    }

    #[test]
    fn test_empty_criteria_is_only_a_warning() {
        let release = "release: train\ndistro_name: centos\ndistro_version: 7\ndlrn_api_host: h\n\
                       promotions:\n  current-tripleo:\n    candidate_label: tripleo-ci-testing\n";
        let config = builder(release).build_with_password(Some("x".into())).unwrap();
        assert!(config.promotions[0].criteria.is_empty());
        assert_eq!(config.api_url, "https://h/api-centos-train");
    }

    #[test]
    fn test_allowed_clients_string_or_list_sorted() {
        let cli = parse_mapping("allowed_clients: dlrn_client,registries_client", "cli").unwrap();
        let config = builder(RELEASE)
            .layer(Layer::Cli, cli)
            .build_with_password(Some("x".into()))
            .unwrap();
        assert_eq!(config.allowed_clients, vec![Backend::Registry, Backend::Dlrn]);

        let extra = parse_mapping("allowed_clients: [qcow_client]", "extra").unwrap();
        let config = builder(RELEASE)
            .layer(Layer::Extra, extra)
            .build_with_password(Some("x".into()))
            .unwrap();
        assert_eq!(config.allowed_clients, vec![Backend::Qcow]);

        let bad = parse_mapping("allowed_clients: docker_client", "cli").unwrap();
        assert!(builder(RELEASE)
            .layer(Layer::Cli, bad)
            .build_with_password(Some("x".into()))
            .is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let cli = parse_mapping("log_level: LOUD", "cli").unwrap();
        let err = builder(RELEASE)
            .layer(Layer::Cli, cli)
            .build_with_password(Some("x".into()))
            .unwrap_err();
        assert!(err.to_string().contains("log level"));
    }

    #[test]
    fn test_api_url_ports_and_endpoint() {
        assert_eq!(
            construct_api_url("http", "localhost", Some(58080), Some(""), "centos", "8", "master"),
            "http://localhost:58080"
        );
        assert_eq!(
            construct_api_url("https", "h", Some(443), None, "centos", "7", "ussuri"),
            "https://h/api-centos-ussuri"
        );
    }

    #[test]
    fn test_release_helpers() {
        assert_eq!(release_namespace("ussuri"), "tripleou");
        assert_eq!(release_namespace("wallaby"), "tripleowallaby");
        assert_eq!(release_map("osp16-2"), "rhos-16.2");
        assert_eq!(release_map("osp17"), "rhos-17");
        assert_eq!(release_map("master"), "master");
    }

    #[test]
    fn test_digest_excludes_password() {
        let a = builder(RELEASE).build_with_password(Some("one".into())).unwrap();
        let b = builder(RELEASE).build_with_password(Some("two".into())).unwrap();
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);
    }
}
