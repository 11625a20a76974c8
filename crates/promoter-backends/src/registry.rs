//! Container registry promotion.
//!
//! The containers of a candidate are retagged by the container-push
//! playbook. This module resolves the containers list, hands the playbook
//! its extra-vars file and turns a failed run into a `Promotion` error
//! carrying the tail of the playbook output.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, error, info};

use promoter_core::{
    ArtifactPromoter, Backend, BackendOutcome, BuildHash, ContainersList, ContainersResolver,
    PromoterConfig, PromoterError, PromoterResult,
};

use crate::playbook::PlaybookRunner;

/// Lines of playbook output carried in a failure.
const LOG_TAIL_LINES: usize = 20;

/// Variables handed to the container-push playbook.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtraVars {
    pub release: String,
    pub script_root: String,
    pub distro_name: String,
    pub distro_version: String,
    pub manifest_push: bool,
    pub target_registries_push: bool,
    pub candidate_label: String,
    pub named_label: String,
    pub commit_hash: String,
    pub distro_hash: String,
    pub full_hash: String,
    pub containers_list: Vec<String>,
    pub ppc_containers_list: Vec<String>,
    pub source_namespace: String,
    pub target_namespace: String,
}

impl ExtraVars {
    pub fn new(
        config: &PromoterConfig,
        hash: &BuildHash,
        target: &str,
        candidate_label: &str,
        containers: ContainersList,
    ) -> Self {
        Self {
            release: config.release.clone(),
            script_root: config.script_root.display().to_string(),
            distro_name: config.distro_name.clone(),
            distro_version: config.distro_version.clone(),
            manifest_push: config.manifest_push,
            target_registries_push: config.target_registries_push,
            candidate_label: candidate_label.to_string(),
            named_label: target.to_string(),
            commit_hash: hash.commit_hash().to_string(),
            distro_hash: hash.distro_hash().to_string(),
            full_hash: hash.full_hash(),
            containers_list: containers.containers,
            ppc_containers_list: containers.ppc_containers,
            source_namespace: config.source_namespace.clone(),
            target_namespace: config.target_namespace.clone(),
        }
    }

    /// Write the variables to a temporary YAML file, removed when dropped.
    pub fn write_tempfile(&self) -> PromoterResult<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("extra-vars-")
            .suffix(".yaml")
            .tempfile()?;
        let content = serde_yaml::to_string(self)?;
        file.write_all(content.as_bytes())?;
        file.flush()?;
        debug!(path = %file.path().display(), "Created extra vars file");
        Ok(file)
    }
}

/// Promotes containers by retagging `<full_hash>` images to the target label.
pub struct RegistryPromoter<R> {
    config: Arc<PromoterConfig>,
    resolver: R,
    runner: PlaybookRunner,
}

impl<R: ContainersResolver> RegistryPromoter<R> {
    pub fn new(config: Arc<PromoterConfig>, resolver: R) -> Self {
        let runner = PlaybookRunner::new(
            config.playbook_command.clone(),
            config.container_push_playbook.clone(),
            config.container_push_logdir.clone(),
            config.subprocess_timeout,
        );
        Self {
            config,
            resolver,
            runner,
        }
    }

    pub fn runner(&self) -> &PlaybookRunner {
        &self.runner
    }
}

#[async_trait]
impl<R: ContainersResolver> ArtifactPromoter for RegistryPromoter<R> {
    fn backend(&self) -> Backend {
        Backend::Registry
    }

    async fn promote(
        &self,
        hash: &BuildHash,
        target: &str,
        candidate: &str,
        _create_previous: bool,
    ) -> PromoterResult<BackendOutcome> {
        info!(
            backend = %Backend::Registry,
            hash = %hash.short(),
            target_label = %target,
            "Containers promote: attempting promotion"
        );

        let containers = self.resolver.resolve_containers(hash, candidate).await?;
        let count = containers.containers.len();
        let vars = ExtraVars::new(&self.config, hash, target, candidate, containers);
        info!(
            containers = count,
            ppc_containers = vars.ppc_containers_list.len(),
            manifest_push = vars.manifest_push,
            "Passing extra vars to playbook"
        );

        // The file is removed when `extra_vars` drops, whatever the outcome.
        let extra_vars = vars.write_tempfile()?;
        let run = self.runner.run(extra_vars.path()).await?;
        drop(extra_vars);

        if !run.passed() {
            error!(
                hash = %hash.short(),
                target_label = %target,
                exit_code = run.exit_code,
                log = %run.log_path.display(),
                "Containers promote: failed promotion"
            );
            for line in run.output.lines() {
                error!("{}", line);
            }
            return Err(PromoterError::Promotion(format!(
                "failed to promote containers (exit code {}), log {}:\n{}",
                run.exit_code,
                run.log_path.display(),
                run.tail(LOG_TAIL_LINES)
            )));
        }

        info!(
            hash = %hash.short(),
            target_label = %target,
            duration_ms = run.duration_ms,
            "Containers promote: successful promotion"
        );
        for line in run.output.lines() {
            debug!("{}", line);
        }
        Ok(BackendOutcome::new(
            Backend::Registry,
            format!("{count} containers tagged {target}"),
        ))
    }
}
