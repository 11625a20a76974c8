//! DLRN Promoter CLI
//!
//! The `dlrn-promoter` command advances DLRN builds from candidate labels
//! to promoted labels on the DLRN API, the container registries and the
//! overcloud image server.
//!
//! ## Commands
//!
//! - `promote-all`: promote every configured target once
//! - `force-promote`: promote a given hash, bypassing candidate selection
//! - `validate-qcows`: inspect the images of a hash on the image server
//! - `check-config`: print the materialized configuration
//!
//! ## Exit codes
//!
//! 0 normal, 1 configuration error, 2 named hash changed during the run,
//! 3 any other error.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, warn, Level};

use dlrn_client::{DlrnClient, DlrnClientConfig, RepoClient, RepoClientConfig};
use promoter_backends::{QcowPromoter, RegistryPromoter};
use promoter_core::telemetry::{init_tracing, open_log_file, parse_level};
use promoter_core::{
    ArtifactPromoter, Backend, BuildHash, ConfigBuilder, HashParams, JsonLinesReporter, Layer,
    PromoterConfig, PromoterError, Promoter,
};

#[derive(Parser)]
#[command(name = "dlrn-promoter")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Promote DLRN builds to named labels", long_about = None)]
struct Cli {
    /// Release settings file
    #[arg(long, global = true, env = "PROMOTER_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Log level (DEBUG, INFO, WARNING, ERROR)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Evaluate candidates without writing anything
    #[arg(long, global = true)]
    dry_run: bool,

    /// Settings file applied over every other layer
    #[arg(long, global = true)]
    extra_settings: Option<PathBuf>,

    /// Append one JSON line per promotion attempt to this file
    #[arg(long, global = true)]
    report_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Promote every configured target once
    PromoteAll,

    /// Promote a specific hash, bypassing candidate selection and criteria
    ForcePromote {
        #[command(flatten)]
        hash: HashArgs,

        /// Comma-separated clients allowed to perform the promotion
        #[arg(long)]
        allowed_clients: Option<String>,

        /// Label associated with the candidate hash
        candidate_label: String,

        /// Label to promote the candidate hash to
        target_label: String,
    },

    /// Print the qcow validation record of a hash as JSON
    ValidateQcows {
        #[command(flatten)]
        hash: HashArgs,

        /// Also check that this label points at the hash
        #[arg(long)]
        name: Option<String>,
    },

    /// Print the configuration digest and the promotion targets
    CheckConfig,
}

#[derive(Args, Debug, Clone)]
struct HashArgs {
    /// Commit hash part of the build
    #[arg(long)]
    commit_hash: String,

    /// Distro hash part of the build
    #[arg(long)]
    distro_hash: String,

    /// Extended hash, `<distro>_<commit>`
    #[arg(long)]
    extended_hash: Option<String>,

    /// Aggregate hash, for component pipelines
    #[arg(long)]
    aggregate_hash: Option<String>,
}

impl HashArgs {
    fn to_hash(&self) -> Result<BuildHash> {
        let hash = BuildHash::from_source(&HashParams {
            commit_hash: Some(self.commit_hash.clone()),
            distro_hash: Some(self.distro_hash.clone()),
            extended_hash: self.extended_hash.clone(),
            aggregate_hash: self.aggregate_hash.clone(),
            ..Default::default()
        })
        .context("Unable to generate a valid candidate hash from the information provided")?;
        Ok(hash)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "Promoter terminated abnormally");
            eprintln!("Error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

/// 1 for configuration errors, 2 when a named hash changed, 3 otherwise.
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<PromoterError>() {
        Some(PromoterError::Config(_)) => 1,
        Some(PromoterError::HashChanged { .. }) => 2,
        _ => 3,
    }
}

async fn run(cli: Cli) -> Result<()> {
    let allowed_clients = match &cli.command {
        Commands::ForcePromote {
            allowed_clients, ..
        } => allowed_clients.clone(),
        _ => None,
    };
    let config = Arc::new(load_config(&cli, allowed_clients.as_deref())?);
    setup_logging(&config, cli.json)?;
    info!(
        release = %config.release,
        distro = %config.distro,
        config_digest = %config.digest(),
        "Configuration loaded"
    );

    match cli.command {
        Commands::PromoteAll => cmd_promote_all(config, cli.report_file.as_deref()).await,
        Commands::ForcePromote {
            hash,
            candidate_label,
            target_label,
            ..
        } => {
            cmd_force_promote(
                config,
                &hash.to_hash()?,
                &candidate_label,
                &target_label,
                cli.report_file.as_deref(),
            )
            .await
        }
        Commands::ValidateQcows { hash, name } => {
            cmd_validate_qcows(&config, &hash.to_hash()?, name.as_deref()).await
        }
        Commands::CheckConfig => cmd_check_config(&config),
    }
}

// ========== Configuration ==========

/// Layer values coming from command line flags.
fn cli_overrides(
    log_level: Option<&str>,
    dry_run: bool,
    allowed_clients: Option<&str>,
) -> Mapping {
    let mut overrides = Mapping::new();
    if let Some(level) = log_level {
        overrides.insert(Value::from("log_level"), Value::from(level));
    }
    if dry_run {
        overrides.insert(Value::from("dry_run"), Value::from(true));
    }
    if let Some(clients) = allowed_clients {
        overrides.insert(Value::from("allowed_clients"), Value::from(clients));
    }
    overrides
}

/// Global defaults, `defaults.yaml` next to the release file, the release
/// file, command line flags, then the extra settings file.
fn load_config(cli: &Cli, allowed_clients: Option<&str>) -> Result<PromoterConfig> {
    let config_file = cli
        .config_file
        .as_deref()
        .ok_or_else(|| PromoterError::Config("--config-file is required".to_string()))?;
    Ok(build_config(
        config_file,
        cli.extra_settings.as_deref(),
        cli_overrides(cli.log_level.as_deref(), cli.dry_run, allowed_clients),
        std::env::var(promoter_core::PASSWORD_ENV).ok(),
    )?)
}

fn build_config(
    config_file: &Path,
    extra_settings: Option<&Path>,
    overrides: Mapping,
    password: Option<String>,
) -> promoter_core::PromoterResult<PromoterConfig> {
    let mut builder = ConfigBuilder::new();
    if let Some(dir) = config_file.parent() {
        builder = builder.optional_layer_file(Layer::EnvironmentDefaults, &dir.join("defaults.yaml"))?;
    }
    builder = builder
        .layer_file(Layer::Release, config_file)?
        .layer(Layer::Cli, overrides);
    if let Some(extra) = extra_settings {
        builder = builder.layer_file(Layer::Extra, extra)?;
    }
    builder.build_with_password(password)
}

fn setup_logging(config: &PromoterConfig, json: bool) -> Result<()> {
    let level = parse_level(&config.log_level).unwrap_or(Level::INFO);
    let log_file = match &config.log_file {
        Some(path) => Some(
            open_log_file(path)
                .with_context(|| format!("Unable to open log file {}", path.display()))?,
        ),
        None => None,
    };
    init_tracing(json, level, log_file);
    Ok(())
}

// ========== Wiring ==========

fn build_promoter(config: Arc<PromoterConfig>, report_file: Option<&Path>) -> Result<Promoter> {
    let dlrn = Arc::new(DlrnClient::new(DlrnClientConfig::from_config(&config))?);

    let mut backends: Vec<Arc<dyn ArtifactPromoter>> = Vec::new();
    if config.is_allowed(Backend::Registry) {
        let repo = RepoClient::new(RepoClientConfig::from_config(&config))?;
        backends.push(Arc::new(RegistryPromoter::new(config.clone(), repo)));
    }
    if config.is_allowed(Backend::Qcow) {
        backends.push(Arc::new(QcowPromoter::new(&config)?));
    }

    let mut promoter = Promoter::new(config, dlrn, backends);
    if let Some(path) = report_file {
        let reporter = JsonLinesReporter::open(path)?;
        promoter = promoter.with_reporter(Arc::new(reporter));
    }

    // Ctrl-C stops the run at the next target or candidate boundary.
    let cancel = promoter.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current candidate");
            cancel.store(true, Ordering::SeqCst);
        }
    });
    Ok(promoter)
}

// ========== Commands ==========

async fn cmd_promote_all(config: Arc<PromoterConfig>, report_file: Option<&Path>) -> Result<()> {
    let promoter = build_promoter(config, report_file)?;
    let summary = promoter.promote_all().await?;

    for (hash, target) in &summary.promoted {
        println!("Promoted {} to {}", hash.full_hash(), target);
    }
    for (hash, target) in &summary.dry_run_picks {
        println!("Would promote {} to {}", hash.full_hash(), target);
    }
    for status in &summary.targets {
        match &status.last_error {
            Some(err) => println!("{}: {} (last error: {})", status.target, status.state, err),
            None => println!("{}: {}", status.target, status.state),
        }
    }
    if summary.cancelled {
        println!("Run cancelled");
    }
    Ok(())
}

async fn cmd_force_promote(
    config: Arc<PromoterConfig>,
    hash: &BuildHash,
    candidate_label: &str,
    target_label: &str,
    report_file: Option<&Path>,
) -> Result<()> {
    let promoter = build_promoter(config, report_file)?;
    let record = promoter
        .force_promote(hash, candidate_label, target_label)
        .await?;

    println!("Promoted {} to {}", record.hash.full_hash(), record.target);
    for outcome in &record.outcomes {
        println!("  {}: {}", outcome.backend, outcome.detail);
    }
    Ok(())
}

async fn cmd_validate_qcows(
    config: &PromoterConfig,
    hash: &BuildHash,
    name: Option<&str>,
) -> Result<()> {
    let qcow = QcowPromoter::new(config)?;
    let report = qcow.validate_qcows(hash, name).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_check_config(config: &PromoterConfig) -> Result<()> {
    println!("config digest: {}", config.digest());
    println!("api url: {}", config.api_url);
    println!("release: {} ({})", config.release, config.distro);
    let clients: Vec<String> = config.allowed_clients.iter().map(|c| c.to_string()).collect();
    println!("allowed clients: {}", clients.join(","));
    for target in &config.promotions {
        println!(
            "target {} <- {} ({} jobs)",
            target.name,
            target.candidate_label,
            target.criteria.required.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RELEASE: &str = r#"
release: master
distro_name: centos
distro_version: 8
dlrn_api_host: trunk.example.org
promotions:
  current-tripleo:
    candidate_label: tripleo-ci-testing
    criteria: [periodic-standalone]
"#;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_cli_parses_force_promote() {
        let cli = Cli::try_parse_from([
            "dlrn-promoter",
            "--config-file",
            "/etc/promoter/master.yaml",
            "force-promote",
            "--commit-hash",
            "90633a3785687ddf3d37c0f86f9ad9f93926d639",
            "--distro-hash",
            "d68290fed3d9aa069c95fc16d0d481084adbadc6",
            "--allowed-clients",
            "dlrn_client",
            "tripleo-ci-testing",
            "current-tripleo",
        ])
        .unwrap();
        match cli.command {
            Commands::ForcePromote {
                hash,
                allowed_clients,
                candidate_label,
                target_label,
            } => {
                assert_eq!(allowed_clients.as_deref(), Some("dlrn_client"));
                assert_eq!(candidate_label, "tripleo-ci-testing");
                assert_eq!(target_label, "current-tripleo");
                assert!(!hash.to_hash().unwrap().is_aggregate());
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_invalid_hash_is_rejected() {
        let args = HashArgs {
            commit_hash: "not-hex".to_string(),
            distro_hash: "d68290fed3d9aa069c95fc16d0d481084adbadc6".to_string(),
            extended_hash: None,
            aggregate_hash: None,
        };
        assert!(args.to_hash().is_err());
    }

    #[test]
    fn test_layers_from_files_and_flags() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "defaults.yaml", "latest_hashes_count: 5\nlog_level: DEBUG\n");
        let release = write(dir.path(), "master.yaml", RELEASE);
        let extra = write(dir.path(), "extra.yaml", "latest_hashes_count: 3\n");

        let config = build_config(
            &release,
            Some(&extra),
            cli_overrides(Some("ERROR"), true, Some("dlrn_client")),
            Some("secret".to_string()),
        )
        .unwrap();

        assert_eq!(config.latest_hashes_count, 3);
        assert_eq!(config.log_level, "ERROR");
        assert!(config.dry_run);
        assert_eq!(config.allowed_clients, vec![Backend::Dlrn]);
    }

    #[test]
    fn test_missing_release_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = build_config(
            &dir.path().join("absent.yaml"),
            None,
            Mapping::new(),
            Some("secret".to_string()),
        )
        .unwrap_err();
        assert!(matches!(err, PromoterError::Config(_)));
    }

    #[test]
    fn test_exit_codes() {
        let config: anyhow::Error = PromoterError::Config("x".into()).into();
        assert_eq!(exit_code(&config), 1);

        let changed: anyhow::Error = PromoterError::HashChanged {
            label: "current-tripleo".into(),
            stored: "a".into(),
            fetched: "b".into(),
        }
        .into();
        assert_eq!(exit_code(&changed), 2);

        let wrapped = anyhow::Error::from(PromoterError::Config("x".into())).context("loading");
        assert_eq!(exit_code(&wrapped), 1);

        let other: anyhow::Error = PromoterError::Promotion("x".into()).into();
        assert_eq!(exit_code(&other), 3);
    }
}
