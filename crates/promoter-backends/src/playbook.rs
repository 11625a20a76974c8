//! Container-push playbook execution.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::process::Command;
use tracing::{debug, info};

use promoter_core::{PromoterError, PromoterResult};

/// Result of a playbook execution.
#[derive(Debug, Clone)]
pub struct PlaybookRun {
    /// Exit code (-1 when killed by a signal).
    pub exit_code: i32,

    /// Combined stdout and stderr, color codes removed.
    pub output: String,

    /// Log file holding the ansible log and the captured output.
    pub log_path: PathBuf,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,
}

impl PlaybookRun {
    /// Whether the playbook passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Last `lines` lines of the captured output.
    pub fn tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.output.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}

/// Remove ANSI color sequences from playbook output.
pub fn strip_ansi(text: &str) -> String {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| Regex::new(r"(\x9B|\x1B\[)[0-?]*[ -/]*[@-~]").expect("valid ANSI regex"))
        .replace_all(text, "")
        .into_owned()
}

/// Runs `<command> -v -e @<extra_vars> <playbook>` with a timeout.
#[derive(Debug, Clone)]
pub struct PlaybookRunner {
    pub command: String,
    pub playbook: PathBuf,
    pub logdir: PathBuf,
    pub timeout: Duration,
}

impl PlaybookRunner {
    pub fn new(
        command: impl Into<String>,
        playbook: impl Into<PathBuf>,
        logdir: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            playbook: playbook.into(),
            logdir: logdir.into(),
            timeout,
        }
    }

    /// `<logdir>/<YYYYmmdd-HHMMSS>.log`
    fn log_path(&self) -> PathBuf {
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
        self.logdir.join(format!("{stamp}.log"))
    }

    /// Execute the playbook with the given extra-vars file.
    ///
    /// A non-zero exit is reported through [`PlaybookRun::passed`]; only
    /// spawn failures and timeouts are errors.
    pub async fn run(&self, extra_vars: &Path) -> PromoterResult<PlaybookRun> {
        let start = Instant::now();

        let mut parts = self.command.split_whitespace();
        let exe = parts
            .next()
            .ok_or_else(|| PromoterError::Config("playbook command is empty".to_string()))?;

        tokio::fs::create_dir_all(&self.logdir).await?;
        let log_path = self.log_path();

        let mut command = Command::new(exe);
        command
            .args(parts)
            .arg("-v")
            .arg("-e")
            .arg(format!("@{}", extra_vars.display()))
            .arg(&self.playbook)
            .env("ANSIBLE_LOG_PATH", &log_path)
            .env("ANSIBLE_DEBUG", "False")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(
            command = %self.command,
            playbook = %self.playbook.display(),
            extra_vars = %extra_vars.display(),
            log = %log_path.display(),
            "Running container push playbook"
        );
        let child = command.spawn().map_err(|e| {
            PromoterError::Promotion(format!("unable to run {}: {e}", self.command))
        })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                PromoterError::Promotion(format!(
                    "playbook {} timed out after {} seconds",
                    self.playbook.display(),
                    self.timeout.as_secs()
                ))
            })??;

        let duration_ms = start.elapsed().as_millis() as u64;
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));
        let output_text = strip_ansi(&combined);

        append_log(&log_path, &output_text).await?;
        debug!(log = %log_path.display(), duration_ms = duration_ms, "Playbook finished");

        Ok(PlaybookRun {
            exit_code: output.status.code().unwrap_or(-1),
            output: output_text,
            log_path,
            duration_ms,
            success: output.status.success(),
        })
    }
}

async fn append_log(path: &Path, text: &str) -> PromoterResult<()> {
    use tokio::io::AsyncWriteExt;

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(b"--- playbook output ---\n").await?;
    file.write_all(text.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
