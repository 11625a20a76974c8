//! Overcloud image promotion.
//!
//! Images of a build live in `<images_dir>/<full_hash>/`. Promoting to a
//! label means pointing the `<label>` symlink at that directory, after
//! moving the old target to `previous-<label>`. Every link change is
//! recorded in a [`RollbackPlan`] that is replayed when a later step fails.

mod fs;
mod rollback;

pub use fs::{LocalFs, RemoteFs, SftpFs};
pub use rollback::{RollbackPlan, RollbackStep};

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use promoter_core::{
    expand_home, previous_label, release_map, ArtifactPromoter, Backend, BackendOutcome,
    BuildHash, PromoterConfig, PromoterError, PromoterResult, QcowClientKind, QcowServer,
};

/// State of a hash on the image server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QcowValidation {
    /// The hash directory exists and is not empty.
    pub hash_valid: bool,
    pub present_qcows: Vec<String>,
    pub missing_qcows: Vec<String>,
    /// Every expected image is present.
    pub qcow_valid: bool,
    /// The requested label points at the hash directory.
    pub promotion_valid: bool,
}

/// `<root>/<distro>/<release>/rdo_trunk`, without `rdo_trunk` for `osp*`.
pub fn images_dir(server: &QcowServer, distro: &str, release: &str) -> PathBuf {
    let root = match server.client {
        QcowClientKind::Os => expand_home(&server.root),
        QcowClientKind::Sftp => PathBuf::from(&server.root),
    };
    let dir = root.join(distro).join(release_map(release));
    if release.starts_with("osp") {
        dir
    } else {
        dir.join("rdo_trunk")
    }
}

fn points_to(link: &Path, full_hash: &str) -> bool {
    link.file_name().is_some_and(|name| name == full_hash)
}

fn connect(server: &QcowServer, timeout: Duration) -> PromoterResult<Box<dyn RemoteFs>> {
    match server.client {
        QcowClientKind::Os => Ok(Box::new(LocalFs)),
        QcowClientKind::Sftp => Ok(Box::new(SftpFs::connect(server, timeout)?)),
    }
}

fn validate(
    fs: &mut dyn RemoteFs,
    dir: &Path,
    expected: &[String],
    full_hash: &str,
    name: Option<&str>,
) -> PromoterResult<QcowValidation> {
    fs.list_dir(dir).map_err(|e| {
        error!(dir = %dir.display(), error = %e, "Image root dir does not exist or is not accessible");
        PromoterError::MissingArtifact(format!("image root dir {}: {e}", dir.display()))
    })?;

    let mut report = QcowValidation {
        missing_qcows: expected.to_vec(),
        ..Default::default()
    };

    let hash_dir = dir.join(full_hash);
    let images = match fs.stat(&hash_dir) {
        Ok(()) => fs.list_dir(&hash_dir),
        Err(e) => Err(e),
    };
    match images {
        Ok(images) if !images.is_empty() => {
            report.missing_qcows = expected
                .iter()
                .filter(|q| !images.contains(q))
                .cloned()
                .collect();
            report.hash_valid = true;
            report.qcow_valid = report.missing_qcows.is_empty();
            report.present_qcows = images;
        }
        Ok(_) => error!(hash = %full_hash, "No images found"),
        Err(e) => error!(
            hash = %full_hash,
            error = %e,
            "Images path for hash not present or accessible"
        ),
    }

    if let Some(name) = name {
        match fs.read_link(&dir.join(name)) {
            Ok(Some(link)) if points_to(&link, full_hash) => report.promotion_valid = true,
            _ => error!(hash = %full_hash, label = %name, "Hash was not promoted to label"),
        }
    }
    Ok(report)
}

/// Link changes in promotion order, recorded into `plan` as they happen.
fn apply_links(
    fs: &mut dyn RemoteFs,
    dir: &Path,
    full_hash: &str,
    target: &str,
    create_previous: bool,
    current: Option<&Path>,
    plan: &mut RollbackPlan,
) -> io::Result<()> {
    let target_link = dir.join(target);
    if let Some(current) = current {
        if create_previous && !points_to(current, full_hash) {
            let previous_link = dir.join(previous_label(target));
            if let Some(old_previous) = fs.read_link(&previous_link)? {
                fs.remove(&previous_link)?;
                plan.record(RollbackStep::RestoreLink {
                    link: previous_link.clone(),
                    target: old_previous,
                });
            }
            fs.symlink(current, &previous_link)?;
            debug!(link = %previous_link.display(), target = %current.display(), "Created symlink");
            plan.record(RollbackStep::RemoveLink {
                link: previous_link,
            });
        }
        fs.remove(&target_link)?;
        plan.record(RollbackStep::RestoreLink {
            link: target_link.clone(),
            target: current.to_path_buf(),
        });
    }
    fs.symlink(Path::new(full_hash), &target_link)?;
    debug!(link = %target_link.display(), target = %full_hash, "Created symlink");
    Ok(())
}

/// Point `target` at the images of `full_hash`.
///
/// Returns the directory the target pointed at before, if any. On failure
/// the recorded link changes are rolled back before the error is returned.
pub(crate) fn flip_links(
    fs: &mut dyn RemoteFs,
    dir: &Path,
    full_hash: &str,
    target: &str,
    create_previous: bool,
) -> PromoterResult<Option<PathBuf>> {
    if let Err(e) = fs.stat(&dir.join(full_hash)) {
        error!(hash = %full_hash, error = %e, "Images dir for hash not present or not accessible");
        return Err(PromoterError::MissingArtifact(format!(
            "no images dir for hash {full_hash} in {}",
            dir.display()
        )));
    }

    let current = fs.read_link(&dir.join(target))?;
    match &current {
        Some(link) => debug!(target_label = %target, current = %link.display(), "Target link found"),
        None => debug!(target_label = %target, "No link named target exists"),
    }

    let mut plan = RollbackPlan::new();
    match apply_links(
        fs,
        dir,
        full_hash,
        target,
        create_previous,
        current.as_deref(),
        &mut plan,
    ) {
        Ok(()) => Ok(current),
        Err(e) => {
            error!(hash = %full_hash, target_label = %target, error = %e, "Qcow link change failed");
            if !plan.is_empty() {
                let steps = plan.steps().len();
                let failed = plan.execute(fs);
                warn!(steps = steps, failed = failed, "Qcow links rolled back");
            }
            Err(PromoterError::Promotion(format!(
                "failed to link {target} to {full_hash}: {e}"
            )))
        }
    }
}

/// Promotes overcloud images on the configured qcow server.
pub struct QcowPromoter {
    server: QcowServer,
    images_dir: PathBuf,
    qcow_images: Vec<String>,
    validation: bool,
    timeout: Duration,
}

impl QcowPromoter {
    pub fn new(config: &PromoterConfig) -> PromoterResult<Self> {
        let server = config.qcow_server()?.clone();
        let images_dir = images_dir(&server, &config.distro, &config.release);
        debug!(
            host = %server.host,
            images_dir = %images_dir.display(),
            "Qcow client created"
        );
        Ok(Self {
            server,
            images_dir,
            qcow_images: config.overcloud_images.qcow_images.clone(),
            validation: config.qcow_validation,
            timeout: config.http_timeout,
        })
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    /// Run blocking filesystem work on one session, closed on every path.
    async fn with_session<T, F>(&self, work: F) -> PromoterResult<T>
    where
        F: FnOnce(&mut dyn RemoteFs, &Path) -> PromoterResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let server = self.server.clone();
        let timeout = self.timeout;
        let dir = self.images_dir.clone();
        let span = tracing::Span::current();

        tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let mut fs = connect(&server, timeout)?;
            let result = work(fs.as_mut(), &dir);
            if let Err(e) = fs.close() {
                warn!(host = %server.host, error = %e, "Unable to close qcow session");
            }
            result
        })
        .await
        .map_err(|e| PromoterError::Promotion(format!("qcow worker failed: {e}")))?
    }

    /// Inspect the images of `hash` and, with `name`, whether that label
    /// points at them.
    pub async fn validate_qcows(
        &self,
        hash: &BuildHash,
        name: Option<&str>,
    ) -> PromoterResult<QcowValidation> {
        let full_hash = hash.full_hash();
        let expected = self.qcow_images.clone();
        let name = name.map(str::to_string);
        self.with_session(move |fs, dir| validate(fs, dir, &expected, &full_hash, name.as_deref()))
            .await
    }
}

#[async_trait]
impl ArtifactPromoter for QcowPromoter {
    fn backend(&self) -> Backend {
        Backend::Qcow
    }

    async fn promote(
        &self,
        hash: &BuildHash,
        target: &str,
        _candidate: &str,
        create_previous: bool,
    ) -> PromoterResult<BackendOutcome> {
        info!(
            backend = %Backend::Qcow,
            hash = %hash.short(),
            target_label = %target,
            "Qcow promote: attempting promotion"
        );
        let full_hash = hash.full_hash();
        let target_label = target.to_string();
        let expected = self.qcow_images.clone();
        let validation = self.validation;

        let previous = self
            .with_session(move |fs, dir| {
                if validation {
                    let report = validate(fs, dir, &expected, &full_hash, None)?;
                    if !report.qcow_valid {
                        warn!(missing = ?report.missing_qcows, "Qcow images incomplete for hash");
                    }
                }
                flip_links(fs, dir, &full_hash, &target_label, create_previous)
            })
            .await?;

        info!(
            hash = %hash.short(),
            target_label = %target,
            "Qcow promote: successful promotion"
        );
        let detail = match previous {
            Some(previous) => format!(
                "{target} -> {} (was {})",
                hash.full_hash(),
                previous.display()
            ),
            None => format!("{target} -> {}", hash.full_hash()),
        };
        Ok(BackendOutcome::new(Backend::Qcow, detail))
    }
}
