//! Artifact backends for the DLRN promoter
//!
//! - [`RegistryPromoter`]: retags containers through the container-push playbook
//! - [`QcowPromoter`]: flips overcloud image symlinks on the qcow server
//!
//! Both implement [`promoter_core::ArtifactPromoter`].

pub mod playbook;
pub mod qcow;
pub mod registry;

pub use playbook::{strip_ansi, PlaybookRun, PlaybookRunner};
pub use qcow::{
    images_dir, LocalFs, QcowPromoter, QcowValidation, RemoteFs, RollbackPlan, RollbackStep,
    SftpFs,
};
pub use registry::{ExtraVars, RegistryPromoter};
