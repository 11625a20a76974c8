//! DLRN promoter core library
//!
//! Build identities, layered configuration, the staleness guard and the
//! promotion orchestrator. Service clients and artifact backends live in
//! `dlrn-client` and `promoter-backends` and plug in through [`traits`].

pub mod config;
pub mod criteria;
pub mod error;
pub mod fakes;
pub mod guard;
pub mod hash;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod records;
pub mod reporting;
pub mod telemetry;
pub mod traits;

pub use config::{
    expand_home, release_map, release_namespace, ConfigBuilder, Layer, OvercloudImages,
    PromoterConfig, PromotionTarget, QcowClientKind, QcowServer, PASSWORD_ENV,
};
pub use criteria::{CriteriaVerdict, PromotionCriteria};
pub use error::{AttemptError, PromoterError, PromoterResult};
pub use guard::{NamedHashSnapshot, StalenessGuard};
pub use hash::{
    sort_newest_first, AggregateHash, BuildHash, CommitDistroHash, HashIdentity, HashParams,
};
pub use orchestrator::{PromotionSummary, Promoter, TargetState, TargetStatus};
pub use records::{previous_label, Backend, BackendOutcome, JobResult, PromotionRecord};
pub use reporting::{
    read_attempt_reports, AttemptOutcome, AttemptReport, AttemptSink, JsonLinesReporter,
    MemoryReporter,
};
pub use traits::{ArtifactPromoter, ContainersList, ContainersResolver, DlrnApi};
