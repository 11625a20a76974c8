//! DLRN HTTP clients
//!
//! [`DlrnClient`] implements [`promoter_core::DlrnApi`] over the DLRN REST
//! API, including the assembly of component sub-hashes for aggregate
//! promotions. [`RepoClient`] reads the DLRN repositories (versions.csv)
//! and the tripleo-common container templates, and implements
//! [`promoter_core::ContainersResolver`].

pub mod aggregate;
pub mod dlrn;
pub mod http;
pub mod repo;

pub use aggregate::{parse_commit_yaml, parse_repo_index, sort_components, RepoComponent};
pub use dlrn::{DlrnClient, DlrnClientConfig};
pub use repo::{get_commit_sha, RepoClient, RepoClientConfig, VersionRow};
