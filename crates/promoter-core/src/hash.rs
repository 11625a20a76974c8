//! Build identity for DLRN builds.
//!
//! A DLRN build is named by a content-addressed hash. Single pipeline builds
//! carry a commit/distro pair (optionally extended), component pipeline
//! builds carry an aggregate hash computed by DLRN over the component set.
//! [`BuildHash::from_source`] dispatches on the presence of `aggregate_hash`.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

use crate::error::{PromoterError, PromoterResult};

/// Longest accepted hex hash (sha1).
pub const MAX_HASH_LEN: usize = 40;

/// Flat request/response record carrying build identity fields.
///
/// Used as the parse source for [`BuildHash::from_source`] and as the
/// output of [`BuildHash::dump_to_params`]. Deserializes from DLRN API
/// promotion records and from any mapping carrying the same keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HashParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distro_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<i64>,
}

/// Accept integer, float or numeric string timestamps.
pub fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Float(f64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Int(value)) => Ok(Some(value)),
        Some(Raw::Float(value)) => Ok(Some(value as i64)),
        Some(Raw::Text(text)) => {
            let text = text.trim();
            if text.is_empty() || text == "None" {
                return Ok(None);
            }
            text.parse::<f64>()
                .map(|value| Some(value as i64))
                .map_err(serde::de::Error::custom)
        }
    }
}

/// Identity of a single pipeline build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitDistroHash {
    pub commit_hash: String,
    pub distro_hash: String,
    pub extended_hash: Option<String>,
    pub component: Option<String>,
    pub timestamp: Option<i64>,
    /// Human readable annotation, never part of identity.
    #[serde(skip)]
    pub label: Option<String>,
}

/// Identity of a component pipeline build.
///
/// `commit_hash`, `distro_hash` and `timestamp` belong to the last
/// component included in the aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateHash {
    pub aggregate_hash: String,
    pub commit_hash: String,
    pub distro_hash: String,
    pub extended_hash: Option<String>,
    pub component: Option<String>,
    pub timestamp: Option<i64>,
    #[serde(skip)]
    pub label: Option<String>,
}

/// Content identity of a DLRN build.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildHash {
    CommitDistro(CommitDistroHash),
    Aggregate(AggregateHash),
}

/// Timestamp-free identity key, usable in sets and maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HashIdentity {
    aggregate_hash: Option<String>,
    commit_hash: String,
    distro_hash: String,
    extended_hash: Option<String>,
    component: Option<String>,
}

fn check_hash(name: &str, value: &str) -> PromoterResult<()> {
    if value.is_empty() {
        return Err(PromoterError::InvalidHash(format!("{name} is empty")));
    }
    if value.len() > MAX_HASH_LEN {
        return Err(PromoterError::InvalidHash(format!(
            "{name} '{value}' is longer than {MAX_HASH_LEN} characters"
        )));
    }
    if !value.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PromoterError::InvalidHash(format!(
            "{name} '{value}' is not a hex string"
        )));
    }
    Ok(())
}

fn normalize_extended(extended: Option<&str>) -> PromoterResult<Option<String>> {
    match extended {
        None | Some("") | Some("None") => Ok(None),
        Some(value) => {
            let (ext_distro, ext_commit) = value.split_once('_').ok_or_else(|| {
                PromoterError::InvalidHash(format!("invalid extended hash format '{value}'"))
            })?;
            check_hash("extended distro hash", ext_distro)?;
            check_hash("extended commit hash", ext_commit)?;
            Ok(Some(value.to_string()))
        }
    }
}

fn required<'a>(field: &'a Option<String>, name: &str) -> PromoterResult<&'a str> {
    match field.as_deref() {
        Some(value) => {
            check_hash(name, value)?;
            Ok(value)
        }
        None => Err(PromoterError::InvalidHash(format!("missing {name}"))),
    }
}

/// Hex hashes are ASCII once validated, so byte slicing is safe.
fn prefix(value: &str, len: usize) -> &str {
    &value[..value.len().min(len)]
}

impl CommitDistroHash {
    pub fn new(commit_hash: &str, distro_hash: &str, timestamp: Option<i64>) -> PromoterResult<Self> {
        BuildHash::from_source(&HashParams {
            commit_hash: Some(commit_hash.to_string()),
            distro_hash: Some(distro_hash.to_string()),
            timestamp,
            ..Default::default()
        })
        .and_then(|hash| match hash {
            BuildHash::CommitDistro(inner) => Ok(inner),
            BuildHash::Aggregate(_) => Err(PromoterError::InvalidHash(
                "expected a commit/distro hash".to_string(),
            )),
        })
    }

    pub fn full_hash(&self) -> String {
        match self.extended_hash.as_deref().and_then(|e| e.split_once('_')) {
            Some((ext_distro, ext_commit)) => format!(
                "{}_{}_{}_{}",
                self.commit_hash,
                prefix(&self.distro_hash, 8),
                prefix(ext_distro, 8),
                prefix(ext_commit, 8)
            ),
            None => format!("{}_{}", self.commit_hash, prefix(&self.distro_hash, 8)),
        }
    }

    pub fn commit_dir(&self) -> String {
        let component_path = self
            .component
            .as_deref()
            .map(|c| format!("component/{c}/"))
            .unwrap_or_default();
        format!(
            "{}{}/{}/{}",
            component_path,
            prefix(&self.commit_hash, 2),
            self.commit_hash.get(2..4).unwrap_or_default(),
            self.full_hash()
        )
    }
}

impl PartialEq for CommitDistroHash {
    fn eq(&self, other: &Self) -> bool {
        self.commit_hash == other.commit_hash
            && self.distro_hash == other.distro_hash
            && self.extended_hash == other.extended_hash
            && self.component == other.component
            && self.timestamp == other.timestamp
    }
}

impl PartialEq for AggregateHash {
    fn eq(&self, other: &Self) -> bool {
        self.aggregate_hash == other.aggregate_hash
            && self.commit_hash == other.commit_hash
            && self.distro_hash == other.distro_hash
            && self.extended_hash == other.extended_hash
            && self.timestamp == other.timestamp
    }
}

impl AggregateHash {
    /// `[<label>/]<a[0:2]>/<a[2:4]>/<aggregate_hash>`
    pub fn commit_dir(&self) -> String {
        let label_path = self
            .label
            .as_deref()
            .map(|l| format!("{l}/"))
            .unwrap_or_default();
        format!(
            "{}{}/{}/{}",
            label_path,
            prefix(&self.aggregate_hash, 2),
            self.aggregate_hash.get(2..4).unwrap_or_default(),
            self.aggregate_hash
        )
    }
}

impl BuildHash {
    /// Build a hash from a flat source record.
    ///
    /// Produces the aggregate variant when `aggregate_hash` is present,
    /// the commit/distro variant otherwise.
    pub fn from_source(source: &HashParams) -> PromoterResult<Self> {
        let commit_hash = required(&source.commit_hash, "commit hash")?.to_string();
        let distro_hash = required(&source.distro_hash, "distro hash")?.to_string();
        let extended_hash = normalize_extended(source.extended_hash.as_deref())?;

        match source.aggregate_hash.as_deref() {
            Some(aggregate) if !aggregate.is_empty() && aggregate != "None" => {
                check_hash("aggregate hash", aggregate)?;
                Ok(BuildHash::Aggregate(AggregateHash {
                    aggregate_hash: aggregate.to_string(),
                    commit_hash,
                    distro_hash,
                    extended_hash,
                    component: source.component.clone(),
                    timestamp: source.timestamp,
                    label: None,
                }))
            }
            _ => Ok(BuildHash::CommitDistro(CommitDistroHash {
                commit_hash,
                distro_hash,
                extended_hash,
                component: source.component.clone(),
                timestamp: source.timestamp,
                label: None,
            })),
        }
    }

    /// Write the identity fields into a request parameter record.
    pub fn dump_to_params(&self) -> HashParams {
        match self {
            BuildHash::CommitDistro(h) => HashParams {
                commit_hash: Some(h.commit_hash.clone()),
                distro_hash: Some(h.distro_hash.clone()),
                extended_hash: h.extended_hash.clone(),
                aggregate_hash: None,
                component: h.component.clone(),
                timestamp: h.timestamp,
            },
            BuildHash::Aggregate(h) => HashParams {
                commit_hash: Some(h.commit_hash.clone()),
                distro_hash: Some(h.distro_hash.clone()),
                extended_hash: h.extended_hash.clone(),
                aggregate_hash: Some(h.aggregate_hash.clone()),
                component: h.component.clone(),
                timestamp: h.timestamp,
            },
        }
    }

    /// Canonical rendering used as directory name and container tag.
    pub fn full_hash(&self) -> String {
        match self {
            BuildHash::CommitDistro(h) => h.full_hash(),
            BuildHash::Aggregate(h) => h.aggregate_hash.clone(),
        }
    }

    /// Short form for log lines and error messages.
    pub fn short(&self) -> String {
        match self {
            BuildHash::CommitDistro(h) => format!(
                "{}_{}",
                prefix(&h.commit_hash, 8),
                prefix(&h.distro_hash, 8)
            ),
            BuildHash::Aggregate(h) => prefix(&h.aggregate_hash, 12).to_string(),
        }
    }

    /// Path of the build inside a DLRN repository.
    pub fn commit_dir(&self) -> String {
        match self {
            BuildHash::CommitDistro(h) => h.commit_dir(),
            BuildHash::Aggregate(h) => h.commit_dir(),
        }
    }

    pub fn commit_hash(&self) -> &str {
        match self {
            BuildHash::CommitDistro(h) => &h.commit_hash,
            BuildHash::Aggregate(h) => &h.commit_hash,
        }
    }

    pub fn distro_hash(&self) -> &str {
        match self {
            BuildHash::CommitDistro(h) => &h.distro_hash,
            BuildHash::Aggregate(h) => &h.distro_hash,
        }
    }

    pub fn extended_hash(&self) -> Option<&str> {
        match self {
            BuildHash::CommitDistro(h) => h.extended_hash.as_deref(),
            BuildHash::Aggregate(h) => h.extended_hash.as_deref(),
        }
    }

    pub fn aggregate_hash(&self) -> Option<&str> {
        match self {
            BuildHash::CommitDistro(_) => None,
            BuildHash::Aggregate(h) => Some(&h.aggregate_hash),
        }
    }

    pub fn timestamp(&self) -> Option<i64> {
        match self {
            BuildHash::CommitDistro(h) => h.timestamp,
            BuildHash::Aggregate(h) => h.timestamp,
        }
    }

    pub fn label(&self) -> Option<&str> {
        match self {
            BuildHash::CommitDistro(h) => h.label.as_deref(),
            BuildHash::Aggregate(h) => h.label.as_deref(),
        }
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self, BuildHash::Aggregate(_))
    }

    /// Return a copy annotated with a label. Identity is unaffected.
    pub fn with_label(&self, label: &str) -> Self {
        let mut hash = self.clone();
        match &mut hash {
            BuildHash::CommitDistro(h) => h.label = Some(label.to_string()),
            BuildHash::Aggregate(h) => h.label = Some(label.to_string()),
        }
        hash
    }

    /// Return a copy without timestamp.
    pub fn without_timestamp(&self) -> Self {
        let mut hash = self.clone();
        match &mut hash {
            BuildHash::CommitDistro(h) => h.timestamp = None,
            BuildHash::Aggregate(h) => h.timestamp = None,
        }
        hash
    }

    /// Timestamp-excluding identity key.
    pub fn by_identity(&self) -> HashIdentity {
        match self {
            BuildHash::CommitDistro(h) => HashIdentity {
                aggregate_hash: None,
                commit_hash: h.commit_hash.clone(),
                distro_hash: h.distro_hash.clone(),
                extended_hash: h.extended_hash.clone(),
                component: h.component.clone(),
            },
            BuildHash::Aggregate(h) => HashIdentity {
                aggregate_hash: Some(h.aggregate_hash.clone()),
                commit_hash: h.commit_hash.clone(),
                distro_hash: h.distro_hash.clone(),
                extended_hash: h.extended_hash.clone(),
                component: None,
            },
        }
    }

    /// Equality ignoring timestamps.
    pub fn same_identity(&self, other: &BuildHash) -> bool {
        self.by_identity() == other.by_identity()
    }
}

impl PartialEq for BuildHash {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BuildHash::CommitDistro(a), BuildHash::CommitDistro(b)) => a == b,
            (BuildHash::Aggregate(a), BuildHash::Aggregate(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for BuildHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildHash::CommitDistro(h) => match &h.component {
                Some(component) => write!(f, "{} ({component})", h.full_hash()),
                None => write!(f, "{}", h.full_hash()),
            },
            BuildHash::Aggregate(h) => write!(
                f,
                "aggregate {} (last commit {}_{})",
                h.aggregate_hash,
                prefix(&h.commit_hash, 8),
                prefix(&h.distro_hash, 8)
            ),
        }
    }
}

/// Sort newest first. Hashes without timestamp sort last.
pub fn sort_newest_first(hashes: &mut [BuildHash]) {
    hashes.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMMIT: &str = "90633a3785687ddf3d37c0f86f9ad9f93926d639";
    const DISTRO: &str = "d68290fed3d9aa069c95fc16d0d481084adbadc6";
    const AGGREGATE: &str = "26b9d4d1d8fd09cdc2b11c7dd0f71f93";

    fn params() -> HashParams {
        HashParams {
            commit_hash: Some(COMMIT.to_string()),
            distro_hash: Some(DISTRO.to_string()),
            timestamp: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_from_source_commit_distro() {
        let hash = BuildHash::from_source(&params()).expect("valid hash");
        assert!(!hash.is_aggregate());
        assert_eq!(hash.full_hash(), format!("{COMMIT}_d68290fe"));
        assert_eq!(hash.commit_dir(), format!("90/63/{COMMIT}_d68290fe"));
        assert_eq!(hash.short(), "90633a37_d68290fe");
    }

    #[test]
    fn test_from_source_aggregate_dispatch() {
        let mut source = params();
        source.aggregate_hash = Some(AGGREGATE.to_string());
        let hash = BuildHash::from_source(&source).expect("valid hash");
        assert!(hash.is_aggregate());
        assert_eq!(hash.full_hash(), AGGREGATE);
        assert_eq!(hash.commit_dir(), format!("26/b9/{AGGREGATE}"));
        assert_eq!(
            hash.with_label("tripleo-ci-testing").commit_dir(),
            format!("tripleo-ci-testing/26/b9/{AGGREGATE}")
        );
    }

    #[test]
    fn test_component_commit_dir() {
        let mut source = params();
        source.component = Some("tripleo".to_string());
        let hash = BuildHash::from_source(&source).expect("valid hash");
        assert_eq!(
            hash.commit_dir(),
            format!("component/tripleo/90/63/{COMMIT}_d68290fe")
        );
    }

    #[test]
    fn test_extended_hash_full_hash() {
        let mut source = params();
        source.extended_hash = Some(format!("{DISTRO}_{COMMIT}"));
        let hash = BuildHash::from_source(&source).expect("valid hash");
        assert_eq!(
            hash.full_hash(),
            format!("{COMMIT}_d68290fe_d68290fe_90633a37")
        );
    }

    #[test]
    fn test_extended_hash_none_string_normalizes() {
        for value in ["None", ""] {
            let mut source = params();
            source.extended_hash = Some(value.to_string());
            let hash = BuildHash::from_source(&source).expect("valid hash");
            assert_eq!(hash.extended_hash(), None, "'{value}' should normalize to absent");
        }
    }

    #[test]
    fn test_invalid_hashes_rejected() {
        let mut missing = params();
        missing.distro_hash = None;
        assert!(matches!(
            BuildHash::from_source(&missing),
            Err(PromoterError::InvalidHash(_))
        ));

        let mut not_hex = params();
        not_hex.commit_hash = Some("xyz".to_string());
        assert!(matches!(
            BuildHash::from_source(&not_hex),
            Err(PromoterError::InvalidHash(_))
        ));

        let mut too_long = params();
        too_long.commit_hash = Some("a".repeat(41));
        assert!(BuildHash::from_source(&too_long).is_err());

        let mut bad_extended = params();
        bad_extended.extended_hash = Some("abc".to_string());
        assert!(BuildHash::from_source(&bad_extended).is_err());
    }

    #[test]
    fn test_equality_is_timestamp_sensitive_but_identity_is_not() {
        let a = BuildHash::from_source(&params()).unwrap();
        let mut later = params();
        later.timestamp = Some(99);
        let b = BuildHash::from_source(&later).unwrap();

        assert_ne!(a, b);
        assert!(a.same_identity(&b));
        assert_eq!(a.by_identity(), b.by_identity());
        assert_eq!(a.with_label("current-tripleo"), a, "label is not identity");
    }

    #[test]
    fn test_dump_to_params_roundtrip_modulo_timestamp() {
        let mut source = params();
        source.component = Some("baremetal".to_string());
        let hash = BuildHash::from_source(&source).unwrap();
        let mut dumped = hash.dump_to_params();
        dumped.timestamp = None;
        let parsed = BuildHash::from_source(&dumped).unwrap();
        assert_eq!(parsed, hash.without_timestamp());
    }

    #[test]
    fn test_params_deserialize_timestamp_variants() {
        let json = format!(
            r#"{{"commit_hash":"{COMMIT}","distro_hash":"{DISTRO}","timestamp":"1588256412.0","promote_name":"x"}}"#
        );
        let parsed: HashParams = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.timestamp, Some(1588256412));

        let json = format!(r#"{{"commit_hash":"{COMMIT}","distro_hash":"{DISTRO}","timestamp":1.5}}"#);
        let parsed: HashParams = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.timestamp, Some(1));
    }

    #[test]
    fn test_sort_newest_first() {
        let mut hashes: Vec<BuildHash> = [3, 1, 2]
            .iter()
            .map(|ts| {
                let mut source = params();
                source.timestamp = Some(*ts);
                BuildHash::from_source(&source).unwrap()
            })
            .collect();
        sort_newest_first(&mut hashes);
        let order: Vec<_> = hashes.iter().map(|h| h.timestamp()).collect();
        assert_eq!(order, vec![Some(3), Some(2), Some(1)]);
    }
}
