//! Layered configuration builder.
//!
//! Layers are applied lowest precedence first. A top-level key in a higher
//! layer replaces the whole value from lower layers. Once merged, `{{ key }}`
//! placeholders in string values are rendered from the top-level scalars and
//! the result is materialized into an immutable [`PromoterConfig`].

use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

use super::defaults::GLOBAL_DEFAULTS;
use super::{PromoterConfig, RawConfig};
use crate::error::{PromoterError, PromoterResult};

/// Environment variable holding the DLRN API password.
pub const PASSWORD_ENV: &str = "DLRNAPI_PASSWORD";

const MAX_RENDER_PASSES: usize = 8;

/// Configuration layers, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Layer {
    GlobalDefaults,
    EnvironmentDefaults,
    Release,
    Cli,
    Extra,
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Layer::GlobalDefaults => "global_defaults",
            Layer::EnvironmentDefaults => "environment_defaults",
            Layer::Release => "release",
            Layer::Cli => "cli",
            Layer::Extra => "extra",
        };
        f.write_str(name)
    }
}

/// Collects configuration layers and materializes a [`PromoterConfig`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    layers: Vec<(Layer, Mapping)>,
}

fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder regex is valid")
    })
}

/// Parse a YAML document that must hold a mapping.
pub fn parse_mapping(content: &str, origin: &str) -> PromoterResult<Mapping> {
    let value: Value = serde_yaml::from_str(content)
        .map_err(|e| PromoterError::Config(format!("{origin} is not valid yaml: {e}")))?;
    match value {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        _ => Err(PromoterError::Config(format!(
            "{origin} does not contain a mapping"
        ))),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn render_str(template: &str, context: &HashMap<String, String>) -> String {
    placeholder()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match context.get(key) {
                Some(value) => value.clone(),
                None => {
                    warn!(key = %key, "Undefined configuration key in template, rendering empty");
                    String::new()
                }
            }
        })
        .into_owned()
}

fn render_value(value: &mut Value, context: &HashMap<String, String>) {
    match value {
        Value::String(s) if s.contains("{{") => *s = render_str(s, context),
        Value::Sequence(items) => items.iter_mut().for_each(|v| render_value(v, context)),
        Value::Mapping(map) => map.iter_mut().for_each(|(_, v)| render_value(v, context)),
        _ => {}
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    /// Start from the built-in global defaults.
    pub fn new() -> Self {
        let defaults = parse_mapping(GLOBAL_DEFAULTS, "global defaults").unwrap_or_default();
        Self {
            layers: vec![(Layer::GlobalDefaults, defaults)],
        }
    }

    /// Start with no layers at all.
    pub fn empty() -> Self {
        Self { layers: Vec::new() }
    }

    /// Add a layer. Layers are kept sorted by precedence, a second mapping
    /// for the same layer is merged over the first.
    pub fn layer(mut self, layer: Layer, mapping: Mapping) -> Self {
        match self.layers.iter_mut().find(|(l, _)| *l == layer) {
            Some((_, existing)) => {
                for (key, value) in mapping {
                    existing.insert(key, value);
                }
            }
            None => {
                self.layers.push((layer, mapping));
                self.layers.sort_by_key(|(l, _)| *l);
            }
        }
        self
    }

    /// Add a layer from a YAML file. The file must exist.
    pub fn layer_file(self, layer: Layer, path: &Path) -> PromoterResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            PromoterError::Config(format!("unable to read {}: {e}", path.display()))
        })?;
        debug!(layer = %layer, path = %path.display(), "Loaded configuration layer");
        let mapping = parse_mapping(&content, &path.display().to_string())?;
        Ok(self.layer(layer, mapping))
    }

    /// Add a layer from a YAML file when it exists.
    pub fn optional_layer_file(self, layer: Layer, path: &Path) -> PromoterResult<Self> {
        if path.exists() {
            self.layer_file(layer, path)
        } else {
            debug!(layer = %layer, path = %path.display(), "Optional configuration layer absent");
            Ok(self)
        }
    }

    /// Merge all layers, highest precedence wins per top-level key.
    pub fn merged(&self) -> Mapping {
        let mut merged = Mapping::new();
        for (_, mapping) in &self.layers {
            for (key, value) in mapping {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Merge and render all templates.
    pub fn rendered(&self) -> Mapping {
        let mut merged = self.merged();

        let mut context: HashMap<String, String> = merged
            .iter()
            .filter_map(|(k, v)| Some((k.as_str()?.to_string(), scalar_to_string(v)?)))
            .collect();
        if !context.contains_key("distro") {
            let name = context.get("distro_name").map(|n| n.to_lowercase());
            let version = context.get("distro_version").cloned();
            if let (Some(name), Some(version)) = (name, version) {
                context.insert("distro".to_string(), format!("{name}{version}"));
            }
        }

        // Scalars may reference each other, render until stable.
        for _ in 0..MAX_RENDER_PASSES {
            let snapshot = context.clone();
            let mut changed = false;
            for value in context.values_mut() {
                if value.contains("{{") {
                    let rendered = render_str(value, &snapshot);
                    if rendered != *value {
                        *value = rendered;
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        for (_, value) in merged.iter_mut() {
            render_value(value, &context);
        }
        merged
    }

    /// Materialize the configuration, reading the password from the environment.
    pub fn build(self) -> PromoterResult<PromoterConfig> {
        let password = std::env::var(PASSWORD_ENV).ok();
        self.build_with_password(password)
    }

    /// Materialize the configuration with an explicit password.
    pub fn build_with_password(self, password: Option<String>) -> PromoterResult<PromoterConfig> {
        let rendered = self.rendered();
        let raw: RawConfig = serde_yaml::from_value(Value::Mapping(rendered))
            .map_err(|e| PromoterError::Config(format!("invalid configuration: {e}")))?;
        PromoterConfig::from_raw(raw, password)
    }
}
