//! [`Config`]: the fully-resolved snapshot the core receives from its
//! (out-of-scope) config loader. Nothing in this crate parses a config
//! file — that lives in the CLI crate's loader, which builds one of these
//! and hands it to a `ProxyManager`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::group::GroupConfig;
use super::model::ModelConfig;

const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 30;

/// An immutable, fully-resolved configuration snapshot. Replaced
/// atomically on reload; never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Overall deadline for a health probe loop to observe readiness,
    /// shared by every model (no per-model override).
    #[serde(default = "default_health_check_timeout_secs")]
    pub health_check_timeout_secs: u64,

    /// Base port already substituted into child commands/URLs upstream;
    /// carried through for observability only, the core never allocates
    /// ports itself.
    #[serde(default)]
    pub start_port: Option<u16>,

    /// Every model known to this snapshot.
    pub models: Vec<ModelConfig>,

    /// Every group known to this snapshot.
    pub groups: Vec<GroupConfig>,

    /// API keys the auth gate enforces; the core forwards this value
    /// without interpreting it.
    #[serde(default)]
    pub required_api_keys: Vec<String>,
}

const fn default_health_check_timeout_secs() -> u64 {
    DEFAULT_HEALTH_CHECK_TIMEOUT_SECS
}

impl Config {
    /// Health probe deadline as a [`Duration`], for the health prober.
    #[must_use]
    pub const fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }
}

/// A single referential-integrity problem found by [`Config::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate model name: {0}")]
    DuplicateModel(String),
    #[error("duplicate group id: {0}")]
    DuplicateGroup(String),
    #[error("group {group} references unknown model {model}")]
    UnknownGroupMember { group: String, model: String },
    #[error("alias {alias} collides with a real model name")]
    AliasCollidesWithModel { alias: String },
    #[error("alias {alias} is claimed by both {first} and {second}")]
    AliasCollision {
        alias: String,
        first: String,
        second: String,
    },
    #[error("model {0} does not belong to any group")]
    ModelWithoutGroup(String),
}

impl Config {
    /// Checks the referential integrity the resolver depends on: no
    /// duplicate names, every group member names a real model, aliases
    /// don't collide with each other or with real names, every model
    /// belongs to exactly one group.
    pub fn validate(&self) -> Result<(), Vec<ConfigError>> {
        let mut errors = Vec::new();
        let mut seen_models = std::collections::HashSet::new();
        for m in &self.models {
            if !seen_models.insert(m.name.as_str()) {
                errors.push(ConfigError::DuplicateModel(m.name.clone()));
            }
        }

        let mut seen_groups = std::collections::HashSet::new();
        for g in &self.groups {
            if !seen_groups.insert(g.id.as_str()) {
                errors.push(ConfigError::DuplicateGroup(g.id.clone()));
            }
            for member in &g.members {
                if !self.models.iter().any(|m| &m.name == member) {
                    errors.push(ConfigError::UnknownGroupMember {
                        group: g.id.clone(),
                        model: member.clone(),
                    });
                }
            }
        }

        for m in &self.models {
            let in_any_group = self.groups.iter().any(|g| g.has_member(&m.name));
            if !in_any_group {
                errors.push(ConfigError::ModelWithoutGroup(m.name.clone()));
            }
        }

        let mut alias_owner: std::collections::HashMap<&str, &str> =
            std::collections::HashMap::new();
        for m in &self.models {
            for alias in &m.aliases {
                if self.models.iter().any(|other| &other.name == alias) {
                    errors.push(ConfigError::AliasCollidesWithModel {
                        alias: alias.clone(),
                    });
                    continue;
                }
                if let Some(existing) = alias_owner.get(alias.as_str()) {
                    if *existing != m.name {
                        errors.push(ConfigError::AliasCollision {
                            alias: alias.clone(),
                            first: (*existing).to_string(),
                            second: m.name.clone(),
                        });
                    }
                } else {
                    alias_owner.insert(alias.as_str(), &m.name);
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn model(name: &str) -> ModelConfig {
        ModelConfig {
            name: name.into(),
            command: "./responder".into(),
            stop_command: None,
            upstream_url: "http://127.0.0.1:5800".into(),
            check_endpoint: "/health".into(),
            env: HashMap::new(),
            unload_after_seconds: 0,
            concurrency_limit: None,
            use_model_name: None,
            aliases: Vec::new(),
            unlisted: false,
            graceful_stop_timeout_secs: 5,
            health_check_interval_ms: 1_000,
        }
    }

    fn group(id: &str, members: &[&str]) -> GroupConfig {
        GroupConfig {
            id: id.into(),
            swap: true,
            exclusive: false,
            persistent: false,
            members: members.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    #[test]
    fn valid_config_passes() {
        let cfg = Config {
            health_check_timeout_secs: 30,
            start_port: None,
            models: vec![model("m1"), model("m2")],
            groups: vec![group("g1", &["m1", "m2"])],
            required_api_keys: Vec::new(),
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unknown_group_member_is_rejected() {
        let cfg = Config {
            health_check_timeout_secs: 30,
            start_port: None,
            models: vec![model("m1")],
            groups: vec![group("g1", &["m1", "ghost"])],
            required_api_keys: Vec::new(),
        };
        let errs = cfg.validate().unwrap_err();
        assert!(errs
            .iter()
            .any(|e| matches!(e, ConfigError::UnknownGroupMember { model, .. } if model == "ghost")));
    }

    #[test]
    fn model_outside_any_group_is_rejected() {
        let cfg = Config {
            health_check_timeout_secs: 30,
            start_port: None,
            models: vec![model("m1"), model("orphan")],
            groups: vec![group("g1", &["m1"])],
            required_api_keys: Vec::new(),
        };
        let errs = cfg.validate().unwrap_err();
        assert!(errs
            .iter()
            .any(|e| matches!(e, ConfigError::ModelWithoutGroup(name) if name == "orphan")));
    }

    #[test]
    fn alias_colliding_with_real_model_is_rejected() {
        let mut m1 = model("m1");
        m1.aliases.push("m2".into());
        let cfg = Config {
            health_check_timeout_secs: 30,
            start_port: None,
            models: vec![m1, model("m2")],
            groups: vec![group("g1", &["m1", "m2"])],
            required_api_keys: Vec::new(),
        };
        let errs = cfg.validate().unwrap_err();
        assert!(errs
            .iter()
            .any(|e| matches!(e, ConfigError::AliasCollidesWithModel { alias } if alias == "m2")));
    }
}
