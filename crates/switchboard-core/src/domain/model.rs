//! [`ModelConfig`]: the immutable, per-backend input a `Process` is built
//! from. Nothing in this crate spawns anything — this is pure data.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_GRACEFUL_STOP_SECS: u64 = 5;
const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 1_000;

/// Immutable configuration for one backend. Constructing a `Process` from
/// two `ModelConfig`s that differ only in "hot" fields (aliases, display
/// metadata, TTL) does not require a restart; see
/// [`ModelConfig::needs_restart_from`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Stable identifier, unique within the owning `ProxyManager`.
    pub name: String,

    /// Raw command template, not yet shell-tokenized. May contain the
    /// ordered placeholders `${PORT}` and `${MODEL_ID}`, expanded by the
    /// command sanitizer at start time against this process's resolved
    /// port and `name`.
    pub command: String,

    /// Optional stop command template. May contain `${PID}`, expanded
    /// against the child's OS process id. When absent, the platform's
    /// graceful termination signal is sent instead.
    pub stop_command: Option<String>,

    /// Upstream URL of the child. Any `${PORT}` placeholder has already
    /// been resolved by the config layer before this value reaches the
    /// core.
    pub upstream_url: String,

    /// Path appended to `upstream_url` for health probing, e.g. `/health`.
    pub check_endpoint: String,

    /// Environment additions, appended to (never replacing) the inherited
    /// parent environment.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Idle TTL in seconds; `0` means never auto-unload.
    #[serde(default)]
    pub unload_after_seconds: u64,

    /// Optional per-process in-flight concurrency cap.
    #[serde(default)]
    pub concurrency_limit: Option<u32>,

    /// Optional name used to rewrite the `model` field in outbound
    /// request bodies, in place of `name`.
    #[serde(default)]
    pub use_model_name: Option<String>,

    /// Additional names this model answers to.
    #[serde(default)]
    pub aliases: Vec<String>,

    /// When true, omitted from the `/v1/models` catalog but still
    /// addressable directly.
    #[serde(default)]
    pub unlisted: bool,

    /// Overrides the default graceful-stop timeout (5s) for this model.
    #[serde(default = "default_graceful_stop_timeout_secs")]
    pub graceful_stop_timeout_secs: u64,

    /// Overrides the default health probe interval (1000ms) for this
    /// model. Kept as milliseconds, not seconds, so a backend with a
    /// fast-responding health endpoint can be polled sub-second.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

const fn default_graceful_stop_timeout_secs() -> u64 {
    DEFAULT_GRACEFUL_STOP_SECS
}

const fn default_health_check_interval_ms() -> u64 {
    DEFAULT_HEALTH_CHECK_INTERVAL_MS
}

impl ModelConfig {
    /// Graceful-stop timeout as a [`Duration`], for the stop protocol.
    #[must_use]
    pub const fn graceful_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.graceful_stop_timeout_secs)
    }

    /// Health probe interval as a [`Duration`], for the health prober.
    #[must_use]
    pub const fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    /// Fields whose change forces a stop-and-recreate of the owning
    /// `Process` on reload, per the reload algorithm: command,
    /// stop-command, upstream URL, health endpoint, env, concurrency cap.
    #[must_use]
    pub fn needs_restart_from(&self, previous: &Self) -> bool {
        self.command != previous.command
            || self.stop_command != previous.stop_command
            || self.upstream_url != previous.upstream_url
            || self.check_endpoint != previous.check_endpoint
            || self.env != previous.env
            || self.concurrency_limit != previous.concurrency_limit
    }

    /// The name written into outbound request bodies' `model` field.
    #[must_use]
    pub fn outbound_model_name(&self) -> &str {
        self.use_model_name.as_deref().unwrap_or(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ModelConfig {
        ModelConfig {
            name: "m1".into(),
            command: "./responder --port ${PORT}".into(),
            stop_command: None,
            upstream_url: "http://127.0.0.1:5800".into(),
            check_endpoint: "/health".into(),
            env: HashMap::new(),
            unload_after_seconds: 0,
            concurrency_limit: None,
            use_model_name: None,
            aliases: Vec::new(),
            unlisted: false,
            graceful_stop_timeout_secs: default_graceful_stop_timeout_secs(),
            health_check_interval_ms: default_health_check_interval_ms(),
        }
    }

    #[test]
    fn command_change_needs_restart() {
        let a = base();
        let mut b = base();
        b.command = "./other".into();
        assert!(b.needs_restart_from(&a));
    }

    #[test]
    fn alias_change_does_not_need_restart() {
        let a = base();
        let mut b = base();
        b.aliases.push("m1-alias".into());
        assert!(!b.needs_restart_from(&a));
    }

    #[test]
    fn outbound_name_falls_back_to_name() {
        let m = base();
        assert_eq!(m.outbound_model_name(), "m1");
    }

    #[test]
    fn outbound_name_uses_override_when_set() {
        let mut m = base();
        m.use_model_name = Some("gpt-4".into());
        assert_eq!(m.outbound_model_name(), "gpt-4");
    }
}
