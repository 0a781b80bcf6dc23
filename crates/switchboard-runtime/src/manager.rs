//! `ProxyManager`: the top-level coordinator. Resolves a requested model
//! name (including aliases and group-qualified names) to a backend,
//! enforces cross-group exclusivity, and delegates to the owning
//! `ProcessGroup`. Holds the active `Config` snapshot and reconciles it
//! on reload.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use switchboard_core::{Config, ConfigError, CoreError, EventSink, ModelConfig, ProcessState, StopMode};
use tokio::sync::broadcast;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::events::EventBus;
use crate::process::Process;
use crate::process_group::ProcessGroup;
use crate::reverse_proxy::{ProxyRequest, ProxyResponse};

/// Catalog entry surfaced by `GET /v1/models` — non-unlisted models only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub name: String,
    pub aliases: Vec<String>,
}

/// The alias/group/process maps derived from one `Config` snapshot.
/// Read-mostly; reload builds a new one and swaps it in behind a single
/// writer lock rather than mutating it in place.
struct Resolution {
    config: Config,
    alias_to_real: HashMap<String, String>,
    real_to_group: HashMap<String, String>,
    processes: HashMap<String, Arc<Process>>,
    groups: HashMap<String, Arc<ProcessGroup>>,
}

fn build_resolution(
    config: Config,
    shutdown_token: &CancellationToken,
    events: Arc<EventBus>,
    reuse: Option<&Resolution>,
) -> Resolution {
    let mut processes: HashMap<String, Arc<Process>> = HashMap::new();
    for model in &config.models {
        let persistent = config
            .groups
            .iter()
            .any(|g| g.has_member(&model.name) && g.persistent);

        let reused = reuse.and_then(|r| {
            let previous = r.config.models.iter().find(|m| m.name == model.name)?;
            if model.needs_restart_from(previous) {
                None
            } else {
                r.processes.get(&model.name).cloned()
            }
        });

        let process = match reused {
            Some(process) => {
                // The group's `persistent` flag isn't part of `ModelConfig`,
                // so it never triggers a restart — but a reused `Process`
                // still needs it kept current, since the TTL sweep reads it
                // live on every tick.
                process.set_persistent(persistent);
                process
            }
            None => Process::new(
                model.clone(),
                config.health_check_timeout(),
                persistent,
                shutdown_token.clone(),
                Arc::clone(&events) as Arc<dyn EventSink>,
            ),
        };
        processes.insert(model.name.clone(), process);
    }

    let mut alias_to_real = HashMap::new();
    for model in &config.models {
        alias_to_real.insert(model.name.clone(), model.name.clone());
        for alias in &model.aliases {
            alias_to_real.insert(alias.clone(), model.name.clone());
        }
    }

    let mut real_to_group = HashMap::new();
    let mut groups = HashMap::new();
    for group_cfg in &config.groups {
        let members: HashMap<String, Arc<Process>> = group_cfg
            .members
            .iter()
            .filter_map(|name| processes.get(name).map(|p| (name.clone(), Arc::clone(p))))
            .collect();
        for name in &group_cfg.members {
            real_to_group.insert(name.clone(), group_cfg.id.clone());
        }
        groups.insert(group_cfg.id.clone(), ProcessGroup::new(group_cfg.clone(), members));
    }

    Resolution {
        config,
        alias_to_real,
        real_to_group,
        processes,
        groups,
    }
}

/// The single value every HTTP handler talks to.
pub struct ProxyManager {
    resolution: RwLock<Arc<Resolution>>,
    shutdown_token: CancellationToken,
    events: Arc<EventBus>,
    /// Process-wide lock acquired only across the discovery + stop-
    /// initiation step of cross-group exclusivity: always acquired
    /// before any per-group swap mutex, never the reverse, to avoid
    /// deadlock.
    exclusivity_lock: AsyncMutex<()>,
}

impl ProxyManager {
    #[must_use]
    pub fn new(config: Config) -> Arc<Self> {
        let shutdown_token = CancellationToken::new();
        let events = EventBus::new();
        let resolution = build_resolution(config, &shutdown_token, Arc::clone(&events), None);
        Arc::new(Self {
            resolution: RwLock::new(Arc::new(resolution)),
            shutdown_token,
            events,
            exclusivity_lock: AsyncMutex::new(()),
        })
    }

    #[must_use]
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<switchboard_core::Event> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn required_api_keys(&self) -> Vec<String> {
        self.resolution.read().unwrap().config.required_api_keys.clone()
    }

    #[must_use]
    pub fn catalog(&self) -> Vec<CatalogEntry> {
        self.resolution
            .read()
            .unwrap()
            .config
            .models
            .iter()
            .filter(|m| !m.unlisted)
            .map(|m| CatalogEntry {
                name: m.name.clone(),
                aliases: m.aliases.clone(),
            })
            .collect()
    }

    /// Pre-starts every `persistent` group's members. Call once at boot,
    /// after construction.
    pub async fn start_persistent_groups(self: &Arc<Self>) {
        let groups: Vec<Arc<ProcessGroup>> =
            self.resolution.read().unwrap().groups.values().cloned().collect();
        for group in groups {
            group.start_all_if_persistent().await;
        }
    }

    /// Resolves a requested model name: optional `group/` qualifier, then
    /// alias lookup, then owning-group lookup, with the qualifier (if
    /// present) checked against the resolved group.
    fn resolve(&self, requested: &str) -> Result<(Arc<ProcessGroup>, String), CoreError> {
        let resolution = Arc::clone(&self.resolution.read().unwrap());

        let (group_hint, name) = match requested.split_once('/') {
            Some((hint, rest)) if resolution.groups.contains_key(hint) => (Some(hint), rest),
            _ => (None, requested),
        };

        let real_name = resolution
            .alias_to_real
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::ModelNotFound(requested.to_string()))?;

        let group_id = resolution
            .real_to_group
            .get(&real_name)
            .cloned()
            .ok_or_else(|| CoreError::ModelNotFound(requested.to_string()))?;

        if let Some(hint) = group_hint {
            if hint != group_id {
                return Err(CoreError::ModelNotFound(requested.to_string()));
            }
        }

        let group = resolution
            .groups
            .get(&group_id)
            .cloned()
            .ok_or_else(|| CoreError::ModelNotFound(requested.to_string()))?;

        Ok((group, real_name))
    }

    /// `route(modelName, w, req)`: the single polymorphic surface
    /// adapters call.
    pub async fn route(
        self: &Arc<Self>,
        requested_model: &str,
        req: ProxyRequest,
    ) -> Result<ProxyResponse, CoreError> {
        let (group, real_name) = self.resolve(requested_model)?;

        if group.is_exclusive() && group.is_swap() {
            let _lock = self.exclusivity_lock.lock().await;
            self.stop_non_members_of_other_swap_groups(&group).await;
        }

        group.proxy_request(&real_name, req).await
    }

    async fn stop_non_members_of_other_swap_groups(&self, activating: &Arc<ProcessGroup>) {
        let groups: Vec<Arc<ProcessGroup>> =
            self.resolution.read().unwrap().groups.values().cloned().collect();
        for other in groups {
            if Arc::ptr_eq(&other, activating) || !other.is_swap() {
                continue;
            }
            for (name, process) in other.members() {
                if process.current_state() != ProcessState::Stopped {
                    if let Err(e) = process.stop(StopMode::WaitInflight).await {
                        warn!(model = %name, error = %e, "exclusivity stop failed, forcing");
                        let _ = process.stop(StopMode::Immediate).await;
                    }
                }
            }
        }
    }

    /// `POST /api/models/unload`: stop everything, `IMMEDIATE`.
    pub async fn unload_all(&self) {
        let processes: Vec<Arc<Process>> =
            self.resolution.read().unwrap().processes.values().cloned().collect();
        for process in processes {
            let _ = process.stop(StopMode::Immediate).await;
        }
    }

    /// `POST /api/models/unload/{model}`: stop that one, `IMMEDIATE`.
    pub async fn unload_one(&self, requested_model: &str) -> Result<(), CoreError> {
        let (group, real_name) = self.resolve(requested_model)?;
        group.stop(&real_name, StopMode::Immediate).await
    }

    /// Reconciles the manager to a new `Config` snapshot: members whose
    /// command-affecting fields changed are stopped and recreated;
    /// others are reused in place; groups and models are created or
    /// torn down to match; the snapshot is then swapped atomically.
    pub async fn reload(self: &Arc<Self>, new_config: Config) -> Result<(), Vec<ConfigError>> {
        new_config.validate()?;

        let old = Arc::clone(&self.resolution.read().unwrap());

        for (name, process) in &old.processes {
            let still_exists = new_config.models.iter().any(|m| &m.name == name);
            let needs_restart = new_config
                .models
                .iter()
                .find(|m| &m.name == name)
                .zip(old.config.models.iter().find(|m| &m.name == name))
                .is_some_and(|(new, old)| new.needs_restart_from(old));

            if !still_exists || needs_restart {
                let _ = process.stop(StopMode::WaitInflight).await;
            }
        }

        let resolution = build_resolution(new_config, &self.shutdown_token, Arc::clone(&self.events), Some(&old));
        *self.resolution.write().unwrap() = Arc::new(resolution);

        self.start_persistent_groups().await;
        Ok(())
    }

    /// Cancels `shutdown_ctx` (interrupting every pending health probe
    /// and ready-wait), drains in-flight requests up to `deadline`, then
    /// forces every process to its terminal `SHUTDOWN` state.
    pub async fn shutdown(&self, deadline: Duration) {
        self.shutdown_token.cancel();

        let groups: Vec<Arc<ProcessGroup>> =
            self.resolution.read().unwrap().groups.values().cloned().collect();

        let drain = async {
            for group in &groups {
                group.stop_all(StopMode::WaitInflight).await;
            }
        };
        if tokio::time::timeout(deadline, drain).await.is_err() {
            warn!("shutdown drain deadline exceeded, forcing remaining processes down");
        }

        for group in &groups {
            group.shutdown_all().await;
        }
    }

    /// Test/diagnostic helper: current state of a real model name.
    #[must_use]
    pub fn process_state(&self, real_name: &str) -> Option<ProcessState> {
        self.resolution
            .read()
            .unwrap()
            .processes
            .get(real_name)
            .map(|p| p.current_state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Router};
    use std::collections::HashMap as Map;
    use std::net::SocketAddr;

    fn model(name: &str, upstream: &str, aliases: &[&str]) -> ModelConfig {
        ModelConfig {
            name: name.into(),
            command: "true".into(),
            stop_command: None,
            upstream_url: upstream.into(),
            check_endpoint: "/health".into(),
            env: Map::new(),
            unload_after_seconds: 0,
            concurrency_limit: None,
            use_model_name: None,
            aliases: aliases.iter().map(|a| (*a).to_string()).collect(),
            unlisted: false,
            graceful_stop_timeout_secs: 1,
            health_check_interval_ms: 20,
        }
    }

    async fn spawn_backend() -> SocketAddr {
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/echo", get(|| async { "ECHO" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn req() -> ProxyRequest {
        ProxyRequest {
            method: http::Method::GET,
            path_and_query: "/echo".into(),
            headers: http::HeaderMap::new(),
            body: bytes::Bytes::new(),
        }
    }

    #[tokio::test]
    async fn alias_resolves_to_real_model() {
        let addr = spawn_backend().await;
        let cfg = Config {
            health_check_timeout_secs: 5,
            start_port: None,
            models: vec![model("m1", &format!("http://{addr}"), &["m1-alias"])],
            groups: vec![switchboard_core::GroupConfig {
                id: "g1".into(),
                swap: false,
                exclusive: false,
                persistent: false,
                members: vec!["m1".into()],
            }],
            required_api_keys: Vec::new(),
        };
        let manager = ProxyManager::new(cfg);
        manager.route("m1-alias", req()).await.unwrap();
        assert_eq!(manager.process_state("m1"), Some(ProcessState::Ready));
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let cfg = Config {
            health_check_timeout_secs: 5,
            start_port: None,
            models: vec![],
            groups: vec![],
            required_api_keys: Vec::new(),
        };
        let manager = ProxyManager::new(cfg);
        let err = manager
            .route("ghost", req())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "model-not-found");
    }

    #[tokio::test]
    async fn catalog_omits_unlisted_models() {
        let addr = spawn_backend().await;
        let mut hidden = model("hidden", &format!("http://{addr}"), &[]);
        hidden.unlisted = true;
        let cfg = Config {
            health_check_timeout_secs: 5,
            start_port: None,
            models: vec![model("visible", &format!("http://{addr}"), &[]), hidden],
            groups: vec![switchboard_core::GroupConfig {
                id: "g1".into(),
                swap: false,
                exclusive: false,
                persistent: false,
                members: vec!["visible".into(), "hidden".into()],
            }],
            required_api_keys: Vec::new(),
        };
        let manager = ProxyManager::new(cfg);
        let names: Vec<_> = manager.catalog().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["visible".to_string()]);
    }

    #[tokio::test]
    async fn unload_all_stops_every_process() {
        let addr = spawn_backend().await;
        let cfg = Config {
            health_check_timeout_secs: 5,
            start_port: None,
            models: vec![model("m1", &format!("http://{addr}"), &[])],
            groups: vec![switchboard_core::GroupConfig {
                id: "g1".into(),
                swap: false,
                exclusive: false,
                persistent: false,
                members: vec!["m1".into()],
            }],
            required_api_keys: Vec::new(),
        };
        let manager = ProxyManager::new(cfg);
        manager.route("m1", req()).await.unwrap();
        assert_eq!(manager.process_state("m1"), Some(ProcessState::Ready));
        manager.unload_all().await;
        assert_eq!(manager.process_state("m1"), Some(ProcessState::Stopped));
    }

    #[tokio::test]
    async fn reload_hot_applies_alias_change_without_restart() {
        let addr = spawn_backend().await;
        let cfg = Config {
            health_check_timeout_secs: 5,
            start_port: None,
            models: vec![model("m1", &format!("http://{addr}"), &[])],
            groups: vec![switchboard_core::GroupConfig {
                id: "g1".into(),
                swap: false,
                exclusive: false,
                persistent: false,
                members: vec!["m1".into()],
            }],
            required_api_keys: Vec::new(),
        };
        let manager = ProxyManager::new(cfg.clone());
        manager.route("m1", req()).await.unwrap();
        assert_eq!(manager.process_state("m1"), Some(ProcessState::Ready));

        let mut new_cfg = cfg;
        new_cfg.models[0].aliases.push("m1-alias".into());
        manager.reload(new_cfg).await.unwrap();

        // hot-applied: process identity (and its READY state) survives.
        assert_eq!(manager.process_state("m1"), Some(ProcessState::Ready));
        manager.route("m1-alias", req()).await.unwrap();
    }
}
