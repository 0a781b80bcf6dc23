//! A group of `Process`es sharing a hardware budget.
//!
//! Grounded on the teacher's `process::manager::ProcessManager`, whose
//! `SingleSwap` strategy stops the one currently-resident model before
//! starting another under a lock; generalized here from "exactly one
//! current slot" to "N members, at most one non-STOPPED at a time" so a
//! group can hold more than two models, and given a sibling `Parallel`
//! policy (no per-group mutex on the hot path) for groups that don't
//! need mutual exclusion at all.

use std::collections::HashMap;
use std::sync::Arc;

use switchboard_core::{CoreError, GroupConfig, ProcessState, StopMode};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::process::Process;
use crate::reverse_proxy::{ProxyRequest, ProxyResponse};

/// Owns a fixed set of `Process`es and enforces either swap (at most one
/// resident member) or parallel (members coexist) scheduling.
pub struct ProcessGroup {
    config: GroupConfig,
    members: HashMap<String, Arc<Process>>,
    /// Serializes scheduling decisions for `swap` groups; never held
    /// across the actual request proxying, only the predecessor-stop
    /// step. Waiters are served in arrival order, so concurrent
    /// requests for different members swap in FIFO rather than racing.
    swap_mutex: AsyncMutex<()>,
}

impl ProcessGroup {
    #[must_use]
    pub fn new(config: GroupConfig, members: HashMap<String, Arc<Process>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            members,
            swap_mutex: AsyncMutex::new(()),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    #[must_use]
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    #[must_use]
    pub fn is_swap(&self) -> bool {
        self.config.swap
    }

    #[must_use]
    pub fn is_exclusive(&self) -> bool {
        self.config.exclusive
    }

    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.config.persistent
    }

    #[must_use]
    pub fn has_member(&self, name: &str) -> bool {
        self.members.contains_key(name)
    }

    #[must_use]
    pub fn get_member(&self, name: &str) -> Option<&Arc<Process>> {
        self.members.get(name)
    }

    pub fn members(&self) -> impl Iterator<Item = (&str, &Arc<Process>)> {
        self.members.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Route to member `name`. Under `swap`, first acquires the group's
    /// scheduling mutex and stops whichever other member is currently
    /// resident (there is at most one, by invariant) before forwarding;
    /// under parallel policy, forwards directly with no group-wide lock.
    pub async fn proxy_request(
        self: &Arc<Self>,
        name: &str,
        req: ProxyRequest,
    ) -> Result<ProxyResponse, CoreError> {
        let Some(member) = self.members.get(name) else {
            return Err(CoreError::ModelNotFound(name.to_string()));
        };

        if self.config.swap {
            let _guard = self.swap_mutex.lock().await;
            self.stop_other_members(name).await?;
            member.proxy_request(req).await
        } else {
            member.proxy_request(req).await
        }
    }

    /// Find any other member currently not STOPPED and stop it
    /// (`WAIT_INFLIGHT`). If it refuses to settle, escalate to
    /// `IMMEDIATE` to restore the invariant before releasing the mutex,
    /// and surface the original failure as `bad-gateway`-class.
    async fn stop_other_members(&self, keep: &str) -> Result<(), CoreError> {
        for (name, process) in &self.members {
            if name == keep {
                continue;
            }
            if process.current_state() == ProcessState::Stopped {
                continue;
            }
            if let Err(e) = process.stop(StopMode::WaitInflight).await {
                warn!(model = %name, error = %e, "swap predecessor refused graceful stop, forcing");
                let _ = process.stop(StopMode::Immediate).await;
                return Err(CoreError::UpstreamError(format!(
                    "failed to stop swap predecessor {name}: {e}"
                )));
            }
        }
        Ok(())
    }

    /// Stop one member by name (used by the unload-one admin endpoint).
    pub async fn stop(&self, name: &str, mode: StopMode) -> Result<(), CoreError> {
        let Some(member) = self.members.get(name) else {
            return Err(CoreError::ModelNotFound(name.to_string()));
        };
        member.stop(mode).await
    }

    pub async fn stop_all(&self, mode: StopMode) {
        for process in self.members.values() {
            let _ = process.stop(mode).await;
        }
    }

    pub async fn shutdown_all(&self) {
        for process in self.members.values() {
            let _ = process.shutdown().await;
        }
    }

    /// Pre-starts every member at boot. A no-op unless the group is
    /// `persistent`.
    pub async fn start_all_if_persistent(self: &Arc<Self>) {
        if !self.config.persistent {
            return;
        }
        for process in self.members.values() {
            let _ = process.start().await;
        }
    }
}
