//! The per-backend state machine: owns a child OS process, tracks
//! readiness via the health prober, enforces graceful-then-forced
//! shutdown, and exposes the reverse-proxy entry point that auto-starts
//! the child on demand.
//!
//! The state machine itself is modeled as a `std::sync::Mutex<ProcessState>`
//! guarding CAS-shaped transitions rather than a lock-free atomic — the
//! practical equivalent for a five-variant enum, and the shape the
//! teacher uses for its own guarded state (`RwLock<Option<..>>` in
//! `ProcessManager`'s single-swap strategy). The child handle lives
//! behind a `tokio::sync::Mutex` instead, because stopping it requires
//! holding a live reference across `.await` points.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use switchboard_core::{CoreError, Event, EventSink, LogStream, ModelConfig, ProcessState, StopMode};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::health::{self, ProbeOutcome};
use crate::logs::LogRing;
use crate::reverse_proxy::{forward, ProxyRequest, ProxyResponse};
use crate::sanitizer;
use crate::shutdown;

/// One backend: the child OS process plus everything needed to proxy
/// requests to it and tear it down.
pub struct Process {
    name: String,
    config: ModelConfig,
    health_check_timeout: Duration,
    persistent: AtomicBool,

    state: Mutex<ProcessState>,
    start_waiters: Mutex<Option<broadcast::Sender<Result<(), CoreError>>>>,
    probe_cancel: Mutex<Option<CancellationToken>>,
    child: AsyncMutex<Option<Child>>,

    client: reqwest::Client,
    in_flight: AtomicU32,
    last_request_handled: Mutex<Option<Instant>>,

    stdout_ring: Arc<LogRing>,
    stderr_ring: Arc<LogRing>,
    events: Arc<dyn EventSink>,
    shutdown_token: CancellationToken,
}

struct InFlightGuard<'a> {
    process: &'a Process,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.process.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Process {
    #[must_use]
    pub fn new(
        config: ModelConfig,
        health_check_timeout: Duration,
        persistent: bool,
        shutdown_token: CancellationToken,
        events: Arc<dyn EventSink>,
    ) -> Arc<Self> {
        let process = Arc::new(Self {
            name: config.name.clone(),
            health_check_timeout,
            persistent: AtomicBool::new(persistent),
            state: Mutex::new(ProcessState::Stopped),
            start_waiters: Mutex::new(None),
            probe_cancel: Mutex::new(None),
            child: AsyncMutex::new(None),
            client: reqwest::Client::builder()
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            in_flight: AtomicU32::new(0),
            last_request_handled: Mutex::new(None),
            stdout_ring: Arc::new(LogRing::new()),
            stderr_ring: Arc::new(LogRing::new()),
            events,
            shutdown_token,
            config,
        });
        process.spawn_ttl_sweep_if_needed();
        process
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    #[must_use]
    pub fn current_state(&self) -> ProcessState {
        *self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Whether this process currently belongs to a persistent group.
    /// Re-checked live on every TTL sweep tick, since a reload can flip
    /// this without recreating the `Process`.
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::SeqCst)
    }

    /// Called by `build_resolution` on every reload to keep a reused
    /// `Process` in sync with its owning group's current `persistent`
    /// flag.
    pub fn set_persistent(&self, persistent: bool) {
        self.persistent.store(persistent, Ordering::SeqCst);
    }

    #[must_use]
    pub fn last_request_handled(&self) -> Option<Instant> {
        *self
            .last_request_handled
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[must_use]
    pub fn stdout_tail(&self) -> String {
        self.stdout_ring.snapshot()
    }

    #[must_use]
    pub fn stderr_tail(&self) -> String {
        self.stderr_ring.snapshot()
    }

    fn emit_transition(&self, from: ProcessState, to: ProcessState) {
        info!(model = %self.name, %from, %to, "process state transition");
        self.events.emit(Event::StateChanged {
            model: self.name.clone(),
            from,
            to,
            at: std::time::SystemTime::now(),
        });
    }

    /// Idempotent for concurrent callers: the first caller to win the
    /// CAS becomes the leader and performs the work in a detached task
    /// (so a follower's own cancellation can never abort the leader's
    /// work); everyone else waits on the same broadcast outcome.
    pub async fn start(self: &Arc<Self>) -> Result<(), CoreError> {
        let mut rx = {
            let mut waiters = self.start_waiters.lock().unwrap();
            let mut state = self.state.lock().unwrap();
            match *state {
                ProcessState::Ready => return Ok(()),
                ProcessState::Stopping | ProcessState::Shutdown => {
                    return Err(CoreError::StateUnavailable(self.name.clone()));
                }
                ProcessState::Starting => {
                    let Some(tx) = waiters.as_ref() else {
                        return Err(CoreError::StartFailed(
                            "process is starting but has no outcome channel".to_string(),
                        ));
                    };
                    tx.subscribe()
                }
                ProcessState::Stopped => {
                    let prior = *state;
                    *state = ProcessState::Starting;
                    drop(state);
                    self.emit_transition(prior, ProcessState::Starting);

                    let (tx, rx) = broadcast::channel(32);
                    *waiters = Some(tx.clone());
                    drop(waiters);

                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        let result = this.run_start_protocol().await;
                        *this.start_waiters.lock().unwrap() = None;
                        let _ = tx.send(result);
                    });
                    rx
                }
            }
        };

        match rx.recv().await {
            Ok(result) => result,
            Err(_) => Err(CoreError::StartFailed(
                "start outcome channel closed without a result".to_string(),
            )),
        }
    }

    /// The leader's actual work: build argv, spawn the child, stream its
    /// logs, and probe its health endpoint until ready, the child exits,
    /// shutdown fires, or the deadline elapses.
    async fn run_start_protocol(self: &Arc<Self>) -> Result<(), CoreError> {
        let port = parse_port(&self.config.upstream_url).unwrap_or(0);
        let argv = sanitizer::expand_start_command(&self.config.command, port, &self.name)?;
        let (program, args) = argv
            .split_first()
            .expect("sanitizer guarantees non-empty argv");

        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.envs(&self.config.env);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        apply_platform_spawn_attributes(&mut cmd);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                *self.state.lock().unwrap() = ProcessState::Stopped;
                self.emit_transition(ProcessState::Starting, ProcessState::Stopped);
                return Err(CoreError::StartFailed(format!(
                    "unable to start process: {e}"
                )));
            }
        };

        if let Some(stdout) = child.stdout.take() {
            spawn_log_reader(
                stdout,
                Arc::clone(&self.stdout_ring),
                Arc::clone(&self.events),
                self.name.clone(),
                LogStream::Stdout,
            );
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_reader(
                stderr,
                Arc::clone(&self.stderr_ring),
                Arc::clone(&self.events),
                self.name.clone(),
                LogStream::Stderr,
            );
        }

        let probe_cancel = CancellationToken::new();
        *self.probe_cancel.lock().unwrap() = Some(probe_cancel.clone());

        let health_url = format!(
            "{}{}",
            self.config.upstream_url.trim_end_matches('/'),
            self.config.check_endpoint
        );

        let outcome = tokio::select! {
            probe = health::probe_until_ready(
                &self.client,
                &health_url,
                self.config.health_check_interval(),
                self.health_check_timeout,
                &probe_cancel,
            ) => match probe {
                ProbeOutcome::Ready => StartOutcome::Ready,
                ProbeOutcome::TimedOut => StartOutcome::TimedOut,
                // `probe_cancel` fires on either a targeted stop() preempting
                // just this process, or the shutdown-wide token; the latter
                // always wins when both are observable.
                ProbeOutcome::Cancelled => {
                    if self.shutdown_token.is_cancelled() {
                        StartOutcome::ShutdownDuringStart
                    } else {
                        StartOutcome::Preempted
                    }
                }
            },
            status = child.wait() => {
                match status {
                    Ok(status) => StartOutcome::ChildExited(status.code()),
                    Err(e) => {
                        warn!(model = %self.name, error = %e, "error waiting on child");
                        StartOutcome::ChildExited(None)
                    }
                }
            }
            () = self.shutdown_token.cancelled() => StartOutcome::ShutdownDuringStart,
        };

        *self.probe_cancel.lock().unwrap() = None;

        match outcome {
            StartOutcome::Ready => match self.settle(ProcessState::Ready) {
                Ok(from) => {
                    *self.child.lock().await = Some(child);
                    self.emit_transition(from, ProcessState::Ready);
                    Ok(())
                }
                Err(e) => {
                    // stop()/shutdown() already moved us off STARTING while
                    // the health probe was in flight; honor their
                    // transition instead of reviving a child the caller
                    // believes is no longer running.
                    warn!(model = %self.name, error = %e, "discarding child readied after state moved on");
                    kill_and_reap(&mut child).await;
                    Err(CoreError::StateUnavailable(self.name.clone()))
                }
            },
            StartOutcome::ChildExited(code) => {
                self.settle_or_log(ProcessState::Stopped);
                Err(CoreError::StartFailed(format!(
                    "upstream command exited prematurely (exit code {code:?})"
                )))
            }
            StartOutcome::TimedOut => {
                kill_and_reap(&mut child).await;
                self.settle_or_log(ProcessState::Stopped);
                Err(CoreError::StartFailed(format!(
                    "timed out waiting for model {} to be ready",
                    self.name
                )))
            }
            StartOutcome::ShutdownDuringStart => {
                // SHUTDOWN is reachable only from STOPPING; settle there
                // first instead of jumping straight from STARTING.
                self.settle_or_log(ProcessState::Stopping);
                kill_and_reap(&mut child).await;
                self.settle_or_log(ProcessState::Shutdown);
                Err(CoreError::HealthInterrupted)
            }
            StartOutcome::Preempted => {
                // stop() cancelled us while STARTING; it already set
                // STOPPING and is waiting for us to settle.
                kill_and_reap(&mut child).await;
                self.settle_or_log(ProcessState::Stopped);
                Err(CoreError::StateUnavailable(self.name.clone()))
            }
        }
    }

    /// Move out of whatever state `run_start_protocol`'s leader left us in
    /// and into `to`, re-checking under the lock that the transition is
    /// still legal. A concurrent `stop()`/`shutdown()` call may have moved
    /// the process on (typically to `STOPPING`) while the probe or child
    /// wait was in flight; when that happened, `to` is no longer reachable
    /// and the write is skipped rather than clobbering their transition.
    fn settle(&self, to: ProcessState) -> Result<ProcessState, CoreError> {
        let mut state = self.state.lock().unwrap();
        let from = *state;
        if from.can_transition_to(to) {
            *state = to;
            Ok(from)
        } else {
            Err(CoreError::InvalidStateTransition {
                process: self.name.clone(),
                from,
                to,
            })
        }
    }

    /// `settle`, but for call sites that have no outcome of their own to
    /// report: log-and-drop a rejected transition instead of propagating it.
    fn settle_or_log(&self, to: ProcessState) {
        match self.settle(to) {
            Ok(from) => self.emit_transition(from, to),
            Err(e) => warn!(model = %self.name, error = %e, "skipping stale state transition"),
        }
    }

    /// Graceful-then-forced shutdown. `WaitInflight` blocks on in-flight
    /// draining before signaling the child; `Immediate` skips the wait.
    /// A no-op if already `STOPPED`; joins an already-in-progress stop.
    pub async fn stop(self: &Arc<Self>, mode: StopMode) -> Result<(), CoreError> {
        let prior = {
            let mut state = self.state.lock().unwrap();
            match *state {
                ProcessState::Stopped | ProcessState::Shutdown => return Ok(()),
                ProcessState::Stopping => None,
                ProcessState::Starting | ProcessState::Ready => {
                    let prior = *state;
                    *state = ProcessState::Stopping;
                    Some(prior)
                }
            }
        };

        let Some(prior) = prior else {
            self.wait_until_settled().await;
            return Ok(());
        };

        self.emit_transition(prior, ProcessState::Stopping);

        if prior == ProcessState::Starting {
            if let Some(cancel) = self.probe_cancel.lock().unwrap().clone() {
                cancel.cancel();
            }
            self.wait_until_settled().await;
            return Ok(());
        }

        if mode == StopMode::WaitInflight {
            let deadline = tokio::time::Instant::now() + self.config.graceful_stop_timeout();
            while self.in_flight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }

        let child_opt = self.child.lock().await.take();
        if let Some(mut child) = child_opt {
            let result = if let Some(stop_cmd) = &self.config.stop_command {
                let pid = child.id().unwrap_or(0);
                match sanitizer::expand_stop_command(stop_cmd, pid) {
                    Ok(argv) => {
                        shutdown::stop_with_command(&mut child, &argv, self.config.graceful_stop_timeout())
                            .await
                    }
                    Err(e) => {
                        warn!(model = %self.name, error = %e, "invalid stop command, falling back to signal");
                        shutdown::stop_gracefully(&mut child, self.config.graceful_stop_timeout()).await
                    }
                }
            } else {
                shutdown::stop_gracefully(&mut child, self.config.graceful_stop_timeout()).await
            };
            if let Err(e) = result {
                warn!(model = %self.name, error = %e, "error reaping child during stop");
            }
        }

        *self.state.lock().unwrap() = ProcessState::Stopped;
        self.emit_transition(ProcessState::Stopping, ProcessState::Stopped);
        Ok(())
    }

    /// Like an immediate stop, but lands on the terminal `SHUTDOWN`
    /// state. Never restartable afterward.
    pub async fn shutdown(self: &Arc<Self>) -> Result<(), CoreError> {
        loop {
            match self.current_state() {
                ProcessState::Shutdown => return Ok(()),
                ProcessState::Stopped => {
                    // SHUTDOWN is reachable only from STOPPING; there is
                    // no child to stop here, so settle through STOPPING
                    // immediately rather than jumping straight there.
                    match self.settle(ProcessState::Stopping) {
                        Ok(from) => {
                            self.emit_transition(from, ProcessState::Stopping);
                            self.settle_or_log(ProcessState::Shutdown);
                            return Ok(());
                        }
                        Err(_) => continue,
                    }
                }
                ProcessState::Starting | ProcessState::Ready => {
                    self.stop(StopMode::Immediate).await?;
                }
                ProcessState::Stopping => {
                    self.wait_until_settled().await;
                }
            }
        }
    }

    async fn wait_until_settled(&self) {
        let deadline =
            tokio::time::Instant::now() + self.config.graceful_stop_timeout() + Duration::from_secs(2);
        while matches!(
            self.current_state(),
            ProcessState::Starting | ProcessState::Stopping
        ) {
            if tokio::time::Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Block until ready (auto-starting if needed), then reverse-proxy
    /// `req` to the child. Enforces the in-flight concurrency cap.
    pub async fn proxy_request(
        self: &Arc<Self>,
        req: ProxyRequest,
    ) -> Result<ProxyResponse, CoreError> {
        if let Some(limit) = self.config.concurrency_limit {
            loop {
                let current = self.in_flight.load(Ordering::SeqCst);
                if current >= limit {
                    return Err(CoreError::OverCapacity(self.name.clone()));
                }
                if self
                    .in_flight
                    .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    break;
                }
            }
        } else {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
        }
        let _guard = InFlightGuard { process: self };

        match self.current_state() {
            ProcessState::Ready => {}
            ProcessState::Stopped | ProcessState::Starting => self.start().await?,
            ProcessState::Stopping | ProcessState::Shutdown => {
                return Err(CoreError::StateUnavailable(self.name.clone()));
            }
        }

        *self.last_request_handled.lock().unwrap() = Some(Instant::now());

        let req = match self.config.use_model_name {
            Some(_) => rewrite_outbound_model_field(req, self.config.outbound_model_name()),
            None => req,
        };

        forward(&self.client, &self.config.upstream_url, req).await
    }

    fn spawn_ttl_sweep_if_needed(self: &Arc<Self>) {
        if self.config.unload_after_seconds == 0 {
            return;
        }
        let ttl = Duration::from_secs(self.config.unload_after_seconds);
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                let Some(process) = weak.upgrade() else {
                    return;
                };
                if process.is_persistent() {
                    continue;
                }
                if process.current_state() != ProcessState::Ready {
                    continue;
                }
                if process.in_flight.load(Ordering::SeqCst) != 0 {
                    continue;
                }
                let Some(last) = process.last_request_handled() else {
                    continue;
                };
                if last.elapsed() >= ttl {
                    debug!(model = %process.name, "TTL elapsed, unloading");
                    let _ = process.stop(StopMode::WaitInflight).await;
                }
            }
        });
    }
}

enum StartOutcome {
    Ready,
    ChildExited(Option<i32>),
    TimedOut,
    ShutdownDuringStart,
    Preempted,
}

async fn kill_and_reap(child: &mut Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Rewrite the `model` field of a JSON request body to `override_name`.
/// `ModelConfig::use_model_name` lets a config alias the name callers use
/// for a backend (e.g. "gpt-4") to whatever name the child process itself
/// expects in its request bodies. Bodies that aren't JSON, or that have no
/// `model` field, pass through untouched.
fn rewrite_outbound_model_field(req: ProxyRequest, override_name: &str) -> ProxyRequest {
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&req.body) else {
        return req;
    };
    let Some(obj) = value.as_object_mut() else {
        return req;
    };
    if !obj.contains_key("model") {
        return req;
    }
    obj.insert(
        "model".to_string(),
        serde_json::Value::String(override_name.to_string()),
    );
    let Ok(rewritten) = serde_json::to_vec(&value) else {
        return req;
    };
    ProxyRequest {
        body: Bytes::from(rewritten),
        ..req
    }
}

fn parse_port(upstream_url: &str) -> Option<u16> {
    upstream_url
        .rsplit_once(':')
        .and_then(|(_, port_and_path)| port_and_path.split('/').next())
        .and_then(|p| p.parse().ok())
}

#[cfg(unix)]
fn apply_platform_spawn_attributes(_cmd: &mut Command) {}

#[cfg(windows)]
fn apply_platform_spawn_attributes(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

fn spawn_log_reader(
    pipe: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    ring: Arc<LogRing>,
    events: Arc<dyn EventSink>,
    model: String,
    stream: LogStream,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            ring.push(line.as_bytes());
            ring.push(b"\n");
            events.emit(Event::Log {
                model: model.clone(),
                stream,
                data: line,
            });
        }
    });
}
