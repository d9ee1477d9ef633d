//! Process supervisor: spawns children, watches their health and restarts
//! them.
//!
//! Each child gets a socket at `{runtime_dir}/{id}.sock` that is bound before
//! the process starts. Once the child connects back, the connection becomes a
//! [`Channel`] attached to the [`Router`]. From then on the supervisor loop
//! multiplexes:
//! - child exits reported by a per-child watcher task
//! - heartbeats and disconnects forwarded by the router
//! - a ticker that degrades and finally terminates silent processes
//!
//! Termination always runs the same teardown: kill the child, detach it from
//! the router (its pending calls fail with `ConnectionLost`), revoke its
//! shared buffers and remove its socket. Failure exits are restarted with
//! exponential backoff until the restart budget runs out.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::bridge::channel::Channel;
use crate::bridge::transport::{ChildTransportInfo, Endpoint};
use crate::config::SupervisorConfig;
use crate::process::{ExitReason, ProcessId, ProcessRef, ProcessState, Role};
use crate::router::{PeerNotice, Router};

/// What to run and under which identity.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub id: ProcessId,
    pub role: Role,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ProcessSpec {
    pub fn new(id: ProcessId, role: Role, program: impl Into<PathBuf>) -> Self {
        Self {
            id,
            role,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to start process: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} is already running")]
    AlreadyRunning(ProcessId),
    #[error("{id} did not connect within {timeout:?}")]
    ConnectTimeout { id: ProcessId, timeout: Duration },
    #[error("{0} exited before connecting")]
    ExitedEarly(ProcessId),
    #[error("{0} was terminated while starting")]
    Superseded(ProcessId),
    #[error("supervisor is shut down")]
    ShutDown,
}

/// Extension point for how children are started.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, spec: &ProcessSpec, transport: &ChildTransportInfo) -> Result<Child, SpawnError>;
}

/// Starts the program directly, passing the transport through the environment.
pub struct CommandSpawner;

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, spec: &ProcessSpec, transport: &ChildTransportInfo) -> Result<Child, SpawnError> {
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .envs(transport.to_env())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Ready {
        id: ProcessId,
        generation: u64,
    },
    Degraded {
        id: ProcessId,
        silent_for: Duration,
    },
    Terminated {
        id: ProcessId,
        reason: ExitReason,
    },
    Restarting {
        id: ProcessId,
        attempt: u32,
        delay: Duration,
    },
    /// Restart budget exhausted; the process stays terminated.
    Failed {
        id: ProcessId,
        restarts: u32,
        reason: ExitReason,
    },
}

/// Point-in-time view of one supervised process.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessSnapshot {
    pub id: ProcessId,
    pub role: Role,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub restarts: u32,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_ms_ago: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
}

struct Managed {
    spec: Arc<ProcessSpec>,
    state: ProcessState,
    generation: u64,
    pid: Option<u32>,
    restarts: u32,
    started_at: DateTime<Utc>,
    last_heartbeat: Instant,
    disconnected_at: Option<Instant>,
    exit_reason: Option<ExitReason>,
    /// Dropping or firing this makes the watcher kill the child.
    kill: Option<oneshot::Sender<()>>,
    /// Cancelled by the watcher once the child has been reaped.
    exited: CancellationToken,
    endpoint: Option<Endpoint>,
}

impl Managed {
    fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            id: self.spec.id.clone(),
            role: self.spec.role,
            state: self.state,
            pid: self.pid,
            restarts: self.restarts,
            generation: self.generation,
            started_at: self.started_at,
            last_heartbeat_ms_ago: self.last_heartbeat.elapsed().as_millis() as u64,
            exit_reason: self.exit_reason.clone(),
        }
    }
}

enum Internal {
    Exited {
        id: ProcessId,
        generation: u64,
        code: Option<i32>,
    },
}

struct SupervisorInner {
    config: SupervisorConfig,
    router: Router,
    spawner: Arc<dyn ProcessSpawner>,
    processes: DashMap<ProcessId, Managed>,
    events: broadcast::Sender<SupervisorEvent>,
    internal: mpsc::UnboundedSender<Internal>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("processes", &self.inner.processes.len())
            .finish()
    }
}

impl Supervisor {
    /// Must be called from within a tokio runtime. Takes over the router's
    /// peer notices.
    pub fn new(config: SupervisorConfig, router: Router) -> Self {
        Self::with_spawner(config, router, Arc::new(CommandSpawner))
    }

    pub fn with_spawner(
        config: SupervisorConfig,
        router: Router,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        let (internal, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let notices = router.subscribe_notices();
        let inner = Arc::new(SupervisorInner {
            config,
            router,
            spawner,
            processes: DashMap::new(),
            events,
            internal,
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(run_loop(Arc::downgrade(&inner), internal_rx, notices));
        Self { inner }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.events.subscribe()
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn snapshot(&self, id: &ProcessId) -> Option<ProcessSnapshot> {
        self.inner.processes.get(id).map(|m| m.value().snapshot())
    }

    pub fn processes(&self) -> Vec<ProcessSnapshot> {
        let mut all: Vec<ProcessSnapshot> = self
            .inner
            .processes
            .iter()
            .map(|m| m.value().snapshot())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Start `spec` and wait until it has connected and is attached to the
    /// router.
    pub async fn spawn(&self, spec: ProcessSpec) -> Result<ProcessRef, SpawnError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SpawnError::ShutDown);
        }
        if let Some(existing) = self.inner.processes.get(&spec.id)
            && !existing.state.is_terminal()
        {
            return Err(SpawnError::AlreadyRunning(spec.id.clone()));
        }
        self.launch(Arc::new(spec), 0).await
    }

    /// Stop a process for good. It is not restarted.
    pub fn terminate(&self, id: &ProcessId) -> bool {
        self.end(id, None, ExitReason::Shutdown, false)
    }

    /// Terminate every process and wait for them to be reaped.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();

        let ids: Vec<ProcessId> = self
            .inner
            .processes
            .iter()
            .map(|m| m.key().clone())
            .collect();
        for id in &ids {
            self.end(id, None, ExitReason::Shutdown, false);
        }

        let exited: Vec<CancellationToken> = self
            .inner
            .processes
            .iter()
            .map(|m| m.value().exited.clone())
            .collect();
        let reaped = futures::future::join_all(exited.iter().map(|t| t.cancelled()));
        let grace = self.inner.config.shutdown_timeout + Duration::from_secs(1);
        if tokio::time::timeout(grace, reaped).await.is_err() {
            tracing::warn!("Timed out waiting for children to exit");
        }
        tracing::info!(processes = ids.len(), "Supervisor shut down");
    }

    async fn launch(&self, spec: Arc<ProcessSpec>, restarts: u32) -> Result<ProcessRef, SpawnError> {
        let inner = &self.inner;
        let id = spec.id.clone();
        let remote = ProcessRef::new(id.clone(), spec.role);
        let generation = inner.next_generation.fetch_add(1, Ordering::Relaxed);

        let endpoint = Endpoint::bind(&inner.config.runtime_dir, &id)?;
        let transport = ChildTransportInfo {
            socket: endpoint.path().to_path_buf(),
            id: id.clone(),
            role: spec.role,
            parent: inner.router.local().id.clone(),
            heartbeat_interval: inner.config.heartbeat_interval,
        };

        let exited = CancellationToken::new();
        inner.processes.insert(
            id.clone(),
            Managed {
                spec: Arc::clone(&spec),
                state: ProcessState::Starting,
                generation,
                pid: None,
                restarts,
                started_at: Utc::now(),
                last_heartbeat: Instant::now(),
                disconnected_at: None,
                exit_reason: None,
                kill: None,
                exited: exited.clone(),
                endpoint: None,
            },
        );

        let child = match inner.spawner.spawn(&spec, &transport) {
            Ok(child) => child,
            Err(e) => {
                exited.cancel();
                self.fail_start(&id, generation, &e);
                return Err(e);
            }
        };
        let pid = child.id();
        tracing::info!(process_id = %id, role = %spec.role, pid, generation, "Spawned process");

        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(watch_child(
            child,
            kill_rx,
            inner.config.shutdown_timeout,
            inner.internal.clone(),
            id.clone(),
            generation,
            exited.clone(),
        ));
        if let Some(mut managed) = inner.processes.get_mut(&id)
            && managed.generation == generation
        {
            managed.pid = pid;
            managed.kill = Some(kill_tx);
        }

        let timeout = inner.config.spawn_timeout;
        let connect_back = async {
            match pid {
                Some(pid) => endpoint.accept_from(pid).await,
                // Already reaped; `exited` fires shortly.
                None => std::future::pending().await,
            }
        };
        let accepted = tokio::select! {
            biased;
            _ = exited.cancelled() => Err(SpawnError::ExitedEarly(id.clone())),
            accepted = tokio::time::timeout(timeout, connect_back) => match accepted {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(SpawnError::Io(e)),
                Err(_) => Err(SpawnError::ConnectTimeout { id: id.clone(), timeout }),
            },
        };
        let stream = match accepted {
            Ok(stream) => stream,
            Err(e) => {
                self.fail_start(&id, generation, &e);
                return Err(e);
            }
        };

        let router = &inner.router;
        let channel = Channel::accepted(
            router.local().clone(),
            remote.clone(),
            stream,
            router.config().max_frame_length,
            router.config().outbound_queue,
        );

        {
            let current = inner.processes.get_mut(&id);
            let Some(mut managed) = current.filter(|m| {
                m.generation == generation && m.state == ProcessState::Starting
            }) else {
                channel.close();
                return Err(SpawnError::Superseded(id));
            };
            managed.state = ProcessState::Ready;
            managed.last_heartbeat = Instant::now();
            managed.endpoint = Some(endpoint);
        }

        router.attach(remote.clone(), channel);
        tracing::info!(process_id = %id, generation, "Process ready");
        let _ = inner.events.send(SupervisorEvent::Ready { id, generation });
        Ok(remote)
    }

    fn fail_start(&self, id: &ProcessId, generation: u64, error: &SpawnError) {
        tracing::error!(process_id = %id, generation, error = %error, "Process failed to start");
        let reason = ExitReason::SpawnFailed {
            error: error.to_string(),
        };
        self.end(id, Some(generation), reason, true);
    }

    /// Tear down `id` once. `generation`, when given, must match the current
    /// incarnation.
    fn end(
        &self,
        id: &ProcessId,
        generation: Option<u64>,
        reason: ExitReason,
        allow_restart: bool,
    ) -> bool {
        let inner = &self.inner;
        let (generation, kill, endpoint, restarts, spec, first_start) = {
            let Some(mut managed) = inner.processes.get_mut(id) else {
                return false;
            };
            if managed.state.is_terminal() || generation.is_some_and(|g| g != managed.generation) {
                return false;
            }
            // A failed first start is reported to the caller of `spawn` instead.
            let first_start = managed.state == ProcessState::Starting && managed.restarts == 0;
            managed.state = ProcessState::Terminated;
            managed.exit_reason = Some(reason.clone());
            (
                managed.generation,
                managed.kill.take(),
                managed.endpoint.take(),
                managed.restarts,
                Arc::clone(&managed.spec),
                first_start,
            )
        };

        if let Some(kill) = kill {
            let _ = kill.send(());
        }
        inner.router.detach(id);
        inner.router.buffers().revoke_process(id);
        drop(endpoint);

        if reason.is_failure() {
            tracing::warn!(process_id = %id, generation, reason = %reason, "Process terminated");
        } else {
            tracing::info!(process_id = %id, generation, reason = %reason, "Process terminated");
        }
        let _ = inner.events.send(SupervisorEvent::Terminated {
            id: id.clone(),
            reason: reason.clone(),
        });

        if allow_restart && !first_start && reason.is_failure() && !inner.shutdown.is_cancelled() {
            self.schedule_restart(spec, generation, restarts, reason);
        }
        true
    }

    fn schedule_restart(&self, spec: Arc<ProcessSpec>, generation: u64, restarts: u32, reason: ExitReason) {
        let inner = &self.inner;
        let policy = &inner.config.restart;
        let id = spec.id.clone();
        if restarts >= policy.max_restarts {
            tracing::error!(process_id = %id, restarts, reason = %reason, "Restart budget exhausted");
            let _ = inner.events.send(SupervisorEvent::Failed {
                id,
                restarts,
                reason,
            });
            return;
        }

        let attempt = restarts + 1;
        let delay = policy.backoff(attempt);
        tracing::info!(process_id = %id, attempt, delay_ms = delay.as_millis() as u64, "Scheduling restart");
        let _ = inner.events.send(SupervisorEvent::Restarting {
            id: id.clone(),
            attempt,
            delay,
        });

        let weak = Arc::downgrade(inner);
        let shutdown = inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(inner) = weak.upgrade() else { return };
            let supervisor = Supervisor { inner };
            let still_current = supervisor
                .inner
                .processes
                .get(&id)
                .is_some_and(|m| m.generation == generation && m.state.is_terminal());
            if !still_current {
                return;
            }
            if let Err(e) = supervisor.launch(spec, attempt).await {
                tracing::warn!(process_id = %id, attempt, error = %e, "Restart failed");
            }
        });
    }

    fn on_internal(&self, event: Internal) {
        match event {
            Internal::Exited {
                id,
                generation,
                code,
            } => {
                if let Some(mut managed) = self.inner.processes.get_mut(&id)
                    && managed.generation == generation
                {
                    managed.pid = None;
                }
                self.end(&id, Some(generation), ExitReason::Exited { code }, true);
            }
        }
    }

    fn on_notice(&self, notice: PeerNotice) {
        match notice {
            PeerNotice::Heartbeat(id) => {
                let recovered = {
                    let Some(mut managed) = self.inner.processes.get_mut(&id) else {
                        return;
                    };
                    managed.last_heartbeat = Instant::now();
                    if managed.state == ProcessState::Degraded {
                        managed.state = ProcessState::Ready;
                        Some(managed.generation)
                    } else {
                        None
                    }
                };
                if let Some(generation) = recovered {
                    tracing::info!(process_id = %id, "Process recovered");
                    let _ = self
                        .inner
                        .events
                        .send(SupervisorEvent::Ready { id, generation });
                }
            }
            PeerNotice::Disconnected(id) => {
                // Give the exit watcher a tick to report the real exit status.
                if let Some(mut managed) = self.inner.processes.get_mut(&id)
                    && !managed.state.is_terminal()
                {
                    managed.disconnected_at = Some(Instant::now());
                }
            }
        }
    }

    fn check_health(&self) {
        let config = &self.inner.config;
        let mut degraded = Vec::new();
        let mut silent = Vec::new();
        let mut closed = Vec::new();

        for mut entry in self.inner.processes.iter_mut() {
            let managed = entry.value_mut();
            if !matches!(managed.state, ProcessState::Ready | ProcessState::Degraded) {
                continue;
            }
            if managed
                .disconnected_at
                .is_some_and(|at| at.elapsed() >= config.heartbeat_interval)
            {
                closed.push((managed.spec.id.clone(), managed.generation));
                continue;
            }
            let quiet = managed.last_heartbeat.elapsed();
            if quiet >= config.terminate_after {
                silent.push((managed.spec.id.clone(), managed.generation, quiet));
            } else if quiet >= config.degraded_after && managed.state == ProcessState::Ready {
                managed.state = ProcessState::Degraded;
                degraded.push((managed.spec.id.clone(), quiet));
            }
        }

        for (id, quiet) in degraded {
            tracing::warn!(process_id = %id, silent_ms = quiet.as_millis() as u64, "Heartbeats overdue; process degraded");
            let _ = self.inner.events.send(SupervisorEvent::Degraded {
                id,
                silent_for: quiet,
            });
        }
        for (id, generation, quiet) in silent {
            tracing::error!(process_id = %id, silent_ms = quiet.as_millis() as u64, "No heartbeat; terminating");
            self.end(&id, Some(generation), ExitReason::HeartbeatTimeout, true);
        }
        for (id, generation) in closed {
            self.end(&id, Some(generation), ExitReason::ChannelClosed, true);
        }
    }
}

async fn run_loop(
    weak: Weak<SupervisorInner>,
    mut internal: mpsc::UnboundedReceiver<Internal>,
    mut notices: mpsc::UnboundedReceiver<PeerNotice>,
) {
    let (shutdown, interval) = match weak.upgrade() {
        Some(inner) => (inner.shutdown.clone(), inner.config.heartbeat_interval),
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            Some(event) = internal.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                Supervisor { inner }.on_internal(event);
            }
            Some(notice) = notices.recv() => {
                let Some(inner) = weak.upgrade() else { break };
                Supervisor { inner }.on_notice(notice);
            }
            _ = ticker.tick() => {
                let Some(inner) = weak.upgrade() else { break };
                Supervisor { inner }.check_health();
            }
        }
    }
    tracing::debug!("Supervisor loop stopped");
}

/// Owns the child: reaps it, or on request stops it with SIGTERM and then
/// SIGKILL after `grace`.
async fn watch_child(
    mut child: Child,
    mut kill: oneshot::Receiver<()>,
    grace: Duration,
    internal: mpsc::UnboundedSender<Internal>,
    id: ProcessId,
    generation: u64,
    exited: CancellationToken,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        // Fired or dropped: either way the child has to go.
        _ = &mut kill => stop_child(&mut child, grace, &id).await,
    };

    let code = match &status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::warn!(process_id = %id, error = %e, "Failed to reap process");
            None
        }
    };
    tracing::debug!(process_id = %id, generation, code, "Process exited");
    exited.cancel();
    let _ = internal.send(Internal::Exited {
        id,
        generation,
        code,
    });
}

async fn stop_child(
    child: &mut Child,
    grace: Duration,
    id: &ProcessId,
) -> std::io::Result<std::process::ExitStatus> {
    if let Some(pid) = child.id() {
        let pid = nix::unistd::Pid::from_raw(pid as i32);
        if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            tracing::debug!(process_id = %id, error = %e, "SIGTERM failed");
        }
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(process_id = %id, "Process ignored SIGTERM; killing");
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::CapabilityTable;
    use crate::config::{RestartPolicy, RouterConfig};
    use crate::router::HandlerRegistry;
    use crate::shm::BufferPool;

    fn controller_router() -> Router {
        let me = ProcessRef::new(ProcessId::new("controller").unwrap(), Role::Controller);
        Router::new(
            me.clone(),
            Arc::new(CapabilityTable::new()),
            BufferPool::new(me.id),
            RouterConfig::default(),
            HandlerRegistry::new(),
        )
        .unwrap()
    }

    fn config(dir: &tempfile::TempDir) -> SupervisorConfig {
        SupervisorConfig::default()
            .with_runtime_dir(dir.path())
            .with_spawn_timeout(Duration::from_millis(500))
            .with_restart(RestartPolicy::never())
    }

    fn sh(id: &str, script: &str) -> ProcessSpec {
        ProcessSpec::new(ProcessId::new(id).unwrap(), Role::Worker, "/bin/sh").with_args(["-c", script])
    }

    #[tokio::test]
    async fn child_that_never_connects_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(config(&dir), controller_router());

        let err = supervisor.spawn(sh("worker-1", "sleep 30")).await.unwrap_err();
        assert!(matches!(err, SpawnError::ConnectTimeout { .. }), "{err}");

        let snap = supervisor.snapshot(&ProcessId::new("worker-1").unwrap()).unwrap();
        assert_eq!(snap.state, ProcessState::Terminated);
        assert!(matches!(snap.exit_reason, Some(ExitReason::SpawnFailed { .. })));
        assert!(!dir.path().join("worker-1.sock").exists());
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn child_that_exits_early_fails_the_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(config(&dir), controller_router());

        let err = supervisor.spawn(sh("worker-1", "exit 3")).await.unwrap_err();
        assert!(
            matches!(err, SpawnError::ExitedEarly(_) | SpawnError::Superseded(_)),
            "{err}"
        );
        let snap = supervisor.snapshot(&ProcessId::new("worker-1").unwrap()).unwrap();
        assert_eq!(snap.state, ProcessState::Terminated);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn missing_program_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(config(&dir), controller_router());
        let spec = ProcessSpec::new(
            ProcessId::new("worker-1").unwrap(),
            Role::Worker,
            dir.path().join("does-not-exist"),
        );
        let err = supervisor.spawn(spec).await.unwrap_err();
        assert!(matches!(err, SpawnError::Io(_)), "{err}");
    }

    #[tokio::test]
    async fn spawn_after_shutdown_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(config(&dir), controller_router());
        supervisor.shutdown().await;
        let err = supervisor.spawn(sh("worker-1", "true")).await.unwrap_err();
        assert!(matches!(err, SpawnError::ShutDown));
    }
}
