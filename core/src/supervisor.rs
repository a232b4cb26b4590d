//! The supervisor: single owner of the agent process and its lifecycle status.
//!
//! Commands (`start`, `stop`) and background notifications (readiness, termination) all
//! reconcile through one lifecycle lock, so transitions are strictly ordered. Reads go
//! through snapshots and never wait on that lock.

use crate::config::{AgentConfig, SupervisorSettings};
use crate::errors::{HealthError, SupervisorResult};
use crate::events::{EventBus, EventBusStats, RuntimeBridge, Subscription, SupervisorEvent};
use crate::health::{
    AgentHealth, AgentMetrics, HealthPoller, HealthProbe, HttpHealthProbe, PollObserver,
};
use crate::launcher::{AgentProcessHandle, LocalProcessLauncher, ProcessLauncher};
use crate::logs::{LogBuffer, LogEntry, LogLevel};
use crate::monitor::{Termination, TerminationMonitor};
use crate::preflight::PreflightValidator;
use crate::state::{transition, AgentStatus, LifecycleEvent};
use crate::stream::{agent_output, LoadingProgress, OutputItem};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long output already written by an exited agent may take to drain into the log.
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Builds the health probe for one run from its config.
pub type ProbeFactory = Arc<dyn Fn(&AgentConfig) -> Arc<dyn HealthProbe> + Send + Sync>;

/// Whether a command was acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Accepted,
    /// The current state (or a command already in flight) does not allow it
    Ignored,
}

/// Transient per-run views. Cleared when the run ends.
#[derive(Debug, Default)]
struct Snapshots {
    generation: u64,
    handle: Option<AgentProcessHandle>,
    health: Option<AgentHealth>,
    metrics: Option<AgentMetrics>,
    progress: Option<LoadingProgress>,
}

struct ActiveRun {
    generation: u64,
    monitor: Arc<TerminationMonitor>,
    probe: Arc<dyn HealthProbe>,
    poll_cancel: CancellationToken,
    reader: Option<JoinHandle<()>>,
    exited: watch::Receiver<bool>,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.poll_cancel.cancel();
    }
}

#[derive(Default)]
struct Lifecycle {
    generation: u64,
    run: Option<ActiveRun>,
}

impl Lifecycle {
    fn is_current(&self, generation: u64) -> bool {
        self.run.as_ref().map(|r| r.generation) == Some(generation)
    }
}

/// Set while a start or stop runs; released on drop.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Shared {
    settings: SupervisorSettings,
    launcher: Arc<dyn ProcessLauncher>,
    probe_factory: ProbeFactory,
    preflight: PreflightValidator,
    bridge: Option<Arc<dyn RuntimeBridge>>,
    bus: EventBus,
    logs: RwLock<LogBuffer>,
    status: watch::Sender<AgentStatus>,
    lifecycle: Mutex<Lifecycle>,
    in_flight: AtomicBool,
    snapshots: RwLock<Snapshots>,
}

impl Shared {
    fn emit(&self, event: SupervisorEvent) {
        if let Some(bridge) = &self.bridge {
            bridge.emit(&event);
        }
        self.bus.publish(event);
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) -> LogEntry {
        // held across publish so subscribers see ids in order
        let mut logs = self.logs.write();
        let entry = logs.push(level, message);
        self.emit(SupervisorEvent::Log(entry.clone()));
        entry
    }

    /// Apply `event` to the current status. Callers hold the lifecycle lock.
    fn apply(&self, _lifecycle: &mut Lifecycle, event: LifecycleEvent) -> Option<AgentStatus> {
        let current = *self.status.borrow();
        match transition(current, event) {
            Some(next) => {
                info!("Agent status {} -> {} ({})", current, next, event);
                self.status.send_replace(next);
                self.emit(SupervisorEvent::Status { status: next });
                Some(next)
            }
            None => {
                debug!("Ignoring {} while {}", event, current);
                None
            }
        }
    }

    fn record_progress(&self, generation: u64, progress: LoadingProgress) {
        {
            let mut snapshots = self.snapshots.write();
            if snapshots.generation != generation {
                return;
            }
            snapshots.progress = Some(progress);
        }
        self.emit(SupervisorEvent::LoadingProgress(progress));
    }

    /// Drop the run and everything tied to it.
    fn teardown(&self, lifecycle: &mut Lifecycle) {
        if let Some(mut run) = lifecycle.run.take() {
            if let Some(mut reader) = run.reader.take() {
                tokio::spawn(async move {
                    if tokio::time::timeout(READER_DRAIN_TIMEOUT, &mut reader)
                        .await
                        .is_err()
                    {
                        reader.abort();
                    }
                });
            }
            debug!("Tore down agent run {}", run.generation);
        }
        *self.snapshots.write() = Snapshots::default();
    }

    async fn handle_termination(&self, generation: u64, termination: Termination) {
        let mut lifecycle = self.lifecycle.lock().await;
        if !lifecycle.is_current(generation) {
            debug!("Stale termination for run {}: {}", generation, termination);
            return;
        }

        let status = *self.status.borrow();
        if status == AgentStatus::Stopping {
            self.log(LogLevel::Info, format!("Agent stopped ({})", termination));
        } else {
            error!("Agent run {} ended unexpectedly: {}", generation, termination);
            self.log(
                LogLevel::Error,
                format!("Agent stopped unexpectedly: {}", termination),
            );
        }

        self.apply(&mut lifecycle, LifecycleEvent::Terminated);
        self.teardown(&mut lifecycle);
    }
}

/// Poll results for one run, routed back into the supervisor.
struct RunObserver {
    shared: Weak<Shared>,
    generation: u64,
    spawned_at: DateTime<Utc>,
}

#[async_trait]
impl PollObserver for RunObserver {
    async fn on_health(&self, health: AgentHealth) {
        if let Some(shared) = self.shared.upgrade() {
            let mut snapshots = shared.snapshots.write();
            if snapshots.generation == self.generation {
                snapshots.health = Some(health);
            }
        }
    }

    async fn on_metrics(&self, mut metrics: AgentMetrics) {
        if metrics.uptime_seconds == 0 {
            metrics.uptime_seconds = (Utc::now() - self.spawned_at).num_seconds().max(0) as u64;
        }
        if let Some(shared) = self.shared.upgrade() {
            let mut snapshots = shared.snapshots.write();
            if snapshots.generation == self.generation {
                snapshots.metrics = Some(metrics);
            }
        }
    }

    async fn on_ready(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let mut lifecycle = shared.lifecycle.lock().await;
        if !lifecycle.is_current(self.generation) {
            return;
        }
        if shared.apply(&mut lifecycle, LifecycleEvent::Ready).is_some() {
            shared.log(LogLevel::Info, "Agent is ready");
        }
    }

    async fn on_progress(&self, progress: LoadingProgress) {
        if let Some(shared) = self.shared.upgrade() {
            shared.record_progress(self.generation, progress);
        }
    }

    async fn on_unreachable(&self, consecutive: u32, error: &HealthError) {
        if let Some(shared) = self.shared.upgrade() {
            shared.log(
                LogLevel::Warning,
                format!(
                    "Agent health endpoint unreachable for {} consecutive polls: {}",
                    consecutive, error
                ),
            );
        }
    }
}

/// Assembles a [`Supervisor`]. Anything not supplied uses the real implementation.
pub struct SupervisorBuilder {
    settings: SupervisorSettings,
    launcher: Option<Arc<dyn ProcessLauncher>>,
    probe_factory: Option<ProbeFactory>,
    preflight: Option<PreflightValidator>,
    bridge: Option<Arc<dyn RuntimeBridge>>,
}

impl SupervisorBuilder {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self {
            settings,
            launcher: None,
            probe_factory: None,
            preflight: None,
            bridge: None,
        }
    }

    pub fn launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn probe_factory(mut self, factory: ProbeFactory) -> Self {
        self.probe_factory = Some(factory);
        self
    }

    pub fn preflight(mut self, validator: PreflightValidator) -> Self {
        self.preflight = Some(validator);
        self
    }

    pub fn bridge(mut self, bridge: Arc<dyn RuntimeBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn build(self) -> Supervisor {
        let settings = self.settings;

        let launcher = self.launcher.unwrap_or_else(|| {
            let bundled_dir = settings
                .bundled_dir
                .clone()
                .or_else(|| self.bridge.as_ref().and_then(|b| b.resource_dir()));
            Arc::new(
                LocalProcessLauncher::new(settings.binary_name.clone())
                    .with_bundled_dir(bundled_dir)
                    .with_models_dir(settings.models_dir.clone())
                    .with_host(settings.host.clone()),
            )
        });

        let probe_factory = self.probe_factory.unwrap_or_else(|| {
            let host = settings.host.clone();
            let request_timeout = settings.poll_request_timeout();
            let shutdown_timeout = settings.shutdown_request_timeout();
            Arc::new(move |config: &AgentConfig| {
                Arc::new(
                    HttpHealthProbe::new(config.agent_base_url(&host), request_timeout)
                        .with_shutdown_timeout(shutdown_timeout),
                ) as Arc<dyn HealthProbe>
            })
        });

        let preflight = self
            .preflight
            .unwrap_or_else(|| PreflightValidator::standard(&settings));

        let (status, _) = watch::channel(AgentStatus::Stopped);

        Supervisor {
            shared: Arc::new(Shared {
                logs: RwLock::new(LogBuffer::new(settings.log_capacity)),
                settings,
                launcher,
                probe_factory,
                preflight,
                bridge: self.bridge,
                bus: EventBus::new(),
                status,
                lifecycle: Mutex::new(Lifecycle::default()),
                in_flight: AtomicBool::new(false),
                snapshots: RwLock::new(Snapshots::default()),
            }),
        }
    }
}

/// Owner of the agent process. Cheap to clone; clones share one instance.
#[derive(Clone)]
pub struct Supervisor {
    shared: Arc<Shared>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        SupervisorBuilder::new(settings).build()
    }

    pub fn builder(settings: SupervisorSettings) -> SupervisorBuilder {
        SupervisorBuilder::new(settings)
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.shared.settings
    }

    /// Start the agent with `config`.
    ///
    /// Returns `Ignored` unless the status is `Stopped` or `Error` and no other command is in
    /// flight. A preflight or launch failure moves the status to `Error` before the error is
    /// returned.
    pub async fn start(&self, config: AgentConfig) -> SupervisorResult<CommandOutcome> {
        self.start_with_env(config, BTreeMap::new()).await
    }

    /// [`start`](Self::start) with extra environment for the agent process.
    pub async fn start_with_env(
        &self,
        config: AgentConfig,
        env_overrides: BTreeMap<String, String>,
    ) -> SupervisorResult<CommandOutcome> {
        let shared = &self.shared;

        let Some(_in_flight) = InFlight::acquire(&shared.in_flight) else {
            debug!("Start ignored: another command is in flight");
            return Ok(CommandOutcome::Ignored);
        };
        let current = self.status();
        if !current.accepts_start() {
            debug!("Start ignored while {}", current);
            return Ok(CommandOutcome::Ignored);
        }

        shared.log(LogLevel::Info, "Running preflight checks");
        let report = shared.preflight.run(&config).await;
        for check in &report.checks {
            let (level, verdict) = if check.passed {
                (LogLevel::Info, "ok")
            } else {
                (LogLevel::Error, "FAILED")
            };
            shared.log(
                level,
                format!("Preflight [{}] {}: {}", check.name, verdict, check.message),
            );
        }

        let mut lifecycle = shared.lifecycle.lock().await;

        if let Err(e) = report.into_result() {
            shared.log(LogLevel::Error, e.to_string());
            shared.apply(&mut lifecycle, LifecycleEvent::StartFailed);
            return Err(e.into());
        }

        let spawned = match shared.launcher.launch(&config, &env_overrides).await {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("Agent launch failed: {}", e);
                shared.log(LogLevel::Error, e.to_string());
                shared.apply(&mut lifecycle, LifecycleEvent::StartFailed);
                return Err(e.into());
            }
        };

        lifecycle.generation += 1;
        let generation = lifecycle.generation;
        let handle = spawned.handle;

        shared.log(
            LogLevel::Info,
            format!(
                "Agent started (pid {}, {} binary {})",
                handle
                    .pid
                    .map(|pid| pid.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                handle.strategy,
                handle.binary.display()
            ),
        );

        *shared.snapshots.write() = Snapshots {
            generation,
            handle: Some(handle.clone()),
            ..Default::default()
        };

        let weak = Arc::downgrade(&self.shared);

        let reader = {
            let weak = weak.clone();
            let mut output = Box::pin(agent_output(spawned.stdout, spawned.stderr));
            tokio::spawn(async move {
                while let Some(item) = output.next().await {
                    let Some(shared) = weak.upgrade() else {
                        break;
                    };
                    match item {
                        OutputItem::Line(line) => {
                            shared.log(line.level, line.message);
                        }
                        OutputItem::Progress(progress) => {
                            shared.record_progress(generation, progress);
                        }
                    }
                }
                debug!("Agent output for run {} closed", generation);
            })
        };

        let (exit_tx, exited) = watch::channel(false);
        let monitor = {
            let weak = weak.clone();
            TerminationMonitor::spawn(spawned.child, move |termination| async move {
                if let Some(shared) = weak.upgrade() {
                    shared.handle_termination(generation, termination).await;
                }
                let _ = exit_tx.send(true);
            })
        };

        let probe = (shared.probe_factory)(&config);
        let poll_cancel = CancellationToken::new();
        let observer = Arc::new(RunObserver {
            shared: weak,
            generation,
            spawned_at: handle.spawned_at,
        });
        // detached; stops on poll_cancel
        let _poller = HealthPoller::new(probe.clone(), shared.settings.poll_interval())
            .with_warn_after(shared.settings.readiness_warn_after)
            .spawn(observer, poll_cancel.clone());

        lifecycle.run = Some(ActiveRun {
            generation,
            monitor: Arc::new(monitor),
            probe,
            poll_cancel,
            reader: Some(reader),
            exited,
        });
        shared.apply(&mut lifecycle, LifecycleEvent::Launched);

        Ok(CommandOutcome::Accepted)
    }

    /// Stop the agent.
    ///
    /// Asks the agent to exit via `POST /shutdown`, falling back to a terminate signal, and
    /// force-kills it if it is still alive after the shutdown timeout. Returns once the
    /// exit has been reconciled or the kill has been given up on.
    pub async fn stop(&self) -> SupervisorResult<CommandOutcome> {
        let shared = &self.shared;

        let Some(_in_flight) = InFlight::acquire(&shared.in_flight) else {
            debug!("Stop ignored: another command is in flight");
            return Ok(CommandOutcome::Ignored);
        };

        let (monitor, probe, mut exited) = {
            let mut lifecycle = shared.lifecycle.lock().await;
            let current = self.status();
            if !current.accepts_stop() {
                debug!("Stop ignored while {}", current);
                return Ok(CommandOutcome::Ignored);
            }
            let parts = match lifecycle.run.as_ref() {
                Some(run) => {
                    run.poll_cancel.cancel();
                    (run.monitor.clone(), run.probe.clone(), run.exited.clone())
                }
                None => return Ok(CommandOutcome::Ignored),
            };
            shared.apply(&mut lifecycle, LifecycleEvent::Stop);
            parts
        };

        shared.log(LogLevel::Info, "Stopping agent");

        let shutdown = tokio::time::timeout(
            shared.settings.shutdown_request_timeout(),
            probe.request_shutdown(),
        )
        .await;
        match shutdown {
            Ok(Ok(())) => debug!("Agent accepted shutdown request"),
            Ok(Err(e)) => {
                debug!("Shutdown request failed ({}), sending terminate", e);
                monitor.terminate();
            }
            Err(_) => {
                debug!("Shutdown request timed out, sending terminate");
                monitor.terminate();
            }
        }

        let limit = shared.settings.shutdown_timeout();
        if !wait_for_exit(&mut exited, limit).await {
            warn!("Agent did not exit within {:?}, killing", limit);
            shared.log(
                LogLevel::Warning,
                format!("Agent did not exit within {}s, force-killing", limit.as_secs()),
            );
            monitor.kill();

            if !wait_for_exit(&mut exited, limit).await {
                error!("Agent still running after kill");
                shared.log(LogLevel::Error, "Agent did not exit after kill");
            }
        }

        Ok(CommandOutcome::Accepted)
    }

    /// Current status.
    pub fn status(&self) -> AgentStatus {
        *self.shared.status.borrow()
    }

    /// Receiver that observes every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<AgentStatus> {
        self.shared.status.subscribe()
    }

    /// All supervisor events from now on.
    pub fn subscribe(&self) -> Subscription {
        self.shared.bus.subscribe()
    }

    pub fn event_stats(&self) -> EventBusStats {
        self.shared.bus.stats()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.shared.logs.read().snapshot()
    }

    pub fn logs_since(&self, id: u64) -> Vec<LogEntry> {
        self.shared.logs.read().since(id)
    }

    pub fn clear_logs(&self) {
        self.shared.logs.write().clear();
    }

    /// Add a supervisor-originated line to the agent log.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) -> LogEntry {
        self.shared.log(level, message)
    }

    pub fn handle(&self) -> Option<AgentProcessHandle> {
        self.shared.snapshots.read().handle.clone()
    }

    pub fn health(&self) -> Option<AgentHealth> {
        self.shared.snapshots.read().health.clone()
    }

    pub fn metrics(&self) -> Option<AgentMetrics> {
        self.shared.snapshots.read().metrics.clone()
    }

    pub fn loading_progress(&self) -> Option<LoadingProgress> {
        self.shared.snapshots.read().progress
    }
}

/// True once the run has exited (or its monitor is gone) within `limit`.
async fn wait_for_exit(exited: &mut watch::Receiver<bool>, limit: Duration) -> bool {
    tokio::time::timeout(limit, exited.wait_for(|done| *done))
        .await
        .is_ok()
}
