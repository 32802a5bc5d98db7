//! Lifecycle of the single helper process owned by this program.
//!
//! `NOT_RUNNING -> STARTING -> READY`, and back to `NOT_RUNNING` on stop or
//! when a tracked helper is found dead. At most one [`ServerHandle`] exists
//! per supervisor. Overlapping `ensure_ready`/`stop` calls must be
//! serialized by the owner (`&mut self` enforces this within one task).

use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Child;
use tokio::time::Instant;

use crate::preflight;
use crate::probe::{LocalProber, PortProber};
use crate::spawn::{CapturedOutput, HelperCommand, ProcessSpawner, SpawnedHelper, Spawner};
use crate::terminate::{Signal, SignalTarget, Signaller, SystemSignaller, Terminator};
use crate::wait::poll_until;
use crate::{Result, TranslatorConfig, TranslatorError};

/// Derived, never stored: a bound port alone does not mean the service
/// above it is answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    NotRunning,
    Starting,
    Ready,
}

/// The helper process currently owned by a [`Supervisor`].
#[derive(Debug)]
pub struct ServerHandle {
    pub(crate) pid: u32,
    pub(crate) pgid: u32,
    pub(crate) port: u16,
    pub(crate) child: Option<Child>,
    output: CapturedOutput,
}

impl ServerHandle {
    fn from_spawned(spawned: SpawnedHelper, port: u16) -> Self {
        Self {
            pid: spawned.pid,
            pgid: spawned.pgid,
            port,
            child: spawned.child,
            output: spawned.output,
        }
    }

    /// A handle with no OS child attached.
    #[cfg(test)]
    pub(crate) fn detached(pid: u32, pgid: u32, port: u16) -> Self {
        Self {
            pid,
            pgid,
            port,
            child: None,
            output: CapturedOutput::default(),
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pgid(&self) -> u32 {
        self.pgid
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Output captured from the helper so far.
    pub fn output(&self) -> &CapturedOutput {
        &self.output
    }

    /// Whether the direct child is known to have exited. Handles without an
    /// OS child never report exit.
    pub fn has_exited(&mut self) -> bool {
        self.child
            .as_mut()
            .is_some_and(|child| !matches!(child.try_wait(), Ok(None)))
    }
}

/// Starts, watches and stops the translation-server helper.
///
/// Dropping the supervisor signals a still-tracked helper group; this is
/// the safety net for abnormal exits, not the normal way to stop.
pub struct Supervisor {
    config: TranslatorConfig,
    prober: Arc<dyn PortProber>,
    signaller: Arc<dyn Signaller>,
    spawner: Arc<dyn Spawner>,
    terminator: Terminator,
    handle: Option<ServerHandle>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .field("handle", &self.handle)
            .finish()
    }
}

impl Supervisor {
    /// A supervisor using the real prober, `kill`/`taskkill` and process spawner.
    pub fn new(config: TranslatorConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(LocalProber::default()),
            Arc::new(SystemSignaller),
            Arc::new(ProcessSpawner),
        )
    }

    /// Build from explicit collaborators.
    pub fn with_parts(
        config: TranslatorConfig,
        prober: Arc<dyn PortProber>,
        signaller: Arc<dyn Signaller>,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        let terminator = Terminator::new(prober.clone(), signaller.clone());
        Self {
            config,
            prober,
            signaller,
            spawner,
            terminator,
            handle: None,
        }
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    pub fn handle(&self) -> Option<&ServerHandle> {
        self.handle.as_ref()
    }

    pub fn terminator(&self) -> &Terminator {
        &self.terminator
    }

    /// Combine "port bound" and "ping answered" into a state.
    ///
    /// A tracked helper whose process has already exited counts as not
    /// running.
    pub async fn readiness(&mut self) -> ReadinessState {
        let port = self.config.port;
        if self.prober.is_bound(port).await
            && self
                .prober
                .probe_alive(&self.config.base_url(), self.config.probe_timeout)
                .await
        {
            return ReadinessState::Ready;
        }
        match self.handle.as_mut() {
            Some(handle) => {
                if !handle.has_exited() {
                    ReadinessState::Starting
                } else {
                    ReadinessState::NotRunning
                }
            }
            None => ReadinessState::NotRunning,
        }
    }

    /// [`ensure_ready_within`](Self::ensure_ready_within) with the configured budgets.
    pub async fn ensure_ready(&mut self) -> Result<()> {
        let patience = self.config.startup_patience;
        let poll_interval = self.config.poll_interval;
        self.ensure_ready_within(patience, poll_interval).await
    }

    /// Make sure a helper is listening on the configured port.
    ///
    /// A bound port short-circuits (no second helper is spawned). Otherwise
    /// any stale port owner is signalled, a new helper is spawned and polled
    /// until its port is bound and its ping answers. On timeout the helper is
    /// torn down and its captured output returned in the error.
    pub async fn ensure_ready_within(
        &mut self,
        patience: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        let port = self.config.port;
        if self.prober.is_bound(port).await {
            tracing::debug!(port, "translation server already listening");
            return Ok(());
        }

        if let Some(mut stale) = self.handle.take() {
            tracing::warn!(
                pid = stale.pid,
                port,
                "tracked translation server stopped listening, tearing it down"
            );
            self.terminator
                .terminate_group(&mut stale, self.config.termination_grace, poll_interval)
                .await;
        }

        if self.config.check_node {
            let (min, max) = (self.config.node_min_major, self.config.node_max_major);
            let server_dir = self.config.server_dir.clone();
            tokio::task::spawn_blocking(move || {
                preflight::check_node_version(min, max)?;
                preflight::check_server_dir(&server_dir)
            })
            .await
            .map_err(|e| TranslatorError::Preflight(format!("preflight task failed: {e}")))??;
        }

        self.terminator
            .kill_port_owner(port, self.config.kill_patience, poll_interval)
            .await;

        let command = HelperCommand::from_config(&self.config)?;
        let spawned = self.spawner.spawn(&command)?;
        let pid = spawned.pid;
        self.handle = Some(ServerHandle::from_spawned(spawned, port));

        let start = Instant::now();
        let deadline = start + patience;
        let prober = self.prober.clone();
        let base_url = self.config.base_url();
        let probe_timeout = self.config.probe_timeout;
        let ready = poll_until(
            || {
                let prober = prober.clone();
                let base_url = base_url.clone();
                async move {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if !prober.is_bound(port).await {
                        return false;
                    }
                    if remaining.is_zero() {
                        return false;
                    }
                    prober
                        .probe_alive(&base_url, probe_timeout.min(remaining))
                        .await
                }
            },
            patience,
            poll_interval,
        )
        .await;

        if ready {
            tracing::info!(
                pid,
                port,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "translation server ready"
            );
            return Ok(());
        }

        let (stdout, stderr) = self
            .handle
            .as_ref()
            .map(|h| (h.output.stdout(), h.output.stderr()))
            .unwrap_or_default();
        tracing::warn!(
            pid,
            port,
            patience_ms = patience.as_millis() as u64,
            "translation server did not become ready"
        );
        // Killed outright so the error lands within the patience budget.
        if let Some(mut handle) = self.handle.take() {
            self.terminator.kill_group(&mut handle, poll_interval).await;
        }
        Err(TranslatorError::StartupTimeout {
            port,
            patience,
            stdout,
            stderr,
        })
    }

    /// Stop the tracked helper; a no-op when nothing is tracked.
    ///
    /// Terminates the helper's process group, then clears whatever still
    /// owns the port (a descendant that escaped the group).
    pub async fn stop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        tracing::info!(pid = handle.pid, port = handle.port, "stopping translation server");
        let poll_interval = self.config.poll_interval;
        self.terminator
            .terminate_group(&mut handle, self.config.termination_grace, poll_interval)
            .await;
        self.terminator
            .kill_port_owner(handle.port, self.config.kill_patience, poll_interval)
            .await;
    }

    /// Ensure readiness and return a guard that tears the helper down when
    /// the scope ends.
    pub async fn ready_scope(&mut self) -> Result<ReadyGuard<'_>> {
        self.ensure_ready().await?;
        Ok(ReadyGuard { supervisor: self })
    }

    /// Synchronous best-effort teardown for drop paths. Never panics.
    fn stop_now(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        let signaller = self.signaller.clone();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            if let Err(e) = signaller.signal(SignalTarget::Group(handle.pgid), Signal::Terminate) {
                tracing::debug!(pgid = handle.pgid, error = %e, "terminate on drop failed");
            }
            if let Some(child) = handle.child.as_mut() {
                let _ = child.start_kill();
            }
        }));
        if outcome.is_err() {
            tracing::warn!(pid = handle.pid, "teardown on drop panicked, ignoring");
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.stop_now();
    }
}

/// Scope in which the helper is ready. Call [`release`](Self::release) for
/// an orderly stop; dropping the guard falls back to an immediate teardown.
pub struct ReadyGuard<'a> {
    supervisor: &'a mut Supervisor,
}

impl ReadyGuard<'_> {
    pub async fn release(self) {
        self.supervisor.stop().await;
    }
}

impl Deref for ReadyGuard<'_> {
    type Target = Supervisor;

    fn deref(&self) -> &Supervisor {
        self.supervisor
    }
}

impl DerefMut for ReadyGuard<'_> {
    fn deref_mut(&mut self) -> &mut Supervisor {
        self.supervisor
    }
}

impl Drop for ReadyGuard<'_> {
    fn drop(&mut self) {
        self.supervisor.stop_now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{FakeProber, FakeSpawner, RecordingSignaller};
    use std::sync::Mutex;

    struct Rig {
        prober: Arc<FakeProber>,
        signaller: Arc<RecordingSignaller>,
        spawner: Arc<FakeSpawner>,
        supervisor: Supervisor,
    }

    fn rig() -> Rig {
        let prober = Arc::new(FakeProber::default());
        let signaller = Arc::new(RecordingSignaller::default());
        let spawner = Arc::new(FakeSpawner::default());
        let config = TranslatorConfig {
            startup_patience: Duration::from_millis(500),
            poll_interval: Duration::from_millis(10),
            kill_patience: Duration::from_millis(100),
            termination_grace: Duration::from_millis(50),
            ..TranslatorConfig::default()
        };
        let supervisor =
            Supervisor::with_parts(config, prober.clone(), signaller.clone(), spawner.clone());
        Rig {
            prober,
            signaller,
            spawner,
            supervisor,
        }
    }

    /// Spawning makes the fake port come up and answer.
    fn helper_comes_up(rig: &Rig) {
        let prober = rig.prober.clone();
        rig.spawner.on_spawn(move || {
            prober.set_bound(true);
            prober.set_alive(true);
        });
    }

    #[tokio::test]
    async fn ensure_ready_spawns_once() {
        let mut rig = rig();
        helper_comes_up(&rig);

        rig.supervisor.ensure_ready().await.unwrap();
        let checks_before = rig.prober.is_bound_calls();
        rig.supervisor.ensure_ready().await.unwrap();

        // The second call is a single bound-port check and nothing else.
        assert_eq!(rig.prober.is_bound_calls(), checks_before + 1);
        assert_eq!(rig.spawner.spawn_count(), 1);
        assert_eq!(rig.supervisor.handle().map(|h| h.pid()), Some(10_000));
        assert_eq!(rig.supervisor.readiness().await, ReadinessState::Ready);
    }

    #[tokio::test]
    async fn already_listening_port_is_not_respawned() {
        let mut rig = rig();
        rig.prober.set_bound(true);

        rig.supervisor.ensure_ready().await.unwrap();

        assert_eq!(rig.spawner.spawn_count(), 0);
        assert!(rig.supervisor.handle().is_none());
        assert!(rig.signaller.sent().is_empty());
    }

    #[tokio::test]
    async fn bound_but_silent_helper_times_out() {
        let mut rig = rig();
        let prober = rig.prober.clone();
        rig.spawner.on_spawn(move || prober.set_bound(true));
        rig.spawner.output().push_stderr(b"translator failed to load");

        let err = rig
            .supervisor
            .ensure_ready_within(Duration::from_millis(200), Duration::from_millis(50))
            .await
            .unwrap_err();

        match err {
            TranslatorError::StartupTimeout { port, stderr, .. } => {
                assert_eq!(port, 1969);
                assert!(stderr.contains("translator failed to load"));
            }
            other => panic!("expected StartupTimeout, got {other:?}"),
        }
        assert!(rig.prober.probe_calls() > 0);
        // The failed helper is killed outright, not asked politely.
        assert!(rig.supervisor.handle().is_none());
        assert_eq!(
            rig.signaller.sent(),
            vec![(SignalTarget::Group(10_000), Signal::Kill)]
        );
    }

    #[tokio::test]
    async fn startup_timeout_respects_patience() {
        let mut rig = rig();

        let start = std::time::Instant::now();
        let result = rig
            .supervisor
            .ensure_ready_within(Duration::from_millis(200), Duration::from_millis(50))
            .await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(TranslatorError::StartupTimeout { .. })));
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "{elapsed:?}");
    }

    #[tokio::test]
    async fn stale_owner_is_signalled_before_spawn() {
        let mut rig = rig();
        rig.prober.set_owner(Some(777));
        let prober = rig.prober.clone();
        rig.signaller.on_signal(move |target, _| {
            if target == SignalTarget::Process(777) {
                prober.set_owner(None);
            }
        });
        let seen_at_spawn = Arc::new(Mutex::new(Vec::new()));
        {
            let prober = rig.prober.clone();
            let signaller = rig.signaller.clone();
            let seen_at_spawn = seen_at_spawn.clone();
            rig.spawner.on_spawn(move || {
                *seen_at_spawn.lock().unwrap() = signaller.sent();
                prober.set_bound(true);
                prober.set_alive(true);
            });
        }

        rig.supervisor.ensure_ready().await.unwrap();

        assert_eq!(
            *seen_at_spawn.lock().unwrap(),
            vec![(SignalTarget::Process(777), Signal::Terminate)]
        );
        assert_eq!(rig.spawner.spawn_count(), 1);
    }

    #[tokio::test]
    async fn stop_without_handle_sends_nothing() {
        let mut rig = rig();
        rig.supervisor.stop().await;
        rig.supervisor.stop().await;
        assert!(rig.signaller.sent().is_empty());
    }

    #[tokio::test]
    async fn stop_terminates_group_and_clears_handle() {
        let mut rig = rig();
        helper_comes_up(&rig);
        rig.supervisor.ensure_ready().await.unwrap();

        rig.prober.set_bound(false);
        rig.prober.set_alive(false);
        rig.supervisor.stop().await;

        assert!(rig.supervisor.handle().is_none());
        assert_eq!(
            rig.signaller.sent(),
            vec![(SignalTarget::Group(10_000), Signal::Terminate)]
        );
        assert_eq!(rig.supervisor.readiness().await, ReadinessState::NotRunning);
    }

    #[tokio::test]
    async fn stop_clears_leftover_port_owner() {
        let mut rig = rig();
        helper_comes_up(&rig);
        rig.supervisor.ensure_ready().await.unwrap();

        // A reparented worker still holds the port after the group signal.
        rig.prober.set_owner(Some(5555));
        let prober = rig.prober.clone();
        rig.signaller.on_signal(move |target, _| {
            if target == SignalTarget::Process(5555) {
                prober.set_owner(None);
            }
        });
        rig.supervisor.stop().await;

        assert_eq!(
            rig.signaller.sent(),
            vec![
                (SignalTarget::Group(10_000), Signal::Terminate),
                (SignalTarget::Process(5555), Signal::Terminate),
            ]
        );
    }

    #[tokio::test]
    async fn dead_tracked_helper_is_replaced() {
        let mut rig = rig();
        helper_comes_up(&rig);
        rig.supervisor.ensure_ready().await.unwrap();

        // The helper died on its own.
        rig.prober.set_bound(false);
        rig.prober.set_alive(false);
        rig.supervisor.ensure_ready().await.unwrap();

        assert_eq!(rig.spawner.spawn_count(), 2);
        assert_eq!(rig.supervisor.handle().map(|h| h.pid()), Some(10_001));
        assert!(
            rig.signaller
                .sent()
                .contains(&(SignalTarget::Group(10_000), Signal::Terminate))
        );
    }

    #[tokio::test]
    async fn readiness_reports_starting_while_tracked_but_silent() {
        let mut rig = rig();
        helper_comes_up(&rig);
        rig.supervisor.ensure_ready().await.unwrap();
        rig.prober.set_alive(false);
        assert_eq!(rig.supervisor.readiness().await, ReadinessState::Starting);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn readiness_reports_not_running_once_the_child_exited() {
        let mut rig = rig();
        let mut child = tokio::process::Command::new("true").spawn().unwrap();
        child.wait().await.unwrap();
        let mut handle = ServerHandle::detached(20_000, 20_000, 1969);
        handle.child = Some(child);
        rig.supervisor.handle = Some(handle);

        assert_eq!(rig.supervisor.readiness().await, ReadinessState::NotRunning);
    }

    #[tokio::test]
    async fn drop_with_panicking_signaller_does_not_propagate() {
        let mut rig = rig();
        helper_comes_up(&rig);
        rig.supervisor.ensure_ready().await.unwrap();
        rig.signaller.panic_on_signal();

        let Rig { supervisor, .. } = rig;
        drop(supervisor);
    }

    #[tokio::test]
    async fn dropping_the_supervisor_signals_the_group() {
        let mut rig = rig();
        helper_comes_up(&rig);
        rig.supervisor.ensure_ready().await.unwrap();

        let Rig {
            supervisor,
            signaller,
            ..
        } = rig;
        drop(supervisor);
        assert_eq!(
            signaller.sent(),
            vec![(SignalTarget::Group(10_000), Signal::Terminate)]
        );
    }

    #[tokio::test]
    async fn ready_scope_tears_down_on_drop_and_release() {
        let mut rig = rig();
        helper_comes_up(&rig);

        {
            let guard = rig.supervisor.ready_scope().await.unwrap();
            assert!(guard.handle().is_some());
        }
        assert!(rig.supervisor.handle().is_none());
        assert_eq!(rig.signaller.sent().len(), 1);

        rig.prober.set_bound(false);
        let guard = rig.supervisor.ready_scope().await.unwrap();
        guard.release().await;
        assert!(rig.supervisor.handle().is_none());
        assert_eq!(rig.signaller.sent().len(), 2);
    }

    #[tokio::test]
    async fn spawn_failure_leaves_nothing_tracked() {
        let prober = Arc::new(FakeProber::default());
        let signaller = Arc::new(RecordingSignaller::default());
        let config = TranslatorConfig {
            command: vec!["definitely-not-a-real-translation-server".into()],
            server_dir: std::env::temp_dir(),
            kill_patience: Duration::from_millis(50),
            ..TranslatorConfig::default()
        };
        let mut supervisor =
            Supervisor::with_parts(config, prober, signaller, Arc::new(ProcessSpawner));

        let err = supervisor.ensure_ready().await.unwrap_err();
        assert!(matches!(err, TranslatorError::Spawn { .. }));
        assert!(supervisor.handle().is_none());
    }
}
