//! Signal delivery and bounded teardown of the helper and of port owners.
//!
//! Every destructive step is followed by a bounded poll instead of assuming
//! the signal took effect. Failures here are logged and swallowed.

use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::probe::PortProber;
use crate::supervisor::ServerHandle;
use crate::wait::poll_until;

/// How hard to ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM, or `taskkill` without `/F`.
    Terminate,
    /// SIGKILL, or `taskkill /F`.
    Kill,
}

/// Who receives the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalTarget {
    Process(u32),
    /// Every member of the process group led by this id.
    Group(u32),
}

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("no such process")]
    NoSuchProcess,
    #[error("signal delivery failed: {0}")]
    Failed(String),
    #[error("could not run signal command: {0}")]
    Io(#[from] std::io::Error),
}

/// Delivers signals to processes and process groups.
pub trait Signaller: Send + Sync {
    fn signal(&self, target: SignalTarget, signal: Signal) -> Result<(), SignalError>;
}

/// Uses the system `kill` (Unix) or `taskkill` (Windows) command.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSignaller;

impl Signaller for SystemSignaller {
    fn signal(&self, target: SignalTarget, signal: Signal) -> Result<(), SignalError> {
        let (program, args) = signal_command(target, signal);
        let output = Command::new(program).args(&args).output()?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_no_such_process(&stderr) {
            Err(SignalError::NoSuchProcess)
        } else {
            Err(SignalError::Failed(stderr))
        }
    }
}

/// Program and arguments delivering `signal` to `target` on this platform.
pub fn signal_command(target: SignalTarget, signal: Signal) -> (&'static str, Vec<String>) {
    if cfg!(windows) {
        let mut args = match target {
            SignalTarget::Process(pid) => vec!["/PID".to_string(), pid.to_string()],
            SignalTarget::Group(pgid) => vec!["/PID".to_string(), pgid.to_string(), "/T".to_string()],
        };
        if signal == Signal::Kill {
            args.push("/F".to_string());
        }
        ("taskkill", args)
    } else {
        let name = match signal {
            Signal::Terminate => "TERM",
            Signal::Kill => "KILL",
        };
        let mut args = vec!["-s".to_string(), name.to_string()];
        match target {
            SignalTarget::Process(pid) => args.push(pid.to_string()),
            SignalTarget::Group(pgid) => {
                args.push("--".to_string());
                args.push(format!("-{pgid}"));
            }
        }
        ("kill", args)
    }
}

fn is_no_such_process(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such process") || lower.contains("not found")
}

/// Graceful-then-forceful teardown, bounded by explicit patience budgets.
#[derive(Clone)]
pub struct Terminator {
    prober: Arc<dyn PortProber>,
    signaller: Arc<dyn Signaller>,
}

impl Terminator {
    pub fn new(prober: Arc<dyn PortProber>, signaller: Arc<dyn Signaller>) -> Self {
        Self { prober, signaller }
    }

    /// Deliver a signal, treating "already gone" as success.
    ///
    /// The signaller may block (it runs `kill`/`taskkill`), so it is called
    /// on the blocking pool.
    pub async fn send(&self, target: SignalTarget, signal: Signal) {
        let signaller = self.signaller.clone();
        let outcome = tokio::task::spawn_blocking(move || signaller.signal(target, signal)).await;
        match outcome {
            Ok(Ok(())) => tracing::debug!(?target, ?signal, "signal delivered"),
            Ok(Err(SignalError::NoSuchProcess)) => {
                tracing::debug!(?target, ?signal, "target already gone")
            }
            Ok(Err(e)) => tracing::warn!(?target, ?signal, error = %e, "signal delivery failed"),
            Err(e) => tracing::warn!(?target, ?signal, error = %e, "signal task failed"),
        }
    }

    /// Terminate the helper's whole process group.
    ///
    /// The group gets `grace` to exit after the terminate signal; if the
    /// direct child is still alive after that, the group is killed and the
    /// child reaped.
    pub async fn terminate_group(
        &self,
        handle: &mut ServerHandle,
        grace: Duration,
        poll_interval: Duration,
    ) {
        self.send(SignalTarget::Group(handle.pgid), Signal::Terminate).await;

        let Some(child) = handle.child.as_mut() else {
            return;
        };
        let exited = poll_until(
            || std::future::ready(matches!(child.try_wait(), Ok(Some(_)))),
            grace,
            poll_interval,
        )
        .await;
        if exited {
            tracing::debug!(pid = handle.pid, "helper exited after terminate");
            return;
        }

        tracing::warn!(
            pid = handle.pid,
            grace_ms = grace.as_millis() as u64,
            "helper ignored terminate, killing process group"
        );
        self.send(SignalTarget::Group(handle.pgid), Signal::Kill).await;
        let _ = child.start_kill();
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            tracing::warn!(pid = handle.pid, "helper not reaped after kill");
        }
    }

    /// Kill the helper's group outright, without a grace period.
    ///
    /// Waits at most `reap_within` for the direct child to be reaped.
    pub async fn kill_group(&self, handle: &mut ServerHandle, reap_within: Duration) {
        self.send(SignalTarget::Group(handle.pgid), Signal::Kill).await;
        let Some(child) = handle.child.as_mut() else {
            return;
        };
        let _ = child.start_kill();
        if tokio::time::timeout(reap_within, child.wait()).await.is_err() {
            tracing::debug!(pid = handle.pid, "helper not reaped yet after kill");
        }
    }

    /// Signal whatever process holds `port` and wait up to `patience` for
    /// the port to lose its owner.
    ///
    /// Running out of patience is not an error; callers must re-check the
    /// port before relying on it being free.
    pub async fn kill_port_owner(&self, port: u16, patience: Duration, poll_interval: Duration) {
        let Some(pid) = self.prober.owner_pid(port).await else {
            return;
        };
        tracing::info!(port, pid, "signalling process holding the port");
        self.send(SignalTarget::Process(pid), Signal::Terminate).await;

        let prober = &self.prober;
        let freed = poll_until(
            move || async move { prober.owner_pid(port).await.is_none() },
            patience,
            poll_interval,
        )
        .await;
        if freed {
            tracing::debug!(port, pid, "port released");
        } else {
            tracing::warn!(
                port,
                pid,
                patience_ms = patience.as_millis() as u64,
                "port still owned after patience ran out"
            );
        }
    }
}
