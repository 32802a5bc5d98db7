//! Hand-rolled fakes for the prober, signaller and spawner seams.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::BoxFuture;
use crate::probe::PortProber;
use crate::spawn::{CapturedOutput, HelperCommand, SpawnedHelper, Spawner};
use crate::terminate::{Signal, SignalError, SignalTarget, Signaller};

type SignalHook = Box<dyn Fn(SignalTarget, Signal) + Send + Sync>;
type SpawnHook = Box<dyn Fn() + Send + Sync>;

/// Scripted answers for every probe, plus call counting.
#[derive(Default)]
pub struct FakeProber {
    bound: AtomicBool,
    alive: AtomicBool,
    owner: Mutex<Option<u32>>,
    is_bound_calls: AtomicUsize,
    probe_calls: AtomicUsize,
}

impl FakeProber {
    pub fn set_bound(&self, bound: bool) {
        self.bound.store(bound, Ordering::SeqCst);
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn set_owner(&self, pid: Option<u32>) {
        *self.owner.lock().unwrap() = pid;
    }

    pub fn is_bound_calls(&self) -> usize {
        self.is_bound_calls.load(Ordering::SeqCst)
    }

    pub fn probe_calls(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }
}

impl PortProber for FakeProber {
    fn is_bound(&self, _port: u16) -> BoxFuture<'_, bool> {
        self.is_bound_calls.fetch_add(1, Ordering::SeqCst);
        let bound = self.bound.load(Ordering::SeqCst);
        Box::pin(async move { bound })
    }

    fn owner_pid(&self, _port: u16) -> BoxFuture<'_, Option<u32>> {
        let owner = *self.owner.lock().unwrap();
        Box::pin(async move { owner })
    }

    fn probe_alive<'a>(&'a self, _base_url: &'a str, _timeout: Duration) -> BoxFuture<'a, bool> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        let alive = self.alive.load(Ordering::SeqCst);
        Box::pin(async move { alive })
    }
}

/// Records every signal; can be told to fail or panic.
#[derive(Default)]
pub struct RecordingSignaller {
    sent: Mutex<Vec<(SignalTarget, Signal)>>,
    hook: Mutex<Option<SignalHook>>,
    no_such_process: AtomicBool,
    panic: AtomicBool,
}

impl RecordingSignaller {
    pub fn sent(&self) -> Vec<(SignalTarget, Signal)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn on_signal(&self, hook: impl Fn(SignalTarget, Signal) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn fail_with_no_such_process(&self) {
        self.no_such_process.store(true, Ordering::SeqCst);
    }

    pub fn panic_on_signal(&self) {
        self.panic.store(true, Ordering::SeqCst);
    }
}

impl Signaller for RecordingSignaller {
    fn signal(&self, target: SignalTarget, signal: Signal) -> Result<(), SignalError> {
        if self.panic.load(Ordering::SeqCst) {
            panic!("signaller exploded");
        }
        self.sent.lock().unwrap().push((target, signal));
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(target, signal);
        }
        if self.no_such_process.load(Ordering::SeqCst) {
            return Err(SignalError::NoSuchProcess);
        }
        Ok(())
    }
}

/// Pretends to start a helper; never creates an OS process.
#[derive(Default)]
pub struct FakeSpawner {
    spawns: AtomicUsize,
    hook: Mutex<Option<SpawnHook>>,
    output: CapturedOutput,
}

impl FakeSpawner {
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Run `hook` on every spawn, e.g. to make the fake port come up.
    pub fn on_spawn(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn output(&self) -> &CapturedOutput {
        &self.output
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, _command: &HelperCommand) -> crate::Result<SpawnedHelper> {
        let n = self.spawns.fetch_add(1, Ordering::SeqCst) as u32;
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook();
        }
        let pid = 10_000 + n;
        Ok(SpawnedHelper {
            pid,
            pgid: pid,
            child: None,
            output: self.output.clone(),
        })
    }
}
