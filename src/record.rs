//! Per-state runtime bookkeeping layered over the immutable graph.
//!
//! A record is armed under the gate when its state is entered, after which the
//! entry callback runs outside the gate. Exit may therefore race ahead of a
//! not-yet-started entry; the two signals make exit wait until the entry has
//! started and finished, and the continuation handle lets it wait for a
//! spawned entry to return.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::argument::{ArgType, Argument, Value};
use crate::controller::Controller;
use crate::error::{catch_panic, catch_panic_async, CallbackFailure, Phase};
use crate::graph::{Entry, EventId, Exit, StateId};

/// Receives every failure raised by user callbacks.
pub type ErrorSink<S> = Arc<dyn Fn(CallbackFailure<S>) + Send + Sync>;

pub(crate) fn report<S: StateId>(sink: &ErrorSink<S>, state: &S, phase: Phase, error: anyhow::Error) {
    sink(CallbackFailure {
        state: state.clone(),
        phase,
        error,
    });
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A flag that can be awaited; waiting on an already raised flag returns at once.
pub(crate) struct Signal {
    tx: watch::Sender<bool>,
}

impl Signal {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub(crate) fn raise(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn reset(&self) {
        self.tx.send_replace(false);
    }

    #[cfg(test)]
    pub(crate) fn is_raised(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once raised.
        let _ = rx.wait_for(|raised| *raised).await;
    }
}

pub(crate) struct ActivationRecord {
    active: AtomicBool,
    generation: AtomicU64,
    argument: Mutex<Argument>,
    entry_started: Signal,
    entry_finished: Signal,
    continuation: Mutex<Option<JoinHandle<()>>>,
}

impl ActivationRecord {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            argument: Mutex::new(Argument::None),
            entry_started: Signal::new(),
            entry_finished: Signal::new(),
            continuation: Mutex::new(None),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn argument(&self) -> Argument {
        lock(&self.argument).clone()
    }

    /// A value of type `ty` held by the bound argument.
    pub(crate) fn find(&self, ty: ArgType) -> Option<Value> {
        lock(&self.argument).find(ty).cloned()
    }

    /// Begin a new occupancy. Must be called with the gate held.
    ///
    /// Returns the occupancy generation controllers compare against.
    pub(crate) fn arm(&self, argument: Argument) -> u64 {
        self.entry_started.reset();
        self.entry_finished.reset();
        *lock(&self.argument) = argument;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.active.store(true, Ordering::SeqCst);
        generation
    }

    /// Mark an armed entry as done without running it.
    pub(crate) fn abandon_entry(&self) {
        self.entry_started.raise();
        self.entry_finished.raise();
    }

    /// Run the entry behavior for the current occupancy.
    ///
    /// Inline entries complete before this returns; blocking and suspending
    /// ones are spawned and their join handle kept as the continuation.
    pub(crate) fn run_entry<S: StateId, E: EventId>(
        &self,
        entry: Option<&Entry<S, E>>,
        controller: Controller<S, E>,
        sink: &ErrorSink<S>,
    ) {
        self.entry_started.raise();
        trace!(state = ?controller.state(), "entering");

        match entry {
            None => {}
            Some(Entry::Inline(f)) => {
                if let Err(e) = catch_panic(|| f(&controller)) {
                    report(sink, controller.state(), Phase::Entry, e);
                }
            }
            Some(Entry::Blocking(f)) => {
                let f = Arc::clone(f);
                let sink = Arc::clone(sink);
                let handle = tokio::task::spawn_blocking(move || {
                    if let Err(e) = catch_panic(|| f(&controller)) {
                        report(&sink, controller.state(), Phase::Entry, e);
                    }
                });
                *lock(&self.continuation) = Some(handle);
            }
            Some(Entry::Suspending(activity)) => {
                let activity = Arc::clone(activity);
                let sink = Arc::clone(sink);
                let handle = tokio::spawn(async move {
                    let state = controller.state().clone();
                    if let Err(e) = catch_panic_async(activity.run(controller)).await {
                        report(&sink, &state, Phase::Entry, e);
                    }
                });
                *lock(&self.continuation) = Some(handle);
            }
        }

        self.entry_finished.raise();
    }

    /// Leave the state once any entry still in flight has returned.
    pub(crate) async fn exit_safe<S: StateId>(
        &self,
        state: &S,
        exit: Option<&Exit>,
        sink: &ErrorSink<S>,
    ) {
        self.active.store(false, Ordering::SeqCst);
        self.entry_started.wait().await;
        self.entry_finished.wait().await;

        let continuation = lock(&self.continuation).take();
        if let Some(handle) = continuation {
            if let Err(e) = handle.await {
                trace!(state = ?state, error = %e, "entry task did not complete");
            }
        }

        let argument = std::mem::take(&mut *lock(&self.argument));
        trace!(state = ?state, "exiting");
        let result = match exit {
            None => Ok(()),
            Some(Exit::Inline(f)) => catch_panic(|| f(&argument)),
            Some(Exit::Suspending(f)) => catch_panic_async(f(argument)).await,
        };
        if let Err(e) = result {
            report(sink, state, Phase::Exit, e);
        }
    }

    #[cfg(test)]
    pub(crate) fn entry_signals(&self) -> (bool, bool) {
        (self.entry_started.is_raised(), self.entry_finished.is_raised())
    }
}
