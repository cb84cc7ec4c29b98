//! Transition coordinator for hierarchical state machines whose states carry
//! typed arguments.
//!
//! # Protocol
//! Every transition runs in two phases:
//! 1. [`StateMachine::prepare`] takes the gate, finds the transition by walking
//!    from the active leaf to the root, computes the least common ancestor of
//!    the leaf and the target, and resolves an argument for every state that
//!    will be entered. The gate stays held in the returned [`Prepared`].
//! 2. [`StateMachine::perform`] exits the old states child-first, runs the
//!    transition action, arms the new states, releases the gate and only then
//!    runs their entry behavior parent-first.
//!
//! Because entry behavior runs outside the gate, a later transition may try to
//! exit a state whose entry has not started or is still running. Exit waits for
//! that entry (see the activation record), which is the backpressure that keeps
//! long-running entries interruptible without a cancel primitive.
//!
//! The exit, action and arming part of a transition runs on its own task, so
//! dropping the future of a raise never leaves the active chain half exited.
//! Entry steps are handed back to the caller; if it is gone they run on that
//! task instead.
//!
//! # Errors
//! Raising returns [`TransitionError`] when arguments cannot be resolved.
//! Failures inside user callbacks never reach the caller; they go to the error
//! sink configured on the builder.
//!
//! # See Also
//! - [`StateMachineBuilder`](crate::StateMachineBuilder): declares the graph.
//! - [`Controller`]: handed to entry behavior.

use std::fmt;
use std::sync::{Arc, OnceLock, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tracing::{debug, error, warn};

use anyhow::anyhow;

use crate::argument::{Argument, Supplied};
use crate::controller::Controller;
use crate::error::{catch_panic, CallbackFailure, Phase, TransitionError, TransitionResult};
use crate::graph::{ActionFn, Entry, EventId, SelectorFn, StateGraph, StateId, Target};
use crate::record::{report, ActivationRecord, ErrorSink};
use crate::resolver::{Bindings, Resolver};

/// Result of raising an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<S> {
    /// The active leaf moved
    Transitioned {
        /// Previous leaf; `None` for the start-up transition
        from: Option<S>,
        /// New leaf
        to: S,
    },
    /// A transition targeting its own defining state ran its action only
    Reentered(S),
    /// Neither the active leaf nor any ancestor handles the event
    Unhandled,
}

impl<S> Outcome<S> {
    /// Whether a transition was found
    pub fn is_handled(&self) -> bool {
        !matches!(self, Outcome::Unhandled)
    }
}

/// One state on the active chain, as exposed for persistence.
#[derive(Debug, Clone)]
pub struct ActiveState<S> {
    /// State id
    pub id: S,
    /// Argument bound to the state
    pub argument: Argument,
}

/// The gate-protected part of the machine.
pub(crate) struct Cursor {
    leaf: Option<usize>,
}

pub(crate) struct Core<S: StateId, E: EventId> {
    graph: StateGraph<S, E>,
    records: Vec<Arc<ActivationRecord>>,
    gate: Arc<Mutex<Cursor>>,
    published: RwLock<Option<usize>>,
    sink: ErrorSink<S>,
    initial_argument: Supplied,
    runtime: OnceLock<Handle>,
}

/// A decided transition still holding the gate.
///
/// Dropping it without calling [`StateMachine::perform`] releases the gate and
/// abandons the transition.
pub struct Prepared<S: StateId, E: EventId> {
    core: Arc<Core<S, E>>,
    gate: OwnedMutexGuard<Cursor>,
    from: Option<usize>,
    source: usize,
    target: usize,
    lca: Option<usize>,
    reentrant: bool,
    bindings: Bindings,
    action: Option<(ActionFn, Argument)>,
}

impl<S: StateId, E: EventId> Prepared<S, E> {
    /// State that defines the transition
    pub fn source(&self) -> &S {
        &self.core.graph.node(self.source).id
    }

    /// State that becomes the active leaf
    pub fn target(&self) -> &S {
        &self.core.graph.node(self.target).id
    }

    /// Deepest state that stays active across the transition
    pub fn common_ancestor(&self) -> Option<&S> {
        self.lca.map(|ix| &self.core.graph.node(ix).id)
    }

    /// Whether only the action runs
    pub fn is_reentrant(&self) -> bool {
        self.reentrant
    }

    async fn perform(self) -> Outcome<S> {
        if self.reentrant {
            let Prepared {
                core,
                gate,
                source,
                action,
                ..
            } = self;
            core.run_action(source, action);
            drop(gate);
            return Outcome::Reentered(core.graph.node(source).id.clone());
        }

        let (tx, rx) = oneshot::channel();
        let worker = tokio::spawn(async move {
            let (steps, outcome) = self.exit_and_arm().await;
            if let Err((steps, _)) = tx.send((steps, outcome)) {
                run_steps(steps);
            }
        });

        match rx.await {
            Ok((steps, outcome)) => {
                run_steps(steps);
                outcome
            }
            // The worker only drops its sender by unwinding.
            Err(_) => match worker.await {
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                _ => unreachable!("transition worker ended without a result"),
            },
        }
    }

    /// Exit down to the common ancestor, run the action and arm the new
    /// states, releasing the gate last.
    async fn exit_and_arm(self) -> (Vec<EnterStep<S, E>>, Outcome<S>) {
        let Prepared {
            core,
            mut gate,
            from,
            source,
            target,
            lca,
            bindings,
            action,
            ..
        } = self;
        let graph = &core.graph;

        if let Some(from) = from {
            for ix in graph.path(from, lca) {
                let node = graph.node(ix);
                core.records[ix]
                    .exit_safe(&node.id, node.exit.as_ref(), &core.sink)
                    .await;
            }
        }

        core.run_action(source, action);

        gate.leaf = Some(target);
        core.publish(Some(target));
        let steps: Vec<EnterStep<S, E>> = bindings
            .into_iter()
            .map(|(ix, argument)| core.arm(ix, argument))
            .collect();
        drop(gate);

        let outcome = Outcome::Transitioned {
            from: from.map(|ix| graph.node(ix).id.clone()),
            to: graph.node(target).id.clone(),
        };
        (steps, outcome)
    }
}

/// Run armed entries, ancestors first.
fn run_steps<S: StateId, E: EventId>(steps: Vec<EnterStep<S, E>>) {
    for step in steps.into_iter().rev() {
        step.run();
    }
}

impl<S: StateId, E: EventId> fmt::Debug for Prepared<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prepared")
            .field("source", self.source())
            .field("target", self.target())
            .field("common_ancestor", &self.common_ancestor())
            .field("reentrant", &self.reentrant)
            .finish()
    }
}

/// Deferred entry of one armed state.
///
/// Dropped without running (its task was torn down), it still marks the entry
/// as started and finished so the state can be exited later.
struct EnterStep<S: StateId, E: EventId> {
    record: Arc<ActivationRecord>,
    entry: Option<Entry<S, E>>,
    controller: Option<Controller<S, E>>,
    sink: ErrorSink<S>,
}

impl<S: StateId, E: EventId> EnterStep<S, E> {
    fn run(mut self) {
        if let Some(controller) = self.controller.take() {
            self.record
                .run_entry(self.entry.as_ref(), controller, &self.sink);
        }
    }
}

impl<S: StateId, E: EventId> Drop for EnterStep<S, E> {
    fn drop(&mut self) {
        if self.controller.is_some() {
            self.record.abandon_entry();
        }
    }
}

/// A dynamic selector already evaluated for the state defining the transition.
#[derive(Clone, Copy)]
struct Selection {
    source: usize,
    target: Option<usize>,
}

pub(crate) fn default_sink<S: StateId>() -> ErrorSink<S> {
    Arc::new(|failure: CallbackFailure<S>| {
        error!(
            state = ?failure.state,
            phase = %failure.phase,
            error = %format!("{:#}", failure.error),
            "state machine callback failed"
        );
    })
}

impl<S: StateId, E: EventId> Core<S, E> {
    fn leaf(&self) -> Option<usize> {
        *self
            .published
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, leaf: Option<usize>) {
        *self
            .published
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = leaf;
    }

    async fn prepare(
        self: &Arc<Self>,
        event: &E,
        supplied: &Supplied,
        selection: Option<Selection>,
    ) -> TransitionResult<Option<Prepared<S, E>>, S> {
        let gate = Arc::clone(&self.gate).lock_owned().await;
        let leaf = gate.leaf.ok_or(TransitionError::NotStarted)?;

        let Some((source, transition)) = self.graph.find_transition(leaf, event) else {
            debug!(?event, state = ?self.graph.node(leaf).id, "no transition for event");
            return Ok(None);
        };

        let target = match &transition.target {
            Target::Static(ix) => *ix,
            Target::Dynamic(select) => {
                let chosen = match selection {
                    Some(selection) if selection.source == source => selection.target,
                    _ => self.select(source, select),
                };
                match chosen {
                    Some(ix) => ix,
                    None => {
                        debug!(?event, state = ?self.graph.node(source).id, "selector chose no target");
                        return Ok(None);
                    }
                }
            }
        };
        let reentrant = target == source;
        let lca = self.graph.common_ancestor(Some(leaf), target);

        let mut resolver = Resolver::new(&self.graph, &self.records, supplied, Some(leaf));
        let action = match &transition.action {
            Some(action) => Some((
                Arc::clone(&action.run),
                resolver.resolve(source, action.spec)?,
            )),
            None => None,
        };
        let bindings = if reentrant {
            Vec::new()
        } else {
            resolver.bind_path(&self.graph.path(target, lca))?
        };
        resolver.finish()?;

        debug!(
            ?event,
            from = ?self.graph.node(leaf).id,
            to = ?self.graph.node(target).id,
            reentrant,
            "transition decided"
        );

        Ok(Some(Prepared {
            core: Arc::clone(self),
            gate,
            from: Some(leaf),
            source,
            target,
            lca,
            reentrant,
            bindings,
            action,
        }))
    }

    fn select(&self, source: usize, select: &SelectorFn<S>) -> Option<usize> {
        let state = &self.graph.node(source).id;
        match catch_panic(|| select()) {
            Ok(Some(id)) => match self.graph.index_of(&id) {
                Some(ix) => Some(ix),
                None => {
                    report(
                        &self.sink,
                        state,
                        Phase::Selector,
                        anyhow!("selected undeclared state {id:?}"),
                    );
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                report(&self.sink, state, Phase::Selector, e);
                None
            }
        }
    }

    fn run_action(&self, source: usize, action: Option<(ActionFn, Argument)>) {
        if let Some((run, argument)) = action {
            if let Err(e) = catch_panic(|| run(&argument)) {
                report(&self.sink, &self.graph.node(source).id, Phase::Action, e);
            }
        }
    }

    /// Begin the occupancy of `ix`. Called with the gate held.
    fn arm(self: &Arc<Self>, ix: usize, argument: Argument) -> EnterStep<S, E> {
        let node = self.graph.node(ix);
        let record = Arc::clone(&self.records[ix]);
        let generation = record.arm(argument.clone());
        let controller = Controller::new(
            node.id.clone(),
            argument,
            generation,
            Arc::clone(&record),
            Arc::downgrade(self),
        );
        EnterStep {
            record,
            entry: node.entry.clone(),
            controller: Some(controller),
            sink: Arc::clone(&self.sink),
        }
    }

    /// A transition from the virtual root into `target`.
    fn from_root(
        self: &Arc<Self>,
        gate: OwnedMutexGuard<Cursor>,
        target: usize,
        bindings: Bindings,
    ) -> Prepared<S, E> {
        Prepared {
            core: Arc::clone(self),
            gate,
            from: None,
            source: target,
            target,
            lca: None,
            reentrant: false,
            bindings,
            action: None,
        }
    }

    async fn fire(
        self: &Arc<Self>,
        event: &E,
        supplied: &Supplied,
        selection: Option<Selection>,
    ) -> TransitionResult<Outcome<S>, S> {
        match self.prepare(event, supplied, selection).await? {
            Some(prepared) => Ok(prepared.perform().await),
            None => Ok(Outcome::Unhandled),
        }
    }

    /// Decide `event` against the published leaf without taking the gate.
    ///
    /// A dynamic target is selected here and handed on, so its selector runs
    /// once and a selector choosing nothing means nothing was found.
    fn peek(&self, event: &E) -> (bool, Option<Selection>) {
        let Some((source, transition)) = self
            .leaf()
            .and_then(|leaf| self.graph.find_transition(leaf, event))
        else {
            return (false, None);
        };
        match &transition.target {
            Target::Static(_) => (true, None),
            Target::Dynamic(select) => {
                let target = self.select(source, select);
                (target.is_some(), Some(Selection { source, target }))
            }
        }
    }

    pub(crate) fn raise_detached(self: &Arc<Self>, event: E, supplied: Supplied) -> bool {
        let Some(runtime) = self.runtime.get() else {
            return false;
        };
        let (found, selection) = self.peek(&event);
        let core = Arc::clone(self);
        runtime.spawn(async move {
            if let Err(e) = core.fire(&event, &supplied, selection).await {
                warn!(?event, error = %e, "detached raise failed");
            }
        });
        found
    }
}

/// A hierarchical state machine.
///
/// Cheap to clone; clones share the same states, so several tasks can raise
/// events concurrently. Transitions are decided one at a time.
pub struct StateMachine<S: StateId, E: EventId> {
    core: Arc<Core<S, E>>,
}

impl<S: StateId, E: EventId> Clone for StateMachine<S, E> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<S: StateId, E: EventId> StateMachine<S, E> {
    pub(crate) fn new(graph: StateGraph<S, E>, sink: ErrorSink<S>, initial_argument: Supplied) -> Self {
        let records = (0..graph.len())
            .map(|_| Arc::new(ActivationRecord::new()))
            .collect();
        Self {
            core: Arc::new(Core {
                graph,
                records,
                gate: Arc::new(Mutex::new(Cursor { leaf: None })),
                published: RwLock::new(None),
                sink,
                initial_argument,
                runtime: OnceLock::new(),
            }),
        }
    }

    /// Enter the initial state and its ancestors, root first.
    pub async fn start(&self) -> TransitionResult<Outcome<S>, S> {
        let core = &self.core;
        let gate = Arc::clone(&core.gate).lock_owned().await;
        if gate.leaf.is_some() {
            return Err(TransitionError::AlreadyStarted);
        }
        core.runtime.get_or_init(Handle::current);

        let target = core.graph.initial();
        let bindings = Resolver::new(&core.graph, &core.records, &core.initial_argument, None)
            .bind_path(&core.graph.path(target, None))?;
        Ok(core.from_root(gate, target, bindings).perform().await)
    }

    /// Start from a chain captured with [`active_chain`](Self::active_chain).
    ///
    /// Each state is bound to the argument recorded in the snapshot instead of
    /// a resolved one. Entry behavior runs as it would on start.
    pub async fn restore(&self, chain: &[ActiveState<S>]) -> TransitionResult<Outcome<S>, S> {
        let core = &self.core;
        let gate = Arc::clone(&core.gate).lock_owned().await;
        if gate.leaf.is_some() {
            return Err(TransitionError::AlreadyStarted);
        }

        let mut bindings = Vec::with_capacity(chain.len());
        let mut parent = None;
        for state in chain {
            let ix = core.graph.index_of(&state.id).ok_or_else(|| {
                TransitionError::InvalidSnapshot(format!("unknown state {:?}", state.id))
            })?;
            let node = core.graph.node(ix);
            if node.parent != parent {
                return Err(TransitionError::InvalidSnapshot(format!(
                    "{:?} does not follow its parent in the chain",
                    state.id
                )));
            }
            if !node.spec.matches(&state.argument) {
                return Err(TransitionError::InvalidSnapshot(format!(
                    "argument of {:?} does not match {}",
                    state.id, node.spec
                )));
            }
            bindings.push((ix, state.argument.clone()));
            parent = Some(ix);
        }
        let target =
            parent.ok_or_else(|| TransitionError::InvalidSnapshot("empty chain".to_string()))?;
        bindings.reverse();

        core.runtime.get_or_init(Handle::current);
        Ok(core.from_root(gate, target, bindings).perform().await)
    }

    /// Raise an event without an argument.
    pub async fn raise(&self, event: &E) -> TransitionResult<Outcome<S>, S> {
        self.core.fire(event, &Supplied::None, None).await
    }

    /// Raise an event with an argument.
    ///
    /// Returns once every entered state's entry behavior has been started;
    /// suspending and blocking entries may still be running.
    pub async fn raise_with(&self, event: &E, supplied: Supplied) -> TransitionResult<Outcome<S>, S> {
        self.core.fire(event, &supplied, None).await
    }

    /// Raise an event on a spawned task and return whether a transition is
    /// currently defined for it. Failures are logged.
    pub fn raise_async(&self, event: E, supplied: Supplied) -> bool {
        self.core.raise_detached(event, supplied)
    }

    /// Decide a transition and hold the gate until it is performed or dropped.
    ///
    /// `Ok(None)` means no transition handles the event.
    pub async fn prepare(
        &self,
        event: &E,
        supplied: &Supplied,
    ) -> TransitionResult<Option<Prepared<S, E>>, S> {
        self.core.prepare(event, supplied, None).await
    }

    /// Execute a transition decided by [`prepare`](Self::prepare).
    ///
    /// # Panics
    /// If `prepared` was produced by a different machine.
    pub async fn perform(&self, prepared: Prepared<S, E>) -> Outcome<S> {
        assert!(
            Arc::ptr_eq(&self.core, &prepared.core),
            "transition prepared by another state machine"
        );
        prepared.perform().await
    }

    /// The active leaf, or `None` before start
    pub fn current_state(&self) -> Option<S> {
        self.core
            .leaf()
            .map(|ix| self.core.graph.node(ix).id.clone())
    }

    /// Whether `state` is on the active chain
    pub fn is_active(&self, state: &S) -> bool {
        self.core
            .graph
            .index_of(state)
            .is_some_and(|ix| self.core.records[ix].is_active())
    }

    /// The active chain, root first, with each state's bound argument.
    pub async fn active_chain(&self) -> Vec<ActiveState<S>> {
        let gate = self.core.gate.lock().await;
        let Some(leaf) = gate.leaf else {
            return Vec::new();
        };
        let mut chain: Vec<_> = self
            .core
            .graph
            .ancestors(leaf)
            .map(|ix| ActiveState {
                id: self.core.graph.node(ix).id.clone(),
                argument: self.core.records[ix].argument(),
            })
            .collect();
        chain.reverse();
        chain
    }

    /// Export the state graph as a PlantUML diagram - only available with the
    /// plantuml feature in debug builds
    #[cfg(all(feature = "plantuml", debug_assertions))]
    pub fn export_plantuml(&self) -> String {
        crate::plantuml::generate_plantuml(&self.core.graph, self.core.leaf())
    }

    /// Stub for export_plantuml when feature is disabled
    #[cfg(not(all(feature = "plantuml", debug_assertions)))]
    pub fn export_plantuml(&self) -> String {
        String::from("PlantUML export not available (requires 'plantuml' feature and debug build)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argument::Arg;
    use crate::builder::StateMachineBuilder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum TestState {
        Root,
        L1,
        L2,
        L3,
        Side,
        Idle,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    enum TestEvent {
        Deep,
        Sideways,
        Stay,
        Home,
        Unknown,
    }

    type Log = Arc<StdMutex<Vec<String>>>;

    async fn wait_for_state<E: EventId>(fsm: &StateMachine<&'static str, E>, state: &'static str) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while fsm.current_state() != Some(state) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("state not reached in time");
    }

    fn push(log: &Log, entry: String) {
        log.lock().unwrap().push(entry);
    }

    fn logged(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    // Idle, Root -> L1 -> L2 -> L3, Root -> Side
    fn create_test_fsm(log: &Log) -> StateMachine<TestState, TestEvent> {
        use TestState::*;

        let mut builder = StateMachineBuilder::new()
            .state(Idle)
            .state(Root)
            .substate(L1, Root)
            .substate(L2, L1)
            .substate(L3, L2)
            .substate(Side, Root)
            .transition(Idle, TestEvent::Deep, L3)
            .transition(L3, TestEvent::Sideways, Side)
            .transition(L3, TestEvent::Stay, L3)
            .transition(Root, TestEvent::Home, Idle)
            .initial(Idle);

        for state in [Idle, Root, L1, L2, L3, Side] {
            let enter_log = Arc::clone(log);
            let exit_log = Arc::clone(log);
            builder = builder
                .on_entry(state, move |_, _: ()| {
                    push(&enter_log, format!("enter {state:?}"));
                    Ok(())
                })
                .on_exit(state, move |_: ()| {
                    push(&exit_log, format!("exit {state:?}"));
                    Ok(())
                });
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_start_enters_initial_state() {
        let log = Log::default();
        let fsm = create_test_fsm(&log);
        assert_eq!(fsm.current_state(), None);

        let outcome = fsm.start().await.unwrap();
        assert_eq!(
            outcome,
            Outcome::Transitioned {
                from: None,
                to: TestState::Idle
            }
        );
        assert_eq!(fsm.current_state(), Some(TestState::Idle));
        assert_eq!(logged(&log), vec!["enter Idle"]);
    }

    #[tokio::test]
    async fn test_entries_run_parent_first() {
        let log = Log::default();
        let fsm = create_test_fsm(&log);
        fsm.start().await.unwrap();

        fsm.raise(&TestEvent::Deep).await.unwrap();
        assert_eq!(fsm.current_state(), Some(TestState::L3));
        assert_eq!(
            logged(&log),
            vec!["enter Idle", "exit Idle", "enter Root", "enter L1", "enter L2", "enter L3"]
        );
    }

    #[tokio::test]
    async fn test_sibling_branch_exits_only_uncommon_segment() {
        let log = Log::default();
        let fsm = create_test_fsm(&log);
        fsm.start().await.unwrap();
        fsm.raise(&TestEvent::Deep).await.unwrap();
        log.lock().unwrap().clear();

        fsm.raise(&TestEvent::Sideways).await.unwrap();
        assert_eq!(fsm.current_state(), Some(TestState::Side));
        assert_eq!(
            logged(&log),
            vec!["exit L3", "exit L2", "exit L1", "enter Side"]
        );
        assert!(fsm.is_active(&TestState::Root));
        assert!(!fsm.is_active(&TestState::L1));
    }

    #[tokio::test]
    async fn test_ancestor_transition_is_found_from_leaf() {
        let log = Log::default();
        let fsm = create_test_fsm(&log);
        fsm.start().await.unwrap();
        fsm.raise(&TestEvent::Deep).await.unwrap();
        log.lock().unwrap().clear();

        // Home is defined on Root only
        fsm.raise(&TestEvent::Home).await.unwrap();
        assert_eq!(fsm.current_state(), Some(TestState::Idle));
        assert_eq!(
            logged(&log),
            vec!["exit L3", "exit L2", "exit L1", "exit Root", "enter Idle"]
        );
    }

    #[tokio::test]
    async fn test_reentrant_transition_skips_exit_and_entry() {
        let log = Log::default();
        let fsm = create_test_fsm(&log);
        fsm.start().await.unwrap();
        fsm.raise(&TestEvent::Deep).await.unwrap();
        log.lock().unwrap().clear();

        let outcome = fsm.raise(&TestEvent::Stay).await.unwrap();
        assert_eq!(outcome, Outcome::Reentered(TestState::L3));
        assert!(logged(&log).is_empty());
        assert_eq!(fsm.current_state(), Some(TestState::L3));
    }

    #[tokio::test]
    async fn test_unhandled_event_invokes_nothing() {
        let log = Log::default();
        let fsm = create_test_fsm(&log);
        fsm.start().await.unwrap();
        log.lock().unwrap().clear();

        let outcome = fsm.raise(&TestEvent::Unknown).await.unwrap();
        assert_eq!(outcome, Outcome::Unhandled);
        assert!(!outcome.is_handled());
        assert!(logged(&log).is_empty());
    }

    #[tokio::test]
    async fn test_raise_before_start_fails() {
        let log = Log::default();
        let fsm = create_test_fsm(&log);
        let result = fsm.raise(&TestEvent::Deep).await;
        assert!(matches!(result, Err(TransitionError::NotStarted)));

        fsm.start().await.unwrap();
        assert!(matches!(
            fsm.start().await,
            Err(TransitionError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_prepare_holds_gate_until_performed() {
        let log = Log::default();
        let fsm = create_test_fsm(&log);
        fsm.start().await.unwrap();

        let prepared = fsm
            .prepare(&TestEvent::Deep, &Supplied::None)
            .await
            .unwrap()
            .expect("transition found");
        assert_eq!(prepared.target(), &TestState::L3);
        assert_eq!(prepared.common_ancestor(), None);

        let second = {
            let fsm = fsm.clone();
            tokio::spawn(async move { fsm.raise(&TestEvent::Sideways).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        fsm.perform(prepared).await;
        let outcome = second.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            Outcome::Transitioned {
                from: Some(TestState::L3),
                to: TestState::Side
            }
        );
    }

    #[tokio::test]
    async fn test_dropped_prepare_releases_gate() {
        let log = Log::default();
        let fsm = create_test_fsm(&log);
        fsm.start().await.unwrap();

        let prepared = fsm.prepare(&TestEvent::Deep, &Supplied::None).await.unwrap();
        drop(prepared);
        assert_eq!(fsm.current_state(), Some(TestState::Idle));
        fsm.raise(&TestEvent::Deep).await.unwrap();
        assert_eq!(fsm.current_state(), Some(TestState::L3));
    }

    #[tokio::test]
    async fn test_dynamic_selector_picks_target() {
        let fsm = StateMachineBuilder::new()
            .state("A")
            .state("B")
            .state("C")
            .dynamic_transition("A", 1u8, || Ok(Some("C")))
            .dynamic_transition("A", 2u8, || Ok(None))
            .initial("A")
            .build()
            .unwrap();
        fsm.start().await.unwrap();

        assert_eq!(fsm.raise(&2).await.unwrap(), Outcome::Unhandled);
        fsm.raise(&1).await.unwrap();
        assert_eq!(fsm.current_state(), Some("C"));
    }

    #[tokio::test]
    async fn test_action_runs_between_exits_and_entries() {
        let log = Log::default();
        let (a, b, c) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));
        let fsm = StateMachineBuilder::new()
            .state("A")
            .state("B")
            .on_exit("A", move |_: ()| {
                push(&a, "exit A".into());
                Ok(())
            })
            .on_entry("B", move |_, Arg(n): Arg<u32>| {
                push(&b, format!("enter B {n}"));
                Ok(())
            })
            .transition_with("A", "go", "B", move |Arg(n): Arg<u32>| {
                push(&c, format!("action {n}"));
                Ok(())
            })
            .initial("A")
            .build()
            .unwrap();
        fsm.start().await.unwrap();

        fsm.raise_with(&"go", Supplied::explicit(4u32)).await.unwrap();
        assert_eq!(logged(&log), vec!["exit A", "action 4", "enter B 4"]);
    }

    #[tokio::test]
    async fn test_dropped_raise_still_completes_exits_once() {
        let log = Log::default();
        let (child, parent, other) = (Arc::clone(&log), Arc::clone(&log), Arc::clone(&log));
        let fsm = StateMachineBuilder::new()
            .state("Parent")
            .substate("Child", "Parent")
            .state("Other")
            .transition("Child", "leave", "Other")
            .on_entry_async("Parent", |controller, _: ()| async move {
                while controller.in_my_state() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                anyhow::Ok(())
            })
            .on_exit("Child", move |_: ()| {
                push(&child, "exit Child".into());
                Ok(())
            })
            .on_exit("Parent", move |_: ()| {
                push(&parent, "exit Parent".into());
                Ok(())
            })
            .on_entry("Other", move |_, _: ()| {
                push(&other, "enter Other".into());
                Ok(())
            })
            .initial("Child")
            .build()
            .unwrap();
        fsm.start().await.unwrap();

        // Parent's exit waits on its sleeping activity, so this gives up mid-exit
        let dropped = tokio::time::timeout(Duration::from_millis(5), fsm.raise(&"leave")).await;
        assert!(dropped.is_err());

        wait_for_state(&fsm, "Other").await;
        assert!(!fsm.is_active(&"Parent"));
        assert!(!fsm.is_active(&"Child"));
        assert!(fsm.is_active(&"Other"));

        assert_eq!(fsm.raise(&"leave").await.unwrap(), Outcome::Unhandled);
        assert_eq!(logged(&log), vec!["exit Child", "exit Parent", "enter Other"]);
    }

    #[tokio::test]
    async fn test_raise_async_reports_selector_choice() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (declines, accepts) = (Arc::clone(&calls), Arc::clone(&calls));
        let fsm = StateMachineBuilder::new()
            .state("A")
            .state("B")
            .dynamic_transition("A", 1u8, move || {
                declines.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            })
            .dynamic_transition("A", 2u8, move || {
                accepts.fetch_add(1, Ordering::SeqCst);
                Ok(Some("B"))
            })
            .initial("A")
            .build()
            .unwrap();
        fsm.start().await.unwrap();

        assert!(!fsm.raise_async(1, Supplied::None));
        assert!(!fsm.raise_async(3, Supplied::None));
        assert!(fsm.raise_async(2, Supplied::None));

        wait_for_state(&fsm, "B").await;
        // each selector ran once, ahead of the gate
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<StdMutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_default_sink_logs_error_chain() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let sink: ErrorSink<&'static str> = default_sink();
        let failure = CallbackFailure {
            state: "Idle",
            phase: Phase::Entry,
            error: anyhow!("socket closed").context("opening session"),
        };
        tracing::subscriber::with_default(subscriber, || sink(failure));

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("opening session: socket closed"), "{output}");
    }
}
