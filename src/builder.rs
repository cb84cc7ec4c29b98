//! Builder pattern implementation for state machines

use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::{self, FutureExt};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::argument::{ArgShape, ArgSpec, Argument, Supplied};
use crate::controller::Controller;
use crate::error::{BuildError, BuildResult, CallbackFailure, TransitionError};
use crate::fsm::{default_sink, StateMachine};
use crate::graph::{
    Action, Activity, ArgumentTransfer, Entry, EntryFn, EventId, Exit, ExitFuture, StateDecl,
    StateGraph, StateId, TargetDecl, TransitionDecl,
};
use crate::record::ErrorSink;
use crate::resolver::Resolver;

/// Builder for constructing state machines.
///
/// Registration errors (unknown states, conflicting argument shapes) are
/// remembered and the first one is returned from [`build`](Self::build).
pub struct StateMachineBuilder<S: StateId, E: EventId> {
    states: Vec<StateDecl<S, E>>,
    index: HashMap<S, usize>,
    initial: Option<S>,
    initial_argument: Supplied,
    transfer: ArgumentTransfer,
    reserved_id: Option<S>,
    sink: Option<ErrorSink<S>>,
    error: Option<BuildError<S, E>>,
}

fn missing<P: ArgShape>() -> anyhow::Error {
    anyhow!("bound argument does not have shape {}", P::spec())
}

/// Shape a typed registration declares; `()` callbacks declare nothing.
fn declared<P: ArgShape>() -> Option<ArgSpec> {
    Some(P::spec()).filter(|spec| !spec.is_none())
}

fn typed_entry<S, E, P, F>(f: F) -> EntryFn<S, E>
where
    S: StateId,
    E: EventId,
    P: ArgShape,
    F: Fn(&Controller<S, E>, P) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(move |controller: &Controller<S, E>| {
        let argument = P::extract(controller.argument()).ok_or_else(missing::<P>)?;
        f(controller, argument)
    })
}

struct FnActivity<P, F> {
    f: F,
    _shape: PhantomData<fn() -> P>,
}

#[async_trait]
impl<S, E, P, F, Fut> Activity<S, E> for FnActivity<P, F>
where
    S: StateId,
    E: EventId,
    P: ArgShape,
    F: Fn(Controller<S, E>, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn run(&self, controller: Controller<S, E>) -> anyhow::Result<()> {
        let argument = P::extract(controller.argument()).ok_or_else(missing::<P>)?;
        (self.f)(controller, argument).await
    }
}

impl<S: StateId, E: EventId> StateMachineBuilder<S, E> {
    /// Create an empty builder
    pub fn new() -> Self {
        Self {
            states: Vec::new(),
            index: HashMap::new(),
            initial: None,
            initial_argument: Supplied::None,
            transfer: ArgumentTransfer::default(),
            reserved_id: None,
            sink: None,
            error: None,
        }
    }

    /// Declare a top-level state
    pub fn state(self, id: S) -> Self {
        self.declare(id, None)
    }

    /// Declare a state nested in `parent`
    pub fn substate(self, id: S, parent: S) -> Self {
        self.declare(id, Some(parent))
    }

    fn declare(mut self, id: S, parent: Option<S>) -> Self {
        if self.index.contains_key(&id) {
            self.fail(BuildError::DuplicateState(id));
            return self;
        }
        self.index.insert(id.clone(), self.states.len());
        self.states.push(StateDecl::new(id, parent));
        self
    }

    fn fail(&mut self, error: BuildError<S, E>) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn with_state(
        mut self,
        id: &S,
        spec: Option<ArgSpec>,
        apply: impl FnOnce(&mut StateDecl<S, E>),
    ) -> Self {
        let Some(&ix) = self.index.get(id) else {
            self.fail(BuildError::UnknownState(id.clone()));
            return self;
        };
        if let (Some(first), Some(second)) = (self.states[ix].spec, spec) {
            if first != second {
                self.fail(BuildError::ArgumentMismatch {
                    state: id.clone(),
                    first,
                    second,
                });
                return self;
            }
        }
        let decl = &mut self.states[ix];
        if spec.is_some() {
            decl.spec = spec;
        }
        apply(decl);
        self
    }

    /// Declare the argument shape of a state without registering a callback
    pub fn expects<P: ArgShape>(self, id: S) -> Self {
        self.with_state(&id, declared::<P>(), |_| {})
    }

    /// Register an entry callback that runs on the raising task.
    ///
    /// The callback's argument type declares the state's argument shape.
    pub fn on_entry<P, F>(self, id: S, f: F) -> Self
    where
        P: ArgShape,
        F: Fn(&Controller<S, E>, P) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let entry = Entry::Inline(typed_entry(f));
        self.with_state(&id, declared::<P>(), |decl| decl.entry = Some(entry))
    }

    /// Register an entry callback that runs on a dedicated blocking worker.
    ///
    /// Suited to loops polling [`Controller::in_my_state`]; the state's exit
    /// waits for the callback to return.
    pub fn on_entry_blocking<P, F>(self, id: S, f: F) -> Self
    where
        P: ArgShape,
        F: Fn(&Controller<S, E>, P) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let entry = Entry::Blocking(typed_entry(f));
        self.with_state(&id, declared::<P>(), |decl| decl.entry = Some(entry))
    }

    /// Register a suspending entry callback, spawned as a task
    pub fn on_entry_async<P, F, Fut>(self, id: S, f: F) -> Self
    where
        P: ArgShape,
        F: Fn(Controller<S, E>, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let activity = FnActivity {
            f,
            _shape: PhantomData::<fn() -> P>,
        };
        let entry = Entry::Suspending(Arc::new(activity));
        self.with_state(&id, declared::<P>(), |decl| decl.entry = Some(entry))
    }

    /// Register an [`Activity`] as the suspending entry of a state
    pub fn activity<A>(self, id: S, activity: A) -> Self
    where
        A: Activity<S, E>,
    {
        let entry = Entry::Suspending(Arc::new(activity));
        self.with_state(&id, None, |decl| decl.entry = Some(entry))
    }

    /// Register an exit callback; it receives the argument the entry received
    pub fn on_exit<P, F>(self, id: S, f: F) -> Self
    where
        P: ArgShape,
        F: Fn(P) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let exit = Exit::Inline(Arc::new(move |argument: &Argument| {
            let argument = P::extract(argument).ok_or_else(missing::<P>)?;
            f(argument)
        }));
        self.with_state(&id, declared::<P>(), |decl| decl.exit = Some(exit))
    }

    /// Register an exit callback that is awaited before the next exit starts
    pub fn on_exit_async<P, F, Fut>(self, id: S, f: F) -> Self
    where
        P: ArgShape,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let run: ExitFuture = Arc::new(move |argument: Argument| match P::extract(&argument) {
            Some(argument) => f(argument).boxed(),
            None => future::ready(Err(missing::<P>())).boxed(),
        });
        self.with_state(&id, declared::<P>(), |decl| decl.exit = Some(Exit::Suspending(run)))
    }

    /// Add a transition from `from` to `to` on `event`
    pub fn transition(self, from: S, event: E, to: S) -> Self {
        let decl = TransitionDecl {
            event,
            target: TargetDecl::Static(to),
            action: None,
        };
        self.with_state(&from, None, |state| state.transitions.push(decl))
    }

    /// Add a transition with an action that runs after the exits and before the entries.
    ///
    /// The action's argument is resolved like a state's.
    pub fn transition_with<P, F>(self, from: S, event: E, to: S, action: F) -> Self
    where
        P: ArgShape,
        F: Fn(P) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let action = Action {
            spec: P::spec(),
            run: Arc::new(move |argument: &Argument| {
                let argument = P::extract(argument).ok_or_else(missing::<P>)?;
                action(argument)
            }),
        };
        let decl = TransitionDecl {
            event,
            target: TargetDecl::Static(to),
            action: Some(action),
        };
        self.with_state(&from, None, |state| state.transitions.push(decl))
    }

    /// Add a transition whose target is chosen when the event is raised.
    ///
    /// Returning `Ok(None)` means the event is not handled.
    pub fn dynamic_transition<F>(self, from: S, event: E, selector: F) -> Self
    where
        F: Fn() -> anyhow::Result<Option<S>> + Send + Sync + 'static,
    {
        let decl = TransitionDecl {
            event,
            target: TargetDecl::Dynamic(Arc::new(selector)),
            action: None,
        };
        self.with_state(&from, None, |state| state.transitions.push(decl))
    }

    /// Set the state entered by [`StateMachine::start`]
    pub fn initial(mut self, id: S) -> Self {
        self.initial = Some(id);
        self
    }

    /// Value offered to the initial chain on start
    pub fn initial_argument<T: Any + Send + Sync>(mut self, value: T) -> Self {
        self.initial_argument = Supplied::explicit(value);
        self
    }

    /// Choose how argument compatibility is checked
    pub fn argument_transfer(mut self, transfer: ArgumentTransfer) -> Self {
        self.transfer = transfer;
        self
    }

    /// Receive failures raised by user callbacks
    pub fn error_sink<F>(mut self, sink: F) -> Self
    where
        F: Fn(CallbackFailure<S>) + Send + Sync + 'static,
    {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Build the state machine
    pub fn build(self) -> BuildResult<StateMachine<S, E>, S, E> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if let Some(reserved) = &self.reserved_id {
            if self.index.contains_key(reserved) {
                return Err(BuildError::DefaultStateId(reserved.clone()));
            }
        }

        let initial = self.initial.ok_or(BuildError::MissingInitialState)?;
        let graph = StateGraph::build(self.states, &initial, self.transfer)?;

        let start = graph.initial();
        Resolver::new(&graph, &[], &self.initial_argument, None)
            .bind_path(&graph.path(start, None))
            .map_err(|e| initial_argument_error(&graph, start, e))?;

        let sink = self.sink.unwrap_or_else(default_sink);
        Ok(StateMachine::new(graph, sink, self.initial_argument))
    }
}

impl<S: StateId + Default, E: EventId> StateMachineBuilder<S, E> {
    /// Reject `S::default()` as a state id
    pub fn disallow_default_id(mut self) -> Self {
        self.reserved_id = Some(S::default());
        self
    }
}

impl<S: StateId, E: EventId> Default for StateMachineBuilder<S, E> {
    fn default() -> Self {
        Self::new()
    }
}

fn initial_argument_error<S: StateId, E: EventId>(
    graph: &StateGraph<S, E>,
    start: usize,
    error: TransitionError<S>,
) -> BuildError<S, E> {
    let spec_of = |state: &S| graph.index_of(state).map_or(ArgSpec::None, |ix| graph.node(ix).spec);
    match error {
        TransitionError::Unresolvable { state, expected } => {
            BuildError::InitialArgument { state, expected }
        }
        TransitionError::RelayIncomplete { state, .. } => BuildError::InitialArgument {
            expected: spec_of(&state),
            state,
        },
        _ => BuildError::InitialArgument {
            state: graph.node(start).id.clone(),
            expected: graph.node(start).spec,
        },
    }
}
