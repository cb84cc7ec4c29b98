//! Error types for the state machine

use anyhow::anyhow;
use futures::FutureExt;
use std::any::Any;
use std::fmt::{self, Debug};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;

use crate::argument::{ArgSpec, ArgType};

/// Result type alias for building a state machine
pub type BuildResult<T, S, E> = std::result::Result<T, BuildError<S, E>>;

/// Result type alias for raising events
pub type TransitionResult<T, S> = std::result::Result<T, TransitionError<S>>;

/// Configuration errors detected while building the state graph.
///
/// Any of these aborts construction; no machine is produced.
#[derive(Error, Debug)]
pub enum BuildError<S: Debug, E: Debug> {
    /// The same state id was declared more than once
    #[error("State {0:?} declared twice")]
    DuplicateState(S),

    /// A callback or transition was registered for a state that was never declared
    #[error("State {0:?} not declared")]
    UnknownState(S),

    /// A substate names a parent that was never declared
    #[error("State {state:?} has undeclared parent {parent:?}")]
    UnknownParent { state: S, parent: S },

    /// Following parent links from this state leads back to it
    #[error("State {0:?} is its own ancestor")]
    CyclicHierarchy(S),

    /// A state defines two transitions for one event
    #[error("State {state:?} defines event {event:?} more than once")]
    DuplicateEvent { state: S, event: E },

    /// A static transition points at an undeclared state
    #[error("Transition {state:?} --{event:?}--> {target:?} targets an undeclared state")]
    DanglingTarget { state: S, event: E, target: S },

    /// Entry, exit and expectation registrations disagree on the argument shape
    #[error("State {state:?} registers conflicting argument shapes {first} and {second}")]
    ArgumentMismatch {
        state: S,
        first: ArgSpec,
        second: ArgSpec,
    },

    /// `.initial(state)` was never called
    #[error("Initial state not specified. Call .initial(state) before .build()")]
    MissingInitialState,

    /// The initial state was never declared
    #[error("Initial state {0:?} not declared")]
    UnknownInitialState(S),

    /// The start-up value cannot satisfy a state on the initial chain
    #[error("Initial chain cannot bind {expected} for state {state:?}")]
    InitialArgument { state: S, expected: ArgSpec },

    /// Strict transfer: an ancestor's argument shape does not accept a descendant's
    #[error("Parent {parent:?} ({parent_spec}) does not accept child {child:?} ({child_spec})")]
    StrictConflict {
        parent: S,
        child: S,
        parent_spec: ArgSpec,
        child_spec: ArgSpec,
    },

    /// The id type's default value was used although it was disallowed
    #[error("State {0:?} uses the default id value, which is disallowed")]
    DefaultStateId(S),
}

/// Errors returned to the caller of a raise.
///
/// These are distinct from an event that simply has no transition, which is
/// reported as [`Outcome::Unhandled`](crate::Outcome::Unhandled).
#[derive(Error, Debug)]
pub enum TransitionError<S: Debug> {
    /// The machine has not been started yet
    #[error("State machine not started")]
    NotStarted,

    /// `start` or `restore` was called on a running machine
    #[error("State machine already started")]
    AlreadyStarted,

    /// No supplied, active-chain or fallback value fits the state
    #[error("State {state:?} expects {expected} but no compatible argument was found")]
    Unresolvable { state: S, expected: ArgSpec },

    /// An explicit argument was supplied but nothing on the path accepts it
    #[error("Argument of type {0} was supplied but no entered state accepts it")]
    UnusedArgument(ArgType),

    /// One half of a relay pair could not be resolved
    #[error("State {state:?} relay slot {missing} could not be resolved")]
    RelayIncomplete { state: S, missing: ArgType },

    /// A snapshot handed to `restore` is not a root-to-leaf chain
    #[error("Invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Which user callback failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Entry behavior of a state
    Entry,
    /// Exit behavior of a state
    Exit,
    /// Transition-local action
    Action,
    /// Dynamic target selector
    Selector,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Entry => "entry",
            Phase::Exit => "exit",
            Phase::Action => "action",
            Phase::Selector => "selector",
        };
        f.write_str(name)
    }
}

/// A failure raised by user code, delivered to the error sink.
///
/// Panics are caught and converted into an `error` carrying the panic message.
#[derive(Error, Debug)]
#[error("{phase} callback of state {state:?} failed: {error:#}")]
pub struct CallbackFailure<S: Debug> {
    /// State whose callback failed (the defining state for actions and selectors)
    pub state: S,
    /// Kind of callback
    pub phase: Phase,
    /// The error returned or the converted panic
    pub error: anyhow::Error,
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a user callback, turning a panic into an error.
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> anyhow::Result<R>) -> anyhow::Result<R> {
    // The callback's captures are not touched again after a panic.
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("panicked: {}", panic_message(payload.as_ref()))),
    }
}

/// Await a user future, turning a panic into an error.
pub(crate) async fn catch_panic_async<R>(
    fut: impl Future<Output = anyhow::Result<R>>,
) -> anyhow::Result<R> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("panicked: {}", panic_message(payload.as_ref()))),
    }
}
