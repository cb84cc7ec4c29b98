//! Capability handed to running entry behavior.

use std::fmt;
use std::sync::{Arc, Weak};

use crate::argument::{Argument, Supplied};
use crate::fsm::Core;
use crate::graph::{EventId, StateId};
use crate::record::ActivationRecord;

/// Handle given to a state's entry behavior.
///
/// Lets long-running entry work check whether its state is still active and
/// raise further events without blocking on the transition gate.
pub struct Controller<S: StateId, E: EventId> {
    state: S,
    argument: Argument,
    generation: u64,
    record: Arc<ActivationRecord>,
    core: Weak<Core<S, E>>,
}

impl<S: StateId, E: EventId> Controller<S, E> {
    pub(crate) fn new(
        state: S,
        argument: Argument,
        generation: u64,
        record: Arc<ActivationRecord>,
        core: Weak<Core<S, E>>,
    ) -> Self {
        Self {
            state,
            argument,
            generation,
            record,
            core,
        }
    }

    /// The state this controller was built for
    pub fn state(&self) -> &S {
        &self.state
    }

    /// The argument bound when the state was entered
    pub fn argument(&self) -> &Argument {
        &self.argument
    }

    /// True until a transition away from this occupancy of the state begins.
    ///
    /// A controller kept from an earlier occupancy stays false even after the
    /// state is entered again.
    pub fn in_my_state(&self) -> bool {
        self.record.is_active() && self.record.generation() == self.generation
    }

    /// Raise an event on a spawned task.
    ///
    /// Returns whether the active chain currently defines a transition for
    /// `event`, not whether it completed. Safe to call from entry behavior,
    /// where waiting for the transition to finish would deadlock against this
    /// state's own exit.
    pub fn raise_async(&self, event: E, supplied: Supplied) -> bool {
        match self.core.upgrade() {
            Some(core) => Core::raise_detached(&core, event, supplied),
            None => false,
        }
    }
}

impl<S: StateId, E: EventId> Clone for Controller<S, E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            argument: self.argument.clone(),
            generation: self.generation,
            record: Arc::clone(&self.record),
            core: Weak::clone(&self.core),
        }
    }
}

impl<S: StateId, E: EventId> fmt::Debug for Controller<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("state", &self.state)
            .field("argument", &self.argument)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argument::Value;

    #[test]
    fn stale_controller_is_not_in_state_after_reentry() {
        let record = Arc::new(ActivationRecord::new());
        let generation = record.arm(Argument::None);
        let first: Controller<&str, u8> =
            Controller::new("A", Argument::None, generation, Arc::clone(&record), Weak::new());
        assert!(first.in_my_state());

        let generation = record.arm(Argument::Single(Value::new(3u8)));
        let second: Controller<&str, u8> = Controller::new(
            "A",
            record.argument(),
            generation,
            Arc::clone(&record),
            Weak::new(),
        );
        assert!(!first.in_my_state());
        assert!(second.in_my_state());
        assert_eq!(second.argument().get::<u8>(), Some(&3));
    }

    #[test]
    fn raise_without_machine_reports_nothing_found() {
        let record = Arc::new(ActivationRecord::new());
        let controller: Controller<&str, u8> =
            Controller::new("A", Argument::None, 0, record, Weak::new());
        assert!(!controller.raise_async(1, Supplied::None));
    }
}
