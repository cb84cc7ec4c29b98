//! Argument resolution for states about to be entered.
//!
//! For each declared type, in priority order: an explicit supplied value, the
//! nearest value on the active chain (leaf first), a fallback supplied value.
//! Relay shapes resolve each half on its own, so one half may come from the
//! caller and the other from an active ancestor.

use std::collections::HashMap;
use std::sync::Arc;

use crate::argument::{ArgSpec, ArgType, Argument, Supplied, Value};
use crate::error::{TransitionError, TransitionResult};
use crate::graph::{EventId, StateGraph, StateId};
use crate::record::ActivationRecord;

/// Resolved argument per state to enter, in path order.
pub(crate) type Bindings = Vec<(usize, Argument)>;

pub(crate) struct Resolver<'a, S: StateId, E: EventId> {
    graph: &'a StateGraph<S, E>,
    records: &'a [Arc<ActivationRecord>],
    supplied: &'a Supplied,
    leaf: Option<usize>,
    memo: HashMap<ArgSpec, Argument>,
    consumed: bool,
}

impl<'a, S: StateId, E: EventId> Resolver<'a, S, E> {
    /// `leaf` is the active leaf when the transition was decided.
    pub(crate) fn new(
        graph: &'a StateGraph<S, E>,
        records: &'a [Arc<ActivationRecord>],
        supplied: &'a Supplied,
        leaf: Option<usize>,
    ) -> Self {
        Self {
            graph,
            records,
            supplied,
            leaf,
            memo: HashMap::new(),
            consumed: false,
        }
    }

    /// Resolve every state on `path` by its declared shape.
    pub(crate) fn bind_path(&mut self, path: &[usize]) -> TransitionResult<Bindings, S> {
        let mut bindings = Vec::with_capacity(path.len());
        for &ix in path {
            let spec = self.graph.node(ix).spec;
            bindings.push((ix, self.resolve(ix, spec)?));
        }
        Ok(bindings)
    }

    /// Resolve one shape on behalf of `owner`, which is named in failures.
    ///
    /// A relay is resolved per component: each half takes the nearest match on
    /// its own, so a whole relay held further up is not preferred over a closer
    /// single value.
    pub(crate) fn resolve(&mut self, owner: usize, spec: ArgSpec) -> TransitionResult<Argument, S> {
        if let Some(hit) = self.memo.get(&spec) {
            return Ok(hit.clone());
        }

        let argument = match spec {
            ArgSpec::None => Argument::None,
            ArgSpec::Single(ty) => {
                let value = self
                    .component(ty)
                    .ok_or_else(|| TransitionError::Unresolvable {
                        state: self.graph.node(owner).id.clone(),
                        expected: spec,
                    })?;
                Argument::Single(value)
            }
            ArgSpec::Relay(first, second) => {
                let a = self.relay_half(owner, first)?;
                let b = self.relay_half(owner, second)?;
                Argument::Relay(a, b)
            }
        };

        self.memo.insert(spec, argument.clone());
        Ok(argument)
    }

    /// Fails if an explicit argument was supplied and nothing took it.
    pub(crate) fn finish(&self) -> TransitionResult<(), S> {
        match self.supplied.explicit_value() {
            Some(value) if !self.consumed => Err(TransitionError::UnusedArgument(value.ty())),
            _ => Ok(()),
        }
    }

    fn relay_half(&mut self, owner: usize, ty: ArgType) -> TransitionResult<Value, S> {
        self.component(ty)
            .ok_or_else(|| TransitionError::RelayIncomplete {
                state: self.graph.node(owner).id.clone(),
                missing: ty,
            })
    }

    fn component(&mut self, ty: ArgType) -> Option<Value> {
        if let Some(value) = self.supplied.explicit_value().filter(|v| v.ty() == ty) {
            self.consumed = true;
            return Some(value.clone());
        }
        if let Some(value) = self.from_active_chain(ty) {
            return Some(value);
        }
        self.supplied
            .fallback_value()
            .filter(|v| v.ty() == ty)
            .cloned()
    }

    fn from_active_chain(&self, ty: ArgType) -> Option<Value> {
        let leaf = self.leaf?;
        self.graph
            .ancestors(leaf)
            .find_map(|ix| self.records[ix].find(ty))
    }
}
