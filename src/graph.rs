//! Immutable state graph.
//!
//! Nodes are stored in declaration order and addressed by index; parents are
//! indices into the same table, so the graph owns every node and a node's
//! ancestors are reached in `O(depth)`.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use crate::argument::{ArgSpec, Argument};
use crate::controller::Controller;
use crate::error::{BuildError, BuildResult};

/// Bounds required of state ids.
pub trait StateId: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> StateId for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// Bounds required of events.
pub trait EventId: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> EventId for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// How argument compatibility between nested states is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArgumentTransfer {
    /// Every ancestor's argument shape must accept each descendant's; checked at build
    Strict,
    /// Compatibility is only checked when a transition resolves arguments
    #[default]
    Free,
}

/// A suspending entry action.
///
/// The returned future is spawned as its own task; the state's exit waits for
/// it to complete, so a long-running activity should poll
/// [`Controller::in_my_state`] and return once it turns false.
#[async_trait]
pub trait Activity<S: StateId, E: EventId>: Send + Sync + 'static {
    /// Run the activity. The bound argument is available through the controller.
    async fn run(&self, controller: Controller<S, E>) -> anyhow::Result<()>;
}

pub(crate) type EntryFn<S, E> =
    Arc<dyn Fn(&Controller<S, E>) -> anyhow::Result<()> + Send + Sync>;
pub(crate) type ExitFn = Arc<dyn Fn(&Argument) -> anyhow::Result<()> + Send + Sync>;
pub(crate) type ExitFuture =
    Arc<dyn Fn(Argument) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
pub(crate) type ActionFn = Arc<dyn Fn(&Argument) -> anyhow::Result<()> + Send + Sync>;
pub(crate) type SelectorFn<S> = Arc<dyn Fn() -> anyhow::Result<Option<S>> + Send + Sync>;

/// Entry behavior of a state.
pub(crate) enum Entry<S: StateId, E: EventId> {
    /// Runs on the raising task before the next entry starts
    Inline(EntryFn<S, E>),
    /// Runs on a dedicated blocking worker
    Blocking(EntryFn<S, E>),
    /// Spawned as a task
    Suspending(Arc<dyn Activity<S, E>>),
}

impl<S: StateId, E: EventId> Clone for Entry<S, E> {
    fn clone(&self) -> Self {
        match self {
            Entry::Inline(f) => Entry::Inline(Arc::clone(f)),
            Entry::Blocking(f) => Entry::Blocking(Arc::clone(f)),
            Entry::Suspending(a) => Entry::Suspending(Arc::clone(a)),
        }
    }
}

/// Exit behavior of a state; both variants complete before the next exit starts.
#[derive(Clone)]
pub(crate) enum Exit {
    Inline(ExitFn),
    Suspending(ExitFuture),
}

/// Transition-local action with the argument shape it expects.
#[derive(Clone)]
pub(crate) struct Action {
    pub(crate) spec: ArgSpec,
    pub(crate) run: ActionFn,
}

pub(crate) enum TargetDecl<S> {
    Static(S),
    Dynamic(SelectorFn<S>),
}

pub(crate) struct TransitionDecl<S, E> {
    pub(crate) event: E,
    pub(crate) target: TargetDecl<S>,
    pub(crate) action: Option<Action>,
}

/// Everything the builder collected about one state.
pub(crate) struct StateDecl<S: StateId, E: EventId> {
    pub(crate) id: S,
    pub(crate) parent: Option<S>,
    pub(crate) spec: Option<ArgSpec>,
    pub(crate) entry: Option<Entry<S, E>>,
    pub(crate) exit: Option<Exit>,
    pub(crate) transitions: Vec<TransitionDecl<S, E>>,
}

impl<S: StateId, E: EventId> StateDecl<S, E> {
    pub(crate) fn new(id: S, parent: Option<S>) -> Self {
        Self {
            id,
            parent,
            spec: None,
            entry: None,
            exit: None,
            transitions: Vec::new(),
        }
    }
}

pub(crate) enum Target<S> {
    Static(usize),
    Dynamic(SelectorFn<S>),
}

pub(crate) struct Transition<S> {
    pub(crate) target: Target<S>,
    pub(crate) action: Option<Action>,
}

pub(crate) struct StateNode<S: StateId, E: EventId> {
    pub(crate) id: S,
    pub(crate) parent: Option<usize>,
    pub(crate) depth: usize,
    pub(crate) spec: ArgSpec,
    pub(crate) entry: Option<Entry<S, E>>,
    pub(crate) exit: Option<Exit>,
    pub(crate) transitions: HashMap<E, Transition<S>>,
}

pub(crate) struct StateGraph<S: StateId, E: EventId> {
    nodes: Vec<StateNode<S, E>>,
    index: HashMap<S, usize>,
    initial: usize,
}

impl<S: StateId, E: EventId> StateGraph<S, E> {
    /// Validate the declarations and freeze them into a graph.
    pub(crate) fn build(
        decls: Vec<StateDecl<S, E>>,
        initial: &S,
        transfer: ArgumentTransfer,
    ) -> BuildResult<Self, S, E> {
        let mut index = HashMap::with_capacity(decls.len());
        for (ix, decl) in decls.iter().enumerate() {
            if index.insert(decl.id.clone(), ix).is_some() {
                return Err(BuildError::DuplicateState(decl.id.clone()));
            }
        }

        let mut parents = Vec::with_capacity(decls.len());
        for decl in &decls {
            let parent = match &decl.parent {
                Some(p) => Some(*index.get(p).ok_or_else(|| BuildError::UnknownParent {
                    state: decl.id.clone(),
                    parent: p.clone(),
                })?),
                None => None,
            };
            parents.push(parent);
        }

        let mut depths = Vec::with_capacity(decls.len());
        for (ix, decl) in decls.iter().enumerate() {
            let mut depth = 0;
            let mut cursor = parents[ix];
            while let Some(p) = cursor {
                depth += 1;
                if depth > decls.len() {
                    return Err(BuildError::CyclicHierarchy(decl.id.clone()));
                }
                cursor = parents[p];
            }
            depths.push(depth);
        }

        let mut nodes = Vec::with_capacity(decls.len());
        for (ix, decl) in decls.into_iter().enumerate() {
            let mut transitions = HashMap::with_capacity(decl.transitions.len());
            for t in decl.transitions {
                let target = match t.target {
                    TargetDecl::Static(id) => match index.get(&id) {
                        Some(&target) => Target::Static(target),
                        None => {
                            return Err(BuildError::DanglingTarget {
                                state: decl.id,
                                event: t.event,
                                target: id,
                            })
                        }
                    },
                    TargetDecl::Dynamic(select) => Target::Dynamic(select),
                };
                if transitions.contains_key(&t.event) {
                    return Err(BuildError::DuplicateEvent {
                        state: decl.id,
                        event: t.event,
                    });
                }
                transitions.insert(
                    t.event,
                    Transition {
                        target,
                        action: t.action,
                    },
                );
            }
            nodes.push(StateNode {
                id: decl.id,
                parent: parents[ix],
                depth: depths[ix],
                spec: decl.spec.unwrap_or(ArgSpec::None),
                entry: decl.entry,
                exit: decl.exit,
                transitions,
            });
        }

        let initial = *index
            .get(initial)
            .ok_or_else(|| BuildError::UnknownInitialState(initial.clone()))?;

        let graph = Self {
            nodes,
            index,
            initial,
        };
        if transfer == ArgumentTransfer::Strict {
            graph.check_strict()?;
        }
        Ok(graph)
    }

    fn check_strict(&self) -> BuildResult<(), S, E> {
        for (ix, node) in self.nodes.iter().enumerate() {
            if node.spec.is_none() {
                continue;
            }
            for ancestor in self.ancestors(ix).skip(1) {
                let parent = &self.nodes[ancestor];
                if !parent.spec.accepts(&node.spec) {
                    return Err(BuildError::StrictConflict {
                        parent: parent.id.clone(),
                        child: node.id.clone(),
                        parent_spec: parent.spec,
                        child_spec: node.spec,
                    });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn node(&self, ix: usize) -> &StateNode<S, E> {
        &self.nodes[ix]
    }

    #[cfg(all(feature = "plantuml", debug_assertions))]
    pub(crate) fn nodes(&self) -> impl Iterator<Item = &StateNode<S, E>> {
        self.nodes.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn index_of(&self, id: &S) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub(crate) fn initial(&self) -> usize {
        self.initial
    }

    /// `ix` followed by its ancestors, nearest first.
    pub(crate) fn ancestors(&self, ix: usize) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(Some(ix), move |&i| self.nodes[i].parent)
    }

    /// First state from `leaf` upward that defines `event`.
    pub(crate) fn find_transition(&self, leaf: usize, event: &E) -> Option<(usize, &Transition<S>)> {
        self.ancestors(leaf)
            .find_map(|ix| self.nodes[ix].transitions.get(event).map(|t| (ix, t)))
    }

    /// Deepest common ancestor of `a` and `b`; `None` is the virtual root.
    pub(crate) fn common_ancestor(&self, a: Option<usize>, b: usize) -> Option<usize> {
        let mut a = a?;
        let mut b = b;
        while self.nodes[a].depth > self.nodes[b].depth {
            a = self.nodes[a].parent?;
        }
        while self.nodes[b].depth > self.nodes[a].depth {
            b = self.nodes[b].parent?;
        }
        while a != b {
            a = self.nodes[a].parent?;
            b = self.nodes[b].parent?;
        }
        Some(a)
    }

    /// States from `from` up to, but excluding, `stop`; nearest first.
    pub(crate) fn path(&self, from: usize, stop: Option<usize>) -> Vec<usize> {
        self.ancestors(from)
            .take_while(|&ix| Some(ix) != stop)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::argument::ArgType;

    fn decl(id: &'static str, parent: Option<&'static str>) -> StateDecl<&'static str, u8> {
        StateDecl::new(id, parent)
    }

    fn goto(event: u8, target: &'static str) -> TransitionDecl<&'static str, u8> {
        TransitionDecl {
            event,
            target: TargetDecl::Static(target),
            action: None,
        }
    }

    fn sample() -> StateGraph<&'static str, u8> {
        // Root -> L1 -> L2 -> L3, Root -> Side, Other
        let decls = vec![
            decl("Root", None),
            decl("L1", Some("Root")),
            decl("L2", Some("L1")),
            decl("L3", Some("L2")),
            decl("Side", Some("Root")),
            decl("Other", None),
        ];
        StateGraph::build(decls, &"Other", ArgumentTransfer::Free).unwrap()
    }

    #[test]
    fn depths_follow_nesting() {
        let graph = sample();
        let depth = |id| graph.node(graph.index_of(&id).unwrap()).depth;
        assert_eq!(depth("Root"), 0);
        assert_eq!(depth("L3"), 3);
        assert_eq!(depth("Side"), 1);
    }

    #[test]
    fn common_ancestor_of_branches() {
        let graph = sample();
        let ix = |id| graph.index_of(&id).unwrap();
        assert_eq!(graph.common_ancestor(Some(ix("L3")), ix("Side")), Some(ix("Root")));
        assert_eq!(graph.common_ancestor(Some(ix("L1")), ix("L3")), Some(ix("L1")));
        assert_eq!(graph.common_ancestor(Some(ix("Other")), ix("L3")), None);
        assert_eq!(graph.common_ancestor(None, ix("L3")), None);
    }

    #[test]
    fn path_stops_below_ancestor() {
        let graph = sample();
        let ix = |id| graph.index_of(&id).unwrap();
        let names: Vec<_> = graph
            .path(ix("L3"), Some(ix("Root")))
            .into_iter()
            .map(|i| graph.node(i).id)
            .collect();
        assert_eq!(names, vec!["L3", "L2", "L1"]);
        assert_eq!(graph.path(ix("L3"), None).len(), 4);
    }

    #[test]
    fn dangling_target_is_rejected() {
        let mut a = decl("A", None);
        a.transitions.push(goto(1, "Nowhere"));
        let err = StateGraph::build(vec![a], &"A", ArgumentTransfer::Free).err();
        assert!(matches!(
            err,
            Some(BuildError::DanglingTarget { state: "A", event: 1, target: "Nowhere" })
        ));
    }

    #[test]
    fn duplicate_event_is_rejected() {
        let mut a = decl("A", None);
        a.transitions.push(goto(1, "A"));
        a.transitions.push(goto(1, "A"));
        let err = StateGraph::build(vec![a], &"A", ArgumentTransfer::Free).err();
        assert!(matches!(err, Some(BuildError::DuplicateEvent { state: "A", event: 1 })));
    }

    #[test]
    fn cycles_and_unknown_parents_are_rejected() {
        let err = StateGraph::build(
            vec![decl("A", Some("B")), decl("B", Some("A"))],
            &"A",
            ArgumentTransfer::Free,
        )
        .err();
        assert!(matches!(err, Some(BuildError::CyclicHierarchy("A"))));

        let err = StateGraph::build(vec![decl("A", Some("Ghost"))], &"A", ArgumentTransfer::Free).err();
        assert!(matches!(err, Some(BuildError::UnknownParent { state: "A", parent: "Ghost" })));
    }

    #[test]
    fn strict_transfer_names_conflicting_pair() {
        let mut parent = decl("P", None);
        parent.spec = Some(ArgSpec::Single(ArgType::of::<u32>()));
        let mut child = decl("C", Some("P"));
        child.spec = Some(ArgSpec::Single(ArgType::of::<String>()));

        let err = StateGraph::build(vec![parent, child], &"C", ArgumentTransfer::Strict).err();
        assert!(matches!(
            err,
            Some(BuildError::StrictConflict { parent: "P", child: "C", .. })
        ));
    }

    #[test]
    fn free_transfer_defers_conflicts() {
        let mut parent = decl("P", None);
        parent.spec = Some(ArgSpec::Single(ArgType::of::<u32>()));
        let mut child = decl("C", Some("P"));
        child.spec = Some(ArgSpec::Single(ArgType::of::<String>()));

        assert!(StateGraph::build(vec![parent, child], &"C", ArgumentTransfer::Free).is_ok());
    }
}
