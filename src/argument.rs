//! Typed arguments carried by states.
//!
//! A state declares one of three argument shapes: no argument, a single value
//! of one type, or a two-part relay whose halves may come from different
//! sources. Values travel type-erased as [`Value`] and are recovered by the
//! sealed [`ArgShape`] implementations when a typed callback runs.

use std::any::{Any, TypeId};
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Runtime identity of an argument type.
#[derive(Clone, Copy)]
pub struct ArgType {
    id: TypeId,
    name: &'static str,
}

impl ArgType {
    /// Identity of `T`
    pub fn of<T: Any>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Type name, for diagnostics only
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ArgType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ArgType {}

impl Hash for ArgType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Debug for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}`", self.name)
    }
}

/// Argument shape declared by a state or a transition action.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ArgSpec {
    /// Takes no argument
    None,
    /// Takes one value of the given type
    Single(ArgType),
    /// Takes a pair, each half resolved independently
    Relay(ArgType, ArgType),
}

impl ArgSpec {
    /// Whether this shape needs no value
    pub fn is_none(&self) -> bool {
        matches!(self, ArgSpec::None)
    }

    /// Whether an ancestor declaring `self` accepts a descendant declaring `child`.
    ///
    /// Shapes accept each other when they share a component type; a state
    /// without an argument accepts and is accepted by anything.
    pub fn accepts(&self, child: &ArgSpec) -> bool {
        match (self, child) {
            (ArgSpec::None, _) | (_, ArgSpec::None) => true,
            (ArgSpec::Single(p), ArgSpec::Single(c)) => p == c,
            (ArgSpec::Single(p), ArgSpec::Relay(a, b)) => p == a || p == b,
            (ArgSpec::Relay(a, b), ArgSpec::Single(c)) => c == a || c == b,
            (ArgSpec::Relay(a, b), ArgSpec::Relay(c, d)) => a == c || a == d || b == c || b == d,
        }
    }

    /// Whether `argument` has exactly this shape.
    pub fn matches(&self, argument: &Argument) -> bool {
        match (self, argument) {
            (ArgSpec::None, Argument::None) => true,
            (ArgSpec::Single(ty), Argument::Single(v)) => v.ty == *ty,
            (ArgSpec::Relay(a, b), Argument::Relay(x, y)) => x.ty == *a && y.ty == *b,
            _ => false,
        }
    }
}

impl fmt::Display for ArgSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgSpec::None => f.write_str("no argument"),
            ArgSpec::Single(ty) => write!(f, "{ty}"),
            ArgSpec::Relay(a, b) => write!(f, "relay({a}, {b})"),
        }
    }
}

/// A type-erased argument value.
#[derive(Clone)]
pub struct Value {
    ty: ArgType,
    inner: Arc<dyn Any + Send + Sync>,
}

impl Value {
    /// Wrap a value
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            ty: ArgType::of::<T>(),
            inner: Arc::new(value),
        }
    }

    /// Type of the wrapped value
    pub fn ty(&self) -> ArgType {
        self.ty
    }

    /// Borrow the value as `T`, if it is one
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self.ty.name)
    }
}

/// Argument bound to an active state.
#[derive(Clone, Debug, Default)]
pub enum Argument {
    /// Nothing bound
    #[default]
    None,
    /// A single value
    Single(Value),
    /// A relay pair, in declaration order
    Relay(Value, Value),
}

impl Argument {
    /// Whether nothing is bound
    pub fn is_none(&self) -> bool {
        matches!(self, Argument::None)
    }

    /// Borrow the single value as `T`, or the first relay half of type `T`
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.find(ArgType::of::<T>()).and_then(Value::get)
    }

    /// A value of type `ty` held by this argument; the first relay half wins.
    pub(crate) fn find(&self, ty: ArgType) -> Option<&Value> {
        match self {
            Argument::None => None,
            Argument::Single(v) => (v.ty == ty).then_some(v),
            Argument::Relay(a, b) => {
                if a.ty == ty {
                    Some(a)
                } else if b.ty == ty {
                    Some(b)
                } else {
                    None
                }
            }
        }
    }
}

/// Argument handed to a raise.
#[derive(Clone, Debug, Default)]
pub enum Supplied {
    /// No argument
    #[default]
    None,
    /// Takes priority over values found on the active chain
    Explicit(Value),
    /// Used only when the active chain has nothing compatible
    Fallback(Value),
}

impl Supplied {
    /// An explicit argument
    pub fn explicit<T: Any + Send + Sync>(value: T) -> Self {
        Supplied::Explicit(Value::new(value))
    }

    /// A fallback argument
    pub fn fallback<T: Any + Send + Sync>(value: T) -> Self {
        Supplied::Fallback(Value::new(value))
    }

    pub(crate) fn explicit_value(&self) -> Option<&Value> {
        match self {
            Supplied::Explicit(v) => Some(v),
            _ => None,
        }
    }

    pub(crate) fn fallback_value(&self) -> Option<&Value> {
        match self {
            Supplied::Fallback(v) => Some(v),
            _ => None,
        }
    }
}

mod sealed {
    pub trait Sealed {}

    impl Sealed for () {}
    impl<A> Sealed for super::Arg<A> {}
    impl<A, B> Sealed for super::Relay<A, B> {}
}

/// Typed view of an [`Argument`] used by callback registrations.
///
/// Implemented for `()` (no argument), [`Arg<A>`] and [`Relay<A, B>`]; the
/// set is closed.
pub trait ArgShape: sealed::Sealed + Send + Sized + 'static {
    /// Declared shape
    fn spec() -> ArgSpec;

    /// Recover the typed value from a bound argument
    fn extract(argument: &Argument) -> Option<Self>;
}

/// A single typed argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arg<A>(pub A);

/// A relay pair: two halves resolved independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relay<A, B>(pub A, pub B);

impl ArgShape for () {
    fn spec() -> ArgSpec {
        ArgSpec::None
    }

    fn extract(_argument: &Argument) -> Option<Self> {
        Some(())
    }
}

impl<A> ArgShape for Arg<A>
where
    A: Any + Clone + Send + Sync,
{
    fn spec() -> ArgSpec {
        ArgSpec::Single(ArgType::of::<A>())
    }

    fn extract(argument: &Argument) -> Option<Self> {
        argument.get::<A>().cloned().map(Arg)
    }
}

impl<A, B> ArgShape for Relay<A, B>
where
    A: Any + Clone + Send + Sync,
    B: Any + Clone + Send + Sync,
{
    fn spec() -> ArgSpec {
        ArgSpec::Relay(ArgType::of::<A>(), ArgType::of::<B>())
    }

    fn extract(argument: &Argument) -> Option<Self> {
        match argument {
            Argument::Relay(a, b) => Some(Relay(a.get::<A>()?.clone(), b.get::<B>()?.clone())),
            _ => None,
        }
    }
}
