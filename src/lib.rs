//! # Relay FSM
//!
//! An async hierarchical state machine whose states carry typed arguments.
//!
//! ## Features
//!
//! - **Two-phase transitions**: a transition is decided under a gate and
//!   executed outside it, so concurrent raises are serialized
//! - **Hierarchical States**: events bubble from the active leaf to the root;
//!   exits run child-first and entries parent-first below the common ancestor
//! - **Long-running entries**: entry behavior may block or suspend and is
//!   still interrupted safely by a later transition
//! - **Typed arguments**: each state declares a single value or a two-part
//!   relay, resolved from the caller, the active chain or a fallback
//! - **PlantUML Export**: state diagram generation (debug builds only)
//!
//! ## Quick Start
//!
//! ```rust
//! use relay_fsm::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq, Eq, Hash)]
//! enum State { Idle, Session, Transfer }
//!
//! #[derive(Debug, Clone, PartialEq, Eq, Hash)]
//! enum Event { Login, Send, Logout }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let fsm = StateMachineBuilder::new()
//!     .state(State::Idle)
//!     .state(State::Session)
//!     .substate(State::Transfer, State::Session)
//!     .on_entry(State::Session, |_, Arg(user): Arg<String>| {
//!         println!("welcome {user}");
//!         Ok(())
//!     })
//!     // The user name comes from the active Session, the amount from the caller
//!     .on_entry(State::Transfer, |_, Relay(user, amount): Relay<String, u64>| {
//!         println!("{user} sends {amount}");
//!         Ok(())
//!     })
//!     .transition(State::Idle, Event::Login, State::Session)
//!     .transition(State::Session, Event::Send, State::Transfer)
//!     .transition(State::Session, Event::Logout, State::Idle)
//!     .initial(State::Idle)
//!     .build()?;
//!
//! fsm.start().await?;
//! fsm.raise_with(&Event::Login, Supplied::explicit("ada".to_string())).await?;
//! fsm.raise_with(&Event::Send, Supplied::explicit(250u64)).await?;
//! assert_eq!(fsm.current_state(), Some(State::Transfer));
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]

pub use async_trait::async_trait;

mod argument;
mod builder;
mod controller;
mod error;
mod fsm;
mod graph;
mod record;
mod resolver;

#[cfg(all(feature = "plantuml", debug_assertions))]
mod plantuml;

pub use argument::{Arg, ArgShape, ArgSpec, ArgType, Argument, Relay, Supplied, Value};
pub use builder::StateMachineBuilder;
pub use controller::Controller;
pub use error::{BuildError, BuildResult, CallbackFailure, Phase, TransitionError, TransitionResult};
pub use fsm::{ActiveState, Outcome, Prepared, StateMachine};
pub use graph::{Activity, ArgumentTransfer, EventId, StateId};
pub use record::ErrorSink;

pub mod prelude {
    //! Prelude module for convenient imports
    pub use crate::{
        Activity, Arg, ArgumentTransfer, BuildError, Controller, Outcome, Relay, StateMachine,
        StateMachineBuilder, Supplied, TransitionError,
    };
    pub use async_trait::async_trait;
}
