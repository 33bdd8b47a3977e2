//! # Actors
//!
//! An actor is plain single-threaded logic plus the scheduling state it owns (timers and
//! resumable tasks). Its [`ActorLoop`] is the only thing that ever calls into it; everyone
//! else talks to it through an [`ActorHandle`].

pub mod handle;
pub mod runtime;
pub mod types;

pub use handle::ActorHandle;
pub use runtime::{ActorLoop, LoopSettings};
pub use types::{Actor, ActorCore, ActorPhase, ActorPhaseManager};
