//! Core abstractions shared by the rewriting engine.
//!
//! These types decouple the engine from its host: the transaction view stands
//! in for the HTTP state machine, the event types for the host's scheduler,
//! and the resolver for its DNS layer.

pub mod context;
pub mod error;
pub mod event;
pub mod resolver;

pub use context::Transaction;
pub use error::{ErrorContext, RemapError, RemapResult};
pub use event::{Action, Continuation, Event, Scheduler, StepScheduler};
pub use resolver::{DnsResolver, HostResolver, StaticResolver};
