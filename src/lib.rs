//! Deferred values for a single-threaded event loop.
//!
//! A [`Deferred`] is settled exactly once, either fulfilled with a value or
//! rejected with a reason. Continuations chained with
//! [`then`](Deferred::then), [`catch`](Deferred::catch) and
//! [`finally`](Deferred::finally) run in registration order when it settles,
//! and each returns a new node for the continuation's own outcome.
//! [`Deferred::all`], [`Deferred::race`] and [`Deferred::all_settled`] combine
//! several nodes into one.
//!
//! Nothing here spawns threads. Work that has to wait for a later turn is
//! queued on a [`Scheduler`], which the caller drives.
//!
//! # Examples
//!
//! ```
//! use promise_chain::{Deferred, Scheduler, Settlement};
//! use std::time::Duration;
//!
//! let scheduler = Scheduler::new();
//! let delayed = |value: u32, ms: u64| {
//!     let timer = scheduler.clone();
//!     Deferred::<u32, String>::new(&scheduler, move |resolver| {
//!         timer.set_timeout(Duration::from_millis(ms), move || {
//!             resolver.fulfill(value);
//!         });
//!         Ok(())
//!     })
//! };
//!
//! let winner = Deferred::race(&scheduler, [delayed(1, 100), delayed(2, 10)]);
//! let doubled = winner.then(|n| Ok(n * 2));
//! assert_eq!(doubled.wait(), Ok(Settlement::Fulfilled(4)));
//! ```
mod combinators;
pub mod continuation;
pub mod deferred;
pub mod scheduler;
mod trampoline;

pub use continuation::Kind;
pub use deferred::{Deferred, Resolver, Settled, Settlement, State};
pub use scheduler::{Config, Scheduler};

/// Failures of the event loop itself. Rejections are carried by each
/// [`Deferred`]'s own reason type, never by this one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("scheduler went idle while the awaited value was still pending")]
    Stalled,
    #[error("scheduler ran out of its budget of {0} ticks")]
    BudgetExhausted(usize),
}
