//! Continuation records waiting on a pending [`Deferred`].
//!
//! A record couples a caller's callback with the successor node that the
//! chaining call returned. When the predecessor settles, the record either
//! invokes its callback (the kinds match, or the record is [`Kind::OnSettled`])
//! or passes the settlement through to the successor untouched.
use crate::deferred::{Deferred, Settlement, State};
use crate::trampoline;
use std::{collections::VecDeque, fmt};

/// Which outcome a continuation reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// Registered by [`Deferred::then`].
    OnFulfilled,
    /// Registered by [`Deferred::catch`].
    OnRejected,
    /// Registered by [`Deferred::finally`]; fires on either outcome.
    OnSettled,
}

impl Kind {
    /// Whether a record of this kind invokes its callback for `state`.
    pub fn matches(self, state: State) -> bool {
        match (self, state) {
            (_, State::Pending) => false,
            (Kind::OnSettled, _) => true,
            (Kind::OnFulfilled, State::Fulfilled) => true,
            (Kind::OnRejected, State::Rejected) => true,
            _ => false,
        }
    }
}

type React<T, E> = Box<dyn FnOnce(Settlement<T, E>)>;

pub(crate) struct Continuation<T, E> {
    kind: Kind,
    react: Option<React<T, E>>,
    // Drops `react` on the trampoline; the reaction owns the successor, which
    // may own a long pending chain of its own.
    discard: fn(React<T, E>),
}

fn discard<T: 'static, E: 'static>(react: React<T, E>) {
    trampoline::run(move || drop(react));
}

impl<T, E> Continuation<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    fn new<R>(kind: Kind, react: R) -> Self
    where
        R: FnOnce(Settlement<T, E>) + 'static,
    {
        Self {
            kind,
            react: Some(Box::new(react)),
            discard: discard::<T, E>,
        }
    }

    pub(crate) fn on_fulfilled<U, F>(callback: F, successor: Deferred<U, E>) -> Self
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<U, E> + 'static,
    {
        Self::new(
            Kind::OnFulfilled,
            move |settlement| match settlement {
                Settlement::Fulfilled(value) => {
                    successor.complete(callback(value));
                }
                Settlement::Rejected(reason) => {
                    successor.settle_rejected(reason);
                }
            },
        )
    }

    /// Like [`on_fulfilled`](Self::on_fulfilled), but the successor follows the
    /// node the callback returns instead of fulfilling with it.
    pub(crate) fn on_fulfilled_adopting<U, F>(callback: F, successor: Deferred<U, E>) -> Self
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Deferred<U, E> + 'static,
    {
        Self::new(
            Kind::OnFulfilled,
            move |settlement| match settlement {
                Settlement::Fulfilled(value) => {
                    let source = callback(value);
                    successor.adopt(&source);
                }
                Settlement::Rejected(reason) => {
                    successor.settle_rejected(reason);
                }
            },
        )
    }

    pub(crate) fn on_rejected<F>(callback: F, successor: Deferred<T, E>) -> Self
    where
        F: FnOnce(E) -> Result<T, E> + 'static,
    {
        Self::new(
            Kind::OnRejected,
            move |settlement| match settlement {
                Settlement::Fulfilled(value) => {
                    successor.settle_fulfilled(value);
                }
                Settlement::Rejected(reason) => {
                    successor.complete(callback(reason));
                }
            },
        )
    }

    pub(crate) fn on_settled<U, F>(callback: F, successor: Deferred<U, E>) -> Self
    where
        U: Clone + 'static,
        F: FnOnce(Settlement<T, E>) -> Result<U, E> + 'static,
    {
        Self::new(
            Kind::OnSettled,
            move |settlement| {
                successor.complete(callback(settlement));
            },
        )
    }

    /// Copies the settlement onto `target` as is.
    pub(crate) fn forward(target: Deferred<T, E>) -> Self {
        Self::new(
            Kind::OnSettled,
            move |settlement| {
                target.settle(settlement);
            },
        )
    }

    pub(crate) fn react(mut self, settlement: Settlement<T, E>) {
        let state = settlement.state();
        if self.kind.matches(state) {
            tracing::trace!(kind = ?self.kind, ?state, "invoking continuation");
        } else {
            tracing::trace!(kind = ?self.kind, ?state, "passing settlement through");
        }
        if let Some(react) = self.react.take() {
            react(settlement);
        }
    }
}

impl<T, E> Continuation<T, E> {
    pub(crate) fn kind(&self) -> Kind {
        self.kind
    }
}

impl<T, E> Drop for Continuation<T, E> {
    fn drop(&mut self) {
        if let Some(react) = self.react.take() {
            (self.discard)(react);
        }
    }
}

impl<T, E> fmt::Debug for Continuation<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// FIFO of continuations owned by one pending node.
pub(crate) struct Queue<T, E> {
    records: VecDeque<Continuation<T, E>>,
}

impl<T, E> Queue<T, E> {
    pub(crate) fn new() -> Self {
        Self {
            records: VecDeque::new(),
        }
    }

    pub(crate) fn push(&mut self, record: Continuation<T, E>) {
        self.records.push_back(record);
    }

    pub(crate) fn kinds(&self) -> Vec<Kind> {
        self.records.iter().map(Continuation::kind).collect()
    }

    /// Empties the queue, yielding records in registration order.
    pub(crate) fn take(&mut self) -> VecDeque<Continuation<T, E>> {
        std::mem::take(&mut self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::{Continuation, Kind};
    use crate::{Deferred, Scheduler, Settlement, State};
    use std::rc::Rc;

    #[test]
    fn kinds_match_their_outcome() {
        assert!(Kind::OnFulfilled.matches(State::Fulfilled));
        assert!(!Kind::OnFulfilled.matches(State::Rejected));
        assert!(Kind::OnRejected.matches(State::Rejected));
        assert!(!Kind::OnRejected.matches(State::Fulfilled));
        assert!(Kind::OnSettled.matches(State::Fulfilled));
        assert!(Kind::OnSettled.matches(State::Rejected));
    }

    #[test]
    fn nothing_matches_pending() {
        for kind in [Kind::OnFulfilled, Kind::OnRejected, Kind::OnSettled] {
            assert!(!kind.matches(State::Pending));
        }
    }

    #[test]
    fn dropping_an_unrun_record_releases_its_callback() {
        let scheduler = Scheduler::new();
        let successor = Deferred::<i32, ()>::pending(&scheduler);
        let marker = Rc::new(());
        let held = marker.clone();
        let record = Continuation::on_fulfilled(
            move |n: i32| {
                let _held = &held;
                Ok(n)
            },
            successor.clone(),
        );
        assert_eq!(Rc::strong_count(&marker), 2);
        drop(record);
        assert_eq!(Rc::strong_count(&marker), 1);
        assert_eq!(successor.settlement(), None::<Settlement<i32, ()>>);
    }
}
