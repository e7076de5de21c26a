use crate::continuation::{Continuation, Kind, Queue};
use crate::{trampoline, Error, Scheduler};
use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

/// Where a [`Deferred`] is in its lifecycle. Moves out of `Pending` at most
/// once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Pending,
    Fulfilled,
    Rejected,
}

/// Terminal outcome of a [`Deferred`]: the fulfillment value or the rejection
/// reason.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Settlement<T, E> {
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> Settlement<T, E> {
    pub fn state(&self) -> State {
        match self {
            Settlement::Fulfilled(_) => State::Fulfilled,
            Settlement::Rejected(_) => State::Rejected,
        }
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Settlement::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Settlement::Rejected(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Settlement::Fulfilled(value) => Some(value),
            Settlement::Rejected(_) => None,
        }
    }

    pub fn reason(&self) -> Option<&E> {
        match self {
            Settlement::Fulfilled(_) => None,
            Settlement::Rejected(reason) => Some(reason),
        }
    }

    pub fn into_result(self) -> Result<T, E> {
        match self {
            Settlement::Fulfilled(value) => Ok(value),
            Settlement::Rejected(reason) => Err(reason),
        }
    }
}

impl<T, E> From<Result<T, E>> for Settlement<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Settlement::Fulfilled(value),
            Err(reason) => Settlement::Rejected(reason),
        }
    }
}

/// A value that becomes known later, exactly once.
///
/// Every chaining call ([`then`](Self::then), [`catch`](Self::catch),
/// [`finally`](Self::finally)) returns a fresh node that settles when its
/// callback has run. Rejections skip `then` callbacks and travel down the
/// chain until a `catch` or `finally` handles them.
///
/// # Examples
///
/// ```
/// use promise_chain::{Deferred, Scheduler, Settlement};
///
/// let scheduler = Scheduler::new();
/// let recovered = Deferred::<i32, String>::reject(&scheduler, "offline".into())
///     .then(|n| Ok(n * 2))
///     .catch(|reason| Ok(reason.len() as i32))
///     .then(|n| Ok(n + 1));
/// assert_eq!(recovered.wait(), Ok(Settlement::Fulfilled(8)));
/// ```
pub struct Deferred<T, E> {
    inner: Rc<RefCell<Inner<T, E>>>,
    scheduler: Scheduler,
}

struct Inner<T, E> {
    id: u64,
    settlement: Option<Settlement<T, E>>,
    queue: Queue<T, E>,
    wakers: Vec<Waker>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

/// The settling side of a [`Deferred`]. Only handed out to producers and by
/// [`Deferred::channel`]; the first `fulfill` or `reject` wins.
pub struct Resolver<T, E> {
    target: Deferred<T, E>,
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
        }
    }
}

impl<T, E> Resolver<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    /// Returns `false` if the value had already settled.
    pub fn fulfill(&self, value: T) -> bool {
        self.target.settle_fulfilled(value)
    }

    /// Returns `false` if the value had already settled.
    pub fn reject(&self, reason: E) -> bool {
        self.target.settle_rejected(reason)
    }

    pub fn settle(&self, result: Result<T, E>) -> bool {
        self.target.complete(result)
    }

    pub fn is_settled(&self) -> bool {
        self.target.state() != State::Pending
    }
}

impl<T, E> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("target", &self.target.id())
            .finish()
    }
}

impl<T, E> Deferred<T, E> {
    pub fn id(&self) -> u64 {
        self.inner.borrow().id
    }

    pub fn state(&self) -> State {
        self.inner
            .borrow()
            .settlement
            .as_ref()
            .map_or(State::Pending, Settlement::state)
    }

    pub fn is_pending(&self) -> bool {
        self.state() == State::Pending
    }

    /// Kinds of the continuations still waiting, in registration order.
    /// Always empty once settled.
    pub fn queued(&self) -> Vec<Kind> {
        self.inner.borrow().queue.kinds()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// A future resolving to this value's settlement. Any number may wait.
    pub fn settled(&self) -> Settled<T, E> {
        Settled {
            deferred: self.clone(),
        }
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    /// Runs `producer` right away with the resolver for the new value.
    ///
    /// The producer may settle before returning or keep the resolver and settle
    /// later. Returning `Err` rejects the value unless it had already settled.
    ///
    /// ```
    /// use promise_chain::{Deferred, Scheduler, State};
    /// use std::time::Duration;
    ///
    /// let scheduler = Scheduler::new();
    /// let timer = scheduler.clone();
    /// let late = Deferred::<&str, ()>::new(&scheduler, move |resolver| {
    ///     timer.set_timeout(Duration::from_millis(30), move || {
    ///         resolver.fulfill("done");
    ///     });
    ///     Ok(())
    /// });
    /// assert_eq!(late.state(), State::Pending);
    /// scheduler.run_until_idle().unwrap();
    /// assert_eq!(late.state(), State::Fulfilled);
    /// ```
    pub fn new<P>(scheduler: &Scheduler, producer: P) -> Self
    where
        P: FnOnce(Resolver<T, E>) -> Result<(), E>,
    {
        let deferred = Self::pending(scheduler);
        let resolver = Resolver {
            target: deferred.clone(),
        };
        if let Err(reason) = producer(resolver) {
            tracing::debug!(id = deferred.id(), "producer failed");
            deferred.settle_rejected(reason);
        }
        deferred
    }

    /// A pending value together with the only handle that can settle it.
    pub fn channel(scheduler: &Scheduler) -> (Resolver<T, E>, Self) {
        let deferred = Self::pending(scheduler);
        (
            Resolver {
                target: deferred.clone(),
            },
            deferred,
        )
    }

    /// Fulfills with `value` on the scheduler's next turn.
    pub fn resolve(scheduler: &Scheduler, value: T) -> Self {
        Self::new(scheduler, |resolver| {
            scheduler.enqueue(move || {
                resolver.fulfill(value);
            });
            Ok(())
        })
    }

    /// Rejects with `reason` on the scheduler's next turn.
    pub fn reject(scheduler: &Scheduler, reason: E) -> Self {
        Self::new(scheduler, |resolver| {
            scheduler.enqueue(move || {
                resolver.reject(reason);
            });
            Ok(())
        })
    }

    pub(crate) fn pending(scheduler: &Scheduler) -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                id: scheduler.next_id(),
                settlement: None,
                queue: Queue::new(),
                wakers: Vec::new(),
            })),
            scheduler: scheduler.clone(),
        }
    }

    /// Copy of the settlement, or `None` while pending.
    pub fn settlement(&self) -> Option<Settlement<T, E>> {
        self.inner.borrow().settlement.clone()
    }

    /// Drives the scheduler until this value settles.
    pub fn wait(&self) -> Result<Settlement<T, E>, Error> {
        self.scheduler.block_on(self.settled())
    }

    /// Runs `on_fulfilled` with the value. An `Ok` fulfills the returned node
    /// and an `Err` rejects it; a rejection skips the callback and is passed on.
    pub fn then<U, F>(&self, on_fulfilled: F) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<U, E> + 'static,
    {
        let successor = Deferred::pending(&self.scheduler);
        self.register(Continuation::on_fulfilled(on_fulfilled, successor.clone()));
        successor
    }

    /// Like [`then`](Self::then) for callbacks that produce another deferred
    /// value: the returned node settles the way that one does.
    ///
    /// ```
    /// use promise_chain::{Deferred, Scheduler, Settlement};
    ///
    /// let scheduler = Scheduler::new();
    /// let inner = scheduler.clone();
    /// let user = Deferred::<u32, String>::resolve(&scheduler, 7)
    ///     .then_deferred(move |id| Deferred::resolve(&inner, format!("user-{id}")));
    /// assert_eq!(user.wait(), Ok(Settlement::Fulfilled("user-7".to_string())));
    /// ```
    pub fn then_deferred<U, F>(&self, on_fulfilled: F) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Deferred<U, E> + 'static,
    {
        let successor = Deferred::pending(&self.scheduler);
        self.register(Continuation::on_fulfilled_adopting(
            on_fulfilled,
            successor.clone(),
        ));
        successor
    }

    /// Runs `on_rejected` with the reason; `Ok` recovers to a fulfilled node.
    /// A fulfillment skips the callback and is passed on.
    pub fn catch<F>(&self, on_rejected: F) -> Deferred<T, E>
    where
        F: FnOnce(E) -> Result<T, E> + 'static,
    {
        let successor = Deferred::pending(&self.scheduler);
        self.register(Continuation::on_rejected(on_rejected, successor.clone()));
        successor
    }

    /// Runs `on_settled` whatever the outcome. Its result replaces the
    /// settlement for the returned node.
    pub fn finally<U, F>(&self, on_settled: F) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(Settlement<T, E>) -> Result<U, E> + 'static,
    {
        let successor = Deferred::pending(&self.scheduler);
        self.register(Continuation::on_settled(on_settled, successor.clone()));
        successor
    }

    /// Follows `source`: settles the same way once it does.
    pub(crate) fn adopt(&self, source: &Deferred<T, E>) {
        tracing::trace!(id = self.id(), source = source.id(), "adopting");
        source.register(Continuation::forward(self.clone()));
    }

    pub(crate) fn settle_fulfilled(&self, value: T) -> bool {
        self.settle(Settlement::Fulfilled(value))
    }

    pub(crate) fn settle_rejected(&self, reason: E) -> bool {
        self.settle(Settlement::Rejected(reason))
    }

    pub(crate) fn complete(&self, result: Result<T, E>) -> bool {
        self.settle(result.into())
    }

    /// Records the settlement and drains the queue. No-op once settled.
    ///
    /// Successors settled by the drain are drained after this node's queue,
    /// from one loop, so a chain of any length never nests on the stack.
    pub(crate) fn settle(&self, settlement: Settlement<T, E>) -> bool {
        // Release the borrow before draining: callbacks may chain onto this node.
        let (id, records, wakers) = {
            let mut inner = self.inner.borrow_mut();
            if inner.settlement.is_some() {
                tracing::debug!(id = inner.id, "ignoring repeated settlement");
                return false;
            }
            inner.settlement = Some(settlement.clone());
            (inner.id, inner.queue.take(), std::mem::take(&mut inner.wakers))
        };
        tracing::trace!(
            id,
            state = ?settlement.state(),
            continuations = records.len(),
            "settled"
        );
        trampoline::run(move || {
            for record in records {
                record.react(settlement.clone());
            }
        });
        for waker in wakers {
            waker.wake();
        }
        true
    }

    fn register(&self, record: Continuation<T, E>) {
        let mut inner = self.inner.borrow_mut();
        let Some(settlement) = inner.settlement.clone() else {
            inner.queue.push(record);
            return;
        };
        let id = inner.id;
        drop(inner);
        // Already settled: still run on a later turn, never inside this call.
        tracing::trace!(id, kind = ?record.kind(), "scheduling late continuation");
        self.scheduler.enqueue(move || record.react(settlement));
    }
}

impl<T, E> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("queued", &self.queued())
            .finish()
    }
}

/// Future returned by [`Deferred::settled`].
#[must_use = "futures do nothing unless polled"]
pub struct Settled<T, E> {
    deferred: Deferred<T, E>,
}

impl<T, E> Future for Settled<T, E>
where
    T: Clone,
    E: Clone,
{
    type Output = Settlement<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.deferred.inner.borrow_mut();
        if let Some(settlement) = inner.settlement.clone() {
            return Poll::Ready(settlement);
        }
        if !inner.wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            inner.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T, E> fmt::Debug for Settled<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settled")
            .field("deferred", &self.deferred)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::{Deferred, Settlement, State};
    use crate::{Kind, Scheduler};
    use futures::FutureExt;
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn producer_can_settle_before_returning() {
        let scheduler = Scheduler::new();
        let deferred = Deferred::<i32, ()>::new(&scheduler, |resolver| {
            assert!(resolver.fulfill(1));
            Ok(())
        });
        assert_eq!(deferred.state(), State::Fulfilled);
        assert_eq!(deferred.settlement(), Some(Settlement::Fulfilled(1)));
        assert!(scheduler.is_idle());
    }

    #[test]
    fn producer_error_rejects() {
        let scheduler = Scheduler::new();
        let deferred = Deferred::<i32, &str>::new(&scheduler, |_| Err("boom"));
        assert_eq!(deferred.settlement(), Some(Settlement::Rejected("boom")));
    }

    #[test]
    fn producer_error_after_settling_is_ignored() {
        let scheduler = Scheduler::new();
        let deferred = Deferred::<i32, &str>::new(&scheduler, |resolver| {
            resolver.fulfill(3);
            Err("late")
        });
        assert_eq!(deferred.settlement(), Some(Settlement::Fulfilled(3)));
    }

    #[test]
    fn static_resolve_waits_a_turn() {
        let scheduler = Scheduler::new();
        let deferred = Deferred::<i32, ()>::resolve(&scheduler, 5);
        assert!(deferred.is_pending());
        assert!(scheduler.tick());
        assert_eq!(deferred.settlement(), Some(Settlement::Fulfilled(5)));
    }

    #[test]
    fn settlement_is_first_write_wins() {
        let scheduler = Scheduler::new();
        let (resolver, deferred) = Deferred::<i32, i32>::channel(&scheduler);
        assert!(!resolver.is_settled());
        assert!(resolver.reject(1));
        assert!(!resolver.fulfill(2));
        assert!(!resolver.reject(3));
        assert!(resolver.is_settled());
        assert_eq!(deferred.settlement(), Some(Settlement::Rejected(1)));
    }

    #[test]
    fn queue_drains_on_settlement() {
        let scheduler = Scheduler::new();
        let (resolver, deferred) = Deferred::<i32, i32>::channel(&scheduler);
        let _ = deferred.then(|n| Ok(n));
        let _ = deferred.catch(|n| Ok(n));
        let _ = deferred.finally(|_| Ok(()));
        assert_eq!(
            deferred.queued(),
            vec![Kind::OnFulfilled, Kind::OnRejected, Kind::OnSettled]
        );
        resolver.fulfill(1);
        assert!(deferred.queued().is_empty());
    }

    #[test]
    fn successors_are_distinct_nodes() {
        let scheduler = Scheduler::new();
        let deferred = Deferred::<i32, ()>::resolve(&scheduler, 1);
        let next = deferred.then(|n| Ok(n));
        assert_ne!(deferred.id(), next.id());
        assert!(next.is_pending());
    }

    #[test]
    fn late_registration_runs_on_a_later_turn() {
        let scheduler = Scheduler::new();
        let (resolver, deferred) = Deferred::<i32, ()>::channel(&scheduler);
        resolver.fulfill(4);
        let ran = Rc::new(RefCell::new(false));
        let flag = ran.clone();
        let next = deferred.then(move |n| {
            *flag.borrow_mut() = true;
            Ok(n * 10)
        });
        assert!(!*ran.borrow());
        assert!(next.is_pending());
        scheduler.run_until_idle().unwrap();
        assert!(*ran.borrow());
        assert_eq!(next.settlement(), Some(Settlement::Fulfilled(40)));
    }

    #[test]
    fn callback_may_chain_onto_its_own_node() {
        let scheduler = Scheduler::new();
        let (resolver, deferred) = Deferred::<i32, ()>::channel(&scheduler);
        let nested = Rc::new(RefCell::new(None));
        let (slot, again) = (nested.clone(), deferred.clone());
        let _ = deferred.then(move |n| {
            *slot.borrow_mut() = Some(again.then(|m| Ok(m + 1)));
            Ok(n)
        });
        resolver.fulfill(1);
        scheduler.run_until_idle().unwrap();
        let nested = nested.borrow_mut().take().unwrap();
        assert_eq!(nested.settlement(), Some(Settlement::Fulfilled(2)));
    }

    #[test]
    fn siblings_react_before_successors() {
        let scheduler = Scheduler::new();
        let (resolver, deferred) = Deferred::<i32, ()>::channel(&scheduler);
        let calls = Rc::new(RefCell::new(Vec::new()));
        let push = |name: &'static str| {
            let calls = calls.clone();
            move |n: i32| {
                calls.borrow_mut().push(name);
                Ok(n)
            }
        };
        let _ = deferred.then(push("a")).then(push("a.1"));
        let _ = deferred.then(push("b"));
        resolver.fulfill(1);
        assert_eq!(*calls.borrow(), vec!["a", "b", "a.1"]);
    }

    #[test]
    fn settled_future_wakes_after_settlement() {
        let scheduler = Scheduler::new();
        let (resolver, deferred) = Deferred::<&str, ()>::channel(&scheduler);
        let mut first = deferred.settled();
        let second = deferred.settled();
        assert_eq!((&mut first).now_or_never(), None);
        resolver.fulfill("ready");
        assert_eq!(first.now_or_never(), Some(Settlement::Fulfilled("ready")));
        assert_eq!(second.now_or_never(), Some(Settlement::Fulfilled("ready")));
    }

    #[test]
    fn settlement_helpers() {
        let ok: Settlement<i32, &str> = Ok(1).into();
        let err: Settlement<i32, &str> = Err("no").into();
        assert!(ok.is_fulfilled() && !ok.is_rejected());
        assert_eq!(ok.value(), Some(&1));
        assert_eq!(ok.reason(), None);
        assert_eq!(err.reason(), Some(&"no"));
        assert_eq!(err.state(), State::Rejected);
        assert_eq!(err.into_result(), Err("no"));
    }
}
