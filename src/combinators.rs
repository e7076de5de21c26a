//! `all`, `race` and `all_settled`.
//!
//! Each combinator hangs exactly one `then` and one `catch` off every input
//! and settles its own output through a [`Resolver`]. Inputs are never
//! touched directly, and they keep settling after the output is decided.
use crate::deferred::{Deferred, Resolver, Settlement};
use crate::Scheduler;
use std::{cell::RefCell, rc::Rc};

/// Positional results gathered from the inputs of a combinator.
struct Slots<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

impl<T> Slots<T> {
    fn new(len: usize) -> Self {
        Self {
            values: std::iter::repeat_with(|| None).take(len).collect(),
            remaining: len,
        }
    }

    /// Stores `value` at `index`; yields every value in input order once the
    /// last empty slot is filled.
    fn fill(&mut self, index: usize, value: T) -> Option<Vec<T>> {
        let slot = self.values.get_mut(index)?;
        if slot.replace(value).is_none() {
            self.remaining -= 1;
        }
        if self.remaining > 0 {
            return None;
        }
        self.values.iter_mut().map(Option::take).collect()
    }
}

impl<T, E> Deferred<T, E>
where
    T: Clone + 'static,
    E: Clone + 'static,
{
    /// Fulfills with every input's value, in input order, once all have
    /// fulfilled. Rejects with the first rejection without waiting for the
    /// rest. An empty input fulfills at once with an empty vector.
    ///
    /// ```
    /// use promise_chain::{Deferred, Scheduler, Settlement};
    ///
    /// let scheduler = Scheduler::new();
    /// let inputs = (1..=3).map(|n| Deferred::<i32, ()>::resolve(&scheduler, n));
    /// let all = Deferred::all(&scheduler, inputs);
    /// assert_eq!(all.wait(), Ok(Settlement::Fulfilled(vec![1, 2, 3])));
    /// ```
    pub fn all<I>(scheduler: &Scheduler, inputs: I) -> Deferred<Vec<T>, E>
    where
        I: IntoIterator<Item = Deferred<T, E>>,
    {
        let inputs: Vec<_> = inputs.into_iter().collect();
        let (resolver, output) = Deferred::<Vec<T>, E>::channel(scheduler);
        tracing::debug!(output = output.id(), inputs = inputs.len(), "all");
        if inputs.is_empty() {
            resolver.fulfill(Vec::new());
            return output;
        }
        let slots = Rc::new(RefCell::new(Slots::<T>::new(inputs.len())));
        for (index, input) in inputs.iter().enumerate() {
            let (slots, on_value) = (slots.clone(), resolver.clone());
            let _ = input.then(move |value| {
                if let Some(values) = slots.borrow_mut().fill(index, value) {
                    on_value.fulfill(values);
                }
                Ok(())
            });
            let _ = input.catch(reject_with::<T, _, _>(resolver.clone()));
        }
        output
    }

    /// Settles the way the first input to settle does, in either direction.
    /// An empty input never settles.
    pub fn race<I>(scheduler: &Scheduler, inputs: I) -> Deferred<T, E>
    where
        I: IntoIterator<Item = Deferred<T, E>>,
    {
        let (resolver, output) = Deferred::<T, E>::channel(scheduler);
        let mut count = 0;
        for input in inputs {
            let on_value = resolver.clone();
            let _ = input.then(move |value: T| {
                on_value.fulfill(value);
                Ok(())
            });
            let _ = input.catch(reject_with::<T, _, _>(resolver.clone()));
            count += 1;
        }
        tracing::debug!(output = output.id(), inputs = count, "race");
        output
    }

    /// Fulfills with every input's settlement, in input order, once all have
    /// settled. Never rejects. An empty input fulfills at once.
    pub fn all_settled<I>(scheduler: &Scheduler, inputs: I) -> Deferred<Vec<Settlement<T, E>>, E>
    where
        I: IntoIterator<Item = Deferred<T, E>>,
    {
        let inputs: Vec<_> = inputs.into_iter().collect();
        let (resolver, output) = Deferred::<Vec<Settlement<T, E>>, E>::channel(scheduler);
        tracing::debug!(output = output.id(), inputs = inputs.len(), "all_settled");
        if inputs.is_empty() {
            resolver.fulfill(Vec::new());
            return output;
        }
        let slots = Rc::new(RefCell::new(Slots::<Settlement<T, E>>::new(inputs.len())));
        for (index, input) in inputs.iter().enumerate() {
            let (fulfilled, on_value) = (slots.clone(), resolver.clone());
            let _ = input.then(move |value| {
                let outcome = Settlement::Fulfilled(value);
                if let Some(outcomes) = fulfilled.borrow_mut().fill(index, outcome) {
                    on_value.fulfill(outcomes);
                }
                Ok(())
            });
            let (rejected, on_reason) = (slots.clone(), resolver.clone());
            let _ = input.catch(move |reason: E| {
                let outcome = Settlement::Rejected(reason.clone());
                if let Some(outcomes) = rejected.borrow_mut().fill(index, outcome) {
                    on_reason.fulfill(outcomes);
                }
                Err(reason)
            });
        }
        output
    }
}

/// A `catch` handler that rejects `resolver` and keeps its own node rejected.
fn reject_with<T, U, E>(resolver: Resolver<U, E>) -> impl FnOnce(E) -> Result<T, E>
where
    U: Clone + 'static,
    E: Clone + 'static,
{
    move |reason| {
        resolver.reject(reason.clone());
        Err(reason)
    }
}
