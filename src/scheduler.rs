//! A single-threaded cooperative event loop.
//!
//! Deferred values never run their continuations on another thread. Anything
//! that has to happen "later" is pushed onto a [`Scheduler`]: either the task
//! queue, which runs in FIFO order, or the timer queue, which fires on a
//! virtual clock once the task queue is empty.
use crate::Error;
use futures::task::noop_waker_ref;
use std::{
    cell::{Cell, RefCell},
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, VecDeque},
    fmt,
    future::Future,
    rc::Rc,
    task::{Context, Poll},
    time::Duration,
};

/// Default number of ticks a scheduler may run before giving up.
pub const DEFAULT_TICK_BUDGET: usize = 1_000_000;

type Task = Box<dyn FnOnce()>;

/// Scheduler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Upper bound on ticks for a single [`Scheduler::run_until_idle`] or
    /// [`Scheduler::block_on`] call.
    pub tick_budget: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tick_budget: DEFAULT_TICK_BUDGET,
        }
    }
}

/// Handle to an event loop. Cloning is cheap and every clone drives the same
/// queues.
///
/// Every [`Deferred`](crate::Deferred) holds a clone, and queued tasks often
/// hold deferred values, so a scheduler dropped with work still queued keeps
/// itself alive. Drain it with [`run_until_idle`](Self::run_until_idle) or
/// discard the leftovers with [`clear`](Self::clear) first.
///
/// # Examples
///
/// ```
/// use promise_chain::Scheduler;
/// use std::{cell::RefCell, rc::Rc, time::Duration};
///
/// let scheduler = Scheduler::new();
/// let log = Rc::new(RefCell::new(Vec::new()));
/// let (a, b) = (log.clone(), log.clone());
/// scheduler.set_timeout(Duration::from_millis(5), move || a.borrow_mut().push("timer"));
/// scheduler.enqueue(move || b.borrow_mut().push("task"));
/// scheduler.run_until_idle().unwrap();
/// assert_eq!(*log.borrow(), vec!["task", "timer"]);
/// assert_eq!(scheduler.now(), Duration::from_millis(5));
/// ```
#[derive(Clone)]
pub struct Scheduler {
    shared: Rc<Shared>,
}

struct Shared {
    config: Config,
    next_id: Cell<u64>,
    queue: RefCell<Queue>,
}

#[derive(Default)]
struct Queue {
    tasks: VecDeque<Task>,
    timers: BinaryHeap<Reverse<Timer>>,
    now: Duration,
    next_seq: u64,
}

struct Timer {
    deadline: Duration,
    seq: u64,
    task: Task,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

impl Queue {
    /// Moves the clock to the earliest timer and hands back its task.
    fn advance(&mut self) -> Option<Task> {
        let Reverse(timer) = self.timers.pop()?;
        if timer.deadline > self.now {
            self.now = timer.deadline;
        }
        tracing::trace!(now = ?self.now, seq = timer.seq, "timer fired");
        Some(timer.task)
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            shared: Rc::new(Shared {
                config,
                next_id: Cell::new(0),
                queue: RefCell::new(Queue::default()),
            }),
        }
    }

    pub fn config(&self) -> Config {
        self.shared.config
    }

    /// Current virtual time. Starts at zero and only moves when a timer fires.
    pub fn now(&self) -> Duration {
        self.shared.queue.borrow().now
    }

    /// Runs `task` on a later turn, after every task enqueued before it.
    pub fn enqueue<F>(&self, task: F)
    where
        F: FnOnce() + 'static,
    {
        let mut queue = self.shared.queue.borrow_mut();
        queue.tasks.push_back(Box::new(task));
        tracing::trace!(queued = queue.tasks.len(), "task enqueued");
    }

    /// Runs `task` once the virtual clock has moved `delay` past [`now`](Self::now).
    pub fn set_timeout<F>(&self, delay: Duration, task: F)
    where
        F: FnOnce() + 'static,
    {
        let mut queue = self.shared.queue.borrow_mut();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        let deadline = queue.now.saturating_add(delay);
        queue.timers.push(Reverse(Timer {
            deadline,
            seq,
            task: Box::new(task),
        }));
        tracing::trace!(?delay, ?deadline, seq, "timer scheduled");
    }

    /// Number of tasks and timers still waiting to run.
    pub fn pending(&self) -> usize {
        let queue = self.shared.queue.borrow();
        queue.tasks.len() + queue.timers.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Drops every queued task and timer without running them and returns how
    /// many there were. The clock stays where it is.
    pub fn clear(&self) -> usize {
        let (tasks, timers) = {
            let mut queue = self.shared.queue.borrow_mut();
            (
                std::mem::take(&mut queue.tasks),
                std::mem::take(&mut queue.timers),
            )
        };
        let cleared = tasks.len() + timers.len();
        tracing::debug!(cleared, "scheduler cleared");
        // Dropped after the borrow ends: a capture may use this scheduler in its drop.
        drop(tasks);
        drop(timers);
        cleared
    }

    /// Runs a single task, firing the next timer when no task is queued.
    /// Returns `false` if there was nothing to do.
    pub fn tick(&self) -> bool {
        // The borrow must end before the task runs: tasks enqueue more work.
        let task = {
            let mut queue = self.shared.queue.borrow_mut();
            match queue.tasks.pop_front() {
                Some(task) => Some(task),
                None => queue.advance(),
            }
        };
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Ticks until both queues are empty and returns how many ticks ran.
    pub fn run_until_idle(&self) -> Result<usize, Error> {
        let budget = self.shared.config.tick_budget;
        let mut ticks = 0;
        while !self.is_idle() {
            if ticks >= budget {
                tracing::debug!(budget, pending = self.pending(), "tick budget exhausted");
                return Err(Error::BudgetExhausted(budget));
            }
            self.tick();
            ticks += 1;
        }
        Ok(ticks)
    }

    /// Polls `future` to completion, ticking the loop whenever it is pending.
    ///
    /// Fails with [`Error::Stalled`] if the loop runs dry first, since nothing
    /// left could ever wake the future.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, Error> {
        futures::pin_mut!(future);
        let mut cx = Context::from_waker(noop_waker_ref());
        let budget = self.shared.config.tick_budget;
        let mut ticks = 0;
        loop {
            if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                return Ok(output);
            }
            if ticks >= budget {
                tracing::debug!(budget, "tick budget exhausted while blocking");
                return Err(Error::BudgetExhausted(budget));
            }
            if !self.tick() {
                return Err(Error::Stalled);
            }
            ticks += 1;
        }
    }

    pub(crate) fn next_id(&self) -> u64 {
        let id = self.shared.next_id.get();
        self.shared.next_id.set(id + 1);
        id
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.shared.config)
            .field("now", &self.now())
            .field("pending", &self.pending())
            .finish()
    }
}
