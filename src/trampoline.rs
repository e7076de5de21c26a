//! Runs nested work one job at a time instead of on a growing stack.
//!
//! Settling a node settles its successors, and dropping a pending node drops
//! its successors. Both go through [`run`], so a chain of any length is
//! walked by one loop at the outermost call.
use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
};

type Job = Box<dyn FnOnce()>;

struct Trampoline {
    jobs: RefCell<VecDeque<Job>>,
    running: Cell<bool>,
}

thread_local! {
    static TRAMPOLINE: Trampoline = Trampoline {
        jobs: RefCell::new(VecDeque::new()),
        running: Cell::new(false),
    };
}

/// Runs `job` before returning, unless a job is already running on this
/// thread; then it runs after every job queued ahead of it, before that outer
/// call returns.
pub(crate) fn run<F>(job: F)
where
    F: FnOnce() + 'static,
{
    let mut job = Some(Box::new(job) as Job);
    let outermost = TRAMPOLINE.try_with(|trampoline| {
        trampoline.jobs.borrow_mut().extend(job.take());
        !trampoline.running.replace(true)
    });
    match outermost {
        Ok(true) => drain(),
        Ok(false) => {}
        // Thread-local storage is already torn down: run inline.
        Err(_) => {
            if let Some(job) = job {
                job();
            }
        }
    }
}

fn drain() {
    struct Running;

    impl Drop for Running {
        fn drop(&mut self) {
            let _ = TRAMPOLINE.try_with(|trampoline| trampoline.running.set(false));
        }
    }

    let _running = Running;
    while let Some(job) = TRAMPOLINE.with(|trampoline| trampoline.jobs.borrow_mut().pop_front()) {
        job();
    }
}

#[cfg(test)]
mod tests {
    use super::run;
    use std::{cell::RefCell, rc::Rc};

    #[test]
    fn nested_jobs_run_after_the_current_one() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let outer = log.clone();
        run(move || {
            let inner = outer.clone();
            run(move || inner.borrow_mut().push("inner"));
            outer.borrow_mut().push("outer");
        });
        assert_eq!(*log.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn deep_nesting_keeps_a_flat_stack() {
        fn descend(left: u32, count: Rc<RefCell<u32>>) {
            *count.borrow_mut() += 1;
            if left > 0 {
                run(move || descend(left - 1, count));
            }
        }
        let count = Rc::new(RefCell::new(0));
        let counter = count.clone();
        run(move || descend(200_000, counter));
        assert_eq!(*count.borrow(), 200_001);
    }

    #[test]
    fn a_panicking_job_does_not_wedge_the_loop() {
        let result = std::panic::catch_unwind(|| run(|| panic!("job failed")));
        assert!(result.is_err());
        let ran = Rc::new(RefCell::new(false));
        let flag = ran.clone();
        run(move || *flag.borrow_mut() = true);
        assert!(*ran.borrow());
    }
}
