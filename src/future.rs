//! One-shot memoized futures.
//!
//! A `Future<T>` resolves exactly once; every `join()` after the first
//! returns a clone of the memoized value.  Two backings exist: `lazy` runs
//! the computation on the first joining thread (the deterministic mode used
//! when concurrency is disabled) and `spawn` runs it on a dedicated thread,
//! signaling completion through a condvar.
//!
//! A panic inside the work poisons the future: the panic propagates on the
//! running thread as usual, and every joiner re-panics with the captured
//! message instead of parking forever on a value that will never arrive.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Condvar, Mutex};

type Work<T> = Box<dyn FnOnce() -> T + Send>;

enum State<T> {
    /// Not started; the work is waiting for its first join (or its thread).
    Pending(Work<T>),
    /// Some thread is running the work; joiners wait on the condvar.
    Running,
    Done(T),
    /// The work panicked; joiners re-panic with the captured message.
    Poisoned(String),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

pub struct Future<T>(Arc<Inner<T>>);

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Future(self.0.clone())
    }
}

impl<T: Clone + Send + 'static> Future<T> {
    /// An already-resolved future.
    pub fn ready(value: T) -> Self {
        Future(Arc::new(Inner {
            state: Mutex::new(State::Done(value)),
            cond: Condvar::new(),
        }))
    }

    /// Runs `work` on the first thread that joins.
    pub fn lazy(work: impl FnOnce() -> T + Send + 'static) -> Self {
        Future(Arc::new(Inner {
            state: Mutex::new(State::Pending(Box::new(work))),
            cond: Condvar::new(),
        }))
    }

    /// Runs `work` on its own thread immediately.
    pub fn spawn(work: impl FnOnce() -> T + Send + 'static) -> Self {
        let fut = Self::lazy(work);
        let runner = fut.clone();
        std::thread::spawn(move || {
            runner.join();
        });
        fut
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.0.state.lock().unwrap(), State::Done(_))
    }

    /// Blocks until resolved and returns the value.  Memoized: if the work
    /// already ran, this is a cheap clone.  Panics if the work panicked, on
    /// every joining thread.
    pub fn join(&self) -> T {
        let mut state = self.0.state.lock().unwrap();
        loop {
            match &*state {
                State::Done(value) => return value.clone(),
                State::Poisoned(message) => {
                    let message = message.clone();
                    drop(state);
                    panic!("{}", message);
                }
                State::Running => {
                    state = self.0.cond.wait(state).unwrap();
                }
                State::Pending(_) => {
                    let work = match std::mem::replace(&mut *state, State::Running) {
                        State::Pending(work) => work,
                        _ => unreachable!(),
                    };
                    drop(state);
                    let result = std::panic::catch_unwind(AssertUnwindSafe(work));
                    let mut state = self.0.state.lock().unwrap();
                    match result {
                        Ok(value) => {
                            *state = State::Done(value.clone());
                            self.0.cond.notify_all();
                            return value;
                        }
                        Err(payload) => {
                            *state = State::Poisoned(panic_message(payload.as_ref()));
                            self.0.cond.notify_all();
                            drop(state);
                            std::panic::resume_unwind(payload);
                        }
                    }
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "future's work panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn ready_joins_immediately() {
        assert_eq!(Future::ready(5).join(), 5);
    }

    #[test]
    fn lazy_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let fut = Future::lazy(move || {
            c.fetch_add(1, Ordering::SeqCst);
            "v"
        });
        assert!(!fut.is_done());
        assert_eq!(fut.join(), "v");
        assert_eq!(fut.join(), "v");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_work_fails_every_joiner() {
        let fut: Future<u32> = Future::spawn(|| panic!("graph invariant broken"));
        let joiners: Vec<_> = (0..2)
            .map(|_| {
                let f = fut.clone();
                std::thread::spawn(move || f.join())
            })
            .collect();
        for j in joiners {
            let err = j.join().expect_err("joiner should observe the panic");
            let message = err
                .downcast_ref::<String>()
                .cloned()
                .or_else(|| err.downcast_ref::<&str>().map(|s| s.to_string()))
                .unwrap();
            assert!(message.contains("graph invariant broken"), "{}", message);
        }
    }

    #[test]
    fn spawn_runs_once_under_contention() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let fut = Future::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            c.fetch_add(1, Ordering::SeqCst);
            7u32
        });
        let joiners: Vec<_> = (0..8)
            .map(|_| {
                let f = fut.clone();
                std::thread::spawn(move || f.join())
            })
            .collect();
        for j in joiners {
            assert_eq!(j.join().unwrap(), 7);
        }
        assert_eq!(fut.join(), 7);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
