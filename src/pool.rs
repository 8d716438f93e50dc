//! A fixed-size pool of long-lived workers draining a bounded task queue.
//!
//! Used for background work (cache archiving) that must not stall the build.
//! `join()` is a barrier over currently-queued work, implemented with
//! sentinel tasks rather than waiting for the queue to drain, since tasks in
//! flight may queue more work concurrently.

use std::num::NonZeroUsize;
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;

enum Task {
    Run(Box<dyn FnOnce() + Send>),
    /// Barrier sentinel: the worker parks on the gate until every worker
    /// has picked one up.
    Wait(Arc<Gate>),
}

struct Gate {
    remaining: Mutex<usize>,
    cond: Condvar,
}

impl Gate {
    fn new(count: usize) -> Self {
        Gate {
            remaining: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Called by a worker: count down, then block until all workers arrived.
    fn arrive(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining -= 1;
        if *remaining == 0 {
            self.cond.notify_all();
        }
        while *remaining > 0 {
            remaining = self.cond.wait(remaining).unwrap();
        }
    }

    /// Called by the joiner: block until all workers arrived at the gate.
    fn await_all(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining > 0 {
            remaining = self.cond.wait(remaining).unwrap();
        }
    }
}

pub struct WorkerPool {
    sender: Option<mpsc::SyncSender<Task>>,
    workers: Vec<JoinHandle<()>>,
    size: NonZeroUsize,
}

impl WorkerPool {
    pub fn new(size: NonZeroUsize) -> Self {
        // A few slots per worker; a full queue back-pressures the producer.
        let (sender, receiver) = mpsc::sync_channel::<Task>(size.get() * 8);
        let receiver = Arc::new(Mutex::new(receiver));
        let workers = (0..size.get())
            .map(|_| {
                let receiver = receiver.clone();
                std::thread::spawn(move || loop {
                    let task = receiver.lock().unwrap().recv();
                    match task {
                        Ok(Task::Run(work)) => work(),
                        Ok(Task::Wait(gate)) => gate.arrive(),
                        Err(_) => break,
                    }
                })
            })
            .collect();
        WorkerPool {
            sender: Some(sender),
            workers,
            size,
        }
    }

    pub fn size(&self) -> NonZeroUsize {
        self.size
    }

    /// Enqueues a task; blocks while the queue is full.
    pub fn queue(&self, work: impl FnOnce() + Send + 'static) {
        self.sender
            .as_ref()
            .unwrap()
            .send(Task::Run(Box::new(work)))
            .expect("worker pool shut down");
    }

    /// Waits for every task queued before this call (including tasks queued
    /// by in-flight work before their sentinel is reached) to finish.
    pub fn join(&self) {
        let gate = Arc::new(Gate::new(self.size.get()));
        for _ in 0..self.size.get() {
            self.sender
                .as_ref()
                .unwrap()
                .send(Task::Wait(gate.clone()))
                .expect("worker pool shut down");
        }
        gate.await_all();
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets each worker's recv() fail and exit.
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(n: usize) -> WorkerPool {
        WorkerPool::new(NonZeroUsize::new(n).unwrap())
    }

    #[test]
    fn runs_queued_tasks() {
        let pool = pool(4);
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let c = count.clone();
            pool.queue(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn join_waits_for_work_queued_by_tasks() {
        let pool = Arc::new(pool(2));
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = count.clone();
            let p = pool.clone();
            pool.queue(move || {
                let c2 = c.clone();
                p.queue(move || {
                    c2.fetch_add(1, Ordering::SeqCst);
                });
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        // The first barrier covers the outer tasks; every nested queue()
        // happens before its outer task finishes, so a second barrier
        // covers the nested ones.
        pool.join();
        pool.join();
        assert_eq!(count.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn join_on_idle_pool_returns() {
        let pool = pool(3);
        pool.join();
        pool.join();
    }
}
