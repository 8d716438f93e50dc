//! Run-once process exit hooks.
//!
//! Callers register callbacks (the action cache registers its summary
//! printer here) that run once, after the main command completes and before
//! the process terminates.  Running the hooks a second time is a no-op.

use std::sync::Mutex;

type Hook = Box<dyn FnOnce() + Send>;

static HOOKS: Mutex<Vec<Hook>> = Mutex::new(Vec::new());

pub fn on_exit(hook: impl FnOnce() + Send + 'static) {
    HOOKS.lock().unwrap().push(Box::new(hook));
}

/// Runs every registered hook exactly once, in registration order.
pub fn run_exit_hooks() {
    let hooks = std::mem::take(&mut *HOOKS.lock().unwrap());
    for hook in hooks {
        hook();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn hooks_run_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        on_exit(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        run_exit_hooks();
        run_exit_hooks();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
