//! Owned handle for a spawned timer or loop.
//!
//! The scheduler's interval and the aggregator's debounce timer both live in a
//! `CancelableTask`: replacing or dropping the handle aborts the task, so no
//! timer outlives the component that armed it.

use std::future::Future;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct CancelableTask {
    handle: Option<JoinHandle<()>>,
}

impl CancelableTask {
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Spawn `fut`, aborting whatever this handle was running before.
    pub fn start<F>(&mut self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(fut));
    }

    /// Abort the task if one is running. Returns whether anything was aborted.
    pub fn cancel(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                let was_running = !handle.is_finished();
                handle.abort();
                was_running
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for CancelableTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn restart_aborts_previous_task() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut task = CancelableTask::new();

        for _ in 0..3 {
            let fired = fired.clone();
            task.start(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                fired.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::advance(Duration::from_millis(20)).await;
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_task() {
        let fired = Arc::new(AtomicUsize::new(0));
        let mut task = CancelableTask::new();
        let f = fired.clone();
        task.start(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            f.fetch_add(1, Ordering::SeqCst);
        });
        assert!(task.is_running());
        assert!(task.cancel());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!task.is_running());
    }
}
