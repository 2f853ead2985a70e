use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, TryRecvError};
use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub enum PoolState {
    Running(Arc<ThreadPool>),
    Stopped,
}

/// How a submitted task ended.
#[derive(Debug, PartialEq)]
pub enum TaskOutcome<T> {
    Done(T),
    Panicked(String),
    /// Cancelled before it started; the job never ran.
    Cancelled,
}

/// One-shot handle to a task running on a `WorkerPool`.
pub struct TaskHandle<T> {
    rx: Receiver<TaskOutcome<T>>,
    cancel: Arc<AtomicBool>,
}

impl<T> TaskHandle<T> {
    /// Non-blocking; `None` while the task is still queued or running.
    pub fn poll(&self) -> Option<TaskOutcome<T>> {
        match self.rx.try_recv() {
            Ok(o) => Some(o),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(TaskOutcome::Panicked("task dropped without reporting".into())),
        }
    }

    pub fn wait(&self) -> TaskOutcome<T> {
        self.rx.recv().unwrap_or_else(|_| TaskOutcome::Panicked("task dropped without reporting".into()))
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

/// Rayon pool with an explicit Running/Stopped lifecycle.
///
/// A stopped pool is rebuilt on the next `spawn`.
pub struct WorkerPool {
    name: String,
    threads: usize,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, threads: usize) -> Self {
        Self { name: name.into(), threads: threads.max(1), state: Mutex::new(PoolState::Stopped) }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.lock(), PoolState::Running(_))
    }

    fn running_pool(&self) -> Result<Arc<ThreadPool>> {
        let mut state = self.state.lock();
        if let PoolState::Running(pool) = &*state {
            return Ok(pool.clone());
        }
        let name = self.name.clone();
        let label = self.name.clone();
        let pool = ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(move |i| format!("{}-{}", name, i))
            .panic_handler(move |p| {
                log::error!("[worker_pool] {} worker panicked outside a task: {}", label, panic_message(p.as_ref()));
            })
            .build()
            .with_context(|| format!("build worker pool {}", self.name))?;
        let pool = Arc::new(pool);
        log::debug!("[worker_pool] {} started with {} threads", self.name, self.threads);
        *state = PoolState::Running(pool.clone());
        Ok(pool)
    }

    /// Runs `job` on the pool. Panics inside the job are caught and reported
    /// through the handle instead of unwinding into the pool.
    pub fn spawn<T, F>(&self, job: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let pool = self.running_pool()?;
        let (tx, rx) = bounded(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = cancel.clone();
        pool.spawn(move || {
            let outcome = if flag.load(Ordering::SeqCst) {
                TaskOutcome::Cancelled
            } else {
                match catch_unwind(AssertUnwindSafe(job)) {
                    Ok(v) => TaskOutcome::Done(v),
                    Err(p) => TaskOutcome::Panicked(panic_message(p.as_ref())),
                }
            };
            let _ = tx.send(outcome);
        });
        Ok(TaskHandle { rx, cancel })
    }

    /// Drops the pool. Queued tasks still drain on the old threads.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        if let PoolState::Running(_) = &*state {
            log::debug!("[worker_pool] {} stopped", self.name);
        }
        *state = PoolState::Stopped;
    }
}

pub fn panic_message(p: &(dyn Any + Send)) -> String {
    if let Some(s) = p.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = p.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn spawn_reports_value_and_panic() -> Result<()> {
        let pool = WorkerPool::new("test", 2);
        assert!(!pool.is_running());
        let ok = pool.spawn(|| 6 * 7)?;
        let bad = pool.spawn(|| -> i32 { panic!("boom") })?;
        assert!(pool.is_running());
        assert_eq!(ok.wait(), TaskOutcome::Done(42));
        assert_eq!(bad.wait(), TaskOutcome::Panicked("boom".into()));
        Ok(())
    }

    #[test]
    fn cancelled_task_never_runs() -> Result<()> {
        let pool = WorkerPool::new("test", 1);
        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        // occupy the only thread so the second task stays queued
        let blocker = pool.spawn(move || { let _ = gate_rx.recv_timeout(Duration::from_secs(5)); })?;
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let queued = pool.spawn(move || r.store(true, Ordering::SeqCst))?;
        queued.cancel();
        gate_tx.send(()).ok();
        assert_eq!(blocker.wait(), TaskOutcome::Done(()));
        assert_eq!(queued.wait(), TaskOutcome::Cancelled);
        assert!(!ran.load(Ordering::SeqCst));
        Ok(())
    }

    #[test]
    fn stopped_pool_restarts_on_spawn() -> Result<()> {
        let pool = WorkerPool::new("test", 1);
        pool.spawn(|| ())?.wait();
        pool.shutdown();
        assert!(!pool.is_running());
        assert_eq!(pool.spawn(|| 1)?.wait(), TaskOutcome::Done(1));
        assert!(pool.is_running());
        Ok(())
    }
}
