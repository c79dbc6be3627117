//! Fixed-size worker pool executing job runs.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use tracing::{debug, error, info};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// The pool no longer accepts work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("worker pool '{0}' is shut down")]
pub struct PoolClosed(pub String);

/// `size` named threads pulling tasks from one queue.
///
/// Tasks submitted while every worker is busy wait in the queue.
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let name = name.into();
        let (sender, receiver) = mpsc::channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size.max(1))
            .map(|i| {
                let receiver = receiver.clone();
                let worker_name = format!("{name}-{i}");
                thread::Builder::new()
                    .name(worker_name.clone())
                    .spawn(move || worker_loop(&worker_name, &receiver))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        info!(pool = %name, size = size.max(1), "worker pool started");

        Self {
            name,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    pub fn execute<F>(&self, task: F) -> Result<(), PoolClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self
            .sender
            .lock()
            .map_err(|_| PoolClosed(self.name.clone()))?;
        match sender.as_ref() {
            Some(sender) => sender
                .send(Box::new(task))
                .map_err(|_| PoolClosed(self.name.clone())),
            None => Err(PoolClosed(self.name.clone())),
        }
    }

    /// Stop accepting work, let queued and running tasks finish, join the workers.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        for worker in workers {
            let _ = worker.join();
        }
        info!(pool = %self.name, "worker pool stopped");
    }
}

fn worker_loop(name: &str, receiver: &Mutex<mpsc::Receiver<Task>>) {
    loop {
        let task = match receiver.lock() {
            Ok(receiver) => receiver.recv(),
            Err(_) => break,
        };
        match task {
            Ok(task) => {
                if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                    error!(worker = %name, "task panicked");
                }
            }
            Err(_) => break,
        }
    }
    debug!(worker = %name, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_all_tasks_before_shutdown_returns() {
        let pool = WorkerPool::new("test-pool", 2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter = counter.clone();
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(pool.execute(|| {}).is_err());
    }

    #[test]
    fn panicking_task_does_not_kill_worker() {
        let pool = WorkerPool::new("test-pool", 1);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.execute(|| panic!("boom")).unwrap();
        let c = counter.clone();
        pool.execute(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        pool.shutdown();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
