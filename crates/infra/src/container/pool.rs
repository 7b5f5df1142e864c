use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use tracing::{debug, error, warn};

use persevere_core::RetryTask;

use super::ContainerStats;
use super::leases::HeldLeases;
use crate::executor::RetryExecutor;

/// Fixed-size pool of attempt workers fed through one channel.
///
/// `in_flight` counts tasks queued or running, and every one of them is in
/// `held` until its worker is done with it. Once draining, workers release
/// queued leases instead of attempting them.
pub(crate) struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<RetryTask>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    size: usize,
    in_flight: Arc<AtomicUsize>,
    draining: Arc<AtomicBool>,
    held: Arc<HeldLeases>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        size: usize,
        executor: Arc<RetryExecutor>,
        stats: Arc<ContainerStats>,
        held: Arc<HeldLeases>,
    ) -> io::Result<Self> {
        let (tx, rx) = mpsc::channel::<RetryTask>();
        let rx = Arc::new(Mutex::new(rx));
        let pool = Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(Vec::with_capacity(size)),
            size,
            in_flight: Arc::new(AtomicUsize::new(0)),
            draining: Arc::new(AtomicBool::new(false)),
            held,
        };

        for i in 0..size {
            let worker = Worker {
                executor: executor.clone(),
                stats: stats.clone(),
                rx: rx.clone(),
                in_flight: pool.in_flight.clone(),
                draining: pool.draining.clone(),
                held: pool.held.clone(),
            };
            let spawned = thread::Builder::new()
                .name(format!("persevere-worker-{i}"))
                .spawn(move || worker.run());
            match spawned {
                Ok(join) => {
                    if let Ok(mut workers) = pool.workers.lock() {
                        workers.push(join);
                    }
                }
                Err(err) => {
                    pool.shutdown();
                    return Err(err);
                }
            }
        }

        Ok(pool)
    }

    pub(crate) fn free_capacity(&self) -> usize {
        self.size.saturating_sub(self.in_flight())
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Queue a leased task. Gives the task back when the pool is closed.
    pub(crate) fn dispatch(&self, task: RetryTask) -> Result<(), RetryTask> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(task);
        }
        let Ok(sender) = self.sender.lock() else {
            return Err(task);
        };
        let Some(sender) = sender.as_ref() else {
            return Err(task);
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.held.hold(&task);
        sender.send(task).map_err(|mpsc::SendError(task)| {
            self.held.release(task.id, task.version);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            task
        })
    }

    /// Close the queue and join every worker.
    pub(crate) fn shutdown(&self) {
        self.draining.store(true, Ordering::SeqCst);
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let workers = self
            .workers
            .lock()
            .map(|mut w| std::mem::take(&mut *w))
            .unwrap_or_default();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

struct Worker {
    executor: Arc<RetryExecutor>,
    stats: Arc<ContainerStats>,
    rx: Arc<Mutex<mpsc::Receiver<RetryTask>>>,
    in_flight: Arc<AtomicUsize>,
    draining: Arc<AtomicBool>,
    held: Arc<HeldLeases>,
}

impl Worker {
    fn run(self) {
        loop {
            let next = match self.rx.lock() {
                Ok(rx) => rx.recv(),
                Err(_) => break,
            };
            let Ok(task) = next else {
                break;
            };

            let (task_id, version) = (task.id, task.version);
            if self.draining.load(Ordering::SeqCst) {
                debug!(task_id = %task_id, "draining; releasing queued task");
                if let Err(err) = self.executor.release_lease(&task) {
                    warn!(task_id = %task_id, error = %err, "failed to release lease");
                }
            } else {
                match catch_unwind(AssertUnwindSafe(|| self.executor.attempt(task))) {
                    Ok(result) => {
                        if let Err(err) = &result {
                            warn!(task_id = %task_id, error = %err, "retry attempt aborted");
                        }
                        self.stats.record(&result);
                    }
                    // The lease is left to expire and be reclaimed.
                    Err(_) => {
                        error!(task_id = %task_id, "retry attempt panicked");
                        self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            self.held.release(task_id, version);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
