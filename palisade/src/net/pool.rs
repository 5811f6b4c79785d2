use crate::logging;
use crate::net::shared::ERR_POOL_TASK_PANICKED;
use std::cmp;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

const MIN_WORKERS: usize = 4;

struct PoolState {
    queue: VecDeque<Task>,
    run: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    condvar: Condvar,
    log: logging::Logger,
}

/// A bounded pool of worker threads consuming unit-of-work closures from a
/// FIFO queue. Panicking tasks are caught and logged; the worker carries on.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    size: usize,
}

impl WorkerPool {
    /// Spawns the default number of workers: one per hardware thread minus
    /// one for the event loop, with a floor of four.
    pub fn new() -> WorkerPool {
        WorkerPool::with_workers(WorkerPool::default_workers())
    }

    pub fn default_workers() -> usize {
        let cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(MIN_WORKERS + 1);

        cmp::max(MIN_WORKERS, cores.saturating_sub(1))
    }

    pub fn with_workers(count: usize) -> WorkerPool {
        let count = cmp::max(1, count);

        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                run: true,
            }),
            condvar: Condvar::new(),
            log: logging::get(),
        });

        let workers = (0..count)
            .map(|i| {
                let shared = shared.clone();

                thread::Builder::new()
                    .name(format!("palisade-worker-{}", i))
                    .spawn(move || worker_loop(shared))
                    .expect("Error spawning worker thread")
            })
            .collect();

        WorkerPool {
            shared,
            workers: Mutex::new(workers),
            size: count,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Appends a task to the queue and wakes one waiting worker.
    /// Submissions after `stop` are dropped.
    pub fn enqueue<F: FnOnce() + Send + 'static>(&self, task: F) {
        {
            let mut state = self.shared.state.lock().unwrap();

            if !state.run {
                return;
            }

            state.queue.push_back(Box::new(task));
        }

        self.shared.condvar.notify_one();
    }

    /// Stops the pool. When graceful, blocks until the remaining queue has
    /// drained and every worker has exited; otherwise the workers are
    /// detached to finish (or not) on their own.
    pub fn stop(&self, graceful: bool) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.run = false;
        }

        self.shared.condvar.notify_all();

        let mut workers = self.workers.lock().unwrap();

        if graceful {
            for worker in workers.drain(..) {
                let _ = worker.join();
            }
        } else {
            workers.clear();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop(true);
    }
}

fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let task = {
            let mut state = shared.state.lock().unwrap();

            loop {
                if let Some(task) = state.queue.pop_front() {
                    break task;
                }

                if !state.run {
                    return;
                }

                state = shared.condvar.wait(state).unwrap();
            }
        };

        if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            logging::error!(shared.log, "task panicked";
                            "context" => "worker_loop",
                            "code" => ERR_POOL_TASK_PANICKED);
        }
    }
}
