use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};

use crate::error::{QueueError, WorkerError};
use crate::queue::{ClaimedTask, TaskQueue};
use crate::worker::processor::{process_task, TaskReport};

pub const DEFAULT_WORKER_COUNT: usize = 4;

/// How long an idle worker sleeps before polling the queue again.
pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(100);

/// Reports buffered per worker before new ones are dropped.
const REPORTS_PER_WORKER: usize = 64;

/// Fixed set of threads that claim and process tasks until shut down.
pub struct ConsumerPool {
    queue: TaskQueue,
    report_receiver: Receiver<TaskReport>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl ConsumerPool {
    pub fn new(queue: TaskQueue, worker_count: usize) -> Result<Self, WorkerError> {
        Self::with_idle_interval(queue, worker_count, DEFAULT_IDLE_INTERVAL)
    }

    /// Starts `worker_count` consumers (at least one).
    pub fn with_idle_interval(
        queue: TaskQueue,
        worker_count: usize,
        idle_interval: Duration,
    ) -> Result<Self, WorkerError> {
        let worker_count = worker_count.max(1);
        let (report_sender, report_receiver) =
            bounded::<TaskReport>(worker_count * REPORTS_PER_WORKER);
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);

        for worker_id in 0..worker_count {
            let worker_queue = queue.clone();
            let report_tx = report_sender.clone();
            let shutdown_flag = Arc::clone(&shutdown);

            let spawned = thread::Builder::new()
                .name(format!("jobsync-worker-{}", worker_id))
                .spawn(move || {
                    run_worker(worker_id, worker_queue, report_tx, shutdown_flag, idle_interval);
                });

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shutdown.store(true, Ordering::Relaxed);
                    for handle in workers {
                        let _ = handle.join();
                    }
                    return Err(WorkerError::SpawnFailed(e.to_string()));
                }
            }
        }

        info!("Started {} consumer(s)", worker_count);

        Ok(Self {
            queue,
            report_receiver,
            workers,
            shutdown,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn try_recv_report(&self) -> Option<TaskReport> {
        self.report_receiver.try_recv().ok()
    }

    pub fn recv_report_timeout(&self, timeout: Duration) -> Option<TaskReport> {
        self.report_receiver.recv_timeout(timeout).ok()
    }

    /// Blocks until no task is ready, delayed or running, or `timeout`
    /// elapses. Returns whether the queue drained.
    pub fn wait_until_drained(&self, timeout: Duration) -> Result<bool, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.queue.depth()?.pending() == 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline || self.is_shutdown() {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(20));
        }
    }

    pub fn shutdown(&self) {
        info!("Shutting down consumer pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    /// Signals shutdown and joins every worker. A task being processed
    /// finishes first.
    pub fn wait(self) {
        self.shutdown.store(true, Ordering::Relaxed);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All consumers have stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}

fn run_worker(
    worker_id: usize,
    queue: TaskQueue,
    report_sender: Sender<TaskReport>,
    shutdown: Arc<AtomicBool>,
    idle_interval: Duration,
) {
    debug!("Worker {} started", worker_id);
    let name = format!("worker-{}", worker_id);

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        let task = match queue.dequeue(&name) {
            Ok(Some(task)) => task,
            Ok(None) => {
                thread::sleep(idle_interval);
                continue;
            }
            Err(e) => {
                error!("Worker {} failed to claim a task: {}", worker_id, e);
                thread::sleep(idle_interval);
                continue;
            }
        };

        match process_task(&queue, &task) {
            Ok(report) => match report_sender.try_send(report) {
                Ok(()) | Err(TrySendError::Disconnected(_)) => {}
                Err(TrySendError::Full(report)) => {
                    debug!("Report buffer full, dropping report for task {}", report.task_id);
                }
            },
            Err(e) => {
                error!("Worker {} could not settle task {}: {}", worker_id, task.id, e);
                release_task(worker_id, &queue, &task, &e.to_string(), &shutdown, idle_interval);
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

/// Puts an unsettled task back in the queue, retrying while the store is
/// unavailable. Gives up on shutdown; the claim lease covers the rest.
fn release_task(
    worker_id: usize,
    queue: &TaskQueue,
    task: &ClaimedTask,
    error: &str,
    shutdown: &AtomicBool,
    idle_interval: Duration,
) {
    loop {
        match queue.release(task, error) {
            Ok(()) | Err(QueueError::TaskNotFound(_)) => return,
            Err(e) => {
                warn!("Worker {} could not release task {}: {}", worker_id, task.id, e);
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                thread::sleep(idle_interval);
            }
        }
    }
}
