use std::{
    sync::{
        atomic::{AtomicU16, Ordering},
        mpsc, Arc,
    },
    thread::sleep,
    time::Duration,
};

use crate::jobs::{
    build::{IndexBuildPipeline, GENERIC_BUILD_FAILURE},
    tracker::{JobId, JobTracker, JobUpdate},
};
use crate::models::ModelRegistry;

#[derive(Clone, Debug)]
pub enum Task {
    /// build the index of a taxonomy for an already admitted job
    BuildIndex { job_id: JobId, taxonomy: String },

    /// request to gracefully shutdown task queue
    Shutdown,
}

/// Everything a background task needs.
#[derive(Clone)]
pub struct Worker {
    pub pipeline: Arc<IndexBuildPipeline>,
    pub registry: Arc<ModelRegistry>,
    pub jobs: Arc<JobTracker>,
    pub max_threads: u16,
}

pub fn throttle(counter: &AtomicU16, max_threads: u16) {
    while counter.load(Ordering::Relaxed) >= max_threads {
        sleep(Duration::from_millis(100));
    }
}

fn wait_idle(counter: &AtomicU16) {
    while counter.load(Ordering::Relaxed) > 0 {
        sleep(Duration::from_millis(100));
    }
}

/// Consume tasks until `Task::Shutdown` or until every sender is dropped,
/// then wait for running tasks to finish.
pub fn start_queue(task_rx: mpsc::Receiver<Task>, worker: Worker) {
    // spawned and not yet joined
    let pending_ctr = Arc::new(AtomicU16::new(0));
    // past the throttle
    let thread_ctr = Arc::new(AtomicU16::new(0));

    log::debug!("waiting for tasks");
    while let Ok(task) = task_rx.recv() {
        // graceful shutdown
        if let Task::Shutdown = &task {
            log::info!(
                "task queue shutting down, {} task(s) pending",
                pending_ctr.load(Ordering::Relaxed)
            );
            break;
        }

        log::debug!("got task {task:?}");
        pending_ctr.fetch_add(1, Ordering::Relaxed);
        let task_handle = std::thread::spawn({
            let thread_counter = thread_ctr.clone();
            let worker = worker.clone();
            let task = task.clone();
            move || {
                throttle(&thread_counter, worker.max_threads);
                thread_counter.fetch_add(1, Ordering::Relaxed);
                task.run(&worker);
                thread_counter.fetch_sub(1, Ordering::Relaxed);
            }
        });

        // a panicking build must still leave a terminal job state
        std::thread::spawn({
            let thread_counter = thread_ctr.clone();
            let pending_counter = pending_ctr.clone();
            let jobs = worker.jobs.clone();
            move || {
                if let Err(err) = task_handle.join() {
                    log::error!("task {task:?} panicked: {err:?}");
                    // the task never reached its own decrement
                    thread_counter.fetch_sub(1, Ordering::Relaxed);
                    if let Task::BuildIndex { job_id, .. } = &task {
                        jobs.update(job_id, JobUpdate::failed(GENERIC_BUILD_FAILURE));
                    }
                }
                pending_counter.fetch_sub(1, Ordering::Relaxed);
            }
        });
    }

    wait_idle(&pending_ctr);
}

impl Task {
    pub fn run(&self, worker: &Worker) {
        match self {
            Task::BuildIndex { job_id, taxonomy } => {
                log::debug!("picked up build of {taxonomy}");
                worker
                    .pipeline
                    .build(job_id, taxonomy, &worker.registry, &worker.jobs);
            }
            Task::Shutdown => {}
        }
    }
}
