//! Bounded worker pool and cooperative interruption.
//!
//! Tasks are collected first and run when `process` is called; the first
//! failure cancels the remaining queue and is reported after every worker
//! has stopped. Long-running work polls [`check_interrupt`] so a
//! process-wide stop request is observed at the next safe point.

use anyhow::Result;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// The process-wide stop request was observed.
#[derive(Debug, thiserror::Error)]
#[error("interrupted")]
pub struct Interrupted;

/// Request cooperative cancellation of all in-flight work.
pub fn trigger_interrupt() {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Clear the stop request (start of a new command, tests).
pub fn reset_interrupt() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// Fail with [`Interrupted`] if cancellation was requested.
pub fn check_interrupt() -> Result<()> {
    if INTERRUPTED.load(Ordering::SeqCst) {
        return Err(Interrupted.into());
    }
    Ok(())
}

type Task<'a> = Box<dyn FnOnce() -> Result<()> + Send + 'a>;

/// Fixed-width worker pool over borrowed tasks.
pub struct ThreadPool<'a> {
    workers: usize,
    tasks: Vec<Task<'a>>,
}

impl<'a> ThreadPool<'a> {
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            tasks: Vec::new(),
        }
    }

    /// Queue a task. Nothing runs until [`Self::process`].
    pub fn enqueue(&mut self, task: impl FnOnce() -> Result<()> + Send + 'a) {
        self.tasks.push(Box::new(task));
    }

    /// Run all queued tasks to completion and surface the first failure.
    /// A failure (or an interrupt) cancels tasks that have not started.
    pub fn process(self) -> Result<()> {
        if self.tasks.is_empty() {
            return Ok(());
        }
        let queue: Mutex<VecDeque<Task<'a>>> = Mutex::new(self.tasks.into());
        let first_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);
        let workers = self.workers.min(queue.lock().expect("queue lock").len());

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    if first_error.lock().expect("error lock").is_some() {
                        return;
                    }
                    let task = match queue.lock().expect("queue lock").pop_front() {
                        Some(task) => task,
                        None => return,
                    };
                    let result = check_interrupt().and_then(|()| task());
                    if let Err(err) = result {
                        let mut slot = first_error.lock().expect("error lock");
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                        return;
                    }
                });
            }
        });

        match first_error.into_inner().expect("error lock") {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
