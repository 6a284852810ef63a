//! Deferred poll scheduling
//!
//! An interrupt never polls a ring itself; it asks for a poll. Asking twice
//! before the poll runs is the same as asking once. Scheduled polls are run
//! either by a `PollWorker` thread or synchronously via the front-end's
//! `run_deferred`.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, trace};

use crate::lock;

const WORKER_TICK: Duration = Duration::from_millis(100);

/// Idempotent poll request for one queue
pub struct Dpc {
    queue: usize,
    scheduled: AtomicBool,
    worker: Mutex<Option<Sender<usize>>>,
}

impl Dpc {
    pub fn new(queue: usize) -> Self {
        Self {
            queue,
            scheduled: AtomicBool::new(false),
            worker: Mutex::new(None),
        }
    }

    /// Hand future polls to a worker thread.
    pub fn attach(&self, sender: Sender<usize>) {
        *lock(&self.worker) = Some(sender);
        // Anything scheduled while detached goes to the worker now
        if self.is_scheduled() {
            self.notify_worker();
        }
    }

    pub fn detach(&self) {
        *lock(&self.worker) = None;
    }

    /// Request a poll. Returns false if one was already pending.
    pub fn schedule(&self) -> bool {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return false;
        }
        trace!(queue = self.queue, "Poll scheduled");
        self.notify_worker();
        true
    }

    /// Claim a pending request; true if the poll should run.
    ///
    /// Cleared before the poll body runs, so an interrupt arriving during
    /// the poll schedules another one.
    pub fn take(&self) -> bool {
        self.scheduled.swap(false, Ordering::AcqRel)
    }

    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    fn notify_worker(&self) {
        if let Some(sender) = lock(&self.worker).as_ref() {
            // A gone worker leaves the flag set for run_deferred
            let _ = sender.send(self.queue);
        }
    }
}

/// Thread running scheduled polls
pub struct PollWorker {
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    sender: Sender<usize>,
}

impl PollWorker {
    /// Spawn a worker calling `poll(queue)` for every scheduled queue.
    pub fn spawn(name: &str, poll: impl Fn(usize) + Send + 'static) -> io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();
        let thread_name = name.to_string();

        let thread = thread::Builder::new()
            .name(format!("{name}-poll"))
            .spawn(move || run_poll_worker(&thread_name, receiver, shutdown_clone, poll))?;

        debug!(worker = name, "Poll worker started");
        Ok(Self {
            thread: Some(thread),
            shutdown,
            sender,
        })
    }

    pub fn sender(&self) -> Sender<usize> {
        self.sender.clone()
    }

    /// Signal the worker to stop
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> Result<(), String> {
        self.stop();
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| "Poll worker panicked".to_string()),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for PollWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_poll_worker(
    name: &str,
    receiver: Receiver<usize>,
    shutdown: Arc<AtomicBool>,
    poll: impl Fn(usize),
) {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match receiver.recv_timeout(WORKER_TICK) {
            Ok(queue) => poll(queue),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                error!(worker = name, "Poll channel disconnected");
                break;
            }
        }
    }
    debug!(worker = name, "Poll worker stopped");
}
