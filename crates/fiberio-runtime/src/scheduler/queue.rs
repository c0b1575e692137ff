//! Job queue shared by the workers of one scheduler
//!
//! Design:
//! - One pinned queue per worker (lock-free `SegQueue`), drained first
//! - Shared FIFO (`Mutex<VecDeque>`) for jobs any worker may run
//! - `len` counts queued jobs, `active` counts popped jobs not yet
//!   finished; `pop` raises `active` before lowering `len` so the pair
//!   never reads (0, 0) while a job is in flight

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_queue::SegQueue;

use crate::fiber::Fiber;

/// Plain callback job
pub type Callback = Box<dyn FnOnce() + Send + 'static>;

/// What a job runs
pub enum Task {
    /// Resume an existing fiber
    Fiber(Arc<Fiber>),
    /// Run a callback on a pooled fiber
    Call(Callback),
}

/// Unit of work, optionally pinned to one worker
pub struct Job {
    pub task: Task,
    pub worker: Option<usize>,
}

impl Job {
    pub fn call<F>(f: F) -> Job
    where
        F: FnOnce() + Send + 'static,
    {
        Job { task: Task::Call(Box::new(f)), worker: None }
    }

    pub fn fiber(fiber: Arc<Fiber>) -> Job {
        Job { task: Task::Fiber(fiber), worker: None }
    }

    /// Run only on `worker`
    pub fn pinned(mut self, worker: Option<usize>) -> Job {
        self.worker = worker;
        self
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct("Job");
        match &self.task {
            Task::Fiber(fiber) => d.field("fiber", &fiber.id()),
            Task::Call(_) => d.field("call", &"<callback>"),
        };
        d.field("worker", &self.worker).finish()
    }
}

pub(crate) struct JobQueue {
    shared: Mutex<VecDeque<Job>>,
    pinned: Vec<SegQueue<Job>>,
    len: AtomicUsize,
    active: AtomicUsize,
}

impl JobQueue {
    pub(crate) fn new(workers: usize) -> Self {
        JobQueue {
            shared: Mutex::new(VecDeque::new()),
            pinned: (0..workers).map(|_| SegQueue::new()).collect(),
            len: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
        }
    }

    /// Queue `job`. Returns the worker it is pinned to, if any.
    pub(crate) fn push(&self, mut job: Job) -> Option<usize> {
        let target = job.worker.filter(|&w| w < self.pinned.len());
        if job.worker.is_some() && target.is_none() {
            job.worker = None;
        }
        self.len.fetch_add(1, Ordering::SeqCst);
        match target {
            Some(w) => self.pinned[w].push(job),
            None => self
                .shared
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(job),
        }
        target
    }

    /// Next job for `worker`: its pinned queue, then the shared FIFO
    pub(crate) fn pop(&self, worker: usize) -> Option<Job> {
        if self.len.load(Ordering::SeqCst) == 0 {
            return None;
        }
        let job = self
            .pinned
            .get(worker)
            .and_then(|q| q.pop())
            .or_else(|| self.shared.lock().unwrap_or_else(|e| e.into_inner()).pop_front())?;
        self.active.fetch_add(1, Ordering::SeqCst);
        self.len.fetch_sub(1, Ordering::SeqCst);
        Some(job)
    }

    /// A popped job is done (or requeued)
    pub(crate) fn finish(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    #[inline]
    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Nothing queued and nothing running
    pub(crate) fn is_drained(&self) -> bool {
        self.active() == 0 && self.len() == 0
    }
}
