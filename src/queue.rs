//! Job Queue - serialized render work for one worker lifetime
//!
//! A queue is created when a worker starts and is never reused after the
//! worker goes idle; a later submission elects a fresh worker with a fresh
//! queue.
//!
//! ```text
//!   Active --next_job (job)--> Draining --complete--> Active
//!   Active --idle timeout, queue empty--> Idle (terminal, rejects submits)
//! ```
//!
//! A fingerprint counts as pending from admission until `complete`, so it
//! stays pending while its job is in flight.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::hashing::Fingerprint;

#[derive(Debug, Clone)]
pub struct Job {
    pub fingerprint: Fingerprint,
    pub formula: String,
    pub enqueued_at: DateTime<Utc>,
}

impl Job {
    pub fn new(fingerprint: Fingerprint, formula: impl Into<String>) -> Self {
        Self {
            fingerprint,
            formula: formula.into(),
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Waiting for work.
    Active,
    /// Processing a dequeued job.
    Draining,
    /// Worker exited; the queue accepts nothing further.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Enqueued,
    /// Same fingerprint already queued or in flight.
    AlreadyPending,
    /// The worker is shutting down; submit elsewhere.
    Closed,
}

struct QueueState {
    jobs: VecDeque<Job>,
    pending: HashSet<Fingerprint>,
    state: WorkerState,
}

pub struct JobQueue {
    inner: Mutex<QueueState>,
    notify: Notify,
    idle_timeout: Option<Duration>,
}

impl JobQueue {
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                pending: HashSet::new(),
                state: WorkerState::Active,
            }),
            notify: Notify::new(),
            idle_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn submit(&self, job: Job) -> Admission {
        {
            let mut inner = self.lock();
            if inner.state == WorkerState::Idle {
                return Admission::Closed;
            }
            if !inner.pending.insert(job.fingerprint.clone()) {
                return Admission::AlreadyPending;
            }
            debug!(fingerprint = %job.fingerprint.short(), depth = inner.jobs.len() + 1, "job enqueued");
            inner.jobs.push_back(job);
        }
        self.notify.notify_one();
        Admission::Enqueued
    }

    pub fn is_pending(&self, fingerprint: &Fingerprint) -> bool {
        self.lock().pending.contains(fingerprint)
    }

    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == WorkerState::Idle
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next job in FIFO order, or `None` once the idle timeout elapses
    /// with an empty queue. After `None` the queue is closed for good.
    pub async fn next_job(&self) -> Option<Job> {
        loop {
            {
                let mut inner = self.lock();
                if inner.state == WorkerState::Idle {
                    return None;
                }
                if let Some(job) = inner.jobs.pop_front() {
                    inner.state = WorkerState::Draining;
                    return Some(job);
                }
                inner.state = WorkerState::Active;
            }

            let woke = match self.idle_timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.notify.notified()).await.is_ok(),
                None => {
                    self.notify.notified().await;
                    true
                }
            };

            if !woke {
                let mut inner = self.lock();
                if inner.jobs.is_empty() {
                    inner.state = WorkerState::Idle;
                    info!("queue idle, worker shutting down");
                    return None;
                }
            }
        }
    }

    /// Drop the job's fingerprint from the pending set, whatever the outcome.
    pub fn complete(&self, fingerprint: &Fingerprint) {
        let mut inner = self.lock();
        inner.pending.remove(fingerprint);
        if inner.state == WorkerState::Draining {
            inner.state = WorkerState::Active;
        }
    }

    /// Close the queue without waiting for the idle timeout. Jobs still
    /// queued are abandoned and their fingerprints stop being pending.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.state = WorkerState::Idle;
            inner.jobs.clear();
            inner.pending.clear();
        }
        self.notify.notify_waiters();
    }
}
