//! Cross-Process Coordinator
//!
//! Finds the one live render worker behind the rendezvous socket, or
//! becomes it. Election is leader-by-bind:
//!
//! 1. connect to the socket; if a worker answers, hand it the job
//! 2. otherwise take an exclusive `flock` on `<socket>.lock`, probe again,
//!    clear a stale socket file and bind
//! 3. the loser of the lock race finds the winner on its probe and
//!    connects to it instead
//!
//! Transient failures (worker shutting down, connection reset, a lost
//! race) are retried a bounded number of times with a fixed backoff.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RendererConfig;
use crate::hashing::Fingerprint;
use crate::pipeline::RenderPipeline;
use crate::protocol::{self, read_message, write_message, ProtocolError, Request, Response};
use crate::queue::JobQueue;
use crate::service::{respond, RenderService};
use crate::validation::Validator;

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("Render worker at {} unreachable after {attempts} attempts: {last_error}", address.display())]
    Unreachable {
        address: PathBuf,
        attempts: u32,
        last_error: String,
    },

    #[error("Render worker rejected the job: {0}")]
    Rejected(String),

    #[error("Failed to bind render worker at {}: {source}", address.display())]
    Bind {
        address: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("A render worker is already serving {}", address.display())]
    AlreadyServing { address: PathBuf },

    #[error("Job cannot be sent to the render worker: {0}")]
    Unsendable(#[source] ProtocolError),

    #[error("Unexpected response from render worker: {0:?}")]
    UnexpectedResponse(Response),
}

/// How a submission was taken by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Queued,
    /// The fingerprint was already queued or in flight.
    AlreadyPending,
}

enum Attempt {
    Done(Response),
    Retry(String),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RendererConfig) -> Self {
        Self {
            attempts: config.submit_attempts.max(1),
            backoff: config.submit_backoff(),
        }
    }
}

/// The worker task this process hosts, with its queue.
struct HostedWorker {
    queue: Arc<JobQueue>,
    task: JoinHandle<()>,
}

impl HostedWorker {
    fn is_live(&self) -> bool {
        !self.task.is_finished() && !self.queue.is_closed()
    }
}

pub struct Coordinator {
    address: PathBuf,
    lock_path: PathBuf,
    retry: RetryPolicy,
    idle_timeout: Option<Duration>,
    pipeline: Arc<RenderPipeline>,
    validator: Arc<Validator>,
    hosted: Mutex<Option<HostedWorker>>,
}

impl Coordinator {
    pub fn new(config: &RendererConfig, pipeline: Arc<RenderPipeline>, validator: Arc<Validator>) -> Self {
        let address = config.service_address();
        let mut lock_path = address.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            address,
            lock_path: PathBuf::from(lock_path),
            retry: RetryPolicy::from_config(config),
            idle_timeout: config.idle_timeout(),
            pipeline,
            validator,
            hosted: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    /// Whether this coordinator currently runs the live worker.
    pub fn is_hosting(&self) -> bool {
        self.live_hosted_queue().is_some()
    }

    fn live_hosted_queue(&self) -> Option<Arc<JobQueue>> {
        let hosted = self.hosted.lock().unwrap_or_else(PoisonError::into_inner);
        hosted.as_ref().filter(|w| w.is_live()).map(|w| w.queue.clone())
    }

    /// Wait for the worker hosted by this coordinator, if any, to drain
    /// its queue and go idle. A process that hosted the worker calls this
    /// before exiting so jobs other clients queued behind its own still
    /// run. Never returns for a worker without an idle timeout.
    pub async fn join_worker(&self) {
        let hosted = self.hosted.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(worker) = hosted else {
            return;
        };
        info!(address = %self.address.display(), pending = worker.queue.len(), "waiting for render worker to go idle");
        if let Err(err) = worker.task.await {
            warn!(address = %self.address.display(), error = %err, "render worker task ended abnormally");
        }
    }

    /// Hand a validated job to the live worker, electing one if needed.
    pub async fn submit(&self, fingerprint: &Fingerprint, formula: &str) -> Result<Submission, CoordinationError> {
        let request = Request::Submit {
            fingerprint: fingerprint.clone(),
            formula: formula.to_string(),
        };
        // Same answer whether this process hosts the worker or not.
        protocol::encode(&request).map_err(CoordinationError::Unsendable)?;

        let response = self.with_retries(&request, true).await?;
        match response {
            Response::Accepted { already_pending: false } => Ok(Submission::Queued),
            Response::Accepted { already_pending: true } => Ok(Submission::AlreadyPending),
            Response::Rejected { reason } => Err(CoordinationError::Rejected(reason)),
            other => Err(CoordinationError::UnexpectedResponse(other)),
        }
    }

    /// Whether the live worker still holds `fingerprint` as pending.
    ///
    /// No reachable worker means nothing is pending.
    pub async fn enqueued_status(&self, fingerprint: &Fingerprint) -> Result<bool, CoordinationError> {
        let request = Request::Status { fingerprint: fingerprint.clone() };
        match self.with_retries(&request, false).await? {
            Response::Status { pending } => Ok(pending),
            Response::ShuttingDown => Ok(false),
            other => Err(CoordinationError::UnexpectedResponse(other)),
        }
    }

    /// Become the worker and serve in the current task until the queue
    /// idles out (or forever when no idle timeout is configured).
    pub async fn serve(&self) -> Result<(), CoordinationError> {
        match self.bind_worker().await? {
            Some(service) => {
                service.run().await;
                Ok(())
            }
            None => Err(CoordinationError::AlreadyServing { address: self.address.clone() }),
        }
    }

    async fn with_retries(&self, request: &Request, elect: bool) -> Result<Response, CoordinationError> {
        let mut last_error = String::new();
        for attempt in 1..=self.retry.attempts {
            match self.attempt(request, elect).await {
                Attempt::Done(Response::ShuttingDown) if elect => {
                    last_error = "worker shutting down".to_string();
                }
                Attempt::Done(response) => return Ok(response),
                Attempt::Retry(reason) => last_error = reason,
            }
            warn!(
                address = %self.address.display(),
                attempt,
                max_attempts = self.retry.attempts,
                error = %last_error,
                "render worker unavailable"
            );
            if attempt < self.retry.attempts {
                tokio::time::sleep(self.retry.backoff).await;
            }
        }
        Err(CoordinationError::Unreachable {
            address: self.address.clone(),
            attempts: self.retry.attempts,
            last_error,
        })
    }

    async fn attempt(&self, request: &Request, elect: bool) -> Attempt {
        if let Some(queue) = self.live_hosted_queue() {
            return Attempt::Done(respond(request.clone(), &queue, &self.validator));
        }

        match exchange(&self.address, request).await {
            Ok(response) => Attempt::Done(response),
            Err(ExchangeError::Connect(err)) if is_absent(&err) => {
                if !elect {
                    return Attempt::Done(Response::ShuttingDown);
                }
                match self.elect().await {
                    Ok(Some(queue)) => Attempt::Done(respond(request.clone(), &queue, &self.validator)),
                    // Someone else won; talk to them.
                    Ok(None) => match exchange(&self.address, request).await {
                        Ok(response) => Attempt::Done(response),
                        Err(err) => Attempt::Retry(err.to_string()),
                    },
                    Err(err) => Attempt::Retry(err.to_string()),
                }
            }
            Err(err) => Attempt::Retry(err.to_string()),
        }
    }

    /// Bind and spawn a worker, or `None` if another one is live.
    async fn elect(&self) -> Result<Option<Arc<JobQueue>>, CoordinationError> {
        let Some(service) = self.bind_worker().await? else {
            return Ok(None);
        };
        let queue = service.queue();
        let task = tokio::spawn(service.run());
        *self.hosted.lock().unwrap_or_else(PoisonError::into_inner) = Some(HostedWorker {
            queue: queue.clone(),
            task,
        });
        Ok(Some(queue))
    }

    async fn bind_worker(&self) -> Result<Option<RenderService>, CoordinationError> {
        let address = self.address.clone();
        let lock_path = self.lock_path.clone();
        let bound = tokio::task::spawn_blocking(move || bind_exclusive(&address, &lock_path))
            .await
            .map_err(|join| CoordinationError::Bind {
                address: self.address.clone(),
                source: io::Error::other(join),
            })?;

        let Some(std_listener) = bound.map_err(|source| CoordinationError::Bind {
            address: self.address.clone(),
            source,
        })?
        else {
            debug!(address = %self.address.display(), "worker already live");
            return Ok(None);
        };

        let listener = UnixListener::from_std(std_listener).map_err(|source| CoordinationError::Bind {
            address: self.address.clone(),
            source,
        })?;
        info!(address = %self.address.display(), "elected as render worker");

        Ok(Some(RenderService::new(
            listener,
            &self.address,
            Arc::new(JobQueue::new(self.idle_timeout)),
            self.pipeline.clone(),
            self.validator.clone(),
        )))
    }
}

#[derive(Debug, Error)]
enum ExchangeError {
    #[error("connect failed: {0}")]
    Connect(io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

async fn exchange(address: &Path, request: &Request) -> Result<Response, ExchangeError> {
    let mut stream = UnixStream::connect(address).await.map_err(ExchangeError::Connect)?;
    write_message(&mut stream, request).await?;
    Ok(read_message(&mut stream).await?)
}

/// No worker is listening at the address.
fn is_absent(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused)
}

/// Under the election lock, bind the socket unless a worker answers.
fn bind_exclusive(address: &Path, lock_path: &Path) -> io::Result<Option<std::os::unix::net::UnixListener>> {
    if let Some(parent) = address.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(lock_path)?;
    fs2::FileExt::lock_exclusive(&lock_file)?;

    // Dropping `lock_file` releases the lock on every return path.
    match std::os::unix::net::UnixStream::connect(address) {
        Ok(_) => return Ok(None),
        Err(err) if is_absent(&err) => {}
        Err(err) => return Err(err),
    }

    remove_stale_socket(address)?;
    let listener = std::os::unix::net::UnixListener::bind(address)?;
    listener.set_nonblocking(true)?;
    Ok(Some(listener))
}

fn remove_stale_socket(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists but is not a socket", path.display()),
        ));
    }
    std::fs::remove_file(path)?;
    warn!(path = %path.display(), "removed stale worker socket");
    Ok(())
}
