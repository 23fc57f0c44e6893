//! Render Service - the worker side of the rendezvous socket
//!
//! One service owns the listener and one `JobQueue`. It accepts requests
//! while draining the queue one job at a time. When the queue idles out
//! the service stops admitting work, unlinks the socket path, and only
//! then drops the listener, so a later submission can bind a fresh worker
//! without racing this one for the path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

use crate::hashing::Fingerprint;
use crate::pipeline::{RenderPipeline, Rendered};
use crate::protocol::{read_message, write_message, ProtocolError, Request, Response};
use crate::queue::{Admission, Job, JobQueue};
use crate::validation::Validator;

pub struct RenderService {
    listener: UnixListener,
    address: PathBuf,
    queue: Arc<JobQueue>,
    pipeline: Arc<RenderPipeline>,
    validator: Arc<Validator>,
}

impl RenderService {
    pub fn new(
        listener: UnixListener,
        address: impl Into<PathBuf>,
        queue: Arc<JobQueue>,
        pipeline: Arc<RenderPipeline>,
        validator: Arc<Validator>,
    ) -> Self {
        Self {
            listener,
            address: address.into(),
            queue,
            pipeline,
            validator,
        }
    }

    pub fn queue(&self) -> Arc<JobQueue> {
        self.queue.clone()
    }

    /// Serve until the queue goes idle.
    pub async fn run(self) {
        info!(address = %self.address.display(), "render worker started");

        let drain = drain(self.queue.clone(), self.pipeline.clone());
        tokio::pin!(drain);

        loop {
            tokio::select! {
                _ = &mut drain => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let queue = self.queue.clone();
                        let validator = self.validator.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_connection(stream, &queue, &validator).await {
                                debug!(error = %err, "connection dropped");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "accept failed"),
                },
            }
        }

        unlink_socket(&self.address);
        drop(self.listener);
        info!(address = %self.address.display(), "render worker stopped");
    }
}

/// Closes the queue when draining stops, however it stops.
struct CloseOnExit<'a>(&'a JobQueue);

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Process jobs strictly one at a time until the queue closes.
///
/// Each job runs in its own task, so a panicking render only fails that
/// job and the fingerprint is still released.
pub async fn drain(queue: Arc<JobQueue>, pipeline: Arc<RenderPipeline>) {
    let _close = CloseOnExit(&queue);

    while let Some(job) = queue.next_job().await {
        let waited = chrono::Utc::now() - job.enqueued_at;
        debug!(
            fingerprint = %job.fingerprint.short(),
            waited_ms = waited.num_milliseconds(),
            "job dequeued"
        );

        let fingerprint = job.fingerprint.clone();
        let rendering = {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.render(&job.fingerprint, &job.formula).await })
        };

        match rendering.await {
            Ok(Ok(Rendered::Cached(_))) => {
                debug!(fingerprint = %fingerprint.short(), "already rendered, skipped");
            }
            Ok(Ok(Rendered::Fresh(_))) => {}
            Ok(Err(err)) => {
                warn!(fingerprint = %fingerprint.short(), error = %err, "job failed");
            }
            Err(join) => {
                error!(fingerprint = %fingerprint.short(), error = %join, "job aborted");
            }
        }

        queue.complete(&fingerprint);
    }
}

async fn handle_connection(
    mut stream: UnixStream,
    queue: &JobQueue,
    validator: &Validator,
) -> Result<(), ProtocolError> {
    let request: Request = read_message(&mut stream).await?;
    let response = respond(request, queue, validator);
    write_message(&mut stream, &response).await
}

pub fn respond(request: Request, queue: &JobQueue, validator: &Validator) -> Response {
    match request {
        Request::Submit { fingerprint, formula } => {
            let cleaned = match validator.validate(&formula) {
                Ok(cleaned) => cleaned,
                Err(err) => return Response::Rejected { reason: err.to_string() },
            };
            if Fingerprint::of(&cleaned) != fingerprint {
                return Response::Rejected {
                    reason: format!("fingerprint {fingerprint} does not match formula"),
                };
            }
            match queue.submit(Job::new(fingerprint, cleaned)) {
                Admission::Enqueued => Response::Accepted { already_pending: false },
                Admission::AlreadyPending => Response::Accepted { already_pending: true },
                Admission::Closed => Response::ShuttingDown,
            }
        }
        Request::Status { fingerprint } => {
            if queue.is_closed() {
                Response::ShuttingDown
            } else {
                Response::Status { pending: queue.is_pending(&fingerprint) }
            }
        }
    }
}

fn unlink_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "socket unlinked"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "failed to unlink socket"),
    }
}
