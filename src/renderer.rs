//! Public API
//!
//! `Renderer` runs the pipeline inline in the caller's task.
//! `AsyncRenderer` hands jobs to the shared worker and lets callers wait
//! for a fingerprint with `result`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::cache::ArtifactCache;
use crate::config::{ConfigError, RendererConfig};
use crate::coordinator::{CoordinationError, Coordinator, Submission};
use crate::hashing::{Fingerprint, InvalidFingerprint};
use crate::pipeline::{PipelineError, RenderPipeline};
use crate::typesetter::{LatexTypesetter, Typesetter};
use crate::validation::{ValidationError, Validator};

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error("Formula {fingerprint} could not be rendered")]
    Unavailable { fingerprint: Fingerprint },

    #[error("Gave up waiting for {fingerprint} after {waited:?}")]
    TimedOut { fingerprint: Fingerprint, waited: Duration },

    #[error(transparent)]
    InvalidFingerprint(#[from] InvalidFingerprint),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderedFormula {
    pub file_name: String,
    pub file_path: PathBuf,
    pub fingerprint: Fingerprint,
}

impl RenderedFormula {
    fn new(cache: &ArtifactCache, fingerprint: Fingerprint) -> Self {
        Self {
            file_name: cache.artifact_name(&fingerprint),
            file_path: cache.artifact_path(&fingerprint),
            fingerprint,
        }
    }

    /// Whether the artifact exists yet.
    pub fn is_ready(&self) -> bool {
        self.file_path.is_file()
    }
}

/// Validated formula with its fingerprint and canonical location.
struct Prepared {
    formula: String,
    rendered: RenderedFormula,
}

fn prepare(validator: &Validator, cache: &ArtifactCache, formula: &str) -> Result<Prepared, ValidationError> {
    let cleaned = validator.validate(formula)?;
    let fingerprint = Fingerprint::of(&cleaned);
    Ok(Prepared {
        rendered: RenderedFormula::new(cache, fingerprint),
        formula: cleaned,
    })
}

fn setup(config: &RendererConfig) -> Result<(), RenderError> {
    config.validate()?;
    config.ensure_dirs()?;
    Ok(())
}

type InFlight = Mutex<HashMap<Fingerprint, Arc<tokio::sync::Mutex<()>>>>;

/// A caller's hold on the per-fingerprint lock. The last holder to leave,
/// finished or cancelled, removes the entry.
struct Gate<'a> {
    in_flight: &'a InFlight,
    fingerprint: Fingerprint,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl<'a> Gate<'a> {
    fn enter(in_flight: &'a InFlight, fingerprint: &Fingerprint) -> Self {
        let lock = in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(fingerprint.clone())
            .or_default()
            .clone();
        Self {
            in_flight,
            fingerprint: fingerprint.clone(),
            lock,
        }
    }
}

impl Drop for Gate<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here.
        if Arc::strong_count(&self.lock) == 2 {
            in_flight.remove(&self.fingerprint);
        }
    }
}

/// Renders in the calling task.
pub struct Renderer {
    validator: Arc<Validator>,
    pipeline: Arc<RenderPipeline>,
    in_flight: InFlight,
}

impl Renderer {
    pub fn new(config: RendererConfig) -> Result<Self, RenderError> {
        let typesetter = Arc::new(LatexTypesetter::from_config(&config));
        Self::with_typesetter(config, typesetter)
    }

    pub fn with_typesetter(config: RendererConfig, typesetter: Arc<dyn Typesetter>) -> Result<Self, RenderError> {
        setup(&config)?;
        Ok(Self {
            validator: Arc::new(Validator::new(config.blacklist.clone())),
            pipeline: Arc::new(RenderPipeline::from_config(&config, typesetter)),
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    pub fn fingerprint(&self, formula: &str) -> Result<Fingerprint, ValidationError> {
        Ok(Fingerprint::of(&self.validator.validate(formula)?))
    }

    /// Validate, then render unless cached. Concurrent calls for the same
    /// formula share one pipeline run.
    pub async fn render(&self, formula: &str) -> Result<RenderedFormula, RenderError> {
        let prepared = prepare(&self.validator, self.pipeline.cache(), formula)?;
        let fingerprint = prepared.rendered.fingerprint.clone();
        if prepared.rendered.is_ready() {
            return Ok(prepared.rendered);
        }

        let gate = Gate::enter(&self.in_flight, &fingerprint);
        let outcome = {
            let _turn = gate.lock.lock().await;
            self.pipeline.render(&fingerprint, &prepared.formula).await
        };
        drop(gate);

        outcome?;
        Ok(prepared.rendered)
    }
}

/// Queues renders on the shared worker.
pub struct AsyncRenderer {
    validator: Arc<Validator>,
    cache: ArtifactCache,
    coordinator: Coordinator,
    poll_interval: Duration,
    result_timeout: Option<Duration>,
}

impl AsyncRenderer {
    pub fn new(config: RendererConfig) -> Result<Self, RenderError> {
        let typesetter = Arc::new(LatexTypesetter::from_config(&config));
        Self::with_typesetter(config, typesetter)
    }

    /// The typesetter is only used if this process ends up hosting the worker.
    pub fn with_typesetter(config: RendererConfig, typesetter: Arc<dyn Typesetter>) -> Result<Self, RenderError> {
        setup(&config)?;
        let validator = Arc::new(Validator::new(config.blacklist.clone()));
        let pipeline = Arc::new(RenderPipeline::from_config(&config, typesetter));
        Ok(Self {
            cache: pipeline.cache().clone(),
            coordinator: Coordinator::new(&config, pipeline, validator.clone()),
            validator,
            poll_interval: config.poll_interval(),
            result_timeout: config.result_timeout(),
        })
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Validate and enqueue. Returns at once; the artifact may not exist yet.
    pub async fn render(&self, formula: &str) -> Result<RenderedFormula, RenderError> {
        let prepared = prepare(&self.validator, &self.cache, formula)?;
        if prepared.rendered.is_ready() {
            debug!(fingerprint = %prepared.rendered.fingerprint.short(), "cache hit");
            return Ok(prepared.rendered);
        }

        let submission = self
            .coordinator
            .submit(&prepared.rendered.fingerprint, &prepared.formula)
            .await?;
        if submission == Submission::Queued {
            info!(fingerprint = %prepared.rendered.fingerprint.short(), "render queued");
        }
        Ok(prepared.rendered)
    }

    /// Block until the fingerprint is rendered, or its job is gone
    /// without an artifact.
    pub async fn result(&self, fingerprint: &Fingerprint) -> Result<RenderedFormula, RenderError> {
        let rendered = RenderedFormula::new(&self.cache, fingerprint.clone());
        if rendered.is_ready() {
            return Ok(rendered);
        }

        let started = Instant::now();
        while self.coordinator.enqueued_status(fingerprint).await? {
            if let Some(limit) = self.result_timeout {
                if started.elapsed() >= limit {
                    return Err(RenderError::TimedOut {
                        fingerprint: fingerprint.clone(),
                        waited: started.elapsed(),
                    });
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        if rendered.is_ready() {
            Ok(rendered)
        } else {
            Err(RenderError::Unavailable { fingerprint: fingerprint.clone() })
        }
    }

    /// Let a worker hosted in this process finish the work other clients
    /// queued on it. Returns at once when another process hosts.
    pub async fn shutdown(&self) {
        self.coordinator.join_worker().await;
    }

    /// `render` followed by `result`.
    pub async fn render_and_wait(&self, formula: &str) -> Result<RenderedFormula, RenderError> {
        let queued = self.render(formula).await?;
        self.result(&queued.fingerprint).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typesetter::TypesetterError;
    use crate::workspace::Workspace;
    use async_trait::async_trait;

    struct Sleepy;

    #[async_trait]
    impl Typesetter for Sleepy {
        async fn run(&self, workspace: &Workspace, formula: &str) -> Result<PathBuf, TypesetterError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            let image = workspace.file("png");
            tokio::fs::write(&image, formula).await.map_err(TypesetterError::Source)?;
            Ok(image)
        }
    }

    fn in_flight_len(renderer: &Renderer) -> usize {
        renderer.in_flight.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_cancelled_render_releases_its_gate() {
        let root = tempfile::tempdir().unwrap();
        let renderer = Arc::new(
            Renderer::with_typesetter(RendererConfig::rooted_at(root.path()), Arc::new(Sleepy)).unwrap(),
        );

        let task = {
            let renderer = renderer.clone();
            tokio::spawn(async move { renderer.render("x").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(in_flight_len(&renderer), 1);

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());
        assert_eq!(in_flight_len(&renderer), 0);
    }

    #[tokio::test]
    async fn test_waiters_share_gate_until_last_leaves() {
        let root = tempfile::tempdir().unwrap();
        let renderer = Arc::new(
            Renderer::with_typesetter(RendererConfig::rooted_at(root.path()), Arc::new(Sleepy)).unwrap(),
        );

        let first = {
            let renderer = renderer.clone();
            tokio::spawn(async move { renderer.render("y").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = {
            let renderer = renderer.clone();
            tokio::spawn(async move { renderer.render("y").await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        second.abort();
        let _ = second.await;
        assert_eq!(in_flight_len(&renderer), 1);

        assert!(first.await.unwrap().unwrap().is_ready());
        assert_eq!(in_flight_len(&renderer), 0);
    }
}
