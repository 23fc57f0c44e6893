//! Render Pipeline - Single Entry Point per Job
//!
//! workspace -> typesetter -> publish. The workspace is discarded on every
//! path out of `render`; the artifact only becomes visible after the last
//! stage succeeded.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::cache::ArtifactCache;
use crate::config::RendererConfig;
use crate::hashing::Fingerprint;
use crate::typesetter::{LatexTypesetter, Typesetter, TypesetterError};
use crate::workspace::WorkspaceManager;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Workspace error: {0}")]
    Workspace(#[source] std::io::Error),

    #[error(transparent)]
    Typesetter(#[from] TypesetterError),

    #[error("Publish error: {0}")]
    Publish(#[source] std::io::Error),
}

/// Outcome of one pipeline pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rendered {
    /// The typesetter ran and the artifact was published.
    Fresh(PathBuf),
    /// The artifact was already in the cache; nothing ran.
    Cached(PathBuf),
}

impl Rendered {
    pub fn path(&self) -> &PathBuf {
        match self {
            Self::Fresh(path) | Self::Cached(path) => path,
        }
    }
}

pub struct RenderPipeline {
    cache: ArtifactCache,
    workspaces: WorkspaceManager,
    typesetter: Arc<dyn Typesetter>,
}

impl RenderPipeline {
    pub fn new(cache: ArtifactCache, workspaces: WorkspaceManager, typesetter: Arc<dyn Typesetter>) -> Self {
        Self {
            cache,
            workspaces,
            typesetter,
        }
    }

    pub fn from_config(config: &RendererConfig, typesetter: Arc<dyn Typesetter>) -> Self {
        Self::new(
            ArtifactCache::new(&config.image_dir, &config.image_format),
            WorkspaceManager::new(&config.temp_dir, config.debug),
            typesetter,
        )
    }

    /// Pipeline backed by the external latex toolchain.
    pub fn latex(config: &RendererConfig) -> Self {
        Self::from_config(config, Arc::new(LatexTypesetter::from_config(config)))
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Render a validated formula unless its artifact already exists.
    pub async fn render(&self, fingerprint: &Fingerprint, formula: &str) -> Result<Rendered, PipelineError> {
        if let Some(path) = self.cache.lookup(fingerprint) {
            return Ok(Rendered::Cached(path));
        }

        let mut workspace = self
            .workspaces
            .create(fingerprint)
            .await
            .map_err(PipelineError::Workspace)?;

        let raw = match self.typesetter.run(&workspace, formula).await {
            Ok(raw) => raw,
            Err(err) => {
                workspace.mark_failed();
                warn!(fingerprint = %fingerprint.short(), stage = ?err.stage(), error = %err, "render failed");
                return Err(err.into());
            }
        };

        let cache = self.cache.clone();
        let fp = fingerprint.clone();
        let published = tokio::task::spawn_blocking(move || cache.publish(&fp, &raw))
            .await
            .map_err(|join| PipelineError::Publish(std::io::Error::other(join)))?;

        match published {
            Ok(path) => {
                info!(fingerprint = %fingerprint.short(), path = %path.display(), "rendered");
                Ok(Rendered::Fresh(path))
            }
            Err(err) => {
                workspace.mark_failed();
                Err(PipelineError::Publish(err))
            }
        }
    }
}
