//! Formula Renderer - content-addressed formula images
//!
//! # Guarantees
//! 1. Unsafe input never reaches the queue
//! 2. One fingerprint, one artifact
//! 3. An artifact is visible only once complete
//! 4. Workspaces never outlive their attempt (unless debugging a failure)
//! 5. At most one render worker per rendezvous address

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod hashing;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod renderer;
pub mod service;
pub mod telemetry;
pub mod templates;
pub mod typesetter;
pub mod validation;
pub mod workspace;

pub use cache::ArtifactCache;
pub use config::{ConfigError, RendererConfig};
pub use coordinator::{CoordinationError, Coordinator, Submission};
pub use hashing::Fingerprint;
pub use pipeline::{PipelineError, RenderPipeline, Rendered};
pub use renderer::{AsyncRenderer, RenderError, RenderedFormula, Renderer};
pub use templates::DocumentTemplate;
pub use typesetter::{LatexTypesetter, Stage, Typesetter, TypesetterError};
pub use validation::{ValidationError, Validator};
pub use workspace::{Workspace, WorkspaceManager};
