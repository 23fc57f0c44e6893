//! Typesetter - the external three-stage toolchain
//!
//! markup -> intermediate (`latex`), intermediate -> spool (`dvips`),
//! spool -> raster (`convert`). Each stage runs in the workspace with an
//! argv vector (no shell), must exit zero and must leave its output file.
//! The first failing stage aborts the rest.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::config::{RendererConfig, ToolCommands};
use crate::templates::DocumentTemplate;
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Compile,
    Spool,
    Rasterize,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compile => write!(f, "compile"),
            Self::Spool => write!(f, "spool"),
            Self::Rasterize => write!(f, "rasterize"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TypesetterError {
    #[error("Failed to write markup source: {0}")]
    Source(#[source] std::io::Error),

    #[error("Stage {stage} could not be started ({program}): {source}")]
    Spawn {
        stage: Stage,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Stage {stage} failed with {status}:\n{output}")]
    StageFailed {
        stage: Stage,
        status: String,
        output: String,
    },

    #[error("Stage {stage} succeeded but produced no {}", path.display())]
    MissingOutput { stage: Stage, path: PathBuf },

    #[error("Stage {stage} timed out after {after:?}")]
    StageTimedOut { stage: Stage, after: Duration },
}

impl TypesetterError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::Source(_) => None,
            Self::Spawn { stage, .. }
            | Self::StageFailed { stage, .. }
            | Self::MissingOutput { stage, .. }
            | Self::StageTimedOut { stage, .. } => Some(*stage),
        }
    }
}

/// Pluggable boundary to the external conversion tools.
#[async_trait]
pub trait Typesetter: Send + Sync {
    /// Render `formula` inside `workspace`, returning the raw image path
    /// (which lives inside the workspace).
    async fn run(&self, workspace: &Workspace, formula: &str) -> Result<PathBuf, TypesetterError>;
}

/// One external invocation: program, argv and expected output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCommand {
    pub stage: Stage,
    pub program: String,
    pub args: Vec<String>,
    pub output: PathBuf,
}

pub struct LatexTypesetter {
    tools: ToolCommands,
    template: DocumentTemplate,
    convert_args: Vec<String>,
    image_format: String,
    stage_timeout: Option<Duration>,
}

impl LatexTypesetter {
    pub fn from_config(config: &RendererConfig) -> Self {
        Self {
            tools: config.tools.clone(),
            template: config.template.clone(),
            convert_args: config.convert_args(),
            image_format: config.image_format.clone(),
            stage_timeout: config.stage_timeout(),
        }
    }

    /// The three stage invocations for a workspace, in order.
    pub fn commands(&self, workspace: &Workspace) -> [StageCommand; 3] {
        let tex = workspace.file("tex");
        let dvi = workspace.file("dvi");
        let ps = workspace.file("ps");
        let image = workspace.file(&self.image_format);

        let mut convert = self.convert_args.clone();
        convert.push(path_arg(&ps));
        convert.push(path_arg(&image));

        [
            StageCommand {
                stage: Stage::Compile,
                program: self.tools.latex.clone(),
                args: vec![
                    "--interaction=nonstopmode".to_string(),
                    format!("--output-directory={}", workspace.dir().display()),
                    path_arg(&tex),
                ],
                output: dvi.clone(),
            },
            StageCommand {
                stage: Stage::Spool,
                program: self.tools.dvips.clone(),
                args: vec!["-E".to_string(), path_arg(&dvi), "-o".to_string(), path_arg(&ps)],
                output: ps,
            },
            StageCommand {
                stage: Stage::Rasterize,
                program: self.tools.convert.clone(),
                args: convert,
                output: image,
            },
        ]
    }

    async fn execute(&self, workspace: &Workspace, command: &StageCommand) -> Result<(), TypesetterError> {
        debug!(stage = %command.stage, program = %command.program, "running stage");

        let child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(workspace.dir())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TypesetterError::Spawn {
                stage: command.stage,
                program: command.program.clone(),
                source,
            })?;

        let waited = child.wait_with_output();
        let output = match self.stage_timeout {
            Some(after) => tokio::time::timeout(after, waited)
                .await
                .map_err(|_| TypesetterError::StageTimedOut { stage: command.stage, after })?,
            None => waited.await,
        }
        .map_err(|source| TypesetterError::Spawn {
            stage: command.stage,
            program: command.program.clone(),
            source,
        })?;

        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(TypesetterError::StageFailed {
                stage: command.stage,
                status: output.status.to_string(),
                output: text,
            });
        }

        if !command.output.is_file() {
            return Err(TypesetterError::MissingOutput {
                stage: command.stage,
                path: command.output.clone(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Typesetter for LatexTypesetter {
    async fn run(&self, workspace: &Workspace, formula: &str) -> Result<PathBuf, TypesetterError> {
        tokio::fs::write(workspace.file("tex"), self.template.render(formula))
            .await
            .map_err(TypesetterError::Source)?;

        let commands = self.commands(workspace);
        for command in &commands {
            self.execute(workspace, command).await?;
        }
        Ok(workspace.file(&self.image_format))
    }
}

fn path_arg(path: &std::path::Path) -> String {
    path.display().to_string()
}
