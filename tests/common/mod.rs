#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use formula_renderer::{RendererConfig, Stage, Typesetter, TypesetterError, Workspace};

/// Stands in for the external toolchain: writes the formula text as the
/// "image" and counts invocations.
pub struct FakeTypesetter {
    calls: AtomicUsize,
    delay: Duration,
    fail: bool,
    panic_on: Option<String>,
}

impl FakeTypesetter {
    pub fn new() -> Arc<Self> {
        Self::with(Duration::ZERO, false)
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Self::with(delay, false)
    }

    pub fn failing() -> Arc<Self> {
        Self::with(Duration::ZERO, true)
    }

    /// Panics mid-render for `formula`, renders anything else.
    pub fn panicking_on(formula: &str) -> Arc<Self> {
        Arc::new(Self {
            panic_on: Some(formula.to_string()),
            ..Self::build(Duration::ZERO, false)
        })
    }

    fn with(delay: Duration, fail: bool) -> Arc<Self> {
        Arc::new(Self::build(delay, fail))
    }

    fn build(delay: Duration, fail: bool) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            delay,
            fail,
            panic_on: None,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Typesetter for FakeTypesetter {
    async fn run(&self, workspace: &Workspace, formula: &str) -> Result<PathBuf, TypesetterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::fs::write(workspace.file("tex"), formula).await.map_err(TypesetterError::Source)?;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.panic_on.as_deref() == Some(formula) {
            panic!("typesetter crashed on {formula}");
        }
        if self.fail {
            return Err(TypesetterError::StageFailed {
                stage: Stage::Compile,
                status: "exit status: 1".to_string(),
                output: "! Undefined control sequence.\nl.11 \\frac".to_string(),
            });
        }
        let image = workspace.file("png");
        tokio::fs::write(&image, formula).await.map_err(TypesetterError::Source)?;
        Ok(image)
    }
}

/// Isolated config: images, workspaces and the socket under `root`.
pub fn test_config(root: &Path) -> RendererConfig {
    RendererConfig {
        image_dir: root.join("images"),
        temp_dir: root.join("work"),
        service_address: Some(root.join("worker.sock")),
        idle_timeout_ms: Some(2_000),
        poll_interval_ms: 10,
        submit_attempts: 5,
        submit_backoff_ms: 20,
        ..RendererConfig::default()
    }
}

/// Wait until something is listening at `address`.
pub async fn wait_for_worker(address: &Path) {
    for _ in 0..200 {
        if std::os::unix::net::UnixStream::connect(address).is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no worker came up at {}", address.display());
}

pub fn entries(dir: &Path) -> Vec<PathBuf> {
    match std::fs::read_dir(dir) {
        Ok(read) => read.filter_map(Result::ok).map(|e| e.path()).collect(),
        Err(_) => vec![],
    }
}
