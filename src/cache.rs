//! Artifact Cache
//!
//! The canonical path `<image_dir>/<fingerprint>.<format>` is the only
//! authority for "this fingerprint is rendered". There is no index.
//! Artifacts are written to a private staging file inside `image_dir` and
//! linked into place without clobbering, so readers never observe a
//! partial file and a visible artifact is never replaced.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::hashing::Fingerprint;

#[derive(Debug, Clone)]
pub struct ArtifactCache {
    image_dir: PathBuf,
    image_format: String,
}

impl ArtifactCache {
    pub fn new(image_dir: impl Into<PathBuf>, image_format: impl Into<String>) -> Self {
        Self {
            image_dir: image_dir.into(),
            image_format: image_format.into(),
        }
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn image_format(&self) -> &str {
        &self.image_format
    }

    pub fn artifact_name(&self, fingerprint: &Fingerprint) -> String {
        format!("{}.{}", fingerprint, self.image_format)
    }

    pub fn artifact_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.image_dir.join(self.artifact_name(fingerprint))
    }

    /// Cheap existence check against the canonical path.
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<PathBuf> {
        let path = self.artifact_path(fingerprint);
        path.is_file().then_some(path)
    }

    /// Publish `source` as the artifact for `fingerprint`.
    ///
    /// If another writer published first, its artifact wins and ours is
    /// discarded. Either way the returned path holds a complete artifact.
    pub fn publish(&self, fingerprint: &Fingerprint, source: &Path) -> io::Result<PathBuf> {
        let canonical = self.artifact_path(fingerprint);
        if canonical.is_file() {
            debug!(fingerprint = %fingerprint.short(), "artifact already published");
            return Ok(canonical);
        }

        let mut staged = tempfile::Builder::new()
            .prefix(&format!(".{}.", fingerprint.short()))
            .suffix(".partial")
            .tempfile_in(&self.image_dir)?;
        let mut input = File::open(source)?;
        io::copy(&mut input, staged.as_file_mut())?;
        staged.as_file().sync_all()?;

        match staged.persist_noclobber(&canonical) {
            Ok(_) => {
                debug!(fingerprint = %fingerprint.short(), path = %canonical.display(), "artifact published");
                Ok(canonical)
            }
            // Lost the race to another writer; the staged file is dropped.
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(canonical),
            Err(err) => Err(err.error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> (tempfile::TempDir, ArtifactCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path(), "png");
        (dir, cache)
    }

    #[test]
    fn test_artifact_path_is_deterministic() {
        let (_dir, cache) = fixture();
        let fp = Fingerprint::of("x^2");
        assert_eq!(cache.artifact_path(&fp), cache.artifact_path(&Fingerprint::of("x^2")));
        assert_eq!(cache.artifact_name(&fp), format!("{}.png", fp));
    }

    #[test]
    fn test_lookup_misses_then_hits() {
        let (dir, cache) = fixture();
        let fp = Fingerprint::of("x^2");
        assert!(cache.lookup(&fp).is_none());

        let source = dir.path().join("raw.png");
        fs::write(&source, b"image").unwrap();
        let published = cache.publish(&fp, &source).unwrap();

        assert_eq!(cache.lookup(&fp), Some(published.clone()));
        assert_eq!(fs::read(published).unwrap(), b"image");
    }

    #[test]
    fn test_publish_never_replaces_visible_artifact() {
        let (dir, cache) = fixture();
        let fp = Fingerprint::of("x^2");
        let first = dir.path().join("first.png");
        let second = dir.path().join("second.png");
        fs::write(&first, b"first").unwrap();
        fs::write(&second, b"second").unwrap();

        cache.publish(&fp, &first).unwrap();
        let path = cache.publish(&fp, &second).unwrap();
        assert_eq!(fs::read(path).unwrap(), b"first");
    }

    #[test]
    fn test_publish_leaves_no_staging_files() {
        let (dir, cache) = fixture();
        let fp = Fingerprint::of("z");
        let source = dir.path().join("raw.png");
        fs::write(&source, b"z").unwrap();
        cache.publish(&fp, &source).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_publish_missing_source_creates_nothing() {
        let (dir, cache) = fixture();
        let fp = Fingerprint::of("missing");
        assert!(cache.publish(&fp, &dir.path().join("nope.png")).is_err());
        assert!(cache.lookup(&fp).is_none());
    }
}
