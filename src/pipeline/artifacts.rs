//! Per-job artifact accounting with guaranteed cleanup.
//!
//! Every temporary file a job creates is registered in the job's
//! [`ArtifactSet`] at the moment its path is chosen, before any tool
//! writes to it. Dropping the set deletes every registered file and then the
//! job's private scratch directory. This also runs when the job future is
//! dropped mid-flight.
//!
//! Cleanup is best-effort: a file that cannot be removed is logged and
//! skipped, never turned into a job error.

use crate::job::{JobId, Stage};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// A temporary file owned by exactly one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub job: JobId,
    pub created_by: Stage,
}

/// Scratch directory plus the registry of artifacts created in it.
#[derive(Debug)]
pub struct ArtifactSet {
    job: JobId,
    dir: Option<TempDir>,
    registered: Vec<PathBuf>,
}

impl ArtifactSet {
    /// Create a private scratch directory for `job`, under `parent` if given.
    pub fn new(job: &JobId, parent: Option<&Path>) -> io::Result<Self> {
        let prefix = format!("{job}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let dir = match parent {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        debug!("{job}: scratch dir {}", dir.path().display());
        Ok(Self {
            job: job.clone(),
            dir: Some(dir),
            registered: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => Path::new(""),
        }
    }

    /// Claim `file_name` inside the scratch directory for `stage`.
    ///
    /// Nothing is written; the path is registered so that whatever a tool
    /// later writes there is cleaned up with the job.
    pub fn claim(&mut self, file_name: &str, stage: Stage) -> Artifact {
        let path = self.dir().join(file_name);
        self.register(path, stage)
    }

    /// Register a file some tool already produced.
    pub fn register(&mut self, path: PathBuf, stage: Stage) -> Artifact {
        if !self.registered.contains(&path) {
            self.registered.push(path.clone());
        }
        Artifact {
            path,
            job: self.job.clone(),
            created_by: stage,
        }
    }

    /// Write `bytes` to a new artifact named `file_name`.
    pub fn write(&mut self, file_name: &str, bytes: &[u8], stage: Stage) -> io::Result<Artifact> {
        let artifact = self.claim(file_name, stage);
        std::fs::write(&artifact.path, bytes)?;
        Ok(artifact)
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    /// Delete every artifact and the scratch directory now.
    ///
    /// Returns how many registered files were actually removed.
    pub fn release(mut self) -> usize {
        self.cleanup()
    }

    fn cleanup(&mut self) -> usize {
        let mut removed = 0;
        for path in self.registered.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("{}: could not remove artifact {}: {e}", self.job, path.display()),
            }
        }
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("{}: could not remove scratch dir {}: {e}", self.job, path.display());
            }
        }
        removed
    }
}

impl Drop for ArtifactSet {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ConverterKind;

    #[test]
    fn drop_removes_registered_files_and_dir() {
        let parent = tempfile::tempdir().unwrap();
        let job = JobId::new();
        let dir;
        let input;
        let output;
        {
            let mut set = ArtifactSet::new(&job, Some(parent.path())).unwrap();
            dir = set.dir().to_path_buf();
            input = set.write("upload.spl", b"bytes", Stage::Ingest).unwrap();
            output = set.claim("page-00001.png", Stage::Convert(ConverterKind::MetafileToPng));
            std::fs::write(&output.path, b"png").unwrap();
            assert_eq!(set.len(), 2);
            assert!(input.path.exists());
            assert_eq!(input.job, job);
        }
        assert!(!input.path.exists());
        assert!(!output.path.exists());
        assert!(!dir.exists());
        assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn claimed_but_never_written_is_fine() {
        let parent = tempfile::tempdir().unwrap();
        let mut set = ArtifactSet::new(&JobId::new(), Some(parent.path())).unwrap();
        set.claim("never-written.png", Stage::Merge);
        set.write("real.bin", b"x", Stage::Ingest).unwrap();
        assert_eq!(set.release(), 1);
        assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn unregistered_files_in_scratch_dir_are_removed_too() {
        let parent = tempfile::tempdir().unwrap();
        let set = ArtifactSet::new(&JobId::new(), Some(parent.path())).unwrap();
        std::fs::write(set.dir().join("stray.png"), b"tool leftovers").unwrap();
        drop(set);
        assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn failed_removal_is_skipped_not_fatal() {
        let parent = tempfile::tempdir().unwrap();
        let mut set = ArtifactSet::new(&JobId::new(), Some(parent.path())).unwrap();
        // remove_file refuses a directory, even for root.
        let wedged = set.dir().join("page-00001.png");
        std::fs::create_dir(&wedged).unwrap();
        std::fs::write(wedged.join("inner"), b"x").unwrap();
        set.register(wedged, Stage::Merge);
        set.write("merged.png", b"png", Stage::Merge).unwrap();

        assert_eq!(set.release(), 1);
        assert_eq!(std::fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn registering_twice_is_idempotent() {
        let mut set = ArtifactSet::new(&JobId::new(), None).unwrap();
        let a = set.claim("a.png", Stage::Merge);
        set.register(a.path.clone(), Stage::Merge);
        assert_eq!(set.len(), 1);
    }
}
