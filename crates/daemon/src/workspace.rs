//! Per-job output directory.

use crate::jobs::{validate_job_id, JobError};
use crate::manifest::MASTER_PLAYLIST_NAME;
use crate::rendition::RenditionSpec;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    InvalidJobId(#[from] JobError),

    #[error("failed to prepare workspace {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// `<output_root>/<job_id>/`, holding every rendition and the master playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWorkspace {
    dir: PathBuf,
}

impl JobWorkspace {
    /// Create (or reuse) the workspace for `job_id`.
    ///
    /// A master playlist left over from an earlier delivery is removed, so the
    /// directory only holds one when the current attempt completes. Rendition
    /// files are kept and get overwritten by the new encode.
    pub fn prepare(output_root: &Path, job_id: &str) -> Result<Self, WorkspaceError> {
        validate_job_id(job_id)?;
        let dir = output_root.join(job_id);

        fs::create_dir_all(&dir).map_err(|source| WorkspaceError::Io {
            path: dir.clone(),
            source,
        })?;

        for stale in [
            dir.join(MASTER_PLAYLIST_NAME),
            dir.join(format!(".{}.tmp", MASTER_PLAYLIST_NAME)),
        ] {
            match fs::remove_file(&stale) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(WorkspaceError::Io { path: stale, source }),
            }
        }

        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn playlist_path(&self, spec: &RenditionSpec) -> PathBuf {
        self.dir.join(spec.playlist_name())
    }

    pub fn master_path(&self) -> PathBuf {
        self.dir.join(MASTER_PLAYLIST_NAME)
    }

    /// Number of `.ts` segments written for `spec`.
    pub fn count_segments(&self, spec: &RenditionSpec) -> usize {
        let prefix = spec.segment_prefix();
        WalkDir::new(&self.dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                let name = e.file_name().to_string_lossy();
                name.starts_with(&prefix) && name.ends_with(".ts")
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_creates_namespaced_dir() {
        let root = TempDir::new().unwrap();
        let ws = JobWorkspace::prepare(root.path(), "job-7").unwrap();

        assert_eq!(ws.dir(), root.path().join("job-7"));
        assert!(ws.dir().is_dir());
        assert_eq!(
            ws.playlist_path(&RenditionSpec::new(720, 1000)),
            root.path().join("job-7/720p.m3u8")
        );
        assert_eq!(ws.master_path(), root.path().join("job-7/master.m3u8"));
    }

    #[test]
    fn test_prepare_removes_stale_master_but_keeps_renditions() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("job-7");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("master.m3u8"), "#EXTM3U\n").unwrap();
        fs::write(dir.join("360p.m3u8"), "#EXTM3U\n").unwrap();

        let ws = JobWorkspace::prepare(root.path(), "job-7").unwrap();

        assert!(!ws.master_path().exists());
        assert!(dir.join("360p.m3u8").exists());
    }

    #[test]
    fn test_prepare_rejects_unsafe_id() {
        let root = TempDir::new().unwrap();
        assert!(matches!(
            JobWorkspace::prepare(root.path(), "../escape"),
            Err(WorkspaceError::InvalidJobId(_))
        ));
    }

    #[test]
    fn test_prepare_fails_when_root_is_a_file() {
        let root = TempDir::new().unwrap();
        let file = root.path().join("not-a-dir");
        fs::write(&file, "x").unwrap();

        assert!(matches!(
            JobWorkspace::prepare(&file, "job-1"),
            Err(WorkspaceError::Io { .. })
        ));
    }

    #[test]
    fn test_count_segments() {
        let root = TempDir::new().unwrap();
        let ws = JobWorkspace::prepare(root.path(), "job-1").unwrap();
        for name in ["360p_000.ts", "360p_001.ts", "720p_000.ts", "360p.m3u8"] {
            fs::write(ws.dir().join(name), b"").unwrap();
        }

        assert_eq!(ws.count_segments(&RenditionSpec::new(360, 500)), 2);
        assert_eq!(ws.count_segments(&RenditionSpec::new(720, 1000)), 1);
        assert_eq!(ws.count_segments(&RenditionSpec::new(1080, 3000)), 0);
    }
}
