//! Durable per-job manifests under `<state_dir>/manifests/`.
//!
//! One JSON file per job, replaced atomically on every write. Distinct jobs
//! never share a file, so concurrent persists need no global lock.

use crate::{
    error::ManifestError,
    job::{Job, JobId},
    util::write_atomic,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::debug;

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Serialize)]
struct ManifestOut<'a> {
    v: u32,
    #[serde(flatten)]
    job: &'a Job,
}

#[derive(Deserialize)]
struct VersionHeader {
    #[serde(default)]
    v: u32,
}

#[derive(Debug, Clone)]
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn open(state_dir: &Path) -> Result<Self, ManifestError> {
        let dir = state_dir.join("manifests");
        std::fs::create_dir_all(&dir).map_err(|source| ManifestError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn manifest_path(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn cancel_path(&self, id: &JobId) -> PathBuf {
        self.dir.join(format!("{id}.cancel"))
    }

    pub fn persist(&self, job: &Job) -> Result<(), ManifestError> {
        let path = self.manifest_path(&job.job_id);
        let out = ManifestOut {
            v: MANIFEST_VERSION,
            job,
        };
        let bytes = serde_json::to_vec_pretty(&out).map_err(|source| ManifestError::Json {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &bytes).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;
        debug!("persisted manifest job={} status={}", job.job_id, job.status);
        Ok(())
    }

    pub fn load(&self, id: &JobId) -> Result<Job, ManifestError> {
        let path = self.manifest_path(id);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ManifestError::NotFound(id.to_string()));
            }
            Err(source) => return Err(ManifestError::Io { path, source }),
        };
        let header: VersionHeader =
            serde_json::from_slice(&bytes).map_err(|source| ManifestError::Json {
                path: path.clone(),
                source,
            })?;
        if header.v != MANIFEST_VERSION {
            return Err(ManifestError::Version {
                path,
                found: header.v,
            });
        }
        // The version key is ignored by `Job` itself.
        serde_json::from_slice(&bytes).map_err(|source| ManifestError::Json { path, source })
    }

    pub fn exists(&self, id: &JobId) -> bool {
        self.manifest_path(id).is_file()
    }

    /// Job ids oldest first; `since` keeps ids whose timestamp is at or after it.
    pub fn list(&self, since: Option<OffsetDateTime>) -> Result<Vec<JobId>, ManifestError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|source| ManifestError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let since_ms = since.map(|t| (t.unix_timestamp_nanos() / 1_000_000).max(0) as u64);

        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ManifestError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            let Ok(id) = JobId::parse(stem) else { continue };
            if since_ms.is_some_and(|ms| id.timestamp_ms() < ms) {
                continue;
            }
            ids.push(id);
        }
        ids.sort();
        Ok(ids)
    }

    /// Leaves a marker any process driving the job will observe between steps.
    pub fn request_cancel(&self, id: &JobId) -> Result<(), ManifestError> {
        let path = self.cancel_path(id);
        write_atomic(&path, b"cancel\n").map_err(|source| ManifestError::Io { path, source })
    }

    pub fn cancel_requested(&self, id: &JobId) -> bool {
        self.cancel_path(id).is_file()
    }
}
