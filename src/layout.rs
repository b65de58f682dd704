use crate::{config::Config, util::nonempty_file};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// How a job laid out its output on disk. Resolved once per ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobLayout {
    /// Written by the workflow manager; carries a manifest and runs in place.
    Modern { manifest: PathBuf },
    /// Older runs that may be split across relaxation stage subdirectories.
    Legacy,
}

impl JobLayout {
    pub fn resolve(cfg: &Config, job_dir: &Path) -> Self {
        let manifest = job_dir.join(&cfg.layout.manifest_filename);
        if manifest.is_file() {
            JobLayout::Modern { manifest }
        } else {
            JobLayout::Legacy
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, JobLayout::Legacy)
    }
}

/// A directory is valid when every marker file exists and is non-empty.
/// Zero-byte `OUTCAR`/`POSCAR` files are a common failure artifact.
pub fn is_valid_dir(cfg: &Config, dir: &Path) -> bool {
    cfg.layout
        .marker_files
        .iter()
        .all(|f| nonempty_file(&dir.join(f)))
}

/// Picks the directory whose contents describe the job's final state.
///
/// Legacy jobs finish in the second stage directory, but a job interrupted after
/// the first stage leaves its data in the base directory, so the order is:
/// second stage, base, then first stage regardless of validity.
pub fn select_last_relax_dir(cfg: &Config, job_dir: &Path, layout: &JobLayout) -> PathBuf {
    if !layout.is_legacy() {
        return job_dir.to_path_buf();
    }

    let second = job_dir.join(&cfg.layout.second_stage_dir);
    if is_valid_dir(cfg, &second) {
        return second;
    }
    if is_valid_dir(cfg, job_dir) {
        return job_dir.to_path_buf();
    }
    job_dir.join(&cfg.layout.first_stage_dir)
}
