//! Patch generation jobs and the worker pool that runs them.
//!
//! Each job is independent: it reads two archives and writes one patch
//! file. Jobs run on a rayon pool sized to the available CPU parallelism.

use std::path::PathBuf;

use rayon::prelude::*;

use relup_core::hash::file_sha256_hex;
use relup_core::patch;

use crate::error::PublishError;

/// One (old archive → new archive) patch to generate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchJob {
    /// Archive the patch starts from
    pub src_path: PathBuf,
    /// Archive the patch produces
    pub dst_path: PathBuf,
    /// Where the patch is written
    pub patch_path: PathBuf,
    pub patch_number: Option<u64>,
    pub patch_name: Option<String>,
}

impl PatchJob {
    /// A job may run only when its destination exists and it has been
    /// given a name and sequence number.
    pub fn is_ready(&self) -> bool {
        self.dst_path.exists() && self.patch_name.is_some() && self.patch_number.is_some()
    }

    /// Generate the patch file and return its hash.
    fn run(&self) -> Result<String, PublishError> {
        tracing::info!(
            src = %self.src_path.display(),
            dst = %self.dst_path.display(),
            patch = ?self.patch_name,
            "creating patch"
        );
        let bytes = patch::diff_files(&self.src_path, &self.dst_path)?;
        std::fs::write(&self.patch_path, &bytes)?;
        let hash = file_sha256_hex(&self.patch_path)?;
        tracing::info!(patch = ?self.patch_name, size = bytes.len(), "done creating patch");
        Ok(hash)
    }
}

/// Result of one job.
#[derive(Debug)]
pub struct PatchOutcome {
    pub job: PatchJob,
    /// Hash of the written patch
    pub result: Result<String, PublishError>,
}

/// Run every ready job in parallel. Unready jobs are skipped and logged.
pub fn run_patch_jobs(jobs: Vec<PatchJob>) -> Result<Vec<PatchOutcome>, PublishError> {
    let (ready, unready): (Vec<PatchJob>, Vec<PatchJob>) =
        jobs.into_iter().partition(PatchJob::is_ready);

    for job in &unready {
        tracing::error!(dst = %job.dst_path.display(), "patch job is missing attributes, skipping");
    }
    if ready.is_empty() {
        return Ok(Vec::new());
    }

    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| PublishError::Worker(e.to_string()))?;

    tracing::info!(jobs = ready.len(), threads, "starting patch creation");
    let outcomes = pool.install(|| {
        ready
            .into_par_iter()
            .map(|job| {
                let result = job.run();
                if let Err(e) = &result {
                    tracing::error!(dst = %job.dst_path.display(), error = %e, "patch creation failed");
                }
                PatchOutcome { job, result }
            })
            .collect()
    });
    Ok(outcomes)
}
