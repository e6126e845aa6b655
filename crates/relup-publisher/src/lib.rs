//! # relup-publisher
//!
//! Publisher side of the relup self-update system.
//!
//! This crate handles:
//! - Inspecting release archives dropped into the repository
//! - Recording them in the version manifest
//! - Generating binary patches between consecutive releases
//! - Signing-key management and manifest signing through the `relup` CLI

pub mod builder;
pub mod cli;
pub mod error;
pub mod jobs;
pub mod package;
#[cfg(test)]
mod proptests;
pub mod repo;

// Re-export main types for convenience
pub use builder::{ManifestBuilder, ProcessReport, RepoDirs};
pub use cli::Cli;
pub use error::PublishError;
pub use jobs::{run_patch_jobs, PatchJob, PatchOutcome};
pub use package::{PackageArtifact, RejectedArtifact};
pub use repo::Repository;
