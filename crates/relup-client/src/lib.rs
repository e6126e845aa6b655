//! # relup-client
//!
//! Client side of the relup self-update system.
//!
//! This crate handles:
//! - Fetching the signed version manifest, with an on-disk fallback copy
//! - Verifying manifest signatures against the shipped public keys
//! - Deciding whether a newer version is published
//! - Downloading it through a binary patch chain, or in full
//! - Reporting progress to registered callbacks
//!
//! ## Security
//!
//! - Updates are only offered from a manifest signed by a trusted key
//! - Every patch and archive is hash-checked before use
//! - Nothing is written to the update folder until its hash matches

pub mod client;
pub mod download;
pub mod error;
pub mod fetch;
pub mod patcher;
pub mod progress;
pub mod update;

// Re-export main types for convenience
pub use client::{ClientState, UpdateClient, UPDATE_FOLDER};
pub use download::Downloader;
pub use error::UpdateError;
pub use fetch::{DirectoryFetcher, DownloaderConfig, Fetcher, HttpFetcher};
pub use patcher::{PatchPlan, PatchStep};
pub use progress::{Progress, ProgressCallback, ProgressHooks, ProgressStatus};
pub use update::UpdateHandle;
