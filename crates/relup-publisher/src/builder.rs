//! Package processing: from candidate archives to an updated manifest.
//!
//! A processing pass:
//!
//! 1. Inspects every file in the candidate directory
//! 2. Records accepted archives in the manifest, ascending by version
//! 3. Schedules a patch from the previous latest archive of the same
//!    (name, platform) to each newer archive
//! 4. Generates patches in parallel and attaches them to their archives
//! 5. Saves the manifest and patch counters
//! 6. Publishes archives and patches to `deploy`, retains archives in
//!    `files`, and drops the archives patches were made from
//!
//! The manifest saved here is unsigned; signing is a separate step.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use relup_core::config::RepoConfig;
use relup_core::store::{load_typed, save_typed, KEY_REPO_CONFIG, KEY_VERSION_META};
use relup_core::{Manifest, ManifestStore, Version};

use crate::error::PublishError;
use crate::jobs::{run_patch_jobs, PatchJob};
use crate::package::{PackageArtifact, RejectedArtifact};

/// Directory under the repository root holding the working directories.
pub const DATA_DIR: &str = "relup-data";

/// Working directories of a publishing repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoDirs {
    pub root: PathBuf,
    /// Candidate archives waiting to be processed
    pub new_dir: PathBuf,
    /// Everything to upload
    pub deploy_dir: PathBuf,
    /// Retained archives that future patches start from
    pub files_dir: PathBuf,
}

impl RepoDirs {
    pub fn new(root: &Path) -> Self {
        let data = root.join(DATA_DIR);
        Self {
            root: root.to_path_buf(),
            new_dir: data.join("new"),
            deploy_dir: data.join("deploy"),
            files_dir: data.join("files"),
        }
    }

    /// Create any missing directory. Existing content is left alone.
    pub fn create(&self) -> std::io::Result<()> {
        for dir in [&self.new_dir, &self.deploy_dir, &self.files_dir] {
            if !dir.exists() {
                tracing::info!(dir = %dir.display(), "creating directory");
                std::fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }
}

/// Outcome of a processing pass.
#[derive(Debug, Default)]
pub struct ProcessReport {
    pub artifacts: Vec<PackageArtifact>,
    pub rejected: Vec<RejectedArtifact>,
}

/// Turns candidate archives into manifest entries and patches.
pub struct ManifestBuilder {
    store: Arc<dyn ManifestStore>,
    dirs: RepoDirs,
    patch_support: bool,
}

impl ManifestBuilder {
    /// Create the builder, creating missing working directories.
    pub fn new(
        store: Arc<dyn ManifestStore>,
        dirs: RepoDirs,
        patch_support: bool,
    ) -> Result<Self, PublishError> {
        dirs.create()?;
        Ok(Self {
            store,
            dirs,
            patch_support,
        })
    }

    pub fn dirs(&self) -> &RepoDirs {
        &self.dirs
    }

    /// Process every file in `candidate_dir`.
    pub fn process(&self, candidate_dir: &Path) -> Result<ProcessReport, PublishError> {
        self.store.reload()?;

        let mut manifest: Manifest = load_typed(self.store.as_ref(), KEY_VERSION_META).unwrap_or_default();
        // Content is about to change; old signatures would no longer verify.
        manifest.sigs.clear();
        let mut repo: RepoConfig = load_typed(self.store.as_ref(), KEY_REPO_CONFIG).unwrap_or_default();

        let (mut artifacts, rejected) = scan(candidate_dir)?;
        if artifacts.is_empty() {
            tracing::info!(rejected = rejected.len(), "no packages to process");
            return Ok(ProcessReport { artifacts, rejected });
        }
        artifacts.sort_by(|a, b| {
            (&a.name, &a.platform, a.version).cmp(&(&b.name, &b.platform, b.version))
        });

        let jobs = self.record_and_schedule(&mut manifest, &mut repo, &artifacts, candidate_dir);
        // Only archives a patch was actually made from are dropped.
        let mut sources = Vec::new();

        for outcome in run_patch_jobs(jobs)? {
            let Ok(hash) = outcome.result else {
                discard_partial_patch(&outcome.job.patch_path);
                continue;
            };
            sources.push(outcome.job.src_path.clone());
            if let Some(artifact) = artifacts.iter_mut().find(|a| a.path == outcome.job.dst_path) {
                artifact.patch_name = outcome.job.patch_name.clone();
                artifact.patch_hash = Some(hash);
                manifest.record_release(
                    &artifact.name,
                    &artifact.version,
                    &artifact.platform,
                    artifact.to_entry(),
                );
            }
        }

        save_typed(self.store.as_ref(), KEY_VERSION_META, &manifest)?;
        save_typed(self.store.as_ref(), KEY_REPO_CONFIG, &repo)?;
        tracing::info!(artifacts = artifacts.len(), "saved version manifest");

        self.move_packages(&artifacts, candidate_dir)?;
        self.remove_patch_sources(&sources)?;

        Ok(ProcessReport { artifacts, rejected })
    }

    /// Record each artifact and collect the patches to build. Artifacts
    /// must be sorted so that a batch holding several versions of one
    /// (name, platform) patches each from its predecessor.
    fn record_and_schedule(
        &self,
        manifest: &mut Manifest,
        repo: &mut RepoConfig,
        artifacts: &[PackageArtifact],
        candidate_dir: &Path,
    ) -> Vec<PatchJob> {
        let mut jobs = Vec::new();
        // (name, platform) → newest archive of this batch, still in candidate_dir
        let mut batch_latest: HashMap<(&str, &str), &PackageArtifact> = HashMap::new();

        for artifact in artifacts {
            let key = (artifact.name.as_str(), artifact.platform.as_str());
            let previous = manifest.latest_version(&artifact.name, &artifact.platform);

            if self.patch_support {
                if let Some(previous) = previous.filter(|p| artifact.version > *p) {
                    match self.patch_source(manifest, artifact, &previous, batch_latest.get(&key).copied()) {
                        Some(src_path) => {
                            let number = repo.next_patch_number(&artifact.name);
                            let patch_name = format!("{}-{}-{}", artifact.name, artifact.platform, number);
                            tracing::info!(patch = %patch_name, "found source file to create patch");
                            jobs.push(PatchJob {
                                src_path,
                                dst_path: artifact.path.clone(),
                                patch_path: candidate_dir.join(&patch_name),
                                patch_number: Some(number),
                                patch_name: Some(patch_name),
                            });
                        }
                        None => tracing::warn!(
                            name = %artifact.name,
                            platform = %artifact.platform,
                            "no source file to patch from"
                        ),
                    }
                }
            }

            manifest.record_release(
                &artifact.name,
                &artifact.version,
                &artifact.platform,
                artifact.to_entry(),
            );
            if previous.map_or(true, |p| artifact.version > p) {
                batch_latest.insert(key, artifact);
            }
        }
        jobs
    }

    /// The archive of `previous`: from this batch if it was just added,
    /// otherwise the retained copy in `files`.
    fn patch_source(
        &self,
        manifest: &Manifest,
        artifact: &PackageArtifact,
        previous: &Version,
        in_batch: Option<&PackageArtifact>,
    ) -> Option<PathBuf> {
        if let Some(earlier) = in_batch.filter(|a| a.version == *previous) {
            return Some(earlier.path.clone());
        }
        let entry = manifest.release(&artifact.name, previous, &artifact.platform)?;
        let path = self.dirs.files_dir.join(&entry.filename);
        path.exists().then_some(path)
    }

    fn move_packages(&self, artifacts: &[PackageArtifact], candidate_dir: &Path) -> Result<(), PublishError> {
        tracing::info!("moving packages to deploy folder");
        for artifact in artifacts {
            if let Some(patch_name) = &artifact.patch_name {
                let patch = candidate_dir.join(patch_name);
                if patch.exists() {
                    move_file(&patch, &self.dirs.deploy_dir.join(patch_name))?;
                }
            }

            std::fs::copy(&artifact.path, self.dirs.deploy_dir.join(&artifact.filename))?;
            move_file(&artifact.path, &self.dirs.files_dir.join(&artifact.filename))?;
            tracing::debug!(filename = %artifact.filename, "published package");
        }
        Ok(())
    }

    /// Drop archives that patches were made from, wherever they now live
    /// in `files`.
    fn remove_patch_sources(&self, sources: &[PathBuf]) -> Result<(), PublishError> {
        for source in sources {
            let Some(filename) = source.file_name() else { continue };
            let retained = self.dirs.files_dir.join(filename);
            if retained.exists() {
                tracing::info!(file = %retained.display(), "removing patch source");
                std::fs::remove_file(&retained)?;
            }
        }
        Ok(())
    }
}

fn scan(candidate_dir: &Path) -> Result<(Vec<PackageArtifact>, Vec<RejectedArtifact>), PublishError> {
    tracing::info!(dir = %candidate_dir.display(), "getting package list");
    let mut accepted = Vec::new();
    let mut rejected = Vec::new();

    let mut paths: Vec<PathBuf> = std::fs::read_dir(candidate_dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    paths.sort();

    for path in paths {
        match PackageArtifact::inspect(&path) {
            Ok(artifact) => accepted.push(artifact),
            Err(reason) => rejected.push(reason),
        }
    }
    Ok((accepted, rejected))
}

fn discard_partial_patch(path: &Path) {
    if !path.exists() {
        return;
    }
    tracing::warn!(patch = %path.display(), "removing partial patch");
    if let Err(e) = std::fs::remove_file(path) {
        tracing::error!(patch = %path.display(), error = %e, "cannot remove partial patch");
    }
}

/// Rename, falling back to copy + remove across filesystems.
fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if to.exists() {
        std::fs::remove_file(to)?;
    }
    if std::fs::rename(from, to).is_err() {
        std::fs::copy(from, to)?;
        std::fs::remove_file(from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relup_core::patch;
    use relup_core::MemoryStore;
    use tempfile::TempDir;

    fn archive(seed: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(seed) ^ (i / 97) as u8).collect()
    }

    fn setup() -> (TempDir, Arc<MemoryStore>, ManifestBuilder) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let builder = ManifestBuilder::new(store.clone(), RepoDirs::new(dir.path()), true).unwrap();
        (dir, store, builder)
    }

    fn drop_in(builder: &ManifestBuilder, name: &str, content: &[u8]) {
        std::fs::write(builder.dirs().new_dir.join(name), content).unwrap();
    }

    fn stored_manifest(store: &MemoryStore) -> Manifest {
        load_typed(store, KEY_VERSION_META).unwrap()
    }

    #[test]
    fn test_first_release_has_no_patch() {
        let (_dir, store, builder) = setup();
        drop_in(&builder, "app-mac-0.1.0.tar.gz", &archive(3, 2000));
        drop_in(&builder, "app-xyz-0.1.0.tar.gz", b"bad");
        drop_in(&builder, "notes.txt", b"bad");

        let report = builder.process(&builder.dirs().new_dir.clone()).unwrap();
        assert_eq!(report.artifacts.len(), 1);
        assert_eq!(report.rejected.len(), 2);

        let manifest = stored_manifest(&store);
        let v010 = Version::parse("0.1.0").unwrap();
        assert_eq!(manifest.latest_version("app", "mac"), Some(v010));
        assert!(manifest.release("app", &v010, "mac").unwrap().patch().is_none());

        let dirs = builder.dirs();
        assert!(dirs.deploy_dir.join("app-mac-0.1.0.tar.gz").exists());
        assert!(dirs.files_dir.join("app-mac-0.1.0.tar.gz").exists());
        assert!(!dirs.new_dir.join("app-mac-0.1.0.tar.gz").exists());
    }

    #[test]
    fn test_second_release_is_patched_from_retained_file() {
        let (_dir, store, builder) = setup();
        let v1 = archive(3, 3000);
        let mut v2 = v1.clone();
        v2[100..150].copy_from_slice(&[9u8; 50]);

        drop_in(&builder, "app-mac-0.1.0.tar.gz", &v1);
        builder.process(&builder.dirs().new_dir.clone()).unwrap();
        drop_in(&builder, "app-mac-0.2.0.tar.gz", &v2);
        let report = builder.process(&builder.dirs().new_dir.clone()).unwrap();

        let artifact = &report.artifacts[0];
        assert_eq!(artifact.patch_name.as_deref(), Some("app-mac-101"));

        let manifest = stored_manifest(&store);
        let entry = manifest
            .release("app", &Version::parse("0.2.0").unwrap(), "mac")
            .unwrap();
        let (patch_name, patch_hash) = entry.patch().unwrap();
        assert_eq!(patch_name, "app-mac-101");

        let dirs = builder.dirs();
        let patch_bytes = std::fs::read(dirs.deploy_dir.join(patch_name)).unwrap();
        assert!(relup_core::hash::verify_bytes(&patch_bytes, patch_hash));
        assert_eq!(patch::apply(&v1, &patch_bytes).unwrap(), v2);

        // Only the newest archive is retained
        assert!(!dirs.files_dir.join("app-mac-0.1.0.tar.gz").exists());
        assert!(dirs.files_dir.join("app-mac-0.2.0.tar.gz").exists());

        let repo: RepoConfig = load_typed(store.as_ref(), KEY_REPO_CONFIG).unwrap();
        assert_eq!(repo.patches.get("app"), Some(&101));
    }

    #[test]
    fn test_failed_patch_keeps_source_and_leaves_no_patch() {
        let (_dir, store, builder) = setup();
        let dirs = builder.dirs().clone();
        drop_in(&builder, "app-mac-0.1.0.tar.gz", &archive(3, 3000));
        builder.process(&dirs.new_dir).unwrap();

        // An unreadable source makes the patch job fail
        let retained = dirs.files_dir.join("app-mac-0.1.0.tar.gz");
        std::fs::remove_file(&retained).unwrap();
        std::fs::create_dir(&retained).unwrap();
        drop_in(&builder, "app-mac-0.2.0.tar.gz", &archive(5, 3000));
        drop_in(&builder, "app-mac-101", b"half a patch");

        let report = builder.process(&dirs.new_dir).unwrap();
        let artifact = report.artifacts.iter().find(|a| a.filename == "app-mac-0.2.0.tar.gz").unwrap();
        assert!(artifact.patch_name.is_none());

        let manifest = stored_manifest(&store);
        let entry = manifest
            .release("app", &Version::parse("0.2.0").unwrap(), "mac")
            .unwrap();
        assert!(entry.patch().is_none());

        assert!(retained.is_dir());
        assert!(!dirs.new_dir.join("app-mac-101").exists());
        assert!(!dirs.deploy_dir.join("app-mac-101").exists());
        assert!(dirs.deploy_dir.join("app-mac-0.2.0.tar.gz").exists());
    }

    #[test]
    fn test_batch_of_versions_chains_patches() {
        let (_dir, store, builder) = setup();
        let v1 = archive(5, 2500);
        let mut v2 = v1.clone();
        v2[0] = 1;
        let mut v3 = v2.clone();
        v3.extend_from_slice(b"more");

        drop_in(&builder, "app-win-1.0.0.zip", &v1);
        drop_in(&builder, "app-win-1.2.0.zip", &v3);
        drop_in(&builder, "app-win-1.1.0.zip", &v2);
        builder.process(&builder.dirs().new_dir.clone()).unwrap();

        let manifest = stored_manifest(&store);
        let v = |s: &str| Version::parse(s).unwrap();
        assert_eq!(manifest.latest_version("app", "win"), Some(v("1.2.0")));
        assert!(manifest.release("app", &v("1.0.0"), "win").unwrap().patch().is_none());
        assert_eq!(
            manifest.release("app", &v("1.1.0"), "win").unwrap().patch().unwrap().0,
            "app-win-101"
        );
        assert_eq!(
            manifest.release("app", &v("1.2.0"), "win").unwrap().patch().unwrap().0,
            "app-win-102"
        );

        let deploy = &builder.dirs().deploy_dir;
        let p1 = std::fs::read(deploy.join("app-win-101")).unwrap();
        let p2 = std::fs::read(deploy.join("app-win-102")).unwrap();
        assert_eq!(patch::apply_chain(&v1, [p1.as_slice(), p2.as_slice()]).unwrap(), v3);

        let retained: Vec<_> = std::fs::read_dir(&builder.dirs().files_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(retained, vec![std::ffi::OsString::from("app-win-1.2.0.zip")]);
    }

    #[test]
    fn test_older_release_does_not_move_latest_or_patch() {
        let (_dir, store, builder) = setup();
        drop_in(&builder, "app-mac-2.0.0.tar.gz", &archive(7, 1000));
        builder.process(&builder.dirs().new_dir.clone()).unwrap();
        drop_in(&builder, "app-mac-1.5.0.tar.gz", &archive(8, 1000));
        let report = builder.process(&builder.dirs().new_dir.clone()).unwrap();

        assert!(report.artifacts[0].patch_name.is_none());
        let manifest = stored_manifest(&store);
        assert_eq!(
            manifest.latest_version("app", "mac"),
            Some(Version::parse("2.0.0").unwrap())
        );
        assert_eq!(manifest.versions("app").len(), 2);
    }

    #[test]
    fn test_patch_support_disabled() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let builder = ManifestBuilder::new(store.clone(), RepoDirs::new(dir.path()), false).unwrap();

        drop_in(&builder, "app-nix-0.1.0.tar.gz", &archive(2, 500));
        builder.process(&builder.dirs().new_dir.clone()).unwrap();
        drop_in(&builder, "app-nix-0.2.0.tar.gz", &archive(2, 600));
        let report = builder.process(&builder.dirs().new_dir.clone()).unwrap();

        assert!(report.artifacts[0].patch_name.is_none());
        assert!(load_typed::<RepoConfig>(store.as_ref(), KEY_REPO_CONFIG)
            .unwrap()
            .patches
            .is_empty());
    }

    #[test]
    fn test_processing_clears_stale_signatures() {
        let (_dir, store, builder) = setup();
        store
            .save(KEY_VERSION_META, serde_json::json!({"updates": {}, "latest": {}, "sigs": ["old"]}))
            .unwrap();
        drop_in(&builder, "app-arm-0.1.0.tar.gz", &archive(4, 100));
        builder.process(&builder.dirs().new_dir.clone()).unwrap();

        assert!(stored_manifest(&store).sigs.is_empty());
    }
}
