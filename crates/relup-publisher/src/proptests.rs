//! Property-based tests for relup-publisher.
//!
//! # Properties Tested
//!
//! - Well-formed archive names are inspected into their parts
//! - Processing releases in any order keeps `latest` at the highest
//!   version and every recorded patch matches its file

#![cfg(test)]

use std::sync::Arc;

use proptest::prelude::*;
use tempfile::TempDir;

use relup_core::hash::file_sha256_hex;
use relup_core::platform::PLATFORMS;
use relup_core::store::{load_typed, KEY_VERSION_META};
use relup_core::{Manifest, MemoryStore, Version};

use crate::builder::{ManifestBuilder, RepoDirs};
use crate::package::PackageArtifact;

// =============================================================================
// Generators
// =============================================================================

/// Generate an application name that cannot be mistaken for a platform.
fn arb_app_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,7}".prop_filter("name must not be a platform tag", |name| {
        !PLATFORMS.contains(&name.as_str())
    })
}

fn arb_platform() -> impl Strategy<Value = &'static str> {
    prop::sample::select(PLATFORMS)
}

fn arb_extension() -> impl Strategy<Value = &'static str> {
    prop::sample::select(&["zip", "tar.gz"][..])
}

/// Distinct `major.minor.patch` versions in random order.
fn arb_release_order() -> impl Strategy<Value = Vec<(u64, u64, u64)>> {
    prop::collection::btree_set((0u64..3, 0u64..3, 0u64..3), 1..5)
        .prop_map(|set| set.into_iter().collect::<Vec<_>>())
        .prop_shuffle()
}

// =============================================================================
// Package inspection
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_archive_name_parts(
        name in arb_app_name(),
        platform in arb_platform(),
        (major, minor, patch) in (0u64..100, 0u64..100, 0u64..100),
        extension in arb_extension(),
    ) {
        let dir = TempDir::new().unwrap();
        let filename = format!("{name}-{platform}-{major}.{minor}.{patch}.{extension}");
        let path = dir.path().join(&filename);
        std::fs::write(&path, filename.as_bytes()).unwrap();

        let artifact = PackageArtifact::inspect(&path).unwrap();
        prop_assert_eq!(artifact.name, name);
        prop_assert_eq!(artifact.platform, platform);
        prop_assert_eq!(artifact.version, Version::parse(&format!("{major}.{minor}.{patch}")).unwrap());
        prop_assert_eq!(artifact.filename, filename);
    }
}

// =============================================================================
// Manifest building
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_latest_is_highest_processed(order in arb_release_order()) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let builder = ManifestBuilder::new(store.clone(), RepoDirs::new(dir.path()), true).unwrap();

        for (major, minor, patch) in &order {
            let filename = format!("app-nix64-{major}.{minor}.{patch}.zip");
            let content = format!("release {major} {minor} {patch}").repeat(40);
            std::fs::write(builder.dirs().new_dir.join(filename), content).unwrap();
            builder.process(&builder.dirs().new_dir.clone()).unwrap();
        }

        let manifest: Manifest = load_typed(store.as_ref(), KEY_VERSION_META).unwrap();
        let highest = order.iter().max().unwrap();
        let highest = Version::parse(&format!("{}.{}.{}", highest.0, highest.1, highest.2)).unwrap();
        prop_assert_eq!(manifest.latest_version("app", "nix64"), Some(highest));
        prop_assert_eq!(manifest.versions("app").len(), order.len());

        for version in manifest.versions("app") {
            let entry = manifest.release("app", &version, "nix64").unwrap();
            if let Some((patch_name, patch_hash)) = entry.patch() {
                let path = builder.dirs().deploy_dir.join(patch_name);
                prop_assert_eq!(file_sha256_hex(&path).unwrap(), patch_hash);
            }
        }
    }
}
