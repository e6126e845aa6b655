//! Property-based tests for relup-core.
//!
//! # Properties Tested
//!
//! - Version canonical form round-trips and ordering matches the tuple
//! - Patches reproduce their target for arbitrary inputs
//! - Re-signing a manifest does not change its signatures
//! - Revocation keeps the active key count

#![cfg(test)]

use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey};
use proptest::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use crate::keys::{encode_signature, KeyManager};
use crate::manifest::{signing_payload, ManifestVerifier, SIGS_KEY};
use crate::patch::{apply, diff};
use crate::store::MemoryStore;
use crate::version::Version;

// =============================================================================
// Generators
// =============================================================================

/// Generate a random Ed25519 signing key from 32 random bytes.
fn arb_signing_key() -> impl Strategy<Value = SigningKey> {
    prop::array::uniform32(any::<u8>()).prop_map(|bytes| SigningKey::from_bytes(&bytes))
}

/// Generate a version string in one of the three accepted forms.
fn arb_version_text() -> impl Strategy<Value = String> {
    let short = (0u64..1000, 0u64..1000, prop::option::of(("[ab]", 0u64..50)))
        .prop_map(|(major, minor, pre)| match pre {
            Some((letter, n)) => format!("{major}.{minor}{letter}{n}"),
            None => format!("{major}.{minor}"),
        });
    let patch = (0u64..1000, 0u64..1000, 0u64..1000, prop::option::of(("[ab]", 0u64..50)))
        .prop_map(|(major, minor, patch, pre)| match pre {
            Some((letter, n)) => format!("{major}.{minor}.{patch}{letter}{n}"),
            None => format!("{major}.{minor}.{patch}"),
        });
    let full = (0u64..1000, 0u64..1000, 0u64..1000, 0u8..3, 0u64..50)
        .prop_map(|(a, b, c, s, i)| format!("{a}.{b}.{c}.{s}.{i}"));
    prop_oneof![short, patch, full]
}

/// Generate a manifest document with a few releases.
fn arb_manifest() -> impl Strategy<Value = serde_json::Value> {
    prop::collection::btree_map("[a-z]{1,8}", ("[a-f0-9]{64}", "[a-z]{1,6}\\.tar\\.gz"), 0..4)
        .prop_map(|apps| {
            let mut updates = serde_json::Map::new();
            let mut latest = serde_json::Map::new();
            for (name, (hash, filename)) in apps {
                updates.insert(
                    name.clone(),
                    json!({"1.0.0.2.0": {"mac": {"file_hash": hash, "filename": filename}}}),
                );
                latest.insert(name, json!({"mac": "1.0.0.2.0"}));
            }
            json!({"latest": latest, "updates": updates})
        })
}

// =============================================================================
// Version
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Parsing the canonical form gives back the same version.
    #[test]
    fn prop_version_canonical_round_trip(text in arb_version_text()) {
        let version = Version::parse(&text).unwrap();
        let again = Version::parse(&version.to_string()).unwrap();
        prop_assert_eq!(version, again);
    }

    /// Exactly one of <, ==, > holds and it agrees with the tuple.
    #[test]
    fn prop_version_order_matches_tuple(a in arb_version_text(), b in arb_version_text()) {
        let a = Version::parse(&a).unwrap();
        let b = Version::parse(&b).unwrap();

        let relations = [a < b, a == b, a > b];
        prop_assert_eq!(relations.iter().filter(|r| **r).count(), 1);
        prop_assert_eq!(a.cmp(&b), a.as_tuple().cmp(&b.as_tuple()));
    }
}

// =============================================================================
// Patch round-trip
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(40))]

    /// apply(diff(A, B), A) == B for unrelated inputs.
    #[test]
    fn prop_patch_round_trip(
        old in prop::collection::vec(any::<u8>(), 0..2048),
        new in prop::collection::vec(any::<u8>(), 0..2048),
    ) {
        let patch = diff(&old, &new).unwrap();
        prop_assert_eq!(apply(&old, &patch).unwrap(), new);
    }

    /// apply(diff(A, B), A) == B when B is an edited copy of A.
    #[test]
    fn prop_patch_round_trip_edits(
        old in prop::collection::vec(any::<u8>(), 1..4096),
        edits in prop::collection::vec((any::<prop::sample::Index>(), any::<u8>()), 0..32),
        tail in prop::collection::vec(any::<u8>(), 0..128),
    ) {
        let mut new = old.clone();
        for (index, byte) in edits {
            let i = index.index(new.len());
            new[i] = byte;
        }
        new.extend_from_slice(&tail);

        let patch = diff(&old, &new).unwrap();
        prop_assert_eq!(apply(&old, &patch).unwrap(), new);
    }
}

// =============================================================================
// Signing
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    /// Signing twice verifies exactly as signing once, with identical sigs.
    #[test]
    fn prop_signing_idempotent(manifest in arb_manifest()) {
        let dir = TempDir::new().unwrap();
        let manager = KeyManager::new(Arc::new(MemoryStore::new()), dir.path());
        manager.create_keys(3).unwrap();
        let keys = manager.public_keys();

        let once = manager.sign_document(manifest).unwrap();
        let twice = manager.sign_document(once.clone()).unwrap();

        prop_assert!(KeyManager::verify(&once, &keys));
        prop_assert_eq!(KeyManager::verify(&twice, &keys), KeyManager::verify(&once, &keys));
        prop_assert_eq!(&once[SIGS_KEY], &twice[SIGS_KEY]);
    }

    /// A foreign key's signature never verifies.
    #[test]
    fn prop_foreign_signature_rejected(
        trusted in arb_signing_key(),
        foreign in arb_signing_key(),
        manifest in arb_manifest(),
    ) {
        prop_assume!(trusted.to_bytes() != foreign.to_bytes());

        let mut doc = manifest;
        let payload = signing_payload(&doc).unwrap();
        doc[SIGS_KEY] = json!([encode_signature(&foreign.sign(&payload))]);

        let trusted_b64 = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD.encode(trusted.verifying_key().as_bytes())
        };
        prop_assert!(!ManifestVerifier::new(vec![trusted_b64]).verify(&doc));
    }

    /// Revoking k of n active keys leaves n active keys.
    #[test]
    fn prop_revoke_keeps_active_count(n in 2usize..6, k in 1usize..6) {
        prop_assume!(k <= n);
        let dir = TempDir::new().unwrap();
        let manager = KeyManager::new(Arc::new(MemoryStore::new()), dir.path());
        manager.create_keys(n).unwrap();
        let before = manager.public_keys();

        let revoked = manager.revoke(k).unwrap();

        let after = manager.public_keys();
        prop_assert_eq!(revoked.len(), k);
        prop_assert_eq!(after.len(), n);
        for key in &before[..k] {
            prop_assert!(!after.contains(key));
        }
    }
}
