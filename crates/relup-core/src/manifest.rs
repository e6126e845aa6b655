//! The version manifest: model, signing payload, and verification.
//!
//! The manifest is a nested JSON document:
//!
//! ```text
//! {
//!   "latest":  { app: { platform: version } },
//!   "updates": { app: { version: { platform: { filename, file_hash, patch_name?, patch_hash? } } } },
//!   "sigs":    [ base64 signature, ... ]
//! }
//! ```
//!
//! Signatures cover the document *without* `sigs`, serialized by
//! [`signing_payload`]. Verification works on the raw JSON value so that
//! fields this crate does not model are still covered by the signature.
//!
//! # Security
//!
//! - Every trusted key is tried against every signature; a single valid
//!   pair verifies the manifest (redundant signers, not a quorum)
//! - Malformed keys and signatures are logged and skipped
//! - An unverified manifest is still returned to the caller, which
//!   decides whether to trust it

use std::collections::BTreeMap;
use std::io::{Read, Write};

use ed25519_dalek::Verifier;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ManifestError;
use crate::keys::{parse_signature, parse_verifying_key};
use crate::version::Version;

/// Filename of the published, gzip-compressed manifest.
pub const VERSION_FILE: &str = "versions.gz";

/// Name of the signature array inside the manifest document.
pub const SIGS_KEY: &str = "sigs";

/// One archive of one (app, version, platform).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEntry {
    /// SHA-256 of the archive (hex)
    pub file_hash: String,
    /// Archive filename as published
    pub filename: String,
    /// SHA-256 of the patch producing this archive from its predecessor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_hash: Option<String>,
    /// Filename of the patch producing this archive from its predecessor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_name: Option<String>,
}

impl ReleaseEntry {
    pub fn new(filename: impl Into<String>, file_hash: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            file_hash: file_hash.into(),
            patch_name: None,
            patch_hash: None,
        }
    }

    /// Both patch fields, when the entry carries a usable patch.
    pub fn patch(&self) -> Option<(&str, &str)> {
        match (&self.patch_name, &self.patch_hash) {
            (Some(name), Some(hash)) if !name.is_empty() && !hash.is_empty() => {
                Some((name.as_str(), hash.as_str()))
            }
            _ => None,
        }
    }
}

/// Platform → entry for one version.
pub type PlatformEntries = BTreeMap<String, ReleaseEntry>;

/// The typed view of a manifest document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// app → platform → canonical version string
    #[serde(default)]
    pub latest: BTreeMap<String, BTreeMap<String, String>>,
    /// app → canonical version string → platform → entry
    #[serde(default)]
    pub updates: BTreeMap<String, BTreeMap<String, PlatformEntries>>,
    /// Signatures over the document without this field
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sigs: Vec<String>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the typed view of a JSON document.
    pub fn from_value(value: Value) -> Result<Self, ManifestError> {
        if !value.is_object() {
            return Err(ManifestError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    /// The JSON document for this manifest.
    pub fn to_value(&self) -> Result<Value, ManifestError> {
        Ok(serde_json::to_value(self)?)
    }

    /// Highest published version for (app, platform).
    pub fn latest_version(&self, name: &str, platform: &str) -> Option<Version> {
        let text = self.latest.get(name)?.get(platform)?;
        match Version::parse(text) {
            Ok(version) => Some(version),
            Err(e) => {
                tracing::error!(name, platform, version = %text, error = %e, "unparseable latest version");
                None
            }
        }
    }

    /// Every parseable version recorded for `name`, ascending and unique.
    pub fn versions(&self, name: &str) -> Vec<Version> {
        let mut versions: Vec<Version> = self
            .updates
            .get(name)
            .map(|by_version| {
                by_version
                    .keys()
                    .filter_map(|key| Version::parse(key).ok())
                    .collect()
            })
            .unwrap_or_default();
        versions.sort();
        versions.dedup();
        versions
    }

    /// Entry for (app, version, platform).
    ///
    /// Version keys are matched by value, so `0.0.1` and `0.0.1.2.0` find
    /// the same entry.
    pub fn release(&self, name: &str, version: &Version, platform: &str) -> Option<&ReleaseEntry> {
        let by_version = self.updates.get(name)?;
        if let Some(entry) = by_version
            .get(&version.to_string())
            .and_then(|platforms| platforms.get(platform))
        {
            return Some(entry);
        }
        by_version
            .iter()
            .filter(|(key, _)| Version::parse(key).map(|v| v == *version).unwrap_or(false))
            .find_map(|(_, platforms)| platforms.get(platform))
    }

    /// Record an archive. Every version is kept; `latest` only moves to a
    /// strictly higher version. Returns whether `latest` changed.
    pub fn record_release(
        &mut self,
        name: &str,
        version: &Version,
        platform: &str,
        entry: ReleaseEntry,
    ) -> bool {
        let current = self.latest_version(name, platform);

        self.updates
            .entry(name.to_string())
            .or_default()
            .entry(version.to_string())
            .or_default()
            .insert(platform.to_string(), entry);

        let advance = current.map_or(true, |latest| *version > latest);
        if advance {
            self.latest
                .entry(name.to_string())
                .or_default()
                .insert(platform.to_string(), version.to_string());
        }
        advance
    }
}

/// Bytes that signatures are computed over: the document without
/// `sigs`, keys sorted at every depth, `", "`/`": "` separators, and
/// non-ASCII characters escaped as `\uXXXX`.
pub fn signing_payload(document: &Value) -> Result<Vec<u8>, ManifestError> {
    let object = document.as_object().ok_or(ManifestError::NotAnObject)?;
    let mut unsigned = object.clone();
    unsigned.remove(SIGS_KEY);

    let mut out = String::new();
    write_canonical(&Value::Object(unsigned), &mut out);
    Ok(out.into_bytes())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_canonical_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_canonical_string(key, out);
                out.push_str(": ");
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn write_canonical_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            ' '..='~' => out.push(c),
            _ => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    out.push_str(&format!("\\u{:04x}", unit));
                }
            }
        }
    }
    out.push('"');
}

/// Verifies manifest signatures against trusted public keys.
///
/// Verification succeeds as soon as any (key, signature) pair checks out.
pub struct ManifestVerifier {
    /// Trusted base64 public keys, deduplicated
    trusted_keys: Vec<String>,
}

impl ManifestVerifier {
    pub fn new(trusted_keys: Vec<String>) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(trusted_keys.len());
        for key in trusted_keys {
            if !unique.contains(&key) {
                unique.push(key);
            }
        }
        if unique.is_empty() {
            tracing::warn!("no trusted public keys configured, manifests will not verify");
        }
        Self {
            trusted_keys: unique,
        }
    }

    pub fn trusted_keys(&self) -> &[String] {
        &self.trusted_keys
    }

    /// Whether `document` carries at least one signature from a trusted key.
    pub fn verify(&self, document: &Value) -> bool {
        let signatures: Vec<&str> = match document.get(SIGS_KEY).and_then(Value::as_array) {
            Some(sigs) => sigs.iter().filter_map(Value::as_str).collect(),
            None => {
                tracing::warn!("manifest not verified, no signature found");
                return false;
            }
        };

        let payload = match signing_payload(document) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "cannot build signing payload");
                return false;
            }
        };

        for encoded_key in &self.trusted_keys {
            let key = match parse_verifying_key(encoded_key) {
                Ok(key) => key,
                Err(e) => {
                    tracing::error!(key = %encoded_key, error = %e, "skipping malformed public key");
                    continue;
                }
            };

            for encoded_sig in &signatures {
                let signature = match parse_signature(encoded_sig) {
                    Ok(sig) => sig,
                    Err(e) => {
                        tracing::debug!(error = %e, "skipping malformed signature");
                        continue;
                    }
                };
                if key.verify(&payload, &signature).is_ok() {
                    tracing::info!(key = %encoded_key, "manifest verified");
                    return true;
                }
            }
        }

        tracing::warn!(
            keys = self.trusted_keys.len(),
            signatures = signatures.len(),
            "manifest not verified by any trusted key"
        );
        false
    }
}

/// Gzip a manifest document for publishing (pretty-printed, sorted keys).
pub fn compress_document(document: &Value) -> Result<Vec<u8>, ManifestError> {
    let json = serde_json::to_vec_pretty(document)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

/// Inflate a gzip-compressed manifest.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, ManifestError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{encode_signature, generate_keypair, parse_signing_key};
    use ed25519_dalek::Signer;
    use serde_json::json;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn sign(document: &Value, private_key: &str) -> String {
        let key = parse_signing_key(private_key).unwrap();
        let payload = signing_payload(document).unwrap();
        encode_signature(&key.sign(&payload))
    }

    #[test]
    fn test_signing_payload_matches_sorted_dump_format() {
        let doc = json!({
            "updates": {"b": [1, 2], "a": true},
            "latest": {"x": null},
            "sigs": ["ignored"]
        });
        let payload = String::from_utf8(signing_payload(&doc).unwrap()).unwrap();
        assert_eq!(
            payload,
            r#"{"latest": {"x": null}, "updates": {"a": true, "b": [1, 2]}}"#
        );
    }

    #[test]
    fn test_signing_payload_escapes_non_ascii() {
        let doc = json!({"name": "caf\u{e9} \u{1F600}\n"});
        let payload = String::from_utf8(signing_payload(&doc).unwrap()).unwrap();
        assert_eq!(payload, r#"{"name": "caf\u00e9 \ud83d\ude00\n"}"#);
    }

    #[test]
    fn test_signing_payload_rejects_non_object() {
        assert!(matches!(
            signing_payload(&json!([1, 2])),
            Err(ManifestError::NotAnObject)
        ));
    }

    #[test]
    fn test_record_release_keeps_all_versions() {
        let mut manifest = Manifest::new();
        assert!(manifest.record_release("app", &v("0.1.0"), "mac", ReleaseEntry::new("a", "h1")));
        assert!(manifest.record_release("app", &v("0.2.0"), "mac", ReleaseEntry::new("b", "h2")));
        // Older version is recorded but does not move latest
        assert!(!manifest.record_release("app", &v("0.1.5"), "mac", ReleaseEntry::new("c", "h3")));

        assert_eq!(manifest.latest_version("app", "mac"), Some(v("0.2.0")));
        assert_eq!(manifest.versions("app"), vec![v("0.1.0"), v("0.1.5"), v("0.2.0")]);
    }

    #[test]
    fn test_platforms_advance_independently() {
        let mut manifest = Manifest::new();
        manifest.record_release("app", &v("1.0.0"), "mac", ReleaseEntry::new("m", "h"));
        manifest.record_release("app", &v("1.1.0"), "win", ReleaseEntry::new("w", "h"));

        assert_eq!(manifest.latest_version("app", "mac"), Some(v("1.0.0")));
        assert_eq!(manifest.latest_version("app", "win"), Some(v("1.1.0")));
        assert!(manifest.release("app", &v("1.1.0"), "mac").is_none());
    }

    #[test]
    fn test_release_lookup_matches_non_canonical_keys() {
        let manifest = Manifest::from_value(json!({
            "latest": {"jms": {"mac": "0.0.1"}},
            "updates": {"jms": {"0.0.1": {"mac": {"filename": "jms-mac-0.0.1.tar.gz", "file_hash": "H1"}}}}
        }))
        .unwrap();

        let entry = manifest.release("jms", &v("0.0.1.2.0"), "mac").unwrap();
        assert_eq!(entry.file_hash, "H1");
        assert!(entry.patch().is_none());
    }

    #[test]
    fn test_verify_accepts_any_trusted_signer() {
        let (pub1, priv1) = generate_keypair();
        let (pub2, _) = generate_keypair();
        let (_, priv_unknown) = generate_keypair();

        let mut doc = json!({"latest": {}, "updates": {}});
        let good = sign(&doc, &priv1);
        let foreign = sign(&doc, &priv_unknown);
        doc["sigs"] = json!(["not-base64!", foreign, good]);

        let verifier = ManifestVerifier::new(vec![pub2, pub1]);
        assert!(verifier.verify(&doc));
    }

    #[test]
    fn test_verify_rejects_unknown_signer() {
        let (pub1, _) = generate_keypair();
        let (pub2, _) = generate_keypair();
        let (_, priv_unknown) = generate_keypair();

        let mut doc = json!({"updates": {}});
        doc["sigs"] = json!([sign(&doc, &priv_unknown)]);

        let verifier = ManifestVerifier::new(vec![pub1, pub2]);
        assert!(!verifier.verify(&doc));
    }

    #[test]
    fn test_verify_detects_tampering() {
        let (public, private) = generate_keypair();
        let mut doc = json!({"latest": {"app": {"mac": "1.0.0.2.0"}}});
        doc["sigs"] = json!([sign(&doc, &private)]);
        doc["latest"]["app"]["mac"] = json!("9.9.9.2.0");

        assert!(!ManifestVerifier::new(vec![public]).verify(&doc));
    }

    #[test]
    fn test_verify_without_sigs_or_keys() {
        let (public, _) = generate_keypair();
        assert!(!ManifestVerifier::new(vec![public]).verify(&json!({"updates": {}})));
        assert!(!ManifestVerifier::new(vec![]).verify(&json!({"sigs": []})));
    }

    #[test]
    fn test_verify_skips_malformed_keys() {
        let (public, private) = generate_keypair();
        let mut doc = json!({"updates": {}});
        doc["sigs"] = json!([sign(&doc, &private)]);

        let verifier = ManifestVerifier::new(vec!["@@@".to_string(), "AAAA".to_string(), public]);
        assert!(verifier.verify(&doc));
    }

    #[test]
    fn test_compress_round_trip() {
        let doc = json!({"latest": {"app": {"mac": "1.0.0.2.0"}}, "sigs": ["abc"]});
        let compressed = compress_document(&doc).unwrap();
        let inflated = decompress(&compressed).unwrap();
        let back: Value = serde_json::from_slice(&inflated).unwrap();
        assert_eq!(back, doc);
    }

    #[test]
    fn test_decompress_rejects_garbage() {
        assert!(decompress(b"definitely not gzip").is_err());
    }
}
