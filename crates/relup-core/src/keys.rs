//! Signing key lifecycle and manifest signing.
//!
//! Keys live in the [`ManifestStore`] under
//! [`KEY_SIGNING_KEYS`](crate::store::KEY_SIGNING_KEYS) as a numbered
//! mapping `1..N`. Records are never deleted or renumbered; revocation
//! flips a record to [`KeyStatus::Revoked`] so that old signatures stay
//! attributable.
//!
//! Every active key co-signs the manifest. Clients accept the manifest if
//! any one of their trusted keys matches any one signature (see
//! [`ManifestVerifier`]).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::GeneralPurpose;
use base64::engine::{DecodePaddingMode, GeneralPurposeConfig};
use base64::{alphabet, Engine};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KeyError;
use crate::manifest::{compress_document, signing_payload, Manifest, ManifestVerifier, SIGS_KEY, VERSION_FILE};
use crate::store::{load_typed, save_typed, ManifestStore, KEY_SIGNING_KEYS, KEY_VERSION_META};

/// Key type tag recorded with every key.
pub const KEY_TYPE_ED25519: &str = "ed25519";

/// Keys created at init, and whenever signing finds too few active keys.
pub const DEFAULT_KEY_BATCH: usize = 3;

/// Signing requires at least this many active keys.
pub const MIN_ACTIVE_KEYS: usize = 2;

/// Standard alphabet, written without padding, read with or without it.
const B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Whether a key may still sign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Revoked { revoked_at: DateTime<Utc> },
}

/// One stored signing keypair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub created_at: DateTime<Utc>,
    /// Base64 public key (32 bytes)
    pub public: String,
    /// Base64 private key (64-byte keypair form)
    pub private: String,
    pub key_type: String,
    pub status: KeyStatus,
}

impl KeyRecord {
    fn generate() -> Self {
        let (public, private) = generate_keypair();
        Self {
            created_at: Utc::now(),
            public,
            private,
            key_type: KEY_TYPE_ED25519.to_string(),
            status: KeyStatus::Active,
        }
    }

    pub fn is_revoked(&self) -> bool {
        matches!(self.status, KeyStatus::Revoked { .. })
    }
}

/// Numbered key mapping as persisted.
pub type KeyRecords = BTreeMap<u32, KeyRecord>;

/// Creates, revokes, and signs with the repository's keys.
///
/// State is re-read from the store on every operation; nothing is cached
/// between calls.
pub struct KeyManager {
    store: Arc<dyn ManifestStore>,
    deploy_dir: PathBuf,
}

impl KeyManager {
    /// `deploy_dir` receives the compressed manifest written by [`sign`](Self::sign).
    pub fn new(store: Arc<dyn ManifestStore>, deploy_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            deploy_dir: deploy_dir.into(),
        }
    }

    pub fn deploy_dir(&self) -> &Path {
        &self.deploy_dir
    }

    /// All records, revoked ones included.
    pub fn records(&self) -> KeyRecords {
        load_typed(self.store.as_ref(), KEY_SIGNING_KEYS).unwrap_or_default()
    }

    /// Generate `count` new keys and append them. Returns the new ids.
    pub fn create_keys(&self, count: usize) -> Result<Vec<u32>, KeyError> {
        if count == 0 {
            return Err(KeyError::InvalidCount(count));
        }
        let mut records = self.records();
        let ids = append_keys(&mut records, count);
        save_typed(self.store.as_ref(), KEY_SIGNING_KEYS, &records)?;
        tracing::info!(count, ids = ?ids, "created signing keys");
        Ok(ids)
    }

    /// Revoke the `count` oldest active keys, then create `count`
    /// replacements. Returns the revoked ids.
    pub fn revoke(&self, count: usize) -> Result<Vec<u32>, KeyError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut records = self.records();
        let now = Utc::now();

        let revoked: Vec<u32> = records
            .iter_mut()
            .filter(|(_, record)| !record.is_revoked())
            .take(count)
            .map(|(id, record)| {
                record.status = KeyStatus::Revoked { revoked_at: now };
                *id
            })
            .collect();

        if revoked.len() < count {
            tracing::warn!(
                requested = count,
                revoked = revoked.len(),
                "fewer active keys than requested revocations"
            );
        }
        for id in &revoked {
            tracing::info!(id, "revoked signing key");
        }

        append_keys(&mut records, count);
        save_typed(self.store.as_ref(), KEY_SIGNING_KEYS, &records)?;
        Ok(revoked)
    }

    /// Public keys of active records, oldest first.
    pub fn public_keys(&self) -> Vec<String> {
        self.records()
            .into_values()
            .filter(|record| !record.is_revoked())
            .map(|record| record.public)
            .collect()
    }

    /// The revoked record with the highest id.
    pub fn latest_revoked(&self) -> Option<(u32, KeyRecord)> {
        self.records()
            .into_iter()
            .rev()
            .find(|(_, record)| record.is_revoked())
    }

    /// Sign the stored manifest, persist it, and write the compressed
    /// copy to the deploy directory.
    ///
    /// A missing manifest is not an error: an empty one is created and
    /// saved first.
    pub fn sign(&self) -> Result<Value, KeyError> {
        let document = match self.store.load(KEY_VERSION_META) {
            Some(document) => document,
            None => {
                tracing::info!("no version manifest stored, creating an empty one");
                let empty = Manifest::new().to_value()?;
                self.store.save(KEY_VERSION_META, empty.clone())?;
                empty
            }
        };
        self.sign_manifest(document)
    }

    /// Sign `document`, persist it as the current manifest, and publish it.
    pub fn sign_manifest(&self, document: Value) -> Result<Value, KeyError> {
        let signed = self.sign_document(document)?;
        self.store.save(KEY_VERSION_META, signed.clone())?;

        std::fs::create_dir_all(&self.deploy_dir)?;
        let path = self.deploy_dir.join(VERSION_FILE);
        std::fs::write(&path, compress_document(&signed)?)?;
        tracing::info!(path = %path.display(), "wrote signed manifest");

        Ok(signed)
    }

    /// Replace `sigs` on `document` with one signature per active key.
    ///
    /// Nothing is persisted except keys created to reach
    /// [`MIN_ACTIVE_KEYS`].
    pub fn sign_document(&self, document: Value) -> Result<Value, KeyError> {
        let Value::Object(mut object) = document else {
            return Err(crate::error::ManifestError::NotAnObject.into());
        };
        object.remove(SIGS_KEY);
        let mut unsigned = Value::Object(object);
        let payload = signing_payload(&unsigned)?;

        let signing_keys = self.active_signing_keys()?;
        let sigs: Vec<Value> = signing_keys
            .iter()
            .map(|key| Value::String(encode_signature(&key.sign(&payload))))
            .collect();
        tracing::debug!(signatures = sigs.len(), "signed manifest");

        if let Value::Object(object) = &mut unsigned {
            object.insert(SIGS_KEY.to_string(), Value::Array(sigs));
        }
        Ok(unsigned)
    }

    /// Check `document` against `trusted_keys`. See [`ManifestVerifier`].
    pub fn verify(document: &Value, trusted_keys: &[String]) -> bool {
        ManifestVerifier::new(trusted_keys.to_vec()).verify(document)
    }

    fn active_signing_keys(&self) -> Result<Vec<SigningKey>, KeyError> {
        let mut records = self.records();
        let active = records.values().filter(|r| !r.is_revoked()).count();
        if active < MIN_ACTIVE_KEYS {
            tracing::info!(active, "too few active signing keys, creating more");
            append_keys(&mut records, DEFAULT_KEY_BATCH);
            save_typed(self.store.as_ref(), KEY_SIGNING_KEYS, &records)?;
        }

        let keys: Vec<SigningKey> = records
            .iter()
            .filter(|(_, record)| !record.is_revoked())
            .filter_map(|(id, record)| match parse_signing_key(&record.private) {
                Ok(key) => Some(key),
                Err(e) => {
                    tracing::error!(id, error = %e, "skipping unusable private key");
                    None
                }
            })
            .collect();

        if keys.is_empty() {
            return Err(KeyError::InvalidKey("no usable private keys".to_string()));
        }
        Ok(keys)
    }
}

fn append_keys(records: &mut KeyRecords, count: usize) -> Vec<u32> {
    let mut next = records.keys().next_back().map_or(1, |last| last + 1);
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        records.insert(next, KeyRecord::generate());
        ids.push(next);
        next += 1;
    }
    ids
}

/// Fresh ed25519 keypair as `(public, private)` base64 strings.
pub fn generate_keypair() -> (String, String) {
    let signing_key = SigningKey::generate(&mut OsRng);
    let public = B64.encode(signing_key.verifying_key().as_bytes());
    let private = B64.encode(signing_key.to_keypair_bytes());
    (public, private)
}

/// Decode a base64 private key (64-byte keypair or 32-byte seed).
pub fn parse_signing_key(encoded: &str) -> Result<SigningKey, KeyError> {
    let bytes = decode(encoded)?;
    match bytes.len() {
        64 => {
            let mut keypair = [0u8; 64];
            keypair.copy_from_slice(&bytes);
            SigningKey::from_keypair_bytes(&keypair).map_err(|e| KeyError::InvalidKey(e.to_string()))
        }
        32 => {
            let mut seed = [0u8; 32];
            seed.copy_from_slice(&bytes);
            Ok(SigningKey::from_bytes(&seed))
        }
        n => Err(KeyError::InvalidKey(format!("private key is {n} bytes"))),
    }
}

/// Decode a base64 public key.
pub fn parse_verifying_key(encoded: &str) -> Result<VerifyingKey, KeyError> {
    let bytes: [u8; 32] = decode(encoded)?
        .try_into()
        .map_err(|b: Vec<u8>| KeyError::InvalidKey(format!("public key is {} bytes", b.len())))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| KeyError::InvalidKey(e.to_string()))
}

/// Decode a base64 signature.
pub fn parse_signature(encoded: &str) -> Result<Signature, KeyError> {
    let bytes = decode(encoded)?;
    Signature::from_slice(&bytes).map_err(|e| KeyError::InvalidKey(e.to_string()))
}

pub fn encode_signature(signature: &Signature) -> String {
    B64.encode(signature.to_bytes())
}

fn decode(encoded: &str) -> Result<Vec<u8>, KeyError> {
    B64.decode(encoded.trim())
        .map_err(|e| KeyError::Encoding(e.to_string()))
}
