//! Trust gate.
//!
//! ```text
//!   loader image                     boot volume (EFI\CHRYSALIS)
//!  +---------------------------+    +------------------------------+
//!  | =BEGIN CHRYSALIS VAULT=   |    | vault.json  {Version, Files} |
//!  | <32-byte ed25519 key>     |--->| vault.sig   64-byte sig      |
//!  | =END CHRYSALIS VAULT=     |    | <every listed file>          |
//!  +---------------------------+    +------------------------------+
//! ```
//!
//! The key is borrowed from the bootstrap for one verification. The manifest
//! signature covers the exact bytes of `vault.json`; each listed file is then
//! checked against its blake3 digest before Early Init returns, and again on
//! every later read through [`Storage`].

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;

use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{StorageError, VaultError};
use crate::paths::{VAULT_PATH, VAULT_SIGNATURE_PATH};
use crate::storage::Storage;

/// Marker preceding the embedded vault key.
pub const VAULT_BEGIN_MARKER: &[u8] = b"=BEGIN CHRYSALIS VAULT=";

/// Marker following the embedded vault key.
pub const VAULT_END_MARKER: &[u8] = b"=END CHRYSALIS VAULT=";

/// Manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

/// Public key the asset store is signed with. Never cloned.
pub struct VaultKey(VerifyingKey);

impl VaultKey {
    /// Parse a compressed ed25519 public key.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self, VaultError> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|_| VaultError::Malformed(String::from("vault key is not a valid ed25519 point")))
    }

    /// Compressed key bytes.
    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.0.to_bytes()
    }

    /// Verify a detached signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), VaultError> {
        let signature: &[u8; SIGNATURE_LENGTH] = signature
            .try_into()
            .map_err(|_| VaultError::SignatureLength(signature.len()))?;
        let signature = Signature::from_bytes(signature);
        self.0
            .verify_strict(message, &signature)
            .map_err(|_| VaultError::BadSignature)
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VaultKey({})", hex::encode(self.to_bytes()))
    }
}

/// Source of the vault key.
pub trait Bootstrap {
    /// Key to verify the asset store with, if vaulting is enabled.
    fn vault_key(&self) -> Option<&VaultKey>;
}

/// Ask the bootstrap for the vault key.
///
/// No key means open trust mode. Whether that is acceptable is decided by
/// Early Init against the configured security policy.
pub fn obtain_vault_key(bootstrap: &dyn Bootstrap) -> Option<&VaultKey> {
    let key = bootstrap.vault_key();
    match key {
        Some(key) => info!(key = ?key, "vault key present"),
        None => info!("no vault key, running in open trust mode"),
    }
    key
}

/// Bootstrap backed by the key region embedded in the loader image.
#[derive(Debug, Default)]
pub struct EmbeddedBootstrap {
    key: Option<VaultKey>,
}

impl EmbeddedBootstrap {
    /// Bootstrap that never supplies a key.
    pub fn disabled() -> Self {
        Self { key: None }
    }

    /// Bootstrap supplying `key`.
    pub fn with_key(key: VaultKey) -> Self {
        Self { key: Some(key) }
    }

    /// Extract the key from a loader image.
    ///
    /// A missing region or an all-zero key disables vaulting. A damaged region
    /// is logged and also yields no key.
    pub fn from_image(image: &[u8]) -> Self {
        let region = match embedded_region(image) {
            Some(region) => region,
            None => {
                debug!("image carries no vault region");
                return Self::disabled();
            }
        };

        let bytes: &[u8; PUBLIC_KEY_LENGTH] = match image[region.clone()].try_into() {
            Ok(bytes) => bytes,
            Err(_) => {
                warn!(len = region.len(), "embedded vault key has the wrong length");
                return Self::disabled();
            }
        };
        if bytes.iter().all(|b| *b == 0) {
            debug!("embedded vault key is empty, vaulting disabled");
            return Self::disabled();
        }

        match VaultKey::from_bytes(bytes) {
            Ok(key) => Self::with_key(key),
            Err(e) => {
                warn!(error = %e, "embedded vault key is damaged");
                Self::disabled()
            }
        }
    }
}

impl Bootstrap for EmbeddedBootstrap {
    fn vault_key(&self) -> Option<&VaultKey> {
        self.key.as_ref()
    }
}

/// Byte range between the vault markers.
pub fn embedded_region(image: &[u8]) -> Option<Range<usize>> {
    let start = find(image, VAULT_BEGIN_MARKER)? + VAULT_BEGIN_MARKER.len();
    let end = start + find(&image[start..], VAULT_END_MARKER)?;
    Some(start..end)
}

/// Write `key` into the image's vault region in place.
pub fn embed_key(image: &mut [u8], key: &[u8; PUBLIC_KEY_LENGTH]) -> Result<(), VaultError> {
    let region = embedded_region(image)
        .ok_or_else(|| VaultError::Malformed(String::from("image has no vault region")))?;
    if region.len() != PUBLIC_KEY_LENGTH {
        return Err(VaultError::Malformed(format!(
            "vault region is {} bytes, expected {PUBLIC_KEY_LENGTH}",
            region.len()
        )));
    }
    image[region].copy_from_slice(key);
    Ok(())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
struct ManifestDocument {
    version: u32,
    files: BTreeMap<String, String>,
}

/// Digest list of every trusted asset.
///
/// Lookups ignore case, matching the FAT volumes assets live on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VaultManifest {
    files: BTreeMap<String, (String, blake3::Hash)>,
}

impl VaultManifest {
    /// Empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `data` as the trusted content of `path`.
    pub fn insert(&mut self, path: &str, data: &[u8]) {
        self.insert_digest(path, blake3::hash(data));
    }

    fn insert_digest(&mut self, path: &str, digest: blake3::Hash) -> bool {
        let path = Storage::normalize(path).unwrap_or_else(|_| String::from(path));
        self.files
            .insert(path.to_ascii_lowercase(), (path, digest))
            .is_none()
    }

    /// Trusted digest of `path`, which must already be normalized.
    pub fn digest(&self, path: &str) -> Option<blake3::Hash> {
        self.files
            .get(&path.to_ascii_lowercase())
            .map(|(_, digest)| *digest)
    }

    /// Listed paths in manifest order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.values().map(|(path, _)| path.as_str())
    }

    /// Number of listed files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Whether nothing is listed.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Parse `vault.json`.
    pub fn parse(bytes: &[u8]) -> Result<Self, VaultError> {
        let document: ManifestDocument =
            serde_json::from_slice(bytes).map_err(|e| VaultError::Malformed(e.to_string()))?;
        if document.version != MANIFEST_VERSION {
            return Err(VaultError::Malformed(format!(
                "unsupported manifest version {}",
                document.version
            )));
        }

        let mut manifest = Self::new();
        for (path, digest) in document.files {
            let normalized = Storage::normalize(&path)
                .map_err(|e| VaultError::Malformed(e.to_string()))?;
            let digest = blake3::Hash::from_hex(digest.as_bytes())
                .map_err(|_| VaultError::Malformed(format!("digest of `{path}` is not 32 hex bytes")))?;
            if !manifest.insert_digest(&normalized, digest) {
                return Err(VaultError::Malformed(format!("`{path}` is listed twice")));
            }
        }
        Ok(manifest)
    }

    /// Serialize to the `vault.json` layout.
    pub fn to_json(&self) -> Vec<u8> {
        let document = ManifestDocument {
            version: MANIFEST_VERSION,
            files: self
                .files
                .values()
                .map(|(path, digest)| (path.clone(), digest.to_hex().to_string()))
                .collect(),
        };
        // Serializing a map of strings cannot fail.
        serde_json::to_vec_pretty(&document).unwrap_or_default()
    }

    /// Read and hash every listed file, failing on the first mismatch.
    fn verify_all(&self, storage: &Storage<'_>) -> Result<(), VaultError> {
        for (path, expected) in self.files.values() {
            let data = storage.read_raw(path)?;
            if blake3::hash(&data) != *expected {
                warn!(path = %path, "vault digest mismatch");
                return Err(StorageError::IntegrityMismatch(path.clone()).into());
            }
        }
        Ok(())
    }
}

/// Load the vault from `storage`.
///
/// With a key the manifest must exist and carry a valid signature. Without
/// one an unsigned manifest is still honored when present. Every listed file
/// is verified before returning.
pub(crate) fn open(
    storage: &Storage<'_>,
    key: Option<&VaultKey>,
) -> Result<Option<VaultManifest>, VaultError> {
    let manifest_bytes = match storage.read_raw(VAULT_PATH) {
        Ok(bytes) => bytes,
        Err(StorageError::NotFound(_)) if key.is_none() => return Ok(None),
        Err(e) => return Err(VaultError::ManifestUnavailable(e)),
    };

    if let Some(key) = key {
        let signature = storage
            .read_raw(VAULT_SIGNATURE_PATH)
            .map_err(VaultError::SignatureUnavailable)?;
        key.verify(&manifest_bytes, &signature)?;
        debug!("vault signature verified");
    }

    let manifest = VaultManifest::parse(&manifest_bytes)?;
    manifest.verify_all(storage)?;
    info!(files = manifest.len(), signed = key.is_some(), "vault verified");
    Ok(Some(manifest))
}
