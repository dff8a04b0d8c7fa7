//! Symmetric keys: generation, HKDF derivation, sealing a child key under a parent

use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use zeroize::Zeroize;
use zkv_core::{VaultError, VaultResult};

use crate::aead;
use crate::KEY_SIZE;

/// A 256-bit symmetric key (vault root, folder, file or content key). Zeroized on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey {
    bytes: [u8; KEY_SIZE],
}

impl SymmetricKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Copy a key out of a decrypted buffer. The caller still owns (and must
    /// clear) the source buffer.
    pub fn from_slice(slice: &[u8]) -> VaultResult<Self> {
        if slice.len() != KEY_SIZE {
            return Err(VaultError::UnwrapFailed(format!(
                "key material has wrong size: {} bytes (expected {KEY_SIZE})",
                slice.len()
            )));
        }
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Overwrite the key in place. Used by the hierarchy's `clear()`.
    pub fn wipe(&mut self) {
        self.bytes.zeroize();
    }
}

impl Drop for SymmetricKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

// Only ever serialized inside a sealed record body (content keys in a file pointer).
impl Serialize for SymmetricKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&crate::encoding::encode(&self.bytes))
    }
}

impl<'de> Deserialize<'de> for SymmetricKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = zeroize::Zeroizing::new(String::deserialize(deserializer)?);
        let decoded = zeroize::Zeroizing::new(
            crate::encoding::decode(&encoded).map_err(serde::de::Error::custom)?,
        );
        SymmetricKey::from_slice(&decoded).map_err(serde::de::Error::custom)
    }
}

/// Generate a random 256-bit key.
pub fn generate_symmetric_key() -> SymmetricKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    SymmetricKey::from_bytes(bytes)
}

/// HKDF-SHA256 derivation with an optional salt and a domain-specific info string.
pub fn hkdf_derive(ikm: &[u8], salt: Option<&[u8]>, info: &[u8]) -> VaultResult<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| VaultError::Other(anyhow::anyhow!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// Derive a subkey of `parent` for a fixed domain (e.g. the device registry key).
pub fn derive_subkey(parent: &SymmetricKey, domain: &str) -> VaultResult<SymmetricKey> {
    hkdf_derive(parent.as_bytes(), None, domain.as_bytes()).map(SymmetricKey::from_bytes)
}

/// Seal a child key under its parent (folder key → file key, etc.).
///
/// `context` names the slot the child occupies so a sealed key cannot be
/// moved to a different entity.
/// Output: `[24-byte nonce][32-byte ciphertext][16-byte tag]`
pub fn seal_key(parent: &SymmetricKey, child: &SymmetricKey, context: &[u8]) -> VaultResult<Vec<u8>> {
    aead::seal(parent, child.as_bytes(), context)
}

/// Open a key sealed by [`seal_key`]. Any failure is `UnwrapFailed`.
pub fn open_key(parent: &SymmetricKey, sealed: &[u8], context: &[u8]) -> VaultResult<SymmetricKey> {
    let plaintext = aead::open(parent, sealed, context).map_err(|e| match e {
        VaultError::DecryptionFailed(reason) => VaultError::UnwrapFailed(reason),
        other => other,
    })?;
    SymmetricKey::from_slice(&plaintext)
}
