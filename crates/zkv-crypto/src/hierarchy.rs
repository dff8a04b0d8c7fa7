//! Key Hierarchy Manager: an explicit per-session key context
//!
//! Nothing here is global. A [`KeyHierarchy`] is created at login from the
//! identity keypair and the vault header, passed to every operation that
//! needs keys, and cleared on logout (or dropped, which also clears).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use zkv_core::{EntityId, VaultError, VaultResult};

use crate::envelope::{self, KeyKind, WrappedKeyEnvelope};
use crate::identity::{IdentityKeypair, SigningKeypair, SigningPublicKey, WrapPublicKey, WrapSecretKey};
use crate::keys::{self, generate_symmetric_key, SymmetricKey};
use crate::recovery::RecoveryKit;

const SIGNING_INFO_PREFIX: &str = "zkv-signing-v1:";

/// Current vault header format.
pub const VAULT_HEADER_VERSION: u32 = 1;

/// The entity a naming-layer record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum RecordScope {
    Folder(EntityId),
    File(EntityId),
    DeviceRegistry,
}

impl RecordScope {
    /// Stable context string mixed into signing-key derivation.
    pub fn context(&self) -> String {
        match self {
            RecordScope::Folder(id) => format!("folder:{id}"),
            RecordScope::File(id) => format!("file:{id}"),
            RecordScope::DeviceRegistry => "device-registry".to_string(),
        }
    }
}

impl std::fmt::Display for RecordScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.context())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyScope {
    VaultRoot,
    Folder(EntityId),
    File(EntityId),
    FileVersion(EntityId),
    RecordSigning(RecordScope),
}

/// Either half of the hierarchy's output.
#[derive(Debug, Clone)]
pub enum KeyMaterial {
    Symmetric(SymmetricKey),
    Signing(SigningKeypair),
}

impl KeyMaterial {
    pub fn kind(&self) -> KeyKind {
        match self {
            KeyMaterial::Symmetric(_) => KeyKind::Symmetric,
            KeyMaterial::Signing(_) => KeyKind::SigningSeed,
        }
    }

    pub fn into_symmetric(self) -> VaultResult<SymmetricKey> {
        match self {
            KeyMaterial::Symmetric(key) => Ok(key),
            KeyMaterial::Signing(_) => Err(VaultError::Other(anyhow::anyhow!(
                "expected a symmetric key, got a signing keypair"
            ))),
        }
    }

    pub fn into_signing(self) -> VaultResult<SigningKeypair> {
        match self {
            KeyMaterial::Signing(keypair) => Ok(keypair),
            KeyMaterial::Symmetric(_) => Err(VaultError::Other(anyhow::anyhow!(
                "expected a signing keypair, got a symmetric key"
            ))),
        }
    }
}

/// Derive a record-signing keypair from an identity seed and a scope.
///
/// Deterministic: the private half never needs to be stored, it is
/// regenerated from the identity whenever a record must be signed.
pub fn derive_signing_keypair(identity: &IdentityKeypair, scope: &RecordScope) -> VaultResult<SigningKeypair> {
    let info = format!("{SIGNING_INFO_PREFIX}{}", scope.context());
    let seed = zeroize::Zeroizing::new(keys::hkdf_derive(
        identity.seed().as_slice(),
        None,
        info.as_bytes(),
    )?);
    Ok(SigningKeypair::from_seed(&seed))
}

/// Vault root key wrapped to the owning identity. Public, storable anywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultHeader {
    pub version: u32,
    pub vault_id: EntityId,
    pub owner: SigningPublicKey,
    pub root_folder: EntityId,
    pub root_key: WrappedKeyEnvelope,
    /// Root folder key sealed under the vault root key
    #[serde(with = "crate::encoding::base64_bytes")]
    pub root_folder_key: Vec<u8>,
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery: Option<RecoveryKit>,
}

impl VaultHeader {
    /// Create a header with a fresh root key. Returns the unwrapped root key
    /// for the creating session.
    pub fn create(identity: &IdentityKeypair, now: u64) -> VaultResult<(Self, SymmetricKey)> {
        let root_key = generate_symmetric_key();
        let wrapped = envelope::wrap_symmetric(&root_key, &identity.wrap_public())?;
        let root_folder = EntityId::new();
        let root_folder_key = keys::seal_key(
            &root_key,
            &generate_symmetric_key(),
            &folder_key_context(&root_folder),
        )?;
        let header = Self {
            version: VAULT_HEADER_VERSION,
            vault_id: EntityId::new(),
            owner: identity.public(),
            root_folder,
            root_key: wrapped,
            root_folder_key,
            created_at: now,
            recovery: None,
        };
        Ok((header, root_key))
    }

    pub fn open(&self, identity: &IdentityKeypair) -> VaultResult<SymmetricKey> {
        if self.version > VAULT_HEADER_VERSION {
            return Err(VaultError::SchemaMismatch {
                kind: "vault_header".into(),
                found: self.version,
                supported: VAULT_HEADER_VERSION,
            });
        }
        if identity.public() != self.owner {
            return Err(VaultError::UnwrapFailed(format!(
                "vault {} is owned by {}",
                self.vault_id,
                self.owner.fingerprint()
            )));
        }
        envelope::unwrap_symmetric(&self.root_key, &identity.wrap_secret())
    }

    pub fn open_root_folder_key(&self, root_key: &SymmetricKey) -> VaultResult<SymmetricKey> {
        keys::open_key(root_key, &self.root_folder_key, &folder_key_context(&self.root_folder))
    }
}

fn folder_key_context(id: &EntityId) -> Vec<u8> {
    format!("zkv-folder-key:{id}").into_bytes()
}

/// Session-scoped key context.
pub struct KeyHierarchy {
    identity: Option<IdentityKeypair>,
    root: Option<SymmetricKey>,
    cache: HashMap<EntityId, SymmetricKey>,
}

impl KeyHierarchy {
    /// Initialize a new vault: generate the root key and its header.
    pub fn create(identity: IdentityKeypair, now: u64) -> VaultResult<(Self, VaultHeader)> {
        let (header, root) = VaultHeader::create(&identity, now)?;
        Ok((
            Self {
                identity: Some(identity),
                root: Some(root),
                cache: HashMap::new(),
            },
            header,
        ))
    }

    /// Start a session on an existing vault.
    pub fn open(identity: IdentityKeypair, header: &VaultHeader) -> VaultResult<Self> {
        let root = header.open(&identity)?;
        tracing::debug!(vault = %header.vault_id, owner = %header.owner.fingerprint(), "key hierarchy opened");
        Ok(Self {
            identity: Some(identity),
            root: Some(root),
            cache: HashMap::new(),
        })
    }

    pub fn identity(&self) -> VaultResult<&IdentityKeypair> {
        self.identity
            .as_ref()
            .ok_or_else(|| VaultError::Unauthorized("key hierarchy has been cleared".into()))
    }

    pub fn root_key(&self) -> VaultResult<&SymmetricKey> {
        self.root
            .as_ref()
            .ok_or_else(|| VaultError::Unauthorized("key hierarchy has been cleared".into()))
    }

    /// Produce key material for `scope`.
    ///
    /// Folder, file and version keys are always fresh random keys; signing
    /// keys are derived from the identity. `VaultRoot` returns the session's
    /// root key.
    pub fn derive_or_generate(&self, scope: KeyScope) -> VaultResult<KeyMaterial> {
        match scope {
            KeyScope::VaultRoot => self.root_key().cloned().map(KeyMaterial::Symmetric),
            KeyScope::Folder(_) | KeyScope::File(_) | KeyScope::FileVersion(_) => {
                // Gate on an open session even though the key is random.
                self.root_key()?;
                Ok(KeyMaterial::Symmetric(generate_symmetric_key()))
            }
            KeyScope::RecordSigning(record) => {
                derive_signing_keypair(self.identity()?, &record).map(KeyMaterial::Signing)
            }
        }
    }

    pub fn signing_keypair(&self, scope: &RecordScope) -> VaultResult<SigningKeypair> {
        derive_signing_keypair(self.identity()?, scope)
    }

    /// Domain-separated subkey of the root key (device registry key, etc.).
    pub fn derive_subkey(&self, domain: &str) -> VaultResult<SymmetricKey> {
        keys::derive_subkey(self.root_key()?, domain)
    }

    pub fn remember(&mut self, id: EntityId, key: SymmetricKey) {
        self.cache.insert(id, key);
    }

    pub fn cached(&self, id: &EntityId) -> Option<SymmetricKey> {
        self.cache.get(id).cloned()
    }

    pub fn forget(&mut self, id: &EntityId) {
        if let Some(mut key) = self.cache.remove(id) {
            key.wipe();
        }
    }

    pub fn wrap(&self, key: &KeyMaterial, recipient: &WrapPublicKey) -> VaultResult<WrappedKeyEnvelope> {
        match key {
            KeyMaterial::Symmetric(k) => envelope::wrap_symmetric(k, recipient),
            KeyMaterial::Signing(k) => envelope::wrap_signing_key(k, recipient),
        }
    }

    pub fn unwrap(&self, envelope: &WrappedKeyEnvelope, recipient: &WrapSecretKey) -> VaultResult<KeyMaterial> {
        match envelope.kind {
            KeyKind::Symmetric => envelope::unwrap_symmetric(envelope, recipient).map(KeyMaterial::Symmetric),
            KeyKind::SigningSeed => {
                envelope::unwrap_signing_key(envelope, recipient).map(KeyMaterial::Signing)
            }
            KeyKind::Factor => Err(VaultError::UnwrapFailed(
                "factor envelopes are opened by the device authorization protocol".into(),
            )),
        }
    }

    /// Unwrap an envelope addressed to this session's identity.
    pub fn unwrap_for_identity(&self, envelope: &WrappedKeyEnvelope) -> VaultResult<KeyMaterial> {
        let secret = self.identity()?.wrap_secret();
        self.unwrap(envelope, &secret)
    }

    /// Zeroize and drop every key held by this session.
    pub fn clear(&mut self) {
        for (_, mut key) in self.cache.drain() {
            key.wipe();
        }
        if let Some(mut root) = self.root.take() {
            root.wipe();
        }
        self.identity = None;
    }

    pub fn is_cleared(&self) -> bool {
        self.identity.is_none() && self.root.is_none() && self.cache.is_empty()
    }
}

impl Drop for KeyHierarchy {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for KeyHierarchy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyHierarchy")
            .field("identity", &self.identity.as_ref().map(|i| i.public().fingerprint()))
            .field("open", &self.root.is_some())
            .field("cached_keys", &self.cache.len())
            .finish()
    }
}
