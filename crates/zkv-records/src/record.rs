//! Current (newest) shapes of the vault's metadata records.

use serde::{Deserialize, Serialize};
use zkv_core::{DeviceId, EntityId};
use zkv_crypto::encoding::base64_bytes;
use zkv_crypto::{SigningPublicKey, SymmetricKey, WrapPublicKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Folder,
    File,
}

/// One child of a folder. The child's own key is sealed under the folder
/// key, so listing a folder never exposes more than its direct children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildEntry {
    pub id: EntityId,
    pub name: String,
    pub kind: EntryKind,
    #[serde(with = "base64_bytes")]
    pub sealed_key: Vec<u8>,
    pub added_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRecord {
    pub id: EntityId,
    /// `None` for the vault root folder
    pub parent: Option<EntityId>,
    pub name: String,
    pub children: Vec<ChildEntry>,
    pub created_at: u64,
    pub modified_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_by: Option<DeviceId>,
}

impl FolderRecord {
    pub fn new(id: EntityId, parent: Option<EntityId>, name: impl Into<String>, now: u64) -> Self {
        Self {
            id,
            parent,
            name: name.into(),
            children: Vec::new(),
            created_at: now,
            modified_at: now,
            modified_by: None,
        }
    }

    pub fn child(&self, name: &str) -> Option<&ChildEntry> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_by_id(&self, id: &EntityId) -> Option<&ChildEntry> {
        self.children.iter().find(|c| &c.id == id)
    }

    /// Add or replace the child with the same name.
    pub fn upsert_child(&mut self, entry: ChildEntry, now: u64) {
        self.children.retain(|c| c.name != entry.name);
        self.children.push(entry);
        self.modified_at = now;
    }

    pub fn remove_child(&mut self, id: &EntityId, now: u64) -> Option<ChildEntry> {
        let pos = self.children.iter().position(|c| &c.id == id)?;
        self.modified_at = now;
        Some(self.children.remove(pos))
    }
}

/// One encrypted content blob. Every version has its own random key: no
/// two versions (or files) share key material, so nothing deduplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentVersion {
    /// Content address in the content-addressed store
    pub address: String,
    pub key: SymmetricKey,
    /// Plaintext size in bytes
    pub size: u64,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePointer {
    pub id: EntityId,
    pub folder: EntityId,
    pub name: String,
    pub current: ContentVersion,
    /// Archived versions, oldest first
    #[serde(default)]
    pub versions: Vec<ContentVersion>,
    pub created_at: u64,
    pub modified_at: u64,
}

impl FilePointer {
    pub fn new(id: EntityId, folder: EntityId, name: impl Into<String>, content: ContentVersion) -> Self {
        let now = content.created_at;
        Self {
            id,
            folder,
            name: name.into(),
            current: content,
            versions: Vec::new(),
            created_at: now,
            modified_at: now,
        }
    }

    /// Make `content` current and archive the previous version.
    pub fn push_version(&mut self, content: ContentVersion) {
        self.modified_at = content.created_at;
        let previous = std::mem::replace(&mut self.current, content);
        self.versions.push(previous);
    }

    /// Keep only the newest `keep` archived versions. Returns the removed
    /// ones so their content can be unpinned.
    pub fn prune(&mut self, keep: usize) -> Vec<ContentVersion> {
        if self.versions.len() <= keep {
            return Vec::new();
        }
        let excess = self.versions.len() - keep;
        self.versions.drain(..excess).collect()
    }

    /// Every content address this pointer references (current + archived).
    pub fn addresses(&self) -> Vec<String> {
        std::iter::once(&self.current)
            .chain(self.versions.iter())
            .map(|v| v.address.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Pending,
    Authorized,
    Revoked,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceStatus::Pending => f.write_str("pending"),
            DeviceStatus::Authorized => f.write_str("authorized"),
            DeviceStatus::Revoked => f.write_str("revoked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    pub name: String,
    pub platform: String,
    pub public_key: WrapPublicKey,
    pub status: DeviceStatus,
    pub registered_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorized_by: Option<DeviceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<u64>,
}

/// The vault's durable device list, published like any other record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistryRecord {
    pub vault_id: EntityId,
    /// Identity allowed to revoke devices
    pub owner: SigningPublicKey,
    pub devices: Vec<DeviceRecord>,
    pub updated_at: u64,
}
