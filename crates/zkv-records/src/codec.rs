//! Versioned record encoding
//!
//! Plaintext is a JSON object with an integer `version` tag next to the body
//! fields. The sealed form is `aead::seal(entity_key, plaintext, aad)` where
//! the AAD binds the record kind and entity id.
//!
//! Decoding matches the tag exhaustively: known older versions are upgraded
//! to the current shape, anything else is `SchemaMismatch`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;
use zkv_core::{EntityId, VaultError, VaultResult};
use zkv_crypto::encoding::base64_bytes;
use zkv_crypto::{aead, SymmetricKey};

use crate::record::{
    ChildEntry, ContentVersion, DeviceRegistryRecord, EntryKind, FilePointer, FolderRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Folder,
    FilePointer,
    DeviceRegistry,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Folder => "folder",
            RecordKind::FilePointer => "file_pointer",
            RecordKind::DeviceRegistry => "device_registry",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record type with a versioned wire schema.
pub trait RecordBody: Serialize + DeserializeOwned {
    const KIND: RecordKind;
    const CURRENT_VERSION: u32;

    fn entity_id(&self) -> EntityId;

    /// Parse a plaintext written under `version` and upgrade it to the
    /// current shape. The `version` field itself is ignored by the body types.
    fn from_versioned(version: u32, plaintext: &[u8]) -> VaultResult<Self>;
}

fn record_aad(kind: RecordKind, entity: &EntityId) -> Vec<u8> {
    format!("zkv-record-v1:{kind}:{entity}").into_bytes()
}

fn schema_mismatch<T: RecordBody>(found: u32) -> VaultError {
    VaultError::SchemaMismatch {
        kind: T::KIND.to_string(),
        found,
        supported: T::CURRENT_VERSION,
    }
}

fn parse_body<B: DeserializeOwned>(kind: RecordKind, plaintext: &[u8]) -> VaultResult<B> {
    serde_json::from_slice(plaintext).map_err(|e| VaultError::malformed(kind.as_str(), e))
}

#[derive(Serialize)]
struct Versioned<'a, T> {
    version: u32,
    #[serde(flatten)]
    body: &'a T,
}

/// Only the tag; every other field is skipped without being buffered.
#[derive(Deserialize)]
struct VersionTag {
    version: Option<u64>,
}

/// Encode `record` at the current schema version and seal it under `key`.
pub fn encode_record<T: RecordBody>(record: &T, key: &SymmetricKey) -> VaultResult<Vec<u8>> {
    let plaintext = Zeroizing::new(
        serde_json::to_vec(&Versioned {
            version: T::CURRENT_VERSION,
            body: record,
        })
        .map_err(|e| VaultError::malformed(T::KIND.as_str(), e))?,
    );
    aead::seal(key, &plaintext, &record_aad(T::KIND, &record.entity_id()))
}

/// Open and decode a record sealed for `entity`.
///
/// The plaintext never leaves its zeroizing buffer: the tag and the body are
/// each deserialized straight from it.
pub fn decode_record<T: RecordBody>(
    ciphertext: &[u8],
    key: &SymmetricKey,
    entity: &EntityId,
) -> VaultResult<T> {
    let plaintext: Zeroizing<Vec<u8>> = aead::open(key, ciphertext, &record_aad(T::KIND, entity))?;

    let tag: VersionTag = parse_body(T::KIND, &plaintext)?;
    let version = tag
        .version
        .ok_or_else(|| VaultError::malformed(T::KIND.as_str(), "missing version tag"))?;
    let version = u32::try_from(version).unwrap_or(u32::MAX);

    let record = T::from_versioned(version, &plaintext)?;
    if &record.entity_id() != entity {
        return Err(VaultError::malformed(
            T::KIND.as_str(),
            format!("record names entity {} but was sealed for {entity}", record.entity_id()),
        ));
    }
    Ok(record)
}

// Folder ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildEntryV1 {
    pub id: EntityId,
    pub name: String,
    pub is_folder: bool,
    #[serde(with = "base64_bytes")]
    pub sealed_key: Vec<u8>,
}

/// Folder record before children carried a kind and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderRecordV1 {
    pub id: EntityId,
    pub parent: Option<EntityId>,
    pub name: String,
    pub children: Vec<ChildEntryV1>,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FolderSchema {
    V1(FolderRecordV1),
    V2(FolderRecord),
}

impl FolderSchema {
    pub fn upgrade(self) -> FolderRecord {
        match self {
            FolderSchema::V2(record) => record,
            FolderSchema::V1(v1) => FolderRecord {
                id: v1.id,
                parent: v1.parent,
                name: v1.name,
                children: v1
                    .children
                    .into_iter()
                    .map(|c| ChildEntry {
                        id: c.id,
                        name: c.name,
                        kind: if c.is_folder {
                            EntryKind::Folder
                        } else {
                            EntryKind::File
                        },
                        sealed_key: c.sealed_key,
                        added_at: v1.created_at,
                    })
                    .collect(),
                created_at: v1.created_at,
                modified_at: v1.created_at,
                modified_by: None,
            },
        }
    }
}

impl RecordBody for FolderRecord {
    const KIND: RecordKind = RecordKind::Folder;
    const CURRENT_VERSION: u32 = 2;

    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn from_versioned(version: u32, plaintext: &[u8]) -> VaultResult<Self> {
        let schema = match version {
            1 => FolderSchema::V1(parse_body(Self::KIND, plaintext)?),
            2 => FolderSchema::V2(parse_body(Self::KIND, plaintext)?),
            other => return Err(schema_mismatch::<Self>(other)),
        };
        Ok(schema.upgrade())
    }
}

// File pointer -----------------------------------------------------------------

/// File pointer before version history: one content blob, no archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePointerV1 {
    pub id: EntityId,
    pub folder: EntityId,
    pub name: String,
    pub address: String,
    pub key: SymmetricKey,
    pub size: u64,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePointerSchema {
    V1(FilePointerV1),
    V2(FilePointer),
}

impl FilePointerSchema {
    pub fn upgrade(self) -> FilePointer {
        match self {
            FilePointerSchema::V2(pointer) => pointer,
            FilePointerSchema::V1(v1) => FilePointer {
                id: v1.id,
                folder: v1.folder,
                name: v1.name,
                current: ContentVersion {
                    address: v1.address,
                    key: v1.key,
                    size: v1.size,
                    created_at: v1.created_at,
                },
                versions: Vec::new(),
                created_at: v1.created_at,
                modified_at: v1.created_at,
            },
        }
    }
}

impl RecordBody for FilePointer {
    const KIND: RecordKind = RecordKind::FilePointer;
    const CURRENT_VERSION: u32 = 2;

    fn entity_id(&self) -> EntityId {
        self.id
    }

    fn from_versioned(version: u32, plaintext: &[u8]) -> VaultResult<Self> {
        let schema = match version {
            1 => FilePointerSchema::V1(parse_body(Self::KIND, plaintext)?),
            2 => FilePointerSchema::V2(parse_body(Self::KIND, plaintext)?),
            other => return Err(schema_mismatch::<Self>(other)),
        };
        Ok(schema.upgrade())
    }
}

// Device registry --------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceRegistrySchema {
    V1(DeviceRegistryRecord),
}

impl RecordBody for DeviceRegistryRecord {
    const KIND: RecordKind = RecordKind::DeviceRegistry;
    const CURRENT_VERSION: u32 = 1;

    fn entity_id(&self) -> EntityId {
        self.vault_id
    }

    fn from_versioned(version: u32, plaintext: &[u8]) -> VaultResult<Self> {
        match version {
            1 => Ok(DeviceRegistrySchema::V1(parse_body(Self::KIND, plaintext)?)),
            other => Err(schema_mismatch::<Self>(other)),
        }
        .map(|DeviceRegistrySchema::V1(record)| record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zkv_crypto::generate_symmetric_key;

    fn seal_plaintext(json: &serde_json::Value, key: &SymmetricKey, kind: RecordKind, id: &EntityId) -> Vec<u8> {
        let bytes = serde_json::to_vec(json).unwrap();
        aead::seal(key, &bytes, &record_aad(kind, id)).unwrap()
    }

    fn sample_folder() -> FolderRecord {
        let mut folder = FolderRecord::new(EntityId::new(), None, "root", 100);
        folder.upsert_child(
            ChildEntry {
                id: EntityId::new(),
                name: "notes.md".into(),
                kind: EntryKind::File,
                sealed_key: vec![9; 72],
                added_at: 101,
            },
            101,
        );
        folder
    }

    #[test]
    fn test_folder_roundtrip() {
        let key = generate_symmetric_key();
        let folder = sample_folder();
        let sealed = encode_record(&folder, &key).unwrap();
        let decoded: FolderRecord = decode_record(&sealed, &key, &folder.id).unwrap();
        assert_eq!(decoded, folder);
    }

    #[test]
    fn test_wrong_key_is_decryption_failure() {
        let folder = sample_folder();
        let sealed = encode_record(&folder, &generate_symmetric_key()).unwrap();
        let result = decode_record::<FolderRecord>(&sealed, &generate_symmetric_key(), &folder.id);
        assert!(matches!(result, Err(VaultError::DecryptionFailed(_))));
    }

    #[test]
    fn test_record_bound_to_entity() {
        let key = generate_symmetric_key();
        let folder = sample_folder();
        let sealed = encode_record(&folder, &key).unwrap();
        let result = decode_record::<FolderRecord>(&sealed, &key, &EntityId::new());
        assert!(matches!(result, Err(VaultError::DecryptionFailed(_))));
    }

    #[test]
    fn test_record_bound_to_kind() {
        // A folder ciphertext presented as a file pointer fails authentication.
        let key = generate_symmetric_key();
        let folder = sample_folder();
        let sealed = encode_record(&folder, &key).unwrap();
        let result = decode_record::<FilePointer>(&sealed, &key, &folder.id);
        assert!(matches!(result, Err(VaultError::DecryptionFailed(_))));
    }

    #[test]
    fn test_future_version_is_schema_mismatch() {
        let key = generate_symmetric_key();
        let id = EntityId::new();
        let json = serde_json::json!({
            "version": 3,
            "id": id,
            "parent": null,
            "name": "from the future",
            "children": [],
            "created_at": 0,
            "modified_at": 0,
            "quantum_acl": {"mode": "entangled"}
        });
        let sealed = seal_plaintext(&json, &key, RecordKind::Folder, &id);
        let result = decode_record::<FolderRecord>(&sealed, &key, &id);
        assert!(matches!(
            result,
            Err(VaultError::SchemaMismatch { found: 3, supported: 2, .. })
        ));
    }

    #[test]
    fn test_missing_version_is_malformed() {
        let key = generate_symmetric_key();
        let id = EntityId::new();
        let json = serde_json::json!({ "id": id, "name": "x" });
        let sealed = seal_plaintext(&json, &key, RecordKind::Folder, &id);
        assert!(matches!(
            decode_record::<FolderRecord>(&sealed, &key, &id),
            Err(VaultError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_known_version_with_bad_body_is_malformed() {
        let key = generate_symmetric_key();
        let id = EntityId::new();
        let json = serde_json::json!({ "version": 2, "id": id });
        let sealed = seal_plaintext(&json, &key, RecordKind::Folder, &id);
        assert!(matches!(
            decode_record::<FolderRecord>(&sealed, &key, &id),
            Err(VaultError::MalformedRecord { .. })
        ));
    }

    #[test]
    fn test_folder_v1_upgraded() {
        let key = generate_symmetric_key();
        let id = EntityId::new();
        let child = EntityId::new();
        let json = serde_json::json!({
            "version": 1,
            "id": id,
            "parent": null,
            "name": "legacy",
            "children": [
                {"id": child, "name": "sub", "is_folder": true, "sealed_key": "AQID"}
            ],
            "created_at": 50
        });
        let sealed = seal_plaintext(&json, &key, RecordKind::Folder, &id);
        let folder: FolderRecord = decode_record(&sealed, &key, &id).unwrap();

        assert_eq!(folder.name, "legacy");
        assert_eq!(folder.modified_at, 50);
        assert_eq!(folder.children[0].kind, EntryKind::Folder);
        assert_eq!(folder.children[0].sealed_key, vec![1, 2, 3]);
        assert_eq!(folder.children[0].added_at, 50);

        // Re-encoding writes the current version.
        let resealed = encode_record(&folder, &key).unwrap();
        let plaintext = aead::open(&key, &resealed, &record_aad(RecordKind::Folder, &id)).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&plaintext).unwrap();
        assert_eq!(value["version"], 2);
    }

    #[test]
    fn test_file_pointer_v1_upgraded() {
        let key = generate_symmetric_key();
        let content_key = generate_symmetric_key();
        let id = EntityId::new();
        let folder = EntityId::new();
        let json = serde_json::json!({
            "version": 1,
            "id": id,
            "folder": folder,
            "name": "a.bin",
            "address": "blake3:abc",
            "key": content_key,
            "size": 12,
            "created_at": 7
        });
        let sealed = seal_plaintext(&json, &key, RecordKind::FilePointer, &id);
        let ptr: FilePointer = decode_record(&sealed, &key, &id).unwrap();

        assert_eq!(ptr.current.address, "blake3:abc");
        assert_eq!(ptr.current.key, content_key);
        assert!(ptr.versions.is_empty());
        assert_eq!(ptr.folder, folder);
    }

    #[test]
    fn test_file_pointer_roundtrip_with_history() {
        let key = generate_symmetric_key();
        let version = |a: &str, t| ContentVersion {
            address: a.into(),
            key: generate_symmetric_key(),
            size: 3,
            created_at: t,
        };
        let mut ptr = FilePointer::new(EntityId::new(), EntityId::new(), "f", version("a", 1));
        ptr.push_version(version("b", 2));

        let sealed = encode_record(&ptr, &key).unwrap();
        let decoded: FilePointer = decode_record(&sealed, &key, &ptr.id).unwrap();
        assert_eq!(decoded, ptr);
    }

    #[test]
    fn test_device_registry_unknown_version() {
        let key = generate_symmetric_key();
        let id = EntityId::new();
        let json = serde_json::json!({ "version": 2, "vault_id": id });
        let sealed = seal_plaintext(&json, &key, RecordKind::DeviceRegistry, &id);
        assert!(matches!(
            decode_record::<DeviceRegistryRecord>(&sealed, &key, &id),
            Err(VaultError::SchemaMismatch { found: 2, supported: 1, .. })
        ));
    }

    mod generated {
        use super::*;
        use crate::record::{DeviceRecord, DeviceStatus};
        use proptest::prelude::*;
        use zkv_core::DeviceId;
        use zkv_crypto::{SigningKeypair, WrapSecretKey};

        fn content(address: String, key: [u8; 32], size: u64, created_at: u64) -> ContentVersion {
            ContentVersion {
                address,
                key: SymmetricKey::from_bytes(key),
                size,
                created_at,
            }
        }

        fn arb_folder() -> impl Strategy<Value = FolderRecord> {
            (
                any::<bool>(),
                "[a-zA-Z0-9 ._-]{0,24}",
                0u64..4_000_000_000,
                prop::collection::vec(
                    (
                        "[a-zA-Z0-9 ._-]{1,24}",
                        any::<bool>(),
                        prop::collection::vec(any::<u8>(), 0..96),
                        0u64..4_000_000_000,
                    ),
                    0..6,
                ),
            )
                .prop_map(|(nested, name, created_at, children)| {
                    let parent = nested.then(EntityId::new);
                    let mut folder = FolderRecord::new(EntityId::new(), parent, name, created_at);
                    for (name, is_folder, sealed_key, added_at) in children {
                        let kind = if is_folder { EntryKind::Folder } else { EntryKind::File };
                        folder.upsert_child(
                            ChildEntry {
                                id: EntityId::new(),
                                name,
                                kind,
                                sealed_key,
                                added_at,
                            },
                            added_at,
                        );
                    }
                    folder
                })
        }

        fn arb_pointer() -> impl Strategy<Value = FilePointer> {
            (
                "[a-zA-Z0-9 ._-]{1,24}",
                prop::collection::vec(
                    ("blake3:[0-9a-f]{8}", any::<[u8; 32]>(), any::<u64>(), 0u64..4_000_000_000),
                    1..5,
                ),
            )
                .prop_map(|(name, versions)| {
                    let mut versions = versions
                        .into_iter()
                        .map(|(address, key, size, at)| content(address, key, size, at));
                    let first = versions.next().expect("at least one version");
                    let mut pointer = FilePointer::new(EntityId::new(), EntityId::new(), name, first);
                    for version in versions {
                        pointer.push_version(version);
                    }
                    pointer
                })
        }

        fn arb_status() -> impl Strategy<Value = DeviceStatus> {
            prop_oneof![
                Just(DeviceStatus::Pending),
                Just(DeviceStatus::Authorized),
                Just(DeviceStatus::Revoked),
            ]
        }

        fn arb_registry() -> impl Strategy<Value = DeviceRegistryRecord> {
            (
                any::<[u8; 32]>(),
                0u64..4_000_000_000,
                prop::collection::vec(
                    (
                        "[a-z0-9-]{1,16}",
                        any::<[u8; 32]>(),
                        arb_status(),
                        0u64..4_000_000_000,
                        prop::option::of(0u64..4_000_000_000),
                    ),
                    0..4,
                ),
            )
                .prop_map(|(owner_seed, updated_at, devices)| DeviceRegistryRecord {
                    vault_id: EntityId::new(),
                    owner: SigningKeypair::from_seed(&owner_seed).public(),
                    devices: devices
                        .into_iter()
                        .map(|(id, wrap, status, registered_at, authorized_at)| DeviceRecord {
                            device_id: DeviceId(id.clone()),
                            name: format!("{id} device"),
                            platform: "linux".into(),
                            public_key: WrapSecretKey::from_bytes(wrap).public(),
                            status,
                            registered_at,
                            authorized_at,
                            authorized_by: authorized_at.map(|_| DeviceId("owner".into())),
                            revoked_at: (status == DeviceStatus::Revoked).then_some(updated_at),
                        })
                        .collect(),
                    updated_at,
                })
        }

        proptest! {
            #[test]
            fn prop_folder_roundtrip(folder in arb_folder(), key in any::<[u8; 32]>()) {
                let key = SymmetricKey::from_bytes(key);
                let sealed = encode_record(&folder, &key).unwrap();
                prop_assert_eq!(decode_record::<FolderRecord>(&sealed, &key, &folder.id).unwrap(), folder.clone());

                let misdirected = decode_record::<FolderRecord>(&sealed, &key, &EntityId::new());
                prop_assert!(matches!(misdirected, Err(VaultError::DecryptionFailed(_))));
                let wrong_kind = decode_record::<FilePointer>(&sealed, &key, &folder.id);
                prop_assert!(matches!(wrong_kind, Err(VaultError::DecryptionFailed(_))));
            }

            #[test]
            fn prop_file_pointer_roundtrip(pointer in arb_pointer(), key in any::<[u8; 32]>()) {
                let key = SymmetricKey::from_bytes(key);
                let sealed = encode_record(&pointer, &key).unwrap();
                prop_assert_eq!(decode_record::<FilePointer>(&sealed, &key, &pointer.id).unwrap(), pointer.clone());

                let misdirected = decode_record::<FilePointer>(&sealed, &key, &pointer.folder);
                prop_assert!(matches!(misdirected, Err(VaultError::DecryptionFailed(_))));
                let wrong_kind = decode_record::<DeviceRegistryRecord>(&sealed, &key, &pointer.id);
                prop_assert!(matches!(wrong_kind, Err(VaultError::DecryptionFailed(_))));
            }

            #[test]
            fn prop_device_registry_roundtrip(registry in arb_registry(), key in any::<[u8; 32]>()) {
                let key = SymmetricKey::from_bytes(key);
                let sealed = encode_record(&registry, &key).unwrap();
                prop_assert_eq!(
                    decode_record::<DeviceRegistryRecord>(&sealed, &key, &registry.vault_id).unwrap(),
                    registry.clone()
                );

                let misdirected = decode_record::<DeviceRegistryRecord>(&sealed, &key, &EntityId::new());
                prop_assert!(matches!(misdirected, Err(VaultError::DecryptionFailed(_))));
                let wrong_kind = decode_record::<FolderRecord>(&sealed, &key, &registry.vault_id);
                prop_assert!(matches!(wrong_kind, Err(VaultError::DecryptionFailed(_))));
            }
        }
    }
}
