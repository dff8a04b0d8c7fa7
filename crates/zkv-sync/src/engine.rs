//! Vault engine: folder and file operations over the key hierarchy, the
//! record codec, the coordinator and the content store.
//!
//! Every write is read-modify-write against the naming layer: resolve the
//! record, decode it, apply the change, publish with the resolved sequence as
//! the observed one. A concurrent writer surfaces as `PublishConflict` and the
//! caller re-runs its intent.
//!
//! Keys are reached by walking the tree: listing a folder opens its
//! children's keys into the session cache.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};
use zkv_core::{DeviceId, EntityId, VaultError, VaultResult};
use zkv_crypto::{
    aead, open_key, seal_key, IdentityKeypair, KeyHierarchy, KeyScope, RecordScope, SigningKeypair,
    SymmetricKey, VaultHeader,
};
use zkv_records::{
    decode_record, encode_record, ChildEntry, ContentVersion, EntryKind, FilePointer, FolderRecord,
    RecordBody, Sequence,
};

use crate::cleanup::{CleanupQueue, CleanupReport};
use crate::content::ContentStore;
use crate::coordinator::{PublishResult, SyncCoordinator};

fn child_key_context(id: &EntityId) -> Vec<u8> {
    format!("zkv-child-key:{id}").into_bytes()
}

fn content_aad(file: &EntityId) -> Vec<u8> {
    format!("zkv-content-v1:{file}").into_bytes()
}

struct Loaded<T> {
    record: T,
    sequence: Sequence,
}

pub struct VaultEngine {
    header: VaultHeader,
    keys: Mutex<KeyHierarchy>,
    coordinator: Arc<SyncCoordinator>,
    content: Arc<dyn ContentStore>,
    cleanup: Arc<CleanupQueue>,
    device: DeviceId,
    keep_versions: usize,
}

impl VaultEngine {
    /// Create a new vault owned by `identity` and publish its empty root folder.
    pub async fn init(
        identity: IdentityKeypair,
        coordinator: Arc<SyncCoordinator>,
        content: Arc<dyn ContentStore>,
        cleanup: Arc<CleanupQueue>,
        device: DeviceId,
        keep_versions: usize,
    ) -> VaultResult<Self> {
        let now = coordinator.clock().now();
        let (keys, header) = KeyHierarchy::create(identity, now)?;
        let engine = Self::with_session(header, keys, coordinator, content, cleanup, device, keep_versions)?;

        let root_id = engine.header.root_folder;
        let root = FolderRecord::new(root_id, None, "", now);
        let root_key = engine.entity_key(&root_id)?;
        engine
            .publish_record(RecordScope::Folder(root_id), &root, &root_key, Sequence::UNPUBLISHED)
            .await?;

        info!(vault = %engine.header.vault_id, root = %root_id, "vault initialized");
        Ok(engine)
    }

    /// Open a session on an existing vault.
    pub fn open(
        identity: IdentityKeypair,
        header: VaultHeader,
        coordinator: Arc<SyncCoordinator>,
        content: Arc<dyn ContentStore>,
        cleanup: Arc<CleanupQueue>,
        device: DeviceId,
        keep_versions: usize,
    ) -> VaultResult<Self> {
        let keys = KeyHierarchy::open(identity, &header)?;
        Self::with_session(header, keys, coordinator, content, cleanup, device, keep_versions)
    }

    fn with_session(
        header: VaultHeader,
        mut keys: KeyHierarchy,
        coordinator: Arc<SyncCoordinator>,
        content: Arc<dyn ContentStore>,
        cleanup: Arc<CleanupQueue>,
        device: DeviceId,
        keep_versions: usize,
    ) -> VaultResult<Self> {
        let root_folder_key = header.open_root_folder_key(keys.root_key()?)?;
        keys.remember(header.root_folder, root_folder_key);
        Ok(Self {
            header,
            keys: Mutex::new(keys),
            coordinator,
            content,
            cleanup,
            device,
            keep_versions,
        })
    }

    pub fn header(&self) -> &VaultHeader {
        &self.header
    }

    pub fn root_folder(&self) -> EntityId {
        self.header.root_folder
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Logout: wipe every key this session holds.
    pub fn close(&self) {
        self.keys.lock().clear();
        debug!(vault = %self.header.vault_id, "vault session closed");
    }

    /// Naming-layer name of an entity's record.
    pub fn record_name(&self, scope: RecordScope) -> VaultResult<String> {
        Ok(self.signing_keypair(scope)?.public().to_hex())
    }

    pub fn signing_keypair(&self, scope: RecordScope) -> VaultResult<SigningKeypair> {
        self.keys.lock().signing_keypair(&scope)
    }

    fn entity_key(&self, id: &EntityId) -> VaultResult<SymmetricKey> {
        self.keys.lock().cached(id).ok_or_else(|| {
            VaultError::NotFound(format!("key for {id} is not loaded; list its parent folder first"))
        })
    }

    fn generate(&self, scope: KeyScope) -> VaultResult<SymmetricKey> {
        self.keys.lock().derive_or_generate(scope)?.into_symmetric()
    }

    /// Retry unpins that failed earlier in this session.
    pub async fn retry_cleanup(&self) -> CleanupReport {
        self.cleanup.drain().await
    }

    /// Unpin content a committed write no longer references. Earlier
    /// failures are retried first so they do not wait for a dedicated pass.
    async fn release(&self, addresses: impl IntoIterator<Item = String>) {
        if !self.cleanup.is_empty() {
            self.cleanup.drain().await;
        }
        for address in addresses {
            self.cleanup.unpin_best_effort(&address).await;
        }
    }

    fn now(&self) -> u64 {
        self.coordinator.clock().now()
    }

    async fn load<T: RecordBody>(&self, scope: RecordScope, id: EntityId) -> VaultResult<Loaded<T>> {
        let name = self.record_name(scope)?;
        let resolved = self.coordinator.resolve(&name).await?;
        let key = self.entity_key(&id)?;
        let record = decode_record::<T>(resolved.value(), &key, &id)?;
        Ok(Loaded {
            record,
            sequence: resolved.sequence(),
        })
    }

    async fn publish_record<T: RecordBody>(
        &self,
        scope: RecordScope,
        record: &T,
        key: &SymmetricKey,
        observed: Sequence,
    ) -> VaultResult<PublishResult> {
        let encoded = encode_record(record, key)?;
        let keypair = self.signing_keypair(scope)?;
        self.coordinator.publish(&keypair, encoded, observed).await
    }

    /// Add `entry` (whose key is `child_key`) to a loaded folder and publish it.
    async fn attach_child(
        &self,
        mut folder: Loaded<FolderRecord>,
        name: &str,
        kind: EntryKind,
        child: EntityId,
        child_key: &SymmetricKey,
    ) -> VaultResult<PublishResult> {
        let folder_id = folder.record.id;
        let folder_key = self.entity_key(&folder_id)?;
        let now = self.now();
        let entry = ChildEntry {
            id: child,
            name: name.to_string(),
            kind,
            sealed_key: seal_key(&folder_key, child_key, &child_key_context(&child))?,
            added_at: now,
        };
        folder.record.upsert_child(entry, now);
        folder.record.modified_by = Some(self.device.clone());
        self.publish_record(RecordScope::Folder(folder_id), &folder.record, &folder_key, folder.sequence)
            .await
    }

    fn ensure_absent(folder: &FolderRecord, name: &str) -> VaultResult<()> {
        if folder.child(name).is_some() {
            return Err(VaultError::InvalidTransition(format!(
                "'{name}' already exists in folder {}",
                folder.id
            )));
        }
        Ok(())
    }

    /// List a folder's children and open their keys into the session.
    pub async fn list_folder(&self, folder: EntityId) -> VaultResult<Vec<ChildEntry>> {
        let loaded = self.load::<FolderRecord>(RecordScope::Folder(folder), folder).await?;
        let folder_key = self.entity_key(&folder)?;

        let mut keys = self.keys.lock();
        for child in &loaded.record.children {
            let key = open_key(&folder_key, &child.sealed_key, &child_key_context(&child.id))?;
            keys.remember(child.id, key);
        }
        Ok(loaded.record.children)
    }

    pub async fn create_folder(&self, parent: EntityId, name: &str) -> VaultResult<EntityId> {
        let parent_loaded = self.load::<FolderRecord>(RecordScope::Folder(parent), parent).await?;
        Self::ensure_absent(&parent_loaded.record, name)?;

        let id = EntityId::new();
        let key = self.generate(KeyScope::Folder(id))?;
        let mut record = FolderRecord::new(id, Some(parent), name, self.now());
        record.modified_by = Some(self.device.clone());

        self.publish_record(RecordScope::Folder(id), &record, &key, Sequence::UNPUBLISHED)
            .await?;
        self.keys.lock().remember(id, key.clone());
        self.attach_child(parent_loaded, name, EntryKind::Folder, id, &key)
            .await?;

        info!(folder = %id, parent = %parent, "folder created");
        Ok(id)
    }

    async fn store_content(&self, file: EntityId, data: &[u8]) -> VaultResult<ContentVersion> {
        let key = self.generate(KeyScope::FileVersion(file))?;
        let sealed = aead::seal(&key, data, &content_aad(&file))?;
        let address = self.content.put(sealed).await?;
        Ok(ContentVersion {
            address,
            key,
            size: data.len() as u64,
            created_at: self.now(),
        })
    }

    pub async fn put_file(&self, folder: EntityId, name: &str, data: &[u8]) -> VaultResult<EntityId> {
        let folder_loaded = self.load::<FolderRecord>(RecordScope::Folder(folder), folder).await?;
        Self::ensure_absent(&folder_loaded.record, name)?;

        let id = EntityId::new();
        let content = self.store_content(id, data).await?;
        let address = content.address.clone();
        let file_key = self.generate(KeyScope::File(id))?;
        let pointer = FilePointer::new(id, folder, name, content);

        let published = async {
            self.publish_record(RecordScope::File(id), &pointer, &file_key, Sequence::UNPUBLISHED)
                .await?;
            self.attach_child(folder_loaded, name, EntryKind::File, id, &file_key)
                .await
        }
        .await;
        if let Err(e) = published {
            self.cleanup.unpin_best_effort(&address).await;
            return Err(e);
        }

        self.keys.lock().remember(id, file_key);
        info!(file = %id, folder = %folder, size = data.len(), "file stored");
        Ok(id)
    }

    /// Replace a file's content, archiving the previous version.
    pub async fn update_file(&self, file: EntityId, data: &[u8]) -> VaultResult<Sequence> {
        let mut loaded = self.load::<FilePointer>(RecordScope::File(file), file).await?;
        let file_key = self.entity_key(&file)?;

        let content = self.store_content(file, data).await?;
        let address = content.address.clone();
        loaded.record.push_version(content);
        let pruned = loaded.record.prune(self.keep_versions);

        let result = match self
            .publish_record(RecordScope::File(file), &loaded.record, &file_key, loaded.sequence)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                self.cleanup.unpin_best_effort(&address).await;
                return Err(e);
            }
        };

        self.release(pruned.into_iter().map(|v| v.address)).await;
        info!(file = %file, sequence = %result.sequence, "file updated");
        Ok(result.sequence)
    }

    pub async fn read_file(&self, file: EntityId) -> VaultResult<Vec<u8>> {
        let loaded = self.load::<FilePointer>(RecordScope::File(file), file).await?;
        let sealed = self.content.get(&loaded.record.current.address).await?;
        let plaintext = aead::open(&loaded.record.current.key, &sealed, &content_aad(&file))?;
        Ok(plaintext.to_vec())
    }

    /// Archived versions of a file, oldest first (not including the current one).
    pub async fn file_versions(&self, file: EntityId) -> VaultResult<Vec<ContentVersion>> {
        let loaded = self.load::<FilePointer>(RecordScope::File(file), file).await?;
        Ok(loaded.record.versions)
    }

    /// Remove a file from its folder and unpin all of its content.
    ///
    /// The file's own pointer record is left to expire: the naming layer has
    /// no delete, and nothing re-asserts it once it is unlinked.
    pub async fn delete_file(&self, folder: EntityId, file: EntityId) -> VaultResult<()> {
        let mut folder_loaded = self.load::<FolderRecord>(RecordScope::Folder(folder), folder).await?;
        let pointer = self.load::<FilePointer>(RecordScope::File(file), file).await?;

        let now = self.now();
        folder_loaded
            .record
            .remove_child(&file, now)
            .ok_or_else(|| VaultError::NotFound(format!("file {file} in folder {folder}")))?;
        folder_loaded.record.modified_by = Some(self.device.clone());

        let folder_key = self.entity_key(&folder)?;
        self.publish_record(
            RecordScope::Folder(folder),
            &folder_loaded.record,
            &folder_key,
            folder_loaded.sequence,
        )
        .await?;

        self.release(pointer.record.addresses()).await;
        self.keys.lock().forget(&file);
        info!(file = %file, folder = %folder, "file deleted");
        Ok(())
    }
}
