//! Integration tests: vault engine write/read path over opendal Memory
//! and the in-memory naming layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use opendal::Operator;
use zkv_core::config::NamingConfig;
use zkv_core::{DeviceId, ManualClock, VaultError, VaultResult};
use zkv_crypto::{IdentityKeypair, VaultHeader};
use zkv_records::EntryKind;
use zkv_sync::{
    CleanupQueue, ContentStore, MemoryNamingLayer, NamingLayer, OpendalContentStore,
    SyncCoordinator, VaultEngine,
};

struct Shared {
    naming: Arc<dyn NamingLayer>,
    content: Arc<dyn ContentStore>,
    clock: Arc<ManualClock>,
}

impl Shared {
    fn new() -> Self {
        let op = Operator::new(opendal::services::Memory::default())
            .expect("memory operator")
            .finish();
        Self {
            naming: Arc::new(MemoryNamingLayer::new()),
            content: Arc::new(OpendalContentStore::new(op, "test/vault")),
            clock: Arc::new(ManualClock::new(1_700_000_000)),
        }
    }

    fn parts(&self) -> (Arc<SyncCoordinator>, Arc<dyn ContentStore>, Arc<CleanupQueue>) {
        let coordinator = Arc::new(SyncCoordinator::new(
            self.naming.clone(),
            &NamingConfig::default(),
            self.clock.clone(),
        ));
        let cleanup = Arc::new(CleanupQueue::new(self.content.clone(), 3));
        (coordinator, self.content.clone(), cleanup)
    }

    async fn init(&self, identity: IdentityKeypair, keep_versions: usize) -> VaultEngine {
        let (coordinator, content, cleanup) = self.parts();
        VaultEngine::init(
            identity,
            coordinator,
            content,
            cleanup,
            DeviceId("device-a".into()),
            keep_versions,
        )
        .await
        .expect("init vault")
    }

    fn open(&self, identity: IdentityKeypair, header: VaultHeader, device: &str) -> VaultEngine {
        let (coordinator, content, cleanup) = self.parts();
        VaultEngine::open(
            identity,
            header,
            coordinator,
            content,
            cleanup,
            DeviceId(device.into()),
            10,
        )
        .expect("open vault")
    }
}

#[tokio::test]
async fn create_put_list_read() {
    let shared = Shared::new();
    let engine = shared.init(IdentityKeypair::generate(), 10).await;
    let root = engine.root_folder();

    assert!(engine.list_folder(root).await.unwrap().is_empty());

    let docs = engine.create_folder(root, "docs").await.unwrap();
    let file = engine.put_file(docs, "notes.txt", b"hello vault").await.unwrap();

    let root_children = engine.list_folder(root).await.unwrap();
    assert_eq!(root_children.len(), 1);
    assert_eq!(root_children[0].name, "docs");
    assert_eq!(root_children[0].kind, EntryKind::Folder);

    let docs_children = engine.list_folder(docs).await.unwrap();
    assert_eq!(docs_children.len(), 1);
    assert_eq!(docs_children[0].id, file);
    assert_eq!(docs_children[0].kind, EntryKind::File);

    assert_eq!(engine.read_file(file).await.unwrap(), b"hello vault");
}

#[tokio::test]
async fn second_device_reads_by_walking_the_tree() {
    let shared = Shared::new();
    let identity = IdentityKeypair::generate();
    let engine_a = shared.init(identity.clone(), 10).await;

    let docs = engine_a.create_folder(engine_a.root_folder(), "docs").await.unwrap();
    let file = engine_a.put_file(docs, "plan.md", b"# plan").await.unwrap();

    // The header is public; only the owner identity can open it.
    let header = engine_a.header().clone();
    let engine_b = shared.open(identity, header, "device-b");

    // Keys are not loaded until the parent folders are listed.
    assert!(matches!(
        engine_b.read_file(file).await,
        Err(VaultError::NotFound(_))
    ));

    engine_b.list_folder(engine_b.root_folder()).await.unwrap();
    engine_b.list_folder(docs).await.unwrap();
    assert_eq!(engine_b.read_file(file).await.unwrap(), b"# plan");
}

#[tokio::test]
async fn other_identity_cannot_open_vault() {
    let shared = Shared::new();
    let engine = shared.init(IdentityKeypair::generate(), 10).await;
    let header = engine.header().clone();

    let (coordinator, content, cleanup) = shared.parts();
    let result = VaultEngine::open(
        IdentityKeypair::generate(),
        header,
        coordinator,
        content,
        cleanup,
        DeviceId("intruder".into()),
        10,
    );
    assert!(matches!(result, Err(VaultError::UnwrapFailed(_))));
}

#[tokio::test]
async fn update_keeps_bounded_history_and_unpins_pruned() {
    let shared = Shared::new();
    let engine = shared.init(IdentityKeypair::generate(), 1).await;
    let root = engine.root_folder();

    let file = engine.put_file(root, "draft.txt", b"v1").await.unwrap();
    let seq2 = engine.update_file(file, b"v2").await.unwrap();
    let seq3 = engine.update_file(file, b"v3").await.unwrap();
    assert_eq!(seq2.get(), 2);
    assert_eq!(seq3.get(), 3);

    assert_eq!(engine.read_file(file).await.unwrap(), b"v3");

    let versions = engine.file_versions(file).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].size, 2);
    // v2 is archived and still readable by address; v1 was pruned and unpinned.
    assert!(shared.content.get(&versions[0].address).await.is_ok());
}

#[tokio::test]
async fn delete_unlinks_and_unpins_content() {
    let shared = Shared::new();
    let engine = shared.init(IdentityKeypair::generate(), 10).await;
    let root = engine.root_folder();

    let file = engine.put_file(root, "tmp.bin", &[7u8; 64]).await.unwrap();
    engine.update_file(file, &[8u8; 64]).await.unwrap();
    let versions = engine.file_versions(file).await.unwrap();
    let archived = versions[0].address.clone();

    engine.delete_file(root, file).await.unwrap();

    assert!(engine.list_folder(root).await.unwrap().is_empty());
    assert!(matches!(
        shared.content.get(&archived).await,
        Err(VaultError::NotFound(_))
    ));
    assert!(matches!(
        engine.delete_file(root, file).await,
        Err(VaultError::NotFound(_))
    ));
}

#[tokio::test]
async fn duplicate_names_rejected() {
    let shared = Shared::new();
    let engine = shared.init(IdentityKeypair::generate(), 10).await;
    let root = engine.root_folder();

    engine.create_folder(root, "photos").await.unwrap();
    assert!(matches!(
        engine.create_folder(root, "photos").await,
        Err(VaultError::InvalidTransition(_))
    ));
    assert!(matches!(
        engine.put_file(root, "photos", b"x").await,
        Err(VaultError::InvalidTransition(_))
    ));
}

#[tokio::test]
async fn closed_session_refuses_operations() {
    let shared = Shared::new();
    let engine = shared.init(IdentityKeypair::generate(), 10).await;
    let root = engine.root_folder();

    engine.close();
    assert!(matches!(
        engine.list_folder(root).await,
        Err(VaultError::Unauthorized(_))
    ));
}

#[tokio::test]
async fn sequential_writes_from_two_devices() {
    let shared = Shared::new();
    let identity = IdentityKeypair::generate();
    let engine_a = shared.init(identity.clone(), 10).await;
    let engine_b = shared.open(identity, engine_a.header().clone(), "device-b");
    let root = engine_a.root_folder();

    let file = engine_a.put_file(root, "shared.txt", b"base").await.unwrap();
    engine_b.list_folder(root).await.unwrap();

    // Both devices update; each update re-reads, so sequential writes succeed.
    engine_a.update_file(file, b"from a").await.unwrap();
    engine_b.update_file(file, b"from b").await.unwrap();
    assert_eq!(engine_a.read_file(file).await.unwrap(), b"from b");
    assert_eq!(engine_a.file_versions(file).await.unwrap().len(), 2);
}

/// Content store whose unpins fail while `offline` is set.
struct Unreachable {
    inner: Arc<dyn ContentStore>,
    offline: AtomicBool,
}

#[async_trait]
impl ContentStore for Unreachable {
    async fn put(&self, bytes: Vec<u8>) -> VaultResult<String> {
        self.inner.put(bytes).await
    }
    async fn get(&self, address: &str) -> VaultResult<Vec<u8>> {
        self.inner.get(address).await
    }
    async fn unpin(&self, address: &str) -> VaultResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(VaultError::Other(anyhow::anyhow!("pinning service offline")));
        }
        self.inner.unpin(address).await
    }
}

#[tokio::test]
async fn failed_unpin_is_retried_by_a_later_write() {
    let shared = Shared::new();
    let store = Arc::new(Unreachable {
        inner: shared.content.clone(),
        offline: AtomicBool::new(false),
    });
    let (coordinator, _, _) = shared.parts();
    let cleanup = Arc::new(CleanupQueue::new(store.clone(), 5));
    let engine = VaultEngine::init(
        IdentityKeypair::generate(),
        coordinator,
        store.clone(),
        cleanup.clone(),
        DeviceId("device-a".into()),
        1,
    )
    .await
    .unwrap();
    let root = engine.root_folder();

    let file = engine.put_file(root, "log.txt", b"v1").await.unwrap();
    engine.update_file(file, b"v2").await.unwrap();
    let v1 = engine.file_versions(file).await.unwrap()[0].address.clone();

    // Pruning v1 fails; the write still commits and the unpin is queued.
    store.offline.store(true, Ordering::SeqCst);
    engine.update_file(file, b"v3").await.unwrap();
    assert_eq!(cleanup.len(), 1);
    assert!(shared.content.get(&v1).await.is_ok());

    store.offline.store(false, Ordering::SeqCst);
    let other = engine.put_file(root, "other.txt", b"x").await.unwrap();
    engine.delete_file(root, other).await.unwrap();

    assert!(cleanup.is_empty());
    assert!(matches!(
        shared.content.get(&v1).await,
        Err(VaultError::NotFound(_))
    ));
}

#[tokio::test]
async fn retry_cleanup_reports_recovered_unpins() {
    let shared = Shared::new();
    let store = Arc::new(Unreachable {
        inner: shared.content.clone(),
        offline: AtomicBool::new(true),
    });
    let (coordinator, _, _) = shared.parts();
    let cleanup = Arc::new(CleanupQueue::new(store.clone(), 5));
    let engine = VaultEngine::init(
        IdentityKeypair::generate(),
        coordinator,
        store.clone(),
        cleanup.clone(),
        DeviceId("device-a".into()),
        10,
    )
    .await
    .unwrap();
    let root = engine.root_folder();

    let file = engine.put_file(root, "gone.txt", b"bytes").await.unwrap();
    engine.delete_file(root, file).await.unwrap();
    assert_eq!(cleanup.len(), 1);

    let still_down = engine.retry_cleanup().await;
    assert_eq!(still_down.requeued, 1);

    store.offline.store(false, Ordering::SeqCst);
    let report = engine.retry_cleanup().await;
    assert_eq!(report.unpinned, 1);
    assert!(cleanup.is_empty());
}
