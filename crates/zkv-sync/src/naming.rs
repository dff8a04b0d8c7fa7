//! Mutable naming layer: signed records keyed by the signer's public key
//!
//! A name is the hex Ed25519 public key of an entity's record-signing keypair.
//! A record is accepted only if it is correctly signed for its name and its
//! sequence is strictly greater than the stored one. That comparison is
//! atomic per backend, which is what makes exactly one of two racing
//! publishes win.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use opendal::Operator;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use zkv_core::{ConflictRecord, VaultError, VaultResult};
use zkv_crypto::encoding::base64_bytes;
use zkv_crypto::{SigningKeypair, SigningPublicKey};
use zkv_records::Sequence;

const SIGNATURE_DOMAIN: &[u8] = b"zkv-naming-v1\0";

/// A naming-layer entry as stored and transmitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRecord {
    /// Hex Ed25519 public key of the signer
    pub name: String,
    /// Encoded (sealed) metadata record
    #[serde(with = "base64_bytes")]
    pub value: Vec<u8>,
    pub sequence: Sequence,
    /// Unix seconds after which the record must have been re-asserted
    pub expires_at: u64,
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
}

impl SignedRecord {
    fn signing_payload(name: &str, value: &[u8], sequence: Sequence, expires_at: u64) -> Vec<u8> {
        let mut payload = Vec::with_capacity(SIGNATURE_DOMAIN.len() + name.len() + 17 + value.len());
        payload.extend_from_slice(SIGNATURE_DOMAIN);
        payload.extend_from_slice(name.as_bytes());
        payload.push(0);
        payload.extend_from_slice(&sequence.get().to_be_bytes());
        payload.extend_from_slice(&expires_at.to_be_bytes());
        payload.extend_from_slice(value);
        payload
    }

    pub fn sign(keypair: &SigningKeypair, value: Vec<u8>, sequence: Sequence, expires_at: u64) -> Self {
        let name = keypair.public().to_hex();
        let signature = keypair
            .sign(&Self::signing_payload(&name, &value, sequence, expires_at))
            .to_vec();
        Self {
            name,
            value,
            sequence,
            expires_at,
            signature,
        }
    }

    /// Check the signature against the key encoded in `name`.
    pub fn verify(&self) -> VaultResult<()> {
        let public = SigningPublicKey::from_hex(&self.name)
            .map_err(|_| VaultError::InvalidSignature(self.name.clone()))?;
        let payload = Self::signing_payload(&self.name, &self.value, self.sequence, self.expires_at);
        public.verify(&payload, &self.signature, &self.name)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    pub(crate) fn conflict(&self, expected: Sequence) -> VaultError {
        VaultError::PublishConflict(Box::new(ConflictRecord {
            name: self.name.clone(),
            sequence: self.sequence.get(),
            value: self.value.clone(),
            expected: expected.get(),
        }))
    }
}

/// The external mutable-pointer store.
#[async_trait]
pub trait NamingLayer: Send + Sync {
    /// Store `record` if it is validly signed and newer than what is stored.
    ///
    /// Fails with `PublishConflict` (carrying the stored record) when the
    /// stored sequence is not lower, `PublishUnavailable` on transient failure.
    async fn publish(&self, record: SignedRecord) -> VaultResult<()>;

    /// The stored record for `name`, if any. Expired records are still returned.
    async fn resolve(&self, name: &str) -> VaultResult<Option<SignedRecord>>;
}

fn check_newer(existing: Option<&SignedRecord>, record: &SignedRecord) -> VaultResult<()> {
    match existing {
        Some(current) if record.sequence <= current.sequence => {
            let expected = Sequence::new(record.sequence.get().saturating_sub(1))?;
            Err(current.conflict(expected))
        }
        _ => Ok(()),
    }
}

fn unavailable(reason: impl std::fmt::Display) -> VaultError {
    VaultError::PublishUnavailable {
        attempts: 1,
        reason: reason.to_string(),
    }
}

/// In-process naming layer. Authoritative and atomic; supports injecting
/// transient failures for tests and local development.
#[derive(Debug, Default)]
pub struct MemoryNamingLayer {
    records: Mutex<HashMap<String, SignedRecord>>,
    fail_next: AtomicU32,
}

impl MemoryNamingLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls fail with `PublishUnavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    fn injected_failure(&self) -> VaultResult<()> {
        let hit = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if hit {
            return Err(unavailable("injected naming-layer failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl NamingLayer for MemoryNamingLayer {
    async fn publish(&self, record: SignedRecord) -> VaultResult<()> {
        self.injected_failure()?;
        record.verify()?;

        let mut records = self.records.lock();
        check_newer(records.get(&record.name), &record)?;
        debug!(name = %record.name, sequence = %record.sequence, "memory naming layer: stored");
        records.insert(record.name.clone(), record);
        Ok(())
    }

    async fn resolve(&self, name: &str) -> VaultResult<Option<SignedRecord>> {
        self.injected_failure()?;
        Ok(self.records.lock().get(name).cloned())
    }
}

/// Naming layer stored as JSON objects in an opendal operator
/// (`{prefix}/names/{name}.json`).
///
/// The compare-and-store is serialized by a process-local lock, so it is
/// only authoritative for writers sharing this process.
pub struct ObjectStoreNamingLayer {
    op: Operator,
    prefix: String,
    lock: tokio::sync::Mutex<()>,
}

impl ObjectStoreNamingLayer {
    pub fn new(op: Operator, prefix: impl Into<String>) -> Self {
        Self {
            op,
            prefix: prefix.into().trim_end_matches('/').to_string(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn path(&self, name: &str) -> String {
        format!("{}/names/{}.json", self.prefix, name)
    }

    async fn read(&self, name: &str) -> VaultResult<Option<SignedRecord>> {
        match self.op.read(&self.path(name)).await {
            Ok(buf) => {
                let record: SignedRecord = serde_json::from_slice(&buf.to_vec())
                    .map_err(|e| VaultError::malformed("naming_record", e))?;
                Ok(Some(record))
            }
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(format!("reading {}: {e}", self.path(name)))),
        }
    }
}

#[async_trait]
impl NamingLayer for ObjectStoreNamingLayer {
    async fn publish(&self, record: SignedRecord) -> VaultResult<()> {
        record.verify()?;

        let _guard = self.lock.lock().await;
        let existing = self.read(&record.name).await?;
        check_newer(existing.as_ref(), &record)?;

        let path = self.path(&record.name);
        let json = serde_json::to_vec(&record).map_err(|e| VaultError::malformed("naming_record", e))?;
        self.op
            .write(&path, json)
            .await
            .map_err(|e| unavailable(format!("writing {path}: {e}")))?;
        debug!(name = %record.name, sequence = %record.sequence, "object store naming layer: stored");
        Ok(())
    }

    async fn resolve(&self, name: &str) -> VaultResult<Option<SignedRecord>> {
        self.read(name).await
    }
}
