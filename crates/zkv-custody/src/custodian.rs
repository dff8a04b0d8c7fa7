//! The custodian: holds epoch private keys and, for each enrollment,
//! briefly reconstructs the delegated signing key to re-sign and republish
//! the record.
//!
//! The signing key exists in the clear only inside [`Custodian::republish`]
//! and is dropped (zeroized) before it returns, on every path.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;
use zkv_core::{VaultError, VaultResult};
use zkv_crypto::{unwrap_signing_key, SigningKeypair, WrapSecretKey};
use zkv_sync::{PublishResult, SyncCoordinator};

use crate::enroll::Enrollment;
use crate::epoch::{CustodianEpoch, EpochId, EpochState, EpochTable};

#[async_trait]
pub trait CustodianService: Send + Sync {
    /// Re-sign and republish the record behind `enrollment` at the next sequence.
    async fn republish(&self, enrollment: &Enrollment) -> VaultResult<PublishResult>;

    /// Current state of the epoch an enrollment targets.
    fn epoch_state(&self, epoch_id: EpochId) -> VaultResult<EpochState>;

    /// Destroy private keys of expired epochs. Returns the retired ids.
    fn retire_expired(&self) -> Vec<EpochId>;
}

/// Epoch private keys, persisted as `{ "<epoch id>": "<hex secret>" }`.
#[derive(Default)]
pub struct CustodianKeys {
    keys: BTreeMap<EpochId, WrapSecretKey>,
}

#[derive(Serialize, Deserialize)]
struct StoredKeys(BTreeMap<EpochId, String>);

impl CustodianKeys {
    pub fn load(path: &Path) -> VaultResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = Zeroizing::new(
            std::fs::read_to_string(path)
                .with_context(|| format!("reading custodian keys: {}", path.display()))?,
        );
        let stored: StoredKeys = serde_json::from_str(&content)
            .with_context(|| format!("parsing custodian keys: {}", path.display()))?;

        let mut keys = BTreeMap::new();
        for (id, encoded) in stored.0 {
            let encoded = Zeroizing::new(encoded);
            let mut bytes = Zeroizing::new([0u8; 32]);
            hex::decode_to_slice(encoded.as_str(), &mut bytes[..])
                .map_err(|e| VaultError::Config(format!("custodian key for epoch {id}: {e}")))?;
            keys.insert(id, WrapSecretKey::from_bytes(*bytes));
        }
        Ok(Self { keys })
    }

    /// Write the key file atomically, readable only by the owner on Unix.
    pub fn save(&self, path: &Path) -> VaultResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating key dir: {}", parent.display()))?;
        }
        let stored = StoredKeys(
            self.keys
                .iter()
                .map(|(id, key)| (*id, hex::encode(&key.to_bytes()[..])))
                .collect(),
        );
        let json = Zeroizing::new(
            serde_json::to_string_pretty(&stored).context("serializing custodian keys")?,
        );
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json.as_bytes())
            .with_context(|| format!("writing custodian keys temp: {}", tmp.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .with_context(|| format!("restricting {}", tmp.display()))?;
        }

        std::fs::rename(&tmp, path)
            .with_context(|| format!("renaming custodian keys: {}", path.display()))?;
        Ok(())
    }

    pub fn insert(&mut self, id: EpochId, key: WrapSecretKey) {
        self.keys.insert(id, key);
    }

    pub fn get(&self, id: EpochId) -> Option<&WrapSecretKey> {
        self.keys.get(&id)
    }

    /// Drop (and thereby zeroize) the key for `id`.
    pub fn remove(&mut self, id: EpochId) -> bool {
        self.keys.remove(&id).is_some()
    }

    pub fn ids(&self) -> Vec<EpochId> {
        self.keys.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

pub struct Custodian {
    table: Arc<EpochTable>,
    keys: RwLock<CustodianKeys>,
    coordinator: Arc<SyncCoordinator>,
}

impl Custodian {
    pub fn new(table: Arc<EpochTable>, keys: CustodianKeys, coordinator: Arc<SyncCoordinator>) -> Self {
        let missing: Vec<EpochId> = table
            .epochs()
            .into_iter()
            .filter(|(e, state)| *state != EpochState::Expired && keys.get(e.id).is_none())
            .map(|(e, _)| e.id)
            .collect();
        if !missing.is_empty() {
            warn!(?missing, "custodian has no private key for live epochs");
        }
        Self {
            table,
            keys: RwLock::new(keys),
            coordinator,
        }
    }

    pub fn table(&self) -> &Arc<EpochTable> {
        &self.table
    }

    /// Generate a new epoch keypair, append it to the table and keep the
    /// private half.
    pub fn rotate(&self) -> CustodianEpoch {
        let secret = WrapSecretKey::generate();
        let epoch = self.table.rotate(secret.public());
        self.keys.write().insert(epoch.id, secret);
        epoch
    }

    pub fn save_keys(&self, path: &Path) -> VaultResult<()> {
        self.keys.read().save(path)
    }

    /// Recover the delegated signing key, enforcing the epoch window and
    /// the entity binding.
    fn open_enrollment(&self, enrollment: &Enrollment) -> VaultResult<SigningKeypair> {
        if self.table.state_of(enrollment.epoch_id)? == EpochState::Expired {
            return Err(VaultError::EpochExpired(enrollment.epoch_id));
        }

        let keys = self.keys.read();
        let secret = keys
            .get(enrollment.epoch_id)
            .ok_or(VaultError::EpochExpired(enrollment.epoch_id))?;
        if enrollment.envelope.recipient_public_key != secret.public() {
            return Err(VaultError::UnwrapFailed(format!(
                "enrollment is not addressed to epoch {}",
                enrollment.epoch_id
            )));
        }

        let keypair = unwrap_signing_key(&enrollment.envelope, secret)?;
        if keypair.public() != enrollment.entity {
            return Err(VaultError::UnwrapFailed(format!(
                "delegated key does not match entity {}",
                enrollment.entity.fingerprint()
            )));
        }
        Ok(keypair)
    }
}

#[async_trait]
impl CustodianService for Custodian {
    async fn republish(&self, enrollment: &Enrollment) -> VaultResult<PublishResult> {
        let name = enrollment.name();
        let current = self.coordinator.resolve(&name).await?;

        let keypair = self.open_enrollment(enrollment)?;
        let result = self
            .coordinator
            .publish(&keypair, current.record.value.clone(), current.sequence())
            .await;
        drop(keypair);

        let result = result?;
        debug!(entity = %enrollment.entity.fingerprint(), sequence = %result.sequence, "record re-signed");
        Ok(result)
    }

    fn epoch_state(&self, epoch_id: EpochId) -> VaultResult<EpochState> {
        self.table.state_of(epoch_id)
    }

    fn retire_expired(&self) -> Vec<EpochId> {
        let expired = self.table.expired_ids();
        let mut keys = self.keys.write();
        let retired: Vec<EpochId> = expired.into_iter().filter(|id| keys.remove(*id)).collect();
        if !retired.is_empty() {
            info!(?retired, "expired custodian epoch keys destroyed");
        }
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enroll::enroll;
    use zkv_core::config::{CustodyConfig, NamingConfig};
    use zkv_core::ManualClock;
    use zkv_records::Sequence;
    use zkv_sync::MemoryNamingLayer;

    const DAY: u64 = 24 * 3600;

    struct Fixture {
        clock: Arc<ManualClock>,
        coordinator: Arc<SyncCoordinator>,
        custodian: Custodian,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let table = Arc::new(EpochTable::new(&CustodyConfig::default(), clock.clone()));
        let coordinator = Arc::new(SyncCoordinator::new(
            Arc::new(MemoryNamingLayer::new()),
            &NamingConfig::default(),
            clock.clone(),
        ));
        let custodian = Custodian::new(table, CustodianKeys::default(), coordinator.clone());
        custodian.rotate();
        Fixture {
            clock,
            coordinator,
            custodian,
        }
    }

    #[tokio::test]
    async fn test_republish_extends_expiry() {
        let f = fixture();
        let keypair = SigningKeypair::generate();
        let first = f
            .coordinator
            .publish(&keypair, b"sealed record".to_vec(), Sequence::UNPUBLISHED)
            .await
            .unwrap();
        let enrollment = enroll(f.custodian.table(), &keypair).unwrap();

        f.clock.advance(3600);
        let result = f.custodian.republish(&enrollment).await.unwrap();
        assert_eq!(result.sequence.get(), 2);
        assert!(result.expires_at > first.expires_at);

        let resolved = f.coordinator.resolve(&enrollment.name()).await.unwrap();
        assert_eq!(resolved.value(), b"sealed record");
    }

    #[tokio::test]
    async fn test_republish_unpublished_entity_is_not_found() {
        let f = fixture();
        let enrollment = enroll(f.custodian.table(), &SigningKeypair::generate()).unwrap();
        assert!(matches!(
            f.custodian.republish(&enrollment).await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_mismatched_entity_rejected() {
        let f = fixture();
        let keypair = SigningKeypair::generate();
        f.coordinator
            .publish(&keypair, b"v".to_vec(), Sequence::UNPUBLISHED)
            .await
            .unwrap();

        // Envelope for one key, claimed for another entity.
        let mut enrollment = enroll(f.custodian.table(), &SigningKeypair::generate()).unwrap();
        enrollment.entity = keypair.public();
        assert!(matches!(
            f.custodian.republish(&enrollment).await,
            Err(VaultError::UnwrapFailed(_))
        ));
    }

    #[test]
    fn test_retire_expired_destroys_keys() {
        let f = fixture();
        f.clock.advance(DAY);
        f.custodian.rotate();
        assert!(f.custodian.retire_expired().is_empty());

        f.clock.advance(CustodyConfig::default().grace_period_secs);
        assert_eq!(f.custodian.retire_expired(), vec![1]);
        assert_eq!(f.custodian.keys.read().ids(), vec![2]);
    }

    #[test]
    fn test_keys_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.json");

        let mut keys = CustodianKeys::default();
        let secret = WrapSecretKey::generate();
        keys.insert(1, secret.clone());
        keys.save(&path).unwrap();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        let loaded = CustodianKeys::load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get(1).unwrap().public(), secret.public());
        assert!(CustodianKeys::load(&dir.path().join("none.json")).unwrap().is_empty());
    }
}
