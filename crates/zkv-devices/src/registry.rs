//! Durable, encrypted device registry.
//!
//! Published through the sync coordinator like any other record, sealed
//! under a subkey of the vault root key. Status transitions are enforced
//! here, not by callers:
//!
//! ```text
//! (absent) ──▶ Pending ──▶ Authorized ──▶ Revoked
//!     └────────────────────────▲
//! ```
//!
//! `Revoked` is terminal. Only the vault owner, acting from an authorized
//! device, may revoke.

use std::sync::Arc;

use tracing::{info, warn};
use zkv_core::{DeviceId, EntityId, VaultError, VaultResult};
use zkv_crypto::{
    IdentityKeypair, KeyHierarchy, RecordScope, SigningKeypair, SigningPublicKey, SymmetricKey,
    VaultHeader, WrapPublicKey,
};
use zkv_records::{
    decode_record, encode_record, DeviceRecord, DeviceRegistryRecord, DeviceStatus, Sequence,
};
use zkv_sync::SyncCoordinator;

/// HKDF domain of the registry's symmetric key under the vault root key.
pub const REGISTRY_KEY_DOMAIN: &str = "zkv-device-registry";

/// Conflict retries when re-applying a registry change on top of a newer one.
const MAX_CONFLICT_RETRIES: u32 = 3;

/// Descriptive data a device supplies about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub name: String,
    pub platform: String,
    pub public_key: WrapPublicKey,
}

fn find<'a>(record: &'a DeviceRegistryRecord, id: &DeviceId) -> Option<&'a DeviceRecord> {
    record.devices.iter().find(|d| &d.device_id == id)
}

fn find_mut<'a>(record: &'a mut DeviceRegistryRecord, id: &DeviceId) -> Option<&'a mut DeviceRecord> {
    record.devices.iter_mut().find(|d| &d.device_id == id)
}

pub fn status_of(record: &DeviceRegistryRecord, id: &DeviceId) -> Option<DeviceStatus> {
    find(record, id).map(|d| d.status)
}

pub fn is_authorized(record: &DeviceRegistryRecord, id: &DeviceId) -> bool {
    status_of(record, id) == Some(DeviceStatus::Authorized)
}

/// Register a device as pending. Registering an already-known device fails.
pub fn register_pending(record: &mut DeviceRegistryRecord, device: DeviceInfo, now: u64) -> VaultResult<()> {
    if let Some(existing) = find(record, &device.device_id) {
        return Err(VaultError::InvalidTransition(format!(
            "device {} is already {}",
            device.device_id, existing.status
        )));
    }
    record.devices.push(DeviceRecord {
        device_id: device.device_id,
        name: device.name,
        platform: device.platform,
        public_key: device.public_key,
        status: DeviceStatus::Pending,
        registered_at: now,
        authorized_at: None,
        authorized_by: None,
        revoked_at: None,
    });
    record.updated_at = now;
    Ok(())
}

/// Pending (or absent) → Authorized. Happens exactly once per device.
pub fn authorize(
    record: &mut DeviceRegistryRecord,
    device: DeviceInfo,
    authorized_by: Option<DeviceId>,
    now: u64,
) -> VaultResult<()> {
    if find(record, &device.device_id).is_none() {
        register_pending(record, device.clone(), now)?;
    }
    let entry = find_mut(record, &device.device_id)
        .ok_or_else(|| VaultError::NotFound(format!("device {}", device.device_id)))?;
    if entry.status != DeviceStatus::Pending {
        return Err(VaultError::InvalidTransition(format!(
            "device {} is {}, cannot authorize",
            device.device_id, entry.status
        )));
    }
    entry.status = DeviceStatus::Authorized;
    entry.public_key = device.public_key;
    entry.authorized_at = Some(now);
    entry.authorized_by = authorized_by;
    record.updated_at = now;
    Ok(())
}

/// Authorized → Revoked, by the vault owner from an authorized device.
pub fn revoke(
    record: &mut DeviceRegistryRecord,
    target: &DeviceId,
    revoker: &DeviceId,
    owner: &SigningPublicKey,
    now: u64,
) -> VaultResult<()> {
    if owner != &record.owner {
        return Err(VaultError::Unauthorized("only the vault owner may revoke devices".into()));
    }
    if !is_authorized(record, revoker) {
        return Err(VaultError::Unauthorized(format!(
            "device {revoker} is not authorized"
        )));
    }
    let entry = find_mut(record, target)
        .ok_or_else(|| VaultError::NotFound(format!("device {target}")))?;
    if entry.status != DeviceStatus::Authorized {
        return Err(VaultError::InvalidTransition(format!(
            "device {target} is {}, cannot revoke",
            entry.status
        )));
    }
    entry.status = DeviceStatus::Revoked;
    entry.revoked_at = Some(now);
    record.updated_at = now;
    Ok(())
}

/// The vault's device registry as published on the naming layer.
pub struct DeviceRegistry {
    vault_id: EntityId,
    owner: SigningPublicKey,
    key: SymmetricKey,
    signing: SigningKeypair,
    coordinator: Arc<SyncCoordinator>,
}

impl DeviceRegistry {
    pub fn new(
        keys: &KeyHierarchy,
        header: &VaultHeader,
        coordinator: Arc<SyncCoordinator>,
    ) -> VaultResult<Self> {
        Ok(Self {
            vault_id: header.vault_id,
            owner: header.owner,
            key: keys.derive_subkey(REGISTRY_KEY_DOMAIN)?,
            signing: keys.signing_keypair(&RecordScope::DeviceRegistry)?,
            coordinator,
        })
    }

    pub fn name(&self) -> String {
        self.signing.public().to_hex()
    }

    /// Current registry and its sequence; an unpublished registry is empty.
    pub async fn load(&self) -> VaultResult<(DeviceRegistryRecord, Sequence)> {
        match self.coordinator.resolve(&self.name()).await {
            Ok(resolved) => {
                let record = decode_record(resolved.value(), &self.key, &self.vault_id)?;
                Ok((record, resolved.sequence()))
            }
            Err(VaultError::NotFound(_)) => Ok((
                DeviceRegistryRecord {
                    vault_id: self.vault_id,
                    owner: self.owner,
                    devices: Vec::new(),
                    updated_at: self.coordinator.clock().now(),
                },
                Sequence::UNPUBLISHED,
            )),
            Err(e) => Err(e),
        }
    }

    /// Apply `change` to the latest registry and publish it, re-applying on
    /// top of a concurrent writer's version if the publish conflicts.
    pub async fn update<F>(&self, mut change: F) -> VaultResult<DeviceRegistryRecord>
    where
        F: FnMut(&mut DeviceRegistryRecord, u64) -> VaultResult<()>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let (mut record, sequence) = self.load().await?;
            change(&mut record, self.coordinator.clock().now())?;
            let encoded = encode_record(&record, &self.key)?;

            match self.coordinator.publish(&self.signing, encoded, sequence).await {
                Ok(result) => {
                    info!(vault = %self.vault_id, sequence = %result.sequence, devices = record.devices.len(), "device registry published");
                    return Ok(record);
                }
                Err(VaultError::PublishConflict(conflict)) if attempt < MAX_CONFLICT_RETRIES => {
                    warn!(vault = %self.vault_id, found = conflict.sequence, attempt, "device registry changed concurrently, re-applying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn status(&self, device: &DeviceId) -> VaultResult<Option<DeviceStatus>> {
        let (record, _) = self.load().await?;
        Ok(status_of(&record, device))
    }

    pub async fn register_pending(&self, device: DeviceInfo) -> VaultResult<DeviceRegistryRecord> {
        self.update(|record, now| register_pending(record, device.clone(), now))
            .await
    }

    pub async fn authorize(
        &self,
        device: DeviceInfo,
        authorized_by: Option<DeviceId>,
    ) -> VaultResult<DeviceRegistryRecord> {
        self.update(|record, now| authorize(record, device.clone(), authorized_by.clone(), now))
            .await
    }

    /// Revoke `target`. `identity` must be the vault owner's.
    ///
    /// Secrets already transferred to the device stay valid; pair this with
    /// rotating any long-lived key it could reconstruct.
    pub async fn revoke(
        &self,
        target: &DeviceId,
        revoker: &DeviceId,
        identity: &IdentityKeypair,
    ) -> VaultResult<DeviceRegistryRecord> {
        let owner = identity.public();
        self.update(|record, now| revoke(record, target, revoker, &owner, now))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zkv_crypto::WrapSecretKey;

    fn info(id: &str) -> DeviceInfo {
        DeviceInfo {
            device_id: DeviceId::from(id),
            name: format!("{id} device"),
            platform: "linux".into(),
            public_key: WrapSecretKey::generate().public(),
        }
    }

    fn empty(owner: &IdentityKeypair) -> DeviceRegistryRecord {
        DeviceRegistryRecord {
            vault_id: EntityId::new(),
            owner: owner.public(),
            devices: Vec::new(),
            updated_at: 0,
        }
    }

    #[test]
    fn test_authorize_once() {
        let owner = IdentityKeypair::generate();
        let mut record = empty(&owner);
        authorize(&mut record, info("laptop"), None, 10).unwrap();
        assert!(is_authorized(&record, &DeviceId::from("laptop")));
        assert_eq!(record.updated_at, 10);

        assert!(matches!(
            authorize(&mut record, info("laptop"), None, 11),
            Err(VaultError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_pending_then_authorized() {
        let owner = IdentityKeypair::generate();
        let mut record = empty(&owner);
        register_pending(&mut record, info("phone"), 1).unwrap();
        assert_eq!(status_of(&record, &DeviceId::from("phone")), Some(DeviceStatus::Pending));

        authorize(&mut record, info("phone"), Some(DeviceId::from("laptop")), 2).unwrap();
        let phone = find(&record, &DeviceId::from("phone")).unwrap();
        assert_eq!(phone.registered_at, 1);
        assert_eq!(phone.authorized_at, Some(2));
        assert_eq!(phone.authorized_by, Some(DeviceId::from("laptop")));
    }

    #[test]
    fn test_revoke_is_terminal_and_owner_only() {
        let owner = IdentityKeypair::generate();
        let mut record = empty(&owner);
        authorize(&mut record, info("laptop"), None, 1).unwrap();
        authorize(&mut record, info("phone"), None, 2).unwrap();
        let laptop = DeviceId::from("laptop");
        let phone = DeviceId::from("phone");

        let stranger = IdentityKeypair::generate();
        assert!(matches!(
            revoke(&mut record, &phone, &laptop, &stranger.public(), 3),
            Err(VaultError::Unauthorized(_))
        ));

        revoke(&mut record, &phone, &laptop, &owner.public(), 3).unwrap();
        assert_eq!(status_of(&record, &phone), Some(DeviceStatus::Revoked));

        // Terminal: no second revoke, no re-authorization, and a revoked
        // device cannot revoke others.
        assert!(revoke(&mut record, &phone, &laptop, &owner.public(), 4).is_err());
        assert!(authorize(&mut record, info("phone"), None, 4).is_err());
        assert!(matches!(
            revoke(&mut record, &laptop, &phone, &owner.public(), 4),
            Err(VaultError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_pending_cannot_be_revoked() {
        let owner = IdentityKeypair::generate();
        let mut record = empty(&owner);
        authorize(&mut record, info("laptop"), None, 1).unwrap();
        register_pending(&mut record, info("phone"), 2).unwrap();
        assert!(matches!(
            revoke(&mut record, &DeviceId::from("phone"), &DeviceId::from("laptop"), &owner.public(), 3),
            Err(VaultError::InvalidTransition(_))
        ));
    }
}
