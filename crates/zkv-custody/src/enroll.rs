//! Owner side of custodial delegation: wrap a record-signing key to the
//! custodian's active epoch key.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zkv_core::{VaultError, VaultResult};
use zkv_crypto::{wrap_signing_key, SigningKeypair, SigningPublicKey, WrappedKeyEnvelope};

use crate::epoch::{EpochId, EpochState, EpochTable};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    /// Public half of the delegated signing key; also the record's name
    pub entity: SigningPublicKey,
    pub epoch_id: EpochId,
    pub envelope: WrappedKeyEnvelope,
    pub enrolled_at: u64,
}

impl Enrollment {
    /// Naming-layer name of the delegated record.
    pub fn name(&self) -> String {
        self.entity.to_hex()
    }
}

/// Delegate `keypair` to the custodian's active epoch.
pub fn enroll(table: &EpochTable, keypair: &SigningKeypair) -> VaultResult<Enrollment> {
    let epoch = table.active()?;
    let envelope = wrap_signing_key(keypair, &epoch.public_key)?;
    let enrollment = Enrollment {
        entity: keypair.public(),
        epoch_id: epoch.id,
        envelope,
        enrolled_at: table.clock().now(),
    };
    info!(entity = %enrollment.entity.fingerprint(), epoch = epoch.id, "signing key enrolled");
    Ok(enrollment)
}

/// Re-wrap an existing enrollment under the current active epoch.
///
/// The owner re-derives the signing key; the old envelope is never opened.
pub fn rewrap(
    table: &EpochTable,
    keypair: &SigningKeypair,
    previous: &Enrollment,
) -> VaultResult<Enrollment> {
    if keypair.public() != previous.entity {
        return Err(VaultError::Unauthorized(format!(
            "signing key does not match enrolled entity {}",
            previous.entity.fingerprint()
        )));
    }
    let enrollment = enroll(table, keypair)?;
    debug!(from = previous.epoch_id, to = enrollment.epoch_id, "enrollment re-wrapped");
    Ok(enrollment)
}

/// Whether `enrollment` targets an epoch that has been superseded.
pub fn needs_rewrap(table: &EpochTable, enrollment: &Enrollment) -> VaultResult<bool> {
    Ok(table.state_of(enrollment.epoch_id)? != EpochState::Active)
}

fn enrollment_path(dir: &Path, entity: &SigningPublicKey) -> std::path::PathBuf {
    dir.join(format!("{}.json", entity.to_hex()))
}

/// Persist one enrollment as `<dir>/<entity>.json`, replacing any previous one.
pub fn save_enrollment(dir: &Path, enrollment: &Enrollment) -> VaultResult<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating enrollments dir: {}", dir.display()))?;
    let path = enrollment_path(dir, &enrollment.entity);
    let json = serde_json::to_string_pretty(enrollment).context("serializing enrollment")?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, &path).with_context(|| format!("renaming {}", path.display()))?;
    Ok(())
}

/// Load every enrollment in `dir`. Unparseable files are skipped with a warning.
pub fn load_enrollments(dir: &Path) -> VaultResult<Vec<Enrollment>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut enrollments = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        match serde_json::from_str::<Enrollment>(&content) {
            Ok(enrollment) => enrollments.push(enrollment),
            Err(e) => warn!(path = %path.display(), "skipping unreadable enrollment: {e}"),
        }
    }
    enrollments.sort_by_key(|e| e.entity.to_hex());
    Ok(enrollments)
}
