//! Key derivation: Argon2id passphrase → symmetric key

use argon2::{Algorithm, Argon2, Params, Version};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;
use zkv_core::config::RecoveryConfig;
use zkv_core::{VaultError, VaultResult};

use crate::keys::SymmetricKey;
use crate::KEY_SIZE;

/// Argon2id parameters. Stored alongside anything sealed under a stretched key
/// so the same key can be re-derived after the defaults change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub mem_cost_kib: u32,
    /// Time cost / iterations
    pub time_cost: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::from(&RecoveryConfig::default())
    }
}

impl From<&RecoveryConfig> for KdfParams {
    fn from(config: &RecoveryConfig) -> Self {
        Self {
            mem_cost_kib: config.argon2_mem_cost_kib,
            time_cost: config.argon2_time_cost,
            parallelism: config.argon2_parallelism,
        }
    }
}

/// Stretch a passphrase into a 256-bit key with Argon2id.
pub fn stretch_passphrase(
    passphrase: &SecretString,
    salt: &[u8; 16],
    params: &KdfParams,
) -> VaultResult<SymmetricKey> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| VaultError::Config(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut output = [0u8; KEY_SIZE];
    let result = argon2.hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut output);
    if let Err(e) = result {
        output.zeroize();
        return Err(VaultError::Other(anyhow::anyhow!("Argon2id derivation failed: {e}")));
    }

    Ok(SymmetricKey::from_bytes(output))
}
