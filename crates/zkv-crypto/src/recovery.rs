//! BIP-39 recovery phrase and recovery kit
//!
//! At vault initialization a 24-word phrase is generated and shown once. The
//! phrase is stretched into a recovery factor; the identity seed sealed under
//! that factor is the recovery kit, which can be stored alongside the vault
//! header. Losing every device then still leaves a path back to the identity.

use bip39::Mnemonic;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;
use zkv_core::{VaultError, VaultResult};

use crate::aead;
use crate::identity::{IdentityKeypair, SigningPublicKey};
use crate::kdf::{stretch_passphrase, KdfParams};
use crate::keys::SymmetricKey;

const RECOVERY_SALT: [u8; 16] = *b"zkv-recovery-v01";
const RECOVERY_AAD: &[u8] = b"zkv-recovery-kit-v1";

/// Generate a fresh 24-word BIP-39 phrase (256 bits of entropy).
pub fn generate_recovery_phrase() -> VaultResult<SecretString> {
    let mut entropy = Zeroizing::new([0u8; 32]);
    rand::thread_rng().fill_bytes(entropy.as_mut_slice());

    let mnemonic = Mnemonic::from_entropy(entropy.as_slice())
        .map_err(|e| VaultError::Other(anyhow::anyhow!("BIP-39 phrase generation failed: {e}")))?;
    Ok(SecretString::from(mnemonic.to_string()))
}

/// Stretch a recovery phrase into the recovery factor.
///
/// The salt is fixed: the phrase itself carries 256 bits of entropy.
pub fn phrase_to_factor(phrase: &SecretString, params: &KdfParams) -> VaultResult<SymmetricKey> {
    let _mnemonic: Mnemonic = phrase
        .expose_secret()
        .parse()
        .map_err(|e| VaultError::UnwrapFailed(format!("invalid recovery phrase: {e}")))?;

    stretch_passphrase(phrase, &RECOVERY_SALT, params)
}

/// Identity seed sealed under the recovery factor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryKit {
    pub identity_public_key: SigningPublicKey,
    pub kdf: KdfParams,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub sealed_seed: Vec<u8>,
}

impl RecoveryKit {
    /// Create a kit for `identity`. Returns the phrase to show the user once.
    pub fn create(identity: &IdentityKeypair, params: &KdfParams) -> VaultResult<(SecretString, Self)> {
        let phrase = generate_recovery_phrase()?;
        let factor = phrase_to_factor(&phrase, params)?;
        let sealed_seed = aead::seal(&factor, identity.seed().as_slice(), RECOVERY_AAD)?;

        Ok((
            phrase,
            Self {
                identity_public_key: identity.public(),
                kdf: params.clone(),
                sealed_seed,
            },
        ))
    }

    /// Rebuild the identity from the phrase. A wrong phrase is `UnwrapFailed`.
    pub fn recover(&self, phrase: &SecretString) -> VaultResult<IdentityKeypair> {
        let factor = phrase_to_factor(phrase, &self.kdf)?;
        let seed = aead::open(&factor, &self.sealed_seed, RECOVERY_AAD)
            .map_err(|_| VaultError::UnwrapFailed("recovery phrase does not open this kit".into()))?;
        let identity = IdentityKeypair::from_seed_slice(&seed)?;

        if identity.public() != self.identity_public_key {
            return Err(VaultError::UnwrapFailed(
                "recovered identity does not match the kit".into(),
            ));
        }
        Ok(identity)
    }
}
