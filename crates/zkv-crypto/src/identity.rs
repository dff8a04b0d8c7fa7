//! Ed25519 identity and record-signing keys, and their X25519 wrap halves
//!
//! One Ed25519 keypair both signs and receives wrapped keys: the public key is
//! converted Edwards → Montgomery for X25519, the private key's clamped scalar
//! becomes the X25519 static secret.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;
use zkv_core::{VaultError, VaultResult};

use crate::KEY_SIZE;

pub const SIGNATURE_SIZE: usize = 64;

/// Ed25519 verifying key. Serialized as lowercase hex; doubles as the
/// naming-layer name of the entity it signs for.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SigningPublicKey(VerifyingKey);

impl SigningPublicKey {
    pub fn from_bytes(bytes: &[u8; KEY_SIZE]) -> VaultResult<Self> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| VaultError::Other(anyhow::anyhow!("invalid signing public key: {e}")))
    }

    pub fn from_hex(s: &str) -> VaultResult<Self> {
        let mut bytes = [0u8; KEY_SIZE];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| VaultError::Other(anyhow::anyhow!("invalid public key hex: {e}")))?;
        Self::from_bytes(&bytes)
    }

    pub fn to_bytes(&self) -> [u8; KEY_SIZE] {
        self.0.to_bytes()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Verify an Ed25519 signature. `name` only labels the error.
    pub fn verify(&self, msg: &[u8], signature: &[u8], name: &str) -> VaultResult<()> {
        let signature = Signature::from_slice(signature)
            .map_err(|_| VaultError::InvalidSignature(name.to_string()))?;
        self.0
            .verify(msg, &signature)
            .map_err(|_| VaultError::InvalidSignature(name.to_string()))
    }

    /// X25519 public key for wrapping keys to this identity.
    pub fn to_wrap_public(&self) -> WrapPublicKey {
        WrapPublicKey(self.0.to_montgomery().to_bytes())
    }

    /// Short BLAKE3 fingerprint for log lines.
    pub fn fingerprint(&self) -> String {
        let hash = blake3::hash(self.0.as_bytes());
        format!("blake3:{}", &hash.to_hex()[..16])
    }
}

impl std::fmt::Debug for SigningPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningPublicKey({})", self.to_hex())
    }
}

impl std::fmt::Display for SigningPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for SigningPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SigningPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Ed25519 signing keypair. The inner key zeroizes on drop.
pub struct SigningKeypair {
    signing: SigningKey,
}

impl SigningKeypair {
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; KEY_SIZE]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Rebuild a keypair from a decrypted seed buffer.
    pub fn from_seed_slice(seed: &[u8]) -> VaultResult<Self> {
        let seed: Zeroizing<[u8; KEY_SIZE]> = Zeroizing::new(seed.try_into().map_err(|_| {
            VaultError::UnwrapFailed(format!(
                "signing seed has wrong size: {} bytes (expected {KEY_SIZE})",
                seed.len()
            ))
        })?);
        Ok(Self::from_seed(&seed))
    }

    pub fn public(&self) -> SigningPublicKey {
        SigningPublicKey(self.signing.verifying_key())
    }

    pub fn seed(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.signing.to_bytes())
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(msg).to_bytes()
    }

    /// X25519 secret matching [`SigningPublicKey::to_wrap_public`].
    pub fn to_wrap_secret(&self) -> WrapSecretKey {
        WrapSecretKey(StaticSecret::from(self.signing.to_scalar_bytes()))
    }
}

impl Clone for SigningKeypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.seed())
    }
}

impl std::fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeypair")
            .field("public", &self.public().to_hex())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// The user's identity keypair, handed to the core in memory at login.
///
/// All vault-level keys are wrapped to its X25519 half; record-signing keys
/// are derived from its seed.
#[derive(Clone, Debug)]
pub struct IdentityKeypair {
    keypair: SigningKeypair,
}

impl IdentityKeypair {
    pub fn generate() -> Self {
        Self {
            keypair: SigningKeypair::generate(),
        }
    }

    pub fn from_seed(seed: &[u8; KEY_SIZE]) -> Self {
        Self {
            keypair: SigningKeypair::from_seed(seed),
        }
    }

    pub fn from_seed_slice(seed: &[u8]) -> VaultResult<Self> {
        SigningKeypair::from_seed_slice(seed).map(|keypair| Self { keypair })
    }

    pub fn public(&self) -> SigningPublicKey {
        self.keypair.public()
    }

    pub fn wrap_public(&self) -> WrapPublicKey {
        self.keypair.public().to_wrap_public()
    }

    pub fn wrap_secret(&self) -> WrapSecretKey {
        self.keypair.to_wrap_secret()
    }

    pub fn seed(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        self.keypair.seed()
    }

    pub fn sign(&self, msg: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.keypair.sign(msg)
    }
}

/// X25519 public key that wrapped-key envelopes are addressed to.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WrapPublicKey(pub [u8; KEY_SIZE]);

impl WrapPublicKey {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> VaultResult<Self> {
        let mut bytes = [0u8; KEY_SIZE];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|e| VaultError::Other(anyhow::anyhow!("invalid wrap key hex: {e}")))?;
        Ok(Self(bytes))
    }

    pub(crate) fn to_x25519(self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }
}

impl std::fmt::Debug for WrapPublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WrapPublicKey({})", self.to_hex())
    }
}

impl Serialize for WrapPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for WrapPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// X25519 static secret (custodian epoch keys, device ephemeral keys,
/// identity wrap half). Zeroized on drop.
#[derive(Clone)]
pub struct WrapSecretKey(StaticSecret);

impl WrapSecretKey {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    pub fn to_bytes(&self) -> Zeroizing<[u8; KEY_SIZE]> {
        Zeroizing::new(self.0.to_bytes())
    }

    pub fn public(&self) -> WrapPublicKey {
        WrapPublicKey(X25519PublicKey::from(&self.0).to_bytes())
    }

    pub(crate) fn as_static(&self) -> &StaticSecret {
        &self.0
    }
}

impl std::fmt::Debug for WrapSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrapSecretKey")
            .field("public", &self.public().to_hex())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let keypair = SigningKeypair::generate();
        let sig = keypair.sign(b"record bytes");
        keypair.public().verify(b"record bytes", &sig, "n").unwrap();

        let err = keypair.public().verify(b"other bytes", &sig, "n");
        assert!(matches!(err, Err(VaultError::InvalidSignature(_))));
    }

    #[test]
    fn test_verify_rejects_short_signature() {
        let keypair = SigningKeypair::generate();
        assert!(keypair.public().verify(b"m", &[0u8; 10], "n").is_err());
    }

    #[test]
    fn test_from_seed_deterministic() {
        let a = SigningKeypair::from_seed(&[3u8; 32]);
        let b = SigningKeypair::from_seed(&[3u8; 32]);
        assert_eq!(a.public(), b.public());
        assert_eq!(*a.seed(), [3u8; 32]);
    }

    #[test]
    fn test_wrap_halves_agree() {
        // The converted public key must match the public half of the converted secret.
        let identity = IdentityKeypair::generate();
        assert_eq!(identity.wrap_public(), identity.wrap_secret().public());
    }

    #[test]
    fn test_public_key_hex_roundtrip() {
        let public = SigningKeypair::generate().public();
        let parsed = SigningPublicKey::from_hex(&public.to_hex()).unwrap();
        assert_eq!(public, parsed);

        let json = serde_json::to_string(&public).unwrap();
        assert_eq!(json, format!("\"{}\"", public.to_hex()));
    }

    #[test]
    fn test_from_seed_slice_wrong_length() {
        assert!(matches!(
            SigningKeypair::from_seed_slice(&[1u8; 31]),
            Err(VaultError::UnwrapFailed(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let keypair = SigningKeypair::from_seed(&[9u8; 32]);
        let debug = format!("{keypair:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&hex::encode([9u8; 32])));
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = SigningKeypair::generate().public().fingerprint();
        assert!(fp.starts_with("blake3:"));
        assert_eq!(fp.len(), "blake3:".len() + 16);
    }
}
