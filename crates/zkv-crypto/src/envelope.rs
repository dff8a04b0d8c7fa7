//! Wrapped Key Envelope: hybrid X25519 + XChaCha20-Poly1305 key wrapping
//!
//! The only form in which a key crosses a trust boundary (identity, custodian
//! epoch, device ephemeral key).
//!
//! 1. Generate an ephemeral X25519 secret
//! 2. ECDH with the recipient's X25519 public key
//! 3. HKDF-SHA256(ikm = shared, salt = ephemeral ‖ recipient,
//!    info = "zkv-wrap-v1:<kind>") → 32-byte key ‖ 24-byte nonce
//! 4. XChaCha20-Poly1305 over the 32-byte secret with
//!    AAD = recipient ‖ ephemeral ‖ kind

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    Key, XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::SharedSecret;
use zeroize::{Zeroize, Zeroizing};
use zkv_core::{VaultError, VaultResult};

use crate::identity::{SigningKeypair, WrapPublicKey, WrapSecretKey};
use crate::keys::SymmetricKey;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

const WRAP_INFO_PREFIX: &str = "zkv-wrap-v1:";

/// What the wrapped 32 bytes are. Bound into the AAD so an envelope cannot be
/// unwrapped as a different kind of key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Symmetric,
    SigningSeed,
    Factor,
}

impl KeyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Symmetric => "symmetric",
            KeyKind::SigningSeed => "signing_seed",
            KeyKind::Factor => "factor",
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedKeyEnvelope {
    pub recipient_public_key: WrapPublicKey,
    pub ephemeral_public_key: WrapPublicKey,
    pub kind: KeyKind,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "crate::encoding::base64_bytes")]
    pub tag: Vec<u8>,
}

fn derive_wrapping_cipher(
    shared: &SharedSecret,
    ephemeral: &WrapPublicKey,
    recipient: &WrapPublicKey,
    kind: KeyKind,
) -> VaultResult<(XChaCha20Poly1305, Zeroizing<[u8; NONCE_SIZE]>)> {
    if !shared.was_contributory() {
        return Err(VaultError::UnwrapFailed(
            "non-contributory key exchange (low-order public key)".into(),
        ));
    }

    let mut salt = [0u8; 2 * KEY_SIZE];
    salt[..KEY_SIZE].copy_from_slice(ephemeral.as_bytes());
    salt[KEY_SIZE..].copy_from_slice(recipient.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
    let mut okm = Zeroizing::new([0u8; KEY_SIZE + NONCE_SIZE]);
    let info = format!("{WRAP_INFO_PREFIX}{kind}");
    hkdf.expand(info.as_bytes(), &mut okm[..])
        .map_err(|e| VaultError::Other(anyhow::anyhow!("HKDF expand failed: {e}")))?;

    let cipher = XChaCha20Poly1305::new(Key::from_slice(&okm[..KEY_SIZE]));
    let mut nonce = Zeroizing::new([0u8; NONCE_SIZE]);
    nonce.copy_from_slice(&okm[KEY_SIZE..]);
    Ok((cipher, nonce))
}

fn envelope_aad(recipient: &WrapPublicKey, ephemeral: &WrapPublicKey, kind: KeyKind) -> Vec<u8> {
    let mut aad = Vec::with_capacity(2 * KEY_SIZE + 16);
    aad.extend_from_slice(recipient.as_bytes());
    aad.extend_from_slice(ephemeral.as_bytes());
    aad.extend_from_slice(kind.as_str().as_bytes());
    aad
}

/// Wrap 32 bytes of key material to `recipient`.
pub fn wrap_key(
    secret: &[u8; KEY_SIZE],
    kind: KeyKind,
    recipient: &WrapPublicKey,
) -> VaultResult<WrappedKeyEnvelope> {
    let ephemeral_secret = WrapSecretKey::generate();
    let ephemeral_public = ephemeral_secret.public();
    let shared = ephemeral_secret
        .as_static()
        .diffie_hellman(&recipient.to_x25519());

    let (cipher, nonce) = derive_wrapping_cipher(&shared, &ephemeral_public, recipient, kind)
        .map_err(|e| match e {
            VaultError::UnwrapFailed(reason) => {
                VaultError::Other(anyhow::anyhow!("key wrapping failed: {reason}"))
            }
            other => other,
        })?;

    let aad = envelope_aad(recipient, &ephemeral_public, kind);
    let mut sealed = cipher
        .encrypt(
            XNonce::from_slice(&nonce[..]),
            Payload {
                msg: secret,
                aad: &aad,
            },
        )
        .map_err(|e| VaultError::Other(anyhow::anyhow!("key wrapping failed: {e}")))?;

    let tag = sealed.split_off(sealed.len() - TAG_SIZE);
    Ok(WrappedKeyEnvelope {
        recipient_public_key: *recipient,
        ephemeral_public_key: ephemeral_public,
        kind,
        ciphertext: sealed,
        tag,
    })
}

/// Unwrap an envelope with the recipient's secret.
///
/// Fails with `UnwrapFailed` if the envelope is addressed elsewhere, is not
/// of the expected kind, is malformed, or fails authentication. Never returns
/// partial key material.
pub fn unwrap_key(
    envelope: &WrappedKeyEnvelope,
    recipient_secret: &WrapSecretKey,
    expected: KeyKind,
) -> VaultResult<Zeroizing<[u8; KEY_SIZE]>> {
    if envelope.kind != expected {
        return Err(VaultError::UnwrapFailed(format!(
            "envelope holds a {} key, expected {}",
            envelope.kind, expected
        )));
    }
    if recipient_secret.public() != envelope.recipient_public_key {
        return Err(VaultError::UnwrapFailed(
            "envelope is addressed to a different recipient".into(),
        ));
    }
    if envelope.tag.len() != TAG_SIZE {
        return Err(VaultError::UnwrapFailed(format!(
            "malformed envelope: tag is {} bytes (expected {TAG_SIZE})",
            envelope.tag.len()
        )));
    }

    let shared = recipient_secret
        .as_static()
        .diffie_hellman(&envelope.ephemeral_public_key.to_x25519());
    let (cipher, nonce) = derive_wrapping_cipher(
        &shared,
        &envelope.ephemeral_public_key,
        &envelope.recipient_public_key,
        envelope.kind,
    )?;

    let mut sealed = Vec::with_capacity(envelope.ciphertext.len() + TAG_SIZE);
    sealed.extend_from_slice(&envelope.ciphertext);
    sealed.extend_from_slice(&envelope.tag);

    let aad = envelope_aad(
        &envelope.recipient_public_key,
        &envelope.ephemeral_public_key,
        envelope.kind,
    );
    let mut plaintext = cipher
        .decrypt(
            XNonce::from_slice(&nonce[..]),
            Payload {
                msg: &sealed,
                aad: &aad,
            },
        )
        .map_err(|_| VaultError::UnwrapFailed("authentication tag mismatch".into()))?;

    if plaintext.len() != KEY_SIZE {
        plaintext.zeroize();
        return Err(VaultError::UnwrapFailed(format!(
            "unwrapped key has wrong size (expected {KEY_SIZE})"
        )));
    }

    let mut out = Zeroizing::new([0u8; KEY_SIZE]);
    out.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(out)
}

pub fn wrap_symmetric(key: &SymmetricKey, recipient: &WrapPublicKey) -> VaultResult<WrappedKeyEnvelope> {
    wrap_key(key.as_bytes(), KeyKind::Symmetric, recipient)
}

pub fn unwrap_symmetric(
    envelope: &WrappedKeyEnvelope,
    recipient_secret: &WrapSecretKey,
) -> VaultResult<SymmetricKey> {
    let bytes = unwrap_key(envelope, recipient_secret, KeyKind::Symmetric)?;
    Ok(SymmetricKey::from_bytes(*bytes))
}

pub fn wrap_signing_key(
    keypair: &SigningKeypair,
    recipient: &WrapPublicKey,
) -> VaultResult<WrappedKeyEnvelope> {
    wrap_key(&keypair.seed(), KeyKind::SigningSeed, recipient)
}

pub fn unwrap_signing_key(
    envelope: &WrappedKeyEnvelope,
    recipient_secret: &WrapSecretKey,
) -> VaultResult<SigningKeypair> {
    let seed = unwrap_key(envelope, recipient_secret, KeyKind::SigningSeed)?;
    Ok(SigningKeypair::from_seed(&seed))
}
