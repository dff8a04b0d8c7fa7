//! zkv-crypto: primitives and key hierarchy for zkvault
//!
//! Primitives: XChaCha20-Poly1305 for records and sealed keys, X25519 +
//! HKDF-SHA256 hybrid wrapping for keys that cross a trust boundary,
//! Ed25519 for naming-layer record signatures.
//!
//! Key hierarchy:
//! ```text
//! Identity Keypair (Ed25519, handed over in memory at login)
//!   ├── Vault Root Key (256-bit random, wrapped to the identity's X25519 key)
//!   │   ├── Folder Key (per-folder, random, sealed under the parent folder key)
//!   │   │   └── File Key (per-file, random, sealed under the folder key)
//!   │   │       └── Content Key (per-version, random, stored in the sealed file pointer)
//!   │   └── Device Registry Key (HKDF from root key, domain="zkv-device-registry")
//!   └── Record Signing Keys (HKDF from identity seed, info="zkv-signing-v1:<scope>")
//! ```

pub mod aead;
pub mod encoding;
pub mod envelope;
pub mod hierarchy;
pub mod identity;
pub mod kdf;
pub mod keys;
pub mod recovery;

pub use aead::{open, seal};
pub use envelope::{
    unwrap_key, unwrap_signing_key, unwrap_symmetric, wrap_key, wrap_signing_key, wrap_symmetric,
    KeyKind, WrappedKeyEnvelope,
};
pub use hierarchy::{
    derive_signing_keypair, KeyHierarchy, KeyMaterial, KeyScope, RecordScope, VaultHeader,
};
pub use identity::{IdentityKeypair, SigningKeypair, SigningPublicKey, WrapPublicKey, WrapSecretKey};
pub use kdf::{stretch_passphrase, KdfParams};
pub use keys::{derive_subkey, generate_symmetric_key, open_key, seal_key, SymmetricKey};
pub use recovery::{generate_recovery_phrase, phrase_to_factor, RecoveryKit};

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
