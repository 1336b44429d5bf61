//! tidefs-crypto: file-based encryption key setup for the tidefs client
//!
//! Derives the concrete symmetric-cipher material for transparent per-file
//! content/filename encryption and manages its lifecycle under concurrent
//! access.
//!
//! Key hierarchy:
//! ```text
//! Master Key (cluster-scoped, installed via the keyring)
//!   ├── Per-file key     (HKDF-SHA256, context = per-file key || nonce)
//!   │     └── content/filename cipher context (+ ESSIV IV generator if the
//!   │         mode needs one)
//!   ├── Per-mode key     (HKDF-SHA256, context = per-mode key || mode id;
//!   │     DIRECT_KEY policies only; one shared cipher context per
//!   │     (master key, mode) pair)
//!   └── Key identifier   (HKDF-SHA256, context = key identifier; names V2
//!         master keys)
//! ```
//!
//! Cipher algorithm implementations are consumed through the
//! [`provider::CipherProvider`] boundary; this crate never defines an
//! on-disk or on-wire format.

pub mod error;
pub mod essiv;
pub mod hkdf;
pub mod keysetup;
pub mod master_key;
pub mod modes;
pub mod policy;
pub mod provider;

pub use error::KeySetupError;
pub use essiv::EssivGenerator;
pub use hkdf::HkdfEngine;
pub use keysetup::{
    free_cached_plaintext, generate_nonce, FileKeyContext, FileObject, KeySetup, KeySlot,
    LegacyKdf,
};
pub use master_key::{Keyring, MasterKeyRecord, MasterKeySecret, ProcessKeyring};
pub use modes::{EncryptionMode, ModeId};
pub use policy::{EncryptionPolicy, KeySpecifier};
pub use provider::{CipherContext, CipherProvider, SystemProvider};

/// Largest raw key any supported mode uses (AES-256-XTS: two 256-bit keys)
pub const MAX_KEY_SIZE: usize = 64;

/// Upper bound on a mode's IV size; a table entry above this is a
/// configuration error
pub const MAX_IV_SIZE: usize = 32;

/// Size of the per-file key-derivation nonce stored in the encryption context
pub const NONCE_SIZE: usize = 16;

/// Size of a V1 policy's master key descriptor
pub const KEY_DESCRIPTOR_SIZE: usize = 8;

/// Size of a V2 policy's master key identifier
pub const KEY_IDENTIFIER_SIZE: usize = 16;
