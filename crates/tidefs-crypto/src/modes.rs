//! Static registry of supported encryption modes.
//!
//! The table is immutable after process start; the only runtime state is a
//! one-time "implementation logged" flag per mode, kept as an idempotent
//! atomic so races at worst produce a duplicate log line.

use std::sync::atomic::{AtomicBool, Ordering};

use tidefs_core::FileKind;

use crate::error::KeySetupError;
use crate::MAX_IV_SIZE;

/// Mode identifiers, as stored in on-disk encryption contexts.
///
/// The numbering is sparse on purpose: ids are wire-stable and gaps belong
/// to modes tidefs never supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ModeId {
    /// Placeholder for legacy/compat contexts; content stays unencrypted
    Null = 0,
    Aes256Xts = 1,
    Aes256CtsCbc = 4,
    Aes128Cbc = 5,
    Aes128CtsCbc = 6,
    Adiantum = 9,
}

/// One past the largest mode id; sizes the per-mode key cache.
pub const MODE_TABLE_SIZE: usize = 10;

impl ModeId {
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(ModeId::Null),
            1 => Some(ModeId::Aes256Xts),
            4 => Some(ModeId::Aes256CtsCbc),
            5 => Some(ModeId::Aes128Cbc),
            6 => Some(ModeId::Aes128CtsCbc),
            9 => Some(ModeId::Adiantum),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// An entry in the process-wide mode table.
pub struct EncryptionMode {
    pub id: ModeId,
    pub friendly_name: &'static str,
    /// Generic implementation name the cipher provider resolves
    pub cipher_name: &'static str,
    /// Hardware-accelerated variant, where one is registered
    pub accelerated_name: Option<&'static str>,
    /// Raw key length in bytes the mode's cipher is keyed with
    pub key_size: usize,
    pub iv_size: usize,
    /// Whether the data path needs an ESSIV IV generator next to the
    /// content cipher
    pub needs_essiv: bool,
    /// Whether the mode may back a DIRECT_KEY policy (per-file nonce folded
    /// into the IV instead of the key)
    pub supports_direct_key: bool,
    logged_impl: AtomicBool,
}

static MODES: [EncryptionMode; 6] = [
    EncryptionMode {
        id: ModeId::Null,
        friendly_name: "NULL",
        cipher_name: "null",
        accelerated_name: None,
        key_size: 0,
        iv_size: 0,
        needs_essiv: false,
        supports_direct_key: false,
        logged_impl: AtomicBool::new(false),
    },
    EncryptionMode {
        id: ModeId::Aes256Xts,
        friendly_name: "AES-256-XTS",
        cipher_name: "xts(aes)",
        accelerated_name: Some("xts-aes-aesni"),
        key_size: 64,
        iv_size: 16,
        needs_essiv: false,
        supports_direct_key: false,
        logged_impl: AtomicBool::new(false),
    },
    EncryptionMode {
        id: ModeId::Aes256CtsCbc,
        friendly_name: "AES-256-CTS-CBC",
        cipher_name: "cts(cbc(aes))",
        accelerated_name: Some("cts-cbc-aes-aesni"),
        key_size: 32,
        iv_size: 16,
        needs_essiv: false,
        supports_direct_key: false,
        logged_impl: AtomicBool::new(false),
    },
    EncryptionMode {
        id: ModeId::Aes128Cbc,
        friendly_name: "AES-128-CBC",
        cipher_name: "cbc(aes)",
        accelerated_name: Some("cbc-aes-aesni"),
        key_size: 16,
        iv_size: 16,
        needs_essiv: true,
        supports_direct_key: false,
        logged_impl: AtomicBool::new(false),
    },
    EncryptionMode {
        id: ModeId::Aes128CtsCbc,
        friendly_name: "AES-128-CTS-CBC",
        cipher_name: "cts(cbc(aes))",
        accelerated_name: Some("cts-cbc-aes-aesni"),
        key_size: 16,
        iv_size: 16,
        needs_essiv: false,
        supports_direct_key: false,
        logged_impl: AtomicBool::new(false),
    },
    EncryptionMode {
        id: ModeId::Adiantum,
        friendly_name: "Adiantum",
        cipher_name: "adiantum(xchacha12,aes)",
        accelerated_name: None,
        key_size: 32,
        iv_size: 32,
        needs_essiv: false,
        supports_direct_key: true,
        logged_impl: AtomicBool::new(false),
    },
];

/// Look up a mode table entry by id.
pub fn resolve(id: ModeId) -> &'static EncryptionMode {
    MODES
        .iter()
        .find(|m| m.id == id)
        .expect("every ModeId has a table entry")
}

impl EncryptionMode {
    /// `iv_size` above the fixed maximum means a corrupt table/port, not a
    /// valid runtime input; surface it rather than truncate.
    pub fn check_iv_size(&self) -> Result<(), KeySetupError> {
        if self.iv_size > MAX_IV_SIZE {
            return Err(KeySetupError::UnsupportedPolicy(format!(
                "{}: iv_size {} exceeds maximum {}",
                self.friendly_name, self.iv_size, MAX_IV_SIZE
            )));
        }
        Ok(())
    }

    /// Log which implementation backs this mode, once per process lifetime.
    ///
    /// Cipher performance varies a lot with the chosen implementation, so
    /// record it the first time the mode is keyed. Threads may race; a
    /// duplicate line is harmless.
    pub fn note_implementation(&self, implementation: &str) {
        if !self.logged_impl.swap(true, Ordering::Relaxed) {
            tracing::info!(
                mode = self.friendly_name,
                implementation,
                "encryption mode in use"
            );
        }
    }
}

impl std::fmt::Debug for EncryptionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionMode")
            .field("id", &self.id)
            .field("friendly_name", &self.friendly_name)
            .field("key_size", &self.key_size)
            .field("iv_size", &self.iv_size)
            .finish()
    }
}

/// Pick the mode a file of the given kind encrypts with: regular files use
/// the contents mode, directories and symlinks the filenames mode. Any other
/// kind is a driver contract violation.
pub fn select_for_kind(
    kind: FileKind,
    contents: ModeId,
    filenames: ModeId,
) -> Result<&'static EncryptionMode, KeySetupError> {
    match kind {
        FileKind::Regular => Ok(resolve(contents)),
        FileKind::Directory | FileKind::Symlink => Ok(resolve(filenames)),
        FileKind::Other => Err(KeySetupError::UnsupportedPolicy(
            "file type is not encryptable".into(),
        )),
    }
}
