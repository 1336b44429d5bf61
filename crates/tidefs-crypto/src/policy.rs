//! Per-file encryption policies.
//!
//! A policy is read off the file object by the filesystem driver (the byte
//! layout is the driver's concern) and is immutable from then on. It selects
//! the content/filename modes and names the master key everything under this
//! file derives from.

use tidefs_core::FileKind;

use crate::error::KeySetupError;
use crate::modes::{self, EncryptionMode, ModeId};
use crate::{KEY_DESCRIPTOR_SIZE, KEY_IDENTIFIER_SIZE};

/// DIRECT_KEY: the per-file nonce goes into IV computation instead of key
/// derivation, so one cipher context serves every file of the mode.
pub const POLICY_FLAG_DIRECT_KEY: u8 = 0x04;

const KNOWN_V2_FLAGS: u8 = POLICY_FLAG_DIRECT_KEY;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionPolicy {
    V1 {
        contents_mode: ModeId,
        filenames_mode: ModeId,
        master_key_descriptor: [u8; KEY_DESCRIPTOR_SIZE],
    },
    V2 {
        contents_mode: ModeId,
        filenames_mode: ModeId,
        flags: u8,
        master_key_identifier: [u8; KEY_IDENTIFIER_SIZE],
    },
}

/// How a policy names its master key: V1 policies carry an opaque
/// user-chosen descriptor, V2 policies a cryptographic identifier derived
/// from the secret itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeySpecifier {
    Descriptor([u8; KEY_DESCRIPTOR_SIZE]),
    Identifier([u8; KEY_IDENTIFIER_SIZE]),
}

impl EncryptionPolicy {
    pub fn version(&self) -> u8 {
        match self {
            EncryptionPolicy::V1 { .. } => 1,
            EncryptionPolicy::V2 { .. } => 2,
        }
    }

    pub fn key_specifier(&self) -> KeySpecifier {
        match self {
            EncryptionPolicy::V1 {
                master_key_descriptor,
                ..
            } => KeySpecifier::Descriptor(*master_key_descriptor),
            EncryptionPolicy::V2 {
                master_key_identifier,
                ..
            } => KeySpecifier::Identifier(*master_key_identifier),
        }
    }

    pub fn is_direct_key(&self) -> bool {
        match self {
            EncryptionPolicy::V1 { .. } => false,
            EncryptionPolicy::V2 { flags, .. } => flags & POLICY_FLAG_DIRECT_KEY != 0,
        }
    }

    /// Reject policies this client cannot honor before any key material is
    /// touched.
    pub fn validate(&self) -> Result<(), KeySetupError> {
        let (contents, filenames) = match self {
            EncryptionPolicy::V1 {
                contents_mode,
                filenames_mode,
                ..
            } => (*contents_mode, *filenames_mode),
            EncryptionPolicy::V2 {
                contents_mode,
                filenames_mode,
                flags,
                ..
            } => {
                if flags & !KNOWN_V2_FLAGS != 0 {
                    return Err(KeySetupError::UnsupportedPolicy(format!(
                        "unknown policy flags {:#04x}",
                        flags & !KNOWN_V2_FLAGS
                    )));
                }
                (*contents_mode, *filenames_mode)
            }
        };

        if !valid_mode_pair(contents, filenames) {
            return Err(KeySetupError::UnsupportedPolicy(format!(
                "mode pair {}/{} is not allowed",
                modes::resolve(contents).friendly_name,
                modes::resolve(filenames).friendly_name
            )));
        }
        Ok(())
    }

    /// Resolve the mode a file of `kind` under this policy encrypts with.
    pub fn mode_for_kind(&self, kind: FileKind) -> Result<&'static EncryptionMode, KeySetupError> {
        let (contents, filenames) = match self {
            EncryptionPolicy::V1 {
                contents_mode,
                filenames_mode,
                ..
            }
            | EncryptionPolicy::V2 {
                contents_mode,
                filenames_mode,
                ..
            } => (*contents_mode, *filenames_mode),
        };
        modes::select_for_kind(kind, contents, filenames)
    }
}

/// Allowed contents/filenames pairings. Either mode may be NULL (legacy
/// placeholder contexts), otherwise the pair must match in key strength.
fn valid_mode_pair(contents: ModeId, filenames: ModeId) -> bool {
    if contents == ModeId::Null || filenames == ModeId::Null {
        return true;
    }
    matches!(
        (contents, filenames),
        (ModeId::Aes256Xts, ModeId::Aes256CtsCbc)
            | (ModeId::Aes128Cbc, ModeId::Aes128CtsCbc)
            | (ModeId::Adiantum, ModeId::Adiantum)
    )
}

impl std::fmt::Display for KeySpecifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySpecifier::Descriptor(d) => write!(f, "descriptor:{}", hex(d)),
            KeySpecifier::Identifier(i) => write!(f, "identifier:{}", hex(i)),
        }
    }
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}
