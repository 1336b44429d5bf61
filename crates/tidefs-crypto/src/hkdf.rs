//! HKDF-SHA256 key derivation over a master secret.
//!
//! Every derived key gets a distinct 1-byte context label inside the info
//! string, so per-file keys, per-mode keys, and key identifiers are
//! cryptographically independent outputs of the same secret. Derivation is a
//! pure function of (secret, context, info); the mode-key cache relies on
//! race losers having derived byte-identical material.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::KeySetupError;
use crate::KEY_IDENTIFIER_SIZE;

/// Derives the identifier a V2 master key is looked up by
pub const HKDF_CONTEXT_KEY_IDENTIFIER: u8 = 1;
/// Derives a per-file key; info = the file's nonce
pub const HKDF_CONTEXT_PER_FILE_KEY: u8 = 2;
/// Derives a per-mode key; info = the 1-byte mode id
pub const HKDF_CONTEXT_PER_MODE_KEY: u8 = 3;

/// Domain-separation prefix for all tidefs HKDF info strings
const INFO_PREFIX: &[u8] = b"tidefs\0";

/// HKDF state with the extract step precomputed.
///
/// Built once when a master secret is installed, so each derivation only
/// pays for the expand step. Dropped (with the secret) on revocation.
pub struct HkdfEngine {
    prk: Hkdf<Sha256>,
}

impl HkdfEngine {
    pub fn new(master_secret: &[u8]) -> Self {
        // Unsalted extract: the master secret is already uniform key material
        Self {
            prk: Hkdf::new(None, master_secret),
        }
    }

    /// Fill `out` with key material bound to `(context, info)`.
    pub fn expand(
        &self,
        context: u8,
        info: &[u8],
        out: &mut [u8],
    ) -> Result<(), KeySetupError> {
        let mut full_info = Vec::with_capacity(INFO_PREFIX.len() + 1 + info.len());
        full_info.extend_from_slice(INFO_PREFIX);
        full_info.push(context);
        full_info.extend_from_slice(info);

        self.prk.expand(&full_info, out).map_err(|e| {
            KeySetupError::DerivationFailed(format!("HKDF expand ({} bytes): {e}", out.len()))
        })
    }
}

impl std::fmt::Debug for HkdfEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HkdfEngine(****)")
    }
}

/// Compute the identifier naming a V2 master key.
///
/// Self-describing: anyone holding the secret computes the same identifier,
/// so the keyring needs no out-of-band naming for V2 keys.
pub fn key_identifier(master_secret: &[u8]) -> [u8; KEY_IDENTIFIER_SIZE] {
    let mut id = [0u8; KEY_IDENTIFIER_SIZE];
    HkdfEngine::new(master_secret)
        .expand(HKDF_CONTEXT_KEY_IDENTIFIER, &[], &mut id)
        .expect("16-byte HKDF output is always within range");
    id
}
