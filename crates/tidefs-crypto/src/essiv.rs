//! ESSIV IV generation.
//!
//! Modes flagged `needs_essiv` pair their content cipher with an IV cipher
//! keyed by SHA-256 of the file's raw key: IVs stay reproducible per data
//! unit without being predictable across files. Hashing with SHA-256 keys
//! the IV cipher as AES-256 regardless of the content mode's key size.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes256;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::KeySetupError;
use crate::modes::EncryptionMode;

const AES_BLOCK_SIZE: usize = 16;

pub struct EssivGenerator {
    tfm: Aes256,
}

impl EssivGenerator {
    /// Build the IV generator for `mode`, keyed from the file's raw key.
    ///
    /// The salt buffer is erased as soon as the cipher is keyed, on success
    /// and failure alike.
    pub fn new(mode: &'static EncryptionMode, raw_key: &[u8]) -> Result<Self, KeySetupError> {
        if mode.iv_size != AES_BLOCK_SIZE {
            return Err(KeySetupError::UnsupportedPolicy(format!(
                "{}: ESSIV requires {}-byte IVs, table says {}",
                mode.friendly_name, AES_BLOCK_SIZE, mode.iv_size
            )));
        }

        let mut salt = Sha256::digest(raw_key);
        let tfm = Aes256::new_from_slice(&salt).map_err(|e| {
            KeySetupError::AllocationFailed(format!("ESSIV cipher for {}: {e}", mode.friendly_name))
        });
        salt.as_mut_slice().zeroize();

        Ok(Self { tfm: tfm? })
    }

    /// IV for the given data unit: the unit number encrypted under the
    /// salt-derived key.
    pub fn iv_for_unit(&self, unit: u64) -> [u8; AES_BLOCK_SIZE] {
        let mut block = [0u8; AES_BLOCK_SIZE];
        block[..8].copy_from_slice(&unit.to_le_bytes());
        self.tfm
            .encrypt_block(GenericArray::from_mut_slice(&mut block));
        block
    }
}

impl std::fmt::Debug for EssivGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EssivGenerator(****)")
    }
}
