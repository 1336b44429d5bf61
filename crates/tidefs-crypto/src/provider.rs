//! Cipher provider boundary.
//!
//! The key-setup engine never touches cipher internals: it asks a
//! [`CipherProvider`] for a keyed context and only tracks the context's
//! lifetime from there. [`SystemProvider`] is the default implementation,
//! built on the RustCrypto AES cores; tests substitute counting/failing
//! providers through the same trait.

use std::sync::Arc;

use aes::cipher::KeyInit;
use aes::{Aes128, Aes256};
use tidefs_core::config::EnginePreference;

use crate::error::KeySetupError;
use crate::modes::{EncryptionMode, ModeId};

/// An initialized, keyed symmetric-cipher handle, ready for the data path.
///
/// Exclusively owned by the file context that built it, except per-mode
/// (DIRECT_KEY) contexts, which the master key record shares across files;
/// hence `Arc` throughout.
pub trait CipherContext: Send + Sync {
    fn mode(&self) -> &'static EncryptionMode;
    /// Name of the concrete implementation backing this context
    fn implementation(&self) -> &str;
}

impl std::fmt::Debug for dyn CipherContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CipherContext")
            .field("mode", &self.mode().friendly_name)
            .field("implementation", &self.implementation())
            .finish()
    }
}

pub trait CipherProvider: Send + Sync {
    /// Build a cipher context for `mode` keyed with `raw_key`.
    ///
    /// Returns `Ok(None)` for the null mode: content stays unencrypted by
    /// design, which is not an error. Degenerate keys are rejected.
    fn allocate(
        &self,
        mode: &'static EncryptionMode,
        raw_key: &[u8],
    ) -> Result<Option<Arc<dyn CipherContext>>, KeySetupError>;
}

/// Default provider backed by the RustCrypto AES block-cipher cores.
///
/// Adiantum has no core in this stack and reports unavailable, the same way
/// a kernel without the algorithm compiled in would.
pub struct SystemProvider {
    engine: EnginePreference,
}

enum AesCores {
    /// XTS: independent data and tweak keys
    Xts256 { data: Aes256, tweak: Aes256 },
    Cts256(Aes256),
    Cbc128(Aes128),
    Cts128(Aes128),
}

struct SystemCipher {
    mode: &'static EncryptionMode,
    implementation: &'static str,
    #[allow(dead_code)] // consumed by the data path, not by key setup
    cores: AesCores,
}

impl CipherContext for SystemCipher {
    fn mode(&self) -> &'static EncryptionMode {
        self.mode
    }

    fn implementation(&self) -> &str {
        self.implementation
    }
}

impl SystemProvider {
    pub fn new(engine: EnginePreference) -> Self {
        Self { engine }
    }

    /// Implementation name to report for `mode` under the configured engine
    /// preference, falling back to the generic name when no accelerated
    /// variant is registered.
    fn implementation_for(&self, mode: &'static EncryptionMode) -> &'static str {
        match self.engine {
            EnginePreference::Accelerated => mode.accelerated_name.unwrap_or(mode.cipher_name),
            EnginePreference::SystemDefault => mode.cipher_name,
        }
    }
}

impl Default for SystemProvider {
    fn default() -> Self {
        Self::new(EnginePreference::SystemDefault)
    }
}

impl CipherProvider for SystemProvider {
    fn allocate(
        &self,
        mode: &'static EncryptionMode,
        raw_key: &[u8],
    ) -> Result<Option<Arc<dyn CipherContext>>, KeySetupError> {
        if mode.id == ModeId::Null {
            return Ok(None);
        }

        if raw_key.len() != mode.key_size {
            return Err(KeySetupError::KeyRejected(format!(
                "{}: got {} key bytes, need {}",
                mode.friendly_name,
                raw_key.len(),
                mode.key_size
            )));
        }
        reject_weak_key(mode, raw_key)?;

        let cores = match mode.id {
            ModeId::Aes256Xts => {
                let (k1, k2) = raw_key.split_at(32);
                AesCores::Xts256 {
                    data: new_core::<Aes256>(mode, k1)?,
                    tweak: new_core::<Aes256>(mode, k2)?,
                }
            }
            ModeId::Aes256CtsCbc => AesCores::Cts256(new_core::<Aes256>(mode, raw_key)?),
            ModeId::Aes128Cbc => AesCores::Cbc128(new_core::<Aes128>(mode, raw_key)?),
            ModeId::Aes128CtsCbc => AesCores::Cts128(new_core::<Aes128>(mode, raw_key)?),
            ModeId::Adiantum => {
                tracing::warn!(
                    mode = mode.friendly_name,
                    cipher = mode.cipher_name,
                    "missing cipher support"
                );
                return Err(KeySetupError::AlgorithmUnavailable(mode.friendly_name));
            }
            ModeId::Null => unreachable!("handled above"),
        };

        let implementation = self.implementation_for(mode);
        mode.note_implementation(implementation);

        Ok(Some(Arc::new(SystemCipher {
            mode,
            implementation,
            cores,
        })))
    }
}

fn new_core<C: KeyInit>(
    mode: &'static EncryptionMode,
    key: &[u8],
) -> Result<C, KeySetupError> {
    C::new_from_slice(key).map_err(|e| {
        KeySetupError::AllocationFailed(format!("{}: {e}", mode.friendly_name))
    })
}

/// Refuse degenerate keys: an all-equal-byte key, or XTS key halves that
/// match (which collapses the tweak).
fn reject_weak_key(mode: &'static EncryptionMode, raw_key: &[u8]) -> Result<(), KeySetupError> {
    if raw_key.iter().all(|&b| b == raw_key[0]) {
        return Err(KeySetupError::KeyRejected(format!(
            "{}: degenerate key",
            mode.friendly_name
        )));
    }
    if mode.id == ModeId::Aes256Xts {
        let (k1, k2) = raw_key.split_at(32);
        if k1 == k2 {
            return Err(KeySetupError::KeyRejected(
                "AES-256-XTS: data and tweak keys must differ".into(),
            ));
        }
    }
    Ok(())
}
