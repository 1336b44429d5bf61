use thiserror::Error;

/// Failure taxonomy for key setup.
///
/// `NoKey` is the only non-fatal class: the top-level entry point coerces it
/// to "leave the file unkeyed, retry on next access", so open/key-removal
/// races never surface as errors. Everything else is fatal for the file.
#[derive(Debug, Error)]
pub enum KeySetupError {
    /// Master key unresolved, its secret already removed, or shorter than
    /// the mode's derived-key length
    #[error("master key not available")]
    NoKey,

    /// Malformed or unknown policy, or an incompatible flag combination
    #[error("unsupported encryption policy: {0}")]
    UnsupportedPolicy(String),

    /// The cipher provider has no implementation of the requested algorithm
    #[error("missing cipher support for {0}")]
    AlgorithmUnavailable(&'static str),

    /// The provider rejected the raw key (wrong length, degenerate key)
    #[error("cipher key rejected: {0}")]
    KeyRejected(String),

    /// Cipher-context construction failed
    #[error("cipher allocation failed: {0}")]
    AllocationFailed(String),

    /// HKDF expansion failed
    #[error("key derivation failed: {0}")]
    DerivationFailed(String),
}

impl KeySetupError {
    /// True for the non-fatal class: the file is simply left unkeyed.
    pub fn is_no_key(&self) -> bool {
        matches!(self, KeySetupError::NoKey)
    }
}
