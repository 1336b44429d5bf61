//! Per-file key setup and teardown.
//!
//! Entry points the filesystem driver calls: [`KeySetup::ensure_key_setup`]
//! on first access to an encrypted file, [`KeySetup::release_key_context`]
//! on eviction, plus the [`KeySetup::has_key`] / [`KeySetup::should_evict`]
//! queries. Any worker thread may trigger setup; races are resolved by a
//! publish-if-absent key slot, with losers discarding their work.

use std::sync::{Arc, Mutex};

use rand::RngCore;
use zeroize::Zeroizing;

use tidefs_core::{FileId, FileKind};

use crate::error::KeySetupError;
use crate::essiv::EssivGenerator;
use crate::hkdf::{HKDF_CONTEXT_PER_FILE_KEY, HKDF_CONTEXT_PER_MODE_KEY};
use crate::master_key::{Keyring, MasterKeyRecord, MasterKeySecret};
use crate::modes::EncryptionMode;
use crate::policy::EncryptionPolicy;
use crate::provider::{CipherContext, CipherProvider};
use crate::{KEY_DESCRIPTOR_SIZE, NONCE_SIZE};

/// What the engine needs from a file object. Implemented by the filesystem
/// driver's inode wrapper.
pub trait FileObject: Send + Sync {
    fn id(&self) -> FileId;
    fn kind(&self) -> FileKind;
    /// The file's encryption policy, or `None` if the file is not encrypted.
    fn policy(&self) -> Option<EncryptionPolicy>;
    /// Per-file key-derivation nonce from the encryption context
    fn nonce(&self) -> &[u8; NONCE_SIZE];
    fn key_slot(&self) -> &KeySlot;
    /// Drop the cached decrypted symlink target, if the driver keeps one.
    /// Called only via [`free_cached_plaintext`], after concurrent readers
    /// are done with it.
    fn clear_cached_symlink(&self) {}
}

/// The atomic publish/read handle for a file's [`FileKeyContext`].
///
/// Readers observe either "absent" or a fully built context, never partial
/// state: contexts are completely constructed before they are offered to
/// [`KeySlot::publish_if_absent`].
#[derive(Default)]
pub struct KeySlot {
    inner: Mutex<Option<Arc<FileKeyContext>>>,
}

impl KeySlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<FileKeyContext>> {
        self.inner.lock().expect("key slot poisoned").clone()
    }

    /// Install `ctx` if the slot is still empty. Returns whether this caller
    /// won; the loser's context is simply dropped by the caller.
    fn publish_if_absent(&self, ctx: Arc<FileKeyContext>) -> bool {
        let mut slot = self.inner.lock().expect("key slot poisoned");
        if slot.is_none() {
            *slot = Some(ctx);
            true
        } else {
            false
        }
    }

    fn take(&self) -> Option<Arc<FileKeyContext>> {
        self.inner.lock().expect("key slot poisoned").take()
    }
}

/// A file's derived encryption state, published into its key slot exactly
/// once and dropped on eviction.
pub struct FileKeyContext {
    policy_version: u8,
    mode: &'static EncryptionMode,
    nonce: [u8; NONCE_SIZE],
    cipher: Option<Arc<dyn CipherContext>>,
    essiv: Option<EssivGenerator>,
    /// Strong handle for derivation bookkeeping; the record only keeps a
    /// membership set of file ids, so no ownership cycle forms
    master_key: Option<Arc<MasterKeyRecord>>,
    direct_key: bool,
}

impl FileKeyContext {
    pub fn policy_version(&self) -> u8 {
        self.policy_version
    }

    pub fn mode(&self) -> &'static EncryptionMode {
        self.mode
    }

    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    /// `None` only for the null mode: content intentionally unencrypted
    pub fn cipher(&self) -> Option<&Arc<dyn CipherContext>> {
        self.cipher.as_ref()
    }

    pub fn essiv(&self) -> Option<&EssivGenerator> {
        self.essiv.as_ref()
    }

    /// Whether the cipher context is a per-mode one shared across files
    pub fn is_direct_key(&self) -> bool {
        self.direct_key
    }

    pub fn master_key(&self) -> Option<&Arc<MasterKeyRecord>> {
        self.master_key.as_ref()
    }
}

/// The legacy (pre-HKDF) per-file key derivation used by V1 policies.
///
/// Its construction is specified by the protocol compatibility reference,
/// not by this crate; deployments still carrying V1 volumes inject an
/// implementation. Without one, V1 files are left unkeyed.
pub trait LegacyKdf: Send + Sync {
    fn derive(
        &self,
        master_secret: &[u8],
        nonce: &[u8; NONCE_SIZE],
        out: &mut [u8],
    ) -> Result<(), KeySetupError>;
}

/// Key setup orchestrator: resolves the master key, derives the file or
/// mode key, builds cipher contexts, and publishes the result.
pub struct KeySetup {
    keyring: Arc<dyn Keyring>,
    provider: Arc<dyn CipherProvider>,
    legacy_kdf: Option<Arc<dyn LegacyKdf>>,
}

impl KeySetup {
    pub fn new(keyring: Arc<dyn Keyring>, provider: Arc<dyn CipherProvider>) -> Self {
        Self {
            keyring,
            provider,
            legacy_kdf: None,
        }
    }

    pub fn with_legacy_kdf(mut self, kdf: Arc<dyn LegacyKdf>) -> Self {
        self.legacy_kdf = Some(kdf);
        self
    }

    /// Set up the file's encryption key. Idempotent: a no-op if the file is
    /// already keyed or not encrypted.
    ///
    /// A missing or removed master key is not an error: the file is left
    /// unkeyed and setup retried on next access, since open can race with
    /// key removal. Malformed policies and cipher failures are errors.
    pub fn ensure_key_setup(&self, file: &dyn FileObject) -> Result<(), KeySetupError> {
        if file.key_slot().get().is_some() {
            return Ok(());
        }
        let policy = match file.policy() {
            Some(p) => p,
            None => return Ok(()),
        };
        policy.validate()?;
        let mode = policy.mode_for_kind(file.kind())?;
        mode.check_iv_size()?;

        match self.setup_and_publish(file, &policy, mode) {
            Err(e) if e.is_no_key() => {
                tracing::debug!(file = file.id(), "no usable master key, leaving file unkeyed");
                Ok(())
            }
            other => other,
        }
    }

    fn setup_and_publish(
        &self,
        file: &dyn FileObject,
        policy: &EncryptionPolicy,
        mode: &'static EncryptionMode,
    ) -> Result<(), KeySetupError> {
        let spec = policy.key_specifier();
        let record = match self.keyring.lookup_master_key(&spec) {
            Some(r) => r,
            None => {
                if let EncryptionPolicy::V1 {
                    master_key_descriptor,
                    ..
                } = policy
                {
                    return self.setup_v1_via_session(file, mode, master_key_descriptor);
                }
                return Err(KeySetupError::NoKey);
            }
        };

        // Hold the secret read lock until after publish: revocation waits
        // for us, and the usage-set link stays ordered against the
        // secret-present check.
        let guard = record.read_secret();
        let secret = guard.as_ref().ok_or(KeySetupError::NoKey)?;

        // A shorter master key cannot contain the entropy the derived key
        // needs; only key-database corruption or a policy mismatch gets here.
        if secret.len() < mode.key_size {
            tracing::warn!(
                key = %spec,
                got = secret.len(),
                need = mode.key_size,
                "master key too short"
            );
            return Err(KeySetupError::NoKey);
        }

        let (cipher, essiv, direct_key) = match policy {
            EncryptionPolicy::V1 { .. } => {
                let (cipher, essiv) = self.derive_v1(secret, file.nonce(), mode)?;
                (cipher, essiv, false)
            }
            EncryptionPolicy::V2 { .. } if policy.is_direct_key() => {
                if !mode.supports_direct_key {
                    tracing::warn!(
                        file = file.id(),
                        mode = mode.friendly_name,
                        "direct key flag not allowed with this mode"
                    );
                    return Err(KeySetupError::UnsupportedPolicy(format!(
                        "DIRECT_KEY not supported by {}",
                        mode.friendly_name
                    )));
                }
                (Some(self.shared_mode_key(&record, secret, mode)?), None, true)
            }
            EncryptionPolicy::V2 { .. } => {
                let mut raw = Zeroizing::new(vec![0u8; mode.key_size]);
                secret
                    .hkdf()
                    .expand(HKDF_CONTEXT_PER_FILE_KEY, file.nonce(), &mut raw)?;
                let (cipher, essiv) = self.build_contexts(mode, &raw)?;
                (cipher, essiv, false)
            }
        };

        let ctx = Arc::new(FileKeyContext {
            policy_version: policy.version(),
            mode,
            nonce: *file.nonce(),
            cipher,
            essiv,
            master_key: Some(record.clone()),
            direct_key,
        });

        if file.key_slot().publish_if_absent(ctx) {
            record.link_user(file.id());
        }
        // A lost race drops our context here; it was never linked into the
        // usage set, so there is nothing to detach.
        Ok(())
    }

    /// V1 fallback when the cluster keyring has no record: a session-scoped
    /// secret, if one is registered. Intentionally never consulted first
    /// (session keys must not override administrator-installed ones) and
    /// never consulted for V2 policies.
    fn setup_v1_via_session(
        &self,
        file: &dyn FileObject,
        mode: &'static EncryptionMode,
        descriptor: &[u8; KEY_DESCRIPTOR_SIZE],
    ) -> Result<(), KeySetupError> {
        let secret = self
            .keyring
            .lookup_in_session_keyring(descriptor)
            .ok_or(KeySetupError::NoKey)?;
        if secret.len() < mode.key_size {
            tracing::warn!(file = file.id(), "session master key too short");
            return Err(KeySetupError::NoKey);
        }

        let kdf = self.legacy_kdf.as_ref().ok_or_else(|| {
            tracing::warn!(file = file.id(), "no legacy KDF configured for V1 policy");
            KeySetupError::NoKey
        })?;
        let mut raw = Zeroizing::new(vec![0u8; mode.key_size]);
        kdf.derive(&secret, file.nonce(), &mut raw)?;
        let (cipher, essiv) = self.build_contexts(mode, &raw)?;

        // No master key record: should_evict cannot track session keys
        let ctx = Arc::new(FileKeyContext {
            policy_version: 1,
            mode,
            nonce: *file.nonce(),
            cipher,
            essiv,
            master_key: None,
            direct_key: false,
        });
        file.key_slot().publish_if_absent(ctx);
        Ok(())
    }

    fn derive_v1(
        &self,
        secret: &MasterKeySecret,
        nonce: &[u8; NONCE_SIZE],
        mode: &'static EncryptionMode,
    ) -> Result<(Option<Arc<dyn CipherContext>>, Option<EssivGenerator>), KeySetupError> {
        let kdf = self.legacy_kdf.as_ref().ok_or_else(|| {
            tracing::warn!("no legacy KDF configured for V1 policy");
            KeySetupError::NoKey
        })?;
        let mut raw = Zeroizing::new(vec![0u8; mode.key_size]);
        kdf.derive(secret.raw(), nonce, &mut raw)?;
        self.build_contexts(mode, &raw)
    }

    /// Allocate the content cipher and, when the mode wants one, the ESSIV
    /// generator. On ESSIV failure the already-built cipher context is
    /// dropped before returning, so no partial state escapes.
    fn build_contexts(
        &self,
        mode: &'static EncryptionMode,
        raw_key: &[u8],
    ) -> Result<(Option<Arc<dyn CipherContext>>, Option<EssivGenerator>), KeySetupError> {
        let cipher = self.provider.allocate(mode, raw_key)?;
        let essiv = if mode.needs_essiv {
            match EssivGenerator::new(mode, raw_key) {
                Ok(g) => Some(g),
                Err(e) => {
                    tracing::warn!(mode = mode.friendly_name, error = %e, "ESSIV setup failed");
                    return Err(e);
                }
            }
        } else {
            None
        };
        Ok((cipher, essiv))
    }

    /// Look up or create the cipher context shared by every DIRECT_KEY file
    /// of `mode` under this master key.
    ///
    /// Losing the install race is harmless: derivation is a pure function of
    /// (secret, mode id), so the discarded context was byte-equivalent.
    fn shared_mode_key(
        &self,
        record: &MasterKeyRecord,
        secret: &MasterKeySecret,
        mode: &'static EncryptionMode,
    ) -> Result<Arc<dyn CipherContext>, KeySetupError> {
        if let Some(ctx) = record.cached_mode_key(mode.id) {
            return Ok(ctx);
        }
        let mut raw = Zeroizing::new(vec![0u8; mode.key_size]);
        secret
            .hkdf()
            .expand(HKDF_CONTEXT_PER_MODE_KEY, &[mode.id.as_byte()], &mut raw)?;
        let ctx = self.provider.allocate(mode, &raw)?.ok_or_else(|| {
            KeySetupError::UnsupportedPolicy("null mode cannot back a DIRECT_KEY policy".into())
        })?;
        Ok(record.install_mode_key(mode.id, ctx))
    }

    /// Tear down the file's key context on eviction. Idempotent.
    ///
    /// Shared direct-key contexts only lose a reference; exclusive cipher
    /// and ESSIV contexts are freed. If this was the last file using a
    /// revoked master key, ask the keyring to invalidate it.
    pub fn release_key_context(&self, file: &dyn FileObject) {
        let Some(ctx) = file.key_slot().take() else {
            return;
        };
        if let Some(record) = ctx.master_key.clone() {
            let remaining = record.unlink_user(file.id());
            if remaining == 0 && !record.is_secret_present() && record.try_mark_invalidated() {
                self.keyring.invalidate(record.spec());
            }
        }
    }

    pub fn has_key(&self, file: &dyn FileObject) -> bool {
        file.key_slot().get().is_some()
    }

    /// True iff the file is keyed under a master key whose secret has since
    /// been removed. Taken without the secret lock, so the answer can go
    /// stale immediately; eviction is best-effort, and evicting
    /// unnecessarily is safe. Files keyed via the session fallback report
    /// false: their key's removal is not observable here.
    pub fn should_evict(&self, file: &dyn FileObject) -> bool {
        match file.key_slot().get() {
            Some(ctx) => match ctx.master_key() {
                Some(record) => !record.is_secret_present(),
                None => false,
            },
            None => false,
        }
    }
}

/// Deferred structural release: drop memory concurrent readers may still
/// dereference during normal operation, such as the cached decrypted
/// symlink target. Call only once those readers are guaranteed done (the
/// object is actually being destroyed); independent of
/// [`KeySetup::release_key_context`].
pub fn free_cached_plaintext(file: &dyn FileObject) {
    if file.kind() == FileKind::Symlink {
        file.clear_cached_symlink();
    }
}

/// Mint the key-derivation nonce for a newly created file. The driver stores
/// it in the file's encryption context before any key setup runs; it is
/// immutable from then on.
pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}
