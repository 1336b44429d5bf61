//! Master key records and the keyring boundary.
//!
//! A record owns the cluster-wide secret every per-file key under it derives
//! from. Revocation erases the secret in place under the write half of the
//! secret lock; in-flight setups hold the read half, so no setup ever
//! observes half-erased bytes. The record itself stays alive until the last
//! file context detaches.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, RwLockReadGuard};

use zeroize::{Zeroize, Zeroizing};

use tidefs_core::FileId;

use crate::hkdf::{self, HkdfEngine};
use crate::modes::{ModeId, MODE_TABLE_SIZE};
use crate::policy::KeySpecifier;
use crate::provider::CipherContext;
use crate::KEY_DESCRIPTOR_SIZE;

/// The raw master secret plus its precomputed HKDF state.
///
/// Exclusively owned by a [`MasterKeyRecord`]; the bytes are erased on wipe
/// and again (idempotently) on drop.
pub struct MasterKeySecret {
    bytes: Vec<u8>,
    hkdf: HkdfEngine,
}

impl MasterKeySecret {
    pub fn new(bytes: Vec<u8>) -> Self {
        let hkdf = HkdfEngine::new(&bytes);
        Self { bytes, hkdf }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Raw secret bytes, for the V1 legacy KDF only; V2 derivation goes
    /// through [`Self::hkdf`].
    pub fn raw(&self) -> &[u8] {
        &self.bytes
    }

    pub fn hkdf(&self) -> &HkdfEngine {
        &self.hkdf
    }

    pub(crate) fn wipe(&mut self) {
        self.bytes.zeroize();
    }
}

impl Drop for MasterKeySecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKeySecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKeySecret")
            .field("bytes", &"[REDACTED]")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A master key as tracked by the keyring: secret, revocation state, the
/// files currently keyed under it, and the DIRECT_KEY per-mode context cache.
pub struct MasterKeyRecord {
    spec: KeySpecifier,
    secret: RwLock<Option<MasterKeySecret>>,
    /// Shared per-mode cipher contexts, indexed by mode id. Install is
    /// set-if-absent; derivation is deterministic, so a race loser's context
    /// is byte-equivalent and simply dropped.
    mode_keys: [OnceLock<Arc<dyn CipherContext>>; MODE_TABLE_SIZE],
    users: Mutex<HashSet<FileId>>,
    refcount: AtomicU32,
    invalidated: AtomicBool,
}

const EMPTY_SLOT: OnceLock<Arc<dyn CipherContext>> = OnceLock::new();

impl MasterKeyRecord {
    pub fn new(spec: KeySpecifier, secret: MasterKeySecret) -> Arc<Self> {
        Arc::new(Self {
            spec,
            secret: RwLock::new(Some(secret)),
            mode_keys: [EMPTY_SLOT; MODE_TABLE_SIZE],
            users: Mutex::new(HashSet::new()),
            refcount: AtomicU32::new(0),
            invalidated: AtomicBool::new(false),
        })
    }

    pub fn spec(&self) -> &KeySpecifier {
        &self.spec
    }

    /// Take the secret read lock. Blocks while a revocation holds the write
    /// half; `None` inside the guard means the secret is already gone.
    pub fn read_secret(&self) -> RwLockReadGuard<'_, Option<MasterKeySecret>> {
        self.secret.read().expect("secret lock poisoned")
    }

    pub fn is_secret_present(&self) -> bool {
        self.read_secret().is_some()
    }

    /// Erase the secret in place. Waits for all in-flight setups (read-lock
    /// holders) to finish first. Returns whether a secret was present.
    pub fn revoke_secret(&self) -> bool {
        let mut guard = self.secret.write().expect("secret lock poisoned");
        match guard.as_mut() {
            Some(secret) => {
                secret.wipe();
                *guard = None;
                tracing::info!(key = %self.spec, "master key secret removed");
                true
            }
            None => false,
        }
    }

    /// Put a removed secret back (key re-added before the last user closed).
    pub fn reinstate_secret(&self, secret: MasterKeySecret) -> bool {
        let mut guard = self.secret.write().expect("secret lock poisoned");
        if guard.is_some() {
            return false;
        }
        *guard = Some(secret);
        true
    }

    pub(crate) fn cached_mode_key(&self, id: ModeId) -> Option<Arc<dyn CipherContext>> {
        self.mode_keys[id.as_byte() as usize].get().cloned()
    }

    /// Install `ctx` into the mode slot if still empty; either way, return
    /// the context every file of this mode now shares.
    pub(crate) fn install_mode_key(
        &self,
        id: ModeId,
        ctx: Arc<dyn CipherContext>,
    ) -> Arc<dyn CipherContext> {
        let slot = &self.mode_keys[id.as_byte() as usize];
        // On a lost race the new context is dropped here, freeing its
        // cipher resources; the winner's stays.
        let _ = slot.set(ctx);
        slot.get().cloned().expect("slot just populated")
    }

    /// Link a file into the usage set. Caller must hold the secret read lock
    /// and have won the key-slot publish.
    pub(crate) fn link_user(&self, file: FileId) {
        self.users.lock().expect("users lock poisoned").insert(file);
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Detach a file; returns the remaining user count.
    pub(crate) fn unlink_user(&self, file: FileId) -> u32 {
        self.users.lock().expect("users lock poisoned").remove(&file);
        self.refcount.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn user_count(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// First caller wins; the winner is responsible for asking the keyring
    /// to invalidate this record.
    pub(crate) fn try_mark_invalidated(&self) -> bool {
        !self.invalidated.swap(true, Ordering::AcqRel)
    }
}

impl std::fmt::Debug for MasterKeyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKeyRecord")
            .field("spec", &self.spec)
            .field("secret_present", &self.is_secret_present())
            .field("users", &self.user_count())
            .finish()
    }
}

/// The keyring collaborator: owns master key records and resolves them for
/// key setup. The engine only borrows records and asks for invalidation when
/// the last user of a revoked key detaches.
pub trait Keyring: Send + Sync {
    fn lookup_master_key(&self, spec: &KeySpecifier) -> Option<Arc<MasterKeyRecord>>;

    /// Drop the record for `spec`; it will no longer resolve for new files.
    fn invalidate(&self, spec: &KeySpecifier);

    /// Legacy fallback for V1 policies only: a process/session-scoped raw
    /// secret. Never consulted for V2, and never before the cluster-level
    /// lookup: session keys must not override administrator-installed ones.
    fn lookup_in_session_keyring(
        &self,
        descriptor: &[u8; KEY_DESCRIPTOR_SIZE],
    ) -> Option<Zeroizing<Vec<u8>>> {
        let _ = descriptor;
        None
    }
}

/// In-memory keyring: cluster-level records plus the V1 session-key store.
#[derive(Default)]
pub struct ProcessKeyring {
    keys: Mutex<HashMap<KeySpecifier, Arc<MasterKeyRecord>>>,
    session: Mutex<HashMap<[u8; KEY_DESCRIPTOR_SIZE], Zeroizing<Vec<u8>>>>,
}

impl ProcessKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a V2 master key. The specifier is derived from the secret
    /// itself, so callers learn it from the return value.
    pub fn add_key_v2(&self, secret: Vec<u8>) -> KeySpecifier {
        let spec = KeySpecifier::Identifier(hkdf::key_identifier(&secret));
        self.install(spec.clone(), secret);
        spec
    }

    /// Install a V1 master key under an explicit descriptor.
    pub fn add_key_v1(&self, descriptor: [u8; KEY_DESCRIPTOR_SIZE], secret: Vec<u8>) -> KeySpecifier {
        let spec = KeySpecifier::Descriptor(descriptor);
        self.install(spec.clone(), secret);
        spec
    }

    fn install(&self, spec: KeySpecifier, secret: Vec<u8>) {
        let secret = MasterKeySecret::new(secret);
        let mut keys = self.keys.lock().expect("keyring lock poisoned");
        match keys.get(&spec) {
            Some(record) => {
                // Already known: at most put a removed secret back
                if record.reinstate_secret(secret) {
                    tracing::info!(key = %spec, "master key secret reinstated");
                }
            }
            None => {
                tracing::info!(key = %spec, "master key installed");
                keys.insert(spec.clone(), MasterKeyRecord::new(spec, secret));
            }
        }
    }

    /// Revoke a master key: erase the secret now; the record disappears once
    /// the last file using it detaches (immediately, if none do).
    pub fn remove_key(&self, spec: &KeySpecifier) -> bool {
        let record = match self.lookup_master_key(spec) {
            Some(r) => r,
            None => return false,
        };
        record.revoke_secret();
        if record.user_count() == 0 && record.try_mark_invalidated() {
            self.invalidate(spec);
        }
        true
    }

    /// Register a session-scoped V1 fallback secret.
    pub fn add_session_key(&self, descriptor: [u8; KEY_DESCRIPTOR_SIZE], secret: Vec<u8>) {
        self.session
            .lock()
            .expect("session lock poisoned")
            .insert(descriptor, Zeroizing::new(secret));
    }
}

impl Keyring for ProcessKeyring {
    fn lookup_master_key(&self, spec: &KeySpecifier) -> Option<Arc<MasterKeyRecord>> {
        self.keys
            .lock()
            .expect("keyring lock poisoned")
            .get(spec)
            .cloned()
    }

    fn invalidate(&self, spec: &KeySpecifier) {
        if self
            .keys
            .lock()
            .expect("keyring lock poisoned")
            .remove(spec)
            .is_some()
        {
            tracing::info!(key = %spec, "master key record invalidated");
        }
    }

    fn lookup_in_session_keyring(
        &self,
        descriptor: &[u8; KEY_DESCRIPTOR_SIZE],
    ) -> Option<Zeroizing<Vec<u8>>> {
        self.session
            .lock()
            .expect("session lock poisoned")
            .get(descriptor)
            .cloned()
    }
}
