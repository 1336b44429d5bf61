//! Key-setup lifecycle under concurrency.
//!
//! Exercises the engine end to end with a counting cipher provider and
//! verifies the core invariants:
//!   1. At-most-one-publish: racing setups leave exactly one context, and
//!      losers leak no cipher contexts
//!   2. Direct-key sharing: one cipher context per (master key, mode)
//!   3. Failure unwinding: a provider rejection leaves nothing allocated
//!   4. Revocation exclusion: secret erasure waits for in-flight setups
//!   5. Refcounting: releasing the last user of a revoked key triggers
//!      exactly one keyring invalidation

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use tidefs_core::{FileId, FileKind};
use tidefs_crypto::{
    modes, CipherContext, CipherProvider, EncryptionMode, EncryptionPolicy, FileObject,
    KeySetup, KeySetupError, KeySlot, Keyring, KeySpecifier, MasterKeyRecord, ModeId,
    ProcessKeyring, KEY_IDENTIFIER_SIZE, NONCE_SIZE,
};

// ── Test doubles ────────────────────────────────────────────────────────────

/// Cipher provider whose contexts count allocation and free events, so leak
/// checks reduce to `allocated - freed == live`.
struct CountingProvider {
    allocated: AtomicUsize,
    freed: Arc<AtomicUsize>,
    rejected_modes: Mutex<HashSet<u8>>,
}

struct CountedCipher {
    mode: &'static EncryptionMode,
    freed: Arc<AtomicUsize>,
}

impl CipherContext for CountedCipher {
    fn mode(&self) -> &'static EncryptionMode {
        self.mode
    }
    fn implementation(&self) -> &str {
        "counted"
    }
}

impl Drop for CountedCipher {
    fn drop(&mut self) {
        self.freed.fetch_add(1, Ordering::SeqCst);
    }
}

impl CountingProvider {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            allocated: AtomicUsize::new(0),
            freed: Arc::new(AtomicUsize::new(0)),
            rejected_modes: Mutex::new(HashSet::new()),
        })
    }

    fn reject_mode(&self, id: ModeId) {
        self.rejected_modes.lock().unwrap().insert(id.as_byte());
    }

    fn live(&self) -> usize {
        self.allocated.load(Ordering::SeqCst) - self.freed.load(Ordering::SeqCst)
    }
}

impl CipherProvider for CountingProvider {
    fn allocate(
        &self,
        mode: &'static EncryptionMode,
        raw_key: &[u8],
    ) -> Result<Option<Arc<dyn CipherContext>>, KeySetupError> {
        if self
            .rejected_modes
            .lock()
            .unwrap()
            .contains(&mode.id.as_byte())
        {
            return Err(KeySetupError::AlgorithmUnavailable(mode.friendly_name));
        }
        if mode.id == ModeId::Null {
            return Ok(None);
        }
        assert_eq!(raw_key.len(), mode.key_size, "engine must size keys to the mode");
        self.allocated.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Arc::new(CountedCipher {
            mode,
            freed: self.freed.clone(),
        })))
    }
}

/// Keyring wrapper counting invalidation requests from the engine.
struct CountingKeyring {
    inner: ProcessKeyring,
    invalidations: AtomicUsize,
}

impl CountingKeyring {
    fn new() -> Self {
        Self {
            inner: ProcessKeyring::new(),
            invalidations: AtomicUsize::new(0),
        }
    }
}

impl Keyring for CountingKeyring {
    fn lookup_master_key(&self, spec: &KeySpecifier) -> Option<Arc<MasterKeyRecord>> {
        self.inner.lookup_master_key(spec)
    }

    fn invalidate(&self, spec: &KeySpecifier) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.inner.invalidate(spec);
    }
}

struct TestFile {
    id: FileId,
    policy: EncryptionPolicy,
    nonce: [u8; NONCE_SIZE],
    slot: KeySlot,
}

impl TestFile {
    fn new(id: FileId, policy: EncryptionPolicy) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&id.to_le_bytes());
        Self {
            id,
            policy,
            nonce,
            slot: KeySlot::new(),
        }
    }
}

impl FileObject for TestFile {
    fn id(&self) -> FileId {
        self.id
    }
    fn kind(&self) -> FileKind {
        FileKind::Regular
    }
    fn policy(&self) -> Option<EncryptionPolicy> {
        Some(self.policy.clone())
    }
    fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }
    fn key_slot(&self) -> &KeySlot {
        &self.slot
    }
}

fn xts_policy(identifier: [u8; KEY_IDENTIFIER_SIZE]) -> EncryptionPolicy {
    EncryptionPolicy::V2 {
        contents_mode: ModeId::Aes256Xts,
        filenames_mode: ModeId::Aes256CtsCbc,
        flags: 0,
        master_key_identifier: identifier,
    }
}

fn direct_key_policy(identifier: [u8; KEY_IDENTIFIER_SIZE]) -> EncryptionPolicy {
    EncryptionPolicy::V2 {
        contents_mode: ModeId::Adiantum,
        filenames_mode: ModeId::Adiantum,
        flags: tidefs_crypto::policy::POLICY_FLAG_DIRECT_KEY,
        master_key_identifier: identifier,
    }
}

fn identifier_of(spec: &KeySpecifier) -> [u8; KEY_IDENTIFIER_SIZE] {
    match spec {
        KeySpecifier::Identifier(id) => *id,
        KeySpecifier::Descriptor(_) => panic!("expected a V2 identifier"),
    }
}

// ── Invariant 1: at-most-one-publish, no leaked contexts ────────────────────

#[test]
fn concurrent_setup_publishes_exactly_once() {
    const THREADS: usize = 16;

    let keyring = Arc::new(ProcessKeyring::new());
    let spec = keyring.add_key_v2(vec![0xaa; 64]);
    let provider = CountingProvider::new();
    let setup = Arc::new(KeySetup::new(keyring, provider.clone()));

    let file = Arc::new(TestFile::new(1, xts_policy(identifier_of(&spec))));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let setup = setup.clone();
            let file = file.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                setup.ensure_key_setup(file.as_ref()).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // Exactly one context visible, exactly one cipher context still live:
    // every losing thread's allocation was freed
    assert!(setup.has_key(file.as_ref()));
    assert_eq!(provider.live(), 1);

    setup.release_key_context(file.as_ref());
    assert_eq!(provider.live(), 0, "release must free the winner's context");
}

// ── Invariant 2: direct-key contexts are shared ─────────────────────────────

#[test]
fn direct_key_files_share_one_cipher_context() {
    let keyring = Arc::new(ProcessKeyring::new());
    let spec = keyring.add_key_v2(vec![0xaa; 64]);
    let provider = CountingProvider::new();
    let setup = KeySetup::new(keyring, provider.clone());

    let identifier = identifier_of(&spec);
    let a = TestFile::new(1, direct_key_policy(identifier));
    let b = TestFile::new(2, direct_key_policy(identifier));

    setup.ensure_key_setup(&a).unwrap();
    setup.ensure_key_setup(&b).unwrap();

    let ctx_a = a.key_slot().get().unwrap();
    let ctx_b = b.key_slot().get().unwrap();
    assert!(ctx_a.is_direct_key());
    assert!(Arc::ptr_eq(
        ctx_a.cipher().unwrap(),
        ctx_b.cipher().unwrap()
    ));
    assert_eq!(provider.live(), 1, "one shared context, not two");

    // Releasing one file must not tear down the shared context
    setup.release_key_context(&a);
    assert_eq!(provider.live(), 1);
    setup.release_key_context(&b);
}

#[test]
fn racing_direct_key_setups_leak_nothing() {
    const THREADS: usize = 12;

    let keyring = Arc::new(ProcessKeyring::new());
    let spec = keyring.add_key_v2(vec![0xaa; 64]);
    let provider = CountingProvider::new();
    let setup = Arc::new(KeySetup::new(keyring, provider.clone()));

    let identifier = identifier_of(&spec);
    let files: Vec<_> = (0..THREADS as u64)
        .map(|id| Arc::new(TestFile::new(id, direct_key_policy(identifier))))
        .collect();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = files
        .iter()
        .map(|file| {
            let setup = setup.clone();
            let file = file.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                setup.ensure_key_setup(file.as_ref()).unwrap();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    // All mode-key install race losers must have freed their contexts
    assert_eq!(provider.live(), 1);
    let first = files[0].key_slot().get().unwrap();
    for file in &files[1..] {
        let ctx = file.key_slot().get().unwrap();
        assert!(Arc::ptr_eq(first.cipher().unwrap(), ctx.cipher().unwrap()));
    }
}

// ── Invariant 3: failures unwind cleanly ────────────────────────────────────

#[test]
fn rejected_algorithm_surfaces_and_leaks_nothing() {
    let keyring = Arc::new(ProcessKeyring::new());
    let spec = keyring.add_key_v2(vec![0xaa; 64]);
    let provider = CountingProvider::new();
    provider.reject_mode(ModeId::Aes128Cbc);
    let setup = KeySetup::new(keyring, provider.clone());

    let policy = EncryptionPolicy::V2 {
        contents_mode: ModeId::Aes128Cbc,
        filenames_mode: ModeId::Aes128CtsCbc,
        flags: 0,
        master_key_identifier: identifier_of(&spec),
    };
    let file = TestFile::new(1, policy);

    let err = setup.ensure_key_setup(&file).unwrap_err();
    assert!(matches!(err, KeySetupError::AlgorithmUnavailable(_)));
    assert!(!setup.has_key(&file));
    assert_eq!(provider.live(), 0, "no ESSIV or cipher context may survive");
}

// ── Invariant 4: revocation excludes in-flight setups ───────────────────────

#[test]
fn revocation_waits_for_secret_readers() {
    let keyring = Arc::new(ProcessKeyring::new());
    let spec = keyring.add_key_v2(vec![0xaa; 64]);
    let record = keyring.lookup_master_key(&spec).unwrap();

    // Simulate an in-flight setup holding the secret read lock
    let guard = record.read_secret();
    assert!(guard.is_some());

    let revoked = Arc::new(AtomicUsize::new(0));
    let revoker = {
        let record = record.clone();
        let revoked = revoked.clone();
        thread::spawn(move || {
            record.revoke_secret();
            revoked.store(1, Ordering::SeqCst);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        revoked.load(Ordering::SeqCst),
        0,
        "revocation must block while a setup reads the secret"
    );
    // The reader observes the intact secret for as long as it holds the lock
    assert_eq!(guard.as_ref().unwrap().len(), 64);

    drop(guard);
    revoker.join().unwrap();
    assert_eq!(revoked.load(Ordering::SeqCst), 1);
    assert!(!record.is_secret_present());
}

// ── Invariant 5: exactly one invalidation at refcount zero ──────────────────

#[test]
fn releasing_last_user_of_revoked_key_invalidates_once() {
    const FILES: u64 = 10;

    let keyring = Arc::new(CountingKeyring::new());
    let spec = keyring.inner.add_key_v2(vec![0xaa; 64]);
    let provider = CountingProvider::new();
    let setup = Arc::new(KeySetup::new(keyring.clone(), provider.clone()));

    let identifier = identifier_of(&spec);
    let files: Vec<_> = (0..FILES)
        .map(|id| Arc::new(TestFile::new(id, xts_policy(identifier))))
        .collect();
    for file in &files {
        setup.ensure_key_setup(file.as_ref()).unwrap();
    }

    let record = keyring.lookup_master_key(&spec).unwrap();
    assert_eq!(record.user_count(), FILES as u32);

    // Revoke while every file still references the key
    record.revoke_secret();
    for file in &files {
        assert!(setup.should_evict(file.as_ref()));
    }

    // Release concurrently; exactly one releaser must invalidate
    let barrier = Arc::new(Barrier::new(FILES as usize));
    let handles: Vec<_> = files
        .iter()
        .map(|file| {
            let setup = setup.clone();
            let file = file.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                setup.release_key_context(file.as_ref());
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(keyring.invalidations.load(Ordering::SeqCst), 1);
    assert!(keyring.lookup_master_key(&spec).is_none());
    assert_eq!(provider.live(), 0);
}

// ── Sanity: modes resolve consistently from the public API ──────────────────

#[test]
fn mode_table_reachable_from_public_api() {
    let xts = modes::resolve(ModeId::Aes256Xts);
    assert_eq!(xts.key_size, 64);
    assert!(!xts.needs_essiv);
}
