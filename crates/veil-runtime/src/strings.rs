//! Encrypted string containers.
//!
//! Lifecycle of every container: constructed encrypted (at compile time
//! when the ciphertext comes from a macro or a `const` initializer),
//! decrypted lazily on first access, re-encrypted when the storage ends
//! or - for the layered variant - periodically during use.
//!
//! The buffer is always in exactly one of two representations, and the
//! atomic `decrypted` flag matches it at every point where both are
//! observable: the flag is checked before the lock, re-checked under
//! it, and every representation change happens with the lock held and
//! finishes with the flag store. Access returns a guard that keeps the
//! lock, so a plaintext view can never overlap a re-encryption - the
//! "don't retain the pointer across a transition" rule from the C
//! world becomes a borrow the compiler enforces.

use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use veil_core::cipher::{self, XteaKey};

#[inline(always)]
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[inline(always)]
fn str_from_nul_terminated(bytes: &[u8]) -> &str {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    core::str::from_utf8(&bytes[..end]).unwrap_or("")
}

// ─── EncryptedString ─────────────────────────────────────────

/// A fixed-size string kept XTEA-encrypted at rest.
pub struct EncryptedString<const N: usize> {
    buf: Mutex<[u8; N]>,
    decrypted: AtomicBool,
    key: XteaKey,
}

impl<const N: usize> EncryptedString<N> {
    /// Encrypt `plain` under `key`. In a `const`/`static` context the
    /// forward cipher runs at compile time and only ciphertext reaches
    /// the binary.
    pub const fn new(plain: [u8; N], key: XteaKey) -> Self {
        Self {
            buf: Mutex::new(cipher::encrypt_array(plain, &key)),
            decrypted: AtomicBool::new(false),
            key,
        }
    }

    /// Adopt ciphertext produced elsewhere (the `protect_str!` macro
    /// encrypts at expansion time).
    pub const fn from_ciphertext(cipher_bytes: [u8; N], key: XteaKey) -> Self {
        Self {
            buf: Mutex::new(cipher_bytes),
            decrypted: AtomicBool::new(false),
            key,
        }
    }

    /// Decrypt if at rest and return a plaintext view. The guard holds
    /// the container lock; drop it before calling [`seal`](Self::seal)
    /// on the same thread.
    #[inline(never)]
    pub fn get(&self) -> Plain<'_, N> {
        // relaxed pre-check skips nothing here (the guard needs the
        // lock anyway) but keeps the flag the first observed effect,
        // matching the ordering discipline of the sealing side
        let _ = self.decrypted.load(Ordering::Acquire);
        let mut guard = lock_ignore_poison(&self.buf);
        if !self.decrypted.load(Ordering::Relaxed) {
            cipher::decrypt_in_place(&mut *guard, &self.key);
            self.decrypted.store(true, Ordering::Release);
        }
        Plain { guard }
    }

    /// Re-encrypt now instead of waiting for drop.
    pub fn seal(&self) {
        if !self.decrypted.load(Ordering::Acquire) {
            return;
        }
        let mut guard = lock_ignore_poison(&self.buf);
        if self.decrypted.load(Ordering::Relaxed) {
            cipher::encrypt_in_place(&mut *guard, &self.key);
            self.decrypted.store(false, Ordering::Release);
        }
    }

    /// Copy of the at-rest representation, or `None` while decrypted.
    pub fn at_rest(&self) -> Option<[u8; N]> {
        let guard = lock_ignore_poison(&self.buf);
        if self.decrypted.load(Ordering::Relaxed) {
            None
        } else {
            Some(*guard)
        }
    }
}

impl<const N: usize> Drop for EncryptedString<N> {
    fn drop(&mut self) {
        // storage ends: leave nothing readable behind
        if self.decrypted.load(Ordering::Relaxed) {
            let guard = self.buf.get_mut();
            let buf = match guard {
                Ok(b) => b,
                Err(_) => return,
            };
            cipher::encrypt_in_place(buf, &self.key);
            self.decrypted.store(false, Ordering::Relaxed);
        }
    }
}

/// Plaintext view of an [`EncryptedString`]; holds the container lock.
pub struct Plain<'a, const N: usize> {
    guard: MutexGuard<'a, [u8; N]>,
}

impl<const N: usize> Plain<'_, N> {
    pub fn as_bytes(&self) -> &[u8] {
        &*self.guard
    }
}

impl<const N: usize> Deref for Plain<'_, N> {
    type Target = str;

    fn deref(&self) -> &str {
        str_from_nul_terminated(&*self.guard)
    }
}

// ─── LayeredString ───────────────────────────────────────────

/// Re-keying strategy for [`LayeredString`]. The container invokes it
/// on schedule; strategies decide how the next key is derived.
pub trait Rekey: Sync {
    fn next(&self, base: XteaKey, generation: u32) -> XteaKey;
}

/// Default strategy: mix fresh runtime entropy into the base key.
pub struct EntropyRekey;

impl Rekey for EntropyRekey {
    fn next(&self, base: XteaKey, generation: u32) -> XteaKey {
        let entropy = crate::entropy::runtime_rand() ^ (generation as u64).rotate_left(17);
        base.mixed_with(XteaKey::from_seed(entropy))
    }
}

struct LayeredInner<const N: usize> {
    buf: [u8; N],
    key: XteaKey,
}

/// Self-re-keying string: every [`REKEY_INTERVAL`]th access the buffer
/// is re-encrypted under a freshly derived key, bounding the window any
/// single key stays useful. The generation counter is observable so
/// the re-keying schedule is testable.
pub struct LayeredString<const N: usize, R: Rekey = EntropyRekey> {
    inner: Mutex<LayeredInner<N>>,
    decrypted: AtomicBool,
    access_count: AtomicU32,
    generation: AtomicU32,
    base_key: XteaKey,
    strategy: R,
}

/// Accesses between polymorphic re-keys.
pub const REKEY_INTERVAL: u32 = 10;

impl<const N: usize> LayeredString<N, EntropyRekey> {
    pub const fn new(plain: [u8; N], key: XteaKey) -> Self {
        Self::with_strategy(cipher::encrypt_array(plain, &key), key, EntropyRekey)
    }

    pub const fn from_ciphertext(cipher_bytes: [u8; N], key: XteaKey) -> Self {
        Self::with_strategy(cipher_bytes, key, EntropyRekey)
    }
}

impl<const N: usize, R: Rekey> LayeredString<N, R> {
    /// Adopt ciphertext with an explicit re-keying strategy.
    pub const fn with_strategy(cipher_bytes: [u8; N], key: XteaKey, strategy: R) -> Self {
        Self {
            inner: Mutex::new(LayeredInner {
                buf: cipher_bytes,
                key,
            }),
            decrypted: AtomicBool::new(false),
            access_count: AtomicU32::new(0),
            generation: AtomicU32::new(0),
            base_key: key,
            strategy,
        }
    }

    /// Current key generation: 0 until the first re-key.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }

    #[inline(never)]
    pub fn get(&self) -> LayeredPlain<'_, N> {
        let _ = self.decrypted.load(Ordering::Acquire);
        let mut guard = lock_ignore_poison(&self.inner);
        if !self.decrypted.load(Ordering::Relaxed) {
            let inner = &mut *guard;
            cipher::decrypt_in_place(&mut inner.buf, &inner.key);
            self.decrypted.store(true, Ordering::Release);
        }

        let count = self.access_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % REKEY_INTERVAL == 0 {
            // polymorphic transition: pass through the at-rest form
            // under the next generation's key, which becomes the key
            // for every later rest transition
            let generation = self.generation.load(Ordering::Relaxed) + 1;
            let next_key = self.strategy.next(self.base_key, generation);
            let inner = &mut *guard;
            cipher::encrypt_in_place(&mut inner.buf, &next_key);
            cipher::decrypt_in_place(&mut inner.buf, &next_key);
            inner.key = next_key;
            self.generation.store(generation, Ordering::Relaxed);
        }

        LayeredPlain { guard }
    }

    pub fn seal(&self) {
        if !self.decrypted.load(Ordering::Acquire) {
            return;
        }
        let mut guard = lock_ignore_poison(&self.inner);
        if self.decrypted.load(Ordering::Relaxed) {
            let inner = &mut *guard;
            cipher::encrypt_in_place(&mut inner.buf, &inner.key);
            self.decrypted.store(false, Ordering::Release);
        }
    }
}

impl<const N: usize, R: Rekey> Drop for LayeredString<N, R> {
    fn drop(&mut self) {
        if self.decrypted.load(Ordering::Relaxed) {
            if let Ok(inner) = self.inner.get_mut() {
                cipher::encrypt_in_place(&mut inner.buf, &inner.key);
                self.decrypted.store(false, Ordering::Relaxed);
            }
        }
    }
}

/// Plaintext view of a [`LayeredString`]; holds the container lock.
pub struct LayeredPlain<'a, const N: usize> {
    guard: MutexGuard<'a, LayeredInner<N>>,
}

impl<const N: usize> LayeredPlain<'_, N> {
    pub fn as_bytes(&self) -> &[u8] {
        &self.guard.buf
    }
}

impl<const N: usize> Deref for LayeredPlain<'_, N> {
    type Target = str;

    fn deref(&self) -> &str {
        str_from_nul_terminated(&self.guard.buf)
    }
}

// ─── StackString ─────────────────────────────────────────────

/// Scope-local plaintext copy of an encrypted string. The backing
/// container can re-seal immediately; this buffer is wiped with
/// volatile writes when the scope ends, on every exit path.
pub struct StackString<const N: usize> {
    buf: [u8; N],
}

impl<const N: usize> StackString<N> {
    pub fn new(src: &EncryptedString<N>) -> Self {
        let plain = src.get();
        let mut buf = [0u8; N];
        buf.copy_from_slice(plain.as_bytes());
        Self { buf }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

impl<const N: usize> Deref for StackString<N> {
    type Target = str;

    fn deref(&self) -> &str {
        str_from_nul_terminated(&self.buf)
    }
}

impl<const N: usize> Drop for StackString<N> {
    fn drop(&mut self) {
        for b in self.buf.iter_mut() {
            unsafe {
                core::ptr::write_volatile(b, 0);
            }
        }
        core::sync::atomic::compiler_fence(core::sync::atomic::Ordering::SeqCst);
    }
}

// ─── EncryptedWString ────────────────────────────────────────

/// UTF-16 units ciphered block-compatibly with the byte path: four
/// units form one XTEA block through their little-endian serialization,
/// trailing units take the per-byte tail mask.
const fn wcrypt<const N: usize>(mut units: [u16; N], key: &XteaKey, forward: bool) -> [u16; N] {
    let mut i = 0;
    while i + 4 <= N {
        let v0 = units[i] as u32 | (units[i + 1] as u32) << 16;
        let v1 = units[i + 2] as u32 | (units[i + 3] as u32) << 16;
        let (v0, v1) = if forward {
            cipher::encrypt_block(v0, v1, key)
        } else {
            cipher::decrypt_block(v0, v1, key)
        };
        units[i] = v0 as u16;
        units[i + 1] = (v0 >> 16) as u16;
        units[i + 2] = v1 as u16;
        units[i + 3] = (v1 >> 16) as u16;
        i += 4;
    }
    while i < N {
        let lo = cipher::tail_mask(key, i * 2) as u16;
        let hi = cipher::tail_mask(key, i * 2 + 1) as u16;
        units[i] ^= lo | (hi << 8);
        i += 1;
    }
    units
}

/// Wide-string sibling of [`EncryptedString`], for loader-facing UTF-16
/// literals.
pub struct EncryptedWString<const N: usize> {
    buf: Mutex<[u16; N]>,
    decrypted: AtomicBool,
    key: XteaKey,
}

impl<const N: usize> EncryptedWString<N> {
    pub const fn new(plain: [u16; N], key: XteaKey) -> Self {
        Self {
            buf: Mutex::new(wcrypt(plain, &key, true)),
            decrypted: AtomicBool::new(false),
            key,
        }
    }

    pub const fn from_ciphertext(cipher_units: [u16; N], key: XteaKey) -> Self {
        Self {
            buf: Mutex::new(cipher_units),
            decrypted: AtomicBool::new(false),
            key,
        }
    }

    #[inline(never)]
    pub fn get(&self) -> WidePlain<'_, N> {
        let _ = self.decrypted.load(Ordering::Acquire);
        let mut guard = lock_ignore_poison(&self.buf);
        if !self.decrypted.load(Ordering::Relaxed) {
            *guard = wcrypt(*guard, &self.key, false);
            self.decrypted.store(true, Ordering::Release);
        }
        WidePlain { guard }
    }

    pub fn seal(&self) {
        if !self.decrypted.load(Ordering::Acquire) {
            return;
        }
        let mut guard = lock_ignore_poison(&self.buf);
        if self.decrypted.load(Ordering::Relaxed) {
            *guard = wcrypt(*guard, &self.key, true);
            self.decrypted.store(false, Ordering::Release);
        }
    }
}

impl<const N: usize> Drop for EncryptedWString<N> {
    fn drop(&mut self) {
        if self.decrypted.load(Ordering::Relaxed) {
            if let Ok(buf) = self.buf.get_mut() {
                *buf = wcrypt(*buf, &self.key, true);
                self.decrypted.store(false, Ordering::Relaxed);
            }
        }
    }
}

/// Plaintext view of an [`EncryptedWString`]; derefs to the unit slice
/// including the terminator.
pub struct WidePlain<'a, const N: usize> {
    guard: MutexGuard<'a, [u16; N]>,
}

impl<const N: usize> Deref for WidePlain<'_, N> {
    type Target = [u16];

    fn deref(&self) -> &[u16] {
        &*self.guard
    }
}

// ─── Tests ───────────────────────────────────────────────────
