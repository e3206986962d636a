//! Code integrity: hook signatures and tamper detection.
//!
//! [`detect_hook`] pattern-matches a prologue against known detour
//! shapes - heuristic, with no guarantee of catching a careful hook.
//! [`IntegrityChecked`] is the stronger form: it snapshots a hash of
//! the function's code at construction and periodically re-verifies,
//! catching any byte-level patch regardless of shape.

use std::sync::atomic::{AtomicU32, Ordering};

use veil_core::pe;

use crate::raw_fn::RawFn;

/// Invocations between integrity re-verifications.
pub const INTEGRITY_CHECK_INTERVAL: u32 = 100;

/// How many prologue bytes [`detect_hook`] inspects.
const PROLOGUE_LEN: usize = 16;

fn read_code(addr: usize, len: usize) -> Option<Vec<u8>> {
    #[cfg(windows)]
    {
        crate::mem::try_read_bytes(addr, len)
    }
    #[cfg(not(windows))]
    {
        // our own mapped code is readable; foreign addresses are not a
        // supported input off Windows
        if addr == 0 || len == 0 {
            return None;
        }
        Some(unsafe { core::slice::from_raw_parts(addr as *const u8, len) }.to_vec())
    }
}

/// Whether the first bytes at `addr` look like a hook trampoline
/// (absolute/relative jump, push-ret, breakpoint byte).
pub fn detect_hook(addr: usize) -> bool {
    match read_code(addr, PROLOGUE_LEN) {
        Some(code) => pe::hook_signature(&code),
        None => false,
    }
}

/// Typed convenience over [`detect_hook`].
pub fn detect_hook_fn<F: RawFn>(func: F) -> bool {
    detect_hook(func.addr())
}

/// A function wrapper that notices when its code changes.
///
/// The expected hash is snapshotted at construction; every
/// [`INTEGRITY_CHECK_INTERVAL`]th invocation recomputes it and routes a
/// mismatch into the policy checkpoint as a positive detection.
pub struct IntegrityChecked<F: RawFn> {
    func: F,
    code_len: usize,
    expected: Option<u32>,
    checks: AtomicU32,
}

impl<F: RawFn> IntegrityChecked<F> {
    /// Snapshot `code_len` bytes of `func`'s code. If the code cannot
    /// be read, the wrapper still dispatches but never verifies.
    pub fn new(func: F, code_len: usize) -> Self {
        let expected = read_code(func.addr(), code_len).map(|code| pe::code_hash(&code));
        Self {
            func,
            code_len,
            expected,
            checks: AtomicU32::new(0),
        }
    }

    /// Recompute and compare now.
    pub fn verify(&self) -> bool {
        match self.expected {
            Some(expected) => read_code(self.func.addr(), self.code_len)
                .map(|code| pe::code_hash(&code) == expected)
                .unwrap_or(false),
            None => true,
        }
    }

    /// The callable, with the periodic tamper check applied.
    #[inline(never)]
    pub fn get(&self) -> F {
        let count = self.checks.fetch_add(1, Ordering::Relaxed) + 1;
        if count % INTEGRITY_CHECK_INTERVAL == 0 && !self.verify() {
            crate::policy::enforce(true);
        }
        self.func
    }
}
