//! Anti-debug / anti-VM detection engine.
//!
//! Every probe is an independent boolean query, individually
//! fail-safe: a probe that cannot complete - unresolvable API, missing
//! platform facility, unreadable memory - reports "not detected"
//! rather than propagating anything. Aggregate checks are the
//! short-circuit OR of their probes.
//!
//! Probes reach the OS two ways: low-level facilities (PEB address,
//! cycle counter, CPUID, performance counter) go through the
//! [`Environment`] strategy so tests and future execution contexts can
//! substitute a provider; everything else is an API resolved by hash
//! through the import-hiding subsystem, so the detection engine shows
//! up in no import table.

pub mod debug;

#[cfg(feature = "anti-vm")]
pub mod vm;

use std::sync::Mutex;

pub use debug::comprehensive_debug_check;

#[cfg(feature = "anti-vm")]
pub use vm::comprehensive_vm_check;

/// Low-level execution-context facilities consumed by probes.
///
/// The production implementation is [`UserModeEnv`]; [`NullEnv`] backs
/// tests and makes every dependent probe degrade to "not detected".
/// A kernel-mode provider would implement this trait over its own
/// primitives; none ships here.
pub trait Environment: Sync {
    /// Process environment block address, if the concept exists here.
    fn peb(&self) -> Option<usize>;
    /// Monotonic-ish cycle counter.
    fn cycle_counter(&self) -> u64;
    /// High-resolution counter and its frequency.
    fn query_performance(&self) -> Option<(i64, i64)>;
    /// CPUID with ECX=0.
    fn cpuid(&self, leaf: u32) -> Option<[u32; 4]>;
}

/// The production user-mode provider.
pub struct UserModeEnv;

impl Environment for UserModeEnv {
    fn peb(&self) -> Option<usize> {
        crate::resolve::peb()
    }

    fn cycle_counter(&self) -> u64 {
        crate::entropy::cycle_counter()
    }

    fn query_performance(&self) -> Option<(i64, i64)> {
        type QpFn = unsafe extern "system" fn(*mut i64) -> i32;
        let qpc = import(K32_HASH, veil_core::hash::fnv1a(b"QueryPerformanceCounter"))?;
        let qpf = import(K32_HASH, veil_core::hash::fnv1a(b"QueryPerformanceFrequency"))?;
        let mut counter = 0i64;
        let mut freq = 0i64;
        unsafe {
            let qpf: QpFn = core::mem::transmute(qpf);
            let qpc: QpFn = core::mem::transmute(qpc);
            if qpf(&mut freq) == 0 || qpc(&mut counter) == 0 || freq == 0 {
                return None;
            }
        }
        Some((counter, freq))
    }

    fn cpuid(&self, leaf: u32) -> Option<[u32; 4]> {
        #[cfg(target_arch = "x86_64")]
        {
            let r = unsafe { core::arch::x86_64::__cpuid(leaf) };
            Some([r.eax, r.ebx, r.ecx, r.edx])
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            let _ = leaf;
            None
        }
    }
}

/// Provider with no facilities; every dependent probe reports clean.
pub struct NullEnv;

impl Environment for NullEnv {
    fn peb(&self) -> Option<usize> {
        None
    }

    fn cycle_counter(&self) -> u64 {
        0
    }

    fn query_performance(&self) -> Option<(i64, i64)> {
        None
    }

    fn cpuid(&self, _leaf: u32) -> Option<[u32; 4]> {
        None
    }
}

static USER_MODE: UserModeEnv = UserModeEnv;
static ENV_OVERRIDE: Mutex<Option<&'static dyn Environment>> = Mutex::new(None);

/// Substitute the probe provider process-wide. Intended for tests and
/// for embedding contexts with their own facilities.
pub fn set_environment(env: &'static dyn Environment) {
    *ENV_OVERRIDE.lock().unwrap_or_else(|e| e.into_inner()) = Some(env);
}

/// Restore the default user-mode provider.
pub fn reset_environment() {
    *ENV_OVERRIDE.lock().unwrap_or_else(|e| e.into_inner()) = None;
}

pub(crate) fn env() -> &'static dyn Environment {
    ENV_OVERRIDE
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .unwrap_or(&USER_MODE)
}

// Modules consulted throughout the engine.
pub(crate) const K32_HASH: u32 = veil_core::hash::fnv1a_ci(b"kernel32.dll");
pub(crate) const NTDLL_HASH: u32 = veil_core::hash::fnv1a_ci(b"ntdll.dll");
pub(crate) const USER32_HASH: u32 = veil_core::hash::fnv1a_ci(b"user32.dll");
pub(crate) const ADVAPI32_HASH: u32 = veil_core::hash::fnv1a_ci(b"advapi32.dll");

/// Hash-resolved import; `None` keeps the calling probe fail-safe.
pub(crate) fn import(module_hash: u32, fn_hash: u32) -> Option<usize> {
    crate::resolve::Resolver::global().import(module_hash, fn_hash)
}

pub(crate) fn module_loaded(module_hash: u32) -> bool {
    crate::resolve::Resolver::global().module_base(module_hash).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_env_disables_probes() {
        let env = NullEnv;
        assert_eq!(env.peb(), None);
        assert_eq!(env.query_performance(), None);
        assert_eq!(env.cpuid(1), None);
    }

    #[test]
    fn default_env_is_user_mode() {
        // must not panic on any platform; values are platform-dependent
        let e = env();
        let _ = e.peb();
        let _ = e.cycle_counter();
    }
}
