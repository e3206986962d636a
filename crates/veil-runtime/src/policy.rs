//! Detection-response policy.
//!
//! The engine never decides for itself what a positive detection means;
//! the embedding application configures one process-wide [`Policy`] and
//! every checkpoint honors it uniformly:
//!
//! - `Ignore`    - detections are observable through the query API only.
//! - `Terminate` - abrupt, unconditional process abort. No unwinding,
//!                 no cleanup, by design.
//! - `Fabricate` - a process-wide poison is set; readers that consult
//!                 [`fabricated_u64`] start producing plausible garbage.
//!
//! The default is `Ignore`: a library must not crash its host unless
//! the embedder explicitly opted in.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use veil_core::mix::mix64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Detections have no side effect.
    Ignore,
    /// Abort the process on detection.
    Terminate,
    /// Poison derived values on detection.
    Fabricate,
}

static POLICY: AtomicU8 = AtomicU8::new(0);
static POISON: AtomicU64 = AtomicU64::new(0);

pub fn set_policy(policy: Policy) {
    let v = match policy {
        Policy::Ignore => 0,
        Policy::Terminate => 1,
        Policy::Fabricate => 2,
    };
    POLICY.store(v, Ordering::SeqCst);
}

pub fn policy() -> Policy {
    match POLICY.load(Ordering::SeqCst) {
        1 => Policy::Terminate,
        2 => Policy::Fabricate,
        _ => Policy::Ignore,
    }
}

/// Whether a Fabricate-policy detection has fired.
pub fn poisoned() -> bool {
    POISON.load(Ordering::Relaxed) != 0
}

/// Clear the poison. Test hook; production code has no reason to forgive.
pub fn clear_poison() {
    POISON.store(0, Ordering::SeqCst);
}

/// Plausible-looking garbage derived from the poison and a caller seed.
/// Returns `seed`-derived stable values, so fabricated data is
/// internally consistent rather than visibly random per read.
pub fn fabricated_u64(seed: u64) -> u64 {
    mix64(seed ^ POISON.load(Ordering::Relaxed))
}

/// Apply the configured policy to a detection result. The `Terminate`
/// arm never returns.
pub fn enforce(detected: bool) {
    if !detected {
        return;
    }
    match policy() {
        Policy::Ignore => {}
        Policy::Terminate => std::process::abort(),
        Policy::Fabricate => {
            let marker = mix64(0xFAB5_EED0 ^ POISON.load(Ordering::Relaxed)) | 1;
            POISON.fetch_or(marker, Ordering::SeqCst);
        }
    }
}

/// Protection checkpoint: run the deterministic debug probes and apply
/// the policy. Timing probes are deliberately excluded here - they are
/// advisory and must never gate a destructive response on their own.
pub fn checkpoint() {
    #[cfg(feature = "anti-debug")]
    {
        let detected = crate::detect::debug::debugger_present()
            || crate::detect::debug::hardware_breakpoints()
            || crate::detect::debug::debug_port_open();
        enforce(detected);
    }
}
