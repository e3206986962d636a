//! veil - a code-protection toolkit for native binaries.
//!
//! String literals, values and function pointers stay encrypted at rest
//! and are transiently exposed at use; control flow can be flattened
//! into encrypted-state dispatch loops salted with dead blocks; a
//! battery of fail-safe probes detects debuggers, hypervisors and
//! sandboxes; and OS entry points resolve by name hash instead of
//! through the import table.
//!
//! ```no_run
//! use veil::policy::Policy;
//!
//! // what a positive detection means is the embedder's decision
//! veil::policy::set_policy(Policy::Ignore);
//!
//! let greeting = veil::protect_str!("hello");
//! assert_eq!(&*greeting, "hello");
//!
//! if veil::detect::comprehensive_debug_check() {
//!     // advisory query; the policy checkpoint is the enforcing path
//! }
//! ```
//!
//! None of the ciphers here are security-grade and none of the probes
//! are evasion-proof; the point is raising the cost of analysis, not
//! winning it outright.

// algorithm layer
pub use veil_core::{cipher, flow, hash, mba, mix, pe};

// runtime layer
pub use veil_runtime::{mem, policy, raw_fn, sealed, BUILD_SEED};

#[cfg(feature = "entropy")]
pub use veil_runtime::entropy;

#[cfg(feature = "string-encryption")]
pub use veil_runtime::strings;

#[cfg(feature = "value-obfuscation")]
pub use veil_runtime::value;

#[cfg(feature = "data-hiding")]
pub use veil_runtime::scatter;

#[cfg(feature = "control-flow")]
pub use veil_runtime::{flatten, opaque};

#[cfg(feature = "anti-debug")]
pub use veil_runtime::detect;

#[cfg(feature = "import-hiding")]
pub use veil_runtime::resolve;

#[cfg(feature = "syscalls")]
pub use veil_runtime::syscall;

#[cfg(feature = "function-obfuscation")]
pub use veil_runtime::{funcs, spoof};

#[cfg(feature = "integrity")]
pub use veil_runtime::integrity;

// macro layer
pub use veil_macros::{
    comptime_rand, comptime_rand_range, hash, hash_ci, protect_const, protect_str,
    protect_str_layered, protect_wstr,
};

#[cfg(feature = "control-flow")]
pub use veil_macros::{opaque_false, opaque_true};

/// A branch that statically appears conditional on an opaque predicate.
/// Semantically identical to a plain `if`.
///
/// ```ignore
/// veil::obf_if!(input > 10, {
///     expensive_path();
/// }, {
///     cheap_path();
/// });
/// ```
#[cfg(feature = "control-flow")]
#[macro_export]
macro_rules! obf_if {
    ($cond:expr, $then:block) => {
        if $crate::opaque_true!() && ($cond) $then
    };
    ($cond:expr, $then:block, $else:block) => {
        if $crate::opaque_true!() && ($cond) $then
        else if $crate::opaque_true!() $else
    };
}
