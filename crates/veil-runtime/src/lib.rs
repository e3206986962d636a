//! Runtime half of the veil protection toolkit.
//!
//! Containers keep secrets encrypted at rest and transiently exposed at
//! use; the detection engine answers "is something watching?" without
//! crashing when the answer is hard to get; the resolution subsystem
//! finds OS entry points by hash instead of through the import table.
//!
//! Capability features mirror the module map - each subsystem can be
//! compiled out independently, and the features that consume runtime
//! entropy declare that dependency in `Cargo.toml` rather than failing
//! at link time.

/// Baked at build time; salts timing thresholds and derived keys so no
/// two builds share patchable constants.
pub const BUILD_SEED: u64 = include!(concat!(env!("OUT_DIR"), "/build_seed.rs"));

pub mod mem;
pub mod policy;
pub mod raw_fn;
pub mod sealed;

#[cfg(feature = "entropy")]
pub mod entropy;

#[cfg(feature = "string-encryption")]
pub mod strings;

#[cfg(feature = "value-obfuscation")]
pub mod value;

#[cfg(feature = "data-hiding")]
pub mod scatter;

#[cfg(feature = "control-flow")]
pub mod opaque;

#[cfg(feature = "control-flow")]
pub mod flatten;

#[cfg(feature = "import-hiding")]
pub mod resolve;

#[cfg(feature = "syscalls")]
pub mod syscall;

#[cfg(feature = "anti-debug")]
pub mod detect;

#[cfg(feature = "function-obfuscation")]
pub(crate) mod thunk;

#[cfg(feature = "function-obfuscation")]
pub mod funcs;

#[cfg(feature = "function-obfuscation")]
pub mod spoof;

#[cfg(feature = "integrity")]
pub mod integrity;
