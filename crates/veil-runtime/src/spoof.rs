//! Return-address spoofing.
//!
//! A spoofed call routes through a generated thunk that pushes a
//! stack-fixup gadget (found inside ntdll's code) before jumping to the
//! real target: the callee - and anything walking its stack - sees a
//! return address inside ntdll instead of this module. The gadget's
//! epilogue then hands control back to the true caller, so the call's
//! observable behavior is unchanged.
//!
//! Works on Windows x86_64 when a suitable gadget exists; everywhere
//! else the wrapper degrades to a direct call.

use std::sync::OnceLock;

use veil_core::pe;

use crate::raw_fn::RawFn;
use crate::resolve::{self, Resolver};

const NTDLL_HASH: u32 = veil_core::hash::fnv1a_ci(b"ntdll.dll");

fn ntdll_gadget(pattern: &[u8]) -> Option<usize> {
    let resolver = Resolver::global();
    let ntdll = resolver.module_base(NTDLL_HASH)?;
    let image = unsafe { resolve::module_image(ntdll)? };
    Some(ntdll + pe::find_in_exec_sections(image, pattern)? as usize)
}

/// A bare `ret` inside ntdll. Resolved once per process.
pub fn ret_gadget() -> Option<usize> {
    static GADGET: OnceLock<Option<usize>> = OnceLock::new();
    *GADGET.get_or_init(|| ntdll_gadget(&[0xC3]))
}

/// `add rsp, 8; ret` - the fixup frame the spoof thunk pushes.
fn fixup_gadget() -> Option<usize> {
    static GADGET: OnceLock<Option<usize>> = OnceLock::new();
    *GADGET.get_or_init(|| ntdll_gadget(&[0x48, 0x83, 0xC4, 0x08, 0xC3]))
}

/// A call wrapper whose callee observes an ntdll return address.
pub struct SpoofedCall<F: RawFn> {
    thunk: Option<crate::thunk::ThunkPage>,
    real: F,
}

impl<F: RawFn> SpoofedCall<F> {
    pub fn new(func: F) -> Self {
        let thunk =
            fixup_gadget().and_then(|gadget| crate::thunk::build_spoof_thunk(func.addr(), gadget));
        Self { thunk, real: func }
    }

    /// Whether calls actually spoof on this platform, or fall back to
    /// direct dispatch.
    pub fn is_spoofing(&self) -> bool {
        self.thunk.is_some()
    }

    /// The callable: the spoof thunk where available, the real target
    /// otherwise.
    #[inline(never)]
    pub fn get(&self) -> F {
        match &self.thunk {
            Some(page) => unsafe { F::from_addr(page.addr()) },
            None => self.real,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn triple(x: u64) -> u64 {
        x * 3
    }

    #[test]
    fn fallback_path_calls_directly() {
        let sc = SpoofedCall::new(triple as fn(u64) -> u64);
        // regardless of whether a gadget was found, behavior holds
        assert_eq!(sc.get()(14), 42);
    }

    #[cfg(all(windows, target_arch = "x86_64"))]
    mod live {
        use super::super::*;

        fn answer() -> u64 {
            42
        }

        #[test]
        fn gadgets_resolve_inside_ntdll() {
            let ret = ret_gadget().expect("ntdll always contains a ret");
            let bytes = crate::mem::try_read_bytes(ret, 1).unwrap();
            assert_eq!(bytes[0], 0xC3);
        }

        #[test]
        fn spoofed_call_preserves_results() {
            let sc = SpoofedCall::new(answer as fn() -> u64);
            for _ in 0..100 {
                assert_eq!(sc.get()(), 42);
            }
        }

        #[test]
        fn spoofed_call_with_args() {
            fn combine(a: u64, b: u64, c: u64, d: u64) -> u64 {
                a.wrapping_mul(1000) + b * 100 + c * 10 + d
            }
            let sc = SpoofedCall::new(combine as fn(u64, u64, u64, u64) -> u64);
            assert_eq!(sc.get()(1, 2, 3, 4), 1234);
        }
    }
}
