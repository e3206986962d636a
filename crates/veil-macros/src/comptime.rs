//! Per-call-site deterministic-enough randomness for macro expansion.
//!
//! Each expansion seeds a ChaCha stream from the wall clock, a
//! process-wide expansion counter and a purpose tag, so two call sites
//! expanded in the same build get unrelated values and two builds of
//! the same source differ. This is build diversity, not cryptography.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::atomic::{AtomicU64, Ordering};

static EXPANSION_COUNTER: AtomicU64 = AtomicU64::new(0);

fn seed(purpose: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in purpose {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01B3);
    }
    h ^= std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x5EED);
    h ^= EXPANSION_COUNTER
        .fetch_add(1, Ordering::Relaxed)
        .wrapping_mul(0x9E37_79B9_7F4A_7C15);
    h
}

pub fn next_u64(purpose: &[u8]) -> u64 {
    ChaCha8Rng::seed_from_u64(seed(purpose)).gen()
}

pub fn rng(purpose: &[u8]) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed(purpose))
}

/// Parsed `(lo, hi)` arguments for `comptime_rand_range!`.
pub struct RangeArgs {
    pub lo: u64,
    pub hi: u64,
    pub hi_tokens: proc_macro2::TokenStream,
}

impl syn::parse::Parse for RangeArgs {
    fn parse(input: syn::parse::ParseStream) -> syn::Result<Self> {
        let lo: syn::LitInt = input.parse()?;
        input.parse::<syn::Token![,]>()?;
        let hi: syn::LitInt = input.parse()?;
        Ok(RangeArgs {
            lo: lo.base10_parse()?,
            hi: hi.base10_parse()?,
            hi_tokens: quote::quote!(#hi),
        })
    }
}
