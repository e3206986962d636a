//! Runtime entropy and fast non-cryptographic randomness.
//!
//! The seed combines sources that differ per execution - cycle counter,
//! process id, a stack address, a heap allocation address, wall time -
//! and whitens them through the avalanche mixer. The documented
//! contract is "unique per process execution"; an adversary who can
//! read these sources can reproduce the stream, and that is fine: keys
//! derived here only need to differ between runs, not resist cryptanalysis.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use veil_core::mix::{mix64, xorshift64_star};

#[inline(always)]
pub(crate) fn cycle_counter() -> u64 {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
    #[cfg(target_arch = "x86")]
    unsafe {
        core::arch::x86::_rdtsc()
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "x86")))]
    {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0)
    }
}

/// Gather and mix a fresh seed. Every call samples anew.
pub fn entropy_seed() -> u64 {
    let mut e = cycle_counter();

    // ASLR makes these differ per run
    e ^= (std::process::id() as u64) << 32;
    let stack_probe = 0u8;
    e ^= &stack_probe as *const u8 as u64;
    let heap_probe = Box::new(0u8);
    e ^= Box::as_ref(&heap_probe) as *const u8 as u64;
    e ^= entropy_seed as fn() -> u64 as usize as u64;

    e ^= std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);

    let mixed = mix64(e);
    if mixed == 0 {
        0x9E37_79B9_7F4A_7C15
    } else {
        mixed
    }
}

thread_local! {
    static THREAD_STATE: Cell<u64> = const { Cell::new(0) };
}

/// Fast xorshift64* stream, one state per thread, lazily seeded on the
/// thread's first draw.
pub fn runtime_rand() -> u64 {
    THREAD_STATE.with(|state| {
        let mut s = state.get();
        if s == 0 {
            s = entropy_seed();
        }
        let (next, out) = xorshift64_star(s);
        state.set(next);
        out
    })
}

/// Uniform-ish draw in `[lo, hi]` (inclusive). Modulo bias is accepted;
/// nothing here feeds a security decision.
pub fn rand_range(lo: u64, hi: u64) -> u64 {
    debug_assert!(lo <= hi);
    lo + runtime_rand() % (hi - lo + 1)
}

#[inline]
pub fn rand_u32() -> u32 {
    runtime_rand() as u32
}

// Process-wide generator for contexts that cannot rely on thread-local
// storage. First use races are settled by compare-exchange: exactly one
// seed wins, and every thread then advances the same stream.
static SHARED_STATE: AtomicU64 = AtomicU64::new(0);

/// Shared-state variant of [`runtime_rand`], safe under concurrent
/// first use.
pub fn shared_rand() -> u64 {
    let mut cur = SHARED_STATE.load(Ordering::Acquire);
    if cur == 0 {
        let seed = entropy_seed();
        match SHARED_STATE.compare_exchange(0, seed, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => cur = seed,
            Err(winner) => cur = winner,
        }
    }
    loop {
        let (next, out) = xorshift64_star(cur);
        match SHARED_STATE.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return out,
            Err(observed) => cur = if observed == 0 { entropy_seed() } else { observed },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_is_nonzero_and_varies() {
        let a = entropy_seed();
        let b = entropy_seed();
        assert_ne!(a, 0);
        // cycle counter and clock have moved between calls
        assert_ne!(a, b);
    }

    #[test]
    fn stream_advances() {
        let a = runtime_rand();
        let b = runtime_rand();
        let c = runtime_rand();
        assert!(!(a == b && b == c), "stream is stuck");
    }

    #[test]
    fn range_bounds_hold() {
        for _ in 0..10_000 {
            let v = rand_range(10, 17);
            assert!((10..=17).contains(&v));
        }
        assert_eq!(rand_range(5, 5), 5);
    }

    #[test]
    fn shared_rand_concurrent_first_use() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..1000).map(|_| shared_rand()).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let len = all.len();
        all.sort_unstable();
        all.dedup();
        // xorshift64* never yields the same output twice within a short
        // window of one stream; heavy duplication would mean torn state
        assert!(all.len() > len / 2, "shared stream collapsed: {} of {len} unique", all.len());
    }

    #[test]
    fn different_threads_different_streams() {
        let a = std::thread::spawn(|| (0..8).map(|_| runtime_rand()).collect::<Vec<_>>())
            .join()
            .unwrap();
        let b = std::thread::spawn(|| (0..8).map(|_| runtime_rand()).collect::<Vec<_>>())
            .join()
            .unwrap();
        assert_ne!(a, b);
    }
}
