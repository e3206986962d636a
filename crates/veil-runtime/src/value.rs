//! Obfuscated single-value containers.
//!
//! Values are stored as layered transforms of their bit pattern with
//! per-instance keys drawn from runtime entropy, so two instances
//! holding the same value share no stored representation and neither
//! matches the plaintext bit pattern. Reads periodically feed the
//! detection checkpoint, interleaving protection checks with ordinary
//! data access.

use std::sync::atomic::{AtomicU32, Ordering};

use veil_core::mba::{mba_add, mba_sub};

/// Reads between detection checkpoints on [`ObfuscatedValue`].
pub const VALUE_CHECK_INTERVAL: u32 = 1000;
/// Reads between detection checkpoints on [`ObfuscatedBool`].
pub const BOOL_CHECK_INTERVAL: u32 = 500;

/// Types storable in an [`ObfuscatedValue`].
pub trait Protectable: Copy {
    type Bits: Copy + PartialEq;

    fn to_bits(self) -> Self::Bits;
    fn from_bits(bits: Self::Bits) -> Self;
    fn bits_from_entropy(e: u64) -> Self::Bits;
    fn encode(bits: Self::Bits, xor_key: Self::Bits, add_key: Self::Bits) -> Self::Bits;
    fn decode(stored: Self::Bits, xor_key: Self::Bits, add_key: Self::Bits) -> Self::Bits;
}

/// Integer types that additionally support the two-key MBA encoding of
/// [`MbaValue`] and the XOR masking of [`RuntimeConst`].
pub trait ProtectableInt: Protectable {
    fn encode_mba(bits: Self::Bits, k1: Self::Bits, k2: Self::Bits) -> Self::Bits;
    fn decode_mba(stored: Self::Bits, k1: Self::Bits, k2: Self::Bits) -> Self::Bits;
    fn xor_bits(a: Self::Bits, b: Self::Bits) -> Self::Bits;
}

macro_rules! protect_int {
    ($($t:ty => $b:ty),* $(,)?) => {$(
        impl Protectable for $t {
            type Bits = $b;

            #[inline(always)]
            fn to_bits(self) -> $b {
                self as $b
            }
            #[inline(always)]
            fn from_bits(bits: $b) -> $t {
                bits as $t
            }
            #[inline(always)]
            fn bits_from_entropy(e: u64) -> $b {
                e as $b
            }
            #[inline(always)]
            fn encode(bits: $b, xor_key: $b, add_key: $b) -> $b {
                // add, xor, add again: the stored pattern is neither the
                // plaintext nor a single-step transform of it
                let t = mba_add(bits, add_key) ^ xor_key;
                mba_add(t, xor_key & 0xFF)
            }
            #[inline(always)]
            fn decode(stored: $b, xor_key: $b, add_key: $b) -> $b {
                let t = mba_sub(stored, xor_key & 0xFF) ^ xor_key;
                mba_sub(t, add_key)
            }
        }

        impl ProtectableInt for $t {
            #[inline(always)]
            fn encode_mba(bits: $b, k1: $b, k2: $b) -> $b {
                mba_add(bits, k1) ^ k2
            }
            #[inline(always)]
            fn decode_mba(stored: $b, k1: $b, k2: $b) -> $b {
                mba_sub(stored ^ k2, k1)
            }
            #[inline(always)]
            fn xor_bits(a: $b, b: $b) -> $b {
                a ^ b
            }
        }
    )*};
}

protect_int!(
    u8 => u8, i8 => u8,
    u16 => u16, i16 => u16,
    u32 => u32, i32 => u32,
    u64 => u64, i64 => u64,
    usize => usize, isize => usize,
);

macro_rules! protect_float {
    ($($t:ty => $b:ty),* $(,)?) => {$(
        impl Protectable for $t {
            type Bits = $b;

            #[inline(always)]
            fn to_bits(self) -> $b {
                self.to_bits()
            }
            #[inline(always)]
            fn from_bits(bits: $b) -> $t {
                <$t>::from_bits(bits)
            }
            #[inline(always)]
            fn bits_from_entropy(e: u64) -> $b {
                e as $b
            }
            #[inline(always)]
            fn encode(bits: $b, xor_key: $b, _add_key: $b) -> $b {
                // bit-level XOR only: arithmetic on float bit patterns
                // would have to dodge NaN payloads
                bits ^ xor_key
            }
            #[inline(always)]
            fn decode(stored: $b, xor_key: $b, _add_key: $b) -> $b {
                stored ^ xor_key
            }
        }
    )*};
}

protect_float!(f32 => u32, f64 => u64);

// ─── ObfuscatedValue ─────────────────────────────────────────

/// A single value of arithmetic type, never stored as its own bit
/// pattern. `decode(encode(v)) == v` for every representable `v`.
pub struct ObfuscatedValue<T: Protectable> {
    stored: T::Bits,
    xor_key: T::Bits,
    add_key: T::Bits,
    access_count: AtomicU32,
}

impl<T: Protectable> ObfuscatedValue<T> {
    pub fn new(value: T) -> Self {
        let xor_key = T::bits_from_entropy(crate::entropy::runtime_rand());
        let add_key = T::bits_from_entropy(crate::entropy::runtime_rand());
        Self {
            stored: T::encode(value.to_bits(), xor_key, add_key),
            xor_key,
            add_key,
            access_count: AtomicU32::new(0),
        }
    }

    #[inline(never)]
    pub fn set(&mut self, value: T) {
        self.stored = T::encode(value.to_bits(), self.xor_key, self.add_key);
    }

    #[inline(never)]
    pub fn get(&self) -> T {
        let count = self.access_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % VALUE_CHECK_INTERVAL == 0 {
            crate::policy::checkpoint();
        }
        T::from_bits(T::decode(
            core::hint::black_box(self.stored),
            self.xor_key,
            self.add_key,
        ))
    }
}

impl<T: Protectable + Default> Default for ObfuscatedValue<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

// ─── MbaValue ────────────────────────────────────────────────

/// Lighter two-key variant: `stored = (v + k1) ^ k2` through the MBA
/// identities.
pub struct MbaValue<T: ProtectableInt> {
    stored: T::Bits,
    k1: T::Bits,
    k2: T::Bits,
}

impl<T: ProtectableInt> MbaValue<T> {
    pub fn new(value: T) -> Self {
        let k1 = T::bits_from_entropy(crate::entropy::runtime_rand());
        let k2 = T::bits_from_entropy(crate::entropy::runtime_rand());
        Self {
            stored: T::encode_mba(value.to_bits(), k1, k2),
            k1,
            k2,
        }
    }

    #[inline(never)]
    pub fn set(&mut self, value: T) {
        self.stored = T::encode_mba(value.to_bits(), self.k1, self.k2);
    }

    #[inline(never)]
    pub fn get(&self) -> T {
        T::from_bits(T::decode_mba(core::hint::black_box(self.stored), self.k1, self.k2))
    }
}

// ─── ObfuscatedBool ──────────────────────────────────────────

/// A boolean spread across three bytes. Truth is carried by which key
/// the secondary byte was derived with; the tertiary byte is a
/// redundancy check that trips on blind bit-flips.
pub struct ObfuscatedBool {
    primary: u8,
    secondary: u8,
    tertiary: u8,
    k1: u8,
    k2: u8,
    k3: u8,
    access_count: AtomicU32,
}

impl ObfuscatedBool {
    pub fn new(value: bool) -> Self {
        let k1 = crate::entropy::runtime_rand() as u8;
        // distinct keys keep the true/false encodings disjoint
        let mut k2 = crate::entropy::runtime_rand() as u8;
        if k2 == k1 {
            k2 = k2.wrapping_add(0x5B);
        }
        let k3 = crate::entropy::runtime_rand() as u8;
        let mut this = Self {
            primary: 0,
            secondary: 0,
            tertiary: 0,
            k1,
            k2,
            k3,
            access_count: AtomicU32::new(0),
        };
        this.encode(value);
        this
    }

    fn verify_mask(&self) -> u8 {
        self.k2 ^ self.k3
    }

    fn encode(&mut self, value: bool) {
        let noise = (crate::entropy::runtime_rand() as u8) & 0xF0;
        if value {
            self.primary = self.k1 ^ 0xAA ^ self.k2 ^ noise;
            self.secondary = !self.primary ^ self.k1;
            self.tertiary = self.primary.wrapping_add(self.secondary) ^ self.verify_mask();
        } else {
            self.primary = self.k1 ^ 0x55 ^ self.k3 ^ noise;
            self.secondary = !self.primary ^ self.k2;
            self.tertiary = self.primary.wrapping_sub(self.secondary) ^ self.verify_mask();
        }
    }

    fn decode(&self) -> bool {
        let carrier = self.secondary ^ !self.primary;
        let truth = carrier == self.k1;

        // redundancy byte must agree with the claimed truth value
        let expected = if truth {
            self.primary.wrapping_add(self.secondary) ^ self.verify_mask()
        } else {
            self.primary.wrapping_sub(self.secondary) ^ self.verify_mask()
        };
        if self.tertiary != expected {
            crate::policy::enforce(true);
        }
        truth
    }

    #[inline(never)]
    pub fn get(&self) -> bool {
        let count = self.access_count.fetch_add(1, Ordering::Relaxed) + 1;
        if count % BOOL_CHECK_INTERVAL == 0 {
            crate::policy::checkpoint();
        }
        self.decode()
    }

    #[inline(never)]
    pub fn set(&mut self, value: bool) {
        self.encode(value);
    }
}

// ─── RuntimeConst ────────────────────────────────────────────

/// A constant masked with a key chosen at construction; different per
/// process execution.
pub struct RuntimeConst<T: ProtectableInt> {
    stored: T::Bits,
    key: T::Bits,
}

impl<T: ProtectableInt> RuntimeConst<T> {
    pub fn new(value: T) -> Self {
        let key = T::bits_from_entropy(crate::entropy::runtime_rand());
        Self {
            stored: T::xor_bits(value.to_bits(), key),
            key,
        }
    }

    #[inline(always)]
    pub fn get(&self) -> T {
        T::from_bits(T::xor_bits(core::hint::black_box(self.stored), self.key))
    }
}

// ─── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn int_roundtrip_edges() {
        for v in [i32::MIN, -1, 0, 1, 42, i32::MAX] {
            let mut ov = ObfuscatedValue::new(v);
            assert_eq!(ov.get(), v);
            ov.set(v.wrapping_add(7));
            assert_eq!(ov.get(), v.wrapping_add(7));
        }
    }

    #[test]
    fn unsigned_roundtrip_random() {
        let mut rng = StdRng::seed_from_u64(13);
        for _ in 0..10_000 {
            let v: u64 = rng.gen();
            let ov = ObfuscatedValue::new(v);
            assert_eq!(ov.get(), v);
        }
    }

    #[test]
    fn stored_pattern_differs_from_plaintext() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut collisions = 0;
        for _ in 0..1_000 {
            let v: u64 = rng.gen();
            let ov = ObfuscatedValue::new(v);
            if ov.stored == v {
                collisions += 1;
            }
        }
        assert_eq!(collisions, 0, "stored bit pattern equals plaintext");
    }

    #[test]
    fn two_instances_same_value_differ_at_rest() {
        let a = ObfuscatedValue::new(0xDEAD_BEEFu32);
        let b = ObfuscatedValue::new(0xDEAD_BEEFu32);
        // per-instance keys make a shared representation vanishingly rare
        assert_ne!(a.stored, b.stored);
        assert_eq!(a.get(), b.get());
    }

    #[test]
    fn float_roundtrip() {
        for v in [0.0f64, -0.0, 1.5, -3.25e10, f64::MAX, f64::MIN_POSITIVE] {
            let ov = ObfuscatedValue::new(v);
            assert_eq!(ov.get().to_bits(), v.to_bits());
        }
        let nan = ObfuscatedValue::new(f32::NAN);
        assert!(nan.get().is_nan());
    }

    #[test]
    fn mba_value_roundtrip() {
        let mut rng = StdRng::seed_from_u64(21);
        for _ in 0..10_000 {
            let v: i64 = rng.gen();
            let mut mv = MbaValue::new(v);
            assert_eq!(mv.get(), v);
            let w: i64 = rng.gen();
            mv.set(w);
            assert_eq!(mv.get(), w);
        }
    }

    #[test]
    fn bool_roundtrip_many() {
        for _ in 0..5_000 {
            let t = ObfuscatedBool::new(true);
            assert!(t.get());
            let f = ObfuscatedBool::new(false);
            assert!(!f.get());
        }
    }

    #[test]
    fn bool_set_flips() {
        let mut b = ObfuscatedBool::new(false);
        assert!(!b.get());
        b.set(true);
        assert!(b.get());
        b.set(false);
        assert!(!b.get());
    }

    #[test]
    fn bool_bytes_do_not_encode_value_directly() {
        // neither 0/1 nor a fixed pattern may appear for a given value
        let instances: Vec<ObfuscatedBool> = (0..16).map(|_| ObfuscatedBool::new(true)).collect();
        let first = (instances[0].primary, instances[0].secondary, instances[0].tertiary);
        assert!(
            instances
                .iter()
                .any(|b| (b.primary, b.secondary, b.tertiary) != first),
            "every true instance shares one representation"
        );
    }

    #[test]
    fn runtime_const_stable() {
        let c = RuntimeConst::new(0x1234_5678u32);
        for _ in 0..100 {
            assert_eq!(c.get(), 0x1234_5678);
        }
        assert_ne!(c.stored, 0x1234_5678, "stored form must be masked");
    }
}
