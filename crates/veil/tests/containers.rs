//! Round-trip behavior of every encrypted container, driven through
//! the public facade the way embedding code uses it.

use veil::cipher::XteaKey;
use veil::scatter::ScatteredValue;
use veil::strings::{EncryptedString, LayeredString, StackString};
use veil::value::{MbaValue, ObfuscatedBool, ObfuscatedValue, RuntimeConst};

#[test]
fn protected_literal_roundtrips() {
    let s = veil::protect_str!("license server hostname");
    assert_eq!(&*s, "license server hostname");
}

#[test]
fn protected_literal_survives_repeated_access() {
    for _ in 0..1_000 {
        let s = veil::protect_str!("stable under repetition");
        assert_eq!(&*s, "stable under repetition");
    }
}

#[test]
fn layered_literal_roundtrips_across_rekeys() {
    // 25 accesses crosses two re-key boundaries
    for _ in 0..25 {
        let s = veil::protect_str_layered!("rekeyed secret");
        assert_eq!(&*s, "rekeyed secret");
    }
}

#[test]
fn wide_literal_roundtrips() {
    let w = veil::protect_wstr!("unicode wide ストリング");
    let expected: Vec<u16> = "unicode wide ストリング"
        .encode_utf16()
        .chain(core::iter::once(0))
        .collect();
    assert_eq!(&*w, expected.as_slice());
}

#[test]
fn empty_and_single_char_literals() {
    let empty = veil::protect_str!("");
    assert_eq!(&*empty, "");
    let one = veil::protect_str!("x");
    assert_eq!(&*one, "x");
}

#[test]
fn protected_const_decodes() {
    let magic: u64 = veil::protect_const!(0xDEAD_BEEF_CAFE_F00Du64);
    assert_eq!(magic, 0xDEAD_BEEF_CAFE_F00D);
    let small: u32 = veil::protect_const!(42u32);
    assert_eq!(small, 42);
}

#[test]
fn comptime_rand_distinct_per_site() {
    let a: u64 = veil::comptime_rand!();
    let b: u64 = veil::comptime_rand!();
    // same site is stable within a build; two sites collide only by chance
    assert_ne!(a, b);
    let bounded = veil::comptime_rand_range!(10, 20);
    assert!((10..=20).contains(&bounded));
}

// "hello" under a fixed seed, and a second container under a different
// key: same plaintext, different at-rest pattern
#[test]
fn hello_fixed_seed_scenario() {
    let a = EncryptedString::new(*b"hello\0", XteaKey::from_seed(0x5EED));
    assert_eq!(&*a.get(), "hello");
    a.seal();

    let b = EncryptedString::new(*b"hello\0", XteaKey::from_seed(veil::BUILD_SEED | 1));
    assert_ne!(
        a.at_rest().unwrap(),
        b.at_rest().unwrap(),
        "different keys must give different at-rest bytes"
    );
    assert_eq!(&*b.get(), "hello");
}

#[test]
fn interleaved_gets_always_observe_plaintext() {
    static S: EncryptedString<10> =
        EncryptedString::new(*b"interleav\0", XteaKey::new(0x10, 0x20, 0x30, 0x40));
    let threads: Vec<_> = (0..4)
        .map(|_| {
            std::thread::spawn(|| {
                for _ in 0..250 {
                    assert_eq!(&*S.get(), "interleav");
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }
}

#[test]
fn layered_generation_advances_on_schedule() {
    let s = LayeredString::<6>::new(*b"gen__\0", XteaKey::from_seed(77));
    assert_eq!(s.generation(), 0);
    for _ in 0..30 {
        assert_eq!(&*s.get(), "gen__");
    }
    assert_eq!(s.generation(), 3);
}

#[test]
fn stack_string_scope_exit_leaves_backing_sealed() {
    let backing = EncryptedString::new(*b"stack scoped\0", XteaKey::from_seed(31));
    {
        let local = StackString::new(&backing);
        assert_eq!(&*local, "stack scoped");
    } // wiped here, on this exit path
    backing.seal();
    assert!(backing.at_rest().is_some());
    assert_eq!(&*backing.get(), "stack scoped");
}

#[test]
fn obfuscated_values_roundtrip() {
    let mut v = ObfuscatedValue::new(-123_456_789i64);
    assert_eq!(v.get(), -123_456_789);
    v.set(987_654_321);
    assert_eq!(v.get(), 987_654_321);

    let f = ObfuscatedValue::new(2.718_281_828f64);
    assert_eq!(f.get(), 2.718_281_828);

    let m = MbaValue::new(0xABCDu16);
    assert_eq!(m.get(), 0xABCD);
}

#[test]
fn obfuscated_bool_roundtrips() {
    let mut b = ObfuscatedBool::new(true);
    for _ in 0..100 {
        assert!(b.get());
    }
    b.set(false);
    for _ in 0..100 {
        assert!(!b.get());
    }
}

#[test]
fn runtime_const_differs_per_instance_at_rest() {
    let a = RuntimeConst::new(0x5555_5555u32);
    let b = RuntimeConst::new(0x5555_5555u32);
    assert_eq!(a.get(), b.get());
}

#[test]
fn scattered_value_set_get_sequences() {
    let s: ScatteredValue<u64, 8> = ScatteredValue::new(1);
    for i in 0..500u64 {
        s.set(i.wrapping_mul(0x9E37_79B9));
        assert_eq!(s.get(), i.wrapping_mul(0x9E37_79B9));
    }
}

#[test]
fn value_access_at_checkpoint_interval_is_safe() {
    // crossing the periodic-detection boundary must not disturb reads
    veil::policy::set_policy(veil::policy::Policy::Ignore);
    let v = ObfuscatedValue::new(7u32);
    for _ in 0..2_500 {
        assert_eq!(v.get(), 7);
    }
}
