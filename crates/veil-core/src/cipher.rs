//! XTEA block cipher over byte buffers.
//!
//! 64-bit blocks, 128-bit key, 32 rounds. This is a deliberately small
//! and fast cipher, not a security boundary: its job is to keep literals
//! and pointers out of static-analysis reach, and the real protection is
//! the key handling around it. Trailing bytes shorter than one block are
//! XOR-masked with key material instead of block-encrypted.
//!
//! Every function is `const`, so containers can encrypt their contents
//! inside `const`/`static` initializers and ship only ciphertext in the
//! binary image.

const DELTA: u32 = 0x9E37_79B9;
const ROUNDS: u32 = 32;

/// A 128-bit XTEA key.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct XteaKey {
    pub k: [u32; 4],
}

impl XteaKey {
    #[inline(always)]
    pub const fn new(k0: u32, k1: u32, k2: u32, k3: u32) -> Self {
        Self { k: [k0, k1, k2, k3] }
    }

    /// Derive a key from a 64-bit seed via the avalanche mixer.
    #[inline(always)]
    pub const fn from_seed(seed: u64) -> Self {
        let a = crate::mix::mix64(seed);
        let b = crate::mix::mix64(seed ^ 0xA5A5_A5A5_A5A5_A5A5);
        Self::new(a as u32, (a >> 32) as u32, b as u32, (b >> 32) as u32)
    }

    /// Draw a fresh random key.
    pub fn from_rng(rng: &mut impl rand::Rng) -> Self {
        Self::new(rng.gen(), rng.gen(), rng.gen(), rng.gen())
    }

    /// XOR-combine with another key. Used by re-keying strategies to mix
    /// runtime entropy into a compile-time base key.
    #[inline(always)]
    pub const fn mixed_with(self, other: XteaKey) -> Self {
        Self::new(
            self.k[0] ^ other.k[0],
            self.k[1] ^ other.k[1],
            self.k[2] ^ other.k[2],
            self.k[3] ^ other.k[3],
        )
    }
}

/// One XTEA block forward. Exposed so sibling crates can cipher
/// non-byte layouts (UTF-16 units) block-compatibly with the byte path.
#[inline(always)]
pub const fn encrypt_block(mut v0: u32, mut v1: u32, key: &XteaKey) -> (u32, u32) {
    let mut sum = 0u32;
    let mut i = 0;
    while i < ROUNDS {
        v0 = v0.wrapping_add(
            (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1)) ^ (sum.wrapping_add(key.k[(sum & 3) as usize])),
        );
        sum = sum.wrapping_add(DELTA);
        v1 = v1.wrapping_add(
            (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                ^ (sum.wrapping_add(key.k[((sum >> 11) & 3) as usize])),
        );
        i += 1;
    }
    (v0, v1)
}

/// Inverse of [`encrypt_block`].
#[inline(always)]
pub const fn decrypt_block(mut v0: u32, mut v1: u32, key: &XteaKey) -> (u32, u32) {
    let mut sum = DELTA.wrapping_mul(ROUNDS);
    let mut i = 0;
    while i < ROUNDS {
        v1 = v1.wrapping_sub(
            (((v0 << 4) ^ (v0 >> 5)).wrapping_add(v0))
                ^ (sum.wrapping_add(key.k[((sum >> 11) & 3) as usize])),
        );
        sum = sum.wrapping_sub(DELTA);
        v0 = v0.wrapping_sub(
            (((v1 << 4) ^ (v1 >> 5)).wrapping_add(v1)) ^ (sum.wrapping_add(key.k[(sum & 3) as usize])),
        );
        i += 1;
    }
    (v0, v1)
}

#[inline(always)]
const fn load_u32(data: &[u8], i: usize) -> u32 {
    (data[i] as u32)
        | ((data[i + 1] as u32) << 8)
        | ((data[i + 2] as u32) << 16)
        | ((data[i + 3] as u32) << 24)
}

#[inline(always)]
const fn store_u32(data: &mut [u8], i: usize, v: u32) {
    data[i] = v as u8;
    data[i + 1] = (v >> 8) as u8;
    data[i + 2] = (v >> 16) as u8;
    data[i + 3] = (v >> 24) as u8;
}

/// Tail byte mask: key material selected by byte position. Self-inverse.
#[inline(always)]
pub const fn tail_mask(key: &XteaKey, i: usize) -> u8 {
    (key.k[i % 4] >> ((i % 4) * 8)) as u8
}

/// Encrypt a buffer in place: whole 8-byte blocks through XTEA, the tail
/// XOR-masked.
pub const fn encrypt_in_place(data: &mut [u8], key: &XteaKey) {
    let len = data.len();
    let mut i = 0;
    while i + 8 <= len {
        let (v0, v1) = encrypt_block(load_u32(data, i), load_u32(data, i + 4), key);
        store_u32(data, i, v0);
        store_u32(data, i + 4, v1);
        i += 8;
    }
    while i < len {
        data[i] ^= tail_mask(key, i);
        i += 1;
    }
}

/// Inverse of [`encrypt_in_place`].
pub const fn decrypt_in_place(data: &mut [u8], key: &XteaKey) {
    let len = data.len();
    let tail_start = (len / 8) * 8;
    let mut i = tail_start;
    while i < len {
        data[i] ^= tail_mask(key, i);
        i += 1;
    }
    i = 0;
    while i + 8 <= len {
        let (v0, v1) = decrypt_block(load_u32(data, i), load_u32(data, i + 4), key);
        store_u32(data, i, v0);
        store_u32(data, i + 4, v1);
        i += 8;
    }
}

/// Encrypt a fixed-size array by value. Usable in `const` initializers.
pub const fn encrypt_array<const N: usize>(mut data: [u8; N], key: &XteaKey) -> [u8; N] {
    encrypt_in_place(&mut data, key);
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn roundtrip_exact_blocks() {
        let key = XteaKey::new(1, 2, 3, 4);
        let mut buf = *b"16 byte message!";
        let orig = buf;
        encrypt_in_place(&mut buf, &key);
        assert_ne!(buf, orig);
        decrypt_in_place(&mut buf, &key);
        assert_eq!(buf, orig);
    }

    #[test]
    fn roundtrip_with_tail() {
        let key = XteaKey::from_seed(0xDEAD_BEEF);
        for len in 0..64usize {
            let mut rng = StdRng::seed_from_u64(len as u64);
            let orig: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let mut buf = orig.clone();
            encrypt_in_place(&mut buf, &key);
            decrypt_in_place(&mut buf, &key);
            assert_eq!(buf, orig, "roundtrip failed at len {len}");
        }
    }

    #[test]
    fn const_encrypt_matches_runtime() {
        const KEY: XteaKey = XteaKey::new(0x1111, 0x2222, 0x3333, 0x4444);
        const ENC: [u8; 6] = encrypt_array(*b"hello\0", &KEY);
        let mut rt = *b"hello\0";
        encrypt_in_place(&mut rt, &KEY);
        assert_eq!(ENC, rt);
        let mut back = ENC;
        decrypt_in_place(&mut back, &KEY);
        assert_eq!(&back, b"hello\0");
    }

    #[test]
    fn different_keys_different_ciphertext() {
        let a = encrypt_array(*b"hello\0\0\0", &XteaKey::from_seed(1));
        let b = encrypt_array(*b"hello\0\0\0", &XteaKey::from_seed(2));
        assert_ne!(a, b);
    }

    #[test]
    fn ciphertext_hides_plaintext_windows() {
        let key = XteaKey::from_seed(77);
        let plain = *b"SECRET_LICENSE_KEY_0123456789abc";
        let enc = encrypt_array(plain, &key);
        for w in plain.windows(4) {
            for cw in enc.windows(4) {
                assert_ne!(w, cw, "ciphertext leaks a plaintext window");
            }
        }
    }

    #[test]
    fn mixed_key_roundtrips() {
        let base = XteaKey::from_seed(5);
        let mixed = base.mixed_with(XteaKey::from_seed(6));
        assert_ne!(base, mixed);
        let mut buf = *b"rekeyed buffer bytes";
        let orig = buf;
        encrypt_in_place(&mut buf, &mixed);
        decrypt_in_place(&mut buf, &mixed);
        assert_eq!(buf, orig);
    }
}
