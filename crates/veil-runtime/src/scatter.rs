//! Scattered values: one value, several allocations.
//!
//! The byte representation is split across `CHUNKS` independently
//! heap-allocated buffers, each masked with its own XOR byte, so no
//! single memory region contains the value or even a recognizable
//! fragment of it. No redundancy: chunk corruption corrupts the value.

use std::sync::Mutex;

/// Types safe to shuttle through their raw byte representation.
///
/// # Safety
///
/// Implementors must be plain-old-data: `Copy`, no padding whose
/// content matters, valid for every bit pattern produced by
/// reassembling previously scattered bytes of a valid value.
pub unsafe trait Scatterable: Copy {}

unsafe impl Scatterable for u8 {}
unsafe impl Scatterable for i8 {}
unsafe impl Scatterable for u16 {}
unsafe impl Scatterable for i16 {}
unsafe impl Scatterable for u32 {}
unsafe impl Scatterable for i32 {}
unsafe impl Scatterable for u64 {}
unsafe impl Scatterable for i64 {}
unsafe impl Scatterable for u128 {}
unsafe impl Scatterable for i128 {}
unsafe impl Scatterable for usize {}
unsafe impl Scatterable for isize {}
unsafe impl Scatterable for f32 {}
unsafe impl Scatterable for f64 {}
unsafe impl<T: Scatterable, const N: usize> Scatterable for [T; N] {}

struct Chunk {
    data: Box<[u8]>,
    xor_key: u8,
}

/// A value of type `T` split across `CHUNKS` masked heap buffers.
pub struct ScatteredValue<T: Scatterable, const CHUNKS: usize> {
    chunks: Mutex<Vec<Chunk>>,
    _marker: core::marker::PhantomData<T>,
}

impl<T: Scatterable, const CHUNKS: usize> ScatteredValue<T, CHUNKS> {
    const SIZE: usize = core::mem::size_of::<T>();

    pub fn new(value: T) -> Self {
        assert!(CHUNKS >= 2 && CHUNKS <= 64, "CHUNKS must be in 2..=64");
        assert!(
            Self::SIZE >= CHUNKS || CHUNKS == 2,
            "more chunks than bytes to scatter"
        );
        let this = Self {
            chunks: Mutex::new(Vec::with_capacity(CHUNKS)),
            _marker: core::marker::PhantomData,
        };
        this.scatter(value);
        this
    }

    fn value_bytes(value: &T) -> &[u8] {
        unsafe { core::slice::from_raw_parts(value as *const T as *const u8, Self::SIZE) }
    }

    fn scatter(&self, value: T) {
        let bytes = Self::value_bytes(&value);
        let per_chunk = Self::SIZE / CHUNKS;
        let remainder = Self::SIZE % CHUNKS;

        let mut chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
        chunks.clear();
        let mut idx = 0;
        for i in 0..CHUNKS {
            let len = per_chunk + usize::from(i < remainder);
            let xor_key = crate::entropy::runtime_rand() as u8;
            let data: Box<[u8]> = bytes[idx..idx + len].iter().map(|&b| b ^ xor_key).collect();
            chunks.push(Chunk { data, xor_key });
            idx += len;
        }
    }

    /// Reassemble the most recently set value.
    pub fn get(&self) -> T {
        let chunks = self.chunks.lock().unwrap_or_else(|e| e.into_inner());
        let mut buf: Vec<u8> = Vec::with_capacity(Self::SIZE);
        for chunk in chunks.iter() {
            buf.extend(chunk.data.iter().map(|&b| b ^ chunk.xor_key));
        }
        debug_assert_eq!(buf.len(), Self::SIZE);
        let value = unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const T) };
        // plaintext was transient; scrub the scratch buffer
        for b in buf.iter_mut() {
            unsafe {
                core::ptr::write_volatile(b, 0);
            }
        }
        value
    }

    /// Replace the value; every chunk gets a fresh mask.
    pub fn set(&self, value: T) {
        self.scatter(value);
    }
}
