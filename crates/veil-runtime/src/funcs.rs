//! Function-pointer obfuscation.
//!
//! [`ObfuscatedCall`] stores a pointer only XTEA-encrypted inside a
//! decoy array; [`MetamorphicFunction`] rotates between equivalent
//! implementations and (on Windows x86_64 with the `metamorphic`
//! feature) dispatches through a freshly regenerated machine-code
//! thunk so repeated calls do not execute byte-identical paths. The
//! self-defense helpers at the bottom erase the in-memory PE header
//! and neutralize debug-API import entries.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use veil_core::cipher::{self, XteaKey};

use crate::raw_fn::RawFn;

/// Calls between detection checkpoints on [`ObfuscatedCall`].
pub const CALL_CHECK_INTERVAL: u32 = 100;

const MAX_DECOYS: usize = 16;

/// A function pointer hidden among decoys.
///
/// The real pointer is XTEA-encrypted and placed at a random index in
/// an array of random same-width values; decryption happens transiently
/// inside [`get`](Self::get).
pub struct ObfuscatedCall<F: RawFn> {
    decoys: [u64; MAX_DECOYS],
    decoy_count: usize,
    real_index: usize,
    key: XteaKey,
    calls: AtomicU32,
    _marker: core::marker::PhantomData<F>,
}

impl<F: RawFn> ObfuscatedCall<F> {
    pub fn new(func: F) -> Self {
        let key = XteaKey::from_seed(crate::entropy::runtime_rand());
        let decoy_count = 4 + (crate::entropy::runtime_rand() as usize) % (MAX_DECOYS - 3);
        let real_index = (crate::entropy::runtime_rand() as usize) % decoy_count;

        let mut encrypted = (func.addr() as u64).to_le_bytes();
        cipher::encrypt_in_place(&mut encrypted, &key);

        let mut decoys = [0u64; MAX_DECOYS];
        for d in decoys.iter_mut() {
            *d = crate::entropy::runtime_rand();
        }
        decoys[real_index] = u64::from_le_bytes(encrypted);

        Self {
            decoys,
            decoy_count,
            real_index,
            key,
            calls: AtomicU32::new(0),
            _marker: core::marker::PhantomData,
        }
    }

    /// Transiently decrypt and return the callable pointer. Every
    /// [`CALL_CHECK_INTERVAL`]th call runs a detection checkpoint.
    #[inline(never)]
    pub fn get(&self) -> F {
        let count = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if count % CALL_CHECK_INTERVAL == 0 {
            crate::policy::checkpoint();
        }

        let mut bytes = self.decoys[self.real_index].to_le_bytes();
        cipher::decrypt_in_place(&mut bytes, &self.key);
        let addr = u64::from_le_bytes(bytes) as usize;
        unsafe { F::from_addr(addr) }
    }

    /// Number of slots in the decoy array currently in use.
    pub fn decoy_count(&self) -> usize {
        self.decoy_count
    }
}

// ─── MetamorphicFunction ─────────────────────────────────────

/// Calls between thunk regenerations / variant rotations.
pub const REGEN_INTERVAL: u32 = 1000;

/// Wraps functionally equivalent implementations; repeated calls do not
/// all take the same code path.
///
/// Variant selection rotates every [`REGEN_INTERVAL`] calls. With the
/// `metamorphic` feature on Windows x86_64, calls additionally route
/// through a generated thunk whose filler bytes are re-randomized on
/// the same schedule.
pub struct MetamorphicFunction<F: RawFn> {
    variants: Vec<F>,
    calls: AtomicU32,
    #[allow(dead_code)]
    thunk_addr: AtomicUsize,
    // superseded pages are retained, not freed: a caller that loaded an
    // older thunk address may still be executing inside it
    #[allow(dead_code)]
    thunks: Mutex<Vec<crate::thunk::ThunkPage>>,
}

impl<F: RawFn> MetamorphicFunction<F> {
    /// At least one implementation is required; all supplied variants
    /// must be behaviorally equivalent.
    pub fn new(variants: Vec<F>) -> Self {
        assert!(!variants.is_empty(), "at least one implementation required");
        let this = Self {
            variants,
            calls: AtomicU32::new(0),
            thunk_addr: AtomicUsize::new(0),
            thunks: Mutex::new(Vec::new()),
        };
        #[cfg(all(windows, target_arch = "x86_64", feature = "metamorphic"))]
        this.regenerate(0);
        this
    }

    pub fn variant_count(&self) -> usize {
        self.variants.len()
    }

    fn current_variant(&self, count: u32) -> F {
        self.variants[(count / REGEN_INTERVAL) as usize % self.variants.len()]
    }

    #[cfg(all(windows, target_arch = "x86_64", feature = "metamorphic"))]
    fn regenerate(&self, count: u32) {
        let target = self.current_variant(count).addr();
        if let Some(page) = crate::thunk::build_jmp_thunk(target) {
            let addr = page.addr();
            let mut guard = self.thunks.lock().unwrap_or_else(|e| e.into_inner());
            guard.push(page);
            self.thunk_addr.store(addr, Ordering::Release);
        }
    }

    /// The callable for this invocation.
    #[inline(never)]
    pub fn get(&self) -> F {
        let count = self.calls.fetch_add(1, Ordering::Relaxed) + 1;

        #[cfg(all(windows, target_arch = "x86_64", feature = "metamorphic"))]
        {
            if count % REGEN_INTERVAL == 0 {
                self.regenerate(count);
            }
            let addr = self.thunk_addr.load(Ordering::Acquire);
            if addr != 0 {
                return unsafe { F::from_addr(addr) };
            }
        }

        self.current_variant(count)
    }
}

// ─── Self-defense helpers ────────────────────────────────────

/// Zero the DOS header, NT headers and section table of our own image,
/// denying dumpers the metadata they rebuild from. Returns whether the
/// wipe happened.
#[cfg(windows)]
pub fn erase_pe_header() -> bool {
    use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_READWRITE};

    const NT_HEADERS64_SIZE: usize = 264;
    const SECTION_HEADER_SIZE: usize = 40;

    let Some(peb) = crate::resolve::peb() else {
        return false;
    };
    let Some(base) = crate::mem::try_read::<usize>(peb + 0x10) else {
        return false;
    };
    let Some(image) = (unsafe { crate::resolve::module_image(base) }) else {
        return false;
    };
    let Some(headers) = veil_core::pe::validate_headers(image) else {
        return false;
    };

    let header_size = headers.e_lfanew
        + NT_HEADERS64_SIZE
        + headers.num_sections as usize * SECTION_HEADER_SIZE;
    if header_size > image.len() {
        return false;
    }

    unsafe {
        let mut old = 0u32;
        if VirtualProtect(base as *const _, header_size, PAGE_READWRITE, &mut old) == 0 {
            return false;
        }
        for i in 0..header_size {
            core::ptr::write_volatile((base + i) as *mut u8, 0);
        }
        VirtualProtect(base as *const _, header_size, old, &mut old);
    }
    true
}

#[cfg(not(windows))]
pub fn erase_pe_header() -> bool {
    false
}

/// Replacement import target: answers "no" to every debug query.
unsafe extern "system" fn scrubbed_import_stub() -> i32 {
    0
}

/// Overwrite the IAT entries of debug-related imports that CRT linkage
/// drags in even when unused (they leak as signatures). Returns whether
/// the import table was walked.
#[cfg(windows)]
pub fn scrub_debug_imports() -> bool {
    use veil_core::hash::fnv1a;
    use windows_sys::Win32::System::Memory::{VirtualProtect, PAGE_READWRITE};

    const SCRUB_HASHES: [u32; 4] = [
        fnv1a(b"IsDebuggerPresent"),
        fnv1a(b"CheckRemoteDebuggerPresent"),
        fnv1a(b"OutputDebugStringA"),
        fnv1a(b"OutputDebugStringW"),
    ];
    const ORDINAL_FLAG: u64 = 1 << 63;

    let Some(peb) = crate::resolve::peb() else {
        return false;
    };
    let Some(base) = crate::mem::try_read::<usize>(peb + 0x10) else {
        return false;
    };
    let Some(image) = (unsafe { crate::resolve::module_image(base) }) else {
        return false;
    };
    let Some(headers) = veil_core::pe::validate_headers(image) else {
        return false;
    };

    // import directory: DataDirectory[1] at optional header + 0x78
    let opt = headers.e_lfanew + 24;
    let import_rva = match image.get(opt + 0x78..opt + 0x7C) {
        Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize,
        None => return false,
    };
    if import_rva == 0 || !veil_core::pe::rva_in_bounds(import_rva as u32, 20, headers.image_size) {
        return false;
    }

    let read_u32_at = |off: usize| -> Option<u32> {
        let b = image.get(off..off + 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    };

    let mut desc = import_rva;
    // IMAGE_IMPORT_DESCRIPTOR: OriginalFirstThunk +0, Name +12, FirstThunk +16
    while let (Some(original_first), Some(name_rva), Some(first_thunk)) = (
        read_u32_at(desc),
        read_u32_at(desc + 12),
        read_u32_at(desc + 16),
    ) {
        if name_rva == 0 {
            break;
        }
        if original_first == 0 {
            // bound import descriptor without a lookup table
            desc += 20;
            continue;
        }
        let mut index = 0usize;
        loop {
            let lookup_off = original_first as usize + index * 8;
            let Some(entry_bytes) = image.get(lookup_off..lookup_off + 8) else {
                break;
            };
            let mut entry_arr = [0u8; 8];
            entry_arr.copy_from_slice(entry_bytes);
            let entry = u64::from_le_bytes(entry_arr);
            if entry == 0 {
                break;
            }
            if entry & ORDINAL_FLAG == 0 {
                // IMAGE_IMPORT_BY_NAME: hint u16, then the name
                let name_off = entry as usize + 2;
                if let Some(h) = image.get(name_off..).and_then(|b| veil_core::hash::fnv1a_cstr(b, 256))
                {
                    if SCRUB_HASHES.contains(&h) {
                        let slot = base + first_thunk as usize + index * 8;
                        unsafe {
                            let mut old = 0u32;
                            if VirtualProtect(slot as *const _, 8, PAGE_READWRITE, &mut old) != 0 {
                                core::ptr::write_volatile(
                                    slot as *mut u64,
                                    scrubbed_import_stub as usize as u64,
                                );
                                VirtualProtect(slot as *const _, 8, old, &mut old);
                            }
                        }
                    }
                }
            }
            index += 1;
        }
        desc += 20;
    }
    true
}

#[cfg(not(windows))]
pub fn scrub_debug_imports() -> bool {
    let _ = scrubbed_import_stub; // referenced so the stub stays honest
    false
}

// ─── Tests ───────────────────────────────────────────────────
