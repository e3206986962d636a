//! Module and export resolution without the import table.
//!
//! Module bases come from walking the loader's in-process module list;
//! exports come from parsing the module's own export directory with the
//! bounds-checked slice parser in `veil_core::pe`. Names never appear:
//! modules are matched by case-insensitive hash of their wide base
//! name, exports by case-sensitive hash.
//!
//! Caches live in an explicitly-owned [`Resolver`] rather than ambient
//! statics: production code shares the process-wide instance from
//! [`Resolver::global`], tests construct fresh ones. Resolve-once,
//! cache-forever is sound because the module layout of interest (the
//! system DLLs) does not change after load.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, OnceLock};

use veil_core::pe;

use crate::mem;

/// Loader-list walk safety bound: more entries than this means the
/// list is corrupt or cyclic.
const MAX_MODULES: usize = 512;

/// Resolution context: module, export and syscall-number caches.
#[derive(Default)]
pub struct Resolver {
    modules: Mutex<HashMap<u32, usize>>,
    exports: Mutex<HashMap<(usize, u32), usize>>,
    pub(crate) syscalls: Mutex<HashMap<u32, u32>>,
}

fn lock<'a, T>(m: &'a Mutex<T>) -> MutexGuard<'a, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide resolver, created on first use.
    pub fn global() -> &'static Resolver {
        static GLOBAL: OnceLock<Resolver> = OnceLock::new();
        GLOBAL.get_or_init(Resolver::new)
    }

    /// Drop every cached resolution. Subsequent lookups re-walk.
    pub fn reset(&self) {
        lock(&self.modules).clear();
        lock(&self.exports).clear();
        lock(&self.syscalls).clear();
    }

    /// Base address of the loaded module whose base name has the given
    /// case-insensitive hash. `None` is the normal miss outcome,
    /// including on an empty or absent loader list.
    pub fn module_base(&self, name_hash: u32) -> Option<usize> {
        if let Some(&base) = lock(&self.modules).get(&name_hash) {
            return Some(base);
        }
        let base = walk_loader_list(name_hash)?;
        lock(&self.modules).insert(name_hash, base);
        Some(base)
    }

    /// Address of the export with the given case-sensitive name hash.
    ///
    /// Forwarded exports are followed exactly one level: the forwarder
    /// text names the target module and function, and whatever RVA the
    /// target's table holds is final.
    pub fn proc_address(&self, module: usize, fn_hash: u32) -> Option<usize> {
        if module == 0 {
            return None;
        }
        if let Some(&addr) = lock(&self.exports).get(&(module, fn_hash)) {
            return Some(addr);
        }

        let image = unsafe { module_image(module)? };
        let addr = match pe::find_export(image, fn_hash)? {
            pe::Export::Rva(rva) => module + rva as usize,
            pe::Export::Forwarder(text) => {
                let (module_hash, func_hash) = pe::parse_forwarder(text)?;
                let target = self.module_base(module_hash)?;
                let target_image = unsafe { module_image(target)? };
                target + pe::find_export_rva(target_image, func_hash)? as usize
            }
        };

        lock(&self.exports).insert((module, fn_hash), addr);
        Some(addr)
    }

    /// `module_base` + `proc_address` in one step.
    pub fn import(&self, module_hash: u32, fn_hash: u32) -> Option<usize> {
        let module = self.module_base(module_hash)?;
        self.proc_address(module, fn_hash)
    }
}

/// Borrow a loaded module as a byte slice spanning its declared image
/// size.
///
/// # Safety
///
/// `base` must be the base of a module mapped for the whole lifetime of
/// the returned slice. The headers are read through the fault-isolation
/// boundary before the slice is formed.
pub(crate) unsafe fn module_image(base: usize) -> Option<&'static [u8]> {
    // enough to cover e_lfanew's permitted range plus the optional header
    let header = mem::try_read_bytes(base, 0x1800)?;
    let hdr = pe::validate_headers(&header)?;
    Some(core::slice::from_raw_parts(base as *const u8, hdr.image_size as usize))
}

// ─── Loader list walk ────────────────────────────────────────

/// Address of the PEB, or `None` off Windows.
#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
pub(crate) fn peb() -> Option<usize> {
    let peb: usize;
    unsafe {
        core::arch::asm!(
            "mov {}, gs:[0x60]",
            out(reg) peb,
            options(nostack, preserves_flags),
        );
    }
    if peb == 0 {
        None
    } else {
        Some(peb)
    }
}

#[cfg(not(all(target_os = "windows", target_arch = "x86_64")))]
pub(crate) fn peb() -> Option<usize> {
    None
}

// x64 offsets: PEB.Ldr at 0x18; PEB_LDR_DATA.InMemoryOrderModuleList
// at 0x20; LDR_DATA_TABLE_ENTRY.InMemoryOrderLinks at 0x10, DllBase at
// 0x30, SizeOfImage at 0x40, BaseDllName at 0x58.
const PEB_LDR: usize = 0x18;
const LDR_IN_MEMORY_ORDER_LIST: usize = 0x20;
const ENTRY_LINKS: usize = 0x10;
const ENTRY_DLL_BASE: usize = 0x30;
const ENTRY_BASE_NAME: usize = 0x58;

fn walk_loader_list(name_hash: u32) -> Option<usize> {
    let peb = peb()?;
    let ldr: usize = mem::try_read(peb + PEB_LDR)?;
    if ldr == 0 {
        return None;
    }

    let head = ldr + LDR_IN_MEMORY_ORDER_LIST;
    let mut link: usize = mem::try_read(head)?;
    let mut hops = 0;

    while link != head && link != 0 && hops < MAX_MODULES {
        hops += 1;
        let entry = link - ENTRY_LINKS;

        if let Some(base) = entry_matches(entry, name_hash) {
            return Some(base);
        }

        link = mem::try_read(link)?;
    }

    None
}

fn entry_matches(entry: usize, name_hash: u32) -> Option<usize> {
    // UNICODE_STRING: Length (bytes) at +0, Buffer at +8
    let name_len: u16 = mem::try_read(entry + ENTRY_BASE_NAME)?;
    let name_buf: usize = mem::try_read(entry + ENTRY_BASE_NAME + 8)?;
    if name_buf == 0 || name_len == 0 || name_len > 512 {
        return None;
    }

    let bytes = mem::try_read_bytes(name_buf, name_len as usize)?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();

    if veil_core::hash::fnv1a_wide_ci_ascii(&units) != name_hash {
        return None;
    }

    let base: usize = mem::try_read(entry + ENTRY_DLL_BASE)?;
    if base == 0 {
        None
    } else {
        Some(base)
    }
}

// ─── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use veil_core::hash::{fnv1a, fnv1a_ci};

    #[test]
    fn fresh_resolver_misses_unknown_hash() {
        let r = Resolver::new();
        assert_eq!(r.module_base(0xDEAD_BEEF), None);
        assert_eq!(r.proc_address(0, fnv1a(b"anything")), None);
        assert_eq!(r.import(0x1111_2222, 0x3333_4444), None);
    }

    #[test]
    fn reset_clears_state() {
        let r = Resolver::new();
        let _ = r.module_base(fnv1a_ci(b"ntdll.dll"));
        r.reset();
        assert!(lock(&r.modules).is_empty());
        assert!(lock(&r.exports).is_empty());
    }

    #[cfg(all(target_os = "windows", target_arch = "x86_64"))]
    mod live {
        use super::super::*;
        use veil_core::hash::{fnv1a, fnv1a_ci};

        #[test]
        fn resolves_ntdll() {
            let r = Resolver::new();
            let base = r.module_base(fnv1a_ci(b"ntdll.dll")).expect("ntdll is always loaded");
            assert_ne!(base, 0);
            // second lookup is served from cache and must agree
            assert_eq!(r.module_base(fnv1a_ci(b"ntdll.dll")), Some(base));
        }

        #[test]
        fn resolves_known_export_against_loader() {
            extern "system" {
                fn GetModuleHandleA(name: *const u8) -> usize;
                fn GetProcAddress(module: usize, name: *const u8) -> usize;
            }
            let r = Resolver::new();
            let ours = r
                .import(fnv1a_ci(b"ntdll.dll"), fnv1a(b"NtQueryInformationProcess"))
                .expect("resolution failed");
            let theirs = unsafe {
                let m = GetModuleHandleA(b"ntdll.dll\0".as_ptr());
                GetProcAddress(m, b"NtQueryInformationProcess\0".as_ptr())
            };
            assert_eq!(ours, theirs, "disagrees with the platform loader");
        }

        #[test]
        fn kernel32_is_findable_case_insensitively() {
            let r = Resolver::new();
            let a = r.module_base(fnv1a_ci(b"kernel32.dll"));
            let b = r.module_base(fnv1a_ci(b"KERNEL32.DLL"));
            assert!(a.is_some());
            assert_eq!(a, b);
        }
    }
}
