//! Fault-isolation boundary for reads of attacker-reachable memory.
//!
//! Detection probes walk process structures (PEB, heap headers, loader
//! lists) whose pointers can be stale, unmapped, or deliberately
//! corrupted by anti-anti-debug tooling. Instead of trapping hardware
//! faults, every such read goes through this module: the address range
//! is validated against the virtual-memory map first, and a range that
//! is not committed, not readable, or guard-paged yields `None`. The
//! fail-closed contract is explicit in the types - a probe that cannot
//! read reports "not detected".

#[cfg(windows)]
mod imp {
    use windows_sys::Win32::System::Memory::{
        VirtualQuery, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE_READ,
        PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_NOACCESS, PAGE_READONLY,
        PAGE_READWRITE, PAGE_WRITECOPY,
    };

    const READABLE: u32 = PAGE_READONLY
        | PAGE_READWRITE
        | PAGE_WRITECOPY
        | PAGE_EXECUTE_READ
        | PAGE_EXECUTE_READWRITE
        | PAGE_EXECUTE_WRITECOPY;

    fn query(addr: usize) -> Option<MEMORY_BASIC_INFORMATION> {
        let mut mbi: MEMORY_BASIC_INFORMATION = unsafe { core::mem::zeroed() };
        let written = unsafe {
            VirtualQuery(
                addr as *const core::ffi::c_void,
                &mut mbi,
                core::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
            )
        };
        if written == 0 {
            None
        } else {
            Some(mbi)
        }
    }

    /// Whether `[addr, addr + len)` is committed, readable and not
    /// guard-paged, walking region by region.
    pub fn range_readable(addr: usize, len: usize) -> bool {
        if addr == 0 || len == 0 {
            return false;
        }
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        let mut cursor = addr;
        while cursor < end {
            let Some(mbi) = query(cursor) else {
                return false;
            };
            if mbi.State != MEM_COMMIT
                || mbi.Protect & PAGE_GUARD != 0
                || mbi.Protect & PAGE_NOACCESS != 0
                || mbi.Protect & READABLE == 0
            {
                return false;
            }
            let region_end = mbi.BaseAddress as usize + mbi.RegionSize;
            if region_end <= cursor {
                return false;
            }
            cursor = region_end;
        }
        true
    }

    /// Whether any page in the range carries PAGE_GUARD (the mechanism
    /// behind memory breakpoints).
    pub fn range_has_guard_pages(addr: usize, len: usize) -> bool {
        if addr == 0 || len == 0 {
            return false;
        }
        let Some(end) = addr.checked_add(len) else {
            return false;
        };
        let mut cursor = addr;
        while cursor < end {
            let Some(mbi) = query(cursor) else {
                return false;
            };
            if mbi.Protect & PAGE_GUARD != 0 {
                return true;
            }
            let region_end = mbi.BaseAddress as usize + mbi.RegionSize;
            if region_end <= cursor {
                return false;
            }
            cursor = region_end;
        }
        false
    }
}

#[cfg(not(windows))]
mod imp {
    // No probe touches foreign memory off Windows; fail closed.
    pub fn range_readable(_addr: usize, _len: usize) -> bool {
        false
    }

    pub fn range_has_guard_pages(_addr: usize, _len: usize) -> bool {
        false
    }
}

pub use imp::{range_has_guard_pages, range_readable};

/// Copy `len` bytes from `addr` after validating the range.
pub fn try_read_bytes(addr: usize, len: usize) -> Option<Vec<u8>> {
    if !range_readable(addr, len) {
        return None;
    }
    let mut out = vec![0u8; len];
    unsafe {
        core::ptr::copy_nonoverlapping(addr as *const u8, out.as_mut_ptr(), len);
    }
    Some(out)
}

/// Read one `T` from `addr` after validating the range. Unaligned
/// addresses are fine; the read is a byte copy.
pub fn try_read<T: Copy>(addr: usize) -> Option<T> {
    if !range_readable(addr, core::mem::size_of::<T>()) {
        return None;
    }
    Some(unsafe { core::ptr::read_unaligned(addr as *const T) })
}
