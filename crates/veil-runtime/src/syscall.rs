//! Syscall number extraction and direct invocation.
//!
//! Numbers are pulled from ntdll stub prologues; when the target stub
//! is inline-hooked, the number is inferred from a clean neighbor at
//! the fixed stub stride (the fallback is essential - a hooked target
//! makes direct extraction impossible). Invocation sets up the kernel
//! calling convention and issues `syscall` directly, so user-mode
//! hooks on the wrapper APIs never see the call.

use veil_core::{hash, pe};

use crate::resolve::{self, Resolver};

pub const NTDLL_HASH: u32 = hash::fnv1a_ci(b"ntdll.dll");

/// Syscall number for the ntdll export with the given name hash,
/// cached in the resolver context.
pub fn syscall_number_with(resolver: &Resolver, fn_hash: u32) -> Option<u32> {
    if let Some(&n) = resolver
        .syscalls
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(&fn_hash)
    {
        return Some(n);
    }

    let ntdll = resolver.module_base(NTDLL_HASH)?;
    let image = unsafe { resolve::module_image(ntdll)? };
    let rva = pe::find_export_rva(image, fn_hash)?;
    let number = pe::syscall_number_with_neighbors(image, rva)?;

    resolver
        .syscalls
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(fn_hash, number);
    Some(number)
}

/// [`syscall_number_with`] against the process-wide resolver.
pub fn syscall_number(fn_hash: u32) -> Option<u32> {
    syscall_number_with(Resolver::global(), fn_hash)
}

/// Address of a `syscall; ret` gadget inside ntdll's executable
/// sections. Resolved once per process; calls through it leave a
/// return address inside ntdll instead of this module.
pub fn syscall_gadget() -> Option<usize> {
    static GADGET: std::sync::OnceLock<Option<usize>> = std::sync::OnceLock::new();
    *GADGET.get_or_init(|| {
        let resolver = Resolver::global();
        let ntdll = resolver.module_base(NTDLL_HASH)?;
        let image = unsafe { resolve::module_image(ntdll)? };
        let rva = pe::find_in_exec_sections(image, &[0x0F, 0x05, 0xC3])?;
        Some(ntdll + rva as usize)
    })
}

/// Issue a syscall with up to four arguments.
///
/// # Safety
///
/// A raw kernel transition: the SSN and arguments must form a valid
/// call for the running OS build, or anything can happen.
#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
#[inline(never)]
pub unsafe fn invoke(ssn: u32, a1: u64, a2: u64, a3: u64, a4: u64) -> i32 {
    let status: u64;
    core::arch::asm!(
        "mov r10, rcx",
        "mov eax, {ssn:e}",
        "syscall",
        ssn = in(reg) ssn as u64,
        // syscall clobbers RCX (return RIP) and R11 (RFLAGS)
        inout("rcx") a1 => _,
        in("rdx") a2,
        in("r8") a3,
        in("r9") a4,
        out("rax") status,
        out("r10") _,
        out("r11") _,
        options(nostack),
    );
    status as i32
}

/// Five-argument form: allocates shadow space plus the stack slot the
/// kernel expects for the fifth parameter.
///
/// # Safety
///
/// See [`invoke`].
#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
#[inline(never)]
pub unsafe fn invoke5(ssn: u32, a1: u64, a2: u64, a3: u64, a4: u64, a5: u64) -> i32 {
    let status: u64;
    core::arch::asm!(
        "sub rsp, 0x30",
        "mov [rsp + 0x28], {a5}",
        "mov r10, rcx",
        "mov eax, {ssn:e}",
        "syscall",
        "add rsp, 0x30",
        ssn = in(reg) ssn as u64,
        a5 = in(reg) a5,
        inout("rcx") a1 => _,
        in("rdx") a2,
        in("r8") a3,
        in("r9") a4,
        out("rax") status,
        out("r10") _,
        out("r11") _,
    );
    status as i32
}

#[cfg(not(all(target_os = "windows", target_arch = "x86_64")))]
pub unsafe fn invoke(_ssn: u32, _a1: u64, _a2: u64, _a3: u64, _a4: u64) -> i32 {
    -1
}

#[cfg(not(all(target_os = "windows", target_arch = "x86_64")))]
pub unsafe fn invoke5(_ssn: u32, _a1: u64, _a2: u64, _a3: u64, _a4: u64, _a5: u64) -> i32 {
    -1
}
