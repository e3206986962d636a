//! Resolution subsystem through the facade: miss behavior everywhere,
//! live agreement with the platform loader on Windows.

use veil::resolve::Resolver;

#[test]
fn fresh_resolver_misses_cleanly() {
    let r = Resolver::new();
    assert_eq!(r.module_base(0x0BAD_CAFE), None);
    assert_eq!(r.proc_address(0, veil::hash::fnv1a(b"NtClose")), None);
    assert_eq!(r.import(0x1234, 0x5678), None);
}

#[test]
fn global_resolver_is_shared() {
    let a = Resolver::global() as *const Resolver;
    let b = Resolver::global() as *const Resolver;
    assert_eq!(a, b);
}

#[test]
fn reset_allows_reuse() {
    let r = Resolver::new();
    let _ = r.module_base(veil::hash_ci!("ntdll.dll"));
    r.reset();
    let _ = r.module_base(veil::hash_ci!("ntdll.dll"));
}

#[test]
fn hash_macros_match_runtime_hashing() {
    // the compile-time folded hash must equal the runtime-computed one
    assert_eq!(veil::hash!("NtOpenFile"), veil::hash::fnv1a(b"NtOpenFile"));
    assert_eq!(
        veil::hash_ci!("KERNEL32.DLL"),
        veil::hash::fnv1a_ci(b"kernel32.dll")
    );
}

#[test]
fn syscall_miss_behavior() {
    let r = Resolver::new();
    assert_eq!(veil::syscall::syscall_number_with(&r, 0xFFFF_FFF0), None);
}

#[cfg(all(target_os = "windows", target_arch = "x86_64"))]
mod live {
    use super::*;
    use veil::hash::fnv1a;

    extern "system" {
        fn GetModuleHandleA(name: *const u8) -> usize;
        fn GetProcAddress(module: usize, name: *const u8) -> usize;
    }

    #[test]
    fn resolves_exports_like_the_loader() {
        let r = Resolver::new();
        for name in [
            &b"NtQueryInformationProcess"[..],
            b"NtClose",
            b"RtlGetVersion",
        ] {
            let ours = r
                .import(veil::hash_ci!("ntdll.dll"), fnv1a(name))
                .expect("resolution failed");
            let theirs = unsafe {
                let m = GetModuleHandleA(b"ntdll.dll\0".as_ptr());
                let mut z = name.to_vec();
                z.push(0);
                GetProcAddress(m, z.as_ptr())
            };
            assert_eq!(ours, theirs, "loader disagreement on {:?}", String::from_utf8_lossy(name));
        }
    }

    #[test]
    fn forwarded_export_resolves_one_level() {
        // kernel32!HeapAlloc forwards to ntdll!RtlAllocateHeap on
        // modern Windows; either way the resolved address must match
        // the loader's answer
        let r = Resolver::new();
        let ours = r.import(veil::hash_ci!("kernel32.dll"), fnv1a(b"HeapAlloc"));
        let theirs = unsafe {
            let m = GetModuleHandleA(b"kernel32.dll\0".as_ptr());
            GetProcAddress(m, b"HeapAlloc\0".as_ptr())
        };
        assert_eq!(ours, Some(theirs));
    }

    #[test]
    fn syscall_numbers_extracted_and_cached() {
        let close = veil::syscall::syscall_number(fnv1a(b"NtClose")).expect("NtClose stub");
        assert!(close < veil::pe::MAX_SYSCALL_NUMBER);
        assert_eq!(veil::syscall::syscall_number(fnv1a(b"NtClose")), Some(close));
    }

    #[test]
    fn syscall_gadget_found() {
        assert!(veil::syscall::syscall_gadget().is_some());
    }
}
