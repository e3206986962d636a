//! VM / sandbox fingerprinting probes.
//!
//! Identification is always by fingerprint, never by plaintext: CPUID
//! vendor strings, module names and window classes are hashed before
//! comparison, registry paths and name needles live in sealed buffers
//! that are revealed onto the stack and wiped. As everywhere in the
//! engine, a probe that cannot obtain its inputs reports clean.

use veil_core::hash::{fnv1a, fnv1a_ci, fnv1a_fixed};

use super::{debug, env, import, module_loaded, ADVAPI32_HASH, K32_HASH};
use crate::sealed::SealedBytes;

/// CPUID leaf 1, ECX bit 31: the hypervisor-present bit.
pub fn hypervisor_present() -> bool {
    match env().cpuid(1) {
        Some([_, _, ecx, _]) => (ecx >> 31) & 1 == 1,
        None => false,
    }
}

const VM_VENDOR_HASHES: [u32; 7] = [
    fnv1a_fixed(b"VMwareVMware", 12),
    fnv1a_fixed(b"Microsoft Hv", 12),
    fnv1a_fixed(b"VBoxVBoxVBox", 12),
    fnv1a_fixed(b"KVMKVMKVM\0\0\0", 12),
    fnv1a_fixed(b"XenVMMXenVMM", 12),
    fnv1a_fixed(b"prl hyperv  ", 12),
    fnv1a_fixed(b"TCGTCGTCGTCG", 12),
];

/// CPUID hypervisor leaf 0x40000000: the 12-byte vendor string in
/// EBX:ECX:EDX, hashed against the known hypervisor vendors.
pub fn vm_vendor() -> bool {
    let Some([_, ebx, ecx, edx]) = env().cpuid(0x4000_0000) else {
        return false;
    };
    let mut vendor = [0u8; 12];
    vendor[0..4].copy_from_slice(&ebx.to_le_bytes());
    vendor[4..8].copy_from_slice(&ecx.to_le_bytes());
    vendor[8..12].copy_from_slice(&edx.to_le_bytes());
    VM_VENDOR_HASHES.contains(&fnv1a_fixed(&vendor, 12))
}

// ─── Physical-resource heuristics ────────────────────────────

#[repr(C)]
struct SystemInfo {
    processor_architecture: u16,
    reserved: u16,
    page_size: u32,
    minimum_application_address: usize,
    maximum_application_address: usize,
    active_processor_mask: usize,
    number_of_processors: u32,
    processor_type: u32,
    allocation_granularity: u32,
    processor_level: u16,
    processor_revision: u16,
}

#[repr(C)]
struct MemoryStatusEx {
    length: u32,
    memory_load: u32,
    total_phys: u64,
    avail_phys: u64,
    total_page_file: u64,
    avail_page_file: u64,
    total_virtual: u64,
    avail_virtual: u64,
    avail_extended_virtual: u64,
}

/// Sandboxes are provisioned small: fewer than 2 CPUs, under 2 GiB of
/// RAM, or a system disk under 60 GiB all raise the score.
pub fn low_resources() -> bool {
    type GetSystemInfoFn = unsafe extern "system" fn(*mut SystemInfo);
    type GlobalMemoryStatusExFn = unsafe extern "system" fn(*mut MemoryStatusEx) -> i32;
    type GetDiskFreeSpaceExAFn =
        unsafe extern "system" fn(*const u8, *mut u64, *mut u64, *mut u64) -> i32;

    if let Some(addr) = import(K32_HASH, fnv1a(b"GetSystemInfo")) {
        let mut info: SystemInfo = unsafe { core::mem::zeroed() };
        unsafe {
            let f: GetSystemInfoFn = core::mem::transmute(addr);
            f(&mut info);
        }
        if info.number_of_processors != 0 && info.number_of_processors < 2 {
            return true;
        }
    }

    if let Some(addr) = import(K32_HASH, fnv1a(b"GlobalMemoryStatusEx")) {
        let mut status: MemoryStatusEx = unsafe { core::mem::zeroed() };
        status.length = core::mem::size_of::<MemoryStatusEx>() as u32;
        let ok = unsafe {
            let f: GlobalMemoryStatusExFn = core::mem::transmute(addr);
            f(&mut status)
        };
        if ok != 0 && status.total_phys != 0 && status.total_phys < 2 * 1024 * 1024 * 1024 {
            return true;
        }
    }

    if let Some(addr) = import(K32_HASH, fnv1a(b"GetDiskFreeSpaceExA")) {
        static SYSTEM_ROOT: SealedBytes<4> = SealedBytes::new(*b"C:\\\0", 0x51AB_37C4);
        let root = SYSTEM_ROOT.reveal();
        let (mut avail, mut total, mut free) = (0u64, 0u64, 0u64);
        let ok = unsafe {
            let f: GetDiskFreeSpaceExAFn = core::mem::transmute(addr);
            f(root.as_ptr(), &mut avail, &mut total, &mut free)
        };
        if ok != 0 && total != 0 && total < 60 * 1024 * 1024 * 1024 {
            return true;
        }
    }

    false
}

// ─── Sandbox artifacts ───────────────────────────────────────

const SANDBOX_DLL_HASHES: [u32; 10] = [
    fnv1a_ci(b"SbieDll.dll"),
    fnv1a_ci(b"dbghelp.dll"),
    fnv1a_ci(b"api_log.dll"),
    fnv1a_ci(b"dir_watch.dll"),
    fnv1a_ci(b"pstorec.dll"),
    fnv1a_ci(b"vmcheck.dll"),
    fnv1a_ci(b"wpespy.dll"),
    fnv1a_ci(b"cmdvrt32.dll"),
    fnv1a_ci(b"cmdvrt64.dll"),
    fnv1a_ci(b"cuckoomon.dll"),
];

const ANALYSIS_CLASS_HASHES: [u32; 4] = [
    fnv1a(b"PROCMON_WINDOW_CLASS"),
    fnv1a(b"FilemonClass"),
    fnv1a(b"RegmonClass"),
    fnv1a(b"Autoruns"),
];

/// Sandbox helper DLLs injected into us, or analysis-tool windows on
/// the desktop.
pub fn sandbox_modules() -> bool {
    if SANDBOX_DLL_HASHES.iter().any(|&h| module_loaded(h)) {
        return true;
    }
    debug::scan_windows(&ANALYSIS_CLASS_HASHES, &[])
}

// ─── Name heuristics ─────────────────────────────────────────

fn contains_lowered(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

fn lowered_account_name(fn_hash: u32, module_hash: u32) -> Option<Vec<u8>> {
    type GetNameFn = unsafe extern "system" fn(*mut u8, *mut u32) -> i32;
    let addr = import(module_hash, fn_hash)?;
    let mut buf = [0u8; 256];
    let mut size = buf.len() as u32;
    let ok = unsafe {
        let f: GetNameFn = core::mem::transmute(addr);
        f(buf.as_mut_ptr(), &mut size)
    };
    if ok == 0 {
        return None;
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Some(buf[..len].iter().map(|b| b.to_ascii_lowercase()).collect())
}

fn revealed_hit<const N: usize>(haystack: &[u8], needle: &SealedBytes<N>) -> bool {
    let revealed = needle.reveal();
    let bytes = revealed.as_bytes();
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    contains_lowered(haystack, &bytes[..end])
}

/// Analyst-rig naming: user or computer names containing sandbox
/// vocabulary. High false-positive potential on some substrings by
/// design of the original lists; purely a heuristic voice. Needles are
/// sealed at compile time and revealed transiently per comparison.
pub fn sandbox_names() -> bool {
    const ADVAPI_USER: u32 = fnv1a(b"GetUserNameA");
    const K32_COMPUTER: u32 = fnv1a(b"GetComputerNameA");

    crate::sealed!(N_SANDBOX, b"sandbox", 0x7731_AE02);
    crate::sealed!(N_VIRUS, b"virus", 0x7731_AE03);
    crate::sealed!(N_MALWARE, b"malware", 0x7731_AE05);
    crate::sealed!(N_SAMPLE, b"sample", 0x7731_AE07);
    crate::sealed!(N_TEST, b"test", 0x7731_AE0B);
    crate::sealed!(N_CURRENTUSER, b"currentuser", 0x7731_AE0D);
    crate::sealed!(N_VMWARE, b"vmware", 0x7731_AE11);
    crate::sealed!(N_VBOX, b"vbox", 0x7731_AE13);

    if let Some(user) = lowered_account_name(ADVAPI_USER, ADVAPI32_HASH) {
        if revealed_hit(&user, &N_SANDBOX)
            || revealed_hit(&user, &N_VIRUS)
            || revealed_hit(&user, &N_MALWARE)
            || revealed_hit(&user, &N_SAMPLE)
            || revealed_hit(&user, &N_TEST)
            || revealed_hit(&user, &N_CURRENTUSER)
            || revealed_hit(&user, &N_VMWARE)
            || revealed_hit(&user, &N_VBOX)
        {
            return true;
        }
    }

    if let Some(computer) = lowered_account_name(K32_COMPUTER, K32_HASH) {
        if revealed_hit(&computer, &N_SANDBOX)
            || revealed_hit(&computer, &N_TEST)
            || revealed_hit(&computer, &N_VIRUS)
            || revealed_hit(&computer, &N_MALWARE)
            || revealed_hit(&computer, &N_SAMPLE)
        {
            return true;
        }
    }

    false
}

// ─── Registry artifacts ──────────────────────────────────────

const HKEY_LOCAL_MACHINE: usize = 0x8000_0002;
const KEY_READ: u32 = 0x2_0019;

type RegOpenKeyExAFn = unsafe extern "system" fn(usize, *const u8, u32, u32, *mut usize) -> i32;
type RegCloseKeyFn = unsafe extern "system" fn(usize) -> i32;

fn hklm_key_exists(open: RegOpenKeyExAFn, close: RegCloseKeyFn, path: *const u8) -> bool {
    let mut key = 0usize;
    unsafe {
        if open(HKEY_LOCAL_MACHINE, path, 0, KEY_READ, &mut key) == 0 {
            close(key);
            true
        } else {
            false
        }
    }
}

/// Guest-additions and VM-bus service keys that only exist inside a
/// guest.
pub fn vm_registry_artifacts() -> bool {
    let Some(open) = import(ADVAPI32_HASH, fnv1a(b"RegOpenKeyExA")) else {
        return false;
    };
    let Some(close) = import(ADVAPI32_HASH, fnv1a(b"RegCloseKey")) else {
        return false;
    };
    let (open, close): (RegOpenKeyExAFn, RegCloseKeyFn) =
        unsafe { (core::mem::transmute(open), core::mem::transmute(close)) };

    crate::sealed!(VMWARE_TOOLS, b"SOFTWARE\\VMware, Inc.\\VMware Tools", 0x632A_91B7);
    crate::sealed!(VBOX_ADDITIONS, b"SOFTWARE\\Oracle\\VirtualBox Guest Additions", 0x1F48_D2E9);
    crate::sealed!(VBOX_GUEST, b"SYSTEM\\CurrentControlSet\\Services\\VBoxGuest", 0x8899_AA01);
    crate::sealed!(VMCI, b"SYSTEM\\CurrentControlSet\\Services\\vmci", 0x44C1_0D35);
    crate::sealed!(VMHGFS, b"SYSTEM\\CurrentControlSet\\Services\\vmhgfs", 0xB007_5EED);

    // revealed buffers live exactly as long as their probe call
    hklm_key_exists(open, close, VMWARE_TOOLS.reveal().as_ptr())
        || hklm_key_exists(open, close, VBOX_ADDITIONS.reveal().as_ptr())
        || hklm_key_exists(open, close, VBOX_GUEST.reveal().as_ptr())
        || hklm_key_exists(open, close, VMCI.reveal().as_ptr())
        || hklm_key_exists(open, close, VMHGFS.reveal().as_ptr())
}

// ─── MAC prefixes ────────────────────────────────────────────

const VM_MAC_PREFIXES: [[u8; 3]; 6] = [
    [0x00, 0x0C, 0x29], // VMware
    [0x00, 0x50, 0x56], // VMware
    [0x08, 0x00, 0x27], // VirtualBox
    [0x00, 0x1C, 0x42], // Parallels
    [0x00, 0x03, 0xFF], // Hyper-V
    [0x00, 0x15, 0x5D], // Hyper-V
];

#[repr(C)]
struct IpAdapterInfo {
    next: *mut IpAdapterInfo,
    combo_index: u32,
    adapter_name: [u8; 260],
    description: [u8; 132],
    address_length: u32,
    address: [u8; 8],
    index: u32,
    adapter_type: u32,
    dhcp_enabled: u32,
    // remaining fields irrelevant to the walk; the OS sizes the buffer
}

/// Adapter MAC OUIs assigned to hypervisor vendors.
pub fn vm_mac_prefix() -> bool {
    type GetAdaptersInfoFn = unsafe extern "system" fn(*mut u8, *mut u32) -> u32;
    const IPHLPAPI_HASH: u32 = fnv1a_ci(b"iphlpapi.dll");
    const ERROR_SUCCESS: u32 = 0;

    let Some(addr) = import(IPHLPAPI_HASH, fnv1a(b"GetAdaptersInfo")) else {
        return false;
    };
    let get_adapters: GetAdaptersInfoFn = unsafe { core::mem::transmute(addr) };

    let mut size = 0u32;
    unsafe {
        get_adapters(core::ptr::null_mut(), &mut size);
    }
    if size == 0 || size > 1 << 20 {
        return false;
    }

    let mut buffer = vec![0u8; size as usize];
    let status = unsafe { get_adapters(buffer.as_mut_ptr(), &mut size) };
    if status != ERROR_SUCCESS {
        return false;
    }

    let mut adapter = buffer.as_ptr() as *const IpAdapterInfo;
    let mut hops = 0;
    while !adapter.is_null() && hops < 64 {
        hops += 1;
        let info = unsafe { &*adapter };
        if info.address_length >= 3 {
            let prefix = [info.address[0], info.address[1], info.address[2]];
            if VM_MAC_PREFIXES.contains(&prefix) {
                return true;
            }
        }
        adapter = info.next;
    }
    false
}

// ─── Aggregate ───────────────────────────────────────────────

/// Short-circuit OR of every VM/sandbox probe, each fault-isolated.
pub fn comprehensive_vm_check() -> bool {
    hypervisor_present()
        || vm_vendor()
        || low_resources()
        || sandbox_modules()
        || sandbox_names()
        || vm_registry_artifacts()
        || vm_mac_prefix()
}

#[cfg(test)]
mod tests {
    use super::*;

    // outcomes depend on the host (CI is usually itself a VM); the
    // tested contract is crash-freedom and clean degradation

    #[test]
    fn probes_never_panic() {
        let _ = hypervisor_present();
        let _ = vm_vendor();
        let _ = low_resources();
        let _ = sandbox_modules();
        let _ = sandbox_names();
        let _ = vm_registry_artifacts();
        let _ = vm_mac_prefix();
        let _ = comprehensive_vm_check();
    }

    #[test]
    fn vendor_hashes_are_distinct() {
        for i in 0..VM_VENDOR_HASHES.len() {
            for j in (i + 1)..VM_VENDOR_HASHES.len() {
                assert_ne!(VM_VENDOR_HASHES[i], VM_VENDOR_HASHES[j]);
            }
        }
    }

    #[test]
    fn substring_search_matches_lowered() {
        assert!(contains_lowered(b"vmware-host-7", b"vmware"));
        assert!(!contains_lowered(b"clean-host", b"vmware"));
        assert!(!contains_lowered(b"vm", b"vmware"));
        assert!(!contains_lowered(b"anything", b""));
    }

    #[test]
    fn mac_prefix_table_shape() {
        for p in VM_MAC_PREFIXES {
            assert_eq!(p.len(), 3);
        }
    }
}
