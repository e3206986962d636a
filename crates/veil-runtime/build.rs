use std::env;
use std::fs::File;
use std::io::Write;
use std::path::Path;

fn main() {
    // Per-build seed: randomizes timing thresholds and dead-state salts
    // so no two builds share patchable constants.
    let seed = build_seed();

    let out_dir = env::var_os("OUT_DIR").unwrap();
    let dest = Path::new(&out_dir).join("build_seed.rs");
    let mut f = File::create(&dest).unwrap();
    writeln!(f, "0x{seed:016X}u64").unwrap();

    println!("cargo:rerun-if-changed=build.rs");
}

fn build_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_nanos();

    let mut seed = now as u64 ^ ((now >> 64) as u64);

    if let Ok(manifest) = env::var("CARGO_MANIFEST_DIR") {
        let h = manifest
            .bytes()
            .fold(0u64, |acc, b| acc.rotate_left(7) ^ b as u64);
        seed ^= h;
    }
    if let Ok(profile) = env::var("PROFILE") {
        seed ^= profile.bytes().fold(0u64, |acc, b| acc.wrapping_add(b as u64)) << 32;
    }

    if seed == 0 {
        seed = 0x9A3F_C5D7_0B1E_4A26;
    }
    seed
}
