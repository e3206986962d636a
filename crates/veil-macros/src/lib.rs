//! Proc macros for the veil toolkit.
//!
//! Everything that must differ between builds or between call sites is
//! decided here, at macro-expansion time: encryption keys, opaque
//! predicate flavors, compile-time random values. Expanded code refers
//! to `::veil_core` and `::veil_runtime` by path, so both crates must
//! be dependencies of the crate using these macros (the `veil` facade
//! re-exports everything together).

use proc_macro::TokenStream;

mod comptime;
mod strings;

/// A `u64` value fixed at build time, different per call site.
///
/// Same call site, same expansion pass → same value; two call sites in
/// the same build collide only by chance.
///
/// ```ignore
/// let salt: u64 = veil::comptime_rand!();
/// ```
#[proc_macro]
pub fn comptime_rand(_input: TokenStream) -> TokenStream {
    let v = comptime::next_u64(b"comptime_rand");
    let lit = proc_macro2::Literal::u64_suffixed(v);
    quote::quote!(#lit).into()
}

/// A compile-time random `u64` in `[lo, hi]` (inclusive).
///
/// ```ignore
/// let delay = veil::comptime_rand_range!(100, 500);
/// ```
#[proc_macro]
pub fn comptime_rand_range(input: TokenStream) -> TokenStream {
    let args: comptime::RangeArgs = syn::parse_macro_input!(input);
    let (lo, hi) = (args.lo, args.hi);
    if lo > hi {
        return syn::Error::new_spanned(args.hi_tokens, "comptime_rand_range: lo > hi")
            .to_compile_error()
            .into();
    }
    let span = hi - lo + 1;
    let v = lo + comptime::next_u64(b"comptime_rand_range") % span;
    let lit = proc_macro2::Literal::u64_suffixed(v);
    quote::quote!(#lit).into()
}

/// FNV-1a hash of a string literal, folded to a `u32` literal so the
/// plaintext never reaches the binary.
///
/// ```ignore
/// const H: u32 = veil::hash!("NtQueryInformationProcess");
/// ```
#[proc_macro]
pub fn hash(input: TokenStream) -> TokenStream {
    let lit: syn::LitStr = syn::parse_macro_input!(input);
    let h = veil_core::hash::fnv1a(lit.value().as_bytes());
    let lit = proc_macro2::Literal::u32_suffixed(h);
    quote::quote!(#lit).into()
}

/// Case-insensitive FNV-1a of a string literal as a `u32` literal.
#[proc_macro]
pub fn hash_ci(input: TokenStream) -> TokenStream {
    let lit: syn::LitStr = syn::parse_macro_input!(input);
    let h = veil_core::hash::fnv1a_ci(lit.value().as_bytes());
    let lit = proc_macro2::Literal::u32_suffixed(h);
    quote::quote!(#lit).into()
}

/// Protect a string literal: the literal is XTEA-encrypted at expansion
/// time with a fresh per-site key, stored as a static ciphertext, and
/// lazily decrypted on access. Evaluates to a guard that derefs to
/// `&str`.
///
/// ```ignore
/// let s = veil::protect_str!("license server hostname");
/// assert_eq!(&*s, "license server hostname");
/// ```
#[proc_macro]
pub fn protect_str(input: TokenStream) -> TokenStream {
    let lit: syn::LitStr = syn::parse_macro_input!(input);
    strings::generate_str(&lit.value()).into()
}

/// Layered variant of [`protect_str!`]: the backing container re-keys
/// itself every 10th access.
#[proc_macro]
pub fn protect_str_layered(input: TokenStream) -> TokenStream {
    let lit: syn::LitStr = syn::parse_macro_input!(input);
    strings::generate_layered(&lit.value()).into()
}

/// Protect a wide (UTF-16) string literal; evaluates to a guard that
/// derefs to `&[u16]`, NUL-terminated.
#[proc_macro]
pub fn protect_wstr(input: TokenStream) -> TokenStream {
    let lit: syn::LitStr = syn::parse_macro_input!(input);
    strings::generate_wstr(&lit.value()).into()
}

/// Encrypted compile-time integer constant. The stored cell holds
/// `value ^ key`; the read path XORs the key back through a volatile
/// load so the optimizer cannot fold the plaintext into the binary.
///
/// ```ignore
/// let magic: u64 = veil::protect_const!(0xDEAD_BEEFu64);
/// ```
#[proc_macro]
pub fn protect_const(input: TokenStream) -> TokenStream {
    let lit: syn::LitInt = syn::parse_macro_input!(input);
    let value: u64 = match lit.base10_parse() {
        Ok(v) => v,
        Err(e) => return e.to_compile_error().into(),
    };
    let suffix = if lit.suffix().is_empty() { "u64" } else { lit.suffix() };
    let ty: syn::Type = match syn::parse_str(suffix) {
        Ok(t) => t,
        Err(e) => return e.to_compile_error().into(),
    };
    let key = comptime::next_u64(b"protect_const");
    let stored = value ^ key;
    let (stored_lit, key_lit) = (
        proc_macro2::Literal::u64_unsuffixed(stored),
        proc_macro2::Literal::u64_unsuffixed(key),
    );
    quote::quote!({
        static __VEIL_CELL: ::core::sync::atomic::AtomicU64 =
            ::core::sync::atomic::AtomicU64::new(#stored_lit);
        let enc = __VEIL_CELL.load(::core::sync::atomic::Ordering::Relaxed);
        (enc ^ #key_lit) as #ty
    })
    .into()
}

/// An opaque always-true predicate with a per-call-site flavor.
/// Statically unprovable, dynamically always `true`.
#[proc_macro]
pub fn opaque_true(_input: TokenStream) -> TokenStream {
    let flavor = (comptime::next_u64(b"opaque_true") % 64) as u32;
    let lit = proc_macro2::Literal::u32_suffixed(flavor);
    quote::quote!(::veil_runtime::opaque::opaque_true(#lit)).into()
}

/// An opaque always-false predicate: the negation of an always-true
/// instance, so it carries the same resistance to static analysis.
#[proc_macro]
pub fn opaque_false(_input: TokenStream) -> TokenStream {
    let flavor = (comptime::next_u64(b"opaque_false") % 64) as u32;
    let lit = proc_macro2::Literal::u32_suffixed(flavor);
    quote::quote!(::veil_runtime::opaque::opaque_false(#lit)).into()
}
