//! Code generation for the string-protection macros.
//!
//! The literal is encrypted here, at expansion time; only ciphertext
//! and split key halves reach the token stream. Each key word is
//! emitted as `a ^ b` with a random `a`, so no 32-bit key constant
//! appears verbatim in the generated code either. The roundtrip is
//! verified during expansion - a cipher bug becomes a build failure,
//! not a runtime surprise.

use proc_macro2::{Literal, TokenStream};
use quote::quote;
use rand::Rng;
use veil_core::cipher::{self, XteaKey};

use crate::comptime;

/// Emit a `u32` key word as a two-literal XOR.
fn split_key_word(word: u32, rng: &mut impl Rng) -> TokenStream {
    let a: u32 = rng.gen();
    let b = a ^ word;
    let (la, lb) = (Literal::u32_suffixed(a), Literal::u32_suffixed(b));
    quote!((#la ^ #lb))
}

fn key_tokens(key: &XteaKey, rng: &mut impl Rng) -> TokenStream {
    let words: Vec<TokenStream> = key.k.iter().map(|&w| split_key_word(w, rng)).collect();
    quote!(::veil_core::cipher::XteaKey::new(#(#words),*))
}

/// `protect_str!`: static `EncryptedString` + `get()`.
pub fn generate_str(value: &str) -> TokenStream {
    let mut rng = comptime::rng(value.as_bytes());
    let key = XteaKey::from_rng(&mut rng);

    // NUL-terminated plaintext, encrypted at expansion time
    let mut buf: Vec<u8> = value.as_bytes().to_vec();
    buf.push(0);
    let n = buf.len();
    let mut cipher_bytes = buf.clone();
    cipher::encrypt_in_place(&mut cipher_bytes, &key);

    let mut check = cipher_bytes.clone();
    cipher::decrypt_in_place(&mut check, &key);
    assert_eq!(check, buf, "string encryption roundtrip failed at expansion");

    let bytes: Vec<Literal> = cipher_bytes.iter().map(|&b| Literal::u8_suffixed(b)).collect();
    let key_expr = key_tokens(&key, &mut rng);
    quote!({
        static __VEIL_STR: ::veil_runtime::strings::EncryptedString<#n> =
            ::veil_runtime::strings::EncryptedString::from_ciphertext([#(#bytes),*], #key_expr);
        __VEIL_STR.get()
    })
}

/// `protect_str_layered!`: static `LayeredString` + `get()`.
pub fn generate_layered(value: &str) -> TokenStream {
    let mut rng = comptime::rng(value.as_bytes());
    let key = XteaKey::from_rng(&mut rng);

    let mut buf: Vec<u8> = value.as_bytes().to_vec();
    buf.push(0);
    let n = buf.len();
    let mut cipher_bytes = buf.clone();
    cipher::encrypt_in_place(&mut cipher_bytes, &key);

    let mut check = cipher_bytes.clone();
    cipher::decrypt_in_place(&mut check, &key);
    assert_eq!(check, buf, "layered encryption roundtrip failed at expansion");

    let bytes: Vec<Literal> = cipher_bytes.iter().map(|&b| Literal::u8_suffixed(b)).collect();
    let key_expr = key_tokens(&key, &mut rng);
    quote!({
        static __VEIL_STR: ::veil_runtime::strings::LayeredString<#n> =
            ::veil_runtime::strings::LayeredString::from_ciphertext([#(#bytes),*], #key_expr);
        __VEIL_STR.get()
    })
}

/// `protect_wstr!`: static `EncryptedWString` + `get()`.
pub fn generate_wstr(value: &str) -> TokenStream {
    let mut rng = comptime::rng(value.as_bytes());
    let key = XteaKey::from_rng(&mut rng);

    let mut units: Vec<u16> = value.encode_utf16().collect();
    units.push(0);
    let n = units.len();
    let cipher_units = wide_encrypt(&units, &key);

    let check = wide_decrypt(&cipher_units, &key);
    assert_eq!(check, units, "wide encryption roundtrip failed at expansion");

    let lits: Vec<Literal> = cipher_units.iter().map(|&u| Literal::u16_suffixed(u)).collect();
    let key_expr = key_tokens(&key, &mut rng);
    quote!({
        static __VEIL_WSTR: ::veil_runtime::strings::EncryptedWString<#n> =
            ::veil_runtime::strings::EncryptedWString::from_ciphertext([#(#lits),*], #key_expr);
        __VEIL_WSTR.get()
    })
}

// The wide container ciphers the UTF-16 units through their byte
// serialization; mirror that here for expansion-time encryption.

fn wide_encrypt(units: &[u16], key: &XteaKey) -> Vec<u16> {
    let mut bytes: Vec<u8> = units.iter().flat_map(|u| u.to_le_bytes()).collect();
    cipher::encrypt_in_place(&mut bytes, key);
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}

fn wide_decrypt(units: &[u16], key: &XteaKey) -> Vec<u16> {
    let mut bytes: Vec<u8> = units.iter().flat_map(|u| u.to_le_bytes()).collect();
    cipher::decrypt_in_place(&mut bytes, key);
    bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect()
}
