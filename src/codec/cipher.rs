//! Repeating-key XOR over Unicode code points
//!
//! Used by chat clients to obfuscate message payloads so they are visible as
//! scrambled text in a packet capture. Not a security boundary.

use thiserror::Error;

/// Key shared with the bundled chat client
pub const DEFAULT_CIPHER_KEY: &str = "SEGREDOSUPERSECRETO";

/// Errors produced by the XOR cipher
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("cipher key is empty")]
    EmptyKey,

    #[error("XOR result U+{0:04X} is not a valid character")]
    InvalidCodePoint(u32),
}

/// Result type for cipher operations
pub type CipherResult<T> = Result<T, CipherError>;

/// XOR each character of `text` with the key character at the same index
/// (modulo the key length). Applying it twice with the same key is the
/// identity.
pub fn xor_cipher(text: &str, key: &str) -> CipherResult<String> {
    let key: Vec<u32> = key.chars().map(u32::from).collect();
    if key.is_empty() {
        return Err(CipherError::EmptyKey);
    }

    text.chars()
        .zip(key.iter().cycle())
        .map(|(c, k)| {
            let code = u32::from(c) ^ k;
            char::from_u32(code).ok_or(CipherError::InvalidCodePoint(code))
        })
        .collect()
}
