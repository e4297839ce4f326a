// Copyright 2020 Joyent, Inc.

//! Base64 codec used for parameters and response values.
//!
//! One engine backs two calling conventions: the allocating `encode` and
//! `decode`, and the caller-supplied buffer variants `encode_into` and
//! `decode_into`. Line breaks and other ASCII whitespace embedded in the
//! encoded text are ignored when decoding.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum B64Error {
    #[error("nothing to encode")]
    EmptyInput,
    #[error("invalid base64 encoding")]
    InvalidEncoding,
    #[error("output buffer too small, {needed} bytes required")]
    BufferTooSmall { needed: usize },
}

pub fn encoded_len(input_len: usize) -> usize {
    (input_len + 2) / 3 * 4
}

/// Upper bound on the number of bytes `text` can decode to.
pub fn decoded_len_estimate(text: &str) -> usize {
    (text.len() + 3) / 4 * 3
}

pub fn encode(bytes: &[u8]) -> Result<String, B64Error> {
    if bytes.is_empty() {
        return Err(B64Error::EmptyInput);
    }
    Ok(STANDARD.encode(bytes))
}

pub fn encode_into(bytes: &[u8], out: &mut [u8]) -> Result<usize, B64Error> {
    if bytes.is_empty() {
        return Err(B64Error::EmptyInput);
    }
    let needed = encoded_len(bytes.len());
    if out.len() < needed {
        return Err(B64Error::BufferTooSmall { needed });
    }
    STANDARD
        .encode_slice(bytes, out)
        .map_err(|_| B64Error::BufferTooSmall { needed })
}

pub fn decode(text: &str) -> Result<Vec<u8>, B64Error> {
    STANDARD
        .decode(strip_whitespace(text))
        .map_err(|_| B64Error::InvalidEncoding)
}

pub fn decode_into(text: &str, out: &mut [u8]) -> Result<usize, B64Error> {
    let compact = strip_whitespace(text);
    let needed = decoded_len_estimate(&compact);
    if out.len() < needed {
        return Err(B64Error::BufferTooSmall { needed });
    }
    STANDARD
        .decode_slice(compact.as_bytes(), out)
        .map_err(|_| B64Error::InvalidEncoding)
}

/// Encoding for wire values, where an empty value is a legal `""`.
pub fn encode_value(bytes: &[u8]) -> String {
    match encode(bytes) {
        Ok(s) => s,
        Err(_) => String::new(),
    }
}

/// Decodes a wire value that must hold UTF-8 text.
pub fn decode_text(text: &str) -> Result<String, B64Error> {
    String::from_utf8(decode(text)?).map_err(|_| B64Error::InvalidEncoding)
}

fn strip_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_ascii_whitespace()).collect()
}
