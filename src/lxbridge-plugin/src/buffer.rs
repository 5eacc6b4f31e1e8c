//! Text <-> bytes codecs backing `lx.utils.buffer` and the `Buffer` global.
//!
//! Decoding follows Node's forgiving rules rather than strict RFC parsing,
//! since scripts are written against Node.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use std::str::FromStr;
use thiserror::Error;

const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_encode_padding(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

const BASE64_URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("Unknown encoding: {0}")]
    UnknownEncoding(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Utf8,
    Base64,
    Base64Url,
    Hex,
    Latin1,
    Ascii,
    Utf16Le,
}

impl FromStr for Encoding {
    type Err = BufferError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name.to_ascii_lowercase().as_str() {
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "base64" => Ok(Encoding::Base64),
            "base64url" => Ok(Encoding::Base64Url),
            "hex" => Ok(Encoding::Hex),
            "latin1" | "binary" => Ok(Encoding::Latin1),
            "ascii" => Ok(Encoding::Ascii),
            "utf16le" | "utf-16le" | "ucs2" | "ucs-2" => Ok(Encoding::Utf16Le),
            _ => Err(BufferError::UnknownEncoding(name.to_string())),
        }
    }
}

/// Turn `text` into bytes, reading it as `encoding`.
pub fn decode(text: &str, encoding: Encoding) -> Vec<u8> {
    match encoding {
        Encoding::Utf8 => text.as_bytes().to_vec(),
        Encoding::Base64 | Encoding::Base64Url => decode_base64(text),
        Encoding::Hex => decode_hex(text),
        Encoding::Latin1 | Encoding::Ascii => text.chars().map(|c| c as u32 as u8).collect(),
        Encoding::Utf16Le => text
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect(),
    }
}

/// Render `bytes` as text in `encoding`.
pub fn encode(bytes: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        Encoding::Base64 => LENIENT_BASE64.encode(bytes),
        Encoding::Base64Url => BASE64_URL.encode(bytes),
        Encoding::Hex => hex::encode(bytes),
        Encoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        Encoding::Ascii => bytes.iter().map(|&b| (b & 0x7f) as char).collect(),
        Encoding::Utf16Le => {
            let units: Vec<u16> = bytes
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            String::from_utf16_lossy(&units)
        }
    }
}

/// Both alphabets are accepted; anything outside them (whitespace, line
/// breaks) is skipped, and decoding stops at the first `=`.
fn decode_base64(text: &str) -> Vec<u8> {
    let mut cleaned: String = text
        .chars()
        .take_while(|&c| c != '=')
        .filter_map(|c| match c {
            '-' => Some('+'),
            '_' => Some('/'),
            c if c.is_ascii_alphanumeric() || c == '+' || c == '/' => Some(c),
            _ => None,
        })
        .collect();
    // A single dangling sextet carries no full byte.
    if cleaned.len() % 4 == 1 {
        cleaned.pop();
    }
    LENIENT_BASE64.decode(cleaned.as_bytes()).unwrap_or_default()
}

/// Decodes leading hex pairs and stops at the first invalid one.
fn decode_hex(text: &str) -> Vec<u8> {
    let valid = text
        .as_bytes()
        .chunks_exact(2)
        .take_while(|pair| pair.iter().all(u8::is_ascii_hexdigit))
        .count();
    hex::decode(&text[..valid * 2]).unwrap_or_default()
}

/// Bytes travel between JS and Rust as latin1 strings (one char per byte).
pub fn bytes_from_binary_string(text: &str) -> Vec<u8> {
    decode(text, Encoding::Latin1)
}

pub fn binary_string_from_bytes(bytes: &[u8]) -> String {
    encode(bytes, Encoding::Latin1)
}
