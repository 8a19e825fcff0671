// anonymizer/scramble.rs: replacement bytes for one normalized field value
use md5::Md5;
use sha2::{Digest, Sha256, Sha512};

use super::rules::{AnonymizationSpec, DigestSize, Method};
use crate::codec::FieldType;

/// Longest normalized value the anonymizer works on.
pub const MAX_NFIELD_LEN: usize = 262_144;

pub const ALNUM_ALPHABET: &[u8] = b"0123456789 ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
pub const DIGIT_ALPHABET: &[u8] = b"0123456789";

/// Source of cryptographic nonces.
pub trait NonceSource {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), String>;
}

/// Nonces from the operating system's generator.
#[derive(Debug, Default)]
pub struct OsNonce;

impl NonceSource for OsNonce {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), String> {
        getrandom::getrandom(buf).map_err(|e| e.to_string())
    }
}

/// Number of bytes to replace in a value of `nlen` bytes.
///
/// Positive starts count from the front (1 is the first byte), negative from the
/// back (-1 is the last byte); the span runs towards the end and the front
/// respectively. A start of 0 behaves like 1.
pub fn scramble_length(spec: &AnonymizationSpec, nlen: usize) -> usize {
    let nlen_i = nlen as i64;
    let start = if spec.start == 0 { 1 } else { spec.start };
    let span = if start > 0 {
        if start > nlen_i { 0 } else { nlen_i - start + 1 }
    } else if -start > nlen_i {
        0
    } else {
        nlen_i + start + 1
    };
    let mut n = span.max(0) as usize;
    if spec.length > 0 {
        n = n.min(spec.length);
    }
    n.min(MAX_NFIELD_LEN)
}

/// Index in the normalized value where a span of `n` bytes is written.
pub fn splice_position(spec: &AnonymizationSpec, nlen: usize, n: usize) -> usize {
    let start = if spec.start == 0 { 1 } else { spec.start };
    if start > 0 {
        (start - 1) as usize
    } else {
        (nlen as i64 + start - n as i64 + 1).max(0) as usize
    }
}

fn map_into(source: &[u8], kind: FieldType, numeric: bool, n: usize, out: &mut Vec<u8>) {
    let alphabet = if numeric { DIGIT_ALPHABET } else { ALNUM_ALPHABET };
    out.extend((0..n).map(|i| {
        let b = source[i % source.len()];
        match kind {
            FieldType::Ascii => alphabet[b as usize % alphabet.len()],
            FieldType::Bcd => b'0' + b % 9,
            _ => b,
        }
    }));
}

fn digest(size: DigestSize, value: &[u8]) -> Vec<u8> {
    match size {
        DigestSize::Bits128 => Md5::digest(value).to_vec(),
        DigestSize::Bits256 => Sha256::digest(value).to_vec(),
        DigestSize::Bits512 => Sha512::digest(value).to_vec(),
    }
}

/// Produce `n` replacement bytes for `normalized` into `out`.
///
/// Returns false when no nonce could be drawn; `out` is then left empty.
pub fn scramble(
    spec: &AnonymizationSpec,
    kind: FieldType,
    normalized: &[u8],
    n: usize,
    nonce: &mut dyn NonceSource,
    out: &mut Vec<u8>,
) -> bool {
    out.clear();
    if n == 0 {
        return true;
    }
    match spec.method {
        Method::Mask => out.resize(n, spec.mask_byte()),
        Method::Random | Method::NumericRandom => {
            let mut bytes = vec![0u8; n];
            if nonce.fill(&mut bytes).is_err() {
                return false;
            }
            map_into(&bytes, kind, spec.is_numeric(), n, out);
        }
        Method::Hash | Method::NumericHash => {
            let d = digest(spec.digest_size(), normalized);
            map_into(&d, kind, spec.is_numeric(), n, out);
        }
    }
    true
}
