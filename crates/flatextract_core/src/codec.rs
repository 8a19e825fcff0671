// codec.rs: field byte decoding/encoding per semantic type and byte order
use byteorder::{ByteOrder, NativeEndian};
use memchr::memchr2;

use crate::error::{FfeError, Result};

const BCD_LOWER: &[u8; 16] = b"0123456789abcde\0";
const BCD_UPPER: &[u8; 16] = b"0123456789ABCDE\0";
const HEX_LOWER: &[u8; 16] = b"0123456789abcdef";
const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// Nibble value marking the end of a packed BCD number.
pub const BCD_FILLER: u8 = 0x0f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

impl Endian {
    pub fn host() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Ascii,
    Char,
    Int,
    UInt,
    Float,
    Double,
    Bcd,
    Hex,
}

/// On-disk shape of one field: semantic type, byte length and byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldFormat {
    pub kind: FieldType,
    pub length: usize,
    pub endian: Endian,
}

impl FieldFormat {
    pub fn ascii(length: usize) -> Self {
        FieldFormat { kind: FieldType::Ascii, length, endian: Endian::host() }
    }

    /// Parse a type keyword such as `int32_le`, `double`, `bcd_be_5` or `hex_le_4`.
    pub fn from_keyword(keyword: &str) -> Option<Self> {
        use FieldType::*;
        let host = Endian::host();
        let fixed = |kind, length, endian| Some(FieldFormat { kind, length, endian });
        match keyword {
            "char" => fixed(Char, 1, host),
            "short" => fixed(Int, 2, host),
            "int" => fixed(Int, 4, host),
            "long" | "llong" => fixed(Int, 8, host),
            "ushort" => fixed(UInt, 2, host),
            "uint" => fixed(UInt, 4, host),
            "ulong" | "ullong" => fixed(UInt, 8, host),
            "float" => fixed(Float, 4, host),
            "float_be" => fixed(Float, 4, Endian::Big),
            "float_le" => fixed(Float, 4, Endian::Little),
            "double" => fixed(Double, 8, host),
            "double_be" => fixed(Double, 8, Endian::Big),
            "double_le" => fixed(Double, 8, Endian::Little),
            "int8" => fixed(Int, 1, host),
            "uint8" => fixed(UInt, 1, host),
            _ => Self::sized_keyword(keyword),
        }
    }

    fn sized_keyword(keyword: &str) -> Option<Self> {
        let (stem, endian) = if let Some(s) = keyword.strip_suffix("_be") {
            (s, Endian::Big)
        } else if let Some(s) = keyword.strip_suffix("_le") {
            (s, Endian::Little)
        } else if let Some(rest) = keyword.strip_prefix("bcd_") {
            return Self::counted(FieldType::Bcd, rest);
        } else if let Some(rest) = keyword.strip_prefix("hex_") {
            return Self::counted(FieldType::Hex, rest);
        } else {
            return None;
        };
        let (kind, bits) = if let Some(bits) = stem.strip_prefix("uint") {
            (FieldType::UInt, bits)
        } else if let Some(bits) = stem.strip_prefix("int") {
            (FieldType::Int, bits)
        } else {
            return None;
        };
        let length = match bits {
            "16" => 2,
            "32" => 4,
            "64" => 8,
            _ => return None,
        };
        Some(FieldFormat { kind, length, endian })
    }

    // bcd_be_5, hex_le_4, ...
    fn counted(kind: FieldType, rest: &str) -> Option<Self> {
        let (endian, digits) = if let Some(d) = rest.strip_prefix("be_") {
            (Endian::Big, d)
        } else if let Some(d) = rest.strip_prefix("le_") {
            (Endian::Little, d)
        } else {
            return None;
        };
        let length: usize = digits.parse().ok()?;
        if length < 1 {
            return None;
        }
        Some(FieldFormat { kind, length, endian })
    }

    pub fn is_binary_numeric(&self) -> bool {
        matches!(self.kind, FieldType::Int | FieldType::UInt | FieldType::Float | FieldType::Double)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeOptions {
    pub hex_uppercase: bool,
}

/// Copy `src` into `dst` converting from `source` to `target` byte order.
///
/// `dst` must be as long as `src`. Matching orders and single bytes are copied as is,
/// widths 2, 4, 8 and 16 are reversed, anything else is an internal error.
pub fn align(src: &[u8], target: Endian, source: Endian, dst: &mut [u8]) -> Result<()> {
    let width = src.len();
    debug_assert_eq!(width, dst.len());
    if target == source || width < 2 {
        dst.copy_from_slice(src);
        return Ok(());
    }
    match width {
        2 | 4 | 8 | 16 => {
            for (d, s) in dst.iter_mut().zip(src.iter().rev()) {
                *d = *s;
            }
            Ok(())
        }
        _ => Err(FfeError::Endian { width }),
    }
}

/// Decode the bytes of one field into canonical text, appending to `out`.
///
/// `bytes` is the field's slice within the record; a short slice (truncated record)
/// decodes whatever is there for text types and nothing for numeric types.
pub fn decode(format: &FieldFormat, bytes: &[u8], opts: DecodeOptions, out: &mut Vec<u8>) -> Result<()> {
    match format.kind {
        FieldType::Ascii | FieldType::Char => {
            let end = memchr2(b'\n', 0, bytes).unwrap_or(bytes.len());
            out.extend_from_slice(&bytes[..end]);
        }
        FieldType::Int | FieldType::UInt | FieldType::Float | FieldType::Double => {
            if bytes.len() < format.length {
                return Ok(());
            }
            decode_number(format, &bytes[..format.length], out)?;
        }
        FieldType::Bcd => {
            let table = if opts.hex_uppercase { BCD_UPPER } else { BCD_LOWER };
            push_bcd(bytes, format.endian, table, out);
        }
        FieldType::Hex => {
            let table = if opts.hex_uppercase { HEX_UPPER } else { HEX_LOWER };
            let mut push = |b: &u8| {
                out.push(table[(b >> 4) as usize]);
                out.push(table[(b & 0x0f) as usize]);
            };
            match format.endian {
                Endian::Big => bytes.iter().for_each(&mut push),
                Endian::Little => bytes.iter().rev().for_each(&mut push),
            }
        }
    }
    Ok(())
}

fn decode_number(format: &FieldFormat, bytes: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let width = bytes.len();
    let mut scratch = [0u8; 16];
    if width > scratch.len() {
        return Err(FfeError::Endian { width });
    }
    let aligned = &mut scratch[..width];
    align(bytes, Endian::host(), format.endian, aligned)?;
    let text = match (format.kind, width) {
        (FieldType::Int, 1) => (aligned[0] as i8).to_string(),
        (FieldType::Int, 2) => NativeEndian::read_i16(aligned).to_string(),
        (FieldType::Int, 4) => NativeEndian::read_i32(aligned).to_string(),
        (FieldType::Int, 8) => NativeEndian::read_i64(aligned).to_string(),
        (FieldType::Int, 16) => NativeEndian::read_i128(aligned).to_string(),
        (FieldType::UInt, 1) => aligned[0].to_string(),
        (FieldType::UInt, 2) => NativeEndian::read_u16(aligned).to_string(),
        (FieldType::UInt, 4) => NativeEndian::read_u32(aligned).to_string(),
        (FieldType::UInt, 8) => NativeEndian::read_u64(aligned).to_string(),
        (FieldType::UInt, 16) => NativeEndian::read_u128(aligned).to_string(),
        (FieldType::Float, 4) => {
            let v = NativeEndian::read_f32(aligned);
            fixed6(v as f64, v.is_sign_negative())
        }
        (FieldType::Double, 8) => {
            let v = NativeEndian::read_f64(aligned);
            fixed6(v, v.is_sign_negative())
        }
        _ => return Err(FfeError::Endian { width }),
    };
    out.extend_from_slice(text.as_bytes());
    Ok(())
}

/// Six-decimal rendering with `nan`/`inf` spelled in lowercase.
fn fixed6(v: f64, negative: bool) -> String {
    if v.is_nan() {
        if negative { "-nan".to_string() } else { "nan".to_string() }
    } else if v.is_infinite() {
        if negative { "-inf".to_string() } else { "inf".to_string() }
    } else {
        format!("{:.6}", v)
    }
}

/// Unpack BCD digits until the first filler nibble or the end of `bytes`.
pub(crate) fn push_bcd(bytes: &[u8], endian: Endian, table: &[u8; 16], out: &mut Vec<u8>) {
    for &b in bytes {
        let (first, second) = match endian {
            Endian::Big => (b >> 4, b & 0x0f),
            Endian::Little => (b & 0x0f, b >> 4),
        };
        if first == BCD_FILLER {
            break;
        }
        out.push(table[first as usize]);
        if second == BCD_FILLER {
            break;
        }
        out.push(table[second as usize]);
    }
}

/// Decode BCD with the lowercase digit table; the anonymizer's canonical form.
pub fn bcd_digits(bytes: &[u8], endian: Endian, out: &mut Vec<u8>) {
    push_bcd(bytes, endian, BCD_LOWER, out)
}

fn ascii_to_bcd(c: u8) -> u8 {
    let v = if c.is_ascii_digit() { c - b'0' } else { c.wrapping_sub(b'a' - 10) };
    v & 0x0f
}

/// Pack BCD digit text into `dest`, returning the number of bytes written.
///
/// Pairs go high nibble first, an unpaired last digit gets a filler low nibble, and
/// an even digit count shorter than `dest` is terminated by one `0xff` byte.
/// Little-endian fields have each byte's nibbles swapped after packing.
pub fn encode_bcd(digits: &[u8], endian: Endian, dest: &mut [u8]) -> usize {
    let mut written = 0usize;
    let mut last = 0u8;
    for pair in digits.chunks(2) {
        if written >= dest.len() {
            break;
        }
        let high = ascii_to_bcd(pair[0]);
        let low = pair.get(1).map(|&c| ascii_to_bcd(c)).unwrap_or(BCD_FILLER);
        let mut c = (high << 4) | low;
        if endian == Endian::Little {
            c = c.rotate_left(4);
        }
        dest[written] = c;
        last = c;
        written += 1;
    }
    if written > 0 && last & 0x0f != BCD_FILLER && last >> 4 != BCD_FILLER && written < dest.len() {
        dest[written] = 0xff;
        written += 1;
    }
    written
}
