// anonymizer/mod.rs: in-place field anonymization for the current record
use log::{trace, warn};

pub mod rules;
pub mod scramble;

pub use rules::*;
pub use scramble::{scramble_length, NonceSource, OsNonce, MAX_NFIELD_LEN};

use crate::codec::{bcd_digits, encode_bcd, Endian, FieldType};
use crate::locator::Layout;
use crate::schema::{Encoding, Field, Record, Structure};

/// Rewrites anonymized fields of a record buffer, reusing its scratch between records.
pub struct Anonymizer {
    nonce: Box<dyn NonceSource>,
    normalized: Vec<u8>,
    replacement: Vec<u8>,
    crypto_warned: bool,
}

impl Default for Anonymizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Anonymizer {
    pub fn new() -> Self {
        Self::with_nonce_source(Box::new(OsNonce))
    }

    pub fn with_nonce_source(nonce: Box<dyn NonceSource>) -> Self {
        Anonymizer { nonce, normalized: Vec::new(), replacement: Vec::new(), crypto_warned: false }
    }

    /// Anonymize every positioned field of `record` that carries a spec and is present.
    ///
    /// `buf` is the record bytes `layout` was resolved against. Returns the number of
    /// fields rewritten.
    pub fn apply(&mut self, structure: &Structure, record: &Record, layout: &Layout, buf: &mut [u8]) -> usize {
        let mut rewritten = 0usize;
        for (i, field) in record.fields.iter().enumerate() {
            let Some(spec) = field.anonymize.as_ref() else { continue };
            let (Some(format), Some(offset)) = (field.format(), layout.offsets.get(i).copied().flatten()) else {
                continue;
            };
            let len = layout.lengths.get(i).copied().unwrap_or(0);
            let end = offset.saturating_add(len).min(buf.len());
            if offset > end {
                continue;
            }
            let quoted = self.normalize(structure, field, &buf[offset..end]);
            let nlen = self.normalized.len();
            let mut n = scramble_length(spec, nlen);
            if !scramble::scramble(spec, format.kind, &self.normalized, n, self.nonce.as_mut(), &mut self.replacement) {
                if !self.crypto_warned {
                    warn!("Random number generator unavailable, anonymization skipped for affected fields");
                    self.crypto_warned = true;
                }
                n = 0;
            }
            if n == 0 {
                continue;
            }
            let pos = scramble::splice_position(spec, nlen, n);
            let stop = (pos + n).min(nlen);
            let take = stop.saturating_sub(pos);
            self.normalized[pos..stop].copy_from_slice(&self.replacement[..take]);
            self.write_back(format.kind, format.endian, quoted, &mut buf[offset..end]);
            trace!("Anonymized field {:?} in record '{}'", field.name, record.name);
            rewritten += 1;
        }
        rewritten
    }

    /// Canonical text of a field for scrambling. Returns whether it sat inside quotes.
    fn normalize(&mut self, structure: &Structure, field: &Field, bytes: &[u8]) -> bool {
        self.normalized.clear();
        let Some(format) = field.format() else { return false };
        let mut quoted = false;
        match (format.kind, &structure.encoding) {
            (FieldType::Bcd, _) => bcd_digits(bytes, format.endian, &mut self.normalized),
            (FieldType::Ascii | FieldType::Char, Encoding::Separated(d)) => {
                let mut content = bytes;
                if let Some(q) = d.quote {
                    if content.first() == Some(&q) {
                        quoted = true;
                        content = &content[1..];
                        if content.last() == Some(&q) {
                            content = &content[..content.len() - 1];
                        }
                    }
                }
                self.normalized.extend_from_slice(content);
            }
            (FieldType::Ascii | FieldType::Char, Encoding::Binary) => {
                let stop = memchr::memchr(0, bytes).unwrap_or(bytes.len());
                self.normalized.extend_from_slice(&bytes[..stop]);
            }
            (FieldType::Ascii | FieldType::Char, Encoding::Fixed) => {
                let stop = memchr::memchr2(b'\n', 0, bytes).unwrap_or(bytes.len());
                self.normalized.extend_from_slice(&bytes[..stop]);
            }
            _ => self.normalized.extend_from_slice(bytes),
        }
        self.normalized.truncate(MAX_NFIELD_LEN);
        quoted
    }

    fn write_back(&self, kind: FieldType, endian: Endian, quoted: bool, dest: &mut [u8]) {
        match kind {
            FieldType::Bcd => {
                encode_bcd(&self.normalized, endian, dest);
            }
            _ => {
                let skip = usize::from(quoted).min(dest.len());
                let dest = &mut dest[skip..];
                let n = self.normalized.len().min(dest.len());
                dest[..n].copy_from_slice(&self.normalized[..n]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode, DecodeOptions, FieldFormat};
    use crate::locator::resolve;
    use crate::schema::Schema;

    struct Broken;

    impl NonceSource for Broken {
        fn fill(&mut self, _buf: &mut [u8]) -> Result<(), String> {
            Err("no entropy".to_string())
        }
    }

    const SCHEMA: &str = r#"{ "structures": [
      { "name": "fixed", "type": "fixed", "records": [
        { "name": "r", "fields": [ { "name": "id", "length": 3 }, { "name": "phone", "length": 10 } ] } ] },
      { "name": "csv", "type": "separated", "quote": "\"", "records": [
        { "name": "r", "fields": [ { "name": "name" }, { "name": "card" } ] } ] },
      { "name": "cdr", "type": "binary", "records": [
        { "name": "c", "ids": [ { "position": 1, "key": "\\x01" } ], "fields": [
            { "name": "tag", "type": "uint8" },
            { "name": "msisdn", "type": "bcd_be_4" },
            { "name": "len", "type": "uint8" },
            { "name": "note", "length": 2 },
            { "name": "crc", "type": "uint8" } ],
          "variable_length": { "length_field": "len", "variable_field": "note", "adjust": 0 } } ] }
    ],
    "anonymizations": {
      "mask_all": [ { "field": "phone", "method": "mask", "start": -1, "length": 4, "key": "X" },
                    { "field": "card", "method": "mask", "start": 1, "length": 2, "key": "*" },
                    { "field": "msisdn", "method": "mask" },
                    { "field": "note", "method": "hash" } ],
      "random": [ { "field": "phone", "method": "nrandom" } ]
    } }"#;

    fn run(schema: &Schema, name: &str, anon: &mut Anonymizer, buf: &mut Vec<u8>) -> usize {
        let st = schema.structure(name).unwrap();
        let mut layout = Layout::new();
        resolve(DecodeOptions::default(), st, &st.records[0], buf, &mut layout).unwrap();
        anon.apply(st, &st.records[0], &layout, buf)
    }

    #[test]
    fn test_mask_tail_of_fixed_field() {
        let mut schema = Schema::from_json(SCHEMA).unwrap();
        schema.activate_anonymization("fixed", "mask_all").unwrap();
        let mut buf = b"0010401234567".to_vec();
        assert_eq!(run(&schema, "fixed", &mut Anonymizer::new(), &mut buf), 1);
        assert_eq!(buf, b"001040123XXXX");
    }

    #[test]
    fn test_separated_rewrite_skips_opening_quote() {
        let mut schema = Schema::from_json(SCHEMA).unwrap();
        schema.activate_anonymization("csv", "mask_all").unwrap();
        let mut buf = b"bob,\"4111\"".to_vec();
        assert_eq!(run(&schema, "csv", &mut Anonymizer::new(), &mut buf), 1);
        assert_eq!(buf, b"bob,\"**11\"");

        let mut bare = b"bob,4111".to_vec();
        assert_eq!(run(&schema, "csv", &mut Anonymizer::new(), &mut bare), 1);
        assert_eq!(bare, b"bob,**11");
    }

    #[test]
    fn test_bcd_mask_keeps_terminator_layout() {
        let mut schema = Schema::from_json(SCHEMA).unwrap();
        schema.activate_anonymization("cdr", "mask_all").unwrap();
        let mut buf = vec![0x01, 0x12, 0x34, 0x56, 0xff, 0x09, b'h', b'i', 0x77];
        run(&schema, "cdr", &mut Anonymizer::new(), &mut buf);
        assert_eq!(&buf[1..5], &[0x00, 0x00, 0x00, 0xff]);
        let mut text = Vec::new();
        decode(&FieldFormat::from_keyword("bcd_be_4").unwrap(), &buf[1..5], DecodeOptions::default(), &mut text).unwrap();
        assert_eq!(text, b"000000");
    }

    #[test]
    fn test_variable_length_field_is_anonymized_in_full() {
        let mut schema = Schema::from_json(SCHEMA).unwrap();
        schema.activate_anonymization("cdr", "mask_all").unwrap();
        // len says 11 bytes in total, so the note is 4 bytes long
        let mut buf = vec![0x01, 0x12, 0x3f, 0xff, 0xff, 0x0b, b'a', b'b', b'c', b'd', 0x55];
        let original = buf.clone();
        run(&schema, "cdr", &mut Anonymizer::new(), &mut buf);
        assert_ne!(&buf[6..10], &original[6..10]);
        assert!(buf[6..10].iter().all(|c| scramble::ALNUM_ALPHABET.contains(c)));
        // bytes around the variable field are untouched
        assert_eq!(buf[5], 0x0b);
        assert_eq!(buf[10], 0x55);
        // same input hashes to the same replacement
        let mut again = original.clone();
        run(&schema, "cdr", &mut Anonymizer::new(), &mut again);
        assert_eq!(again, buf);
    }

    #[test]
    fn test_random_differs_and_degrades_without_entropy() {
        let mut schema = Schema::from_json(SCHEMA).unwrap();
        schema.activate_anonymization("fixed", "random").unwrap();
        let original = b"0010401234567".to_vec();
        let mut a = original.clone();
        let mut b = original.clone();
        run(&schema, "fixed", &mut Anonymizer::new(), &mut a);
        run(&schema, "fixed", &mut Anonymizer::new(), &mut b);
        assert!(a[3..].iter().all(u8::is_ascii_digit));
        assert_ne!(a, b, "two random draws of ten digits should differ");

        let mut anon = Anonymizer::with_nonce_source(Box::new(Broken));
        let mut c = original.clone();
        assert_eq!(run(&schema, "fixed", &mut anon, &mut c), 0);
        assert_eq!(c, original);
        assert!(anon.crypto_warned);
    }
}
