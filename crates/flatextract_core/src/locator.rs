// locator.rs: per-record field framing for fixed, separated and binary encodings
use log::debug;

use crate::codec::{decode, DecodeOptions};
use crate::error::Result;
use crate::schema::{Encoding, FieldSource, LengthPolicy, Record, Structure};
use crate::tokenizer::column_spans;

/// Resolved framing of the current record instance.
///
/// Index `i` describes `record.fields[i]`. Values are overwritten by every
/// `resolve` call and must not be read across records.
#[derive(Debug, Default)]
pub struct Layout {
    pub offsets: Vec<Option<usize>>,
    pub lengths: Vec<usize>,
    spans: Vec<(usize, usize)>,
    scratch: Vec<u8>,
}

impl Layout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes of field `idx` within `buf`, clipped to what the buffer holds.
    pub fn field_bytes<'a>(&self, idx: usize, buf: &'a [u8]) -> Option<&'a [u8]> {
        let off = (*self.offsets.get(idx)?)?;
        let len = self.lengths.get(idx).copied().unwrap_or(0);
        if off > buf.len() {
            return Some(&[]);
        }
        let end = off.saturating_add(len).min(buf.len());
        Some(&buf[off..end])
    }

    fn reset(&mut self, n: usize) {
        self.offsets.clear();
        self.offsets.resize(n, None);
        self.lengths.clear();
        self.lengths.resize(n, 0);
    }
}

/// Total bytes of the fields that never change size.
pub(crate) fn fixed_part(record: &Record) -> usize {
    match record.variable {
        Some(v) => record.length - record.fields[v.variable_field].length(),
        None => record.length,
    }
}

/// Resolve every field's offset and length for `record` over `buf`.
///
/// `buf` holds one line without its terminator, or the binary window starting at
/// the record. Returns the bytes the record consumes.
pub fn resolve(opts: DecodeOptions, structure: &Structure, record: &Record, buf: &[u8], layout: &mut Layout) -> Result<usize> {
    layout.reset(record.fields.len());
    match &structure.encoding {
        Encoding::Separated(dialect) => {
            let mut spans = std::mem::take(&mut layout.spans);
            column_spans(buf, dialect, &mut spans);
            for (i, field) in record.fields.iter().enumerate() {
                let FieldSource::Input { position, .. } = field.source else { continue };
                let Some(&(s, e)) = spans.get(position - 1) else { continue };
                // an empty column closed by another delimiter is absent, a trailing one is not
                if s == e && position < spans.len() {
                    continue;
                }
                layout.offsets[i] = Some(s);
                layout.lengths[i] = e - s;
            }
            layout.spans = spans;
            Ok(buf.len())
        }
        Encoding::Fixed | Encoding::Binary => resolve_positional(opts, record, buf, layout),
    }
}

fn resolve_positional(opts: DecodeOptions, record: &Record, buf: &[u8], layout: &mut Layout) -> Result<usize> {
    for (i, field) in record.fields.iter().enumerate() {
        if let FieldSource::Input { position, format } = field.source {
            layout.offsets[i] = Some(position);
            layout.lengths[i] = format.length;
        }
    }

    let Some(var) = record.variable else {
        if record.policy == LengthPolicy::Minimum {
            if let Some(last) = record.fields.iter().rposition(|f| !f.is_const()) {
                let position = record.fields[last].position().unwrap_or(0);
                if buf.len() > position {
                    if record.fields[last].length() == 0 {
                        layout.lengths[last] = buf.len() - position;
                    }
                } else {
                    layout.offsets[last] = None;
                }
            }
        }
        return Ok(record.length);
    };

    // length field precedes the variable field, so its provisional offset is final
    let lf = &record.fields[var.length_field];
    let mut total = record.length;
    if let (Some(format), Some(bytes)) = (lf.format(), layout.field_bytes(var.length_field, buf)) {
        layout.scratch.clear();
        decode(format, bytes, opts, &mut layout.scratch)?;
        let parsed = std::str::from_utf8(&layout.scratch)
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok());
        match parsed {
            Some(v) => {
                let adjusted = v.saturating_add(var.adjust).max(0) as u64;
                total = adjusted.min(buf.len() as u64) as usize;
            }
            None => debug!("Unparsable length in record '{}', using static length", record.name),
        }
    }

    let declared = record.fields[var.variable_field].length();
    let var_len = total.saturating_sub(fixed_part(record));
    layout.lengths[var.variable_field] = var_len;
    for i in var.variable_field + 1..record.fields.len() {
        if let Some(off) = layout.offsets[i] {
            layout.offsets[i] = Some(off - declared + var_len);
        }
    }
    debug!("Record '{}' dynamic length {} (variable part {})", record.name, total, var_len);
    Ok(total.max(fixed_part(record)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    fn schema() -> Schema {
        Schema::from_json(
            r#"{ "structures": [
              { "name": "people", "type": "fixed", "records": [
                { "name": "p", "fields": [ { "name": "id", "length": 3 }, { "name": "name", "length": 7 } ] } ] },
              { "name": "tail", "type": "fixed", "records": [
                { "name": "t", "record_length": "minimum",
                  "fields": [ { "name": "a", "length": 2 }, { "name": "b", "length": 3 } ] } ] },
              { "name": "blocks", "type": "binary", "records": [
                { "name": "v", "fields": [
                    { "name": "len", "type": "uint8" },
                    { "name": "data", "length": 2 },
                    { "name": "crc", "type": "uint8" } ],
                  "variable_length": { "length_field": "len", "variable_field": "data", "adjust": 0 } } ] },
              { "name": "csv", "type": "separated", "quote": "\"", "records": [
                { "name": "r", "fields": [ { "name": "a" }, { "name": "b" }, { "name": "c" }, { "name": "d" } ] } ] }
            ] }"#,
        )
        .expect("schema")
    }

    fn run(s: &Schema, name: &str, buf: &[u8]) -> (Layout, usize) {
        let st = s.structure(name).unwrap();
        let mut layout = Layout::new();
        let used = resolve(DecodeOptions::default(), st, &st.records[0], buf, &mut layout).unwrap();
        (layout, used)
    }

    #[test]
    fn test_fixed_offsets_are_cumulative() {
        let s = schema();
        let (layout, used) = run(&s, "people", b"001ALICE  ");
        assert_eq!(layout.offsets, vec![Some(0), Some(3)]);
        assert_eq!(layout.field_bytes(1, b"001ALICE  "), Some(&b"ALICE  "[..]));
        assert_eq!(used, 10);
    }

    #[test]
    fn test_minimum_policy_last_field_presence() {
        let s = schema();
        let (layout, _) = run(&s, "tail", b"ab");
        assert_eq!(layout.offsets, vec![Some(0), None]);
        let (layout, _) = run(&s, "tail", b"abc");
        assert_eq!(layout.offsets, vec![Some(0), Some(2)]);
        assert_eq!(layout.field_bytes(1, b"abc"), Some(&b"c"[..]));
    }

    #[test]
    fn test_dynamic_length_shifts_following_fields() {
        let s = schema();
        // total 6: len(1) + data(4) + crc(1)
        let buf = [6u8, b'w', b'x', b'y', b'z', 0xee, 0x99, 0x99];
        let (layout, used) = run(&s, "blocks", &buf);
        assert_eq!(used, 6);
        assert_eq!(layout.lengths[1], 4);
        assert_eq!(layout.offsets[2], Some(5));
        assert_eq!(layout.field_bytes(2, &buf), Some(&[0xeeu8][..]));
    }

    #[test]
    fn test_dynamic_length_is_clamped() {
        let s = schema();
        // declared total larger than the buffer
        let buf = [200u8, 1, 2, 3];
        let (layout, used) = run(&s, "blocks", &buf);
        assert_eq!(used, 4);
        assert_eq!(layout.lengths[1], 2);
        // total below the fixed part leaves an empty variable field
        let buf = [1u8, 0xaa, 0xbb, 0xcc];
        let (layout, used) = run(&s, "blocks", &buf);
        assert_eq!(layout.lengths[1], 0);
        assert_eq!(layout.offsets[2], Some(1));
        assert_eq!(used, 2);
    }

    #[test]
    fn test_separated_missing_columns_are_absent() {
        let s = schema();
        let line = b"x,\"y,z\",";
        let (layout, used) = run(&s, "csv", line);
        assert_eq!(used, line.len());
        assert_eq!(layout.offsets, vec![Some(0), Some(2), Some(8), None]);
        assert_eq!(layout.field_bytes(1, line), Some(&b"\"y,z\""[..]));
        assert_eq!(layout.field_bytes(2, line), Some(&b""[..]));
        assert_eq!(layout.field_bytes(3, line), None);
    }

    #[test]
    fn test_separated_empty_inner_column_is_absent() {
        let s = schema();
        let (layout, _) = run(&s, "csv", b"a,,c,d");
        assert_eq!(layout.offsets, vec![Some(0), None, Some(3), Some(5)]);
        assert_eq!(layout.field_bytes(1, b"a,,c,d"), None);
        let (layout, _) = run(&s, "csv", b",b,c,");
        assert_eq!(layout.offsets, vec![None, Some(1), Some(3), Some(5)]);
        assert_eq!(layout.field_bytes(3, b",b,c,"), Some(&b""[..]));
    }
}
