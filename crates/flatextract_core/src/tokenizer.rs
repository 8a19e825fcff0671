// tokenizer.rs: quote-aware column scanning for separated records
use memchr::{memchr, memchr2};

/// How a separated line is split into columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dialect {
    pub delimiter: u8,
    pub quote: Option<u8>,
    /// Runs of the delimiter count as a single boundary.
    pub squeeze: bool,
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect { delimiter: b',', quote: Some(b'"'), squeeze: false }
    }
}

/// Walk the columns of `line`, calling `on_column(start, end)` with each raw span.
///
/// Spans include any quote characters. Inside a quoted span a doubled quote or a
/// backslash-quote pair is literal. An empty line has no columns.
fn scan<F: FnMut(usize, usize)>(line: &[u8], d: &Dialect, mut on_column: F) {
    let n = line.len();
    if n == 0 {
        return;
    }
    let mut i = 0usize;
    let mut start = 0usize;
    let mut inside_quote = false;

    while i < n {
        if inside_quote {
            // inside_quote is only ever set when a quote char exists
            let q = d.quote.unwrap_or(d.delimiter);
            let b = line[i];
            if (b == q || b == b'\\') && i + 1 < n && line[i + 1] == q {
                i += 2;
                continue;
            }
            if b == q {
                inside_quote = false;
            }
            i += 1;
            continue;
        }
        let next = match d.quote {
            Some(q) => memchr2(d.delimiter, q, &line[i..]),
            None => memchr(d.delimiter, &line[i..]),
        };
        let Some(off) = next else { break };
        i += off;
        if line[i] == d.delimiter {
            on_column(start, i);
            i += 1;
            if d.squeeze {
                while i < n && line[i] == d.delimiter {
                    i += 1;
                }
            }
            start = i;
        } else {
            inside_quote = true;
            i += 1;
        }
    }
    on_column(start, n);
}

/// Raw `(start, end)` byte spans of every column, written into a reused vector.
pub fn column_spans(line: &[u8], d: &Dialect, spans: &mut Vec<(usize, usize)>) {
    spans.clear();
    scan(line, d, |s, e| spans.push((s, e)));
}

/// Number of columns on the line; the separated equivalent of record length.
pub fn field_count(line: &[u8], d: &Dialect) -> usize {
    let mut count = 0usize;
    scan(line, d, |_, _| count += 1);
    count
}

/// Append the content of a raw column span to `out` with quoting removed.
pub fn unquote_into(raw: &[u8], d: &Dialect, out: &mut Vec<u8>) {
    let Some(q) = d.quote else {
        out.extend_from_slice(raw);
        return;
    };
    let n = raw.len();
    let mut i = 0usize;
    let mut inside_quote = false;
    while i < n {
        let b = raw[i];
        if inside_quote && (b == q || b == b'\\') && i + 1 < n && raw[i + 1] == q {
            out.push(q);
            i += 2;
            continue;
        }
        if b == q {
            inside_quote = !inside_quote;
        } else {
            out.push(b);
        }
        i += 1;
    }
}

/// Content of the column at 1-based `position`, or None past the last column.
pub fn extract_field(line: &[u8], d: &Dialect, position: usize) -> Option<Vec<u8>> {
    if position == 0 {
        return None;
    }
    let mut idx = 0usize;
    let mut found: Option<(usize, usize)> = None;
    scan(line, d, |s, e| {
        idx += 1;
        if idx == position {
            found = Some((s, e));
        }
    });
    found.map(|(s, e)| {
        let mut field = Vec::with_capacity(e - s);
        unquote_into(&line[s..e], d, &mut field);
        field
    })
}

/// Split a whole line into unquoted columns.
pub fn split_fields(line: &[u8], d: &Dialect) -> Vec<Vec<u8>> {
    let mut spans = Vec::with_capacity(memchr::memchr_iter(d.delimiter, line).count() + 1);
    column_spans(line, d, &mut spans);
    spans
        .iter()
        .map(|&(s, e)| {
            let mut field = Vec::with_capacity(e - s);
            unquote_into(&line[s..e], d, &mut field);
            field
        })
        .collect()
}
