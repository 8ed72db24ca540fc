//! Positional bind marker scanning.
//!
//! Values are never spliced into the statement text. The scanner only counts
//! `?` markers outside of literals, identifiers and comments so that a wrong
//! number of values is reported before anything is sent, and rewrites the
//! legacy `'?'` spelling of a marker into a plain `?`.

use std::borrow::Cow;

use crate::errors::BadQuery;

#[derive(Debug, Default, PartialEq, Eq)]
struct Scan {
    plain_markers: usize,
    // Byte ranges of `'?'` literals, quotes included.
    quoted_markers: Vec<std::ops::Range<usize>>,
}

/// Checks `cql` against the number of bound values and returns the text to send.
///
/// A `'?'` string literal is only treated as a marker when the plain `?`
/// markers alone do not account for every value; otherwise it stays a
/// one-character string.
pub fn prepare_statement(cql: &str, n_values: usize) -> Result<Cow<'_, str>, BadQuery> {
    let scan = scan(cql)?;

    if scan.plain_markers == n_values {
        return Ok(Cow::Borrowed(cql));
    }

    if scan.plain_markers + scan.quoted_markers.len() != n_values {
        return Err(BadQuery::ValueCountMismatch {
            markers: scan.plain_markers,
            values: n_values,
        });
    }

    let mut rewritten = String::with_capacity(cql.len());
    let mut last = 0;
    for range in &scan.quoted_markers {
        rewritten.push_str(&cql[last..range.start]);
        rewritten.push('?');
        last = range.end;
    }
    rewritten.push_str(&cql[last..]);
    Ok(Cow::Owned(rewritten))
}

/// Number of `?` markers, not counting `'?'` literals.
pub fn count_markers(cql: &str) -> Result<usize, BadQuery> {
    scan(cql).map(|s| s.plain_markers)
}

fn scan(cql: &str) -> Result<Scan, BadQuery> {
    let bytes = cql.as_bytes();
    let mut result = Scan::default();
    let mut pos = 0;

    while pos < bytes.len() {
        match bytes[pos] {
            b'\'' => {
                let end = skip_quoted(bytes, pos, b'\'');
                if &bytes[pos..end] == b"'?'" {
                    result.quoted_markers.push(pos..end);
                }
                pos = end;
            }
            b'"' => pos = skip_quoted(bytes, pos, b'"'),
            b'$' if bytes.get(pos + 1) == Some(&b'$') => {
                pos = find(bytes, pos + 2, b"$$").map_or(bytes.len(), |p| p + 2);
            }
            b'-' if bytes.get(pos + 1) == Some(&b'-') => pos = skip_line(bytes, pos),
            b'/' if bytes.get(pos + 1) == Some(&b'/') => pos = skip_line(bytes, pos),
            b'/' if bytes.get(pos + 1) == Some(&b'*') => {
                pos = find(bytes, pos + 2, b"*/").map_or(bytes.len(), |p| p + 2);
            }
            b'?' => {
                result.plain_markers += 1;
                pos += 1;
            }
            b':' if starts_named_marker(bytes, pos) => {
                let name: String = cql[pos + 1..]
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                    .collect();
                return Err(BadQuery::NamedMarkersUnsupported(name));
            }
            _ => pos += 1,
        }
    }

    Ok(result)
}

// Returns the position right after the closing quote. A doubled quote is an
// escaped quote, not the end of the literal.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut pos = start + 1;
    while pos < bytes.len() {
        if bytes[pos] == quote {
            if bytes.get(pos + 1) == Some(&quote) {
                pos += 2;
                continue;
            }
            return pos + 1;
        }
        pos += 1;
    }
    bytes.len()
}

fn skip_line(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|b| *b == b'\n')
        .map_or(bytes.len(), |p| start + p + 1)
}

fn find(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= bytes.len() {
        return None;
    }
    bytes[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| from + p)
}

// `:name` directly after whitespace or an operator. Keeps map literals such
// as `{'a':now()}` from being mistaken for named markers.
fn starts_named_marker(bytes: &[u8], pos: usize) -> bool {
    let next_is_ident = bytes
        .get(pos + 1)
        .is_some_and(|b| b.is_ascii_alphabetic() || *b == b'_');
    let prev_allows = pos == 0
        || matches!(
            bytes[pos - 1],
            b' ' | b'\t' | b'\n' | b'\r' | b'=' | b'(' | b',' | b'<' | b'>' | b'['
        );
    next_is_ident && prev_allows
}
