//! Machine-readable status protocol emitted by the virtualization tool.
//!
//! `vagrant status --machine-readable` prints one record per line:
//!
//! ```text
//! 1624000000,default,state,running
//! ```
//!
//! The first three comma-separated fields are timestamp, target (empty for a
//! global record) and kind; everything after is data. Commas, newlines and
//! the escape character itself inside data fields are escaped with a `\`
//! prefix and are unescaped before the field is exposed.
//!
//! Parsing is strict: a single malformed line fails the whole call, because
//! acting on partial host-state information is unsafe.

use crate::error::{Error, Result};

/// The escape prefix used inside data fields.
const ESCAPE: char = '\\';

/// One parsed status record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRecord {
    pub timestamp: String,
    /// Empty for global records.
    pub target: String,
    pub kind: String,
    /// Data fields, unescaped, in input order.
    pub fields: Vec<String>,
}

/// Parse the full status output into the records matching the given filters.
///
/// An empty `target` / `kind` filter matches every record. Blank lines are
/// skipped.
///
/// # Errors
///
/// [`Error::StatusParse`] when any line has fewer than three fields, an
/// unknown escape sequence, or a dangling trailing escape. No partial result
/// is returned.
pub fn parse_records(raw: &str, target: &str, kind: &str) -> Result<Vec<StatusRecord>> {
    let mut records = Vec::new();
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let record = parse_line(line)?;
        if !target.is_empty() && record.target != target {
            continue;
        }
        if !kind.is_empty() && record.kind != kind {
            continue;
        }
        records.push(record);
    }
    Ok(records)
}

/// Return the single global `state` record.
///
/// Zero matches and multiple matches are both reported as
/// [`Error::AmbiguousStatus`]; a default is never assumed.
pub fn single_state_record(raw: &str) -> Result<StatusRecord> {
    let mut matches = parse_records(raw, "", "state")?;
    if matches.len() != 1 {
        return Err(Error::AmbiguousStatus {
            found: matches.len(),
            output: raw.to_string(),
        });
    }
    Ok(matches.remove(0))
}

/// Escape a data field for the wire format.
///
/// Inverse of the unescaping applied by [`parse_records`].
pub fn escape_field(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    for ch in field.chars() {
        match ch {
            ',' => out.push_str("\\,"),
            '\n' => out.push_str("\\n"),
            c if c == ESCAPE => out.push_str("\\\\"),
            c => out.push(c),
        }
    }
    out
}

fn parse_line(line: &str) -> Result<StatusRecord> {
    let mut parts = split_unescaped_commas(line);
    if parts.len() < 3 {
        return Err(Error::StatusParse {
            line: line.to_string(),
            reason: format!(
                "expected at least 3 comma-separated fields, got {}",
                parts.len()
            ),
        });
    }

    let mut fields = Vec::with_capacity(parts.len() - 3);
    for part in &parts[3..] {
        let unescaped = unescape_field(part).map_err(|reason| Error::StatusParse {
            line: line.to_string(),
            reason,
        })?;
        fields.push(unescaped);
    }

    let kind = parts.remove(2);
    let target = parts.remove(1);
    let timestamp = parts.remove(0);
    Ok(StatusRecord {
        timestamp,
        target,
        kind,
        fields,
    })
}

/// Split on commas, honouring the escape prefix (`\,` does not split).
///
/// Escape pairs are kept verbatim so [`unescape_field`] can resolve or reject
/// them per field.
fn split_unescaped_commas(line: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for ch in line.chars() {
        if escaped {
            current.push(ESCAPE);
            current.push(ch);
            escaped = false;
        } else if ch == ESCAPE {
            escaped = true;
        } else if ch == ',' {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(ch);
        }
    }
    if escaped {
        // Dangling escape at end of line; kept so unescape_field reports it.
        current.push(ESCAPE);
    }
    parts.push(current);
    parts
}

fn unescape_field(field: &str) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(ch) = chars.next() {
        if ch != ESCAPE {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some(',') => out.push(','),
            Some('n') => out.push('\n'),
            Some(c) if c == ESCAPE => out.push(ESCAPE),
            Some(other) => return Err(format!("unknown escape sequence `\\{other}`")),
            None => return Err("dangling escape at end of field".to_string()),
        }
    }
    Ok(out)
}
