//! # COPY Text Format
//!
//! Row codec for PostgreSQL's `COPY ... (FORMAT text)`: one row per line, columns
//! separated by tab, `\N` for NULL, backslash escapes for `\\`, tab, newline,
//! carriage return, backspace, form feed and vertical tab.

/// Errors decoding COPY text rows
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CopyTextError {
    #[error("row ends with a dangling backslash")]
    DanglingEscape,
    #[error("row is not valid UTF-8")]
    InvalidUtf8,
    #[error("data ends in the middle of a row")]
    UnterminatedRow,
    #[error("row has {actual} columns, expected {expected}")]
    ColumnCount { expected: usize, actual: usize },
}

const NULL_MARKER: &str = "\\N";

/// Decode one row (without its trailing newline) into column values
pub fn decode_row(line: &[u8]) -> Result<Vec<Option<String>>, CopyTextError> {
    let line = std::str::from_utf8(line).map_err(|_| CopyTextError::InvalidUtf8)?;
    line.split('\t').map(decode_field).collect()
}

fn decode_field(field: &str) -> Result<Option<String>, CopyTextError> {
    if field == NULL_MARKER {
        return Ok(None);
    }

    let mut value = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            value.push(c);
            continue;
        }
        match chars.next() {
            Some('b') => value.push('\u{8}'),
            Some('f') => value.push('\u{c}'),
            Some('n') => value.push('\n'),
            Some('r') => value.push('\r'),
            Some('t') => value.push('\t'),
            Some('v') => value.push('\u{b}'),
            // Any other escaped character stands for itself
            Some(other) => value.push(other),
            None => return Err(CopyTextError::DanglingEscape),
        }
    }
    Ok(Some(value))
}

/// Append one encoded row, including its trailing newline, to `out`
pub fn encode_row<S: AsRef<str>>(values: &[Option<S>], out: &mut String) {
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            out.push('\t');
        }
        match value {
            None => out.push_str(NULL_MARKER),
            Some(value) => encode_field(value.as_ref(), out),
        }
    }
    out.push('\n');
}

fn encode_field(value: &str, out: &mut String) {
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\u{b}' => out.push_str("\\v"),
            c => out.push(c),
        }
    }
}

/// Reassembles rows from chunks that may split a row anywhere
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every row it completes, without newlines
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let mut line = std::mem::take(&mut self.pending);
            line.extend_from_slice(&rest[..pos]);
            lines.push(line);
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);
        lines
    }

    /// Fail if the input ended inside a row
    pub fn finish(self) -> Result<(), CopyTextError> {
        if self.pending.is_empty() {
            Ok(())
        } else {
            Err(CopyTextError::UnterminatedRow)
        }
    }
}
