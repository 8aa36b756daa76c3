//! # Masking Stream
//!
//! Wraps a COPY text row stream and rewrites masked columns as rows go by.
//! Rows never have to fit in memory all at once; chunk boundaries may split rows.

use super::Transformer;
use crate::database::copy_text::{decode_row, encode_row, CopyTextError, LineBuffer};
use crate::database::{DatabaseError, RowStream, TableName};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

pub struct MaskingStream {
    table: TableName,
    inner: RowStream,
    lines: LineBuffer,
    transformers: Vec<Option<Transformer>>,
    done: bool,
}

impl MaskingStream {
    /// `transformers` is aligned with the dump's column order
    pub fn new(table: TableName, inner: RowStream, transformers: Vec<Option<Transformer>>) -> Self {
        Self {
            table,
            inner,
            lines: LineBuffer::new(),
            transformers,
            done: false,
        }
    }

    fn mask_line(&self, line: &[u8], out: &mut String) -> Result<(), CopyTextError> {
        let mut values = decode_row(line)?;
        if values.len() != self.transformers.len() {
            return Err(CopyTextError::ColumnCount {
                expected: self.transformers.len(),
                actual: values.len(),
            });
        }
        for (value, transformer) in values.iter_mut().zip(&self.transformers) {
            // NULL stays NULL
            if let (Some(current), Some(transformer)) = (value.as_mut(), transformer) {
                *current = transformer.apply(current);
            }
        }
        encode_row(&values, out);
        Ok(())
    }

    fn format_error(&self, source: CopyTextError) -> DatabaseError {
        DatabaseError::Format {
            table: self.table.to_string(),
            source,
        }
    }
}

impl Stream for MaskingStream {
    type Item = Result<Bytes, DatabaseError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            match ready!(this.inner.poll_next_unpin(cx)) {
                Some(Ok(chunk)) => {
                    let lines = this.lines.push(&chunk);
                    if lines.is_empty() {
                        continue;
                    }
                    let mut out = String::new();
                    for line in &lines {
                        if let Err(e) = this.mask_line(line, &mut out) {
                            this.done = true;
                            return Poll::Ready(Some(Err(this.format_error(e))));
                        }
                    }
                    return Poll::Ready(Some(Ok(Bytes::from(out))));
                }
                Some(Err(e)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.done = true;
                    let lines = std::mem::take(&mut this.lines);
                    return match lines.finish() {
                        Ok(()) => Poll::Ready(None),
                        Err(e) => Poll::Ready(Some(Err(this.format_error(e)))),
                    };
                }
            }
        }
    }
}
