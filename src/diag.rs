//! Source locations and diagnostic rendering.
//!
//! Every phase error carries a [`Span`] into the original source. Rendering a
//! diagnostic needs nothing but the source text and the error itself; there is
//! no global diagnostic sink.

use std::fmt;

/// A half-open byte range into the compiled source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Span {
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start: start as u32,
            end: end as u32,
        }
    }

    pub fn point(at: usize) -> Self {
        Self::new(at, at)
    }

    /// The source text this span covers.
    pub fn slice<'s>(&self, source: &'s str) -> &'s str {
        &source[self.start as usize..self.end as usize]
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// 1-based line and column of a byte offset.
pub fn line_col(source: &str, offset: u32) -> (u32, u32) {
    let offset = (offset as usize).min(source.len());
    let mut line = 1u32;
    let mut col = 1u32;
    for b in source.as_bytes()[..offset].iter() {
        if *b == b'\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// An error that points back into the source.
pub trait Located {
    fn span(&self) -> Span;
}

/// Render `error` as `line:col: message` against `source`.
pub fn render<E: Located + fmt::Display>(source: &str, error: &E) -> String {
    let (line, col) = line_col(source, error.span().start);
    format!("{line}:{col}: {error}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_col_counts_newlines() {
        let src = "ab\ncd\nef";
        assert_eq!(line_col(src, 0), (1, 1));
        assert_eq!(line_col(src, 3), (2, 1));
        assert_eq!(line_col(src, 7), (3, 2));
    }

    #[test]
    fn span_merge_covers_both() {
        let a = Span::new(4, 8);
        let b = Span::new(2, 6);
        assert_eq!(a.merge(b), Span::new(2, 8));
    }
}
