//! Source location tracking
//!
//! Two coordinate systems are in play: `Span` is a byte range inside a piece
//! of annotation text, while `Location` is the front end's line/column
//! reference to a declaration or call site in the host source file.

use serde::{Deserialize, Serialize};

/// A byte range inside annotation text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

impl From<Span> for std::ops::Range<usize> {
    fn from(span: Span) -> Self {
        span.start..span.end
    }
}

impl From<std::ops::Range<usize>> for Span {
    fn from(range: std::ops::Range<usize>) -> Self {
        Span::new(range.start, range.end)
    }
}

/// A value with source location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Self { node, span }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Spanned<U> {
        Spanned {
            node: f(self.node),
            span: self.span,
        }
    }
}

/// A line/column reference supplied by the front end (1-based, 0 = unknown)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Location {
    #[serde(default)]
    pub line: u32,
    #[serde(default)]
    pub column: u32,
}

impl Location {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }

    pub fn is_known(&self) -> bool {
        self.line > 0
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_known() {
            write!(f, "{}:{}", self.line, self.column)
        } else {
            write!(f, "?:?")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_merge_non_overlapping() {
        let merged = Span::new(0, 5).merge(Span::new(10, 15));
        assert_eq!(merged, Span::new(0, 15));
    }

    #[test]
    fn test_span_merge_reversed_order() {
        let merged = Span::new(10, 20).merge(Span::new(0, 5));
        assert_eq!(merged, Span::new(0, 20));
    }

    #[test]
    fn test_span_display() {
        assert_eq!(format!("{}", Span::new(42, 99)), "42..99");
    }

    #[test]
    fn test_span_range_round_trip() {
        let range: std::ops::Range<usize> = Span::new(5, 15).into();
        assert_eq!(range, 5..15);
        let span: Span = (10..20usize).into();
        assert_eq!(span, Span::new(10, 20));
    }

    #[test]
    fn test_spanned_map() {
        let s = Spanned::new(10, Span::new(0, 5));
        let mapped = s.map(|n| n * 2);
        assert_eq!(mapped.node, 20);
        assert_eq!(mapped.span, Span::new(0, 5));
    }

    #[test]
    fn test_location_display() {
        assert_eq!(Location::new(12, 9).to_string(), "12:9");
        assert_eq!(Location::default().to_string(), "?:?");
    }

    #[test]
    fn test_location_ordering_is_line_major() {
        assert!(Location::new(3, 40) < Location::new(4, 1));
        assert!(Location::new(4, 1) < Location::new(4, 2));
    }
}
