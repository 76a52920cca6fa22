//! Source location tracking

use serde::{Deserialize, Serialize};

/// Byte range in the source the declaration graph was produced from.
///
/// Lowering never reads the source; spans only travel into diagnostics.
/// Missing spans deserialize as `0..0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
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

    pub fn is_unknown(&self) -> bool {
        self.start == 0 && self.end == 0
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_merge() {
        let merged = Span::new(10, 20).merge(Span::new(0, 5));
        assert_eq!(merged, Span::new(0, 20));
    }

    #[test]
    fn test_missing_span_deserializes_as_unknown() {
        #[derive(Deserialize)]
        struct Node {
            #[serde(default)]
            span: Span,
        }
        let node: Node = serde_json::from_str("{}").unwrap();
        assert!(node.span.is_unknown());
        assert_eq!(node.span.to_string(), "0..0");
    }
}
