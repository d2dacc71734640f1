//! Source code management with zero-copy string slices.
//!
//! Source text is wrapped in `Arc<String>`; every string reference becomes
//! a `StrSlice` storing the Arc plus byte offsets. Context records and
//! function metadata need the *verbatim* original text of arbitrary spans
//! long after the compile borrow would have ended, so slices own their
//! source instead of borrowing it.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

/// 1-based line/column position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineCol {
    pub line: u32,
    pub column: u32,
}

/// Wrapper around source code that can be cheaply cloned.
///
/// All string slices taken during a compile reference into this source.
/// Line-start offsets are precomputed once so byte offsets convert to
/// 1-based line/column positions without rescanning.
#[derive(Clone)]
pub struct SourceCode {
    text: Arc<String>,
    line_starts: Arc<Vec<usize>>,
}

impl SourceCode {
    pub fn new(code: String) -> Self {
        let mut line_starts = vec![0];
        for (offset, byte) in code.bytes().enumerate() {
            if byte == b'\n' {
                line_starts.push(offset + 1);
            }
        }
        SourceCode {
            text: Arc::new(code),
            line_starts: Arc::new(line_starts),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Create a StrSlice referencing a portion of this source.
    ///
    /// # Panics
    /// Panics if the range is out of bounds or not on UTF-8 boundaries.
    pub fn slice(&self, start: usize, end: usize) -> StrSlice {
        assert!(self.text.is_char_boundary(start), "start not on char boundary");
        assert!(self.text.is_char_boundary(end), "end not on char boundary");
        assert!(start <= end, "start > end");
        assert!(end <= self.text.len(), "end out of bounds");

        StrSlice {
            source: self.clone(),
            start,
            end,
        }
    }

    /// Convert a byte offset to a 1-based line/column position.
    /// Columns count characters, not bytes.
    pub fn line_col(&self, offset: usize) -> LineCol {
        let offset = offset.min(self.text.len());
        let line_index = match self.line_starts.binary_search(&offset) {
            Ok(index) => index,
            Err(index) => index - 1,
        };
        let line_start = self.line_starts[line_index];
        let column = self.text[line_start..offset].chars().count() as u32 + 1;
        LineCol {
            line: line_index as u32 + 1,
            column,
        }
    }

    pub fn line_count(&self) -> u32 {
        self.line_starts.len() as u32
    }
}

impl fmt::Debug for SourceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourceCode({} bytes)", self.text.len())
    }
}

/// A string slice that references into a `SourceCode`.
///
/// `'static`, cheap to clone, `Send + Sync` — safe to hand to the sandbox
/// thread or store inside context records.
#[derive(Clone)]
pub struct StrSlice {
    source: SourceCode,
    start: usize,
    end: usize,
}

impl StrSlice {
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.source.text[self.start..self.end]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline]
    pub fn start(&self) -> usize {
        self.start
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    pub fn source(&self) -> &SourceCode {
        &self.source
    }
}

impl Deref for StrSlice {
    type Target = str;

    #[inline]
    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl AsRef<str> for StrSlice {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Debug for StrSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl fmt::Display for StrSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl PartialEq for StrSlice {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Eq for StrSlice {}

impl PartialEq<str> for StrSlice {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for StrSlice {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl Hash for StrSlice {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_str().hash(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_basics() {
        let source = SourceCode::new("hello world".to_string());
        let slice = source.slice(0, 5);
        assert_eq!(slice.as_str(), "hello");
        assert_eq!(slice.len(), 5);
        assert_eq!(source.slice(6, 11), "world");
    }

    #[test]
    fn line_col_is_one_based() {
        let source = SourceCode::new("ab\ncd\nef".to_string());
        assert_eq!(source.line_col(0), LineCol { line: 1, column: 1 });
        assert_eq!(source.line_col(1), LineCol { line: 1, column: 2 });
        assert_eq!(source.line_col(3), LineCol { line: 2, column: 1 });
        assert_eq!(source.line_col(7), LineCol { line: 3, column: 2 });
    }

    #[test]
    fn line_col_counts_chars_not_bytes() {
        let source = SourceCode::new("héllo".to_string());
        // 'é' is two bytes; the column after it is still 3.
        assert_eq!(source.line_col(3), LineCol { line: 1, column: 3 });
    }

    #[test]
    fn line_col_clamps_past_end() {
        let source = SourceCode::new("ab".to_string());
        assert_eq!(source.line_col(100), LineCol { line: 1, column: 3 });
    }

    #[test]
    fn str_slice_is_static_send_sync() {
        fn takes_static<T: 'static + Send + Sync>(_: T) {}
        let source = SourceCode::new("test".to_string());
        takes_static(source.slice(0, 4));
    }
}
