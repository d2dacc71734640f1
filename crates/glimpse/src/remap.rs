//! Source maps and the position remapper.
//!
//! The emitter records one mapping per printed node start. A payload's
//! position in the executed (transformed, possibly bundled) code is walked
//! back through the applicable map chain to the original source. The
//! public interface is 1-based on both sides; the 0-based column
//! arithmetic the mapping data uses internally never leaks out.

use serde::{Deserialize, Serialize};

/// One mapping entry: a generated position and the original position it
/// was printed from. Lines are 1-based, columns 0-based (internal form).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub generated_line: u32,
    pub generated_column: u32,
    pub original_line: u32,
    pub original_column: u32,
}

/// Mappings for one transformation step, sorted by generated position.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMap {
    /// Original file the mappings point into.
    pub file: String,
    /// Character length of every generated line; lookups beyond a line's
    /// end are out of range rather than "nearest mapping wins".
    pub generated_line_lengths: Vec<u32>,
    pub mappings: Vec<Mapping>,
}

impl SourceMap {
    pub fn new(file: impl Into<String>) -> Self {
        SourceMap {
            file: file.into(),
            generated_line_lengths: Vec::new(),
            mappings: Vec::new(),
        }
    }
}

/// A position resolved back to original source, 1-based.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemappedPosition {
    pub line: u32,
    pub column: u32,
    pub file: String,
}

/// Resolve a transformed-code position through one map.
///
/// `line` and `column` are 1-based. Returns `None` for any failure:
/// unknown line, column out of range, no mapping at or before the column.
fn lookup(map: &SourceMap, line: u32, column: u32) -> Option<RemappedPosition> {
    if line == 0 || column == 0 {
        return None;
    }
    let line_length = *map.generated_line_lengths.get(line as usize - 1)?;
    // 0-based from here on.
    let column = column - 1;
    if column > line_length {
        return None;
    }
    let candidate = map
        .mappings
        .iter()
        .filter(|mapping| mapping.generated_line == line && mapping.generated_column <= column)
        .last()?;
    Some(RemappedPosition {
        line: candidate.original_line,
        column: candidate.original_column + 1,
        file: map.file.clone(),
    })
}

/// Resolve a position through a chain of maps.
///
/// The chain is ordered outermost-first (the map produced by the first
/// transformation step first); resolution walks it back-to-front, from
/// the code that actually executed toward the original source. Any step
/// failing resolves the whole chain to `None` — the caller keeps the
/// payload and drops only the position enrichment.
pub fn remap(chain: &[SourceMap], line: u32, column: u32) -> Option<RemappedPosition> {
    let mut position: Option<RemappedPosition> = None;
    for map in chain.iter().rev() {
        let (line, column) = match &position {
            None => (line, column),
            Some(previous) => (previous.line, previous.column),
        };
        position = Some(lookup(map, line, column)?);
    }
    position
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with(mappings: Vec<Mapping>, line_lengths: Vec<u32>) -> SourceMap {
        SourceMap {
            file: "main.js".into(),
            generated_line_lengths: line_lengths,
            mappings,
        }
    }

    #[test]
    fn exact_mapping_hit() {
        // Transformed (1, 10) was printed from original (5, 3).
        let map = map_with(
            vec![Mapping {
                generated_line: 1,
                generated_column: 9,
                original_line: 5,
                original_column: 2,
            }],
            vec![40],
        );
        let position = remap(&[map], 1, 10).unwrap();
        assert_eq!(position.line, 5);
        assert_eq!(position.column, 3);
        assert_eq!(position.file, "main.js");
    }

    #[test]
    fn nearest_preceding_mapping_wins() {
        let map = map_with(
            vec![
                Mapping {
                    generated_line: 1,
                    generated_column: 0,
                    original_line: 1,
                    original_column: 0,
                },
                Mapping {
                    generated_line: 1,
                    generated_column: 20,
                    original_line: 2,
                    original_column: 4,
                },
            ],
            vec![30],
        );
        let position = remap(&[map], 1, 25).unwrap();
        assert_eq!((position.line, position.column), (2, 5));
    }

    #[test]
    fn out_of_range_column_returns_none() {
        let map = map_with(
            vec![Mapping {
                generated_line: 1,
                generated_column: 0,
                original_line: 1,
                original_column: 0,
            }],
            vec![10],
        );
        assert!(remap(&[map.clone()], 1, 200).is_none());
        assert!(remap(&[map.clone()], 7, 1).is_none());
        assert!(remap(&[map], 0, 0).is_none());
    }

    #[test]
    fn chain_resolves_through_both_maps() {
        // Bundling step: bundled (3, 1..) came from transformed (1, 1..).
        let bundler_map = map_with(
            vec![Mapping {
                generated_line: 3,
                generated_column: 0,
                original_line: 1,
                original_column: 0,
            }],
            vec![10, 10, 10],
        );
        // Instrumentation step: transformed (1, 1..) came from original (2, 5..).
        let instrument_map = map_with(
            vec![Mapping {
                generated_line: 1,
                generated_column: 0,
                original_line: 2,
                original_column: 4,
            }],
            vec![20],
        );
        let chain = vec![instrument_map, bundler_map];
        let position = remap(&chain, 3, 1).unwrap();
        assert_eq!((position.line, position.column), (2, 5));
    }

    #[test]
    fn chain_failure_drops_position() {
        let broken = map_with(vec![], vec![5]);
        let fine = map_with(
            vec![Mapping {
                generated_line: 1,
                generated_column: 0,
                original_line: 1,
                original_column: 0,
            }],
            vec![5],
        );
        assert!(remap(&[fine, broken], 1, 2).is_none());
    }

    #[test]
    fn empty_chain_resolves_to_none() {
        assert!(remap(&[], 1, 1).is_none());
    }
}
