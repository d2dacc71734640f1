//! Serializable types that cross the sandbox isolation boundary.
//!
//! Everything in this crate is plain data: capture payloads, marshalled
//! value envelopes, context records and the boundary message enum. Live
//! runtime values never appear here — the sandbox marshals them into
//! `CapturedValue` trees before sending.

use serde::{Deserialize, Serialize};

/// Identifier of one capture site, unique within one context table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CaptureId(pub u32);

impl CaptureId {
    /// Well-known id for uncaught runtime errors. The compile appends a
    /// window-error record under this id to every context table.
    pub const WINDOW_ERROR: CaptureId = CaptureId(u32::MAX);
}

/// Monotonic execution-run counter.
///
/// One epoch per execution request. Wraps at the safe-integer boundary
/// (2^53 − 1) so the value survives a round trip through JSON consumers
/// that store numbers as doubles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Epoch(pub u64);

impl Epoch {
    pub const SAFE_MAX: u64 = (1 << 53) - 1;

    /// The next epoch. Wraps to zero past `SAFE_MAX`.
    pub fn next(self) -> Self {
        if self.0 >= Self::SAFE_MAX {
            Epoch(0)
        } else {
            Epoch(self.0 + 1)
        }
    }
}

/// Classification of a capture site, assigned at compile time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextKind {
    Expression,
    Variable,
    Assignment,
    Return,
    FunctionCall,
    ConsoleLog,
    ConsoleDebug,
    ConsoleInfo,
    ConsoleWarn,
    ConsoleError,
    WindowError,
    Error,
    Warning,
    ParseError,
}

impl ContextKind {
    pub fn is_console(self) -> bool {
        matches!(
            self,
            Self::ConsoleLog
                | Self::ConsoleDebug
                | Self::ConsoleInfo
                | Self::ConsoleWarn
                | Self::ConsoleError
        )
    }
}

/// 1-based line/column range in the original source.
/// Start is inclusive, end is exclusive in columns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRange {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

/// Compile-time record correlating one capture id with its static site.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextRecord {
    pub id: CaptureId,
    pub kind: ContextKind,
    /// Verbatim source text of the site (a binding name, the expression
    /// text, a function signature).
    pub text: String,
    pub file: String,
    pub range: SourceRange,
}

/// The context table of one compile. Replaced wholesale on every recompile.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextTable {
    pub file: String,
    pub records: Vec<ContextRecord>,
}

impl ContextTable {
    pub fn get(&self, id: CaptureId) -> Option<&ContextRecord> {
        // Ids are dense indices, except for the well-known sentinels.
        if let Some(record) = self.records.get(id.0 as usize) {
            if record.id == id {
                return Some(record);
            }
        }
        self.records.iter().find(|record| record.id == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromiseStatus {
    Pending,
    Fulfilled,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromiseInfo {
    pub status: PromiseStatus,
}

/// Descriptive stand-in for a runtime value that cannot cross the
/// isolation boundary unchanged. Closed set; never carries live values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "envelope", rename_all = "kebab-case")]
pub enum MarshalledEnvelope {
    DomNode {
        tag: String,
        constructor: String,
        attributes: Vec<(String, String)>,
        has_children: bool,
        child_count: u32,
        text_content: Option<String>,
        /// Serialized outer markup, kept as a rendering fallback.
        outer_markup: String,
    },
    Function {
        name: Option<String>,
        /// Exact original source text captured at compile time.
        source: Option<String>,
        is_async: bool,
    },
    Symbol {
        description: Option<String>,
    },
    WeakSet,
    WeakMap,
    WeakRef,
    Object {
        constructor: String,
        entries: Vec<(String, CapturedValue)>,
    },
    Promise {
        status: PromiseStatus,
        value: Option<Box<CapturedValue>>,
    },
    Proxy,
    CyclicRef,
    /// Marshalling fallback when a value defeats classification.
    Opaque,
}

/// Serializable value tree produced by the marshalling layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "kebab-case")]
pub enum CapturedValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    /// Digits only; kept as text so JSON consumers never round it.
    BigInt(String),
    Text(String),
    Array(Vec<CapturedValue>),
    Object {
        entries: Vec<(String, CapturedValue)>,
    },
    Set(Vec<CapturedValue>),
    Map(Vec<(CapturedValue, CapturedValue)>),
    /// ISO-8601 text form.
    Date(String),
    ArrayBuffer {
        byte_length: u64,
    },
    Error {
        name: String,
        message: String,
    },
    Envelope(MarshalledEnvelope),
}

/// 1-based line/column in the *executed* (transformed, possibly bundled)
/// code. Attached to window-error payloads so the host can walk the
/// position back through the source-map chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPosition {
    pub line: u32,
    pub column: u32,
}

/// One captured value report. Ephemeral; discarded once superseded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub id: CaptureId,
    pub epoch: Epoch,
    pub is_error: bool,
    pub result: CapturedValue,
    pub timestamp_ms: u64,
    pub promise: Option<PromiseInfo>,
    /// Only present on payloads whose position must be remapped (uncaught
    /// runtime errors); ordinary captures anchor via their context record.
    pub raw_position: Option<RawPosition>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunPhase {
    Ready,
    ScriptComplete,
}

/// Messages exchanged across the isolation boundary.
///
/// `Execute` flows host → sandbox; `ValueCaptured` and `RunStatus` flow
/// sandbox → host. `ThemeUpdate` is epoch-independent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BoundaryMessage {
    Execute {
        epoch: Epoch,
        program: String,
        theme: String,
    },
    ThemeUpdate {
        theme: String,
    },
    ValueCaptured {
        epoch: Epoch,
        payload: Payload,
    },
    RunStatus {
        epoch: Epoch,
        phase: RunPhase,
    },
}

/// An inline annotation anchored to a 1-based line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decoration {
    pub line: u32,
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_increments_and_wraps() {
        assert_eq!(Epoch(0).next(), Epoch(1));
        assert_eq!(Epoch(41).next(), Epoch(42));
        assert_eq!(Epoch(Epoch::SAFE_MAX).next(), Epoch(0));
    }

    #[test]
    fn context_kind_console_predicate() {
        assert!(ContextKind::ConsoleLog.is_console());
        assert!(ContextKind::ConsoleError.is_console());
        assert!(!ContextKind::Expression.is_console());
        assert!(!ContextKind::WindowError.is_console());
    }

    #[test]
    fn context_table_rejects_mismatched_id() {
        let table = ContextTable {
            file: "main.js".into(),
            records: vec![ContextRecord {
                id: CaptureId(0),
                kind: ContextKind::Expression,
                text: "1 + 2".into(),
                file: "main.js".into(),
                range: SourceRange::default(),
            }],
        };
        assert!(table.get(CaptureId(0)).is_some());
        assert!(table.get(CaptureId(1)).is_none());
    }

    #[test]
    fn payload_round_trips_through_json() {
        let payload = Payload {
            id: CaptureId(7),
            epoch: Epoch(3),
            is_error: false,
            result: CapturedValue::Array(vec![
                CapturedValue::Number(1.0),
                CapturedValue::Envelope(MarshalledEnvelope::CyclicRef),
            ]),
            timestamp_ms: 123,
            promise: Some(PromiseInfo {
                status: PromiseStatus::Fulfilled,
            }),
            raw_position: None,
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn kebab_case_kind_names() {
        let json = serde_json::to_string(&ContextKind::ConsoleLog).unwrap();
        assert_eq!(json, "\"console-log\"");
        let json = serde_json::to_string(&ContextKind::WindowError).unwrap();
        assert_eq!(json, "\"window-error\"");
    }
}
