//! Error taxonomy of the playground core.
//!
//! Nothing here ever crosses the sandbox boundary as a panic: compile
//! failures become synthetic payloads, marshalling failures degrade to a
//! placeholder envelope, remap failures drop only position enrichment.

use std::io::{Cursor, Read};

use ariadne::{Config, Label, Report, ReportKind, Source};
use glimpse_probe_protocol::{
    CaptureId, CapturedValue, ContextKind, ContextRecord, ContextTable, Epoch, Payload, SourceRange,
};
use thiserror::Error;

use crate::parser::Diagnostic;

/// Source failed to parse. Aborts instrumentation for that file only.
#[derive(Error, Debug, Clone)]
#[error("{file}:{line}:{column}: {message}")]
pub struct CompileError {
    pub message: String,
    pub file: String,
    pub line: u32,
    pub column: u32,
    /// Byte span of the failure, for report rendering.
    pub start: usize,
    pub end: usize,
}

impl CompileError {
    /// Synthetic payload + one-record context table anchoring the failure
    /// at the offending line. Same envelope shape as a runtime payload,
    /// carrying the raw message and no computed value.
    pub fn to_payload(&self, epoch: Epoch) -> (Payload, ContextTable) {
        let record = ContextRecord {
            id: CaptureId(0),
            kind: ContextKind::ParseError,
            text: self.message.clone(),
            file: self.file.clone(),
            range: SourceRange {
                start_line: self.line,
                start_column: self.column,
                end_line: self.line,
                end_column: self.column,
            },
        };
        let payload = Payload {
            id: CaptureId(0),
            epoch,
            is_error: true,
            result: CapturedValue::Error {
                name: "SyntaxError".into(),
                message: self.message.clone(),
            },
            timestamp_ms: 0,
            promise: None,
            raw_position: None,
        };
        (
            payload,
            ContextTable {
                file: self.file.clone(),
                records: vec![record],
            },
        )
    }

    /// Human-readable report for terminal consumers.
    pub fn report(&self, source_code: &str) -> String {
        render_report(
            &Diagnostic {
                message: self.message.clone(),
                start: self.start,
                end: self.end,
            },
            &self.file,
            source_code,
        )
    }
}

/// A single capture site could not be placed. The compile continues; the
/// site is skipped.
#[derive(Error, Debug, Clone)]
#[error("cannot place capture site: {reason}")]
pub struct InstrumentError {
    pub reason: String,
}

/// A runtime error inside the sandboxed interpreter. Reported across the
/// boundary as a window-error payload, never as a panic.
#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct RuntimeError {
    pub message: String,
    /// Byte offset into the executed (transformed) source, when known.
    pub offset: Option<usize>,
    /// Cooperative-stop unwinding, not a script failure; never reported.
    pub interrupted: bool,
}

impl RuntimeError {
    pub fn new(message: impl Into<String>) -> Self {
        RuntimeError {
            message: message.into(),
            offset: None,
            interrupted: false,
        }
    }

    pub fn at(message: impl Into<String>, offset: usize) -> Self {
        RuntimeError {
            message: message.into(),
            offset: Some(offset),
            interrupted: false,
        }
    }

    pub fn interrupted() -> Self {
        RuntimeError {
            message: "execution superseded".into(),
            offset: None,
            interrupted: true,
        }
    }
}

/// Render one diagnostic in the same report format the parse checker
/// prints, without color so the output is stable in logs and tests.
pub fn render_report(diagnostic: &Diagnostic, filename: &str, source_code: &str) -> String {
    let mut report_bytes = Cursor::new(Vec::new());
    Report::build(ReportKind::Error, (filename, diagnostic.start..diagnostic.end))
        .with_config(Config::default().with_color(false))
        .with_message(&diagnostic.message)
        .with_label(
            Label::new((filename, diagnostic.start..diagnostic.end))
                .with_message(&diagnostic.message),
        )
        .finish()
        .write((filename, Source::from(source_code)), &mut report_bytes)
        .expect("report rendering cannot fail on a Vec");
    report_bytes.set_position(0);
    let mut report_string = String::new();
    report_bytes
        .read_to_string(&mut report_string)
        .expect("report output is valid UTF-8");
    report_string
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_error_payload_is_anchored_and_raw() {
        let error = CompileError {
            message: "unexpected token".into(),
            file: "main.js".into(),
            line: 3,
            column: 7,
            start: 14,
            end: 15,
        };
        let (payload, table) = error.to_payload(Epoch(9));
        assert!(payload.is_error);
        assert_eq!(payload.epoch, Epoch(9));
        let record = table.get(payload.id).unwrap();
        assert_eq!(record.kind, ContextKind::ParseError);
        assert_eq!(record.range.start_line, 3);
        assert_eq!(record.range.start_column, 7);
        assert!(matches!(
            payload.result,
            CapturedValue::Error { ref message, .. } if message == "unexpected token"
        ));
    }

    #[test]
    fn report_mentions_message_and_file() {
        let report = render_report(
            &Diagnostic {
                message: "found something odd".into(),
                start: 4,
                end: 5,
            },
            "snippet.js",
            "let x\nlet y\n",
        );
        assert!(report.contains("found something odd"));
        assert!(report.contains("snippet.js"));
    }
}
