//! Stringifier and decoration renderer.
//!
//! Turns payloads into short inline annotations: a bounded-length value
//! rendering, anchored at the (remapped) start of its line, stacking in
//! capture order when several payloads land on one line.

use glimpse_probe_protocol::{
    CapturedValue, ContextKind, ContextRecord, ContextTable, Decoration, Epoch,
    MarshalledEnvelope, Payload, PromiseStatus,
};
use smallvec::SmallVec;

use crate::emit::format_number;
use crate::parser::{Expr, FunctionDef, Stmt, parse_program};
use crate::remap::{SourceMap, remap};

/// Rendered length cap; anything longer ends in a single ellipsis.
pub const MAX_DECORATION_CHARS: usize = 100;

/// Render one captured value, capped.
pub fn stringify(value: &CapturedValue) -> String {
    truncate(render_value(value, false))
}

fn truncate(text: String) -> String {
    if text.chars().count() <= MAX_DECORATION_CHARS {
        return text;
    }
    let mut out: String = text.chars().take(MAX_DECORATION_CHARS).collect();
    out.push('…');
    out
}

fn render_value(value: &CapturedValue, bare_text: bool) -> String {
    match value {
        CapturedValue::Undefined => "undefined".into(),
        CapturedValue::Null => "null".into(),
        CapturedValue::Bool(value) => value.to_string(),
        CapturedValue::Number(number) => format_number(*number),
        CapturedValue::BigInt(digits) => format!("{digits}n"),
        CapturedValue::Text(text) => {
            if bare_text {
                text.clone()
            } else {
                serde_json::to_string(text).unwrap_or_else(|_| format!("{text:?}"))
            }
        }
        CapturedValue::Array(items) => {
            format!("[{}]", join_values(items))
        }
        CapturedValue::Object { entries } => render_entries(None, entries),
        CapturedValue::Set(items) => format!("Set([{}])", join_values(items)),
        CapturedValue::Map(entries) => {
            let body = entries
                .iter()
                .map(|(key, value)| {
                    format!("[{}, {}]", render_value(key, false), render_value(value, false))
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("Map([{body}])")
        }
        CapturedValue::Date(iso) => format!("Date({iso})"),
        CapturedValue::ArrayBuffer { byte_length } => format!("ArrayBuffer({byte_length})"),
        CapturedValue::Error { name, message } => {
            if message.is_empty() {
                name.clone()
            } else {
                format!("{name}: {message}")
            }
        }
        CapturedValue::Envelope(envelope) => render_envelope(envelope),
    }
}

fn join_values(items: &[CapturedValue]) -> String {
    items
        .iter()
        .map(|item| render_value(item, false))
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_entries(constructor: Option<&str>, entries: &[(String, CapturedValue)]) -> String {
    let body = entries
        .iter()
        .map(|(key, value)| format!("{key}: {}", render_value(value, false)))
        .collect::<Vec<_>>()
        .join(", ");
    match constructor {
        Some(constructor) if body.is_empty() => format!("{constructor} {{}}"),
        Some(constructor) => format!("{constructor} {{{body}}}"),
        None => format!("{{{body}}}"),
    }
}

fn render_envelope(envelope: &MarshalledEnvelope) -> String {
    match envelope {
        MarshalledEnvelope::DomNode {
            tag,
            attributes,
            has_children,
            outer_markup: _,
            ..
        } => {
            let mut open = format!("<{tag}");
            for (name, value) in attributes {
                open.push_str(&format!(" {name}=\"{value}\""));
            }
            if *has_children {
                format!("{open}>…</{tag}>")
            } else {
                format!("{open}></{tag}>")
            }
        }
        MarshalledEnvelope::Function {
            name,
            source,
            is_async,
        } => {
            let params = source
                .as_deref()
                .and_then(function_params)
                .unwrap_or_default();
            let prefix = if *is_async { "async ƒ" } else { "ƒ" };
            match name {
                Some(name) if !name.is_empty() => {
                    format!("{prefix} {name}({})", params.join(", "))
                }
                _ => format!("{prefix} ({})", params.join(", ")),
            }
        }
        MarshalledEnvelope::Symbol { description } => match description {
            Some(description) => format!("Symbol({description})"),
            None => "Symbol()".into(),
        },
        MarshalledEnvelope::WeakSet => "WeakSet {}".into(),
        MarshalledEnvelope::WeakMap => "WeakMap {}".into(),
        MarshalledEnvelope::WeakRef => "WeakRef {}".into(),
        MarshalledEnvelope::Object {
            constructor,
            entries,
        } => render_entries(Some(constructor), entries),
        MarshalledEnvelope::Promise { status, value } => {
            let status = match status {
                PromiseStatus::Pending => "pending",
                PromiseStatus::Fulfilled => "fulfilled",
                PromiseStatus::Rejected => "rejected",
            };
            match value {
                Some(value) => format!("Promise {{{status}: {}}}", render_value(value, false)),
                None => format!("Promise {{{status}}}"),
            }
        }
        MarshalledEnvelope::Proxy => "Proxy {}".into(),
        MarshalledEnvelope::CyclicRef => "[Circular]".into(),
        MarshalledEnvelope::Opaque => "[unserializable]".into(),
    }
}

/// Re-derive parameter names by parsing the captured original source
/// text of a function. Falls back to none when the text does not parse
/// (minified or truncated sources).
fn function_params(source: &str) -> Option<Vec<String>> {
    let program = parse_program(source).ok()?;
    let def = program.into_iter().find_map(|stmt| match stmt.node {
        Stmt::FunctionDecl(def) => Some(def),
        Stmt::Expr(expr) => function_def_of(expr.node),
        _ => None,
    })?;
    let mut names: Vec<String> = def
        .params
        .iter()
        .map(|param| param.name.node.clone())
        .collect();
    if let Some(rest) = &def.rest {
        names.push(format!("...{}", rest.node));
    }
    Some(names)
}

fn function_def_of(expr: Expr) -> Option<FunctionDef> {
    match expr {
        Expr::Function(def) => Some(def),
        Expr::Assign { value, .. } => function_def_of(value.node),
        _ => None,
    }
}

/// Render one payload against its context record.
pub fn payload_text(payload: &Payload, record: Option<&ContextRecord>) -> String {
    let text = match record {
        Some(record) if record.kind.is_console() => match &payload.result {
            CapturedValue::Array(arguments) => arguments
                .iter()
                .map(|argument| render_value(argument, true))
                .collect::<Vec<_>>()
                .join(" "),
            other => render_value(other, false),
        },
        Some(record)
            if matches!(record.kind, ContextKind::Variable | ContextKind::Assignment) =>
        {
            format!("{} = {}", record.text, render_value(&payload.result, false))
        }
        Some(record) if record.kind == ContextKind::FunctionCall => match &payload.result {
            CapturedValue::Array(arguments) => format!("({})", join_values(arguments)),
            other => render_value(other, false),
        },
        _ => render_value(&payload.result, false),
    };
    truncate(text)
}

/// Build one decoration per payload, anchored at a 1-based line.
///
/// Ordinary payloads anchor via their context record's original range.
/// Payloads carrying a raw position (uncaught errors) are remapped
/// through the source-map chain first; when remapping fails the record
/// range is the fallback, and a payload with no anchor at all is
/// dropped rather than misplaced.
pub fn build_decorations(
    payloads: &[Payload],
    table: &ContextTable,
    chain: &[SourceMap],
) -> Vec<Decoration> {
    let mut decorations = Vec::with_capacity(payloads.len());
    for payload in payloads {
        let record = table.get(payload.id);
        let remapped = payload
            .raw_position
            .and_then(|raw| remap(chain, raw.line, raw.column))
            .map(|position| position.line);
        let Some(line) = remapped.or_else(|| record.map(|record| record.range.start_line)) else {
            continue;
        };
        decorations.push(Decoration {
            line,
            text: payload_text(payload, record),
        });
    }
    decorations
}

/// Merge decorations landing on the same line, in capture order.
pub fn stack_by_line(decorations: Vec<Decoration>) -> Vec<Decoration> {
    let mut lines: Vec<u32> = Vec::new();
    let mut stacked: Vec<SmallVec<[String; 2]>> = Vec::new();
    for decoration in decorations {
        match lines.iter().position(|line| *line == decoration.line) {
            Some(index) => stacked[index].push(decoration.text),
            None => {
                lines.push(decoration.line);
                stacked.push(SmallVec::from_elem(decoration.text, 1));
            }
        }
    }
    lines
        .into_iter()
        .zip(stacked)
        .map(|(line, texts)| Decoration {
            line,
            text: texts.join(", "),
        })
        .collect()
}

/// The current epoch's decorations plus the disposal callback the
/// consumer contract requires; superseding an epoch invokes it.
pub struct DecorationSet {
    pub epoch: Epoch,
    pub decorations: Vec<Decoration>,
    on_dispose: Option<Box<dyn FnOnce()>>,
}

impl DecorationSet {
    pub fn new(
        epoch: Epoch,
        decorations: Vec<Decoration>,
        on_dispose: Option<Box<dyn FnOnce()>>,
    ) -> Self {
        DecorationSet {
            epoch,
            decorations,
            on_dispose,
        }
    }

    /// Invoked when a newer epoch's set replaces this one.
    pub fn dispose(mut self) {
        if let Some(callback) = self.on_dispose.take() {
            callback();
        }
    }

    pub fn set_callback(&mut self, callback: Box<dyn FnOnce()>) {
        self.on_dispose = Some(callback);
    }

    /// Detach the callback, e.g. to carry it over to a rebuilt set.
    /// A set without a callback disposes silently.
    pub fn take_callback(&mut self) -> Option<Box<dyn FnOnce()>> {
        self.on_dispose.take()
    }
}

impl Drop for DecorationSet {
    fn drop(&mut self) {
        if let Some(callback) = self.on_dispose.take() {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glimpse_probe_protocol::{CaptureId, SourceRange};

    fn payload_with(result: CapturedValue) -> Payload {
        Payload {
            id: CaptureId(0),
            epoch: Epoch(1),
            is_error: false,
            result,
            timestamp_ms: 0,
            promise: None,
            raw_position: None,
        }
    }

    fn record_with(kind: ContextKind, text: &str, line: u32) -> ContextRecord {
        ContextRecord {
            id: CaptureId(0),
            kind,
            text: text.into(),
            file: "main.js".into(),
            range: SourceRange {
                start_line: line,
                start_column: 1,
                end_line: line,
                end_column: 2,
            },
        }
    }

    #[test]
    fn literals_render_as_script_literals() {
        assert_eq!(stringify(&CapturedValue::Undefined), "undefined");
        assert_eq!(stringify(&CapturedValue::Null), "null");
        assert_eq!(stringify(&CapturedValue::Number(f64::NAN)), "NaN");
        assert_eq!(stringify(&CapturedValue::Number(f64::INFINITY)), "Infinity");
        assert_eq!(
            stringify(&CapturedValue::Number(f64::NEG_INFINITY)),
            "-Infinity"
        );
        assert_eq!(stringify(&CapturedValue::BigInt("7".into())), "7n");
        assert_eq!(stringify(&CapturedValue::Text("hi".into())), "\"hi\"");
    }

    #[test]
    fn date_renders_exactly() {
        assert_eq!(
            stringify(&CapturedValue::Date("2024-01-01T00:00:00.000Z".into())),
            "Date(2024-01-01T00:00:00.000Z)"
        );
    }

    #[test]
    fn collections_render_recursively() {
        assert_eq!(
            stringify(&CapturedValue::Set(vec![
                CapturedValue::Number(1.0),
                CapturedValue::Number(2.0)
            ])),
            "Set([1, 2])"
        );
        assert_eq!(
            stringify(&CapturedValue::Map(vec![(
                CapturedValue::Text("a".into()),
                CapturedValue::Number(1.0)
            )])),
            "Map([[\"a\", 1]])"
        );
        assert_eq!(
            stringify(&CapturedValue::Array(vec![
                CapturedValue::Number(1.0),
                CapturedValue::Array(vec![CapturedValue::Number(2.0)])
            ])),
            "[1, [2]]"
        );
        assert_eq!(
            stringify(&CapturedValue::ArrayBuffer { byte_length: 8 }),
            "ArrayBuffer(8)"
        );
    }

    #[test]
    fn function_envelope_rederives_parameters_from_source() {
        let envelope = CapturedValue::Envelope(MarshalledEnvelope::Function {
            name: Some("add".into()),
            source: Some("function add(a, b) { return a + b; }".into()),
            is_async: false,
        });
        assert_eq!(stringify(&envelope), "ƒ add(a, b)");

        let arrow = CapturedValue::Envelope(MarshalledEnvelope::Function {
            name: None,
            source: Some("(n, ...rest) => n".into()),
            is_async: true,
        });
        assert_eq!(stringify(&arrow), "async ƒ (n, ...rest)");
    }

    #[test]
    fn fixed_placeholders() {
        assert_eq!(
            stringify(&CapturedValue::Envelope(MarshalledEnvelope::CyclicRef)),
            "[Circular]"
        );
        assert_eq!(
            stringify(&CapturedValue::Envelope(MarshalledEnvelope::WeakMap)),
            "WeakMap {}"
        );
        assert_eq!(
            stringify(&CapturedValue::Envelope(MarshalledEnvelope::Proxy)),
            "Proxy {}"
        );
        assert_eq!(
            stringify(&CapturedValue::Envelope(MarshalledEnvelope::Opaque)),
            "[unserializable]"
        );
    }

    #[test]
    fn constructed_object_renders_with_its_name() {
        let envelope = CapturedValue::Envelope(MarshalledEnvelope::Object {
            constructor: "Point".into(),
            entries: vec![
                ("x".into(), CapturedValue::Number(1.0)),
                ("y".into(), CapturedValue::Number(2.0)),
            ],
        });
        assert_eq!(stringify(&envelope), "Point {x: 1, y: 2}");
    }

    #[test]
    fn console_payload_joins_bare_arguments() {
        let payload = payload_with(CapturedValue::Array(vec![
            CapturedValue::Number(1.0),
            CapturedValue::Number(2.0),
            CapturedValue::Number(3.0),
        ]));
        let record = record_with(ContextKind::ConsoleLog, "console.log(1, 2, 3)", 1);
        assert_eq!(payload_text(&payload, Some(&record)), "1 2 3");

        let text_payload = payload_with(CapturedValue::Array(vec![CapturedValue::Text(
            "plain".into(),
        )]));
        assert_eq!(payload_text(&text_payload, Some(&record)), "plain");
    }

    #[test]
    fn variable_payload_renders_name_equals_value() {
        let payload = payload_with(CapturedValue::Number(4.0));
        let record = record_with(ContextKind::Variable, "count", 3);
        assert_eq!(payload_text(&payload, Some(&record)), "count = 4");
    }

    #[test]
    fn output_never_exceeds_cap_plus_ellipsis() {
        let long = CapturedValue::Text("x".repeat(500));
        let rendered = stringify(&long);
        assert!(rendered.chars().count() <= MAX_DECORATION_CHARS + 1);
        assert!(rendered.ends_with('…'));

        let deep = CapturedValue::Array(
            (0..200)
                .map(|index| CapturedValue::Number(index as f64))
                .collect(),
        );
        assert!(stringify(&deep).chars().count() <= MAX_DECORATION_CHARS + 1);
    }

    #[test]
    fn decorations_anchor_and_stack_in_capture_order() {
        let table = ContextTable {
            file: "main.js".into(),
            records: vec![
                record_with(ContextKind::Expression, "1 + 1", 2),
                ContextRecord {
                    id: CaptureId(1),
                    ..record_with(ContextKind::Expression, "2 + 2", 2)
                },
            ],
        };
        let payloads = vec![
            payload_with(CapturedValue::Number(2.0)),
            Payload {
                id: CaptureId(1),
                ..payload_with(CapturedValue::Number(4.0))
            },
        ];
        let decorations = build_decorations(&payloads, &table, &[]);
        assert_eq!(decorations.len(), 2);
        let stacked = stack_by_line(decorations);
        assert_eq!(stacked.len(), 1);
        assert_eq!(stacked[0].line, 2);
        assert_eq!(stacked[0].text, "2, 4");
    }

    #[test]
    fn disposal_callback_fires_once() {
        use std::cell::Cell;
        use std::rc::Rc;

        let fired = Rc::new(Cell::new(0));
        let in_callback = fired.clone();
        let set = DecorationSet::new(
            Epoch(1),
            Vec::new(),
            Some(Box::new(move || in_callback.set(in_callback.get() + 1))),
        );
        set.dispose();
        assert_eq!(fired.get(), 1);
    }
}
