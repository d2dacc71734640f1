//! Marshalling: converts live runtime values into serializable trees the
//! transport can carry. One exhaustive match over the closed `Value`
//! union, in a fixed detection order: DOM node, function, symbol, weak
//! collections and refs, proxy, cyclic reference, object with a
//! non-default prototype, then plain pass-through.
//!
//! Guarantees: never mutates the source value, idempotent with respect to
//! it, and never panics — anything that defeats description degrades to
//! the `Opaque` envelope.

use std::collections::HashSet;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use glimpse_probe_protocol::{CapturedValue, MarshalledEnvelope, PromiseStatus};

use super::value::{PromiseState, Value};

/// Depth bound: a value nested deeper than this is not describable and
/// collapses to the placeholder instead of risking the stack.
const MAX_DEPTH: usize = 32;

pub fn marshal(value: &Value) -> CapturedValue {
    let mut visited = HashSet::new();
    marshal_inner(value, &mut visited, 0)
}

/// Promise status without the settled value, for payload tagging.
pub fn promise_status(value: &Value) -> Option<PromiseStatus> {
    let Value::Promise(promise) = value else {
        return None;
    };
    Some(match &*promise.state.borrow() {
        PromiseState::Pending => PromiseStatus::Pending,
        PromiseState::Fulfilled(_) => PromiseStatus::Fulfilled,
        PromiseState::Rejected(_) => PromiseStatus::Rejected,
    })
}

fn marshal_inner(value: &Value, visited: &mut HashSet<usize>, depth: usize) -> CapturedValue {
    if depth > MAX_DEPTH {
        return CapturedValue::Envelope(MarshalledEnvelope::Opaque);
    }
    match value {
        Value::Dom(node) => CapturedValue::Envelope(MarshalledEnvelope::DomNode {
            tag: node.tag.clone(),
            constructor: node.constructor_name(),
            attributes: node.attributes.clone(),
            has_children: !node.children.is_empty(),
            child_count: node.child_count(),
            text_content: {
                let text = node.text_content();
                (!text.is_empty()).then_some(text)
            },
            outer_markup: node.outer_markup(),
        }),
        Value::Function(function) => CapturedValue::Envelope(MarshalledEnvelope::Function {
            name: function.name.borrow().clone(),
            source: function.source.borrow().clone(),
            is_async: function.is_async,
        }),
        Value::Symbol(symbol) => CapturedValue::Envelope(MarshalledEnvelope::Symbol {
            description: symbol.description.clone(),
        }),
        Value::WeakSet => CapturedValue::Envelope(MarshalledEnvelope::WeakSet),
        Value::WeakMap => CapturedValue::Envelope(MarshalledEnvelope::WeakMap),
        Value::WeakRef => CapturedValue::Envelope(MarshalledEnvelope::WeakRef),
        Value::Proxy => CapturedValue::Envelope(MarshalledEnvelope::Proxy),
        Value::Array(items) => {
            let Some(identity) = value.identity() else {
                return CapturedValue::Envelope(MarshalledEnvelope::Opaque);
            };
            if !visited.insert(identity) {
                return CapturedValue::Envelope(MarshalledEnvelope::CyclicRef);
            }
            CapturedValue::Array(
                items
                    .borrow()
                    .iter()
                    .map(|item| marshal_inner(item, visited, depth + 1))
                    .collect(),
            )
        }
        Value::Object(object) => {
            let Some(identity) = value.identity() else {
                return CapturedValue::Envelope(MarshalledEnvelope::Opaque);
            };
            if !visited.insert(identity) {
                return CapturedValue::Envelope(MarshalledEnvelope::CyclicRef);
            }
            let entries: Vec<(String, CapturedValue)> = object
                .entries
                .borrow()
                .iter()
                .map(|(key, entry)| (key.clone(), marshal_inner(entry, visited, depth + 1)))
                .collect();
            match object.constructor.borrow().clone() {
                Some(constructor) => CapturedValue::Envelope(MarshalledEnvelope::Object {
                    constructor,
                    entries,
                }),
                None => CapturedValue::Object { entries },
            }
        }
        Value::Promise(promise) => {
            let state = promise.state.borrow();
            let (status, settled) = match &*state {
                PromiseState::Pending => (PromiseStatus::Pending, None),
                PromiseState::Fulfilled(settled) => (PromiseStatus::Fulfilled, Some(settled)),
                PromiseState::Rejected(settled) => (PromiseStatus::Rejected, Some(settled)),
            };
            CapturedValue::Envelope(MarshalledEnvelope::Promise {
                status,
                value: settled.map(|settled| Box::new(marshal_inner(settled, visited, depth + 1))),
            })
        }
        Value::Set(items) => {
            let Some(identity) = value.identity() else {
                return CapturedValue::Envelope(MarshalledEnvelope::Opaque);
            };
            if !visited.insert(identity) {
                return CapturedValue::Envelope(MarshalledEnvelope::CyclicRef);
            }
            CapturedValue::Set(
                items
                    .borrow()
                    .iter()
                    .map(|item| marshal_inner(item, visited, depth + 1))
                    .collect(),
            )
        }
        Value::Map(entries) => {
            let Some(identity) = value.identity() else {
                return CapturedValue::Envelope(MarshalledEnvelope::Opaque);
            };
            if !visited.insert(identity) {
                return CapturedValue::Envelope(MarshalledEnvelope::CyclicRef);
            }
            CapturedValue::Map(
                entries
                    .borrow()
                    .iter()
                    .map(|(key, entry)| {
                        (
                            marshal_inner(key, visited, depth + 1),
                            marshal_inner(entry, visited, depth + 1),
                        )
                    })
                    .collect(),
            )
        }
        Value::Date(ms) => CapturedValue::Date(iso8601(*ms)),
        Value::ArrayBuffer(byte_length) => CapturedValue::ArrayBuffer {
            byte_length: *byte_length,
        },
        Value::Error(error) => CapturedValue::Error {
            name: error.name.clone(),
            message: error.message.clone(),
        },
        Value::Undefined => CapturedValue::Undefined,
        Value::Null => CapturedValue::Null,
        Value::Bool(value) => CapturedValue::Bool(*value),
        Value::Number(number) => CapturedValue::Number(*number),
        Value::BigInt(value) => CapturedValue::BigInt(value.to_string()),
        Value::Text(text) => CapturedValue::Text(text.to_string()),
    }
}

/// ISO-8601 text form with millisecond precision, e.g.
/// `2024-01-01T00:00:00.000Z`.
pub fn iso8601(ms: f64) -> String {
    if !ms.is_finite() {
        return "Invalid Date".to_string();
    }
    match Utc.timestamp_millis_opt(ms as i64).single() {
        Some(datetime) => datetime.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => "Invalid Date".to_string(),
    }
}

/// Parse an ISO-8601/RFC-3339 date string to epoch milliseconds.
pub fn parse_iso8601(text: &str) -> Option<f64> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|datetime| datetime.timestamp_millis() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::value::ObjectValue;

    #[test]
    fn primitives_pass_through() {
        assert_eq!(marshal(&Value::Number(1.5)), CapturedValue::Number(1.5));
        assert_eq!(
            marshal(&Value::text("hi")),
            CapturedValue::Text("hi".into())
        );
        assert_eq!(marshal(&Value::Undefined), CapturedValue::Undefined);
        assert_eq!(
            marshal(&Value::BigInt(42)),
            CapturedValue::BigInt("42".into())
        );
    }

    #[test]
    fn cyclic_object_yields_cyclic_ref_marker() {
        let object = ObjectValue::plain();
        let value = Value::Object(object.clone());
        object
            .entries
            .borrow_mut()
            .insert("self".to_string(), value.clone());

        let marshalled = marshal(&value);
        let CapturedValue::Object { entries } = marshalled else {
            panic!("expected plain object");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "self");
        assert_eq!(
            entries[0].1,
            CapturedValue::Envelope(MarshalledEnvelope::CyclicRef)
        );
    }

    #[test]
    fn marshalling_does_not_mutate_and_is_idempotent() {
        let object = ObjectValue::plain();
        let value = Value::Object(object.clone());
        object
            .entries
            .borrow_mut()
            .insert("self".to_string(), value.clone());
        object
            .entries
            .borrow_mut()
            .insert("n".to_string(), Value::Number(1.0));

        let first = marshal(&value);
        let second = marshal(&value);
        assert_eq!(first, second);
        assert_eq!(object.entries.borrow().len(), 2);
    }

    #[test]
    fn constructed_object_becomes_envelope() {
        let object = ObjectValue::constructed("Point");
        object
            .entries
            .borrow_mut()
            .insert("x".to_string(), Value::Number(3.0));
        let marshalled = marshal(&Value::Object(object));
        assert!(matches!(
            marshalled,
            CapturedValue::Envelope(MarshalledEnvelope::Object { ref constructor, .. })
                if constructor == "Point"
        ));
    }

    #[test]
    fn date_renders_exact_iso_form() {
        let ms = parse_iso8601("2024-01-01T00:00:00.000Z").unwrap();
        assert_eq!(iso8601(ms), "2024-01-01T00:00:00.000Z");
        assert_eq!(iso8601(f64::NAN), "Invalid Date");
    }

    #[test]
    fn weak_collections_and_proxy_are_fixed_envelopes() {
        assert_eq!(
            marshal(&Value::WeakMap),
            CapturedValue::Envelope(MarshalledEnvelope::WeakMap)
        );
        assert_eq!(
            marshal(&Value::Proxy),
            CapturedValue::Envelope(MarshalledEnvelope::Proxy)
        );
    }

    #[test]
    fn deep_nesting_degrades_to_opaque() {
        let mut value = Value::array(vec![Value::Number(0.0)]);
        for _ in 0..100 {
            value = Value::array(vec![value]);
        }
        // No panic; the innermost levels collapse to the placeholder.
        let mut current = marshal(&value);
        let mut found_opaque = false;
        loop {
            match current {
                CapturedValue::Array(mut items) => current = items.remove(0),
                CapturedValue::Envelope(MarshalledEnvelope::Opaque) => {
                    found_opaque = true;
                    break;
                }
                _ => break,
            }
        }
        assert!(found_opaque);
    }

    #[test]
    fn shared_reference_reports_cycle_marker_on_revisit() {
        // Visited earlier in the same pass — not only true cycles.
        let shared = Value::array(vec![Value::Number(1.0)]);
        let outer = Value::array(vec![shared.clone(), shared]);
        let CapturedValue::Array(items) = marshal(&outer) else {
            panic!("expected array");
        };
        assert!(matches!(items[0], CapturedValue::Array(_)));
        assert_eq!(
            items[1],
            CapturedValue::Envelope(MarshalledEnvelope::CyclicRef)
        );
    }
}
