//! The live value model of the sandboxed runtime.
//!
//! One closed tagged union covers the whole classification domain the
//! marshalling layer has to handle. Aggregates are `Rc`-based and never
//! cross the isolation boundary; the marshaller turns them into
//! serializable trees first.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::emit::format_number;
use crate::error::RuntimeError;
use crate::parser::FunctionDef;

use super::interpreter::Interpreter;

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    BigInt(i128),
    Text(Rc<str>),
    Array(Rc<RefCell<Vec<Value>>>),
    Object(Rc<ObjectValue>),
    Function(Rc<FunctionValue>),
    Error(Rc<ErrorValue>),
    Promise(Rc<PromiseValue>),
    Symbol(Rc<SymbolValue>),
    WeakSet,
    WeakMap,
    WeakRef,
    Proxy,
    /// Milliseconds since the Unix epoch; NaN for an invalid date.
    Date(f64),
    Set(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<Vec<(Value, Value)>>>),
    ArrayBuffer(u64),
    Dom(Rc<DomValue>),
}

pub struct ObjectValue {
    /// Constructor name for objects with a non-default prototype.
    pub constructor: RefCell<Option<String>>,
    pub entries: RefCell<IndexMap<String, Value>>,
}

impl ObjectValue {
    pub fn plain() -> Rc<Self> {
        Rc::new(ObjectValue {
            constructor: RefCell::new(None),
            entries: RefCell::new(IndexMap::new()),
        })
    }

    pub fn constructed(constructor: impl Into<String>) -> Rc<Self> {
        Rc::new(ObjectValue {
            constructor: RefCell::new(Some(constructor.into())),
            entries: RefCell::new(IndexMap::new()),
        })
    }
}

pub type NativeFn = Rc<dyn Fn(&mut Interpreter, Value, Vec<Value>) -> Result<Value, RuntimeError>>;

/// Builtin constructors reachable through `new`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinCtor {
    Date,
    Set,
    Map,
    WeakSet,
    WeakMap,
    WeakRef,
    Proxy,
    Error,
    ArrayBuffer,
}

pub struct FunctionValue {
    pub name: RefCell<Option<String>>,
    /// Script functions carry their definition and closure environment.
    pub def: Option<FunctionDef>,
    pub env: Option<Scope>,
    pub native: Option<NativeFn>,
    pub ctor: Option<BuiltinCtor>,
    pub is_async: bool,
    /// Verbatim original source text, registered by the compile-injected
    /// metadata call on first entry.
    pub source: RefCell<Option<String>>,
}

impl FunctionValue {
    pub fn script(def: FunctionDef, env: Scope) -> Rc<Self> {
        Rc::new(FunctionValue {
            name: RefCell::new(def.name.clone()),
            is_async: def.is_async,
            def: Some(def),
            env: Some(env),
            native: None,
            ctor: None,
            source: RefCell::new(None),
        })
    }

    pub fn native(name: &str, body: NativeFn) -> Rc<Self> {
        Rc::new(FunctionValue {
            name: RefCell::new(Some(name.to_string())),
            def: None,
            env: None,
            native: Some(body),
            ctor: None,
            is_async: false,
            source: RefCell::new(None),
        })
    }

    pub fn builtin_ctor(name: &str, ctor: BuiltinCtor) -> Rc<Self> {
        Rc::new(FunctionValue {
            name: RefCell::new(Some(name.to_string())),
            def: None,
            env: None,
            native: None,
            ctor: Some(ctor),
            is_async: false,
            source: RefCell::new(None),
        })
    }
}

#[derive(Clone, Debug)]
pub struct ErrorValue {
    pub name: String,
    pub message: String,
}

pub enum PromiseState {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

type PromiseObserver = Box<dyn Fn(&PromiseState)>;

/// A promise with non-blocking settle observers. Observing never alters
/// resolution timing; an observer attached after settlement fires
/// immediately.
pub struct PromiseValue {
    pub state: RefCell<PromiseState>,
    observers: RefCell<Vec<PromiseObserver>>,
}

impl PromiseValue {
    pub fn pending() -> Rc<Self> {
        Rc::new(PromiseValue {
            state: RefCell::new(PromiseState::Pending),
            observers: RefCell::new(Vec::new()),
        })
    }

    pub fn fulfilled(value: Value) -> Rc<Self> {
        Rc::new(PromiseValue {
            state: RefCell::new(PromiseState::Fulfilled(value)),
            observers: RefCell::new(Vec::new()),
        })
    }

    pub fn rejected(value: Value) -> Rc<Self> {
        Rc::new(PromiseValue {
            state: RefCell::new(PromiseState::Rejected(value)),
            observers: RefCell::new(Vec::new()),
        })
    }

    /// Settle a pending promise; settled promises ignore further settles.
    pub fn settle(&self, state: PromiseState) {
        if !matches!(*self.state.borrow(), PromiseState::Pending) {
            return;
        }
        *self.state.borrow_mut() = state;
        let observers = std::mem::take(&mut *self.observers.borrow_mut());
        let state = self.state.borrow();
        for observer in &observers {
            observer(&state);
        }
    }

    pub fn observe(&self, observer: PromiseObserver) {
        let state = self.state.borrow();
        if matches!(*state, PromiseState::Pending) {
            drop(state);
            self.observers.borrow_mut().push(observer);
        } else {
            observer(&state);
        }
    }
}

#[derive(Clone, Debug)]
pub struct SymbolValue {
    pub description: Option<String>,
}

#[derive(Clone, Debug)]
pub struct DomValue {
    pub tag: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<DomChild>,
}

#[derive(Clone, Debug)]
pub enum DomChild {
    Element(Rc<DomValue>),
    Text(String),
}

impl DomValue {
    pub fn child_count(&self) -> u32 {
        self.children
            .iter()
            .filter(|child| matches!(child, DomChild::Element(_)))
            .count() as u32
    }

    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for child in &self.children {
            match child {
                DomChild::Text(text) => out.push_str(text),
                DomChild::Element(element) => element.collect_text(out),
            }
        }
    }

    /// Serialized markup fallback, the shape `outerHTML` would give.
    pub fn outer_markup(&self) -> String {
        let mut out = String::new();
        self.write_markup(&mut out);
        out
    }

    fn write_markup(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.tag);
        for (name, value) in &self.attributes {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(value);
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("></");
            out.push_str(&self.tag);
            out.push('>');
            return;
        }
        out.push('>');
        for child in &self.children {
            match child {
                DomChild::Text(text) => out.push_str(text),
                DomChild::Element(element) => element.write_markup(out),
            }
        }
        out.push_str("</");
        out.push_str(&self.tag);
        out.push('>');
    }

    /// Constructor name the way a browser would report it.
    pub fn constructor_name(&self) -> String {
        let mut tag = self.tag.chars();
        match tag.next() {
            Some(first) => format!(
                "HTML{}{}Element",
                first.to_ascii_uppercase(),
                tag.as_str().to_ascii_lowercase()
            ),
            None => "HTMLElement".to_string(),
        }
    }
}

/// Lexical scope chain. Function scopes carry the `this` binding; arrow
/// functions leave it unset and inherit through the parent chain.
#[derive(Clone)]
pub struct Scope(Rc<RefCell<ScopeData>>);

struct ScopeData {
    vars: HashMap<String, Value>,
    this_value: Option<Value>,
    parent: Option<Scope>,
}

impl Scope {
    pub fn root() -> Self {
        Scope(Rc::new(RefCell::new(ScopeData {
            vars: HashMap::new(),
            this_value: None,
            parent: None,
        })))
    }

    pub fn child(&self) -> Self {
        Scope(Rc::new(RefCell::new(ScopeData {
            vars: HashMap::new(),
            this_value: None,
            parent: Some(self.clone()),
        })))
    }

    pub fn declare(&self, name: impl Into<String>, value: Value) {
        self.0.borrow_mut().vars.insert(name.into(), value);
    }

    pub fn set_this(&self, this: Value) {
        self.0.borrow_mut().this_value = Some(this);
    }

    pub fn this_value(&self) -> Option<Value> {
        let data = self.0.borrow();
        if let Some(this) = &data.this_value {
            return Some(this.clone());
        }
        data.parent.as_ref().and_then(|parent| parent.this_value())
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        let data = self.0.borrow();
        if let Some(value) = data.vars.get(name) {
            return Some(value.clone());
        }
        data.parent.as_ref().and_then(|parent| parent.get(name))
    }

    /// Assign to an existing binding, walking up the chain.
    /// Returns false when no binding exists anywhere.
    pub fn assign(&self, name: &str, value: Value) -> bool {
        let mut data = self.0.borrow_mut();
        if let Some(slot) = data.vars.get_mut(name) {
            *slot = value;
            return true;
        }
        match &data.parent {
            Some(parent) => parent.assign(name, value),
            None => false,
        }
    }
}

impl Value {
    pub fn text(text: impl Into<String>) -> Value {
        Value::Text(Rc::from(text.into().as_str()))
    }

    pub fn array(items: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(items)))
    }

    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Value {
        Value::Error(Rc::new(ErrorValue {
            name: name.into(),
            message: message.into(),
        }))
    }

    pub fn type_of(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::BigInt(_) => "bigint",
            Value::Text(_) => "string",
            Value::Function(_) => "function",
            Value::Symbol(_) => "symbol",
            _ => "object",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(value) => *value,
            Value::Number(number) => *number != 0.0 && !number.is_nan(),
            Value::BigInt(value) => *value != 0,
            Value::Text(text) => !text.is_empty(),
            _ => true,
        }
    }

    /// Identity pointer for aggregates, used by cycle detection and
    /// reference equality. Primitives have no identity.
    pub fn identity(&self) -> Option<usize> {
        match self {
            Value::Array(items) => Some(Rc::as_ptr(items) as *const u8 as usize),
            Value::Object(object) => Some(Rc::as_ptr(object) as *const u8 as usize),
            Value::Function(function) => Some(Rc::as_ptr(function) as *const u8 as usize),
            Value::Promise(promise) => Some(Rc::as_ptr(promise) as *const u8 as usize),
            Value::Symbol(symbol) => Some(Rc::as_ptr(symbol) as *const u8 as usize),
            Value::Set(items) => Some(Rc::as_ptr(items) as *const u8 as usize),
            Value::Map(entries) => Some(Rc::as_ptr(entries) as *const u8 as usize),
            Value::Dom(node) => Some(Rc::as_ptr(node) as *const u8 as usize),
            Value::Error(error) => Some(Rc::as_ptr(error) as *const u8 as usize),
            _ => None,
        }
    }

    pub fn strict_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            _ => match (self.identity(), other.identity()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    pub fn loose_equals(&self, other: &Value) -> bool {
        if self.strict_equals(other) {
            return true;
        }
        matches!(
            (self, other),
            (Value::Undefined, Value::Null) | (Value::Null, Value::Undefined)
        )
    }

    /// Text form used by string concatenation and console output.
    pub fn to_display_string(&self) -> String {
        self.display_with_depth(0)
    }

    fn display_with_depth(&self, depth: u8) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(value) => value.to_string(),
            Value::Number(number) => format_number(*number),
            Value::BigInt(value) => value.to_string(),
            Value::Text(text) => text.to_string(),
            // Arrays join recursively the way string coercion does;
            // bounded so self-referencing arrays cannot recurse forever.
            Value::Array(_) if depth > 8 => "…".to_string(),
            Value::Array(items) => items
                .borrow()
                .iter()
                .map(|item| item.display_with_depth(depth + 1))
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(_) => "[object Object]".to_string(),
            Value::Function(function) => match &*function.name.borrow() {
                Some(name) => format!("function {name}"),
                None => "function".to_string(),
            },
            Value::Error(error) if error.message.is_empty() => error.name.clone(),
            Value::Error(error) => format!("{}: {}", error.name, error.message),
            Value::Promise(_) => "[object Promise]".to_string(),
            Value::Symbol(symbol) => match &symbol.description {
                Some(description) => format!("Symbol({description})"),
                None => "Symbol()".to_string(),
            },
            Value::WeakSet => "[object WeakSet]".to_string(),
            Value::WeakMap => "[object WeakMap]".to_string(),
            Value::WeakRef => "[object WeakRef]".to_string(),
            Value::Proxy => "[object Proxy]".to_string(),
            Value::Date(ms) => super::marshal::iso8601(*ms),
            Value::Set(_) => "[object Set]".to_string(),
            Value::Map(_) => "[object Map]".to_string(),
            Value::ArrayBuffer(_) => "[object ArrayBuffer]".to_string(),
            Value::Dom(node) => node.outer_markup(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness_matches_script_semantics() {
        assert!(!Value::Undefined.truthy());
        assert!(!Value::Null.truthy());
        assert!(!Value::Number(0.0).truthy());
        assert!(!Value::Number(f64::NAN).truthy());
        assert!(!Value::text("").truthy());
        assert!(Value::text("x").truthy());
        assert!(Value::array(vec![]).truthy());
    }

    #[test]
    fn strict_equality_is_identity_for_aggregates() {
        let a = Value::array(vec![Value::Number(1.0)]);
        let b = Value::array(vec![Value::Number(1.0)]);
        assert!(!a.strict_equals(&b));
        assert!(a.strict_equals(&a.clone()));
    }

    #[test]
    fn loose_equality_bridges_null_and_undefined() {
        assert!(Value::Null.loose_equals(&Value::Undefined));
        assert!(!Value::Null.loose_equals(&Value::Number(0.0)));
    }

    #[test]
    fn promise_observers_fire_on_settle_and_late_attach() {
        use std::cell::Cell;

        let promise = PromiseValue::pending();
        let fired = Rc::new(Cell::new(0));
        let fired_in_observer = fired.clone();
        promise.observe(Box::new(move |state| {
            assert!(matches!(state, PromiseState::Fulfilled(_)));
            fired_in_observer.set(fired_in_observer.get() + 1);
        }));
        promise.settle(PromiseState::Fulfilled(Value::Number(1.0)));
        assert_eq!(fired.get(), 1);

        // Attaching after settlement fires immediately.
        let late = fired.clone();
        promise.observe(Box::new(move |_| late.set(late.get() + 1)));
        assert_eq!(fired.get(), 2);

        // A settled promise ignores further settles.
        promise.settle(PromiseState::Rejected(Value::Null));
        assert!(matches!(
            *promise.state.borrow(),
            PromiseState::Fulfilled(_)
        ));
    }

    #[test]
    fn dom_node_markup_and_text() {
        let node = DomValue {
            tag: "div".into(),
            attributes: vec![("class".into(), "box".into())],
            children: vec![
                DomChild::Text("hi ".into()),
                DomChild::Element(Rc::new(DomValue {
                    tag: "span".into(),
                    attributes: vec![],
                    children: vec![DomChild::Text("there".into())],
                })),
            ],
        };
        assert_eq!(node.child_count(), 1);
        assert_eq!(node.text_content(), "hi there");
        assert_eq!(
            node.outer_markup(),
            "<div class=\"box\">hi <span>there</span></div>"
        );
        assert_eq!(node.constructor_name(), "HTMLDivElement");
    }
}
