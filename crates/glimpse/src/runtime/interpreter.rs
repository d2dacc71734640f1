//! The sandboxed interpreter.
//!
//! A single-threaded tree walker over the transformed program. The two
//! reserved probe globals are ordinary native functions here; everything
//! the host learns about a run leaves through them. Runaway scripts are
//! bounded by a step budget, and a cooperative stop flag lets a
//! superseded run wind down at the next statement boundary.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use glimpse_probe_protocol::CaptureId;

use crate::error::RuntimeError;
use crate::instrument::{CAPTURE_IDENT, FN_META_IDENT};
use crate::parser::{
    BinaryOp, ElementAttrValue, ElementChild, ElementLit, Expr, FunctionBody, IterationKind,
    LogicalOp, MemberProperty, Pattern, Spanned, Stmt, UnaryOp,
};

use super::capture::ProbeRuntime;
use super::marshal::parse_iso8601;
use super::value::{
    BuiltinCtor, DomChild, DomValue, ErrorValue, FunctionValue, ObjectValue, PromiseState,
    PromiseValue, Scope, SymbolValue, Value,
};

const MAX_CALL_DEPTH: usize = 256;
const DEFAULT_STEP_BUDGET: u64 = 1_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsoleLevel {
    Log,
    Debug,
    Info,
    Warn,
    Error,
}

impl ConsoleLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Where native console output goes. Tests install a recording sink.
pub trait ConsoleSink {
    fn write(&self, level: ConsoleLevel, text: &str);
}

/// Swallows everything; the default when a host installs nothing.
pub struct SilentConsole;

impl ConsoleSink for SilentConsole {
    fn write(&self, _level: ConsoleLevel, _text: &str) {}
}

/// Records output for assertions.
#[derive(Default)]
pub struct RecordingConsole {
    pub lines: RefCell<Vec<(ConsoleLevel, String)>>,
}

impl ConsoleSink for RecordingConsole {
    fn write(&self, level: ConsoleLevel, text: &str) {
        self.lines.borrow_mut().push((level, text.to_string()));
    }
}

enum Flow {
    Normal,
    Return(Value),
}

pub struct Interpreter {
    pub globals: Scope,
    probe: Option<Rc<ProbeRuntime>>,
    console: Rc<dyn ConsoleSink>,
    stop: Arc<AtomicBool>,
    steps_remaining: u64,
    call_depth: usize,
    /// Currently executing script functions; the metadata call registers
    /// the verbatim source on the innermost one.
    fn_stack: Vec<Rc<FunctionValue>>,
}

impl Interpreter {
    pub fn new(
        console: Rc<dyn ConsoleSink>,
        probe: Option<Rc<ProbeRuntime>>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let mut interpreter = Interpreter {
            globals: Scope::root(),
            probe,
            console,
            stop,
            steps_remaining: DEFAULT_STEP_BUDGET,
            call_depth: 0,
            fn_stack: Vec::new(),
        };
        interpreter.install_globals();
        interpreter
    }

    pub fn run(&mut self, program: &[Spanned<Stmt>]) -> Result<(), RuntimeError> {
        let scope = self.globals.clone();
        for stmt in program {
            if let Flow::Return(_) = self.exec_stmt(stmt, &scope)? {
                break;
            }
        }
        Ok(())
    }

    fn tick(&mut self, offset: usize) -> Result<(), RuntimeError> {
        if self.stop.load(Ordering::Relaxed) {
            return Err(RuntimeError::interrupted());
        }
        if self.steps_remaining == 0 {
            return Err(RuntimeError::at("execution budget exceeded", offset));
        }
        self.steps_remaining -= 1;
        Ok(())
    }

    // ----- globals ------------------------------------------------------

    fn install_globals(&mut self) {
        let console = ObjectValue::plain();
        for level in [
            ConsoleLevel::Log,
            ConsoleLevel::Debug,
            ConsoleLevel::Info,
            ConsoleLevel::Warn,
            ConsoleLevel::Error,
        ] {
            let method = FunctionValue::native(
                level.as_str(),
                Rc::new(move |interpreter: &mut Interpreter, _this, args: Vec<Value>| {
                    let text = args
                        .iter()
                        .map(Value::to_display_string)
                        .collect::<Vec<_>>()
                        .join(" ");
                    interpreter.console.write(level, &text);
                    Ok(Value::Undefined)
                }),
            );
            console
                .entries
                .borrow_mut()
                .insert(level.as_str().to_string(), Value::Function(method));
        }
        self.globals.declare("console", Value::Object(console));

        for (name, ctor) in [
            ("Date", BuiltinCtor::Date),
            ("Set", BuiltinCtor::Set),
            ("Map", BuiltinCtor::Map),
            ("WeakSet", BuiltinCtor::WeakSet),
            ("WeakMap", BuiltinCtor::WeakMap),
            ("WeakRef", BuiltinCtor::WeakRef),
            ("Proxy", BuiltinCtor::Proxy),
            ("Error", BuiltinCtor::Error),
            ("ArrayBuffer", BuiltinCtor::ArrayBuffer),
        ] {
            self.globals
                .declare(name, Value::Function(FunctionValue::builtin_ctor(name, ctor)));
        }

        self.globals.declare(
            "Symbol",
            Value::Function(FunctionValue::native(
                "Symbol",
                Rc::new(|_interpreter, _this, args: Vec<Value>| {
                    let description = match args.first() {
                        Some(Value::Undefined) | None => None,
                        Some(value) => Some(value.to_display_string()),
                    };
                    Ok(Value::Symbol(Rc::new(SymbolValue { description })))
                }),
            )),
        );

        let promise_namespace = ObjectValue::plain();
        promise_namespace.entries.borrow_mut().insert(
            "resolve".to_string(),
            Value::Function(FunctionValue::native(
                "resolve",
                Rc::new(|_interpreter, _this, args: Vec<Value>| {
                    let value = args.into_iter().next().unwrap_or(Value::Undefined);
                    Ok(Value::Promise(PromiseValue::fulfilled(value)))
                }),
            )),
        );
        promise_namespace.entries.borrow_mut().insert(
            "reject".to_string(),
            Value::Function(FunctionValue::native(
                "reject",
                Rc::new(|_interpreter, _this, args: Vec<Value>| {
                    let value = args.into_iter().next().unwrap_or(Value::Undefined);
                    Ok(Value::Promise(PromiseValue::rejected(value)))
                }),
            )),
        );
        self.globals
            .declare("Promise", Value::Object(promise_namespace));

        // The reserved probe globals. User identifiers that collide are
        // not defensively renamed; they simply shadow these.
        self.globals.declare(
            CAPTURE_IDENT,
            Value::Function(FunctionValue::native(
                CAPTURE_IDENT,
                Rc::new(|interpreter: &mut Interpreter, _this, mut args: Vec<Value>| {
                    let value = if args.len() > 1 {
                        args.remove(1)
                    } else {
                        Value::Undefined
                    };
                    if let (Some(probe), Some(Value::Number(id))) =
                        (interpreter.probe.clone(), args.first())
                    {
                        probe.capture(CaptureId(*id as u32), &value);
                    }
                    Ok(value)
                }),
            )),
        );
        self.globals.declare(
            FN_META_IDENT,
            Value::Function(FunctionValue::native(
                FN_META_IDENT,
                Rc::new(|interpreter: &mut Interpreter, _this, args: Vec<Value>| {
                    if let (Some(current), Some(Value::Text(source))) =
                        (interpreter.fn_stack.last(), args.first())
                    {
                        let mut slot = current.source.borrow_mut();
                        if slot.is_none() {
                            *slot = Some(source.to_string());
                        }
                    }
                    Ok(Value::Undefined)
                }),
            )),
        );
    }

    // ----- statements ---------------------------------------------------

    fn exec_stmt(&mut self, stmt: &Spanned<Stmt>, scope: &Scope) -> Result<Flow, RuntimeError> {
        self.tick(stmt.span.start)?;
        match &stmt.node {
            Stmt::Expr(expr) => {
                self.eval(expr, scope)?;
                Ok(Flow::Normal)
            }
            Stmt::VarDecl { declarators, .. } => {
                for declarator in declarators {
                    let value = match &declarator.init {
                        Some(init) => self.eval(init, scope)?,
                        None => Value::Undefined,
                    };
                    self.bind_pattern(&declarator.pattern.node, value, scope)?;
                }
                Ok(Flow::Normal)
            }
            Stmt::FunctionDecl(def) => {
                let function = FunctionValue::script(def.clone(), scope.clone());
                let name = def.name.clone().unwrap_or_default();
                scope.declare(name, Value::Function(function));
                Ok(Flow::Normal)
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(value) => self.eval(value, scope)?,
                    None => Value::Undefined,
                };
                Ok(Flow::Return(value))
            }
            Stmt::If {
                test,
                consequent,
                alternate,
            } => {
                if self.eval(test, scope)?.truthy() {
                    self.exec_stmt(consequent, scope)
                } else if let Some(alternate) = alternate {
                    self.exec_stmt(alternate, scope)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While { test, body } => {
                while self.eval(test, scope)?.truthy() {
                    self.tick(stmt.span.start)?;
                    if let Flow::Return(value) = self.exec_stmt(body, scope)? {
                        return Ok(Flow::Return(value));
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                init,
                test,
                update,
                body,
            } => {
                let loop_scope = scope.child();
                if let Some(init) = init {
                    self.exec_stmt(init, &loop_scope)?;
                }
                loop {
                    if let Some(test) = test {
                        if !self.eval(test, &loop_scope)?.truthy() {
                            break;
                        }
                    }
                    self.tick(stmt.span.start)?;
                    if let Flow::Return(value) = self.exec_stmt(body, &loop_scope)? {
                        return Ok(Flow::Return(value));
                    }
                    if let Some(update) = update {
                        self.eval(update, &loop_scope)?;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::ForEach {
                pattern,
                iteration,
                object,
                body,
                ..
            } => {
                let target = self.eval(object, scope)?;
                let items = match iteration {
                    IterationKind::Of => self.iterable_items(&target, object.span.start)?,
                    IterationKind::In => enumerable_keys(&target),
                };
                for item in items {
                    self.tick(stmt.span.start)?;
                    let iteration_scope = scope.child();
                    self.bind_pattern(&pattern.node, item, &iteration_scope)?;
                    if let Flow::Return(value) = self.exec_stmt(body, &iteration_scope)? {
                        return Ok(Flow::Return(value));
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Block(stmts) => {
                let block_scope = scope.child();
                for stmt in stmts {
                    if let Flow::Return(value) = self.exec_stmt(stmt, &block_scope)? {
                        return Ok(Flow::Return(value));
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Empty => Ok(Flow::Normal),
        }
    }

    // ----- expressions --------------------------------------------------

    fn eval(&mut self, expr: &Spanned<Expr>, scope: &Scope) -> Result<Value, RuntimeError> {
        match &expr.node {
            Expr::Number(number) => Ok(Value::Number(*number)),
            Expr::BigInt(value) => Ok(Value::BigInt(*value)),
            Expr::Str(text) => Ok(Value::text(text.clone())),
            Expr::Bool(value) => Ok(Value::Bool(*value)),
            Expr::Null => Ok(Value::Null),
            Expr::Undefined => Ok(Value::Undefined),
            Expr::Ident(name) => scope.get(name).ok_or_else(|| {
                RuntimeError::at(format!("{name} is not defined"), expr.span.start)
            }),
            Expr::This => Ok(scope.this_value().unwrap_or(Value::Undefined)),
            Expr::Array(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, scope)?);
                }
                Ok(Value::array(values))
            }
            Expr::Object(properties) => {
                let object = ObjectValue::plain();
                for property in properties {
                    let key = property.key.node.clone();
                    let value = match &property.value {
                        Some(value) => self.eval(value, scope)?,
                        None => scope.get(&key).ok_or_else(|| {
                            RuntimeError::at(
                                format!("{key} is not defined"),
                                property.key.span.start,
                            )
                        })?,
                    };
                    object.entries.borrow_mut().insert(key, value);
                }
                Ok(Value::Object(object))
            }
            Expr::Function(def) => Ok(Value::Function(FunctionValue::script(
                def.clone(),
                scope.clone(),
            ))),
            Expr::Call { callee, arguments } => self.eval_call(callee, arguments, scope),
            Expr::New { callee, arguments } => self.eval_new(callee, arguments, scope, expr.span.start),
            Expr::Member { object, property } => {
                let target = self.eval(object, scope)?;
                self.member_get(&target, property, scope)
            }
            Expr::Assign { target, value } => {
                let value = self.eval(value, scope)?;
                self.assign_target(target, value.clone(), scope)?;
                Ok(value)
            }
            Expr::Binary { op, left, right } => {
                let left_value = self.eval(left, scope)?;
                let right_value = self.eval(right, scope)?;
                binary_op(*op, &left_value, &right_value, expr.span.start)
            }
            Expr::Logical { op, left, right } => {
                let left_value = self.eval(left, scope)?;
                match op {
                    LogicalOp::And if !left_value.truthy() => Ok(left_value),
                    LogicalOp::Or if left_value.truthy() => Ok(left_value),
                    _ => self.eval(right, scope),
                }
            }
            Expr::Unary { op, operand } => {
                // `typeof missing` answers instead of failing.
                if let (UnaryOp::TypeOf, Expr::Ident(name)) = (op, &operand.node) {
                    return Ok(match scope.get(name) {
                        Some(value) => Value::text(value.type_of()),
                        None => Value::text("undefined"),
                    });
                }
                let value = self.eval(operand, scope)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!value.truthy())),
                    UnaryOp::TypeOf => Ok(Value::text(value.type_of())),
                    UnaryOp::Neg => Ok(match value {
                        Value::Number(number) => Value::Number(-number),
                        Value::BigInt(int) => Value::BigInt(-int),
                        other => Value::Number(-to_number(&other)),
                    }),
                }
            }
            Expr::Element(element) => self.eval_element(element, scope),
        }
    }

    fn eval_element(&mut self, element: &ElementLit, scope: &Scope) -> Result<Value, RuntimeError> {
        let mut attributes = Vec::with_capacity(element.attributes.len());
        for attribute in &element.attributes {
            let text = match &attribute.value {
                None => String::new(),
                Some(ElementAttrValue::Str(text)) => text.clone(),
                Some(ElementAttrValue::Expr(value)) => {
                    self.eval(value, scope)?.to_display_string()
                }
            };
            attributes.push((attribute.name.clone(), text));
        }
        let mut children = Vec::with_capacity(element.children.len());
        for child in &element.children {
            match &child.node {
                ElementChild::Text(text) => children.push(DomChild::Text(text.clone())),
                ElementChild::Element(nested) => {
                    let Value::Dom(node) = self.eval_element(nested, scope)? else {
                        unreachable!("eval_element always yields a DOM value");
                    };
                    children.push(DomChild::Element(node));
                }
                ElementChild::Expr(value) => match self.eval(value, scope)? {
                    Value::Dom(node) => children.push(DomChild::Element(node)),
                    other => children.push(DomChild::Text(other.to_display_string())),
                },
            }
        }
        Ok(Value::Dom(Rc::new(DomValue {
            tag: element.tag.clone(),
            attributes,
            children,
        })))
    }

    fn eval_call(
        &mut self,
        callee: &Spanned<Expr>,
        arguments: &[Spanned<Expr>],
        scope: &Scope,
    ) -> Result<Value, RuntimeError> {
        let mut args = Vec::with_capacity(arguments.len());
        let offset = callee.span.start;

        if let Expr::Member {
            object,
            property: MemberProperty::Dot(method),
        } = &callee.node
        {
            let target = self.eval(object, scope)?;
            for argument in arguments {
                args.push(self.eval(argument, scope)?);
            }
            // fn.apply(thisArg, argsArray) — the console rewrite calls
            // through this.
            if method == "apply" {
                if let Value::Function(function) = &target {
                    let mut args = args.into_iter();
                    let this = args.next().unwrap_or(Value::Undefined);
                    let spread = match args.next() {
                        Some(Value::Array(items)) => items.borrow().clone(),
                        Some(other) => vec![other],
                        None => Vec::new(),
                    };
                    return self.call_function(function.clone(), this, spread, offset);
                }
            }
            if let Some(result) = self.builtin_method(&target, method, &args, offset)? {
                return Ok(result);
            }
            let member = self.member_get(&target, &MemberProperty::Dot(method.clone()), scope)?;
            let Value::Function(function) = member else {
                return Err(RuntimeError::at(
                    format!("{method} is not a function"),
                    offset,
                ));
            };
            return self.call_function(function, target, args, offset);
        }

        let target = self.eval(callee, scope)?;
        for argument in arguments {
            args.push(self.eval(argument, scope)?);
        }
        let Value::Function(function) = target else {
            return Err(RuntimeError::at("value is not a function", offset));
        };
        self.call_function(function, Value::Undefined, args, offset)
    }

    pub(crate) fn call_function(
        &mut self,
        function: Rc<FunctionValue>,
        this: Value,
        args: Vec<Value>,
        offset: usize,
    ) -> Result<Value, RuntimeError> {
        if self.call_depth >= MAX_CALL_DEPTH {
            return Err(RuntimeError::at("maximum call depth exceeded", offset));
        }

        if let Some(native) = function.native.clone() {
            self.call_depth += 1;
            let result = native(self, this, args);
            self.call_depth -= 1;
            return result;
        }
        if let Some(ctor) = function.ctor {
            // Builtin constructors behave the same with or without `new`.
            return self.construct_builtin(ctor, args, offset);
        }

        let Some(def) = function.def.clone() else {
            return Err(RuntimeError::at("value is not callable", offset));
        };
        let parent = function
            .env
            .clone()
            .unwrap_or_else(|| self.globals.clone());
        let call_scope = parent.child();
        if !def.is_arrow {
            call_scope.set_this(this);
            call_scope.declare("arguments", Value::array(args.clone()));
        }
        for (index, param) in def.params.iter().enumerate() {
            let mut value = args.get(index).cloned().unwrap_or(Value::Undefined);
            if matches!(value, Value::Undefined) {
                if let Some(default) = &param.default {
                    value = self.eval(default, &call_scope)?;
                }
            }
            call_scope.declare(param.name.node.clone(), value);
        }
        if let Some(rest) = &def.rest {
            let remaining: Vec<Value> = args
                .iter()
                .skip(def.params.len())
                .cloned()
                .collect();
            call_scope.declare(rest.node.clone(), Value::array(remaining));
        }

        self.fn_stack.push(function.clone());
        self.call_depth += 1;
        let outcome = (|| -> Result<Value, RuntimeError> {
            match &def.body {
                FunctionBody::Block(stmts) => {
                    for stmt in stmts {
                        if let Flow::Return(value) = self.exec_stmt(stmt, &call_scope)? {
                            return Ok(value);
                        }
                    }
                    Ok(Value::Undefined)
                }
                FunctionBody::Expr(body) => self.eval(body, &call_scope),
            }
        })();
        self.call_depth -= 1;
        self.fn_stack.pop();

        if function.is_async {
            // Async functions settle a promise instead of propagating.
            return match outcome {
                Ok(value) => Ok(Value::Promise(PromiseValue::fulfilled(value))),
                Err(error) if error.interrupted => Err(error),
                Err(error) => Ok(Value::Promise(PromiseValue::rejected(Value::error(
                    "Error",
                    error.message,
                )))),
            };
        }
        outcome
    }

    fn eval_new(
        &mut self,
        callee: &Spanned<Expr>,
        arguments: &[Spanned<Expr>],
        scope: &Scope,
        offset: usize,
    ) -> Result<Value, RuntimeError> {
        let target = self.eval(callee, scope)?;
        let mut args = Vec::with_capacity(arguments.len());
        for argument in arguments {
            args.push(self.eval(argument, scope)?);
        }
        let Value::Function(function) = target else {
            return Err(RuntimeError::at("value is not a constructor", offset));
        };
        if let Some(ctor) = function.ctor {
            return self.construct_builtin(ctor, args, offset);
        }
        if function.def.is_none() {
            return Err(RuntimeError::at("value is not a constructor", offset));
        }

        let name = function
            .name
            .borrow()
            .clone()
            .unwrap_or_else(|| "Object".to_string());
        let instance = ObjectValue::constructed(name);
        let result =
            self.call_function(function, Value::Object(instance.clone()), args, offset)?;
        Ok(match result {
            Value::Object(_) | Value::Array(_) | Value::Dom(_) => result,
            _ => Value::Object(instance),
        })
    }

    fn construct_builtin(
        &mut self,
        ctor: BuiltinCtor,
        args: Vec<Value>,
        offset: usize,
    ) -> Result<Value, RuntimeError> {
        let first = args.into_iter().next();
        Ok(match ctor {
            BuiltinCtor::Date => match first {
                None | Some(Value::Undefined) => {
                    let now = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|elapsed| elapsed.as_millis() as f64)
                        .unwrap_or(f64::NAN);
                    Value::Date(now)
                }
                Some(Value::Number(ms)) => Value::Date(ms),
                Some(Value::Text(text)) => {
                    Value::Date(parse_iso8601(&text).unwrap_or(f64::NAN))
                }
                Some(_) => Value::Date(f64::NAN),
            },
            BuiltinCtor::Set => match first {
                Some(Value::Array(items)) => Value::Set(Rc::new(RefCell::new(
                    items.borrow().clone(),
                ))),
                _ => Value::Set(Rc::new(RefCell::new(Vec::new()))),
            },
            BuiltinCtor::Map => match first {
                Some(Value::Array(items)) => {
                    let mut entries = Vec::new();
                    for item in items.borrow().iter() {
                        let Value::Array(pair) = item else {
                            return Err(RuntimeError::at(
                                "Map entries must be [key, value] pairs",
                                offset,
                            ));
                        };
                        let pair = pair.borrow();
                        entries.push((
                            pair.first().cloned().unwrap_or(Value::Undefined),
                            pair.get(1).cloned().unwrap_or(Value::Undefined),
                        ));
                    }
                    Value::Map(Rc::new(RefCell::new(entries)))
                }
                _ => Value::Map(Rc::new(RefCell::new(Vec::new()))),
            },
            BuiltinCtor::WeakSet => Value::WeakSet,
            BuiltinCtor::WeakMap => Value::WeakMap,
            BuiltinCtor::WeakRef => Value::WeakRef,
            BuiltinCtor::Proxy => Value::Proxy,
            BuiltinCtor::Error => {
                let message = first
                    .map(|value| value.to_display_string())
                    .unwrap_or_default();
                Value::Error(Rc::new(ErrorValue {
                    name: "Error".into(),
                    message,
                }))
            }
            BuiltinCtor::ArrayBuffer => {
                let length = first.map(|value| to_number(&value)).unwrap_or(0.0);
                Value::ArrayBuffer(if length.is_finite() && length >= 0.0 {
                    length as u64
                } else {
                    0
                })
            }
        })
    }

    /// Methods on builtin value kinds. `Ok(None)` means "no such builtin
    /// method; fall through to property lookup".
    fn builtin_method(
        &mut self,
        target: &Value,
        method: &str,
        args: &[Value],
        offset: usize,
    ) -> Result<Option<Value>, RuntimeError> {
        let result = match (target, method) {
            (Value::Array(items), "push") => {
                items.borrow_mut().extend(args.iter().cloned());
                Some(Value::Number(items.borrow().len() as f64))
            }
            (Value::Array(items), "includes") => {
                let needle = args.first().cloned().unwrap_or(Value::Undefined);
                let found = items
                    .borrow()
                    .iter()
                    .any(|item| item.strict_equals(&needle));
                Some(Value::Bool(found))
            }
            (Value::Set(items), "add") => {
                let value = args.first().cloned().unwrap_or(Value::Undefined);
                let exists = items.borrow().iter().any(|item| item.strict_equals(&value));
                if !exists {
                    items.borrow_mut().push(value);
                }
                Some(target.clone())
            }
            (Value::Set(items), "has") => {
                let needle = args.first().cloned().unwrap_or(Value::Undefined);
                Some(Value::Bool(
                    items.borrow().iter().any(|item| item.strict_equals(&needle)),
                ))
            }
            (Value::Map(entries), "set") => {
                let key = args.first().cloned().unwrap_or(Value::Undefined);
                let value = args.get(1).cloned().unwrap_or(Value::Undefined);
                let mut entries_mut = entries.borrow_mut();
                match entries_mut.iter_mut().find(|(k, _)| k.strict_equals(&key)) {
                    Some(slot) => slot.1 = value,
                    None => entries_mut.push((key, value)),
                }
                drop(entries_mut);
                Some(target.clone())
            }
            (Value::Map(entries), "get") => {
                let key = args.first().cloned().unwrap_or(Value::Undefined);
                Some(
                    entries
                        .borrow()
                        .iter()
                        .find(|(k, _)| k.strict_equals(&key))
                        .map(|(_, v)| v.clone())
                        .unwrap_or(Value::Undefined),
                )
            }
            (Value::Map(entries), "has") => {
                let key = args.first().cloned().unwrap_or(Value::Undefined);
                Some(Value::Bool(
                    entries.borrow().iter().any(|(k, _)| k.strict_equals(&key)),
                ))
            }
            (Value::Date(ms), "getTime") => Some(Value::Number(*ms)),
            (Value::Date(ms), "toISOString") => {
                if ms.is_finite() {
                    Some(Value::text(super::marshal::iso8601(*ms)))
                } else {
                    return Err(RuntimeError::at("invalid date", offset));
                }
            }
            _ => None,
        };
        Ok(result)
    }

    fn member_get(
        &mut self,
        target: &Value,
        property: &MemberProperty,
        scope: &Scope,
    ) -> Result<Value, RuntimeError> {
        match property {
            MemberProperty::Dot(name) => Ok(static_property(target, name)),
            MemberProperty::Index(index) => {
                let key = self.eval(index, scope)?;
                Ok(match (target, &key) {
                    (Value::Array(items), Value::Number(index)) => items
                        .borrow()
                        .get(*index as usize)
                        .cloned()
                        .unwrap_or(Value::Undefined),
                    (Value::Text(text), Value::Number(index)) => text
                        .chars()
                        .nth(*index as usize)
                        .map(|character| Value::text(character.to_string()))
                        .unwrap_or(Value::Undefined),
                    (_, key) => static_property(target, &key.to_display_string()),
                })
            }
        }
    }

    fn assign_target(
        &mut self,
        target: &Spanned<Expr>,
        value: Value,
        scope: &Scope,
    ) -> Result<(), RuntimeError> {
        match &target.node {
            Expr::Ident(name) => {
                if !scope.assign(name, value.clone()) {
                    // Sloppy-mode behavior: assignment to an unknown name
                    // creates a global.
                    self.globals.declare(name.clone(), value);
                }
                Ok(())
            }
            Expr::Member { object, property } => {
                let container = self.eval(object, scope)?;
                let key = match property {
                    MemberProperty::Dot(name) => name.clone(),
                    MemberProperty::Index(index) => {
                        let key = self.eval(index, scope)?;
                        if let (Value::Array(items), Value::Number(position)) = (&container, &key) {
                            let position = *position as usize;
                            let mut items = items.borrow_mut();
                            if position >= items.len() {
                                items.resize(position + 1, Value::Undefined);
                            }
                            items[position] = value;
                            return Ok(());
                        }
                        key.to_display_string()
                    }
                };
                match &container {
                    Value::Object(object) => {
                        object.entries.borrow_mut().insert(key, value);
                        Ok(())
                    }
                    _ => Err(RuntimeError::at(
                        format!("cannot set property {key} on {}", container.type_of()),
                        target.span.start,
                    )),
                }
            }
            Expr::Array(elements) => {
                let items = self.iterable_items(&value, target.span.start)?;
                for (index, element) in elements.iter().enumerate() {
                    let item = items.get(index).cloned().unwrap_or(Value::Undefined);
                    self.assign_target(element, item, scope)?;
                }
                Ok(())
            }
            _ => Err(RuntimeError::at(
                "invalid assignment target",
                target.span.start,
            )),
        }
    }

    fn bind_pattern(
        &mut self,
        pattern: &Pattern,
        value: Value,
        scope: &Scope,
    ) -> Result<(), RuntimeError> {
        match pattern {
            Pattern::Ident(name) => {
                scope.declare(name.clone(), value);
                Ok(())
            }
            Pattern::Array { elements, rest } => {
                let items = self.iterable_items(&value, 0)?;
                for (index, element) in elements.iter().enumerate() {
                    let Some(element) = element else { continue };
                    let mut item = items.get(index).cloned().unwrap_or(Value::Undefined);
                    if matches!(item, Value::Undefined) {
                        if let Some(default) = &element.default {
                            item = self.eval(default, scope)?;
                        }
                    }
                    self.bind_pattern(&element.pattern.node, item, scope)?;
                }
                if let Some(rest) = rest {
                    let remaining: Vec<Value> =
                        items.iter().skip(elements.len()).cloned().collect();
                    scope.declare(rest.node.clone(), Value::array(remaining));
                }
                Ok(())
            }
            Pattern::Object { properties, rest } => {
                let mut consumed = Vec::new();
                for property in properties {
                    let key = &property.key.node;
                    consumed.push(key.clone());
                    let mut item = static_property(&value, key);
                    if matches!(item, Value::Undefined) {
                        if let Some(default) = &property.default {
                            item = self.eval(default, scope)?;
                        }
                    }
                    match &property.pattern {
                        Some(nested) => self.bind_pattern(&nested.node, item, scope)?,
                        None => scope.declare(key.clone(), item),
                    }
                }
                if let Some(rest) = rest {
                    let leftover = ObjectValue::plain();
                    if let Value::Object(object) = &value {
                        for (key, entry) in object.entries.borrow().iter() {
                            if !consumed.contains(key) {
                                leftover
                                    .entries
                                    .borrow_mut()
                                    .insert(key.clone(), entry.clone());
                            }
                        }
                    }
                    scope.declare(rest.node.clone(), Value::Object(leftover));
                }
                Ok(())
            }
        }
    }

    fn iterable_items(&mut self, value: &Value, offset: usize) -> Result<Vec<Value>, RuntimeError> {
        match value {
            Value::Array(items) => Ok(items.borrow().clone()),
            Value::Set(items) => Ok(items.borrow().clone()),
            Value::Map(entries) => Ok(entries
                .borrow()
                .iter()
                .map(|(key, entry)| Value::array(vec![key.clone(), entry.clone()]))
                .collect()),
            Value::Text(text) => Ok(text
                .chars()
                .map(|character| Value::text(character.to_string()))
                .collect()),
            other => Err(RuntimeError::at(
                format!("{} is not iterable", other.type_of()),
                offset,
            )),
        }
    }
}

/// Data properties readable without calling anything.
fn static_property(target: &Value, name: &str) -> Value {
    match (target, name) {
        (Value::Array(items), "length") => Value::Number(items.borrow().len() as f64),
        (Value::Text(text), "length") => Value::Number(text.chars().count() as f64),
        (Value::Set(items), "size") => Value::Number(items.borrow().len() as f64),
        (Value::Map(entries), "size") => Value::Number(entries.borrow().len() as f64),
        (Value::ArrayBuffer(length), "byteLength") => Value::Number(*length as f64),
        (Value::Error(error), "message") => Value::text(error.message.clone()),
        (Value::Error(error), "name") => Value::text(error.name.clone()),
        (Value::Function(function), "name") => {
            Value::text(function.name.borrow().clone().unwrap_or_default())
        }
        (Value::Object(object), _) => object
            .entries
            .borrow()
            .get(name)
            .cloned()
            .unwrap_or(Value::Undefined),
        _ => Value::Undefined,
    }
}

fn enumerable_keys(value: &Value) -> Vec<Value> {
    match value {
        Value::Object(object) => object
            .entries
            .borrow()
            .keys()
            .map(|key| Value::text(key.clone()))
            .collect(),
        Value::Array(items) => (0..items.borrow().len())
            .map(|index| Value::text(index.to_string()))
            .collect(),
        _ => Vec::new(),
    }
}

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Number(number) => *number,
        Value::Bool(true) => 1.0,
        Value::Bool(false) | Value::Null => 0.0,
        Value::Text(text) => text.trim().parse().unwrap_or(f64::NAN),
        Value::BigInt(int) => *int as f64,
        Value::Date(ms) => *ms,
        _ => f64::NAN,
    }
}

fn binary_op(
    op: BinaryOp,
    left: &Value,
    right: &Value,
    offset: usize,
) -> Result<Value, RuntimeError> {
    use BinaryOp::*;
    Ok(match op {
        Add => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
            (Value::BigInt(a), Value::BigInt(b)) => Value::BigInt(a.wrapping_add(*b)),
            _ if matches!(left, Value::Text(_)) || matches!(right, Value::Text(_)) => Value::text(
                format!("{}{}", left.to_display_string(), right.to_display_string()),
            ),
            (a, b) => Value::Number(to_number(a) + to_number(b)),
        },
        Sub | Mul | Div | Rem => match (left, right) {
            (Value::BigInt(a), Value::BigInt(b)) => {
                if matches!(op, Div | Rem) && *b == 0 {
                    return Err(RuntimeError::at("division by zero", offset));
                }
                Value::BigInt(match op {
                    Sub => a.wrapping_sub(*b),
                    Mul => a.wrapping_mul(*b),
                    Div => a / b,
                    Rem => a % b,
                    _ => unreachable!(),
                })
            }
            (a, b) => {
                let (a, b) = (to_number(a), to_number(b));
                Value::Number(match op {
                    Sub => a - b,
                    Mul => a * b,
                    Div => a / b,
                    Rem => a % b,
                    _ => unreachable!(),
                })
            }
        },
        StrictEq => Value::Bool(left.strict_equals(right)),
        StrictNotEq => Value::Bool(!left.strict_equals(right)),
        Eq => Value::Bool(left.loose_equals(right)),
        NotEq => Value::Bool(!left.loose_equals(right)),
        Less | LessEq | Greater | GreaterEq => {
            let ordering = match (left, right) {
                (Value::Text(a), Value::Text(b)) => a.partial_cmp(b),
                (a, b) => to_number(a).partial_cmp(&to_number(b)),
            };
            match ordering {
                None => Value::Bool(false),
                Some(ordering) => Value::Bool(match op {
                    Less => ordering.is_lt(),
                    LessEq => ordering.is_le(),
                    Greater => ordering.is_gt(),
                    GreaterEq => ordering.is_ge(),
                    _ => unreachable!(),
                }),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_program;

    fn run_source(code: &str) -> Interpreter {
        let program = parse_program(code).expect("parse");
        let mut interpreter = Interpreter::new(
            Rc::new(SilentConsole),
            None,
            Arc::new(AtomicBool::new(false)),
        );
        interpreter.run(&program).expect("run");
        interpreter
    }

    fn global_number(interpreter: &Interpreter, name: &str) -> f64 {
        match interpreter.globals.get(name) {
            Some(Value::Number(number)) => number,
            other => panic!("expected number in {name}, got {:?}", other.map(|v| v.to_display_string())),
        }
    }

    #[test]
    fn arithmetic_and_precedence() {
        let interpreter = run_source("let x = 1 + 2 * 3; let y = (1 + 2) * 3;");
        assert_eq!(global_number(&interpreter, "x"), 7.0);
        assert_eq!(global_number(&interpreter, "y"), 9.0);
    }

    #[test]
    fn closures_capture_their_environment() {
        let interpreter = run_source(
            "function counter() {\n  let n = 0;\n  return function () { n = n + 1; return n; };\n}\nconst tick = counter();\ntick();\nlet result = tick();",
        );
        assert_eq!(global_number(&interpreter, "result"), 2.0);
    }

    #[test]
    fn destructuring_with_defaults_and_rest() {
        let interpreter = run_source("const [a, b = 10, ...c] = [1, undefined, 3, 4];");
        assert_eq!(global_number(&interpreter, "a"), 1.0);
        assert_eq!(global_number(&interpreter, "b"), 10.0);
        let Some(Value::Array(items)) = interpreter.globals.get("c") else {
            panic!("expected array");
        };
        assert_eq!(items.borrow().len(), 2);
    }

    #[test]
    fn object_destructuring_renames_and_rest() {
        let interpreter =
            run_source("const { a, b: renamed, ...rest } = { a: 1, b: 2, c: 3, d: 4 };");
        assert_eq!(global_number(&interpreter, "a"), 1.0);
        assert_eq!(global_number(&interpreter, "renamed"), 2.0);
        let Some(Value::Object(rest)) = interpreter.globals.get("rest") else {
            panic!("expected object");
        };
        assert_eq!(rest.entries.borrow().len(), 2);
    }

    #[test]
    fn for_of_iterates_values() {
        let interpreter =
            run_source("let sum = 0;\nfor (const n of [1, 2, 3]) {\n  sum = sum + n;\n}");
        assert_eq!(global_number(&interpreter, "sum"), 6.0);
    }

    #[test]
    fn for_in_iterates_keys() {
        let interpreter = run_source(
            "let keys = '';\nfor (const k in { a: 1, b: 2 }) {\n  keys = keys + k;\n}",
        );
        assert!(matches!(
            interpreter.globals.get("keys"),
            Some(Value::Text(text)) if &*text == "ab"
        ));
    }

    #[test]
    fn member_assignment_builds_cycles() {
        let interpreter = run_source("const o = {}; o.self = o;");
        let Some(Value::Object(object)) = interpreter.globals.get("o") else {
            panic!("expected object");
        };
        let entries = object.entries.borrow();
        let Some(Value::Object(inner)) = entries.get("self") else {
            panic!("expected self reference");
        };
        assert!(Rc::ptr_eq(&object, inner));
    }

    #[test]
    fn new_user_function_sets_constructor_name() {
        let interpreter =
            run_source("function Point(x, y) { this.x = x; this.y = y; }\nconst p = new Point(1, 2);");
        let Some(Value::Object(point)) = interpreter.globals.get("p") else {
            panic!("expected object");
        };
        assert_eq!(point.constructor.borrow().as_deref(), Some("Point"));
        assert!(matches!(
            point.entries.borrow().get("x"),
            Some(Value::Number(x)) if *x == 1.0
        ));
    }

    #[test]
    fn async_function_returns_fulfilled_promise() {
        let interpreter = run_source("async function f() { return 5; }\nconst p = f();");
        let Some(Value::Promise(promise)) = interpreter.globals.get("p") else {
            panic!("expected promise");
        };
        assert!(matches!(
            &*promise.state.borrow(),
            PromiseState::Fulfilled(Value::Number(n)) if *n == 5.0
        ));
    }

    #[test]
    fn console_output_reaches_the_sink() {
        let console = Rc::new(RecordingConsole::default());
        let program = parse_program("console.log(1, 2, 3);\nconsole.warn('careful');").unwrap();
        let mut interpreter = Interpreter::new(
            console.clone(),
            None,
            Arc::new(AtomicBool::new(false)),
        );
        interpreter.run(&program).unwrap();
        let lines = console.lines.borrow();
        assert_eq!(lines[0], (ConsoleLevel::Log, "1 2 3".to_string()));
        assert_eq!(lines[1], (ConsoleLevel::Warn, "careful".to_string()));
    }

    #[test]
    fn apply_spreads_an_argument_array() {
        let console = Rc::new(RecordingConsole::default());
        let program =
            parse_program("console.log.apply(console, [1, 2, 3]);").unwrap();
        let mut interpreter = Interpreter::new(
            console.clone(),
            None,
            Arc::new(AtomicBool::new(false)),
        );
        interpreter.run(&program).unwrap();
        assert_eq!(
            console.lines.borrow()[0],
            (ConsoleLevel::Log, "1 2 3".to_string())
        );
    }

    #[test]
    fn stop_flag_interrupts_loops() {
        let stop = Arc::new(AtomicBool::new(true));
        let program = parse_program("while (true) { 1; }").unwrap();
        let mut interpreter = Interpreter::new(Rc::new(SilentConsole), None, stop);
        let error = interpreter.run(&program).unwrap_err();
        assert!(error.interrupted);
    }

    #[test]
    fn step_budget_bounds_runaway_loops() {
        let program = parse_program("while (true) { 1; }").unwrap();
        let mut interpreter = Interpreter::new(
            Rc::new(SilentConsole),
            None,
            Arc::new(AtomicBool::new(false)),
        );
        let error = interpreter.run(&program).unwrap_err();
        assert!(!error.interrupted);
        assert!(error.message.contains("budget"));
    }

    #[test]
    fn builtin_constructors_produce_their_kinds() {
        let interpreter = run_source(
            "const d = new Date('2024-01-01T00:00:00.000Z');\nconst s = new Set([1, 2]);\nconst m = new Map([['a', 1]]);\nconst w = new WeakMap();\nconst b = new ArrayBuffer(8);",
        );
        assert!(matches!(interpreter.globals.get("d"), Some(Value::Date(_))));
        assert!(matches!(interpreter.globals.get("s"), Some(Value::Set(_))));
        assert!(matches!(interpreter.globals.get("m"), Some(Value::Map(_))));
        assert!(matches!(interpreter.globals.get("w"), Some(Value::WeakMap)));
        assert!(matches!(
            interpreter.globals.get("b"),
            Some(Value::ArrayBuffer(8))
        ));
    }

    #[test]
    fn element_literals_build_dom_values() {
        let program =
            parse_program("const label = 'hi';\nconst view = <div class='box'>{label}</div>;")
                .unwrap();
        let mut interpreter = Interpreter::new(
            Rc::new(SilentConsole),
            None,
            Arc::new(AtomicBool::new(false)),
        );
        interpreter.run(&program).unwrap();
        let Some(Value::Dom(node)) = interpreter.globals.get("view") else {
            panic!("expected DOM value");
        };
        assert_eq!(node.tag, "div");
        assert_eq!(node.text_content(), "hi");
    }
}
