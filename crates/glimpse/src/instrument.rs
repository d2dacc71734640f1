//! The instrumentor: rewrites a parsed program so that every interesting
//! site reports its runtime value through the reserved capture function.
//!
//! All state lives in a [`CompileSession`] created per compile invocation
//! — the id counter, the growing context table, the source handle.
//! Concurrent compiles of different files never share anything.

use glimpse_probe_protocol::{CaptureId, ContextKind, ContextRecord, ContextTable, SourceRange};
use tracing::warn;
use ulid::Ulid;

use crate::emit;
use crate::error::CompileError;
use crate::parser::{
    ArrayPatternElement, Declarator, DeclKind, Expr, FunctionBody, FunctionDef, MemberProperty,
    ObjectProperty, Pattern, SourceCode, Span, Spanned, Stmt, parse_program,
};
use crate::remap::SourceMap;

/// Fixed global name of the value-capture function injected into
/// transformed code. Colliding user identifiers are not renamed.
pub const CAPTURE_IDENT: &str = "__glimpse_capture__";

/// Fixed global name of the function-source metadata call.
pub const FN_META_IDENT: &str = "__glimpse_fn_meta__";

/// Everything one compile produces.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    /// Identity of the compile session that produced this output.
    pub session_id: Ulid,
    pub transformed: String,
    pub table: ContextTable,
    pub source_map: SourceMap,
    pub capture_ident: &'static str,
    /// Pre-allocated site for uncaught runtime errors.
    pub window_error_id: CaptureId,
}

/// Compile one file: parse, instrument, emit.
///
/// `markup` enables the element-literal syntax extension; element
/// literals in a file compiled without it are a compile error.
pub fn compile(source_text: &str, file: &str, markup: bool) -> Result<CompileOutput, CompileError> {
    let source = SourceCode::new(source_text.to_string());
    let ast = match parse_program(source.as_str()) {
        Ok(ast) => ast,
        Err(diagnostics) => {
            let first = diagnostics.into_iter().next().unwrap_or_else(|| {
                crate::parser::Diagnostic {
                    message: "source failed to parse".into(),
                    start: 0,
                    end: 0,
                }
            });
            let position = source.line_col(first.start);
            return Err(CompileError {
                message: first.message,
                file: file.to_string(),
                line: position.line,
                column: position.column,
                start: first.start,
                end: first.end,
            });
        }
    };

    if !markup {
        if let Some(span) = find_element_literal(&ast) {
            let position = source.line_col(span.start);
            return Err(CompileError {
                message: "element literals require the markup syntax extension".into(),
                file: file.to_string(),
                line: position.line,
                column: position.column,
                start: span.start,
                end: span.end,
            });
        }
    }

    let mut session = CompileSession::new(source.clone(), file);
    let program = session.instrument_program(ast);
    let window_error_id = session.allocate_window_error();
    let (transformed, source_map) = emit::emit_program(&program, &source, file);

    tracing::debug!(
        file,
        sites = session.records.len(),
        lines = source.line_count(),
        "compiled"
    );

    Ok(CompileOutput {
        session_id: session.id,
        transformed,
        table: ContextTable {
            file: file.to_string(),
            records: session.records,
        },
        source_map,
        capture_ident: CAPTURE_IDENT,
        window_error_id,
    })
}

/// Per-function instrumentation state. All returns of one function share
/// the single slot allocated at the first one.
struct FnFrame {
    return_id: Option<CaptureId>,
    fn_span: Span,
}

/// Per-compile state: the id counter is the length of the growing record
/// list, so ids are dense and unique within the table by construction.
pub struct CompileSession {
    pub id: Ulid,
    source: SourceCode,
    file: String,
    records: Vec<ContextRecord>,
}

impl CompileSession {
    pub fn new(source: SourceCode, file: &str) -> Self {
        CompileSession {
            id: Ulid::new(),
            source,
            file: file.to_string(),
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[ContextRecord] {
        &self.records
    }

    /// A span parsed from real source; synthetic nodes carry zero-width
    /// dummies and never count as located.
    fn locate(span: Span) -> Option<Span> {
        (span.start < span.end).then_some(span)
    }

    fn range_of(&self, span: Span) -> SourceRange {
        let start = self.source.line_col(span.start);
        let end = self.source.line_col(span.end);
        SourceRange {
            start_line: start.line,
            start_column: start.column,
            end_line: end.line,
            end_column: end.column,
        }
    }

    fn text_of(&self, span: Span) -> String {
        self.source
            .slice(span.start.min(self.source.len()), span.end.min(self.source.len()))
            .as_str()
            .trim()
            .to_string()
    }

    /// Allocate one capture site. A site with no resolvable location
    /// falls back to the nearest located ancestor (`anchor`); if neither
    /// resolves, the site is skipped and the compile continues.
    fn allocate(
        &mut self,
        kind: ContextKind,
        text: String,
        site: Span,
        anchor: Span,
    ) -> Option<CaptureId> {
        let Some(span) = Self::locate(site).or_else(|| Self::locate(anchor)) else {
            warn!(file = %self.file, ?kind, "capture site has no resolvable location, skipping");
            return None;
        };
        let id = CaptureId(self.records.len() as u32);
        self.records.push(ContextRecord {
            id,
            kind,
            text,
            file: self.file.clone(),
            range: self.range_of(span),
        });
        Some(id)
    }

    /// The uncaught-error site lives under the well-known sentinel id so
    /// the sandbox can report without knowing this table.
    fn allocate_window_error(&mut self) -> CaptureId {
        let id = CaptureId::WINDOW_ERROR;
        self.records.push(ContextRecord {
            id,
            kind: ContextKind::WindowError,
            text: String::new(),
            file: self.file.clone(),
            range: SourceRange {
                start_line: 1,
                start_column: 1,
                end_line: self.source.line_count(),
                end_column: 1,
            },
        });
        id
    }

    pub fn instrument_program(&mut self, program: Vec<Spanned<Stmt>>) -> Vec<Spanned<Stmt>> {
        let mut out = Vec::with_capacity(program.len());
        for stmt in program {
            out.extend(self.instrument_stmt(stmt, None));
        }
        out
    }

    /// One statement in, one or more out: captures for declarations and
    /// assignments are spliced in right after the statement they report.
    fn instrument_stmt(
        &mut self,
        stmt: Spanned<Stmt>,
        mut frame: Option<&mut FnFrame>,
    ) -> Vec<Spanned<Stmt>> {
        // Synthesized nodes are never revisited.
        if stmt.synthetic {
            return vec![stmt];
        }
        let anchor = stmt.span;
        let span = stmt.span;

        match stmt.node {
            Stmt::Expr(mut expr) => {
                self.instrument_expr(&mut expr);
                if let Some(kind) = console_kind(&expr) {
                    return self.rewrite_console(expr, kind, span);
                }
                if let Expr::Assign { .. } = expr.node {
                    return self.capture_assignment(expr, span);
                }
                let text = self.text_of(expr.span);
                match self.allocate(ContextKind::Expression, text, expr.span, anchor) {
                    Some(id) => vec![Spanned::synthesized(Stmt::Expr(self.capture_call(id, expr)))],
                    None => vec![Spanned::new(Stmt::Expr(expr), span)],
                }
            }
            Stmt::VarDecl {
                kind,
                mut declarators,
            } => {
                let mut bindings = Vec::new();
                for declarator in &mut declarators {
                    self.instrument_pattern_defaults(&mut declarator.pattern);
                    if let Some(init) = &mut declarator.init {
                        self.instrument_expr(init);
                    }
                    collect_pattern_bindings(&declarator.pattern, &mut bindings);
                }
                let mut out = vec![Spanned::new(Stmt::VarDecl { kind, declarators }, span)];
                // One capture per bound name, in discovery order, so the
                // final source order matches left-to-right binding order.
                out.extend(self.binding_captures(&bindings, anchor));
                out
            }
            Stmt::FunctionDecl(mut def) => {
                self.instrument_function(&mut def);
                vec![Spanned::new(Stmt::FunctionDecl(def), span)]
            }
            Stmt::Return(value) => self.rewrite_return(value, span, frame.as_deref_mut()),
            Stmt::If {
                mut test,
                consequent,
                alternate,
            } => {
                self.instrument_expr(&mut test);
                let consequent = self.instrument_boxed(*consequent, frame.as_deref_mut());
                let alternate =
                    alternate.map(|stmt| self.instrument_boxed(*stmt, frame.as_deref_mut()));
                vec![Spanned::new(
                    Stmt::If {
                        test,
                        consequent,
                        alternate,
                    },
                    span,
                )]
            }
            Stmt::While { mut test, body } => {
                self.instrument_expr(&mut test);
                let body = self.instrument_boxed(*body, frame.as_deref_mut());
                vec![Spanned::new(Stmt::While { test, body }, span)]
            }
            Stmt::For {
                mut init,
                mut test,
                mut update,
                body,
            } => {
                let mut bindings = Vec::new();
                if let Some(init) = &mut init {
                    match &mut init.node {
                        Stmt::VarDecl { declarators, .. } => {
                            for declarator in declarators {
                                self.instrument_pattern_defaults(&mut declarator.pattern);
                                if let Some(init) = &mut declarator.init {
                                    self.instrument_expr(init);
                                }
                                collect_pattern_bindings(&declarator.pattern, &mut bindings);
                            }
                        }
                        Stmt::Expr(expr) => self.instrument_expr(expr),
                        _ => {}
                    }
                }
                if let Some(test) = &mut test {
                    self.instrument_expr(test);
                }
                if let Some(update) = &mut update {
                    self.instrument_expr(update);
                }
                let body = self.instrument_loop_body(*body, &bindings, frame.as_deref_mut());
                vec![Spanned::new(
                    Stmt::For {
                        init,
                        test,
                        update,
                        body,
                    },
                    span,
                )]
            }
            Stmt::ForEach {
                kind,
                mut pattern,
                iteration,
                mut object,
                body,
            } => {
                self.instrument_pattern_defaults(&mut pattern);
                self.instrument_expr(&mut object);
                let mut bindings = Vec::new();
                collect_pattern_bindings(&pattern, &mut bindings);
                let body = self.instrument_loop_body(*body, &bindings, frame.as_deref_mut());
                vec![Spanned::new(
                    Stmt::ForEach {
                        kind,
                        pattern,
                        iteration,
                        object,
                        body,
                    },
                    span,
                )]
            }
            Stmt::Block(stmts) => {
                let mut out = Vec::with_capacity(stmts.len());
                for stmt in stmts {
                    out.extend(self.instrument_stmt(stmt, frame.as_deref_mut()));
                }
                vec![Spanned::new(Stmt::Block(out), span)]
            }
            Stmt::Empty => vec![Spanned::new(Stmt::Empty, span)],
        }
    }

    /// Instrument a single-statement slot (an `if` branch, a loop body).
    /// When instrumentation expands it, the expansion is wrapped in a
    /// block so the surrounding statement shape survives.
    fn instrument_boxed(
        &mut self,
        stmt: Spanned<Stmt>,
        frame: Option<&mut FnFrame>,
    ) -> Box<Spanned<Stmt>> {
        let mut stmts = self.instrument_stmt(stmt, frame);
        if stmts.len() == 1 {
            Box::new(stmts.remove(0))
        } else {
            Box::new(Spanned::synthesized(Stmt::Block(stmts)))
        }
    }

    /// Loop bodies report their loop variables once per iteration: the
    /// captures go in as the first statements of the body.
    fn instrument_loop_body(
        &mut self,
        body: Spanned<Stmt>,
        bindings: &[(String, Span)],
        frame: Option<&mut FnFrame>,
    ) -> Box<Spanned<Stmt>> {
        let anchor = body.span;
        let mut out: Vec<Spanned<Stmt>> = self.binding_captures(bindings, anchor);
        match body.node {
            Stmt::Block(stmts) if !body.synthetic => {
                let mut frame = frame;
                for stmt in stmts {
                    out.extend(self.instrument_stmt(stmt, frame.as_deref_mut()));
                }
            }
            _ => out.extend(self.instrument_stmt(body, frame)),
        }
        Box::new(Spanned::synthesized(Stmt::Block(out)))
    }

    fn binding_captures(
        &mut self,
        bindings: &[(String, Span)],
        anchor: Span,
    ) -> Vec<Spanned<Stmt>> {
        let mut out = Vec::with_capacity(bindings.len());
        for (name, name_span) in bindings {
            if let Some(id) =
                self.allocate(ContextKind::Variable, name.clone(), *name_span, anchor)
            {
                out.push(self.capture_stmt(id, ident_expr(name.clone())));
            }
        }
        out
    }

    /// `console.<level>(a, b)` becomes
    /// ```text
    /// const __glimpse_args_N = [a, b];
    /// console.<level>.apply(console, __glimpse_args_N);
    /// __glimpse_capture__(N, __glimpse_args_N);
    /// ```
    /// so the native console output still occurs while the raw argument
    /// array is captured, with the arguments evaluated exactly once.
    fn rewrite_console(
        &mut self,
        expr: Spanned<Expr>,
        kind: ContextKind,
        span: Span,
    ) -> Vec<Spanned<Stmt>> {
        let text = self.text_of(expr.span);
        let Some(id) = self.allocate(kind, text, expr.span, span) else {
            return vec![Spanned::new(Stmt::Expr(expr), span)];
        };
        let Expr::Call { callee, arguments } = expr.node else {
            unreachable!("console_kind only matches calls");
        };
        let level = match &callee.node {
            Expr::Member {
                property: MemberProperty::Dot(level),
                ..
            } => level.clone(),
            _ => unreachable!("console_kind only matches member calls"),
        };
        let args_name = format!("__glimpse_args_{}", id.0);

        let array = Spanned::synthesized(Expr::Array(arguments));
        let declaration = Spanned::synthesized(Stmt::VarDecl {
            kind: DeclKind::Const,
            declarators: vec![Declarator {
                pattern: Spanned::synthesized(Pattern::Ident(args_name.clone())),
                init: Some(array),
            }],
        });

        let apply = Spanned::synthesized(Expr::Call {
            callee: Box::new(Spanned::synthesized(Expr::Member {
                object: Box::new(Spanned::synthesized(Expr::Member {
                    object: Box::new(ident_expr("console".into())),
                    property: MemberProperty::Dot(level),
                })),
                property: MemberProperty::Dot("apply".into()),
            })),
            arguments: vec![ident_expr("console".into()), ident_expr(args_name.clone())],
        });

        vec![
            declaration,
            Spanned::synthesized(Stmt::Expr(apply)),
            self.capture_stmt(id, ident_expr(args_name)),
        ]
    }

    /// Assignment statements keep their own effect and get one capture
    /// per target spliced in after the enclosing statement.
    fn capture_assignment(&mut self, expr: Spanned<Expr>, span: Span) -> Vec<Spanned<Stmt>> {
        let mut captures = Vec::new();
        if let Expr::Assign { target, .. } = &expr.node {
            let mut targets = Vec::new();
            collect_assignment_targets(target, &mut targets);
            for capture in targets {
                let text = match &capture {
                    AssignmentTarget::Name(name, _) => name.clone(),
                    AssignmentTarget::Path(path) => self.text_of(path.span),
                };
                let (site, value) = match capture {
                    AssignmentTarget::Name(name, name_span) => (name_span, ident_expr(name)),
                    AssignmentTarget::Path(path) => (path.span, path),
                };
                if let Some(id) = self.allocate(ContextKind::Assignment, text, site, span) {
                    captures.push(self.capture_stmt(id, value));
                }
            }
        }
        let mut out = vec![Spanned::new(Stmt::Expr(expr), span)];
        out.extend(captures);
        out
    }

    /// Rewrite a `return` so the value is bound to a synthetic constant,
    /// captured, then returned — evaluated once, one inline slot for the
    /// whole function regardless of branch count.
    fn rewrite_return(
        &mut self,
        value: Option<Spanned<Expr>>,
        span: Span,
        frame: Option<&mut FnFrame>,
    ) -> Vec<Spanned<Stmt>> {
        let Some(frame) = frame else {
            // Top-level return; nothing meaningful to report.
            return vec![Spanned::new(Stmt::Return(value), span)];
        };
        let mut value = value;
        if let Some(value) = &mut value {
            self.instrument_expr(value);
        }
        let id = match frame.return_id {
            Some(id) => Some(id),
            None => {
                let site = value.as_ref().map(|value| value.span).unwrap_or(span);
                let text = self.text_of(site);
                let id = self.allocate(ContextKind::Return, text, site, frame.fn_span);
                frame.return_id = id;
                id
            }
        };
        let Some(id) = id else {
            return vec![Spanned::new(Stmt::Return(value), span)];
        };

        let ret_name = format!("__glimpse_ret_{}", id.0);
        let init = value.unwrap_or_else(|| Spanned::synthesized(Expr::Undefined));
        let declaration = Spanned::synthesized(Stmt::VarDecl {
            kind: DeclKind::Const,
            declarators: vec![Declarator {
                pattern: Spanned::synthesized(Pattern::Ident(ret_name.clone())),
                init: Some(init),
            }],
        });
        let capture = self.capture_stmt(id, ident_expr(ret_name.clone()));
        let return_stmt = Spanned::synthesized(Stmt::Return(Some(ident_expr(ret_name))));
        // Block-wrapped so the synthetic constant scopes per return site.
        vec![Spanned::synthesized(Stmt::Block(vec![
            declaration,
            capture,
            return_stmt,
        ]))]
    }

    fn instrument_expr(&mut self, expr: &mut Spanned<Expr>) {
        if expr.synthetic {
            return;
        }
        match &mut expr.node {
            Expr::Function(def) => self.instrument_function(def),
            Expr::Array(items) => {
                for item in items {
                    self.instrument_expr(item);
                }
            }
            Expr::Object(properties) => {
                for ObjectProperty { value, .. } in properties {
                    if let Some(value) = value {
                        self.instrument_expr(value);
                    }
                }
            }
            Expr::Call { callee, arguments } | Expr::New { callee, arguments } => {
                self.instrument_expr(callee);
                for argument in arguments {
                    self.instrument_expr(argument);
                }
            }
            Expr::Member { object, property } => {
                self.instrument_expr(object);
                if let MemberProperty::Index(index) = property {
                    self.instrument_expr(index);
                }
            }
            Expr::Assign { target, value } => {
                self.instrument_expr(target);
                self.instrument_expr(value);
            }
            Expr::Binary { left, right, .. } | Expr::Logical { left, right, .. } => {
                self.instrument_expr(left);
                self.instrument_expr(right);
            }
            Expr::Unary { operand, .. } => self.instrument_expr(operand),
            Expr::Element(element) => self.instrument_element(element),
            Expr::Number(_)
            | Expr::BigInt(_)
            | Expr::Str(_)
            | Expr::Bool(_)
            | Expr::Null
            | Expr::Undefined
            | Expr::Ident(_)
            | Expr::This => {}
        }
    }

    fn instrument_element(&mut self, element: &mut crate::parser::ElementLit) {
        for attribute in &mut element.attributes {
            if let Some(crate::parser::ElementAttrValue::Expr(value)) = &mut attribute.value {
                self.instrument_expr(value);
            }
        }
        for child in &mut element.children {
            match &mut child.node {
                crate::parser::ElementChild::Element(nested) => self.instrument_element(nested),
                crate::parser::ElementChild::Expr(value) => self.instrument_expr(value),
                crate::parser::ElementChild::Text(_) => {}
            }
        }
    }

    fn instrument_pattern_defaults(&mut self, pattern: &mut Spanned<Pattern>) {
        match &mut pattern.node {
            Pattern::Ident(_) => {}
            Pattern::Array { elements, .. } => {
                for element in elements.iter_mut().flatten() {
                    if let Some(default) = &mut element.default {
                        self.instrument_expr(default);
                    }
                    self.instrument_pattern_defaults(&mut element.pattern);
                }
            }
            Pattern::Object { properties, .. } => {
                for property in properties {
                    if let Some(default) = &mut property.default {
                        self.instrument_expr(default);
                    }
                    if let Some(nested) = &mut property.pattern {
                        self.instrument_pattern_defaults(nested);
                    }
                }
            }
        }
    }

    /// Function entry instrumentation: metadata call with the verbatim
    /// original source, argument-list capture, one capture per declared
    /// parameter, then the instrumented body. Expression bodies become
    /// block bodies with an explicit return first; arrow parameter lists
    /// collapse to one rest parameter with a synthetic destructuring
    /// declaration reconstructing the original names.
    fn instrument_function(&mut self, def: &mut FunctionDef) {
        let fn_span = def.span;
        let fn_text = Self::locate(fn_span)
            .map(|span| self.text_of(span))
            .unwrap_or_default();
        let display_name = def.name.clone().unwrap_or_else(|| "(anonymous)".into());

        // Original parameter names, before any collapse.
        let declared: Vec<(String, Span)> = def
            .params
            .iter()
            .map(|param| (param.name.node.clone(), param.name.span))
            .chain(def.rest.iter().map(|rest| (rest.node.clone(), rest.span)))
            .collect();

        // Expression body -> block body with explicit return, so the
        // return rewrite below applies uniformly.
        if let FunctionBody::Expr(_) = def.body {
            let FunctionBody::Expr(value) = std::mem::replace(
                &mut def.body,
                FunctionBody::Block(Vec::new()),
            ) else {
                unreachable!();
            };
            let return_span = value.span;
            def.body = FunctionBody::Block(vec![Spanned::new(
                Stmt::Return(Some(*value)),
                return_span,
            )]);
        }

        let mut entry = Vec::new();
        entry.push(Spanned::synthesized(Stmt::Expr(Spanned::synthesized(
            Expr::Call {
                callee: Box::new(ident_expr(FN_META_IDENT.into())),
                arguments: vec![Spanned::synthesized(Expr::Str(fn_text))],
            },
        ))));

        let call_id = self.allocate(ContextKind::FunctionCall, display_name, fn_span, fn_span);
        if let Some(call_id) = call_id {
            if def.is_arrow {
                // Arrows have no `arguments` binding: collapse the
                // parameter list to one rest parameter and reconstruct
                // the declared names (defaults included) by destructuring.
                let args_name = format!("__glimpse_args_{}", call_id.0);
                entry.push(self.capture_stmt(call_id, ident_expr(args_name.clone())));

                let elements: Vec<Option<ArrayPatternElement>> = def
                    .params
                    .drain(..)
                    .map(|param| {
                        Some(ArrayPatternElement {
                            pattern: Spanned::new(Pattern::Ident(param.name.node), param.name.span),
                            default: param.default,
                        })
                    })
                    .collect();
                let rest = def.rest.take();
                if !elements.is_empty() || rest.is_some() {
                    entry.push(Spanned::synthesized(Stmt::VarDecl {
                        kind: DeclKind::Const,
                        declarators: vec![Declarator {
                            pattern: Spanned::synthesized(Pattern::Array { elements, rest }),
                            init: Some(ident_expr(args_name.clone())),
                        }],
                    }));
                }
                def.rest = Some(Spanned::synthesized(args_name));
            } else {
                entry.push(self.capture_stmt(call_id, ident_expr("arguments".into())));
            }
        }

        for (name, name_span) in &declared {
            if let Some(id) =
                self.allocate(ContextKind::Variable, name.clone(), *name_span, fn_span)
            {
                entry.push(self.capture_stmt(id, ident_expr(name.clone())));
            }
        }

        let mut frame = FnFrame {
            return_id: None,
            fn_span,
        };
        let FunctionBody::Block(stmts) = std::mem::replace(
            &mut def.body,
            FunctionBody::Block(Vec::new()),
        ) else {
            unreachable!("expression bodies were rewritten above");
        };
        for stmt in stmts {
            entry.extend(self.instrument_stmt(stmt, Some(&mut frame)));
        }
        def.body = FunctionBody::Block(entry);
    }

    fn capture_call(&self, id: CaptureId, value: Spanned<Expr>) -> Spanned<Expr> {
        Spanned::synthesized(Expr::Call {
            callee: Box::new(ident_expr(CAPTURE_IDENT.into())),
            arguments: vec![Spanned::synthesized(Expr::Number(id.0 as f64)), value],
        })
    }

    fn capture_stmt(&self, id: CaptureId, value: Spanned<Expr>) -> Spanned<Stmt> {
        Spanned::synthesized(Stmt::Expr(self.capture_call(id, value)))
    }
}

fn ident_expr(name: String) -> Spanned<Expr> {
    Spanned::synthesized(Expr::Ident(name))
}

/// Targets of one assignment statement, in source order.
enum AssignmentTarget {
    Name(String, Span),
    /// A member path, re-read after the assignment runs.
    Path(Spanned<Expr>),
}

fn collect_assignment_targets(target: &Spanned<Expr>, out: &mut Vec<AssignmentTarget>) {
    match &target.node {
        Expr::Ident(name) => out.push(AssignmentTarget::Name(name.clone(), target.span)),
        Expr::Member { .. } => out.push(AssignmentTarget::Path(target.clone())),
        Expr::Array(elements) => {
            for element in elements {
                collect_assignment_targets(element, out);
            }
        }
        _ => {}
    }
}

/// Bound names of a pattern in discovery order, skipping object-pattern
/// keys and default-value expressions.
fn collect_pattern_bindings(pattern: &Spanned<Pattern>, out: &mut Vec<(String, Span)>) {
    match &pattern.node {
        Pattern::Ident(name) => out.push((name.clone(), pattern.span)),
        Pattern::Array { elements, rest } => {
            for element in elements.iter().flatten() {
                collect_pattern_bindings(&element.pattern, out);
            }
            if let Some(rest) = rest {
                out.push((rest.node.clone(), rest.span));
            }
        }
        Pattern::Object { properties, rest } => {
            for property in properties {
                match &property.pattern {
                    Some(nested) => collect_pattern_bindings(nested, out),
                    None => out.push((property.key.node.clone(), property.key.span)),
                }
            }
            if let Some(rest) = rest {
                out.push((rest.node.clone(), rest.span));
            }
        }
    }
}

fn console_kind(expr: &Spanned<Expr>) -> Option<ContextKind> {
    let Expr::Call { callee, .. } = &expr.node else {
        return None;
    };
    let Expr::Member {
        object,
        property: MemberProperty::Dot(level),
    } = &callee.node
    else {
        return None;
    };
    let Expr::Ident(base) = &object.node else {
        return None;
    };
    if base != "console" {
        return None;
    }
    match level.as_str() {
        "log" => Some(ContextKind::ConsoleLog),
        "debug" => Some(ContextKind::ConsoleDebug),
        "info" => Some(ContextKind::ConsoleInfo),
        "warn" => Some(ContextKind::ConsoleWarn),
        "error" => Some(ContextKind::ConsoleError),
        _ => None,
    }
}

fn find_element_literal(program: &[Spanned<Stmt>]) -> Option<Span> {
    fn in_stmt(stmt: &Spanned<Stmt>) -> Option<Span> {
        match &stmt.node {
            Stmt::Expr(expr) => in_expr(expr),
            Stmt::VarDecl { declarators, .. } => declarators
                .iter()
                .find_map(|declarator| declarator.init.as_ref().and_then(in_expr)),
            Stmt::FunctionDecl(def) => in_body(&def.body),
            Stmt::Return(value) => value.as_ref().and_then(in_expr),
            Stmt::If {
                test,
                consequent,
                alternate,
            } => in_expr(test)
                .or_else(|| in_stmt(consequent))
                .or_else(|| alternate.as_ref().and_then(|stmt| in_stmt(stmt))),
            Stmt::While { test, body } => in_expr(test).or_else(|| in_stmt(body)),
            Stmt::For {
                init,
                test,
                update,
                body,
            } => init
                .as_ref()
                .and_then(|stmt| in_stmt(stmt))
                .or_else(|| test.as_ref().and_then(in_expr))
                .or_else(|| update.as_ref().and_then(in_expr))
                .or_else(|| in_stmt(body)),
            Stmt::ForEach { object, body, .. } => in_expr(object).or_else(|| in_stmt(body)),
            Stmt::Block(stmts) => stmts.iter().find_map(in_stmt),
            Stmt::Empty => None,
        }
    }

    fn in_body(body: &FunctionBody) -> Option<Span> {
        match body {
            FunctionBody::Block(stmts) => stmts.iter().find_map(in_stmt),
            FunctionBody::Expr(expr) => in_expr(expr),
        }
    }

    fn in_expr(expr: &Spanned<Expr>) -> Option<Span> {
        match &expr.node {
            Expr::Element(_) => Some(expr.span),
            Expr::Array(items) => items.iter().find_map(in_expr),
            Expr::Object(properties) => properties
                .iter()
                .find_map(|property| property.value.as_ref().and_then(in_expr)),
            Expr::Function(def) => in_body(&def.body),
            Expr::Call { callee, arguments } | Expr::New { callee, arguments } => {
                in_expr(callee).or_else(|| arguments.iter().find_map(in_expr))
            }
            Expr::Member { object, property } => in_expr(object).or_else(|| match property {
                MemberProperty::Index(index) => in_expr(index),
                MemberProperty::Dot(_) => None,
            }),
            Expr::Assign { target, value } => in_expr(target).or_else(|| in_expr(value)),
            Expr::Binary { left, right, .. } | Expr::Logical { left, right, .. } => {
                in_expr(left).or_else(|| in_expr(right))
            }
            Expr::Unary { operand, .. } => in_expr(operand),
            _ => None,
        }
    }

    program.iter().find_map(in_stmt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glimpse_probe_protocol::ContextKind;

    fn compile_ok(code: &str) -> CompileOutput {
        compile(code, "main.js", false).expect("compile should succeed")
    }

    fn records_of_kind(output: &CompileOutput, kind: ContextKind) -> Vec<&ContextRecord> {
        output
            .table
            .records
            .iter()
            .filter(|record| record.kind == kind)
            .collect()
    }

    #[test]
    fn statement_expressions_get_one_site_each() {
        let output = compile_ok("1 + 2;\n'text';\nvalue;\n");
        let sites = records_of_kind(&output, ContextKind::Expression);
        assert_eq!(sites.len(), 3);
        let mut ids: Vec<_> = sites.iter().map(|record| record.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), 3, "ids must be pairwise unique");
    }

    #[test]
    fn destructuring_declaration_yields_three_sites_in_order() {
        let output = compile_ok("const [a, b = 1, ...c] = f();\n");
        let sites = records_of_kind(&output, ContextKind::Variable);
        let names: Vec<_> = sites.iter().map(|record| record.text.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        // Captures come after the declaration in the transformed source.
        let declaration_at = output.transformed.find("= f()").unwrap();
        for site in &sites {
            let capture = format!("{}({}, ", CAPTURE_IDENT, site.id.0);
            let capture_at = output.transformed.find(&capture).unwrap();
            assert!(capture_at > declaration_at);
        }
    }

    #[test]
    fn object_pattern_keys_are_not_bindings() {
        let output = compile_ok("const { a, b: renamed, c = 3, ...rest } = source;\n");
        let names: Vec<_> = records_of_kind(&output, ContextKind::Variable)
            .iter()
            .map(|record| record.text.clone())
            .collect();
        assert_eq!(names, vec!["a", "renamed", "c", "rest"]);
    }

    #[test]
    fn for_of_loop_variable_captured_in_body() {
        let output = compile_ok("for (const item of items) {\n  item;\n}\n");
        let sites = records_of_kind(&output, ContextKind::Variable);
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].text, "item");
        // The capture is the first statement of the loop body.
        let body_open = output.transformed.find("{").unwrap();
        let capture = format!("{}({}, item)", CAPTURE_IDENT, sites[0].id.0);
        let capture_at = output.transformed.find(&capture).unwrap();
        assert!(capture_at > body_open);
    }

    #[test]
    fn returns_share_one_site_per_function() {
        let output = compile_ok(
            "function pick(flag) {\n  if (flag) {\n    return 1;\n  }\n  return 2;\n}\n",
        );
        let sites = records_of_kind(&output, ContextKind::Return);
        assert_eq!(sites.len(), 1, "both returns share one slot");
    }

    #[test]
    fn console_call_is_rewritten_through_apply() {
        let output = compile_ok("console.log(1, 2, 3);\n");
        let sites = records_of_kind(&output, ContextKind::ConsoleLog);
        assert_eq!(sites.len(), 1);
        assert!(output.transformed.contains("console.log.apply(console, __glimpse_args_"));
        assert!(records_of_kind(&output, ContextKind::Expression).is_empty());
    }

    #[test]
    fn member_assignment_captures_the_path() {
        let output = compile_ok("o.self = o;\n");
        let sites = records_of_kind(&output, ContextKind::Assignment);
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].text, "o.self");
    }

    #[test]
    fn destructured_assignment_captures_each_target() {
        let output = compile_ok("[a, b] = pair;\n");
        let names: Vec<_> = records_of_kind(&output, ContextKind::Assignment)
            .iter()
            .map(|record| record.text.clone())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn function_entry_reports_call_and_parameters() {
        let code = "function add(a, b) {\n  return a + b;\n}\n";
        let output = compile_ok(code);
        assert_eq!(records_of_kind(&output, ContextKind::FunctionCall).len(), 1);
        let params: Vec<_> = records_of_kind(&output, ContextKind::Variable)
            .iter()
            .map(|record| record.text.clone())
            .collect();
        assert_eq!(params, vec!["a", "b"]);
        // The metadata call carries the verbatim source text.
        assert!(output.transformed.contains(FN_META_IDENT));
        assert!(output.transformed.contains("function add(a, b)"));
        // Block-bodied functions capture the live argument list.
        assert!(output.transformed.contains("arguments)"));
    }

    #[test]
    fn arrow_parameters_collapse_to_rest() {
        let output = compile_ok("const double = (n) => n * 2;\n");
        let call_site = records_of_kind(&output, ContextKind::FunctionCall)[0].id;
        let rest_name = format!("...__glimpse_args_{}", call_site.0);
        assert!(output.transformed.contains(&rest_name));
        assert!(output
            .transformed
            .contains(&format!("const [n] = __glimpse_args_{}", call_site.0)));
        // The expression body became a block body with a captured return.
        assert_eq!(records_of_kind(&output, ContextKind::Return).len(), 1);
    }

    #[test]
    fn window_error_site_is_always_allocated() {
        let output = compile_ok("1;\n");
        let record = output.table.get(output.window_error_id).unwrap();
        assert_eq!(record.kind, ContextKind::WindowError);
    }

    #[test]
    fn element_literal_requires_markup_flag() {
        let code = "const view = <div class=\"box\">{label}</div>;\n";
        let error = compile(code, "view.jsx", false).unwrap_err();
        assert!(error.message.contains("markup"));
        assert!(compile(code, "view.jsx", true).is_ok());
    }

    #[test]
    fn parse_failure_reports_position() {
        let error = compile("let = 1;\n", "bad.js", false).unwrap_err();
        assert_eq!(error.file, "bad.js");
        assert!(error.line >= 1);
        let (payload, table) = error.to_payload(glimpse_probe_protocol::Epoch(1));
        assert!(payload.is_error);
        assert_eq!(
            table.records[0].kind,
            glimpse_probe_protocol::ContextKind::ParseError
        );
    }

    #[test]
    fn ids_are_dense_and_unique() {
        let output = compile_ok("let a = 1;\na = 2;\nconsole.log(a);\n");
        for (index, record) in output.table.records.iter().enumerate() {
            if record.kind == ContextKind::WindowError {
                continue;
            }
            assert_eq!(record.id.0 as usize, index);
        }
        let mut ids: Vec<_> = output.table.records.iter().map(|record| record.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), output.table.records.len());
    }
}
