//! Lexer, syntax tree and parser for the playground's scripting language.
//!
//! The parser produces `Spanned` nodes carrying byte spans into the
//! original source. Nodes created later by the instrumentor are flagged
//! `synthetic` at construction; the instrumentor consults that flag
//! instead of keeping an identity side-table of nodes it has already
//! produced, so a traversal can never re-enter its own output.

use chumsky::{input::ValueInput, pratt::*, prelude::*};

mod lexer;
pub use lexer::{Token, lexer};

mod source;
pub use source::{LineCol, SourceCode, StrSlice};

pub use chumsky::prelude::{Input, Parser};

pub type Span = SimpleSpan;
pub type ParseError<'code, T> = Rich<'code, T, Span>;

/// Zero-width span at the given byte offset.
pub fn span_at(offset: usize) -> Span {
    (offset..offset).into()
}

#[derive(Debug, Clone)]
pub struct Spanned<T> {
    pub span: Span,
    /// True for nodes synthesized by the instrumentor rather than parsed
    /// from user source. Synthetic nodes are never instrumented again and
    /// never contribute source-map entries.
    pub synthetic: bool,
    pub node: T,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Spanned {
            span,
            synthetic: false,
            node,
        }
    }

    /// Wrap an instrumentor-created node. The span is a zero-width dummy.
    pub fn synthesized(node: T) -> Self {
        Spanned {
            span: span_at(0),
            synthetic: true,
            node,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Spanned<U> {
        Spanned {
            span: self.span,
            synthetic: self.synthetic,
            node: f(self.node),
        }
    }
}

/// A parse diagnostic with the source span it points at.
/// Owned so it can outlive the parse borrow.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub message: String,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Let,
    Const,
    Var,
}

impl DeclKind {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Let => "let",
            Self::Const => "const",
            Self::Var => "var",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationKind {
    In,
    Of,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Expr(Spanned<Expr>),
    VarDecl {
        kind: DeclKind,
        declarators: Vec<Declarator>,
    },
    FunctionDecl(FunctionDef),
    Return(Option<Spanned<Expr>>),
    If {
        test: Spanned<Expr>,
        consequent: Box<Spanned<Stmt>>,
        alternate: Option<Box<Spanned<Stmt>>>,
    },
    While {
        test: Spanned<Expr>,
        body: Box<Spanned<Stmt>>,
    },
    For {
        init: Option<Box<Spanned<Stmt>>>,
        test: Option<Spanned<Expr>>,
        update: Option<Spanned<Expr>>,
        body: Box<Spanned<Stmt>>,
    },
    ForEach {
        kind: Option<DeclKind>,
        pattern: Spanned<Pattern>,
        iteration: IterationKind,
        object: Spanned<Expr>,
        body: Box<Spanned<Stmt>>,
    },
    Block(Vec<Spanned<Stmt>>),
    Empty,
}

#[derive(Debug, Clone)]
pub struct Declarator {
    pub pattern: Spanned<Pattern>,
    pub init: Option<Spanned<Expr>>,
}

#[derive(Debug, Clone)]
pub enum Pattern {
    Ident(String),
    Array {
        /// `None` entries are elision holes: `[, b]`.
        elements: Vec<Option<ArrayPatternElement>>,
        rest: Option<Spanned<String>>,
    },
    Object {
        properties: Vec<ObjectPatternProperty>,
        rest: Option<Spanned<String>>,
    },
}

#[derive(Debug, Clone)]
pub struct ArrayPatternElement {
    pub pattern: Spanned<Pattern>,
    pub default: Option<Spanned<Expr>>,
}

#[derive(Debug, Clone)]
pub struct ObjectPatternProperty {
    pub key: Spanned<String>,
    /// `None` for shorthand `{ a }`, which binds the key itself.
    pub pattern: Option<Spanned<Pattern>>,
    pub default: Option<Spanned<Expr>>,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Number(f64),
    BigInt(i128),
    Str(String),
    Bool(bool),
    Null,
    Undefined,
    Ident(String),
    This,
    Array(Vec<Spanned<Expr>>),
    Object(Vec<ObjectProperty>),
    Function(FunctionDef),
    Call {
        callee: Box<Spanned<Expr>>,
        arguments: Vec<Spanned<Expr>>,
    },
    New {
        callee: Box<Spanned<Expr>>,
        arguments: Vec<Spanned<Expr>>,
    },
    Member {
        object: Box<Spanned<Expr>>,
        property: MemberProperty,
    },
    Assign {
        /// Validated late: identifier, member expression or an array of
        /// identifiers (destructuring assignment).
        target: Box<Spanned<Expr>>,
        value: Box<Spanned<Expr>>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Spanned<Expr>>,
        right: Box<Spanned<Expr>>,
    },
    Logical {
        op: LogicalOp,
        left: Box<Spanned<Expr>>,
        right: Box<Spanned<Expr>>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Spanned<Expr>>,
    },
    Element(ElementLit),
}

#[derive(Debug, Clone)]
pub struct ObjectProperty {
    pub key: Spanned<String>,
    /// `None` for shorthand `{ a }`.
    pub value: Option<Spanned<Expr>>,
}

#[derive(Debug, Clone)]
pub enum MemberProperty {
    Dot(String),
    Index(Box<Spanned<Expr>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    StrictEq,
    StrictNotEq,
    Eq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    TypeOf,
}

#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: Option<String>,
    pub params: Vec<Param>,
    pub rest: Option<Spanned<String>>,
    pub body: FunctionBody,
    pub is_arrow: bool,
    pub is_async: bool,
    /// Span of the whole function in the source it was parsed from; the
    /// instrumentor slices the verbatim text out of it.
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Spanned<String>,
    pub default: Option<Spanned<Expr>>,
}

#[derive(Debug, Clone)]
pub enum FunctionBody {
    Block(Vec<Spanned<Stmt>>),
    Expr(Box<Spanned<Expr>>),
}

#[derive(Debug, Clone)]
pub struct ElementLit {
    pub tag: String,
    pub attributes: Vec<ElementAttr>,
    pub children: Vec<Spanned<ElementChild>>,
    pub self_closing: bool,
}

#[derive(Debug, Clone)]
pub struct ElementAttr {
    pub name: String,
    pub value: Option<ElementAttrValue>,
}

#[derive(Debug, Clone)]
pub enum ElementAttrValue {
    Str(String),
    Expr(Spanned<Expr>),
}

#[derive(Debug, Clone)]
pub enum ElementChild {
    Element(ElementLit),
    Text(String),
    Expr(Spanned<Expr>),
}

/// Process the escapes of a raw string-literal body.
pub fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(character) = chars.next() {
        if character != '\\' {
            out.push(character);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some(escaped) => out.push(escaped),
            None => out.push('\\'),
        }
    }
    out
}

/// Inverse of [`unescape`], for emitting string literals.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for character in text.chars() {
        match character {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            other => out.push(other),
        }
    }
    out
}

pub fn parser<'code, I>()
-> impl Parser<'code, I, Vec<Spanned<Stmt>>, extra::Err<ParseError<'code, Token<'code>>>>
where
    I: ValueInput<'code, Token = Token<'code>, Span = Span>,
{
    let statement = recursive(|statement| {
        let ident = select! { Token::Ident(name) => name.to_string() };
        let string = select! { Token::Str(raw) => unescape(raw) };

        let comma = just(Token::Comma);
        let semicolon = just(Token::Semicolon);
        let colon = just(Token::Colon);
        let assign = just(Token::Assign);
        let round_open = just(Token::BracketRoundOpen);
        let round_close = just(Token::BracketRoundClose);
        let curly_open = just(Token::BracketCurlyOpen);
        let curly_close = just(Token::BracketCurlyClose);
        let square_open = just(Token::BracketSquareOpen);
        let square_close = just(Token::BracketSquareClose);

        let expression = recursive(|expression| {
            let literal = select! {
                Token::Number(number) => Expr::Number(number),
                Token::BigInt(digits) => Expr::BigInt(digits.parse().unwrap_or_default()),
                Token::True => Expr::Bool(true),
                Token::False => Expr::Bool(false),
                Token::Null => Expr::Null,
                Token::Undefined => Expr::Undefined,
                Token::This => Expr::This,
            }
            .or(select! { Token::Str(raw) => raw }.map(|raw| Expr::Str(unescape(raw))));

            let array = expression
                .clone()
                .separated_by(comma)
                .allow_trailing()
                .collect()
                .delimited_by(square_open, square_close)
                .map(Expr::Array);

            let property_key = ident.or(string).map_with(|key, extra| Spanned::new(key, extra.span()));

            let object = property_key
                .clone()
                .then(colon.ignore_then(expression.clone()).or_not())
                .map(|(key, value)| ObjectProperty { key, value })
                .separated_by(comma)
                .allow_trailing()
                .collect()
                .delimited_by(curly_open, curly_close)
                .map(Expr::Object);

            // Parameter list: `(a, b = 1, ...rest)`.
            let param = ident
                .map_with(|name, extra| Spanned::new(name, extra.span()))
                .then(assign.ignore_then(expression.clone()).or_not())
                .map(|(name, default)| Param { name, default });

            let rest_param = just(Token::Ellipsis)
                .ignore_then(ident.map_with(|name, extra| Spanned::new(name, extra.span())));

            enum ParamItem {
                Param(Param),
                Rest(Spanned<String>),
            }

            let param_list = param
                .map(ParamItem::Param)
                .or(rest_param.clone().map(ParamItem::Rest))
                .separated_by(comma)
                .allow_trailing()
                .collect::<Vec<_>>()
                .delimited_by(round_open, round_close)
                .map(|items| {
                    let mut params = Vec::new();
                    let mut rest = None;
                    for item in items {
                        match item {
                            ParamItem::Param(param) => params.push(param),
                            ParamItem::Rest(name) => rest = Some(name),
                        }
                    }
                    (params, rest)
                });

            let block_body = statement
                .clone()
                .repeated()
                .collect()
                .delimited_by(curly_open, curly_close)
                .map(FunctionBody::Block);

            let function_expression = just(Token::Async)
                .or_not()
                .then_ignore(just(Token::Function))
                .then(ident.or_not())
                .then(param_list.clone())
                .then(block_body.clone())
                .map_with(|(((is_async, name), (params, rest)), body), extra| {
                    Expr::Function(FunctionDef {
                        name,
                        params,
                        rest,
                        body,
                        is_arrow: false,
                        is_async: is_async.is_some(),
                        span: extra.span(),
                    })
                });

            let arrow_params = param_list.clone().or(ident
                .map_with(|name, extra| Spanned::new(name, extra.span()))
                .map(|name| {
                    (
                        vec![Param {
                            name,
                            default: None,
                        }],
                        None,
                    )
                }));

            let arrow_body = block_body
                .clone()
                .or(expression.clone().map(|body| FunctionBody::Expr(Box::new(body))));

            let arrow = just(Token::Async)
                .or_not()
                .then(arrow_params)
                .then_ignore(just(Token::Arrow))
                .then(arrow_body)
                .map_with(|((is_async, (params, rest)), body), extra| {
                    Expr::Function(FunctionDef {
                        name: None,
                        params,
                        rest,
                        body,
                        is_arrow: true,
                        is_async: is_async.is_some(),
                        span: extra.span(),
                    })
                });

            let call_arguments = expression
                .clone()
                .separated_by(comma)
                .allow_trailing()
                .collect::<Vec<_>>()
                .delimited_by(round_open, round_close);

            // `new Date(...)`, `new ns.Thing(...)` — member path then arguments.
            let new_expression = just(Token::New)
                .ignore_then(
                    ident
                        .map_with(|name, extra| Spanned::new(Expr::Ident(name), extra.span()))
                        .foldl_with(
                            just(Token::Dot).ignore_then(ident).repeated(),
                            |object, property, extra| {
                                Spanned::new(
                                    Expr::Member {
                                        object: Box::new(object),
                                        property: MemberProperty::Dot(property),
                                    },
                                    extra.span(),
                                )
                            },
                        ),
                )
                .then(call_arguments.clone().or_not())
                .map(|(callee, arguments)| Expr::New {
                    callee: Box::new(callee),
                    arguments: arguments.unwrap_or_default(),
                });

            // Element literals (markup extension): attributes are string
            // literals or braced expressions; children are elements,
            // string literals or braced expressions.
            let element = recursive(|element| {
                let attribute_value = choice((
                    string.map(ElementAttrValue::Str),
                    expression
                        .clone()
                        .delimited_by(curly_open, curly_close)
                        .map(ElementAttrValue::Expr),
                ));
                let attribute = ident
                    .then(assign.ignore_then(attribute_value).or_not())
                    .map(|(name, value)| ElementAttr { name, value });

                let child = choice((
                    element.map(ElementChild::Element),
                    string.map(ElementChild::Text),
                    expression
                        .clone()
                        .delimited_by(curly_open, curly_close)
                        .map(ElementChild::Expr),
                ))
                .map_with(|child, extra| Spanned::new(child, extra.span()));

                let closing = just(Token::Less)
                    .then(just(Token::Slash))
                    .then(ident)
                    .then(just(Token::Greater));

                let with_children = just(Token::Greater)
                    .ignore_then(child.repeated().collect::<Vec<_>>())
                    .then_ignore(closing)
                    .map(Some);

                let self_closing = just(Token::Slash).then(just(Token::Greater)).to(None);

                just(Token::Less)
                    .ignore_then(ident)
                    .then(attribute.repeated().collect())
                    .then(self_closing.or(with_children))
                    .map(|((tag, attributes), children)| ElementLit {
                        tag,
                        attributes,
                        self_closing: children.is_none(),
                        children: children.unwrap_or_default(),
                    })
            });

            let group = expression
                .clone()
                .delimited_by(round_open, round_close)
                .map(|grouped: Spanned<Expr>| grouped.node);

            let atom = choice((
                function_expression,
                arrow,
                new_expression,
                literal,
                ident.map(Expr::Ident),
                array,
                object,
                element.map(Expr::Element),
                group,
            ))
            .map_with(|node, extra| Spanned::new(node, extra.span()));

            enum PostfixOp {
                Call(Vec<Spanned<Expr>>),
                Dot(String),
                Index(Spanned<Expr>),
            }

            let postfix_op = choice((
                call_arguments.map(PostfixOp::Call),
                just(Token::Dot).ignore_then(ident).map(PostfixOp::Dot),
                expression
                    .clone()
                    .delimited_by(square_open, square_close)
                    .map(PostfixOp::Index),
            ));

            let postfix = atom.foldl_with(postfix_op.repeated(), |object, op, extra| {
                let node = match op {
                    PostfixOp::Call(arguments) => Expr::Call {
                        callee: Box::new(object),
                        arguments,
                    },
                    PostfixOp::Dot(property) => Expr::Member {
                        object: Box::new(object),
                        property: MemberProperty::Dot(property),
                    },
                    PostfixOp::Index(index) => Expr::Member {
                        object: Box::new(object),
                        property: MemberProperty::Index(Box::new(index)),
                    },
                };
                Spanned::new(node, extra.span())
            });

            let unary_op = choice((
                just(Token::Bang).to(UnaryOp::Not),
                just(Token::Minus).to(UnaryOp::Neg),
                just(Token::Typeof).to(UnaryOp::TypeOf),
            ));

            let unary = unary_op.repeated().foldr_with(postfix, |op, operand, extra| {
                Spanned::new(
                    Expr::Unary {
                        op,
                        operand: Box::new(operand),
                    },
                    extra.span(),
                )
            });

            macro_rules! binary {
                ($op:expr) => {
                    |left, _, right, extra: &mut _| {
                        Spanned::new(
                            Expr::Binary {
                                op: $op,
                                left: Box::new(left),
                                right: Box::new(right),
                            },
                            extra.span(),
                        )
                    }
                };
            }

            let binary = unary.pratt((
                infix(left(1), just(Token::OrOr), |left, _, right, extra: &mut _| {
                    Spanned::new(
                        Expr::Logical {
                            op: LogicalOp::Or,
                            left: Box::new(left),
                            right: Box::new(right),
                        },
                        extra.span(),
                    )
                }),
                infix(left(2), just(Token::AndAnd), |left, _, right, extra: &mut _| {
                    Spanned::new(
                        Expr::Logical {
                            op: LogicalOp::And,
                            left: Box::new(left),
                            right: Box::new(right),
                        },
                        extra.span(),
                    )
                }),
                infix(left(3), just(Token::StrictEqual), binary!(BinaryOp::StrictEq)),
                infix(left(3), just(Token::StrictNotEqual), binary!(BinaryOp::StrictNotEq)),
                infix(left(3), just(Token::Equal), binary!(BinaryOp::Eq)),
                infix(left(3), just(Token::NotEqual), binary!(BinaryOp::NotEq)),
                infix(left(4), just(Token::Less), binary!(BinaryOp::Less)),
                infix(left(4), just(Token::LessOrEqual), binary!(BinaryOp::LessEq)),
                infix(left(4), just(Token::Greater), binary!(BinaryOp::Greater)),
                infix(left(4), just(Token::GreaterOrEqual), binary!(BinaryOp::GreaterEq)),
                infix(left(5), just(Token::Plus), binary!(BinaryOp::Add)),
                infix(left(5), just(Token::Minus), binary!(BinaryOp::Sub)),
                infix(left(6), just(Token::Asterisk), binary!(BinaryOp::Mul)),
                infix(left(6), just(Token::Slash), binary!(BinaryOp::Div)),
                infix(left(6), just(Token::Percent), binary!(BinaryOp::Rem)),
            ));

            // Assignment is right-associative and validated late; the
            // target stays an expression node.
            binary
                .then(assign.ignore_then(expression.clone()).or_not())
                .map_with(|(target, value), extra| match value {
                    Some(value) => Spanned::new(
                        Expr::Assign {
                            target: Box::new(target),
                            value: Box::new(value),
                        },
                        extra.span(),
                    ),
                    None => target,
                })
        });

        let pattern = recursive(|pattern| {
            let ident_pattern = ident.map(Pattern::Ident);

            let rest_binding = just(Token::Ellipsis)
                .ignore_then(ident.map_with(|name, extra| Spanned::new(name, extra.span())));

            enum ArrayItem {
                Element(ArrayPatternElement),
                Rest(Spanned<String>),
                Hole,
            }

            let array_element = pattern
                .clone()
                .map_with(|node, extra| Spanned::new(node, extra.span()))
                .then(just(Token::Assign).ignore_then(expression.clone()).or_not())
                .map(|(pattern, default)| ArrayPatternElement { pattern, default });

            let array_pattern = choice((
                rest_binding.clone().map(ArrayItem::Rest),
                array_element.map(ArrayItem::Element),
            ))
            .or_not()
            .map(|item| item.unwrap_or(ArrayItem::Hole))
            .separated_by(comma)
            .collect::<Vec<_>>()
            .delimited_by(square_open, square_close)
            .map(|items| {
                let mut elements = Vec::new();
                let mut rest = None;
                for item in items {
                    match item {
                        ArrayItem::Element(element) => elements.push(Some(element)),
                        ArrayItem::Hole => elements.push(None),
                        ArrayItem::Rest(name) => rest = Some(name),
                    }
                }
                // A trailing hole is an artifact of `or_not`, not an elision.
                if matches!(elements.last(), Some(None)) && rest.is_none() {
                    elements.pop();
                }
                Pattern::Array { elements, rest }
            });

            enum ObjectItem {
                Property(ObjectPatternProperty),
                Rest(Spanned<String>),
            }

            let object_property = ident
                .map_with(|key, extra| Spanned::new(key, extra.span()))
                .then(
                    colon
                        .ignore_then(pattern.clone().map_with(|node, extra| Spanned::new(node, extra.span())))
                        .or_not(),
                )
                .then(just(Token::Assign).ignore_then(expression.clone()).or_not())
                .map(|((key, pattern), default)| ObjectPatternProperty {
                    key,
                    pattern,
                    default,
                });

            let object_pattern = choice((
                rest_binding.map(ObjectItem::Rest),
                object_property.map(ObjectItem::Property),
            ))
            .separated_by(comma)
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(curly_open, curly_close)
            .map(|items| {
                let mut properties = Vec::new();
                let mut rest = None;
                for item in items {
                    match item {
                        ObjectItem::Property(property) => properties.push(property),
                        ObjectItem::Rest(name) => rest = Some(name),
                    }
                }
                Pattern::Object { properties, rest }
            });

            choice((array_pattern, object_pattern, ident_pattern))
        });

        let spanned_pattern = pattern
            .clone()
            .map_with(|node, extra| Spanned::new(node, extra.span()));

        let declarator = spanned_pattern
            .clone()
            .then(assign.ignore_then(expression.clone()).or_not())
            .map(|(pattern, init)| Declarator { pattern, init });

        let decl_kind = select! {
            Token::Let => DeclKind::Let,
            Token::Const => DeclKind::Const,
            Token::Var => DeclKind::Var,
        };

        let var_decl = decl_kind
            .then(declarator.separated_by(comma).at_least(1).collect())
            .map(|(kind, declarators)| Stmt::VarDecl { kind, declarators });

        let block = statement
            .clone()
            .repeated()
            .collect()
            .delimited_by(curly_open, curly_close)
            .map(Stmt::Block);

        // The declaration form reuses the expression parser and takes the
        // definition out, so the two forms cannot drift apart.
        let function_decl = expression.clone().try_map(|expr, span| match expr.node {
            Expr::Function(def) if !def.is_arrow && def.name.is_some() => {
                Ok(Stmt::FunctionDecl(def))
            }
            _ => Err(ParseError::custom(span, "expected a function declaration")),
        });

        let return_stmt = just(Token::Return)
            .ignore_then(expression.clone().or_not())
            .then_ignore(semicolon.or_not())
            .map(Stmt::Return);

        let if_stmt = just(Token::If)
            .ignore_then(expression.clone().delimited_by(round_open, round_close))
            .then(statement.clone().map(Box::new))
            .then(just(Token::Else).ignore_then(statement.clone().map(Box::new)).or_not())
            .map(|((test, consequent), alternate)| Stmt::If {
                test,
                consequent,
                alternate,
            });

        let while_stmt = just(Token::While)
            .ignore_then(expression.clone().delimited_by(round_open, round_close))
            .then(statement.clone().map(Box::new))
            .map(|(test, body)| Stmt::While { test, body });

        let foreach_head = decl_kind
            .or_not()
            .then(spanned_pattern.clone())
            .then(select! {
                Token::Of => IterationKind::Of,
                Token::In => IterationKind::In,
            })
            .then(expression.clone());

        let foreach_stmt = just(Token::For)
            .ignore_then(foreach_head.delimited_by(round_open, round_close))
            .then(statement.clone().map(Box::new))
            .map(|((((kind, pattern), iteration), object), body)| Stmt::ForEach {
                kind,
                pattern,
                iteration,
                object,
                body,
            });

        let classic_for_init = var_decl
            .clone()
            .or(expression.clone().map(Stmt::Expr))
            .map_with(|node, extra| Box::new(Spanned::new(node, extra.span())))
            .or_not();

        let classic_for_head = classic_for_init
            .then_ignore(semicolon)
            .then(expression.clone().or_not())
            .then_ignore(semicolon)
            .then(expression.clone().or_not());

        let classic_for_stmt = just(Token::For)
            .ignore_then(classic_for_head.delimited_by(round_open, round_close))
            .then(statement.clone().map(Box::new))
            .map(|(((init, test), update), body)| Stmt::For {
                init,
                test,
                update,
                body,
            });

        let var_decl_stmt = var_decl.then_ignore(semicolon.or_not());

        let expr_stmt = expression
            .clone()
            .then_ignore(semicolon.or_not())
            .map(Stmt::Expr);

        let empty = semicolon.to(Stmt::Empty);

        choice((
            block,
            function_decl,
            if_stmt,
            while_stmt,
            foreach_stmt,
            classic_for_stmt,
            return_stmt,
            var_decl_stmt,
            empty,
            expr_stmt,
        ))
        .map_with(|node, extra| Spanned::new(node, extra.span()))
    });

    statement.repeated().collect()
}

/// Lex and parse a whole program, collecting owned diagnostics.
pub fn parse_program(code: &str) -> Result<Vec<Spanned<Stmt>>, Vec<Diagnostic>> {
    let (tokens, lex_errors) = lexer().parse(code).into_output_errors();
    let mut diagnostics: Vec<Diagnostic> = lex_errors.iter().map(diagnostic_from_rich).collect();

    let Some(mut tokens) = tokens else {
        return Err(diagnostics);
    };
    tokens.retain(|spanned| !matches!(spanned.node, Token::Comment(_)));

    let (ast, parse_errors) = parser()
        .parse(tokens.map(span_at(code.len()), |Spanned { node, span, .. }| (node, span)))
        .into_output_errors();
    diagnostics.extend(parse_errors.iter().map(diagnostic_from_rich));

    match ast {
        Some(ast) if diagnostics.is_empty() => Ok(ast),
        _ => Err(diagnostics),
    }
}

fn diagnostic_from_rich<T: std::fmt::Display>(error: &ParseError<'_, T>) -> Diagnostic {
    Diagnostic {
        message: error.to_string(),
        start: error.span().start,
        end: error.span().end,
    }
}
