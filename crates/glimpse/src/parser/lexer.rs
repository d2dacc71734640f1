use super::{ParseError, Spanned};
use chumsky::prelude::*;
use std::borrow::Cow;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Token<'code> {
    BracketRoundOpen,
    BracketRoundClose,
    BracketCurlyOpen,
    BracketCurlyClose,
    BracketSquareOpen,
    BracketSquareClose,
    Comment(&'code str),
    Number(f64),
    /// Digits of a bigint literal, without the trailing `n`.
    BigInt(&'code str),
    /// Raw string contents without the quotes; escapes are unprocessed.
    Str(&'code str),
    Ident(&'code str),
    Comma,
    Semicolon,
    Colon,
    Dot,
    Ellipsis,
    Arrow,
    StrictEqual,
    StrictNotEqual,
    Equal,
    NotEqual,
    GreaterOrEqual,
    Greater,
    LessOrEqual,
    Less,
    Assign,
    Plus,
    Minus,
    Asterisk,
    Slash,
    Percent,
    AndAnd,
    OrOr,
    Bang,
    Let,
    Const,
    Var,
    Function,
    Return,
    For,
    Of,
    In,
    If,
    Else,
    While,
    New,
    True,
    False,
    Null,
    Undefined,
    Async,
    Typeof,
    This,
}

impl<'code> Token<'code> {
    pub fn into_cow_str(self) -> Cow<'code, str> {
        match self {
            Self::BracketRoundOpen => "(".into(),
            Self::BracketRoundClose => ")".into(),
            Self::BracketCurlyOpen => "{".into(),
            Self::BracketCurlyClose => "}".into(),
            Self::BracketSquareOpen => "[".into(),
            Self::BracketSquareClose => "]".into(),
            Self::Comment(comment) => comment.into(),
            Self::Number(number) => number.to_string().into(),
            Self::BigInt(digits) => format!("{digits}n").into(),
            Self::Str(text) => format!("'{text}'").into(),
            Self::Ident(identifier) => identifier.into(),
            Self::Comma => ",".into(),
            Self::Semicolon => ";".into(),
            Self::Colon => ":".into(),
            Self::Dot => ".".into(),
            Self::Ellipsis => "...".into(),
            Self::Arrow => "=>".into(),
            Self::StrictEqual => "===".into(),
            Self::StrictNotEqual => "!==".into(),
            Self::Equal => "==".into(),
            Self::NotEqual => "!=".into(),
            Self::GreaterOrEqual => ">=".into(),
            Self::Greater => ">".into(),
            Self::LessOrEqual => "<=".into(),
            Self::Less => "<".into(),
            Self::Assign => "=".into(),
            Self::Plus => "+".into(),
            Self::Minus => "-".into(),
            Self::Asterisk => "*".into(),
            Self::Slash => "/".into(),
            Self::Percent => "%".into(),
            Self::AndAnd => "&&".into(),
            Self::OrOr => "||".into(),
            Self::Bang => "!".into(),
            Self::Let => "let".into(),
            Self::Const => "const".into(),
            Self::Var => "var".into(),
            Self::Function => "function".into(),
            Self::Return => "return".into(),
            Self::For => "for".into(),
            Self::Of => "of".into(),
            Self::In => "in".into(),
            Self::If => "if".into(),
            Self::Else => "else".into(),
            Self::While => "while".into(),
            Self::New => "new".into(),
            Self::True => "true".into(),
            Self::False => "false".into(),
            Self::Null => "null".into(),
            Self::Undefined => "undefined".into(),
            Self::Async => "async".into(),
            Self::Typeof => "typeof".into(),
            Self::This => "this".into(),
        }
    }
}

impl fmt::Display for Token<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.into_cow_str())
    }
}

pub fn lexer<'code>()
-> impl Parser<'code, &'code str, Vec<Spanned<Token<'code>>>, extra::Err<ParseError<'code, char>>> {
    let bracket = choice((
        just('(').to(Token::BracketRoundOpen),
        just(')').to(Token::BracketRoundClose),
        just('{').to(Token::BracketCurlyOpen),
        just('}').to(Token::BracketCurlyClose),
        just('[').to(Token::BracketSquareOpen),
        just(']').to(Token::BracketSquareClose),
    ));

    let line_comment = just("//")
        .ignore_then(any().and_is(text::newline().not()).repeated())
        .to_slice()
        .map(Token::Comment);

    let block_comment = just("/*")
        .ignore_then(any().and_is(just("*/").not()).repeated())
        .then_ignore(just("*/"))
        .to_slice()
        .map(Token::Comment);

    let comment = line_comment.or(block_comment);

    // Longest operators first; `===` must win over `==` and `=`.
    let operator = choice((
        just("===").to(Token::StrictEqual),
        just("!==").to(Token::StrictNotEqual),
        just("==").to(Token::Equal),
        just("!=").to(Token::NotEqual),
        just("=>").to(Token::Arrow),
        just(">=").to(Token::GreaterOrEqual),
        just("<=").to(Token::LessOrEqual),
        just("&&").to(Token::AndAnd),
        just("||").to(Token::OrOr),
        just("...").to(Token::Ellipsis),
        just('>').to(Token::Greater),
        just('<').to(Token::Less),
        just('=').to(Token::Assign),
        just('+').to(Token::Plus),
        just('-').to(Token::Minus),
        just('*').to(Token::Asterisk),
        just('/').to(Token::Slash),
        just('%').to(Token::Percent),
        just('!').to(Token::Bang),
    ));

    let punctuation = choice((
        just(',').to(Token::Comma),
        just(';').to(Token::Semicolon),
        just(':').to(Token::Colon),
        just('.').to(Token::Dot),
    ));

    let bigint = text::int(10).then_ignore(just('n')).map(Token::BigInt);

    let number = text::int(10)
        .then(just('.').then(text::digits(10)).or_not())
        .then(
            one_of("eE")
                .then(one_of("+-").or_not())
                .then(text::digits(10))
                .or_not(),
        )
        .to_slice()
        .from_str()
        .unwrapped()
        .map(Token::Number);

    let single_quoted = just('\'')
        .ignore_then(
            choice((just('\\').then(any()).ignored(), none_of("\\'").ignored()))
                .repeated()
                .to_slice(),
        )
        .then_ignore(just('\''))
        .map(Token::Str);

    let double_quoted = just('"')
        .ignore_then(
            choice((just('\\').then(any()).ignored(), none_of("\\\"").ignored()))
                .repeated()
                .to_slice(),
        )
        .then_ignore(just('"'))
        .map(Token::Str);

    let string = single_quoted.or(double_quoted);

    let word = any()
        .filter(|character: &char| {
            character.is_ascii_alphabetic() || *character == '_' || *character == '$'
        })
        .then(
            any()
                .filter(|character: &char| {
                    character.is_ascii_alphanumeric() || *character == '_' || *character == '$'
                })
                .repeated(),
        )
        .to_slice()
        .map(|word| match word {
            "let" => Token::Let,
            "const" => Token::Const,
            "var" => Token::Var,
            "function" => Token::Function,
            "return" => Token::Return,
            "for" => Token::For,
            "of" => Token::Of,
            "in" => Token::In,
            "if" => Token::If,
            "else" => Token::Else,
            "while" => Token::While,
            "new" => Token::New,
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            "undefined" => Token::Undefined,
            "async" => Token::Async,
            "typeof" => Token::Typeof,
            "this" => Token::This,
            identifier => Token::Ident(identifier),
        });

    let token = choice((
        comment, bracket, bigint, number, string, word, operator, punctuation,
    ));

    token
        .map_with(|token, extra| Spanned {
            node: token,
            span: extra.span(),
            synthetic: false,
        })
        .padded_by(text::whitespace())
        .recover_with(skip_then_retry_until(any().ignored(), end()))
        .repeated()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chumsky::prelude::Parser;

    fn lex(code: &str) -> Vec<Token<'_>> {
        lexer()
            .parse(code)
            .output()
            .unwrap()
            .iter()
            .map(|spanned| spanned.node)
            .collect()
    }

    #[test]
    fn numbers_and_bigints() {
        assert_eq!(lex("42"), vec![Token::Number(42.0)]);
        assert_eq!(lex("3.25"), vec![Token::Number(3.25)]);
        assert_eq!(lex("1e3"), vec![Token::Number(1000.0)]);
        assert_eq!(lex("123n"), vec![Token::BigInt("123")]);
    }

    #[test]
    fn strings_keep_raw_escapes() {
        assert_eq!(lex(r#"'a\'b'"#), vec![Token::Str(r"a\'b")]);
        assert_eq!(lex(r#""x y""#), vec![Token::Str("x y")]);
    }

    #[test]
    fn keywords_vs_identifiers() {
        assert_eq!(lex("const"), vec![Token::Const]);
        assert_eq!(lex("constant"), vec![Token::Ident("constant")]);
        assert_eq!(lex("$probe_1"), vec![Token::Ident("$probe_1")]);
    }

    #[test]
    fn operator_longest_match() {
        assert_eq!(lex("==="), vec![Token::StrictEqual]);
        assert_eq!(lex("=>"), vec![Token::Arrow]);
        assert_eq!(
            lex("a<=b"),
            vec![Token::Ident("a"), Token::LessOrEqual, Token::Ident("b")]
        );
    }

    #[test]
    fn comments_are_single_tokens() {
        assert_eq!(lex("// trailing"), vec![Token::Comment("// trailing")]);
        assert_eq!(lex("/* a\nb */"), vec![Token::Comment("/* a\nb */")]);
    }
}
