// Parser for the text form of the graph interchange format.
//
// Parses a token stream (from the lexer) into a generic field tree. Mapping the
// tree onto graph definitions happens in `graph_def`. Uses chumsky combinators.
//
// Preconditions: input is a valid token stream from `lexer::lex()`.
// Postconditions: returns the field tree plus any parse errors (non-fatal).
// Failure modes: syntax errors produce `Rich` diagnostics.
// Side effects: none.

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;
use chumsky::span::SimpleSpan;

use crate::error::{Error, Result};
use crate::lexer::Token;

/// One `name: value` or `name { ... }` entry.
#[derive(Debug, Clone, PartialEq)]
pub struct TextField {
    pub name: String,
    pub value: TextValue,
    pub span: SimpleSpan,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TextValue {
    Int(i64),
    Float(f64),
    Str(String),
    /// Enum values and bare words (`DT_FLOAT`, `true`).
    Ident(String),
    Message(Vec<TextField>),
    List(Vec<TextValue>),
}

/// Result of parsing: field tree plus any errors.
#[derive(Debug)]
pub struct ParseResult {
    pub fields: Option<Vec<TextField>>,
    pub errors: Vec<Rich<'static, Token, SimpleSpan>>,
}

/// Parse a text-format message. Lexes then parses.
pub fn parse(source: &str) -> ParseResult {
    let lex_result = crate::lexer::lex(source);
    let len = source.len();

    let token_iter = lex_result.tokens.into_iter().map(|(tok, span)| {
        let cspan: SimpleSpan = (span.start..span.end).into();
        (tok, cspan)
    });
    let eoi: SimpleSpan = (len..len).into();
    let stream = Stream::from_iter(token_iter).map(eoi, |(t, s): (_, _)| (t, s));

    let parser = message_body().then_ignore(end());
    let (fields, parse_errors) = parser.parse(stream).into_output_errors();

    let mut all_errors: Vec<Rich<'static, Token, SimpleSpan>> = lex_result
        .errors
        .into_iter()
        .map(|e| {
            let span: SimpleSpan = (e.span.start..e.span.end).into();
            Rich::custom(span, e.message)
        })
        .collect();
    all_errors.extend(parse_errors.into_iter().map(|e| e.into_owned()));

    ParseResult {
        fields,
        errors: all_errors,
    }
}

/// Parse and fold all errors into one `Error::Parse` with line:column positions.
pub fn parse_text(source: &str) -> Result<Vec<TextField>> {
    let result = parse(source);
    if let Some(first) = result.errors.first() {
        let (line, col) = line_col(source, first.span().start);
        let mut message = format!("{}:{}: {}", line, col, first);
        if result.errors.len() > 1 {
            message.push_str(&format!(" (and {} more)", result.errors.len() - 1));
        }
        return Err(Error::Parse { message });
    }
    result.fields.ok_or_else(|| Error::Parse {
        message: "empty parse result".to_string(),
    })
}

fn line_col(source: &str, offset: usize) -> (usize, usize) {
    let before = &source[..offset.min(source.len())];
    let line = before.matches('\n').count() + 1;
    let col = before.len() - before.rfind('\n').map(|i| i + 1).unwrap_or(0) + 1;
    (line, col)
}

// ── Grammar ──
//
// body    := (field [';' | ','])*
// field   := NAME ':'? '{' body '}' | NAME ':'? '<' body '>'
//          | NAME ':' '[' (scalar | message),* ']' | NAME ':' scalar

fn message_body<'tokens, I>(
) -> impl Parser<'tokens, I, Vec<TextField>, extra::Err<Rich<'tokens, Token, SimpleSpan>>> + Clone
where
    I: ValueInput<'tokens, Token = Token, Span = SimpleSpan>,
{
    recursive(|body| {
        let name = select! { Token::Ident(s) => s };

        let scalar = select! {
            Token::Int(v) => TextValue::Int(v),
            Token::Float(v) => TextValue::Float(v),
            Token::Str(s) => TextValue::Str(s),
            Token::Ident(s) => TextValue::Ident(s),
        };

        let message = choice((
            body.clone()
                .delimited_by(just(Token::LBrace), just(Token::RBrace)),
            body.delimited_by(just(Token::LAngle), just(Token::RAngle)),
        ))
        .map(TextValue::Message);

        let list = scalar
            .or(message.clone())
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::LBracket), just(Token::RBracket))
            .map(TextValue::List);

        let value = choice((
            just(Token::Colon).or_not().ignore_then(message),
            just(Token::Colon).ignore_then(list),
            just(Token::Colon).ignore_then(scalar),
        ));

        name.then(value)
            .map_with(|(name, value), e| TextField {
                name,
                value,
                span: e.span(),
            })
            .then_ignore(just(Token::Semi).or(just(Token::Comma)).or_not())
            .repeated()
            .collect::<Vec<_>>()
    })
}

// ── Tests ──
