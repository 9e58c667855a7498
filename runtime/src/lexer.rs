// Lexer for the text form of the graph interchange format.
//
// The text form is a protobuf-text-like notation: `field: value`,
// `field { ... }` and `field: [v, v]`. Uses the `logos` crate for DFA-based lexing.
//
// Preconditions: input is valid UTF-8.
// Postconditions: returns all tokens with byte-offset spans, plus any lex errors.
// Failure modes: unrecognized characters produce `LexError`; lexing continues.
// Side effects: none.

use logos::Logos;
use std::fmt;

/// Byte-offset span in source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A lexer error with location.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub span: Span,
    pub message: String,
}

/// Result of lexing: tokens plus any errors (non-fatal).
#[derive(Debug)]
pub struct LexResult {
    pub tokens: Vec<(Token, Span)>,
    pub errors: Vec<LexError>,
}

/// Text-format tokens. Newlines are not significant.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+|#[^\n]*")]
pub enum Token {
    // ── Symbols ──
    #[token(":")]
    Colon,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("<")]
    LAngle,
    #[token(">")]
    RAngle,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,

    // ── Literals ──
    //
    // Float needs a fraction or exponent, so a bare digit run is always Int.
    #[regex(r"-?[0-9]+\.[0-9]*([eE][+-]?[0-9]+)?", parse_float)]
    #[regex(r"-?[0-9]+[eE][+-]?[0-9]+", parse_float)]
    #[regex(r"-?\.[0-9]+([eE][+-]?[0-9]+)?", parse_float)]
    Float(f64),

    #[regex(r"-?[0-9]+", parse_int)]
    Int(i64),

    /// Single- or double-quoted string with C-style escapes.
    #[regex(r#""([^"\\\n]|\\.)*""#, parse_string)]
    #[regex(r#"'([^'\\\n]|\\.)*'"#, parse_string)]
    Str(String),

    /// Field names and enum values (`DT_FLOAT`, `true`, `inf`).
    #[regex(r"-?[a-zA-Z_][a-zA-Z0-9_.]*", |lex| lex.slice().to_string())]
    Ident(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Colon => write!(f, ":"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LAngle => write!(f, "<"),
            Token::RAngle => write!(f, ">"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Semi => write!(f, ";"),
            Token::Float(v) => write!(f, "{v}"),
            Token::Int(v) => write!(f, "{v}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Ident(s) => write!(f, "{s}"),
        }
    }
}

// ── Callbacks ──

fn parse_float(lex: &mut logos::Lexer<'_, Token>) -> Option<f64> {
    lex.slice().parse().ok()
}

fn parse_int(lex: &mut logos::Lexer<'_, Token>) -> Option<i64> {
    lex.slice().parse().ok()
}

fn parse_string(lex: &mut logos::Lexer<'_, Token>) -> Option<String> {
    let slice = lex.slice();
    let inner = &slice[1..slice.len() - 1];
    let mut result = String::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next()? {
            '"' => result.push('"'),
            '\'' => result.push('\''),
            '\\' => result.push('\\'),
            'n' => result.push('\n'),
            't' => result.push('\t'),
            'r' => result.push('\r'),
            d @ '0'..='7' => {
                // Octal escape, up to three digits.
                let mut value = d.to_digit(8)?;
                for _ in 0..2 {
                    match chars.peek().and_then(|c| c.to_digit(8)) {
                        Some(v) => {
                            value = value * 8 + v;
                            chars.next();
                        }
                        None => break,
                    }
                }
                result.push(char::from_u32(value)?);
            }
            _ => return None,
        }
    }
    Some(result)
}

// ── Public API ──

/// Lex a text-format graph into tokens.
///
/// Lexing is non-fatal: errors are collected and the lexer continues past
/// bad characters.
pub fn lex(source: &str) -> LexResult {
    let lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    for (result, range) in lexer.spanned() {
        let span = Span {
            start: range.start,
            end: range.end,
        };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => errors.push(LexError {
                span,
                message: format!("unexpected character: {:?}", &source[span.start..span.end]),
            }),
        }
    }

    LexResult { tokens, errors }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        let result = lex(source);
        assert!(result.errors.is_empty(), "lex errors: {:?}", result.errors);
        result.tokens.into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn node_header() {
        assert_eq!(
            tokens("node { name: \"A\" }"),
            vec![
                Token::Ident("node".into()),
                Token::LBrace,
                Token::Ident("name".into()),
                Token::Colon,
                Token::Str("A".into()),
                Token::RBrace,
            ]
        );
    }

    #[test]
    fn numbers() {
        assert_eq!(
            tokens("1 -2 1.5 2e3 -.5"),
            vec![
                Token::Int(1),
                Token::Int(-2),
                Token::Float(1.5),
                Token::Float(2000.0),
                Token::Float(-0.5),
            ]
        );
    }

    #[test]
    fn enums_and_comments() {
        assert_eq!(
            tokens("type: DT_FLOAT # trailing\n b: true"),
            vec![
                Token::Ident("type".into()),
                Token::Colon,
                Token::Ident("DT_FLOAT".into()),
                Token::Ident("b".into()),
                Token::Colon,
                Token::Ident("true".into()),
            ]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            tokens(r#""a\"b\\c\n" 'x\'y' "\101""#),
            vec![
                Token::Str("a\"b\\c\n".into()),
                Token::Str("x'y".into()),
                Token::Str("A".into()),
            ]
        );
    }

    #[test]
    fn bad_character_is_reported_and_skipped() {
        let result = lex("a: $ 1");
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.tokens.len(), 3);
    }
}
