use compact_str::CompactString;

use crate::placeholder::Placeholder;
use crate::sql::tokens::Token;
use crate::value::Value;

/// A bound parameter: where it renders and what it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub placeholder: Placeholder,
    pub value: Value,
}

impl Param {
    #[inline]
    pub fn new(placeholder: Placeholder, value: impl Into<Value>) -> Self {
        Self {
            placeholder,
            value: value.into(),
        }
    }
}

/// A SQL chunk represents a part of an SQL statement.
///
/// - `Token` - keywords and punctuation (SELECT, FROM, =, `(`)
/// - `Ident` - a checked identifier, optionally qualified (`t.name`)
/// - `Raw` - text rendered as-is (casts, literal keys)
/// - `Number` - an unsigned literal (LIMIT/OFFSET)
/// - `Func` - a function name, renders as `name(`
/// - `Param` - a bound value
#[derive(Debug, Clone, PartialEq)]
pub enum SqlChunk {
    Token(Token),
    Ident(CompactString),
    Raw(CompactString),
    Number(u64),
    Func(&'static str),
    Param(Param),
}

impl SqlChunk {
    /// Writes everything except parameters, which depend on the render target.
    pub(crate) fn write(&self, buf: &mut String) {
        match self {
            SqlChunk::Token(token) => buf.push_str(token.as_str()),
            SqlChunk::Ident(name) | SqlChunk::Raw(name) => buf.push_str(name),
            SqlChunk::Number(n) => {
                let _ = core::fmt::Write::write_fmt(buf, format_args!("{n}"));
            }
            SqlChunk::Func(name) => {
                buf.push_str(name);
                buf.push('(');
            }
            SqlChunk::Param(param) => {
                let _ = core::fmt::Write::write_fmt(buf, format_args!("{}", param.placeholder));
            }
        }
    }
}

/// Spacing between two adjacent chunks.
#[inline]
pub(crate) fn chunk_needs_space(current: &SqlChunk, next: &SqlChunk) -> bool {
    match (current, next) {
        (SqlChunk::Token(Token::LPAREN) | SqlChunk::Func(_), _) => false,
        (_, SqlChunk::Token(Token::RPAREN | Token::COMMA)) => false,
        (_, SqlChunk::Raw(text)) if text.starts_with("::") => false,
        _ => true,
    }
}

// ==================== From implementations ====================

impl From<Token> for SqlChunk {
    #[inline]
    fn from(value: Token) -> Self {
        Self::Token(value)
    }
}

impl From<Param> for SqlChunk {
    #[inline]
    fn from(value: Param) -> Self {
        Self::Param(value)
    }
}
