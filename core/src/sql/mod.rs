mod chunk;
mod tokens;

pub use chunk::*;
pub use tokens::*;

use core::fmt::{self, Display, Write};
use std::sync::LazyLock;

use compact_str::CompactString;
use hashbrown::HashMap;
use regex::Regex;
use smallvec::SmallVec;

use crate::error::{QuarryError, Result};
use crate::placeholder::{Placeholder, Placeholders};
use crate::row::Row;
use crate::value::Value;

static IDENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("valid regex")
});

static NAMED_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(::)|:([A-Za-z_][A-Za-z0-9_]*)").expect("valid regex"));

/// Checks that `name` is a plain identifier, optionally qualified once (`t.name`).
///
/// # Errors
///
/// Returns [`QuarryError::InvalidIdentifier`] for anything else.
pub fn validate_ident(name: &str) -> Result<&str> {
    if IDENT.is_match(name) {
        Ok(name)
    } else {
        Err(QuarryError::InvalidIdentifier(name.to_string()))
    }
}

/// Rendered statement with `:name` placeholders and a name → value list.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedSql {
    pub sql: String,
    pub params: Vec<(String, Value)>,
}

impl NamedSql {
    /// Looks up a bound value by parameter name.
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.params
            .iter()
            .find_map(|(key, value)| (key == name).then_some(value))
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(key, _)| key.as_str())
    }
}

/// Rendered statement with `$n` placeholders and positional values, ready for the driver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuiltSql {
    pub sql: String,
    pub params: Vec<Value>,
}

impl BuiltSql {
    /// Converts hand-written SQL with `:name` placeholders to positional form.
    ///
    /// `::type` casts are left alone. A name used twice binds once.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::InvalidFilterValue`] when a placeholder has no value in `params`.
    pub fn from_named(text: &str, params: &Row) -> Result<Self> {
        let mut positions: HashMap<&str, usize> = HashMap::new();
        let mut values = Vec::new();
        let mut sql = String::with_capacity(text.len());
        let mut last = 0;

        for caps in NAMED_PARAM.captures_iter(text) {
            let Some(name) = caps.get(2) else {
                continue;
            };
            sql.push_str(&text[last..name.start() - 1]);
            last = name.end();

            let index = match positions.get(name.as_str()) {
                Some(index) => *index,
                None => {
                    let value = params.get(name.as_str()).ok_or_else(|| {
                        QuarryError::InvalidFilterValue(format!(
                            "Missing value for placeholder \":{}\"",
                            name.as_str()
                        ))
                    })?;
                    values.push(value.clone());
                    positions.insert(name.as_str(), values.len());
                    values.len()
                }
            };
            let _ = write!(sql, "${index}");
        }
        sql.push_str(&text[last..]);

        Ok(Self {
            sql,
            params: values,
        })
    }
}

enum Target {
    Named,
    Positional,
}

/// SQL fragment builder with flat chunk storage.
///
/// Uses `SmallVec<[SqlChunk; 8]>` for inline storage of typical fragments
/// without heap allocation. Placeholder names are assigned when the fragment
/// is rendered, never while it is being built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sql {
    pub chunks: SmallVec<[SqlChunk; 8]>,
}

impl Sql {
    // ==================== constructors ====================

    /// Creates an empty SQL fragment
    #[inline]
    pub const fn empty() -> Self {
        Self {
            chunks: SmallVec::new_const(),
        }
    }

    /// Creates SQL with a single token
    #[inline]
    pub fn token(t: Token) -> Self {
        Self {
            chunks: smallvec::smallvec![SqlChunk::Token(t)],
        }
    }

    /// Creates SQL with an identifier. Callers validate user-supplied names
    /// with [`validate_ident`] first.
    #[inline]
    pub fn ident(name: impl Into<CompactString>) -> Self {
        Self {
            chunks: smallvec::smallvec![SqlChunk::Ident(name.into())],
        }
    }

    /// Creates SQL with raw text
    #[inline]
    pub fn raw(text: impl Into<CompactString>) -> Self {
        Self {
            chunks: smallvec::smallvec![SqlChunk::Raw(text.into())],
        }
    }

    #[inline]
    pub fn number(value: u64) -> Self {
        Self {
            chunks: smallvec::smallvec![SqlChunk::Number(value)],
        }
    }

    /// Creates a parameter named `{label}_{n}` at render time
    #[inline]
    pub fn param(label: &str, value: impl Into<Value>) -> Self {
        Self {
            chunks: smallvec::smallvec![SqlChunk::Param(Param::new(
                Placeholder::labeled(label),
                value
            ))],
        }
    }

    /// Creates a parameter that keeps `name` verbatim
    #[inline]
    pub fn fixed_param(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            chunks: smallvec::smallvec![SqlChunk::Param(Param::new(
                Placeholder::fixed(name),
                value
            ))],
        }
    }

    /// Creates SQL for a function call: name(args)
    #[inline]
    pub fn func(name: &'static str, args: Sql) -> Self {
        let mut sql = Self {
            chunks: smallvec::smallvec![SqlChunk::Func(name)],
        };
        sql.chunks.extend(args.chunks);
        sql.push(Token::RPAREN)
    }

    // ==================== builder methods ====================

    /// Append another SQL fragment (flat extend)
    #[inline]
    pub fn append(mut self, other: impl Into<Sql>) -> Self {
        self.append_mut(other);
        self
    }

    #[inline]
    pub fn append_mut(&mut self, other: impl Into<Sql>) {
        let other = other.into();
        if self.chunks.is_empty() {
            self.chunks = other.chunks;
        } else {
            self.chunks.extend(other.chunks);
        }
    }

    /// Push a single chunk
    #[inline]
    pub fn push(mut self, chunk: impl Into<SqlChunk>) -> Self {
        self.chunks.push(chunk.into());
        self
    }

    #[inline]
    pub fn push_mut(&mut self, chunk: impl Into<SqlChunk>) {
        self.chunks.push(chunk.into());
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    // ==================== combinators ====================

    /// Joins multiple SQL fragments with a separator
    pub fn join<T>(sqls: T, separator: Token) -> Sql
    where
        T: IntoIterator<Item = Sql>,
    {
        let mut iter = sqls.into_iter();
        let Some(mut result) = iter.next() else {
            return Sql::empty();
        };
        for item in iter {
            result.chunks.push(SqlChunk::Token(separator));
            result.chunks.extend(item.chunks);
        }
        result
    }

    /// Comma-separated identifiers
    pub fn ident_list<I, S>(names: I) -> Sql
    where
        I: IntoIterator<Item = S>,
        S: Into<CompactString>,
    {
        Sql::join(names.into_iter().map(Sql::ident), Token::COMMA)
    }

    /// Wrap in parentheses: (self)
    #[inline]
    pub fn parens(self) -> Self {
        Sql::token(Token::LPAREN).append(self).push(Token::RPAREN)
    }

    /// Creates an aliased version: self AS name
    #[inline]
    pub fn alias(self, name: impl Into<CompactString>) -> Sql {
        self.push(Token::AS).push(SqlChunk::Ident(name.into()))
    }

    // ==================== output methods ====================

    /// Returns an iterator over bound values in render order
    pub fn params(&self) -> impl Iterator<Item = &Value> {
        self.chunks.iter().filter_map(|chunk| match chunk {
            SqlChunk::Param(param) => Some(&param.value),
            _ => None,
        })
    }

    /// Renders with `:name` placeholders. A fixed name bound twice keeps
    /// its first value here; [`Sql::build`] rejects the conflict.
    pub fn to_named(&self) -> NamedSql {
        let (sql, params, _) = self.render(Target::Named);
        NamedSql { sql, params }
    }

    /// Renders with `$n` placeholders for the driver.
    ///
    /// # Errors
    ///
    /// [`QuarryError::InvalidFilterValue`] when one fixed placeholder name is
    /// bound to two different values.
    pub fn build(&self) -> Result<BuiltSql> {
        let (sql, params, conflict) = self.render(Target::Positional);
        if let Some(name) = conflict {
            return Err(QuarryError::InvalidFilterValue(format!(
                "placeholder :{name} is bound to two different values"
            )));
        }
        Ok(BuiltSql {
            sql,
            params: params.into_iter().map(|(_, value)| value).collect(),
        })
    }

    /// Returns the text, the deduplicated params and the first fixed name
    /// seen with two different values.
    fn render(&self, target: Target) -> (String, Vec<(String, Value)>, Option<String>) {
        let mut buf = String::with_capacity(self.chunks.len().saturating_mul(8).max(64));
        let mut params: Vec<(String, Value)> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut conflict = None;
        let mut counter = Placeholders::new();

        for (i, chunk) in self.chunks.iter().enumerate() {
            match chunk {
                SqlChunk::Param(param) => {
                    let name = counter.resolve(&param.placeholder);
                    let index = match positions.get(&name) {
                        Some(&index) => {
                            if conflict.is_none() && params[index - 1].1 != param.value {
                                conflict = Some(name.clone());
                            }
                            index
                        }
                        None => {
                            params.push((name.clone(), param.value.clone()));
                            positions.insert(name.clone(), params.len());
                            params.len()
                        }
                    };
                    match target {
                        Target::Named => {
                            buf.push(':');
                            buf.push_str(&name);
                        }
                        Target::Positional => {
                            let _ = write!(buf, "${index}");
                        }
                    }
                }
                _ => chunk.write(&mut buf),
            }

            if let Some(next) = self.chunks.get(i + 1)
                && chunk_needs_space(chunk, next)
            {
                buf.push(' ');
            }
        }

        (buf, params, conflict)
    }
}

// ==================== trait implementations ====================

impl From<Token> for Sql {
    fn from(value: Token) -> Self {
        Sql::token(value)
    }
}

impl Display for Sql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_named().sql)
    }
}

impl IntoIterator for Sql {
    type Item = SqlChunk;
    type IntoIter = smallvec::IntoIter<[SqlChunk; 8]>;

    fn into_iter(self) -> Self::IntoIter {
        self.chunks.into_iter()
    }
}
