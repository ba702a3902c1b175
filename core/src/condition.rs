//! Django-style `field__lookup` filters rendered into WHERE fragments.
//!
//! ```
//! use quarry_core::{ConditionBuilder, Filters};
//!
//! let filters = Filters::new().with("age__gte", 18).with("name__icontains", "ann");
//! let cond = ConditionBuilder::base().build(&filters).unwrap().unwrap();
//! let named = cond.to_named();
//! assert_eq!(named.sql, "t.age >= :t_age_0 AND t.name ILIKE :t_name_1");
//! ```

use core::fmt;
use core::ops::{BitAnd, BitOr};

use crate::error::{QuarryError, Result};
use crate::row::Row;
use crate::sql::{BuiltSql, NamedSql, Sql, SqlChunk, Token, validate_ident};
use crate::value::Value;

/// Keyword-style filter arguments: `field[__lookup]` → value, in call order.
pub type Filters = Row;

/// Alias of the base table in every generated statement.
pub const BASE_ALIAS: &str = "t";
/// Alias of the joined table in `select_related` statements.
pub const RELATED_ALIAS: &str = "r";

/// A filter lookup suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lookup {
    Exact,
    Gt,
    Lt,
    Gte,
    Lte,
    Ne,
    In,
    IsNull,
    Contains,
    IContains,
    StartsWith,
    IStartsWith,
    EndsWith,
    IEndsWith,
}

impl Lookup {
    /// Every suffix accepted after `__`.
    pub const SUPPORTED: &'static [&'static str] = &[
        "gt",
        "lt",
        "gte",
        "lte",
        "ne",
        "in",
        "isnull",
        "contains",
        "icontains",
        "startswith",
        "istartswith",
        "endswith",
        "iendswith",
    ];

    pub fn parse(suffix: &str) -> Option<Self> {
        Some(match suffix {
            "gt" => Lookup::Gt,
            "lt" => Lookup::Lt,
            "gte" => Lookup::Gte,
            "lte" => Lookup::Lte,
            "ne" => Lookup::Ne,
            "in" => Lookup::In,
            "isnull" => Lookup::IsNull,
            "contains" => Lookup::Contains,
            "icontains" => Lookup::IContains,
            "startswith" => Lookup::StartsWith,
            "istartswith" => Lookup::IStartsWith,
            "endswith" => Lookup::EndsWith,
            "iendswith" => Lookup::IEndsWith,
            _ => return None,
        })
    }

    const fn comparison(self) -> Option<Token> {
        match self {
            Lookup::Exact => Some(Token::EQ),
            Lookup::Gt => Some(Token::GT),
            Lookup::Lt => Some(Token::LT),
            Lookup::Gte => Some(Token::GE),
            Lookup::Lte => Some(Token::LE),
            Lookup::Ne => Some(Token::NE),
            _ => None,
        }
    }

    /// LIKE operator and wildcard placement (leading, trailing).
    const fn pattern(self) -> Option<(Token, bool, bool)> {
        match self {
            Lookup::Contains => Some((Token::LIKE, true, true)),
            Lookup::IContains => Some((Token::ILIKE, true, true)),
            Lookup::StartsWith => Some((Token::LIKE, false, true)),
            Lookup::IStartsWith => Some((Token::ILIKE, false, true)),
            Lookup::EndsWith => Some((Token::LIKE, true, false)),
            Lookup::IEndsWith => Some((Token::ILIKE, true, false)),
            _ => None,
        }
    }
}

// ==================== Condition ====================

/// An immutable boolean SQL fragment together with its bound values.
///
/// Parameters carry labels, not final names; names are assigned once the
/// whole statement is rendered, so conditions built separately can be
/// combined freely.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    sql: Sql,
}

impl Condition {
    #[inline]
    pub fn from_sql(sql: Sql) -> Self {
        Self { sql }
    }

    /// A condition that matches every row. Use it to opt in to an
    /// update or delete of the whole table.
    pub fn always() -> Self {
        Self::from_sql(Sql::token(Token::TRUE))
    }

    /// Bypass mode: a hand-written expression with `:name` placeholders.
    ///
    /// ```
    /// use quarry_core::{Condition, Row};
    ///
    /// let cond = Condition::raw("lower(t.email) = :email", Row::new().with("email", "a@b.c")).unwrap();
    /// assert_eq!(cond.to_named().sql, "lower(t.email) = :email");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::InvalidFilterValue`] when a placeholder has no value.
    pub fn raw(expression: &str, params: Row) -> Result<Self> {
        // Validates that every placeholder is bound.
        BuiltSql::from_named(expression, &params)?;

        let mut sql = Sql::empty();
        let mut rest = expression;
        while let Some(start) = find_placeholder(rest) {
            let head = rest[..start].trim();
            if !head.is_empty() {
                sql.push_mut(SqlChunk::Raw(head.into()));
            }
            let tail = &rest[start + 1..];
            let len = tail
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(tail.len());
            let name = &tail[..len];
            let value = params.get(name).cloned().unwrap_or_default();
            sql.append_mut(Sql::fixed_param(name, value));
            rest = &tail[len..];
        }
        let tail = rest.trim();
        if !tail.is_empty() {
            sql.push_mut(SqlChunk::Raw(tail.into()));
        }
        Ok(Self::from_sql(sql))
    }

    #[inline]
    pub fn sql(&self) -> &Sql {
        &self.sql
    }

    #[inline]
    pub fn into_sql(self) -> Sql {
        self.sql
    }

    /// `(self) AND (other)`
    pub fn and(self, other: Condition) -> Condition {
        self.combine(Token::AND, other)
    }

    /// `(self) OR (other)`
    pub fn or(self, other: Condition) -> Condition {
        self.combine(Token::OR, other)
    }

    fn combine(self, op: Token, other: Condition) -> Condition {
        Condition::from_sql(self.sql.parens().push(op).append(other.sql.parens()))
    }

    /// Folds conditions with AND, without wrapping a single operand.
    pub fn all(conditions: impl IntoIterator<Item = Condition>) -> Option<Condition> {
        conditions.into_iter().reduce(Condition::and)
    }

    pub fn params(&self) -> impl Iterator<Item = &Value> {
        self.sql.params()
    }

    /// Renders this condition alone, numbering its placeholders from zero.
    pub fn to_named(&self) -> NamedSql {
        self.sql.to_named()
    }
}

/// Byte offset of the next `:name` placeholder, skipping `::` casts.
fn find_placeholder(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b':' {
            if bytes.get(i + 1) == Some(&b':') {
                i += 2;
                continue;
            }
            if bytes
                .get(i + 1)
                .is_some_and(|b| b.is_ascii_alphabetic() || *b == b'_')
            {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

impl BitAnd for Condition {
    type Output = Condition;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.and(rhs)
    }
}

impl BitOr for Condition {
    type Output = Condition;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.or(rhs)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.sql, f)
    }
}

// ==================== ConditionBuilder ====================

/// Turns [`Filters`] into a [`Condition`].
///
/// In a joined context, keys starting with `{related_name}__` are routed to
/// the joined table alias and everything else to the base alias. The
/// routing is fixed when the builder is created.
#[derive(Debug, Clone, Copy)]
pub struct ConditionBuilder<'a> {
    related_name: Option<&'a str>,
}

impl<'a> ConditionBuilder<'a> {
    /// Builder for conditions on the base table only.
    #[inline]
    pub const fn base() -> Self {
        Self { related_name: None }
    }

    /// Builder for a `select_related` query through `related_name`.
    #[inline]
    pub const fn related(related_name: &'a str) -> Self {
        Self {
            related_name: Some(related_name),
        }
    }

    /// Builds one condition ANDing every filter. Empty filters give `None`.
    ///
    /// # Errors
    ///
    /// - [`QuarryError::UnsupportedOperator`] for an unknown suffix
    /// - [`QuarryError::InvalidFilterValue`] for a bad `__in` or `__isnull` value
    /// - [`QuarryError::InvalidIdentifier`] for a field that is not a plain identifier
    pub fn build(&self, filters: &Filters) -> Result<Option<Condition>> {
        let mut parts = Vec::with_capacity(filters.len());
        for (key, value) in filters.iter() {
            parts.push(self.term(key, value)?);
        }
        Ok((!parts.is_empty()).then(|| Condition::from_sql(Sql::join(parts, Token::AND))))
    }

    fn qualify<'k>(&self, key: &'k str) -> (&'static str, &'k str) {
        if let Some(related) = self.related_name
            && let Some(rest) = key
                .strip_prefix(related)
                .and_then(|rest| rest.strip_prefix("__"))
        {
            return (RELATED_ALIAS, rest);
        }
        (BASE_ALIAS, key)
    }

    fn term(&self, key: &str, value: &Value) -> Result<Sql> {
        let (alias, key) = self.qualify(key);
        let (field, lookup) = match key.split_once("__") {
            None => (key, Lookup::Exact),
            Some((field, suffix)) => {
                let lookup = Lookup::parse(suffix).ok_or_else(|| {
                    QuarryError::UnsupportedOperator(format!(
                        "Unsupported operator: \"{suffix}\". Options are: {}. If \"{field}\" is a related field, use `filter_related()` to add where clauses for the related field.",
                        Lookup::SUPPORTED.join(", ")
                    ))
                })?;
                (field, lookup)
            }
        };
        validate_ident(field)?;
        let column = format!("{alias}.{field}");
        let target = Sql::ident(column.as_str());

        if let Some(op) = lookup.comparison() {
            return Ok(target.push(op).append(Sql::param(&column, value.clone())));
        }

        if let Some((op, leading, trailing)) = lookup.pattern() {
            let mut pattern = String::new();
            if leading {
                pattern.push('%');
            }
            pattern.push_str(&value.to_text());
            if trailing {
                pattern.push('%');
            }
            return Ok(target.push(op).append(Sql::param(&column, pattern)));
        }

        match lookup {
            Lookup::In => {
                let Value::List(items) = value else {
                    return Err(QuarryError::InvalidFilterValue(format!(
                        "IN clause value for \"{field}\" must be supplied with a list and not \"{}\"",
                        value.type_name()
                    )));
                };
                if items.is_empty() {
                    return Err(QuarryError::InvalidFilterValue(format!(
                        "IN clause value for \"{field}\" must be supplied with a non-empty list"
                    )));
                }
                let list = Sql::join(
                    items.iter().map(|item| Sql::param(&column, item.clone())),
                    Token::COMMA,
                );
                Ok(target.push(Token::IN).append(list.parens()))
            }
            Lookup::IsNull => match value.as_bool() {
                Some(true) => Ok(target.push(Token::IS_NULL)),
                Some(false) => Ok(target.push(Token::IS_NOT_NULL)),
                None => Err(QuarryError::InvalidFilterValue(format!(
                    "isnull value for \"{field}\" must be a bool and not \"{}\"",
                    value.type_name()
                ))),
            },
            _ => unreachable!("comparison and pattern lookups return early"),
        }
    }
}
