//! Statement AST: SELECT, COUNT, INSERT, UPDATE and DELETE nodes that
//! render through [`Sql`].

use compact_str::{CompactString, format_compact};

use crate::condition::{BASE_ALIAS, Condition, RELATED_ALIAS};
use crate::error::{QuarryError, Result};
use crate::row::Row;
use crate::sql::{BuiltSql, NamedSql, Sql, Token, validate_ident};
use crate::value::Value;

/// A renderable statement.
pub trait Statement {
    fn to_sql(&self) -> Sql;

    /// Renders for the driver.
    ///
    /// # Errors
    ///
    /// See [`Sql::build`].
    #[inline]
    fn build(&self) -> Result<BuiltSql> {
        self.to_sql().build()
    }

    /// Renders with `:name` placeholders.
    #[inline]
    fn to_named(&self) -> NamedSql {
        self.to_sql().to_named()
    }
}

fn where_clause(sql: &mut Sql, filter: Option<&Condition>) {
    if let Some(filter) = filter {
        sql.push_mut(Token::WHERE);
        sql.append_mut(filter.sql().clone());
    }
}

// ==================== SELECT ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

impl Order {
    const fn token(self) -> Token {
        match self {
            Order::Asc => Token::ASC,
            Order::Desc => Token::DESC,
        }
    }
}

/// `column ASC|DESC`; the column may carry a table alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTerm {
    pub column: CompactString,
    pub order: Order,
}

impl OrderTerm {
    /// # Errors
    ///
    /// Returns [`QuarryError::InvalidIdentifier`] for a column that is not an identifier.
    pub fn new(column: &str, order: Order) -> Result<Self> {
        validate_ident(column)?;
        Ok(Self {
            column: column.into(),
            order,
        })
    }
}

/// The LEFT JOIN half of a `select_related` query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub table: CompactString,
    pub columns: Vec<CompactString>,
    /// Column on the base table holding the related primary key
    pub foreign_field: CompactString,
    pub related_pk: CompactString,
}

/// `SELECT ... FROM table t [LEFT JOIN ...] [WHERE] [ORDER BY] [LIMIT] [OFFSET]`
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: CompactString,
    pub columns: Vec<CompactString>,
    pub join: Option<Join>,
    pub filter: Option<Condition>,
    pub order_by: Vec<OrderTerm>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Select {
    pub fn new(table: impl Into<CompactString>, columns: Vec<CompactString>) -> Self {
        Self {
            table: table.into(),
            columns,
            join: None,
            filter: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    fn projection(&self) -> Sql {
        match &self.join {
            None => Sql::ident_list(self.columns.iter().cloned()),
            Some(join) => {
                let aliased = |alias: &str, column: &CompactString| {
                    Sql::ident(format_compact!("{alias}.{column}"))
                        .alias(format_compact!("{alias}_{column}"))
                };
                let base = self.columns.iter().map(|c| aliased(BASE_ALIAS, c));
                let related = join.columns.iter().map(|c| aliased(RELATED_ALIAS, c));
                Sql::join(base.chain(related), Token::COMMA)
            }
        }
    }
}

impl Statement for Select {
    fn to_sql(&self) -> Sql {
        let mut sql = Sql::token(Token::SELECT)
            .append(self.projection())
            .push(Token::FROM)
            .append(Sql::ident(self.table.clone()))
            .append(Sql::ident(BASE_ALIAS));

        if let Some(join) = &self.join {
            sql.push_mut(Token::LEFT_JOIN);
            sql.append_mut(Sql::ident(join.table.clone()));
            sql.append_mut(Sql::ident(RELATED_ALIAS));
            sql.push_mut(Token::ON);
            sql.append_mut(Sql::ident(format_compact!(
                "{BASE_ALIAS}.{}",
                join.foreign_field
            )));
            sql.push_mut(Token::EQ);
            sql.append_mut(Sql::ident(format_compact!(
                "{RELATED_ALIAS}.{}",
                join.related_pk
            )));
        }

        where_clause(&mut sql, self.filter.as_ref());

        if !self.order_by.is_empty() {
            sql.push_mut(Token::ORDER_BY);
            sql.append_mut(Sql::join(
                self.order_by
                    .iter()
                    .map(|term| Sql::ident(term.column.clone()).push(term.order.token())),
                Token::COMMA,
            ));
        }
        if let Some(limit) = self.limit {
            sql.push_mut(Token::LIMIT);
            sql.append_mut(Sql::number(limit));
        }
        if let Some(offset) = self.offset {
            sql.push_mut(Token::OFFSET);
            sql.append_mut(Sql::number(offset));
        }
        sql
    }
}

/// `SELECT count(pk) FROM table t [WHERE]`
#[derive(Debug, Clone, PartialEq)]
pub struct Count {
    pub table: CompactString,
    pub pk: CompactString,
    pub filter: Option<Condition>,
}

impl Statement for Count {
    fn to_sql(&self) -> Sql {
        let mut sql = Sql::token(Token::SELECT)
            .append(Sql::func("count", Sql::ident(self.pk.clone())))
            .push(Token::FROM)
            .append(Sql::ident(self.table.clone()))
            .append(Sql::ident(BASE_ALIAS));
        where_clause(&mut sql, self.filter.as_ref());
        sql
    }
}

// ==================== INSERT ====================

/// Conflict handling for INSERT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnConflict {
    /// `ON CONFLICT DO NOTHING`
    DoNothing,
    /// `ON CONFLICT (targets) DO UPDATE SET f = EXCLUDED.f, ...`
    Update {
        targets: Vec<CompactString>,
        fields: Vec<CompactString>,
    },
}

impl OnConflict {
    pub fn update<T, F>(targets: T, fields: F) -> Self
    where
        T: IntoIterator,
        T::Item: Into<CompactString>,
        F: IntoIterator,
        F::Item: Into<CompactString>,
    {
        OnConflict::Update {
            targets: targets.into_iter().map(Into::into).collect(),
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Checks the clause before any I/O.
    ///
    /// # Errors
    ///
    /// - [`QuarryError::MalformedQueryset`] when an update clause has no targets or fields
    /// - [`QuarryError::InvalidIdentifier`] for a non-identifier name
    pub fn validate(&self, model: &str) -> Result<()> {
        if let OnConflict::Update { targets, fields } = self {
            if targets.is_empty() || fields.is_empty() {
                return Err(QuarryError::malformed(
                    model,
                    "conflict targets and update fields must be provided for ON CONFLICT UPDATE",
                ));
            }
            for name in targets.iter().chain(fields) {
                validate_ident(name)?;
            }
        }
        Ok(())
    }

    fn to_sql(&self) -> Sql {
        match self {
            OnConflict::DoNothing => Sql::token(Token::ON_CONFLICT).push(Token::DO_NOTHING),
            OnConflict::Update { targets, fields } => Sql::token(Token::ON_CONFLICT)
                .append(Sql::ident_list(targets.iter().cloned()).parens())
                .push(Token::DO_UPDATE_SET)
                .append(Sql::join(
                    fields.iter().map(|field| {
                        Sql::ident(field.clone())
                            .push(Token::EQ)
                            .append(Sql::ident(format_compact!("EXCLUDED.{field}")))
                    }),
                    Token::COMMA,
                )),
        }
    }
}

/// `INSERT INTO table (cols) VALUES (:col, ...) [ON CONFLICT ...] [RETURNING pk AS new_id]`
///
/// Values bind under their column names, so every row of a batch renders
/// the same text.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: CompactString,
    pub values: Row,
    pub on_conflict: Option<OnConflict>,
    pub returning: Option<CompactString>,
}

impl Insert {
    /// # Errors
    ///
    /// Returns [`QuarryError::InvalidIdentifier`] for a column that is not an identifier.
    pub fn new(table: impl Into<CompactString>, values: Row) -> Result<Self> {
        for column in values.keys() {
            validate_ident(column)?;
        }
        Ok(Self {
            table: table.into(),
            values,
            on_conflict: None,
            returning: None,
        })
    }

    pub fn on_conflict(mut self, on_conflict: Option<OnConflict>) -> Self {
        self.on_conflict = on_conflict;
        self
    }

    /// Adds `RETURNING pk AS new_id`.
    pub fn returning(mut self, pk: impl Into<CompactString>) -> Self {
        self.returning = Some(pk.into());
        self
    }
}

impl Statement for Insert {
    fn to_sql(&self) -> Sql {
        let columns = Sql::ident_list(self.values.keys().map(CompactString::from));
        let params = Sql::join(
            self.values
                .iter()
                .map(|(column, value)| Sql::fixed_param(column, value.clone())),
            Token::COMMA,
        );
        let mut sql = Sql::token(Token::INSERT_INTO)
            .append(Sql::ident(self.table.clone()))
            .append(columns.parens())
            .push(Token::VALUES)
            .append(params.parens());
        if let Some(on_conflict) = &self.on_conflict {
            sql.append_mut(on_conflict.to_sql());
        }
        if let Some(pk) = &self.returning {
            sql.push_mut(Token::RETURNING);
            sql.append_mut(Sql::ident(pk.clone()).alias("new_id"));
        }
        sql
    }
}

// ==================== UPDATE ====================

/// One `SET` item, parsed from a `field[__suffix]` keyword.
#[derive(Debug, Clone, PartialEq)]
pub enum Assignment {
    /// `f = :v`
    Set { field: CompactString, value: Value },
    /// `f = f <op> :v` for `add`, `sub`, `mul`, `div`
    Arith {
        field: CompactString,
        op: Token,
        value: Value,
    },
    /// `f = f +|- :v::text::interval` for `add_time`, `sub_time`
    Interval {
        field: CompactString,
        op: Token,
        value: Value,
    },
    /// `f = :json` replacing the whole column
    JsonbReplace { field: CompactString, json: Value },
    /// `f = f - :key::text`
    JsonbRemove { field: CompactString, key: Value },
    /// `f = jsonb_set(f, '{key}', :json, true)`
    JsonbSet {
        field: CompactString,
        key: CompactString,
        json: Value,
    },
}

impl Assignment {
    /// Suffixes accepted after `field__`.
    pub const SUFFIXES: &'static [&'static str] = &[
        "add",
        "sub",
        "mul",
        "div",
        "add_time",
        "sub_time",
        "jsonb",
        "jsonb_remove",
        "jsonb_set__<key>",
    ];

    /// # Errors
    ///
    /// - [`QuarryError::UnsupportedOperator`] for an unknown suffix or a `jsonb_set` without a key
    /// - [`QuarryError::InvalidIdentifier`] for a field or key that is not an identifier
    pub fn parse(key: &str, value: Value) -> Result<Self> {
        let Some((field, suffix)) = key.split_once("__") else {
            validate_ident(key)?;
            return Ok(Assignment::Set {
                field: key.into(),
                value,
            });
        };
        validate_ident(field)?;
        let field = CompactString::from(field);

        Ok(match suffix {
            "add" => Assignment::Arith {
                field,
                op: Token::PLUS,
                value,
            },
            "sub" => Assignment::Arith {
                field,
                op: Token::MINUS,
                value,
            },
            "mul" => Assignment::Arith {
                field,
                op: Token::MUL,
                value,
            },
            "div" => Assignment::Arith {
                field,
                op: Token::DIV,
                value,
            },
            "add_time" => Assignment::Interval {
                field,
                op: Token::PLUS,
                value,
            },
            "sub_time" => Assignment::Interval {
                field,
                op: Token::MINUS,
                value,
            },
            "jsonb" => Assignment::JsonbReplace {
                json: Value::Json(value.to_json()),
                field,
            },
            "jsonb_remove" => Assignment::JsonbRemove { field, key: value },
            "jsonb_set" => {
                return Err(QuarryError::UnsupportedOperator(format!(
                    "Missing jsonb key name for operation \"{suffix}\" in update"
                )));
            }
            other => match other.strip_prefix("jsonb_set__") {
                Some(json_key) if !json_key.is_empty() => {
                    validate_ident(json_key)?;
                    Assignment::JsonbSet {
                        field,
                        key: json_key.into(),
                        json: Value::Json(value.to_json()),
                    }
                }
                _ => {
                    return Err(QuarryError::UnsupportedOperator(format!(
                        "Invalid operation \"{other}\" in update. Options are: {}",
                        Self::SUFFIXES.join(", ")
                    )));
                }
            },
        })
    }

    pub fn field(&self) -> &str {
        match self {
            Assignment::Set { field, .. }
            | Assignment::Arith { field, .. }
            | Assignment::Interval { field, .. }
            | Assignment::JsonbReplace { field, .. }
            | Assignment::JsonbRemove { field, .. }
            | Assignment::JsonbSet { field, .. } => field,
        }
    }

    fn to_sql(&self) -> Sql {
        let field = self.field();
        let target = Sql::ident(field).push(Token::EQ);
        let label = format!("set_{field}");
        match self {
            Assignment::Set { value, .. } | Assignment::JsonbReplace { json: value, .. } => {
                target.append(Sql::param(&label, value.clone()))
            }
            Assignment::Arith { op, value, .. } => target
                .append(Sql::ident(field))
                .push(*op)
                .append(Sql::param(&label, value.clone())),
            Assignment::Interval { op, value, .. } => target
                .append(Sql::ident(field))
                .push(*op)
                .append(Sql::param(&label, value.to_text()))
                .append(Sql::raw("::text::interval")),
            Assignment::JsonbRemove { key, .. } => target
                .append(Sql::ident(field))
                .push(Token::MINUS)
                .append(Sql::param(&label, key.to_text()))
                .append(Sql::raw("::text")),
            Assignment::JsonbSet { key, json, .. } => {
                let args = Sql::ident(field)
                    .push(Token::COMMA)
                    .append(Sql::raw(format_compact!("'{{{key}}}'")))
                    .push(Token::COMMA)
                    .append(Sql::param(&format!("set_{key}"), json.clone()))
                    .push(Token::COMMA)
                    .push(Token::TRUE);
                target.append(Sql::func("jsonb_set", args))
            }
        }
    }
}

/// Wraps a data-modifying statement so the affected row count comes back
/// through `RETURNING`: `WITH {verb} AS (... RETURNING pk AS {verb}_id)
/// SELECT COUNT(*) AS {verb}_count FROM {verb}`.
fn counted(verb: &'static str, body: Sql, pk: &str) -> Sql {
    let body = body
        .push(Token::RETURNING)
        .append(Sql::ident(pk).alias(format_compact!("{verb}_id")));
    Sql::token(Token::WITH)
        .append(Sql::ident(verb))
        .push(Token::AS)
        .append(body.parens())
        .push(Token::SELECT)
        .append(Sql::func("COUNT", Sql::token(Token::STAR)).alias(format_compact!("{verb}_count")))
        .push(Token::FROM)
        .append(Sql::ident(verb))
}

/// Column name of the affected-row count returned by [`Update`].
pub const UPDATED_COUNT: &str = "updated_count";
/// Column name of the affected-row count returned by [`Delete`].
pub const DELETED_COUNT: &str = "deleted_count";
/// Column name of the primary key returned by [`Insert::returning`].
pub const NEW_ID: &str = "new_id";

/// `UPDATE table t SET ... WHERE ...`, counted. A condition is mandatory.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: CompactString,
    pub pk: CompactString,
    pub assignments: Vec<Assignment>,
    pub filter: Condition,
}

impl Statement for Update {
    fn to_sql(&self) -> Sql {
        let body = Sql::token(Token::UPDATE)
            .append(Sql::ident(self.table.clone()))
            .append(Sql::ident(BASE_ALIAS))
            .push(Token::SET)
            .append(Sql::join(
                self.assignments.iter().map(Assignment::to_sql),
                Token::COMMA,
            ))
            .push(Token::WHERE)
            .append(self.filter.sql().clone());
        counted("updated", body, &self.pk)
    }
}

/// `DELETE FROM table t WHERE ...`, counted. A condition is mandatory.
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: CompactString,
    pub pk: CompactString,
    pub filter: Condition,
}

impl Statement for Delete {
    fn to_sql(&self) -> Sql {
        let body = Sql::token(Token::DELETE_FROM)
            .append(Sql::ident(self.table.clone()))
            .append(Sql::ident(BASE_ALIAS))
            .push(Token::WHERE)
            .append(self.filter.sql().clone());
        counted("deleted", body, &self.pk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::{ConditionBuilder, Filters};

    fn cond(filters: Filters) -> Condition {
        ConditionBuilder::base().build(&filters).unwrap().unwrap()
    }

    fn cols(names: &[&str]) -> Vec<CompactString> {
        names.iter().map(|n| CompactString::from(*n)).collect()
    }

    #[test]
    fn plain_select() {
        let mut select = Select::new("users", cols(&["id", "name"]));
        select.filter = Some(cond(Filters::new().with("name", "ann")));
        select.order_by = vec![OrderTerm::new("id", Order::Desc).unwrap()];
        select.limit = Some(10);
        select.offset = Some(20);
        assert_eq!(
            select.to_named().sql,
            "SELECT id, name FROM users t WHERE t.name = :t_name_0 ORDER BY id DESC LIMIT 10 OFFSET 20"
        );
        assert_eq!(
            select.build().unwrap().sql,
            "SELECT id, name FROM users t WHERE t.name = $1 ORDER BY id DESC LIMIT 10 OFFSET 20"
        );
    }

    #[test]
    fn joined_select() {
        let mut select = Select::new("users", cols(&["id", "profile_id"]));
        select.join = Some(Join {
            table: "profiles".into(),
            columns: cols(&["id", "bio"]),
            foreign_field: "profile_id".into(),
            related_pk: "id".into(),
        });
        assert_eq!(
            select.to_named().sql,
            "SELECT t.id AS t_id, t.profile_id AS t_profile_id, r.id AS r_id, r.bio AS r_bio \
             FROM users t LEFT JOIN profiles r ON t.profile_id = r.id"
        );
    }

    #[test]
    fn count_uses_primary_key() {
        let count = Count {
            table: "users".into(),
            pk: "id".into(),
            filter: Some(cond(Filters::new().with("age__gt", 3))),
        };
        assert_eq!(
            count.to_named().sql,
            "SELECT count(id) FROM users t WHERE t.age > :t_age_0"
        );
    }

    #[test]
    fn insert_with_conflict_update() {
        let insert = Insert::new("users", Row::new().with("email", "a@b.c").with("name", "A"))
            .unwrap()
            .on_conflict(Some(OnConflict::update(["email"], ["name"])))
            .returning("id");
        assert_eq!(
            insert.to_named().sql,
            "INSERT INTO users (email, name) VALUES (:email, :name) \
             ON CONFLICT (email) DO UPDATE SET name = EXCLUDED.name RETURNING id AS new_id"
        );
        assert_eq!(
            insert.build().unwrap().sql,
            "INSERT INTO users (email, name) VALUES ($1, $2) \
             ON CONFLICT (email) DO UPDATE SET name = EXCLUDED.name RETURNING id AS new_id"
        );
    }

    #[test]
    fn insert_do_nothing() {
        let insert = Insert::new("users", Row::new().with("name", "A"))
            .unwrap()
            .on_conflict(Some(OnConflict::DoNothing));
        assert_eq!(
            insert.to_named().sql,
            "INSERT INTO users (name) VALUES (:name) ON CONFLICT DO NOTHING"
        );
    }

    #[test]
    fn conflict_update_requires_targets_and_fields() {
        let err = OnConflict::update(Vec::<&str>::new(), ["name"])
            .validate("User")
            .unwrap_err();
        assert!(matches!(err, QuarryError::MalformedQueryset { .. }));
        assert!(OnConflict::DoNothing.validate("User").is_ok());
    }

    #[test]
    fn update_suffixes_render() {
        let assignments = vec![
            Assignment::parse("name", "B".into()).unwrap(),
            Assignment::parse("score__add", 5.into()).unwrap(),
            Assignment::parse("ttl__sub_time", "1 day".into()).unwrap(),
            Assignment::parse("meta__jsonb_remove", "old".into()).unwrap(),
            Assignment::parse("meta__jsonb_set__color", "red".into()).unwrap(),
        ];
        let update = Update {
            table: "users".into(),
            pk: "id".into(),
            assignments,
            filter: cond(Filters::new().with("id", 1)),
        };
        let named = update.to_named();
        assert_eq!(
            named.sql,
            "WITH updated AS (UPDATE users t SET name = :set_name_0, score = score + :set_score_1, \
             ttl = ttl - :set_ttl_2::text::interval, meta = meta - :set_meta_3::text, \
             meta = jsonb_set(meta, '{color}', :set_color_4, TRUE) WHERE t.id = :t_id_5 \
             RETURNING id AS updated_id) SELECT COUNT(*) AS updated_count FROM updated"
        );
        assert_eq!(
            named.param("set_color_4"),
            Some(&Value::Json(serde_json::json!("red")))
        );
    }

    #[test]
    fn jsonb_replace_serializes_value() {
        let assignment = Assignment::parse("meta__jsonb", Value::Json(serde_json::json!({"a": 1}))).unwrap();
        assert!(matches!(assignment, Assignment::JsonbReplace { ref json, .. } if json.to_json() == serde_json::json!({"a": 1})));
    }

    #[test]
    fn unknown_update_suffix() {
        assert!(matches!(
            Assignment::parse("score__pow", 2.into()),
            Err(QuarryError::UnsupportedOperator(_))
        ));
        assert!(matches!(
            Assignment::parse("meta__jsonb_set", 2.into()),
            Err(QuarryError::UnsupportedOperator(_))
        ));
    }

    #[test]
    fn delete_is_counted() {
        let delete = Delete {
            table: "users".into(),
            pk: "id".into(),
            filter: cond(Filters::new().with("id__in", vec![1, 2])),
        };
        assert_eq!(
            delete.to_named().sql,
            "WITH deleted AS (DELETE FROM users t WHERE t.id IN (:t_id_0, :t_id_1) \
             RETURNING id AS deleted_id) SELECT COUNT(*) AS deleted_count FROM deleted"
        );
    }
}
