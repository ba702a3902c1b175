//! The lazy, single-use query builder.
//!
//! A [`QueryExecutor`] collects conditions, an action, join and prefetch
//! requests, ordering and paging. Nothing touches the database until it is
//! awaited (or [`QueryExecutor::resolve`]d); the first resolution renders
//! the statement once and caches the rows, later resolutions reuse them.
//!
//! ```no_run
//! # use quarry_core::{Filters, Model, Result, Row};
//! # use quarry_postgres::{ConnectionRouter, ModelExt};
//! # struct User;
//! # impl Model for User {
//! #     const NAME: &'static str = "User";
//! #     const TABLE: &'static str = "users";
//! #     const PRIMARY_KEY: &'static str = "id";
//! #     const FIELDS: &'static [&'static str] = &["id", "age"];
//! #     fn from_row(_: Row) -> Result<Self> { Ok(User) }
//! #     fn to_row(&self) -> Row { Row::new() }
//! # }
//! # async fn run(router: &ConnectionRouter) -> Result<()> {
//! let adults = User::objects(router)?
//!     .filter(Filters::new().with("age__gte", 18))?
//!     .order_by(["-age"])?
//!     .limit(10)
//!     .await?
//!     .into_many();
//! # Ok(())
//! # }
//! ```

use core::any::TypeId;
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use std::future::IntoFuture;
use std::pin::Pin;

use async_trait::async_trait;
use compact_str::{CompactString, format_compact};
use hashbrown::HashMap;
use quarry_core::{
    Assignment, BASE_ALIAS, BuiltSql, Condition, ConditionBuilder, Count, DELETED_COUNT, Delete,
    Filters, Insert, Join, Model, ModelMeta, NEW_ID, OnConflict, Order, OrderTerm, QuarryError,
    RELATED_ALIAS, Relation, Result, Row, Select, Statement, UPDATED_COUNT, Update, Value,
    ValueKey, validate_ident,
};

use crate::model::save_row;
use crate::prefetch::{BoundPrefetch, Prefetch, PrefetchQuery};
use crate::router::{Connection, ConnectionRouter, Transaction};

// ==================== result shape ====================

/// How resolved rows are handed back.
pub trait Shape<M: Model>: Send + Sync + 'static {
    type Item: Send;

    fn shape(row: Row) -> Result<Self::Item>;
}

/// Rows become `M` through [`Model::from_row`]; joined and prefetched data
/// arrive as nested objects for the model to decode.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsRecord;

/// Rows stay plain field mappings, related data as nested mappings.
#[derive(Debug, Clone, Copy, Default)]
pub struct AsRow;

impl<M: Model> Shape<M> for AsRecord {
    type Item = M;

    #[inline]
    fn shape(row: Row) -> Result<M> {
        M::from_row(row)
    }
}

impl<M: Model> Shape<M> for AsRow {
    type Item = Row;

    #[inline]
    fn shape(row: Row) -> Result<Row> {
        Ok(row)
    }
}

/// What a resolved executor yields, by action.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput<T> {
    /// `get`
    One(T),
    /// `filter` and `all`
    Many(Vec<T>),
    /// `count`, and the affected rows of `update` and `delete`
    Count(u64),
}

impl<T> QueryOutput<T> {
    pub fn into_one(self) -> Option<T> {
        match self {
            QueryOutput::One(item) => Some(item),
            _ => None,
        }
    }

    /// Every record; a `get` result is a one-element list.
    pub fn into_many(self) -> Vec<T> {
        match self {
            QueryOutput::One(item) => vec![item],
            QueryOutput::Many(items) => items,
            QueryOutput::Count(_) => Vec::new(),
        }
    }

    pub fn into_count(self) -> Option<u64> {
        match self {
            QueryOutput::Count(n) => Some(n),
            _ => None,
        }
    }
}

// ==================== actions ====================

/// The action an executor resolves with.
///
/// `Select` (from `filter`/`all`) may be refined once into any terminal
/// action; a terminal action only accepts itself again.
#[derive(Debug, Clone, PartialEq)]
enum Action {
    Select,
    Get,
    Count,
    Update(Vec<Assignment>),
    Delete,
}

impl Action {
    const fn name(&self) -> &'static str {
        match self {
            Action::Select => "filter",
            Action::Get => "get",
            Action::Count => "count",
            Action::Update(_) => "update",
            Action::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolved {
    Rows(Vec<Row>),
    Count(u64),
}

/// Options for [`QueryExecutor::bulk_create`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOptions {
    /// Insert rows as given instead of round-tripping them through the model
    pub skip_validation: bool,
    pub on_conflict: Option<OnConflict>,
}

// ==================== QueryExecutor ====================

/// A lazy query over model `M`, yielding `Sh::Item`s.
pub struct QueryExecutor<'r, M: Model, Sh: Shape<M> = AsRecord> {
    router: &'r ConnectionRouter,
    meta: &'static ModelMeta,
    connection: Option<CompactString>,
    tx: Option<&'r Transaction>,
    action: Option<Action>,
    conditions: Vec<Condition>,
    related_conditions: Vec<Condition>,
    columns: Option<Vec<CompactString>>,
    related: Option<&'static Relation>,
    prefetches: Vec<BoundPrefetch<'r>>,
    order_by: Vec<(CompactString, Order)>,
    limit: Option<u64>,
    offset: Option<u64>,
    resolved: Option<Resolved>,
    /// Set when a prefetch failed after the secondary queries were consumed
    failed: Option<String>,
    query: String,
    _marker: PhantomData<fn() -> (M, Sh)>,
}

impl<M: Model, Sh: Shape<M>> fmt::Debug for QueryExecutor<'_, M, Sh> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("model", &self.meta.name)
            .field("action", &self.action.as_ref().map(Action::name))
            .field("conditions", &self.conditions.len())
            .field("related", &self.related.map(|r| r.related_name.as_str()))
            .field("prefetches", &self.prefetches.len())
            .field("executed", &self.resolved.is_some())
            .finish_non_exhaustive()
    }
}

impl<'r, M: Model> QueryExecutor<'r, M, AsRecord> {
    /// A fresh executor over `M`.
    ///
    /// # Errors
    ///
    /// [`QuarryError::MalformedMeta`] when `M` is declared inconsistently.
    pub fn new(router: &'r ConnectionRouter) -> Result<Self> {
        Ok(Self::from_parts(router, M::meta()?, None, None))
    }
}

impl<'r, M: Model, Sh: Shape<M>> QueryExecutor<'r, M, Sh> {
    fn from_parts(
        router: &'r ConnectionRouter,
        meta: &'static ModelMeta,
        connection: Option<CompactString>,
        tx: Option<&'r Transaction>,
    ) -> Self {
        Self {
            router,
            meta,
            connection,
            tx,
            action: None,
            conditions: Vec::new(),
            related_conditions: Vec::new(),
            columns: None,
            related: None,
            prefetches: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
            resolved: None,
            failed: None,
            query: String::new(),
            _marker: PhantomData,
        }
    }

    /// A new executor sharing this one's router, connection and transaction.
    fn sibling<S: Shape<M>>(&self) -> QueryExecutor<'r, M, S> {
        QueryExecutor::from_parts(self.router, self.meta, self.connection.clone(), self.tx)
    }

    #[inline]
    pub fn meta(&self) -> &'static ModelMeta {
        self.meta
    }

    /// The last rendered statement with `:name` placeholders.
    #[inline]
    pub fn query(&self) -> &str {
        &self.query
    }

    fn malformed(&self, reason: impl Into<String>) -> QuarryError {
        QuarryError::malformed(self.meta.name, reason)
    }

    fn set_action(&mut self, next: Action) -> Result<()> {
        match self.action.take() {
            None | Some(Action::Select) => {
                self.action = Some(next);
                Ok(())
            }
            Some(Action::Update(mut current)) => match next {
                Action::Update(more) => {
                    current.extend(more);
                    self.action = Some(Action::Update(current));
                    Ok(())
                }
                next => {
                    self.action = Some(Action::Update(current));
                    Err(self.malformed(format!("cannot change action from update to {}", next.name())))
                }
            },
            Some(current) if mem::discriminant(&current) == mem::discriminant(&next) => {
                self.action = Some(current);
                Ok(())
            }
            Some(current) => {
                let err = self.malformed(format!(
                    "cannot change action from {} to {}",
                    current.name(),
                    next.name()
                ));
                self.action = Some(current);
                Err(err)
            }
        }
    }

    fn push_filters(&mut self, filters: &Filters) -> Result<()> {
        if let Some(condition) = ConditionBuilder::base().build(filters)? {
            self.conditions.push(condition);
        }
        Ok(())
    }

    // ==================== builder ====================

    /// Reads from the named connection instead of a random READ one.
    ///
    /// # Errors
    ///
    /// [`QuarryError::InvalidConnectionName`] for a name not in the configuration.
    pub fn using(mut self, name: &str) -> Result<Self> {
        if !self.router.config().databases.contains_key(name) {
            return Err(QuarryError::InvalidConnectionName(name.to_string()));
        }
        self.connection = Some(name.into());
        Ok(self)
    }

    /// Runs every statement inside `tx`. The caller commits or rolls back.
    pub fn in_transaction(mut self, tx: &'r Transaction) -> Self {
        self.tx = Some(tx);
        self
    }

    /// Restricts the selected base columns.
    pub fn columns<I, S>(mut self, columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let columns = columns
            .into_iter()
            .map(|c| validate_ident(c.as_ref()).map(CompactString::from))
            .collect::<Result<Vec<_>>>()?;
        if columns.is_empty() {
            return Err(self.malformed("columns() needs at least one column"));
        }
        self.columns = Some(columns);
        Ok(self)
    }

    /// Adds a pre-built condition, e.g. an OR group. Sets no action.
    pub fn condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Selects the rows matching `filters`.
    pub fn filter(mut self, filters: Filters) -> Result<Self> {
        self.set_action(Action::Select)?;
        self.push_filters(&filters)?;
        Ok(self)
    }

    /// Selects every row; adds no condition of its own.
    pub fn all(mut self) -> Result<Self> {
        self.set_action(Action::Select)?;
        Ok(self)
    }

    /// Selects exactly one row.
    pub fn get(mut self, filters: Filters) -> Result<Self> {
        self.set_action(Action::Get)?;
        self.push_filters(&filters)?;
        Ok(self)
    }

    /// Counts the matching rows.
    pub fn count(mut self) -> Result<Self> {
        self.set_action(Action::Count)?;
        Ok(self)
    }

    /// Updates the matching rows. `values` keys follow the update-suffix
    /// grammar (`f`, `f__add`, `f__jsonb_set__key`, ...).
    ///
    /// # Errors
    ///
    /// - [`QuarryError::UnrestrictedUpdate`] when no condition is present yet
    /// - [`QuarryError::UnsupportedOperator`] for an unknown suffix
    pub fn update(mut self, values: Row) -> Result<Self> {
        if self.conditions.is_empty() {
            return Err(QuarryError::UnrestrictedUpdate);
        }
        if values.is_empty() {
            return Err(self.malformed("update() needs at least one field"));
        }
        let assignments = values
            .into_iter()
            .map(|(key, value)| Assignment::parse(&key, value))
            .collect::<Result<Vec<_>>>()?;
        self.set_action(Action::Update(assignments))?;
        Ok(self)
    }

    /// Deletes the matching rows.
    ///
    /// # Errors
    ///
    /// [`QuarryError::UnrestrictedDelete`] when no condition is present yet.
    pub fn delete(mut self) -> Result<Self> {
        if self.conditions.is_empty() {
            return Err(QuarryError::UnrestrictedDelete);
        }
        self.set_action(Action::Delete)?;
        Ok(self)
    }

    /// LEFT JOINs the relation exposed as `name`.
    ///
    /// # Errors
    ///
    /// [`QuarryError::InvalidRelatedField`] listing the declared names.
    pub fn select_related(mut self, name: &str) -> Result<Self> {
        self.related = Some(self.meta.relation(name)?);
        Ok(self)
    }

    /// Adds conditions on the joined table. Keys carry the relation prefix,
    /// e.g. `profile__bio__icontains`.
    pub fn filter_related(mut self, filters: Filters) -> Result<Self> {
        let Some(relation) = self.related else {
            return Err(self.malformed("filter_related() requires select_related() first"));
        };
        if let Some(condition) = ConditionBuilder::related(&relation.related_name).build(&filters)? {
            self.related_conditions.push(condition);
        }
        Ok(self)
    }

    /// Fetches each secondary set with one extra query after the base rows.
    ///
    /// # Errors
    ///
    /// [`QuarryError::InvalidPrefetch`] when a secondary model declares no
    /// relation back to `M`.
    pub fn prefetch_related<I>(mut self, prefetches: I) -> Result<Self>
    where
        I: IntoIterator<Item = Prefetch<'r>>,
    {
        for prefetch in prefetches {
            let bound = prefetch.bind(TypeId::of::<M>(), self.meta.name)?;
            self.prefetches.push(bound);
        }
        Ok(self)
    }

    /// Orders by `keys`; a leading `-` sorts descending. With a join, keys
    /// are qualified and `{related}__field` orders by the joined column.
    /// Replaces any earlier ordering.
    pub fn order_by<I, S>(mut self, keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut order_by = Vec::new();
        for key in keys {
            let key = key.as_ref();
            let (name, order) = match key.strip_prefix('-') {
                Some(name) => (name, Order::Desc),
                None => (key, Order::Asc),
            };
            order_by.push((CompactString::from(validate_ident(name)?), order));
        }
        self.order_by = order_by;
        Ok(self)
    }

    /// `all()` unless an action is already set.
    pub(crate) fn or_all(mut self) -> Self {
        if self.action.is_none() {
            self.action = Some(Action::Select);
        }
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Yields plain field mappings instead of records.
    pub fn as_rows(self) -> QueryExecutor<'r, M, AsRow> {
        QueryExecutor {
            router: self.router,
            meta: self.meta,
            connection: self.connection,
            tx: self.tx,
            action: self.action,
            conditions: self.conditions,
            related_conditions: self.related_conditions,
            columns: self.columns,
            related: self.related,
            prefetches: self.prefetches,
            order_by: self.order_by,
            limit: self.limit,
            offset: self.offset,
            resolved: self.resolved,
            failed: self.failed,
            query: self.query,
            _marker: PhantomData,
        }
    }

    // ==================== rendering ====================

    fn base_filter(&self) -> Option<Condition> {
        Condition::all(self.conditions.iter().cloned())
    }

    fn render(&mut self, statement: &impl Statement) -> Result<BuiltSql> {
        let sql = statement.to_sql();
        self.query = sql.to_named().sql;
        sql.build()
    }

    fn order_terms(&self) -> Result<Vec<OrderTerm>> {
        self.order_by
            .iter()
            .map(|(key, order)| {
                let related = self.related.and_then(|relation| {
                    key.strip_prefix(relation.related_name.as_str())
                        .and_then(|rest| rest.strip_prefix("__"))
                });
                let column = match (self.related, related) {
                    (_, Some(field)) => format_compact!("{RELATED_ALIAS}.{field}"),
                    (Some(_), None) => format_compact!("{BASE_ALIAS}.{key}"),
                    (None, None) => key.clone(),
                };
                OrderTerm::new(&column, *order)
            })
            .collect()
    }

    fn selected_columns(&self) -> Vec<CompactString> {
        self.columns.clone().unwrap_or_else(|| {
            self.meta
                .fields
                .iter()
                .map(|f| CompactString::from(*f))
                .collect()
        })
    }

    fn select_statement(&self) -> Result<Select> {
        let mut select = Select::new(self.meta.table, self.selected_columns());
        if let Some(relation) = self.related {
            select.join = Some(Join {
                table: relation.table.into(),
                columns: relation.fields.iter().map(|f| CompactString::from(*f)).collect(),
                foreign_field: relation.foreign_field.into(),
                related_pk: relation.primary_key.into(),
            });
        }
        select.filter = Condition::all(
            self.conditions
                .iter()
                .chain(&self.related_conditions)
                .cloned(),
        );
        select.order_by = self.order_terms()?;
        select.limit = self.limit;
        select.offset = self.offset;
        Ok(select)
    }

    fn read_connection(&self) -> Result<Connection> {
        match &self.connection {
            Some(name) => self.router.using(name),
            None => self.router.read(),
        }
    }

    fn reject_related_filters(&self, action: &str) -> Result<()> {
        if self.related_conditions.is_empty() {
            Ok(())
        } else {
            Err(self.malformed(format!("{action}() cannot be combined with filter_related()")))
        }
    }

    // ==================== execution ====================

    pub(crate) async fn execute(&mut self) -> Result<Resolved> {
        if let Some(reason) = &self.failed {
            return Err(self.malformed(format!("an earlier resolve failed: {reason}")));
        }
        let table = self.meta.table;
        let pk = self.meta.primary_key;
        match self.action.clone() {
            None => Err(self.malformed(
                "no action set; call get, filter, all, count, update or delete",
            )),
            Some(Action::Count) => {
                self.reject_related_filters("count")?;
                let statement = Count {
                    table: table.into(),
                    pk: pk.into(),
                    filter: self.base_filter(),
                };
                let sql = self.render(&statement)?;
                let rows = self.read_connection()?.fetch_all(&sql, self.tx).await?;
                Ok(Resolved::Count(count_of(&rows, "count")?))
            }
            Some(Action::Update(assignments)) => {
                self.reject_related_filters("update")?;
                let filter = self.base_filter().ok_or(QuarryError::UnrestrictedUpdate)?;
                let statement = Update {
                    table: table.into(),
                    pk: pk.into(),
                    assignments,
                    filter,
                };
                let sql = self.render(&statement)?;
                let rows = self
                    .router
                    .write()?
                    .execute(&sql, Some(table), self.tx)
                    .await?;
                Ok(Resolved::Count(count_of(&rows, UPDATED_COUNT)?))
            }
            Some(Action::Delete) => {
                self.reject_related_filters("delete")?;
                let filter = self.base_filter().ok_or(QuarryError::UnrestrictedDelete)?;
                let statement = Delete {
                    table: table.into(),
                    pk: pk.into(),
                    filter,
                };
                let sql = self.render(&statement)?;
                let rows = self
                    .router
                    .write()?
                    .execute(&sql, Some(table), self.tx)
                    .await?;
                Ok(Resolved::Count(count_of(&rows, DELETED_COUNT)?))
            }
            Some(Action::Select | Action::Get) => {
                let statement = self.select_statement()?;
                let sql = self.render(&statement)?;
                let mut rows = self.read_connection()?.fetch_all(&sql, self.tx).await?;
                if let Some(relation) = self.related {
                    rows = denormalize(rows, pk, relation);
                }
                for prefetch in mem::take(&mut self.prefetches) {
                    if let Err(err) = prefetch.attach(&mut rows, self.tx).await {
                        self.failed = Some(err.to_string());
                        return Err(err);
                    }
                }
                Ok(Resolved::Rows(rows))
            }
        }
    }

    fn single<'a>(&self, rows: &'a [Row]) -> Result<&'a Row> {
        match rows {
            [row] => Ok(row),
            [] => Err(QuarryError::NotFound {
                model: self.meta.name.to_string(),
                query: self.query.clone(),
            }),
            _ => Err(QuarryError::MultipleResultsFound {
                model: self.meta.name.to_string(),
                query: self.query.clone(),
            }),
        }
    }

    /// Resolves the executor. The statement runs on the first call only;
    /// later calls shape the cached rows again.
    ///
    /// # Errors
    ///
    /// - [`QuarryError::MalformedQueryset`] when no action was set
    /// - [`QuarryError::NotFound`] / [`QuarryError::MultipleResultsFound`] for `get`
    /// - driver failures, classified
    pub async fn resolve(&mut self) -> Result<QueryOutput<Sh::Item>> {
        if self.resolved.is_none() {
            let resolved = self.execute().await?;
            self.resolved = Some(resolved);
        }
        match (&self.action, &self.resolved) {
            (_, Some(Resolved::Count(n))) => Ok(QueryOutput::Count(*n)),
            (Some(Action::Get), Some(Resolved::Rows(rows))) => {
                Sh::shape(self.single(rows)?.clone()).map(QueryOutput::One)
            }
            (_, Some(Resolved::Rows(rows))) => rows
                .iter()
                .cloned()
                .map(Sh::shape)
                .collect::<Result<Vec<_>>>()
                .map(QueryOutput::Many),
            (_, None) => Err(self.malformed("executor resolved without a result")),
        }
    }

    /// Resolves a `get` to its single raw row.
    async fn fetch_single_row(mut self) -> Result<Row> {
        match self.execute().await? {
            Resolved::Rows(rows) => self.single(&rows).cloned(),
            Resolved::Count(_) => Err(self.malformed("expected rows, found a count")),
        }
    }

    // ==================== writes ====================

    /// Applies timestamps, validation and auto-generated stripping before insert.
    fn prepare_insert(&self, mut row: Row, validate: bool) -> Result<Row> {
        if !self.meta.auto_now_add.is_empty() {
            let now = self.router.now_value();
            for field in self.meta.auto_now_add {
                row.insert(*field, now.clone());
            }
        }
        if validate {
            row = M::from_row(row)?.to_row();
        }
        for field in self.meta.auto_generated {
            row.remove(field);
        }
        Ok(row)
    }

    /// Inserts one record and returns it with its new primary key.
    ///
    /// # Errors
    ///
    /// [`QuarryError::DuplicateKey`] on a unique violation, with the table name.
    pub async fn create(self, values: Row) -> Result<Sh::Item> {
        self.create_with(values, None).await
    }

    /// [`QueryExecutor::create`] with an ON CONFLICT clause. When the
    /// conflict skips the insert, the record comes back without a new key.
    pub async fn create_with(self, values: Row, on_conflict: Option<OnConflict>) -> Result<Sh::Item> {
        if let Some(on_conflict) = &on_conflict {
            on_conflict.validate(self.meta.name)?;
        }
        let table = self.meta.table;
        let pk = self.meta.primary_key;
        let mut row = self.prepare_insert(values, true)?;
        let sql = Insert::new(table, row.clone())?
            .on_conflict(on_conflict)
            .returning(pk)
            .build()?;
        let rows = self
            .router
            .write()?
            .execute(&sql, Some(table), self.tx)
            .await?;
        if let Some(new_id) = rows.first().and_then(|r| r.get(NEW_ID)) {
            row.insert(pk, new_id.clone());
        }
        Sh::shape(row)
    }

    /// Inserts a batch in one transaction and returns the number of rows
    /// inserted. The first row's columns define the column list.
    ///
    /// # Errors
    ///
    /// - [`QuarryError::NothingToCreate`] for an empty batch, before any I/O
    /// - [`QuarryError::MalformedQueryset`] for a row missing a column, or
    ///   an incomplete ON CONFLICT UPDATE
    pub async fn bulk_create(self, rows: Vec<Row>, options: BulkOptions) -> Result<u64> {
        if rows.is_empty() {
            return Err(QuarryError::NothingToCreate);
        }
        if let Some(on_conflict) = &options.on_conflict {
            on_conflict.validate(self.meta.name)?;
        }
        let prepared = rows
            .into_iter()
            .map(|row| self.prepare_insert(row, !options.skip_validation))
            .collect::<Result<Vec<_>>>()?;
        let columns: Vec<CompactString> = prepared[0].keys().map(CompactString::from).collect();

        let mut batch = Vec::with_capacity(prepared.len());
        for (idx, row) in prepared.iter().enumerate() {
            if let Some(missing) = columns.iter().find(|c| !row.contains(c)) {
                return Err(self.malformed(format!(
                    "bulk_create row {idx} is missing column \"{missing}\""
                )));
            }
            batch.push(
                Insert::new(self.meta.table, row.project(&columns))?
                    .on_conflict(options.on_conflict.clone())
                    .returning(self.meta.primary_key)
                    .build()?,
            );
        }

        let results = self
            .router
            .write()?
            .execute_many(&batch, Some(self.meta.table), self.tx)
            .await?;
        Ok(results.iter().map(|rows| rows.len() as u64).sum())
    }

    /// Fetches the single match of `lookup`, or creates it from `lookup`
    /// merged with `defaults`. The flag is true when a row was created.
    ///
    /// [`QuarryError::MultipleResultsFound`] is never swallowed.
    pub async fn get_or_create(self, lookup: Filters, defaults: Row) -> Result<(Sh::Item, bool)> {
        let creator: QueryExecutor<'r, M, Sh> = self.sibling();
        let finder: QueryExecutor<'r, M, AsRow> = self.sibling();
        match finder.get(lookup.clone())?.fetch_single_row().await {
            Ok(row) => Ok((Sh::shape(row)?, false)),
            Err(err) if err.is_not_found() => {
                let values = plain_fields(lookup).merge(defaults);
                Ok((creator.create(values).await?, true))
            }
            Err(err) => Err(err),
        }
    }

    /// Like [`QueryExecutor::get_or_create`], but a found row is updated
    /// with `defaults` and saved.
    pub async fn update_or_create(self, lookup: Filters, defaults: Row) -> Result<(Sh::Item, bool)> {
        let creator: QueryExecutor<'r, M, Sh> = self.sibling();
        let finder: QueryExecutor<'r, M, AsRow> = self.sibling();
        match finder.get(lookup.clone())?.fetch_single_row().await {
            Ok(row) => {
                let mut row = row.merge(defaults);
                save_row(self.router, self.meta, &mut row, None, self.tx).await?;
                Ok((Sh::shape(row)?, false))
            }
            Err(err) if err.is_not_found() => {
                let values = plain_fields(lookup).merge(defaults);
                Ok((creator.create(values).await?, true))
            }
            Err(err) => Err(err),
        }
    }
}

impl<'r, M: Model, Sh: Shape<M>> IntoFuture for QueryExecutor<'r, M, Sh> {
    type Output = Result<QueryOutput<Sh::Item>>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send + 'r>>;

    fn into_future(mut self) -> Self::IntoFuture {
        Box::pin(async move { self.resolve().await })
    }
}

#[async_trait]
impl<'r, M: Model, Sh: Shape<M>> PrefetchQuery<'r> for QueryExecutor<'r, M, Sh> {
    fn meta(&self) -> &'static ModelMeta {
        self.meta
    }

    async fn fetch_in(
        self: Box<Self>,
        field: &str,
        keys: Vec<Value>,
        tx: Option<&'r Transaction>,
    ) -> Result<Vec<Row>> {
        let mut query = (*self).filter(Filters::new().with(format!("{field}__in"), keys))?;
        if query.tx.is_none() {
            query.tx = tx;
        }
        match query.execute().await? {
            Resolved::Rows(rows) => Ok(rows),
            Resolved::Count(_) => Err(query.malformed("prefetch query must select rows")),
        }
    }
}

// ==================== helpers ====================

/// Lookup keys without a suffix, usable as insert values.
fn plain_fields(lookup: Filters) -> Row {
    lookup
        .into_iter()
        .filter(|(key, _)| !key.contains("__"))
        .collect()
}

fn count_of(rows: &[Row], column: &str) -> Result<u64> {
    let value = rows
        .first()
        .and_then(|row| row.get(column).or_else(|| row.iter().next().map(|(_, v)| v)))
        .ok_or_else(|| QuarryError::Decode(format!("missing column '{column}'")))?;
    value
        .as_i64()
        .and_then(|n| u64::try_from(n).ok())
        .ok_or_else(|| QuarryError::Decode(format!("column '{column}' is not a count")))
}

/// Folds `t_*`/`r_*` joined rows back into one base row per primary key,
/// with the related row nested under the relation name (null when the join
/// matched nothing).
fn denormalize(rows: Vec<Row>, pk: &str, relation: &Relation) -> Vec<Row> {
    let base_prefix = format!("{BASE_ALIAS}_");
    let related_prefix = format!("{RELATED_ALIAS}_");
    let related_name = relation.related_name.as_str();

    let mut out: Vec<Row> = Vec::with_capacity(rows.len());
    let mut seen: HashMap<ValueKey, usize> = HashMap::with_capacity(rows.len());
    for raw in rows {
        let mut base = Row::with_capacity(raw.len());
        let mut related = Row::new();
        for (key, value) in raw {
            if let Some(field) = key.strip_prefix(base_prefix.as_str()) {
                base.insert(field, value);
            } else if let Some(field) = key.strip_prefix(related_prefix.as_str()) {
                related.insert(field, value);
            }
        }
        let matched = related
            .get(relation.primary_key)
            .is_some_and(|value| !value.is_null());
        let attached = if matched {
            Value::Object(related)
        } else {
            Value::Null
        };

        let identity = base.get(pk).and_then(Value::key);
        if let Some(&idx) = identity.as_ref().and_then(|key| seen.get(key)) {
            if matched && out[idx].get(related_name).is_none_or(Value::is_null) {
                out[idx].insert(related_name, attached);
            }
            continue;
        }
        base.insert(related_name, attached);
        if let Some(key) = identity {
            seen.insert(key, out.len());
        }
        out.push(base);
    }
    out
}
