//! Record-level helpers on top of [`Model`].

use compact_str::CompactString;
use quarry_core::{
    Assignment, Condition, ConditionBuilder, Delete, DELETED_COUNT, Filters, Model, ModelMeta,
    QuarryError, Result, Row, Statement, UPDATED_COUNT, Update, Value,
};

use crate::executor::QueryExecutor;
use crate::router::{ConnectionRouter, Transaction};

fn pk_condition(meta: &ModelMeta, row: &Row) -> Result<Condition> {
    let pk = row
        .get(meta.primary_key)
        .filter(|value| !value.is_null())
        .cloned()
        .ok_or_else(|| {
            QuarryError::malformed(meta.name, format!("record has no \"{}\"", meta.primary_key))
        })?;
    ConditionBuilder::base()
        .build(&Filters::new().with(meta.primary_key, pk))?
        .ok_or(QuarryError::UnrestrictedUpdate)
}

fn affected(rows: &[Row], column: &str) -> bool {
    rows.first()
        .and_then(|row| row.get(column))
        .and_then(Value::as_i64)
        .is_some_and(|n| n > 0)
}

/// Writes `row` back by primary key. Refreshes `auto_now` fields, which are
/// always written even when `columns` restricts the update.
pub(crate) async fn save_row(
    router: &ConnectionRouter,
    meta: &'static ModelMeta,
    row: &mut Row,
    columns: Option<&[&str]>,
    tx: Option<&Transaction>,
) -> Result<bool> {
    if !meta.auto_now.is_empty() {
        let now = router.now_value();
        for field in meta.auto_now {
            row.insert(*field, now.clone());
        }
    }
    let filter = pk_condition(meta, row)?;

    let fields: Vec<CompactString> = match columns {
        Some(columns) => columns
            .iter()
            .copied()
            .chain(meta.auto_now.iter().copied())
            .map(CompactString::from)
            .collect(),
        None => meta.fields.iter().map(|f| CompactString::from(*f)).collect(),
    };
    let assignments = row
        .project(&fields)
        .into_iter()
        .filter(|(field, _)| field.as_str() != meta.primary_key && !meta.is_auto_generated(field))
        .map(|(field, value)| Assignment::parse(&field, value))
        .collect::<Result<Vec<_>>>()?;
    if assignments.is_empty() {
        return Err(QuarryError::malformed(meta.name, "save() found no fields to write"));
    }

    let sql = Update {
        table: meta.table.into(),
        pk: meta.primary_key.into(),
        assignments,
        filter,
    }
    .build()?;
    let rows = router.write()?.execute(&sql, Some(meta.table), tx).await?;
    Ok(affected(&rows, UPDATED_COUNT))
}

/// Executor entry points and persistence for records.
#[allow(async_fn_in_trait)]
pub trait ModelExt: Model {
    /// A fresh executor over this model.
    fn objects(router: &ConnectionRouter) -> Result<QueryExecutor<'_, Self>> {
        QueryExecutor::new(router)
    }

    /// Updates this record by primary key, all fields or only `columns`.
    /// Refreshed `auto_now` values are written back into `self`. Returns
    /// false when no row matched.
    async fn save(&mut self, router: &ConnectionRouter, columns: Option<&[&str]>) -> Result<bool> {
        save_record(self, router, columns, None).await
    }

    /// [`ModelExt::save`] inside the caller's transaction.
    async fn save_in(
        &mut self,
        router: &ConnectionRouter,
        tx: &Transaction,
        columns: Option<&[&str]>,
    ) -> Result<bool> {
        save_record(self, router, columns, Some(tx)).await
    }

    /// Deletes this record by primary key. Returns false when no row matched.
    async fn delete(&self, router: &ConnectionRouter) -> Result<bool> {
        delete_record(self, router, None).await
    }

    /// [`ModelExt::delete`] inside the caller's transaction.
    async fn delete_in(&self, router: &ConnectionRouter, tx: &Transaction) -> Result<bool> {
        delete_record(self, router, Some(tx)).await
    }
}

async fn save_record<M: Model>(
    record: &mut M,
    router: &ConnectionRouter,
    columns: Option<&[&str]>,
    tx: Option<&Transaction>,
) -> Result<bool> {
    let meta = M::meta()?;
    let mut row = record.to_row();
    let saved = save_row(router, meta, &mut row, columns, tx).await?;
    *record = M::from_row(row)?;
    Ok(saved)
}

async fn delete_record<M: Model>(
    record: &M,
    router: &ConnectionRouter,
    tx: Option<&Transaction>,
) -> Result<bool> {
    let meta = M::meta()?;
    let filter = pk_condition(meta, &record.to_row())?;
    let sql = Delete {
        table: meta.table.into(),
        pk: meta.primary_key.into(),
        filter,
    }
    .build()?;
    let rows = router.write()?.execute(&sql, Some(meta.table), tx).await?;
    Ok(affected(&rows, DELETED_COUNT))
}

impl<M: Model> ModelExt for M {}
