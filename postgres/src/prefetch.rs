//! Prefetching: one extra query per secondary set, stitched onto the base
//! rows in memory.

use core::any::TypeId;
use core::fmt;

use async_trait::async_trait;
use compact_str::CompactString;
use hashbrown::{HashMap, HashSet};
use quarry_core::{Model, ModelMeta, QuarryError, Result, Row, Value, ValueKey};

use crate::executor::{QueryExecutor, Shape};
use crate::router::Transaction;

/// A type-erased secondary executor.
#[async_trait]
pub(crate) trait PrefetchQuery<'r>: Send + 'r {
    fn meta(&self) -> &'static ModelMeta;

    /// Runs the query restricted to `field IN keys`, joining `tx` unless
    /// the query already carries its own transaction.
    async fn fetch_in(
        self: Box<Self>,
        field: &str,
        keys: Vec<Value>,
        tx: Option<&'r Transaction>,
    ) -> Result<Vec<Row>>;
}

/// A secondary query whose matches are attached to each base row under `name`.
///
/// The secondary model must declare a relation to the base model; its
/// foreign field decides which base row each match belongs to.
pub struct Prefetch<'r> {
    name: CompactString,
    query: Box<dyn PrefetchQuery<'r>>,
}

impl fmt::Debug for Prefetch<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Prefetch")
            .field("name", &self.name)
            .field("model", &self.query.meta().name)
            .finish()
    }
}

impl<'r> Prefetch<'r> {
    /// `query` may carry its own filters, ordering and joins; its action is
    /// refined to a filter on the foreign field.
    pub fn new<S, Sh>(name: impl Into<CompactString>, query: QueryExecutor<'r, S, Sh>) -> Self
    where
        S: Model,
        Sh: Shape<S>,
    {
        Self {
            name: name.into(),
            query: Box::new(query),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn bind(self, base: TypeId, base_name: &str) -> Result<BoundPrefetch<'r>> {
        let secondary = self.query.meta();
        let relation =
            secondary
                .relation_targeting(base)
                .ok_or_else(|| QuarryError::InvalidPrefetch {
                    model: base_name.to_string(),
                    secondary: secondary.name.to_string(),
                })?;
        Ok(BoundPrefetch {
            name: self.name,
            foreign_field: relation.foreign_field,
            id_field: relation.primary_key,
            query: self.query,
        })
    }
}

/// A prefetch resolved against the base model's metadata.
pub(crate) struct BoundPrefetch<'r> {
    name: CompactString,
    /// Column on the secondary table pointing at the base row
    foreign_field: &'static str,
    /// Base primary key the foreign field refers to
    id_field: &'static str,
    query: Box<dyn PrefetchQuery<'r>>,
}

impl<'r> BoundPrefetch<'r> {
    /// Fetches the secondary rows for every base key and attaches them as a
    /// list (possibly empty) to each base row.
    pub(crate) async fn attach(self, rows: &mut [Row], tx: Option<&'r Transaction>) -> Result<()> {
        let mut seen = HashSet::with_capacity(rows.len());
        let keys: Vec<Value> = rows
            .iter()
            .filter_map(|row| row.get(self.id_field))
            .filter(|value| value.key().is_some_and(|key| seen.insert(key)))
            .cloned()
            .collect();

        if keys.is_empty() {
            for row in rows.iter_mut() {
                row.insert(self.name.clone(), Value::List(Vec::new()));
            }
            return Ok(());
        }

        tracing::debug!(
            target: "quarry::query",
            prefetch = %self.name,
            keys = keys.len(),
            "prefetching"
        );
        let model = self.query.meta().name;
        let secondary = self.query.fetch_in(self.foreign_field, keys, tx).await?;

        let mut groups: HashMap<ValueKey, Vec<Value>> = HashMap::new();
        for row in secondary {
            let Some(value) = row.get(self.foreign_field) else {
                return Err(QuarryError::malformed(
                    model,
                    format!(
                        "prefetch \"{}\" needs \"{}\" among the selected columns",
                        self.name, self.foreign_field
                    ),
                ));
            };
            if let Some(key) = value.key() {
                groups.entry(key).or_default().push(Value::Object(row));
            }
        }

        for row in rows.iter_mut() {
            let matched = row
                .get(self.id_field)
                .and_then(Value::key)
                .and_then(|key| groups.get(&key).cloned())
                .unwrap_or_default();
            row.insert(self.name.clone(), Value::List(matched));
        }
        Ok(())
    }
}
