//! Insertion-ordered field mappings.

use compact_str::CompactString;
use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::error::{QuarryError, Result};
use crate::model::Model;
use crate::value::{FromValue, Value, decode_model};

/// A plain field → value mapping that preserves insertion order.
///
/// Rows are what the database hands back and what `create` consumes; the
/// first row's key order defines the column list of a batch insert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    fields: Vec<(CompactString, Value)>,
}

impl Row {
    #[inline]
    pub const fn new() -> Self {
        Self { fields: Vec::new() }
    }

    #[inline]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            fields: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(key, _)| key == name)
    }

    /// Sets `name`, replacing an existing value in place.
    pub fn insert(&mut self, name: impl Into<CompactString>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.position(&name) {
            Some(idx) => self.fields[idx].1 = value,
            None => self.fields.push((name, value)),
        }
    }

    /// Builder form of [`Row::insert`].
    #[inline]
    pub fn with(mut self, name: impl Into<CompactString>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    #[inline]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.position(name).map(|idx| &self.fields[idx].1)
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.position(name).map(|idx| self.fields.remove(idx).1)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(key, value)| (key.as_str(), value))
    }

    /// Overlays `other` on top of `self`; keys in `other` win.
    pub fn merge(mut self, other: Row) -> Self {
        for (key, value) in other.fields {
            self.insert(key, value);
        }
        self
    }

    /// Keeps only the listed fields, in the listed order.
    pub fn project<S: AsRef<str>>(&self, names: &[S]) -> Row {
        names
            .iter()
            .filter_map(|name| {
                self.get(name.as_ref())
                    .map(|value| (CompactString::from(name.as_ref()), value.clone()))
            })
            .collect()
    }

    /// Clones a field out and converts it.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::Decode`] when the field is missing or has the wrong type.
    pub fn get_as<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self
            .get(name)
            .ok_or_else(|| QuarryError::Decode(format!("missing column '{name}'")))?;
        T::from_value(value.clone())
            .map_err(|e| QuarryError::Decode(format!("column '{name}': {e}")))
    }

    /// Moves a field out and converts it; a missing field decodes from `Null`.
    pub fn take_as<T: FromValue>(&mut self, name: &str) -> Result<T> {
        let value = self.remove(name).unwrap_or_default();
        T::from_value(value).map_err(|e| QuarryError::Decode(format!("column '{name}': {e}")))
    }

    /// Decodes a record attached by `select_related`.
    pub fn related<M: Model>(&mut self, name: &str) -> Result<Option<M>> {
        decode_model(self.remove(name).unwrap_or_default())
    }

    /// Decodes a record set attached by `prefetch_related`.
    pub fn prefetched<M: Model>(&mut self, name: &str) -> Result<Vec<M>> {
        match self.remove(name) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::List(items)) => items
                .into_iter()
                .filter_map(|item| decode_model::<M>(item).transpose())
                .collect(),
            Some(other) => Err(QuarryError::Decode(format!(
                "prefetched set '{name}' is {}, not a list",
                other.type_name()
            ))),
        }
    }

    /// Renders as a JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_json()))
                .collect(),
        )
    }
}

impl<K: Into<CompactString>, V: Into<Value>> FromIterator<(K, V)> for Row {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (key, value) in iter {
            row.insert(key, value);
        }
        row
    }
}

impl IntoIterator for Row {
    type Item = (CompactString, Value);
    type IntoIter = std::vec::IntoIter<(CompactString, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (key, value) in &self.fields {
            map.serialize_entry(key.as_str(), value)?;
        }
        map.end()
    }
}
