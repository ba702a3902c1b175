//! Record types, their table metadata and declared relations.

use core::any::TypeId;
use std::sync::{LazyLock, PoisonError, RwLock};

use compact_str::CompactString;
use hashbrown::HashMap;

use crate::error::{QuarryError, Result};
use crate::row::Row;
use crate::sql::validate_ident;

/// A typed record stored in one table.
///
/// ```
/// use quarry_core::{Model, Relation, Result, Row};
///
/// struct Profile { id: i64, bio: String }
///
/// impl Model for Profile {
///     const NAME: &'static str = "Profile";
///     const TABLE: &'static str = "profiles";
///     const PRIMARY_KEY: &'static str = "id";
///     const FIELDS: &'static [&'static str] = &["id", "bio"];
///     const AUTO_GENERATED: &'static [&'static str] = &["id"];
///
///     fn from_row(mut row: Row) -> Result<Self> {
///         Ok(Self { id: row.take_as("id")?, bio: row.take_as("bio")? })
///     }
///
///     fn to_row(&self) -> Row {
///         Row::new().with("id", self.id).with("bio", self.bio.as_str())
///     }
/// }
/// ```
pub trait Model: Sized + Send + Sync + 'static {
    /// Type name used in error messages
    const NAME: &'static str;
    const TABLE: &'static str;
    const PRIMARY_KEY: &'static str;
    /// Column names in declaration order
    const FIELDS: &'static [&'static str];
    /// Columns filled by the database, excluded from INSERT
    const AUTO_GENERATED: &'static [&'static str] = &[];
    /// Columns stamped with the current time on create
    const AUTO_NOW_ADD: &'static [&'static str] = &[];
    /// Columns stamped with the current time on save
    const AUTO_NOW: &'static [&'static str] = &[];

    /// Foreign-key relations this model declares.
    fn relations() -> Vec<Relation> {
        Vec::new()
    }

    /// Builds a record from a field mapping. This is also the validation
    /// hook run before inserts.
    fn from_row(row: Row) -> Result<Self>;

    /// Converts the record back into a field mapping.
    fn to_row(&self) -> Row;

    /// Validated metadata for this model.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::MalformedMeta`] when the declaration is inconsistent.
    #[inline]
    fn meta() -> Result<&'static ModelMeta> {
        ModelMeta::of::<Self>()
    }
}

// ==================== Relation ====================

/// A foreign key from the owning model to `target`, used for one LEFT JOIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    pub target: TypeId,
    pub target_name: &'static str,
    pub table: &'static str,
    pub primary_key: &'static str,
    pub fields: &'static [&'static str],
    /// Column on the owning table holding the target's primary key
    pub foreign_field: &'static str,
    /// Name the joined record is exposed under
    pub related_name: CompactString,
}

impl Relation {
    /// Declares a relation to `R` through `foreign_field`. The exposed name
    /// defaults to `R::NAME` in snake case.
    pub fn to<R: Model>(foreign_field: &'static str) -> Self {
        Self {
            target: TypeId::of::<R>(),
            target_name: R::NAME,
            table: R::TABLE,
            primary_key: R::PRIMARY_KEY,
            fields: R::FIELDS,
            foreign_field,
            related_name: snake_case(R::NAME),
        }
    }

    /// Overrides the exposed name.
    pub fn named(mut self, related_name: impl Into<CompactString>) -> Self {
        self.related_name = related_name.into();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.table.is_empty() || self.primary_key.is_empty() {
            return Err(QuarryError::MalformedMeta(self.target_name.to_string()));
        }
        validate_ident(self.foreign_field)?;
        validate_ident(&self.related_name)?;
        Ok(())
    }
}

fn snake_case(name: &str) -> CompactString {
    let mut out = CompactString::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

// ==================== ModelMeta ====================

/// Checked, cached view of a [`Model`] declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelMeta {
    pub type_id: TypeId,
    pub name: &'static str,
    pub table: &'static str,
    pub primary_key: &'static str,
    pub fields: &'static [&'static str],
    pub auto_generated: &'static [&'static str],
    pub auto_now_add: &'static [&'static str],
    pub auto_now: &'static [&'static str],
    pub relations: Vec<Relation>,
}

static REGISTRY: LazyLock<RwLock<HashMap<TypeId, &'static ModelMeta>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

impl ModelMeta {
    /// Returns the metadata of `M`, validating it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::MalformedMeta`] for a missing table or primary
    /// key, or a primary key that is not one of the fields.
    pub fn of<M: Model>() -> Result<&'static ModelMeta> {
        let id = TypeId::of::<M>();
        if let Some(meta) = REGISTRY
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            return Ok(*meta);
        }

        let meta = Self::build::<M>()?;
        let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
        Ok(*registry
            .entry(id)
            .or_insert_with(|| &*Box::leak(Box::new(meta))))
    }

    fn build<M: Model>() -> Result<ModelMeta> {
        let malformed = || QuarryError::MalformedMeta(M::NAME.to_string());
        if M::TABLE.is_empty() || M::PRIMARY_KEY.is_empty() {
            return Err(malformed());
        }
        if !M::FIELDS.contains(&M::PRIMARY_KEY) {
            return Err(malformed());
        }
        validate_ident(M::TABLE).map_err(|_| malformed())?;
        for field in M::FIELDS
            .iter()
            .chain(M::AUTO_GENERATED)
            .chain(M::AUTO_NOW_ADD)
            .chain(M::AUTO_NOW)
        {
            validate_ident(field).map_err(|_| malformed())?;
        }

        let relations = M::relations();
        for relation in &relations {
            relation.validate()?;
            if !M::FIELDS.contains(&relation.foreign_field) {
                return Err(malformed());
            }
        }

        Ok(ModelMeta {
            type_id: TypeId::of::<M>(),
            name: M::NAME,
            table: M::TABLE,
            primary_key: M::PRIMARY_KEY,
            fields: M::FIELDS,
            auto_generated: M::AUTO_GENERATED,
            auto_now_add: M::AUTO_NOW_ADD,
            auto_now: M::AUTO_NOW,
            relations,
        })
    }

    /// Looks up a relation by its exposed name.
    ///
    /// # Errors
    ///
    /// Returns [`QuarryError::InvalidRelatedField`] listing the declared names.
    pub fn relation(&self, name: &str) -> Result<&Relation> {
        self.relations
            .iter()
            .find(|relation| relation.related_name == name)
            .ok_or_else(|| QuarryError::InvalidRelatedField {
                model: self.name.to_string(),
                field: name.to_string(),
                valid: self.relation_names().map(str::to_string).collect(),
            })
    }

    pub fn relation_names(&self) -> impl Iterator<Item = &str> {
        self.relations.iter().map(|r| r.related_name.as_str())
    }

    /// The first relation pointing at the model with `target` type id.
    pub fn relation_targeting(&self, target: TypeId) -> Option<&Relation> {
        self.relations.iter().find(|r| r.target == target)
    }

    #[inline]
    pub fn is_auto_generated(&self, field: &str) -> bool {
        self.auto_generated.contains(&field)
    }
}

// ==================== registration ====================

/// A tuple of models validated together.
pub trait ModelSet {
    fn metas() -> Result<Vec<&'static ModelMeta>>;
}

macro_rules! impl_model_set {
    ($($model:ident),+) => {
        impl<$($model: Model),+> ModelSet for ($($model,)+) {
            fn metas() -> Result<Vec<&'static ModelMeta>> {
                Ok(vec![$($model::meta()?),+])
            }
        }
    };
}

impl_model_set!(A);
impl_model_set!(A, B);
impl_model_set!(A, B, C);
impl_model_set!(A, B, C, D);
impl_model_set!(A, B, C, D, E);
impl_model_set!(A, B, C, D, E, F);
impl_model_set!(A, B, C, D, E, F, G);
impl_model_set!(A, B, C, D, E, F, G, H);
impl_model_set!(A, B, C, D, E, F, G, H, I);
impl_model_set!(A, B, C, D, E, F, G, H, I, J);
impl_model_set!(A, B, C, D, E, F, G, H, I, J, K);
impl_model_set!(A, B, C, D, E, F, G, H, I, J, K, L);

/// Validates and caches the metadata of every model in `S`.
///
/// Call once at startup; otherwise a broken declaration only surfaces on
/// the first query against it.
///
/// ```
/// # use quarry_core::{Model, Result, Row, register};
/// # struct Tag;
/// # impl Model for Tag {
/// #     const NAME: &'static str = "Tag";
/// #     const TABLE: &'static str = "tags";
/// #     const PRIMARY_KEY: &'static str = "id";
/// #     const FIELDS: &'static [&'static str] = &["id", "name"];
/// #     fn from_row(_: Row) -> Result<Self> { Ok(Tag) }
/// #     fn to_row(&self) -> Row { Row::new() }
/// # }
/// register::<(Tag,)>()?;
/// # Ok::<(), quarry_core::QuarryError>(())
/// ```
///
/// # Errors
///
/// The first [`QuarryError::MalformedMeta`] (or identifier error) found.
pub fn register<S: ModelSet>() -> Result<Vec<&'static ModelMeta>> {
    S::metas()
}
