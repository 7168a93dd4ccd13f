//! Entity-to-table mapping metadata.
//!
//! An [`Entity`] declares its mapping once through [`EntityMapping`] (usually via
//! the [`impl_entity!`](crate::impl_entity) macro). [`EntityMeta::build`] turns the
//! directives into an immutable descriptor, and [`MetaCache`] keeps one descriptor
//! per type.
//!
//! # Concurrency
//!
//! The cache is copy-on-write: readers clone an `Arc` of the current map and
//! never observe a partially updated map. Inserts and [`MetaCache::refresh`]
//! build a new map and swap it in under a short write lock.

use crate::error::{DbError, DbResult};
use crate::models::value::SqlValue;
use convert_case::{Case, Casing};
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

/// A type mapped to a table.
pub trait Entity: Default + Send + Sync + 'static {
    fn mapping() -> EntityMapping<Self>;
}

pub type Getter<E> = fn(&E) -> SqlValue;
pub type Setter<E> = fn(&mut E, SqlValue) -> DbResult<()>;

/// Field-level encryption marker. The key id is consumed by a downstream value
/// transform, not by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Encryption {
    pub key_id: Option<String>,
}

/// Declarative directives for one field.
pub struct FieldMapping<E> {
    name: &'static str,
    column: Option<String>,
    primary_key: bool,
    auto_generated: bool,
    ignored: bool,
    encryption: Option<Encryption>,
    getter: Getter<E>,
    setter: Setter<E>,
}

impl<E> FieldMapping<E> {
    pub fn new(name: &'static str, getter: Getter<E>, setter: Setter<E>) -> Self {
        Self {
            name,
            column: None,
            primary_key: false,
            auto_generated: false,
            ignored: false,
            encryption: None,
            getter,
            setter,
        }
    }

    /// Override the column name.
    pub fn column(mut self, column: &str) -> Self {
        self.column = Some(column.to_string());
        self
    }

    pub fn primary_key(mut self, auto_generated: bool) -> Self {
        self.primary_key = true;
        self.auto_generated = auto_generated;
        self
    }

    /// Exclude the field from the mapping entirely.
    pub fn ignore(mut self) -> Self {
        self.ignored = true;
        self
    }

    pub fn encrypted(mut self, key_id: Option<&str>) -> Self {
        self.encryption = Some(Encryption {
            key_id: key_id.map(String::from),
        });
        self
    }
}

/// Table name plus field directives, in declaration order.
pub struct EntityMapping<E> {
    table: String,
    fields: Vec<FieldMapping<E>>,
}

impl<E> EntityMapping<E> {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, field: FieldMapping<E>) -> Self {
        self.fields.push(field);
        self
    }
}

/// Resolved metadata for one mapped field.
pub struct FieldMeta<E> {
    field_name: &'static str,
    column_name: String,
    primary_key: bool,
    auto_generated: bool,
    encryption: Option<Encryption>,
    getter: Getter<E>,
    setter: Setter<E>,
}

impl<E> FieldMeta<E> {
    pub fn field_name(&self) -> &str {
        self.field_name
    }

    pub fn column_name(&self) -> &str {
        &self.column_name
    }

    pub fn is_primary_key(&self) -> bool {
        self.primary_key
    }

    pub fn is_auto_generated(&self) -> bool {
        self.auto_generated
    }

    pub fn encryption(&self) -> Option<&Encryption> {
        self.encryption.as_ref()
    }

    pub fn get(&self, entity: &E) -> SqlValue {
        (self.getter)(entity)
    }

    pub fn set(&self, entity: &mut E, value: SqlValue) -> DbResult<()> {
        (self.setter)(entity, value)
    }
}

impl<E> std::fmt::Debug for FieldMeta<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldMeta")
            .field("field_name", &self.field_name)
            .field("column_name", &self.column_name)
            .field("primary_key", &self.primary_key)
            .field("auto_generated", &self.auto_generated)
            .field("encryption", &self.encryption)
            .finish()
    }
}

/// Immutable mapping descriptor for an entity type.
pub struct EntityMeta<E> {
    table_name: String,
    fields: Vec<FieldMeta<E>>,
    primary_key: Option<usize>,
}

impl<E> std::fmt::Debug for EntityMeta<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityMeta")
            .field("table_name", &self.table_name)
            .field("fields", &self.fields)
            .finish()
    }
}

impl<E> EntityMeta<E> {
    /// Resolve and validate a mapping.
    pub fn build(mapping: EntityMapping<E>) -> DbResult<Self> {
        let table_name = mapping.table.trim().to_string();
        if table_name.is_empty() {
            return Err(DbError::meta("table name is required", "<entity>"));
        }

        let mut fields = Vec::with_capacity(mapping.fields.len());
        let mut columns = HashSet::new();
        let mut primary_key = None;

        for directive in mapping.fields.into_iter().filter(|f| !f.ignored) {
            let column_name = directive
                .column
                .unwrap_or_else(|| directive.name.to_case(Case::Snake));

            if !columns.insert(column_name.to_ascii_lowercase()) {
                return Err(DbError::meta(
                    format!("column '{}' is mapped more than once", column_name),
                    table_name.clone(),
                ));
            }

            if directive.primary_key {
                if primary_key.is_some() {
                    return Err(DbError::meta(
                        "at most one primary key field is allowed",
                        table_name.clone(),
                    ));
                }
                primary_key = Some(fields.len());
            }

            fields.push(FieldMeta {
                field_name: directive.name,
                column_name,
                primary_key: directive.primary_key,
                auto_generated: directive.primary_key && directive.auto_generated,
                encryption: directive.encryption,
                getter: directive.getter,
                setter: directive.setter,
            });
        }

        Ok(Self {
            table_name,
            fields,
            primary_key,
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn fields(&self) -> &[FieldMeta<E>] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldMeta<E>> {
        self.fields.iter().find(|f| f.field_name == name)
    }

    /// Column for a field name; also accepts a column name directly.
    pub fn column_for(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.field_name == name || f.column_name.eq_ignore_ascii_case(name))
            .map(|f| f.column_name.as_str())
    }

    pub fn primary_key(&self) -> Option<&FieldMeta<E>> {
        self.primary_key.map(|i| &self.fields[i])
    }

    /// Fields that appear in INSERT value lists.
    pub fn insertable_fields(&self) -> impl Iterator<Item = &FieldMeta<E>> {
        self.fields.iter().filter(|f| !f.auto_generated)
    }

    pub fn encrypted_fields(&self) -> impl Iterator<Item = &FieldMeta<E>> {
        self.fields.iter().filter(|f| f.encryption.is_some())
    }

    /// Check the mapping against the columns actually present in the table.
    pub fn check_columns(&self, actual: &[String]) -> DbResult<()> {
        if actual.is_empty() {
            return Err(DbError::meta("table not found or has no columns", self.table_name.clone()));
        }
        let present: HashSet<String> = actual.iter().map(|c| c.to_ascii_lowercase()).collect();
        let missing: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| !present.contains(&f.column_name.to_ascii_lowercase()))
            .map(|f| f.column_name.as_str())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(DbError::meta(
                format!("unknown columns: {}", missing.join(", ")),
                self.table_name.clone(),
            ))
        }
    }
}

impl<E: Entity> EntityMeta<E> {
    /// Populate a fresh entity from a row, matching columns case-insensitively.
    pub fn from_row(&self, row: &crate::models::Row) -> DbResult<E> {
        let mut entity = E::default();
        for field in &self.fields {
            if let Some(value) = row.get(&field.column_name) {
                field.set(&mut entity, value.clone())?;
            }
        }
        Ok(entity)
    }
}

type AnyMeta = Arc<dyn Any + Send + Sync>;
type MetaBuilder = fn() -> DbResult<AnyMeta>;

struct CacheEntry {
    meta: AnyMeta,
    builder: MetaBuilder,
}

fn build_any<E: Entity>() -> DbResult<AnyMeta> {
    Ok(Arc::new(EntityMeta::<E>::build(E::mapping())?))
}

/// Per-type metadata cache with copy-on-write replacement.
#[derive(Default)]
pub struct MetaCache {
    entries: RwLock<Arc<HashMap<TypeId, Arc<CacheEntry>>>>,
}

impl std::fmt::Debug for MetaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaCache")
            .field("entries", &self.len())
            .finish()
    }
}

impl MetaCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<HashMap<TypeId, Arc<CacheEntry>>> {
        Arc::clone(&self.entries.read())
    }

    /// Get the descriptor for `E`, building it on first use.
    pub fn get<E: Entity>(&self) -> DbResult<Arc<EntityMeta<E>>> {
        let key = TypeId::of::<E>();
        if let Some(entry) = self.snapshot().get(&key) {
            return downcast(&entry.meta);
        }

        let entry = Arc::new(CacheEntry {
            meta: build_any::<E>()?,
            builder: build_any::<E>,
        });
        {
            let mut guard = self.entries.write();
            // Another caller may have won the race; keep theirs.
            if let Some(existing) = guard.get(&key) {
                return downcast(&existing.meta);
            }
            let mut next = HashMap::clone(&guard);
            next.insert(key, Arc::clone(&entry));
            *guard = Arc::new(next);
        }
        debug!(entity = std::any::type_name::<E>(), "Cached entity metadata");
        downcast(&entry.meta)
    }

    /// Rebuild every cached descriptor and swap the whole map in one step.
    pub fn refresh(&self) -> DbResult<()> {
        let current = self.snapshot();
        let mut next = HashMap::with_capacity(current.len());
        for (key, entry) in current.iter() {
            next.insert(
                *key,
                Arc::new(CacheEntry {
                    meta: (entry.builder)()?,
                    builder: entry.builder,
                }),
            );
        }
        *self.entries.write() = Arc::new(next);
        debug!(entries = current.len(), "Refreshed entity metadata cache");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn downcast<E: Entity>(meta: &AnyMeta) -> DbResult<Arc<EntityMeta<E>>> {
    Arc::clone(meta)
        .downcast::<EntityMeta<E>>()
        .map_err(|_| DbError::meta("cached metadata has the wrong type", std::any::type_name::<E>()))
}
