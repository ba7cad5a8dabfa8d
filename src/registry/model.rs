//! Dynamic Model Builder
//!
//! A [`ModelHandle`] is the runtime data-access object for one physical
//! table: its typed column list, primary key, optional classifier relations,
//! and point/list/count/insert/update/delete operations over a
//! `&mut PgConnection`. Handles are derived from a cached descriptor (or,
//! for classifier tables, from the catalog) and kept in a
//! [`HandleRegistry`] that is cleared by the metadata version counter.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use tracing::debug;
use uuid::Uuid;

use super::cache::CacheVersion;
use super::descriptor::RegistryDescriptor;
use super::introspect::SchemaCatalog;
use super::query::NativeQuerySpec;
use super::sql::{self, qualified, SelectTarget, SqlBuilder};
use super::value::{CellValue, DataType, Record};
use crate::error::{RegistryError, Result};

// ============================================================================
// Handle types
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ModelColumn {
    pub name: String,
    pub data_type: DataType,
    pub not_null: bool,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone)]
pub enum RelationTarget {
    /// The relation points back at the handle's own table.
    SelfLink,
    Table(Arc<ModelHandle>),
    /// Target is already being built further up the chain.
    Cyclic { schema: String, table: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelationKind {
    BelongsTo {
        foreign_key: String,
        target_key: String,
        display_column: Option<String>,
    },
    ManyToMany {
        link_schema: String,
        link_table: String,
        record_column: String,
        value_column: String,
        value_type: DataType,
        display_column: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct Relation {
    pub field_key: String,
    pub alias: String,
    pub kind: RelationKind,
    pub target: RelationTarget,
}

/// A row from a listing: the record plus classifier display text keyed by
/// column key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListedRow {
    pub record: Record,
    pub displays: HashMap<String, Option<String>>,
}

#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ModelColumn>,
    pub relations: Vec<Relation>,
    primary_key: Option<usize>,
}

// ============================================================================
// Handle registry
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum HandleKey {
    Registry { id: Uuid, nested: bool },
    Table(String),
}

/// Process-wide reuse of built handles, valid for one metadata version.
pub struct HandleRegistry {
    version: &'static CacheVersion,
    handles: RwLock<HashMap<HandleKey, (u64, Arc<ModelHandle>)>>,
}

impl HandleRegistry {
    pub fn new(version: &'static CacheVersion) -> Self {
        Self {
            version,
            handles: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, key: &HandleKey) -> Option<Arc<ModelHandle>> {
        let current = self.version.current();
        let handles = self.handles.read().ok()?;
        handles
            .get(key)
            .filter(|(v, _)| *v == current)
            .map(|(_, h)| h.clone())
    }

    fn register(&self, key: HandleKey, built_at: u64, handle: Arc<ModelHandle>) {
        if let Ok(mut handles) = self.handles.write() {
            let current = self.version.current();
            handles.retain(|_, (v, _)| *v == current);
            handles.insert(key, (built_at, handle));
        }
    }

    pub fn len(&self) -> usize {
        self.handles.read().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct ModelBuilder<'a> {
    catalog: &'a dyn SchemaCatalog,
    handles: &'a HandleRegistry,
}

impl<'a> ModelBuilder<'a> {
    pub fn new(catalog: &'a dyn SchemaCatalog, handles: &'a HandleRegistry) -> Self {
        Self { catalog, handles }
    }

    /// Handle over the registry table. With `resolve_nested`, every
    /// classifier and many-to-many column gets a relation whose target
    /// handle is built from the catalog.
    pub async fn build(&self, descriptor: &RegistryDescriptor, resolve_nested: bool) -> Result<Arc<ModelHandle>> {
        let key = HandleKey::Registry {
            id: descriptor.id,
            nested: resolve_nested,
        };
        if let Some(handle) = self.handles.get(&key) {
            return Ok(handle);
        }
        let built_at = self.handles.version.current();

        let columns: Vec<ModelColumn> = descriptor
            .scalar_columns()
            .map(|c| ModelColumn {
                name: c.key.clone(),
                data_type: c.data_type,
                not_null: c.not_null,
                is_primary_key: c.is_primary_key,
            })
            .collect();
        let primary_key = columns.iter().position(|c| c.is_primary_key);

        let mut relations = Vec::new();
        if resolve_nested {
            let own = qualified(&descriptor.schema, &descriptor.table_name);
            for column in descriptor.classifier_columns() {
                let Some(cls) = &column.classifier else {
                    continue;
                };
                let target = if cls.is_self_link {
                    RelationTarget::SelfLink
                } else {
                    self.nested(&cls.schema, &cls.table, vec![own.clone()]).await?
                };
                relations.push(Relation {
                    field_key: column.key.clone(),
                    alias: column.join_alias(),
                    kind: RelationKind::BelongsTo {
                        foreign_key: column.key.clone(),
                        target_key: cls.key_column.clone(),
                        display_column: cls.display_column.clone(),
                    },
                    target,
                });
            }
            for column in descriptor.many_to_many_columns() {
                let Some(m2m) = &column.many_to_many else {
                    continue;
                };
                let target = if m2m.is_self_link {
                    RelationTarget::SelfLink
                } else {
                    match (&m2m.target_schema, &m2m.target_table) {
                        (Some(schema), Some(table)) => self.nested(schema, table, vec![own.clone()]).await?,
                        _ => self.nested(&m2m.link_schema, &m2m.link_table, vec![own.clone()]).await?,
                    }
                };
                relations.push(Relation {
                    field_key: column.key.clone(),
                    alias: column.join_alias(),
                    kind: RelationKind::ManyToMany {
                        link_schema: m2m.link_schema.clone(),
                        link_table: m2m.link_table.clone(),
                        record_column: m2m.record_column.clone(),
                        value_column: m2m.value_column.clone(),
                        value_type: m2m.value_type,
                        display_column: m2m.target_display_column.clone(),
                    },
                    target,
                });
            }
        }

        let handle = Arc::new(ModelHandle {
            schema: descriptor.schema.clone(),
            table: descriptor.table_name.clone(),
            columns,
            relations,
            primary_key,
        });
        debug!(
            "Built model handle for registry {} ({} relations)",
            descriptor.name,
            handle.relations.len()
        );
        self.handles.register(key, built_at, handle.clone());
        Ok(handle)
    }

    /// Handle over a plain table, described from the catalog.
    pub async fn table(&self, schema: &str, table: &str) -> Result<Arc<ModelHandle>> {
        match self.nested(schema, table, Vec::new()).await? {
            RelationTarget::Table(handle) => Ok(handle),
            _ => Err(RegistryError::DescriptorBuild(format!("table {schema}.{table} is self-referencing"))),
        }
    }

    fn nested(&self, schema: &str, table: &str, visiting: Vec<String>) -> BoxFuture<'_, Result<RelationTarget>> {
        let schema = schema.to_string();
        let table = table.to_string();
        async move {
            let name = qualified(&schema, &table);
            if visiting.contains(&name) {
                return Ok(RelationTarget::Cyclic { schema, table });
            }
            let key = HandleKey::Table(name.clone());
            if let Some(handle) = self.handles.get(&key) {
                return Ok(RelationTarget::Table(handle));
            }
            let built_at = self.handles.version.current();

            let physical = self.catalog.describe_table(&schema, &table).await?;
            if physical.is_empty() {
                return Err(RegistryError::DescriptorBuild(format!(
                    "table {schema}.{table} does not exist"
                )));
            }

            let mut columns = Vec::new();
            let mut relations = Vec::new();
            let mut path = visiting.clone();
            path.push(name.clone());
            for column in &physical {
                let Some(data_type) = column.data_type else {
                    continue;
                };
                columns.push(ModelColumn {
                    name: column.name.clone(),
                    data_type,
                    not_null: !column.nullable,
                    is_primary_key: column.is_primary_key,
                });
                let Some(fk) = &column.foreign_key else {
                    continue;
                };
                let target = if fk.schema == schema && fk.table == table {
                    RelationTarget::SelfLink
                } else {
                    self.nested(&fk.schema, &fk.table, path.clone()).await?
                };
                relations.push(Relation {
                    field_key: column.name.clone(),
                    alias: format!("cls_{}", column.name),
                    kind: RelationKind::BelongsTo {
                        foreign_key: column.name.clone(),
                        target_key: fk.column.clone(),
                        display_column: None,
                    },
                    target,
                });
            }
            let primary_key = columns.iter().position(|c| c.is_primary_key);

            let handle = Arc::new(ModelHandle {
                schema,
                table,
                columns,
                relations,
                primary_key,
            });
            self.handles.register(key, built_at, handle.clone());
            Ok(RelationTarget::Table(handle))
        }
        .boxed()
    }
}

// ============================================================================
// Operations
// ============================================================================

impl ModelHandle {
    pub fn primary_key(&self) -> Result<&ModelColumn> {
        self.primary_key
            .map(|i| &self.columns[i])
            .ok_or_else(|| RegistryError::DescriptorBuild(format!("{}.{} has no primary key", self.schema, self.table)))
    }

    pub fn column(&self, name: &str) -> Option<&ModelColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn relation(&self, field_key: &str) -> Option<&Relation> {
        self.relations.iter().find(|r| r.field_key == field_key)
    }

    fn target(&self) -> SelectTarget<'_> {
        SelectTarget {
            schema: &self.schema,
            table: &self.table,
            columns: self.columns.iter().map(|c| c.name.as_str()).collect(),
        }
    }

    fn column_or_invalid(&self, name: &str) -> Result<&ModelColumn> {
        self.column(name)
            .ok_or_else(|| RegistryError::InvalidQuery(format!("unknown column '{name}'")))
    }

    pub fn decode_row(&self, row: &PgRow) -> Result<Record> {
        let mut record = Record::new();
        for column in &self.columns {
            record.insert(column.name.clone(), CellValue::decode(row, &column.name, column.data_type)?);
        }
        Ok(record)
    }

    fn push_returning(&self, builder: &mut SqlBuilder) {
        builder.push(" RETURNING ");
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            builder.push_ident(&column.name);
        }
    }

    pub async fn find_by_pk(&self, conn: &mut PgConnection, pk: &CellValue) -> Result<Option<Record>> {
        let column = self.primary_key()?.name.clone();
        self.find_one(conn, &column, pk).await
    }

    /// First row where `column = value`.
    pub async fn find_one(&self, conn: &mut PgConnection, column: &str, value: &CellValue) -> Result<Option<Record>> {
        let data_type = self.column_or_invalid(column)?.data_type;
        let mut builder = sql::render_list(&self.target(), &NativeQuerySpec::default());
        builder
            .push(" WHERE ")
            .push(sql::BASE_ALIAS)
            .push(".")
            .push_ident(column)
            .push(" = ")
            .push_bind(value.clone(), data_type)
            .push(" LIMIT 1");
        let row = builder.build().fetch_optional(&mut *conn).await?;
        row.map(|r| self.decode_row(&r)).transpose()
    }

    pub async fn list(&self, conn: &mut PgConnection, spec: &NativeQuerySpec) -> Result<Vec<ListedRow>> {
        let builder = sql::render_list(&self.target(), spec);
        let rows = builder.build().fetch_all(&mut *conn).await?;
        rows.iter()
            .map(|row| {
                let record = self.decode_row(row)?;
                let mut displays = HashMap::new();
                for join in spec.joins.iter().filter(|j| j.display_column.is_some()) {
                    let text: Option<String> = row.try_get(join.alias.as_str())?;
                    displays.insert(join.field_key.clone(), text);
                }
                Ok(ListedRow { record, displays })
            })
            .collect()
    }

    pub async fn count(&self, conn: &mut PgConnection, spec: &NativeQuerySpec) -> Result<i64> {
        let builder = sql::render_count(&self.target(), spec);
        let row = builder.build().fetch_one(&mut *conn).await?;
        Ok(row.try_get("count")?)
    }

    /// Insert the known columns of `record`. A null primary key is left to
    /// the column default.
    pub async fn insert(&self, conn: &mut PgConnection, record: &Record) -> Result<Record> {
        let pk = self.primary_key()?.name.clone();
        let values: Vec<(&ModelColumn, &CellValue)> = record
            .iter()
            .filter_map(|(name, value)| self.column(name).map(|c| (c, value)))
            .filter(|(c, v)| !(c.name == pk && v.is_null()))
            .collect();

        let mut builder = SqlBuilder::new();
        builder.push("INSERT INTO ").push(&qualified(&self.schema, &self.table));
        if values.is_empty() {
            builder.push(" DEFAULT VALUES");
        } else {
            builder.push(" (");
            for (i, (column, _)) in values.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push_ident(&column.name);
            }
            builder.push(") VALUES (");
            for (i, (column, value)) in values.iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                builder.push_bind((*value).clone(), column.data_type);
            }
            builder.push(")");
        }
        self.push_returning(&mut builder);

        let row = builder.build().fetch_one(&mut *conn).await?;
        self.decode_row(&row)
    }

    /// Update the known non-key columns of `record` on the row `pk`.
    pub async fn update(&self, conn: &mut PgConnection, pk: &CellValue, record: &Record) -> Result<Option<Record>> {
        let key = self.primary_key()?.clone();
        let values: Vec<(&ModelColumn, &CellValue)> = record
            .iter()
            .filter_map(|(name, value)| self.column(name).map(|c| (c, value)))
            .filter(|(c, _)| !c.is_primary_key)
            .collect();
        if values.is_empty() {
            return self.find_by_pk(conn, pk).await;
        }

        let mut builder = SqlBuilder::new();
        builder
            .push("UPDATE ")
            .push(&qualified(&self.schema, &self.table))
            .push(" SET ");
        for (i, (column, value)) in values.iter().enumerate() {
            if i > 0 {
                builder.push(", ");
            }
            builder
                .push_ident(&column.name)
                .push(" = ")
                .push_bind((*value).clone(), column.data_type);
        }
        builder
            .push(" WHERE ")
            .push_ident(&key.name)
            .push(" = ")
            .push_bind(pk.clone(), key.data_type);
        self.push_returning(&mut builder);

        let row = builder.build().fetch_optional(&mut *conn).await?;
        row.map(|r| self.decode_row(&r)).transpose()
    }

    pub async fn delete(&self, conn: &mut PgConnection, pk: &CellValue) -> Result<u64> {
        let key = self.primary_key()?;
        let mut builder = SqlBuilder::new();
        builder
            .push("DELETE FROM ")
            .push(&qualified(&self.schema, &self.table))
            .push(" WHERE ")
            .push_ident(&key.name)
            .push(" = ")
            .push_bind(pk.clone(), key.data_type);
        Ok(builder.build().execute(&mut *conn).await?.rows_affected())
    }
}

impl Relation {
    /// Related key values of a many-to-many relation for one record.
    pub async fn linked_values(&self, conn: &mut PgConnection, record_key: &CellValue, key_type: DataType) -> Result<Vec<CellValue>> {
        let RelationKind::ManyToMany {
            link_schema,
            link_table,
            record_column,
            value_column,
            value_type,
            ..
        } = &self.kind
        else {
            return Ok(Vec::new());
        };
        let mut builder = SqlBuilder::new();
        builder
            .push("SELECT ")
            .push_ident(value_column)
            .push(" FROM ")
            .push(&qualified(link_schema, link_table))
            .push(" WHERE ")
            .push_ident(record_column)
            .push(" = ")
            .push_bind(record_key.clone(), key_type);
        let rows = builder.build().fetch_all(&mut *conn).await?;
        rows.iter()
            .map(|r| Ok(CellValue::decode(r, value_column, *value_type)?))
            .collect()
    }
}
