//! Schema introspection against the PostgreSQL catalog.
//!
//! Pure reads of `information_schema` and PostGIS `geometry_columns`; no
//! registry configuration is consulted here.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{PgPool, Row};

use super::value::DataType;
use crate::error::Result;

/// Target of a single-column foreign key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyRef {
    pub schema: String,
    pub table: String,
    pub column: String,
}

/// One catalog column.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhysicalColumn {
    pub name: String,
    /// `None` for types outside the supported vocabulary (geometry and
    /// other user-defined types).
    pub data_type: Option<DataType>,
    pub raw_type: String,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub foreign_key: Option<ForeignKeyRef>,
}

/// Geometry column of a feature table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GeometryColumn {
    pub column: String,
    /// `None` when the table was registered without an SRID.
    pub srid: Option<i32>,
    pub geometry_type: Option<String>,
}

/// Type of a classifier display column, keyed by `schema.table`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayColumnDescription {
    pub table: String,
    pub column: String,
    pub data_type: Option<DataType>,
    pub not_null: bool,
}

#[async_trait]
pub trait SchemaCatalog: Send + Sync {
    /// Columns of `schema.table` in ordinal order. Empty when the table
    /// does not exist.
    async fn describe_table(&self, schema: &str, table: &str) -> Result<Vec<PhysicalColumn>>;
}

#[derive(Clone, Debug)]
pub struct SchemaIntrospector {
    pool: PgPool,
}

impl SchemaIntrospector {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn geometry_column(&self, schema: &str, table: &str) -> Result<Option<GeometryColumn>> {
        let row = sqlx::query(
            r#"
            SELECT f_geometry_column::text AS column_name, srid, type::text AS geometry_type
            FROM public.geometry_columns
            WHERE f_table_schema = $1 AND f_table_name = $2
            LIMIT 1
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(None);
        };
        let srid: Option<i32> = r.try_get("srid")?;
        Ok(Some(GeometryColumn {
            column: r.try_get("column_name")?,
            srid: srid.filter(|s| *s > 0),
            geometry_type: r.try_get("geometry_type")?,
        }))
    }

    /// Every `(table, display column)` pair referenced by a registry field,
    /// with the display column's catalog type.
    pub async fn classifier_display_columns(
        &self,
    ) -> Result<HashMap<String, Vec<DisplayColumnDescription>>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT cc.table_schema::text AS table_schema, cc.table_name::text AS table_name,
                   cc.column_name::text AS column_name, cc.data_type::text AS data_type,
                   cc.is_nullable::text AS is_nullable
            FROM information_schema.columns cc
            JOIN public.spatial_data_registry_field f
              ON concat(cc.table_schema, '.', cc.table_name) = f.foreign_table
             AND cc.column_name = f.foreign_table_display_column
            WHERE f.foreign_table IS NOT NULL
              AND f.foreign_table_display_column IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<String, Vec<DisplayColumnDescription>> = HashMap::new();
        for r in rows {
            let schema: String = r.try_get("table_schema")?;
            let table: String = r.try_get("table_name")?;
            let data_type: String = r.try_get("data_type")?;
            let nullable: String = r.try_get("is_nullable")?;
            let key = format!("{schema}.{table}");
            grouped
                .entry(key.clone())
                .or_default()
                .push(DisplayColumnDescription {
                    table: key,
                    column: r.try_get("column_name")?,
                    data_type: DataType::from_catalog(&data_type),
                    not_null: nullable == "NO",
                });
        }
        Ok(grouped)
    }
}

#[async_trait]
impl SchemaCatalog for SchemaIntrospector {
    async fn describe_table(&self, schema: &str, table: &str) -> Result<Vec<PhysicalColumn>> {
        let pk_rows = sqlx::query(
            r#"
            SELECT x.column_name::text AS column_name
            FROM information_schema.table_constraints c
            JOIN information_schema.key_column_usage x
              ON x.constraint_name = c.constraint_name
             AND x.constraint_schema = c.constraint_schema
            WHERE x.table_schema = $1 AND x.table_name = $2
              AND c.constraint_type = 'PRIMARY KEY'
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        let primary_keys: Vec<String> = pk_rows
            .iter()
            .map(|r| r.try_get("column_name"))
            .collect::<std::result::Result<_, sqlx::Error>>()?;

        // Single-column foreign keys only; composite keys are not classifiers.
        let fk_rows = sqlx::query(
            r#"
            SELECT kcu.column_name::text AS column_name,
                   ccu.table_schema::text AS ref_schema,
                   ccu.table_name::text AS ref_table,
                   ccu.column_name::text AS ref_column
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
              ON kcu.constraint_name = tc.constraint_name
             AND kcu.constraint_schema = tc.constraint_schema
            JOIN information_schema.constraint_column_usage ccu
              ON ccu.constraint_name = tc.constraint_name
             AND ccu.constraint_schema = tc.constraint_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
              AND tc.table_schema = $1 AND tc.table_name = $2
              AND (SELECT COUNT(*) FROM information_schema.key_column_usage k2
                   WHERE k2.constraint_name = tc.constraint_name
                     AND k2.constraint_schema = tc.constraint_schema) = 1
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;
        let foreign_keys: HashMap<String, ForeignKeyRef> = fk_rows
            .iter()
            .map(|r| {
                Ok((
                    r.try_get::<String, _>("column_name")?,
                    ForeignKeyRef {
                        schema: r.try_get("ref_schema")?,
                        table: r.try_get("ref_table")?,
                        column: r.try_get("ref_column")?,
                    },
                ))
            })
            .collect::<std::result::Result<_, sqlx::Error>>()?;

        let rows = sqlx::query(
            r#"
            SELECT column_name::text AS column_name, data_type::text AS data_type,
                   is_nullable::text AS is_nullable
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(schema)
        .bind(table)
        .fetch_all(&self.pool)
        .await?;

        let mut columns: Vec<PhysicalColumn> = rows
            .iter()
            .map(|r| {
                let name: String = r.try_get("column_name")?;
                let raw_type: String = r.try_get("data_type")?;
                let nullable: String = r.try_get("is_nullable")?;
                Ok(PhysicalColumn {
                    is_primary_key: primary_keys.contains(&name),
                    foreign_key: foreign_keys.get(&name).cloned(),
                    data_type: DataType::from_catalog(&raw_type),
                    raw_type,
                    nullable: nullable == "YES",
                    name,
                })
            })
            .collect::<std::result::Result<_, sqlx::Error>>()?;

        apply_implicit_primary_key(&mut columns);
        Ok(columns)
    }
}

/// Tables without a declared primary key use their `id` column.
pub(crate) fn apply_implicit_primary_key(columns: &mut [PhysicalColumn]) {
    if columns.iter().any(|c| c.is_primary_key) {
        return;
    }
    if let Some(id) = columns.iter_mut().find(|c| c.name == "id") {
        id.is_primary_key = true;
    }
}

/// Split `schema.table`; a bare name falls into `default_schema`.
pub fn split_qualified<'a>(qualified: &'a str, default_schema: &'a str) -> (&'a str, &'a str) {
    match qualified.split_once('.') {
        Some((schema, table)) => (schema, table),
        None => (default_schema, qualified),
    }
}
