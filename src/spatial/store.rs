//! SpatialStore - every raw spatial statement lives behind this trait.
//!
//! The geometry engine decides *what* happens to a record's geometry rows;
//! a store decides *how*. [`PgSpatialStore`] runs on the caller's
//! transaction connection so record, file and geometry writes commit or
//! roll back together.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, Row};

use super::layer::{GeometryBinding, LayerTable};
use crate::error::Result;
use crate::registry::sql::{qualified, SqlBuilder};
use crate::registry::value::{CellValue, DataType};

/// A geometry as sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "value", rename_all = "lowercase")]
pub enum GeometryInput {
    Wkt(String),
    GeoJson(serde_json::Value),
}

impl GeometryInput {
    fn text(&self) -> String {
        match self {
            GeometryInput::Wkt(wkt) => wkt.clone(),
            GeometryInput::GeoJson(json) => json.to_string(),
        }
    }

    /// `ST_Transform(<geometry in source_srid>, target_srid)`.
    fn push_transformed(&self, builder: &mut SqlBuilder, source_srid: i32, target_srid: i32) {
        builder.push("ST_Transform(");
        match self {
            GeometryInput::Wkt(_) => {
                builder.push("ST_GeomFromText(");
                builder.push_bind(CellValue::Text(self.text()), DataType::Text);
                builder.push(", ");
            }
            GeometryInput::GeoJson(_) => {
                builder.push("ST_SetSRID(ST_GeomFromGeoJSON(");
                builder.push_bind(CellValue::Text(self.text()), DataType::Text);
                builder.push("), ");
            }
        }
        builder.push_bind(CellValue::Int(i64::from(source_srid)), DataType::Integer);
        builder.push("), ");
        builder.push_bind(CellValue::Int(i64::from(target_srid)), DataType::Integer);
        builder.push(")");
    }
}

#[async_trait]
pub trait SpatialStore: Send {
    /// Reproject a geometry, returning WKT.
    async fn transform_geometry(&mut self, geometry: &GeometryInput, from_srid: i32, to_srid: i32) -> Result<String>;

    async fn count_features(&mut self, layer: &LayerTable, back_ref: &str) -> Result<i64>;

    /// Insert a feature row. With `back_ref` the row joins an existing
    /// version chain and gets `start_date = now()`; without it the row gets
    /// a fresh key. Returns the row's back-reference value.
    async fn insert_feature(
        &mut self,
        layer: &LayerTable,
        geometry: &GeometryInput,
        source_srid: i32,
        back_ref: Option<&str>,
    ) -> Result<String>;

    /// Overwrite the geometry of every row with `back_ref`.
    async fn update_feature(
        &mut self,
        layer: &LayerTable,
        back_ref: &str,
        geometry: &GeometryInput,
        source_srid: i32,
    ) -> Result<u64>;

    /// `end_date = now()` on the open row.
    async fn close_current_version(&mut self, layer: &LayerTable, back_ref: &str) -> Result<u64>;

    /// Null the `end_date` of the row closed most recently.
    async fn reopen_latest_version(&mut self, layer: &LayerTable, back_ref: &str) -> Result<u64>;

    async fn delete_current_version(&mut self, layer: &LayerTable, back_ref: &str) -> Result<u64>;

    async fn delete_feature(&mut self, layer: &LayerTable, back_ref: &str) -> Result<u64>;

    /// Current geometry as GeoJSON in the layer projection.
    async fn current_geometry(&mut self, layer: &LayerTable, back_ref: &str) -> Result<Option<String>>;

    async fn read_forward_reference(&mut self, binding: &GeometryBinding, record_key: &CellValue) -> Result<Option<String>>;

    async fn write_forward_reference(
        &mut self,
        binding: &GeometryBinding,
        record_key: &CellValue,
        value: Option<&str>,
    ) -> Result<u64>;

    /// Null every record's forward reference equal to `value`.
    async fn clear_forward_references(&mut self, binding: &GeometryBinding, value: &str) -> Result<u64>;
}

// ============================================================================
// PostGIS implementation
// ============================================================================

pub struct PgSpatialStore<'c> {
    conn: &'c mut PgConnection,
}

impl<'c> PgSpatialStore<'c> {
    pub fn new(conn: &'c mut PgConnection) -> Self {
        Self { conn }
    }
}

fn push_back_ref_match(builder: &mut SqlBuilder, layer: &LayerTable, back_ref: &str) {
    builder
        .push(" WHERE ")
        .push_ident(&layer.back_ref_column)
        .push("::text = ")
        .push_bind(CellValue::Text(back_ref.to_string()), DataType::Text);
}

#[async_trait]
impl SpatialStore for PgSpatialStore<'_> {
    async fn transform_geometry(&mut self, geometry: &GeometryInput, from_srid: i32, to_srid: i32) -> Result<String> {
        let mut builder = SqlBuilder::new();
        builder.push("SELECT ST_AsText(");
        geometry.push_transformed(&mut builder, from_srid, to_srid);
        builder.push(") AS wkt");
        let row = builder.build().fetch_one(&mut *self.conn).await?;
        Ok(row.try_get("wkt")?)
    }

    async fn count_features(&mut self, layer: &LayerTable, back_ref: &str) -> Result<i64> {
        let mut builder = SqlBuilder::new();
        builder
            .push("SELECT COUNT(*) AS count FROM ")
            .push(&qualified(&layer.schema, &layer.table));
        push_back_ref_match(&mut builder, layer, back_ref);
        let row = builder.build().fetch_one(&mut *self.conn).await?;
        Ok(row.try_get("count")?)
    }

    async fn insert_feature(
        &mut self,
        layer: &LayerTable,
        geometry: &GeometryInput,
        source_srid: i32,
        back_ref: Option<&str>,
    ) -> Result<String> {
        let table = qualified(&layer.schema, &layer.table);
        let mut builder = SqlBuilder::new();
        builder
            .push("INSERT INTO ")
            .push(&table)
            .push(" (")
            .push_ident(&layer.key_column)
            .push(", ")
            .push_ident(&layer.geometry_column);
        if back_ref.is_some() {
            builder.push(", ").push_ident(&layer.back_ref_column).push(", start_date");
        }
        builder
            .push(") VALUES ((SELECT COALESCE(MAX(")
            .push_ident(&layer.key_column)
            .push("), 0) + 1 FROM ")
            .push(&table)
            .push("), ");
        geometry.push_transformed(&mut builder, source_srid, layer.srid);
        if let Some(back_ref) = back_ref {
            builder.push(", ");
            builder.push_bind(CellValue::Text(back_ref.to_string()), layer.back_ref_type);
            builder.push(", NOW()");
        }
        builder
            .push(") RETURNING ")
            .push_ident(&layer.back_ref_column)
            .push("::text AS back_ref");
        let row = builder.build().fetch_one(&mut *self.conn).await?;
        Ok(row.try_get("back_ref")?)
    }

    async fn update_feature(
        &mut self,
        layer: &LayerTable,
        back_ref: &str,
        geometry: &GeometryInput,
        source_srid: i32,
    ) -> Result<u64> {
        let mut builder = SqlBuilder::new();
        builder
            .push("UPDATE ")
            .push(&qualified(&layer.schema, &layer.table))
            .push(" SET ")
            .push_ident(&layer.geometry_column)
            .push(" = ");
        geometry.push_transformed(&mut builder, source_srid, layer.srid);
        push_back_ref_match(&mut builder, layer, back_ref);
        Ok(builder.build().execute(&mut *self.conn).await?.rows_affected())
    }

    async fn close_current_version(&mut self, layer: &LayerTable, back_ref: &str) -> Result<u64> {
        let mut builder = SqlBuilder::new();
        builder
            .push("UPDATE ")
            .push(&qualified(&layer.schema, &layer.table))
            .push(" SET end_date = NOW()");
        push_back_ref_match(&mut builder, layer, back_ref);
        builder.push(" AND end_date IS NULL");
        Ok(builder.build().execute(&mut *self.conn).await?.rows_affected())
    }

    async fn reopen_latest_version(&mut self, layer: &LayerTable, back_ref: &str) -> Result<u64> {
        // Rows sharing the maximum end_date are not ordered further.
        let table = qualified(&layer.schema, &layer.table);
        let mut builder = SqlBuilder::new();
        builder
            .push("UPDATE ")
            .push(&table)
            .push(" SET end_date = NULL WHERE ")
            .push_ident(&layer.key_column)
            .push(" = (SELECT ")
            .push_ident(&layer.key_column)
            .push(" FROM ")
            .push(&table);
        push_back_ref_match(&mut builder, layer, back_ref);
        builder.push(" AND end_date IS NOT NULL ORDER BY end_date DESC LIMIT 1)");
        Ok(builder.build().execute(&mut *self.conn).await?.rows_affected())
    }

    async fn delete_current_version(&mut self, layer: &LayerTable, back_ref: &str) -> Result<u64> {
        let mut builder = SqlBuilder::new();
        builder
            .push("DELETE FROM ")
            .push(&qualified(&layer.schema, &layer.table));
        push_back_ref_match(&mut builder, layer, back_ref);
        builder.push(" AND end_date IS NULL");
        Ok(builder.build().execute(&mut *self.conn).await?.rows_affected())
    }

    async fn delete_feature(&mut self, layer: &LayerTable, back_ref: &str) -> Result<u64> {
        let mut builder = SqlBuilder::new();
        builder
            .push("DELETE FROM ")
            .push(&qualified(&layer.schema, &layer.table));
        push_back_ref_match(&mut builder, layer, back_ref);
        Ok(builder.build().execute(&mut *self.conn).await?.rows_affected())
    }

    async fn current_geometry(&mut self, layer: &LayerTable, back_ref: &str) -> Result<Option<String>> {
        let mut builder = SqlBuilder::new();
        builder
            .push("SELECT ST_AsGeoJSON(")
            .push_ident(&layer.geometry_column)
            .push(") AS geojson FROM ")
            .push(&qualified(&layer.schema, &layer.table));
        push_back_ref_match(&mut builder, layer, back_ref);
        if layer.has_validity {
            builder.push(" AND end_date IS NULL");
        }
        builder.push(" LIMIT 1");
        let row = builder.build().fetch_optional(&mut *self.conn).await?;
        Ok(row.map(|r| r.try_get::<Option<String>, _>("geojson")).transpose()?.flatten())
    }

    async fn read_forward_reference(&mut self, binding: &GeometryBinding, record_key: &CellValue) -> Result<Option<String>> {
        let mut builder = SqlBuilder::new();
        builder
            .push("SELECT ")
            .push_ident(&binding.map_id_field)
            .push("::text AS forward_ref FROM ")
            .push(&qualified(&binding.registry_schema, &binding.registry_table))
            .push(" WHERE ")
            .push_ident(&binding.pk_column)
            .push(" = ")
            .push_bind(record_key.clone(), binding.pk_type);
        let row = builder.build().fetch_optional(&mut *self.conn).await?;
        let value: Option<String> = row.map(|r| r.try_get::<Option<String>, _>("forward_ref")).transpose()?.flatten();
        Ok(value.filter(|v| !v.is_empty()))
    }

    async fn write_forward_reference(
        &mut self,
        binding: &GeometryBinding,
        record_key: &CellValue,
        value: Option<&str>,
    ) -> Result<u64> {
        let value = match value {
            Some(v) => CellValue::Text(v.to_string()),
            None => CellValue::Null,
        };
        let mut builder = SqlBuilder::new();
        builder
            .push("UPDATE ")
            .push(&qualified(&binding.registry_schema, &binding.registry_table))
            .push(" SET ")
            .push_ident(&binding.map_id_field)
            .push(" = ")
            .push_bind(value, binding.map_id_type)
            .push(" WHERE ")
            .push_ident(&binding.pk_column)
            .push(" = ")
            .push_bind(record_key.clone(), binding.pk_type);
        Ok(builder.build().execute(&mut *self.conn).await?.rows_affected())
    }

    async fn clear_forward_references(&mut self, binding: &GeometryBinding, value: &str) -> Result<u64> {
        let mut builder = SqlBuilder::new();
        builder
            .push("UPDATE ")
            .push(&qualified(&binding.registry_schema, &binding.registry_table))
            .push(" SET ")
            .push_ident(&binding.map_id_field)
            .push(" = NULL WHERE ")
            .push_ident(&binding.map_id_field)
            .push("::text = ")
            .push_bind(CellValue::Text(value.to_string()), DataType::Text);
        Ok(builder.build().execute(&mut *self.conn).await?.rows_affected())
    }
}
