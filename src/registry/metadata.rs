//! Metadata Repository
//!
//! Loads the persisted registry configuration (registries, fields, collection
//! fields, links) and combines it with catalog introspection into
//! [`RegistryDescriptor`]s. Everything here is cached under the global
//! [`CacheVersion`]; a hit never touches the catalog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};
use uuid::Uuid;

use super::cache::{CacheVersion, VersionedCache};
use super::descriptor::{build_descriptor, DescriptorInputs, RegistryDescriptor};
use super::introspect::{
    split_qualified, DisplayColumnDescription, SchemaCatalog, SchemaIntrospector,
};
use super::value::DataType;
use crate::error::{RegistryError, Result};

// ============================================================================
// Configuration rows
// ============================================================================

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct RegistryRow {
    pub id: Uuid,
    pub name: String,
    pub table_name: Option<String>,
    pub urban_planning_object_id: Option<Uuid>,
    pub oktmo_id: Option<Uuid>,
    pub spatial_data_pd_id: Option<Uuid>,
    pub layer_id: Option<Uuid>,
    pub layer_schema: Option<String>,
    pub layer_feature_class: Option<String>,
    pub spatial_data_field: Option<String>,
    pub map_id_field: Option<String>,
    pub resource_id: Option<Uuid>,
    /// Code of the permission resource; `None` when the resource was deleted.
    pub resource_name: Option<String>,
    pub linked_spatial_fields: Option<String>,
    pub store_history: bool,
    pub use_turning_points: bool,
    pub allow_imported_geometry_edit: bool,
    pub name_field_id: Option<Uuid>,
    pub latitude_field_id: Option<Uuid>,
    pub longitude_field_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct FieldRow {
    pub id: Uuid,
    pub spatial_data_registry_id: Option<Uuid>,
    pub column: Option<String>,
    pub data_type: Option<String>,
    pub alias: Option<String>,
    pub index: Option<i32>,
    pub foreign_table: Option<String>,
    pub foreign_table_key_column: Option<String>,
    pub foreign_table_display_column: Option<String>,
    pub not_null: Option<bool>,
    pub is_primary_key: Option<bool>,
    pub is_auto_generated_column: Option<bool>,
    pub editor_type: Option<i32>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub validation_regexp: Option<String>,
    pub validation_tooltip: Option<String>,
    pub show_when_selected: Option<bool>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct CollectionFieldRow {
    pub id: Uuid,
    pub spatial_data_registry_id: Uuid,
    pub index: i32,
    pub alias: Option<String>,
    /// Join table.
    pub foreign_table: Option<String>,
    /// Join table column holding the record key.
    pub foreign_table_key_column: Option<String>,
    /// Join table column holding the related key.
    pub foreign_table_second_key_column: Option<String>,
    pub many_to_many_table: Option<String>,
    pub many_to_many_column: Option<String>,
    pub many_to_many_display_column: Option<String>,
    pub not_null: bool,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct LinkRow {
    pub id: Uuid,
    pub field_id: Uuid,
    pub link_type: i32,
    pub linked_field_id: Option<Uuid>,
    pub entity_table_column_name: Option<String>,
    pub alias: Option<String>,
    pub is_used: Option<bool>,
    /// Registry owning the source field.
    pub source_registry_id: Option<Uuid>,
}

/// Every registry configuration row, grouped for descriptor assembly.
#[derive(Debug, Clone, Default)]
pub struct MetadataSnapshot {
    pub registries: HashMap<Uuid, RegistryRow>,
    pub fields: HashMap<Uuid, FieldRow>,
    pub fields_by_registry: HashMap<Uuid, Vec<FieldRow>>,
    pub collection_fields_by_registry: HashMap<Uuid, Vec<CollectionFieldRow>>,
    pub links_by_registry: HashMap<Uuid, Vec<LinkRow>>,
}

impl MetadataSnapshot {
    pub fn from_rows(
        registries: Vec<RegistryRow>,
        fields: Vec<FieldRow>,
        collection_fields: Vec<CollectionFieldRow>,
        links: Vec<LinkRow>,
    ) -> Self {
        let mut snapshot = MetadataSnapshot::default();
        for field in fields {
            if let Some(registry_id) = field.spatial_data_registry_id {
                snapshot
                    .fields_by_registry
                    .entry(registry_id)
                    .or_default()
                    .push(field.clone());
            }
            snapshot.fields.insert(field.id, field);
        }
        for cf in collection_fields {
            snapshot
                .collection_fields_by_registry
                .entry(cf.spatial_data_registry_id)
                .or_default()
                .push(cf);
        }
        for link in links {
            let owner = link.source_registry_id.or_else(|| {
                snapshot
                    .fields
                    .get(&link.field_id)
                    .and_then(|f| f.spatial_data_registry_id)
            });
            if let Some(owner) = owner {
                snapshot.links_by_registry.entry(owner).or_default().push(link);
            }
        }
        snapshot.registries = registries.into_iter().map(|r| (r.id, r)).collect();
        snapshot
    }

    /// Registry whose physical table is `table`.
    pub fn registry_by_table(&self, table: &str) -> Option<&RegistryRow> {
        self.registries
            .values()
            .find(|r| r.table_name.as_deref() == Some(table))
    }
}

// ============================================================================
// Repository
// ============================================================================

const ALL_KEY: &str = "all";

pub struct MetadataRepository {
    pool: PgPool,
    introspector: SchemaIntrospector,
    registry_schema: String,
    snapshots: VersionedCache<&'static str, Arc<MetadataSnapshot>>,
    display_columns:
        VersionedCache<&'static str, Arc<HashMap<String, Vec<DisplayColumnDescription>>>>,
    descriptors: VersionedCache<Uuid, Arc<RegistryDescriptor>>,
}

impl MetadataRepository {
    pub fn new(pool: PgPool, registry_schema: impl Into<String>, ttl: Duration) -> Self {
        Self::with_version(pool, registry_schema, ttl, CacheVersion::global())
    }

    pub fn with_version(
        pool: PgPool,
        registry_schema: impl Into<String>,
        ttl: Duration,
        version: &'static CacheVersion,
    ) -> Self {
        Self {
            introspector: SchemaIntrospector::new(pool.clone()),
            pool,
            registry_schema: registry_schema.into(),
            snapshots: VersionedCache::new(version, ttl),
            display_columns: VersionedCache::new(version, ttl),
            descriptors: VersionedCache::new(version, ttl),
        }
    }

    pub fn introspector(&self) -> &SchemaIntrospector {
        &self.introspector
    }

    pub fn registry_schema(&self) -> &str {
        &self.registry_schema
    }

    /// Invalidate every cached descriptor, across all registries.
    pub fn invalidate(&self) -> u64 {
        self.snapshots.version().bump()
    }

    /// Configuration rows of every registry.
    pub async fn snapshot(&self) -> Result<Arc<MetadataSnapshot>> {
        self.snapshots
            .get_or_try_insert_with(ALL_KEY, || async {
                let snapshot = self.load_snapshot().await?;
                info!(
                    "Loaded registry metadata: {} registries, {} fields",
                    snapshot.registries.len(),
                    snapshot.fields.len()
                );
                Ok(Arc::new(snapshot))
            })
            .await
    }

    /// Descriptors of every registry bound to a table, keyed by registry id.
    /// One registry whose table is gone fails the whole call.
    pub async fn get_all_registries_descriptors(&self) -> Result<HashMap<Uuid, Arc<RegistryDescriptor>>> {
        let snapshot = self.snapshot().await?;
        let mut descriptors = HashMap::with_capacity(snapshot.registries.len());
        for registry in snapshot.registries.values() {
            if registry.table_name.is_none() {
                continue;
            }
            descriptors.insert(registry.id, self.get_registry_descriptor(registry.id).await?);
        }
        Ok(descriptors)
    }

    /// Display column types of every classifier table, keyed by `schema.table`.
    pub async fn get_all_classifier_display_column_descriptions(
        &self,
    ) -> Result<Arc<HashMap<String, Vec<DisplayColumnDescription>>>> {
        self.display_columns
            .get_or_try_insert_with(ALL_KEY, || async {
                let index = self.introspector.classifier_display_columns().await?;
                debug!("Indexed display columns of {} classifier tables", index.len());
                Ok(Arc::new(index))
            })
            .await
    }

    pub async fn get_registry_descriptor(&self, registry_id: Uuid) -> Result<Arc<RegistryDescriptor>> {
        self.descriptors
            .get_or_try_insert_with(registry_id, || async {
                let descriptor = self.build(registry_id).await?;
                debug!(
                    "Built descriptor for registry {} ({} columns)",
                    descriptor.name,
                    descriptor.columns.len()
                );
                Ok(Arc::new(descriptor))
            })
            .await
    }

    async fn build(&self, registry_id: Uuid) -> Result<RegistryDescriptor> {
        let snapshot = self.snapshot().await?;
        let registry = snapshot
            .registries
            .get(&registry_id)
            .ok_or_else(|| RegistryError::not_found(format!("registry {registry_id}")))?;
        let table = registry.table_name.as_deref().ok_or_else(|| {
            RegistryError::DescriptorBuild(format!("registry {} has no table", registry.name))
        })?;

        let physical = self
            .introspector
            .describe_table(&self.registry_schema, table)
            .await?;
        let display_columns = self.get_all_classifier_display_column_descriptions().await?;

        let mut link_value_types = HashMap::new();
        if let Some(collection_fields) = snapshot.collection_fields_by_registry.get(&registry_id) {
            for cf in collection_fields {
                let (Some(join), Some(second)) = (
                    cf.foreign_table.as_deref(),
                    cf.foreign_table_second_key_column.as_deref(),
                ) else {
                    continue;
                };
                let (schema, join_table) = split_qualified(join, &self.registry_schema);
                let columns = self.introspector.describe_table(schema, join_table).await?;
                if let Some(t) = columns
                    .iter()
                    .find(|c| c.name == second)
                    .and_then(|c| c.data_type)
                {
                    link_value_types.insert(cf.id, t);
                }
            }
        }

        build_descriptor(DescriptorInputs {
            snapshot: &snapshot,
            registry_id,
            schema: &self.registry_schema,
            physical_columns: &physical,
            display_columns: &display_columns,
            link_value_types: &link_value_types,
        })
    }

    async fn load_snapshot(&self) -> Result<MetadataSnapshot> {
        let registries = sqlx::query_as::<_, RegistryRow>(
            r#"
            SELECT r.id, r.name, r.table_name, r.urban_planning_object_id, r.oktmo_id,
                   r.spatial_data_pd_id, r.layer_id,
                   l.schema AS layer_schema, l.feature_class AS layer_feature_class,
                   r.spatial_data_field, r.map_id_field, r.resource_id,
                   res.name AS resource_name,
                   r.linked_spatial_fields,
                   COALESCE(r.store_history, false) AS store_history,
                   COALESCE(r.use_turning_points, false) AS use_turning_points,
                   COALESCE(r.allow_imported_geometry_edit, true) AS allow_imported_geometry_edit,
                   r.name_field_id, r.latitude_field_id, r.longitude_field_id
            FROM public.spatial_data_registry r
            LEFT JOIN public.resource res ON res.id = r.resource_id AND res.deleted IS NULL
            LEFT JOIN public.layer l ON l.id = r.layer_id
            WHERE r.deleted IS NULL AND COALESCE(r.is_deleted, false) = false
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let fields = sqlx::query_as::<_, FieldRow>(
            r#"
            SELECT id, spatial_data_registry_id, "column", data_type, alias, "index",
                   foreign_table, foreign_table_key_column, foreign_table_display_column,
                   not_null, is_primary_key, is_auto_generated_column, editor_type,
                   min_value, max_value, validation_regexp, validation_tooltip,
                   show_when_selected
            FROM public.spatial_data_registry_field
            WHERE COALESCE(data_type, '') <> 'geometry'
              AND COALESCE(is_deleted, false) = false
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let collection_fields = sqlx::query_as::<_, CollectionFieldRow>(
            r#"
            SELECT id, spatial_data_registry_id, "index", alias, foreign_table,
                   foreign_table_key_column, foreign_table_second_key_column,
                   many_to_many_table, many_to_many_column, many_to_many_display_column,
                   not_null
            FROM public.spatial_data_registry_collection_field
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let links = sqlx::query_as::<_, LinkRow>(
            r#"
            SELECT l.id, l.field_id, l.link_type, l.linked_field_id,
                   l.entity_table_column_name, l.alias, l."use" AS is_used,
                   f.spatial_data_registry_id AS source_registry_id
            FROM public.spatial_data_registry_links l
            JOIN public.spatial_data_registry_field f ON f.id = l.field_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(MetadataSnapshot::from_rows(
            registries,
            fields,
            collection_fields,
            links,
        ))
    }
}
