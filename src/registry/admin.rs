//! Registry configuration CRUD
//!
//! Creating a registry provisions its permission resource with the four
//! record actions, the registry row, its field configurations and manual
//! links. Automatic links are kept as a JSON list on the registry row.
//! Deleting cascades through resource, actions, fields, links, other
//! registries' automatic link lists and section bindings. Every change
//! commits first and then invalidates the descriptor cache.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use super::diff::collection_diff;
use super::introspect::SchemaCatalog;
use super::metadata::MetadataRepository;
use crate::error::{RegistryError, Result, ValidationIssue};
use crate::ports::{require_capability, AccessControl, Actor, RegistryAction};

/// Resource guarding registry configuration itself.
pub const ADMIN_RESOURCE: &str = "spatialDataRegistry";

const RESOURCE_CATEGORY: &str = "Registries";

// ============================================================================
// Configuration payloads
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConfig {
    /// Set for fields that already exist.
    #[serde(default)]
    pub id: Option<Uuid>,
    pub column: String,
    pub data_type: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub index: i32,
    #[serde(default)]
    pub foreign_table: Option<String>,
    #[serde(default)]
    pub foreign_table_key_column: Option<String>,
    #[serde(default)]
    pub foreign_table_display_column: Option<String>,
    #[serde(default)]
    pub not_null: bool,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub is_auto_generated_column: bool,
    #[serde(default)]
    pub editor_type: Option<i32>,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    #[serde(default)]
    pub validation_regexp: Option<String>,
    #[serde(default)]
    pub validation_tooltip: Option<String>,
    #[serde(default)]
    pub show_when_selected: bool,
}

/// One link as edited on the configuration screen.
///
/// Automatic links name another registry's field in `field_id` and are only
/// kept when `checked`. Manual links belong to one of this registry's
/// fields, given by id or, for fields created in the same call, by column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkConfig {
    #[serde(default)]
    pub id: Option<Uuid>,
    #[serde(default)]
    pub field_id: Option<Uuid>,
    #[serde(default)]
    pub field_column: Option<String>,
    #[serde(default)]
    pub link_type: i32,
    #[serde(default)]
    pub linked_field_id: Option<Uuid>,
    #[serde(default)]
    pub entity_table_column_name: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub automatic: bool,
    #[serde(default)]
    pub checked: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    pub name: String,
    pub table_name: String,
    #[serde(default)]
    pub organization_id: Option<Uuid>,
    #[serde(default)]
    pub territory_id: Option<Uuid>,
    #[serde(default)]
    pub spatial_data_pd_id: Option<Uuid>,
    #[serde(default)]
    pub layer_id: Option<Uuid>,
    #[serde(default)]
    pub spatial_data_field: Option<String>,
    #[serde(default)]
    pub map_id_field: Option<String>,
    #[serde(default)]
    pub store_history: bool,
    #[serde(default)]
    pub use_turning_points: bool,
    #[serde(default = "default_true")]
    pub allow_imported_geometry_edit: bool,
    /// Column names; resolved to field ids on save.
    #[serde(default)]
    pub name_field: Option<String>,
    #[serde(default)]
    pub latitude_field: Option<String>,
    #[serde(default)]
    pub longitude_field: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryCreated {
    pub id: Uuid,
    pub name: String,
}

// ============================================================================
// Pure helpers
// ============================================================================

/// Serialize the checked automatic links as stored in
/// `linked_spatial_fields`.
pub fn automatic_links_json(links: &[LinkConfig]) -> String {
    let entries: Vec<JsonValue> = links
        .iter()
        .filter(|l| l.automatic && l.checked)
        .filter_map(|l| {
            l.field_id
                .map(|id| json!({ "SpatialDataRegistryFieldId": id, "Alias": l.alias }))
        })
        .collect();
    JsonValue::Array(entries).to_string()
}

/// Drop entries pointing at `removed` fields from a `linked_spatial_fields`
/// blob. `None` when nothing changes or the blob is not a list.
pub fn scrub_linked_fields(raw: &str, removed: &[Uuid]) -> Option<String> {
    let JsonValue::Array(entries) = serde_json::from_str::<JsonValue>(raw).ok()? else {
        return None;
    };
    let before = entries.len();
    let kept: Vec<JsonValue> = entries
        .into_iter()
        .filter(|entry| {
            let id = entry
                .get("SpatialDataRegistryFieldId")
                .and_then(JsonValue::as_str)
                .and_then(|s| Uuid::parse_str(s).ok());
            !id.is_some_and(|id| removed.contains(&id))
        })
        .collect();
    (kept.len() != before).then(|| JsonValue::Array(kept).to_string())
}

fn resolve_field(columns: &HashMap<String, Uuid>, column: Option<&str>) -> Option<Uuid> {
    column.and_then(|c| columns.get(c)).copied()
}

fn validate_config(config: &RegistryConfig) -> Result<()> {
    let mut issues = Vec::new();
    if config.name.trim().is_empty() {
        issues.push(ValidationIssue::new("name", "registry name is required"));
    }
    if config.table_name.trim().is_empty() {
        issues.push(ValidationIssue::new("tableName", "table name is required"));
    }
    if let Some(name_field) = &config.name_field {
        if !config.fields.iter().any(|f| f.column == *name_field) {
            issues.push(ValidationIssue::new(
                "nameField",
                format!("'{name_field}' is not one of the registry fields"),
            ));
        }
    }
    if issues.is_empty() {
        Ok(())
    } else {
        Err(RegistryError::Validation(issues))
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct RegistryAdminService {
    pool: PgPool,
    metadata: Arc<MetadataRepository>,
    access: Arc<dyn AccessControl>,
}

impl RegistryAdminService {
    pub fn new(pool: PgPool, metadata: Arc<MetadataRepository>, access: Arc<dyn AccessControl>) -> Self {
        Self { pool, metadata, access }
    }

    async fn authorize(&self, actor: &Actor, action: RegistryAction) -> Result<()> {
        require_capability(self.access.as_ref(), actor, ADMIN_RESOURCE, "registry configuration", action).await
    }

    pub async fn create_registry(&self, actor: &Actor, config: &RegistryConfig) -> Result<RegistryCreated> {
        self.authorize(actor, RegistryAction::Create).await?;
        validate_config(config)?;
        let physical = self
            .metadata
            .introspector()
            .describe_table(self.metadata.registry_schema(), &config.table_name)
            .await?;
        if physical.is_empty() {
            return Err(RegistryError::invalid_value(
                "tableName",
                format!("table {} does not exist", config.table_name),
            ));
        }

        let registry_id = Uuid::new_v4();
        let resource_id = Uuid::new_v4();
        let resource_code = Uuid::new_v4().to_string();

        let mut tx = self.pool.begin().await?;
        for action in RegistryAction::ALL {
            sqlx::query(r#"INSERT INTO public.resource_action (id, resource_code, name) VALUES ($1, $2, $3)"#)
                .bind(Uuid::new_v4())
                .bind(&resource_code)
                .bind(action.as_str())
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(r#"INSERT INTO public.resource (id, code, name, category) VALUES ($1, $2, $3, $4)"#)
            .bind(resource_id)
            .bind(&resource_code)
            .bind(&config.name)
            .bind(RESOURCE_CATEGORY)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO public.spatial_data_registry
                (id, name, table_name, urban_planning_object_id, oktmo_id, spatial_data_pd_id,
                 layer_id, spatial_data_field, map_id_field, store_history, use_turning_points,
                 allow_imported_geometry_edit, linked_spatial_fields, resource_id, is_deleted)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, false)
            "#,
        )
        .bind(registry_id)
        .bind(&config.name)
        .bind(&config.table_name)
        .bind(config.organization_id)
        .bind(config.territory_id)
        .bind(config.spatial_data_pd_id)
        .bind(config.layer_id)
        .bind(config.spatial_data_field.as_deref())
        .bind(config.map_id_field.as_deref())
        .bind(config.store_history)
        .bind(config.use_turning_points)
        .bind(config.allow_imported_geometry_edit)
        .bind(automatic_links_json(&config.links))
        .bind(resource_id)
        .execute(&mut *tx)
        .await?;

        let mut columns = HashMap::new();
        for field in &config.fields {
            let id = Self::insert_field(&mut tx, registry_id, field).await?;
            columns.insert(field.column.clone(), id);
        }
        Self::bind_special_fields(&mut tx, registry_id, config, &columns).await?;

        for link in config.links.iter().filter(|l| !l.automatic) {
            Self::insert_link(&mut tx, link, &columns).await?;
        }
        tx.commit().await?;

        let version = self.metadata.invalidate();
        info!(
            "Created registry {} ({}) on {}, metadata version {}",
            config.name, registry_id, config.table_name, version
        );
        Ok(RegistryCreated {
            id: registry_id,
            name: config.name.clone(),
        })
    }

    pub async fn update_registry(&self, actor: &Actor, registry_id: Uuid, config: &RegistryConfig) -> Result<()> {
        self.authorize(actor, RegistryAction::Update).await?;
        validate_config(config)?;

        let mut tx = self.pool.begin().await?;
        let resource_id: Option<Uuid> =
            sqlx::query_scalar(r#"SELECT resource_id FROM public.spatial_data_registry WHERE id = $1"#)
                .bind(registry_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| RegistryError::not_found(format!("registry {registry_id}")))?;

        if let Some(resource_id) = resource_id {
            sqlx::query(r#"UPDATE public.resource SET name = $2 WHERE id = $1"#)
                .bind(resource_id)
                .bind(&config.name)
                .execute(&mut *tx)
                .await?;
        }

        sqlx::query(
            r#"
            UPDATE public.spatial_data_registry
            SET name = $2, urban_planning_object_id = $3, oktmo_id = $4, spatial_data_pd_id = $5,
                layer_id = $6, spatial_data_field = $7, map_id_field = $8, store_history = $9,
                use_turning_points = $10, allow_imported_geometry_edit = $11,
                linked_spatial_fields = $12
            WHERE id = $1
            "#,
        )
        .bind(registry_id)
        .bind(&config.name)
        .bind(config.organization_id)
        .bind(config.territory_id)
        .bind(config.spatial_data_pd_id)
        .bind(config.layer_id)
        .bind(config.spatial_data_field.as_deref())
        .bind(config.map_id_field.as_deref())
        .bind(config.store_history)
        .bind(config.use_turning_points)
        .bind(config.allow_imported_geometry_edit)
        .bind(automatic_links_json(&config.links))
        .execute(&mut *tx)
        .await?;

        let mut columns = HashMap::new();
        for field in &config.fields {
            let id = match field.id {
                Some(id) => {
                    Self::update_field(&mut tx, id, field).await?;
                    id
                }
                None => Self::insert_field(&mut tx, registry_id, field).await?,
            };
            columns.insert(field.column.clone(), id);
        }
        Self::bind_special_fields(&mut tx, registry_id, config, &columns).await?;

        let existing: Vec<Uuid> = Self::link_ids(&mut tx, registry_id).await?;
        let manual: Vec<LinkConfig> = config.links.iter().filter(|l| !l.automatic).cloned().collect();
        for link in manual.iter().filter(|l| l.id.is_some()) {
            Self::update_link(&mut tx, link, &columns).await?;
        }
        let diff = collection_diff(&existing, manual, |l| l.id);
        if !diff.to_delete.is_empty() {
            sqlx::query(r#"DELETE FROM public.spatial_data_registry_links WHERE id = ANY($1)"#)
                .bind(&diff.to_delete)
                .execute(&mut *tx)
                .await?;
        }
        for link in &diff.to_insert {
            Self::insert_link(&mut tx, link, &columns).await?;
        }
        tx.commit().await?;

        let version = self.metadata.invalidate();
        info!(
            "Updated registry {}: links +{} -{}, metadata version {}",
            registry_id,
            diff.to_insert.len(),
            diff.to_delete.len(),
            version
        );
        Ok(())
    }

    pub async fn delete_registry(&self, actor: &Actor, registry_id: Uuid) -> Result<()> {
        self.authorize(actor, RegistryAction::Delete).await?;

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            SELECT r.resource_id, res.code AS resource_code
            FROM public.spatial_data_registry r
            LEFT JOIN public.resource res ON res.id = r.resource_id
            WHERE r.id = $1
            "#,
        )
        .bind(registry_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| RegistryError::not_found(format!("registry {registry_id}")))?;
        let resource_id: Option<Uuid> = row.try_get("resource_id")?;
        let resource_code: Option<String> = row.try_get("resource_code")?;

        if let Some(resource_id) = resource_id {
            sqlx::query(r#"DELETE FROM public.resource WHERE id = $1"#)
                .bind(resource_id)
                .execute(&mut *tx)
                .await?;
        }
        if let Some(code) = &resource_code {
            sqlx::query(r#"DELETE FROM public.resource_action WHERE resource_code = $1"#)
                .bind(code)
                .execute(&mut *tx)
                .await?;
        }

        let field_ids: Vec<Uuid> =
            sqlx::query_scalar(r#"SELECT id FROM public.spatial_data_registry_field WHERE spatial_data_registry_id = $1"#)
                .bind(registry_id)
                .fetch_all(&mut *tx)
                .await?;
        let scrubbed = Self::scrub_other_registries(&mut tx, registry_id, &field_ids).await?;

        let link_ids = Self::link_ids(&mut tx, registry_id).await?;
        sqlx::query(
            r#"
            DELETE FROM public.spatial_data_registry_links
            WHERE id = ANY($1) OR linked_field_id = ANY($2)
            "#,
        )
        .bind(&link_ids)
        .bind(&field_ids)
        .execute(&mut *tx)
        .await?;
        sqlx::query(r#"DELETE FROM public.spatial_data_registry_field WHERE spatial_data_registry_id = $1"#)
            .bind(registry_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(r#"DELETE FROM public.spatial_data_registry_collection_field WHERE spatial_data_registry_id = $1"#)
            .bind(registry_id)
            .execute(&mut *tx)
            .await?;

        Self::delete_sections(&mut tx, registry_id).await?;

        sqlx::query(r#"DELETE FROM public.spatial_data_registry WHERE id = $1"#)
            .bind(registry_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let version = self.metadata.invalidate();
        info!(
            "Deleted registry {} ({} fields, {} registries rewritten), metadata version {}",
            registry_id,
            field_ids.len(),
            scrubbed,
            version
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------------

    async fn insert_field(conn: &mut PgConnection, registry_id: Uuid, field: &FieldConfig) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO public.spatial_data_registry_field
                (id, spatial_data_registry_id, "column", data_type, alias, "index",
                 foreign_table, foreign_table_key_column, foreign_table_display_column,
                 not_null, is_primary_key, is_auto_generated_column, editor_type,
                 min_value, max_value, validation_regexp, validation_tooltip,
                 show_when_selected, is_deleted)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, false)
            "#,
        )
        .bind(id)
        .bind(registry_id)
        .bind(&field.column)
        .bind(&field.data_type)
        .bind(field.alias.as_deref())
        .bind(field.index)
        .bind(field.foreign_table.as_deref())
        .bind(field.foreign_table_key_column.as_deref())
        .bind(field.foreign_table_display_column.as_deref())
        .bind(field.not_null)
        .bind(field.is_primary_key)
        .bind(field.is_auto_generated_column)
        .bind(field.editor_type)
        .bind(field.min_value)
        .bind(field.max_value)
        .bind(field.validation_regexp.as_deref())
        .bind(field.validation_tooltip.as_deref())
        .bind(field.show_when_selected)
        .execute(&mut *conn)
        .await?;
        Ok(id)
    }

    async fn update_field(conn: &mut PgConnection, field_id: Uuid, field: &FieldConfig) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE public.spatial_data_registry_field
            SET "column" = $2, data_type = $3, alias = $4, "index" = $5,
                foreign_table = $6, foreign_table_key_column = $7,
                foreign_table_display_column = $8, not_null = $9, is_primary_key = $10,
                is_auto_generated_column = $11, editor_type = $12, min_value = $13,
                max_value = $14, validation_regexp = $15, validation_tooltip = $16,
                show_when_selected = $17
            WHERE id = $1
            "#,
        )
        .bind(field_id)
        .bind(&field.column)
        .bind(&field.data_type)
        .bind(field.alias.as_deref())
        .bind(field.index)
        .bind(field.foreign_table.as_deref())
        .bind(field.foreign_table_key_column.as_deref())
        .bind(field.foreign_table_display_column.as_deref())
        .bind(field.not_null)
        .bind(field.is_primary_key)
        .bind(field.is_auto_generated_column)
        .bind(field.editor_type)
        .bind(field.min_value)
        .bind(field.max_value)
        .bind(field.validation_regexp.as_deref())
        .bind(field.validation_tooltip.as_deref())
        .bind(field.show_when_selected)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Point the registry's name/latitude/longitude bindings at field ids.
    async fn bind_special_fields(
        conn: &mut PgConnection,
        registry_id: Uuid,
        config: &RegistryConfig,
        columns: &HashMap<String, Uuid>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE public.spatial_data_registry
            SET name_field_id = $2, latitude_field_id = $3, longitude_field_id = $4
            WHERE id = $1
            "#,
        )
        .bind(registry_id)
        .bind(resolve_field(columns, config.name_field.as_deref()))
        .bind(resolve_field(columns, config.latitude_field.as_deref()))
        .bind(resolve_field(columns, config.longitude_field.as_deref()))
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    fn link_owner(link: &LinkConfig, columns: &HashMap<String, Uuid>) -> Result<Uuid> {
        link.field_id
            .or_else(|| resolve_field(columns, link.field_column.as_deref()))
            .ok_or_else(|| RegistryError::invalid_value("links", "link has no owning field"))
    }

    async fn insert_link(conn: &mut PgConnection, link: &LinkConfig, columns: &HashMap<String, Uuid>) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO public.spatial_data_registry_links
                (id, field_id, link_type, linked_field_id, entity_table_column_name, alias, "use")
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(id)
        .bind(Self::link_owner(link, columns)?)
        .bind(link.link_type)
        .bind(link.linked_field_id)
        .bind(link.entity_table_column_name.as_deref())
        .bind(link.alias.as_deref())
        .bind(link.checked)
        .execute(&mut *conn)
        .await?;
        Ok(id)
    }

    async fn update_link(conn: &mut PgConnection, link: &LinkConfig, columns: &HashMap<String, Uuid>) -> Result<()> {
        let Some(id) = link.id else {
            return Ok(());
        };
        sqlx::query(
            r#"
            UPDATE public.spatial_data_registry_links
            SET field_id = $2, link_type = $3, linked_field_id = $4,
                entity_table_column_name = $5, alias = $6, "use" = $7
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Self::link_owner(link, columns)?)
        .bind(link.link_type)
        .bind(link.linked_field_id)
        .bind(link.entity_table_column_name.as_deref())
        .bind(link.alias.as_deref())
        .bind(link.checked)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn link_ids(conn: &mut PgConnection, registry_id: Uuid) -> Result<Vec<Uuid>> {
        Ok(sqlx::query_scalar(
            r#"
            SELECT l.id
            FROM public.spatial_data_registry_links l
            JOIN public.spatial_data_registry_field f ON f.id = l.field_id
            WHERE f.spatial_data_registry_id = $1
            "#,
        )
        .bind(registry_id)
        .fetch_all(&mut *conn)
        .await?)
    }

    /// Remove the deleted registry's fields from every other registry's
    /// automatic link list. Returns how many registries were rewritten.
    async fn scrub_other_registries(conn: &mut PgConnection, registry_id: Uuid, field_ids: &[Uuid]) -> Result<usize> {
        if field_ids.is_empty() {
            return Ok(0);
        }
        let rows = sqlx::query(
            r#"
            SELECT id, linked_spatial_fields
            FROM public.spatial_data_registry
            WHERE id <> $1 AND COALESCE(linked_spatial_fields, '') <> ''
            "#,
        )
        .bind(registry_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut rewritten = 0;
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let raw: String = row.try_get("linked_spatial_fields")?;
            if let Some(value) = scrub_linked_fields(&raw, field_ids) {
                sqlx::query(r#"UPDATE public.spatial_data_registry SET linked_spatial_fields = $2 WHERE id = $1"#)
                    .bind(id)
                    .bind(value)
                    .execute(&mut *conn)
                    .await?;
                rewritten += 1;
            }
        }
        debug!("Scrubbed automatic links of {} registries", rewritten);
        Ok(rewritten)
    }

    /// The registry's own section, group sections bound to nothing else, and
    /// every binding row.
    async fn delete_sections(conn: &mut PgConnection, registry_id: Uuid) -> Result<()> {
        let sections: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM public.section WHERE spatial_data_registry_id = $1
            UNION
            SELECT section_id FROM public.section_spatial_data_registry
            GROUP BY section_id
            HAVING COUNT(*) = 1 AND bool_and(spatial_data_registry_id = $1)
            "#,
        )
        .bind(registry_id)
        .fetch_all(&mut *conn)
        .await?;

        if !sections.is_empty() {
            sqlx::query(r#"DELETE FROM public.module_section WHERE section_id = ANY($1)"#)
                .bind(&sections)
                .execute(&mut *conn)
                .await?;
            sqlx::query(r#"DELETE FROM public.section WHERE id = ANY($1)"#)
                .bind(&sections)
                .execute(&mut *conn)
                .await?;
        }
        sqlx::query(r#"DELETE FROM public.section_spatial_data_registry WHERE spatial_data_registry_id = $1"#)
            .bind(registry_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
