//! Registry Item CRUD
//!
//! Create, edit, delete, fetch and list records of a configured registry.
//! Every operation checks the actor's capability on the registry's resource
//! first; edit and delete also check that the record lies in the actor's
//! territory. Mutations run in one transaction together with their journal
//! entry, attachments, turning points and many-to-many link rows. Uploads
//! bound for the external file store happen before that transaction opens.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use regex::Regex;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::descriptor::{ColumnDescriptor, ManyToManyRef, RegistryDescriptor};
use super::diff::{collection_diff, id_set_diff, SetDiff};
use super::metadata::MetadataRepository;
use super::model::{HandleRegistry, ListedRow, ModelBuilder, ModelHandle};
use super::query::{classifier_joins, translate, ColumnRef, CompareOp, ListRequest, NativeQuerySpec, Predicate};
use super::sql::{qualified, SqlBuilder};
use super::value::{CellValue, DataType, Record};
use crate::database::file_repository::pick_default_preview;
use crate::database::{
    AuditAction, AuditLogService, FileInfo, FileRepository, NewFile, TurningPoint, TurningPointRepository,
};
use crate::error::{RegistryError, Result, ValidationIssue};
use crate::ports::{require_capability, require_territory, Actor, EnginePorts, RegistryAction, TERRITORY_COLUMN};
use crate::spatial::csv::{is_contour_file, parse_contours};
use crate::spatial::engine::GeometryEngine;
use crate::spatial::layer::GeometryBinding;
use crate::spatial::store::{GeometryInput, PgSpatialStore};

// ============================================================================
// Payloads and results
// ============================================================================

/// Body of a create or edit call.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemPayload {
    /// Column values keyed by column name; many-to-many fields keyed by
    /// field id with an array of related ids.
    #[serde(default)]
    pub values: Map<String, JsonValue>,
    /// Attachments that survive an edit. Anything not listed is deleted.
    #[serde(default)]
    pub files: Vec<KeptFile>,
    #[serde(default)]
    pub turning_points: Option<Vec<TurningPoint>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeptFile {
    pub file_id: Uuid,
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Create,
    Edit,
}

/// Payload values coerced to column types and validated.
#[derive(Debug, Default, PartialEq)]
pub struct PreparedItem {
    pub record: Record,
    /// Desired related ids per many-to-many column key.
    pub links: Vec<(String, Vec<CellValue>)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SavedItem {
    pub id: CellValue,
    pub record: Record,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemAttributes {
    pub author: Option<String>,
    pub editor: Option<String>,
    pub created: Option<CellValue>,
    pub edited: Option<CellValue>,
    pub approved: Option<CellValue>,
}

/// A single record with everything a card view shows.
#[derive(Debug, Clone, Serialize)]
pub struct ItemView {
    pub record: Record,
    pub displays: HashMap<String, Option<String>>,
    pub many_to_many: HashMap<String, Vec<CellValue>>,
    pub system: SystemAttributes,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemPage {
    pub rows: Vec<ListedRow>,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryClaims {
    pub read: bool,
    pub create: bool,
    pub update: bool,
    pub delete: bool,
}

// ============================================================================
// Value preparation
// ============================================================================

/// Parse a record key from its textual form using the primary key type.
pub fn parse_record_key(descriptor: &RegistryDescriptor, raw: &str) -> Result<CellValue> {
    let pk = descriptor.primary_key();
    match CellValue::parse_text(raw, pk.data_type) {
        Ok(CellValue::Null) => Err(RegistryError::invalid_value(&pk.key, "record key is empty")),
        Ok(value) => Ok(value),
        Err(msg) => Err(RegistryError::invalid_value(&pk.key, msg)),
    }
}

/// Attachments and turning points are keyed by uuid.
fn record_uuid(key: &CellValue) -> Option<Uuid> {
    match key {
        CellValue::Uuid(id) => Some(*id),
        CellValue::Text(s) => Uuid::parse_str(s).ok(),
        _ => None,
    }
}

/// Coerce and validate payload values. Unknown fields and system attributes
/// are ignored; all failures are collected into one validation error.
pub fn prepare_item(
    descriptor: &RegistryDescriptor,
    values: &Map<String, JsonValue>,
    mode: WriteMode,
) -> Result<PreparedItem> {
    let mut prepared = PreparedItem::default();
    let mut issues = Vec::new();

    for (key, raw) in values {
        let Some(column) = descriptor.column(key) else {
            debug!("Ignoring unknown field {} of {}", key, descriptor.name);
            continue;
        };
        if column.is_system_attribute {
            continue;
        }
        if let Some(m2m) = &column.many_to_many {
            match link_values(raw, m2m.value_type) {
                Ok(ids) => prepared.links.push((column.key.clone(), ids)),
                Err(msg) => issues.push(ValidationIssue::new(&column.key, msg)),
            }
            continue;
        }
        match CellValue::from_json(raw, column.data_type) {
            Ok(value) => prepared.record.insert(column.key.clone(), value),
            Err(msg) => issues.push(ValidationIssue::new(&column.key, msg)),
        }
    }

    if mode == WriteMode::Edit {
        // Cleared numeric not-null columns are stored as zero on edit.
        for column in descriptor.scalar_columns().filter(|c| c.not_null && c.is_numeric()) {
            if prepared.record.get(&column.key).is_some_and(CellValue::is_null) {
                prepared
                    .record
                    .insert(column.key.clone(), CellValue::zero_for(column.data_type));
            }
        }
    }

    for column in descriptor
        .columns
        .iter()
        .filter(|c| !c.is_primary_key && !c.is_system_attribute)
    {
        let issue = if column.is_many_to_many {
            let links = prepared.links.iter().find(|(k, _)| *k == column.key);
            check_links(column, links.map(|(_, ids)| ids.as_slice()), mode)
        } else {
            check_value(column, prepared.record.get(&column.key), mode)
        };
        issues.extend(issue);
    }

    if issues.is_empty() {
        Ok(prepared)
    } else {
        Err(RegistryError::Validation(issues))
    }
}

fn link_values(raw: &JsonValue, value_type: DataType) -> std::result::Result<Vec<CellValue>, String> {
    match raw {
        JsonValue::Null => Ok(Vec::new()),
        JsonValue::Array(items) => items
            .iter()
            .map(|item| CellValue::from_json(item, value_type))
            .filter(|v| !matches!(v, Ok(CellValue::Null)))
            .collect(),
        single => CellValue::from_json(single, value_type).map(|v| vec![v]),
    }
}

fn check_links(column: &ColumnDescriptor, ids: Option<&[CellValue]>, mode: WriteMode) -> Option<ValidationIssue> {
    let missing = match ids {
        Some(ids) => ids.is_empty(),
        None => mode == WriteMode::Create,
    };
    (column.not_null && missing).then(|| ValidationIssue::new(&column.key, "value is required"))
}

fn check_value(column: &ColumnDescriptor, value: Option<&CellValue>, mode: WriteMode) -> Option<ValidationIssue> {
    let value = match value {
        None | Some(CellValue::Null) => {
            let missing = value.is_some() || mode == WriteMode::Create;
            return (column.not_null && missing).then(|| ValidationIssue::new(&column.key, "value is required"));
        }
        Some(value) => value,
    };

    if let (Some(pattern), CellValue::Text(text)) = (
        column.validation_regexp.as_deref().filter(|p| !p.trim().is_empty()),
        value,
    ) {
        match Regex::new(pattern) {
            Ok(re) if !re.is_match(text) => {
                let message = column
                    .validation_tooltip
                    .clone()
                    .unwrap_or_else(|| format!("value does not match '{pattern}'"));
                return Some(ValidationIssue::new(&column.key, message));
            }
            Ok(_) => {}
            Err(e) => warn!("Invalid validation pattern on {}: {}", column.key, e),
        }
    }

    let number = match value {
        CellValue::Int(i) => Some(*i as f64),
        CellValue::Float(f) => Some(*f),
        CellValue::Decimal(d) => d.to_f64(),
        _ => None,
    };
    if let Some(n) = number {
        if let Some(min) = column.min_value.filter(|min| n < *min) {
            return Some(ValidationIssue::new(&column.key, format!("value is less than {min}")));
        }
        if let Some(max) = column.max_value.filter(|max| n > *max) {
            return Some(ValidationIssue::new(&column.key, format!("value is greater than {max}")));
        }
    }
    None
}

fn now_for(data_type: DataType) -> Option<CellValue> {
    let now = Utc::now();
    match data_type {
        DataType::Date => Some(CellValue::Date(now.date_naive())),
        DataType::Timestamp => Some(CellValue::Timestamp(now.naive_utc())),
        DataType::TimestampTz => Some(CellValue::TimestampTz(now)),
        _ => None,
    }
}

fn id_value(data_type: DataType, id: Uuid) -> Option<CellValue> {
    match data_type {
        DataType::Uuid => Some(CellValue::Uuid(id)),
        t if t.is_text() => Some(CellValue::Text(id.to_string())),
        _ => None,
    }
}

/// Author/editor and timestamp columns, when the registry has them. A new
/// record without a territory gets the actor's.
pub fn stamp_system_attributes(descriptor: &RegistryDescriptor, record: &mut Record, actor: &Actor, mode: WriteMode) {
    let (who, when) = match mode {
        WriteMode::Create => ("author_id", "datecreated"),
        WriteMode::Edit => ("editor_id", "dateedited"),
    };
    if let Some(value) = descriptor.column(who).and_then(|c| id_value(c.data_type, actor.user_id)) {
        record.insert(who, value);
    }
    if let Some(value) = descriptor.column(when).and_then(|c| now_for(c.data_type)) {
        record.insert(when, value);
    }

    if mode == WriteMode::Create && record.get(TERRITORY_COLUMN).map_or(true, CellValue::is_null) {
        let territory = descriptor
            .column(TERRITORY_COLUMN)
            .zip(actor.territory_id)
            .and_then(|(c, t)| id_value(c.data_type, t));
        if let Some(value) = territory {
            record.insert(TERRITORY_COLUMN, value);
        }
    }
}

// ============================================================================
// Service
// ============================================================================

pub struct RegistryCrudService {
    pool: PgPool,
    metadata: Arc<MetadataRepository>,
    handles: Arc<HandleRegistry>,
    ports: EnginePorts,
    files: FileRepository,
    turning_points: TurningPointRepository,
    max_inline_file_size: u64,
    source_srid: i32,
}

impl RegistryCrudService {
    pub fn new(
        pool: PgPool,
        metadata: Arc<MetadataRepository>,
        handles: Arc<HandleRegistry>,
        ports: EnginePorts,
        max_inline_file_size: u64,
        source_srid: i32,
    ) -> Self {
        Self {
            files: FileRepository::new(pool.clone()),
            turning_points: TurningPointRepository::new(pool.clone()),
            pool,
            metadata,
            handles,
            ports,
            max_inline_file_size,
            source_srid,
        }
    }

    async fn authorized(&self, actor: &Actor, registry_id: Uuid, action: RegistryAction) -> Result<Arc<RegistryDescriptor>> {
        let descriptor = self.metadata.get_registry_descriptor(registry_id).await?;
        require_capability(
            self.ports.access.as_ref(),
            actor,
            &descriptor.resource_name,
            &descriptor.name,
            action,
        )
        .await?;
        Ok(descriptor)
    }

    async fn handle(&self, descriptor: &RegistryDescriptor, nested: bool) -> Result<Arc<ModelHandle>> {
        ModelBuilder::new(self.metadata.introspector(), &self.handles)
            .build(descriptor, nested)
            .await
    }

    /// Fetch a record for edit or delete and check its territory.
    async fn existing(
        &self,
        actor: &Actor,
        descriptor: &RegistryDescriptor,
        handle: &ModelHandle,
        key: &CellValue,
        action: RegistryAction,
    ) -> Result<Record> {
        let mut conn = self.pool.acquire().await?;
        let record = handle
            .find_by_pk(&mut conn, key)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("record {} of {}", key.display_text(), descriptor.name)))?;
        require_territory(self.ports.access.as_ref(), actor, &record, &descriptor.name, action)?;
        Ok(record)
    }

    /// Send large uploads to the external store and pick the default preview.
    async fn stage_uploads(
        &self,
        descriptor: &RegistryDescriptor,
        uploads: &[UploadedFile],
        existing_count: usize,
    ) -> Result<Vec<NewFile>> {
        let preview = pick_default_preview(existing_count, uploads.iter().map(|u| u.file_name.as_str()));
        let mut staged = Vec::with_capacity(uploads.len());
        for (idx, upload) in uploads.iter().enumerate() {
            let (content, external_storage_id) = if upload.content.len() as u64 > self.max_inline_file_size {
                let id = self
                    .ports
                    .large_files
                    .store_large_file(&upload.content, &descriptor.resource_name)
                    .await?;
                debug!("Stored {} externally as {}", upload.file_name, id);
                (None, Some(id))
            } else {
                (Some(upload.content.clone()), None)
            };
            staged.push(NewFile {
                file_name: upload.file_name.clone(),
                content,
                external_storage_id,
                is_default_preview: preview == Some(idx),
            });
        }
        Ok(staged)
    }

    /// Contour attachments become the record's geometry when a projection
    /// is given.
    async fn apply_contours(
        &self,
        conn: &mut PgConnection,
        descriptor: &RegistryDescriptor,
        key: &CellValue,
        uploads: &[UploadedFile],
        projection: Option<i32>,
    ) -> Result<()> {
        let Some(srid) = projection else {
            return Ok(());
        };
        let mut binding: Option<GeometryBinding> = None;
        for upload in uploads.iter().filter(|u| is_contour_file(&u.file_name)) {
            let wkt = parse_contours(&String::from_utf8_lossy(&upload.content))?;
            if binding.is_none() {
                binding = Some(
                    GeometryBinding::resolve(descriptor, self.metadata.introspector(), self.ports.profile.as_ref())
                        .await?,
                );
            }
            let Some(bound) = binding.as_ref() else {
                continue;
            };
            let mut store = PgSpatialStore::new(&mut *conn);
            let outcome = GeometryEngine::upsert(&mut store, bound, key, &GeometryInput::Wkt(wkt), srid).await?;
            debug!("Contour {} applied: {:?}", upload.file_name, outcome);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    pub async fn create_item(
        &self,
        actor: &Actor,
        registry_id: Uuid,
        payload: &ItemPayload,
        uploads: &[UploadedFile],
        projection: Option<i32>,
    ) -> Result<SavedItem> {
        let descriptor = self.authorized(actor, registry_id, RegistryAction::Create).await?;
        let mut prepared = prepare_item(&descriptor, &payload.values, WriteMode::Create)?;
        stamp_system_attributes(&descriptor, &mut prepared.record, actor, WriteMode::Create);
        let handle = self.handle(&descriptor, false).await?;
        let staged = self.stage_uploads(&descriptor, uploads, 0).await?;

        let mut tx = self.pool.begin().await?;
        let inserted = handle.insert(&mut tx, &prepared.record).await?;
        let key = inserted
            .get(&handle.primary_key()?.name)
            .cloned()
            .unwrap_or(CellValue::Null);

        self.sync_all_links(&mut tx, &descriptor, &key, &prepared.links).await?;
        let item_uuid = record_uuid(&key);
        if !staged.is_empty() || payload.turning_points.is_some() {
            let Some(item_uuid) = item_uuid else {
                return Err(RegistryError::invalid_value(
                    &descriptor.primary_key().key,
                    "attachments need a uuid record key",
                ));
            };
            for file in &staged {
                FileRepository::insert(&mut tx, registry_id, item_uuid, file).await?;
            }
            if let Some(points) = payload.turning_points.as_deref().filter(|_| descriptor.use_turning_points) {
                TurningPointRepository::insert_all(&mut tx, registry_id, item_uuid, points, &actor.full_name).await?;
            }
        }
        self.apply_contours(&mut tx, &descriptor, &key, uploads, projection)
            .await?;

        let record = handle.find_by_pk(&mut tx, &key).await?.unwrap_or(inserted);
        AuditLogService::record(
            &mut tx,
            AuditAction::Add,
            &actor.full_name,
            &descriptor.name,
            &format!("record {}", key.display_text()),
        )
        .await?;
        tx.commit().await?;

        info!("Created record {} in {}", key.display_text(), descriptor.name);
        Ok(SavedItem { id: key, record })
    }

    pub async fn edit_item(
        &self,
        actor: &Actor,
        registry_id: Uuid,
        record_id: &str,
        payload: &ItemPayload,
        uploads: &[UploadedFile],
        projection: Option<i32>,
    ) -> Result<SavedItem> {
        let descriptor = self.authorized(actor, registry_id, RegistryAction::Update).await?;
        let key = parse_record_key(&descriptor, record_id)?;
        let handle = self.handle(&descriptor, false).await?;
        self.existing(actor, &descriptor, &handle, &key, RegistryAction::Update)
            .await?;

        let mut prepared = prepare_item(&descriptor, &payload.values, WriteMode::Edit)?;
        stamp_system_attributes(&descriptor, &mut prepared.record, actor, WriteMode::Edit);
        let kept: Vec<Uuid> = payload.files.iter().map(|f| f.file_id).collect();
        let staged = self.stage_uploads(&descriptor, uploads, kept.len()).await?;
        let item_uuid = record_uuid(&key);

        let mut tx = self.pool.begin().await?;
        handle
            .update(&mut tx, &key, &prepared.record)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("record {record_id} of {}", descriptor.name)))?;
        self.sync_all_links(&mut tx, &descriptor, &key, &prepared.links).await?;

        if let Some(item_uuid) = item_uuid {
            let removed = FileRepository::delete_for_record_except(&mut tx, registry_id, item_uuid, &kept).await?;
            if removed > 0 {
                debug!("Removed {} attachments of {}", removed, record_id);
            }
            for file in &staged {
                FileRepository::insert(&mut tx, registry_id, item_uuid, file).await?;
            }
            if let Some(points) = payload.turning_points.clone().filter(|_| descriptor.use_turning_points) {
                let existing: Vec<Uuid> = TurningPointRepository::list_on(&mut tx, registry_id, item_uuid)
                    .await?
                    .into_iter()
                    .filter_map(|p| p.id)
                    .collect();
                let diff = collection_diff(&existing, points, |p| p.id);
                TurningPointRepository::delete_ids(&mut tx, &diff.to_delete).await?;
                TurningPointRepository::insert_all(&mut tx, registry_id, item_uuid, &diff.to_insert, &actor.full_name)
                    .await?;
            }
        } else if !staged.is_empty() {
            return Err(RegistryError::invalid_value(
                &descriptor.primary_key().key,
                "attachments need a uuid record key",
            ));
        }
        self.apply_contours(&mut tx, &descriptor, &key, uploads, projection)
            .await?;

        let record = handle
            .find_by_pk(&mut tx, &key)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("record {record_id} of {}", descriptor.name)))?;
        AuditLogService::record(
            &mut tx,
            AuditAction::Edit,
            &actor.full_name,
            &descriptor.name,
            &format!("record {record_id}"),
        )
        .await?;
        tx.commit().await?;

        info!("Edited record {} in {}", record_id, descriptor.name);
        Ok(SavedItem { id: key, record })
    }

    /// Delete a record with its link rows, section bindings, attachments and
    /// turning points.
    pub async fn delete_item(&self, actor: &Actor, registry_id: Uuid, record_id: &str) -> Result<()> {
        let descriptor = self.authorized(actor, registry_id, RegistryAction::Delete).await?;
        let key = parse_record_key(&descriptor, record_id)?;
        let handle = self.handle(&descriptor, false).await?;
        self.existing(actor, &descriptor, &handle, &key, RegistryAction::Delete)
            .await?;
        let key_type = descriptor.primary_key().data_type;

        let mut tx = self.pool.begin().await?;
        for column in descriptor.many_to_many_columns() {
            if let Some(m2m) = &column.many_to_many {
                Self::clear_links(&mut tx, m2m, &key, key_type).await?;
            }
        }
        if handle.delete(&mut tx, &key).await? == 0 {
            return Err(RegistryError::not_found(format!("record {record_id} of {}", descriptor.name)));
        }

        let sections = sqlx::query(
            r#"
            DELETE FROM register.registry_section_item AS item
            USING register.registry_section AS section
            WHERE item.registry_section_id = section.id
              AND section.registry_id = $1
              AND item.registry_item_id::text = $2
            "#,
        )
        .bind(registry_id)
        .bind(key.as_key_string())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if let Some(item_uuid) = record_uuid(&key) {
            FileRepository::delete_for_record_except(&mut tx, registry_id, item_uuid, &[]).await?;
            TurningPointRepository::delete_for_item(&mut tx, registry_id, item_uuid).await?;
        }
        AuditLogService::record(
            &mut tx,
            AuditAction::Delete,
            &actor.full_name,
            &descriptor.name,
            &format!("record {record_id}"),
        )
        .await?;
        tx.commit().await?;

        info!(
            "Deleted record {} of {} ({} section bindings)",
            record_id, descriptor.name, sections
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Many-to-many links
    // ------------------------------------------------------------------------

    async fn sync_all_links(
        &self,
        conn: &mut PgConnection,
        descriptor: &RegistryDescriptor,
        key: &CellValue,
        links: &[(String, Vec<CellValue>)],
    ) -> Result<()> {
        let key_type = descriptor.primary_key().data_type;
        for (column_key, desired) in links {
            let Some(m2m) = descriptor.column(column_key).and_then(|c| c.many_to_many.as_ref()) else {
                continue;
            };
            let diff = Self::sync_links(conn, m2m, key, key_type, desired).await?;
            if !diff.is_empty() {
                debug!(
                    "Links {}: +{} -{}",
                    m2m.link_table,
                    diff.added.len(),
                    diff.removed.len()
                );
            }
        }
        Ok(())
    }

    /// Bring the link rows of one record to exactly `desired`.
    pub async fn sync_links(
        conn: &mut PgConnection,
        m2m: &ManyToManyRef,
        key: &CellValue,
        key_type: DataType,
        desired: &[CellValue],
    ) -> Result<SetDiff<String>> {
        let link_table = qualified(&m2m.link_schema, &m2m.link_table);

        let mut select = SqlBuilder::new();
        select
            .push("SELECT ")
            .push_ident(&m2m.value_column)
            .push("::text AS value FROM ")
            .push(&link_table)
            .push(" WHERE ")
            .push_ident(&m2m.record_column)
            .push(" = ")
            .push_bind(key.clone(), key_type);
        let existing: Vec<String> = select
            .build()
            .fetch_all(&mut *conn)
            .await?
            .iter()
            .map(|row| row.try_get::<Option<String>, _>("value"))
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .flatten()
            .collect();
        let desired: Vec<String> = desired.iter().filter_map(CellValue::as_key_string).collect();

        let diff = id_set_diff(&existing, &desired);
        for value in &diff.removed {
            let mut delete = SqlBuilder::new();
            delete
                .push("DELETE FROM ")
                .push(&link_table)
                .push(" WHERE ")
                .push_ident(&m2m.record_column)
                .push(" = ")
                .push_bind(key.clone(), key_type)
                .push(" AND ")
                .push_ident(&m2m.value_column)
                .push("::text = ")
                .push_bind(CellValue::Text(value.clone()), DataType::Text);
            delete.build().execute(&mut *conn).await?;
        }
        for value in &diff.added {
            let mut insert = SqlBuilder::new();
            insert
                .push("INSERT INTO ")
                .push(&link_table)
                .push(" (")
                .push_ident(&m2m.record_column)
                .push(", ")
                .push_ident(&m2m.value_column)
                .push(") VALUES (")
                .push_bind(key.clone(), key_type)
                .push(", ")
                .push_bind(CellValue::Text(value.clone()), m2m.value_type)
                .push(")");
            insert.build().execute(&mut *conn).await?;
        }
        Ok(diff)
    }

    async fn clear_links(conn: &mut PgConnection, m2m: &ManyToManyRef, key: &CellValue, key_type: DataType) -> Result<u64> {
        let mut delete = SqlBuilder::new();
        delete
            .push("DELETE FROM ")
            .push(&qualified(&m2m.link_schema, &m2m.link_table))
            .push(" WHERE ")
            .push_ident(&m2m.record_column)
            .push(" = ")
            .push_bind(key.clone(), key_type);
        Ok(delete.build().execute(&mut *conn).await?.rows_affected())
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// One record with classifier display text, many-to-many ids and system
    /// attributes.
    pub async fn get_item(&self, actor: &Actor, registry_id: Uuid, record_id: &str) -> Result<ItemView> {
        let descriptor = self.authorized(actor, registry_id, RegistryAction::Read).await?;
        let key = parse_record_key(&descriptor, record_id)?;
        let handle = self.handle(&descriptor, true).await?;
        let pk = descriptor.primary_key();

        let spec = NativeQuerySpec {
            predicate: Some(Predicate::Compare {
                column: ColumnRef::Base(pk.key.clone()),
                op: CompareOp::Eq,
                value: key.clone(),
                data_type: pk.data_type,
                date_only: false,
            }),
            joins: classifier_joins(&descriptor),
            limit: Some(1),
            ..Default::default()
        };

        let mut conn = self.pool.acquire().await?;
        let row = handle
            .list(&mut conn, &spec)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RegistryError::not_found(format!("record {record_id} of {}", descriptor.name)))?;

        let mut many_to_many = HashMap::new();
        for column in descriptor.many_to_many_columns() {
            if let Some(relation) = handle.relation(&column.key) {
                let ids = relation.linked_values(&mut conn, &key, pk.data_type).await?;
                many_to_many.insert(column.key.clone(), ids);
            }
        }
        let system = Self::system_attributes(&mut conn, &row.record).await?;

        Ok(ItemView {
            record: row.record,
            displays: row.displays,
            many_to_many,
            system,
        })
    }

    async fn system_attributes(conn: &mut PgConnection, record: &Record) -> Result<SystemAttributes> {
        let mut attributes = SystemAttributes {
            created: record.get("datecreated").cloned(),
            edited: record.get("dateedited").cloned(),
            approved: record.get("approved").cloned(),
            ..Default::default()
        };
        for (column, slot) in [("author_id", &mut attributes.author), ("editor_id", &mut attributes.editor)] {
            let Some(user_id) = record.get(column).and_then(CellValue::as_key_string) else {
                continue;
            };
            *slot = sqlx::query_scalar::<_, Option<String>>(
                r#"
                SELECT NULLIF(TRIM(CONCAT_WS(' ', surname, name)), '')
                FROM public."user"
                WHERE id::text = $1
                "#,
            )
            .bind(&user_id)
            .fetch_optional(&mut *conn)
            .await?
            .flatten();
        }
        Ok(attributes)
    }

    /// First record whose `column` equals `value`.
    pub async fn get_by_column(
        &self,
        actor: &Actor,
        registry_id: Uuid,
        column: &str,
        value: &str,
    ) -> Result<Option<Record>> {
        let descriptor = self.authorized(actor, registry_id, RegistryAction::Read).await?;
        let data_type = descriptor
            .column(column)
            .filter(|c| c.is_scalar())
            .map(|c| c.data_type)
            .ok_or_else(|| RegistryError::InvalidQuery(format!("unknown field '{column}'")))?;
        let value = CellValue::parse_text(value, data_type).map_err(|msg| RegistryError::invalid_value(column, msg))?;
        let handle = self.handle(&descriptor, false).await?;
        let mut conn = self.pool.acquire().await?;
        handle.find_one(&mut conn, column, &value).await
    }

    /// The record bound to geometry id `gis_id`.
    pub async fn get_by_gis_id(&self, actor: &Actor, registry_id: Uuid, gis_id: &str) -> Result<Option<Record>> {
        let descriptor = self.metadata.get_registry_descriptor(registry_id).await?;
        let map_id_field = descriptor.map_id_field.clone().ok_or_else(|| {
            RegistryError::DescriptorBuild(format!("registry {} has no geometry id field", descriptor.name))
        })?;
        self.get_by_column(actor, registry_id, &map_id_field, gis_id).await
    }

    /// A page of records plus the total count under the same filters.
    ///
    /// Unless `all_records` is set or the registry belongs to the actor's
    /// organization, only records of the actor's territories are listed.
    pub async fn paginate(&self, actor: &Actor, registry_id: Uuid, request: &ListRequest) -> Result<ItemPage> {
        let descriptor = self.authorized(actor, registry_id, RegistryAction::Read).await?;

        let own_organization = descriptor.organization_id.is_some() && descriptor.organization_id == actor.organization_id;
        let territories: Vec<Uuid> = if actor.territory_ids.is_empty() {
            actor.territory_id.into_iter().collect()
        } else {
            actor.territory_ids.clone()
        };
        let scope = (!request.all_records && !own_organization).then_some(territories.as_slice());

        let spec = translate(request, &descriptor, scope)?;
        let handle = self.handle(&descriptor, false).await?;
        let mut conn = self.pool.acquire().await?;
        let rows = handle.list(&mut conn, &spec).await?;
        let count = handle.count(&mut conn, &spec.unpaged()).await?;
        debug!("Listed {} of {} rows from {}", rows.len(), count, descriptor.name);
        Ok(ItemPage { rows, count })
    }

    /// Descriptors of the registries the actor may read, ordered by name.
    pub async fn readable_registries(&self, actor: &Actor) -> Result<Vec<Arc<RegistryDescriptor>>> {
        let all = self.metadata.get_all_registries_descriptors().await?;
        let mut readable = Vec::with_capacity(all.len());
        for descriptor in all.into_values() {
            if self
                .ports
                .access
                .can_perform(actor, &descriptor.resource_name, RegistryAction::Read)
                .await?
            {
                readable.push(descriptor);
            }
        }
        readable.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(readable)
    }

    pub async fn registry_claims(&self, actor: &Actor, registry_id: Uuid) -> Result<(Arc<RegistryDescriptor>, RegistryClaims)> {
        let descriptor = self.metadata.get_registry_descriptor(registry_id).await?;
        let access = self.ports.access.as_ref();
        let resource = descriptor.resource_name.as_str();
        let claims = RegistryClaims {
            read: access.can_perform(actor, resource, RegistryAction::Read).await?,
            create: access.can_perform(actor, resource, RegistryAction::Create).await?,
            update: access.can_perform(actor, resource, RegistryAction::Update).await?,
            delete: access.can_perform(actor, resource, RegistryAction::Delete).await?,
        };
        Ok((descriptor, claims))
    }

    // ------------------------------------------------------------------------
    // Attachments and turning points
    // ------------------------------------------------------------------------

    fn item_uuid(descriptor: &RegistryDescriptor, record_id: &str) -> Result<Uuid> {
        record_uuid(&parse_record_key(descriptor, record_id)?).ok_or_else(|| {
            RegistryError::invalid_value(&descriptor.primary_key().key, "attachments need a uuid record key")
        })
    }

    pub async fn list_files(&self, actor: &Actor, registry_id: Uuid, record_id: &str) -> Result<Vec<FileInfo>> {
        let (_, item_uuid) = self
            .attachment_owner(actor, registry_id, record_id, RegistryAction::Read)
            .await?;
        self.files.list_for_record(registry_id, item_uuid).await
    }

    /// Territory-checked uuid key of a record that owns attachments.
    async fn attachment_owner(
        &self,
        actor: &Actor,
        registry_id: Uuid,
        record_id: &str,
        action: RegistryAction,
    ) -> Result<(Arc<RegistryDescriptor>, Uuid)> {
        let descriptor = self.authorized(actor, registry_id, action).await?;
        let key = parse_record_key(&descriptor, record_id)?;
        let item_uuid = Self::item_uuid(&descriptor, record_id)?;
        let handle = self.handle(&descriptor, false).await?;
        self.existing(actor, &descriptor, &handle, &key, action).await?;
        Ok((descriptor, item_uuid))
    }

    /// Attachment metadata and content, fetched from the external store when
    /// the content was not kept inline.
    pub async fn read_file(
        &self,
        actor: &Actor,
        registry_id: Uuid,
        record_id: &str,
        file_id: Uuid,
    ) -> Result<(FileInfo, Vec<u8>)> {
        let (_, item_uuid) = self
            .attachment_owner(actor, registry_id, record_id, RegistryAction::Read)
            .await?;
        let (info, content) = self
            .files
            .get(registry_id, item_uuid, file_id)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("file {file_id} of record {record_id}")))?;
        let content = match (content, info.external_storage_id.as_deref()) {
            (Some(bytes), _) => bytes,
            (None, Some(external_id)) => self.ports.large_files.read_file(external_id).await?,
            (None, None) => Vec::new(),
        };
        Ok((info, content))
    }

    pub async fn delete_file(&self, actor: &Actor, registry_id: Uuid, record_id: &str, file_id: Uuid) -> Result<()> {
        let (descriptor, item_uuid) = self
            .attachment_owner(actor, registry_id, record_id, RegistryAction::Update)
            .await?;
        let mut tx = self.pool.begin().await?;
        if !FileRepository::delete_owned(&mut tx, registry_id, item_uuid, file_id).await? {
            return Err(RegistryError::not_found(format!("file {file_id} of record {record_id}")));
        }
        AuditLogService::record(
            &mut tx,
            AuditAction::Edit,
            &actor.full_name,
            &descriptor.name,
            &format!("file {file_id} of record {record_id} deleted"),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn list_turning_points(&self, actor: &Actor, registry_id: Uuid, record_id: &str) -> Result<Vec<TurningPoint>> {
        let descriptor = self.authorized(actor, registry_id, RegistryAction::Read).await?;
        let item_uuid = Self::item_uuid(&descriptor, record_id)?;
        self.turning_points.list(registry_id, item_uuid).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::descriptor::tests::wells_descriptor;
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn values(v: JsonValue) -> Map<String, JsonValue> {
        match v {
            JsonValue::Object(map) => map,
            _ => panic!("expected an object"),
        }
    }

    fn issue_columns(err: RegistryError) -> Vec<String> {
        match err {
            RegistryError::Validation(issues) => issues.into_iter().map(|i| i.column).collect(),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn create_requires_not_null_columns() {
        let descriptor = wells_descriptor();
        let err = prepare_item(&descriptor, &values(json!({"name": "W-1"})), WriteMode::Create).unwrap_err();
        assert_eq!(issue_columns(err), vec!["depth".to_string()]);
    }

    #[test]
    fn coerces_values_and_ignores_unknown_fields() {
        let descriptor = wells_descriptor();
        let prepared = prepare_item(
            &descriptor,
            &values(json!({"name": "W-1", "depth": "12,5", "bogus": 1})),
            WriteMode::Create,
        )
        .unwrap();
        assert_eq!(
            prepared.record.get("depth"),
            Some(&CellValue::Decimal(Decimal::new(125, 1)))
        );
        assert!(!prepared.record.contains("bogus"));
    }

    #[test]
    fn unparseable_values_are_collected() {
        let descriptor = wells_descriptor();
        let err = prepare_item(
            &descriptor,
            &values(json!({"depth": "deep", "zone": "not-a-uuid"})),
            WriteMode::Create,
        )
        .unwrap_err();
        let mut columns = issue_columns(err);
        columns.sort();
        columns.dedup();
        assert_eq!(columns, vec!["depth".to_string(), "zone".to_string()]);
    }

    #[test]
    fn edit_stores_cleared_numeric_not_null_as_zero() {
        let descriptor = wells_descriptor();
        let prepared = prepare_item(&descriptor, &values(json!({"depth": null})), WriteMode::Edit).unwrap();
        assert_eq!(prepared.record.get("depth"), Some(&CellValue::zero_for(DataType::Numeric)));
    }

    #[test]
    fn edit_skips_absent_not_null_columns() {
        let descriptor = wells_descriptor();
        assert!(prepare_item(&descriptor, &values(json!({"name": "W-2"})), WriteMode::Edit).is_ok());
    }

    #[test]
    fn pattern_and_range_rules() {
        let mut descriptor = wells_descriptor();
        for column in descriptor.columns.iter_mut() {
            match column.key.as_str() {
                "name" => {
                    column.validation_regexp = Some("^W-[0-9]+$".into());
                    column.validation_tooltip = Some("Name must look like W-1".into());
                }
                "depth" => {
                    column.min_value = Some(0.0);
                    column.max_value = Some(5000.0);
                }
                _ => {}
            }
        }

        let err = prepare_item(
            &descriptor,
            &values(json!({"name": "well one", "depth": 9000})),
            WriteMode::Create,
        )
        .unwrap_err();
        let RegistryError::Validation(issues) = err else {
            panic!("expected validation error");
        };
        assert_eq!(issues.len(), 2);
        assert!(issues.iter().any(|i| i.message == "Name must look like W-1"));
        assert!(issues.iter().any(|i| i.column == "depth" && i.message.contains("5000")));

        assert!(prepare_item(&descriptor, &values(json!({"name": "W-7", "depth": 10})), WriteMode::Create).is_ok());
    }

    #[test]
    fn system_attributes_are_platform_owned() {
        let mut descriptor = wells_descriptor();
        let mut author = descriptor.column("name").cloned().unwrap();
        author.key = "author_id".into();
        author.data_type = DataType::Uuid;
        author.is_system_attribute = true;
        author.is_name_field = false;
        descriptor.columns.push(author);

        let prepared = prepare_item(
            &descriptor,
            &values(json!({"depth": 1, "author_id": Uuid::new_v4().to_string()})),
            WriteMode::Create,
        )
        .unwrap();
        assert!(!prepared.record.contains("author_id"));

        let actor = Actor {
            user_id: Uuid::new_v4(),
            ..Default::default()
        };
        let mut record = prepared.record;
        stamp_system_attributes(&descriptor, &mut record, &actor, WriteMode::Create);
        assert_eq!(record.get("author_id"), Some(&CellValue::Uuid(actor.user_id)));
    }

    #[test]
    fn record_key_follows_primary_key_type() {
        let descriptor = wells_descriptor();
        let id = Uuid::new_v4();
        assert_eq!(parse_record_key(&descriptor, &id.to_string()).unwrap(), CellValue::Uuid(id));
        assert!(matches!(
            parse_record_key(&descriptor, "42"),
            Err(RegistryError::Validation(_))
        ));
        assert!(parse_record_key(&descriptor, " ").is_err());
    }

    #[test]
    fn section_bindings_match_the_canonical_key() {
        let descriptor = wells_descriptor();
        let id = Uuid::new_v4();
        let key = parse_record_key(&descriptor, &id.to_string().to_uppercase()).unwrap();
        assert_eq!(key.as_key_string(), Some(id.to_string()));
    }

    #[test]
    fn link_values_accept_arrays_and_singletons() {
        let a = Uuid::new_v4();
        assert_eq!(
            link_values(&json!([a.to_string(), null]), DataType::Uuid).unwrap(),
            vec![CellValue::Uuid(a)]
        );
        assert_eq!(link_values(&json!(7), DataType::Integer).unwrap(), vec![CellValue::Int(7)]);
        assert!(link_values(&JsonValue::Null, DataType::Uuid).unwrap().is_empty());
    }
}
