//! Registry Descriptor - the complete logical model of one registry
//!
//! Assembled from configuration rows and catalog columns by
//! [`build_descriptor`], which does no I/O. Column flags are derived from the
//! declared data type and structural facts only; the one name-based rule is
//! the fixed list of system attribute columns.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::introspect::{split_qualified, DisplayColumnDescription, PhysicalColumn};
use super::metadata::{CollectionFieldRow, FieldRow, MetadataSnapshot, RegistryRow};
use super::value::DataType;
use crate::error::{RegistryError, Result};

/// Columns maintained by the platform rather than by users.
pub const SYSTEM_ATTRIBUTES: &[&str] = &["author_id", "datecreated", "editor_id", "dateedited", "approved"];

const TERRITORY_TABLE: &str = "public.oktmo";

// ============================================================================
// Entity types
// ============================================================================

/// Link targets: another registry or a fixed domain entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Registry,
    CadastralStead,
    ProjectedStead,
    Address,
    AdvertisingConstruction,
    UrbanPlanningRegulation,
    IsogdDocument,
    ZoneCard,
    CapitalConstruction,
    InventoryResult,
    SelectedContourStead,
    CadastralCapitalConstruction,
    DelimitationPlanStead,
    FederalTaxService,
    SpecialZone,
    GdDocument,
}

impl EntityType {
    pub fn code(self) -> i32 {
        match self {
            EntityType::Registry => 0,
            EntityType::CadastralStead => 10,
            EntityType::ProjectedStead => 20,
            EntityType::Address => 30,
            EntityType::AdvertisingConstruction => 40,
            EntityType::UrbanPlanningRegulation => 50,
            EntityType::IsogdDocument => 60,
            EntityType::ZoneCard => 70,
            EntityType::CapitalConstruction => 80,
            EntityType::InventoryResult => 100,
            EntityType::SelectedContourStead => 120,
            EntityType::CadastralCapitalConstruction => 130,
            EntityType::DelimitationPlanStead => 140,
            EntityType::FederalTaxService => 150,
            EntityType::SpecialZone => 200,
            EntityType::GdDocument => 210,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        let t = match code {
            0 => EntityType::Registry,
            10 => EntityType::CadastralStead,
            20 => EntityType::ProjectedStead,
            30 => EntityType::Address,
            40 => EntityType::AdvertisingConstruction,
            50 => EntityType::UrbanPlanningRegulation,
            60 => EntityType::IsogdDocument,
            70 => EntityType::ZoneCard,
            80 => EntityType::CapitalConstruction,
            100 => EntityType::InventoryResult,
            120 => EntityType::SelectedContourStead,
            130 => EntityType::CadastralCapitalConstruction,
            140 => EntityType::DelimitationPlanStead,
            150 => EntityType::FederalTaxService,
            200 => EntityType::SpecialZone,
            210 => EntityType::GdDocument,
            _ => return None,
        };
        Some(t)
    }
}

// ============================================================================
// Descriptor types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassifierRef {
    pub schema: String,
    pub table: String,
    pub key_column: String,
    pub display_column: Option<String>,
    /// Catalog type of the display column, when known.
    pub display_type: Option<DataType>,
    /// Set when the classifier table is itself a registry.
    pub classifier_registry_id: Option<Uuid>,
    /// The classifier table is this registry's own table.
    pub is_self_link: bool,
}

impl ClassifierRef {
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManyToManyRef {
    pub link_schema: String,
    pub link_table: String,
    /// Link table column holding the record key.
    pub record_column: String,
    /// Link table column holding the related key.
    pub value_column: String,
    pub value_type: DataType,
    pub target_schema: Option<String>,
    pub target_table: Option<String>,
    pub target_key_column: Option<String>,
    pub target_display_column: Option<String>,
    pub is_self_link: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDescriptor {
    /// Configuration field id; `None` for columns known only from the catalog.
    pub id: Option<Uuid>,
    /// Physical column name, or the field id for many-to-many pseudo columns.
    pub key: String,
    pub title: String,
    pub index: i32,
    pub data_type: DataType,
    pub not_null: bool,
    pub is_primary_key: bool,
    pub is_name_field: bool,
    pub is_visible_in_grid: bool,
    pub is_classifier: bool,
    pub is_many_to_many: bool,
    pub is_system_attribute: bool,
    pub is_not_editable: bool,
    pub is_html: bool,
    pub is_link: bool,
    pub is_email: bool,
    pub is_latitude: bool,
    pub is_longitude: bool,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub validation_regexp: Option<String>,
    pub validation_tooltip: Option<String>,
    pub show_when_selected: bool,
    pub classifier: Option<ClassifierRef>,
    pub many_to_many: Option<ManyToManyRef>,
}

impl ColumnDescriptor {
    pub fn is_text(&self) -> bool {
        self.data_type.is_text()
    }

    pub fn is_numeric(&self) -> bool {
        self.data_type.is_numeric()
    }

    pub fn is_integer(&self) -> bool {
        self.data_type.is_integer()
    }

    pub fn is_date(&self) -> bool {
        self.data_type.is_date()
    }

    pub fn is_datetime(&self) -> bool {
        self.data_type.is_datetime()
    }

    pub fn is_boolean(&self) -> bool {
        self.data_type.is_boolean()
    }

    /// A column persisted in the registry table itself.
    pub fn is_scalar(&self) -> bool {
        !self.is_many_to_many
    }

    /// Join alias of this column's classifier table.
    pub fn join_alias(&self) -> String {
        match self.id {
            Some(id) => format!("cls_{}", id.simple()),
            None => format!("cls_{}", self.key),
        }
    }
}

/// Geometry layer a registry is bound to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerBinding {
    pub layer_id: Uuid,
    pub schema: String,
    pub feature_class: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelatedRegistry {
    /// Registry id, or the link id for entity links.
    pub id: String,
    pub alias: Option<String>,
    /// Column on the target side.
    pub field: String,
    /// Column on this registry's side.
    pub registry_field: String,
    pub link_type: EntityType,
    pub automatic: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryDescriptor {
    pub id: Uuid,
    pub name: String,
    pub schema: String,
    pub table_name: String,
    pub resource_id: Option<Uuid>,
    pub resource_name: String,
    pub organization_id: Option<Uuid>,
    pub territory_id: Option<Uuid>,
    pub spatial_data_pd_id: Option<Uuid>,
    pub layer: Option<LayerBinding>,
    /// Column on the layer's feature table holding the back-reference.
    pub spatial_data_field: Option<String>,
    /// Column on the registry table holding the forward geometry id.
    pub map_id_field: Option<String>,
    pub store_history: bool,
    pub use_turning_points: bool,
    pub allow_imported_geometry_edit: bool,
    pub name_column: Option<String>,
    pub latitude_column: Option<String>,
    pub longitude_column: Option<String>,
    pub columns: Vec<ColumnDescriptor>,
    pub related_registries: Vec<RelatedRegistry>,
    #[serde(skip)]
    primary_key_index: usize,
}

impl RegistryDescriptor {
    pub fn primary_key(&self) -> &ColumnDescriptor {
        &self.columns[self.primary_key_index]
    }

    pub fn column(&self, key: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.key == key)
    }

    pub fn scalar_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_scalar())
    }

    pub fn classifier_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_classifier)
    }

    pub fn many_to_many_columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter().filter(|c| c.is_many_to_many)
    }

    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table_name)
    }
}

// ============================================================================
// Assembly
// ============================================================================

/// Everything [`build_descriptor`] reads.
pub struct DescriptorInputs<'a> {
    pub snapshot: &'a MetadataSnapshot,
    pub registry_id: Uuid,
    pub schema: &'a str,
    pub physical_columns: &'a [PhysicalColumn],
    pub display_columns: &'a HashMap<String, Vec<DisplayColumnDescription>>,
    /// Type of the related key column of each collection field's link table.
    pub link_value_types: &'a HashMap<Uuid, DataType>,
}

#[derive(Debug, Deserialize)]
struct AutomaticLink {
    #[serde(rename = "SpatialDataRegistryFieldId")]
    field_id: Uuid,
    #[serde(rename = "Alias", default)]
    alias: Option<String>,
}

/// Parse the `linked_spatial_fields` JSON blob. Malformed or empty text
/// yields no links.
pub fn parse_automatic_links(raw: Option<&str>) -> Vec<(Uuid, Option<String>)> {
    raw.filter(|s| !s.trim().is_empty())
        .and_then(|s| serde_json::from_str::<Vec<AutomaticLink>>(s).ok())
        .unwrap_or_default()
        .into_iter()
        .map(|l| (l.field_id, l.alias))
        .collect()
}

pub fn build_descriptor(inputs: DescriptorInputs<'_>) -> Result<RegistryDescriptor> {
    let DescriptorInputs {
        snapshot,
        registry_id,
        schema,
        physical_columns,
        display_columns,
        link_value_types,
    } = inputs;

    let registry = snapshot
        .registries
        .get(&registry_id)
        .ok_or_else(|| RegistryError::not_found(format!("registry {registry_id}")))?;
    let table_name = registry
        .table_name
        .clone()
        .ok_or_else(|| RegistryError::DescriptorBuild(format!("registry {} has no table", registry.name)))?;
    let resource_name = registry.resource_name.clone().ok_or_else(|| {
        RegistryError::DescriptorBuild(format!("resource of registry {} was deleted", registry.name))
    })?;
    if physical_columns.is_empty() {
        return Err(RegistryError::DescriptorBuild(format!(
            "table {schema}.{table_name} does not exist"
        )));
    }

    let empty = Vec::new();
    let mut fields: Vec<&FieldRow> = snapshot
        .fields_by_registry
        .get(&registry_id)
        .unwrap_or(&empty)
        .iter()
        .filter(|f| f.column.is_some())
        .collect();
    fields.sort_by_key(|f| f.index.unwrap_or(i32::MAX));

    let column_of = |id: Option<Uuid>| -> Option<String> {
        id.and_then(|id| fields.iter().find(|f| f.id == id))
            .and_then(|f| f.column.clone())
    };
    let name_column = column_of(registry.name_field_id);
    let latitude_column = column_of(registry.latitude_field_id);
    let longitude_column = column_of(registry.longitude_field_id);

    let mut columns = Vec::with_capacity(fields.len());
    for field in &fields {
        let Some(key) = field.column.clone() else {
            continue;
        };
        let physical = physical_columns.iter().find(|c| c.name == key);
        let declared = field.data_type.as_deref().and_then(DataType::from_catalog);
        let Some(data_type) = declared.or_else(|| physical.and_then(|p| p.data_type)) else {
            // Geometry and other user-defined columns are not part of the record.
            continue;
        };
        if physical.is_none() {
            return Err(RegistryError::DescriptorBuild(format!(
                "column {key} of registry {} is missing from {schema}.{table_name}",
                registry.name
            )));
        }

        let is_primary_key = field.is_primary_key.unwrap_or(false);
        let classifier = classifier_ref(field, registry, snapshot, schema, display_columns);
        let is_text_editor = data_type == DataType::Text;
        let editor = field.editor_type.unwrap_or(0);

        columns.push(ColumnDescriptor {
            id: Some(field.id),
            title: field.alias.clone().filter(|a| !a.is_empty()).unwrap_or_else(|| key.clone()),
            index: field.index.unwrap_or(0),
            data_type,
            not_null: field.not_null.unwrap_or(false),
            is_primary_key,
            is_name_field: name_column.as_deref() == Some(key.as_str()),
            is_visible_in_grid: !is_primary_key && field.is_auto_generated_column.unwrap_or(false),
            is_classifier: classifier.is_some(),
            is_many_to_many: false,
            is_system_attribute: SYSTEM_ATTRIBUTES.contains(&key.as_str()),
            is_not_editable: classifier
                .as_ref()
                .map(|c| c.qualified_table() == TERRITORY_TABLE && key == "oktmo_id")
                .unwrap_or(false),
            is_html: is_text_editor && editor == 1,
            is_link: is_text_editor && editor == 2,
            is_email: is_text_editor && editor == 3,
            is_latitude: latitude_column.as_deref() == Some(key.as_str()),
            is_longitude: longitude_column.as_deref() == Some(key.as_str()),
            min_value: field.min_value,
            max_value: field.max_value,
            validation_regexp: field.validation_regexp.clone().filter(|r| !r.is_empty()),
            validation_tooltip: field.validation_tooltip.clone(),
            show_when_selected: field.show_when_selected.unwrap_or(false),
            classifier,
            many_to_many: None,
            key,
        });
    }

    // Fall back to the catalog primary key when no field declares one.
    if !columns.iter().any(|c| c.is_primary_key) {
        let catalog_pk: Vec<&PhysicalColumn> =
            physical_columns.iter().filter(|c| c.is_primary_key).collect();
        if let [pk] = catalog_pk.as_slice() {
            if let Some(existing) = columns.iter_mut().find(|c| c.key == pk.name) {
                existing.is_primary_key = true;
                existing.is_visible_in_grid = false;
            } else if let Some(data_type) = pk.data_type {
                columns.insert(0, ephemeral_column(pk, data_type));
            }
        }
    }

    let pk_count = columns.iter().filter(|c| c.is_primary_key).count();
    if pk_count != 1 {
        return Err(RegistryError::DescriptorBuild(format!(
            "registry {} must have exactly one primary key column, found {pk_count}",
            registry.name
        )));
    }

    if let Some(collection_fields) = snapshot.collection_fields_by_registry.get(&registry_id) {
        for cf in collection_fields {
            if let Some(column) = many_to_many_column(cf, &table_name, schema, link_value_types) {
                columns.push(column);
            }
        }
    }
    columns.sort_by_key(|c| c.index);

    let primary_key_index = columns
        .iter()
        .position(|c| c.is_primary_key)
        .ok_or_else(|| RegistryError::DescriptorBuild("primary key vanished".into()))?;

    let related_registries = related_registries(registry, snapshot);

    let layer = match (
        registry.layer_id,
        registry.layer_schema.clone(),
        registry.layer_feature_class.clone(),
    ) {
        (Some(layer_id), Some(schema), Some(feature_class)) => Some(LayerBinding {
            layer_id,
            schema,
            feature_class,
        }),
        _ => None,
    };

    Ok(RegistryDescriptor {
        id: registry.id,
        name: registry.name.clone(),
        schema: schema.to_string(),
        table_name,
        resource_id: registry.resource_id,
        resource_name,
        organization_id: registry.urban_planning_object_id,
        territory_id: registry.oktmo_id,
        spatial_data_pd_id: registry.spatial_data_pd_id,
        layer,
        spatial_data_field: registry.spatial_data_field.clone().filter(|s| !s.is_empty()),
        map_id_field: registry.map_id_field.clone().filter(|s| !s.is_empty()),
        store_history: registry.store_history,
        use_turning_points: registry.use_turning_points,
        allow_imported_geometry_edit: registry.allow_imported_geometry_edit,
        name_column,
        latitude_column,
        longitude_column,
        columns,
        related_registries,
        primary_key_index,
    })
}

fn classifier_ref(
    field: &FieldRow,
    registry: &RegistryRow,
    snapshot: &MetadataSnapshot,
    default_schema: &str,
    display_columns: &HashMap<String, Vec<DisplayColumnDescription>>,
) -> Option<ClassifierRef> {
    let key_column = field.foreign_table_key_column.clone()?;
    let qualified = field.foreign_table.as_deref()?;
    let (schema, table) = split_qualified(qualified, default_schema);
    let display_column = field.foreign_table_display_column.clone();
    let display_type = display_column.as_ref().and_then(|dc| {
        display_columns
            .get(&format!("{schema}.{table}"))
            .and_then(|cols| cols.iter().find(|c| &c.column == dc))
            .and_then(|c| c.data_type)
    });
    let is_self_link = registry.table_name.as_deref() == Some(table);
    Some(ClassifierRef {
        schema: schema.to_string(),
        table: table.to_string(),
        key_column,
        display_column,
        display_type,
        classifier_registry_id: snapshot.registry_by_table(table).map(|r| r.id),
        is_self_link,
    })
}

fn many_to_many_column(
    cf: &CollectionFieldRow,
    own_table: &str,
    default_schema: &str,
    link_value_types: &HashMap<Uuid, DataType>,
) -> Option<ColumnDescriptor> {
    let (link_schema, link_table) = split_qualified(cf.foreign_table.as_deref()?, default_schema);
    let target = cf
        .many_to_many_table
        .as_deref()
        .map(|t| split_qualified(t, default_schema));
    let key = cf.id.to_string();
    Some(ColumnDescriptor {
        id: Some(cf.id),
        title: cf.alias.clone().unwrap_or_else(|| key.clone()),
        index: cf.index,
        data_type: link_value_types.get(&cf.id).copied().unwrap_or(DataType::Uuid),
        not_null: cf.not_null,
        is_primary_key: false,
        is_name_field: false,
        is_visible_in_grid: false,
        is_classifier: false,
        is_many_to_many: true,
        is_system_attribute: false,
        is_not_editable: false,
        is_html: false,
        is_link: false,
        is_email: false,
        is_latitude: false,
        is_longitude: false,
        min_value: None,
        max_value: None,
        validation_regexp: None,
        validation_tooltip: None,
        show_when_selected: false,
        classifier: None,
        many_to_many: Some(ManyToManyRef {
            link_schema: link_schema.to_string(),
            link_table: link_table.to_string(),
            record_column: cf.foreign_table_key_column.clone()?,
            value_column: cf.foreign_table_second_key_column.clone()?,
            value_type: link_value_types.get(&cf.id).copied().unwrap_or(DataType::Uuid),
            target_schema: target.map(|(s, _)| s.to_string()),
            target_table: target.map(|(_, t)| t.to_string()),
            target_key_column: cf.many_to_many_column.clone(),
            target_display_column: cf.many_to_many_display_column.clone(),
            is_self_link: target.map(|(_, t)| t == own_table).unwrap_or(false),
        }),
        key,
    })
}

fn ephemeral_column(pk: &PhysicalColumn, data_type: DataType) -> ColumnDescriptor {
    ColumnDescriptor {
        id: None,
        key: pk.name.clone(),
        title: pk.name.clone(),
        index: -1,
        data_type,
        not_null: true,
        is_primary_key: true,
        is_name_field: false,
        is_visible_in_grid: false,
        is_classifier: false,
        is_many_to_many: false,
        is_system_attribute: false,
        is_not_editable: false,
        is_html: false,
        is_link: false,
        is_email: false,
        is_latitude: false,
        is_longitude: false,
        min_value: None,
        max_value: None,
        validation_regexp: None,
        validation_tooltip: None,
        show_when_selected: false,
        classifier: None,
        many_to_many: None,
    }
}

/// Automatic links from `linked_spatial_fields` first, then manual registry
/// links, then entity links.
fn related_registries(registry: &RegistryRow, snapshot: &MetadataSnapshot) -> Vec<RelatedRegistry> {
    let mut related = Vec::new();

    for (field_id, alias) in parse_automatic_links(registry.linked_spatial_fields.as_deref()) {
        let Some(field) = snapshot.fields.get(&field_id) else {
            continue;
        };
        let (Some(target_registry), Some(column)) = (field.spatial_data_registry_id, field.column.clone())
        else {
            continue;
        };
        related.push(RelatedRegistry {
            id: target_registry.to_string(),
            alias,
            field: column,
            registry_field: field.foreign_table_key_column.clone().unwrap_or_default(),
            link_type: EntityType::Registry,
            automatic: true,
        });
    }

    let Some(links) = snapshot.links_by_registry.get(&registry.id) else {
        return related;
    };
    let source_column = |field_id: Uuid| {
        snapshot
            .fields
            .get(&field_id)
            .and_then(|f| f.column.clone())
            .unwrap_or_default()
    };

    for link in links.iter().filter(|l| l.link_type == EntityType::Registry.code()) {
        let Some(linked) = link.linked_field_id.and_then(|id| snapshot.fields.get(&id)) else {
            continue;
        };
        let Some(target_registry) = linked.spatial_data_registry_id else {
            continue;
        };
        related.push(RelatedRegistry {
            id: target_registry.to_string(),
            alias: link.alias.clone(),
            field: linked.column.clone().unwrap_or_default(),
            registry_field: source_column(link.field_id),
            link_type: EntityType::Registry,
            automatic: false,
        });
    }

    for link in links.iter().filter(|l| l.link_type != EntityType::Registry.code()) {
        let Some(link_type) = EntityType::from_code(link.link_type) else {
            continue;
        };
        related.push(RelatedRegistry {
            id: link.id.to_string(),
            alias: link.alias.clone(),
            field: link.entity_table_column_name.clone().unwrap_or_default(),
            registry_field: source_column(link.field_id),
            link_type,
            automatic: false,
        });
    }

    related
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::registry::metadata::LinkRow;
    use pretty_assertions::assert_eq;

    pub(crate) fn registry_row(id: Uuid, name: &str, table: &str) -> RegistryRow {
        RegistryRow {
            id,
            name: name.to_string(),
            table_name: Some(table.to_string()),
            urban_planning_object_id: None,
            oktmo_id: None,
            spatial_data_pd_id: None,
            layer_id: None,
            layer_schema: None,
            layer_feature_class: None,
            spatial_data_field: None,
            map_id_field: None,
            resource_id: Some(Uuid::new_v4()),
            resource_name: Some(table.to_string()),
            linked_spatial_fields: None,
            store_history: false,
            use_turning_points: false,
            allow_imported_geometry_edit: true,
            name_field_id: None,
            latitude_field_id: None,
            longitude_field_id: None,
        }
    }

    pub(crate) fn field_row(registry_id: Uuid, column: &str, data_type: &str, index: i32) -> FieldRow {
        FieldRow {
            id: Uuid::new_v4(),
            spatial_data_registry_id: Some(registry_id),
            column: Some(column.to_string()),
            data_type: Some(data_type.to_string()),
            alias: None,
            index: Some(index),
            foreign_table: None,
            foreign_table_key_column: None,
            foreign_table_display_column: None,
            not_null: Some(false),
            is_primary_key: Some(false),
            is_auto_generated_column: Some(true),
            editor_type: None,
            min_value: None,
            max_value: None,
            validation_regexp: None,
            validation_tooltip: None,
            show_when_selected: None,
        }
    }

    pub(crate) fn physical(name: &str, data_type: DataType, pk: bool) -> PhysicalColumn {
        PhysicalColumn {
            name: name.to_string(),
            data_type: Some(data_type),
            raw_type: data_type.catalog_name().to_string(),
            nullable: !pk,
            is_primary_key: pk,
            foreign_key: None,
        }
    }

    /// The "Wells" registry: id, name (name field), depth (numeric, not
    /// null), zone (classifier on register.zones by code/title).
    pub(crate) fn wells_fixture() -> (MetadataSnapshot, Uuid, Vec<PhysicalColumn>) {
        let wells_id = Uuid::new_v4();
        let mut registry = registry_row(wells_id, "Wells", "wells");

        let mut id = field_row(wells_id, "id", "uuid", 0);
        id.is_primary_key = Some(true);
        let name = field_row(wells_id, "name", "text", 1);
        registry.name_field_id = Some(name.id);
        let mut depth = field_row(wells_id, "depth", "numeric", 2);
        depth.not_null = Some(true);
        let mut zone = field_row(wells_id, "zone", "uuid", 3);
        zone.foreign_table = Some("register.zones".into());
        zone.foreign_table_key_column = Some("code".into());
        zone.foreign_table_display_column = Some("title".into());

        let snapshot = MetadataSnapshot::from_rows(vec![registry], vec![id, name, depth, zone], vec![], vec![]);
        let columns = vec![
            physical("id", DataType::Uuid, true),
            physical("name", DataType::Text, false),
            physical("depth", DataType::Numeric, false),
            physical("zone", DataType::Uuid, false),
        ];
        (snapshot, wells_id, columns)
    }

    pub(crate) fn wells_descriptor() -> RegistryDescriptor {
        let (snapshot, wells_id, columns) = wells_fixture();
        let mut display = HashMap::new();
        display.insert(
            "register.zones".to_string(),
            vec![DisplayColumnDescription {
                table: "register.zones".into(),
                column: "title".into(),
                data_type: Some(DataType::Text),
                not_null: true,
            }],
        );
        build_descriptor(DescriptorInputs {
            snapshot: &snapshot,
            registry_id: wells_id,
            schema: "register",
            physical_columns: &columns,
            display_columns: &display,
            link_value_types: &HashMap::new(),
        })
        .unwrap()
    }

    #[test]
    fn wells_descriptor_flags() {
        let d = wells_descriptor();
        assert_eq!(d.primary_key().key, "id");
        assert_eq!(d.name_column.as_deref(), Some("name"));

        let depth = d.column("depth").unwrap();
        assert!(depth.is_numeric());
        assert!(depth.not_null);
        assert!(depth.is_visible_in_grid);

        let zone = d.column("zone").unwrap();
        assert!(zone.is_classifier);
        let cls = zone.classifier.as_ref().unwrap();
        assert_eq!(cls.table, "zones");
        assert_eq!(cls.display_type, Some(DataType::Text));
        assert!(!cls.is_self_link);
        assert!(!d.column("id").unwrap().is_visible_in_grid);
    }

    #[test]
    fn exactly_one_primary_key() {
        let (mut snapshot, wells_id, columns) = wells_fixture();
        for f in snapshot.fields_by_registry.get_mut(&wells_id).unwrap() {
            if f.column.as_deref() == Some("name") {
                f.is_primary_key = Some(true);
            }
        }
        let err = build_descriptor(DescriptorInputs {
            snapshot: &snapshot,
            registry_id: wells_id,
            schema: "register",
            physical_columns: &columns,
            display_columns: &HashMap::new(),
            link_value_types: &HashMap::new(),
        })
        .unwrap_err();
        assert!(matches!(err, RegistryError::DescriptorBuild(_)));
    }

    #[test]
    fn catalog_primary_key_fallback() {
        let (mut snapshot, wells_id, columns) = wells_fixture();
        snapshot
            .fields_by_registry
            .get_mut(&wells_id)
            .unwrap()
            .retain(|f| f.column.as_deref() != Some("id"));
        let d = build_descriptor(DescriptorInputs {
            snapshot: &snapshot,
            registry_id: wells_id,
            schema: "register",
            physical_columns: &columns,
            display_columns: &HashMap::new(),
            link_value_types: &HashMap::new(),
        })
        .unwrap();
        assert_eq!(d.primary_key().key, "id");
        assert_eq!(d.primary_key().id, None);
    }

    #[test]
    fn missing_table_is_a_build_error() {
        let (snapshot, wells_id, _) = wells_fixture();
        let err = build_descriptor(DescriptorInputs {
            snapshot: &snapshot,
            registry_id: wells_id,
            schema: "register",
            physical_columns: &[],
            display_columns: &HashMap::new(),
            link_value_types: &HashMap::new(),
        })
        .unwrap_err();
        assert!(matches!(err, RegistryError::DescriptorBuild(_)));
    }

    #[test]
    fn self_link_classifier_is_flagged() {
        let (mut snapshot, wells_id, mut columns) = wells_fixture();
        let mut parent = field_row(wells_id, "parent_id", "uuid", 4);
        parent.foreign_table = Some("register.wells".into());
        parent.foreign_table_key_column = Some("id".into());
        parent.foreign_table_display_column = Some("name".into());
        snapshot.fields_by_registry.get_mut(&wells_id).unwrap().push(parent);
        columns.push(physical("parent_id", DataType::Uuid, false));

        let d = build_descriptor(DescriptorInputs {
            snapshot: &snapshot,
            registry_id: wells_id,
            schema: "register",
            physical_columns: &columns,
            display_columns: &HashMap::new(),
            link_value_types: &HashMap::new(),
        })
        .unwrap();
        let cls = d.column("parent_id").unwrap().classifier.clone().unwrap();
        assert!(cls.is_self_link);
        assert_eq!(cls.classifier_registry_id, Some(wells_id));
    }

    #[test]
    fn automatic_and_manual_links_merge() {
        let (snapshot, wells_id, columns) = wells_fixture();
        let zones_id = Uuid::new_v4();
        let mut zones = registry_row(zones_id, "Zones", "zones");
        let mut well_ref = field_row(zones_id, "well_id", "uuid", 1);
        well_ref.foreign_table = Some("register.wells".into());
        well_ref.foreign_table_key_column = Some("id".into());
        zones.linked_spatial_fields = None;

        let mut wells = snapshot.registries.get(&wells_id).unwrap().clone();
        wells.linked_spatial_fields = Some(format!(
            r#"[{{"SpatialDataRegistryFieldId":"{}","Alias":"Zone wells"}}]"#,
            well_ref.id
        ));
        let name_field = snapshot.fields_by_registry[&wells_id]
            .iter()
            .find(|f| f.column.as_deref() == Some("name"))
            .unwrap()
            .clone();
        let entity_link = LinkRow {
            id: Uuid::new_v4(),
            field_id: name_field.id,
            link_type: EntityType::CadastralStead.code(),
            linked_field_id: None,
            entity_table_column_name: Some("cadastral_number".into()),
            alias: Some("Stead".into()),
            is_used: Some(true),
            source_registry_id: Some(wells_id),
        };

        let mut fields: Vec<FieldRow> = snapshot.fields.values().cloned().collect();
        fields.push(well_ref);
        let snapshot = MetadataSnapshot::from_rows(vec![wells, zones], fields, vec![], vec![entity_link]);

        let d = build_descriptor(DescriptorInputs {
            snapshot: &snapshot,
            registry_id: wells_id,
            schema: "register",
            physical_columns: &columns,
            display_columns: &HashMap::new(),
            link_value_types: &HashMap::new(),
        })
        .unwrap();
        assert_eq!(d.related_registries.len(), 2);
        assert!(d.related_registries[0].automatic);
        assert_eq!(d.related_registries[0].id, zones_id.to_string());
        assert_eq!(d.related_registries[0].registry_field, "id");
        assert_eq!(d.related_registries[1].link_type, EntityType::CadastralStead);
        assert_eq!(d.related_registries[1].registry_field, "name");
    }

    #[test]
    fn entity_codes_round_trip() {
        for code in [0, 10, 20, 30, 40, 50, 60, 70, 80, 100, 120, 130, 140, 150, 200, 210] {
            assert_eq!(EntityType::from_code(code).map(EntityType::code), Some(code));
        }
        assert_eq!(EntityType::from_code(90), None);
    }

    #[test]
    fn malformed_link_blob_is_empty() {
        assert!(parse_automatic_links(Some("not json")).is_empty());
        assert!(parse_automatic_links(Some("")).is_empty());
        assert!(parse_automatic_links(None).is_empty());
    }
}
