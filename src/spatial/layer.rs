//! Layer feature tables and how a registry is bound to one.

use serde::Serialize;

use crate::error::{RegistryError, Result};
use crate::ports::CoordinateProfile;
use crate::registry::descriptor::RegistryDescriptor;
use crate::registry::introspect::{SchemaCatalog, SchemaIntrospector};
use crate::registry::value::DataType;

/// Generated key column of every feature table.
pub const FEATURE_KEY_COLUMN: &str = "objectid";

const START_DATE: &str = "start_date";
const END_DATE: &str = "end_date";

/// One layer's physical feature table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerTable {
    pub schema: String,
    pub table: String,
    pub key_column: String,
    pub geometry_column: String,
    /// Projection geometries are stored in.
    pub srid: i32,
    /// Column holding the registry record's reference value.
    pub back_ref_column: String,
    pub back_ref_type: DataType,
    /// The table carries `start_date`/`end_date`.
    pub has_validity: bool,
}

/// Everything the geometry engine needs to know about one registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeometryBinding {
    pub layer: LayerTable,
    pub registry_schema: String,
    pub registry_table: String,
    pub pk_column: String,
    pub pk_type: DataType,
    /// Record column holding the forward reference.
    pub map_id_field: String,
    pub map_id_type: DataType,
    pub store_history: bool,
}

impl GeometryBinding {
    /// Resolve the binding of `descriptor`'s layer.
    ///
    /// The layer SRID comes from the geometry catalog and falls back to the
    /// coordinate profile when the table was registered without one.
    pub async fn resolve(
        descriptor: &RegistryDescriptor,
        introspector: &SchemaIntrospector,
        profile: &dyn CoordinateProfile,
    ) -> Result<Self> {
        let layer = descriptor
            .layer
            .as_ref()
            .ok_or_else(|| RegistryError::not_found(format!("layer of registry {}", descriptor.name)))?;
        let map_id_field = descriptor.map_id_field.clone().ok_or_else(|| {
            RegistryError::DescriptorBuild(format!("registry {} has no geometry id field", descriptor.name))
        })?;

        let geometry = introspector
            .geometry_column(&layer.schema, &layer.feature_class)
            .await?
            .ok_or_else(|| {
                RegistryError::not_found(format!(
                    "geometry column of {}.{}",
                    layer.schema, layer.feature_class
                ))
            })?;
        let srid = match geometry.srid {
            Some(srid) => srid,
            None => profile.default_srid(descriptor.territory_id).await?,
        };

        let columns = introspector
            .describe_table(&layer.schema, &layer.feature_class)
            .await?;
        let back_ref_column = descriptor
            .spatial_data_field
            .clone()
            .unwrap_or_else(|| FEATURE_KEY_COLUMN.to_string());
        let back_ref_type = columns
            .iter()
            .find(|c| c.name == back_ref_column)
            .and_then(|c| c.data_type)
            .ok_or_else(|| {
                RegistryError::DescriptorBuild(format!(
                    "column {back_ref_column} is missing from {}.{}",
                    layer.schema, layer.feature_class
                ))
            })?;
        let has_validity = [START_DATE, END_DATE]
            .iter()
            .all(|name| columns.iter().any(|c| c.name == *name));

        let map_id_type = descriptor
            .column(&map_id_field)
            .map(|c| c.data_type)
            .unwrap_or(DataType::Text);
        let pk = descriptor.primary_key();

        let layer = LayerTable {
            schema: layer.schema.clone(),
            table: layer.feature_class.clone(),
            key_column: FEATURE_KEY_COLUMN.to_string(),
            geometry_column: geometry.column,
            srid,
            back_ref_column,
            back_ref_type,
            has_validity,
        };
        Ok(Self::new(descriptor, layer, pk.key.clone(), pk.data_type, map_id_field, map_id_type))
    }

    pub fn new(
        descriptor: &RegistryDescriptor,
        layer: LayerTable,
        pk_column: String,
        pk_type: DataType,
        map_id_field: String,
        map_id_type: DataType,
    ) -> Self {
        // History needs validity columns and a back-reference distinct from
        // the generated key, since every version gets a fresh key.
        let store_history =
            descriptor.store_history && layer.has_validity && layer.back_ref_column != layer.key_column;
        Self {
            registry_schema: descriptor.schema.clone(),
            registry_table: descriptor.table_name.clone(),
            layer,
            pk_column,
            pk_type,
            map_id_field,
            map_id_type,
            store_history,
        }
    }
}
