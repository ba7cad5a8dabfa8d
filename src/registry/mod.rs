//! Registry engine
//!
//! Metadata (configuration rows plus the physical catalog) becomes a cached
//! [`RegistryDescriptor`] per registry; descriptors become [`ModelHandle`]s
//! that read and write the registry tables. Listing requests are translated
//! into [`NativeQuerySpec`]s and rendered to SQL with every identifier
//! checked against the descriptor.

pub mod admin;
pub mod cache;
pub mod crud;
pub mod descriptor;
pub mod diff;
pub mod introspect;
pub mod metadata;
pub mod model;
pub mod query;
pub mod sql;
pub mod value;

pub use admin::{FieldConfig, LinkConfig, RegistryAdminService, RegistryConfig, RegistryCreated};
pub use cache::{CacheVersion, VersionedCache};
pub use crud::{
    ItemPage, ItemPayload, ItemView, KeptFile, RegistryClaims, RegistryCrudService, SavedItem, UploadedFile,
};
pub use descriptor::{ColumnDescriptor, EntityType, RegistryDescriptor};
pub use introspect::{SchemaCatalog, SchemaIntrospector};
pub use metadata::MetadataRepository;
pub use model::{HandleRegistry, ListedRow, ModelBuilder, ModelHandle};
pub use query::{FilterOperator, FilterSpec, ListRequest, NativeQuerySpec, SortDirection, SortSpec};
pub use value::{CellValue, DataType, Record};
