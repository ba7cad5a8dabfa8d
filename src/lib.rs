//! GIS registry engine
//!
//! Metadata-driven registries over PostgreSQL/PostGIS: registry tables are
//! described by configuration rows, and every record operation (listing,
//! validation, CRUD, many-to-many links, attachments, versioned geometry,
//! spreadsheet import and export) is driven by the resulting descriptor.

pub mod config;
pub mod database;
pub mod engine;
pub mod error;
pub mod import_export;
pub mod ports;
pub mod registry;
pub mod spatial;

#[cfg(feature = "server")]
pub mod api;

pub use config::EngineConfig;
pub use engine::RegistryEngine;
pub use error::{RegistryError, Result};
