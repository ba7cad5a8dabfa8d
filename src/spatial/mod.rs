//! Geometry binding of registry records
//!
//! A record points at its geometry through a forward reference column; the
//! layer row points back at the record. With history enabled every change
//! closes the open version and appends a new one.

pub mod csv;
pub mod engine;
pub mod layer;
pub mod service;
pub mod store;

pub use engine::{GeometryEngine, GeometryOutcome};
pub use layer::{GeometryBinding, LayerTable};
pub use service::GeometryService;
pub use store::{GeometryInput, PgSpatialStore, SpatialStore};
