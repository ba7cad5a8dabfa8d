//! Geometry service: permission-gated, transactional entry points around
//! [`GeometryEngine`].

use std::sync::Arc;

use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::engine::{GeometryEngine, GeometryOutcome};
use super::layer::GeometryBinding;
use super::store::{GeometryInput, PgSpatialStore, SpatialStore};
use crate::database::{AuditAction, AuditLogService};
use crate::error::{RegistryError, Result};
use crate::ports::{
    require_capability, require_territory, AccessControl, Actor, CoordinateProfile, EnginePorts, RegistryAction,
};
use crate::registry::crud::parse_record_key;
use crate::registry::descriptor::RegistryDescriptor;
use crate::registry::metadata::MetadataRepository;
use crate::registry::model::{HandleRegistry, ModelBuilder};
use crate::registry::value::{CellValue, Record};

/// A record whose geometry is about to change, already checked.
struct Target {
    descriptor: Arc<RegistryDescriptor>,
    key: CellValue,
    record: Record,
    binding: GeometryBinding,
}

impl Target {
    fn forward_reference(&self) -> Option<String> {
        self.record
            .get(&self.binding.map_id_field)
            .and_then(CellValue::as_key_string)
    }

    fn bound_reference(&self, requested: Option<&str>, record_id: &str) -> Result<String> {
        bound_reference(self.forward_reference(), requested, record_id)
    }
}

/// The geometry reference a transition on one record may touch: the record's
/// own forward reference. A requested reference must name that same geometry.
fn bound_reference(forward: Option<String>, requested: Option<&str>, record_id: &str) -> Result<String> {
    let missing = || RegistryError::not_found(format!("geometry of record {record_id}"));
    let forward = forward.ok_or_else(missing)?;
    match requested.map(str::trim) {
        Some(r) if !r.is_empty() && r != forward => Err(RegistryError::not_found(format!(
            "geometry {r} of record {record_id}"
        ))),
        _ => Ok(forward),
    }
}

pub struct GeometryService {
    pool: PgPool,
    metadata: Arc<MetadataRepository>,
    handles: Arc<HandleRegistry>,
    access: Arc<dyn AccessControl>,
    profile: Arc<dyn CoordinateProfile>,
    source_srid: i32,
}

impl GeometryService {
    pub fn new(
        pool: PgPool,
        metadata: Arc<MetadataRepository>,
        handles: Arc<HandleRegistry>,
        ports: &EnginePorts,
        source_srid: i32,
    ) -> Self {
        Self {
            pool,
            metadata,
            handles,
            access: ports.access.clone(),
            profile: ports.profile.clone(),
            source_srid,
        }
    }

    async fn target(
        &self,
        actor: &Actor,
        registry_id: Uuid,
        record_id: &str,
        action: RegistryAction,
    ) -> Result<Target> {
        let descriptor = self.metadata.get_registry_descriptor(registry_id).await?;
        require_capability(
            self.access.as_ref(),
            actor,
            &descriptor.resource_name,
            &descriptor.name,
            action,
        )
        .await?;

        let key = parse_record_key(&descriptor, record_id)?;
        let handle = ModelBuilder::new(self.metadata.introspector(), &self.handles)
            .build(&descriptor, false)
            .await?;
        let mut conn = self.pool.acquire().await?;
        let record = handle
            .find_by_pk(&mut conn, &key)
            .await?
            .ok_or_else(|| RegistryError::not_found(format!("record {record_id} of {}", descriptor.name)))?;
        require_territory(self.access.as_ref(), actor, &record, &descriptor.name, action)?;

        let binding =
            GeometryBinding::resolve(&descriptor, self.metadata.introspector(), self.profile.as_ref()).await?;
        Ok(Target {
            descriptor,
            key,
            record,
            binding,
        })
    }

    /// Bind a new geometry to a record. `projection` defaults to the
    /// configured source projection.
    pub async fn create_geometry(
        &self,
        actor: &Actor,
        registry_id: Uuid,
        record_id: &str,
        geometry: &GeometryInput,
        projection: Option<i32>,
    ) -> Result<GeometryOutcome> {
        let target = self.target(actor, registry_id, record_id, RegistryAction::Update).await?;
        let srid = projection.unwrap_or(self.source_srid);

        let mut tx = self.pool.begin().await?;
        let outcome = {
            let mut store = PgSpatialStore::new(&mut tx);
            GeometryEngine::create(&mut store, &target.binding, &target.key, geometry, srid).await?
        };
        AuditLogService::record(
            &mut tx,
            AuditAction::Edit,
            &actor.full_name,
            &target.descriptor.name,
            &format!("geometry of record {record_id}"),
        )
        .await?;
        tx.commit().await?;

        info!("Geometry of {} record {} created", target.descriptor.name, record_id);
        Ok(outcome)
    }

    /// Replace a record's geometry. A given `reference` must match the
    /// record's forward reference.
    pub async fn update_geometry(
        &self,
        actor: &Actor,
        registry_id: Uuid,
        record_id: &str,
        reference: Option<&str>,
        geometry: &GeometryInput,
        projection: Option<i32>,
    ) -> Result<GeometryOutcome> {
        let target = self.target(actor, registry_id, record_id, RegistryAction::Update).await?;
        let reference = target.bound_reference(reference, record_id)?;
        let srid = projection.unwrap_or(self.source_srid);

        let mut tx = self.pool.begin().await?;
        let outcome = {
            let mut store = PgSpatialStore::new(&mut tx);
            GeometryEngine::update(&mut store, &target.binding, &reference, geometry, srid).await?
        };
        AuditLogService::record(
            &mut tx,
            AuditAction::Edit,
            &actor.full_name,
            &target.descriptor.name,
            &format!("geometry {reference} of record {record_id}"),
        )
        .await?;
        tx.commit().await?;
        Ok(outcome)
    }

    pub async fn delete_geometry(
        &self,
        actor: &Actor,
        registry_id: Uuid,
        record_id: &str,
        reference: Option<&str>,
    ) -> Result<GeometryOutcome> {
        let target = self.target(actor, registry_id, record_id, RegistryAction::Update).await?;
        let reference = target.bound_reference(reference, record_id)?;

        let mut tx = self.pool.begin().await?;
        let outcome = {
            let mut store = PgSpatialStore::new(&mut tx);
            GeometryEngine::delete(&mut store, &target.binding, &reference).await?
        };
        AuditLogService::record(
            &mut tx,
            AuditAction::Delete,
            &actor.full_name,
            &target.descriptor.name,
            &format!("geometry {reference} of record {record_id}"),
        )
        .await?;
        tx.commit().await?;

        info!("Geometry {} of {} deleted", reference, target.descriptor.name);
        Ok(outcome)
    }

    /// Number of feature rows (versions included) behind `reference`.
    pub async fn count_geometries(&self, actor: &Actor, registry_id: Uuid, reference: &str) -> Result<i64> {
        let descriptor = self.metadata.get_registry_descriptor(registry_id).await?;
        require_capability(
            self.access.as_ref(),
            actor,
            &descriptor.resource_name,
            &descriptor.name,
            RegistryAction::Read,
        )
        .await?;
        let binding =
            GeometryBinding::resolve(&descriptor, self.metadata.introspector(), self.profile.as_ref()).await?;
        let mut conn = self.pool.acquire().await?;
        let mut store = PgSpatialStore::new(&mut conn);
        GeometryEngine::count(&mut store, &binding, reference).await
    }

    /// Current geometry of a record as GeoJSON, if bound.
    pub async fn get_geometry(&self, actor: &Actor, registry_id: Uuid, record_id: &str) -> Result<Option<String>> {
        let target = self.target(actor, registry_id, record_id, RegistryAction::Read).await?;
        let Some(reference) = target.forward_reference() else {
            return Ok(None);
        };
        let mut conn = self.pool.acquire().await?;
        let mut store = PgSpatialStore::new(&mut conn);
        store.current_geometry(&target.binding.layer, &reference).await
    }

    /// Reproject a geometry between two projections, returning WKT.
    pub async fn reproject(&self, geometry: &GeometryInput, from_srid: i32, to_srid: i32) -> Result<String> {
        let mut conn = self.pool.acquire().await?;
        let mut store = PgSpatialStore::new(&mut conn);
        store.transform_geometry(geometry, from_srid, to_srid).await
    }

    /// Rebind a record to another geometry id, or unbind it with `None`.
    pub async fn change_gis_id(
        &self,
        actor: &Actor,
        registry_id: Uuid,
        record_id: &str,
        gis_id: Option<&str>,
    ) -> Result<()> {
        let target = self.target(actor, registry_id, record_id, RegistryAction::Update).await?;
        let gis_id = gis_id.filter(|g| !g.trim().is_empty());

        let mut tx = self.pool.begin().await?;
        {
            let mut store = PgSpatialStore::new(&mut tx);
            store
                .write_forward_reference(&target.binding, &target.key, gis_id)
                .await?;
        }
        AuditLogService::record(
            &mut tx,
            AuditAction::Edit,
            &actor.full_name,
            &target.descriptor.name,
            &format!("record {record_id} geometry id -> {}", gis_id.unwrap_or("none")),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_defaults_to_the_record_binding() {
        let reference = bound_reference(Some("17".into()), None, "a").unwrap();
        assert_eq!(reference, "17");
        assert_eq!(bound_reference(Some("17".into()), Some("17"), "a").unwrap(), "17");
    }

    #[test]
    fn reference_of_another_record_is_not_found() {
        let err = bound_reference(Some("17".into()), Some("42"), "a").unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[test]
    fn unbound_record_has_no_geometry_to_change() {
        let err = bound_reference(None, Some("42"), "a").unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }
}
