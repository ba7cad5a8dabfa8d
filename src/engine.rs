//! Registry engine wiring
//!
//! Builds the shared metadata repository, handle registry and ports once,
//! and hands every service the same instances.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::info;

use crate::config::EngineConfig;
use crate::database::{AuditLogService, DatabaseManager};
use crate::error::Result;
use crate::import_export::{ErrorLogStore, ExportService, ImportService};
use crate::ports::EnginePorts;
use crate::registry::admin::RegistryAdminService;
use crate::registry::cache::CacheVersion;
use crate::registry::crud::RegistryCrudService;
use crate::registry::metadata::MetadataRepository;
use crate::registry::model::HandleRegistry;
use crate::spatial::GeometryService;

#[derive(Clone)]
pub struct RegistryEngine {
    pub pool: PgPool,
    pub metadata: Arc<MetadataRepository>,
    pub crud: Arc<RegistryCrudService>,
    pub admin: Arc<RegistryAdminService>,
    pub geometry: Arc<GeometryService>,
    pub import: Arc<ImportService>,
    pub export: Arc<ExportService>,
    pub audit: AuditLogService,
}

impl RegistryEngine {
    /// Connect to the database and build the engine with the standalone
    /// port adapters.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        let manager = DatabaseManager::new(config.database.clone()).await?;
        manager.verify_schema().await?;
        let ports = EnginePorts::standalone(config.default_srid, config.file_store_dir.as_deref());
        Ok(Self::new(manager.pool().clone(), config, ports))
    }

    pub fn new(pool: PgPool, config: &EngineConfig, ports: EnginePorts) -> Self {
        let version = CacheVersion::global();
        let metadata = Arc::new(MetadataRepository::with_version(
            pool.clone(),
            config.registry_schema.clone(),
            config.cache_ttl,
            version,
        ));
        let handles = Arc::new(HandleRegistry::new(version));
        let error_logs = Arc::new(ErrorLogStore::new(config.error_log_ttl, config.error_log_capacity));

        let crud = Arc::new(RegistryCrudService::new(
            pool.clone(),
            metadata.clone(),
            handles.clone(),
            ports.clone(),
            config.max_inline_file_size,
            config.source_srid,
        ));
        let admin = Arc::new(RegistryAdminService::new(pool.clone(), metadata.clone(), ports.access.clone()));
        let geometry = Arc::new(GeometryService::new(
            pool.clone(),
            metadata.clone(),
            handles.clone(),
            &ports,
            config.source_srid,
        ));
        let import = Arc::new(ImportService::new(
            pool.clone(),
            metadata.clone(),
            handles,
            ports.clone(),
            error_logs.clone(),
        ));
        let export = Arc::new(ExportService::new(crud.clone(), metadata.clone(), ports, error_logs));

        info!("Registry engine ready (schema {})", config.registry_schema);
        Self {
            audit: AuditLogService::new(pool.clone()),
            pool,
            metadata,
            crud,
            admin,
            geometry,
            import,
            export,
        }
    }
}
