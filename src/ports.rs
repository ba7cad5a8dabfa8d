//! Port traits for the collaborators the registry engine consumes.
//!
//! Access control, large-file storage, tabular serialization and the
//! coordinate profile live outside the engine. The engine depends only on
//! these traits; the adapters below cover the standalone server and tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{RegistryError, Result};
use crate::registry::value::{CellValue, Record};

/// Column holding a record's territory.
pub const TERRITORY_COLUMN: &str = "oktmo_id";

// ============================================================================
// Actor and actions
// ============================================================================

/// The user on whose behalf an operation runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Uuid,
    pub full_name: String,
    /// The user's own territory.
    #[serde(default)]
    pub territory_id: Option<Uuid>,
    /// Every territory whose records the user may list.
    #[serde(default)]
    pub territory_ids: Vec<Uuid>,
    #[serde(default)]
    pub organization_id: Option<Uuid>,
    /// Granted claims as `resource:action`; `*` grants everything.
    #[serde(default)]
    pub claims: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryAction {
    Read,
    Create,
    Update,
    Delete,
}

impl RegistryAction {
    pub const ALL: [RegistryAction; 4] = [
        RegistryAction::Read,
        RegistryAction::Create,
        RegistryAction::Update,
        RegistryAction::Delete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RegistryAction::Read => "read",
            RegistryAction::Create => "create",
            RegistryAction::Update => "update",
            RegistryAction::Delete => "delete",
        }
    }
}

impl std::fmt::Display for RegistryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Access control
// ============================================================================

#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Capability check for one action on a registry's resource.
    async fn can_perform(&self, actor: &Actor, resource: &str, action: RegistryAction)
        -> Result<bool>;

    /// Whether the record belongs to the actor's territory.
    ///
    /// Records of registries without a territory column are always in scope.
    fn is_own_territory(&self, actor: &Actor, record: &Record) -> bool {
        match record.get(TERRITORY_COLUMN) {
            None => true,
            Some(CellValue::Null) => actor.territory_id.is_none(),
            Some(CellValue::Uuid(id)) => actor.territory_id == Some(*id),
            Some(CellValue::Text(s)) => match (actor.territory_id, Uuid::parse_str(s.trim())) {
                (Some(own), Ok(id)) => own == id,
                _ => false,
            },
            Some(_) => false,
        }
    }
}

/// Resolves capabilities from the claims carried on the actor.
#[derive(Debug, Default, Clone)]
pub struct ClaimsAccessControl;

#[async_trait]
impl AccessControl for ClaimsAccessControl {
    async fn can_perform(
        &self,
        actor: &Actor,
        resource: &str,
        action: RegistryAction,
    ) -> Result<bool> {
        let wanted = format!("{}:{}", resource, action);
        let wildcard = format!("{}:*", resource);
        Ok(actor
            .claims
            .iter()
            .any(|c| c == "*" || *c == wanted || *c == wildcard))
    }
}

/// Fail with [`RegistryError::CapabilityDenied`] unless `actor` may perform
/// `action` on `resource`. `title` is the name shown in the error.
pub async fn require_capability(
    access: &dyn AccessControl,
    actor: &Actor,
    resource: &str,
    title: &str,
    action: RegistryAction,
) -> Result<()> {
    if access.can_perform(actor, resource, action).await? {
        Ok(())
    } else {
        Err(RegistryError::CapabilityDenied {
            resource: title.to_string(),
            action: action.to_string(),
        })
    }
}

/// Fail with [`RegistryError::TerritorialDenied`] when `record` lies outside
/// the actor's territory.
pub fn require_territory(
    access: &dyn AccessControl,
    actor: &Actor,
    record: &Record,
    title: &str,
    action: RegistryAction,
) -> Result<()> {
    if access.is_own_territory(actor, record) {
        Ok(())
    } else {
        Err(RegistryError::TerritorialDenied {
            resource: title.to_string(),
            action: action.to_string(),
        })
    }
}

// ============================================================================
// Large file store
// ============================================================================

#[async_trait]
pub trait LargeFileStore: Send + Sync {
    /// Upload bytes, returning the store's opaque id.
    async fn store_large_file(&self, bytes: &[u8], resource_label: &str) -> Result<String>;

    async fn read_file(&self, external_id: &str) -> Result<Vec<u8>>;
}

/// Used when no external store is configured; every upload fails.
#[derive(Debug, Default, Clone)]
pub struct NoLargeFileStore;

#[async_trait]
impl LargeFileStore for NoLargeFileStore {
    async fn store_large_file(&self, _bytes: &[u8], resource_label: &str) -> Result<String> {
        Err(RegistryError::ExternalStore(format!(
            "no external file store configured for \"{resource_label}\""
        )))
    }

    async fn read_file(&self, external_id: &str) -> Result<Vec<u8>> {
        Err(RegistryError::ExternalStore(format!(
            "no external file store configured to read {external_id}"
        )))
    }
}

/// Stores large files as plain files under a directory.
#[derive(Debug, Clone)]
pub struct DirectoryFileStore {
    root: PathBuf,
}

impl DirectoryFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl LargeFileStore for DirectoryFileStore {
    async fn store_large_file(&self, bytes: &[u8], resource_label: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| RegistryError::ExternalStore(e.to_string()))?;
        tokio::fs::write(self.root.join(&id), bytes)
            .await
            .map_err(|e| RegistryError::ExternalStore(e.to_string()))?;
        tracing::debug!("Stored {} bytes for {} as {}", bytes.len(), resource_label, id);
        Ok(id)
    }

    async fn read_file(&self, external_id: &str) -> Result<Vec<u8>> {
        let id = Uuid::parse_str(external_id)
            .map_err(|_| RegistryError::not_found(format!("file {external_id}")))?;
        tokio::fs::read(self.root.join(id.to_string()))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    RegistryError::not_found(format!("file {external_id}"))
                }
                _ => RegistryError::ExternalStore(e.to_string()),
            })
    }
}

/// In-process store, for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryFileStore {
    files: RwLock<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl LargeFileStore for MemoryFileStore {
    async fn store_large_file(&self, bytes: &[u8], _resource_label: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.files
            .write()
            .map_err(|_| RegistryError::ExternalStore("file store lock poisoned".into()))?
            .insert(id.clone(), bytes.to_vec());
        Ok(id)
    }

    async fn read_file(&self, external_id: &str) -> Result<Vec<u8>> {
        self.files
            .read()
            .map_err(|_| RegistryError::ExternalStore("file store lock poisoned".into()))?
            .get(external_id)
            .cloned()
            .ok_or_else(|| RegistryError::not_found(format!("file {external_id}")))
    }
}

// ============================================================================
// Tabular codec
// ============================================================================

/// A decoded sheet: rows of cell text, header rows included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TabularSheet {
    pub rows: Vec<Vec<String>>,
}

pub trait TableCodec: Send + Sync {
    /// Serialize a header row plus data rows.
    fn render_table(&self, columns: &[String], rows: &[Vec<String>]) -> Result<Vec<u8>>;

    fn decode_table(&self, bytes: &[u8]) -> Result<TabularSheet>;

    fn content_type(&self) -> &'static str;

    fn file_extension(&self) -> &'static str;
}

/// Semicolon separated values, as spreadsheet tools in the ru locale write them.
#[derive(Debug, Clone)]
pub struct CsvTableCodec {
    delimiter: u8,
}

impl Default for CsvTableCodec {
    fn default() -> Self {
        Self { delimiter: b';' }
    }
}

impl CsvTableCodec {
    pub fn with_delimiter(delimiter: u8) -> Self {
        Self { delimiter }
    }
}

impl TableCodec for CsvTableCodec {
    fn render_table(&self, columns: &[String], rows: &[Vec<String>]) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .flexible(true)
            .from_writer(Vec::new());
        writer
            .write_record(columns)
            .map_err(|e| RegistryError::Internal(e.into()))?;
        for row in rows {
            writer
                .write_record(row)
                .map_err(|e| RegistryError::Internal(e.into()))?;
        }
        writer
            .into_inner()
            .map_err(|e| RegistryError::Internal(anyhow::anyhow!("csv flush failed: {e}")))
    }

    fn decode_table(&self, bytes: &[u8]) -> Result<TabularSheet> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(bytes);

        let mut rows = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record.map_err(|e| {
                RegistryError::invalid_value(format!("row {}", idx + 1), e.to_string())
            })?;
            rows.push(record.iter().map(|c| c.to_string()).collect());
        }
        Ok(TabularSheet { rows })
    }

    fn content_type(&self) -> &'static str {
        "text/csv; charset=utf-8"
    }

    fn file_extension(&self) -> &'static str {
        "csv"
    }
}

// ============================================================================
// Coordinate profile
// ============================================================================

#[async_trait]
pub trait CoordinateProfile: Send + Sync {
    /// Default SRID of the territory's settings profile.
    async fn default_srid(&self, territory_id: Option<Uuid>) -> Result<i32>;
}

/// One SRID for every territory.
#[derive(Debug, Clone, Copy)]
pub struct FixedCoordinateProfile(pub i32);

#[async_trait]
impl CoordinateProfile for FixedCoordinateProfile {
    async fn default_srid(&self, _territory_id: Option<Uuid>) -> Result<i32> {
        Ok(self.0)
    }
}

// ============================================================================
// Port bundle
// ============================================================================

/// Every collaborator the services share, cloned into each of them.
#[derive(Clone)]
pub struct EnginePorts {
    pub access: Arc<dyn AccessControl>,
    pub large_files: Arc<dyn LargeFileStore>,
    pub codec: Arc<dyn TableCodec>,
    pub profile: Arc<dyn CoordinateProfile>,
}

impl EnginePorts {
    /// Claims-based access, semicolon CSV sheets and one SRID everywhere.
    /// Large files go to `file_store_dir` when set and are refused otherwise.
    pub fn standalone(default_srid: i32, file_store_dir: Option<&str>) -> Self {
        let large_files: Arc<dyn LargeFileStore> = match file_store_dir {
            Some(dir) => Arc::new(DirectoryFileStore::new(dir)),
            None => Arc::new(NoLargeFileStore),
        };
        Self {
            access: Arc::new(ClaimsAccessControl),
            large_files,
            codec: Arc::new(CsvTableCodec::default()),
            profile: Arc::new(FixedCoordinateProfile(default_srid)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(claims: &[&str]) -> Actor {
        Actor {
            user_id: Uuid::new_v4(),
            full_name: "Test User".into(),
            territory_id: Some(Uuid::new_v4()),
            claims: claims.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn claims_grant_exact_and_wildcard() {
        let access = ClaimsAccessControl;
        let a = actor(&["wells:read", "zones:*"]);
        assert!(access.can_perform(&a, "wells", RegistryAction::Read).await.unwrap());
        assert!(!access.can_perform(&a, "wells", RegistryAction::Update).await.unwrap());
        assert!(access.can_perform(&a, "zones", RegistryAction::Delete).await.unwrap());
        let admin = actor(&["*"]);
        assert!(access.can_perform(&admin, "any", RegistryAction::Create).await.unwrap());
    }

    #[test]
    fn territory_compares_record_oktmo() {
        let access = ClaimsAccessControl;
        let a = actor(&[]);
        let mut record = Record::new();
        assert!(access.is_own_territory(&a, &record));
        record.insert(TERRITORY_COLUMN, CellValue::Uuid(a.territory_id.unwrap()));
        assert!(access.is_own_territory(&a, &record));
        record.insert(TERRITORY_COLUMN, CellValue::Uuid(Uuid::new_v4()));
        assert!(!access.is_own_territory(&a, &record));
        record.insert(TERRITORY_COLUMN, CellValue::Null);
        assert!(!access.is_own_territory(&a, &record));
    }

    #[test]
    fn text_territory_is_compared_as_uuid() {
        let access = ClaimsAccessControl;
        let a = actor(&[]);
        let own = a.territory_id.unwrap().to_string().to_uppercase();
        let mut record = Record::new();
        record.insert(TERRITORY_COLUMN, CellValue::Text(format!(" {own} ")));
        assert!(access.is_own_territory(&a, &record));
        record.insert(TERRITORY_COLUMN, CellValue::Text("not-a-territory".into()));
        assert!(!access.is_own_territory(&a, &record));

        let nowhere = Actor::default();
        assert!(!access.is_own_territory(&nowhere, &record));
    }

    #[tokio::test]
    async fn capability_and_territory_errors_are_distinct() {
        let access = ClaimsAccessControl;
        let a = actor(&["wells:update"]);

        let denied = require_capability(&access, &a, "wells", "Wells", RegistryAction::Delete)
            .await
            .unwrap_err();
        assert!(matches!(
            denied,
            RegistryError::CapabilityDenied { ref resource, ref action } if resource == "Wells" && action == "delete"
        ));
        require_capability(&access, &a, "wells", "Wells", RegistryAction::Update)
            .await
            .unwrap();

        let mut foreign = Record::new();
        foreign.insert(TERRITORY_COLUMN, CellValue::Uuid(Uuid::new_v4()));
        let err = require_territory(&access, &a, &foreign, "Wells", RegistryAction::Update).unwrap_err();
        assert!(matches!(err, RegistryError::TerritorialDenied { .. }));
    }

    #[test]
    fn csv_codec_reads_semicolon_rows() {
        let codec = CsvTableCodec::default();
        let sheet = codec
            .decode_table("\u{feff}name;depth\nName;Depth\nWell-1;120\n".as_bytes())
            .unwrap();
        assert_eq!(sheet.rows.len(), 3);
        assert_eq!(sheet.rows[0], vec!["name", "depth"]);
        assert_eq!(sheet.rows[2], vec!["Well-1", "120"]);
    }

    #[test]
    fn csv_codec_renders_header_first() {
        let codec = CsvTableCodec::default();
        let bytes = codec
            .render_table(
                &["Name".to_string(), "Zone".to_string()],
                &[vec!["Well-1".into(), "Zone A".into()]],
            )
            .unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), "Name;Zone\nWell-1;Zone A\n");
    }

    #[test]
    fn csv_codec_honours_custom_delimiter() {
        let codec = CsvTableCodec::with_delimiter(b',');
        let sheet = codec.decode_table(b"name,depth\nWell-1,120\n").unwrap();
        assert_eq!(sheet.rows[1], vec!["Well-1", "120"]);
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryFileStore::default();
        let id = store.store_large_file(b"abc", "wells").await.unwrap();
        assert_eq!(store.read_file(&id).await.unwrap(), b"abc");
        assert!(store.read_file("missing").await.is_err());
    }

    #[tokio::test]
    async fn directory_store_writes_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryFileStore::new(dir.path().join("large"));
        let id = store.store_large_file(b"plan", "wells").await.unwrap();
        assert!(dir.path().join("large").join(&id).exists());
        assert_eq!(store.read_file(&id).await.unwrap(), b"plan");

        let missing = store.read_file(&Uuid::new_v4().to_string()).await;
        assert!(matches!(missing, Err(RegistryError::NotFound(_))));
    }
}
