//! Registry engine integration tests
//!
//! Run against a database that carries the registry configuration tables
//! (`public.spatial_data_registry*`, `public.resource*`, `public.system_log_record`,
//! `public.file`, `register.turning_points`):
//!
//! ```bash
//! TEST_DATABASE_URL=postgresql://localhost/gis cargo test --test registry_integration -- --ignored
//! ```

use anyhow::Result;
use gis_registry::config::EngineConfig;
use gis_registry::engine::RegistryEngine;
use gis_registry::error::RegistryError;
use gis_registry::ports::{Actor, EnginePorts};
use gis_registry::registry::admin::{FieldConfig, RegistryConfig};
use gis_registry::registry::crud::{ItemPayload, UploadedFile};
use gis_registry::registry::introspect::SchemaCatalog;
use gis_registry::registry::query::ListRequest;
use gis_registry::registry::value::{CellValue, DataType};
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

// =========================================================================
// TEST INFRASTRUCTURE
// =========================================================================

struct TestDb {
    pool: PgPool,
    engine: RegistryEngine,
    table: String,
}

impl TestDb {
    async fn new() -> Result<Self> {
        let url = std::env::var("TEST_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .unwrap_or_else(|_| "postgresql:///gis".into());

        let pool = PgPool::connect(&url).await?;
        let table = format!("itest_wells_{}", &Uuid::new_v4().simple().to_string()[..8]);
        sqlx::query(&format!(
            r#"CREATE TABLE register."{table}" (
                id uuid PRIMARY KEY DEFAULT gen_random_uuid(),
                name text,
                depth numeric NOT NULL,
                category smallint,
                rate real,
                oktmo_id uuid,
                author_id uuid,
                datecreated timestamp,
                editor_id uuid,
                dateedited timestamp
            )"#
        ))
        .execute(&pool)
        .await?;

        let config = EngineConfig::default();
        let ports = EnginePorts::standalone(config.default_srid, None);
        let engine = RegistryEngine::new(pool.clone(), &config, ports);
        Ok(Self { pool, engine, table })
    }

    fn admin() -> Actor {
        Actor {
            user_id: Uuid::new_v4(),
            full_name: "Integration Test".into(),
            claims: vec!["*".into()],
            ..Default::default()
        }
    }

    fn wells_config(&self) -> RegistryConfig {
        let field = |column: &str, data_type: &str, index: i32| FieldConfig {
            column: column.into(),
            data_type: data_type.into(),
            index,
            is_auto_generated_column: true,
            ..Default::default()
        };
        RegistryConfig {
            name: format!("Wells {}", self.table),
            table_name: self.table.clone(),
            name_field: Some("name".into()),
            allow_imported_geometry_edit: true,
            fields: vec![
                FieldConfig {
                    is_primary_key: true,
                    ..field("id", "uuid", 0)
                },
                field("name", "text", 1),
                FieldConfig {
                    not_null: true,
                    min_value: Some(0.0),
                    ..field("depth", "numeric", 2)
                },
                field("author_id", "uuid", 3),
                field("datecreated", "timestamp without time zone", 4),
                field("category", "smallint", 5),
                field("rate", "real", 6),
                field("oktmo_id", "uuid", 7),
            ],
            ..Default::default()
        }
    }

    /// Zones classifier plus the wells-to-zones join table, registered as
    /// a many-to-many field of `registry_id`. Returns the field id.
    async fn add_zones(&self, registry_id: Uuid) -> Result<Uuid> {
        let table = &self.table;
        sqlx::query(&format!(
            r#"CREATE TABLE register."{table}_zones" (id uuid PRIMARY KEY, name text)"#
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!(
            r#"CREATE TABLE register."{table}_zone_links" (
                well_id uuid NOT NULL,
                zone_id uuid NOT NULL REFERENCES register."{table}_zones" (id)
            )"#
        ))
        .execute(&self.pool)
        .await?;

        let field_id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO public.spatial_data_registry_collection_field
                (id, spatial_data_registry_id, "index", alias, foreign_table,
                 foreign_table_key_column, foreign_table_second_key_column,
                 many_to_many_table, many_to_many_column, many_to_many_display_column,
                 not_null)
            VALUES ($1, $2, 10, 'Zones', $3, 'well_id', 'zone_id', $4, 'id', 'name', false)
            "#,
        )
        .bind(field_id)
        .bind(registry_id)
        .bind(format!("register.{table}_zone_links"))
        .bind(format!("register.{table}_zones"))
        .execute(&self.pool)
        .await?;
        self.engine.metadata.invalidate();
        Ok(field_id)
    }

    async fn add_zone(&self, name: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(&format!(r#"INSERT INTO register."{}_zones" (id, name) VALUES ($1, $2)"#, self.table))
            .bind(id)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    async fn linked_zones(&self) -> Result<Vec<Uuid>> {
        Ok(sqlx::query_scalar(&format!(
            r#"SELECT zone_id FROM register."{}_zone_links" ORDER BY zone_id"#,
            self.table
        ))
        .fetch_all(&self.pool)
        .await?)
    }

    async fn row_count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar(&format!(r#"SELECT COUNT(*) FROM register."{}""#, self.table))
            .fetch_one(&self.pool)
            .await?)
    }

    async fn cleanup(&self, registry_id: Option<Uuid>) -> Result<()> {
        if let Some(id) = registry_id {
            sqlx::query("DELETE FROM public.spatial_data_registry_collection_field WHERE spatial_data_registry_id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .ok();
            self.engine.admin.delete_registry(&Self::admin(), id).await.ok();
        }
        for suffix in ["_zone_links", "_zones", ""] {
            sqlx::query(&format!(r#"DROP TABLE IF EXISTS register."{}{}" CASCADE"#, self.table, suffix))
                .execute(&self.pool)
                .await
                .ok();
        }
        Ok(())
    }
}

fn payload(values: serde_json::Value) -> ItemPayload {
    serde_json::from_value(json!({ "values": values })).unwrap()
}

// =========================================================================
// TESTS
// =========================================================================

#[tokio::test]
#[ignore] // Requires database
async fn record_lifecycle_through_a_configured_registry() -> Result<()> {
    let db = TestDb::new().await?;
    let actor = TestDb::admin();
    let created = db.engine.admin.create_registry(&actor, &db.wells_config()).await?;

    let all = db.engine.metadata.get_all_registries_descriptors().await?;
    assert_eq!(all.get(&created.id).map(|d| d.name.clone()), Some(db.wells_config().name));
    let readable = db.engine.crud.readable_registries(&actor).await?;
    assert!(readable.iter().any(|d| d.id == created.id));

    let saved = db
        .engine
        .crud
        .create_item(&actor, created.id, &payload(json!({"name": "Well-1", "depth": "120"})), &[], None)
        .await?;
    let record_id = saved.id.display_text();
    assert!(saved.record.get("datecreated").is_some());

    let page = db
        .engine
        .crud
        .paginate(&actor, created.id, &ListRequest { all_records: true, ..Default::default() })
        .await?;
    assert_eq!(page.count, 1);

    let edited = db
        .engine
        .crud
        .edit_item(&actor, created.id, &record_id, &payload(json!({"name": "Well-1b"})), &[], None)
        .await?;
    assert_eq!(edited.record.get("name"), Some(&CellValue::Text("Well-1b".into())));

    let view = db.engine.crud.get_item(&actor, created.id, &record_id).await?;
    assert_eq!(view.record.get("name"), Some(&CellValue::Text("Well-1b".into())));

    db.engine.crud.delete_item(&actor, created.id, &record_id).await?;
    let missing = db.engine.crud.get_item(&actor, created.id, &record_id).await;
    assert!(matches!(missing, Err(RegistryError::NotFound(_))));

    db.cleanup(Some(created.id)).await
}

#[tokio::test]
#[ignore] // Requires database
async fn validation_failures_do_not_write() -> Result<()> {
    let db = TestDb::new().await?;
    let actor = TestDb::admin();
    let created = db.engine.admin.create_registry(&actor, &db.wells_config()).await?;

    let result = db
        .engine
        .crud
        .create_item(&actor, created.id, &payload(json!({"name": "Dry", "depth": "-5"})), &[], None)
        .await;
    assert!(matches!(result, Err(RegistryError::Validation(_))));

    let page = db
        .engine
        .crud
        .paginate(&actor, created.id, &ListRequest { all_records: true, ..Default::default() })
        .await?;
    assert_eq!(page.count, 0);

    db.cleanup(Some(created.id)).await
}

#[tokio::test]
#[ignore] // Requires database
async fn import_keeps_good_rows_and_saves_an_error_log() -> Result<()> {
    let db = TestDb::new().await?;
    let actor = TestDb::admin();
    let created = db.engine.admin.create_registry(&actor, &db.wells_config()).await?;

    let sheet = "name;depth\nWell-1;120\nWell-2;abc\n";
    let report = db.engine.import.import(&actor, created.id, sheet.as_bytes()).await?;
    assert_eq!(report.completed, 1);
    assert_eq!(report.incompleted, 1);

    let log = db.engine.export.error_log(report.log_id.unwrap()).await?;
    let text = String::from_utf8(log.bytes)?;
    assert!(text.contains("Well-2"));
    assert!(text.contains("cannot parse numeric value"));

    let exported = db
        .engine
        .export
        .export(&actor, created.id, &ListRequest { all_records: true, size: Some(1), ..Default::default() })
        .await?;
    let text = String::from_utf8(exported.bytes)?;
    assert!(text.contains("Well-1"));

    db.cleanup(Some(created.id)).await
}

#[tokio::test]
#[ignore] // Requires database
async fn missing_capability_is_denied() -> Result<()> {
    let db = TestDb::new().await?;
    let created = db.engine.admin.create_registry(&TestDb::admin(), &db.wells_config()).await?;

    let reader = Actor {
        full_name: "No Claims".into(),
        ..Default::default()
    };
    let result = db
        .engine
        .crud
        .paginate(&reader, created.id, &ListRequest::default())
        .await;
    assert!(matches!(result, Err(RegistryError::CapabilityDenied { .. })));

    db.cleanup(Some(created.id)).await
}

#[tokio::test]
#[ignore] // Requires database
async fn narrow_numeric_columns_round_trip() -> Result<()> {
    let db = TestDb::new().await?;
    let row = sqlx::query("SELECT 3::smallint AS s, 1.5::real AS r, NULL::smallint AS n")
        .fetch_one(&db.pool)
        .await?;
    let smallint = DataType::from_catalog("smallint").unwrap();
    let real = DataType::from_catalog("real").unwrap();
    assert_eq!(CellValue::decode(&row, "s", smallint)?, CellValue::Int(3));
    assert_eq!(CellValue::decode(&row, "r", real)?, CellValue::Float(1.5));
    assert_eq!(CellValue::decode(&row, "n", smallint)?, CellValue::Null);

    let actor = TestDb::admin();
    let created = db.engine.admin.create_registry(&actor, &db.wells_config()).await?;
    let saved = db
        .engine
        .crud
        .create_item(
            &actor,
            created.id,
            &payload(json!({"name": "Well-1", "depth": "120", "category": "2", "rate": "0.5"})),
            &[],
            None,
        )
        .await?;
    let view = db.engine.crud.get_item(&actor, created.id, &saved.id.display_text()).await?;
    assert_eq!(view.record.get("category"), Some(&CellValue::Int(2)));
    assert_eq!(view.record.get("rate"), Some(&CellValue::Float(0.5)));

    db.cleanup(Some(created.id)).await
}

#[tokio::test]
#[ignore] // Requires database
async fn catalog_describes_the_registry_table() -> Result<()> {
    let db = TestDb::new().await?;
    let columns = db.engine.metadata.introspector().describe_table("register", &db.table).await?;

    let id = columns.iter().find(|c| c.name == "id").unwrap();
    assert!(id.is_primary_key);
    let category = columns.iter().find(|c| c.name == "category").unwrap();
    assert_eq!(category.data_type, Some(DataType::Integer));
    assert!(category.nullable);

    let missing = db.engine.metadata.introspector().describe_table("register", "no_such_table").await?;
    assert!(missing.is_empty());

    db.cleanup(None).await
}

#[tokio::test]
#[ignore] // Requires database
async fn many_to_many_links_follow_the_payload() -> Result<()> {
    let db = TestDb::new().await?;
    let actor = TestDb::admin();
    let created = db.engine.admin.create_registry(&actor, &db.wells_config()).await?;
    let zones = db.add_zones(created.id).await?.to_string();
    let (a, b, c) = (db.add_zone("A").await?, db.add_zone("B").await?, db.add_zone("C").await?);

    let saved = db
        .engine
        .crud
        .create_item(
            &actor,
            created.id,
            &payload(json!({"name": "Well-1", "depth": "10", zones.as_str(): [a, b]})),
            &[],
            None,
        )
        .await?;
    let record_id = saved.id.display_text();
    let view = db.engine.crud.get_item(&actor, created.id, &record_id).await?;
    assert_eq!(view.many_to_many.get(&zones).map(Vec::len), Some(2));

    db.engine
        .crud
        .edit_item(&actor, created.id, &record_id, &payload(json!({zones.as_str(): [b, c]})), &[], None)
        .await?;
    let mut expected = vec![b, c];
    expected.sort();
    assert_eq!(db.linked_zones().await?, expected);

    db.engine.crud.delete_item(&actor, created.id, &record_id).await?;
    assert!(db.linked_zones().await?.is_empty());

    db.cleanup(Some(created.id)).await
}

#[tokio::test]
#[ignore] // Requires database
async fn failed_commit_leaves_no_record_links_or_files() -> Result<()> {
    let db = TestDb::new().await?;
    let actor = TestDb::admin();
    let created = db.engine.admin.create_registry(&actor, &db.wells_config()).await?;
    let zones = db.add_zones(created.id).await?.to_string();
    let zone = db.add_zone("A").await?;

    let table = &db.table;
    sqlx::query(&format!(
        r#"CREATE FUNCTION register."{table}_reject"() RETURNS trigger LANGUAGE plpgsql AS
           $$ BEGIN RAISE EXCEPTION 'rejected at commit'; END $$"#
    ))
    .execute(&db.pool)
    .await?;
    sqlx::query(&format!(
        r#"CREATE CONSTRAINT TRIGGER reject_at_commit AFTER INSERT ON register."{table}"
           DEFERRABLE INITIALLY DEFERRED FOR EACH ROW
           EXECUTE FUNCTION register."{table}_reject"()"#
    ))
    .execute(&db.pool)
    .await?;

    let upload = UploadedFile {
        file_name: "passport.pdf".into(),
        content: b"%PDF-1.4".to_vec(),
    };
    let result = db
        .engine
        .crud
        .create_item(
            &actor,
            created.id,
            &payload(json!({"name": "Well-1", "depth": "10", zones.as_str(): [zone]})),
            &[upload],
            None,
        )
        .await;
    assert!(matches!(result, Err(RegistryError::Persistence(_))));

    assert_eq!(db.row_count().await?, 0);
    assert!(db.linked_zones().await?.is_empty());
    let files: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM register.file_infos WHERE registry_id = $1")
        .bind(created.id)
        .fetch_one(&db.pool)
        .await?;
    assert_eq!(files, 0);

    db.cleanup(Some(created.id)).await?;
    sqlx::query(&format!(r#"DROP FUNCTION IF EXISTS register."{table}_reject"()"#))
        .execute(&db.pool)
        .await
        .ok();
    Ok(())
}

#[tokio::test]
#[ignore] // Requires database
async fn records_of_another_territory_are_out_of_reach() -> Result<()> {
    let db = TestDb::new().await?;
    let admin = TestDb::admin();
    let created = db.engine.admin.create_registry(&admin, &db.wells_config()).await?;
    let foreign_territory = Uuid::new_v4();

    let upload = UploadedFile {
        file_name: "photo.jpg".into(),
        content: vec![0xff, 0xd8, 0xff],
    };
    let saved = db
        .engine
        .crud
        .create_item(
            &admin,
            created.id,
            &payload(json!({"name": "Well-1", "depth": "10", "oktmo_id": foreign_territory})),
            &[upload],
            None,
        )
        .await?;
    let record_id = saved.id.display_text();
    let file_id = db.engine.crud.list_files(&admin, created.id, &record_id).await?[0].file_id;

    let outsider = Actor {
        user_id: Uuid::new_v4(),
        full_name: "Other District".into(),
        territory_id: Some(Uuid::new_v4()),
        claims: vec!["*".into()],
        ..Default::default()
    };
    let territorial = |r: std::result::Result<(), RegistryError>| {
        matches!(r, Err(RegistryError::TerritorialDenied { .. }))
    };

    let edit = db
        .engine
        .crud
        .edit_item(&outsider, created.id, &record_id, &payload(json!({"name": "Taken"})), &[], None)
        .await
        .map(|_| ());
    assert!(territorial(edit));
    let delete = db.engine.crud.delete_item(&outsider, created.id, &record_id).await.map(|_| ());
    assert!(territorial(delete));
    let read = db
        .engine
        .crud
        .read_file(&outsider, created.id, &record_id, file_id)
        .await
        .map(|_| ());
    assert!(territorial(read));
    let geometry = db
        .engine
        .geometry
        .delete_geometry(&outsider, created.id, &record_id, None)
        .await
        .map(|_| ());
    assert!(territorial(geometry));

    let view = db.engine.crud.get_item(&admin, created.id, &record_id).await?;
    assert_eq!(view.record.get("name"), Some(&CellValue::Text("Well-1".into())));
    assert_eq!(db.row_count().await?, 1);

    db.cleanup(Some(created.id)).await
}

#[tokio::test]
#[ignore] // Requires database
async fn attachments_are_reached_only_through_their_record() -> Result<()> {
    let db = TestDb::new().await?;
    let actor = TestDb::admin();
    let created = db.engine.admin.create_registry(&actor, &db.wells_config()).await?;

    let upload = UploadedFile {
        file_name: "passport.pdf".into(),
        content: b"%PDF-1.4".to_vec(),
    };
    let owner = db
        .engine
        .crud
        .create_item(&actor, created.id, &payload(json!({"name": "Well-1", "depth": "10"})), &[upload], None)
        .await?
        .id
        .display_text();
    let other = db
        .engine
        .crud
        .create_item(&actor, created.id, &payload(json!({"name": "Well-2", "depth": "20"})), &[], None)
        .await?
        .id
        .display_text();
    let file_id = db.engine.crud.list_files(&actor, created.id, &owner).await?[0].file_id;

    let (_, bytes) = db.engine.crud.read_file(&actor, created.id, &owner, file_id).await?;
    assert_eq!(bytes, b"%PDF-1.4".to_vec());

    let read = db.engine.crud.read_file(&actor, created.id, &other, file_id).await;
    assert!(matches!(read, Err(RegistryError::NotFound(_))));
    let delete = db.engine.crud.delete_file(&actor, created.id, &other, file_id).await;
    assert!(matches!(delete, Err(RegistryError::NotFound(_))));

    db.engine.crud.delete_file(&actor, created.id, &owner, file_id).await?;
    assert!(db.engine.crud.list_files(&actor, created.id, &owner).await?.is_empty());

    db.cleanup(Some(created.id)).await
}
