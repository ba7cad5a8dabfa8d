//! File attachments of registry records
//!
//! Content lives in `register.files`, metadata in `register.file_infos`. Large
//! uploads keep only a NULL content row plus the external store id; the
//! upload itself happens before the transaction that records it.

use serde::Serialize;
use sqlx::{FromRow, PgConnection, PgPool};
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;

const IMAGE_EXTENSIONS: &[&str] = &[".jpeg", ".jpg", ".png", ".bmp", ".gif"];

/// An attachment about to be persisted.
#[derive(Debug, Clone)]
pub struct NewFile {
    pub file_name: String,
    /// `None` when the bytes were handed to the external store.
    pub content: Option<Vec<u8>>,
    pub external_storage_id: Option<String>,
    pub is_default_preview: bool,
}

/// Attachment metadata as listed for a record
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct FileInfo {
    pub file_id: Uuid,
    pub name: String,
    pub file_type: String,
    pub is_default_preview: bool,
    pub external_storage_id: Option<String>,
    /// Inline content length; external files report `None`.
    pub file_size: Option<i64>,
    pub created: Option<chrono::DateTime<chrono::Utc>>,
}

impl FileInfo {
    pub fn file_name(&self) -> String {
        format!("{}{}", self.name, self.file_type)
    }

    pub fn is_image(&self) -> bool {
        is_image(&self.file_name())
    }
}

#[derive(Clone, Debug)]
pub struct FileRepository {
    pool: PgPool,
}

impl FileRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(
        conn: &mut PgConnection,
        registry_id: Uuid,
        record_id: Uuid,
        file: &NewFile,
    ) -> Result<Uuid> {
        let file_id = Uuid::new_v4();
        let (name, file_type) = split_file_name(&file.file_name);

        sqlx::query(
            r#"
            INSERT INTO register.files (id, content, is_deleted)
            VALUES ($1, $2, false)
            "#,
        )
        .bind(file_id)
        .bind(file.content.as_deref())
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO register.file_infos
                (id, name, file_type, file_id, registry_id, record_id,
                 is_default_preview, external_storage_id, is_deleted, created)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, false, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(file_type)
        .bind(file_id)
        .bind(registry_id)
        .bind(record_id)
        .bind(file.is_default_preview)
        .bind(file.external_storage_id.as_deref())
        .execute(&mut *conn)
        .await?;

        debug!("Attached file {} to record {}", file.file_name, record_id);
        Ok(file_id)
    }

    /// Attachments of a record, newest first.
    pub async fn list_for_record(&self, registry_id: Uuid, record_id: Uuid) -> Result<Vec<FileInfo>> {
        let mut conn = self.pool.acquire().await?;
        Self::list_on(&mut conn, registry_id, record_id).await
    }

    pub async fn list_on(
        conn: &mut PgConnection,
        registry_id: Uuid,
        record_id: Uuid,
    ) -> Result<Vec<FileInfo>> {
        let rows = sqlx::query_as::<_, FileInfo>(
            r#"
            SELECT fi.file_id, fi.name, COALESCE(fi.file_type, '') AS file_type,
                   COALESCE(fi.is_default_preview, false) AS is_default_preview,
                   fi.external_storage_id,
                   length(f.content)::bigint AS file_size,
                   fi.created
            FROM register.file_infos fi
            JOIN register.files f ON f.id = fi.file_id
            WHERE fi.registry_id = $1 AND fi.record_id = $2
            ORDER BY fi.created DESC
            "#,
        )
        .bind(registry_id)
        .bind(record_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(rows)
    }

    /// Metadata and inline content of one attachment of a record. Content is
    /// `None` for files held by the external store.
    pub async fn get(
        &self,
        registry_id: Uuid,
        record_id: Uuid,
        file_id: Uuid,
    ) -> Result<Option<(FileInfo, Option<Vec<u8>>)>> {
        let info = sqlx::query_as::<_, FileInfo>(
            r#"
            SELECT fi.file_id, fi.name, COALESCE(fi.file_type, '') AS file_type,
                   COALESCE(fi.is_default_preview, false) AS is_default_preview,
                   fi.external_storage_id,
                   length(f.content)::bigint AS file_size,
                   fi.created
            FROM register.file_infos fi
            JOIN register.files f ON f.id = fi.file_id
            WHERE fi.file_id = $1 AND fi.registry_id = $2 AND fi.record_id = $3
            "#,
        )
        .bind(file_id)
        .bind(registry_id)
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(info) = info else {
            return Ok(None);
        };

        let content: Option<Vec<u8>> =
            sqlx::query_scalar(r#"SELECT content FROM register.files WHERE id = $1"#)
                .bind(file_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(Some((info, content)))
    }

    /// Delete one attachment of a record. Returns false when the record has
    /// no such file.
    pub async fn delete_owned(
        conn: &mut PgConnection,
        registry_id: Uuid,
        record_id: Uuid,
        file_id: Uuid,
    ) -> Result<bool> {
        let owned: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT file_id FROM register.file_infos
            WHERE file_id = $1 AND registry_id = $2 AND record_id = $3
            "#,
        )
        .bind(file_id)
        .bind(registry_id)
        .bind(record_id)
        .fetch_optional(&mut *conn)
        .await?;

        match owned {
            Some(file_id) => Self::delete(conn, file_id).await,
            None => Ok(false),
        }
    }

    /// Delete one attachment (info and content). Returns false when absent.
    async fn delete(conn: &mut PgConnection, file_id: Uuid) -> Result<bool> {
        sqlx::query(r#"DELETE FROM register.file_infos WHERE file_id = $1"#)
            .bind(file_id)
            .execute(&mut *conn)
            .await?;

        let result = sqlx::query(r#"DELETE FROM register.files WHERE id = $1"#)
            .bind(file_id)
            .execute(&mut *conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete every attachment of a record except those listed in `keep`.
    pub async fn delete_for_record_except(
        conn: &mut PgConnection,
        registry_id: Uuid,
        record_id: Uuid,
        keep: &[Uuid],
    ) -> Result<u64> {
        let doomed: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT file_id FROM register.file_infos
            WHERE registry_id = $1 AND record_id = $2 AND NOT (file_id = ANY($3))
            "#,
        )
        .bind(registry_id)
        .bind(record_id)
        .bind(keep)
        .fetch_all(&mut *conn)
        .await?;

        for file_id in &doomed {
            Self::delete(conn, *file_id).await?;
        }
        Ok(doomed.len() as u64)
    }
}

/// Split `"plan.final.pdf"` into `("plan.final", ".pdf")`.
pub fn split_file_name(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(0) | None => (file_name, ""),
        Some(idx) => file_name.split_at(idx),
    }
}

pub fn is_image(file_name: &str) -> bool {
    let (_, ext) = split_file_name(file_name);
    IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str())
}

/// Index of the upload that becomes the default preview: the first image,
/// and only when the record had no attachments before.
pub fn pick_default_preview<'a>(
    existing_count: usize,
    new_file_names: impl IntoIterator<Item = &'a str>,
) -> Option<usize> {
    if existing_count > 0 {
        return None;
    }
    new_file_names.into_iter().position(is_image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_extension() {
        assert_eq!(split_file_name("plan.final.pdf"), ("plan.final", ".pdf"));
        assert_eq!(split_file_name("README"), ("README", ""));
        assert_eq!(split_file_name(".env"), (".env", ""));
    }

    #[test]
    fn detects_images_case_insensitively() {
        assert!(is_image("photo.JPG"));
        assert!(is_image("map.png"));
        assert!(!is_image("contour.csv"));
    }

    #[test]
    fn default_preview_only_for_first_upload() {
        let names = ["contour.csv", "front.jpg", "back.png"];
        assert_eq!(pick_default_preview(0, names), Some(1));
        assert_eq!(pick_default_preview(2, names), None);
        assert_eq!(pick_default_preview(0, ["a.txt"]), None);
    }
}
