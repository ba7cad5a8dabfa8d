//! Tabular export of registry records, import templates and rendered import
//! error logs.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::error_log::ErrorLogStore;
use crate::error::Result;
use crate::ports::{require_capability, Actor, EnginePorts, RegistryAction};
use crate::registry::crud::RegistryCrudService;
use crate::registry::descriptor::{ColumnDescriptor, RegistryDescriptor};
use crate::registry::metadata::MetadataRepository;
use crate::registry::model::ListedRow;
use crate::registry::query::ListRequest;

/// Cell text of an empty classifier reference.
pub const NOT_SPECIFIED: &str = "Not specified";

/// A rendered sheet ready to hand to a caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportFile {
    pub file_name: String,
    pub content_type: &'static str,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

fn exported_columns(descriptor: &RegistryDescriptor) -> Vec<&ColumnDescriptor> {
    descriptor
        .scalar_columns()
        .filter(|c| !c.is_primary_key && c.is_visible_in_grid)
        .collect()
}

/// Header (column titles) and cell text of listed rows.
pub fn export_table(descriptor: &RegistryDescriptor, rows: &[ListedRow]) -> (Vec<String>, Vec<Vec<String>>) {
    let columns = exported_columns(descriptor);
    let header = columns.iter().map(|c| c.title.clone()).collect();
    let body = rows
        .iter()
        .map(|row| {
            columns
                .iter()
                .map(|column| {
                    if column.is_classifier {
                        return row
                            .displays
                            .get(&column.key)
                            .cloned()
                            .flatten()
                            .filter(|d| !d.is_empty())
                            .unwrap_or_else(|| NOT_SPECIFIED.to_string());
                    }
                    row.record
                        .get(&column.key)
                        .map(|v| v.display_text())
                        .unwrap_or_default()
                })
                .collect()
        })
        .collect();
    (header, body)
}

/// Import template: a row of column keys followed by a row of titles.
pub fn template_table(descriptor: &RegistryDescriptor) -> (Vec<String>, Vec<Vec<String>>) {
    let columns: Vec<&ColumnDescriptor> = descriptor.scalar_columns().collect();
    (
        columns.iter().map(|c| c.key.clone()).collect(),
        vec![columns.iter().map(|c| c.title.clone()).collect()],
    )
}

pub struct ExportService {
    crud: Arc<RegistryCrudService>,
    metadata: Arc<MetadataRepository>,
    ports: EnginePorts,
    error_logs: Arc<ErrorLogStore>,
}

impl ExportService {
    pub fn new(
        crud: Arc<RegistryCrudService>,
        metadata: Arc<MetadataRepository>,
        ports: EnginePorts,
        error_logs: Arc<ErrorLogStore>,
    ) -> Self {
        Self {
            crud,
            metadata,
            ports,
            error_logs,
        }
    }

    fn render(&self, stem: &str, header: &[String], rows: &[Vec<String>]) -> Result<ExportFile> {
        let codec = self.ports.codec.as_ref();
        Ok(ExportFile {
            file_name: format!("{}.{}", stem, codec.file_extension()),
            content_type: codec.content_type(),
            bytes: codec.render_table(header, rows)?,
        })
    }

    /// Every record matching the request's filters, ignoring paging.
    pub async fn export(&self, actor: &Actor, registry_id: Uuid, request: &ListRequest) -> Result<ExportFile> {
        let unpaged = ListRequest {
            page: None,
            size: None,
            ..request.clone()
        };
        let page = self.crud.paginate(actor, registry_id, &unpaged).await?;
        let descriptor = self.metadata.get_registry_descriptor(registry_id).await?;
        let (header, body) = export_table(&descriptor, &page.rows);
        info!("Exporting {} rows of {}", body.len(), descriptor.name);
        self.render(&format!("export{}", Utc::now().timestamp()), &header, &body)
    }

    pub async fn template(&self, actor: &Actor, registry_id: Uuid) -> Result<ExportFile> {
        let descriptor = self.metadata.get_registry_descriptor(registry_id).await?;
        require_capability(
            self.ports.access.as_ref(),
            actor,
            &descriptor.resource_name,
            &descriptor.name,
            RegistryAction::Read,
        )
        .await?;
        let (header, body) = template_table(&descriptor);
        self.render(&descriptor.name, &header, &body)
    }

    /// The saved report of a partially failed import. A token is valid once.
    pub async fn error_log(&self, token: Uuid) -> Result<ExportFile> {
        let report = self.error_logs.take(token)?;
        self.render(&format!("errors-{token}"), &report.columns, &report.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::descriptor::tests::wells_descriptor;
    use crate::registry::value::{CellValue, Record};
    use pretty_assertions::assert_eq;
    use rust_decimal::Decimal;
    use std::collections::HashMap;

    fn row(name: &str, depth: i64, zone: Option<&str>) -> ListedRow {
        let mut record = Record::new();
        record.insert("id", CellValue::Uuid(Uuid::new_v4()));
        record.insert("name", CellValue::Text(name.into()));
        record.insert("depth", CellValue::Decimal(Decimal::from(depth)));
        let mut displays = HashMap::new();
        displays.insert("zone".to_string(), zone.map(str::to_string));
        ListedRow { record, displays }
    }

    #[test]
    fn export_skips_key_and_fills_empty_classifiers() {
        let descriptor = wells_descriptor();
        let (header, body) = export_table(&descriptor, &[row("Well-1", 120, Some("Zone A")), row("Well-2", 80, None)]);

        let titles: Vec<String> = ["name", "depth", "zone"]
            .iter()
            .map(|k| descriptor.column(k).unwrap().title.clone())
            .collect();
        assert_eq!(header, titles);
        assert_eq!(body[0], vec!["Well-1", "120", "Zone A"]);
        assert_eq!(body[1], vec!["Well-2", "80", NOT_SPECIFIED]);
    }

    #[test]
    fn template_lists_keys_then_titles() {
        let descriptor = wells_descriptor();
        let (keys, rows) = template_table(&descriptor);
        assert_eq!(keys, vec!["id", "name", "depth", "zone"]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), keys.len());
    }
}
