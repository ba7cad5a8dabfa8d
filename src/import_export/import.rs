//! Bulk import of registry records from a tabular sheet.
//!
//! The first sheet row holds column keys. A second row repeating the column
//! titles (as written by the template) is skipped. The whole sheet is
//! validated before anything is written: a row with no recognizable column
//! aborts the batch, other failures reject only their row. Accepted rows are
//! inserted one transaction each.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::PgPool;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error_log::{ErrorLogStore, ErrorReport};
use crate::database::{AuditAction, AuditLogService};
use crate::error::{RegistryError, Result};
use crate::ports::{require_capability, Actor, EnginePorts, RegistryAction, TabularSheet};
use crate::registry::crud::{stamp_system_attributes, WriteMode};
use crate::registry::descriptor::{ColumnDescriptor, RegistryDescriptor};
use crate::registry::metadata::MetadataRepository;
use crate::registry::model::{HandleRegistry, ModelBuilder, ModelHandle};
use crate::registry::query::NativeQuerySpec;
use crate::registry::value::{CellValue, Record};

/// Extra column of the error report.
pub const ERRORS_COLUMN: &str = "__errors";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub completed: usize,
    pub incompleted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_id: Option<Uuid>,
}

// ============================================================================
// Classifier resolution
// ============================================================================

/// Classifier rows per column key as `(key, display)` pairs.
#[derive(Debug, Default)]
pub struct ClassifierLookup {
    entries: HashMap<String, Vec<(CellValue, CellValue)>>,
}

impl ClassifierLookup {
    pub fn insert(&mut self, column_key: impl Into<String>, rows: Vec<(CellValue, CellValue)>) {
        self.entries.insert(column_key.into(), rows);
    }

    /// Key of the classifier row whose display value is `cell`. Numeric
    /// display values are compared as numbers, everything else as exact
    /// text.
    pub fn resolve(&self, column_key: &str, cell: &str) -> std::result::Result<Option<CellValue>, String> {
        let Some(rows) = self.entries.get(column_key) else {
            return Ok(None);
        };
        let mut wanted_number = None;
        for (key, display) in rows {
            let found = match numeric(display) {
                Some(n) => {
                    let wanted = match wanted_number {
                        Some(w) => w,
                        None => {
                            let parsed = cell
                                .trim()
                                .replace(',', ".")
                                .parse::<f64>()
                                .map_err(|_| format!("cannot parse numeric value from '{cell}'"))?;
                            *wanted_number.insert(parsed)
                        }
                    };
                    n == wanted
                }
                None => display.as_key_string().as_deref() == Some(cell),
            };
            if found {
                return Ok(Some(key.clone()));
            }
        }
        Ok(None)
    }
}

fn numeric(value: &CellValue) -> Option<f64> {
    use rust_decimal::prelude::ToPrimitive;
    match value {
        CellValue::Int(i) => Some(*i as f64),
        CellValue::Float(f) => Some(*f),
        CellValue::Decimal(d) => d.to_f64(),
        _ => None,
    }
}

// ============================================================================
// Row validation
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum RowOutcome {
    Ready {
        line: usize,
        cells: Vec<String>,
        record: Record,
    },
    Rejected {
        line: usize,
        cells: Vec<String>,
        errors: Vec<String>,
    },
}

fn importable(column: &ColumnDescriptor) -> bool {
    column.is_scalar() && !column.is_primary_key && !column.is_system_attribute
}

/// The optional second row repeating column titles.
fn is_title_row(descriptor: &RegistryDescriptor, header: &[String], row: &[String]) -> bool {
    let mut any = false;
    for (key, cell) in header.iter().zip(row) {
        let cell = cell.trim();
        if cell.is_empty() {
            continue;
        }
        any = true;
        let title = descriptor.column(key).map(|c| c.title.as_str());
        if title != Some(cell) && key != cell {
            return false;
        }
    }
    any
}

/// Validate every data row of `sheet`. Fails with
/// [`RegistryError::StructuralImport`] when a non-blank row has no
/// recognizable column.
pub fn validate_sheet(
    descriptor: &RegistryDescriptor,
    sheet: &TabularSheet,
    classifiers: &ClassifierLookup,
) -> Result<Vec<RowOutcome>> {
    let Some(header) = sheet.rows.first() else {
        return Ok(Vec::new());
    };
    let header: Vec<String> = header.iter().map(|h| h.trim().to_string()).collect();
    let start = match sheet.rows.get(1) {
        Some(row) if is_title_row(descriptor, &header, row) => 2,
        _ => 1,
    };

    let mut outcomes = Vec::new();
    for (idx, row) in sheet.rows.iter().enumerate().skip(start) {
        if row.iter().all(|c| c.trim().is_empty()) {
            continue;
        }
        let line = idx + 1;
        let cell_of = |key: &str| -> Option<&str> {
            header
                .iter()
                .position(|h| h == key)
                .and_then(|i| row.get(i))
                .map(String::as_str)
                .filter(|c| !c.trim().is_empty())
        };

        let mut errors = Vec::new();
        for column in descriptor.columns.iter().filter(|c| importable(c) && c.not_null) {
            if cell_of(&column.key).is_none() {
                errors.push(format!("column {}: value is required", column.key));
            }
        }

        let mut record = Record::new();
        let mut recognized = 0;
        for (i, key) in header.iter().enumerate() {
            let Some(column) = descriptor.column(key).filter(|c| importable(c)) else {
                continue;
            };
            let Some(cell) = row.get(i).filter(|c| !c.trim().is_empty()) else {
                continue;
            };
            recognized += 1;

            if column.is_classifier {
                match classifiers.resolve(&column.key, cell) {
                    Ok(Some(value)) => record.insert(column.key.clone(), value),
                    Ok(None) => errors.push(format!(
                        "column {}: value '{}' not found in classifier",
                        column.key, cell
                    )),
                    Err(msg) => errors.push(format!("column {}: {}", column.key, msg)),
                }
                continue;
            }
            match CellValue::parse_text(cell, column.data_type) {
                Ok(value) => record.insert(column.key.clone(), value),
                Err(msg) => errors.push(format!("column {}: {}", column.key, msg)),
            }
        }

        if recognized == 0 {
            return Err(RegistryError::StructuralImport { row: line });
        }
        outcomes.push(if errors.is_empty() {
            RowOutcome::Ready {
                line,
                cells: row.clone(),
                record,
            }
        } else {
            RowOutcome::Rejected {
                line,
                cells: row.clone(),
                errors,
            }
        });
    }
    Ok(outcomes)
}

fn error_row(header_len: usize, cells: &[String], errors: &[String]) -> Vec<String> {
    let mut row: Vec<String> = (0..header_len)
        .map(|i| cells.get(i).cloned().unwrap_or_default())
        .collect();
    row.push(errors.join(", "));
    row
}

// ============================================================================
// Service
// ============================================================================

pub struct ImportService {
    pool: PgPool,
    metadata: Arc<MetadataRepository>,
    handles: Arc<HandleRegistry>,
    ports: EnginePorts,
    error_logs: Arc<ErrorLogStore>,
}

impl ImportService {
    pub fn new(
        pool: PgPool,
        metadata: Arc<MetadataRepository>,
        handles: Arc<HandleRegistry>,
        ports: EnginePorts,
        error_logs: Arc<ErrorLogStore>,
    ) -> Self {
        Self {
            pool,
            metadata,
            handles,
            ports,
            error_logs,
        }
    }

    /// Full scans of the classifier tables referenced by the sheet header,
    /// one scan per table.
    async fn load_classifiers(&self, descriptor: &RegistryDescriptor, header: &[String]) -> Result<ClassifierLookup> {
        let builder = ModelBuilder::new(self.metadata.introspector(), &self.handles);
        let mut scans: HashMap<String, Vec<Record>> = HashMap::new();
        let mut lookup = ClassifierLookup::default();
        let mut conn = self.pool.acquire().await?;

        for column in descriptor.classifier_columns().filter(|c| header.contains(&c.key)) {
            let Some(cls) = &column.classifier else {
                continue;
            };
            let Some(display_column) = &cls.display_column else {
                lookup.insert(column.key.clone(), Vec::new());
                continue;
            };
            let table = cls.qualified_table();
            if !scans.contains_key(&table) {
                let handle = builder.table(&cls.schema, &cls.table).await?;
                let rows = handle.list(&mut conn, &NativeQuerySpec::default()).await?;
                debug!("Loaded {} classifier rows from {}", rows.len(), table);
                scans.insert(table.clone(), rows.into_iter().map(|r| r.record).collect());
            }
            let pairs = scans
                .get(&table)
                .map(|records| {
                    records
                        .iter()
                        .filter_map(|r| Some((r.get(&cls.key_column)?.clone(), r.get(display_column)?.clone())))
                        .collect()
                })
                .unwrap_or_default();
            lookup.insert(column.key.clone(), pairs);
        }
        Ok(lookup)
    }

    async fn insert_row(&self, actor: &Actor, descriptor: &RegistryDescriptor, handle: &ModelHandle, record: &Record) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let inserted = handle.insert(&mut tx, record).await?;
        let key = inserted
            .get(&handle.primary_key()?.name)
            .map(CellValue::display_text)
            .unwrap_or_default();
        AuditLogService::record(
            &mut tx,
            AuditAction::AutomatedImportCreateObject,
            &actor.full_name,
            &descriptor.name,
            &format!("record {key}"),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn import(&self, actor: &Actor, registry_id: Uuid, bytes: &[u8]) -> Result<ImportReport> {
        let descriptor = self.metadata.get_registry_descriptor(registry_id).await?;
        require_capability(
            self.ports.access.as_ref(),
            actor,
            &descriptor.resource_name,
            &descriptor.name,
            RegistryAction::Create,
        )
        .await?;

        let sheet = self.ports.codec.decode_table(bytes)?;
        let header: Vec<String> = sheet
            .rows
            .first()
            .map(|h| h.iter().map(|c| c.trim().to_string()).collect())
            .unwrap_or_default();
        let classifiers = self.load_classifiers(&descriptor, &header).await?;
        let outcomes = validate_sheet(&descriptor, &sheet, &classifiers)?;
        let handle = ModelBuilder::new(self.metadata.introspector(), &self.handles)
            .build(&descriptor, false)
            .await?;

        let mut report = ErrorReport {
            columns: header.iter().cloned().chain([ERRORS_COLUMN.to_string()]).collect(),
            rows: vec![header
                .iter()
                .map(|k| descriptor.column(k).map(|c| c.title.clone()).unwrap_or_else(|| k.clone()))
                .chain([ERRORS_COLUMN.to_string()])
                .collect()],
        };
        let mut completed = 0;
        let mut incompleted = 0;

        for outcome in outcomes {
            match outcome {
                RowOutcome::Ready {
                    line,
                    cells,
                    mut record,
                } => {
                    stamp_system_attributes(&descriptor, &mut record, actor, WriteMode::Create);
                    match self.insert_row(actor, &descriptor, &handle, &record).await {
                        Ok(()) => completed += 1,
                        Err(e) => {
                            warn!("Import row {} of {} failed: {}", line, descriptor.name, e);
                            report.rows.push(error_row(
                                header.len(),
                                &cells,
                                &["failed to save to database".to_string()],
                            ));
                            incompleted += 1;
                        }
                    }
                }
                RowOutcome::Rejected { cells, errors, .. } => {
                    report.rows.push(error_row(header.len(), &cells, &errors));
                    incompleted += 1;
                }
            }
        }

        let summary = if incompleted == 0 {
            format!("Imported {completed} records")
        } else {
            format!("Imported {completed} records, {incompleted} not imported; see the saved log")
        };
        let mut tx = self.pool.begin().await?;
        AuditLogService::record(&mut tx, AuditAction::AutomatedImport, &actor.full_name, &descriptor.name, &summary)
            .await?;
        tx.commit().await?;

        let log_id = if incompleted > 0 {
            Some(self.error_logs.put(report)?)
        } else {
            None
        };
        info!("Import into {}: {}", descriptor.name, summary);
        Ok(ImportReport {
            completed,
            incompleted,
            log_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::descriptor::tests::wells_descriptor;
    use pretty_assertions::assert_eq;

    fn sheet(rows: &[&[&str]]) -> TabularSheet {
        TabularSheet {
            rows: rows
                .iter()
                .map(|r| r.iter().map(|c| c.to_string()).collect())
                .collect(),
        }
    }

    fn zones(zone_a: Uuid) -> ClassifierLookup {
        let mut lookup = ClassifierLookup::default();
        lookup.insert(
            "zone",
            vec![
                (CellValue::Uuid(zone_a), CellValue::Text("Zone A".into())),
                (CellValue::Uuid(Uuid::new_v4()), CellValue::Text("Zone B".into())),
            ],
        );
        lookup
    }

    #[test]
    fn wells_batch_keeps_valid_rows_and_rejects_bad_depth() {
        let descriptor = wells_descriptor();
        let zone_a = Uuid::new_v4();
        let outcomes = validate_sheet(
            &descriptor,
            &sheet(&[
                &["name", "depth", "zone"],
                &["Well-1", "120", "Zone A"],
                &["Well-2", "abc", "Zone A"],
            ]),
            &zones(zone_a),
        )
        .unwrap();

        assert_eq!(outcomes.len(), 2);
        let RowOutcome::Ready { record, line, .. } = &outcomes[0] else {
            panic!("first row should be accepted");
        };
        assert_eq!(*line, 2);
        assert_eq!(record.get("zone"), Some(&CellValue::Uuid(zone_a)));
        assert_eq!(record.get("name"), Some(&CellValue::Text("Well-1".into())));

        let RowOutcome::Rejected { errors, .. } = &outcomes[1] else {
            panic!("second row should be rejected");
        };
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("column depth: cannot parse numeric value"));
    }

    #[test]
    fn missing_required_value_rejects_the_row() {
        let descriptor = wells_descriptor();
        let outcomes = validate_sheet(
            &descriptor,
            &sheet(&[&["name", "depth"], &["Well-3", ""]]),
            &ClassifierLookup::default(),
        )
        .unwrap();
        let RowOutcome::Rejected { errors, .. } = &outcomes[0] else {
            panic!("row should be rejected");
        };
        assert_eq!(errors, &vec!["column depth: value is required".to_string()]);
    }

    #[test]
    fn row_without_known_columns_aborts_the_batch() {
        let descriptor = wells_descriptor();
        let result = validate_sheet(
            &descriptor,
            &sheet(&[
                &["name", "depth", "colour"],
                &["Well-1", "120", ""],
                &["", "", "red"],
            ]),
            &ClassifierLookup::default(),
        );
        assert!(matches!(result, Err(RegistryError::StructuralImport { row: 3 })));
    }

    #[test]
    fn unknown_classifier_value_is_a_row_error() {
        let descriptor = wells_descriptor();
        let outcomes = validate_sheet(
            &descriptor,
            &sheet(&[&["name", "depth", "zone"], &["Well-4", "10", "Zone Z"]]),
            &zones(Uuid::new_v4()),
        )
        .unwrap();
        let RowOutcome::Rejected { errors, .. } = &outcomes[0] else {
            panic!("row should be rejected");
        };
        assert!(errors[0].contains("'Zone Z' not found in classifier"));
    }

    #[test]
    fn template_title_row_is_skipped() {
        let descriptor = wells_descriptor();
        let titles: Vec<String> = ["name", "depth"]
            .iter()
            .map(|k| descriptor.column(k).unwrap().title.clone())
            .collect();
        let outcomes = validate_sheet(
            &descriptor,
            &sheet(&[&["name", "depth"], &[&titles[0], &titles[1]], &["Well-5", "7"]]),
            &ClassifierLookup::default(),
        )
        .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], RowOutcome::Ready { line: 3, .. }));
    }

    #[test]
    fn numeric_classifier_display_matches_by_number() {
        let mut lookup = ClassifierLookup::default();
        let key = CellValue::Int(4);
        lookup.insert("class", vec![(key.clone(), CellValue::Int(12))]);
        assert_eq!(lookup.resolve("class", " 12.0 ").unwrap(), Some(key));
        assert_eq!(lookup.resolve("class", "13").unwrap(), None);
        assert!(lookup.resolve("class", "twelve").is_err());
    }

    #[test]
    fn error_rows_are_padded_to_the_header() {
        assert_eq!(
            error_row(3, &["a".to_string()], &["x".to_string(), "y".to_string()]),
            vec!["a".to_string(), String::new(), String::new(), "x, y".to_string()]
        );
    }
}
