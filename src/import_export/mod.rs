//! Spreadsheet import and export of registry records.

pub mod error_log;
pub mod export;
pub mod import;

pub use error_log::{ErrorLogStore, ErrorReport};
pub use export::{ExportFile, ExportService};
pub use import::{ImportReport, ImportService};
