//! In-process store for import error reports.
//!
//! A report is kept under a generated token until it is fetched once, it
//! expires, or newer reports push it out of the bounded store.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use crate::error::{RegistryError, Result};

pub const DEFAULT_ERROR_LOG_TTL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorReport {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

#[derive(Debug)]
struct StoredReport {
    stored_at: Instant,
    report: ErrorReport,
}

#[derive(Debug)]
pub struct ErrorLogStore {
    ttl: Duration,
    capacity: usize,
    reports: Mutex<HashMap<Uuid, StoredReport>>,
}

impl Default for ErrorLogStore {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_LOG_TTL, DEFAULT_ERROR_LOG_CAPACITY)
    }
}

fn poisoned() -> RegistryError {
    RegistryError::Internal(anyhow::anyhow!("error log lock poisoned"))
}

impl ErrorLogStore {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            reports: Mutex::new(HashMap::new()),
        }
    }

    pub fn put(&self, report: ErrorReport) -> Result<Uuid> {
        let now = Instant::now();
        let mut reports = self.reports.lock().map_err(|_| poisoned())?;

        reports.retain(|_, stored| now.duration_since(stored.stored_at) < self.ttl);
        while reports.len() >= self.capacity {
            let Some(oldest) = reports
                .iter()
                .min_by_key(|(_, stored)| stored.stored_at)
                .map(|(token, _)| *token)
            else {
                break;
            };
            reports.remove(&oldest);
            debug!("Import error log {} evicted", oldest);
        }

        let token = Uuid::new_v4();
        reports.insert(token, StoredReport { stored_at: now, report });
        Ok(token)
    }

    /// Remove and return the report behind `token`.
    pub fn take(&self, token: Uuid) -> Result<ErrorReport> {
        let stored = self
            .reports
            .lock()
            .map_err(|_| poisoned())?
            .remove(&token)
            .filter(|stored| stored.stored_at.elapsed() < self.ttl);
        stored
            .map(|s| s.report)
            .ok_or_else(|| RegistryError::not_found(format!("import error log {token}")))
    }

    pub fn len(&self) -> usize {
        self.reports.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(name: &str) -> ErrorReport {
        ErrorReport {
            columns: vec!["name".into(), "__errors".into()],
            rows: vec![vec![name.into(), "depth: cannot parse".into()]],
        }
    }

    #[test]
    fn report_is_consumed_on_retrieval() {
        let store = ErrorLogStore::default();
        let token = store.put(report("Well-2")).unwrap();
        assert_eq!(store.len(), 1);

        assert_eq!(store.take(token).unwrap(), report("Well-2"));
        assert!(matches!(store.take(token), Err(RegistryError::NotFound(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn expired_reports_are_gone() {
        let store = ErrorLogStore::new(Duration::ZERO, 8);
        let token = store.put(report("Well-2")).unwrap();
        assert!(matches!(store.take(token), Err(RegistryError::NotFound(_))));

        store.put(report("Well-3")).unwrap();
        store.put(report("Well-4")).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn oldest_report_is_evicted_at_capacity() {
        let store = ErrorLogStore::new(DEFAULT_ERROR_LOG_TTL, 2);
        let first = store.put(report("Well-1")).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let second = store.put(report("Well-2")).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        let third = store.put(report("Well-3")).unwrap();

        assert_eq!(store.len(), 2);
        assert!(store.take(first).is_err());
        assert_eq!(store.take(second).unwrap(), report("Well-2"));
        assert_eq!(store.take(third).unwrap(), report("Well-3"));
    }
}
