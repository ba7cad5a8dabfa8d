//! Geometry Binding & History Engine
//!
//! A record moves between three states:
//!
//! - *Unbound*: no forward reference on the record.
//! - *Bound-Current*: one feature row for the reference.
//! - *Bound-Historized*: closed rows plus exactly one open row
//!   (`end_date IS NULL`), all sharing the reference.
//!
//! Every transition is expressed as [`SpatialStore`] calls; the engine never
//! builds SQL.

use serde::Serialize;
use tracing::{debug, info};

use super::layer::GeometryBinding;
use super::store::{GeometryInput, SpatialStore};
use crate::error::{RegistryError, Result};
use crate::registry::value::CellValue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reference", rename_all = "snake_case")]
pub enum GeometryOutcome {
    /// A new feature row; the record now references it.
    Created(String),
    /// A new version appended to an existing reference.
    Appended(String),
    /// The open row was rewritten in place.
    Updated(String),
    /// The last row went away and the record is unbound.
    Unbound(String),
    /// The open version went away and the previous one is current again.
    Reverted(String),
}

pub struct GeometryEngine;

impl GeometryEngine {
    /// Bind a geometry to a record.
    ///
    /// A historized record that already has a reference gets a new version
    /// under that reference instead of a second feature key.
    pub async fn create<S>(
        store: &mut S,
        binding: &GeometryBinding,
        record_key: &CellValue,
        geometry: &GeometryInput,
        source_srid: i32,
    ) -> Result<GeometryOutcome>
    where
        S: SpatialStore + ?Sized,
    {
        if binding.store_history {
            if let Some(reference) = store.read_forward_reference(binding, record_key).await? {
                Self::append_version(store, binding, &reference, geometry, source_srid).await?;
                return Ok(GeometryOutcome::Appended(reference));
            }
        }

        let reference = store
            .insert_feature(&binding.layer, geometry, source_srid, None)
            .await?;
        let updated = store
            .write_forward_reference(binding, record_key, Some(&reference))
            .await?;
        if updated == 0 {
            return Err(RegistryError::not_found(format!(
                "record {} of {}",
                record_key.display_text(),
                binding.registry_table
            )));
        }
        info!(
            "Created geometry {} in {}.{}",
            reference, binding.layer.schema, binding.layer.table
        );
        Ok(GeometryOutcome::Created(reference))
    }

    /// Replace the geometry behind `reference`.
    pub async fn update<S>(
        store: &mut S,
        binding: &GeometryBinding,
        reference: &str,
        geometry: &GeometryInput,
        source_srid: i32,
    ) -> Result<GeometryOutcome>
    where
        S: SpatialStore + ?Sized,
    {
        if binding.store_history {
            Self::append_version(store, binding, reference, geometry, source_srid).await?;
            return Ok(GeometryOutcome::Appended(reference.to_string()));
        }
        let updated = store
            .update_feature(&binding.layer, reference, geometry, source_srid)
            .await?;
        if updated == 0 {
            return Err(RegistryError::not_found(format!("geometry {reference}")));
        }
        debug!("Updated geometry {} in place", reference);
        Ok(GeometryOutcome::Updated(reference.to_string()))
    }

    /// Create when the record has no rows yet, otherwise update. Drives
    /// geometry from uploaded contour files.
    pub async fn upsert<S>(
        store: &mut S,
        binding: &GeometryBinding,
        record_key: &CellValue,
        geometry: &GeometryInput,
        source_srid: i32,
    ) -> Result<GeometryOutcome>
    where
        S: SpatialStore + ?Sized,
    {
        let reference = store.read_forward_reference(binding, record_key).await?;
        let count = match &reference {
            Some(r) => store.count_features(&binding.layer, r).await?,
            None => 0,
        };
        match reference {
            Some(r) if count > 0 => Self::update(store, binding, &r, geometry, source_srid).await,
            _ => Self::create(store, binding, record_key, geometry, source_srid).await,
        }
    }

    /// Remove the current geometry behind `reference`.
    ///
    /// With several versions only the open one is deleted and the most
    /// recently closed one reopens; the record keeps its reference. The last
    /// row takes the record's reference with it.
    pub async fn delete<S>(store: &mut S, binding: &GeometryBinding, reference: &str) -> Result<GeometryOutcome>
    where
        S: SpatialStore + ?Sized,
    {
        let count = store.count_features(&binding.layer, reference).await?;
        if count == 0 {
            return Err(RegistryError::not_found(format!("geometry {reference}")));
        }

        if count > 1 && binding.store_history {
            store.delete_current_version(&binding.layer, reference).await?;
            store.reopen_latest_version(&binding.layer, reference).await?;
            debug!("Reverted geometry {} to its previous version", reference);
            return Ok(GeometryOutcome::Reverted(reference.to_string()));
        }

        store.delete_feature(&binding.layer, reference).await?;
        store.clear_forward_references(binding, reference).await?;
        info!("Deleted geometry {}", reference);
        Ok(GeometryOutcome::Unbound(reference.to_string()))
    }

    pub async fn count<S>(store: &mut S, binding: &GeometryBinding, reference: &str) -> Result<i64>
    where
        S: SpatialStore + ?Sized,
    {
        store.count_features(&binding.layer, reference).await
    }

    async fn append_version<S>(
        store: &mut S,
        binding: &GeometryBinding,
        reference: &str,
        geometry: &GeometryInput,
        source_srid: i32,
    ) -> Result<()>
    where
        S: SpatialStore + ?Sized,
    {
        store.close_current_version(&binding.layer, reference).await?;
        store
            .insert_feature(&binding.layer, geometry, source_srid, Some(reference))
            .await?;
        debug!("Appended version to geometry {}", reference);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::layer::tests::binding;
    use crate::spatial::layer::LayerTable;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use uuid::Uuid;

    #[derive(Debug, Clone)]
    struct FeatureRow {
        key: i64,
        back_ref: String,
        geometry: String,
        end_date: Option<u64>,
    }

    /// Feature table and forward references in memory, with a logical clock
    /// standing in for `now()`.
    #[derive(Default)]
    struct MemorySpatialStore {
        rows: Vec<FeatureRow>,
        forward: HashMap<String, Option<String>>,
        clock: u64,
        frozen_clock: bool,
    }

    impl MemorySpatialStore {
        fn with_record(key: &CellValue) -> Self {
            let mut store = Self::default();
            store.forward.insert(key.display_text(), None);
            store
        }

        fn now(&mut self) -> u64 {
            if !self.frozen_clock {
                self.clock += 1;
            }
            self.clock
        }

        fn rows_for(&self, back_ref: &str) -> Vec<&FeatureRow> {
            self.rows.iter().filter(|r| r.back_ref == back_ref).collect()
        }
    }

    fn text(g: &GeometryInput) -> String {
        match g {
            GeometryInput::Wkt(w) => w.clone(),
            GeometryInput::GeoJson(j) => j.to_string(),
        }
    }

    #[async_trait]
    impl SpatialStore for MemorySpatialStore {
        async fn transform_geometry(&mut self, geometry: &GeometryInput, _from: i32, _to: i32) -> Result<String> {
            Ok(text(geometry))
        }

        async fn count_features(&mut self, _layer: &LayerTable, back_ref: &str) -> Result<i64> {
            Ok(self.rows_for(back_ref).len() as i64)
        }

        async fn insert_feature(
            &mut self,
            _layer: &LayerTable,
            geometry: &GeometryInput,
            _source_srid: i32,
            back_ref: Option<&str>,
        ) -> Result<String> {
            let key = self.rows.iter().map(|r| r.key).max().unwrap_or(0) + 1;
            let back_ref = back_ref.map(str::to_string).unwrap_or_else(|| format!("g{key}"));
            self.rows.push(FeatureRow {
                key,
                back_ref: back_ref.clone(),
                geometry: text(geometry),
                end_date: None,
            });
            Ok(back_ref)
        }

        async fn update_feature(
            &mut self,
            _layer: &LayerTable,
            back_ref: &str,
            geometry: &GeometryInput,
            _source_srid: i32,
        ) -> Result<u64> {
            let mut n = 0;
            for row in self.rows.iter_mut().filter(|r| r.back_ref == back_ref) {
                row.geometry = text(geometry);
                n += 1;
            }
            Ok(n)
        }

        async fn close_current_version(&mut self, _layer: &LayerTable, back_ref: &str) -> Result<u64> {
            let now = self.now();
            let mut n = 0;
            for row in self
                .rows
                .iter_mut()
                .filter(|r| r.back_ref == back_ref && r.end_date.is_none())
            {
                row.end_date = Some(now);
                n += 1;
            }
            Ok(n)
        }

        async fn reopen_latest_version(&mut self, _layer: &LayerTable, back_ref: &str) -> Result<u64> {
            let latest = self
                .rows
                .iter_mut()
                .filter(|r| r.back_ref == back_ref && r.end_date.is_some())
                .max_by_key(|r| r.end_date);
            Ok(match latest {
                Some(row) => {
                    row.end_date = None;
                    1
                }
                None => 0,
            })
        }

        async fn delete_current_version(&mut self, _layer: &LayerTable, back_ref: &str) -> Result<u64> {
            let before = self.rows.len();
            self.rows
                .retain(|r| !(r.back_ref == back_ref && r.end_date.is_none()));
            Ok((before - self.rows.len()) as u64)
        }

        async fn delete_feature(&mut self, _layer: &LayerTable, back_ref: &str) -> Result<u64> {
            let before = self.rows.len();
            self.rows.retain(|r| r.back_ref != back_ref);
            Ok((before - self.rows.len()) as u64)
        }

        async fn current_geometry(&mut self, _layer: &LayerTable, back_ref: &str) -> Result<Option<String>> {
            Ok(self
                .rows
                .iter()
                .find(|r| r.back_ref == back_ref && r.end_date.is_none())
                .map(|r| r.geometry.clone()))
        }

        async fn read_forward_reference(&mut self, _b: &GeometryBinding, record_key: &CellValue) -> Result<Option<String>> {
            Ok(self.forward.get(&record_key.display_text()).cloned().flatten())
        }

        async fn write_forward_reference(
            &mut self,
            _b: &GeometryBinding,
            record_key: &CellValue,
            value: Option<&str>,
        ) -> Result<u64> {
            match self.forward.get_mut(&record_key.display_text()) {
                Some(slot) => {
                    *slot = value.map(str::to_string);
                    Ok(1)
                }
                None => Ok(0),
            }
        }

        async fn clear_forward_references(&mut self, _b: &GeometryBinding, value: &str) -> Result<u64> {
            let mut n = 0;
            for slot in self.forward.values_mut() {
                if slot.as_deref() == Some(value) {
                    *slot = None;
                    n += 1;
                }
            }
            Ok(n)
        }
    }

    fn wkt(n: usize) -> GeometryInput {
        GeometryInput::Wkt(format!("POINT ({n} {n})"))
    }

    fn record() -> CellValue {
        CellValue::Uuid(Uuid::new_v4())
    }

    #[tokio::test]
    async fn without_history_updates_keep_one_row() {
        let b = binding(false);
        let key = record();
        let mut store = MemorySpatialStore::with_record(&key);

        let GeometryOutcome::Created(reference) =
            GeometryEngine::create(&mut store, &b, &key, &wkt(0), 4326).await.unwrap()
        else {
            panic!("expected a new geometry");
        };
        for n in 1..=5 {
            let outcome = GeometryEngine::update(&mut store, &b, &reference, &wkt(n), 4326)
                .await
                .unwrap();
            assert_eq!(outcome, GeometryOutcome::Updated(reference.clone()));
        }
        assert_eq!(store.rows_for(&reference).len(), 1);
        assert_eq!(
            store.current_geometry(&b.layer, &reference).await.unwrap(),
            Some("POINT (5 5)".to_string())
        );
    }

    #[tokio::test]
    async fn history_appends_one_open_row_per_write() {
        let b = binding(true);
        let key = record();
        let mut store = MemorySpatialStore::with_record(&key);

        let GeometryOutcome::Created(reference) =
            GeometryEngine::create(&mut store, &b, &key, &wkt(0), 4326).await.unwrap()
        else {
            panic!("expected a new geometry");
        };
        for n in 1..4 {
            GeometryEngine::update(&mut store, &b, &reference, &wkt(n), 4326)
                .await
                .unwrap();
        }
        let rows = store.rows_for(&reference);
        assert_eq!(rows.len(), 4);
        assert_eq!(rows.iter().filter(|r| r.end_date.is_none()).count(), 1);

        // Deleting reopens the third version.
        let outcome = GeometryEngine::delete(&mut store, &b, &reference).await.unwrap();
        assert_eq!(outcome, GeometryOutcome::Reverted(reference.clone()));
        assert_eq!(store.rows_for(&reference).len(), 3);
        assert_eq!(
            store.current_geometry(&b.layer, &reference).await.unwrap(),
            Some("POINT (2 2)".to_string())
        );
        assert_eq!(
            store.read_forward_reference(&b, &key).await.unwrap(),
            Some(reference)
        );
    }

    #[tokio::test]
    async fn create_on_historized_bound_record_appends() {
        let b = binding(true);
        let key = record();
        let mut store = MemorySpatialStore::with_record(&key);

        let first = GeometryEngine::create(&mut store, &b, &key, &wkt(0), 4326).await.unwrap();
        let GeometryOutcome::Created(reference) = first else {
            panic!("expected a new geometry");
        };
        let second = GeometryEngine::create(&mut store, &b, &key, &wkt(1), 4326).await.unwrap();
        assert_eq!(second, GeometryOutcome::Appended(reference.clone()));

        let keys: std::collections::HashSet<String> = store.rows.iter().map(|r| r.back_ref.clone()).collect();
        assert_eq!(keys.len(), 1);
        assert_eq!(store.rows.iter().filter(|r| r.end_date.is_none()).count(), 1);
    }

    #[tokio::test]
    async fn deleting_last_row_unbinds_record() {
        let b = binding(true);
        let key = record();
        let mut store = MemorySpatialStore::with_record(&key);
        let GeometryOutcome::Created(reference) =
            GeometryEngine::create(&mut store, &b, &key, &wkt(0), 4326).await.unwrap()
        else {
            panic!("expected a new geometry");
        };

        let outcome = GeometryEngine::delete(&mut store, &b, &reference).await.unwrap();
        assert_eq!(outcome, GeometryOutcome::Unbound(reference.clone()));
        assert!(store.rows.is_empty());
        assert_eq!(store.read_forward_reference(&b, &key).await.unwrap(), None);

        let err = GeometryEngine::delete(&mut store, &b, &reference).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[tokio::test]
    async fn tied_end_dates_reopen_one_of_them() {
        let b = binding(true);
        let key = record();
        let mut store = MemorySpatialStore::with_record(&key);
        let GeometryOutcome::Created(reference) =
            GeometryEngine::create(&mut store, &b, &key, &wkt(0), 4326).await.unwrap()
        else {
            panic!("expected a new geometry");
        };
        store.frozen_clock = true;
        GeometryEngine::update(&mut store, &b, &reference, &wkt(1), 4326).await.unwrap();
        GeometryEngine::update(&mut store, &b, &reference, &wkt(2), 4326).await.unwrap();

        GeometryEngine::delete(&mut store, &b, &reference).await.unwrap();
        let current = store.current_geometry(&b.layer, &reference).await.unwrap();
        // Either closed version may come back; no tiebreak exists.
        assert!(matches!(current.as_deref(), Some("POINT (0 0)") | Some("POINT (1 1)")));
        assert_eq!(store.rows.iter().filter(|r| r.end_date.is_none()).count(), 1);
    }

    #[tokio::test]
    async fn upsert_creates_then_updates() {
        let b = binding(false);
        let key = record();
        let mut store = MemorySpatialStore::with_record(&key);

        let first = GeometryEngine::upsert(&mut store, &b, &key, &wkt(0), 4326).await.unwrap();
        assert!(matches!(first, GeometryOutcome::Created(_)));
        let second = GeometryEngine::upsert(&mut store, &b, &key, &wkt(1), 4326).await.unwrap();
        assert!(matches!(second, GeometryOutcome::Updated(_)));
        assert_eq!(store.rows.len(), 1);
    }

    #[tokio::test]
    async fn create_for_missing_record_fails() {
        let b = binding(false);
        let mut store = MemorySpatialStore::default();
        let err = GeometryEngine::create(&mut store, &b, &record(), &wkt(0), 4326)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }
}
