//! Upsert-by-external-identity engine.
//!
//! One engine serves every record shape that is imported from paperwork and
//! keyed by `(production, external id)`. A record is created on first sighting,
//! refreshed in place on every later sighting, and soft-deleted when a run
//! omits it. Nothing is ever hard-deleted here.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ProductionId;

/// One parsed input row, as handed over by the import pipeline.
pub trait SourceRow {
    fn external_id(&self) -> &str;

    /// Fatal problem with an otherwise identifiable row, as `(field, message)`.
    ///
    /// # Errors
    /// Returns the offending field tag and a message when the row must be skipped.
    fn check(&self) -> Result<(), (&'static str, String)> {
        Ok(())
    }

    /// Non-fatal observations worth surfacing to whoever ran the import.
    fn warnings(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Provenance and time applied to every record a run touches.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Stamp {
    pub now: OffsetDateTime,
    pub uploaded_at: OffsetDateTime,
    pub source: String,
}

pub trait TrackedRecord {
    type Id: Copy + Ord + Debug + Display;
    type Row: SourceRow;

    fn id(&self) -> Self::Id;
    fn production_id(&self) -> ProductionId;
    fn external_id(&self) -> &str;
    fn is_active(&self) -> bool;

    /// Build a fresh, active record with a newly assigned surrogate id.
    fn create(production_id: ProductionId, external_id: &str, row: &Self::Row, stamp: &Stamp)
        -> Self;

    /// Overwrite every mutable attribute from `row` and mark the record active.
    fn refresh(&mut self, row: &Self::Row, stamp: &Stamp);

    fn deactivate(&mut self, at: OffsetDateTime);
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RowError {
    /// 1-based position of the row in the submitted batch.
    pub row: usize,
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconcileCounts {
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub inactivated: usize,
    pub errors: Vec<RowError>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ReconcileEngine<R: TrackedRecord> {
    records: BTreeMap<R::Id, R>,
    identity: BTreeMap<(ProductionId, String), R::Id>,
}

impl<R: TrackedRecord> Default for ReconcileEngine<R> {
    fn default() -> Self {
        Self { records: BTreeMap::new(), identity: BTreeMap::new() }
    }
}

impl<R: TrackedRecord> ReconcileEngine<R> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert `rows` for one production and optionally deactivate the rest.
    ///
    /// Row failures are collected, never raised; the batch always runs to the end.
    pub fn reconcile(
        &mut self,
        production_id: ProductionId,
        rows: &[R::Row],
        stamp: &Stamp,
        deactivate_missing: bool,
    ) -> ReconcileCounts {
        let mut counts = ReconcileCounts { processed: rows.len(), ..ReconcileCounts::default() };
        let mut seen: BTreeSet<String> = BTreeSet::new();

        for (index, row) in rows.iter().enumerate() {
            let row_number = index + 1;
            let external_id = row.external_id().trim();
            if external_id.is_empty() {
                counts.errors.push(RowError {
                    row: row_number,
                    field: "externalId".to_string(),
                    message: "externalId MUST be provided".to_string(),
                });
                continue;
            }

            if let Err((field, message)) = row.check() {
                counts.errors.push(RowError { row: row_number, field: field.to_string(), message });
                continue;
            }

            for warning in row.warnings() {
                counts.warnings.push(format!("row {row_number}: {warning}"));
            }

            if !seen.insert(external_id.to_string()) {
                counts.warnings.push(format!(
                    "row {row_number}: duplicate externalId {external_id}; later row wins"
                ));
            }

            let key = (production_id, external_id.to_string());
            match self.identity.get(&key).and_then(|id| self.records.get_mut(id)) {
                Some(record) => {
                    record.refresh(row, stamp);
                    counts.updated += 1;
                }
                None => {
                    let record = R::create(production_id, external_id, row, stamp);
                    self.identity.insert(key, record.id());
                    self.records.insert(record.id(), record);
                    counts.inserted += 1;
                }
            }
        }

        if deactivate_missing {
            let owned = self
                .identity
                .range((production_id, String::new())..)
                .take_while(|((owner, _), _)| *owner == production_id);
            for ((_, external_id), id) in owned {
                if seen.contains(external_id) {
                    continue;
                }
                if let Some(record) = self.records.get_mut(id) {
                    if record.is_active() {
                        record.deactivate(stamp.now);
                        counts.inactivated += 1;
                    }
                }
            }
        }

        counts
    }

    #[must_use]
    pub fn get(&self, id: R::Id) -> Option<&R> {
        self.records.get(&id)
    }

    #[must_use]
    pub fn by_external_id(&self, production_id: ProductionId, external_id: &str) -> Option<&R> {
        self.identity
            .get(&(production_id, external_id.to_string()))
            .and_then(|id| self.records.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.records.values()
    }

    pub fn for_production(&self, production_id: ProductionId) -> impl Iterator<Item = &R> {
        self.records.values().filter(move |record| record.production_id() == production_id)
    }

    #[must_use]
    pub fn productions(&self) -> BTreeSet<ProductionId> {
        self.identity.keys().map(|(production_id, _)| *production_id).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.identity.clear();
    }
}
