use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::ReconcileOptions;
use crate::links::LinkIndex;
use crate::positions::{PositionOrderService, PositionOrderStore, UpdateResult};
use crate::reconcile::{ReconcileEngine, RowError, SourceRow, Stamp, TrackedRecord};
use crate::{FixtureId, KernelError, ProductionId, SharedClock};

/// One fixture row as produced by the hookup parser.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ParsedRow {
    pub external_id: String,
    pub channel: u32,
    pub position: String,
    pub unit_number: String,
    pub fixture_type: String,
    pub purpose: String,
    pub universe: Option<u32>,
    pub address: Option<u32>,
    pub raw_universe_address: Option<String>,
    pub position_order_hint: Option<i64>,
}

impl SourceRow for ParsedRow {
    fn external_id(&self) -> &str {
        &self.external_id
    }

    fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.position.trim().is_empty() {
            warnings.push(format!(
                "externalId {} has no position and is left out of the position order",
                self.external_id.trim()
            ));
        }
        warnings
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FixtureRecord {
    pub id: FixtureId,
    pub production_id: ProductionId,
    pub external_id: String,
    pub channel: u32,
    pub position: String,
    pub unit_number: String,
    pub fixture_type: String,
    pub purpose: String,
    pub universe: Option<u32>,
    pub address: Option<u32>,
    pub raw_universe_address: Option<String>,
    pub position_order_hint: Option<i64>,
    pub is_active: bool,
    pub source: String,
    #[serde(with = "time::serde::rfc3339")]
    pub source_uploaded_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub removed_at: Option<OffsetDateTime>,
}

impl FixtureRecord {
    /// Display form of the DMX address: `universe/address`, then the bare
    /// address, then whatever the paperwork said verbatim.
    #[must_use]
    pub fn universe_address(&self) -> Option<String> {
        match (self.universe, self.address) {
            (Some(universe), Some(address)) => Some(format!("{universe}/{address}")),
            (None, Some(address)) => Some(address.to_string()),
            _ => self
                .raw_universe_address
                .as_deref()
                .map(str::trim)
                .filter(|raw| !raw.is_empty())
                .map(str::to_string),
        }
    }

    fn overwrite(&mut self, row: &ParsedRow) {
        self.channel = row.channel;
        self.position = row.position.trim().to_string();
        self.unit_number = row.unit_number.clone();
        self.fixture_type = row.fixture_type.clone();
        self.purpose = row.purpose.clone();
        self.universe = row.universe;
        self.address = row.address;
        self.raw_universe_address = row.raw_universe_address.clone();
        self.position_order_hint = row.position_order_hint;
    }
}

impl TrackedRecord for FixtureRecord {
    type Id = FixtureId;
    type Row = ParsedRow;

    fn id(&self) -> FixtureId {
        self.id
    }

    fn production_id(&self) -> ProductionId {
        self.production_id
    }

    fn external_id(&self) -> &str {
        &self.external_id
    }

    fn is_active(&self) -> bool {
        self.is_active
    }

    fn create(
        production_id: ProductionId,
        external_id: &str,
        row: &ParsedRow,
        stamp: &Stamp,
    ) -> Self {
        let mut record = Self {
            id: FixtureId::new(),
            production_id,
            external_id: external_id.to_string(),
            channel: 0,
            position: String::new(),
            unit_number: String::new(),
            fixture_type: String::new(),
            purpose: String::new(),
            universe: None,
            address: None,
            raw_universe_address: None,
            position_order_hint: None,
            is_active: true,
            source: stamp.source.clone(),
            source_uploaded_at: stamp.uploaded_at,
            created_at: stamp.now,
            updated_at: stamp.now,
            removed_at: None,
        };
        record.overwrite(row);
        record
    }

    fn refresh(&mut self, row: &ParsedRow, stamp: &Stamp) {
        self.overwrite(row);
        self.is_active = true;
        self.removed_at = None;
        self.source.clone_from(&stamp.source);
        self.source_uploaded_at = stamp.uploaded_at;
        self.updated_at = stamp.now;
    }

    fn deactivate(&mut self, at: OffsetDateTime) {
        self.is_active = false;
        self.removed_at = Some(at);
        self.updated_at = at;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct UploadResult {
    pub success: bool,
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub inactivated: usize,
    pub errors: Vec<RowError>,
    pub warnings: Vec<String>,
}

/// Whether the repository has ever held data, and whether it was wiped on purpose.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Population {
    #[default]
    NeverPopulated,
    Populated,
    Cleared,
}

pub struct FixtureRepository<S> {
    engine: ReconcileEngine<FixtureRecord>,
    positions: PositionOrderService<S>,
    last_position_update: BTreeMap<ProductionId, UpdateResult>,
    population: Population,
    clock: SharedClock,
}

impl<S: PositionOrderStore> FixtureRepository<S> {
    #[must_use]
    pub fn new(positions: PositionOrderService<S>, clock: SharedClock) -> Self {
        Self {
            engine: ReconcileEngine::new(),
            positions,
            last_position_update: BTreeMap::new(),
            population: Population::NeverPopulated,
            clock,
        }
    }

    /// Upsert one production's fixtures from an import batch.
    ///
    /// Runs to completion: records, the production's position order, and every
    /// aggregate of a work note linked into this production are all current
    /// when this returns.
    pub fn reconcile(
        &mut self,
        links: &mut LinkIndex,
        production_id: ProductionId,
        rows: &[ParsedRow],
        options: &ReconcileOptions,
    ) -> UploadResult {
        let now = self.clock.now();
        let stamp = Stamp {
            now,
            uploaded_at: options.uploaded_at.unwrap_or(now),
            source: options.source.clone(),
        };

        let counts =
            self.engine.reconcile(production_id, rows, &stamp, options.deactivate_missing);
        self.population = Population::Populated;

        for error in &counts.errors {
            tracing::warn!(
                production_id = %production_id,
                row = error.row,
                field = %error.field,
                "skipping fixture row: {}",
                error.message
            );
        }

        let mut warnings = counts.warnings;
        let observed = self.active_positions(production_id);
        match self.positions.reconcile_with_hints(production_id, &observed) {
            Ok(update) => {
                self.last_position_update.insert(production_id, update);
            }
            Err(err) => {
                tracing::warn!(production_id = %production_id, "position order not saved: {err}");
                warnings.push(format!("position order not saved: {err}"));
            }
        }

        let refreshed = links.refresh_production(self, production_id);

        tracing::info!(
            production_id = %production_id,
            processed = counts.processed,
            inserted = counts.inserted,
            updated = counts.updated,
            inactivated = counts.inactivated,
            errors = counts.errors.len(),
            refreshed_aggregates = refreshed,
            "reconciled fixtures"
        );

        UploadResult {
            success: counts.errors.is_empty(),
            processed: counts.processed,
            inserted: counts.inserted,
            updated: counts.updated,
            inactivated: counts.inactivated,
            errors: counts.errors,
            warnings,
        }
    }

    /// Active fixtures on any of `channels`, ascending by channel.
    #[must_use]
    pub fn by_channels(
        &self,
        production_id: ProductionId,
        channels: &[u32],
    ) -> Vec<&FixtureRecord> {
        let wanted = channels.iter().copied().collect::<BTreeSet<_>>();
        let mut fixtures = self
            .engine
            .for_production(production_id)
            .filter(|fixture| fixture.is_active && wanted.contains(&fixture.channel))
            .collect::<Vec<_>>();
        fixtures
            .sort_by(|lhs, rhs| lhs.channel.cmp(&rhs.channel).then_with(|| lhs.id.cmp(&rhs.id)));
        fixtures
    }

    /// Fixtures for the given ids; unknown ids are skipped. Order is unspecified.
    #[must_use]
    pub fn by_ids(&self, ids: &[FixtureId]) -> Vec<&FixtureRecord> {
        ids.iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|id| self.engine.get(*id))
            .collect()
    }

    /// Every fixture of the production, active or not.
    #[must_use]
    pub fn by_production(&self, production_id: ProductionId) -> Vec<&FixtureRecord> {
        self.engine.for_production(production_id).collect()
    }

    #[must_use]
    pub fn get(&self, id: FixtureId) -> Option<&FixtureRecord> {
        self.engine.get(id)
    }

    #[must_use]
    pub fn by_external_id(
        &self,
        production_id: ProductionId,
        external_id: &str,
    ) -> Option<&FixtureRecord> {
        self.engine.by_external_id(production_id, external_id)
    }

    #[must_use]
    pub fn productions(&self) -> BTreeSet<ProductionId> {
        self.engine.productions()
    }

    #[must_use]
    pub fn last_position_update(&self, production_id: ProductionId) -> Option<&UpdateResult> {
        self.last_position_update.get(&production_id)
    }

    #[must_use]
    pub fn positions(&self) -> &PositionOrderService<S> {
        &self.positions
    }

    pub fn positions_mut(&mut self) -> &mut PositionOrderService<S> {
        &mut self.positions
    }

    #[must_use]
    pub fn population(&self) -> Population {
        self.population
    }

    /// Drop every fixture, link, aggregate and position order.
    ///
    /// # Errors
    /// Returns [`KernelError::Persistence`] when stored position orders cannot be
    /// removed; in that case nothing is cleared.
    pub fn clear(&mut self, links: &mut LinkIndex) -> Result<(), KernelError> {
        self.positions.clear()?;
        self.engine.clear();
        self.last_position_update.clear();
        links.clear();
        self.population = Population::Cleared;
        tracing::info!("cleared fixture repository");
        Ok(())
    }

    /// Each position held by an active fixture, with its smallest order hint.
    fn active_positions(&self, production_id: ProductionId) -> BTreeMap<String, Option<i64>> {
        let mut positions: BTreeMap<String, Option<i64>> = BTreeMap::new();
        for fixture in self.engine.for_production(production_id) {
            if !fixture.is_active || fixture.position.is_empty() {
                continue;
            }
            let hint = positions.entry(fixture.position.clone()).or_insert(None);
            *hint = match (*hint, fixture.position_order_hint) {
                (Some(current), Some(candidate)) => Some(current.min(candidate)),
                (current, candidate) => current.or(candidate),
            };
        }
        positions
    }
}
