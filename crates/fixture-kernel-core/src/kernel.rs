//! Application-owned entry point tying the repository, position orders and
//! link index together.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{KernelConfig, ReconcileOptions};
use crate::fixtures::{FixtureRepository, ParsedRow, Population, UploadResult};
use crate::links::{FixtureAggregate, LinkIndex, WorkNoteFixtureLink};
use crate::positions::{
    InMemoryPositionOrderStore, PositionOrder, PositionOrderService, PositionOrderStore,
    UpdateResult,
};
use crate::{FixtureId, KernelError, ProductionId, SharedClock, SystemClock, WorkNoteId};

pub struct FixtureKernel<S = InMemoryPositionOrderStore> {
    config: KernelConfig,
    fixtures: FixtureRepository<S>,
    links: LinkIndex,
}

impl FixtureKernel<InMemoryPositionOrderStore> {
    /// Default configuration, wall-clock time and no durable position orders.
    #[must_use]
    pub fn in_memory() -> Self {
        let clock: SharedClock = Arc::new(SystemClock);
        Self::assemble(KernelConfig::default(), InMemoryPositionOrderStore::new(), clock)
    }
}

impl<S: PositionOrderStore> FixtureKernel<S> {
    /// # Errors
    /// Returns [`KernelError::Config`] when `config` fails validation.
    pub fn new(config: KernelConfig, store: S, clock: SharedClock) -> Result<Self, KernelError> {
        config.validate()?;
        Ok(Self::assemble(config, store, clock))
    }

    fn assemble(config: KernelConfig, store: S, clock: SharedClock) -> Self {
        let positions = PositionOrderService::new(store, clock.clone())
            .with_added_review_threshold(config.added_review_threshold);
        Self {
            fixtures: FixtureRepository::new(positions, clock.clone()),
            links: LinkIndex::new(clock),
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Reconcile with the configured defaults.
    pub fn reconcile(&mut self, production_id: ProductionId, rows: &[ParsedRow]) -> UploadResult {
        let options = self.config.reconcile_options();
        self.reconcile_with(production_id, rows, &options)
    }

    pub fn reconcile_with(
        &mut self,
        production_id: ProductionId,
        rows: &[ParsedRow],
        options: &ReconcileOptions,
    ) -> UploadResult {
        self.fixtures.reconcile(&mut self.links, production_id, rows, options)
    }

    /// # Errors
    /// Returns [`KernelError::Validation`] when any id is not a known fixture.
    pub fn link(
        &mut self,
        work_note_id: WorkNoteId,
        fixture_ids: &[FixtureId],
    ) -> Result<Option<FixtureAggregate>, KernelError> {
        self.links.link(&self.fixtures, work_note_id, fixture_ids)
    }

    pub fn unlink(
        &mut self,
        work_note_id: WorkNoteId,
        fixture_ids: Option<&[FixtureId]>,
    ) -> Option<FixtureAggregate> {
        self.links.unlink(&self.fixtures, work_note_id, fixture_ids)
    }

    #[must_use]
    pub fn aggregate(&self, work_note_id: WorkNoteId) -> Option<&FixtureAggregate> {
        self.links.aggregate(work_note_id)
    }

    #[must_use]
    pub fn links_for(&self, work_note_id: WorkNoteId) -> Vec<WorkNoteFixtureLink> {
        self.links.links_for(work_note_id)
    }

    #[must_use]
    pub fn fixtures(&self) -> &FixtureRepository<S> {
        &self.fixtures
    }

    #[must_use]
    pub fn links(&self) -> &LinkIndex {
        &self.links
    }

    #[must_use]
    pub fn positions(&self) -> &PositionOrderService<S> {
        self.fixtures.positions()
    }

    /// # Errors
    /// Returns [`KernelError::Persistence`] when the store lookup fails.
    pub fn current_positions(
        &self,
        production_id: ProductionId,
    ) -> Result<Option<PositionOrder>, KernelError> {
        self.fixtures.positions().current(production_id)
    }

    /// # Errors
    /// See [`PositionOrderService::set_order`].
    pub fn set_position_order(
        &mut self,
        production_id: ProductionId,
        positions: Vec<String>,
    ) -> Result<PositionOrder, KernelError> {
        self.fixtures.positions_mut().set_order(production_id, positions)
    }

    #[must_use]
    pub fn last_position_update(&self, production_id: ProductionId) -> Option<&UpdateResult> {
        self.fixtures.last_position_update(production_id)
    }

    #[must_use]
    pub fn population(&self) -> Population {
        self.fixtures.population()
    }

    /// # Errors
    /// Returns [`KernelError::Persistence`] when stored position orders cannot be removed.
    pub fn clear(&mut self) -> Result<(), KernelError> {
        self.fixtures.clear(&mut self.links)
    }
}

/// Cloneable handle that serializes every call on one kernel.
pub struct SharedKernel<S = InMemoryPositionOrderStore> {
    inner: Arc<Mutex<FixtureKernel<S>>>,
}

impl<S> Clone for SharedKernel<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<S: PositionOrderStore> SharedKernel<S> {
    #[must_use]
    pub fn new(kernel: FixtureKernel<S>) -> Self {
        Self { inner: Arc::new(Mutex::new(kernel)) }
    }

    pub fn reconcile(&self, production_id: ProductionId, rows: &[ParsedRow]) -> UploadResult {
        self.inner.lock().reconcile(production_id, rows)
    }

    pub fn reconcile_with(
        &self,
        production_id: ProductionId,
        rows: &[ParsedRow],
        options: &ReconcileOptions,
    ) -> UploadResult {
        self.inner.lock().reconcile_with(production_id, rows, options)
    }

    /// # Errors
    /// See [`FixtureKernel::link`].
    pub fn link(
        &self,
        work_note_id: WorkNoteId,
        fixture_ids: &[FixtureId],
    ) -> Result<Option<FixtureAggregate>, KernelError> {
        self.inner.lock().link(work_note_id, fixture_ids)
    }

    pub fn unlink(
        &self,
        work_note_id: WorkNoteId,
        fixture_ids: Option<&[FixtureId]>,
    ) -> Option<FixtureAggregate> {
        self.inner.lock().unlink(work_note_id, fixture_ids)
    }

    #[must_use]
    pub fn aggregate(&self, work_note_id: WorkNoteId) -> Option<FixtureAggregate> {
        self.inner.lock().aggregate(work_note_id).cloned()
    }

    /// # Errors
    /// See [`FixtureKernel::current_positions`].
    pub fn current_positions(
        &self,
        production_id: ProductionId,
    ) -> Result<Option<PositionOrder>, KernelError> {
        self.inner.lock().current_positions(production_id)
    }

    /// # Errors
    /// See [`FixtureKernel::set_position_order`].
    pub fn set_position_order(
        &self,
        production_id: ProductionId,
        positions: Vec<String>,
    ) -> Result<PositionOrder, KernelError> {
        self.inner.lock().set_position_order(production_id, positions)
    }

    /// # Errors
    /// See [`FixtureKernel::clear`].
    pub fn clear(&self) -> Result<(), KernelError> {
        self.inner.lock().clear()
    }

    /// Run `f` against a consistent snapshot; no mutation can interleave.
    pub fn read<T>(&self, f: impl FnOnce(&FixtureKernel<S>) -> T) -> T {
        let kernel = self.inner.lock();
        f(&kernel)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use time::OffsetDateTime;

    use super::*;
    use crate::positions::UpdateKind;
    use crate::ManualClock;

    fn mk_row(external_id: &str, channel: u32, position: &str) -> ParsedRow {
        ParsedRow {
            external_id: external_id.to_string(),
            channel,
            position: position.to_string(),
            fixture_type: "Source Four".to_string(),
            purpose: "Front wash".to_string(),
            ..ParsedRow::default()
        }
    }

    fn kernel(config: KernelConfig) -> FixtureKernel {
        let clock: SharedClock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        match FixtureKernel::new(config, InMemoryPositionOrderStore::new(), clock) {
            Ok(kernel) => kernel,
            Err(err) => panic!("kernel should build: {err}"),
        }
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = KernelConfig { default_source: " ".to_string(), ..KernelConfig::default() };
        let clock: SharedClock = Arc::new(SystemClock);

        let result = FixtureKernel::new(config, InMemoryPositionOrderStore::new(), clock);

        assert!(matches!(result, Err(KernelError::Config(_))));
    }

    #[test]
    fn config_defaults_drive_reconcile() {
        let config = KernelConfig {
            deactivate_missing: false,
            default_source: "lightwright".to_string(),
            ..KernelConfig::default()
        };
        let mut kernel = kernel(config);
        let production = ProductionId::new();
        kernel.reconcile(production, &[mk_row("1", 1, "Pipe 1"), mk_row("2", 2, "Pipe 1")]);

        let result = kernel.reconcile(production, &[mk_row("1", 1, "Pipe 1")]);

        assert_eq!(result.inactivated, 0);
        let sources = kernel
            .fixtures()
            .by_production(production)
            .iter()
            .map(|fixture| fixture.source.clone())
            .collect::<Vec<_>>();
        assert_eq!(sources, vec!["lightwright".to_string(); 2]);
    }

    #[test]
    fn review_threshold_comes_from_config() {
        let mut kernel = kernel(KernelConfig { added_review_threshold: 0, ..KernelConfig::default() });
        let production = ProductionId::new();
        kernel.reconcile(production, &[mk_row("1", 1, "Pipe 1")]);

        kernel.reconcile(production, &[mk_row("1", 1, "Pipe 1"), mk_row("2", 2, "Pipe 2")]);

        let Some(update) = kernel.last_position_update(production) else {
            panic!("position update should be recorded");
        };
        assert_eq!(update.kind, UpdateKind::PositionsAdded);
        assert!(update.needs_review);
    }

    #[test]
    fn curated_order_is_visible_through_kernel() {
        let mut kernel = kernel(KernelConfig::default());
        let production = ProductionId::new();
        kernel.reconcile(production, &[mk_row("1", 1, "Pipe 1"), mk_row("2", 2, "Pipe 2")]);

        let curated = vec!["Pipe 2".to_string(), "Pipe 1".to_string()];
        if let Err(err) = kernel.set_position_order(production, curated.clone()) {
            panic!("set_position_order should succeed: {err}");
        }

        let current = kernel.current_positions(production);
        assert!(matches!(current, Ok(Some(order)) if order.positions == curated));
    }

    #[test]
    fn clear_resets_everything() {
        let mut kernel = kernel(KernelConfig::default());
        let production = ProductionId::new();
        kernel.reconcile(production, &[mk_row("1", 1, "Pipe 1")]);
        let ids = kernel.fixtures().by_production(production).iter().map(|f| f.id).collect::<Vec<_>>();
        let note = WorkNoteId::new();
        assert!(matches!(kernel.link(note, &ids), Ok(Some(_))));

        if let Err(err) = kernel.clear() {
            panic!("clear should succeed: {err}");
        }

        assert_eq!(kernel.population(), Population::Cleared);
        assert!(kernel.aggregate(note).is_none());
        assert!(kernel.links_for(note).is_empty());
        assert!(matches!(kernel.current_positions(production), Ok(None)));
    }

    #[test]
    fn shared_kernel_serializes_concurrent_callers() {
        let shared = SharedKernel::new(FixtureKernel::in_memory());
        let productions = (0..4).map(|_| ProductionId::new()).collect::<Vec<_>>();

        let handles = productions
            .iter()
            .map(|production| {
                let shared = shared.clone();
                let production = *production;
                thread::spawn(move || {
                    let rows = (1..=50)
                        .map(|channel| mk_row(&format!("F{channel}"), channel, "Pipe 1"))
                        .collect::<Vec<_>>();
                    for _ in 0..5 {
                        shared.reconcile(production, &rows);
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            if handle.join().is_err() {
                panic!("worker thread panicked");
            }
        }

        shared.read(|kernel| {
            assert_eq!(kernel.fixtures().productions().len(), 4);
            for production in &productions {
                assert_eq!(kernel.fixtures().by_production(*production).len(), 50);
            }
        });

        let note = WorkNoteId::new();
        let ids = shared.read(|kernel| {
            kernel.fixtures().by_channels(productions[0], &[1, 2, 3]).iter().map(|f| f.id).collect::<Vec<_>>()
        });
        assert!(shared.link(note, &ids).is_ok());
        assert_eq!(shared.aggregate(note).map(|a| a.channel_expression), Some("1-3".to_string()));
    }
}
