//! Curated display order of positions (pipes, trusses, booms) per production.
//!
//! Imports only ever tell us *which* positions exist. The order is owned by a
//! human, so each new observation is merged into the stored order instead of
//! replacing it: survivors keep their relative order and newcomers go last.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::{KernelError, ProductionId, SharedClock};

const FINGERPRINT_LEN: usize = 16;
const FINGERPRINT_SEPARATOR: u8 = 0x1f;

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PositionOrder {
    pub production_id: ProductionId,
    pub positions: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    NoChange,
    PositionsAdded,
    PositionsRemoved,
    PositionsChanged,
}

impl UpdateKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoChange => "no_change",
            Self::PositionsAdded => "positions_added",
            Self::PositionsRemoved => "positions_removed",
            Self::PositionsChanged => "positions_changed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UpdateResult {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    pub added_positions: Vec<String>,
    pub removed_positions: Vec<String>,
    pub new_order: Vec<String>,
    pub needs_review: bool,
}

impl UpdateResult {
    fn unchanged(order: Vec<String>) -> Self {
        Self {
            kind: UpdateKind::NoChange,
            added_positions: Vec::new(),
            removed_positions: Vec::new(),
            new_order: order,
            needs_review: false,
        }
    }
}

/// Persistence collaborator for [`PositionOrder`] records keyed by production.
pub trait PositionOrderStore: Send {
    /// # Errors
    /// Returns [`KernelError::Persistence`] when the backing store cannot be read.
    fn load(&self, production_id: ProductionId) -> Result<Option<PositionOrder>, KernelError>;

    /// Insert or replace the order for `order.production_id`.
    ///
    /// # Errors
    /// Returns [`KernelError::Persistence`] when the write fails.
    fn save(&mut self, order: &PositionOrder) -> Result<(), KernelError>;

    /// # Errors
    /// Returns [`KernelError::Persistence`] when the stored orders cannot be removed.
    fn clear(&mut self) -> Result<(), KernelError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryPositionOrderStore {
    orders: BTreeMap<ProductionId, PositionOrder>,
    save_count: usize,
}

impl InMemoryPositionOrderStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `save` calls since construction.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.save_count
    }
}

impl PositionOrderStore for InMemoryPositionOrderStore {
    fn load(&self, production_id: ProductionId) -> Result<Option<PositionOrder>, KernelError> {
        Ok(self.orders.get(&production_id).cloned())
    }

    fn save(&mut self, order: &PositionOrder) -> Result<(), KernelError> {
        self.orders.insert(order.production_id, order.clone());
        self.save_count += 1;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), KernelError> {
        self.orders.clear();
        Ok(())
    }
}

/// Order-independent change detector over a set of position names.
///
/// Only used to short-circuit unchanged imports; it is not a security primitive.
#[must_use]
pub fn fingerprint<I, T>(positions: I) -> String
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    let sorted =
        positions.into_iter().map(|position| position.as_ref().to_string()).collect::<BTreeSet<_>>();
    let mut hasher = Sha256::new();
    for (index, position) in sorted.iter().enumerate() {
        if index > 0 {
            hasher.update([FINGERPRINT_SEPARATOR]);
        }
        hasher.update(position.as_bytes());
    }
    format!("{:x}", hasher.finalize()).chars().take(FINGERPRINT_LEN).collect()
}

/// Sort names ascending by (hinted first, hint, name).
fn hinted_sort<'a, I>(entries: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a String, &'a Option<i64>)>,
{
    let mut keyed = entries.into_iter().collect::<Vec<_>>();
    keyed.sort_by(|(lhs_name, lhs_hint), (rhs_name, rhs_hint)| {
        lhs_hint
            .is_none()
            .cmp(&rhs_hint.is_none())
            .then_with(|| lhs_hint.cmp(rhs_hint))
            .then_with(|| lhs_name.cmp(rhs_name))
    });
    keyed.into_iter().map(|(name, _)| name.clone()).collect()
}

pub struct PositionOrderService<S> {
    store: S,
    cache: BTreeMap<ProductionId, PositionOrder>,
    clock: SharedClock,
    added_review_threshold: usize,
}

impl<S: PositionOrderStore> PositionOrderService<S> {
    #[must_use]
    pub fn new(store: S, clock: SharedClock) -> Self {
        Self { store, cache: BTreeMap::new(), clock, added_review_threshold: 3 }
    }

    #[must_use]
    pub fn with_added_review_threshold(mut self, threshold: usize) -> Self {
        self.added_review_threshold = threshold;
        self
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Current order for `production_id`, from cache or the backing store.
    ///
    /// # Errors
    /// Returns [`KernelError::Persistence`] when the store lookup fails.
    pub fn current(&self, production_id: ProductionId) -> Result<Option<PositionOrder>, KernelError> {
        if let Some(order) = self.cache.get(&production_id) {
            return Ok(Some(order.clone()));
        }
        self.store.load(production_id)
    }

    /// Merge a newly observed position set into the stored order.
    ///
    /// # Errors
    /// Returns [`KernelError::Persistence`] when the stored order cannot be read or
    /// the merged order cannot be written. The cached order is untouched on failure.
    pub fn reconcile(
        &mut self,
        production_id: ProductionId,
        observed: &BTreeSet<String>,
    ) -> Result<UpdateResult, KernelError> {
        let hints = observed.iter().map(|name| (name.clone(), None)).collect::<BTreeMap<_, _>>();
        self.reconcile_with_hints(production_id, &hints)
    }

    /// Like [`Self::reconcile`], but newcomers are ordered by their source hint
    /// before falling back to name order.
    ///
    /// # Errors
    /// See [`Self::reconcile`].
    pub fn reconcile_with_hints(
        &mut self,
        production_id: ProductionId,
        observed: &BTreeMap<String, Option<i64>>,
    ) -> Result<UpdateResult, KernelError> {
        let Some(existing) = self.current(production_id)? else {
            let new_order = hinted_sort(observed.iter());
            self.persist(production_id, new_order.clone())?;
            tracing::info!(
                production_id = %production_id,
                positions = new_order.len(),
                "initialized position order"
            );
            return Ok(UpdateResult::unchanged(new_order));
        };

        if fingerprint(observed.keys()) == existing.fingerprint {
            return Ok(UpdateResult::unchanged(existing.positions));
        }

        let stored = existing.positions.iter().collect::<BTreeSet<_>>();
        let added = hinted_sort(observed.iter().filter(|(name, _)| !stored.contains(name)));
        let removed = existing
            .positions
            .iter()
            .filter(|name| !observed.contains_key(*name))
            .cloned()
            .collect::<Vec<_>>();
        let new_order = existing
            .positions
            .iter()
            .filter(|name| observed.contains_key(*name))
            .cloned()
            .chain(added.iter().cloned())
            .collect::<Vec<_>>();

        let (kind, needs_review) = match (added.is_empty(), removed.is_empty()) {
            (false, false) => (UpdateKind::PositionsChanged, true),
            (false, true) => {
                (UpdateKind::PositionsAdded, added.len() > self.added_review_threshold)
            }
            (true, false) => (UpdateKind::PositionsRemoved, true),
            // Same set under a stale fingerprint: refresh it, keep the order.
            (true, true) => (UpdateKind::NoChange, false),
        };

        self.persist(production_id, new_order.clone())?;
        tracing::info!(
            production_id = %production_id,
            kind = kind.as_str(),
            added = added.len(),
            removed = removed.len(),
            needs_review,
            "reconciled position order"
        );

        Ok(UpdateResult {
            kind,
            added_positions: added,
            removed_positions: removed,
            new_order,
            needs_review,
        })
    }

    /// Replace the order with a human-curated permutation of the current one.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when `positions` has blanks or duplicates,
    /// or is not a permutation of the existing order; [`KernelError::Persistence`]
    /// when the write fails.
    pub fn set_order(
        &mut self,
        production_id: ProductionId,
        positions: Vec<String>,
    ) -> Result<PositionOrder, KernelError> {
        let mut seen = BTreeSet::new();
        for position in &positions {
            if position.trim().is_empty() {
                return Err(KernelError::Validation(
                    "position names MUST be non-empty".to_string(),
                ));
            }
            if !seen.insert(position.as_str()) {
                return Err(KernelError::Validation(format!(
                    "position order contains duplicate entry: {position}"
                )));
            }
        }

        if let Some(existing) = self.current(production_id)? {
            let stored = existing.positions.iter().map(String::as_str).collect::<BTreeSet<_>>();
            if stored != seen {
                return Err(KernelError::Validation(
                    "curated order MUST contain exactly the current positions".to_string(),
                ));
            }
        }

        self.persist(production_id, positions)
    }

    /// Drop every order, cached and stored.
    ///
    /// # Errors
    /// Returns [`KernelError::Persistence`] when the store cannot be cleared.
    pub fn clear(&mut self) -> Result<(), KernelError> {
        self.store.clear()?;
        self.cache.clear();
        Ok(())
    }

    fn persist(
        &mut self,
        production_id: ProductionId,
        positions: Vec<String>,
    ) -> Result<PositionOrder, KernelError> {
        let order = PositionOrder {
            production_id,
            fingerprint: fingerprint(&positions),
            positions,
            last_updated: self.clock.now(),
        };
        self.store.save(&order)?;
        self.cache.insert(production_id, order.clone());
        Ok(order)
    }
}
