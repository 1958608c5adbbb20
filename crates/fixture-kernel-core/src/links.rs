//! Many-to-many links between work notes and fixtures, plus the per-note
//! summary that reports render from.
//!
//! A work note appears in `links` only while it has at least one link, and it
//! has an aggregate exactly when it appears in `links`. Every mutation ends by
//! recomputing the touched aggregates, so readers never see a stale summary.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::channels::format_channels;
use crate::fixtures::{FixtureRecord, FixtureRepository};
use crate::positions::PositionOrderStore;
use crate::{FixtureId, KernelError, ProductionId, SharedClock, WorkNoteId};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct WorkNoteFixtureLink {
    pub work_note_id: WorkNoteId,
    pub fixture_id: FixtureId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct FixtureAggregate {
    pub work_note_id: WorkNoteId,
    pub channel_expression: String,
    pub positions: Vec<String>,
    pub fixture_types: Vec<String>,
    pub purposes: Vec<String>,
    pub universe_addresses: Vec<String>,
    pub has_inactive: bool,
}

impl FixtureAggregate {
    /// `fixtures` must already be sorted by channel.
    fn summarize(work_note_id: WorkNoteId, fixtures: &[&FixtureRecord]) -> Self {
        let mut positions = OrderedSet::default();
        let mut fixture_types = OrderedSet::default();
        let mut purposes = OrderedSet::default();
        let mut universe_addresses = OrderedSet::default();

        for fixture in fixtures {
            positions.push(&fixture.position);
            fixture_types.push(&fixture.fixture_type);
            purposes.push(&fixture.purpose);
            if let Some(display) = fixture.universe_address() {
                universe_addresses.push(&display);
            }
        }

        Self {
            work_note_id,
            channel_expression: format_channels(fixtures.iter().map(|fixture| fixture.channel)),
            positions: positions.into_vec(),
            fixture_types: fixture_types.into_vec(),
            purposes: purposes.into_vec(),
            universe_addresses: universe_addresses.into_vec(),
            has_inactive: fixtures.iter().any(|fixture| !fixture.is_active),
        }
    }
}

/// Insertion-ordered, de-duplicated, skips blanks.
#[derive(Default)]
struct OrderedSet {
    seen: BTreeSet<String>,
    values: Vec<String>,
}

impl OrderedSet {
    fn push(&mut self, value: &str) {
        let value = value.trim();
        if value.is_empty() || self.seen.contains(value) {
            return;
        }
        self.seen.insert(value.to_string());
        self.values.push(value.to_string());
    }

    fn into_vec(self) -> Vec<String> {
        self.values
    }
}

pub struct LinkIndex {
    links: BTreeMap<WorkNoteId, BTreeMap<FixtureId, OffsetDateTime>>,
    aggregates: BTreeMap<WorkNoteId, FixtureAggregate>,
    clock: SharedClock,
}

impl LinkIndex {
    #[must_use]
    pub fn new(clock: SharedClock) -> Self {
        Self { links: BTreeMap::new(), aggregates: BTreeMap::new(), clock }
    }

    /// Replace the work note's whole link set with `fixture_ids`.
    ///
    /// Links that survive keep their original `created_at`. Duplicate ids
    /// collapse into one link; an empty list unlinks everything.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when any id is not a known fixture;
    /// the existing links are left untouched.
    pub fn link<S: PositionOrderStore>(
        &mut self,
        fixtures: &FixtureRepository<S>,
        work_note_id: WorkNoteId,
        fixture_ids: &[FixtureId],
    ) -> Result<Option<FixtureAggregate>, KernelError> {
        if let Some(unknown) = fixture_ids.iter().find(|id| fixtures.get(**id).is_none()) {
            return Err(KernelError::Validation(format!(
                "cannot link work note {work_note_id} to unknown fixture {unknown}"
            )));
        }

        let previous = self.links.remove(&work_note_id).unwrap_or_default();
        let now = self.clock.now();
        let next = fixture_ids
            .iter()
            .map(|id| (*id, previous.get(id).copied().unwrap_or(now)))
            .collect::<BTreeMap<_, _>>();
        if !next.is_empty() {
            self.links.insert(work_note_id, next);
        }

        Ok(self.recompute(fixtures, work_note_id).cloned())
    }

    /// Remove the given links, or every link of the note when `fixture_ids` is `None`.
    pub fn unlink<S: PositionOrderStore>(
        &mut self,
        fixtures: &FixtureRepository<S>,
        work_note_id: WorkNoteId,
        fixture_ids: Option<&[FixtureId]>,
    ) -> Option<FixtureAggregate> {
        match fixture_ids {
            None => {
                self.links.remove(&work_note_id);
            }
            Some(ids) => {
                if let Some(linked) = self.links.get_mut(&work_note_id) {
                    for id in ids {
                        linked.remove(id);
                    }
                    if linked.is_empty() {
                        self.links.remove(&work_note_id);
                    }
                }
            }
        }

        self.recompute(fixtures, work_note_id).cloned()
    }

    #[must_use]
    pub fn aggregate(&self, work_note_id: WorkNoteId) -> Option<&FixtureAggregate> {
        self.aggregates.get(&work_note_id)
    }

    #[must_use]
    pub fn links_for(&self, work_note_id: WorkNoteId) -> Vec<WorkNoteFixtureLink> {
        self.links
            .get(&work_note_id)
            .map(|linked| {
                linked
                    .iter()
                    .map(|(fixture_id, created_at)| WorkNoteFixtureLink {
                        work_note_id,
                        fixture_id: *fixture_id,
                        created_at: *created_at,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Work notes with at least one link into `production_id`.
    #[must_use]
    pub fn work_notes_for_production<S: PositionOrderStore>(
        &self,
        fixtures: &FixtureRepository<S>,
        production_id: ProductionId,
    ) -> BTreeSet<WorkNoteId> {
        self.links
            .iter()
            .filter(|(_, linked)| {
                linked.keys().any(|id| {
                    fixtures.get(*id).is_some_and(|fixture| fixture.production_id == production_id)
                })
            })
            .map(|(work_note_id, _)| *work_note_id)
            .collect()
    }

    /// Recompute every aggregate touching `production_id`; returns how many.
    pub fn refresh_production<S: PositionOrderStore>(
        &mut self,
        fixtures: &FixtureRepository<S>,
        production_id: ProductionId,
    ) -> usize {
        let affected = self.work_notes_for_production(fixtures, production_id);
        for work_note_id in &affected {
            self.recompute(fixtures, *work_note_id);
        }
        affected.len()
    }

    pub fn clear(&mut self) {
        self.links.clear();
        self.aggregates.clear();
    }

    fn recompute<S: PositionOrderStore>(
        &mut self,
        fixtures: &FixtureRepository<S>,
        work_note_id: WorkNoteId,
    ) -> Option<&FixtureAggregate> {
        let ids = self
            .links
            .get(&work_note_id)
            .map(|linked| linked.keys().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        let mut linked = fixtures.by_ids(&ids);
        if linked.is_empty() {
            self.aggregates.remove(&work_note_id);
            tracing::debug!(work_note_id = %work_note_id, "removed fixture aggregate");
            return None;
        }

        linked.sort_by(|lhs, rhs| lhs.channel.cmp(&rhs.channel).then_with(|| lhs.id.cmp(&rhs.id)));
        let aggregate = FixtureAggregate::summarize(work_note_id, &linked);
        tracing::debug!(
            work_note_id = %work_note_id,
            fixtures = linked.len(),
            channels = %aggregate.channel_expression,
            "recomputed fixture aggregate"
        );
        self.aggregates.insert(work_note_id, aggregate);
        self.aggregates.get(&work_note_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use time::Duration;

    use super::*;
    use crate::config::ReconcileOptions;
    use crate::fixtures::ParsedRow;
    use crate::positions::{InMemoryPositionOrderStore, PositionOrderService};
    use crate::ManualClock;

    struct Harness {
        repo: FixtureRepository<InMemoryPositionOrderStore>,
        links: LinkIndex,
        clock: Arc<ManualClock>,
        production: ProductionId,
    }

    impl Harness {
        fn id(&self, external_id: &str) -> FixtureId {
            match self.repo.by_external_id(self.production, external_id) {
                Some(fixture) => fixture.id,
                None => panic!("missing fixture {external_id}"),
            }
        }

        fn reconcile(&mut self, rows: &[ParsedRow]) {
            let production = self.production;
            self.repo.reconcile(&mut self.links, production, rows, &ReconcileOptions::default());
        }

        fn link(&mut self, work_note_id: WorkNoteId, external_ids: &[&str]) -> Option<FixtureAggregate> {
            let ids = external_ids.iter().map(|external_id| self.id(external_id)).collect::<Vec<_>>();
            match self.links.link(&self.repo, work_note_id, &ids) {
                Ok(aggregate) => aggregate,
                Err(err) => panic!("link should succeed: {err}"),
            }
        }
    }

    fn mk_row(external_id: &str, channel: u32, position: &str, fixture_type: &str) -> ParsedRow {
        ParsedRow {
            external_id: external_id.to_string(),
            channel,
            position: position.to_string(),
            unit_number: "1".to_string(),
            fixture_type: fixture_type.to_string(),
            purpose: "Area wash".to_string(),
            universe: Some(1),
            address: Some(channel * 10),
            raw_universe_address: None,
            position_order_hint: None,
        }
    }

    fn rig() -> Vec<ParsedRow> {
        vec![
            mk_row("A", 12, "2nd Electric", "ETC Lustr"),
            mk_row("B", 3, "1st Electric", "Source Four"),
            mk_row("C", 4, "1st Electric", "Source Four"),
            mk_row("D", 5, "FOH Truss", "Mac Aura"),
            mk_row("E", 1, "FOH Truss", "Source Four"),
        ]
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let positions = PositionOrderService::new(InMemoryPositionOrderStore::new(), clock.clone());
        let mut harness = Harness {
            repo: FixtureRepository::new(positions, clock.clone()),
            links: LinkIndex::new(clock.clone()),
            clock,
            production: ProductionId::new(),
        };
        harness.reconcile(&rig());
        harness
    }

    #[test]
    fn relink_replaces_the_whole_set() {
        let mut h = harness();
        let note = WorkNoteId::new();
        h.link(note, &["A", "B"]);

        let Some(aggregate) = h.link(note, &["B", "C"]) else {
            panic!("aggregate should exist");
        };

        let linked = h.links.links_for(note).iter().map(|link| link.fixture_id).collect::<BTreeSet<_>>();
        assert_eq!(linked, BTreeSet::from([h.id("B"), h.id("C")]));
        assert_eq!(aggregate.channel_expression, "3, 4");
        assert_eq!(aggregate.positions, vec!["1st Electric".to_string()]);
        assert_eq!(h.links.aggregate(note), Some(&aggregate));
    }

    #[test]
    fn aggregate_fields_follow_channel_order() {
        let mut h = harness();
        let note = WorkNoteId::new();

        let Some(aggregate) = h.link(note, &["A", "D", "B", "C", "E"]) else {
            panic!("aggregate should exist");
        };

        assert_eq!(aggregate.channel_expression, "1, 3-5, 12");
        assert_eq!(
            aggregate.positions,
            vec!["FOH Truss".to_string(), "1st Electric".to_string(), "2nd Electric".to_string()]
        );
        assert_eq!(
            aggregate.fixture_types,
            vec!["Source Four".to_string(), "Mac Aura".to_string(), "ETC Lustr".to_string()]
        );
        assert_eq!(aggregate.purposes, vec!["Area wash".to_string()]);
        assert_eq!(aggregate.universe_addresses[0], "1/10");
        assert_eq!(aggregate.universe_addresses.len(), 5);
        assert!(!aggregate.has_inactive);
    }

    #[test]
    fn unlink_all_removes_aggregate() {
        let mut h = harness();
        let note = WorkNoteId::new();
        h.link(note, &["A", "B"]);

        let aggregate = h.links.unlink(&h.repo, note, None);

        assert!(aggregate.is_none());
        assert!(h.links.aggregate(note).is_none());
        assert!(h.links.links_for(note).is_empty());
    }

    #[test]
    fn unlink_subset_keeps_the_rest() {
        let mut h = harness();
        let note = WorkNoteId::new();
        h.link(note, &["A", "B", "C"]);
        let remove = [h.id("A")];

        let aggregate = h.links.unlink(&h.repo, note, Some(&remove));

        assert_eq!(aggregate.map(|aggregate| aggregate.channel_expression), Some("3, 4".to_string()));
    }

    #[test]
    fn unlinking_the_last_subset_removes_aggregate() {
        let mut h = harness();
        let note = WorkNoteId::new();
        h.link(note, &["A"]);
        let remove = [h.id("A")];

        assert!(h.links.unlink(&h.repo, note, Some(&remove)).is_none());
        assert!(h.links.aggregate(note).is_none());
    }

    #[test]
    fn linking_to_empty_list_removes_aggregate() {
        let mut h = harness();
        let note = WorkNoteId::new();
        h.link(note, &["A"]);

        assert!(h.link(note, &[]).is_none());
        assert!(h.links.aggregate(note).is_none());
    }

    #[test]
    fn unknown_fixture_is_rejected_without_side_effects() {
        let mut h = harness();
        let note = WorkNoteId::new();
        h.link(note, &["A"]);

        let ids = [h.id("B"), FixtureId::new()];

        let result = h.links.link(&h.repo, note, &ids);

        assert!(matches!(result, Err(KernelError::Validation(_))));
        assert_eq!(h.links.links_for(note).len(), 1);
        assert_eq!(h.links.aggregate(note).map(|a| a.channel_expression.as_str()), Some("12"));
    }

    #[test]
    fn surviving_links_keep_created_at() {
        let mut h = harness();
        let note = WorkNoteId::new();
        h.link(note, &["A"]);
        h.clock.advance(Duration::hours(1));

        h.link(note, &["A", "B", "B"]);

        let links = h.links.links_for(note);
        assert_eq!(links.len(), 2);
        let created = |id: FixtureId| links.iter().find(|link| link.fixture_id == id).map(|link| link.created_at);
        assert_eq!(created(h.id("A")), Some(OffsetDateTime::UNIX_EPOCH));
        assert_eq!(created(h.id("B")), Some(OffsetDateTime::UNIX_EPOCH + Duration::hours(1)));
    }

    #[test]
    fn reconcile_refreshes_aggregates_for_deactivated_fixtures() {
        let mut h = harness();
        let note = WorkNoteId::new();
        h.link(note, &["A", "B"]);
        assert_eq!(h.links.aggregate(note).map(|a| a.has_inactive), Some(false));

        let rows = rig().into_iter().filter(|row| row.external_id != "A").collect::<Vec<_>>();
        h.reconcile(&rows);

        let Some(aggregate) = h.links.aggregate(note) else {
            panic!("aggregate should survive deactivation");
        };
        assert!(aggregate.has_inactive);
        assert_eq!(aggregate.channel_expression, "3, 12");
    }

    #[test]
    fn reconcile_refreshes_changed_attributes() {
        let mut h = harness();
        let note = WorkNoteId::new();
        h.link(note, &["B"]);
        let mut rows = rig();
        rows[1].position = "Box Boom SR".to_string();
        rows[1].channel = 40;

        h.reconcile(&rows);

        let aggregate = h.links.aggregate(note);
        assert_eq!(aggregate.map(|a| a.channel_expression.as_str()), Some("40"));
        assert_eq!(aggregate.map(|a| a.positions.clone()), Some(vec!["Box Boom SR".to_string()]));
    }

    #[test]
    fn work_notes_for_production_only_lists_linked_notes() {
        let mut h = harness();
        let linked = WorkNoteId::new();
        h.link(linked, &["C"]);

        let affected = h.links.work_notes_for_production(&h.repo, h.production);
        let elsewhere = h.links.work_notes_for_production(&h.repo, ProductionId::new());

        assert_eq!(affected, BTreeSet::from([linked]));
        assert!(elsewhere.is_empty());
    }
}
