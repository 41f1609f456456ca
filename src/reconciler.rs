// ⚖️ Marker Set Reconciler - keep rendered markers in sync with the backend
//
// Every pull is diffed against the snapshot by record identity:
//   new identity      → add    (create marker)
//   known identity    → keep   (no recreation; move/refresh in place)
//   missing identity  → remove (destroy marker)
//
// The snapshot and every marker handle are owned here. Nothing else adds or
// removes markers.

use crate::classifier::CategoryClassifier;
use crate::normalizer::Normalizer;
use crate::record::{fingerprint, FirmLocationRecord, RawRow, RecordIdentity};
use crate::surface::{MapSurface, MarkerHandle, MarkerSpec, MarkerStyle, Popup};
use crate::visibility::LayerVisibility;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

/// Decimal degrees kept when comparing coordinates across pulls
pub const DEFAULT_PRECISION: u32 = 4;

/// Finest rounding that still fits degrees * 10^p in an i64 without saturating
pub const MAX_PRECISION: u32 = 9;

// ============================================================================
// SNAPSHOT
// ============================================================================

#[derive(Debug, Clone)]
pub struct PlacedRecord {
    pub record: FirmLocationRecord,
    pub handle: MarkerHandle,
}

/// A named, toggleable collection of markers sharing a classification label
#[derive(Debug, Clone, Default)]
pub struct CategoryGroup {
    pub name: String,
    members: BTreeSet<RecordIdentity>,
}

impl CategoryGroup {
    fn new(name: &str) -> Self {
        CategoryGroup {
            name: name.to_string(),
            members: BTreeSet::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = &RecordIdentity> {
        self.members.iter()
    }
}

/// Authoritative state: identity → placed record, plus category groups.
/// Groups outlive their members so category toggles stay stable.
#[derive(Debug, Default)]
pub struct MarkerSetSnapshot {
    entries: HashMap<RecordIdentity, PlacedRecord>,
    groups: BTreeMap<String, CategoryGroup>,
}

impl MarkerSetSnapshot {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, identity: &RecordIdentity) -> Option<&PlacedRecord> {
        self.entries.get(identity)
    }

    pub fn handle_for(&self, identity: &RecordIdentity) -> Option<MarkerHandle> {
        self.entries.get(identity).map(|placed| placed.handle)
    }

    pub fn record_for_handle(&self, handle: MarkerHandle) -> Option<&FirmLocationRecord> {
        self.entries
            .values()
            .find(|placed| placed.handle == handle)
            .map(|placed| &placed.record)
    }

    pub fn group(&self, category: &str) -> Option<&CategoryGroup> {
        self.groups.get(category)
    }

    pub fn count(&self, category: &str) -> usize {
        self.groups.get(category).map_or(0, CategoryGroup::len)
    }

    /// Category names, including empty groups
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = &FirmLocationRecord> {
        self.entries.values().map(|placed| &placed.record)
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(self.entries.keys())
    }

    fn ensure_group(&mut self, category: &str) -> &mut CategoryGroup {
        self.groups
            .entry(category.to_string())
            .or_insert_with(|| CategoryGroup::new(category))
    }
}

// ============================================================================
// PREPARED BATCH
// ============================================================================

#[derive(Debug, Clone)]
pub struct PreparedRecord {
    pub identity: RecordIdentity,
    pub record: FirmLocationRecord,
    /// False when the id was generated because the row had none
    pub upstream_id: bool,
}

/// Valid, classified, de-duplicated records of one pull, in input order
#[derive(Debug, Clone, Default)]
pub struct PreparedBatch {
    pub records: Vec<PreparedRecord>,
    pub rejected: usize,
    pub duplicates: usize,
}

// ============================================================================
// RECONCILE REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Rows received from the backend
    pub total: usize,
    pub added: usize,
    pub kept: usize,
    /// Kept records whose category changed
    pub moved: usize,
    /// Kept records whose popup content changed
    pub refreshed: usize,
    pub removed: usize,
    pub rejected: usize,
    pub duplicates: usize,
    /// True for the first reconcile of a session
    pub initial: bool,
}

impl ReconcileReport {
    /// No marker was created, destroyed or moved
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.moved == 0
    }

    pub fn summary(&self) -> String {
        format!(
            "{} rows: +{} added, {} kept ({} moved, {} refreshed), -{} removed, {} rejected, {} duplicates",
            self.total,
            self.added,
            self.kept,
            self.moved,
            self.refreshed,
            self.removed,
            self.rejected,
            self.duplicates
        )
    }
}

// ============================================================================
// RECONCILER
// ============================================================================

pub struct MarkerSetReconciler {
    normalizer: Normalizer,
    classifier: CategoryClassifier,
    precision: u32,
    snapshot: MarkerSetSnapshot,
    loaded: bool,
}

impl MarkerSetReconciler {
    pub fn new(classifier: CategoryClassifier) -> Self {
        Self::with_precision(classifier, DEFAULT_PRECISION)
    }

    pub fn with_precision(classifier: CategoryClassifier, precision: u32) -> Self {
        MarkerSetReconciler {
            normalizer: Normalizer::new(),
            classifier,
            precision,
            snapshot: MarkerSetSnapshot::default(),
            loaded: false,
        }
    }

    pub fn snapshot(&self) -> &MarkerSetSnapshot {
        &self.snapshot
    }

    pub fn classifier(&self) -> &CategoryClassifier {
        &self.classifier
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    /// Create an (empty) group and layer for every configured label
    pub fn seed_groups(&mut self, surface: &mut dyn MapSurface, visibility: &LayerVisibility) {
        for category in self.classifier.category_names() {
            self.snapshot.ensure_group(category);
            surface.ensure_layer(category, visibility.is_visible(category));
        }
    }

    /// Normalize, classify and de-duplicate raw rows. Invalid rows are
    /// dropped and logged; the first occurrence of an identity wins.
    pub fn prepare(&self, rows: &[RawRow]) -> PreparedBatch {
        let mut batch = PreparedBatch::default();
        let mut seen = HashSet::new();

        for (index, row) in rows.iter().enumerate() {
            let firm = match self.normalizer.normalize(row) {
                Ok(firm) => firm,
                Err(rejection) => {
                    debug!(row = index, %rejection, "dropping malformed row");
                    batch.rejected += 1;
                    continue;
                }
            };

            let category = self.classifier.classify(&firm.name).to_string();
            let upstream_id = firm.id.is_some();
            let record = FirmLocationRecord {
                id: firm
                    .id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                name: firm.name,
                position: firm.position,
                category,
                details: firm.details,
            };
            let identity = record.identity(self.precision);

            if !seen.insert(identity.clone()) {
                debug!(row = index, %identity, "dropping duplicate row");
                batch.duplicates += 1;
                continue;
            }

            batch.records.push(PreparedRecord {
                identity,
                record,
                upstream_id,
            });
        }

        if batch.rejected > 0 {
            warn!(
                rejected = batch.rejected,
                total = rows.len(),
                "skipped malformed firm rows"
            );
        }

        batch
    }

    /// Bring the rendered marker set in line with `rows`.
    ///
    /// Safe to call repeatedly; an identical row set produces no marker
    /// churn. Markers for categories hidden in `visibility` are created in
    /// their (detached) layer and stay hidden.
    pub fn reconcile(
        &mut self,
        rows: &[RawRow],
        surface: &mut dyn MapSurface,
        visibility: &LayerVisibility,
    ) -> ReconcileReport {
        let batch = self.prepare(rows);
        let mut report = ReconcileReport {
            total: rows.len(),
            rejected: batch.rejected,
            duplicates: batch.duplicates,
            initial: !self.loaded,
            ..Default::default()
        };

        let Self {
            snapshot,
            classifier,
            ..
        } = self;

        // Removals first so a vanished office never lingers next to its successor
        let incoming: HashSet<&RecordIdentity> =
            batch.records.iter().map(|prepared| &prepared.identity).collect();
        let stale: Vec<RecordIdentity> = snapshot
            .entries
            .keys()
            .filter(|identity| !incoming.contains(identity))
            .cloned()
            .collect();

        for identity in stale {
            if let Some(placed) = snapshot.entries.remove(&identity) {
                surface.remove_marker(placed.handle);
                if let Some(group) = snapshot.groups.get_mut(&placed.record.category) {
                    group.members.remove(&identity);
                }
                report.removed += 1;
            }
        }

        for prepared in batch.records {
            let PreparedRecord {
                identity,
                mut record,
                upstream_id,
            } = prepared;

            if let Some(placed) = snapshot.entries.get_mut(&identity) {
                report.kept += 1;

                if !upstream_id {
                    record.id = placed.record.id.clone();
                }

                if placed.record.category != record.category {
                    surface.ensure_layer(&record.category, visibility.is_visible(&record.category));
                    surface.move_marker(placed.handle, &record.category, style_for(classifier, &record.category));

                    if let Some(old) = snapshot.groups.get_mut(&placed.record.category) {
                        old.members.remove(&identity);
                    }
                    snapshot
                        .groups
                        .entry(record.category.clone())
                        .or_insert_with(|| CategoryGroup::new(&record.category))
                        .members
                        .insert(identity.clone());
                    report.moved += 1;
                }

                let popup = Popup::for_record(&record);
                if popup != Popup::for_record(&placed.record) {
                    surface.set_popup(placed.handle, popup);
                    report.refreshed += 1;
                }

                placed.record = record;
                continue;
            }

            surface.ensure_layer(&record.category, visibility.is_visible(&record.category));
            let handle = surface.add_marker(
                &record.category,
                MarkerSpec {
                    position: record.position,
                    style: style_for(classifier, &record.category),
                    popup: Popup::for_record(&record),
                },
            );

            snapshot
                .ensure_group(&record.category)
                .members
                .insert(identity.clone());
            snapshot.entries.insert(identity, PlacedRecord { record, handle });
            report.added += 1;
        }

        self.loaded = true;

        let digest = self.snapshot.fingerprint();
        info!(
            added = report.added,
            kept = report.kept,
            moved = report.moved,
            removed = report.removed,
            rejected = report.rejected,
            markers = self.snapshot.len(),
            fingerprint = &digest[..12],
            "reconciled firm markers"
        );

        report
    }

    /// Release every marker. Used when the session ends.
    pub fn teardown(&mut self, surface: &mut dyn MapSurface) {
        for placed in self.snapshot.entries.values() {
            surface.remove_marker(placed.handle);
        }
        let released = self.snapshot.entries.len();
        self.snapshot = MarkerSetSnapshot::default();
        self.loaded = false;
        info!(released, "released all firm markers");
    }
}

fn style_for(classifier: &CategoryClassifier, category: &str) -> MarkerStyle {
    MarkerStyle {
        color: classifier.color_for(category).to_string(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
