// 🧭 Map Session - everything one logged-in viewer owns
//
// Created on login, closed on logout. The session is the only path to the
// reconciler, the visibility flags and the surface, so layer membership is
// mutated in exactly two places: reconcile and the visibility controls.

use crate::classifier::CategoryClassifier;
use crate::reconciler::{MarkerSetReconciler, MarkerSetSnapshot, ReconcileReport, DEFAULT_PRECISION};
use crate::record::{FirmLocationRecord, LatLng, RawRow};
use crate::source::SourceError;
use crate::status::{LastUpdated, Notice, NoticeBoard, NoticeLevel};
use crate::surface::{MapSurface, MarkerHandle};
use crate::visibility::{LayerControl, LayerVisibility};
use chrono::Utc;
use tracing::{info, warn};

pub const DEFAULT_CENTER: LatLng = LatLng {
    lat: 39.8283,
    lng: -98.5795,
};
pub const DEFAULT_ZOOM: u8 = 4;

const MIN_ZOOM: u8 = 1;
const MAX_ZOOM: u8 = 12;

// ============================================================================
// PASSWORD GATE
// ============================================================================

/// Shared plaintext password compared on the client. Not a security boundary.
#[derive(Debug, Clone)]
pub struct PasswordGate {
    secret: String,
}

impl PasswordGate {
    pub const REJECTED: &'static str = "Incorrect password. Please try again.";

    pub fn new(secret: impl Into<String>) -> Self {
        PasswordGate {
            secret: secret.into(),
        }
    }

    pub fn check(&self, input: &str) -> bool {
        input.trim() == self.secret
    }
}

// ============================================================================
// VIEW STATE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewState {
    pub center: LatLng,
    pub zoom: u8,
    pub fullscreen: bool,
    home_center: LatLng,
    home_zoom: u8,
}

impl ViewState {
    pub fn new(center: LatLng, zoom: u8) -> Self {
        ViewState {
            center,
            zoom,
            fullscreen: false,
            home_center: center,
            home_zoom: zoom,
        }
    }

    /// Longitude span covered at the current zoom
    pub fn span_degrees(&self) -> f64 {
        720.0 / f64::from(1u32 << self.zoom)
    }
}

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub classifier: CategoryClassifier,
    pub precision: u32,
    pub center: LatLng,
    pub zoom: u8,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            classifier: CategoryClassifier::with_defaults(),
            precision: DEFAULT_PRECISION,
            center: DEFAULT_CENTER,
            zoom: DEFAULT_ZOOM,
        }
    }
}

// ============================================================================
// MAP SESSION
// ============================================================================

pub struct MapSession<M: MapSurface> {
    reconciler: MarkerSetReconciler,
    visibility: LayerVisibility,
    surface: M,
    view: ViewState,
    notices: NoticeBoard,
    last_updated: LastUpdated,
    selected: Option<MarkerHandle>,
    closed: bool,
}

impl<M: MapSurface> MapSession<M> {
    /// Start a session: layers for every configured category, default view
    pub fn open(settings: SessionSettings, mut surface: M) -> Self {
        let mut reconciler = MarkerSetReconciler::with_precision(settings.classifier, settings.precision);
        let mut visibility = LayerVisibility::new();

        reconciler.seed_groups(&mut surface, &visibility);
        visibility.sync(reconciler.snapshot(), reconciler.classifier());
        surface.set_view(settings.center, settings.zoom);

        info!(categories = reconciler.classifier().label_count(), "map session opened");

        MapSession {
            reconciler,
            visibility,
            surface,
            view: ViewState::new(settings.center, settings.zoom),
            notices: NoticeBoard::new(),
            last_updated: LastUpdated::Loading,
            selected: None,
            closed: false,
        }
    }

    // ------------------------------------------------------------------------
    // Reconcile
    // ------------------------------------------------------------------------

    /// Reconcile a freshly fetched row set and refresh the layer panel
    pub fn apply_rows(&mut self, rows: &[RawRow]) -> ReconcileReport {
        let report = self.reconciler.reconcile(rows, &mut self.surface, &self.visibility);
        self.visibility.sync(self.reconciler.snapshot(), self.reconciler.classifier());

        if let Some(handle) = self.selected {
            if self.reconciler.snapshot().record_for_handle(handle).is_none() {
                self.selected = None;
            }
        }

        let now = Utc::now();
        if self.reconciler.snapshot().is_empty() {
            // Usually a misconfigured table or view, not an error
            self.notices.post(NoticeLevel::Info, "No firm locations found.", now);
        } else if !report.initial && report.added > 0 {
            self.notices.post(
                NoticeLevel::Success,
                format!("Added {} new firm(s) to the map!", report.added),
                now,
            );
        }

        report
    }

    /// A failed fetch keeps every marker and tells the user
    pub fn record_fetch_failure(&mut self, error: &SourceError) {
        warn!(%error, "firm data refresh failed, keeping current markers");
        self.notices.post(
            NoticeLevel::Error,
            "Failed to refresh firm data. Showing the last loaded locations.",
            Utc::now(),
        );
    }

    pub fn set_last_updated(&mut self, last_updated: LastUpdated) {
        self.last_updated = last_updated;
    }

    // ------------------------------------------------------------------------
    // Layer controls
    // ------------------------------------------------------------------------

    pub fn toggle_layer(&mut self, category: &str, visible: bool) -> bool {
        self.visibility.toggle(category, visible, &mut self.surface)
    }

    pub fn select_all_layers(&mut self) {
        self.visibility.select_all(&mut self.surface);
    }

    pub fn clear_all_layers(&mut self) {
        self.visibility.clear_all(&mut self.surface);
    }

    pub fn layer_controls(&self) -> Vec<LayerControl> {
        self.visibility.controls(self.reconciler.snapshot())
    }

    pub fn is_layer_visible(&self, category: &str) -> bool {
        self.visibility.is_visible(category)
    }

    // ------------------------------------------------------------------------
    // View
    // ------------------------------------------------------------------------

    pub fn reset_view(&mut self) {
        self.view.center = self.view.home_center;
        self.view.zoom = self.view.home_zoom;
        self.surface.set_view(self.view.center, self.view.zoom);
    }

    /// Pan by a fraction of the visible span
    pub fn pan(&mut self, lat_steps: f64, lng_steps: f64) {
        let step = self.view.span_degrees() / 8.0;
        self.view.center.lat = (self.view.center.lat + lat_steps * step).clamp(-85.0, 85.0);
        self.view.center.lng = (self.view.center.lng + lng_steps * step).clamp(-180.0, 180.0);
        self.surface.set_view(self.view.center, self.view.zoom);
    }

    pub fn zoom_in(&mut self) {
        self.view.zoom = (self.view.zoom + 1).min(MAX_ZOOM);
        self.surface.set_view(self.view.center, self.view.zoom);
    }

    pub fn zoom_out(&mut self) {
        self.view.zoom = self.view.zoom.saturating_sub(1).max(MIN_ZOOM);
        self.surface.set_view(self.view.center, self.view.zoom);
    }

    pub fn toggle_fullscreen(&mut self) {
        self.view.fullscreen = !self.view.fullscreen;
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    // ------------------------------------------------------------------------
    // Selection (marker click)
    // ------------------------------------------------------------------------

    pub fn select_marker(&mut self, handle: MarkerHandle) -> Option<&FirmLocationRecord> {
        let record = self.reconciler.snapshot().record_for_handle(handle)?;
        self.selected = Some(handle);
        Some(record)
    }

    pub fn selected(&self) -> Option<MarkerHandle> {
        self.selected
    }

    pub fn selected_record(&self) -> Option<&FirmLocationRecord> {
        self.selected
            .and_then(|handle| self.reconciler.snapshot().record_for_handle(handle))
    }

    // ------------------------------------------------------------------------
    // Read access
    // ------------------------------------------------------------------------

    pub fn snapshot(&self) -> &MarkerSetSnapshot {
        self.reconciler.snapshot()
    }

    pub fn classifier(&self) -> &CategoryClassifier {
        self.reconciler.classifier()
    }

    pub fn surface(&self) -> &M {
        &self.surface
    }

    pub fn last_updated(&self) -> LastUpdated {
        self.last_updated
    }

    pub fn active_notices(&self) -> Vec<Notice> {
        self.notices.active(Utc::now()).into_iter().cloned().collect()
    }

    pub fn prune_notices(&mut self) {
        self.notices.prune(Utc::now());
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Release every marker; later reconciles are refused
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.reconciler.teardown(&mut self.surface);
        self.notices.clear();
        self.selected = None;
        self.closed = true;
        info!("map session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::LayerTree;
    use serde_json::json;

    fn firm(name: &str, lat: f64, lng: f64) -> RawRow {
        match json!({"firm": name, "latitude": lat, "longitude": lng}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn session() -> MapSession<LayerTree> {
        MapSession::open(SessionSettings::default(), LayerTree::new())
    }

    #[test]
    fn test_password_gate() {
        let gate = PasswordGate::new("CAImap2025");

        assert!(gate.check("CAImap2025"));
        assert!(gate.check("  CAImap2025\n"));
        assert!(!gate.check("caimap2025"));
        assert!(!gate.check(""));
    }

    #[test]
    fn test_open_seeds_layers_and_view() {
        let session = session();

        assert_eq!(session.layer_controls().len(), 10);
        assert_eq!(session.surface().view(), Some((DEFAULT_CENTER, DEFAULT_ZOOM)));
        assert_eq!(session.last_updated(), LastUpdated::Loading);
    }

    #[test]
    fn test_new_firms_notice_only_after_first_load() {
        let mut session = session();

        session.apply_rows(&[firm("Bain & Co", 42.36, -71.06)]);
        assert!(session.active_notices().is_empty());

        session.apply_rows(&[firm("Bain & Co", 42.36, -71.06), firm("BCG", 41.88, -87.63)]);
        let notices = session.active_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Success);
        assert_eq!(notices[0].message, "Added 1 new firm(s) to the map!");
    }

    #[test]
    fn test_empty_fetch_is_informational() {
        let mut session = session();

        let report = session.apply_rows(&[]);

        assert_eq!(report.total, 0);
        let notices = session.active_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].level, NoticeLevel::Info);
    }

    #[test]
    fn test_fetch_failure_keeps_markers() {
        let mut session = session();
        session.apply_rows(&[firm("Bain & Co", 42.36, -71.06)]);

        session.record_fetch_failure(&SourceError::Transport("connection reset".to_string()));

        assert_eq!(session.snapshot().len(), 1);
        assert_eq!(session.surface().marker_count(), 1);
        assert_eq!(session.active_notices()[0].level, NoticeLevel::Error);
    }

    #[test]
    fn test_selection_cleared_when_marker_removed() {
        let mut session = session();
        session.apply_rows(&[firm("Bain & Co", 42.36, -71.06)]);
        let handle = session.surface().visible_markers()[0].handle;

        assert_eq!(session.select_marker(handle).map(|r| r.name.as_str()), Some("Bain & Co"));

        session.apply_rows(&[firm("BCG", 41.88, -87.63)]);
        assert!(session.selected_record().is_none());
    }

    #[test]
    fn test_view_controls() {
        let mut session = session();

        session.zoom_in();
        session.pan(1.0, 1.0);
        assert_eq!(session.view().zoom, DEFAULT_ZOOM + 1);
        assert_ne!(session.view().center, DEFAULT_CENTER);

        session.reset_view();
        assert_eq!(session.view().center, DEFAULT_CENTER);
        assert_eq!(session.view().zoom, DEFAULT_ZOOM);

        session.toggle_fullscreen();
        assert!(session.view().fullscreen);
    }

    #[test]
    fn test_close_releases_markers() {
        let mut session = session();
        session.apply_rows(&[firm("Bain & Co", 42.36, -71.06), firm("BCG", 41.88, -87.63)]);

        session.close();

        assert!(session.is_closed());
        assert_eq!(session.surface().marker_count(), 0);
        assert!(session.snapshot().is_empty());
    }
}
