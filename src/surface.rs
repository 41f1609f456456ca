// 🗺️ Map Surface - the rendering target markers and layers are applied to
//
// `MapSurface` is the seam between the reconciler and whatever draws the
// map. `LayerTree` is the in-memory implementation behind the terminal
// viewer and the API server: layers of markers, each layer attached to or
// detached from the visible map.

use crate::record::{FirmLocationRecord, LatLng};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

// ============================================================================
// MARKERS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MarkerHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerStyle {
    pub color: String,
}

/// Popup content bound to a marker, built from the record's current fields
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Popup {
    pub title: String,
    pub lines: Vec<(String, String)>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

impl Popup {
    pub fn for_record(record: &FirmLocationRecord) -> Self {
        let details = &record.details;
        Popup {
            title: record.name.clone(),
            lines: vec![
                ("Firm".to_string(), record.name.clone()),
                ("Location".to_string(), record.location_label().to_string()),
                ("Employees".to_string(), details.employees.clone().unwrap_or_default()),
                ("Founded".to_string(), details.founded.clone().unwrap_or_default()),
            ],
            description: record.description_label().to_string(),
            website: details.website.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkerSpec {
    pub position: LatLng,
    pub style: MarkerStyle,
    pub popup: Popup,
}

// ============================================================================
// SURFACE TRAIT
// ============================================================================

/// Outbound rendering target.
///
/// Only the reconciler and the visibility controller call the mutating
/// methods; everything else reads.
pub trait MapSurface: Send {
    /// Create the layer if missing. An existing layer keeps its attach state.
    fn ensure_layer(&mut self, category: &str, attached: bool);

    fn set_layer_attached(&mut self, category: &str, attached: bool);

    fn add_marker(&mut self, category: &str, spec: MarkerSpec) -> MarkerHandle;

    /// Move a live marker into another layer without recreating it
    fn move_marker(&mut self, handle: MarkerHandle, category: &str, style: MarkerStyle);

    fn set_popup(&mut self, handle: MarkerHandle, popup: Popup);

    fn remove_marker(&mut self, handle: MarkerHandle);

    fn set_view(&mut self, center: LatLng, zoom: u8);
}

// ============================================================================
// LAYER TREE
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PlacedMarker {
    pub handle: MarkerHandle,
    pub category: String,
    pub spec: MarkerSpec,
}

#[derive(Debug, Clone, Default)]
struct Layer {
    attached: bool,
    markers: BTreeSet<MarkerHandle>,
}

/// Counters of surface operations, handy for spotting marker churn
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SurfaceStats {
    pub created: u64,
    pub destroyed: u64,
    pub moved: u64,
}

#[derive(Debug, Default)]
pub struct LayerTree {
    layers: BTreeMap<String, Layer>,
    markers: HashMap<MarkerHandle, PlacedMarker>,
    next_handle: u64,
    view: Option<(LatLng, u8)>,
    stats: SurfaceStats,
}

impl LayerTree {
    pub fn new() -> Self {
        LayerTree::default()
    }

    pub fn marker(&self, handle: MarkerHandle) -> Option<&PlacedMarker> {
        self.markers.get(&handle)
    }

    pub fn is_attached(&self, category: &str) -> bool {
        self.layers.get(category).map_or(false, |layer| layer.attached)
    }

    pub fn has_layer(&self, category: &str) -> bool {
        self.layers.contains_key(category)
    }

    pub fn layer_size(&self, category: &str) -> usize {
        self.layers.get(category).map_or(0, |layer| layer.markers.len())
    }

    /// Markers in attached layers, ordered by handle
    pub fn visible_markers(&self) -> Vec<&PlacedMarker> {
        let mut visible: Vec<&PlacedMarker> = self
            .layers
            .values()
            .filter(|layer| layer.attached)
            .flat_map(|layer| layer.markers.iter())
            .filter_map(|handle| self.markers.get(handle))
            .collect();
        visible.sort_by_key(|marker| marker.handle);
        visible
    }

    pub fn marker_count(&self) -> usize {
        self.markers.len()
    }

    pub fn view(&self) -> Option<(LatLng, u8)> {
        self.view
    }

    pub fn stats(&self) -> SurfaceStats {
        self.stats
    }
}

impl MapSurface for LayerTree {
    fn ensure_layer(&mut self, category: &str, attached: bool) {
        self.layers
            .entry(category.to_string())
            .or_insert_with(|| Layer {
                attached,
                markers: BTreeSet::new(),
            });
    }

    fn set_layer_attached(&mut self, category: &str, attached: bool) {
        if let Some(layer) = self.layers.get_mut(category) {
            layer.attached = attached;
        }
    }

    fn add_marker(&mut self, category: &str, spec: MarkerSpec) -> MarkerHandle {
        self.next_handle += 1;
        let handle = MarkerHandle(self.next_handle);

        self.ensure_layer(category, true);
        if let Some(layer) = self.layers.get_mut(category) {
            layer.markers.insert(handle);
        }
        self.markers.insert(
            handle,
            PlacedMarker {
                handle,
                category: category.to_string(),
                spec,
            },
        );
        self.stats.created += 1;
        handle
    }

    fn move_marker(&mut self, handle: MarkerHandle, category: &str, style: MarkerStyle) {
        let Some(marker) = self.markers.get_mut(&handle) else {
            return;
        };

        if let Some(old) = self.layers.get_mut(&marker.category) {
            old.markers.remove(&handle);
        }
        marker.category = category.to_string();
        marker.spec.style = style;

        self.layers
            .entry(category.to_string())
            .or_insert_with(|| Layer {
                attached: true,
                markers: BTreeSet::new(),
            })
            .markers
            .insert(handle);
        self.stats.moved += 1;
    }

    fn set_popup(&mut self, handle: MarkerHandle, popup: Popup) {
        if let Some(marker) = self.markers.get_mut(&handle) {
            marker.spec.popup = popup;
        }
    }

    fn remove_marker(&mut self, handle: MarkerHandle) {
        if let Some(marker) = self.markers.remove(&handle) {
            if let Some(layer) = self.layers.get_mut(&marker.category) {
                layer.markers.remove(&handle);
            }
            self.stats.destroyed += 1;
        }
    }

    fn set_view(&mut self, center: LatLng, zoom: u8) {
        self.view = Some((center, zoom));
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(lat: f64, lng: f64) -> MarkerSpec {
        MarkerSpec {
            position: LatLng::new(lat, lng),
            style: MarkerStyle { color: "#1f4e79".to_string() },
            popup: Popup {
                title: "Bain".to_string(),
                lines: vec![],
                description: "Consulting firm".to_string(),
                website: None,
            },
        }
    }

    #[test]
    fn test_detached_layer_hides_markers() {
        let mut tree = LayerTree::new();
        tree.ensure_layer("Bain", false);
        let handle = tree.add_marker("Bain", spec(42.36, -71.06));

        assert!(tree.marker(handle).is_some());
        assert!(tree.visible_markers().is_empty());

        tree.set_layer_attached("Bain", true);
        assert_eq!(tree.visible_markers().len(), 1);
    }

    #[test]
    fn test_ensure_layer_keeps_attach_state() {
        let mut tree = LayerTree::new();
        tree.ensure_layer("BCG", false);
        tree.ensure_layer("BCG", true);

        assert!(!tree.is_attached("BCG"));
    }

    #[test]
    fn test_move_marker_keeps_handle() {
        let mut tree = LayerTree::new();
        tree.ensure_layer("Bain", true);
        let handle = tree.add_marker("Bain", spec(42.36, -71.06));

        tree.move_marker(handle, "Other", MarkerStyle { color: "#6c757d".to_string() });

        let marker = tree.marker(handle).unwrap();
        assert_eq!(marker.category, "Other");
        assert_eq!(marker.spec.style.color, "#6c757d");
        assert_eq!(tree.layer_size("Bain"), 0);
        assert_eq!(tree.layer_size("Other"), 1);
        assert_eq!(tree.stats(), SurfaceStats { created: 1, destroyed: 0, moved: 1 });
    }

    #[test]
    fn test_remove_marker() {
        let mut tree = LayerTree::new();
        let handle = tree.add_marker("Bain", spec(42.36, -71.06));

        tree.remove_marker(handle);
        tree.remove_marker(handle);

        assert_eq!(tree.marker_count(), 0);
        assert_eq!(tree.stats().destroyed, 1);
        assert!(tree.has_layer("Bain"));
    }
}
