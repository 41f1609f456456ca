// 👁️ Layer Visibility Controller - per-category show/hide
//
// Flags start visible the first time a category appears and survive every
// reconcile. Toggling attaches or detaches a whole layer; group membership
// in the snapshot is never touched.

use crate::classifier::CategoryClassifier;
use crate::reconciler::MarkerSetSnapshot;
use crate::surface::MapSurface;
use serde::Serialize;

#[derive(Debug, Clone)]
struct LayerState {
    category: String,
    visible: bool,
}

/// One checkbox row of the layer panel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerControl {
    pub category: String,
    pub count: usize,
    pub visible: bool,
    /// What the checkbox shows: visible and populated
    pub checked: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LayerVisibility {
    layers: Vec<LayerState>,
}

impl LayerVisibility {
    pub fn new() -> Self {
        LayerVisibility::default()
    }

    /// Categories never seen before count as visible
    pub fn is_visible(&self, category: &str) -> bool {
        self.state(category).map_or(true, |state| state.visible)
    }

    pub fn is_known(&self, category: &str) -> bool {
        self.state(category).is_some()
    }

    /// Register categories that appeared since the last sync: configured
    /// labels first (in scan order), then the rest of the snapshot's groups.
    /// Existing flags are left alone.
    pub fn sync(&mut self, snapshot: &MarkerSetSnapshot, classifier: &CategoryClassifier) {
        let configured = classifier
            .category_names()
            .filter(|category| snapshot.group(category).is_some());
        let discovered = snapshot.categories();

        for category in configured.chain(discovered) {
            if !self.is_known(category) {
                self.layers.push(LayerState {
                    category: category.to_string(),
                    visible: true,
                });
            }
        }
    }

    /// Show or hide one category. Returns false for an unknown category.
    pub fn toggle(&mut self, category: &str, visible: bool, surface: &mut dyn MapSurface) -> bool {
        match self.layers.iter_mut().find(|state| state.category == category) {
            Some(state) => {
                state.visible = visible;
                surface.set_layer_attached(category, visible);
                true
            }
            None => false,
        }
    }

    pub fn select_all(&mut self, surface: &mut dyn MapSurface) {
        self.set_all(true, surface);
    }

    pub fn clear_all(&mut self, surface: &mut dyn MapSurface) {
        self.set_all(false, surface);
    }

    fn set_all(&mut self, visible: bool, surface: &mut dyn MapSurface) {
        for state in &mut self.layers {
            state.visible = visible;
            surface.set_layer_attached(&state.category, visible);
        }
    }

    /// Checkbox rows with live counts, in stable order
    pub fn controls(&self, snapshot: &MarkerSetSnapshot) -> Vec<LayerControl> {
        self.layers
            .iter()
            .map(|state| {
                let count = snapshot.count(&state.category);
                LayerControl {
                    category: state.category.clone(),
                    count,
                    visible: state.visible,
                    checked: state.visible && count > 0,
                }
            })
            .collect()
    }

    fn state(&self, category: &str) -> Option<&LayerState> {
        self.layers.iter().find(|state| state.category == category)
    }
}

// ============================================================================
// TESTS
// ============================================================================
