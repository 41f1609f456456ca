// 🏷️ Category Classifier - Labels as Data
// Ordered, case-insensitive substring match of firm names against category labels

use crate::record::OTHER_CATEGORY;
use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Marker colour for `Other` and for any category without a configured colour
pub const DEFAULT_COLOR: &str = "#6c757d";

// ============================================================================
// LABEL DEFINITION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryLabel {
    /// Label matched against firm names; also the category name
    pub name: String,

    /// Marker colour (hex)
    #[serde(default = "default_color")]
    pub color: String,
}

fn default_color() -> String {
    DEFAULT_COLOR.to_string()
}

impl CategoryLabel {
    pub fn new(name: impl Into<String>, color: impl Into<String>) -> Self {
        CategoryLabel {
            name: name.into(),
            color: color.into(),
        }
    }

    /// Case-insensitive substring match
    pub fn matches(&self, firm_name: &str) -> bool {
        firm_name.to_lowercase().contains(&self.name.to_lowercase())
    }
}

// ============================================================================
// CLASSIFIER
// ============================================================================

/// Classifies firm names into categories.
///
/// Labels are scanned in configured order and the FIRST match wins, not the
/// longest: some labels are substrings of plausible variants of others, and
/// a fixed scan order keeps results stable across runs.
#[derive(Debug, Clone)]
pub struct CategoryClassifier {
    labels: Vec<CategoryLabel>,
}

impl CategoryClassifier {
    pub fn new(labels: Vec<CategoryLabel>) -> Self {
        CategoryClassifier { labels }
    }

    /// The consulting firms the map has always tracked
    pub fn with_defaults() -> Self {
        CategoryClassifier::new(vec![
            CategoryLabel::new("Bain", "#1f4e79"),
            CategoryLabel::new("BCG", "#00a0dc"),
            CategoryLabel::new("McKinsey", "#1f4e79"),
            CategoryLabel::new("Strategy&", "#dc3545"),
            CategoryLabel::new("PwC", "#ffc107"),
            CategoryLabel::new("LEK", "#28a745"),
            CategoryLabel::new("Oliver Wyman", "#6f42c1"),
            CategoryLabel::new("EY-Parthenon", "#fd7e14"),
            CategoryLabel::new("Deloitte", "#0073aa"),
            CategoryLabel::new("Kearney", "#e83e8c"),
        ])
    }

    /// Load labels from a JSON file: `[{"name": "Bain", "color": "#1f4e79"}, ...]`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read categories file: {:?}", path.as_ref()))?;

        let labels: Vec<CategoryLabel> =
            serde_json::from_str(&content).context("Failed to parse categories JSON")?;

        Ok(CategoryClassifier::new(labels))
    }

    /// First label (in list order) contained in the firm name, else `Other`
    pub fn classify(&self, firm_name: &str) -> &str {
        self.labels
            .iter()
            .find(|label| label.matches(firm_name))
            .map(|label| label.name.as_str())
            .unwrap_or(OTHER_CATEGORY)
    }

    pub fn color_for(&self, category: &str) -> &str {
        self.labels
            .iter()
            .find(|label| label.name == category)
            .map(|label| label.color.as_str())
            .unwrap_or(DEFAULT_COLOR)
    }

    /// Configured label names, in scan order
    pub fn category_names(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|label| label.name.as_str())
    }

    pub fn label_count(&self) -> usize {
        self.labels.len()
    }
}

impl Default for CategoryClassifier {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// TESTS
// ============================================================================
