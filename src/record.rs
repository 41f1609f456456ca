// 📍 Firm Location Records - canonical record, identity, display fields
//
// A record's IDENTITY is its firm name plus rounded coordinates. The
// upstream id is carried for display and API use only: it changes across
// schema revisions, so it can't match records between pulls.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One raw backend row, column names as they came from upstream
pub type RawRow = serde_json::Map<String, serde_json::Value>;

/// Category assigned when no configured label matches
pub const OTHER_CATEGORY: &str = "Other";

// ============================================================================
// COORDINATES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub fn new(lat: f64, lng: f64) -> Self {
        LatLng { lat, lng }
    }
}

// ============================================================================
// FIRM LOCATION RECORD
// ============================================================================

/// Optional display fields shown in popups and the details pane
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirmDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employees: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub founded: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// A normalized, classified firm office
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirmLocationRecord {
    /// Upstream id, or a generated UUID when the row had none
    pub id: String,

    /// Firm name (trimmed, never empty)
    pub name: String,

    /// Finite, non-zero, in-range coordinates
    pub position: LatLng,

    /// Derived on every pull, never stored upstream
    pub category: String,

    #[serde(default)]
    pub details: FirmDetails,
}

impl FirmLocationRecord {
    /// Stable key used to match this record across pulls
    pub fn identity(&self, precision: u32) -> RecordIdentity {
        RecordIdentity::new(&self.name, self.position, precision)
    }

    /// Location line with the fallback the viewer has always shown
    pub fn location_label(&self) -> &str {
        self.details
            .location
            .as_deref()
            .unwrap_or("Location not specified")
    }

    pub fn description_label(&self) -> &str {
        self.details
            .description
            .as_deref()
            .unwrap_or("Consulting firm")
    }
}

// ============================================================================
// RECORD IDENTITY
// ============================================================================

/// Firm name + coordinates rounded to a fixed number of decimal degrees.
///
/// Rounding absorbs the float noise rows pick up on repeated round-trips
/// through the backend, so `42.36000000001` and `42.36` are the same office.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordIdentity {
    pub name: String,
    pub lat_units: i64,
    pub lng_units: i64,
}

impl RecordIdentity {
    pub fn new(name: &str, position: LatLng, precision: u32) -> Self {
        let scale = 10f64.powi(precision.min(crate::reconciler::MAX_PRECISION) as i32);
        RecordIdentity {
            name: name.to_string(),
            lat_units: (position.lat * scale).round() as i64,
            lng_units: (position.lng * scale).round() as i64,
        }
    }
}

impl std::fmt::Display for RecordIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{},{}", self.name, self.lat_units, self.lng_units)
    }
}

/// SHA-256 over sorted identities; equal fingerprints mean equal marker sets
pub fn fingerprint<'a, I>(identities: I) -> String
where
    I: IntoIterator<Item = &'a RecordIdentity>,
{
    let mut keys: Vec<String> = identities.into_iter().map(|id| id.to_string()).collect();
    keys.sort();

    let mut hasher = Sha256::new();
    for key in &keys {
        hasher.update(key.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_absorbs_float_noise() {
        let a = RecordIdentity::new("Bain & Co", LatLng::new(42.36, -71.06), 4);
        let b = RecordIdentity::new("Bain & Co", LatLng::new(42.360000000001, -71.0599999999), 4);

        assert_eq!(a, b);
        assert_eq!(a.lat_units, 423600);
        assert_eq!(a.lng_units, -710600);
    }

    #[test]
    fn test_identity_distinguishes_offices() {
        let boston = RecordIdentity::new("Bain & Co", LatLng::new(42.36, -71.06), 4);
        let chicago = RecordIdentity::new("Bain & Co", LatLng::new(41.88, -87.63), 4);

        assert_ne!(boston, chicago);
    }

    #[test]
    fn test_oversized_precision_keeps_offices_apart() {
        let boston = RecordIdentity::new("Bain & Co", LatLng::new(42.36, -71.06), u32::MAX);
        let chicago = RecordIdentity::new("Bain & Co", LatLng::new(41.88, -87.63), u32::MAX);

        assert_ne!(boston, chicago);
        assert_eq!(boston.lat_units, 42_360_000_000);
    }

    #[test]
    fn test_fingerprint_is_order_independent() {
        let a = RecordIdentity::new("A", LatLng::new(1.0, 1.0), 4);
        let b = RecordIdentity::new("B", LatLng::new(2.0, 2.0), 4);

        assert_eq!(fingerprint([&a, &b]), fingerprint([&b, &a]));
        assert_ne!(fingerprint([&a]), fingerprint([&a, &b]));
    }

    #[test]
    fn test_display_fallbacks() {
        let record = FirmLocationRecord {
            id: "1".to_string(),
            name: "Kearney".to_string(),
            position: LatLng::new(41.88, -87.63),
            category: "Kearney".to_string(),
            details: FirmDetails::default(),
        };

        assert_eq!(record.location_label(), "Location not specified");
        assert_eq!(record.description_label(), "Consulting firm");
    }
}
