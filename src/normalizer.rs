// 🧹 Record Normalizer - heterogeneous rows → canonical firm locations
//
// Upstream column names drifted across schema revisions ("Firm", "firm_name",
// "Company Name", ...). Each logical field has an ordered alias list: the
// current schema name first, legacy names after. First present value wins.

use crate::record::{FirmDetails, LatLng, RawRow};
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// REJECTIONS
// ============================================================================

/// Why a row was dropped. Rows are never fatal, these only reach the log.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("row has no usable firm name")]
    MissingName,

    #[error("row has no {0} value")]
    MissingCoordinate(Axis),

    #[error("{axis} value {value:?} is not a number")]
    UnparseableCoordinate { axis: Axis, value: String },

    #[error("{0} is not finite")]
    NonFiniteCoordinate(Axis),

    /// Zero is the upstream "unset" sentinel
    #[error("{0} is zero")]
    ZeroCoordinate(Axis),

    #[error("{axis} {value} is out of range")]
    OutOfRange { axis: Axis, value: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Latitude,
    Longitude,
}

impl Axis {
    fn limit(&self) -> f64 {
        match self {
            Axis::Latitude => 90.0,
            Axis::Longitude => 180.0,
        }
    }
}

impl std::fmt::Display for Axis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Axis::Latitude => write!(f, "latitude"),
            Axis::Longitude => write!(f, "longitude"),
        }
    }
}

// ============================================================================
// FIELD ALIASES
// ============================================================================

/// Alias lists per logical field, highest priority first
#[derive(Debug, Clone)]
pub struct FieldAliases {
    pub id: Vec<String>,
    pub name: Vec<String>,
    pub latitude: Vec<String>,
    pub longitude: Vec<String>,
    pub location: Vec<String>,
    pub description: Vec<String>,
    pub website: Vec<String>,
    pub employees: Vec<String>,
    pub founded: Vec<String>,
    pub address: Vec<String>,
    pub phone: Vec<String>,
    pub email: Vec<String>,
}

fn aliases(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| fold_key(n)).collect()
}

impl Default for FieldAliases {
    fn default() -> Self {
        FieldAliases {
            id: aliases(&["id", "uuid", "firm_id"]),
            name: aliases(&["firm", "firm_name", "company_name", "name", "company"]),
            latitude: aliases(&["latitude", "lat"]),
            longitude: aliases(&["longitude", "lng", "lon", "long"]),
            location: aliases(&["location", "city", "office"]),
            description: aliases(&["description"]),
            website: aliases(&["website", "url"]),
            employees: aliases(&["employees", "employee_count"]),
            founded: aliases(&["founded", "founded_year"]),
            address: aliases(&["address"]),
            phone: aliases(&["phone"]),
            email: aliases(&["email"]),
        }
    }
}

/// Fold a column name so casing and separators don't matter:
/// "Company Name", "company_name" and "COMPANY-NAME" all become "companyname"
pub fn fold_key(key: &str) -> String {
    key.chars()
        .filter(|c| !matches!(c, ' ' | '_' | '-'))
        .flat_map(|c| c.to_lowercase())
        .collect()
}

// ============================================================================
// NORMALIZER
// ============================================================================

/// Output of a successful normalization, category not yet assigned
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedFirm {
    /// Upstream id if the row had one
    pub id: Option<String>,
    pub name: String,
    pub position: LatLng,
    pub details: FirmDetails,
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    aliases: FieldAliases,
}

impl Normalizer {
    pub fn new() -> Self {
        Normalizer::default()
    }

    pub fn with_aliases(aliases: FieldAliases) -> Self {
        Normalizer { aliases }
    }

    /// Normalize one raw row. Pure: no logging, no id generation.
    pub fn normalize(&self, row: &RawRow) -> Result<NormalizedFirm, Rejection> {
        let name = self.text(row, &self.aliases.name).ok_or(Rejection::MissingName)?;

        let lat = self.coordinate(row, &self.aliases.latitude, Axis::Latitude)?;
        let lng = self.coordinate(row, &self.aliases.longitude, Axis::Longitude)?;

        Ok(NormalizedFirm {
            id: self.text(row, &self.aliases.id),
            name,
            position: LatLng::new(lat, lng),
            details: FirmDetails {
                location: self.text(row, &self.aliases.location),
                description: self.text(row, &self.aliases.description),
                website: self.text(row, &self.aliases.website),
                employees: self.text(row, &self.aliases.employees),
                founded: self.text(row, &self.aliases.founded),
                address: self.text(row, &self.aliases.address),
                phone: self.text(row, &self.aliases.phone),
                email: self.text(row, &self.aliases.email),
            },
        })
    }

    /// First alias (in priority order) with a present, non-null, non-blank value
    fn lookup<'a>(&self, row: &'a RawRow, names: &[String]) -> Option<&'a Value> {
        names.iter().find_map(|alias| {
            row.iter()
                .filter(|(key, _)| fold_key(key) == *alias)
                .map(|(_, value)| value)
                .find(|value| !is_blank(value))
        })
    }

    fn text(&self, row: &RawRow, names: &[String]) -> Option<String> {
        match self.lookup(row, names)? {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn coordinate(&self, row: &RawRow, names: &[String], axis: Axis) -> Result<f64, Rejection> {
        let value = match self.lookup(row, names) {
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or(Rejection::NonFiniteCoordinate(axis))?,
            Some(Value::String(s)) => {
                s.trim()
                    .parse::<f64>()
                    .map_err(|_| Rejection::UnparseableCoordinate {
                        axis,
                        value: s.clone(),
                    })?
            }
            Some(other) => {
                return Err(Rejection::UnparseableCoordinate {
                    axis,
                    value: other.to_string(),
                })
            }
            None => return Err(Rejection::MissingCoordinate(axis)),
        };

        if !value.is_finite() {
            return Err(Rejection::NonFiniteCoordinate(axis));
        }
        if value == 0.0 {
            return Err(Rejection::ZeroCoordinate(axis));
        }
        if value.abs() > axis.limit() {
            return Err(Rejection::OutOfRange { axis, value });
        }

        Ok(value)
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> RawRow {
        match value {
            Value::Object(map) => map,
            _ => panic!("test rows must be objects"),
        }
    }

    #[test]
    fn test_normalize_string_coordinates() {
        let normalizer = Normalizer::new();
        let firm = normalizer
            .normalize(&row(json!({"firm": "Bain & Co", "latitude": "42.36", "longitude": "-71.06"})))
            .unwrap();

        assert_eq!(firm.name, "Bain & Co");
        assert_eq!(firm.position, LatLng::new(42.36, -71.06));
        assert_eq!(firm.id, None);
    }

    #[test]
    fn test_zero_coordinates_rejected() {
        let normalizer = Normalizer::new();
        let result = normalizer.normalize(&row(json!({"firm": "Unknown Corp", "latitude": 0, "longitude": 0})));

        assert_eq!(result, Err(Rejection::ZeroCoordinate(Axis::Latitude)));
    }

    #[test]
    fn test_legacy_aliases_and_casing() {
        let normalizer = Normalizer::new();
        let firm = normalizer
            .normalize(&row(json!({
                "ID": 17,
                "Company Name": "McKinsey & Company",
                "Lat": 40.7128,
                "LNG": "-74.0060",
                "Employee Count": "1000-5000"
            })))
            .unwrap();

        assert_eq!(firm.id.as_deref(), Some("17"));
        assert_eq!(firm.name, "McKinsey & Company");
        assert_eq!(firm.position, LatLng::new(40.7128, -74.006));
        assert_eq!(firm.details.employees.as_deref(), Some("1000-5000"));
    }

    #[test]
    fn test_current_name_beats_legacy_alias() {
        let normalizer = Normalizer::new();
        let firm = normalizer
            .normalize(&row(json!({
                "name": "Legacy Name",
                "Firm": "Current Name",
                "latitude": 1.5,
                "longitude": 2.5
            })))
            .unwrap();

        assert_eq!(firm.name, "Current Name");
    }

    #[test]
    fn test_null_and_blank_fall_through_to_next_alias() {
        let normalizer = Normalizer::new();
        let firm = normalizer
            .normalize(&row(json!({
                "firm": null,
                "firm_name": "   ",
                "company": "Oliver Wyman",
                "latitude": 1.5,
                "longitude": 2.5
            })))
            .unwrap();

        assert_eq!(firm.name, "Oliver Wyman");
    }

    #[test]
    fn test_invalid_rows_rejected() {
        let normalizer = Normalizer::new();

        let cases = vec![
            (json!({"latitude": 1.0, "longitude": 1.0}), Rejection::MissingName),
            (json!({"firm": "", "latitude": 1.0, "longitude": 1.0}), Rejection::MissingName),
            (json!({"firm": "A", "longitude": 1.0}), Rejection::MissingCoordinate(Axis::Latitude)),
            (json!({"firm": "A", "latitude": 1.0, "longitude": 0.0}), Rejection::ZeroCoordinate(Axis::Longitude)),
            (json!({"firm": "A", "latitude": "NaN", "longitude": 1.0}), Rejection::NonFiniteCoordinate(Axis::Latitude)),
            (json!({"firm": "A", "latitude": "inf", "longitude": 1.0}), Rejection::NonFiniteCoordinate(Axis::Latitude)),
            (
                json!({"firm": "A", "latitude": 95.0, "longitude": 1.0}),
                Rejection::OutOfRange { axis: Axis::Latitude, value: 95.0 },
            ),
        ];

        for (input, expected) in cases {
            assert_eq!(normalizer.normalize(&row(input.clone())), Err(expected), "input: {}", input);
        }

        let unparseable = normalizer.normalize(&row(json!({"firm": "A", "latitude": "north", "longitude": 1.0})));
        assert!(matches!(unparseable, Err(Rejection::UnparseableCoordinate { axis: Axis::Latitude, .. })));
    }

    #[test]
    fn test_output_never_exceeds_input() {
        let normalizer = Normalizer::new();
        let rows = vec![
            row(json!({"firm": "Bain", "latitude": 42.36, "longitude": -71.06})),
            row(json!({"firm": "BCG", "latitude": 0, "longitude": 0})),
            row(json!({"latitude": 1.0, "longitude": 1.0})),
            row(json!({"firm": "PwC", "latitude": "40.7", "longitude": "-74.0"})),
        ];

        let valid: Vec<_> = rows.iter().filter_map(|r| normalizer.normalize(r).ok()).collect();

        assert!(valid.len() <= rows.len());
        assert_eq!(valid.len(), 2);
    }

    #[test]
    fn test_fold_key() {
        assert_eq!(fold_key("Company Name"), "companyname");
        assert_eq!(fold_key("company_name"), "companyname");
        assert_eq!(fold_key("COMPANY-NAME"), "companyname");
    }
}
