// ⚙️ Configuration - environment variables with logged defaults

use crate::classifier::CategoryClassifier;
use crate::reconciler::{DEFAULT_PRECISION, MAX_PRECISION};
use crate::session::{SessionSettings, DEFAULT_CENTER, DEFAULT_ZOOM};
use std::{env, fmt::Display, path::PathBuf, str::FromStr, time::Duration};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub password: String,
    pub refresh_every: Duration,
    pub watch_every: Duration,
    pub precision: u32,
    /// JSON list of `{name, color}` labels; built-in list when unset
    pub categories_path: Option<PathBuf>,
    pub server_addr: String,
    pub log_path: PathBuf,
}

impl Config {
    pub fn load() -> Self {
        Self {
            db_path: PathBuf::from(try_load("FIRM_MAP_DB", "firm_locations.db".to_string())),
            password: try_load("FIRM_MAP_PASSWORD", "firmmap".to_string()),
            refresh_every: Duration::from_secs(try_load("FIRM_MAP_REFRESH_SECS", 300)),
            watch_every: Duration::from_millis(try_load("FIRM_MAP_WATCH_MS", 2000)),
            precision: clamp_precision(try_load("FIRM_MAP_PRECISION", DEFAULT_PRECISION)),
            categories_path: var("FIRM_MAP_CATEGORIES").map(PathBuf::from),
            server_addr: try_load("FIRM_MAP_ADDR", "0.0.0.0:3000".to_string()),
            log_path: Self::log_path(),
        }
    }

    /// `FIRM_MAP_LOG` alone, read before a subscriber exists to hear about it
    pub fn log_path() -> PathBuf {
        var("FIRM_MAP_LOG").map_or_else(|| PathBuf::from("firm-map.log"), PathBuf::from)
    }

    /// Labels from `FIRM_MAP_CATEGORIES`, falling back to the built-in list
    pub fn classifier(&self) -> CategoryClassifier {
        match &self.categories_path {
            Some(path) => CategoryClassifier::from_file(path).unwrap_or_else(|e| {
                warn!("Could not load categories from {path:?}: {e:#}, using built-in list");
                CategoryClassifier::with_defaults()
            }),
            None => CategoryClassifier::with_defaults(),
        }
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            classifier: self.classifier(),
            precision: self.precision,
            center: DEFAULT_CENTER,
            zoom: DEFAULT_ZOOM,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("firm_locations.db"),
            password: "firmmap".to_string(),
            refresh_every: Duration::from_secs(300),
            watch_every: Duration::from_millis(2000),
            precision: DEFAULT_PRECISION,
            categories_path: None,
            server_addr: "0.0.0.0:3000".to_string(),
            log_path: PathBuf::from("firm-map.log"),
        }
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn try_load<T>(key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Some(raw) = var(key) else {
        info!("{key} not set, using default: {default}");
        return default;
    };

    raw.trim().parse().unwrap_or_else(|e| {
        warn!("Invalid {key} value {raw:?}: {e}, using default: {default}");
        default
    })
}

fn clamp_precision(precision: u32) -> u32 {
    if precision > MAX_PRECISION {
        warn!("FIRM_MAP_PRECISION {precision} too fine, using {MAX_PRECISION}");
        return MAX_PRECISION;
    }
    precision
}
