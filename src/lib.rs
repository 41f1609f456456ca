// Firm Map - Core Library
// Data sync and marker reconcile pipeline shared by the terminal viewer,
// the API server, and tests

pub mod record;      // Canonical firm-location record and identity
pub mod normalizer;  // Raw row -> record, or a rejection reason
pub mod classifier;  // Firm name -> category label
pub mod surface;     // Map rendering boundary (layers + markers)
pub mod reconciler;  // Diff-based marker set updates
pub mod visibility;  // Per-category show/hide
pub mod status;      // Notices and last-updated badge
pub mod session;     // Per-login session context
pub mod source;      // Row source trait + change feed
pub mod store;       // SQLite-backed row source
pub mod sync;        // Generation-guarded refresh cycles
pub mod listener;    // Change feed -> refresh triggers
pub mod config;
pub mod logging;

// Re-export commonly used types
pub use record::{FirmDetails, FirmLocationRecord, LatLng, RawRow, RecordIdentity, OTHER_CATEGORY};
pub use normalizer::{Axis, FieldAliases, NormalizedFirm, Normalizer, Rejection};
pub use classifier::{CategoryClassifier, CategoryLabel, DEFAULT_COLOR};
pub use surface::{LayerTree, MapSurface, MarkerHandle, MarkerSpec, MarkerStyle, PlacedMarker, Popup};
pub use reconciler::{
    MarkerSetReconciler, MarkerSetSnapshot, PreparedBatch, ReconcileReport, DEFAULT_PRECISION,
    MAX_PRECISION,
};
pub use visibility::{LayerControl, LayerVisibility};
pub use status::{LastUpdated, Notice, NoticeBoard, NoticeLevel};
pub use session::{MapSession, PasswordGate, SessionSettings, ViewState, DEFAULT_CENTER, DEFAULT_ZOOM};
pub use source::{ChangeEvent, ChangeFeed, ChangeKind, RowSource, SourceError};
pub use store::{load_csv, setup_database, FirmStore};
pub use sync::{RefreshOutcome, RefreshTrigger, SyncEngine, SyncTasks};
pub use listener::LiveUpdateListener;
pub use config::Config;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
