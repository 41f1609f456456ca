// 🗄️ Firm Store - SQLite + WAL backend for firm-location rows
//
// Rows are stored as raw JSON payloads so upstream column names survive
// untouched; the normalizer deals with them on read. Every write made
// through the store broadcasts a change event, and a watcher picks up
// writes from other processes via `PRAGMA data_version`.

use crate::record::RawRow;
use crate::source::{ChangeEvent, ChangeFeed, ChangeKind, RowSource, SourceError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const TABLE_NAME: &str = "firm_locations";
pub const META_VIEW: &str = "firm_locations_meta";

const CHANGE_BUFFER: usize = 64;

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery (in-memory databases report "memory")
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS firm_locations (
            id TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;

    // Single-row view consumed by the "last updated" badge
    conn.execute(
        "CREATE VIEW IF NOT EXISTS firm_locations_meta AS
            SELECT MAX(COALESCE(updated_at, created_at)) AS last_updated
            FROM firm_locations",
        [],
    )?;

    Ok(())
}

/// Load a spreadsheet export. Headers are kept verbatim as row keys.
pub fn load_csv(csv_path: &Path) -> Result<Vec<RawRow>> {
    let mut rdr = csv::Reader::from_path(csv_path).context("Failed to open CSV file")?;
    let headers = rdr.headers().context("Failed to read CSV headers")?.clone();

    let mut rows = Vec::new();
    for result in rdr.records() {
        let record = result.context("Failed to read CSV record")?;
        let row: RawRow = headers
            .iter()
            .zip(record.iter())
            .map(|(header, value)| (header.to_string(), serde_json::Value::from(value)))
            .collect();
        rows.push(row);
    }

    Ok(rows)
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

// ============================================================================
// FIRM STORE
// ============================================================================

#[derive(Clone)]
pub struct FirmStore {
    conn: Arc<Mutex<Connection>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl FirmStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        setup_database(&conn)?;
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Ok(FirmStore {
            conn: Arc::new(Mutex::new(conn)),
            changes,
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, kind: ChangeKind) {
        // No receivers is fine: nobody is viewing the map
        let _ = self.changes.send(ChangeEvent {
            table: TABLE_NAME.to_string(),
            kind,
        });
    }

    /// Insert one row; returns its store id
    pub fn insert_row(&self, row: &RawRow) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let payload = serde_json::to_string(row)?;

        self.conn().execute(
            "INSERT INTO firm_locations (id, payload, created_at) VALUES (?1, ?2, ?3)",
            params![id, payload, now_timestamp()],
        )?;

        self.notify(ChangeKind::Insert);
        Ok(id)
    }

    /// Replace a row's payload; false when the id doesn't exist
    pub fn update_row(&self, id: &str, row: &RawRow) -> Result<bool> {
        let payload = serde_json::to_string(row)?;
        let changed = self.conn().execute(
            "UPDATE firm_locations SET payload = ?1, updated_at = ?2 WHERE id = ?3",
            params![payload, now_timestamp(), id],
        )?;

        if changed > 0 {
            self.notify(ChangeKind::Update);
        }
        Ok(changed > 0)
    }

    pub fn delete_row(&self, id: &str) -> Result<bool> {
        let changed = self
            .conn()
            .execute("DELETE FROM firm_locations WHERE id = ?1", params![id])?;

        if changed > 0 {
            self.notify(ChangeKind::Delete);
        }
        Ok(changed > 0)
    }

    /// Insert many rows in one transaction, with a single change event
    pub fn import_rows(&self, rows: &[RawRow]) -> Result<usize> {
        let created_at = now_timestamp();
        {
            let mut conn = self.conn();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO firm_locations (id, payload, created_at) VALUES (?1, ?2, ?3)",
                )?;
                for row in rows {
                    let payload = serde_json::to_string(row)?;
                    stmt.execute(params![uuid::Uuid::new_v4().to_string(), payload, created_at])?;
                }
            }
            tx.commit()?;
        }

        if !rows.is_empty() {
            self.notify(ChangeKind::Insert);
        }
        info!(rows = rows.len(), "imported firm rows");
        Ok(rows.len())
    }

    /// Every row as (store id, payload)
    pub fn rows_with_ids(&self) -> Result<Vec<(String, RawRow)>> {
        Ok(self.query_rows()?)
    }

    pub fn row_count(&self) -> Result<i64> {
        let count = self
            .conn()
            .query_row("SELECT COUNT(*) FROM firm_locations", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn last_updated(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.query_last_updated()?)
    }

    fn query_rows(&self) -> Result<Vec<(String, RawRow)>, SourceError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, payload FROM firm_locations ORDER BY created_at, id")?;
        let stored = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = Vec::with_capacity(stored.len());
        for (id, payload) in stored {
            match serde_json::from_str::<RawRow>(&payload) {
                Ok(row) => rows.push((id, row)),
                Err(e) => warn!(%id, error = %e, "skipping row with unreadable payload"),
            }
        }
        Ok(rows)
    }

    fn query_last_updated(&self) -> Result<Option<DateTime<Utc>>, SourceError> {
        let raw: Option<String> = self
            .conn()
            .query_row("SELECT last_updated FROM firm_locations_meta", [], |row| row.get(0))
            .optional()?
            .flatten();

        Ok(raw.and_then(|value| match DateTime::parse_from_rfc3339(&value) {
            Ok(time) => Some(time.with_timezone(&Utc)),
            Err(e) => {
                warn!(%value, error = %e, "unreadable last_updated timestamp");
                None
            }
        }))
    }

    /// SQLite bumps this when another connection commits
    fn data_version(&self) -> Result<i64, SourceError> {
        Ok(self
            .conn()
            .query_row("PRAGMA data_version", [], |row| row.get(0))?)
    }

    /// Poll for commits made by other processes and broadcast them
    pub fn spawn_change_watcher(&self, every: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            let mut last_seen: Option<i64> = None;

            loop {
                ticker.tick().await;
                let probe = store.clone();
                let version = match tokio::task::spawn_blocking(move || probe.data_version()).await {
                    Ok(Ok(version)) => version,
                    Ok(Err(e)) => {
                        warn!(error = %e, "data_version probe failed");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "data_version probe panicked");
                        continue;
                    }
                };

                if last_seen.is_some_and(|seen| seen != version) {
                    debug!(version, "external write detected");
                    store.notify(ChangeKind::External);
                }
                last_seen = Some(version);
            }
        })
    }
}

#[async_trait]
impl RowSource for FirmStore {
    async fn fetch_rows(&self) -> Result<Vec<RawRow>, SourceError> {
        let store = self.clone();
        let rows = tokio::task::spawn_blocking(move || store.query_rows()).await??;
        // The store's id is the row's server-assigned identifier unless the
        // payload carries its own
        Ok(rows
            .into_iter()
            .map(|(id, mut row)| {
                row.entry("id").or_insert(serde_json::Value::String(id));
                row
            })
            .collect())
    }

    async fn fetch_last_updated(&self) -> Result<Option<DateTime<Utc>>, SourceError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.query_last_updated()).await?
    }

    async fn subscribe(&self) -> Result<ChangeFeed, SourceError> {
        Ok(self.changes.subscribe())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn row(value: serde_json::Value) -> RawRow {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("test rows must be objects"),
        }
    }

    #[tokio::test]
    async fn test_insert_and_fetch() {
        let store = FirmStore::open_in_memory().unwrap();
        store.insert_row(&row(json!({"Firm": "Bain & Co", "Latitude": 42.36, "Longitude": -71.06}))).unwrap();

        let rows = store.fetch_rows().await.unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("Firm"), Some(&json!("Bain & Co")));
        assert_eq!(store.row_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_store_id_becomes_record_id() {
        let store = FirmStore::open_in_memory().unwrap();
        let id = store
            .insert_row(&row(json!({"Firm": "Bain & Co", "Latitude": 42.36, "Longitude": -71.06})))
            .unwrap();
        store
            .insert_row(&row(json!({"id": "crm-17", "Firm": "BCG", "Latitude": 41.88, "Longitude": -87.63})))
            .unwrap();

        let rows = store.fetch_rows().await.unwrap();
        let batch = crate::MarkerSetReconciler::new(crate::CategoryClassifier::default()).prepare(&rows);

        let by_name = |name: &str| {
            batch
                .records
                .iter()
                .find(|prepared| prepared.record.name == name)
                .unwrap()
        };

        assert_eq!(batch.records.len(), 2);
        assert_eq!(by_name("Bain & Co").record.id, id);
        assert!(by_name("Bain & Co").upstream_id);
        assert_eq!(by_name("BCG").record.id, "crm-17");
        assert!(by_name("BCG").upstream_id);
    }

    #[tokio::test]
    async fn test_writes_broadcast_changes() {
        let store = FirmStore::open_in_memory().unwrap();
        let mut feed = store.subscribe().await.unwrap();

        let id = store.insert_row(&row(json!({"firm": "BCG"}))).unwrap();
        assert!(store.update_row(&id, &row(json!({"firm": "BCG Boston"}))).unwrap());
        assert!(store.delete_row(&id).unwrap());
        assert!(!store.delete_row(&id).unwrap());

        assert_eq!(feed.recv().await.unwrap().kind, ChangeKind::Insert);
        assert_eq!(feed.recv().await.unwrap().kind, ChangeKind::Update);
        assert_eq!(feed.recv().await.unwrap().kind, ChangeKind::Delete);
        assert!(feed.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_last_updated_view() {
        let store = FirmStore::open_in_memory().unwrap();
        assert_eq!(store.fetch_last_updated().await.unwrap(), None);

        let before = Utc::now() - chrono::Duration::seconds(1);
        store.insert_row(&row(json!({"firm": "PwC"}))).unwrap();

        let last = store.fetch_last_updated().await.unwrap().unwrap();
        assert!(last >= before);
    }

    #[test]
    fn test_import_rows_single_transaction() {
        let store = FirmStore::open_in_memory().unwrap();
        let mut feed = store.changes.subscribe();
        let rows = vec![row(json!({"firm": "LEK"})), row(json!({"firm": "Kearney"}))];

        assert_eq!(store.import_rows(&rows).unwrap(), 2);
        assert_eq!(store.row_count().unwrap(), 2);
        assert!(feed.try_recv().is_ok());
        assert!(feed.try_recv().is_err());
    }

    #[test]
    fn test_load_csv_keeps_headers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "Company Name,Latitude,Longitude,Employee Count").unwrap();
        writeln!(file, "Oliver Wyman,40.7128,-74.0060,500-1000").unwrap();
        writeln!(file, "Deloitte,41.8781,-87.6298,").unwrap();

        let rows = load_csv(file.path()).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Company Name"), Some(&json!("Oliver Wyman")));
        assert_eq!(rows[0].get("Latitude"), Some(&json!("40.7128")));
        assert_eq!(rows[1].get("Employee Count"), Some(&json!("")));
    }

    #[tokio::test]
    async fn test_watcher_sees_other_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("firms.db");
        let store = FirmStore::open(&path).unwrap();
        let mut feed = store.subscribe().await.unwrap();
        let watcher = store.spawn_change_watcher(Duration::from_millis(20));

        // Let the watcher record a baseline version
        tokio::time::sleep(Duration::from_millis(60)).await;

        let other = FirmStore::open(&path).unwrap();
        other.insert_row(&row(json!({"firm": "Bain"}))).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), feed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, ChangeKind::External);
        watcher.abort();
    }
}
