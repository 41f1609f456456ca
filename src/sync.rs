// 🔄 Sync Engine - fetch, discard stale results, reconcile
//
// Every cycle takes a generation number before it fetches. Its result is
// applied only if no newer cycle started in the meantime, so an old slow
// fetch can never overwrite a newer one. Triggers from the change feed and
// the timer go through a single wake-up slot: any number of triggers while
// a cycle runs collapse into one follow-up cycle.

use crate::listener::LiveUpdateListener;
use crate::record::RawRow;
use crate::reconciler::ReconcileReport;
use crate::session::MapSession;
use crate::source::{RowSource, SourceError};
use crate::status::LastUpdated;
use crate::surface::MapSurface;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ============================================================================
// REFRESH TRIGGER
// ============================================================================

/// Wake-up slot shared by the change feed, the timer and the worker.
/// Holds at most one pending wake-up.
#[derive(Debug, Clone, Default)]
pub struct RefreshTrigger {
    wake: Arc<Notify>,
}

impl RefreshTrigger {
    pub fn new() -> Self {
        RefreshTrigger::default()
    }

    pub fn fire(&self) {
        self.wake.notify_one();
    }

    pub async fn fired(&self) {
        self.wake.notified().await;
    }
}

// ============================================================================
// OUTCOMES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RefreshOutcome {
    Applied(ReconcileReport),
    /// A newer cycle started while this one was fetching
    Discarded { generation: u64, latest: u64 },
    /// Fetch failed; the previous marker set stays
    Failed { error: String },
    /// A manual refresh is already in progress
    Busy,
    /// The session was closed before the result arrived
    Closed,
}

type Fetched = Result<Vec<RawRow>, SourceError>;
type FetchedTimestamp = Option<Result<Option<DateTime<Utc>>, SourceError>>;

// ============================================================================
// SYNC ENGINE
// ============================================================================

pub struct SyncEngine<M: MapSurface> {
    source: Arc<dyn RowSource>,
    session: Arc<Mutex<MapSession<M>>>,
    generation: Arc<AtomicU64>,
    refreshing: Arc<AtomicBool>,
    trigger: RefreshTrigger,
}

impl<M: MapSurface> Clone for SyncEngine<M> {
    fn clone(&self) -> Self {
        SyncEngine {
            source: Arc::clone(&self.source),
            session: Arc::clone(&self.session),
            generation: Arc::clone(&self.generation),
            refreshing: Arc::clone(&self.refreshing),
            trigger: self.trigger.clone(),
        }
    }
}

impl<M: MapSurface + 'static> SyncEngine<M> {
    pub fn new(source: Arc<dyn RowSource>, session: MapSession<M>) -> Self {
        SyncEngine {
            source,
            session: Arc::new(Mutex::new(session)),
            generation: Arc::new(AtomicU64::new(0)),
            refreshing: Arc::new(AtomicBool::new(false)),
            trigger: RefreshTrigger::new(),
        }
    }

    /// Lock the session. Held only for synchronous work, never across a fetch.
    pub fn session(&self) -> MutexGuard<'_, MapSession<M>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn source(&self) -> &dyn RowSource {
        self.source.as_ref()
    }

    pub fn trigger_handle(&self) -> RefreshTrigger {
        self.trigger.clone()
    }

    /// Queue a cycle; coalesces with any cycle already queued
    pub fn trigger(&self) {
        self.trigger.fire();
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    pub fn latest_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Claim the next generation number
    pub fn begin_cycle(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Fetch and apply for a generation claimed with `begin_cycle`
    pub async fn run_cycle(&self, generation: u64) -> RefreshOutcome {
        let fetched = self.source.fetch_rows().await;
        let timestamp = match fetched {
            Ok(_) => Some(self.source.fetch_last_updated().await),
            Err(_) => None,
        };
        self.apply(generation, fetched, timestamp)
    }

    fn apply(&self, generation: u64, fetched: Fetched, timestamp: FetchedTimestamp) -> RefreshOutcome {
        let mut session = self.session();

        if session.is_closed() {
            return RefreshOutcome::Closed;
        }

        let latest = self.latest_generation();
        if generation != latest {
            debug!(generation, latest, "discarding stale fetch");
            return RefreshOutcome::Discarded { generation, latest };
        }

        let rows = match fetched {
            Ok(rows) => rows,
            Err(e) => {
                session.record_fetch_failure(&e);
                return RefreshOutcome::Failed { error: e.to_string() };
            }
        };

        let report = session.apply_rows(&rows);

        if let Some(timestamp) = timestamp {
            let badge = match timestamp {
                Ok(Some(time)) => LastUpdated::At(time),
                Ok(None) => LastUpdated::Unavailable,
                Err(e) => {
                    warn!(error = %e, "last-updated lookup failed");
                    LastUpdated::Error
                }
            };
            session.set_last_updated(badge);
        }

        RefreshOutcome::Applied(report)
    }

    /// One full cycle with a fresh generation
    pub async fn refresh(&self) -> RefreshOutcome {
        let generation = self.begin_cycle();
        self.run_cycle(generation).await
    }

    /// Manual refresh. Refused while another manual refresh is running.
    pub async fn refresh_now(&self) -> RefreshOutcome {
        if self.refreshing.swap(true, Ordering::SeqCst) {
            return RefreshOutcome::Busy;
        }
        let _busy = BusyFlag(Arc::clone(&self.refreshing));

        let outcome = self.refresh().await;
        info!(?outcome, "manual refresh finished");
        outcome
    }

    /// Drain wake-ups one cycle at a time
    pub fn spawn_worker(&self) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            loop {
                engine.trigger.fired().await;
                match engine.refresh().await {
                    RefreshOutcome::Applied(report) if !report.is_noop() => {
                        info!(summary = %report.summary(), "firm markers reconciled");
                    }
                    RefreshOutcome::Closed => break,
                    outcome => debug!(?outcome, "sync cycle finished"),
                }
            }
        })
    }

    /// Periodic backstop in case change events are missed
    pub fn spawn_timer(&self, every: Duration) -> JoinHandle<()> {
        let trigger = self.trigger.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick fires immediately; the initial load covers it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                debug!("periodic refresh");
                trigger.fire();
            }
        })
    }

    /// Subscribe to changes, run the initial load, then start the worker and timer
    pub async fn start(&self, refresh_every: Duration) -> SyncTasks {
        let mut listener = LiveUpdateListener::new();
        if !listener.subscribe(self.source(), self.trigger_handle()).await {
            warn!(
                every_secs = refresh_every.as_secs(),
                "live updates unavailable, relying on periodic refresh"
            );
        }

        let initial = self.refresh().await;
        info!(?initial, "initial firm load finished");

        SyncTasks {
            worker: self.spawn_worker(),
            timer: self.spawn_timer(refresh_every),
            listener,
        }
    }

    /// Logout: stop every task, then release the markers
    pub fn close(&self, tasks: SyncTasks) {
        tasks.shutdown();
        self.session().close();
    }
}

struct BusyFlag(Arc<AtomicBool>);

impl Drop for BusyFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

pub struct SyncTasks {
    worker: JoinHandle<()>,
    timer: JoinHandle<()>,
    listener: LiveUpdateListener,
}

impl SyncTasks {
    pub fn is_live(&self) -> bool {
        self.listener.is_active()
    }

    pub fn shutdown(mut self) {
        self.listener.unsubscribe();
        self.timer.abort();
        self.worker.abort();
        debug!("sync tasks stopped");
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionSettings;
    use crate::source::{ChangeEvent, ChangeFeed, ChangeKind};
    use crate::status::NoticeLevel;
    use crate::surface::LayerTree;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::{broadcast, oneshot};

    type Scripted = Result<Vec<RawRow>, String>;

    /// Source whose fetches can be held open until the test releases them
    struct ScriptedSource {
        gates: Mutex<VecDeque<oneshot::Receiver<Scripted>>>,
        fallback: Mutex<Scripted>,
        changes: broadcast::Sender<ChangeEvent>,
        fetches: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(fallback: Scripted) -> Self {
            ScriptedSource {
                gates: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(fallback),
                changes: broadcast::channel(16).0,
                fetches: AtomicUsize::new(0),
            }
        }

        fn gate(&self) -> oneshot::Sender<Scripted> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().unwrap().push_back(rx);
            tx
        }

        fn set_rows(&self, rows: Scripted) {
            *self.fallback.lock().unwrap() = rows;
        }
    }

    #[async_trait]
    impl RowSource for ScriptedSource {
        async fn fetch_rows(&self) -> Result<Vec<RawRow>, SourceError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let gate = self.gates.lock().unwrap().pop_front();
            let scripted = match gate {
                Some(rx) => rx
                    .await
                    .map_err(|_| SourceError::Transport("gate dropped".to_string()))?,
                None => self.fallback.lock().unwrap().clone(),
            };
            scripted.map_err(SourceError::Transport)
        }

        async fn fetch_last_updated(&self) -> Result<Option<DateTime<Utc>>, SourceError> {
            Ok(None)
        }

        async fn subscribe(&self) -> Result<ChangeFeed, SourceError> {
            Ok(self.changes.subscribe())
        }
    }

    fn firm(name: &str, lat: f64, lng: f64) -> RawRow {
        match json!({"firm": name, "latitude": lat, "longitude": lng}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn engine(source: Arc<ScriptedSource>) -> SyncEngine<LayerTree> {
        let session = MapSession::open(SessionSettings::default(), LayerTree::new());
        SyncEngine::new(source, session)
    }

    fn names(engine: &SyncEngine<LayerTree>) -> Vec<String> {
        let mut names: Vec<String> = engine
            .session()
            .snapshot()
            .records()
            .map(|record| record.name.clone())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_refresh_applies_rows() {
        let source = Arc::new(ScriptedSource::new(Ok(vec![firm("Bain & Co", 42.36, -71.06)])));
        let engine = engine(source);

        let outcome = engine.refresh().await;

        match outcome {
            RefreshOutcome::Applied(report) => {
                assert_eq!(report.added, 1);
                assert!(report.initial);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(engine.session().last_updated(), LastUpdated::Unavailable);
    }

    #[tokio::test]
    async fn test_stale_fetch_is_discarded() {
        let source = Arc::new(ScriptedSource::new(Ok(Vec::new())));
        let slow_gate = source.gate();
        let fast_gate = source.gate();
        let engine = engine(Arc::clone(&source));

        // Cycle 1 starts first and blocks on its fetch
        let slow = {
            let engine = engine.clone();
            let generation = engine.begin_cycle();
            tokio::spawn(async move { engine.run_cycle(generation).await })
        };
        tokio::task::yield_now().await;

        // Cycle 2 starts later but finishes first
        let generation = engine.begin_cycle();
        fast_gate
            .send(Ok(vec![firm("BCG", 41.88, -87.63)]))
            .unwrap();
        let fast = engine.run_cycle(generation).await;
        assert!(matches!(fast, RefreshOutcome::Applied(_)));

        slow_gate
            .send(Ok(vec![firm("Bain & Co", 42.36, -71.06)]))
            .unwrap();
        let stale = slow.await.unwrap();

        assert_eq!(stale, RefreshOutcome::Discarded { generation: 1, latest: 2 });
        assert_eq!(names(&engine), vec!["BCG".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_markers() {
        let source = Arc::new(ScriptedSource::new(Ok(vec![firm("Bain & Co", 42.36, -71.06)])));
        let engine = engine(Arc::clone(&source));
        engine.refresh().await;

        source.set_rows(Err("timeout".to_string()));
        let outcome = engine.refresh().await;

        assert!(matches!(outcome, RefreshOutcome::Failed { .. }));
        assert_eq!(names(&engine), vec!["Bain & Co".to_string()]);
        let notices = engine.session().active_notices();
        assert!(notices.iter().any(|n| n.level == NoticeLevel::Error));
    }

    #[tokio::test]
    async fn test_manual_refresh_refused_while_running() {
        let source = Arc::new(ScriptedSource::new(Ok(Vec::new())));
        let gate = source.gate();
        let engine = engine(Arc::clone(&source));

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.refresh_now().await })
        };
        tokio::task::yield_now().await;
        assert!(engine.is_refreshing());

        assert_eq!(engine.refresh_now().await, RefreshOutcome::Busy);

        gate.send(Ok(vec![firm("Kearney", 41.88, -87.63)])).unwrap();
        assert!(matches!(first.await.unwrap(), RefreshOutcome::Applied(_)));
        assert!(!engine.is_refreshing());
    }

    #[tokio::test]
    async fn test_closed_session_ignores_results() {
        let source = Arc::new(ScriptedSource::new(Ok(vec![firm("Bain & Co", 42.36, -71.06)])));
        let engine = engine(source);

        engine.session().close();

        assert_eq!(engine.refresh().await, RefreshOutcome::Closed);
        assert_eq!(engine.session().surface().marker_count(), 0);
    }

    #[tokio::test]
    async fn test_change_event_triggers_cycle() {
        let source = Arc::new(ScriptedSource::new(Ok(vec![firm("Bain & Co", 42.36, -71.06)])));
        let engine = engine(Arc::clone(&source));

        let tasks = engine.start(Duration::from_secs(300)).await;
        assert!(tasks.is_live());
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        source.set_rows(Ok(vec![firm("Bain & Co", 42.36, -71.06), firm("BCG", 41.88, -87.63)]));
        source
            .changes
            .send(ChangeEvent {
                table: "firm_locations".to_string(),
                kind: ChangeKind::Insert,
            })
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while engine.session().snapshot().len() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(names(&engine), vec!["BCG".to_string(), "Bain & Co".to_string()]);

        engine.close(tasks);
        assert!(engine.session().is_closed());
        assert_eq!(engine.session().surface().marker_count(), 0);
    }

    #[tokio::test]
    async fn test_triggers_coalesce() {
        let source = Arc::new(ScriptedSource::new(Ok(Vec::new())));
        let engine = engine(Arc::clone(&source));

        for _ in 0..5 {
            engine.trigger();
        }
        let worker = engine.spawn_worker();

        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.abort();

        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }
}
