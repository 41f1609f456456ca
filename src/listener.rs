// 📡 Live Update Listener - turns change events into refresh triggers
//
// Events carry no data we trust; each one only queues a full re-fetch.
// At most one forwarding task exists per listener.

use crate::source::{ChangeFeed, RowSource};
use crate::sync::RefreshTrigger;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct LiveUpdateListener {
    task: Option<JoinHandle<()>>,
}

impl LiveUpdateListener {
    pub fn new() -> Self {
        LiveUpdateListener::default()
    }

    /// Replace any previous subscription. Returns false when the source
    /// refuses; the caller keeps working on its timer alone.
    pub async fn subscribe(&mut self, source: &dyn RowSource, trigger: RefreshTrigger) -> bool {
        self.unsubscribe();

        match source.subscribe().await {
            Ok(feed) => {
                self.task = Some(tokio::spawn(forward(feed, trigger)));
                info!("subscribed to firm location changes");
                true
            }
            Err(e) => {
                warn!(error = %e, "could not subscribe to firm location changes");
                false
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("change subscription dropped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for LiveUpdateListener {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

async fn forward(mut feed: ChangeFeed, trigger: RefreshTrigger) {
    loop {
        match feed.recv().await {
            Ok(event) => {
                debug!(table = %event.table, kind = ?event.kind, "change received");
                trigger.fire();
            }
            // Missed events still mean the table changed
            Err(RecvError::Lagged(skipped)) => {
                debug!(skipped, "change feed lagged");
                trigger.fire();
            }
            Err(RecvError::Closed) => {
                info!("change feed closed");
                break;
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RawRow;
    use crate::source::{ChangeFeed, SourceError};
    use crate::store::FirmStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use std::time::Duration;

    struct RefusingSource;

    #[async_trait]
    impl RowSource for RefusingSource {
        async fn fetch_rows(&self) -> Result<Vec<RawRow>, SourceError> {
            Ok(Vec::new())
        }

        async fn fetch_last_updated(&self) -> Result<Option<DateTime<Utc>>, SourceError> {
            Ok(None)
        }

        async fn subscribe(&self) -> Result<ChangeFeed, SourceError> {
            Err(SourceError::Subscribe("realtime disabled".to_string()))
        }
    }

    fn firm(name: &str) -> RawRow {
        match json!({"firm": name, "latitude": 42.36, "longitude": -71.06}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_store_write_fires_trigger() {
        let store = FirmStore::open_in_memory().unwrap();
        let trigger = RefreshTrigger::new();
        let mut listener = LiveUpdateListener::new();

        assert!(listener.subscribe(&store, trigger.clone()).await);
        assert!(listener.is_active());

        store.insert_row(&firm("Bain & Co")).unwrap();

        tokio::time::timeout(Duration::from_secs(1), trigger.fired())
            .await
            .expect("insert should trigger a refresh");
    }

    #[tokio::test]
    async fn test_refused_subscription() {
        let mut listener = LiveUpdateListener::new();

        assert!(!listener.subscribe(&RefusingSource, RefreshTrigger::new()).await);
        assert!(!listener.is_active());
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_task() {
        let store = FirmStore::open_in_memory().unwrap();
        let mut listener = LiveUpdateListener::new();

        listener.subscribe(&store, RefreshTrigger::new()).await;
        let trigger = RefreshTrigger::new();
        listener.subscribe(&store, trigger.clone()).await;

        store.insert_row(&firm("BCG")).unwrap();
        tokio::time::timeout(Duration::from_secs(1), trigger.fired())
            .await
            .expect("latest subscription should be live");

        listener.unsubscribe();
        assert!(!listener.is_active());
    }
}
