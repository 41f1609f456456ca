// 🔌 Row Source - the inbound data source and its change feed
//
// Change events carry no trusted payload: they only say "the table changed".
// Consumers always re-fetch the full row set.

use crate::record::RawRow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("backend unavailable: {0}")]
    Transport(String),

    #[error("change subscription failed: {0}")]
    Subscribe(String),

    #[error("query failed: {0}")]
    Query(#[from] rusqlite::Error),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    /// Detected from outside this process; the operation is unknown
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
}

pub type ChangeFeed = broadcast::Receiver<ChangeEvent>;

#[async_trait]
pub trait RowSource: Send + Sync + 'static {
    /// Every row of the firm-location table
    async fn fetch_rows(&self) -> Result<Vec<RawRow>, SourceError>;

    /// Last modification time from the meta view; `None` when the view is empty
    async fn fetch_last_updated(&self) -> Result<Option<DateTime<Utc>>, SourceError>;

    /// Subscribe to change notifications for the firm-location table
    async fn subscribe(&self) -> Result<ChangeFeed, SourceError>;
}
