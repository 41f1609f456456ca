// 📣 Status - transient notices and the "last updated" badge

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

/// Notices disappear on their own after this long
pub const NOTICE_TTL_SECS: i64 = 5;

// ============================================================================
// NOTICES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    pub posted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NoticeBoard {
    notices: Vec<Notice>,
    ttl: Duration,
}

impl NoticeBoard {
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(NOTICE_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        NoticeBoard {
            notices: Vec::new(),
            ttl,
        }
    }

    /// Expired notices are dropped on every post, so the board stays bounded
    /// even when nothing renders it
    pub fn post(&mut self, level: NoticeLevel, message: impl Into<String>, now: DateTime<Utc>) {
        self.prune(now);
        self.notices.push(Notice {
            level,
            message: message.into(),
            posted_at: now,
        });
    }

    /// Notices still within their display window, oldest first
    pub fn active(&self, now: DateTime<Utc>) -> Vec<&Notice> {
        self.notices
            .iter()
            .filter(|notice| now - notice.posted_at < self.ttl)
            .collect()
    }

    pub fn prune(&mut self, now: DateTime<Utc>) {
        let ttl = self.ttl;
        self.notices.retain(|notice| now - notice.posted_at < ttl);
    }

    pub fn clear(&mut self) {
        self.notices.clear();
    }

    /// Stored notices, expired or not
    pub fn len(&self) -> usize {
        self.notices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.notices.is_empty()
    }
}

impl Default for NoticeBoard {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// LAST UPDATED BADGE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LastUpdated {
    Loading,
    At(DateTime<Utc>),
    /// Meta view missing or empty
    Unavailable,
    Error,
}

/// "August, 01 2025"
pub fn format_month_day_year(time: DateTime<Utc>) -> String {
    time.format("%B, %d %Y").to_string()
}

impl std::fmt::Display for LastUpdated {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LastUpdated::Loading => write!(f, "Last updated: loading..."),
            LastUpdated::At(time) => write!(f, "Last updated: {}", format_month_day_year(*time)),
            LastUpdated::Unavailable => write!(f, "Last updated: unavailable"),
            LastUpdated::Error => write!(f, "Last updated: error"),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_notices_expire() {
        let start = Utc.with_ymd_and_hms(2025, 8, 1, 12, 0, 0).unwrap();
        let mut board = NoticeBoard::new();
        board.post(NoticeLevel::Error, "Failed to refresh firm data", start);

        assert_eq!(board.active(start + Duration::seconds(4)).len(), 1);
        assert!(board.active(start + Duration::seconds(5)).is_empty());

        board.prune(start + Duration::seconds(6));
        assert!(board.active(start).is_empty());
    }

    #[test]
    fn test_post_drops_expired_notices() {
        let start = Utc.with_ymd_and_hms(2025, 8, 1, 12, 0, 0).unwrap();
        let mut board = NoticeBoard::new();

        for minute in 0..200 {
            board.post(NoticeLevel::Info, "No firm locations found.", start + Duration::minutes(minute));
        }
        assert_eq!(board.len(), 1);

        let mut instant = NoticeBoard::with_ttl(Duration::zero());
        for _ in 0..200 {
            instant.post(NoticeLevel::Success, "Added 1 new firm(s) to the map!", start);
        }
        assert_eq!(instant.len(), 1);
        assert!(instant.active(start).is_empty());
    }

    #[test]
    fn test_last_updated_text() {
        let time = Utc.with_ymd_and_hms(2025, 8, 1, 9, 30, 0).unwrap();

        assert_eq!(LastUpdated::At(time).to_string(), "Last updated: August, 01 2025");
        assert_eq!(LastUpdated::Unavailable.to_string(), "Last updated: unavailable");
        assert_eq!(LastUpdated::Loading.to_string(), "Last updated: loading...");
    }
}
