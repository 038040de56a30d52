//! Scheduled backup window.
//!
//! The daily backup fires when the local clock is in the configured hour,
//! within a few minutes of the configured minute, and no backup completed
//! yet today. Only a successful run marks the day as done.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Allowed distance from the configured minute
pub const BACKUP_WINDOW_MINUTES: u32 = 5;

/// Parse `HH:MM`.
pub fn parse_backup_time(raw: &str) -> Option<NaiveTime> {
    let (hour, minute) = raw.trim().split_once(':')?;
    NaiveTime::from_hms_opt(hour.trim().parse().ok()?, minute.trim().parse().ok()?, 0)
}

/// Tracks the last day a scheduled backup succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupSchedule {
    last_backup_date: Option<NaiveDate>,
}

impl BackupSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_backup_date(&self) -> Option<NaiveDate> {
        self.last_backup_date
    }

    /// Whether a backup should run at `now` for the configured `backup_time`.
    pub fn is_due(&self, backup_time: &str, now: NaiveDateTime) -> bool {
        if self.last_backup_date == Some(now.date()) {
            return false;
        }
        let Some(scheduled) = parse_backup_time(backup_time) else {
            tracing::warn!(backup_time = %backup_time, "invalid backup time format");
            return false;
        };
        scheduled.hour() == now.hour() && scheduled.minute().abs_diff(now.minute()) <= BACKUP_WINDOW_MINUTES
    }

    /// Record a successful run.
    pub fn mark_done(&mut self, now: NaiveDateTime) {
        self.last_backup_date = Some(now.date());
    }
}

// =============================================================================
// Tests
// =============================================================================
