use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Truncates to whole milliseconds, matching the precision of `now()`.
    pub fn from_system_time(time: SystemTime) -> Self {
        match time.duration_since(UNIX_EPOCH) {
            Ok(after) => Self(after.as_millis() as i64),
            Err(before) => Self(-(before.duration().as_millis() as i64)),
        }
    }

    /// Parses the single decimal value stored in a checkpoint file.
    pub fn parse_decimal(text: &str) -> Option<Self> {
        text.trim().parse::<i64>().ok().map(Self)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match DateTime::<Utc>::from_timestamp_millis(self.0) {
            Some(dt) => write!(f, "{}", dt.to_rfc3339()),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// The two durable timestamps of a collection's sync history.
///
/// `None` means the corresponding file has never been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckpointRecord {
    pub started: Option<Timestamp>,
    pub completed: Option<Timestamp>,
}

impl CheckpointRecord {
    /// True when a previous run finished cleanly, so an incremental window exists.
    pub fn has_completed_run(&self) -> bool {
        self.completed.is_some()
    }

    /// The `started` value for a run beginning at `now`.
    ///
    /// Never older than the prior `completed`, even if the wall clock went backwards.
    pub fn next_started(&self, now: Timestamp) -> Timestamp {
        match self.completed {
            Some(completed) if completed > now => completed,
            _ => now,
        }
    }

    /// Whether `candidate` may replace the stored `completed` value.
    pub fn accepts_completed(&self, candidate: Timestamp) -> bool {
        self.completed.map_or(true, |current| candidate > current)
    }
}
