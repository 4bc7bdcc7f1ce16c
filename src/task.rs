//! Identity and bookkeeping shared by every managed task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fields every task carries regardless of its category.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMeta {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl TaskMeta {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            retry_count: 0,
        }
    }

    /// Stamps `updated_at`, never moving it behind `created_at`.
    pub fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now < self.created_at {
            self.created_at
        } else {
            now
        };
    }
}

impl Default for TaskMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// A status enum belonging to one task category.
pub trait TaskStatus: Copy + Eq {
    /// Terminal statuses are immutable history until cleared by the caller.
    fn is_terminal(&self) -> bool;

    /// Statuses that hold (or may hold) a concurrency slot.
    fn is_active(&self) -> bool;
}

/// Milliseconds between two timestamps, zero when `end` precedes `start`.
pub fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}
