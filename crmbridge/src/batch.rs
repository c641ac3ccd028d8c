//! Accumulation windows for deferred events.
//!
//! Deferred events are not applied one call at a time: each one joins the
//! open window for its category, and the window is submitted as one bulk
//! job once it is ready. A window is ready when it holds enough records or
//! has been open long enough; windows past the stale ceiling are flushed
//! regardless, so a trickle of events can never strand records.
//!
//! Adding is pure bookkeeping. The flusher decides when to submit, and
//! submission is fenced on window identity so two sweeps racing for the
//! same window produce exactly one bulk job.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::crm::UpsertOperation;

/// One deferred event's contribution to a window.
///
/// Carries enough of the source event to dead-letter it if the bulk job
/// fails after the queue record is already resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEntry {
    pub event_id: String,
    pub kind: String,
    pub occurred_at: DateTime<Utc>,
    pub operation: UpsertOperation,
}

/// Bookkeeping returned to the caller after an add.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowStats {
    pub window_id: Uuid,
    pub record_count: usize,
    pub window_age: Duration,
    pub ready: bool,
}

/// A window the flusher should submit.
#[derive(Debug, Clone)]
pub struct FlushCandidate {
    pub category: String,
    pub window_id: Uuid,
    pub record_count: usize,
    /// Past the stale ceiling rather than ready on its own thresholds
    pub stale: bool,
}

/// Point-in-time view of one open window, for the status surface.
#[derive(Debug, Clone)]
pub struct WindowSnapshot {
    pub category: String,
    pub window_id: Uuid,
    pub record_count: usize,
    pub window_age: Duration,
    pub ready: bool,
}

struct Window {
    id: Uuid,
    opened_at: Instant,
    entries: Vec<BatchEntry>,
}

impl Window {
    fn open() -> Self {
        Self {
            id: Uuid::new_v4(),
            opened_at: Instant::now(),
            entries: Vec::new(),
        }
    }
}

/// Per-category accumulation windows.
pub struct BatchAccumulator {
    config: BatchConfig,
    windows: DashMap<String, Window>,
}

impl BatchAccumulator {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Add one entry to the open window for `category`, opening one if none
    /// exists, and report whether the window is now ready.
    pub fn add(&self, category: &str, entry: BatchEntry) -> WindowStats {
        let thresholds = self.config.thresholds_for(category);

        let mut window = self
            .windows
            .entry(category.to_string())
            .or_insert_with(Window::open);
        window.entries.push(entry);

        let record_count = window.entries.len();
        let window_age = window.opened_at.elapsed();
        let ready =
            record_count >= thresholds.size_threshold || window_age >= thresholds.time_threshold;

        WindowStats {
            window_id: window.id,
            record_count,
            window_age,
            ready,
        }
    }

    /// Take the window for `category`, fenced on its identity.
    ///
    /// Returns `None` when the fence is lost: the window was already
    /// submitted (and possibly replaced) by another sweep.
    pub fn submit(&self, category: &str, window_id: Uuid) -> Option<Vec<BatchEntry>> {
        self.windows
            .remove_if(category, |_, window| window.id == window_id)
            .map(|(_, window)| window.entries)
    }

    /// Windows that are ready on their own thresholds or past the stale
    /// ceiling.
    pub fn flushable(&self) -> Vec<FlushCandidate> {
        self.windows
            .iter()
            .filter_map(|entry| {
                let thresholds = self.config.thresholds_for(entry.key());
                let age = entry.opened_at.elapsed();
                let ready = entry.entries.len() >= thresholds.size_threshold
                    || age >= thresholds.time_threshold;
                let stale = age >= self.config.stale_after;

                (ready || stale).then(|| FlushCandidate {
                    category: entry.key().clone(),
                    window_id: entry.id,
                    record_count: entry.entries.len(),
                    stale: stale && !ready,
                })
            })
            .collect()
    }

    /// Remove and return every open window, ready or not. Shutdown path.
    pub fn drain_all(&self) -> Vec<(String, Uuid, Vec<BatchEntry>)> {
        let categories: Vec<String> = self.windows.iter().map(|entry| entry.key().clone()).collect();

        categories
            .into_iter()
            .filter_map(|category| {
                self.windows
                    .remove(&category)
                    .map(|(category, window)| (category, window.id, window.entries))
            })
            .collect()
    }

    /// Open windows, sorted by category for stable status output.
    pub fn snapshot(&self) -> Vec<WindowSnapshot> {
        let mut windows: Vec<WindowSnapshot> = self
            .windows
            .iter()
            .map(|entry| {
                let thresholds = self.config.thresholds_for(entry.key());
                let age = entry.opened_at.elapsed();
                WindowSnapshot {
                    category: entry.key().clone(),
                    window_id: entry.id,
                    record_count: entry.entries.len(),
                    window_age: age,
                    ready: entry.entries.len() >= thresholds.size_threshold
                        || age >= thresholds.time_threshold,
                }
            })
            .collect();

        windows.sort_by(|a, b| a.category.cmp(&b.category));
        windows
    }
}
