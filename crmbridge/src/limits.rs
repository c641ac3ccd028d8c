//! Rate limiting for downstream CRM capacity.
//!
//! The CRM budget is enforced across several sliding windows at once
//! (per-second, per-minute, per-day by default). An admission counts in
//! every tier, and a call is admitted only when all tiers have headroom;
//! the check and the increments happen under one lock so concurrent callers
//! can never jointly overshoot a ceiling. Windows slide continuously:
//! admission timestamps are pruned as they age out rather than on a fixed
//! boundary.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use utoipa::ToSchema;

use crate::config::RateLimitTier;

/// Extra wait added to every denial hint so the oldest admission has
/// actually aged out when the caller retries.
const RETRY_BUFFER: Duration = Duration::from_secs(1);

/// Outcome of asking the limiter for one admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Admission recorded in every tier
    Allowed,
    /// A tier is at its ceiling; retry once `retry_after` has elapsed
    Denied { tier: String, retry_after: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Point-in-time usage of one tier, for the status surface.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TierUsage {
    pub name: String,
    pub used: usize,
    pub limit: usize,
    /// Window length in seconds
    pub window_secs: u64,
}

struct TierState {
    name: String,
    limit: usize,
    window: Duration,
    admissions: VecDeque<Instant>,
}

impl TierState {
    /// Drop admissions that have slid out of the window.
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.admissions.front() {
            if now.duration_since(*oldest) >= self.window {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
    }

    /// When the oldest admission will age out, plus the retry buffer.
    fn retry_after(&self, now: Instant) -> Duration {
        match self.admissions.front() {
            Some(oldest) => self.window.saturating_sub(now.duration_since(*oldest)) + RETRY_BUFFER,
            // At ceiling with no admissions only occurs for a zero limit
            None => self.window + RETRY_BUFFER,
        }
    }
}

/// Multi-tier sliding-window rate limiter shared by single deliveries and
/// bulk jobs.
pub struct RateLimiter {
    tiers: Mutex<Vec<TierState>>,
}

impl RateLimiter {
    pub fn new(tiers: &[RateLimitTier]) -> Self {
        let tiers = tiers
            .iter()
            .map(|tier| TierState {
                name: tier.name.clone(),
                limit: tier.limit,
                window: tier.window,
                admissions: VecDeque::new(),
            })
            .collect();

        Self { tiers: Mutex::new(tiers) }
    }

    /// Attempt one admission across all tiers.
    ///
    /// On denial, reports the exceeded tier expected to free capacity
    /// soonest and a wait hint computed from its oldest admission's expiry.
    /// Nothing is recorded on denial.
    pub fn acquire(&self) -> Admission {
        let now = Instant::now();
        let mut tiers = self.tiers.lock();

        for tier in tiers.iter_mut() {
            tier.prune(now);
        }

        let denied = tiers
            .iter()
            .filter(|tier| tier.admissions.len() >= tier.limit)
            .min_by_key(|tier| tier.retry_after(now));

        if let Some(tier) = denied {
            return Admission::Denied {
                tier: tier.name.clone(),
                retry_after: tier.retry_after(now),
            };
        }

        for tier in tiers.iter_mut() {
            tier.admissions.push_back(now);
        }

        Admission::Allowed
    }

    /// Acquire, sleeping through denials whose hints fit in `max_wait`.
    ///
    /// Gives up with the last denial once the hinted wait would overrun the
    /// remaining budget.
    pub async fn acquire_within(&self, max_wait: Duration) -> Admission {
        let deadline = Instant::now() + max_wait;

        loop {
            match self.acquire() {
                Admission::Allowed => return Admission::Allowed,
                Admission::Denied { tier, retry_after } => {
                    if Instant::now() + retry_after > deadline {
                        return Admission::Denied { tier, retry_after };
                    }
                    tokio::time::sleep(retry_after).await;
                }
            }
        }
    }

    /// Current per-tier usage snapshot.
    pub fn usage(&self) -> Vec<TierUsage> {
        let now = Instant::now();
        let mut tiers = self.tiers.lock();

        tiers
            .iter_mut()
            .map(|tier| {
                tier.prune(now);
                TierUsage {
                    name: tier.name.clone(),
                    used: tier.admissions.len(),
                    limit: tier.limit,
                    window_secs: tier.window.as_secs(),
                }
            })
            .collect()
    }
}
