//! Rate governor
//!
//! The remote service rejects an identical query (same table, condition, offset
//! and limit) repeated inside its cooldown window, and expects a pause between
//! any two queries. The governor keeps the state needed to honour both:
//!
//! - **Cooldown**: signature → time it was last armed. A signature is armed by a
//!   successful query or by the service reporting `RateLimited`; transient
//!   failures do not arm it, so backoff retries of the same page stay possible.
//! - **Spacing**: time of the most recent query of any signature.
//! - **Backoff**: exponential delay between retries of transient failures.
//!
//! Pages blocked by cooldown never reach the adapter; they are deferred and
//! parked in a [`DeferredQueue`].

use crate::config::QueryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

mod deferred;

pub use deferred::DeferredQueue;

/// Identity of a query for rate-budget purposes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuerySignature {
    /// Remote table name
    pub table: String,
    /// Rendered condition
    pub condition: String,
    /// Window offset
    pub offset: u64,
    /// Window limit
    pub limit: u64,
}

impl QuerySignature {
    /// Create a signature
    pub fn new(table: &str, condition: &str, offset: u64, limit: u64) -> Self {
        Self {
            table: table.to_string(),
            condition: condition.to_string(),
            offset,
            limit,
        }
    }
}

/// Decision for a query about to be issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The query may be issued (after pacing)
    Ready,
    /// The signature is cooling down until `ready_at`
    Deferred {
        /// Earliest instant the signature may be reissued
        ready_at: Instant,
    },
}

/// Cooldown, spacing and backoff state for one session
#[derive(Debug)]
pub struct RateGovernor {
    policy: QueryPolicy,
    armed: HashMap<QuerySignature, Instant>,
    last_query: Option<Instant>,
}

impl RateGovernor {
    /// Create a governor enforcing `policy`
    pub fn new(policy: QueryPolicy) -> Self {
        Self {
            policy,
            armed: HashMap::new(),
            last_query: None,
        }
    }

    /// Policy in force
    pub fn policy(&self) -> &QueryPolicy {
        &self.policy
    }

    /// Decide whether `signature` may be issued now
    pub fn admit(&self, signature: &QuerySignature) -> Admission {
        match self.armed.get(signature) {
            Some(armed_at) => {
                let ready_at = *armed_at + self.policy.cooldown;
                if Instant::now() < ready_at {
                    Admission::Deferred { ready_at }
                } else {
                    Admission::Ready
                }
            }
            None => Admission::Ready,
        }
    }

    /// Arm the cooldown for a signature that was just answered
    pub fn record_attempt(&mut self, signature: &QuerySignature) {
        self.armed.insert(signature.clone(), Instant::now());
    }

    /// Arm the cooldown after a service-reported rate limit; returns the ready time
    pub fn record_rate_limited(&mut self, signature: &QuerySignature) -> Instant {
        let now = Instant::now();
        self.armed.insert(signature.clone(), now);
        now + self.policy.cooldown
    }

    /// Wait out the minimum spacing since the previous query, then claim the slot
    pub async fn pace(&mut self) {
        if let Some(last) = self.last_query {
            let ready_at = last + self.policy.min_spacing;
            if Instant::now() < ready_at {
                debug!(
                    wait_ms = (ready_at - Instant::now()).as_millis() as u64,
                    "Pacing before next query"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
        self.last_query = Some(Instant::now());
    }

    /// Backoff delay before retry number `retry_count` (0-based)
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        self.policy.backoff(retry_count)
    }

    /// Re-arm a signature issued at wall-clock time `at` by an earlier run
    ///
    /// Signatures whose cooldown has already elapsed are ignored. Returns whether
    /// the signature was armed.
    pub fn seed(&mut self, signature: QuerySignature, at: DateTime<Utc>) -> bool {
        let Ok(age) = (Utc::now() - at).to_std() else {
            // Issued "in the future" (clock skew): treat as just issued
            self.armed.insert(signature, Instant::now());
            return true;
        };
        if age >= self.policy.cooldown {
            return false;
        }
        let armed_at = Instant::now().checked_sub(age).unwrap_or_else(Instant::now);
        self.armed.insert(signature, armed_at);
        true
    }

    /// Signatures still cooling down, with the wall-clock time they were armed
    ///
    /// Persisted with the manifest so a resumed run can [`seed`](Self::seed) them.
    pub fn snapshot(&self) -> Vec<(QuerySignature, DateTime<Utc>)> {
        let now = Instant::now();
        let wall_now = Utc::now();
        let mut active: Vec<_> = self
            .armed
            .iter()
            .filter(|(_, armed_at)| now < **armed_at + self.policy.cooldown)
            .filter_map(|(signature, armed_at)| {
                let age = chrono::Duration::from_std(now - *armed_at).ok()?;
                Some((signature.clone(), wall_now - age))
            })
            .collect();
        active.sort_by(|a, b| a.1.cmp(&b.1));
        active
    }

    /// Drop signatures whose cooldown has elapsed
    pub fn prune_expired(&mut self) {
        let cooldown = self.policy.cooldown;
        let now = Instant::now();
        self.armed.retain(|_, armed_at| now < *armed_at + cooldown);
    }

    /// Number of signatures currently tracked
    pub fn tracked(&self) -> usize {
        self.armed.len()
    }
}
