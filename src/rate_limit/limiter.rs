use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use metrics::counter;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::store::{Batch, EphemeralStore, Reply, StoreError};

use super::config::{TierConfig, TierConfigError};

const TARGET: &str = "soffio_guard::ratelimit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Rejected { retry_after_secs: u64 },
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// Outcome of one tier check, with the budget figures advertised to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub tier: String,
    pub decision: Decision,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the oldest counted attempt leaves the window.
    pub reset_secs: u64,
}

impl Verdict {
    fn unconstrained(tier: &TierConfig) -> Self {
        Self {
            tier: tier.name.clone(),
            decision: Decision::Allowed,
            limit: tier.max_requests.get(),
            remaining: tier.max_requests.get(),
            reset_secs: ceil_secs(tier.window_ms()),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.decision.is_allowed()
    }
}

/// Combined result of checking every tier that applies to a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Admission {
    pub verdicts: Vec<Verdict>,
}

impl Admission {
    /// Rejected if any tier rejects; the retry hint is the largest among them.
    pub fn decision(&self) -> Decision {
        self.verdicts
            .iter()
            .filter_map(|verdict| match verdict.decision {
                Decision::Rejected { retry_after_secs } => Some(retry_after_secs),
                Decision::Allowed => None,
            })
            .max()
            .map_or(Decision::Allowed, |retry_after_secs| Decision::Rejected {
                retry_after_secs,
            })
    }

    /// The verdict with the least remaining budget, used for response headers.
    pub fn most_constrained(&self) -> Option<&Verdict> {
        self.verdicts
            .iter()
            .min_by_key(|verdict| (verdict.remaining, std::cmp::Reverse(verdict.reset_secs)))
    }

    /// Name of the first rejecting tier.
    pub fn rejecting_tier(&self) -> Option<&str> {
        self.verdicts
            .iter()
            .find(|verdict| !verdict.is_allowed())
            .map(|verdict| verdict.tier.as_str())
    }
}

/// Sliding-window limiter. Every attempt is recorded under a fresh UUID member
/// scored by its timestamp, so attempts landing in the same millisecond are
/// counted separately.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn EphemeralStore>,
    clock: Arc<dyn Clock>,
    tiers: Arc<HashMap<String, TierConfig>>,
    namespace: Arc<str>,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        clock: Arc<dyn Clock>,
        tiers: Vec<TierConfig>,
        namespace: impl Into<String>,
    ) -> Result<Self, TierConfigError> {
        let mut by_name = HashMap::with_capacity(tiers.len());
        for tier in tiers {
            if tier.name.trim().is_empty() {
                return Err(TierConfigError::EmptyName);
            }
            if tier.window_ms() == 0 {
                return Err(TierConfigError::ZeroWindow(tier.name));
            }
            if by_name.contains_key(&tier.name) {
                return Err(TierConfigError::Duplicate(tier.name));
            }
            by_name.insert(tier.name.clone(), tier);
        }

        Ok(Self {
            store,
            clock,
            tiers: Arc::new(by_name),
            namespace: Arc::from(namespace.into()),
        })
    }

    pub fn tier(&self, name: &str) -> Option<&TierConfig> {
        self.tiers.get(name)
    }

    /// Fail unless every name in `names` is a configured tier.
    pub fn ensure_tiers<'a>(
        &self,
        route: &str,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), TierConfigError> {
        let mut seen = HashSet::new();
        for name in names {
            if seen.insert(name) && !self.tiers.contains_key(name) {
                return Err(TierConfigError::UnknownTier {
                    route: route.to_string(),
                    tier: name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn window_key(&self, tier: &str, subject: &str) -> String {
        format!("{}ratelimit:{tier}:{subject}", self.namespace)
    }

    /// Record one attempt for `subject` on `tier` and decide whether it fits the
    /// window. Store failures and unknown tiers allow the request.
    pub async fn check(&self, tier: &str, subject: &str) -> Verdict {
        let Some(config) = self.tiers.get(tier) else {
            warn!(target: TARGET, tier, subject, "unknown rate limit tier; allowing request");
            return Verdict {
                tier: tier.to_string(),
                decision: Decision::Allowed,
                limit: u32::MAX,
                remaining: u32::MAX,
                reset_secs: 0,
            };
        };

        let verdict = match self.record_attempt(config, subject).await {
            Ok(verdict) => verdict,
            Err(err) => {
                counter!("soffio_guard_ratelimit_store_error_total").increment(1);
                warn!(
                    target: TARGET,
                    op = "check",
                    tier,
                    subject,
                    error = %err,
                    "rate limit store unavailable; failing open"
                );
                Verdict::unconstrained(config)
            }
        };

        match verdict.decision {
            Decision::Allowed => {
                counter!("soffio_guard_ratelimit_allowed_total", "tier" => config.name.clone())
                    .increment(1);
            }
            Decision::Rejected { retry_after_secs } => {
                counter!("soffio_guard_ratelimit_rejected_total", "tier" => config.name.clone())
                    .increment(1);
                debug!(target: TARGET, tier, subject, retry_after_secs, "rate limited");
            }
        }
        verdict
    }

    /// Check every `(tier, subject)` pair concurrently.
    pub async fn check_all(&self, checks: &[(&str, &str)]) -> Admission {
        let verdicts = join_all(
            checks
                .iter()
                .map(|(tier, subject)| self.check(tier, subject)),
        )
        .await;
        Admission { verdicts }
    }

    async fn record_attempt(&self, tier: &TierConfig, subject: &str) -> Result<Verdict, StoreError> {
        let key = self.window_key(&tier.name, subject);
        let now = self.clock.now_ms();
        let window_ms = tier.window_ms();
        let member = Uuid::new_v4().to_string();

        // add, prune, count, oldest, refresh expiry: one MULTI/EXEC.
        let batch = Batch::new()
            .zadd(key.as_str(), now, member)
            .zrem_range_by_score(key.as_str(), i64::MIN, now.saturating_sub(window_ms) - 1)
            .zcard(key.as_str())
            .zrange(key.as_str(), 0, 0)
            .expire(key.as_str(), tier.window);

        let mut replies = self.store.execute_atomic(batch).await?.into_iter();
        let _added = replies.next();
        let _pruned = replies.next();
        let count = replies
            .next()
            .ok_or_else(|| StoreError::protocol("missing ZCARD reply"))?
            .as_int()?;
        let oldest = replies
            .next()
            .map(Reply::into_members)
            .transpose()?
            .and_then(|members| members.into_iter().next())
            .map_or(now, |scored| scored.score);

        let limit = tier.max_requests.get();
        let count = u64::try_from(count).unwrap_or(0);
        // First instant at which the oldest counted attempt is pruned.
        let until_reset_ms = oldest.saturating_add(window_ms).saturating_add(1) - now;
        let reset_secs = ceil_secs(until_reset_ms);

        let decision = if count > u64::from(limit) {
            Decision::Rejected {
                retry_after_secs: reset_secs.max(1),
            }
        } else {
            Decision::Allowed
        };

        Ok(Verdict {
            tier: tier.name.clone(),
            decision,
            limit,
            remaining: u32::try_from(u64::from(limit).saturating_sub(count)).unwrap_or(0),
            reset_secs,
        })
    }
}

fn ceil_secs(ms: i64) -> u64 {
    u64::try_from(ms).map_or(0, |ms| ms.div_ceil(1000))
}
