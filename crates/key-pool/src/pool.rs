//! First-fit key selection and aggregate fallback classification
//!
//! The pool holds credentials in a fixed priority order. `acquire` walks that
//! order and hands out the first key whose admission succeeds, so load is
//! deliberately skewed toward the front of the list. When no key admits the
//! caller, every key is classified once more and the pool reports one of
//! three blocked outcomes.
//!
//! There is no pool-wide lock: each credential guards its own state, and the
//! key list itself never changes after construction.

use std::collections::HashMap;
use std::sync::Arc;

use common::Secret;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::credential::{Credential, CredentialConfig, CredentialSnapshot, CredentialStatus};
use crate::error::{Error, Result};

/// A key handed out to a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub identity: Secret<String>,
    pub label: String,
}

/// Why no key could be handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Every key has used up its daily quota.
    RetryTomorrow,
    /// Every key is blocked and at least one is only rate-throttled.
    RetryInOneMinute,
    /// Some key looked free on re-check; another caller likely took it.
    NoneCurrentlyAvailable,
}

impl BlockReason {
    /// Label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            BlockReason::RetryTomorrow => "retry_tomorrow",
            BlockReason::RetryInOneMinute => "retry_in_one_minute",
            BlockReason::NoneCurrentlyAvailable => "none_currently_available",
        }
    }

    /// Message returned to callers in place of a model name.
    pub fn message(&self) -> &'static str {
        match self {
            BlockReason::RetryTomorrow => "Try again tomorrow",
            BlockReason::RetryInOneMinute => "Please wait 1 minute",
            BlockReason::NoneCurrentlyAvailable => "No key available right now, retry shortly",
        }
    }
}

/// Outcome of `Pool::acquire`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    Assigned(Assignment),
    Blocked(BlockReason),
}

impl Acquisition {
    pub fn is_assigned(&self) -> bool {
        matches!(self, Acquisition::Assigned(_))
    }
}

/// Ordered pool of rate-limited keys.
///
/// Construct once at startup and share by `Arc`; all methods take `&self`.
pub struct Pool {
    credentials: Vec<Credential>,
    clock: Arc<dyn Clock>,
}

impl Pool {
    /// Build a pool on the host's local clock.
    pub fn new(configs: Vec<CredentialConfig>) -> Result<Self> {
        Self::with_clock(configs, Arc::new(SystemClock))
    }

    /// Build a pool on the given clock.
    ///
    /// Rejects an empty list, empty or duplicate identities, and zero limits.
    /// List order is selection priority.
    pub fn with_clock(configs: Vec<CredentialConfig>, clock: Arc<dyn Clock>) -> Result<Self> {
        if configs.is_empty() {
            return Err(Error::EmptyPool);
        }

        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (index, config) in configs.iter().enumerate() {
            let identity = config.identity.expose().as_str();
            if identity.is_empty() {
                return Err(Error::EmptyIdentity { index });
            }
            if let Some(&first) = seen.get(identity) {
                return Err(Error::DuplicateIdentity { index, first });
            }
            seen.insert(identity, index);
            if config.rpm_limit == 0 {
                return Err(Error::ZeroLimit {
                    index,
                    limit: "rpm",
                });
            }
            if config.rpd_limit == 0 {
                return Err(Error::ZeroLimit {
                    index,
                    limit: "rpd",
                });
            }
        }

        let today = clock.now().date_naive();
        let credentials: Vec<Credential> = configs
            .into_iter()
            .map(|config| Credential::new(config, today))
            .collect();
        info!(keys = credentials.len(), day = %today, "key pool initialized");

        Ok(Self { credentials, clock })
    }

    /// Hand out the first admissible key in priority order, recording one
    /// use against it.
    ///
    /// When every key refuses, each is classified again without recording:
    /// - all daily-exhausted → `RetryTomorrow`
    /// - all blocked (exhausted or throttled) → `RetryInOneMinute`
    /// - anything else → `NoneCurrentlyAvailable`
    pub fn acquire(&self) -> Acquisition {
        let clock = self.clock.as_ref();
        for (index, credential) in self.credentials.iter().enumerate() {
            if credential.try_acquire(clock).is_available() {
                debug!(
                    index,
                    label = credential.label(),
                    fingerprint = credential.fingerprint(),
                    "key assigned"
                );
                return Acquisition::Assigned(Assignment {
                    identity: credential.identity().clone(),
                    label: credential.label().to_string(),
                });
            }
        }

        let statuses: Vec<CredentialStatus> = self
            .credentials
            .iter()
            .map(|credential| credential.status(clock))
            .collect();
        let reason = classify_blocked(&statuses);
        warn!(
            reason = reason.label(),
            keys = statuses.len(),
            exhausted = count(&statuses, CredentialStatus::DailyExhausted),
            throttled = count(&statuses, CredentialStatus::RateThrottled),
            "no key available"
        );
        Acquisition::Blocked(reason)
    }

    /// Per-key usage, in priority order.
    pub fn snapshots(&self) -> Vec<CredentialSnapshot> {
        let clock = self.clock.as_ref();
        self.credentials
            .iter()
            .map(|credential| credential.snapshot(clock))
            .collect()
    }

    /// Pool health summary for the health endpoint.
    ///
    /// Status mapping: all available → healthy, some available → degraded,
    /// none available → unhealthy. Keys appear by label and fingerprint only.
    pub fn health(&self) -> serde_json::Value {
        let snapshots = self.snapshots();
        let statuses: Vec<CredentialStatus> = snapshots.iter().map(|s| s.status).collect();
        let total = statuses.len();
        let available = count(&statuses, CredentialStatus::Available);

        let status = if available == total {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        let keys: Vec<serde_json::Value> = snapshots
            .iter()
            .map(|s| {
                serde_json::json!({
                    "label": s.label,
                    "fingerprint": s.fingerprint,
                    "status": s.status.label(),
                    "used_this_minute": s.used_this_minute,
                    "rpm_limit": s.rpm_limit,
                    "used_today": s.used_today,
                    "rpd_limit": s.rpd_limit,
                })
            })
            .collect();

        serde_json::json!({
            "status": status,
            "keys_total": total,
            "keys_available": available,
            "keys_rate_throttled": count(&statuses, CredentialStatus::RateThrottled),
            "keys_daily_exhausted": count(&statuses, CredentialStatus::DailyExhausted),
            "keys": keys
        })
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// Always false for a constructed pool; provided for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }
}

/// Aggregate the statuses of a pool in which no key admitted the caller.
fn classify_blocked(statuses: &[CredentialStatus]) -> BlockReason {
    if statuses
        .iter()
        .all(|s| *s == CredentialStatus::DailyExhausted)
    {
        BlockReason::RetryTomorrow
    } else if statuses.iter().all(|s| !s.is_available()) {
        BlockReason::RetryInOneMinute
    } else {
        BlockReason::NoneCurrentlyAvailable
    }
}

fn count(statuses: &[CredentialStatus], wanted: CredentialStatus) -> usize {
    statuses.iter().filter(|s| **s == wanted).count()
}
