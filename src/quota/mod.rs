//! Token-bucket quotas for experiment creation.
//!
//! Each bucket refills continuously at `refill_per_day` up to
//! `max_allotment`. Nothing is stored between consumptions except the
//! allotment left after the last one and when it happened; the available
//! amount is recomputed from those on every read.

mod ledger;

pub use ledger::{Caller, QuotaLedger, QuotaStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MS_PER_DAY: f64 = 86_400_000.0;

/// Refill parameters of one bucket kind
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierConfig {
    pub max_allotment: f64,
    pub refill_per_day: f64,
}

pub const FREE: TierConfig = TierConfig {
    max_allotment: 3.0,
    refill_per_day: 3.0 / 7.0,
};

pub const PREMIUM: TierConfig = TierConfig {
    max_allotment: 100.0,
    refill_per_day: 100.0 / 30.0,
};

pub const PROFESSIONAL: TierConfig = TierConfig {
    max_allotment: 500.0,
    refill_per_day: 500.0 / 30.0,
};

/// Callers identified only by IP address
pub const ANONYMOUS: TierConfig = TierConfig {
    max_allotment: 5.0,
    refill_per_day: 5.0 / 30.0,
};

/// Membership tier of a registered user
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Tier {
    Free,
    Premium,
    Professional,
}

impl Tier {
    pub fn config(&self) -> TierConfig {
        match self {
            Tier::Free => FREE,
            Tier::Premium => PREMIUM,
            Tier::Professional => PROFESSIONAL,
        }
    }
}

/// Persisted state of one bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub allotment: f64,
    pub last_consumed_at: Option<DateTime<Utc>>,
}

impl Bucket {
    /// A bucket that has never been drawn from
    pub fn full(config: TierConfig) -> Self {
        Self {
            allotment: config.max_allotment,
            last_consumed_at: None,
        }
    }

    /// Allotment available at `now`, refilled since the last consumption.
    pub fn refilled(&self, config: TierConfig, now: DateTime<Utc>) -> f64 {
        refilled_allotment(self.allotment, self.last_consumed_at, now, config)
    }
}

/// Quota record of a registered user
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UserQuota {
    pub tier: Tier,
    pub bucket: Bucket,
}

pub fn refilled_allotment(
    allotment: f64,
    last_consumed_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    config: TierConfig,
) -> f64 {
    match last_consumed_at {
        None => config.max_allotment,
        Some(last) => {
            // a clock that went backwards refills nothing
            let elapsed_ms = (now - last).num_milliseconds().max(0) as f64;
            let refill = elapsed_ms / MS_PER_DAY * config.refill_per_day;
            (allotment.max(0.0) + refill).min(config.max_allotment)
        }
    }
}

/// Time until one more unit becomes available
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitEstimate {
    pub hours: f64,
}

impl WaitEstimate {
    /// `None` when at least one unit is already available.
    pub fn until_next(refilled: f64, config: TierConfig) -> Option<Self> {
        if refilled >= 1.0 || config.refill_per_day <= 0.0 {
            return None;
        }
        Some(Self {
            hours: (1.0 - refilled) / config.refill_per_day * 24.0,
        })
    }

    pub fn days(&self) -> f64 {
        self.hours / 24.0
    }
}

impl fmt::Display for WaitEstimate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.hours < 24.0 {
            let hours = self.hours.ceil().max(1.0) as u64;
            write!(f, "{} hour{}", hours, if hours == 1 { "" } else { "s" })
        } else {
            let days = self.days().ceil() as u64;
            write!(f, "{} day{}", days, if days == 1 { "" } else { "s" })
        }
    }
}

/// Snapshot of a caller's quota for display
#[derive(Debug, Clone, PartialEq)]
pub struct AllotmentInfo {
    /// Whole units available now
    pub available: u32,
    pub exact: f64,
    pub max: u32,
    pub tier_label: String,
    pub wait: Option<WaitEstimate>,
}

impl AllotmentInfo {
    pub fn new(bucket: &Bucket, config: TierConfig, tier_label: &str, now: DateTime<Utc>) -> Self {
        let exact = bucket.refilled(config, now);
        Self {
            available: exact.floor().max(0.0) as u32,
            exact,
            max: config.max_allotment as u32,
            tier_label: tier_label.to_string(),
            wait: WaitEstimate::until_next(exact, config),
        }
    }
}

impl fmt::Display for AllotmentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}/{}", self.tier_label, self.available, self.max)?;
        if let Some(wait) = self.wait {
            write!(f, " (next in {})", wait)?;
        }
        Ok(())
    }
}
