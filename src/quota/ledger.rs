use super::{AllotmentInfo, Bucket, Tier, TierConfig, UserQuota, WaitEstimate, ANONYMOUS};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Who is asking to create an experiment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    User(String),
    Anonymous { ip: String },
}

impl Caller {
    pub fn user(id: impl Into<String>) -> Self {
        Caller::User(id.into())
    }

    pub fn anonymous(ip: impl Into<String>) -> Self {
        Caller::Anonymous { ip: ip.into() }
    }
}

/// Persistence the ledger reads quota records from and patches them into
pub trait QuotaStore {
    fn user_quota(&self, user_id: &str) -> Result<Option<UserQuota>>;
    fn save_user_quota(&self, user_id: &str, quota: &UserQuota) -> Result<()>;
    fn anonymous_bucket(&self, ip: &str) -> Result<Option<Bucket>>;
    fn save_anonymous_bucket(&self, ip: &str, bucket: &Bucket) -> Result<()>;
}

impl<T: QuotaStore + ?Sized> QuotaStore for &T {
    fn user_quota(&self, user_id: &str) -> Result<Option<UserQuota>> {
        (**self).user_quota(user_id)
    }

    fn save_user_quota(&self, user_id: &str, quota: &UserQuota) -> Result<()> {
        (**self).save_user_quota(user_id, quota)
    }

    fn anonymous_bucket(&self, ip: &str) -> Result<Option<Bucket>> {
        (**self).anonymous_bucket(ip)
    }

    fn save_anonymous_bucket(&self, ip: &str, bucket: &Bucket) -> Result<()> {
        (**self).save_anonymous_bucket(ip, bucket)
    }
}

/// Gatekeeper for billable work.
///
/// The read in `try_consume` and the write that follows are separate store
/// calls. Two simultaneous requests from the same caller can both pass the
/// check and both be charged from the same refilled value.
pub struct QuotaLedger<S: QuotaStore> {
    store: S,
}

struct Resolved {
    tier: Option<Tier>,
    bucket: Bucket,
    config: TierConfig,
    label: String,
}

impl<S: QuotaStore> QuotaLedger<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn resolve(&self, caller: &Caller) -> Result<Resolved> {
        match caller {
            Caller::User(id) => {
                let quota = self
                    .store
                    .user_quota(id)?
                    .ok_or_else(|| Error::NotFound(format!("user {}", id)))?;
                Ok(Resolved {
                    tier: Some(quota.tier),
                    bucket: quota.bucket,
                    config: quota.tier.config(),
                    label: quota.tier.to_string(),
                })
            }
            Caller::Anonymous { ip } => {
                // anonymous records are created lazily on first consumption
                let bucket = self
                    .store
                    .anonymous_bucket(ip)?
                    .unwrap_or_else(|| Bucket::full(ANONYMOUS));
                Ok(Resolved {
                    tier: None,
                    bucket,
                    config: ANONYMOUS,
                    label: "anonymous".to_string(),
                })
            }
        }
    }

    pub fn allotment_info(&self, caller: &Caller) -> Result<AllotmentInfo> {
        self.allotment_info_at(caller, Utc::now())
    }

    pub fn allotment_info_at(&self, caller: &Caller, now: DateTime<Utc>) -> Result<AllotmentInfo> {
        let resolved = self.resolve(caller)?;
        Ok(AllotmentInfo::new(
            &resolved.bucket,
            resolved.config,
            &resolved.label,
            now,
        ))
    }

    pub fn try_consume(&self, caller: &Caller, picture_already_used: bool) -> Result<()> {
        self.try_consume_at(caller, picture_already_used, Utc::now())
    }

    /// Charge one unit unless the picture was already charged.
    pub fn try_consume_at(
        &self,
        caller: &Caller,
        picture_already_used: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if picture_already_used {
            debug!("picture already charged for {:?}, experiment is free", caller);
            return Ok(());
        }

        let resolved = self.resolve(caller)?;
        let refilled = resolved.bucket.refilled(resolved.config, now);
        if refilled < 1.0 {
            let wait = WaitEstimate::until_next(refilled, resolved.config);
            let message = match wait {
                Some(w) => format!(
                    "Experiment limit reached for the {} tier. Next experiment available in {}.",
                    resolved.label, w
                ),
                None => format!("Experiment limit reached for the {} tier.", resolved.label),
            };
            info!("quota exceeded for {:?}: {:.3} available", caller, refilled);
            return Err(Error::QuotaExceeded { message, wait });
        }

        let bucket = Bucket {
            allotment: (refilled - 1.0).max(0.0),
            last_consumed_at: Some(now),
        };
        match (caller, resolved.tier) {
            (Caller::User(id), Some(tier)) => {
                self.store.save_user_quota(id, &UserQuota { tier, bucket })?
            }
            (Caller::Anonymous { ip }, _) => self.store.save_anonymous_bucket(ip, &bucket)?,
            (Caller::User(id), None) => return Err(Error::NotFound(format!("user {}", id))),
        }
        debug!(
            "consumed one unit for {:?}, {:.3} left",
            caller, bucket.allotment
        );
        Ok(())
    }

    /// Subscription change: the bucket is refilled to the new maximum at once.
    pub fn change_tier(&self, user_id: &str, tier: Tier) -> Result<()> {
        let current = self
            .store
            .user_quota(user_id)?
            .ok_or_else(|| Error::NotFound(format!("user {}", user_id)))?;
        let quota = UserQuota {
            tier,
            bucket: Bucket {
                allotment: tier.config().max_allotment,
                last_consumed_at: current.bucket.last_consumed_at,
            },
        };
        self.store.save_user_quota(user_id, &quota)?;
        info!("user {} moved from {} to {}", user_id, current.tier, tier);
        Ok(())
    }
}
