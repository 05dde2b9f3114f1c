use std::fmt::Debug;

use chrono::NaiveDate;
use log::*;

use crate::{
    clock::SharedClock,
    db_types::{CancellationAnalytics, CancellationPolicy, NewCancellationPolicy, Principal},
    traits::{CancellationPolicyManagement, OrderFlowError},
    validation::{validate_policy, ValidationErrors},
};

/// The longest range the analytics query will return, in days.
pub const MAX_ANALYTICS_RANGE_DAYS: i64 = 366;

/// Cancellation policy administration and the daily cancellation analytics.
pub struct PolicyApi<B> {
    db: B,
    clock: SharedClock,
}

impl<B: Clone> Clone for PolicyApi<B> {
    fn clone(&self) -> Self {
        Self { db: self.db.clone(), clock: self.clock.clone() }
    }
}

impl<B> Debug for PolicyApi<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PolicyApi")
    }
}

impl<B> PolicyApi<B>
where B: CancellationPolicyManagement
{
    pub fn new(db: B, clock: SharedClock) -> Self {
        Self { db, clock }
    }

    pub async fn active_policy(&self) -> Result<CancellationPolicy, OrderFlowError> {
        self.db.fetch_active_policy().await?.ok_or(OrderFlowError::NoActivePolicy)
    }

    /// Makes sure there is an active policy, creating one from `seed` if the store has none.
    pub async fn ensure_active_policy(&self, seed: NewCancellationPolicy) -> Result<CancellationPolicy, OrderFlowError> {
        if let Some(policy) = self.db.fetch_active_policy().await? {
            debug!("🪛️ Using cancellation policy #{}: {}", policy.id, policy.description);
            return Ok(policy);
        }
        validate_policy(&seed)?;
        let policy = self.db.insert_policy(seed, "system", self.clock.now()).await?;
        info!("🪛️ No cancellation policy was configured. Seeded policy #{}: {}", policy.id, policy.description);
        Ok(policy)
    }

    /// Creates a new active policy version. Orders already placed keep the policy they were placed under.
    pub async fn replace_policy(
        &self,
        admin: &Principal,
        policy: NewCancellationPolicy,
    ) -> Result<CancellationPolicy, OrderFlowError> {
        if !admin.is_admin() {
            return Err(OrderFlowError::Forbidden("Only admins can change the cancellation policy.".to_string()));
        }
        validate_policy(&policy)?;
        self.db.insert_policy(policy, &admin.user_id, self.clock.now()).await
    }

    pub async fn cancellation_analytics(
        &self,
        admin: &Principal,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<CancellationAnalytics>, OrderFlowError> {
        if !admin.is_admin() {
            return Err(OrderFlowError::Forbidden("Only admins can read cancellation analytics.".to_string()));
        }
        if to < from {
            return Err(ValidationErrors::single("to", "must not be before 'from'").into());
        }
        if (to - from).num_days() >= MAX_ANALYTICS_RANGE_DAYS {
            return Err(ValidationErrors::single("to", format!("range must be under {MAX_ANALYTICS_RANGE_DAYS} days")).into());
        }
        self.db.fetch_cancellation_analytics(from, to).await
    }
}
