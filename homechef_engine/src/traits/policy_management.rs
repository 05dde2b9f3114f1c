use chrono::{DateTime, NaiveDate, Utc};

use crate::{
    db_types::{CancellationAnalytics, CancellationPolicy, NewCancellationPolicy},
    traits::OrderFlowError,
};

/// Versioned cancellation policies and the daily cancellation analytics they drive.
#[allow(async_fn_in_trait)]
pub trait CancellationPolicyManagement {
    async fn fetch_active_policy(&self) -> Result<Option<CancellationPolicy>, OrderFlowError>;

    /// Fetches a policy by id, whether or not it is still active. Orders keep the id of the policy they were placed
    /// under.
    async fn fetch_policy(&self, id: i64) -> Result<Option<CancellationPolicy>, OrderFlowError>;

    /// Creates a new active policy version and deactivates the previous one in a single transaction.
    async fn insert_policy(
        &self,
        policy: NewCancellationPolicy,
        updated_by: &str,
        now: DateTime<Utc>,
    ) -> Result<CancellationPolicy, OrderFlowError>;

    /// Daily buckets between `from` and `to`, inclusive, ordered by day.
    async fn fetch_cancellation_analytics(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<CancellationAnalytics>, OrderFlowError>;
}
