use super::PublishingCoordinator;
use crate::error::Result;
use crate::providers::{AccountRef, AnalyticsPoint};
use crate::rate_limit::OperationClass;
use futures::TryStreamExt;
use tracing::info;

/// Longest history a caller may ask for
pub const MAX_ANALYTICS_DAYS: u32 = 90;

impl PublishingCoordinator {
    /// Collect the analytics of one of the caller's integrations for the last
    /// `days_back` days.
    ///
    /// The whole paginated sequence is one call under the `analytics`
    /// operation class; a retry restarts it from the first page.
    pub async fn analytics(
        &self,
        user_id: &str,
        integration_id: &str,
        days_back: u32,
    ) -> Result<Vec<AnalyticsPoint>> {
        let (integration, adapter) = self.resolve(user_id, integration_id)?;
        let access_token = self.vault.ensure_fresh(&integration.id).await?;
        let days_back = days_back.clamp(1, MAX_ANALYTICS_DAYS);

        let account = AccountRef {
            integration_id: integration.id.clone(),
            internal_id: integration.internal_id.clone(),
            metadata: integration.platform_metadata.clone(),
        };

        let points = self
            .policy
            .execute(&integration.provider, OperationClass::Analytics, || {
                adapter
                    .analytics(&account, &access_token, days_back)
                    .try_collect::<Vec<_>>()
            })
            .await?;

        info!(
            integration_id = %integration.id,
            provider = %integration.provider,
            days_back = days_back,
            points = points.len(),
            "Analytics collected"
        );
        Ok(points)
    }
}
