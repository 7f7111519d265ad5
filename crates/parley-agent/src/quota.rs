//! Admission control against the daily token ledger.

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use tracing::warn;
use uuid::Uuid;

use parley_core::config::ConfigHandle;
use parley_core::error::Result;
use parley_core::types::UsageLimits;
use parley_store::TokenLedger;

/// Tokens held before a turn starts; the real cost is settled afterwards.
pub const RESERVATION_UNIT: u64 = 1;

/// A granted hold, pinned to the UTC day it was taken on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub user_id: Uuid,
    pub day: NaiveDate,
    pub tokens: u64,
}

pub struct QuotaService {
    ledger: Arc<dyn TokenLedger>,
    config: ConfigHandle,
}

impl QuotaService {
    pub fn new(ledger: Arc<dyn TokenLedger>, config: ConfigHandle) -> Self {
        Self { ledger, config }
    }

    /// Reserve one unit for a turn; `None` means the daily budget is spent.
    pub async fn reserve(&self, user_id: Uuid) -> Result<Option<Reservation>> {
        let day = Utc::now().date_naive();
        let limit = self.config.snapshot().daily_token_limit(user_id);
        let granted = self
            .ledger
            .reserve(user_id, day, RESERVATION_UNIT, limit)
            .await?;
        Ok(granted.then_some(Reservation {
            user_id,
            day,
            tokens: RESERVATION_UNIT,
        }))
    }

    /// Fold the reservation into actual usage.
    pub async fn settle(&self, reservation: Reservation, actual: u64) -> Result<()> {
        self.ledger
            .confirm(reservation.user_id, reservation.day, reservation.tokens, actual)
            .await?;
        Ok(())
    }

    /// Settle, logging instead of failing; used on paths that already carry an outcome.
    pub async fn settle_or_log(&self, reservation: Reservation, actual: u64) {
        if let Err(e) = self.settle(reservation, actual).await {
            warn!(user_id = %reservation.user_id, actual, %e, "Failed to settle token reservation");
        }
    }

    pub async fn limits(&self, user_id: Uuid) -> Result<UsageLimits> {
        let day = Utc::now().date_naive();
        let limit = self.config.snapshot().daily_token_limit(user_id);
        let (used, reserved) = self.ledger.daily_usage(user_id, day).await?;
        Ok(UsageLimits::new(limit, used, reserved))
    }
}

#[cfg(test)]
mod tests {
    use parley_core::config::Config;
    use parley_store::{SqlTokenLedger, connect_with_settings, migrations::run_pending};

    use super::*;

    async fn service(config: &str) -> QuotaService {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.unwrap();
        run_pending(&pool).await.unwrap();
        let config = ConfigHandle::new(Config::parse(config).unwrap());
        QuotaService::new(Arc::new(SqlTokenLedger::new(pool)), config)
    }

    #[tokio::test]
    async fn test_reserve_settle_and_limits() {
        let service = service("{ quota: { daily_token_limit: 50 } }").await;
        let user = Uuid::new_v4();

        let reservation = service.reserve(user).await.unwrap().expect("granted");
        assert_eq!(service.limits(user).await.unwrap(), UsageLimits::new(50, 0, 1));

        service.settle(reservation, 50).await.unwrap();
        assert_eq!(service.limits(user).await.unwrap().remaining, 0);
        assert!(service.reserve(user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_per_user_override() {
        let user = Uuid::new_v4();
        let service =
            service(&format!("{{ quota: {{ daily_token_limit: 50, user_limits: {{ '{user}': 0 }} }} }}")).await;
        assert!(service.reserve(user).await.unwrap().is_none());
        assert!(service.reserve(Uuid::new_v4()).await.unwrap().is_some());
    }
}
