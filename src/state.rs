use sqlx::SqlitePool;

use crate::config::{CoreConfig, LedgerPolicy};
use crate::time::ClockHandle;
use crate::{db, migrate, AppError, AppResult};

/// Handle passed into every core operation.
#[derive(Clone, Debug)]
pub struct CoreState {
    pub pool: SqlitePool,
    pub clock: ClockHandle,
    pub policy: LedgerPolicy,
}

impl CoreState {
    pub fn new(pool: SqlitePool, clock: ClockHandle, policy: LedgerPolicy) -> Self {
        Self {
            pool,
            clock,
            policy,
        }
    }

    /// Opens the configured store, brings its schema up to date and uses the system clock.
    pub async fn open(config: &CoreConfig) -> AppResult<Self> {
        let pool = db::open_pool(config).await?;
        migrate::apply_migrations(&pool)
            .await
            .map_err(|err| AppError::from(err).with_context("operation", "apply_migrations"))?;
        Ok(Self::new(pool, ClockHandle::system(), config.policy))
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}
