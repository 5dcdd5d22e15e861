#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use routinely_lib::auth::{AuthContext, Role};
use routinely_lib::catalog::{
    self, Routine, RoutineCreate, RoutineTask, RoutineType, TaskCreate,
};
use routinely_lib::config::LedgerPolicy;
use routinely_lib::ledger;
use routinely_lib::time::{ClockHandle, ManualClock};
use routinely_lib::{db, migrate, CoreState};
use serde_json::Value;
use sqlx::SqlitePool;

pub const FAMILY: &str = "fam-maple";
pub const OTHER_FAMILY: &str = "fam-birch";
pub const PARENT: &str = "prof-parent";
pub const CHILD_A: &str = "prof-ava";
pub const CHILD_B: &str = "prof-ben";
pub const OUTSIDER: &str = "prof-olive";

pub const REWARD_BIG: &str = "reward-bike";
pub const REWARD_ONCE: &str = "reward-movie";
pub const REWARD_HIDDEN: &str = "reward-candy";

/// 2026-03-02 06:30 UTC, a Monday morning.
pub fn start_instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 6, 30, 0).unwrap()
}

pub struct Harness {
    pub state: CoreState,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn pool(&self) -> &SqlitePool {
        &self.state.pool
    }

    pub fn parent(&self) -> AuthContext {
        AuthContext::new(PARENT, FAMILY, Role::Parent)
    }

    pub fn child(&self, profile_id: &str) -> AuthContext {
        AuthContext::new(profile_id, FAMILY, Role::Child)
    }

    pub fn outsider(&self) -> AuthContext {
        AuthContext::new(OUTSIDER, OTHER_FAMILY, Role::Parent)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.state.clock.now()
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.clock.advance(Duration::minutes(minutes));
    }

    /// Credits `points` through a guardian adjustment.
    pub async fn credit(&self, profile_id: &str, points: i64) -> Result<()> {
        ledger::create_manual_adjustment(&self.state, &self.parent(), profile_id, points, "seed")
            .await?;
        Ok(())
    }

    pub async fn balance(&self, profile_id: &str) -> Result<i64> {
        Ok(ledger::get_balance(&self.state, &self.parent(), profile_id).await?)
    }

    pub async fn ledger_rows(&self, profile_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM point_transactions WHERE profile_id = ?1")
                .bind(profile_id)
                .fetch_one(self.pool())
                .await?;
        Ok(count)
    }

    /// A routine assigned to `child` with one task per entry in `points`.
    pub async fn routine_with_tasks(
        &self,
        slug: &str,
        child: &str,
        points: &[i64],
        auto_close_after_minutes: Option<i64>,
        settings: Option<Value>,
    ) -> Result<(Routine, Vec<RoutineTask>)> {
        let ctx = self.parent();
        let routine = catalog::create_routine(
            &self.state,
            &ctx,
            RoutineCreate {
                name: slug.replace('-', " "),
                slug: slug.to_string(),
                routine_type: Some(RoutineType::Morning),
                auto_close_after_minutes,
                settings,
                ..Default::default()
            },
        )
        .await?;
        catalog::assign_child(&self.state, &ctx, &routine.id, child, 1, true).await?;
        let mut tasks = Vec::with_capacity(points.len());
        for (index, value) in points.iter().enumerate() {
            let task = catalog::create_task(
                &self.state,
                &ctx,
                &routine.id,
                child,
                TaskCreate {
                    name: format!("task {}", index + 1),
                    points: Some(*value),
                    ..Default::default()
                },
            )
            .await?;
            tasks.push(task);
        }
        Ok((routine, tasks))
    }
}

pub async fn harness() -> Result<Harness> {
    harness_with(LedgerPolicy::default(), "UTC").await
}

pub async fn harness_with(policy: LedgerPolicy, timezone: &str) -> Result<Harness> {
    let pool = db::open_memory_pool().await?;
    migrate::apply_migrations(&pool).await?;
    seed(&pool, timezone).await?;
    let clock = Arc::new(ManualClock::new(start_instant()));
    let state = CoreState::new(pool, ClockHandle::manual(clock.clone()), policy);
    Ok(Harness { state, clock })
}

/// Families, profiles and rewards are owned by other services; tests insert them directly.
pub async fn seed(pool: &SqlitePool, timezone: &str) -> Result<()> {
    let now = start_instant().timestamp_millis();
    for (id, name, tz) in [
        (FAMILY, "Maple", timezone),
        (OTHER_FAMILY, "Birch", "UTC"),
    ] {
        sqlx::query(
            "INSERT INTO families (id, family_name, timezone, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?4)",
        )
        .bind(id)
        .bind(name)
        .bind(tz)
        .bind(now)
        .execute(pool)
        .await?;
    }
    for (id, family, name, role) in [
        (PARENT, FAMILY, "Parent", "parent"),
        (CHILD_A, FAMILY, "Ava", "child"),
        (CHILD_B, FAMILY, "Ben", "child"),
        (OUTSIDER, OTHER_FAMILY, "Olive", "child"),
    ] {
        sqlx::query(
            "INSERT INTO profiles (id, family_id, display_name, role, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        )
        .bind(id)
        .bind(family)
        .bind(name)
        .bind(role)
        .bind(now)
        .execute(pool)
        .await?;
    }
    for (id, name, cost, repeatable) in [
        (REWARD_BIG, "New bike", 100, true),
        (REWARD_ONCE, "Movie night", 30, false),
        (REWARD_HIDDEN, "Candy", 10, true),
    ] {
        sqlx::query(
            "INSERT INTO rewards (id, family_id, name, cost_points, is_active, is_repeatable, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?6)",
        )
        .bind(id)
        .bind(FAMILY)
        .bind(name)
        .bind(cost)
        .bind(repeatable)
        .bind(now)
        .execute(pool)
        .await?;
    }
    sqlx::query(
        "INSERT INTO reward_child_visibility (id, reward_id, child_profile_id, is_visible, \
         created_at, updated_at) VALUES ('vis-1', ?1, ?2, 0, ?3, ?3)",
    )
    .bind(REWARD_HIDDEN)
    .bind(CHILD_B)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}
