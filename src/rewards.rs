//! Reward redemptions and their ledger debits.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::auth::AuthContext;
use crate::db::{self, retry_read_once};
use crate::id::new_uuid_v7;
use crate::ledger::{append_in_tx, balance_in, NewTransaction, TransactionType};
use crate::op_logging::OpScope;
use crate::profiles::ensure_child_in_family;
use crate::state::CoreState;
use crate::time::{to_date, to_opt_date};
use crate::{AppError, AppResult, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedemptionStatus {
    Pending,
    Approved,
    Fulfilled,
    Rejected,
    Cancelled,
}

impl RedemptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RedemptionStatus::Pending => "pending",
            RedemptionStatus::Approved => "approved",
            RedemptionStatus::Fulfilled => "fulfilled",
            RedemptionStatus::Rejected => "rejected",
            RedemptionStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RedemptionStatus::Fulfilled | RedemptionStatus::Rejected | RedemptionStatus::Cancelled
        )
    }

    /// pending → approved | rejected | cancelled, approved → fulfilled | cancelled.
    pub fn can_transition_to(self, next: RedemptionStatus) -> bool {
        use RedemptionStatus::*;
        matches!(
            (self, next),
            (Pending, Approved) | (Pending, Rejected) | (Pending, Cancelled)
                | (Approved, Fulfilled)
                | (Approved, Cancelled)
        )
    }

    /// Transitions that hand the points back.
    pub fn refunds(self) -> bool {
        matches!(self, RedemptionStatus::Rejected | RedemptionStatus::Cancelled)
    }
}

impl fmt::Display for RedemptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RedemptionStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(RedemptionStatus::Pending),
            "approved" => Ok(RedemptionStatus::Approved),
            "fulfilled" => Ok(RedemptionStatus::Fulfilled),
            "rejected" => Ok(RedemptionStatus::Rejected),
            "cancelled" => Ok(RedemptionStatus::Cancelled),
            other => Err(AppError::validation("status", "Invalid redemption status")
                .with_context("value", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
    pub id: String,
    pub family_id: String,
    pub name: String,
    pub cost_points: i64,
    pub is_active: bool,
    pub is_repeatable: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<&SqliteRow> for Reward {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.try_get("id").map_err(AppError::from)?,
            family_id: row.try_get("family_id").map_err(AppError::from)?,
            name: row.try_get("name").map_err(AppError::from)?,
            cost_points: row.try_get("cost_points").map_err(AppError::from)?,
            is_active: row.try_get::<i64, _>("is_active").map_err(AppError::from)? != 0,
            is_repeatable: row.try_get::<i64, _>("is_repeatable").map_err(AppError::from)? != 0,
            deleted_at: to_opt_date(row.try_get("deleted_at").map_err(AppError::from)?),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardRedemption {
    pub id: String,
    pub reward_id: String,
    pub child_profile_id: String,
    pub points_cost: i64,
    pub status: RedemptionStatus,
    pub point_transaction_id: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub confirmed_by_profile_id: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by_profile_id: Option<String>,
    pub notes: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<&SqliteRow> for RewardRedemption {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        let status: String = row.try_get("status").map_err(AppError::from)?;
        let metadata: String = row.try_get("metadata").map_err(AppError::from)?;
        Ok(Self {
            id: row.try_get("id").map_err(AppError::from)?,
            reward_id: row.try_get("reward_id").map_err(AppError::from)?,
            child_profile_id: row.try_get("child_profile_id").map_err(AppError::from)?,
            points_cost: row.try_get("points_cost").map_err(AppError::from)?,
            status: status.parse()?,
            point_transaction_id: row.try_get("point_transaction_id").map_err(AppError::from)?,
            requested_at: to_date(row.try_get("requested_at").map_err(AppError::from)?),
            confirmed_at: to_opt_date(row.try_get("confirmed_at").map_err(AppError::from)?),
            confirmed_by_profile_id: row
                .try_get("confirmed_by_profile_id")
                .map_err(AppError::from)?,
            cancelled_at: to_opt_date(row.try_get("cancelled_at").map_err(AppError::from)?),
            cancelled_by_profile_id: row
                .try_get("cancelled_by_profile_id")
                .map_err(AppError::from)?,
            notes: row.try_get("notes").map_err(AppError::from)?,
            metadata: serde_json::from_str(&metadata)?,
            created_at: to_date(row.try_get("created_at").map_err(AppError::from)?),
            updated_at: to_date(row.try_get("updated_at").map_err(AppError::from)?),
        })
    }
}

const REDEMPTION_COLUMNS: &str = "id, reward_id, child_profile_id, points_cost, status, \
     point_transaction_id, requested_at, confirmed_at, confirmed_by_profile_id, cancelled_at, \
     cancelled_by_profile_id, notes, metadata, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedemptionUpdate {
    pub status: RedemptionStatus,
    pub notes: Option<String>,
}

async fn load_reward(conn: &mut SqliteConnection, reward_id: &str, family_id: &str) -> AppResult<Reward> {
    let row = sqlx::query(
        "SELECT id, family_id, name, cost_points, is_active, is_repeatable, deleted_at \
         FROM rewards WHERE id = ?1 AND family_id = ?2 AND deleted_at IS NULL",
    )
    .bind(reward_id)
    .bind(family_id)
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        Some(row) => Reward::try_from(&row),
        None => Err(AppError::not_found("reward", reward_id)),
    }
}

/// A visibility row may hide the reward from one child, or bound when it shows.
/// Without a row the reward is visible.
async fn ensure_visible(
    conn: &mut SqliteConnection,
    reward: &Reward,
    child_profile_id: &str,
    now_ms: i64,
) -> AppResult<()> {
    if !reward.is_active {
        return Err(AppError::forbidden("Reward is not active").with_context("reward_id", reward.id.clone()));
    }
    let row = sqlx::query(
        "SELECT is_visible, visible_from, visible_until FROM reward_child_visibility \
         WHERE reward_id = ?1 AND child_profile_id = ?2 AND deleted_at IS NULL",
    )
    .bind(&reward.id)
    .bind(child_profile_id)
    .fetch_optional(&mut *conn)
    .await?;
    let Some(row) = row else {
        return Ok(());
    };
    let is_visible = row.try_get::<i64, _>("is_visible").map_err(AppError::from)? != 0;
    let from: Option<i64> = row.try_get("visible_from").map_err(AppError::from)?;
    let until: Option<i64> = row.try_get("visible_until").map_err(AppError::from)?;
    let in_window = from.map_or(true, |from| now_ms >= from) && until.map_or(true, |until| now_ms <= until);
    if is_visible && in_window {
        Ok(())
    } else {
        Err(AppError::forbidden("Reward is not available to this child")
            .with_context("reward_id", reward.id.clone())
            .with_context("child_profile_id", child_profile_id))
    }
}

async fn load_redemption(
    conn: &mut SqliteConnection,
    redemption_id: &str,
    family_id: &str,
) -> AppResult<RewardRedemption> {
    let row = sqlx::query(&format!(
        "SELECT {REDEMPTION_COLUMNS} FROM reward_redemptions \
         WHERE id = ?1 AND reward_id IN (SELECT id FROM rewards WHERE family_id = ?2)"
    ))
    .bind(redemption_id)
    .bind(family_id)
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        Some(row) => RewardRedemption::try_from(&row),
        None => Err(AppError::not_found("reward_redemption", redemption_id)),
    }
}

/// Requests a reward: snapshots its cost, debits the child and records the
/// redemption as `pending`, all in one transaction.
pub async fn create_redemption(
    state: &CoreState,
    ctx: &AuthContext,
    reward_id: &str,
    child_profile_id: &str,
    notes: Option<String>,
) -> AppResult<RewardRedemption> {
    let scope = OpScope::new("rewards_create_redemption", Some(&ctx.family_id), Some(child_profile_id));
    let result = async {
        ctx.ensure_self_or_guardian(child_profile_id)?;
        let now = state.now_ms();
        let mut tx = db::begin_write(&state.pool).await?;
        ensure_child_in_family(&mut tx, child_profile_id, &ctx.family_id).await?;
        let reward = load_reward(&mut tx, reward_id, &ctx.family_id).await?;
        ensure_visible(&mut tx, &reward, child_profile_id, now).await?;

        if !reward.is_repeatable {
            let taken: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM reward_redemptions WHERE reward_id = ?1 \
                 AND child_profile_id = ?2 AND status IN ('pending', 'approved', 'fulfilled')",
            )
            .bind(reward_id)
            .bind(child_profile_id)
            .fetch_one(&mut *tx)
            .await?;
            if taken > 0 {
                return Err(AppError::conflict("ALREADY_REDEEMED", "Reward can only be redeemed once")
                    .with_context("reward_id", reward_id));
            }
        }

        let balance = balance_in(&mut tx, child_profile_id).await?;
        if balance < reward.cost_points {
            return Err(AppError::insufficient_balance(balance, -reward.cost_points)
                .with_context("reward_id", reward_id));
        }

        let id = new_uuid_v7();
        let notes = notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        sqlx::query(
            "INSERT INTO reward_redemptions (id, reward_id, child_profile_id, points_cost, status, \
             requested_at, notes, metadata, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?5, ?5)",
        )
        .bind(&id)
        .bind(reward_id)
        .bind(child_profile_id)
        .bind(reward.cost_points)
        .bind(now)
        .bind(notes.as_deref())
        .bind(json!({ "reward_name": reward.name }).to_string())
        .execute(&mut *tx)
        .await?;

        let debit = append_in_tx(
            &mut tx,
            &state.policy,
            NewTransaction::new(
                child_profile_id,
                ctx.family_id.clone(),
                TransactionType::RewardRedeem,
                -reward.cost_points,
            )
            .reason(format!("Redeemed: {}", reward.name))
            .reference("reward_redemptions", &id)
            .created_by(Some(&ctx.profile_id)),
            now,
        )
        .await?;
        sqlx::query("UPDATE reward_redemptions SET point_transaction_id = ?1 WHERE id = ?2")
            .bind(&debit.id)
            .bind(&id)
            .execute(&mut *tx)
            .await?;

        let redemption = load_redemption(&mut tx, &id, &ctx.family_id).await?;
        db::commit(tx).await?;
        Ok(redemption)
    }
    .await;
    scope.finish(result, |r| {
        json!({ "redemption_id": r.id, "reward_id": r.reward_id, "points_cost": r.points_cost })
    })
}

/// Moves a redemption along its lifecycle. Rejecting or cancelling credits the
/// cost back with a compensating `reward_redeem` entry.
pub async fn update_redemption(
    state: &CoreState,
    ctx: &AuthContext,
    redemption_id: &str,
    update: RedemptionUpdate,
) -> AppResult<RewardRedemption> {
    let scope = OpScope::new("rewards_update_redemption", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        let now = state.now_ms();
        let mut tx = db::begin_write(&state.pool).await?;
        let current = load_redemption(&mut tx, redemption_id, &ctx.family_id).await?;
        if !current.status.can_transition_to(update.status) {
            return Err(ErrorKind::Conflict
                .error(
                    "INVALID_TRANSITION",
                    format!("Cannot move a {} redemption to {}", current.status, update.status),
                )
                .with_context("from", current.status.as_str())
                .with_context("to", update.status.as_str()));
        }

        let notes = update
            .notes
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .or(current.notes.clone());
        let (confirmed_at, confirmed_by, cancelled_at, cancelled_by) = if update.status.refunds() {
            (None, None, Some(now), Some(ctx.profile_id.as_str()))
        } else {
            (Some(now), Some(ctx.profile_id.as_str()), None, None)
        };

        let moved = sqlx::query(
            "UPDATE reward_redemptions SET status = ?1, \
               confirmed_at = COALESCE(confirmed_at, ?2), \
               confirmed_by_profile_id = COALESCE(confirmed_by_profile_id, ?3), \
               cancelled_at = ?4, cancelled_by_profile_id = ?5, notes = ?6, updated_at = ?7 \
             WHERE id = ?8 AND status = ?9",
        )
        .bind(update.status.as_str())
        .bind(confirmed_at)
        .bind(confirmed_by)
        .bind(cancelled_at)
        .bind(cancelled_by)
        .bind(notes.as_deref())
        .bind(now)
        .bind(redemption_id)
        .bind(current.status.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if moved == 0 {
            return Err(AppError::conflict("STALE_STATUS", "Redemption changed concurrently")
                .with_context("redemption_id", redemption_id));
        }

        if update.status.refunds() {
            append_in_tx(
                &mut tx,
                &state.policy,
                NewTransaction::new(
                    current.child_profile_id.clone(),
                    ctx.family_id.clone(),
                    TransactionType::RewardRedeem,
                    current.points_cost,
                )
                .reason(format!("Redemption {}", update.status))
                .reference("reward_redemptions", redemption_id)
                .created_by(Some(&ctx.profile_id))
                .metadata(json!({
                    "refund_of": current.point_transaction_id,
                    "status": update.status.as_str()
                })),
                now,
            )
            .await?;
        }

        let redemption = load_redemption(&mut tx, redemption_id, &ctx.family_id).await?;
        db::commit(tx).await?;
        Ok(redemption)
    }
    .await;
    scope.finish(result, |r| {
        json!({ "redemption_id": r.id, "status": r.status.as_str() })
    })
}

pub async fn list_redemptions(
    state: &CoreState,
    ctx: &AuthContext,
    child_profile_id: &str,
    status: Option<RedemptionStatus>,
) -> AppResult<Vec<RewardRedemption>> {
    let scope = OpScope::new("rewards_list_redemptions", Some(&ctx.family_id), Some(child_profile_id));
    let result = async {
        ctx.ensure_self_or_guardian(child_profile_id)?;
        retry_read_once(|| async move {
            let mut conn = state.pool.acquire().await?;
            ensure_child_in_family(&mut conn, child_profile_id, &ctx.family_id).await?;
            let rows = sqlx::query(&format!(
                "SELECT {REDEMPTION_COLUMNS} FROM reward_redemptions \
                 WHERE child_profile_id = ?1 AND (?2 IS NULL OR status = ?2) \
                 ORDER BY requested_at DESC, id DESC"
            ))
            .bind(child_profile_id)
            .bind(status.map(RedemptionStatus::as_str))
            .fetch_all(&mut *conn)
            .await?;
            rows.iter()
                .map(RewardRedemption::try_from)
                .collect::<AppResult<Vec<_>>>()
        })
        .await
    }
    .await;
    scope.finish(result, |items| json!({ "count": items.len() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use RedemptionStatus::*;

    #[test]
    fn transition_table() {
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Approved.can_transition_to(Fulfilled));
        assert!(Approved.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Fulfilled));
        assert!(!Approved.can_transition_to(Rejected));
        for terminal in [Fulfilled, Rejected, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Approved, Fulfilled, Rejected, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn only_rejection_and_cancellation_refund() {
        assert!(Rejected.refunds());
        assert!(Cancelled.refunds());
        assert!(!Approved.refunds());
        assert!(!Fulfilled.refunds());
    }

    #[test]
    fn statuses_parse() {
        assert_eq!("fulfilled".parse::<RedemptionStatus>().unwrap(), Fulfilled);
        assert!("lost".parse::<RedemptionStatus>().is_err());
    }
}
