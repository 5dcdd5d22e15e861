//! Append-only points ledger with a per-profile running balance.
//!
//! Every append happens inside a transaction opened by [`db::begin_write`], so
//! the "read last balance, insert next row" step is linearized across every
//! connection and process sharing the store. `UNIQUE(profile_id, sequence)`
//! backs that up at the schema level.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};

use crate::auth::AuthContext;
use crate::config::LedgerPolicy;
use crate::db::{self, retry_read_once};
use crate::id::new_uuid_v7;
use crate::op_logging::OpScope;
use crate::paging::{Page, PageRequest, SortOrder};
use crate::profiles::ensure_profile_in_family;
use crate::state::CoreState;
use crate::time::to_date;
use crate::{AppError, AppResult};

pub const WALLET_DEFAULT_LIMIT: u32 = 5;
pub const WALLET_MAX_LIMIT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    TaskCompletion,
    RoutineBonus,
    ManualAdjustment,
    RewardRedeem,
}

impl TransactionType {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::TaskCompletion => "task_completion",
            TransactionType::RoutineBonus => "routine_bonus",
            TransactionType::ManualAdjustment => "manual_adjustment",
            TransactionType::RewardRedeem => "reward_redeem",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "task_completion" => Ok(TransactionType::TaskCompletion),
            "routine_bonus" => Ok(TransactionType::RoutineBonus),
            "manual_adjustment" => Ok(TransactionType::ManualAdjustment),
            "reward_redeem" => Ok(TransactionType::RewardRedeem),
            other => Err(AppError::validation("transactionType", "Unknown transaction type")
                .with_context("value", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointTransaction {
    pub id: String,
    pub family_id: String,
    pub profile_id: String,
    pub sequence: i64,
    pub transaction_type: TransactionType,
    pub points_delta: i64,
    pub balance_after: i64,
    pub reference_table: Option<String>,
    pub reference_id: Option<String>,
    pub reason: Option<String>,
    pub metadata: Value,
    pub created_by_profile_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<&SqliteRow> for PointTransaction {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        let kind: String = row.try_get("transaction_type").map_err(AppError::from)?;
        let metadata: String = row.try_get("metadata").map_err(AppError::from)?;
        Ok(Self {
            id: row.try_get("id").map_err(AppError::from)?,
            family_id: row.try_get("family_id").map_err(AppError::from)?,
            profile_id: row.try_get("profile_id").map_err(AppError::from)?,
            sequence: row.try_get("sequence").map_err(AppError::from)?,
            transaction_type: kind.parse()?,
            points_delta: row.try_get("points_delta").map_err(AppError::from)?,
            balance_after: row.try_get("balance_after").map_err(AppError::from)?,
            reference_table: row.try_get("reference_table").map_err(AppError::from)?,
            reference_id: row.try_get("reference_id").map_err(AppError::from)?,
            reason: row.try_get("reason").map_err(AppError::from)?,
            metadata: serde_json::from_str(&metadata)?,
            created_by_profile_id: row.try_get("created_by_profile_id").map_err(AppError::from)?,
            created_at: to_date(row.try_get("created_at").map_err(AppError::from)?),
        })
    }
}

const TRANSACTION_COLUMNS: &str = "id, family_id, profile_id, sequence, transaction_type, \
     points_delta, balance_after, reference_table, reference_id, reason, metadata, \
     created_by_profile_id, created_at";

/// Input to [`append_in_tx`].
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub profile_id: String,
    pub family_id: String,
    pub transaction_type: TransactionType,
    pub points_delta: i64,
    pub reason: Option<String>,
    pub reference_table: Option<String>,
    pub reference_id: Option<String>,
    pub created_by: Option<String>,
    pub metadata: Value,
}

impl NewTransaction {
    pub fn new(
        profile_id: impl Into<String>,
        family_id: impl Into<String>,
        transaction_type: TransactionType,
        points_delta: i64,
    ) -> Self {
        Self {
            profile_id: profile_id.into(),
            family_id: family_id.into(),
            transaction_type,
            points_delta,
            reason: None,
            reference_table: None,
            reference_id: None,
            created_by: None,
            metadata: json!({}),
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn reference(mut self, table: &str, id: &str) -> Self {
        self.reference_table = Some(table.to_string());
        self.reference_id = Some(id.to_string());
        self
    }

    pub fn created_by(mut self, profile_id: Option<&str>) -> Self {
        self.created_by = profile_id.map(str::to_string);
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

async fn last_entry(conn: &mut SqliteConnection, profile_id: &str) -> AppResult<(i64, i64)> {
    let row = sqlx::query(
        "SELECT sequence, balance_after FROM point_transactions \
         WHERE profile_id = ?1 ORDER BY sequence DESC LIMIT 1",
    )
    .bind(profile_id)
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        Some(row) => Ok((
            row.try_get("sequence").map_err(AppError::from)?,
            row.try_get("balance_after").map_err(AppError::from)?,
        )),
        None => Ok((0, 0)),
    }
}

/// Current balance: `balance_after` of the profile's last row, or 0.
pub async fn balance_in(conn: &mut SqliteConnection, profile_id: &str) -> AppResult<i64> {
    Ok(last_entry(conn, profile_id).await?.1)
}

/// Appends one ledger row on a connection that is already inside a write transaction.
pub async fn append_in_tx(
    conn: &mut SqliteConnection,
    policy: &LedgerPolicy,
    new: NewTransaction,
    now_ms: i64,
) -> AppResult<PointTransaction> {
    if new.points_delta == 0 {
        return Err(AppError::validation(
            "pointsDelta",
            "Point transactions must change the balance",
        ));
    }

    let (last_sequence, balance) = last_entry(conn, &new.profile_id).await?;
    let balance_after = balance
        .checked_add(new.points_delta)
        .ok_or_else(|| AppError::validation("pointsDelta", "Balance would overflow"))?;

    let may_go_negative = new.transaction_type == TransactionType::ManualAdjustment
        && policy.allow_negative_manual_adjustments;
    if new.points_delta < 0 && balance_after < 0 && !may_go_negative {
        return Err(AppError::insufficient_balance(balance, new.points_delta)
            .with_context("profile_id", new.profile_id.clone()));
    }

    let id = new_uuid_v7();
    let sequence = last_sequence + 1;
    sqlx::query(
        "INSERT INTO point_transactions (id, family_id, profile_id, sequence, transaction_type, \
         points_delta, balance_after, reference_table, reference_id, reason, metadata, \
         created_by_profile_id, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
    )
    .bind(&id)
    .bind(&new.family_id)
    .bind(&new.profile_id)
    .bind(sequence)
    .bind(new.transaction_type.as_str())
    .bind(new.points_delta)
    .bind(balance_after)
    .bind(&new.reference_table)
    .bind(&new.reference_id)
    .bind(&new.reason)
    .bind(new.metadata.to_string())
    .bind(&new.created_by)
    .bind(now_ms)
    .execute(&mut *conn)
    .await?;

    tracing::debug!(
        target: "routinely",
        event = "ledger_append",
        profile_id = %new.profile_id,
        transaction_type = new.transaction_type.as_str(),
        points_delta = new.points_delta,
        balance_after,
        sequence
    );

    Ok(PointTransaction {
        id,
        family_id: new.family_id,
        profile_id: new.profile_id,
        sequence,
        transaction_type: new.transaction_type,
        points_delta: new.points_delta,
        balance_after,
        reference_table: new.reference_table,
        reference_id: new.reference_id,
        reason: new.reason,
        metadata: new.metadata,
        created_by_profile_id: new.created_by,
        created_at: to_date(now_ms),
    })
}

/// Standalone append in its own write transaction.
pub async fn append_transaction(
    state: &CoreState,
    new: NewTransaction,
) -> AppResult<PointTransaction> {
    let scope = OpScope::new(
        "ledger_append_transaction",
        Some(&new.family_id),
        Some(&new.profile_id),
    );
    let result = async {
        let mut tx = db::begin_write(&state.pool).await?;
        ensure_profile_in_family(&mut tx, &new.profile_id, &new.family_id).await?;
        let row = append_in_tx(&mut tx, &state.policy, new, state.now_ms()).await?;
        db::commit(tx).await?;
        Ok::<_, AppError>(row)
    }
    .await;
    scope.finish(result, |row| {
        json!({ "transaction_id": row.id, "balance_after": row.balance_after })
    })
}

pub async fn get_balance(state: &CoreState, ctx: &AuthContext, profile_id: &str) -> AppResult<i64> {
    let scope = OpScope::new("ledger_get_balance", Some(&ctx.family_id), Some(profile_id));
    let result = async {
        ctx.ensure_self_or_guardian(profile_id)?;
        retry_read_once(|| async move {
            let mut conn = state.pool.acquire().await?;
            ensure_profile_in_family(&mut conn, profile_id, &ctx.family_id).await?;
            balance_in(&mut conn, profile_id).await
        })
        .await
    }
    .await;
    scope.finish(result, |balance| json!({ "balance": balance }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionSort {
    #[default]
    CreatedAt,
    PointsDelta,
}

impl TransactionSort {
    fn column(self) -> &'static str {
        match self {
            TransactionSort::CreatedAt => "created_at",
            TransactionSort::PointsDelta => "points_delta",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilters {
    pub profile_id: Option<String>,
    pub transaction_type: Option<TransactionType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

fn push_filters<'a>(
    builder: &mut QueryBuilder<'a, Sqlite>,
    family_id: &'a str,
    filters: &'a TransactionFilters,
) {
    builder.push(" WHERE family_id = ").push_bind(family_id);
    if let Some(profile_id) = &filters.profile_id {
        builder.push(" AND profile_id = ").push_bind(profile_id.as_str());
    }
    if let Some(kind) = filters.transaction_type {
        builder.push(" AND transaction_type = ").push_bind(kind.as_str());
    }
    if let Some(from) = filters.from {
        builder
            .push(" AND created_at >= ")
            .push_bind(from.timestamp_millis());
    }
    if let Some(to) = filters.to {
        builder.push(" AND created_at <= ").push_bind(to.timestamp_millis());
    }
}

async fn query_transactions(
    pool: &SqlitePool,
    family_id: &str,
    filters: &TransactionFilters,
    page: PageRequest,
    sort: TransactionSort,
    order: SortOrder,
) -> AppResult<Page<PointTransaction>> {
    let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM point_transactions");
    push_filters(&mut count, family_id, filters);
    let total: i64 = count.build_query_scalar::<i64>().fetch_one(pool).await?;

    let mut select =
        QueryBuilder::<Sqlite>::new(format!("SELECT {TRANSACTION_COLUMNS} FROM point_transactions"));
    push_filters(&mut select, family_id, filters);
    select
        .push(format!(
            " ORDER BY {col} {dir}, created_at {dir}, sequence {dir}",
            col = sort.column(),
            dir = order.as_sql()
        ))
        .push(" LIMIT ")
        .push_bind(page.limit())
        .push(" OFFSET ")
        .push_bind(page.offset());
    let rows = select.build().fetch_all(pool).await?;
    let items = rows
        .iter()
        .map(PointTransaction::try_from)
        .collect::<AppResult<Vec<_>>>()?;
    Ok(Page::new(items, page, total))
}

/// Family-wide transaction listing for guardians.
pub async fn list_transactions(
    state: &CoreState,
    ctx: &AuthContext,
    filters: TransactionFilters,
    page: PageRequest,
    sort: TransactionSort,
    order: SortOrder,
) -> AppResult<Page<PointTransaction>> {
    let scope = OpScope::new("ledger_list_transactions", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        page.validate()?;
        if let (Some(from), Some(to)) = (filters.from, filters.to) {
            if from > to {
                return Err(AppError::validation("from", "from must not be after to"));
            }
        }
        if let Some(profile_id) = &filters.profile_id {
            let mut conn = state.pool.acquire().await?;
            ensure_profile_in_family(&mut conn, profile_id, &ctx.family_id).await?;
        }
        retry_read_once(|| query_transactions(&state.pool, &ctx.family_id, &filters, page, sort, order))
            .await
    }
    .await;
    scope.finish(result, |page| json!({ "count": page.items.len(), "total": page.total }))
}

/// Guardian-issued correction, credited or debited against a family member.
pub async fn create_manual_adjustment(
    state: &CoreState,
    ctx: &AuthContext,
    profile_id: &str,
    points_delta: i64,
    reason: &str,
) -> AppResult<PointTransaction> {
    let scope = OpScope::new("ledger_manual_adjustment", Some(&ctx.family_id), Some(profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::validation("reason", "A reason is required"));
        }
        if points_delta == 0 {
            return Err(AppError::validation("pointsDelta", "pointsDelta must not be zero"));
        }
        let mut tx = db::begin_write(&state.pool).await?;
        ensure_profile_in_family(&mut tx, profile_id, &ctx.family_id).await?;
        let row = append_in_tx(
            &mut tx,
            &state.policy,
            NewTransaction::new(
                profile_id,
                ctx.family_id.clone(),
                TransactionType::ManualAdjustment,
                points_delta,
            )
            .reason(reason)
            .created_by(Some(&ctx.profile_id)),
            state.now_ms(),
        )
        .await?;
        db::commit(tx).await?;
        Ok(row)
    }
    .await;
    scope.finish(result, |row| {
        json!({ "transaction_id": row.id, "points_delta": row.points_delta, "balance_after": row.balance_after })
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalletOptions {
    pub include_transactions: bool,
    pub limit: u32,
}

impl Default for WalletOptions {
    fn default() -> Self {
        Self {
            include_transactions: true,
            limit: WALLET_DEFAULT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub profile_id: String,
    pub balance: i64,
    pub transactions: Vec<PointTransaction>,
}

/// Balance plus the most recent transactions for one profile.
pub async fn wallet(
    state: &CoreState,
    ctx: &AuthContext,
    profile_id: &str,
    options: WalletOptions,
) -> AppResult<Wallet> {
    let scope = OpScope::new("ledger_wallet", Some(&ctx.family_id), Some(profile_id));
    let result = async {
        ctx.ensure_self_or_guardian(profile_id)?;
        if options.limit == 0 || options.limit > WALLET_MAX_LIMIT {
            return Err(AppError::validation(
                "limit",
                format!("limit must be between 1 and {WALLET_MAX_LIMIT}"),
            ));
        }
        retry_read_once(|| async move {
            let mut conn = state.pool.acquire().await?;
            ensure_profile_in_family(&mut conn, profile_id, &ctx.family_id).await?;
            let balance = balance_in(&mut conn, profile_id).await?;
            let transactions = if options.include_transactions {
                let rows = sqlx::query(&format!(
                    "SELECT {TRANSACTION_COLUMNS} FROM point_transactions \
                     WHERE profile_id = ?1 ORDER BY sequence DESC LIMIT ?2"
                ))
                .bind(profile_id)
                .bind(i64::from(options.limit))
                .fetch_all(&mut *conn)
                .await?;
                rows.iter()
                    .map(PointTransaction::try_from)
                    .collect::<AppResult<Vec<_>>>()?
            } else {
                Vec::new()
            };
            Ok::<_, AppError>(Wallet {
                profile_id: profile_id.to_string(),
                balance,
                transactions,
            })
        })
        .await
    }
    .await;
    scope.finish(result, |wallet| json!({ "balance": wallet.balance }))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerViolation {
    pub profile_id: String,
    pub transaction_id: String,
    pub sequence: i64,
    pub expected_sequence: i64,
    pub expected_balance: i64,
    pub actual_balance: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerReport {
    pub profiles_checked: usize,
    pub rows_checked: usize,
    pub violations: Vec<LedgerViolation>,
}

impl LedgerReport {
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Replays every row in sequence order and records the first break per profile.
pub async fn verify_ledger(pool: &SqlitePool, profile_id: Option<&str>) -> AppResult<LedgerReport> {
    let rows = retry_read_once(|| async move {
        let rows = match profile_id {
            Some(profile_id) => {
                sqlx::query(
                    "SELECT id, profile_id, sequence, points_delta, balance_after \
                     FROM point_transactions WHERE profile_id = ?1 ORDER BY sequence",
                )
                .bind(profile_id)
                .fetch_all(pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, profile_id, sequence, points_delta, balance_after \
                     FROM point_transactions ORDER BY profile_id, sequence",
                )
                .fetch_all(pool)
                .await?
            }
        };
        Ok::<_, AppError>(rows)
    })
    .await?;

    let mut report = LedgerReport::default();
    let mut current: Option<String> = None;
    let mut balance = 0_i64;
    let mut sequence = 0_i64;
    let mut broken = false;

    for row in &rows {
        let row_profile: String = row.try_get("profile_id").map_err(AppError::from)?;
        if current.as_deref() != Some(row_profile.as_str()) {
            current = Some(row_profile.clone());
            report.profiles_checked += 1;
            balance = 0;
            sequence = 0;
            broken = false;
        }
        report.rows_checked += 1;
        if broken {
            continue;
        }

        let row_sequence: i64 = row.try_get("sequence").map_err(AppError::from)?;
        let delta: i64 = row.try_get("points_delta").map_err(AppError::from)?;
        let balance_after: i64 = row.try_get("balance_after").map_err(AppError::from)?;
        let expected_balance = balance + delta;
        if row_sequence != sequence + 1 || balance_after != expected_balance {
            report.violations.push(LedgerViolation {
                profile_id: row_profile,
                transaction_id: row.try_get("id").map_err(AppError::from)?,
                sequence: row_sequence,
                expected_sequence: sequence + 1,
                expected_balance,
                actual_balance: balance_after,
            });
            broken = true;
            continue;
        }
        balance = balance_after;
        sequence = row_sequence;
    }

    if report.is_consistent() {
        tracing::info!(
            target: "routinely",
            event = "ledger_verified",
            profiles = report.profiles_checked,
            rows = report.rows_checked
        );
    } else {
        tracing::error!(
            target: "routinely",
            event = "ledger_violation",
            profiles = report.profiles_checked,
            rows = report.rows_checked,
            violations = report.violations.len()
        );
    }
    Ok(report)
}
