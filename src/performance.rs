use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::json;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::auth::AuthContext;
use crate::db::retry_read_once;
use crate::op_logging::OpScope;
use crate::profiles::ensure_child_in_family;
use crate::state::CoreState;
use crate::time::{local_date, to_date, to_opt_date};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    pub routine_id: String,
    pub child_profile_id: String,
    pub best_duration_seconds: Option<i64>,
    pub best_session_id: Option<String>,
    pub last_completed_session_id: Option<String>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub streak_days: i64,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<&SqliteRow> for PerformanceStats {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        Ok(Self {
            routine_id: row.try_get("routine_id").map_err(AppError::from)?,
            child_profile_id: row.try_get("child_profile_id").map_err(AppError::from)?,
            best_duration_seconds: row.try_get("best_duration_seconds").map_err(AppError::from)?,
            best_session_id: row.try_get("best_session_id").map_err(AppError::from)?,
            last_completed_session_id: row
                .try_get("last_completed_session_id")
                .map_err(AppError::from)?,
            last_completed_at: to_opt_date(
                row.try_get("last_completed_at").map_err(AppError::from)?,
            ),
            streak_days: row.try_get("streak_days").map_err(AppError::from)?,
            updated_at: to_date(row.try_get("updated_at").map_err(AppError::from)?),
        })
    }
}

const STATS_COLUMNS: &str = "routine_id, child_profile_id, best_duration_seconds, \
     best_session_id, last_completed_session_id, last_completed_at, streak_days, updated_at";

/// One finished session, as fed to [`record_completion_in_tx`].
#[derive(Debug, Clone)]
pub struct CompletionRecord<'a> {
    pub routine_id: &'a str,
    pub child_profile_id: &'a str,
    pub session_id: &'a str,
    pub duration_seconds: Option<i64>,
    pub completed_at: DateTime<Utc>,
}

/// Streak after a completion on `current`, given the previous completion day.
/// Same day keeps the streak, the next day extends it, anything else restarts it.
pub fn next_streak(streak: i64, last: Option<NaiveDate>, current: NaiveDate) -> i64 {
    match last {
        Some(last) if last == current => streak.max(1),
        Some(last) if last.succ_opt() == Some(current) => streak + 1,
        _ => 1,
    }
}

/// A new duration only replaces the best when strictly faster.
pub fn improves_best(best: Option<i64>, duration: Option<i64>) -> bool {
    match (best, duration) {
        (_, None) => false,
        (None, Some(_)) => true,
        (Some(best), Some(duration)) => duration < best,
    }
}

async fn load_stats(
    conn: &mut SqliteConnection,
    routine_id: &str,
    child_profile_id: &str,
) -> AppResult<Option<PerformanceStats>> {
    let row = sqlx::query(&format!(
        "SELECT {STATS_COLUMNS} FROM routine_performance_stats \
         WHERE routine_id = ?1 AND child_profile_id = ?2"
    ))
    .bind(routine_id)
    .bind(child_profile_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(PerformanceStats::try_from).transpose()
}

/// Upserts the stats row for a completed session. Runs in the caller's write
/// transaction; day boundaries follow the family timezone.
pub async fn record_completion_in_tx(
    conn: &mut SqliteConnection,
    record: CompletionRecord<'_>,
    tz: Tz,
    now_ms: i64,
) -> AppResult<PerformanceStats> {
    let current = load_stats(conn, record.routine_id, record.child_profile_id).await?;

    let (best_duration, best_session, streak, last_at) = match &current {
        Some(stats) => (
            stats.best_duration_seconds,
            stats.best_session_id.clone(),
            stats.streak_days,
            stats.last_completed_at,
        ),
        None => (None, None, 0, None),
    };
    let (best_duration, best_session) = if improves_best(best_duration, record.duration_seconds) {
        (record.duration_seconds, Some(record.session_id.to_string()))
    } else {
        (best_duration, best_session)
    };
    let streak = next_streak(
        streak,
        last_at.map(|at| local_date(at, tz)),
        local_date(record.completed_at, tz),
    );

    sqlx::query(
        "INSERT INTO routine_performance_stats (routine_id, child_profile_id, \
         best_duration_seconds, best_session_id, last_completed_session_id, last_completed_at, \
         streak_days, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
         ON CONFLICT(routine_id, child_profile_id) DO UPDATE SET \
           best_duration_seconds = excluded.best_duration_seconds, \
           best_session_id = excluded.best_session_id, \
           last_completed_session_id = excluded.last_completed_session_id, \
           last_completed_at = excluded.last_completed_at, \
           streak_days = excluded.streak_days, \
           updated_at = excluded.updated_at",
    )
    .bind(record.routine_id)
    .bind(record.child_profile_id)
    .bind(best_duration)
    .bind(&best_session)
    .bind(record.session_id)
    .bind(record.completed_at.timestamp_millis())
    .bind(streak)
    .bind(now_ms)
    .execute(&mut *conn)
    .await?;

    tracing::debug!(
        target: "routinely",
        event = "performance_recorded",
        routine_id = record.routine_id,
        child_profile_id = record.child_profile_id,
        streak_days = streak,
        best_duration_seconds = best_duration
    );

    load_stats(conn, record.routine_id, record.child_profile_id)
        .await?
        .ok_or_else(|| AppError::new("INTERNAL/STATS_MISSING", "Stats row vanished after upsert"))
}

pub async fn list_performance(
    state: &CoreState,
    ctx: &AuthContext,
    child_profile_id: &str,
    routine_id: Option<&str>,
) -> AppResult<Vec<PerformanceStats>> {
    let scope = OpScope::new("performance_list", Some(&ctx.family_id), Some(child_profile_id));
    let result = async {
        ctx.ensure_self_or_guardian(child_profile_id)?;
        retry_read_once(|| async move {
            let mut conn = state.pool.acquire().await?;
            ensure_child_in_family(&mut conn, child_profile_id, &ctx.family_id).await?;
            let rows = sqlx::query(&format!(
                "SELECT {STATS_COLUMNS} FROM routine_performance_stats \
                 WHERE child_profile_id = ?1 AND (?2 IS NULL OR routine_id = ?2) \
                 ORDER BY routine_id ASC"
            ))
            .bind(child_profile_id)
            .bind(routine_id)
            .fetch_all(&mut *conn)
            .await?;
            rows.iter()
                .map(PerformanceStats::try_from)
                .collect::<AppResult<Vec<_>>>()
        })
        .await
    }
    .await;
    scope.finish(result, |stats| json!({ "count": stats.len() }))
}
