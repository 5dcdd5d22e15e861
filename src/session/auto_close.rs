use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::SqliteConnection;

use super::{apply_auto_close, should_auto_close, RoutineSession, SESSION_COLUMNS};
use crate::db;
use crate::op_logging::OpScope;
use crate::state::CoreState;
use crate::{AppError, AppResult};

pub(crate) async fn load_session_any(
    conn: &mut SqliteConnection,
    session_id: &str,
) -> AppResult<RoutineSession> {
    let row = sqlx::query(&format!(
        "SELECT {SESSION_COLUMNS} FROM routine_sessions WHERE id = ?1"
    ))
    .bind(session_id)
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        Some(row) => RoutineSession::try_from(&row),
        None => Err(AppError::not_found("routine_session", session_id)),
    }
}

/// Closes `session` inside the caller's write transaction when it is overdue.
/// Returns the closed session, or `None` when nothing changed.
pub(crate) async fn close_in_tx(
    conn: &mut SqliteConnection,
    session: &RoutineSession,
    now: DateTime<Utc>,
) -> AppResult<Option<RoutineSession>> {
    if !should_auto_close(session, now) {
        return Ok(None);
    }
    let closed = apply_auto_close(session.clone(), now)?;
    let updated = sqlx::query(
        "UPDATE routine_sessions SET status = ?1, auto_closed_at = ?2, duration_seconds = ?3, \
         best_time_beaten = 0, completion_reason = ?4, updated_at = ?2 \
         WHERE id = ?5 AND status = 'in_progress'",
    )
    .bind(closed.status.as_str())
    .bind(now.timestamp_millis())
    .bind(closed.duration_seconds)
    .bind(closed.completion_reason.as_deref())
    .bind(&closed.id)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if updated == 0 {
        return Ok(None);
    }
    tracing::info!(
        target: "routinely",
        event = "session_auto_closed",
        session_id = %closed.id,
        routine_id = %closed.routine_id,
        child_profile_id = %closed.child_profile_id,
        points_awarded = closed.points_awarded
    );
    Ok(Some(closed))
}

/// Auto-closes one session if it is overdue. Terminal or on-time sessions are
/// left alone, so this is safe to call redundantly from any driver.
pub async fn close_if_overdue(
    state: &CoreState,
    session_id: &str,
) -> AppResult<Option<RoutineSession>> {
    let mut tx = db::begin_write(&state.pool).await?;
    let session = load_session_any(&mut tx, session_id).await?;
    let closed = close_in_tx(&mut tx, &session, state.clock.now()).await?;
    db::commit(tx).await?;
    Ok(closed)
}

/// Periodic driver: closes up to `limit` overdue sessions, oldest deadline first.
/// Returns how many this call closed.
pub async fn sweep_overdue(state: &CoreState, limit: u32) -> AppResult<usize> {
    let scope = OpScope::new("session_sweep_overdue", None, None);
    let result = async {
        let now = state.clock.now();
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM routine_sessions \
             WHERE status = 'in_progress' AND planned_end_at IS NOT NULL AND planned_end_at < ?1 \
             ORDER BY planned_end_at ASC LIMIT ?2",
        )
        .bind(now.timestamp_millis())
        .bind(i64::from(limit))
        .fetch_all(&state.pool)
        .await?;

        let mut closed = 0;
        for id in &ids {
            if close_if_overdue(state, id).await?.is_some() {
                closed += 1;
            }
        }
        Ok::<_, AppError>((ids.len(), closed))
    }
    .await;
    scope
        .finish(result, |(candidates, closed)| {
            json!({ "candidates": candidates, "closed": closed })
        })
        .map(|(_, closed)| closed)
}
