use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::auto_close::{close_if_overdue, close_in_tx};
use super::{
    apply_skip, bonus_points, elapsed_seconds, ensure_open, planned_end, should_auto_close, start,
    RoutineSession, SessionStatus, TaskCompletion, TransitionError, COMPLETION_COLUMNS,
    SESSION_COLUMNS,
};
use crate::auth::AuthContext;
use crate::catalog::{ensure_child_assigned, load_routine, load_routine_any, load_task, RoutineTask};
use crate::db::{self, retry_read_once, WriteTx};
use crate::id::new_uuid_v7;
use crate::ledger::{append_in_tx, NewTransaction, TransactionType};
use crate::op_logging::OpScope;
use crate::paging::{Page, PageRequest, SortOrder};
use crate::performance::{record_completion_in_tx, CompletionRecord};
use crate::profiles::{ensure_child_in_family, family_timezone};
use crate::state::CoreState;
use crate::time::{format_date, local_date};
use crate::{AppError, AppResult, ErrorKind};

/// Longest date range `list_sessions` accepts, in days.
pub const MAX_LIST_RANGE_DAYS: i64 = 31;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCreate {
    pub routine_id: String,
    pub child_profile_id: String,
    /// Defaults to today in the family's timezone.
    pub session_date: Option<NaiveDate>,
    #[serde(default)]
    pub auto_start_timer: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetail {
    pub session: RoutineSession,
    pub completions: Vec<TaskCompletion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletionInput {
    pub task_id: String,
    pub completed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletionResult {
    pub task_completion_id: String,
    pub position: i64,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedTaskInput {
    pub task_id: String,
    pub completed_at: DateTime<Utc>,
}

/// Final, authoritative list of what the child finished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCompletion {
    #[serde(default)]
    pub completed_tasks: Vec<CompletedTaskInput>,
    #[serde(default)]
    pub best_time_beaten: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkipRequest {
    pub status: SessionStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionSort {
    #[default]
    SessionDate,
    StartedAt,
    CompletedAt,
}

impl SessionSort {
    fn column(self) -> &'static str {
        match self {
            SessionSort::SessionDate => "session_date",
            SessionSort::StartedAt => "started_at",
            SessionSort::CompletedAt => "completed_at",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionListQuery {
    pub status: Option<SessionStatus>,
    pub routine_id: Option<String>,
    pub from_date: NaiveDate,
    pub to_date: NaiveDate,
    pub page: PageRequest,
    pub sort: SessionSort,
    pub order: SortOrder,
}

impl SessionListQuery {
    pub fn between(from_date: NaiveDate, to_date: NaiveDate) -> Self {
        Self {
            status: None,
            routine_id: None,
            from_date,
            to_date,
            page: PageRequest::default(),
            sort: SessionSort::default(),
            order: SortOrder::default(),
        }
    }

    fn validate(&self) -> AppResult<()> {
        self.page.validate()?;
        if self.from_date > self.to_date {
            return Err(AppError::validation("fromDate", "fromDate must not be after toDate"));
        }
        if (self.to_date - self.from_date).num_days() > MAX_LIST_RANGE_DAYS {
            return Err(AppError::validation(
                "toDate",
                format!("Date range must not exceed {MAX_LIST_RANGE_DAYS} days"),
            ));
        }
        Ok(())
    }
}

/// Loads a session whose routine belongs to `family_id`.
pub(crate) async fn load_session(
    conn: &mut SqliteConnection,
    session_id: &str,
    family_id: &str,
) -> AppResult<RoutineSession> {
    let row = sqlx::query(&format!(
        "SELECT {SESSION_COLUMNS} FROM routine_sessions \
         WHERE id = ?1 AND routine_id IN (SELECT id FROM routines WHERE family_id = ?2)"
    ))
    .bind(session_id)
    .bind(family_id)
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        Some(row) => RoutineSession::try_from(&row),
        None => Err(AppError::not_found("routine_session", session_id)),
    }
}

/// Completions that have not been undone, in position order.
pub(crate) async fn active_completions(
    conn: &mut SqliteConnection,
    session_id: &str,
) -> AppResult<Vec<TaskCompletion>> {
    let rows = sqlx::query(&format!(
        "SELECT {COMPLETION_COLUMNS} FROM task_completions \
         WHERE routine_session_id = ?1 AND undone_at IS NULL ORDER BY position ASC"
    ))
    .bind(session_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(TaskCompletion::try_from).collect()
}

/// Undone rows keep their slot, so the next position counts them too.
async fn next_completion_position(conn: &mut SqliteConnection, session_id: &str) -> AppResult<i64> {
    let max: Option<i64> =
        sqlx::query_scalar("SELECT MAX(position) FROM task_completions WHERE routine_session_id = ?1")
            .bind(session_id)
            .fetch_one(&mut *conn)
            .await?;
    Ok(max.unwrap_or(0) + 1)
}

/// Loads a session for mutation. An overdue session is auto-closed and that close
/// is committed before the caller gets the terminal-state error.
async fn open_session_for_write(
    mut tx: WriteTx,
    ctx: &AuthContext,
    session_id: &str,
    now: DateTime<Utc>,
) -> AppResult<(WriteTx, RoutineSession)> {
    let session = load_session(&mut tx, session_id, &ctx.family_id).await?;
    ctx.ensure_self_or_guardian(&session.child_profile_id)?;
    if let Some(closed) = close_in_tx(&mut tx, &session, now).await? {
        db::commit(tx).await?;
        return Err(AppError::from(TransitionError::Terminal(closed.status))
            .with_context("session_id", session_id));
    }
    ensure_open(&session)?;
    Ok((tx, session))
}

/// Task copy of the session's routine and child, or not found.
async fn load_session_task(
    conn: &mut SqliteConnection,
    session: &RoutineSession,
    task_id: &str,
    family_id: &str,
) -> AppResult<RoutineTask> {
    let task = load_task(conn, task_id, family_id).await?;
    if task.routine_id != session.routine_id
        || task.child_profile_id != session.child_profile_id
        || !task.is_active
    {
        return Err(AppError::not_found("routine_task", task_id)
            .with_context("session_id", session.id.clone()));
    }
    Ok(task)
}

struct NewCompletion<'a> {
    session: &'a RoutineSession,
    task: &'a RoutineTask,
    completed_at: DateTime<Utc>,
    notes: Option<&'a str>,
}

/// Inserts one completion and ledgers its points. Returns (id, position).
async fn insert_completion(
    conn: &mut SqliteConnection,
    state: &CoreState,
    ctx: &AuthContext,
    new: NewCompletion<'_>,
) -> AppResult<(String, i64)> {
    let position = next_completion_position(conn, &new.session.id).await?;
    let since_start = new
        .session
        .started_at
        .map(|started| elapsed_seconds(started, new.completed_at));
    let metadata = match new.notes.map(str::trim).filter(|notes| !notes.is_empty()) {
        Some(notes) => json!({ "notes": notes }),
        None => json!({}),
    };

    let id = new_uuid_v7();
    sqlx::query(
        "INSERT INTO task_completions (id, routine_session_id, routine_task_id, completed_at, \
         position, points_awarded, was_bonus, duration_since_session_start_seconds, metadata) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8)",
    )
    .bind(&id)
    .bind(&new.session.id)
    .bind(&new.task.id)
    .bind(new.completed_at.timestamp_millis())
    .bind(position)
    .bind(new.task.points)
    .bind(since_start)
    .bind(metadata.to_string())
    .execute(&mut *conn)
    .await?;

    if new.task.points > 0 {
        append_in_tx(
            conn,
            &state.policy,
            NewTransaction::new(
                new.session.child_profile_id.clone(),
                ctx.family_id.clone(),
                TransactionType::TaskCompletion,
                new.task.points,
            )
            .reason(new.task.name.clone())
            .reference("task_completions", &id)
            .created_by(Some(&ctx.profile_id))
            .metadata(json!({ "routine_session_id": new.session.id, "routine_task_id": new.task.id })),
            state.now_ms(),
        )
        .await?;
    }
    Ok((id, position))
}

/// Creates the session for (routine, child, date), or returns the one that already exists.
pub async fn create_session(
    state: &CoreState,
    ctx: &AuthContext,
    command: SessionCreate,
) -> AppResult<RoutineSession> {
    let scope = OpScope::new("session_create", Some(&ctx.family_id), Some(&command.child_profile_id));
    let result = async {
        ctx.ensure_self_or_guardian(&command.child_profile_id)?;
        let now = state.clock.now();
        let mut tx = db::begin_write(&state.pool).await?;
        ensure_child_in_family(&mut tx, &command.child_profile_id, &ctx.family_id).await?;
        let routine = load_routine(&mut tx, &command.routine_id, &ctx.family_id).await?;
        if !routine.is_active {
            return Err(ErrorKind::InvalidState
                .error("ROUTINE_INACTIVE", "Routine is not active")
                .with_context("routine_id", routine.id.clone()));
        }
        ensure_child_assigned(&mut tx, &routine.id, &command.child_profile_id).await?;

        let tz = family_timezone(&mut tx, &ctx.family_id).await?;
        let session_date = command.session_date.unwrap_or_else(|| local_date(now, tz));
        let (status, started_at) = if command.auto_start_timer {
            (SessionStatus::InProgress, Some(now))
        } else {
            (SessionStatus::Scheduled, None)
        };
        let planned_end_at = planned_end(started_at, routine.auto_close_after_minutes)?;

        let inserted = sqlx::query(
            "INSERT INTO routine_sessions (id, routine_id, child_profile_id, session_date, status, \
             started_at, planned_end_at, points_awarded, bonus_multiplier, best_time_beaten, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, 0, ?9, ?9) \
             ON CONFLICT(routine_id, child_profile_id, session_date) DO NOTHING",
        )
        .bind(new_uuid_v7())
        .bind(&routine.id)
        .bind(&command.child_profile_id)
        .bind(format_date(session_date))
        .bind(status.as_str())
        .bind(started_at.map(|at| at.timestamp_millis()))
        .bind(planned_end_at.map(|at| at.timestamp_millis()))
        .bind(routine.bonus_multiplier())
        .bind(now.timestamp_millis())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM routine_sessions \
             WHERE routine_id = ?1 AND child_profile_id = ?2 AND session_date = ?3"
        ))
        .bind(&routine.id)
        .bind(&command.child_profile_id)
        .bind(format_date(session_date))
        .fetch_one(&mut *tx)
        .await?;
        let session = RoutineSession::try_from(&row)?;
        db::commit(tx).await?;
        Ok((session, inserted == 1))
    }
    .await;
    scope
        .finish(result, |(session, created)| {
            json!({ "session_id": session.id, "created": created, "status": session.status.as_str() })
        })
        .map(|(session, _)| session)
}

/// Session plus its active completions. Applies the lazy auto-close check first.
pub async fn get_session(
    state: &CoreState,
    ctx: &AuthContext,
    session_id: &str,
) -> AppResult<SessionDetail> {
    let scope = OpScope::new("session_get", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        let read = || async move {
            let mut conn = state.pool.acquire().await?;
            let session = load_session(&mut conn, session_id, &ctx.family_id).await?;
            let completions = active_completions(&mut conn, session_id).await?;
            Ok::<_, AppError>(SessionDetail {
                session,
                completions,
            })
        };
        let mut detail = retry_read_once(read).await?;
        ctx.ensure_self_or_guardian(&detail.session.child_profile_id)?;
        if should_auto_close(&detail.session, state.clock.now()) {
            if let Some(closed) = close_if_overdue(state, session_id).await? {
                detail.session = closed;
            }
        }
        Ok::<_, AppError>(detail)
    }
    .await;
    scope.finish(result, |detail| {
        json!({ "session_id": detail.session.id, "status": detail.session.status.as_str() })
    })
}

fn push_session_filters<'a>(
    builder: &mut QueryBuilder<'a, Sqlite>,
    child_profile_id: &'a str,
    query: &'a SessionListQuery,
) {
    builder
        .push(" WHERE child_profile_id = ")
        .push_bind(child_profile_id)
        .push(" AND session_date >= ")
        .push_bind(format_date(query.from_date))
        .push(" AND session_date <= ")
        .push_bind(format_date(query.to_date));
    if let Some(status) = query.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(routine_id) = &query.routine_id {
        builder.push(" AND routine_id = ").push_bind(routine_id.as_str());
    }
}

pub async fn list_sessions(
    state: &CoreState,
    ctx: &AuthContext,
    child_profile_id: &str,
    query: SessionListQuery,
) -> AppResult<Page<RoutineSession>> {
    let scope = OpScope::new("session_list", Some(&ctx.family_id), Some(child_profile_id));
    let result = async {
        ctx.ensure_self_or_guardian(child_profile_id)?;
        query.validate()?;
        let query = &query;
        let mut page = retry_read_once(|| async move {
            let mut conn = state.pool.acquire().await?;
            ensure_child_in_family(&mut conn, child_profile_id, &ctx.family_id).await?;

            let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM routine_sessions");
            push_session_filters(&mut count, child_profile_id, query);
            let total = count
                .build_query_scalar::<i64>()
                .fetch_one(&mut *conn)
                .await?;

            let mut select = QueryBuilder::<Sqlite>::new(format!(
                "SELECT {SESSION_COLUMNS} FROM routine_sessions"
            ));
            push_session_filters(&mut select, child_profile_id, query);
            select
                .push(format!(
                    " ORDER BY {} {}, session_date DESC, id ASC",
                    query.sort.column(),
                    query.order.as_sql()
                ))
                .push(" LIMIT ")
                .push_bind(query.page.limit())
                .push(" OFFSET ")
                .push_bind(query.page.offset());
            let rows = select.build().fetch_all(&mut *conn).await?;
            let items = rows
                .iter()
                .map(RoutineSession::try_from)
                .collect::<AppResult<Vec<_>>>()?;
            Ok::<_, AppError>(Page::new(items, query.page, total))
        })
        .await?;

        let now = state.clock.now();
        for item in page.items.iter_mut() {
            if should_auto_close(item, now) {
                if let Some(closed) = close_if_overdue(state, &item.id).await? {
                    *item = closed;
                }
            }
        }
        Ok::<_, AppError>(page)
    }
    .await;
    scope.finish(result, |page| json!({ "count": page.items.len(), "total": page.total }))
}

/// Records one task completion and credits its points in the same transaction.
pub async fn complete_task(
    state: &CoreState,
    ctx: &AuthContext,
    session_id: &str,
    input: TaskCompletionInput,
) -> AppResult<TaskCompletionResult> {
    let scope = OpScope::new("session_complete_task", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        let now = state.clock.now();
        let tx = db::begin_write(&state.pool).await?;
        let (mut tx, session) = open_session_for_write(tx, ctx, session_id, now).await?;
        let task = load_session_task(&mut tx, &session, &input.task_id, &ctx.family_id).await?;
        let routine = load_routine_any(&mut tx, &session.routine_id).await?;

        let completed_at = input.completed_at.unwrap_or(now);
        let session = start(session, completed_at, routine.auto_close_after_minutes)?;
        let (completion_id, position) = insert_completion(
            &mut tx,
            state,
            ctx,
            NewCompletion {
                session: &session,
                task: &task,
                completed_at,
                notes: input.notes.as_deref(),
            },
        )
        .await?;

        sqlx::query(
            "UPDATE routine_sessions SET status = ?1, started_at = ?2, planned_end_at = ?3, \
             points_awarded = points_awarded + ?4, updated_at = ?5 WHERE id = ?6",
        )
        .bind(session.status.as_str())
        .bind(session.started_at.map(|at| at.timestamp_millis()))
        .bind(session.planned_end_at.map(|at| at.timestamp_millis()))
        .bind(task.points)
        .bind(now.timestamp_millis())
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
        db::commit(tx).await?;

        Ok::<_, AppError>(TaskCompletionResult {
            task_completion_id: completion_id,
            position,
            status: session.status,
        })
    }
    .await;
    scope.finish(result, |done| {
        json!({ "session_id": session_id, "task_completion_id": done.task_completion_id, "position": done.position })
    })
}

/// Marks a completion undone and debits its points back. Positions of the
/// remaining completions are left as they are.
pub async fn undo_task_completion(
    state: &CoreState,
    ctx: &AuthContext,
    session_id: &str,
    completion_id: &str,
) -> AppResult<TaskCompletion> {
    let scope = OpScope::new("session_undo_task", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        let now = state.clock.now();
        let tx = db::begin_write(&state.pool).await?;
        let (mut tx, session) = open_session_for_write(tx, ctx, session_id, now).await?;

        let row = sqlx::query(&format!(
            "SELECT {COMPLETION_COLUMNS} FROM task_completions \
             WHERE id = ?1 AND routine_session_id = ?2 AND undone_at IS NULL"
        ))
        .bind(completion_id)
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Err(AppError::not_found("task_completion", completion_id)
                .with_context("session_id", session_id));
        };
        let mut completion = TaskCompletion::try_from(&row)?;

        sqlx::query("UPDATE task_completions SET undone_at = ?1 WHERE id = ?2")
            .bind(now.timestamp_millis())
            .bind(completion_id)
            .execute(&mut *tx)
            .await?;
        if completion.points_awarded > 0 {
            append_in_tx(
                &mut tx,
                &state.policy,
                NewTransaction::new(
                    session.child_profile_id.clone(),
                    ctx.family_id.clone(),
                    TransactionType::ManualAdjustment,
                    -completion.points_awarded,
                )
                .reason("Task completion undone")
                .reference("task_completions", completion_id)
                .created_by(Some(&ctx.profile_id))
                .metadata(json!({ "reversal_of": completion_id, "routine_session_id": session_id })),
                now.timestamp_millis(),
            )
            .await?;
        }
        sqlx::query(
            "UPDATE routine_sessions SET points_awarded = points_awarded - ?1, updated_at = ?2 \
             WHERE id = ?3",
        )
        .bind(completion.points_awarded)
        .bind(now.timestamp_millis())
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
        db::commit(tx).await?;

        completion.undone_at = Some(now);
        Ok(completion)
    }
    .await;
    scope.finish(result, |completion| {
        json!({ "session_id": session_id, "task_completion_id": completion.id, "points_reversed": completion.points_awarded })
    })
}

/// Finishes a session. Submitted completions missing from the store are recorded
/// (and ledgered) first; extra stored completions are kept. A best-time bonus is
/// ledgered separately and performance stats are updated.
pub async fn complete_session(
    state: &CoreState,
    ctx: &AuthContext,
    session_id: &str,
    command: SessionCompletion,
) -> AppResult<RoutineSession> {
    let scope = OpScope::new("session_complete", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        let now = state.clock.now();
        let tx = db::begin_write(&state.pool).await?;
        let (mut tx, session) = open_session_for_write(tx, ctx, session_id, now).await?;
        let routine = load_routine_any(&mut tx, &session.routine_id).await?;
        let existing = active_completions(&mut tx, session_id).await?;

        let mut submitted = command.completed_tasks;
        submitted.sort_by_key(|entry| entry.completed_at);
        let started_at = session.started_at.or_else(|| {
            existing
                .iter()
                .map(|c| c.completed_at)
                .chain(submitted.iter().map(|entry| entry.completed_at))
                .min()
        });
        let mut session = session;
        session.started_at = started_at;

        let mut recorded: HashMap<String, usize> = HashMap::new();
        for completion in &existing {
            if let Some(task_id) = &completion.routine_task_id {
                *recorded.entry(task_id.clone()).or_default() += 1;
            }
        }
        let mut base: i64 = existing.iter().map(|c| c.points_awarded).sum();
        let mut added = 0usize;
        for entry in &submitted {
            if let Some(count) = recorded.get_mut(&entry.task_id).filter(|count| **count > 0) {
                *count -= 1;
                continue;
            }
            let task = load_session_task(&mut tx, &session, &entry.task_id, &ctx.family_id).await?;
            insert_completion(
                &mut tx,
                state,
                ctx,
                NewCompletion {
                    session: &session,
                    task: &task,
                    completed_at: entry.completed_at,
                    notes: None,
                },
            )
            .await?;
            base += task.points;
            added += 1;
        }

        let bonus = bonus_points(base, session.bonus_multiplier, command.best_time_beaten);
        if bonus > 0 {
            append_in_tx(
                &mut tx,
                &state.policy,
                NewTransaction::new(
                    session.child_profile_id.clone(),
                    ctx.family_id.clone(),
                    TransactionType::RoutineBonus,
                    bonus,
                )
                .reason(format!("Best time bonus: {}", routine.name))
                .reference("routine_sessions", session_id)
                .created_by(Some(&ctx.profile_id))
                .metadata(json!({ "base_points": base, "bonus_multiplier": session.bonus_multiplier })),
                now.timestamp_millis(),
            )
            .await?;
        }

        let duration = started_at.map(|started| elapsed_seconds(started, now));
        let planned_end_at = match session.planned_end_at {
            Some(end) => Some(end),
            None => planned_end(started_at, routine.auto_close_after_minutes)?,
        };
        let notes = command
            .notes
            .as_deref()
            .map(str::trim)
            .filter(|notes| !notes.is_empty())
            .map(str::to_string)
            .or(session.notes.clone());
        sqlx::query(
            "UPDATE routine_sessions SET status = ?1, started_at = ?2, completed_at = ?3, \
             planned_end_at = ?4, duration_seconds = ?5, points_awarded = ?6, \
             best_time_beaten = ?7, completion_reason = ?8, notes = ?9, updated_at = ?3 \
             WHERE id = ?10",
        )
        .bind(SessionStatus::Completed.as_str())
        .bind(started_at.map(|at| at.timestamp_millis()))
        .bind(now.timestamp_millis())
        .bind(planned_end_at.map(|at| at.timestamp_millis()))
        .bind(duration)
        .bind(base + bonus)
        .bind(command.best_time_beaten)
        .bind("completed")
        .bind(notes.as_deref())
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        let tz = family_timezone(&mut tx, &ctx.family_id).await?;
        record_completion_in_tx(
            &mut tx,
            CompletionRecord {
                routine_id: &session.routine_id,
                child_profile_id: &session.child_profile_id,
                session_id,
                duration_seconds: duration,
                completed_at: now,
            },
            tz,
            now.timestamp_millis(),
        )
        .await?;

        let updated = load_session(&mut tx, session_id, &ctx.family_id).await?;
        db::commit(tx).await?;
        Ok::<_, AppError>((updated, added, bonus))
    }
    .await;
    scope
        .finish(result, |(session, added, bonus)| {
            json!({
                "session_id": session.id,
                "points_awarded": session.points_awarded,
                "reconciled": added,
                "bonus": bonus
            })
        })
        .map(|(session, _, _)| session)
}

/// Ends an open session as `skipped` or `expired`. No points move.
pub async fn skip_session(
    state: &CoreState,
    ctx: &AuthContext,
    session_id: &str,
    request: SkipRequest,
) -> AppResult<RoutineSession> {
    let scope = OpScope::new("session_skip", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        if !matches!(request.status, SessionStatus::Skipped | SessionStatus::Expired) {
            return Err(AppError::validation("status", "status must be skipped or expired")
                .with_context("value", request.status.as_str()));
        }
        let reason = request
            .reason
            .as_deref()
            .map(str::trim)
            .filter(|reason| !reason.is_empty())
            .map(str::to_string);

        let now = state.clock.now();
        let tx = db::begin_write(&state.pool).await?;
        let (mut tx, session) = open_session_for_write(tx, ctx, session_id, now).await?;
        let skipped = apply_skip(session, request.status, reason, now)?;
        sqlx::query(
            "UPDATE routine_sessions SET status = ?1, completion_reason = ?2, updated_at = ?3 \
             WHERE id = ?4",
        )
        .bind(skipped.status.as_str())
        .bind(skipped.completion_reason.as_deref())
        .bind(now.timestamp_millis())
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
        db::commit(tx).await?;
        Ok(skipped)
    }
    .await;
    scope.finish(result, |session| {
        json!({ "session_id": session.id, "status": session.status.as_str() })
    })
}
