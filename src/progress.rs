//! Per-day family dashboard, derived only from catalog and session rows.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::json;
use sqlx::{Row, SqliteConnection};

use crate::auth::AuthContext;
use crate::catalog::{
    availability, Availability, Routine, RoutineTask, RoutineType, ROUTINE_COLUMNS, TASK_COLUMNS,
};
use crate::db::retry_read_once;
use crate::op_logging::OpScope;
use crate::profiles::family_timezone;
use crate::session::{
    RoutineSession, SessionStatus, TaskCompletion, COMPLETION_COLUMNS, SESSION_COLUMNS,
};
use crate::state::CoreState;
use crate::time::{format_date, local_date};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskProgressStatus {
    Completed,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub task_id: String,
    pub name: String,
    pub points: i64,
    pub is_optional: bool,
    pub status: TaskProgressStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildProgress {
    pub child_profile_id: String,
    pub display_name: String,
    pub session_id: Option<String>,
    pub status: Option<SessionStatus>,
    pub points_awarded: i64,
    pub duration_seconds: Option<i64>,
    pub completed_count: usize,
    pub total_count: usize,
    pub tasks: Vec<TaskProgress>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutineProgress {
    pub routine_id: String,
    pub name: String,
    pub routine_type: RoutineType,
    /// Where the routine's window stands right now; only set for the current day.
    pub availability: Option<Availability>,
    pub children: Vec<ChildProgress>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DaySummary {
    pub date: NaiveDate,
    pub routines: Vec<RoutineProgress>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyProgress {
    pub family_id: String,
    #[serde(flatten)]
    pub today: DaySummary,
    /// The previous day, when requested.
    pub history: Option<DaySummary>,
}

struct Assignment {
    routine_id: String,
    child_profile_id: String,
    display_name: String,
}

async fn summarize_day(
    conn: &mut SqliteConnection,
    family_id: &str,
    date: NaiveDate,
    now: DateTime<Utc>,
    tz: Tz,
) -> AppResult<DaySummary> {
    let routine_rows = sqlx::query(&format!(
        "SELECT {ROUTINE_COLUMNS} FROM routines \
         WHERE family_id = ?1 AND is_active = 1 AND deleted_at IS NULL \
         ORDER BY start_time IS NULL, start_time ASC, name ASC"
    ))
    .bind(family_id)
    .fetch_all(&mut *conn)
    .await?;
    let is_today = local_date(now, tz) == date;

    let assignment_rows = sqlx::query(
        "SELECT cr.routine_id, cr.child_profile_id, p.display_name FROM child_routines cr \
         JOIN profiles p ON p.id = cr.child_profile_id \
         JOIN routines r ON r.id = cr.routine_id \
         WHERE r.family_id = ?1 AND cr.is_enabled = 1 AND cr.deleted_at IS NULL \
           AND p.deleted_at IS NULL \
         ORDER BY cr.position ASC",
    )
    .bind(family_id)
    .fetch_all(&mut *conn)
    .await?;
    let mut assignments: Vec<Assignment> = Vec::with_capacity(assignment_rows.len());
    for row in &assignment_rows {
        assignments.push(Assignment {
            routine_id: row.try_get("routine_id").map_err(AppError::from)?,
            child_profile_id: row.try_get("child_profile_id").map_err(AppError::from)?,
            display_name: row.try_get("display_name").map_err(AppError::from)?,
        });
    }

    let task_rows = sqlx::query(&format!(
        "SELECT {TASK_COLUMNS} FROM routine_tasks \
         WHERE routine_id IN (SELECT id FROM routines WHERE family_id = ?1) \
           AND is_active = 1 AND deleted_at IS NULL \
         ORDER BY position ASC"
    ))
    .bind(family_id)
    .fetch_all(&mut *conn)
    .await?;
    let mut tasks: HashMap<(String, String), Vec<RoutineTask>> = HashMap::new();
    for row in &task_rows {
        let task = RoutineTask::try_from(row)?;
        tasks
            .entry((task.routine_id.clone(), task.child_profile_id.clone()))
            .or_default()
            .push(task);
    }

    let session_rows = sqlx::query(&format!(
        "SELECT {SESSION_COLUMNS} FROM routine_sessions \
         WHERE session_date = ?1 \
           AND routine_id IN (SELECT id FROM routines WHERE family_id = ?2)"
    ))
    .bind(format_date(date))
    .bind(family_id)
    .fetch_all(&mut *conn)
    .await?;
    let mut sessions: HashMap<(String, String), RoutineSession> = HashMap::new();
    for row in &session_rows {
        let session = RoutineSession::try_from(row)?;
        sessions.insert(
            (session.routine_id.clone(), session.child_profile_id.clone()),
            session,
        );
    }

    let completion_rows = sqlx::query(&format!(
        "SELECT {COMPLETION_COLUMNS} FROM task_completions \
         WHERE undone_at IS NULL AND routine_session_id IN ( \
           SELECT s.id FROM routine_sessions s JOIN routines r ON r.id = s.routine_id \
           WHERE s.session_date = ?1 AND r.family_id = ?2) \
         ORDER BY position ASC"
    ))
    .bind(format_date(date))
    .bind(family_id)
    .fetch_all(&mut *conn)
    .await?;
    let mut completions: HashMap<String, Vec<TaskCompletion>> = HashMap::new();
    for row in &completion_rows {
        let completion = TaskCompletion::try_from(row)?;
        completions
            .entry(completion.routine_session_id.clone())
            .or_default()
            .push(completion);
    }

    let mut routines = Vec::with_capacity(routine_rows.len());
    for row in &routine_rows {
        let routine = Routine::try_from(row)?;
        let routine_id = routine.id.clone();
        let children = assignments
            .iter()
            .filter(|a| a.routine_id == routine_id)
            .map(|a| {
                let key = (routine_id.clone(), a.child_profile_id.clone());
                let session = sessions.get(&key);
                let done = session
                    .and_then(|s| completions.get(&s.id))
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                child_progress(a, session, tasks.get(&key).map(Vec::as_slice).unwrap_or_default(), done)
            })
            .collect();
        routines.push(RoutineProgress {
            availability: is_today.then(|| availability(&routine, now, tz)),
            routine_type: routine.routine_type,
            name: routine.name,
            routine_id,
            children,
        });
    }

    Ok(DaySummary { date, routines })
}

fn child_progress(
    assignment: &Assignment,
    session: Option<&RoutineSession>,
    tasks: &[RoutineTask],
    completions: &[TaskCompletion],
) -> ChildProgress {
    let task_progress: Vec<TaskProgress> = tasks
        .iter()
        .map(|task| {
            let first = completions
                .iter()
                .find(|c| c.routine_task_id.as_deref() == Some(task.id.as_str()));
            TaskProgress {
                task_id: task.id.clone(),
                name: task.name.clone(),
                points: task.points,
                is_optional: task.is_optional,
                status: if first.is_some() {
                    TaskProgressStatus::Completed
                } else {
                    TaskProgressStatus::Pending
                },
                completed_at: first.map(|c| c.completed_at),
            }
        })
        .collect();
    let completed_count = task_progress
        .iter()
        .filter(|t| t.status == TaskProgressStatus::Completed)
        .count();

    ChildProgress {
        child_profile_id: assignment.child_profile_id.clone(),
        display_name: assignment.display_name.clone(),
        session_id: session.map(|s| s.id.clone()),
        status: session.map(|s| s.status),
        points_awarded: session.map_or(0, |s| s.points_awarded),
        duration_seconds: session.and_then(|s| s.duration_seconds),
        completed_count,
        total_count: task_progress.len(),
        tasks: task_progress,
    }
}

/// Routines × enabled children × task status for one family day. `date` defaults
/// to today in the family's timezone.
pub async fn daily_family_progress(
    state: &CoreState,
    ctx: &AuthContext,
    date: Option<NaiveDate>,
    include_history: bool,
) -> AppResult<FamilyProgress> {
    let scope = OpScope::new("progress_daily_family", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        retry_read_once(|| async move {
            let mut conn = state.pool.acquire().await?;
            let tz = family_timezone(&mut conn, &ctx.family_id).await?;
            let now = state.clock.now();
            let day = date.unwrap_or_else(|| local_date(now, tz));
            let today = summarize_day(&mut conn, &ctx.family_id, day, now, tz).await?;
            let history = match (include_history, day.pred_opt()) {
                (true, Some(previous)) => {
                    Some(summarize_day(&mut conn, &ctx.family_id, previous, now, tz).await?)
                }
                _ => None,
            };
            Ok::<_, AppError>(FamilyProgress {
                family_id: ctx.family_id.clone(),
                today,
                history,
            })
        })
        .await
    }
    .await;
    scope.finish(result, |progress| {
        json!({ "date": format_date(progress.today.date), "routines": progress.today.routines.len() })
    })
}
