//! Routine session lifecycle.
//!
//! `scheduled` and `in_progress` are the only open states; everything else is
//! terminal. The functions in this module are pure so any driver (request
//! handlers, the periodic sweep, tests) can evaluate transitions without a store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use thiserror::Error;

use crate::time::{parse_stored_date, to_date, to_opt_date};
use crate::{AppError, ErrorKind};

pub mod auto_close;
pub mod service;

pub use auto_close::{close_if_overdue, sweep_overdue};
pub use service::{
    complete_session, complete_task, create_session, get_session, list_sessions, skip_session,
    undo_task_completion, CompletedTaskInput, SessionCompletion, SessionCreate, SessionDetail,
    SessionListQuery, SessionSort, SkipRequest, TaskCompletionInput, TaskCompletionResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    InProgress,
    Completed,
    AutoClosed,
    Skipped,
    Expired,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::AutoClosed => "auto_closed",
            SessionStatus::Skipped => "skipped",
            SessionStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Scheduled | SessionStatus::InProgress)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "scheduled" => Ok(SessionStatus::Scheduled),
            "in_progress" => Ok(SessionStatus::InProgress),
            "completed" => Ok(SessionStatus::Completed),
            "auto_closed" => Ok(SessionStatus::AutoClosed),
            "skipped" => Ok(SessionStatus::Skipped),
            "expired" => Ok(SessionStatus::Expired),
            other => Err(AppError::validation("status", "Invalid session status")
                .with_context("value", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutineSession {
    pub id: String,
    pub routine_id: String,
    pub child_profile_id: String,
    pub session_date: NaiveDate,
    pub status: SessionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub auto_closed_at: Option<DateTime<Utc>>,
    pub planned_end_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub points_awarded: i64,
    pub bonus_multiplier: f64,
    pub best_time_beaten: bool,
    pub completion_reason: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<&SqliteRow> for RoutineSession {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        let session_date: String = row.try_get("session_date").map_err(AppError::from)?;
        let status: String = row.try_get("status").map_err(AppError::from)?;
        Ok(Self {
            id: row.try_get("id").map_err(AppError::from)?,
            routine_id: row.try_get("routine_id").map_err(AppError::from)?,
            child_profile_id: row.try_get("child_profile_id").map_err(AppError::from)?,
            session_date: parse_stored_date(&session_date)?,
            status: status.parse()?,
            started_at: to_opt_date(row.try_get("started_at").map_err(AppError::from)?),
            completed_at: to_opt_date(row.try_get("completed_at").map_err(AppError::from)?),
            auto_closed_at: to_opt_date(row.try_get("auto_closed_at").map_err(AppError::from)?),
            planned_end_at: to_opt_date(row.try_get("planned_end_at").map_err(AppError::from)?),
            duration_seconds: row.try_get("duration_seconds").map_err(AppError::from)?,
            points_awarded: row.try_get("points_awarded").map_err(AppError::from)?,
            bonus_multiplier: row.try_get("bonus_multiplier").map_err(AppError::from)?,
            best_time_beaten: row.try_get::<i64, _>("best_time_beaten").map_err(AppError::from)?
                != 0,
            completion_reason: row.try_get("completion_reason").map_err(AppError::from)?,
            notes: row.try_get("notes").map_err(AppError::from)?,
            created_at: to_date(row.try_get("created_at").map_err(AppError::from)?),
            updated_at: to_date(row.try_get("updated_at").map_err(AppError::from)?),
        })
    }
}

pub(crate) const SESSION_COLUMNS: &str = "id, routine_id, child_profile_id, session_date, status, \
     started_at, completed_at, auto_closed_at, planned_end_at, duration_seconds, points_awarded, \
     bonus_multiplier, best_time_beaten, completion_reason, notes, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCompletion {
    pub id: String,
    pub routine_session_id: String,
    pub routine_task_id: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub position: i64,
    pub points_awarded: i64,
    pub was_bonus: bool,
    pub duration_since_session_start_seconds: Option<i64>,
    pub metadata: Value,
    pub undone_at: Option<DateTime<Utc>>,
}

impl TryFrom<&SqliteRow> for TaskCompletion {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        let metadata: String = row.try_get("metadata").map_err(AppError::from)?;
        Ok(Self {
            id: row.try_get("id").map_err(AppError::from)?,
            routine_session_id: row.try_get("routine_session_id").map_err(AppError::from)?,
            routine_task_id: row.try_get("routine_task_id").map_err(AppError::from)?,
            completed_at: to_date(row.try_get("completed_at").map_err(AppError::from)?),
            position: row.try_get("position").map_err(AppError::from)?,
            points_awarded: row.try_get("points_awarded").map_err(AppError::from)?,
            was_bonus: row.try_get::<i64, _>("was_bonus").map_err(AppError::from)? != 0,
            duration_since_session_start_seconds: row
                .try_get("duration_since_session_start_seconds")
                .map_err(AppError::from)?,
            metadata: serde_json::from_str(&metadata)?,
            undone_at: to_opt_date(row.try_get("undone_at").map_err(AppError::from)?),
        })
    }
}

pub(crate) const COMPLETION_COLUMNS: &str = "id, routine_session_id, routine_task_id, \
     completed_at, position, points_awarded, was_bonus, duration_since_session_start_seconds, \
     metadata, undone_at";

/// Why a transition was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("session is already {0}")]
    Terminal(SessionStatus),
    #[error("session is {0}, not in progress")]
    NotInProgress(SessionStatus),
    #[error("session has not passed its planned end")]
    NotOverdue,
    #[error("planned end is out of range")]
    PlannedEndOutOfRange,
}

impl TransitionError {
    fn detail(&self) -> &'static str {
        match self {
            TransitionError::Terminal(_) => "TERMINAL",
            TransitionError::NotInProgress(_) => "NOT_IN_PROGRESS",
            TransitionError::NotOverdue => "NOT_OVERDUE",
            TransitionError::PlannedEndOutOfRange => "OUT_OF_RANGE",
        }
    }
}

impl From<TransitionError> for AppError {
    fn from(err: TransitionError) -> Self {
        let status = match &err {
            TransitionError::Terminal(status) | TransitionError::NotInProgress(status) => {
                Some(status.as_str())
            }
            TransitionError::NotOverdue => None,
            TransitionError::PlannedEndOutOfRange => {
                return ErrorKind::Validation
                    .error(err.detail(), err.to_string())
                    .with_context("field", "plannedEndAt");
            }
        };
        let app = ErrorKind::InvalidState.error(err.detail(), err.to_string());
        match status {
            Some(status) => app.with_context("status", status),
            None => app,
        }
    }
}

/// Refuses any mutation of a terminal session.
pub fn ensure_open(session: &RoutineSession) -> Result<(), TransitionError> {
    if session.status.is_terminal() {
        Err(TransitionError::Terminal(session.status))
    } else {
        Ok(())
    }
}

/// `started_at + auto_close_after_minutes`, when both are known.
pub fn planned_end(
    started_at: Option<DateTime<Utc>>,
    auto_close_after_minutes: Option<i64>,
) -> Result<Option<DateTime<Utc>>, TransitionError> {
    let (Some(start), Some(minutes)) = (started_at, auto_close_after_minutes) else {
        return Ok(None);
    };
    chrono::Duration::try_minutes(minutes)
        .and_then(|limit| start.checked_add_signed(limit))
        .map(Some)
        .ok_or(TransitionError::PlannedEndOutOfRange)
}

/// Marks a scheduled session as started at `at`. Sessions already running keep
/// their original start.
pub fn start(
    mut session: RoutineSession,
    at: DateTime<Utc>,
    auto_close_after_minutes: Option<i64>,
) -> Result<RoutineSession, TransitionError> {
    ensure_open(&session)?;
    if session.status == SessionStatus::Scheduled {
        session.status = SessionStatus::InProgress;
        if session.started_at.is_none() {
            session.started_at = Some(at);
        }
        session.planned_end_at = planned_end(session.started_at, auto_close_after_minutes)?;
    }
    Ok(session)
}

pub fn should_auto_close(session: &RoutineSession, now: DateTime<Utc>) -> bool {
    session.status == SessionStatus::InProgress
        && session.planned_end_at.is_some_and(|end| now > end)
}

/// Forces an overdue session closed. Points stay at whatever the completions
/// already earned and no bonus is granted.
pub fn apply_auto_close(
    mut session: RoutineSession,
    now: DateTime<Utc>,
) -> Result<RoutineSession, TransitionError> {
    ensure_open(&session)?;
    if session.status != SessionStatus::InProgress {
        return Err(TransitionError::NotInProgress(session.status));
    }
    if !should_auto_close(&session, now) {
        return Err(TransitionError::NotOverdue);
    }
    session.status = SessionStatus::AutoClosed;
    session.auto_closed_at = Some(now);
    session.duration_seconds = session.started_at.map(|start| elapsed_seconds(start, now));
    session.best_time_beaten = false;
    session.completion_reason = Some("auto_closed".into());
    session.updated_at = now;
    Ok(session)
}

/// Moves an open session to `skipped` or `expired`.
pub fn apply_skip(
    mut session: RoutineSession,
    status: SessionStatus,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<RoutineSession, TransitionError> {
    ensure_open(&session)?;
    debug_assert!(matches!(status, SessionStatus::Skipped | SessionStatus::Expired));
    session.status = status;
    session.completion_reason = reason;
    session.updated_at = now;
    Ok(session)
}

/// Whole seconds from `start` to `end`, never negative.
pub fn elapsed_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_seconds().max(0)
}

/// Best-time bonus on top of `base` points. Zero unless the best time was beaten
/// and the routine grants a multiplier above one.
pub fn bonus_points(base: i64, multiplier: f64, best_time_beaten: bool) -> i64 {
    if !best_time_beaten || multiplier <= 1.0 || base <= 0 {
        return 0;
    }
    (base as f64 * (multiplier - 1.0)).round() as i64
}
