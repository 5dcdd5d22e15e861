//! Routines, their per-child task copies and child assignments.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::time::{to_date, to_opt_date};
use crate::{AppError, AppResult};

pub mod assignments;
pub mod reorder;
pub mod routines;
pub mod tasks;
pub mod validation;
pub mod window;

pub use assignments::{assign_child, list_children, reorder_children, unassign_child};
pub use reorder::PositionUpdate;
pub use routines::{
    archive_routine, create_routine, get_routine, list_routines, update_routine, RoutineCreate,
    RoutineListQuery, RoutineSort, RoutineUpdate,
};
pub use tasks::{
    archive_task, archive_task_group, create_task, create_task_for_all_children, list_tasks,
    reorder_task_groups, reorder_tasks, update_task, update_task_group, TaskCreate, TaskGroupUpdate,
    TaskListQuery, TaskSort, TaskUpdate,
};
pub use validation::MAX_AUTO_CLOSE_MINUTES;
pub use window::{availability, Availability};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutineType {
    Morning,
    Afternoon,
    Evening,
    Custom,
}

impl RoutineType {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutineType::Morning => "morning",
            RoutineType::Afternoon => "afternoon",
            RoutineType::Evening => "evening",
            RoutineType::Custom => "custom",
        }
    }
}

impl fmt::Display for RoutineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoutineType {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "morning" => Ok(RoutineType::Morning),
            "afternoon" => Ok(RoutineType::Afternoon),
            "evening" => Ok(RoutineType::Evening),
            "custom" => Ok(RoutineType::Custom),
            other => Err(AppError::validation("routineType", "Invalid routineType")
                .with_context("value", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Routine {
    pub id: String,
    pub family_id: String,
    pub name: String,
    pub slug: String,
    pub routine_type: RoutineType,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub auto_close_after_minutes: Option<i64>,
    pub is_active: bool,
    pub settings: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Routine {
    pub fn bonus_multiplier(&self) -> f64 {
        validation::bonus_multiplier(&self.settings)
    }

    pub fn is_archived(&self) -> bool {
        self.deleted_at.is_some()
    }
}

fn decode_time(row: &SqliteRow, column: &str) -> AppResult<Option<NaiveTime>> {
    let raw: Option<String> = row.try_get(column).map_err(AppError::from)?;
    raw.map(|value| {
        NaiveTime::parse_from_str(&value, validation::TIME_FORMAT).map_err(|err| {
            AppError::new("INTERNAL/TIME_DECODE", err.to_string()).with_context("column", column)
        })
    })
    .transpose()
}

fn decode_json(row: &SqliteRow, column: &str) -> AppResult<Value> {
    let raw: String = row.try_get(column).map_err(AppError::from)?;
    Ok(serde_json::from_str(&raw)?)
}

impl TryFrom<&SqliteRow> for Routine {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        let routine_type: String = row.try_get("routine_type").map_err(AppError::from)?;
        Ok(Self {
            id: row.try_get("id").map_err(AppError::from)?,
            family_id: row.try_get("family_id").map_err(AppError::from)?,
            name: row.try_get("name").map_err(AppError::from)?,
            slug: row.try_get("slug").map_err(AppError::from)?,
            routine_type: routine_type.parse()?,
            start_time: decode_time(row, "start_time")?,
            end_time: decode_time(row, "end_time")?,
            auto_close_after_minutes: row
                .try_get("auto_close_after_minutes")
                .map_err(AppError::from)?,
            is_active: row.try_get::<i64, _>("is_active").map_err(AppError::from)? != 0,
            settings: decode_json(row, "settings")?,
            created_at: to_date(row.try_get("created_at").map_err(AppError::from)?),
            updated_at: to_date(row.try_get("updated_at").map_err(AppError::from)?),
            deleted_at: to_opt_date(row.try_get("deleted_at").map_err(AppError::from)?),
        })
    }
}

pub(crate) const ROUTINE_COLUMNS: &str = "id, family_id, name, slug, routine_type, start_time, \
     end_time, auto_close_after_minutes, is_active, settings, created_at, updated_at, deleted_at";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutineTask {
    pub id: String,
    pub routine_id: String,
    pub child_profile_id: String,
    pub name: String,
    pub description: Option<String>,
    pub points: i64,
    pub position: i64,
    pub is_optional: bool,
    pub is_active: bool,
    pub expected_duration_seconds: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<&SqliteRow> for RoutineTask {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.try_get("id").map_err(AppError::from)?,
            routine_id: row.try_get("routine_id").map_err(AppError::from)?,
            child_profile_id: row.try_get("child_profile_id").map_err(AppError::from)?,
            name: row.try_get("name").map_err(AppError::from)?,
            description: row.try_get("description").map_err(AppError::from)?,
            points: row.try_get("points").map_err(AppError::from)?,
            position: row.try_get("position").map_err(AppError::from)?,
            is_optional: row.try_get::<i64, _>("is_optional").map_err(AppError::from)? != 0,
            is_active: row.try_get::<i64, _>("is_active").map_err(AppError::from)? != 0,
            expected_duration_seconds: row
                .try_get("expected_duration_seconds")
                .map_err(AppError::from)?,
            created_at: to_date(row.try_get("created_at").map_err(AppError::from)?),
            updated_at: to_date(row.try_get("updated_at").map_err(AppError::from)?),
            deleted_at: to_opt_date(row.try_get("deleted_at").map_err(AppError::from)?),
        })
    }
}

pub(crate) const TASK_COLUMNS: &str = "id, routine_id, child_profile_id, name, description, \
     points, position, is_optional, is_active, expected_duration_seconds, created_at, \
     updated_at, deleted_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildRoutine {
    pub id: String,
    pub routine_id: String,
    pub child_profile_id: String,
    pub is_enabled: bool,
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<&SqliteRow> for ChildRoutine {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.try_get("id").map_err(AppError::from)?,
            routine_id: row.try_get("routine_id").map_err(AppError::from)?,
            child_profile_id: row.try_get("child_profile_id").map_err(AppError::from)?,
            is_enabled: row.try_get::<i64, _>("is_enabled").map_err(AppError::from)? != 0,
            position: row.try_get("position").map_err(AppError::from)?,
            created_at: to_date(row.try_get("created_at").map_err(AppError::from)?),
            updated_at: to_date(row.try_get("updated_at").map_err(AppError::from)?),
            deleted_at: to_opt_date(row.try_get("deleted_at").map_err(AppError::from)?),
        })
    }
}

pub(crate) const CHILD_ROUTINE_COLUMNS: &str =
    "id, routine_id, child_profile_id, is_enabled, position, created_at, updated_at, deleted_at";

/// Loads a live routine of `family_id`. Archived or foreign routines are not found.
pub async fn load_routine(
    conn: &mut SqliteConnection,
    routine_id: &str,
    family_id: &str,
) -> AppResult<Routine> {
    let row = sqlx::query(&format!(
        "SELECT {ROUTINE_COLUMNS} FROM routines \
         WHERE id = ?1 AND family_id = ?2 AND deleted_at IS NULL"
    ))
    .bind(routine_id)
    .bind(family_id)
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        Some(row) => Routine::try_from(&row),
        None => Err(AppError::not_found("routine", routine_id)),
    }
}

/// Loads any routine row, archived ones included. Used by history readers.
pub async fn load_routine_any(conn: &mut SqliteConnection, routine_id: &str) -> AppResult<Routine> {
    let row = sqlx::query(&format!("SELECT {ROUTINE_COLUMNS} FROM routines WHERE id = ?1"))
        .bind(routine_id)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => Routine::try_from(&row),
        None => Err(AppError::not_found("routine", routine_id)),
    }
}

/// Loads a live task whose routine belongs to `family_id`.
pub async fn load_task(
    conn: &mut SqliteConnection,
    task_id: &str,
    family_id: &str,
) -> AppResult<RoutineTask> {
    let row = sqlx::query(&format!(
        "SELECT {TASK_COLUMNS} FROM routine_tasks \
         WHERE id = ?1 AND deleted_at IS NULL \
           AND routine_id IN (SELECT id FROM routines WHERE family_id = ?2)"
    ))
    .bind(task_id)
    .bind(family_id)
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        Some(row) => RoutineTask::try_from(&row),
        None => Err(AppError::not_found("routine_task", task_id)),
    }
}

/// Live, enabled assignment of `child_profile_id` to `routine_id`.
pub async fn ensure_child_assigned(
    conn: &mut SqliteConnection,
    routine_id: &str,
    child_profile_id: &str,
) -> AppResult<ChildRoutine> {
    let row = sqlx::query(&format!(
        "SELECT {CHILD_ROUTINE_COLUMNS} FROM child_routines \
         WHERE routine_id = ?1 AND child_profile_id = ?2 AND deleted_at IS NULL"
    ))
    .bind(routine_id)
    .bind(child_profile_id)
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        Some(row) => {
            let assignment = ChildRoutine::try_from(&row)?;
            if assignment.is_enabled {
                Ok(assignment)
            } else {
                Err(AppError::unassigned_child(routine_id, child_profile_id)
                    .with_context("reason", "disabled"))
            }
        }
        None => Err(AppError::unassigned_child(routine_id, child_profile_id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routine_types_parse() {
        assert_eq!("evening".parse::<RoutineType>().unwrap(), RoutineType::Evening);
        let err = "night".parse::<RoutineType>().unwrap_err();
        assert_eq!(err.context().get("field").map(String::as_str), Some("routineType"));
    }
}
