use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqliteConnection;

use super::reorder::{apply_two_phase, validate_orders, PositionUpdate, PositionedTable};
use super::validation::{ensure_non_empty, ensure_non_negative, ensure_positive};
use super::{ensure_child_assigned, load_routine, load_task, RoutineTask, TASK_COLUMNS};
use crate::auth::AuthContext;
use crate::db::{self, retry_read_once};
use crate::id::new_uuid_v7;
use crate::op_logging::OpScope;
use crate::paging::SortOrder;
use crate::state::CoreState;
use crate::{AppError, AppResult, ErrorKind};

/// Points given to grouped tasks created without an explicit value.
pub const DEFAULT_GROUP_POINTS: i64 = 10;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCreate {
    pub name: String,
    pub description: Option<String>,
    pub points: Option<i64>,
    /// Defaults to the end of the list. Not accepted for grouped creation.
    pub position: Option<i64>,
    #[serde(default)]
    pub is_optional: bool,
    pub expected_duration_seconds: Option<i64>,
}

/// Partial update of one task copy. Setting `deleted_at` archives it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub points: Option<i64>,
    pub position: Option<i64>,
    pub is_optional: Option<bool>,
    pub is_active: Option<bool>,
    pub expected_duration_seconds: Option<Option<i64>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TaskUpdate {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.points.is_none()
            && self.position.is_none()
            && self.is_optional.is_none()
            && self.is_active.is_none()
            && self.expected_duration_seconds.is_none()
            && self.deleted_at.is_none()
    }
}

/// Fields that fan out to every copy sharing a task's name.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskGroupUpdate {
    pub name: Option<String>,
    pub points: Option<i64>,
    pub is_optional: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSort {
    #[default]
    Position,
    CreatedAt,
}

impl TaskSort {
    fn column(self) -> &'static str {
        match self {
            TaskSort::Position => "position",
            TaskSort::CreatedAt => "created_at",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskListQuery {
    pub include_inactive: bool,
    pub sort: TaskSort,
    pub order: SortOrder,
}

impl Default for TaskListQuery {
    fn default() -> Self {
        Self {
            include_inactive: false,
            sort: TaskSort::Position,
            order: SortOrder::Asc,
        }
    }
}

fn map_position_conflict(err: sqlx::Error, position: i64) -> AppError {
    let mapped = AppError::from(err);
    if mapped.kind() == ErrorKind::Conflict {
        AppError::conflict("POSITION_TAKEN", "Another task already holds this position")
            .with_context("field", "position")
            .with_context("position", position.to_string())
    } else {
        mapped
    }
}

async fn next_child_position(
    conn: &mut SqliteConnection,
    routine_id: &str,
    child_profile_id: &str,
) -> AppResult<i64> {
    let max: Option<i64> = sqlx::query_scalar(
        "SELECT MAX(position) FROM routine_tasks \
         WHERE routine_id = ?1 AND child_profile_id = ?2 AND deleted_at IS NULL",
    )
    .bind(routine_id)
    .bind(child_profile_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(max.unwrap_or(0) + 1)
}

async fn load_task_by_id(conn: &mut SqliteConnection, task_id: &str) -> AppResult<RoutineTask> {
    let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM routine_tasks WHERE id = ?1"))
        .bind(task_id)
        .fetch_one(&mut *conn)
        .await?;
    RoutineTask::try_from(&row)
}

async fn live_group(
    conn: &mut SqliteConnection,
    routine_id: &str,
    name: &str,
) -> AppResult<Vec<RoutineTask>> {
    let rows = sqlx::query(&format!(
        "SELECT {TASK_COLUMNS} FROM routine_tasks \
         WHERE routine_id = ?1 AND name = ?2 AND deleted_at IS NULL \
         ORDER BY child_profile_id ASC"
    ))
    .bind(routine_id)
    .bind(name)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(RoutineTask::try_from).collect()
}

async fn live_routine_tasks(
    conn: &mut SqliteConnection,
    routine_id: &str,
) -> AppResult<Vec<RoutineTask>> {
    let rows = sqlx::query(&format!(
        "SELECT {TASK_COLUMNS} FROM routine_tasks \
         WHERE routine_id = ?1 AND deleted_at IS NULL \
         ORDER BY child_profile_id ASC, position ASC"
    ))
    .bind(routine_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(RoutineTask::try_from).collect()
}

fn validated_optional_fields(command: &TaskCreate) -> AppResult<(String, Option<i64>)> {
    let name = ensure_non_empty("name", &command.name)?;
    let duration = command
        .expected_duration_seconds
        .map(|value| ensure_positive("expectedDurationSeconds", value))
        .transpose()?;
    Ok((name, duration))
}

/// Adds a task to one child's copy of the routine. The child must be assigned and enabled.
pub async fn create_task(
    state: &CoreState,
    ctx: &AuthContext,
    routine_id: &str,
    child_profile_id: &str,
    command: TaskCreate,
) -> AppResult<RoutineTask> {
    let scope = OpScope::new("catalog_create_task", Some(&ctx.family_id), Some(child_profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        let (name, duration) = validated_optional_fields(&command)?;
        let points = ensure_non_negative("points", command.points.unwrap_or(0))?;
        if let Some(position) = command.position {
            ensure_positive("position", position)?;
        }

        let now = state.now_ms();
        let mut tx = db::begin_write(&state.pool).await?;
        load_routine(&mut tx, routine_id, &ctx.family_id).await?;
        ensure_child_assigned(&mut tx, routine_id, child_profile_id).await?;
        let position = match command.position {
            Some(position) => position,
            None => next_child_position(&mut tx, routine_id, child_profile_id).await?,
        };

        let id = new_uuid_v7();
        sqlx::query(
            "INSERT INTO routine_tasks (id, routine_id, child_profile_id, name, description, \
             points, position, is_optional, is_active, expected_duration_seconds, created_at, \
             updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10, ?10)",
        )
        .bind(&id)
        .bind(routine_id)
        .bind(child_profile_id)
        .bind(&name)
        .bind(command.description.as_deref())
        .bind(points)
        .bind(position)
        .bind(command.is_optional)
        .bind(duration)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|err| map_position_conflict(err, position))?;

        let task = load_task_by_id(&mut tx, &id).await?;
        db::commit(tx).await?;
        Ok::<_, AppError>(task)
    }
    .await;
    scope.finish(result, |task| {
        json!({ "routine_id": task.routine_id, "task_id": task.id, "position": task.position })
    })
}

pub async fn list_tasks(
    state: &CoreState,
    ctx: &AuthContext,
    routine_id: &str,
    child_profile_id: &str,
    query: TaskListQuery,
) -> AppResult<Vec<RoutineTask>> {
    let scope = OpScope::new("catalog_list_tasks", Some(&ctx.family_id), Some(child_profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        retry_read_once(|| async move {
            let mut conn = state.pool.acquire().await?;
            load_routine(&mut conn, routine_id, &ctx.family_id).await?;
            let filter = if query.include_inactive {
                ""
            } else {
                " AND is_active = 1 AND deleted_at IS NULL"
            };
            let rows = sqlx::query(&format!(
                "SELECT {TASK_COLUMNS} FROM routine_tasks \
                 WHERE routine_id = ?1 AND child_profile_id = ?2{filter} \
                 ORDER BY {} {}, id ASC",
                query.sort.column(),
                query.order.as_sql()
            ))
            .bind(routine_id)
            .bind(child_profile_id)
            .fetch_all(&mut *conn)
            .await?;
            rows.iter()
                .map(RoutineTask::try_from)
                .collect::<AppResult<Vec<_>>>()
        })
        .await
    }
    .await;
    scope.finish(result, |tasks| json!({ "routine_id": routine_id, "count": tasks.len() }))
}

pub async fn update_task(
    state: &CoreState,
    ctx: &AuthContext,
    task_id: &str,
    command: TaskUpdate,
) -> AppResult<RoutineTask> {
    let scope = OpScope::new("catalog_update_task", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        if command.is_empty() {
            return Err(AppError::validation("body", "No fields provided to update"));
        }

        let mut tx = db::begin_write(&state.pool).await?;
        let current = load_task(&mut tx, task_id, &ctx.family_id).await?;

        let name = match &command.name {
            Some(name) => ensure_non_empty("name", name)?,
            None => current.name.clone(),
        };
        let description = match &command.description {
            Some(value) => value.clone(),
            None => current.description.clone(),
        };
        let points = match command.points {
            Some(points) => ensure_non_negative("points", points)?,
            None => current.points,
        };
        let position = match command.position {
            Some(position) => ensure_positive("position", position)?,
            None => current.position,
        };
        let duration = match command.expected_duration_seconds {
            Some(Some(value)) => Some(ensure_positive("expectedDurationSeconds", value)?),
            Some(None) => None,
            None => current.expected_duration_seconds,
        };
        let is_optional = command.is_optional.unwrap_or(current.is_optional);
        let deleted_at = command.deleted_at.map(|at| at.timestamp_millis());
        let is_active = if deleted_at.is_some() {
            false
        } else {
            command.is_active.unwrap_or(current.is_active)
        };

        sqlx::query(
            "UPDATE routine_tasks SET name = ?1, description = ?2, points = ?3, position = ?4, \
             is_optional = ?5, is_active = ?6, expected_duration_seconds = ?7, \
             deleted_at = ?8, updated_at = ?9 WHERE id = ?10",
        )
        .bind(&name)
        .bind(description.as_deref())
        .bind(points)
        .bind(position)
        .bind(is_optional)
        .bind(is_active)
        .bind(duration)
        .bind(deleted_at)
        .bind(state.now_ms())
        .bind(task_id)
        .execute(&mut *tx)
        .await
        .map_err(|err| map_position_conflict(err, position))?;

        let task = load_task_by_id(&mut tx, task_id).await?;
        db::commit(tx).await?;
        Ok(task)
    }
    .await;
    scope.finish(result, |task| {
        json!({ "task_id": task.id, "archived": task.deleted_at.is_some() })
    })
}

pub async fn archive_task(state: &CoreState, ctx: &AuthContext, task_id: &str) -> AppResult<()> {
    let scope = OpScope::new("catalog_archive_task", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        let now = state.now_ms();
        let mut tx = db::begin_write(&state.pool).await?;
        load_task(&mut tx, task_id, &ctx.family_id).await?;
        sqlx::query(
            "UPDATE routine_tasks SET deleted_at = ?1, is_active = 0, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(task_id)
        .execute(&mut *tx)
        .await?;
        db::commit(tx).await?;
        Ok::<_, AppError>(())
    }
    .await;
    scope.finish(result, |_| json!({ "task_id": task_id }))
}

/// Re-sequences one child's tasks. Every id must be a live task of that routine and child.
pub async fn reorder_tasks(
    state: &CoreState,
    ctx: &AuthContext,
    routine_id: &str,
    child_profile_id: &str,
    orders: Vec<PositionUpdate>,
) -> AppResult<Vec<RoutineTask>> {
    let scope = OpScope::new("catalog_reorder_tasks", Some(&ctx.family_id), Some(child_profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        validate_orders(&orders)?;
        let mut tx = db::begin_write(&state.pool).await?;
        load_routine(&mut tx, routine_id, &ctx.family_id).await?;

        let current: Vec<RoutineTask> = live_routine_tasks(&mut tx, routine_id)
            .await?
            .into_iter()
            .filter(|task| task.child_profile_id == child_profile_id)
            .collect();
        let known: HashSet<&str> = current.iter().map(|task| task.id.as_str()).collect();
        let mut rows = Vec::with_capacity(orders.len());
        for order in &orders {
            if !known.contains(order.id.as_str()) {
                return Err(AppError::not_found("routine_task", &order.id)
                    .with_context("routine_id", routine_id)
                    .with_context("child_profile_id", child_profile_id));
            }
            rows.push((order.id.clone(), order.position));
        }
        apply_two_phase(&mut tx, PositionedTable::RoutineTasks, &rows, state.now_ms()).await?;

        let updated: Vec<RoutineTask> = live_routine_tasks(&mut tx, routine_id)
            .await?
            .into_iter()
            .filter(|task| task.child_profile_id == child_profile_id)
            .collect();
        db::commit(tx).await?;
        Ok(updated)
    }
    .await;
    scope.finish(result, |tasks| json!({ "routine_id": routine_id, "count": tasks.len() }))
}

/// Creates one copy of the task for every enabled child on the routine, all at the
/// same position just past the routine's highest one. Returns the created copies.
pub async fn create_task_for_all_children(
    state: &CoreState,
    ctx: &AuthContext,
    routine_id: &str,
    command: TaskCreate,
) -> AppResult<Vec<RoutineTask>> {
    let scope = OpScope::new("catalog_create_task_group", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        if command.position.is_some() {
            return Err(AppError::validation(
                "position",
                "position is assigned automatically for grouped tasks",
            ));
        }
        let (name, duration) = validated_optional_fields(&command)?;
        let points = ensure_non_negative("points", command.points.unwrap_or(DEFAULT_GROUP_POINTS))?;

        let now = state.now_ms();
        let mut tx = db::begin_write(&state.pool).await?;
        load_routine(&mut tx, routine_id, &ctx.family_id).await?;

        let children: Vec<String> = sqlx::query_scalar(
            "SELECT child_profile_id FROM child_routines \
             WHERE routine_id = ?1 AND is_enabled = 1 AND deleted_at IS NULL \
             ORDER BY position ASC",
        )
        .bind(routine_id)
        .fetch_all(&mut *tx)
        .await?;
        let max: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(position) FROM routine_tasks WHERE routine_id = ?1 AND deleted_at IS NULL",
        )
        .bind(routine_id)
        .fetch_one(&mut *tx)
        .await?;
        let position = max.unwrap_or(0) + 1;

        let mut ids = Vec::with_capacity(children.len());
        for child in &children {
            let id = new_uuid_v7();
            sqlx::query(
                "INSERT INTO routine_tasks (id, routine_id, child_profile_id, name, description, \
                 points, position, is_optional, is_active, expected_duration_seconds, \
                 created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10, ?10)",
            )
            .bind(&id)
            .bind(routine_id)
            .bind(child)
            .bind(&name)
            .bind(command.description.as_deref())
            .bind(points)
            .bind(position)
            .bind(command.is_optional)
            .bind(duration)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(|err| map_position_conflict(err, position))?;
            ids.push(id);
        }

        let mut created = Vec::with_capacity(ids.len());
        for id in &ids {
            created.push(load_task_by_id(&mut tx, id).await?);
        }
        db::commit(tx).await?;
        Ok(created)
    }
    .await;
    scope.finish(result, |tasks| json!({ "routine_id": routine_id, "copies": tasks.len() }))
}

/// Applies the update to every live copy in the routine sharing the task's current name.
pub async fn update_task_group(
    state: &CoreState,
    ctx: &AuthContext,
    task_id: &str,
    command: TaskGroupUpdate,
) -> AppResult<Vec<RoutineTask>> {
    let scope = OpScope::new("catalog_update_task_group", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        if command.name.is_none() && command.points.is_none() && command.is_optional.is_none() {
            return Err(AppError::validation("body", "No fields provided to update"));
        }
        let name = command
            .name
            .as_deref()
            .map(|name| ensure_non_empty("name", name))
            .transpose()?;
        let points = command
            .points
            .map(|points| ensure_non_negative("points", points))
            .transpose()?;

        let now = state.now_ms();
        let mut tx = db::begin_write(&state.pool).await?;
        let anchor = load_task(&mut tx, task_id, &ctx.family_id).await?;
        let group = live_group(&mut tx, &anchor.routine_id, &anchor.name).await?;

        for task in &group {
            sqlx::query(
                "UPDATE routine_tasks SET name = ?1, points = ?2, is_optional = ?3, updated_at = ?4 \
                 WHERE id = ?5",
            )
            .bind(name.as_deref().unwrap_or(&task.name))
            .bind(points.unwrap_or(task.points))
            .bind(command.is_optional.unwrap_or(task.is_optional))
            .bind(now)
            .bind(&task.id)
            .execute(&mut *tx)
            .await?;
        }

        let mut updated = Vec::with_capacity(group.len());
        for task in &group {
            updated.push(load_task_by_id(&mut tx, &task.id).await?);
        }
        db::commit(tx).await?;
        Ok(updated)
    }
    .await;
    scope.finish(result, |tasks| json!({ "task_id": task_id, "copies": tasks.len() }))
}

/// Archives every live copy sharing the task's name. Returns how many were archived.
pub async fn archive_task_group(state: &CoreState, ctx: &AuthContext, task_id: &str) -> AppResult<u64> {
    let scope = OpScope::new("catalog_archive_task_group", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        let now = state.now_ms();
        let mut tx = db::begin_write(&state.pool).await?;
        let anchor = load_task(&mut tx, task_id, &ctx.family_id).await?;
        let archived = sqlx::query(
            "UPDATE routine_tasks SET deleted_at = ?1, is_active = 0, updated_at = ?1 \
             WHERE routine_id = ?2 AND name = ?3 AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(&anchor.routine_id)
        .bind(&anchor.name)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        db::commit(tx).await?;
        Ok::<_, AppError>(archived)
    }
    .await;
    scope.finish(result, |archived| json!({ "task_id": task_id, "copies": archived }))
}

/// Moves every copy sharing each listed task's name to the requested position.
/// `orders[].id` is any task id of the group. Returns the routine's live tasks.
pub async fn reorder_task_groups(
    state: &CoreState,
    ctx: &AuthContext,
    routine_id: &str,
    orders: Vec<PositionUpdate>,
) -> AppResult<Vec<RoutineTask>> {
    let scope = OpScope::new("catalog_reorder_task_groups", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        validate_orders(&orders)?;
        let mut tx = db::begin_write(&state.pool).await?;
        load_routine(&mut tx, routine_id, &ctx.family_id).await?;

        let current = live_routine_tasks(&mut tx, routine_id).await?;
        let mut names = HashSet::with_capacity(orders.len());
        let mut rows = Vec::new();
        for order in &orders {
            let anchor = current
                .iter()
                .find(|task| task.id == order.id)
                .ok_or_else(|| {
                    AppError::not_found("routine_task", &order.id)
                        .with_context("routine_id", routine_id)
                })?;
            if !names.insert(anchor.name.as_str()) {
                return Err(AppError::validation("orders", "Two orders target the same task group")
                    .with_context("name", anchor.name.clone()));
            }
            rows.extend(
                current
                    .iter()
                    .filter(|task| task.name == anchor.name)
                    .map(|task| (task.id.clone(), order.position)),
            );
        }
        apply_two_phase(&mut tx, PositionedTable::RoutineTasks, &rows, state.now_ms()).await?;

        let updated = live_routine_tasks(&mut tx, routine_id).await?;
        db::commit(tx).await?;
        Ok(updated)
    }
    .await;
    scope.finish(result, |tasks| json!({ "routine_id": routine_id, "count": tasks.len() }))
}
