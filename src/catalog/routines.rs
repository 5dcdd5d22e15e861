use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::{QueryBuilder, Sqlite};

use super::validation::{
    ensure_auto_close_minutes, ensure_non_empty, ensure_window, format_time, parse_opt_time,
    validate_settings,
};
use super::{load_routine, Routine, RoutineType, ROUTINE_COLUMNS};
use crate::auth::AuthContext;
use crate::db::{self, retry_read_once};
use crate::id::new_uuid_v7;
use crate::op_logging::OpScope;
use crate::paging::{Page, PageRequest, SortOrder};
use crate::state::CoreState;
use crate::{AppError, AppResult, ErrorKind};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutineCreate {
    pub name: String,
    pub slug: String,
    pub routine_type: Option<RoutineType>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub auto_close_after_minutes: Option<i64>,
    pub settings: Option<Value>,
}

/// Partial update. `Some(None)` clears a nullable column.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutineUpdate {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub routine_type: Option<RoutineType>,
    pub start_time: Option<Option<String>>,
    pub end_time: Option<Option<String>>,
    pub auto_close_after_minutes: Option<Option<i64>>,
    pub settings: Option<Value>,
    pub is_active: Option<bool>,
}

impl RoutineUpdate {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.slug.is_none()
            && self.routine_type.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.auto_close_after_minutes.is_none()
            && self.settings.is_none()
            && self.is_active.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutineSort {
    Name,
    #[default]
    CreatedAt,
}

impl RoutineSort {
    fn column(self) -> &'static str {
        match self {
            RoutineSort::Name => "name",
            RoutineSort::CreatedAt => "created_at",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoutineListQuery {
    pub routine_type: Option<RoutineType>,
    pub is_active: Option<bool>,
    pub include_deleted: bool,
    pub page: PageRequest,
    pub sort: RoutineSort,
    pub order: SortOrder,
}

fn map_slug_conflict(err: sqlx::Error, slug: &str) -> AppError {
    let mapped = AppError::from(err);
    if mapped.kind() == ErrorKind::Conflict {
        AppError::conflict("SLUG_TAKEN", "A routine with this slug already exists")
            .with_context("field", "slug")
            .with_context("slug", slug)
    } else {
        mapped
    }
}

pub async fn create_routine(
    state: &CoreState,
    ctx: &AuthContext,
    command: RoutineCreate,
) -> AppResult<Routine> {
    let scope = OpScope::new("catalog_create_routine", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        let name = ensure_non_empty("name", &command.name)?;
        let slug = ensure_non_empty("slug", &command.slug)?;
        let routine_type = command
            .routine_type
            .ok_or_else(|| AppError::validation("routineType", "routineType is required"))?;
        let start = parse_opt_time("startTime", command.start_time.as_deref())?;
        let end = parse_opt_time("endTime", command.end_time.as_deref())?;
        ensure_window(start, end)?;
        let auto_close = command
            .auto_close_after_minutes
            .map(ensure_auto_close_minutes)
            .transpose()?;
        let settings = command.settings.unwrap_or_else(|| json!({}));
        validate_settings(&settings)?;

        let id = new_uuid_v7();
        let now = state.now_ms();
        let mut tx = db::begin_write(&state.pool).await?;
        sqlx::query(
            "INSERT INTO routines (id, family_id, name, slug, routine_type, start_time, end_time, \
             auto_close_after_minutes, is_active, settings, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10, ?10)",
        )
        .bind(&id)
        .bind(&ctx.family_id)
        .bind(&name)
        .bind(&slug)
        .bind(routine_type.as_str())
        .bind(start.map(format_time))
        .bind(end.map(format_time))
        .bind(auto_close)
        .bind(settings.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|err| map_slug_conflict(err, &slug))?;
        let routine = load_routine(&mut tx, &id, &ctx.family_id).await?;
        db::commit(tx).await?;
        Ok::<_, AppError>(routine)
    }
    .await;
    scope.finish(result, |routine| json!({ "routine_id": routine.id, "slug": routine.slug }))
}

pub async fn update_routine(
    state: &CoreState,
    ctx: &AuthContext,
    routine_id: &str,
    command: RoutineUpdate,
) -> AppResult<Routine> {
    let scope = OpScope::new("catalog_update_routine", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        if command.is_empty() {
            return Err(AppError::validation("body", "No fields provided to update"));
        }

        let mut tx = db::begin_write(&state.pool).await?;
        let current = load_routine(&mut tx, routine_id, &ctx.family_id).await?;

        let name = match &command.name {
            Some(name) => ensure_non_empty("name", name)?,
            None => current.name.clone(),
        };
        let slug = match &command.slug {
            Some(slug) => ensure_non_empty("slug", slug)?,
            None => current.slug.clone(),
        };
        let routine_type = command.routine_type.unwrap_or(current.routine_type);
        let start = match &command.start_time {
            Some(raw) => parse_opt_time("startTime", raw.as_deref())?,
            None => current.start_time,
        };
        let end = match &command.end_time {
            Some(raw) => parse_opt_time("endTime", raw.as_deref())?,
            None => current.end_time,
        };
        ensure_window(start, end)?;
        let auto_close = match command.auto_close_after_minutes {
            Some(Some(value)) => Some(ensure_auto_close_minutes(value)?),
            Some(None) => None,
            None => current.auto_close_after_minutes,
        };
        let settings = match &command.settings {
            Some(Value::Null) => json!({}),
            Some(settings) => {
                validate_settings(settings)?;
                settings.clone()
            }
            None => current.settings.clone(),
        };
        let is_active = command.is_active.unwrap_or(current.is_active);

        sqlx::query(
            "UPDATE routines SET name = ?1, slug = ?2, routine_type = ?3, start_time = ?4, \
             end_time = ?5, auto_close_after_minutes = ?6, settings = ?7, is_active = ?8, \
             updated_at = ?9 WHERE id = ?10",
        )
        .bind(&name)
        .bind(&slug)
        .bind(routine_type.as_str())
        .bind(start.map(format_time))
        .bind(end.map(format_time))
        .bind(auto_close)
        .bind(settings.to_string())
        .bind(is_active)
        .bind(state.now_ms())
        .bind(routine_id)
        .execute(&mut *tx)
        .await
        .map_err(|err| map_slug_conflict(err, &slug))?;

        let routine = load_routine(&mut tx, routine_id, &ctx.family_id).await?;
        db::commit(tx).await?;
        Ok(routine)
    }
    .await;
    scope.finish(result, |routine| json!({ "routine_id": routine.id }))
}

pub async fn get_routine(state: &CoreState, ctx: &AuthContext, routine_id: &str) -> AppResult<Routine> {
    let scope = OpScope::new("catalog_get_routine", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = retry_read_once(|| async move {
        let mut conn = state.pool.acquire().await?;
        load_routine(&mut conn, routine_id, &ctx.family_id).await
    })
    .await;
    scope.finish(result, |routine| json!({ "routine_id": routine.id }))
}

fn push_list_filters<'a>(
    builder: &mut QueryBuilder<'a, Sqlite>,
    family_id: &'a str,
    query: &RoutineListQuery,
) {
    builder.push(" WHERE family_id = ").push_bind(family_id);
    if !query.include_deleted {
        builder.push(" AND deleted_at IS NULL");
    }
    if let Some(kind) = query.routine_type {
        builder.push(" AND routine_type = ").push_bind(kind.as_str());
    }
    if let Some(active) = query.is_active {
        builder.push(" AND is_active = ").push_bind(active);
    }
}

pub async fn list_routines(
    state: &CoreState,
    ctx: &AuthContext,
    query: RoutineListQuery,
) -> AppResult<Page<Routine>> {
    let scope = OpScope::new("catalog_list_routines", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        query.page.validate()?;
        if query.include_deleted {
            ctx.require_parent_or_admin()?;
        }
        retry_read_once(|| async move {
            let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM routines");
            push_list_filters(&mut count, &ctx.family_id, &query);
            let total = count
                .build_query_scalar::<i64>()
                .fetch_one(&state.pool)
                .await?;

            let mut select =
                QueryBuilder::<Sqlite>::new(format!("SELECT {ROUTINE_COLUMNS} FROM routines"));
            push_list_filters(&mut select, &ctx.family_id, &query);
            select
                .push(format!(
                    " ORDER BY {} {}, id ASC",
                    query.sort.column(),
                    query.order.as_sql()
                ))
                .push(" LIMIT ")
                .push_bind(query.page.limit())
                .push(" OFFSET ")
                .push_bind(query.page.offset());
            let rows = select.build().fetch_all(&state.pool).await?;
            let items = rows
                .iter()
                .map(Routine::try_from)
                .collect::<AppResult<Vec<_>>>()?;
            Ok::<_, AppError>(Page::new(items, query.page, total))
        })
        .await
    }
    .await;
    scope.finish(result, |page| json!({ "count": page.items.len(), "total": page.total }))
}

/// Soft-deletes the routine together with its task copies and assignments.
/// Sessions and ledger rows that reference it are left untouched.
pub async fn archive_routine(state: &CoreState, ctx: &AuthContext, routine_id: &str) -> AppResult<()> {
    let scope = OpScope::new("catalog_archive_routine", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        let now = state.now_ms();
        let mut tx = db::begin_write(&state.pool).await?;
        load_routine(&mut tx, routine_id, &ctx.family_id).await?;

        sqlx::query(
            "UPDATE routines SET deleted_at = ?1, is_active = 0, updated_at = ?1 WHERE id = ?2",
        )
        .bind(now)
        .bind(routine_id)
        .execute(&mut *tx)
        .await?;
        let tasks = sqlx::query(
            "UPDATE routine_tasks SET deleted_at = ?1, is_active = 0, updated_at = ?1 \
             WHERE routine_id = ?2 AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(routine_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let assignments = sqlx::query(
            "UPDATE child_routines SET deleted_at = ?1, updated_at = ?1 \
             WHERE routine_id = ?2 AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(routine_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        db::commit(tx).await?;
        Ok::<_, AppError>((tasks, assignments))
    }
    .await;
    scope
        .finish(result, |(tasks, assignments)| {
            json!({ "routine_id": routine_id, "tasks_archived": tasks, "assignments_archived": assignments })
        })
        .map(|_| ())
}
