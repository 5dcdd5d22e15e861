use serde_json::json;
use sqlx::SqliteConnection;

use super::reorder::{apply_two_phase, validate_orders, PositionUpdate, PositionedTable};
use super::validation::ensure_positive;
use super::{load_routine, ChildRoutine, CHILD_ROUTINE_COLUMNS};
use crate::auth::AuthContext;
use crate::db::{self, retry_read_once};
use crate::id::new_uuid_v7;
use crate::op_logging::OpScope;
use crate::profiles::ensure_child_in_family;
use crate::state::CoreState;
use crate::{AppError, AppResult, ErrorKind};

async fn live_assignments(
    conn: &mut SqliteConnection,
    routine_id: &str,
) -> AppResult<Vec<ChildRoutine>> {
    let rows = sqlx::query(&format!(
        "SELECT {CHILD_ROUTINE_COLUMNS} FROM child_routines \
         WHERE routine_id = ?1 AND deleted_at IS NULL ORDER BY position ASC"
    ))
    .bind(routine_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(ChildRoutine::try_from).collect()
}

/// Assigns (or re-enables, or revives) a child on a routine.
pub async fn assign_child(
    state: &CoreState,
    ctx: &AuthContext,
    routine_id: &str,
    child_profile_id: &str,
    position: i64,
    is_enabled: bool,
) -> AppResult<ChildRoutine> {
    let scope = OpScope::new("catalog_assign_child", Some(&ctx.family_id), Some(child_profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        ensure_positive("position", position)?;
        let now = state.now_ms();
        let mut tx = db::begin_write(&state.pool).await?;
        load_routine(&mut tx, routine_id, &ctx.family_id).await?;
        ensure_child_in_family(&mut tx, child_profile_id, &ctx.family_id).await?;

        sqlx::query(
            "INSERT INTO child_routines (id, routine_id, child_profile_id, is_enabled, position, \
             created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6) \
             ON CONFLICT(routine_id, child_profile_id) DO UPDATE SET \
               is_enabled = excluded.is_enabled, position = excluded.position, \
               deleted_at = NULL, updated_at = excluded.updated_at",
        )
        .bind(new_uuid_v7())
        .bind(routine_id)
        .bind(child_profile_id)
        .bind(is_enabled)
        .bind(position)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|err| {
            let mapped = AppError::from(err);
            if mapped.kind() == ErrorKind::Conflict {
                AppError::conflict("POSITION_TAKEN", "Another child already holds this position")
                    .with_context("field", "position")
                    .with_context("position", position.to_string())
            } else {
                mapped
            }
        })?;

        let row = sqlx::query(&format!(
            "SELECT {CHILD_ROUTINE_COLUMNS} FROM child_routines \
             WHERE routine_id = ?1 AND child_profile_id = ?2"
        ))
        .bind(routine_id)
        .bind(child_profile_id)
        .fetch_one(&mut *tx)
        .await?;
        let assignment = ChildRoutine::try_from(&row)?;
        db::commit(tx).await?;
        Ok::<_, AppError>(assignment)
    }
    .await;
    scope.finish(result, |a| {
        json!({ "routine_id": a.routine_id, "position": a.position, "is_enabled": a.is_enabled })
    })
}

/// Removes the assignment and archives that child's task copies on the routine.
pub async fn unassign_child(
    state: &CoreState,
    ctx: &AuthContext,
    routine_id: &str,
    child_profile_id: &str,
) -> AppResult<()> {
    let scope = OpScope::new("catalog_unassign_child", Some(&ctx.family_id), Some(child_profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        let now = state.now_ms();
        let mut tx = db::begin_write(&state.pool).await?;
        load_routine(&mut tx, routine_id, &ctx.family_id).await?;

        let removed = sqlx::query(
            "UPDATE child_routines SET deleted_at = ?1, updated_at = ?1 \
             WHERE routine_id = ?2 AND child_profile_id = ?3 AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(routine_id)
        .bind(child_profile_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if removed == 0 {
            return Err(AppError::unassigned_child(routine_id, child_profile_id));
        }
        let tasks = sqlx::query(
            "UPDATE routine_tasks SET deleted_at = ?1, is_active = 0, updated_at = ?1 \
             WHERE routine_id = ?2 AND child_profile_id = ?3 AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(routine_id)
        .bind(child_profile_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        db::commit(tx).await?;
        Ok(tasks)
    }
    .await;
    scope
        .finish(result, |tasks| json!({ "routine_id": routine_id, "tasks_archived": tasks }))
        .map(|_| ())
}

pub async fn list_children(
    state: &CoreState,
    ctx: &AuthContext,
    routine_id: &str,
) -> AppResult<Vec<ChildRoutine>> {
    let scope = OpScope::new("catalog_list_children", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        retry_read_once(|| async move {
            let mut conn = state.pool.acquire().await?;
            load_routine(&mut conn, routine_id, &ctx.family_id).await?;
            live_assignments(&mut conn, routine_id).await
        })
        .await
    }
    .await;
    scope.finish(result, |children| json!({ "routine_id": routine_id, "count": children.len() }))
}

/// Re-sequences children on a routine. `orders[].id` is the child profile id.
pub async fn reorder_children(
    state: &CoreState,
    ctx: &AuthContext,
    routine_id: &str,
    orders: Vec<PositionUpdate>,
) -> AppResult<Vec<ChildRoutine>> {
    let scope = OpScope::new("catalog_reorder_children", Some(&ctx.family_id), Some(&ctx.profile_id));
    let result = async {
        ctx.require_parent_or_admin()?;
        validate_orders(&orders)?;
        let mut tx = db::begin_write(&state.pool).await?;
        load_routine(&mut tx, routine_id, &ctx.family_id).await?;

        let current = live_assignments(&mut tx, routine_id).await?;
        let mut rows = Vec::with_capacity(orders.len());
        for order in &orders {
            let assignment = current
                .iter()
                .find(|a| a.child_profile_id == order.id)
                .ok_or_else(|| AppError::unassigned_child(routine_id, &order.id))?;
            rows.push((assignment.id.clone(), order.position));
        }
        apply_two_phase(&mut tx, PositionedTable::ChildRoutines, &rows, state.now_ms()).await?;

        let updated = live_assignments(&mut tx, routine_id).await?;
        db::commit(tx).await?;
        Ok::<_, AppError>(updated)
    }
    .await;
    scope.finish(result, |children| json!({ "routine_id": routine_id, "count": children.len() }))
}
