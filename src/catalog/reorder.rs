use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use crate::{AppError, AppResult};

/// Rows are parked here during the first phase. Live positions stay far below it.
pub(crate) const TEMP_OFFSET: i64 = 1_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    pub id: String,
    pub position: i64,
}

impl PositionUpdate {
    pub fn new(id: impl Into<String>, position: i64) -> Self {
        Self {
            id: id.into(),
            position,
        }
    }
}

/// Tables whose rows carry a scoped unique `position`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PositionedTable {
    RoutineTasks,
    ChildRoutines,
}

impl PositionedTable {
    fn name(self) -> &'static str {
        match self {
            PositionedTable::RoutineTasks => "routine_tasks",
            PositionedTable::ChildRoutines => "child_routines",
        }
    }
}

/// Rejects empty lists, non-positive or oversized positions and duplicates.
pub(crate) fn validate_orders(orders: &[PositionUpdate]) -> AppResult<()> {
    if orders.is_empty() {
        return Err(AppError::validation("orders", "orders must be a non-empty array"));
    }
    let mut ids = HashSet::with_capacity(orders.len());
    let mut positions = HashSet::with_capacity(orders.len());
    for order in orders {
        if order.position <= 0 || order.position >= TEMP_OFFSET {
            return Err(AppError::validation(
                "position",
                "position must be a positive integer",
            )
            .with_context("id", order.id.clone()));
        }
        if !ids.insert(order.id.as_str()) {
            return Err(AppError::validation("orders", "Duplicate id in orders")
                .with_context("id", order.id.clone()));
        }
        if !positions.insert(order.position) {
            return Err(AppError::validation("orders", "Duplicate position in orders")
                .with_context("position", order.position.to_string()));
        }
    }
    Ok(())
}

/// Moves every listed row to its final position in two passes: first into a
/// disjoint range above [`TEMP_OFFSET`], then down to the target. Must run
/// inside the caller's write transaction so no intermediate state is visible.
pub(crate) async fn apply_two_phase(
    conn: &mut SqliteConnection,
    table: PositionedTable,
    rows: &[(String, i64)],
    now_ms: i64,
) -> AppResult<()> {
    let park = format!(
        "UPDATE {} SET position = ?1 WHERE id = ?2",
        table.name()
    );
    for (id, position) in rows {
        sqlx::query(&park)
            .bind(position + TEMP_OFFSET)
            .bind(id)
            .execute(&mut *conn)
            .await?;
    }

    let settle = format!(
        "UPDATE {} SET position = ?1, updated_at = ?2 WHERE id = ?3",
        table.name()
    );
    for (id, position) in rows {
        sqlx::query(&settle)
            .bind(position)
            .bind(now_ms)
            .bind(id)
            .execute(&mut *conn)
            .await
            .map_err(|err| {
                let mapped = AppError::from(err);
                if mapped.kind() == crate::ErrorKind::Conflict {
                    AppError::conflict(
                        "POSITION_TAKEN",
                        "Position is held by a row missing from the reorder list",
                    )
                    .with_context("id", id.clone())
                    .with_context("position", position.to_string())
                } else {
                    mapped
                }
            })?;
    }

    tracing::debug!(
        target: "routinely",
        event = "positions_reassigned",
        table = table.name(),
        rows = rows.len()
    );
    Ok(())
}
