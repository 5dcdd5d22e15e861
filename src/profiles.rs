use chrono_tz::Tz;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::auth::Role;
use crate::time::family_tz;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub family_id: String,
    pub display_name: String,
    pub role: Role,
}

impl TryFrom<&SqliteRow> for Profile {
    type Error = AppError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        let role: String = row.try_get("role").map_err(AppError::from)?;
        Ok(Self {
            id: row.try_get("id").map_err(AppError::from)?,
            family_id: row.try_get("family_id").map_err(AppError::from)?,
            display_name: row.try_get("display_name").map_err(AppError::from)?,
            role: role.parse()?,
        })
    }
}

/// Loads a live profile and checks it belongs to `family_id`.
pub async fn ensure_profile_in_family(
    conn: &mut SqliteConnection,
    profile_id: &str,
    family_id: &str,
) -> AppResult<Profile> {
    let row = sqlx::query(
        "SELECT id, family_id, display_name, role FROM profiles \
         WHERE id = ?1 AND deleted_at IS NULL",
    )
    .bind(profile_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Err(AppError::forbidden("Profile is not part of this family")
            .with_context("profile_id", profile_id));
    };
    let profile = Profile::try_from(&row)?;
    if profile.family_id != family_id {
        return Err(AppError::forbidden("Profile is not part of this family")
            .with_context("profile_id", profile_id)
            .with_context("family_id", family_id));
    }
    Ok(profile)
}

/// Like [`ensure_profile_in_family`], additionally requiring the child role.
pub async fn ensure_child_in_family(
    conn: &mut SqliteConnection,
    profile_id: &str,
    family_id: &str,
) -> AppResult<Profile> {
    let profile = ensure_profile_in_family(conn, profile_id, family_id).await?;
    if profile.role != Role::Child {
        return Err(AppError::validation("childProfileId", "Profile is not a child")
            .with_context("profile_id", profile_id));
    }
    Ok(profile)
}

pub async fn family_timezone(conn: &mut SqliteConnection, family_id: &str) -> AppResult<Tz> {
    let name: Option<String> =
        sqlx::query_scalar("SELECT timezone FROM families WHERE id = ?1 AND deleted_at IS NULL")
            .bind(family_id)
            .fetch_optional(&mut *conn)
            .await?;
    match name {
        Some(name) => Ok(family_tz(&name)),
        None => Err(AppError::not_found("family", family_id)),
    }
}
