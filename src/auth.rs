use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Parent,
    Child,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Parent => "parent",
            Role::Child => "child",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "parent" => Ok(Role::Parent),
            "child" => Ok(Role::Child),
            "admin" => Ok(Role::Admin),
            other => Err(AppError::new("INTERNAL/ROLE_DECODE", "Unknown profile role")
                .with_context("role", other)),
        }
    }
}

/// Caller identity, validated before it reaches the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthContext {
    pub profile_id: String,
    pub family_id: String,
    pub role: Role,
}

impl AuthContext {
    pub fn new(profile_id: impl Into<String>, family_id: impl Into<String>, role: Role) -> Self {
        Self {
            profile_id: profile_id.into(),
            family_id: family_id.into(),
            role,
        }
    }

    pub fn is_guardian(&self) -> bool {
        matches!(self.role, Role::Parent | Role::Admin)
    }

    pub fn require_parent_or_admin(&self) -> AppResult<()> {
        if self.is_guardian() {
            Ok(())
        } else {
            Err(AppError::forbidden("Only parents or admins can perform this action")
                .with_context("role", self.role.as_str()))
        }
    }

    /// Children may only act on their own profile; guardians on anyone in the family.
    pub fn ensure_self_or_guardian(&self, profile_id: &str) -> AppResult<()> {
        if self.is_guardian() || self.profile_id == profile_id {
            Ok(())
        } else {
            Err(AppError::forbidden("Children can only act on their own profile")
                .with_context("profile_id", profile_id))
        }
    }
}
