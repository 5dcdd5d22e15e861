use std::collections::HashMap;
use std::time::Instant;

use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::{AppError, AppResult};

fn context_to_json(context: &HashMap<String, String>) -> Option<Value> {
    if context.is_empty() {
        None
    } else {
        let mut map = Map::with_capacity(context.len());
        for (key, value) in context {
            map.insert(key.clone(), Value::String(value.clone()));
        }
        Some(Value::Object(map))
    }
}

fn wrap_details(value: Value) -> Value {
    if value.is_object() {
        value
    } else {
        json!({ "value": value })
    }
}

fn error_details(err: &AppError) -> Value {
    let mut map = Map::new();
    map.insert("code".into(), Value::String(err.code().to_string()));
    map.insert("message".into(), Value::String(err.message().to_string()));
    if let Some(context) = context_to_json(err.context()) {
        map.insert("context".into(), context);
    }
    Value::Object(map)
}

/// Brackets one public core operation with enter/success/failure events.
pub struct OpScope {
    cmd: &'static str,
    family_id: Option<String>,
    profile_id: Option<String>,
    start: Instant,
}

impl OpScope {
    pub fn new(cmd: &'static str, family_id: Option<&str>, profile_id: Option<&str>) -> Self {
        let scope = Self {
            cmd,
            family_id: family_id.map(str::to_string),
            profile_id: profile_id.map(str::to_string),
            start: Instant::now(),
        };
        debug!(
            target: "routinely",
            area = "core",
            cmd = scope.cmd,
            family_id = scope.family_id.as_deref(),
            profile_id = scope.profile_id.as_deref(),
            details = %json!({ "stage": "enter" })
        );
        scope
    }

    fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    pub fn success(&self, details: Value) {
        info!(
            target: "routinely",
            area = "core",
            cmd = self.cmd,
            family_id = self.family_id.as_deref(),
            profile_id = self.profile_id.as_deref(),
            duration_ms = self.elapsed_ms(),
            details = %wrap_details(details)
        );
    }

    pub fn warn(&self, details: Value) {
        warn!(
            target: "routinely",
            area = "core",
            cmd = self.cmd,
            family_id = self.family_id.as_deref(),
            profile_id = self.profile_id.as_deref(),
            duration_ms = self.elapsed_ms(),
            details = %wrap_details(details)
        );
    }

    /// Caller mistakes log at warn; store and internal failures at error.
    pub fn fail(&self, err: &AppError) {
        if err.kind().is_caller_error() {
            self.warn(error_details(err));
            return;
        }
        error!(
            target: "routinely",
            area = "core",
            cmd = self.cmd,
            family_id = self.family_id.as_deref(),
            profile_id = self.profile_id.as_deref(),
            duration_ms = self.elapsed_ms(),
            details = %error_details(err)
        );
    }

    /// Logs the outcome of `result` and hands it back unchanged.
    pub fn finish<T>(&self, result: AppResult<T>, details: impl FnOnce(&T) -> Value) -> AppResult<T> {
        match &result {
            Ok(value) => self.success(details(value)),
            Err(err) => self.fail(err),
        }
        result
    }
}
