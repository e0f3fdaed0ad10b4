//! Hot-reloadable settings.
//!
//! Every read is a point lookup against the settings table, so writers are
//! visible on the next access without a restart. Callers must not cache
//! values across external waits. Unknown keys fall back to the documented
//! default; malformed values warn and fall back, never raise.

use crate::storage::Db;
use anyhow::Result;
use serde_json::Value;
use tracing::warn;

pub mod keys {
    pub const DRY_RUN_MODE: &str = "dry_run_mode";
    pub const AUTO_EXECUTE_ENABLED: &str = "auto_execute_enabled";
    pub const MAX_DAILY_ANALYSES: &str = "max_daily_analyses";
    pub const MAX_DAILY_EXECUTIONS: &str = "max_daily_executions";
    pub const CLAUDE_TIMEOUT_SECONDS: &str = "claude_timeout_seconds";
    pub const PHASE2_TIMEOUT_SECONDS: &str = "phase2_timeout_seconds";
    pub const PHASE3_TIMEOUT_SECONDS: &str = "phase3_timeout_seconds";
    pub const PHASE4_TIMEOUT_SECONDS: &str = "phase4_timeout_seconds";
    pub const FOUR_PHASE_ANALYSIS_ENABLED: &str = "four_phase_analysis_enabled";
    pub const MAX_CONCURRENT_ANALYSES: &str = "max_concurrent_analyses";
    pub const LOG_LEVEL: &str = "log_level";
    pub const REASONING_ENV_WHITELIST: &str = "reasoning_env_whitelist";
}

fn category_of(key: &str) -> &'static str {
    match key {
        keys::DRY_RUN_MODE | keys::AUTO_EXECUTE_ENABLED => "safety",
        keys::MAX_DAILY_ANALYSES | keys::MAX_DAILY_EXECUTIONS | keys::MAX_CONCURRENT_ANALYSES => {
            "limits"
        }
        keys::CLAUDE_TIMEOUT_SECONDS
        | keys::PHASE2_TIMEOUT_SECONDS
        | keys::PHASE3_TIMEOUT_SECONDS
        | keys::PHASE4_TIMEOUT_SECONDS => "timeouts",
        keys::FOUR_PHASE_ANALYSIS_ENABLED => "pipeline",
        keys::LOG_LEVEL => "logging",
        keys::REASONING_ENV_WHITELIST => "safety",
        _ => "general",
    }
}

#[derive(Clone)]
pub struct Settings {
    db: Db,
}

impl Settings {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn get_value(&self, key: &str) -> Option<Value> {
        let raw = match self.db.get_setting(key).await {
            Ok(v) => v?,
            Err(e) => {
                warn!(key, error = %e, "settings read failed, using default");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "malformed setting value, using default");
                None
            }
        }
    }

    pub async fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get_value(key).await {
            Some(Value::Bool(b)) => b,
            Some(other) => {
                warn!(key, value = %other, "expected bool setting, using default");
                default
            }
            None => default,
        }
    }

    pub async fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.get_value(key).await {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
            Some(other) => {
                warn!(key, value = %other, "expected integer setting, using default");
                default
            }
            None => default,
        }
    }

    pub async fn get_string(&self, key: &str, default: &str) -> String {
        match self.get_value(key).await {
            Some(Value::String(s)) => s,
            Some(other) => {
                warn!(key, value = %other, "expected string setting, using default");
                default.to_string()
            }
            None => default.to_string(),
        }
    }

    pub async fn get_string_list(&self, key: &str) -> Vec<String> {
        match self.get_value(key).await {
            Some(Value::Array(items)) => items
                .into_iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
            Some(other) => {
                warn!(key, value = %other, "expected list setting, using default");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Write a setting and audit the old → new transition.
    pub async fn set(&self, key: &str, value: Value, actor: &str) -> Result<()> {
        let old = self.get_value(key).await.unwrap_or(Value::Null);
        self.db
            .set_setting(key, &value.to_string(), category_of(key))
            .await?;
        self.db
            .log_event(
                "settings.set",
                actor,
                "setting",
                key,
                "ok",
                &serde_json::json!({ "old": old, "new": value }),
            )
            .await?;
        Ok(())
    }

    pub async fn dry_run_mode(&self) -> bool {
        self.get_bool(keys::DRY_RUN_MODE, false).await
    }

    pub async fn auto_execute_enabled(&self) -> bool {
        self.get_bool(keys::AUTO_EXECUTE_ENABLED, false).await
    }

    pub async fn max_daily_analyses(&self) -> i64 {
        self.get_i64(keys::MAX_DAILY_ANALYSES, 20).await
    }

    pub async fn max_daily_executions(&self) -> i64 {
        self.get_i64(keys::MAX_DAILY_EXECUTIONS, 3).await
    }

    pub async fn claude_timeout_seconds(&self) -> i64 {
        self.get_i64(keys::CLAUDE_TIMEOUT_SECONDS, 300).await
    }

    pub async fn phase2_timeout_seconds(&self) -> i64 {
        self.get_i64(keys::PHASE2_TIMEOUT_SECONDS, 120).await
    }

    pub async fn phase3_timeout_seconds(&self) -> i64 {
        self.get_i64(keys::PHASE3_TIMEOUT_SECONDS, 60).await
    }

    pub async fn phase4_timeout_seconds(&self) -> i64 {
        self.get_i64(keys::PHASE4_TIMEOUT_SECONDS, 30).await
    }

    pub async fn four_phase_analysis_enabled(&self) -> bool {
        self.get_bool(keys::FOUR_PHASE_ANALYSIS_ENABLED, true).await
    }

    pub async fn max_concurrent_analyses(&self) -> i64 {
        self.get_i64(keys::MAX_CONCURRENT_ANALYSES, 2).await
    }

    pub async fn log_level(&self) -> String {
        self.get_string(keys::LOG_LEVEL, "info").await
    }

    pub async fn reasoning_env_whitelist(&self) -> Vec<String> {
        self.get_string_list(keys::REASONING_ENV_WHITELIST).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn defaults_for_unknown_keys() {
        let settings = Settings::new(Db::open_in_memory().unwrap());
        assert!(!settings.dry_run_mode().await);
        assert!(settings.four_phase_analysis_enabled().await);
        assert_eq!(settings.max_daily_analyses().await, 20);
        assert_eq!(settings.phase2_timeout_seconds().await, 120);
        assert_eq!(settings.log_level().await, "info");
    }

    #[tokio::test]
    async fn set_then_get_observes_latest() {
        let settings = Settings::new(Db::open_in_memory().unwrap());
        settings
            .set(keys::DRY_RUN_MODE, json!(true), "test")
            .await
            .unwrap();
        assert!(settings.dry_run_mode().await);
        settings
            .set(keys::MAX_DAILY_ANALYSES, json!(5), "test")
            .await
            .unwrap();
        assert_eq!(settings.max_daily_analyses().await, 5);
    }

    #[tokio::test]
    async fn wrong_type_falls_back_to_default() {
        let db = Db::open_in_memory().unwrap();
        db.set_setting(keys::MAX_DAILY_ANALYSES, "\"lots\"", "limits")
            .await
            .unwrap();
        let settings = Settings::new(db);
        assert_eq!(settings.max_daily_analyses().await, 20);
    }

    #[tokio::test]
    async fn malformed_json_falls_back_to_default() {
        let db = Db::open_in_memory().unwrap();
        db.set_setting(keys::DRY_RUN_MODE, "not-json", "safety")
            .await
            .unwrap();
        let settings = Settings::new(db);
        assert!(!settings.dry_run_mode().await);
    }
}
