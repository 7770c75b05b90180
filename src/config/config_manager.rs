// ==========================================
// 维修准备排产系统 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写管理; 目标策略版本存储
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use crate::config::objective_policy::{ObjectivePolicy, PriorityTemplate, TemplateRef};
use crate::config::scheduler_config::{BusyPolicy, SchedulerConfig};
use crate::db::{init_schema, open_sqlite_connection};
use crate::repository::error::{RepositoryError, RepositoryResult};

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let conn = open_sqlite_connection(db_path)?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：为保证连接行为一致，会对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> RepositoryResult<Self> {
        {
            let guard = conn.lock().map_err(|e| RepositoryError::LockError(e.to_string()))?;
            crate::db::configure_sqlite_connection(&guard)?;
        }
        Ok(Self { conn })
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 读取 global scope 的配置值
    pub fn get_global_config_value(&self, key: &str) -> RepositoryResult<Option<String>> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// 写入 global scope 的配置值 (UPSERT)
    pub fn set_global_config_value(&self, key: &str, value: &str) -> RepositoryResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value) VALUES ('global', ?1, ?2)
             ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2, updated_at = datetime('now')",
            params![key, value],
        )?;
        Ok(())
    }

    /// 读取并解析配置, 缺失或格式错误时取默认值
    fn parsed_or<T: FromStr>(&self, key: &str, default: T) -> RepositoryResult<T> {
        let Some(raw) = self.get_global_config_value(key)? else {
            return Ok(default);
        };
        match raw.trim().parse::<T>() {
            Ok(v) => Ok(v),
            Err(_) => {
                tracing::warn!(config_key = key, raw_value = %raw, "配置格式错误，使用默认值");
                Ok(default)
            }
        }
    }

    /// 获取所有 global 配置的快照（JSON格式）
    pub fn get_config_snapshot(&self) -> RepositoryResult<String> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key")?;
        let config_map = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<HashMap<String, String>, _>>()?;
        Ok(serde_json::to_string(&json!(config_map))?)
    }

    // ===== 排产参数 =====

    /// 加载排产配置 (默认值 + config_kv 覆写)
    pub fn load_scheduler_config(&self) -> RepositoryResult<SchedulerConfig> {
        let d = SchedulerConfig::default();

        let busy_policy = match self.get_global_config_value(config_keys::BUSY_POLICY)? {
            Some(raw) => serde_json::from_str::<BusyPolicy>(&raw).unwrap_or_else(|_| {
                tracing::warn!(config_key = config_keys::BUSY_POLICY, raw_value = %raw, "并发策略配置格式错误，使用默认值");
                d.busy_policy
            }),
            None => d.busy_policy,
        };

        let mut budgets = d.budgets.clone();
        budgets.small_tier_secs = self.parsed_or(config_keys::SMALL_TIER_SECS, budgets.small_tier_secs)?;
        budgets.medium_tier_secs = self.parsed_or(config_keys::MEDIUM_TIER_SECS, budgets.medium_tier_secs)?;
        budgets.large_tier_secs = self.parsed_or(config_keys::LARGE_TIER_SECS, budgets.large_tier_secs)?;
        budgets.replan_ratio = self.parsed_or(config_keys::REPLAN_RATIO, budgets.replan_ratio)?;
        budgets.max_iterations = self.parsed_or(config_keys::MAX_ITERATIONS, budgets.max_iterations)?;
        budgets.num_workers = self.parsed_or(config_keys::NUM_WORKERS, budgets.num_workers)?;
        budgets.random_seed = self.parsed_or(config_keys::RANDOM_SEED, budgets.random_seed)?;

        let mut guardrails = d.guardrails.clone();
        guardrails.max_preemptions_per_day =
            self.parsed_or(config_keys::MAX_PREEMPTIONS_PER_DAY, guardrails.max_preemptions_per_day)?;
        guardrails.max_preemption_hours =
            self.parsed_or(config_keys::MAX_PREEMPTION_HOURS, guardrails.max_preemption_hours)?;
        guardrails.require_approval = self.parsed_or(config_keys::REQUIRE_APPROVAL, guardrails.require_approval)?;
        guardrails.recovery_priority_boost =
            self.parsed_or(config_keys::RECOVERY_PRIORITY_BOOST, guardrails.recovery_priority_boost)?;
        guardrails.recovery_window_hours =
            self.parsed_or(config_keys::RECOVERY_WINDOW_HOURS, guardrails.recovery_window_hours)?;
        guardrails.sla_buffer_threshold_hours =
            self.parsed_or(config_keys::SLA_BUFFER_THRESHOLD_HOURS, guardrails.sla_buffer_threshold_hours)?;
        guardrails.critical_path_delay_threshold_hours = self.parsed_or(
            config_keys::CRITICAL_PATH_DELAY_THRESHOLD_HOURS,
            guardrails.critical_path_delay_threshold_hours,
        )?;

        Ok(SchedulerConfig {
            prep_window_days: self.parsed_or(config_keys::PREP_WINDOW_DAYS, d.prep_window_days)?,
            switch_buffer_minutes: self.parsed_or(config_keys::SWITCH_BUFFER_MINUTES, d.switch_buffer_minutes)?,
            freeze_inprogress: self.parsed_or(config_keys::FREEZE_INPROGRESS, d.freeze_inprogress)?,
            sla_risk_threshold_hours: self.parsed_or(config_keys::SLA_RISK_THRESHOLD_HOURS, d.sla_risk_threshold_hours)?,
            busy_policy,
            budgets,
            guardrails,
        })
    }

    // ===== 目标策略 (版本化) =====

    /// 当前策略; 首次访问时写入 v1 (balanced)
    pub fn current_objective_policy(&self, at: DateTime<Utc>) -> RepositoryResult<ObjectivePolicy> {
        if let Some(version) = self.current_policy_version()? {
            return self.objective_policy(version)?.ok_or_else(|| RepositoryError::NotFound {
                entity: "objective_policy".to_string(),
                id: version.to_string(),
            });
        }
        let initial = ObjectivePolicy::initial(TemplateRef::new(PriorityTemplate::Balanced), at);
        self.store_objective_policy(&initial)?;
        Ok(initial)
    }

    /// 按版本读取策略
    pub fn objective_policy(&self, version: u32) -> RepositoryResult<Option<ObjectivePolicy>> {
        self.get_global_config_value(&policy_key(version))?
            .map(|raw| serde_json::from_str(&raw).map_err(RepositoryError::from))
            .transpose()
    }

    fn current_policy_version(&self) -> RepositoryResult<Option<u32>> {
        let Some(raw) = self.get_global_config_value(config_keys::OBJECTIVE_POLICY_CURRENT)? else {
            return Ok(None);
        };
        raw.trim().parse::<u32>().map(Some).map_err(|e| RepositoryError::FieldValueError {
            field: config_keys::OBJECTIVE_POLICY_CURRENT.to_string(),
            message: e.to_string(),
        })
    }

    /// 存储新策略版本
    ///
    /// 新版本号必须是当前版本 + 1 (首个版本为 1), 否则返回 VersionConflict
    pub fn store_objective_policy(&self, policy: &ObjectivePolicy) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let current: Option<u32> = tx
            .query_row(
                "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
                params![config_keys::OBJECTIVE_POLICY_CURRENT],
                |row| row.get::<_, String>(0),
            )
            .optional()?
            .and_then(|raw| raw.trim().parse().ok());
        let expected = current.unwrap_or(0);
        if policy.version != expected + 1 {
            return Err(RepositoryError::VersionConflict {
                plan_id: "objective_policy".to_string(),
                expected,
                actual: policy.version.saturating_sub(1),
            });
        }

        let upsert = "INSERT INTO config_kv (scope_id, key, value) VALUES ('global', ?1, ?2)
                      ON CONFLICT(scope_id, key) DO UPDATE SET value = ?2, updated_at = datetime('now')";
        tx.execute(upsert, params![policy_key(policy.version), serde_json::to_string(policy)?])?;
        tx.execute(
            upsert,
            params![config_keys::OBJECTIVE_POLICY_CURRENT, policy.version.to_string()],
        )?;
        tx.commit()?;
        tracing::info!(policy_version = policy.version, "目标策略版本已存储");
        Ok(())
    }
}

fn policy_key(version: u32) -> String {
    format!("{}{}", config_keys::OBJECTIVE_POLICY_PREFIX, version)
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    // 建模
    pub const PREP_WINDOW_DAYS: &str = "prep_window_days";
    pub const SWITCH_BUFFER_MINUTES: &str = "switch_buffer_minutes";
    pub const FREEZE_INPROGRESS: &str = "freeze_inprogress";
    pub const SLA_RISK_THRESHOLD_HOURS: &str = "sla_risk_threshold_hours";
    pub const BUSY_POLICY: &str = "busy_policy"; // JSON: {"mode":"wait","timeout_ms":500}

    // 求解预算
    pub const SMALL_TIER_SECS: &str = "solve.small_tier_secs";
    pub const MEDIUM_TIER_SECS: &str = "solve.medium_tier_secs";
    pub const LARGE_TIER_SECS: &str = "solve.large_tier_secs";
    pub const REPLAN_RATIO: &str = "solve.replan_ratio";
    pub const MAX_ITERATIONS: &str = "solve.max_iterations";
    pub const NUM_WORKERS: &str = "solve.num_workers";
    pub const RANDOM_SEED: &str = "solve.random_seed";

    // 抢占护栏
    pub const MAX_PREEMPTIONS_PER_DAY: &str = "guardrail.max_preemptions_per_day";
    pub const MAX_PREEMPTION_HOURS: &str = "guardrail.max_preemption_hours";
    pub const REQUIRE_APPROVAL: &str = "guardrail.require_approval";
    pub const RECOVERY_PRIORITY_BOOST: &str = "guardrail.recovery_priority_boost";
    pub const RECOVERY_WINDOW_HOURS: &str = "guardrail.recovery_window_hours";
    pub const SLA_BUFFER_THRESHOLD_HOURS: &str = "guardrail.sla_buffer_threshold_hours";
    pub const CRITICAL_PATH_DELAY_THRESHOLD_HOURS: &str = "guardrail.critical_path_delay_threshold_hours";

    // 目标策略
    pub const OBJECTIVE_POLICY_CURRENT: &str = "objective_policy/current";
    pub const OBJECTIVE_POLICY_PREFIX: &str = "objective_policy/v";
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn manager() -> ConfigManager {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        ConfigManager::from_connection(Arc::new(Mutex::new(conn))).unwrap()
    }

    #[test]
    fn test_defaults_without_overrides() {
        let config = manager().load_scheduler_config().unwrap();
        assert_eq!(config, SchedulerConfig::default());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let m = manager();
        m.set_global_config_value(config_keys::MAX_PREEMPTIONS_PER_DAY, "3").unwrap();
        m.set_global_config_value(config_keys::REQUIRE_APPROVAL, "true").unwrap();
        m.set_global_config_value(config_keys::PREP_WINDOW_DAYS, "abc").unwrap();
        m.set_global_config_value(config_keys::BUSY_POLICY, r#"{"mode":"wait","timeout_ms":250}"#).unwrap();

        let config = m.load_scheduler_config().unwrap();
        assert_eq!(config.guardrails.max_preemptions_per_day, 3);
        assert!(config.guardrails.require_approval);
        assert_eq!(config.prep_window_days, 2);
        assert_eq!(config.busy_policy, BusyPolicy::Wait { timeout_ms: 250 });
        assert!(m.get_config_snapshot().unwrap().contains("guardrail.require_approval"));
    }

    #[test]
    fn test_policy_versions() {
        let m = manager();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let v1 = m.current_objective_policy(t0).unwrap();
        assert_eq!(v1.version, 1);

        let v2 = v1
            .apply_template(TemplateRef::new(PriorityTemplate::CostMin), None, t0)
            .unwrap();
        m.store_objective_policy(&v2).unwrap();
        assert_eq!(m.current_objective_policy(t0).unwrap().global.template, PriorityTemplate::CostMin);
        assert_eq!(m.objective_policy(1).unwrap().unwrap().global.template, PriorityTemplate::Balanced);

        // 基于旧版本再次提交 → 冲突
        let stale = v1
            .apply_template(TemplateRef::new(PriorityTemplate::ProtectSla), None, t0)
            .unwrap();
        assert!(matches!(
            m.store_objective_policy(&stale),
            Err(RepositoryError::VersionConflict { .. })
        ));
    }
}
