// ==========================================
// 维修准备排产系统 - 配置管理 API
// ==========================================
// 职责: 配置查询与更新, 目标策略模板应用与灰度发布
// 红线: 策略每次变更都生成新版本, 已生成计划固定引用生成时的版本
// ==========================================

use std::sync::{Arc, Mutex};

use chrono::Duration;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::api::clock::{Clock, SystemClock};
use crate::api::error::{ApiError, ApiResult};
use crate::config::config_manager::ConfigManager;
use crate::config::objective_policy::{GrayscaleRollout, ObjectivePolicy, RolloutState, TemplateRef};

/// 配置项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigItem {
    pub scope_id: String,
    pub key: String,
    pub value: String,
}

/// 灰度发布请求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutRequest {
    pub candidate: TemplateRef,
    pub fraction: f64,
    #[serde(default)]
    pub scope: Option<Vec<String>>,
    pub duration_hours: i64,
}

// ==========================================
// ConfigApi - 配置管理 API
// ==========================================
pub struct ConfigApi {
    conn: Arc<Mutex<Connection>>,
    config_manager: Arc<ConfigManager>,
    clock: Arc<dyn Clock>,
}

impl ConfigApi {
    pub fn new(conn: Arc<Mutex<Connection>>, config_manager: Arc<ConfigManager>) -> Self {
        Self {
            conn,
            config_manager,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    // ==========================================
    // 配置项
    // ==========================================

    /// 查询所有配置 (不含策略版本内容)
    pub fn list_configs(&self) -> ApiResult<Vec<ConfigItem>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ApiError::DatabaseError(format!("数据库锁获取失败: {}", e)))?;
        let mut stmt = conn
            .prepare(
                "SELECT scope_id, key, value FROM config_kv
                 WHERE key NOT LIKE 'objective_policy/%'
                 ORDER BY scope_id, key",
            )
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        let configs = stmt
            .query_map([], |row| {
                Ok(ConfigItem {
                    scope_id: row.get(0)?,
                    key: row.get(1)?,
                    value: row.get(2)?,
                })
            })
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ApiError::DatabaseError(e.to_string()))?;
        Ok(configs)
    }

    pub fn get_config(&self, key: &str) -> ApiResult<Option<String>> {
        Ok(self.config_manager.get_global_config_value(key)?)
    }

    /// 更新单个配置; 策略键只能通过策略接口变更
    pub fn update_config(&self, key: &str, value: &str) -> ApiResult<()> {
        if key.trim().is_empty() {
            return Err(ApiError::InvalidInput("配置键不能为空".to_string()));
        }
        if key.starts_with("objective_policy/") {
            return Err(ApiError::InvalidInput(format!("{} 只能通过策略接口变更", key)));
        }
        self.config_manager.set_global_config_value(key, value)?;
        info!(key, value, "配置已更新");
        Ok(())
    }

    // ==========================================
    // 目标策略
    // ==========================================

    pub fn current_policy(&self) -> ApiResult<ObjectivePolicy> {
        Ok(self.config_manager.current_objective_policy(self.clock.now())?)
    }

    pub fn get_policy(&self, version: u32) -> ApiResult<ObjectivePolicy> {
        self.config_manager
            .objective_policy(version)?
            .ok_or_else(|| ApiError::NotFound(format!("目标策略版本 {} 不存在", version)))
    }

    /// 应用模板 (全局或按工作包作用域)
    pub fn apply_template(&self, template: TemplateRef, scope: Option<Vec<String>>) -> ApiResult<ObjectivePolicy> {
        let now = self.clock.now();
        let current = self.config_manager.current_objective_policy(now)?;
        let next = current
            .apply_template(template, scope.as_deref(), now)
            .map_err(ApiError::InvalidInput)?;
        self.store(next)
    }

    /// 启动灰度: 候选模板对 fraction 比例的工作包生效, duration_hours 后自动失效
    pub fn start_rollout(&self, request: RolloutRequest) -> ApiResult<ObjectivePolicy> {
        if request.duration_hours <= 0 {
            return Err(ApiError::InvalidInput(format!(
                "灰度时长必须为正: {}",
                request.duration_hours
            )));
        }
        let now = self.clock.now();
        let current = self.config_manager.current_objective_policy(now)?;
        let rollout = GrayscaleRollout {
            rollout_id: Uuid::new_v4().to_string(),
            candidate: request.candidate,
            fraction: request.fraction,
            scope: request.scope,
            starts_at: now,
            expires_at: now + Duration::hours(request.duration_hours),
            state: RolloutState::Running,
        };
        let next = current.start_rollout(rollout, now).map_err(ApiError::InvalidInput)?;
        self.store(next)
    }

    pub fn promote_rollout(&self) -> ApiResult<ObjectivePolicy> {
        let now = self.clock.now();
        let next = self
            .config_manager
            .current_objective_policy(now)?
            .promote_rollout(now)
            .map_err(ApiError::InvalidInput)?;
        self.store(next)
    }

    pub fn rollback_rollout(&self) -> ApiResult<ObjectivePolicy> {
        let now = self.clock.now();
        let next = self
            .config_manager
            .current_objective_policy(now)?
            .rollback_rollout(now)
            .map_err(ApiError::InvalidInput)?;
        self.store(next)
    }

    fn store(&self, policy: ObjectivePolicy) -> ApiResult<ObjectivePolicy> {
        self.config_manager.store_objective_policy(&policy)?;
        info!(
            policy_version = policy.version,
            template = %policy.global.label(),
            scoped = policy.scoped.len(),
            "目标策略已变更"
        );
        Ok(policy)
    }
}
