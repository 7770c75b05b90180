// ==========================================
// 维修准备排产系统 - 工作包
// ==========================================
// 职责: 维修项目实例 (发动机/飞机) 的优先级与 SLA
// 红线: 仅由计划生成/重排/抢占产生新快照, 不原地修改已提交计划
// ==========================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 恢复优先级提升
///
/// 被抢占的工作包在恢复窗口内获得的临时优先级加成, 防止饿死
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryBoost {
    pub priority_boost: u32,
    pub until: DateTime<Utc>,
    pub source_record_id: String,
}

/// 工作包
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkPackage {
    pub work_package_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub engine_id: Option<String>,
    #[serde(default)]
    pub aircraft_id: Option<String>,

    /// 优先级 (数值越大越紧急)
    #[serde(default)]
    pub priority: u32,

    /// SLA 截止时间 (软约束, 超期进入目标惩罚项)
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,

    /// 显式加急标志 (抢占触发条件之一)
    #[serde(default)]
    pub urgent: bool,

    #[serde(default)]
    pub recovery_boost: Option<RecoveryBoost>,
}

impl WorkPackage {
    pub fn new(work_package_id: &str, priority: u32) -> Self {
        Self {
            work_package_id: work_package_id.to_string(),
            name: work_package_id.to_string(),
            engine_id: None,
            aircraft_id: None,
            priority,
            deadline: None,
            urgent: false,
            recovery_boost: None,
        }
    }

    /// 计算有效优先级 (含未过期的恢复加成)
    pub fn effective_priority(&self, at: DateTime<Utc>) -> u32 {
        match &self.recovery_boost {
            Some(boost) if at < boost.until => self.priority.saturating_add(boost.priority_boost),
            _ => self.priority,
        }
    }
}
