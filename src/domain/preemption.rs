// ==========================================
// 维修准备排产系统 - 抢占审计记录
// ==========================================
// 职责: 抢占原因/受影响任务/引入延误/恢复计划 的审计实体
// 红线: 只追加, 永不删除
// ==========================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 抢占触发原因
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum PreemptionTrigger {
    /// SLA 缓冲低于阈值
    SlaBuffer { buffer_minutes: i64, threshold_minutes: i64 },
    /// 显式加急
    UrgentFlag,
    /// 关键路径延误超过阈值
    CriticalPathDelay { delay_minutes: i64, threshold_minutes: i64 },
}

/// 被抢占工作包的恢复提升
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub work_package_id: String,
    pub priority_boost: u32,
    pub boost_until: DateTime<Utc>,
    /// 重排后该工作包的预计完工时间
    pub expected_completion: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub actions: Vec<RecoveryAction>,
    pub expected_recovery_time: DateTime<Utc>,
    pub notes: Vec<String>,
}

/// 抢占预留: 抢占方任务排在被抢占任务之前, 到期前每次重排都生效
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreemptionReservation {
    pub preemption_id: String,
    pub preempting_task: String,
    pub preempted_task: String,
    pub expires_at: DateTime<Utc>,
}

/// 抢占记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreemptionRecord {
    pub record_id: String,
    pub plan_id: String,
    pub from_version: u32,
    pub to_version: u32,
    pub preempting_work_package_id: String,
    pub preempted_work_package_ids: Vec<String>,
    pub resource_ids: Vec<String>,
    pub triggers: Vec<PreemptionTrigger>,
    pub reason: String,
    pub impacted_tasks: Vec<String>,
    pub delay_minutes: i64,
    pub recovery_plan: RecoveryPlan,
    pub approver: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PreemptionRecord {
    /// 工作包是否以任一角色参与了本次抢占
    pub fn involves(&self, work_package_id: &str) -> bool {
        self.preempting_work_package_id == work_package_id
            || self.preempted_work_package_ids.iter().any(|w| w == work_package_id)
    }
}
