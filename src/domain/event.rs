// ==========================================
// 维修准备排产系统 - 领域事件
// ==========================================
// 职责: 外部状态变化的不可变记录
// 红线: 事件只追加, 每个 event_id 只被重排器消费一次, 消费后不再修改
// ==========================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::TaskStatus;

/// 重排策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ReplanPolicy {
    /// 对全部未开工任务重排
    ReplanUnstarted,
    /// 仅在有界的未来窗口内重排, 窗口外任务不早于原计划
    RollingWindow { window_hours: i64 },
}

impl Default for ReplanPolicy {
    fn default() -> Self {
        ReplanPolicy::ReplanUnstarted
    }
}

impl ReplanPolicy {
    /// 合并同批事件的策略: 最严格者优先
    ///
    /// 任一事件为滚动窗口 → 整批按滚动窗口处理, 窗口取最小值
    pub fn most_restrictive(policies: impl IntoIterator<Item = ReplanPolicy>) -> ReplanPolicy {
        policies.into_iter().fold(ReplanPolicy::ReplanUnstarted, |acc, p| match (acc, p) {
            (ReplanPolicy::RollingWindow { window_hours: a }, ReplanPolicy::RollingWindow { window_hours: b }) => {
                ReplanPolicy::RollingWindow { window_hours: a.min(b) }
            }
            (ReplanPolicy::RollingWindow { .. }, ReplanPolicy::ReplanUnstarted) => acc,
            (ReplanPolicy::ReplanUnstarted, other) => other,
        })
    }
}

/// 事件作用域
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EventScope {
    #[serde(default)]
    pub work_packages: Vec<String>,
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default)]
    pub resource_ids: Vec<String>,
    #[serde(default)]
    pub gate_ids: Vec<String>,
}

impl EventScope {
    pub fn is_empty(&self) -> bool {
        self.work_packages.is_empty()
            && self.task_ids.is_empty()
            && self.resource_ids.is_empty()
            && self.gate_ids.is_empty()
    }
}

/// 事件载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// 航材ETA变更
    EtaChange {
        resource_id: String,
        #[serde(default)]
        old_eta: Option<DateTime<Utc>>,
        new_eta: DateTime<Utc>,
    },
    /// 航材到货 (更新可用数量)
    MaterialReceipt {
        resource_id: String,
        available_quantity: u32,
    },
    /// SAP 指令状态更新, 下达后满足对应门禁条件
    SapUpdate {
        instruction_id: String,
        #[serde(default)]
        old_status: Option<String>,
        new_status: String,
    },
    /// 天气影响, 作用于作用域内资源
    Weather {
        weather_type: String,
        #[serde(default)]
        severity: Option<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    /// 第三方确认, 给出门禁预计解除时间
    ThirdPartyAck {
        gate_id: String,
        party: String,
        confirmed: bool,
        #[serde(default)]
        expected_resolution: Option<DateTime<Utc>>,
    },
    /// 资源不可用
    ResourceStatus {
        resource_id: String,
        unavailable_from: DateTime<Utc>,
        unavailable_until: DateTime<Utc>,
        #[serde(default)]
        reason: Option<String>,
    },
    /// 任务执行进度
    TaskProgress {
        task_id: String,
        status: TaskStatus,
        at: DateTime<Utc>,
    },
}

impl EventPayload {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::EtaChange { .. } => "eta_change",
            EventPayload::MaterialReceipt { .. } => "material_receipt",
            EventPayload::SapUpdate { .. } => "sap_update",
            EventPayload::Weather { .. } => "weather",
            EventPayload::ThirdPartyAck { .. } => "third_party_ack",
            EventPayload::ResourceStatus { .. } => "resource_status",
            EventPayload::TaskProgress { .. } => "task_progress",
        }
    }
}

/// 领域事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: String,
    pub effective_time: DateTime<Utc>,
    pub payload: EventPayload,
    #[serde(default)]
    pub scope: EventScope,
    #[serde(default)]
    pub policy: ReplanPolicy,
    #[serde(default)]
    pub source: Option<String>,
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        self.payload.type_name()
    }
}
