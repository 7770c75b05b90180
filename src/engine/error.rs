// ==========================================
// 维修准备排产系统 - 引擎层错误类型
// ==========================================
// 职责: 建模错误 / 求解结果异常 / 重排失败 / 抢占护栏
// 红线: 不可行与超时是正常运行结果, 以结构化错误返回, 永不 panic
// ==========================================

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::types::ConstraintRef;
use crate::domain::{GateError, RelaxedConstraint};

/// 建模错误 (调用方数据问题, 不重试, 求解前立即返回)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("前置关系存在环: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("任务引用了不存在的资源: task_id={task_id}, resource_id={resource_id}")]
    UnknownResource { task_id: String, resource_id: String },

    #[error("引用不存在: {kind}={id} (来自 {referenced_by})")]
    UnknownReference {
        kind: String,
        id: String,
        referenced_by: String,
    },

    #[error("重复标识: {kind}={id}")]
    DuplicateId { kind: String, id: String },

    #[error("元数据无效: {entity}={id}, 原因={message}")]
    InvalidMetadata {
        entity: String,
        id: String,
        message: String,
    },

    #[error("无满足资质的人员: task_id={task_id}, 资质={qualifications:?}")]
    MissingQualification {
        task_id: String,
        qualifications: Vec<String>,
    },
}

/// 不可行解释
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfeasibilityReport {
    /// 冲突约束集合
    pub conflicting: Vec<ConstraintRef>,
    /// 冲突集合是否为最小冲突集
    pub minimal: bool,
    /// 已尝试的松弛
    pub relaxed_attempted: Vec<RelaxedConstraint>,
    pub message: String,
}

/// 抢占护栏类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardrailKind {
    MaxPreemptionsPerDay,
    MaxPreemptionHours,
}

/// 护栏违反说明
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailViolation {
    pub guardrail: GuardrailKind,
    pub work_package_id: String,
    pub limit: i64,
    pub observed: i64,
    pub explanation: String,
}

/// 引擎层错误
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("建模失败: {0}")]
    Model(#[from] ModelError),

    #[error("无可行解: {}", .0.message)]
    Infeasible(InfeasibilityReport),

    #[error("求解超时且无可行解: elapsed={elapsed_ms}ms")]
    TimedOut {
        elapsed_ms: u64,
        blocking: Vec<ConstraintRef>,
    },

    #[error("事件无效: event_id={event_id}, 原因={message}")]
    InvalidEvent { event_id: String, message: String },

    #[error("抢占护栏拦截: {}", .0.explanation)]
    GuardrailExceeded(GuardrailViolation),

    #[error("抢占需要审批人: work_package_id={work_package_id}")]
    ApprovalRequired { work_package_id: String },

    #[error("未满足抢占触发条件: work_package_id={work_package_id}, 原因={reason}")]
    NotTriggered {
        work_package_id: String,
        reason: String,
    },

    #[error("没有可抢占的任务: work_package_id={work_package_id}")]
    NoPreemptableTask { work_package_id: String },

    #[error("门禁迁移失败: {0}")]
    Gate(#[from] GateError),
}

impl EngineError {
    /// 阻断约束 (用于重排失败时告知调用方)
    pub fn blocking_constraints(&self) -> Vec<ConstraintRef> {
        match self {
            EngineError::Infeasible(report) => report.conflicting.clone(),
            EngineError::TimedOut { blocking, .. } => blocking.clone(),
            _ => Vec::new(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
