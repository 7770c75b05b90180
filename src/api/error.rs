// ==========================================
// 维修准备排产系统 - API层错误类型
// ==========================================
// 职责: 定义API层错误类型, 转换引擎/仓储错误为调用方可处理的结构化错误
// 红线: 每个错误都带实体 ID 或约束名, 调用方据此决定重试/放宽/审批
// ==========================================

use thiserror::Error;

use crate::domain::types::ConstraintRef;
use crate::domain::GateError;
use crate::engine::error::{EngineError, GuardrailKind, GuardrailViolation, InfeasibilityReport, ModelError};
use crate::repository::error::RepositoryError;

/// API层错误类型
#[derive(Error, Debug)]
pub enum ApiError {
    // ==========================================
    // 调用方数据错误 (不重试)
    // ==========================================
    #[error("无效输入: {0}")]
    InvalidInput(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("建模失败: {0}")]
    Model(ModelError),

    #[error("事件无效: event_id={event_id}, 原因={message}")]
    InvalidEvent { event_id: String, message: String },

    #[error("门禁迁移失败: {0}")]
    Gate(GateError),

    // ==========================================
    // 求解结果 (正常运行结果)
    // ==========================================
    #[error("无可行解: {}", .0.message)]
    Infeasible(InfeasibilityReport),

    #[error("求解超时且无可行解: elapsed={elapsed_ms}ms")]
    TimedOut {
        elapsed_ms: u64,
        blocking: Vec<ConstraintRef>,
    },

    // ==========================================
    // 抢占
    // ==========================================
    #[error("抢占护栏拦截: {}", .0.explanation)]
    GuardrailExceeded(GuardrailViolation),

    #[error("抢占需要审批人: work_package_id={work_package_id}")]
    ApprovalRequired { work_package_id: String },

    #[error("未满足抢占触发条件: work_package_id={work_package_id}, 原因={reason}")]
    PreemptionNotTriggered { work_package_id: String, reason: String },

    #[error("没有可抢占的任务: work_package_id={work_package_id}")]
    NoPreemptableTask { work_package_id: String },

    // ==========================================
    // 并发控制错误 (可重试)
    // ==========================================
    #[error("计划正在变更中: plan_id={plan_id}")]
    PlanBusy { plan_id: String },

    #[error("版本冲突: plan_id={plan_id}, 基线版本={expected}, 当前版本={actual}")]
    VersionConflict { plan_id: String, expected: u32, actual: u32 },

    #[error("幂等键冲突: key={key} 已用于不同的输入")]
    IdempotencyConflict { key: String },

    // ==========================================
    // 数据访问错误
    // ==========================================
    #[error("数据库错误: {0}")]
    DatabaseError(String),

    #[error("内部错误: {0}")]
    InternalError(String),
}

impl ApiError {
    /// 阻断约束 (不可行/超时)
    pub fn blocking_constraints(&self) -> Vec<ConstraintRef> {
        match self {
            ApiError::Infeasible(report) => report.conflicting.clone(),
            ApiError::TimedOut { blocking, .. } => blocking.clone(),
            _ => Vec::new(),
        }
    }

    /// 调用方可基于最新版本重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::PlanBusy { .. } | ApiError::VersionConflict { .. })
    }
}

// ==========================================
// 从 EngineError 转换
// ==========================================
impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Model(e) => ApiError::Model(e),
            EngineError::Infeasible(report) => ApiError::Infeasible(report),
            EngineError::TimedOut { elapsed_ms, blocking } => ApiError::TimedOut { elapsed_ms, blocking },
            EngineError::InvalidEvent { event_id, message } => ApiError::InvalidEvent { event_id, message },
            EngineError::GuardrailExceeded(v) => ApiError::GuardrailExceeded(v),
            EngineError::ApprovalRequired { work_package_id } => ApiError::ApprovalRequired { work_package_id },
            EngineError::NotTriggered { work_package_id, reason } => {
                ApiError::PreemptionNotTriggered { work_package_id, reason }
            }
            EngineError::NoPreemptableTask { work_package_id } => ApiError::NoPreemptableTask { work_package_id },
            EngineError::Gate(e) => ApiError::Gate(e),
        }
    }
}

impl From<ModelError> for ApiError {
    fn from(err: ModelError) -> Self {
        ApiError::Model(err)
    }
}

impl From<GateError> for ApiError {
    fn from(err: GateError) -> Self {
        ApiError::Gate(err)
    }
}

// ==========================================
// 从 RepositoryError 转换
// ==========================================
impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::VersionConflict { plan_id, expected, actual } => {
                ApiError::VersionConflict { plan_id, expected, actual }
            }
            RepositoryError::IdempotencyConflict { key } => ApiError::IdempotencyConflict { key },
            RepositoryError::PreemptionLimitExceeded { work_package_id, limit, observed } => {
                ApiError::GuardrailExceeded(GuardrailViolation {
                    guardrail: GuardrailKind::MaxPreemptionsPerDay,
                    explanation: format!(
                        "工作包 {} 滚动24h内已参与 {} 次抢占, 上限 {}",
                        work_package_id,
                        observed - 1,
                        limit
                    ),
                    work_package_id,
                    limit,
                    observed,
                })
            }
            RepositoryError::NotFound { entity, id } => ApiError::NotFound(format!("{}(id={})不存在", entity, id)),
            RepositoryError::FieldValueError { field, message } => {
                ApiError::InvalidInput(format!("字段{}错误: {}", field, message))
            }
            RepositoryError::LockError(msg) => ApiError::DatabaseError(format!("数据库锁获取失败: {}", msg)),
            RepositoryError::DatabaseQueryError(msg)
            | RepositoryError::UniqueConstraintViolation(msg)
            | RepositoryError::ForeignKeyViolation(msg)
            | RepositoryError::AppendOnlyViolation(msg) => ApiError::DatabaseError(msg),
            RepositoryError::Serialization(msg) => ApiError::InternalError(msg),
        }
    }
}

/// Result 类型别名
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_mapping_keeps_blocking() {
        let err: ApiError = EngineError::TimedOut {
            elapsed_ms: 2000,
            blocking: vec![ConstraintRef::Gate {
                gate_id: "G1".into(),
                task_id: "T1".into(),
            }],
        }
        .into();
        assert_eq!(err.blocking_constraints().len(), 1);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_repository_conflict_is_retryable() {
        let err: ApiError = RepositoryError::VersionConflict {
            plan_id: "P1".into(),
            expected: 1,
            actual: 2,
        }
        .into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("P1"));
    }
}
