// ==========================================
// 维修准备排产系统 - 领域模型层
// ==========================================
// 职责: 定义工作包/任务/资源/门禁/事件/计划/抢占记录
// 红线: 不含数据访问逻辑, 不含引擎逻辑
// ==========================================

pub mod event;
pub mod gate;
pub mod plan;
pub mod preemption;
pub mod resource;
pub mod task;
pub mod types;
pub mod work_package;

// 重导出核心类型
pub use event::{DomainEvent, EventPayload, EventScope, ReplanPolicy};
pub use gate::{Evidence, Gate, GateError, GateTarget, GateTransition};
pub use plan::{
    AssignmentSegment, GateSummaryEntry, Plan, PlanDiff, PlanningSnapshot, RelaxedConstraint,
    ResourceReallocation, TaskAssignment, TaskDelay, TemplateSelection,
};
pub use preemption::{
    PreemptionRecord, PreemptionReservation, PreemptionTrigger, RecoveryAction, RecoveryPlan,
};
pub use resource::{Resource, ResourceKind, UnavailableWindow};
pub use task::{PreparationTask, ResourceRequirement};
pub use types::{
    ConstraintRef, Criticality, DeadlineKind, EvidenceType, GateType, ResourceCategory, RiskLevel,
    SolveQuality, TaskStatus,
};
pub use work_package::{RecoveryBoost, WorkPackage};
