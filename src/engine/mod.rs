// ==========================================
// 维修准备排产系统 - 引擎层
// ==========================================
// 职责: 约束建模 / 求解 / 目标评估 / 事件重排 / 抢占 / 摘要
// 红线: Engine 不拼 SQL, 不做 I/O; 求解热路径内无阻塞调用
// ==========================================

pub mod diff;
pub mod error;
pub mod events;
pub mod model;
pub mod model_builder;
pub mod objective;
pub mod preemption;
pub mod replanner;
pub mod solver;
pub mod summary;

// 重导出核心引擎
pub use diff::PlanDiffEngine;
pub use error::{EngineError, EngineResult, GuardrailKind, GuardrailViolation, InfeasibilityReport, ModelError};
pub use events::{NoOpEventPublisher, OptionalEventPublisher, PlanEvent, PlanEventPublisher, PlanEventType};
pub use model::{FrozenInterval, ScheduleModel};
pub use model_builder::{BuildOptions, ConstraintModelBuilder, ModelSettings};
pub use objective::{ObjectiveEngine, ObjectiveEvaluator, ObjectiveScore, ResolvedObjective};
pub use preemption::{
    PreemptionCandidate, PreemptionInput, PreemptionManager, PreemptionOutcome, PreemptionRequest,
};
pub use replanner::{EventReplanner, ReplanFailure, ReplanOutcome, ReplanRequest, ReplanState};
pub use solver::{PlanContext, SolveOutcome, SolveResult, SolveStats, SolverAdapter};
pub use summary::{PlanSummary, PlanSummaryEngine, SlaRisk};
