// ==========================================
// 维修准备排产系统 - 核心库
// ==========================================
// 技术栈: Rust + SQLite
// 系统定位: 准备任务排产核心 (门禁/资源/事件重排/抢占)
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 引擎层 - 建模/求解/重排/抢占
pub mod engine;

// 配置层 - 系统配置
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一/表结构）
pub mod db;

// 日志系统
pub mod logging;

// API 层 - 业务接口
pub mod api;

// 应用层 - 装配
pub mod app;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{
    ConstraintRef, Criticality, DeadlineKind, EvidenceType, GateType, ResourceCategory, RiskLevel, SolveQuality,
    TaskStatus,
};

// 领域实体
pub use domain::{
    DomainEvent, EventPayload, Evidence, Gate, Plan, PlanDiff, PlanningSnapshot, PreemptionRecord, PreparationTask,
    Resource, WorkPackage,
};

// 引擎
pub use engine::{
    ConstraintModelBuilder, EventReplanner, ObjectiveEngine, PlanSummaryEngine, PreemptionManager, SolverAdapter,
};

// API
pub use api::{ApiError, ApiResult, ConfigApi, PlanApi};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "维修准备排产系统";
