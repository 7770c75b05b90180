// ==========================================
// 维修准备排产系统 - 配置层
// ==========================================
// 职责: 排产参数、版本化目标策略、config_kv 覆写
// 存储: config_kv 表
// ==========================================

pub mod config_manager;
pub mod objective_policy;
pub mod scheduler_config;

// 重导出核心配置
pub use config_manager::{config_keys, ConfigManager};
pub use objective_policy::{
    GrayscaleRollout, ObjectivePolicy, ObjectiveWeights, PriorityTemplate, RolloutState, ScopedTemplate,
    SelectionSource, TemplateRef, WeightOverrides,
};
pub use scheduler_config::{BusyPolicy, GuardrailConfig, SchedulerConfig, SolveBudgetConfig};
