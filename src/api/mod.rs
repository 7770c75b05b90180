// ==========================================
// 维修准备排产系统 - API 层
// ==========================================
// 职责: 提供业务 API 接口, 供命令行与宿主进程调用
// ==========================================

pub mod clock;
pub mod config_api;
pub mod error;
pub mod plan_api;
pub mod plan_guard;

// 重导出核心类型
pub use clock::{Clock, ManualClock, SystemClock};
pub use config_api::{ConfigApi, ConfigItem, RolloutRequest};
pub use error::{ApiError, ApiResult};
pub use plan_api::{
    ApplyEventsResponse, ConfirmHandoverResponse, GenerateConfig, GeneratePlanRequest, GeneratePlanResponse,
    PlanApi, PreemptResponse,
};
pub use plan_guard::{PlanGuard, PlanLease};
