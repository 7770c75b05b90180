// ==========================================
// 维修准备排产系统 - 准备任务
// ==========================================
// 职责: 可排产的最小准备作业单元
// 红线: 前置图必须无环; 开工时间 >= 所有前置完工 且 >= max(最早开工, 人工ETA)
// ==========================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{Criticality, DeadlineKind, TaskStatus};

/// 资源需求
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub resource_id: String,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    /// 独占使用 (需求量等于资源全部容量)
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub criticality: Criticality,
}

fn default_quantity() -> u32 {
    1
}

impl ResourceRequirement {
    pub fn new(resource_id: &str, quantity: u32) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            quantity,
            exclusive: false,
            criticality: Criticality::Medium,
        }
    }
}

/// 准备任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparationTask {
    pub task_id: String,
    pub work_package_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub job_type: Option<String>,

    /// 基准工期 (分钟, 人员绩效调整前)
    pub base_duration_minutes: i64,

    #[serde(default)]
    pub required_resources: Vec<ResourceRequirement>,
    #[serde(default)]
    pub required_qualifications: Vec<String>,
    #[serde(default)]
    pub predecessors: Vec<String>,

    /// 门禁任务: 未通过前阻断后续任务
    #[serde(default)]
    pub is_gate: bool,

    // ===== 时间窗 =====
    #[serde(default)]
    pub earliest_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub latest_finish: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deadline_kind: DeadlineKind,
    /// 硬截止是否允许在不可行时自动放宽
    #[serde(default)]
    pub relaxable: bool,
    #[serde(default)]
    pub manual_eta: Option<DateTime<Utc>>,

    #[serde(default)]
    pub criticality: Criticality,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub preferred_resources: Vec<String>,

    // ===== 执行状态 =====
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub actual_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actual_end: Option<DateTime<Utc>>,
    /// 开工时实际占用的资源 (含按资质选定的人员)
    #[serde(default)]
    pub assigned_resources: Vec<String>,
}

impl PreparationTask {
    pub fn new(task_id: &str, work_package_id: &str, base_duration_minutes: i64) -> Self {
        Self {
            task_id: task_id.to_string(),
            work_package_id: work_package_id.to_string(),
            name: task_id.to_string(),
            job_type: None,
            base_duration_minutes,
            required_resources: Vec::new(),
            required_qualifications: Vec::new(),
            predecessors: Vec::new(),
            is_gate: false,
            earliest_start: None,
            latest_finish: None,
            deadline_kind: DeadlineKind::Soft,
            relaxable: false,
            manual_eta: None,
            criticality: Criticality::Medium,
            location: None,
            preferred_resources: Vec::new(),
            status: TaskStatus::NotStarted,
            actual_start: None,
            actual_end: None,
            assigned_resources: Vec::new(),
        }
    }

    /// 最早可开工时间: max(earliest_start, manual_eta)
    pub fn release_time(&self) -> Option<DateTime<Utc>> {
        match (self.earliest_start, self.manual_eta) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn has_hard_deadline(&self) -> bool {
        self.latest_finish.is_some() && self.deadline_kind == DeadlineKind::Hard
    }
}
