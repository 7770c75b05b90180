// ==========================================
// 维修准备排产系统 - 资源
// ==========================================
// 职责: 人员/航材/设备/工装/工位 的统一资源模型
// 红线: 任一时刻累积占用 <= 可用数量; 独占资源(组)同一时刻至多一个持有者
// ==========================================
// 建模: 公共字段提升到 Resource, 变体字段放在 ResourceKind 标签载荷中
// ==========================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::ResourceCategory;

/// 不可用时段 (日历屏蔽)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnavailableWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// 资源变体
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "snake_case")]
pub enum ResourceKind {
    Human {
        #[serde(default)]
        qualifications: Vec<String>,
        /// 按作业类型的绩效系数 (>1 表示更快)
        #[serde(default)]
        performance_factors: BTreeMap<String, f64>,
    },
    Material {
        #[serde(default)]
        must_kit: bool,
        #[serde(default)]
        allow_partial: bool,
        available_quantity: u32,
        #[serde(default)]
        eta: Option<DateTime<Utc>>,
    },
    Equipment {
        #[serde(default)]
        is_exclusive: bool,
        #[serde(default)]
        exclusive_group: Option<String>,
    },
    Tool {
        #[serde(default)]
        is_exclusive: bool,
        #[serde(default)]
        exclusive_group: Option<String>,
    },
    Workspace {
        #[serde(default)]
        is_exclusive: bool,
    },
}

/// 资源
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub resource_id: String,
    #[serde(default)]
    pub name: String,
    /// 可互换单元数 (技能组人数/工位数)
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub calendar: Vec<UnavailableWindow>,
    pub kind: ResourceKind,
}

fn default_capacity() -> u32 {
    1
}

impl Resource {
    pub fn human(resource_id: &str, capacity: u32, qualifications: &[&str]) -> Self {
        Self::with_kind(
            resource_id,
            capacity,
            ResourceKind::Human {
                qualifications: qualifications.iter().map(|q| q.to_string()).collect(),
                performance_factors: BTreeMap::new(),
            },
        )
    }

    pub fn material(resource_id: &str, available_quantity: u32, must_kit: bool) -> Self {
        Self::with_kind(
            resource_id,
            available_quantity.max(1),
            ResourceKind::Material {
                must_kit,
                allow_partial: false,
                available_quantity,
                eta: None,
            },
        )
    }

    pub fn equipment(resource_id: &str, is_exclusive: bool, exclusive_group: Option<&str>) -> Self {
        Self::with_kind(
            resource_id,
            1,
            ResourceKind::Equipment {
                is_exclusive,
                exclusive_group: exclusive_group.map(|g| g.to_string()),
            },
        )
    }

    pub fn workspace(resource_id: &str, capacity: u32) -> Self {
        Self::with_kind(resource_id, capacity, ResourceKind::Workspace { is_exclusive: capacity == 1 })
    }

    pub fn with_kind(resource_id: &str, capacity: u32, kind: ResourceKind) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            name: resource_id.to_string(),
            capacity,
            location: None,
            calendar: Vec::new(),
            kind,
        }
    }

    pub fn category(&self) -> ResourceCategory {
        match self.kind {
            ResourceKind::Human { .. } => ResourceCategory::Human,
            ResourceKind::Material { .. } => ResourceCategory::Material,
            ResourceKind::Equipment { .. } => ResourceCategory::Equipment,
            ResourceKind::Tool { .. } => ResourceCategory::Tool,
            ResourceKind::Workspace { .. } => ResourceCategory::Workspace,
        }
    }

    /// 是否按单一并发槽位建模
    ///
    /// 航材不占用时间槽位 (仅约束开工时间), 始终返回 false
    pub fn is_exclusive(&self) -> bool {
        match &self.kind {
            ResourceKind::Human { .. } => self.capacity <= 1,
            ResourceKind::Material { .. } => false,
            ResourceKind::Equipment { is_exclusive, exclusive_group }
            | ResourceKind::Tool { is_exclusive, exclusive_group } => {
                *is_exclusive || exclusive_group.is_some() || self.capacity <= 1
            }
            ResourceKind::Workspace { is_exclusive } => *is_exclusive || self.capacity <= 1,
        }
    }

    pub fn exclusive_group(&self) -> Option<&str> {
        match &self.kind {
            ResourceKind::Equipment { exclusive_group, .. } | ResourceKind::Tool { exclusive_group, .. } => {
                exclusive_group.as_deref()
            }
            _ => None,
        }
    }

    pub fn is_material(&self) -> bool {
        matches!(self.kind, ResourceKind::Material { .. })
    }

    pub fn has_qualifications(&self, required: &[String]) -> bool {
        match &self.kind {
            ResourceKind::Human { qualifications, .. } => {
                required.iter().all(|q| qualifications.contains(q))
            }
            _ => false,
        }
    }

    /// 作业类型对应的绩效系数, 未配置时为 1.0
    pub fn performance_factor(&self, job_type: Option<&str>) -> f64 {
        match (&self.kind, job_type) {
            (ResourceKind::Human { performance_factors, .. }, Some(job)) => {
                performance_factors.get(job).copied().unwrap_or(1.0)
            }
            _ => 1.0,
        }
    }
}
