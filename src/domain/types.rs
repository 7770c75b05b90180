// ==========================================
// 维修准备排产系统 - 领域类型定义
// ==========================================
// 职责: 跨实体共享的枚举与值对象
// 红线: 纯数据,不含引擎逻辑
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// 任务状态 (Task Status)
// ==========================================
// 已开工/已完工的任务在重排时冻结
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    NotStarted, // 未开工
    InProgress, // 进行中
    Completed,  // 已完工
    Cancelled,  // 已取消(不参与排产)
}

impl TaskStatus {
    /// 是否已开工(进行中或已完工)
    pub fn is_started(&self) -> bool {
        matches!(self, TaskStatus::InProgress | TaskStatus::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::NotStarted => write!(f, "NOT_STARTED"),
            TaskStatus::InProgress => write!(f, "IN_PROGRESS"),
            TaskStatus::Completed => write!(f, "COMPLETED"),
            TaskStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

// ==========================================
// 关键度 (Criticality)
// ==========================================
// 松弛顺序: Low 最先被放宽, High 从不自动放宽物料齐套
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Criticality {
    Low,
    #[default]
    Medium,
    High,
}

impl fmt::Display for Criticality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Criticality::Low => write!(f, "LOW"),
            Criticality::Medium => write!(f, "MEDIUM"),
            Criticality::High => write!(f, "HIGH"),
        }
    }
}

// ==========================================
// 资源类别 (Resource Category)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceCategory {
    Human,     // 人员/技能组
    Material,  // 航材
    Equipment, // 设备
    Tool,      // 工装
    Workspace, // 工位/场地
}

impl fmt::Display for ResourceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceCategory::Human => write!(f, "HUMAN"),
            ResourceCategory::Material => write!(f, "MATERIAL"),
            ResourceCategory::Equipment => write!(f, "EQUIPMENT"),
            ResourceCategory::Tool => write!(f, "TOOL"),
            ResourceCategory::Workspace => write!(f, "WORKSPACE"),
        }
    }
}

// ==========================================
// 门禁类型 (Gate Type)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateType {
    CriticalToolsReady, // 关键工装就绪
    MaterialsReady,     // 航材齐套
    DocReady,           // 技术文件就绪
    AssessmentComplete, // 评估完成
    QecShelfHandover,   // QEC货架交接
    InventoryCheck,     // 库存核对
    SapInstruction,     // SAP指令下达
}

impl fmt::Display for GateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateType::CriticalToolsReady => write!(f, "CRITICAL_TOOLS_READY"),
            GateType::MaterialsReady => write!(f, "MATERIALS_READY"),
            GateType::DocReady => write!(f, "DOC_READY"),
            GateType::AssessmentComplete => write!(f, "ASSESSMENT_COMPLETE"),
            GateType::QecShelfHandover => write!(f, "QEC_SHELF_HANDOVER"),
            GateType::InventoryCheck => write!(f, "INVENTORY_CHECK"),
            GateType::SapInstruction => write!(f, "SAP_INSTRUCTION"),
        }
    }
}

// ==========================================
// 证据类型 (Evidence Type)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvidenceType {
    HandoverForm, // 交接单
    Photo,        // 照片
    Signature,    // 签字
    Document,     // 文件
    Checklist,    // 检查单
}

impl fmt::Display for EvidenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvidenceType::HandoverForm => write!(f, "HANDOVER_FORM"),
            EvidenceType::Photo => write!(f, "PHOTO"),
            EvidenceType::Signature => write!(f, "SIGNATURE"),
            EvidenceType::Document => write!(f, "DOCUMENT"),
            EvidenceType::Checklist => write!(f, "CHECKLIST"),
        }
    }
}

// ==========================================
// 风险等级 (Risk Level)
// ==========================================
// 用于 SLA 风险摘要, 按缓冲时长分级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Green,  // 正常
    Yellow, // 关注
    Orange, // 预警
    Red,    // 违约/阻断
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Green => write!(f, "GREEN"),
            RiskLevel::Yellow => write!(f, "YELLOW"),
            RiskLevel::Orange => write!(f, "ORANGE"),
            RiskLevel::Red => write!(f, "RED"),
        }
    }
}

// ==========================================
// 截止类型 (Deadline Kind)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadlineKind {
    Hard,
    #[default]
    Soft,
}

// ==========================================
// 求解质量 (Solve Quality)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SolveQuality {
    Optimal,  // 已证明最优
    Feasible, // 可行但未证明最优
}

impl fmt::Display for SolveQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SolveQuality::Optimal => write!(f, "OPTIMAL"),
            SolveQuality::Feasible => write!(f, "FEASIBLE"),
        }
    }
}

// ==========================================
// 约束引用 (Constraint Reference)
// ==========================================
// 用于松弛报告与不可行解释, 指明具体约束及其涉及的实体
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConstraintRef {
    Precedence { predecessor: String, successor: String },
    EarliestStart { task_id: String },
    ManualEta { task_id: String },
    HardDeadline { task_id: String },
    MaterialKit { task_id: String, resource_id: String },
    Gate { gate_id: String, task_id: String },
    Capacity { resource_id: String, task_id: String },
    Exclusive { resource_id: String },
    Frozen { task_id: String },
    Reservation { preempting_task: String, preempted_task: String },
    RollingWindow { task_id: String },
}

impl fmt::Display for ConstraintRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintRef::Precedence { predecessor, successor } => {
                write!(f, "precedence:{}->{}", predecessor, successor)
            }
            ConstraintRef::EarliestStart { task_id } => write!(f, "earliest_start:{}", task_id),
            ConstraintRef::ManualEta { task_id } => write!(f, "manual_eta:{}", task_id),
            ConstraintRef::HardDeadline { task_id } => write!(f, "hard_deadline:{}", task_id),
            ConstraintRef::MaterialKit { task_id, resource_id } => {
                write!(f, "material_kit:{}@{}", task_id, resource_id)
            }
            ConstraintRef::Gate { gate_id, task_id } => write!(f, "gate:{}@{}", gate_id, task_id),
            ConstraintRef::Capacity { resource_id, task_id } => {
                write!(f, "capacity:{}@{}", resource_id, task_id)
            }
            ConstraintRef::Exclusive { resource_id } => write!(f, "exclusive:{}", resource_id),
            ConstraintRef::Frozen { task_id } => write!(f, "frozen:{}", task_id),
            ConstraintRef::Reservation { preempting_task, preempted_task } => {
                write!(f, "reservation:{}->{}", preempting_task, preempted_task)
            }
            ConstraintRef::RollingWindow { task_id } => write!(f, "rolling_window:{}", task_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constraint_ref_display() {
        let c = ConstraintRef::Precedence {
            predecessor: "T1".to_string(),
            successor: "T2".to_string(),
        };
        assert_eq!(c.to_string(), "precedence:T1->T2");

        let json = serde_json::to_string(&ConstraintRef::HardDeadline { task_id: "T9".into() }).unwrap();
        assert!(json.contains("\"kind\":\"hard_deadline\""));
    }

    #[test]
    fn test_criticality_ordering() {
        assert!(Criticality::Low < Criticality::Medium);
        assert!(Criticality::Medium < Criticality::High);
        assert!(TaskStatus::InProgress.is_started());
        assert!(!TaskStatus::NotStarted.is_started());
    }
}
