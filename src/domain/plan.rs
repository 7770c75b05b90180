// ==========================================
// 维修准备排产系统 - 计划与版本
// ==========================================
// 职责: 求解输出 (任务起止/资源分配/完工时间/门禁摘要) 与版本差异
// 红线: 计划一经产生即不可变, 重排只能从版本 N 派生版本 N+1
// 红线: 已开工/已完工区间原样带入新版本 (冻结)
// ==========================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::gate::{Gate, GateTarget};
use super::preemption::PreemptionReservation;
use super::resource::{Resource, ResourceKind};
use super::task::PreparationTask;
use super::types::{ConstraintRef, Criticality, GateType, SolveQuality, TaskStatus};
use super::work_package::WorkPackage;

// ==========================================
// PlanningSnapshot - 求解输入快照
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningSnapshot {
    /// 模型时间原点
    pub planning_start: DateTime<Utc>,
    pub work_packages: Vec<WorkPackage>,
    pub tasks: Vec<PreparationTask>,
    pub resources: Vec<Resource>,
    #[serde(default)]
    pub gates: Vec<Gate>,
    /// 抢占预留 (有效期内重排沿用)
    #[serde(default)]
    pub reservations: Vec<PreemptionReservation>,
}

impl PlanningSnapshot {
    pub fn task(&self, task_id: &str) -> Option<&PreparationTask> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn task_mut(&mut self, task_id: &str) -> Option<&mut PreparationTask> {
        self.tasks.iter_mut().find(|t| t.task_id == task_id)
    }

    pub fn resource(&self, resource_id: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.resource_id == resource_id)
    }

    pub fn resource_mut(&mut self, resource_id: &str) -> Option<&mut Resource> {
        self.resources.iter_mut().find(|r| r.resource_id == resource_id)
    }

    pub fn work_package(&self, work_package_id: &str) -> Option<&WorkPackage> {
        self.work_packages.iter().find(|w| w.work_package_id == work_package_id)
    }

    pub fn work_package_mut(&mut self, work_package_id: &str) -> Option<&mut WorkPackage> {
        self.work_packages.iter_mut().find(|w| w.work_package_id == work_package_id)
    }

    pub fn gate(&self, gate_id: &str) -> Option<&Gate> {
        self.gates.iter().find(|g| g.gate_id == gate_id)
    }

    pub fn gate_mut(&mut self, gate_id: &str) -> Option<&mut Gate> {
        self.gates.iter_mut().find(|g| g.gate_id == gate_id)
    }

    /// 指定时刻仍有效的抢占预留
    pub fn active_reservations(&self, at: DateTime<Utc>) -> impl Iterator<Item = &PreemptionReservation> + '_ {
        self.reservations.iter().filter(move |r| r.expires_at > at)
    }

    /// 资源就绪类门禁的底层条件是否满足
    ///
    /// - 航材齐套: 被门禁任务的必须齐套航材可用量均不少于需求量
    /// - 关键工装就绪: 被门禁任务的设备/工装在 `at` 时刻均可用
    /// - 无对应资源需求或非就绪类门禁时返回 None
    pub fn readiness_satisfied(&self, gate: &Gate, at: DateTime<Utc>) -> Option<bool> {
        let covered: Vec<&PreparationTask> = self
            .tasks
            .iter()
            .filter(|t| self.gates_blocking(t).any(|g| g.gate_id == gate.gate_id))
            .collect();
        let mut checked = false;
        let mut ready = true;
        for req in covered.iter().flat_map(|t| t.required_resources.iter()) {
            let Some(resource) = self.resource(&req.resource_id) else { continue };
            match (gate.gate_type, &resource.kind) {
                (GateType::MaterialsReady, ResourceKind::Material { must_kit: true, available_quantity, .. }) => {
                    checked = true;
                    ready &= *available_quantity >= req.quantity;
                }
                (GateType::CriticalToolsReady, ResourceKind::Tool { .. } | ResourceKind::Equipment { .. }) => {
                    checked = true;
                    ready &= !resource.calendar.iter().any(|w| w.start <= at && at < w.end);
                }
                _ => {}
            }
        }
        checked.then_some(ready)
    }

    /// 阻断指定任务的门禁
    ///
    /// - 任务型门禁: 阻断门禁任务的直接后续
    /// - 工作包门禁: 阻断该工作包内所有非门禁任务
    pub fn gates_blocking<'a>(&'a self, task: &'a PreparationTask) -> impl Iterator<Item = &'a Gate> + 'a {
        self.gates.iter().filter(move |gate| match &gate.target {
            GateTarget::Task { task_id } => task.predecessors.iter().any(|p| p == task_id),
            GateTarget::WorkPackage { work_package_id } => {
                !task.is_gate && &task.work_package_id == work_package_id
            }
        })
    }
}

// ==========================================
// TaskAssignment - 任务分配结果
// ==========================================

/// 分段执行 (部分齐套拆分时出现)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentSegment {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// 本段覆盖的工作量比例
    pub scope_fraction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: String,
    pub work_package_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_minutes: i64,
    pub resources: Vec<String>,
    #[serde(default)]
    pub frozen: bool,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub segments: Vec<AssignmentSegment>,
}

impl TaskAssignment {
    pub fn overlaps(&self, other: &TaskAssignment) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ==========================================
// 门禁摘要 / 松弛记录 / 模板选择
// ==========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSummaryEntry {
    pub gate_id: String,
    pub name: String,
    pub gate_type: GateType,
    pub passed: bool,
    pub resolution_time: Option<DateTime<Utc>>,
}

impl From<&Gate> for GateSummaryEntry {
    fn from(gate: &Gate) -> Self {
        Self {
            gate_id: gate.gate_id.clone(),
            name: gate.name.clone(),
            gate_type: gate.gate_type,
            passed: gate.passed,
            resolution_time: gate.resolution_time(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaxedConstraint {
    pub constraint: ConstraintRef,
    pub criticality: Criticality,
    pub reason: String,
}

/// 工作包所用的目标模板
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSelection {
    pub template: String,
    pub policy_version: u32,
    /// GLOBAL / SCOPED / ROLLOUT
    pub source: String,
}

// ==========================================
// Plan - 计划版本
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub version: u32,
    pub base_version: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub quality: SolveQuality,
    pub optimality_proven: bool,
    pub objective_value: i64,
    pub lower_bound: i64,
    pub assignments: Vec<TaskAssignment>,
    pub makespan: DateTime<Utc>,
    pub gate_summary: Vec<GateSummaryEntry>,
    #[serde(default)]
    pub relaxed_constraints: Vec<RelaxedConstraint>,
    #[serde(default)]
    pub template_selection: BTreeMap<String, TemplateSelection>,
    pub snapshot: PlanningSnapshot,
}

impl Plan {
    pub fn assignment(&self, task_id: &str) -> Option<&TaskAssignment> {
        self.assignments.iter().find(|a| a.task_id == task_id)
    }

    /// 工作包预计完工时间
    pub fn work_package_end(&self, work_package_id: &str) -> Option<DateTime<Utc>> {
        self.assignments
            .iter()
            .filter(|a| a.work_package_id == work_package_id)
            .map(|a| a.end)
            .max()
    }

    /// 按快照中门禁状态重算门禁摘要
    pub fn refresh_gate_summary(&mut self) {
        self.gate_summary = self.snapshot.gates.iter().map(GateSummaryEntry::from).collect();
    }
}

// ==========================================
// PlanDiff - 版本差异
// ==========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDelay {
    pub task_id: String,
    pub start_delay_minutes: i64,
    pub end_delay_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReallocation {
    pub task_id: String,
    pub from: Vec<String>,
    pub to: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanDiff {
    pub from_version: u32,
    pub to_version: u32,
    pub affected_tasks: Vec<String>,
    pub delays: Vec<TaskDelay>,
    pub resource_reallocation: Vec<ResourceReallocation>,
    pub makespan_delta_minutes: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_gates_blocking_by_target() {
        let mut gated = PreparationTask::new("T2", "WP1", 30);
        gated.predecessors = vec!["T-GATE".to_string()];
        let mut gate_task = PreparationTask::new("T-GATE", "WP1", 0);
        gate_task.is_gate = true;

        let snapshot = PlanningSnapshot {
            planning_start: Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap(),
            work_packages: vec![WorkPackage::new("WP1", 1)],
            tasks: vec![gate_task.clone(), gated.clone()],
            resources: vec![],
            gates: vec![
                Gate::new("G1", GateType::DocReady, GateTarget::Task { task_id: "T-GATE".into() }),
                Gate::new(
                    "G2",
                    GateType::MaterialsReady,
                    GateTarget::WorkPackage { work_package_id: "WP1".into() },
                ),
            ],
            reservations: vec![],
        };

        let ids: Vec<&str> = snapshot.gates_blocking(&gated).map(|g| g.gate_id.as_str()).collect();
        assert_eq!(ids, vec!["G1", "G2"]);

        let ids: Vec<&str> = snapshot.gates_blocking(&gate_task).map(|g| g.gate_id.as_str()).collect();
        assert!(ids.is_empty());
    }

    #[test]
    fn test_tools_readiness_follows_calendar() {
        use super::super::resource::UnavailableWindow;
        use super::super::task::ResourceRequirement;
        use chrono::Duration;

        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let mut lift = PreparationTask::new("LIFT", "WP1", 60);
        lift.required_resources.push(ResourceRequirement::new("CRANE-1", 1));
        let mut crane = Resource::equipment("CRANE-1", true, None);
        crane.calendar.push(UnavailableWindow {
            start: t0,
            end: t0 + Duration::hours(4),
            reason: Some("annual inspection".into()),
        });
        let gate = Gate::new(
            "G-TOOLS",
            GateType::CriticalToolsReady,
            GateTarget::WorkPackage { work_package_id: "WP1".into() },
        );
        let snapshot = PlanningSnapshot {
            planning_start: t0,
            work_packages: vec![WorkPackage::new("WP1", 1)],
            tasks: vec![lift],
            resources: vec![crane],
            gates: vec![gate.clone()],
            reservations: vec![],
        };

        assert_eq!(snapshot.readiness_satisfied(&gate, t0 + Duration::hours(1)), Some(false));
        assert_eq!(snapshot.readiness_satisfied(&gate, t0 + Duration::hours(4)), Some(true));

        // 非就绪类门禁不做推导
        let doc = Gate::new("G-DOC", GateType::DocReady, GateTarget::WorkPackage { work_package_id: "WP1".into() });
        assert_eq!(snapshot.readiness_satisfied(&doc, t0), None);
    }
}
