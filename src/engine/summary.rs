// ==========================================
// 维修准备排产系统 - 计划摘要引擎
// ==========================================
// 职责: 门禁通过率 / 预计就绪时间 / SLA 风险 / 关键路径 / KPI
// 输入: 最新计划版本 (只读)
// 输出: PlanSummary
// ==========================================

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{GateSummaryEntry, GateTarget, Plan, ResourceRequirement, RiskLevel, TaskAssignment};
use crate::engine::model_builder::ModelSettings;

/// 工作包 SLA 风险
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaRisk {
    pub work_package_id: String,
    pub level: RiskLevel,
    /// 截止时间减预计完工 (分钟); 门禁阻断项为 None
    pub buffer_minutes: Option<i64>,
    pub deadline: DateTime<Utc>,
    pub expected_completion: Option<DateTime<Utc>>,
    #[serde(default)]
    pub gate_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkPackageReadiness {
    pub work_package_id: String,
    pub ready_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtilization {
    pub resource_id: String,
    pub busy_minutes: i64,
    /// 占用量 / (容量 × 计划跨度)
    pub utilization: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanKpis {
    pub task_count: usize,
    pub frozen_count: usize,
    pub makespan_minutes: i64,
    pub total_wait_minutes: i64,
    pub avg_wait_minutes: f64,
    pub switch_count: usize,
    pub resource_utilization: Vec<ResourceUtilization>,
    /// 按期完工的工作包占比
    pub on_time_rate: f64,
    pub objective_value: i64,
    pub optimality_proven: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub plan_id: String,
    pub version: u32,
    pub gate_pass_rate: f64,
    pub gates: Vec<GateSummaryEntry>,
    pub expected_ready_time: DateTime<Utc>,
    pub work_package_ready_times: Vec<WorkPackageReadiness>,
    pub sla_risks: Vec<SlaRisk>,
    pub critical_path: Vec<String>,
    pub kpis: PlanKpis,
}

// ==========================================
// PlanSummaryEngine
// ==========================================
// 红线: 只读, 不修改计划
pub struct PlanSummaryEngine {
    sla_risk_threshold_hours: i64,
}

impl PlanSummaryEngine {
    pub fn new(sla_risk_threshold_hours: i64) -> Self {
        Self { sla_risk_threshold_hours }
    }

    pub fn summarize(&self, plan: &Plan, settings: ModelSettings) -> PlanSummary {
        let gates: Vec<GateSummaryEntry> = plan.snapshot.gates.iter().map(GateSummaryEntry::from).collect();
        let gate_pass_rate = if gates.is_empty() {
            0.0
        } else {
            gates.iter().filter(|g| g.passed).count() as f64 / gates.len() as f64
        };

        let work_package_ready_times = plan
            .snapshot
            .work_packages
            .iter()
            .map(|wp| WorkPackageReadiness {
                work_package_id: wp.work_package_id.clone(),
                ready_time: plan.work_package_end(&wp.work_package_id),
            })
            .collect();

        PlanSummary {
            plan_id: plan.plan_id.clone(),
            version: plan.version,
            gate_pass_rate,
            gates,
            expected_ready_time: plan.makespan,
            work_package_ready_times,
            sla_risks: self.sla_risks(plan, settings),
            critical_path: critical_path(plan, settings.switch_buffer_minutes),
            kpis: self.kpis(plan, settings),
        }
    }

    /// 按缓冲分级
    pub fn classify(&self, buffer_minutes: i64) -> RiskLevel {
        let threshold = self.sla_risk_threshold_hours * 60;
        if buffer_minutes < 0 {
            RiskLevel::Red
        } else if buffer_minutes < threshold / 2 {
            RiskLevel::Orange
        } else if buffer_minutes < threshold {
            RiskLevel::Yellow
        } else {
            RiskLevel::Green
        }
    }

    fn sla_risks(&self, plan: &Plan, settings: ModelSettings) -> Vec<SlaRisk> {
        let snapshot = &plan.snapshot;
        let default_deadline = snapshot.planning_start + Duration::days(settings.prep_window_days);
        let mut risks = Vec::new();

        for wp in &snapshot.work_packages {
            let deadline = wp.deadline.unwrap_or(default_deadline);
            let completion = plan.work_package_end(&wp.work_package_id);
            let buffer = completion.map(|c| (deadline - c).num_minutes());
            let level = buffer.map_or(RiskLevel::Green, |b| self.classify(b));
            let reason = match buffer {
                Some(b) if b < 0 => format!("预计超期 {} 分钟", -b),
                Some(b) => format!("SLA 缓冲 {} 分钟", b),
                None => "无已排任务".to_string(),
            };
            risks.push(SlaRisk {
                work_package_id: wp.work_package_id.clone(),
                level,
                buffer_minutes: buffer,
                deadline,
                expected_completion: completion,
                gate_id: None,
                reason,
            });
        }

        // 未通过且无预计解除时间的门禁: 阻断项
        for gate in snapshot.gates.iter().filter(|g| !g.passed && g.resolution_eta.is_none()) {
            let work_package_id = match &gate.target {
                GateTarget::WorkPackage { work_package_id } => work_package_id.clone(),
                GateTarget::Task { task_id } => match snapshot.task(task_id) {
                    Some(t) => t.work_package_id.clone(),
                    None => continue,
                },
            };
            let deadline = snapshot
                .work_package(&work_package_id)
                .and_then(|w| w.deadline)
                .unwrap_or(default_deadline);
            risks.push(SlaRisk {
                expected_completion: plan.work_package_end(&work_package_id),
                work_package_id,
                level: RiskLevel::Red,
                buffer_minutes: None,
                deadline,
                gate_id: Some(gate.gate_id.clone()),
                reason: format!("门禁 {} 未通过且无预计解除时间", gate.gate_id),
            });
        }
        risks
    }

    fn kpis(&self, plan: &Plan, settings: ModelSettings) -> PlanKpis {
        let snapshot = &plan.snapshot;
        let span = (plan.makespan - snapshot.planning_start).num_minutes().max(0);

        // 等待: 开工时间减就绪时间 (前置完工/最早开工/门禁解除)
        let mut total_wait = 0i64;
        let mut waited = 0usize;
        for a in plan.assignments.iter().filter(|a| !a.frozen) {
            let Some(task) = snapshot.task(&a.task_id) else {
                continue;
            };
            let mut ready = snapshot.planning_start;
            if let Some(es) = task.earliest_start {
                ready = ready.max(es);
            }
            for pred in &task.predecessors {
                if let Some(p) = plan.assignment(pred) {
                    ready = ready.max(p.end);
                }
            }
            for gate in snapshot.gates_blocking(task) {
                if let Some(at) = gate.resolution_time() {
                    ready = ready.max(at);
                }
            }
            total_wait += (a.start - ready).num_minutes().max(0);
            waited += 1;
        }

        let mut by_resource: BTreeMap<&str, Vec<&TaskAssignment>> = BTreeMap::new();
        for a in &plan.assignments {
            for r in &a.resources {
                by_resource.entry(r.as_str()).or_default().push(a);
            }
        }

        let mut switch_count = 0;
        let mut resource_utilization = Vec::new();
        for (resource_id, mut assignments) in by_resource {
            let Some(resource) = snapshot.resource(resource_id) else {
                continue;
            };
            if resource.is_material() {
                continue;
            }
            assignments.sort_by_key(|a| a.start);
            if resource.is_exclusive() {
                for pair in assignments.windows(2) {
                    let from = snapshot.task(&pair[0].task_id).and_then(|t| t.location.as_deref());
                    let to = snapshot.task(&pair[1].task_id).and_then(|t| t.location.as_deref());
                    if let (Some(from), Some(to)) = (from, to) {
                        if from != to {
                            switch_count += 1;
                        }
                    }
                }
            }
            let busy: i64 = assignments
                .iter()
                .map(|a| {
                    let quantity = snapshot
                        .task(&a.task_id)
                        .and_then(|t| t.required_resources.iter().find(|r| r.resource_id == resource_id))
                        .map_or(1, |r: &ResourceRequirement| if r.exclusive { resource.capacity } else { r.quantity });
                    a.duration_minutes * quantity as i64
                })
                .sum();
            let denominator = (resource.capacity.max(1) as i64 * span) as f64;
            resource_utilization.push(ResourceUtilization {
                resource_id: resource_id.to_string(),
                busy_minutes: busy,
                utilization: if denominator > 0.0 { busy as f64 / denominator } else { 0.0 },
            });
        }

        let default_deadline = snapshot.planning_start + Duration::days(settings.prep_window_days);
        let scheduled: Vec<(DateTime<Utc>, DateTime<Utc>)> = snapshot
            .work_packages
            .iter()
            .filter_map(|wp| {
                let end = plan.work_package_end(&wp.work_package_id)?;
                Some((end, wp.deadline.unwrap_or(default_deadline)))
            })
            .collect();
        let on_time_rate = if scheduled.is_empty() {
            1.0
        } else {
            scheduled.iter().filter(|(end, deadline)| end <= deadline).count() as f64 / scheduled.len() as f64
        };

        PlanKpis {
            task_count: plan.assignments.len(),
            frozen_count: plan.assignments.iter().filter(|a| a.frozen).count(),
            makespan_minutes: span,
            total_wait_minutes: total_wait,
            avg_wait_minutes: if waited == 0 { 0.0 } else { total_wait as f64 / waited as f64 },
            switch_count,
            resource_utilization,
            on_time_rate,
            objective_value: plan.objective_value,
            optimality_proven: plan.optimality_proven,
        }
    }
}

/// 关键路径: 从最晚完工任务沿紧前关系或资源紧前回溯
pub fn critical_path(plan: &Plan, switch_buffer_minutes: i64) -> Vec<String> {
    let snapshot = &plan.snapshot;
    let slot_keys = |a: &TaskAssignment| -> Vec<String> {
        a.resources
            .iter()
            .filter_map(|id| {
                let r = snapshot.resource(id)?;
                if r.is_material() {
                    return None;
                }
                Some(r.exclusive_group().map_or_else(|| id.clone(), |g| format!("group:{}", g)))
            })
            .collect()
    };
    let keys: HashMap<&str, Vec<String>> = plan
        .assignments
        .iter()
        .map(|a| (a.task_id.as_str(), slot_keys(a)))
        .collect();

    let Some(mut current) = plan.assignments.iter().max_by(|x, y| {
        x.end.cmp(&y.end).then_with(|| y.task_id.cmp(&x.task_id))
    }) else {
        return Vec::new();
    };
    let mut path = vec![current.task_id.clone()];

    while path.len() <= plan.assignments.len() {
        let precedence = snapshot.task(&current.task_id).and_then(|task| {
            task.predecessors
                .iter()
                .filter_map(|p| plan.assignment(p))
                .filter(|p| p.end == current.start)
                .max_by(|x, y| x.task_id.cmp(&y.task_id))
        });
        let binding = precedence.or_else(|| {
            let own = keys.get(current.task_id.as_str())?;
            let earliest_binding = current.start - Duration::minutes(switch_buffer_minutes);
            plan.assignments
                .iter()
                .filter(|b| b.task_id != current.task_id)
                .filter(|b| b.end <= current.start && b.end >= earliest_binding)
                .filter(|b| {
                    keys.get(b.task_id.as_str())
                        .map_or(false, |k| k.iter().any(|key| own.contains(key)))
                })
                .max_by(|x, y| x.end.cmp(&y.end).then_with(|| y.task_id.cmp(&x.task_id)))
        });
        match binding {
            Some(prev) => {
                path.push(prev.task_id.clone());
                current = prev;
            }
            None => break,
        }
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{EvidenceType, GateType, SolveQuality, TaskStatus};
    use crate::domain::{Gate, PlanningSnapshot, PreparationTask, Resource, WorkPackage};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    fn assignment(id: &str, wp: &str, start_h: i64, end_h: i64, resources: &[&str]) -> TaskAssignment {
        TaskAssignment {
            task_id: id.to_string(),
            work_package_id: wp.to_string(),
            start: t0() + Duration::hours(start_h),
            end: t0() + Duration::hours(end_h),
            duration_minutes: (end_h - start_h) * 60,
            resources: resources.iter().map(|s| s.to_string()).collect(),
            frozen: false,
            status: TaskStatus::NotStarted,
            segments: vec![],
        }
    }

    fn sample_plan() -> Plan {
        let mut wp_a = WorkPackage::new("WP-A", 5);
        wp_a.deadline = Some(t0() + Duration::hours(10));
        let mut wp_b = WorkPackage::new("WP-B", 3);
        wp_b.deadline = Some(t0() + Duration::hours(5));

        let a1 = PreparationTask::new("A-1", "WP-A", 120);
        let mut a2 = PreparationTask::new("A-2", "WP-A", 120);
        a2.predecessors.push("A-1".into());
        let b1 = PreparationTask::new("B-1", "WP-B", 180);

        let mut passed = Gate::new("G-1", GateType::DocReady, GateTarget::WorkPackage {
            work_package_id: "WP-A".into(),
        });
        passed.required_evidence = vec![];
        passed.passed = true;
        passed.passed_at = Some(t0());
        let mut open = Gate::new("G-2", GateType::SapInstruction, GateTarget::WorkPackage {
            work_package_id: "WP-B".into(),
        });
        open.required_evidence = vec![EvidenceType::Signature];

        let assignments = vec![
            assignment("A-1", "WP-A", 0, 2, &["BAY-A"]),
            assignment("B-1", "WP-B", 2, 5, &["BAY-A"]),
            assignment("A-2", "WP-A", 5, 7, &["BAY-A"]),
        ];
        Plan {
            plan_id: "P1".into(),
            version: 1,
            base_version: None,
            created_at: t0(),
            quality: SolveQuality::Feasible,
            optimality_proven: false,
            objective_value: 42,
            lower_bound: 0,
            makespan: t0() + Duration::hours(7),
            assignments,
            gate_summary: vec![],
            relaxed_constraints: vec![],
            template_selection: BTreeMap::new(),
            snapshot: PlanningSnapshot {
                planning_start: t0(),
                work_packages: vec![wp_a, wp_b],
                tasks: vec![a1, a2, b1],
                resources: vec![Resource::workspace("BAY-A", 1)],
                gates: vec![passed, open],
                reservations: vec![],
            },
        }
    }

    #[test]
    fn test_classify_buffers() {
        let engine = PlanSummaryEngine::new(12);
        assert_eq!(engine.classify(-1), RiskLevel::Red);
        assert_eq!(engine.classify(300), RiskLevel::Orange);
        assert_eq!(engine.classify(600), RiskLevel::Yellow);
        assert_eq!(engine.classify(720), RiskLevel::Green);
    }

    #[test]
    fn test_summary_values() {
        let plan = sample_plan();
        let summary = PlanSummaryEngine::new(12).summarize(&plan, ModelSettings::default());

        assert_eq!(summary.gate_pass_rate, 0.5);
        assert_eq!(summary.expected_ready_time, t0() + Duration::hours(7));
        assert_eq!(summary.kpis.task_count, 3);
        assert_eq!(summary.kpis.makespan_minutes, 420);
        assert_eq!(summary.kpis.objective_value, 42);
        // A-2 就绪于 2h, 实际 5h 开工; B-1 就绪于 0h, 2h 开工
        assert_eq!(summary.kpis.total_wait_minutes, 300);
        assert_eq!(summary.kpis.on_time_rate, 1.0);
        assert_eq!(summary.kpis.resource_utilization[0].busy_minutes, 420);

        let wp_a = summary.sla_risks.iter().find(|r| r.work_package_id == "WP-A" && r.gate_id.is_none()).unwrap();
        assert_eq!(wp_a.buffer_minutes, Some(180));
        assert_eq!(wp_a.level, RiskLevel::Orange);
        assert!(summary
            .sla_risks
            .iter()
            .any(|r| r.gate_id.as_deref() == Some("G-2") && r.level == RiskLevel::Red));
    }

    #[test]
    fn test_critical_path_walks_resource_chain() {
        let plan = sample_plan();
        assert_eq!(critical_path(&plan, 30), vec!["A-1", "B-1", "A-2"]);
    }

    #[test]
    fn test_no_gates_gives_zero_pass_rate() {
        let mut plan = sample_plan();
        plan.snapshot.gates.clear();
        let summary = PlanSummaryEngine::new(12).summarize(&plan, ModelSettings::default());
        assert_eq!(summary.gate_pass_rate, 0.0);
    }
}
