// ==========================================
// 维修准备排产系统 - 求解适配器
// ==========================================
// 职责: 预检冲突 → 单轮松弛 → 限时搜索 → 解码为计划版本
// 输出: Optimal / Feasible / Infeasible / TimedOut 四种结构化结果
// ==========================================
// 红线: 不可行/超时是正常运行结果, 不 panic
// 红线: 超时返回迄今最好的可行解并标注 timed_out
// 红线: 门禁/独占/容量约束永不松弛
// ==========================================

pub mod search;
pub mod timeline;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::config::scheduler_config::SolveBudgetConfig;
use crate::domain::types::{ConstraintRef, SolveQuality};
use crate::domain::{
    AssignmentSegment, GateSummaryEntry, Plan, PlanningSnapshot, RelaxedConstraint, TaskAssignment,
};
use crate::engine::error::{EngineError, InfeasibilityReport};
use crate::engine::model::{Minutes, ScheduleModel, SegmentKind};
use crate::engine::objective::{ObjectiveEvaluator, ResolvedObjective};

use search::{run_search, Candidate, SearchReport, SearchSettings};

/// 计划版本上下文 (由调用方分配版本号)
#[derive(Debug, Clone)]
pub struct PlanContext {
    pub plan_id: String,
    pub version: u32,
    pub base_version: Option<u32>,
    pub snapshot: PlanningSnapshot,
    pub created_at: DateTime<Utc>,
}

/// 求解统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SolveStats {
    pub iterations: usize,
    pub elapsed_ms: u64,
    pub budget_ms: u64,
    pub timed_out: bool,
    pub lower_bound: i64,
}

/// 求解结果
#[derive(Debug, Clone)]
pub enum SolveOutcome {
    /// 目标值达到下界
    Optimal(Plan),
    /// 可行但未证明最优 (含超时返回的最好解)
    Feasible { plan: Plan, timed_out: bool },
    Infeasible(InfeasibilityReport),
    /// 超时且无可行解
    TimedOut {
        elapsed_ms: u64,
        blocking: Vec<ConstraintRef>,
    },
}

impl SolveOutcome {
    pub fn plan(&self) -> Option<&Plan> {
        match self {
            SolveOutcome::Optimal(plan) | SolveOutcome::Feasible { plan, .. } => Some(plan),
            _ => None,
        }
    }

    pub fn into_plan(self) -> Result<Plan, EngineError> {
        match self {
            SolveOutcome::Optimal(plan) | SolveOutcome::Feasible { plan, .. } => Ok(plan),
            SolveOutcome::Infeasible(report) => Err(EngineError::Infeasible(report)),
            SolveOutcome::TimedOut { elapsed_ms, blocking } => Err(EngineError::TimedOut { elapsed_ms, blocking }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SolveResult {
    pub outcome: SolveOutcome,
    pub stats: SolveStats,
}

/// 预检冲突: 一条解释链 + 其中可松弛的约束
#[derive(Debug, Clone)]
struct Conflict {
    chain: Vec<ConstraintRef>,
    relaxable: Vec<ConstraintRef>,
}

// ==========================================
// SolverAdapter
// ==========================================
pub struct SolverAdapter {
    budget: SolveBudgetConfig,
}

impl SolverAdapter {
    pub fn new(budget: SolveBudgetConfig) -> Self {
        Self { budget }
    }

    /// 求解约束模型
    #[instrument(skip_all, fields(plan_id = %ctx.plan_id, version = ctx.version, tasks = model.tasks.len()))]
    pub fn solve(
        &self,
        mut model: ScheduleModel,
        objective: &ResolvedObjective,
        ctx: PlanContext,
        is_replan: bool,
    ) -> SolveResult {
        let started = Instant::now();
        let budget = self.budget.budget_for(model.tasks.len(), is_replan);
        let deadline = started + budget;
        let mut stats = SolveStats {
            budget_ms: budget.as_millis() as u64,
            ..SolveStats::default()
        };

        // ===== 1. 预检 + 单轮松弛 =====
        let mut relaxed: Vec<RelaxedConstraint> = Vec::new();
        let conflicts = precheck(&model);
        if !conflicts.is_empty() {
            let to_relax = unique(conflicts.iter().flat_map(|c| c.relaxable.iter().cloned()));
            if !to_relax.is_empty() {
                relaxed = model.relax(&to_relax);
                info!(relaxed = relaxed.len(), "预检冲突, 已尝试松弛");
            }
            let remaining = precheck(&model);
            if !remaining.is_empty() {
                let report = InfeasibilityReport {
                    conflicting: unique(remaining.iter().flat_map(|c| c.chain.iter().cloned())),
                    minimal: true,
                    relaxed_attempted: relaxed,
                    message: describe_conflicts(&remaining),
                };
                warn!(conflicts = report.conflicting.len(), "无可行解 (预检)");
                stats.elapsed_ms = started.elapsed().as_millis() as u64;
                return SolveResult { outcome: SolveOutcome::Infeasible(report), stats };
            }
        }

        // ===== 2. 搜索 =====
        let evaluator = ObjectiveEvaluator::new(&model, objective);
        let mut lower_bound = evaluator.lower_bound(&model, &model.earliest_starts()).total;
        let settings = SearchSettings {
            deadline,
            max_iterations: self.budget.max_iterations.max(1),
            workers: self.budget.num_workers.max(1),
            seed: self.budget.random_seed,
        };
        let mut report = run_search(&model, &evaluator, lower_bound, &settings);
        stats.iterations = report.iterations;
        stats.timed_out = report.timed_out;

        // ===== 3. 截止冲突时松弛可松弛硬截止后重搜一次 =====
        if report.feasible().is_none() && !report.timed_out {
            let violated = violated_deadlines(&model, report.best.as_ref(), true);
            if !violated.is_empty() {
                let more = model.relax(&violated);
                if !more.is_empty() {
                    info!(relaxed = more.len(), "硬截止冲突, 松弛后重新搜索");
                    relaxed.extend(more);
                    lower_bound = evaluator.lower_bound(&model, &model.earliest_starts()).total;
                    report = run_search(&model, &evaluator, lower_bound, &settings);
                    stats.iterations += report.iterations;
                    stats.timed_out = report.timed_out;
                }
            }
        }

        stats.elapsed_ms = started.elapsed().as_millis() as u64;
        stats.lower_bound = lower_bound;

        let Some(best) = report.feasible() else {
            let blocking = violated_deadlines(&model, report.best.as_ref(), false);
            let outcome = if report.timed_out {
                warn!(elapsed_ms = stats.elapsed_ms, "求解超时且无可行解");
                SolveOutcome::TimedOut { elapsed_ms: stats.elapsed_ms, blocking }
            } else {
                warn!(blocking = blocking.len(), "无可行解 (搜索)");
                SolveOutcome::Infeasible(InfeasibilityReport {
                    message: format!("搜索未找到满足全部硬截止的排程, 冲突截止 {} 项", blocking.len()),
                    conflicting: blocking,
                    minimal: false,
                    relaxed_attempted: relaxed,
                })
            };
            return SolveResult { outcome, stats };
        };

        let proven = report.proven_optimal;
        let plan = decode_plan(&model, best, &report, objective, ctx, lower_bound, relaxed);
        info!(
            objective = plan.objective_value,
            lower_bound,
            proven,
            iterations = stats.iterations,
            elapsed_ms = stats.elapsed_ms,
            "求解完成"
        );
        let outcome = if proven {
            SolveOutcome::Optimal(plan)
        } else {
            SolveOutcome::Feasible { plan, timed_out: stats.timed_out }
        };
        SolveResult { outcome, stats }
    }

    pub fn budget_for(&self, task_count: usize, is_replan: bool) -> Duration {
        self.budget.budget_for(task_count, is_replan)
    }
}

fn unique(items: impl Iterator<Item = ConstraintRef>) -> Vec<ConstraintRef> {
    let mut seen = HashSet::new();
    items.filter(|c| seen.insert(c.to_string())).collect()
}

// ==========================================
// 预检
// ==========================================

/// 阻断下界 + 不可达硬截止
fn precheck(model: &ScheduleModel) -> Vec<Conflict> {
    let mut conflicts = Vec::new();
    for task in &model.tasks {
        for blocker in &task.blockers {
            conflicts.push(Conflict {
                chain: vec![blocker.source.clone()],
                relaxable: if blocker.relaxable { vec![blocker.source.clone()] } else { Vec::new() },
            });
        }
    }

    let es = model.earliest_starts();
    for (i, task) in model.tasks.iter().enumerate() {
        let Some(h) = &task.hard_deadline else { continue };
        if es[i] + task.min_duration() <= h.at {
            continue;
        }
        let deadline_ref = ConstraintRef::HardDeadline { task_id: task.task_id.clone() };
        let mut chain = explain_earliest_start(model, &es, i);
        chain.push(deadline_ref.clone());

        let mut relaxable = Vec::new();
        if h.relaxable {
            relaxable.push(deadline_ref);
        }
        for c in &chain {
            if let ConstraintRef::MaterialKit { task_id, .. } = c {
                let releasable = model
                    .parts_of(task_id)
                    .iter()
                    .flat_map(|&p| model.tasks[p].releases.iter())
                    .any(|r| &r.source == c && r.relaxable);
                if releasable {
                    relaxable.push(c.clone());
                }
            }
        }
        conflicts.push(Conflict { chain, relaxable });
    }
    conflicts
}

/// 沿决定最早开工的前置链回溯, 直到起作用的下界
fn explain_earliest_start(model: &ScheduleModel, es: &[Minutes], task: usize) -> Vec<ConstraintRef> {
    let mut chain = Vec::new();
    let mut current = task;
    loop {
        let t = &model.tasks[current];
        if let Some(r) = t.binding_release().filter(|r| r.at == es[current]) {
            chain.push(r.source.clone());
            break;
        }
        let binding_pred = model.preds[current]
            .iter()
            .copied()
            .find(|&p| es[p] + model.tasks[p].min_duration() == es[current] && es[current] > 0);
        let Some(p) = binding_pred else { break };
        if let Some(edge) = model.precedences.iter().find(|e| e.pred == p && e.succ == current) {
            chain.push(edge.source.clone());
        }
        current = p;
    }
    chain.reverse();
    chain
}

fn describe_conflicts(conflicts: &[Conflict]) -> String {
    let parts: Vec<String> = conflicts
        .iter()
        .map(|c| c.chain.iter().map(|r| r.to_string()).collect::<Vec<_>>().join(" + "))
        .collect();
    format!("冲突约束: {}", parts.join("; "))
}

fn violated_deadlines(model: &ScheduleModel, candidate: Option<&Candidate>, only_relaxable: bool) -> Vec<ConstraintRef> {
    let Some(candidate) = candidate else {
        return Vec::new();
    };
    unique(candidate.violations.iter().filter_map(|&i| {
        let task = &model.tasks[i];
        let h = task.hard_deadline.as_ref()?;
        if only_relaxable && !h.relaxable {
            return None;
        }
        Some(ConstraintRef::HardDeadline { task_id: task.task_id.clone() })
    }))
}

// ==========================================
// 解码为计划
// ==========================================

fn decode_plan(
    model: &ScheduleModel,
    best: &Candidate,
    report: &SearchReport,
    objective: &ResolvedObjective,
    ctx: PlanContext,
    lower_bound: i64,
    relaxed: Vec<RelaxedConstraint>,
) -> Plan {
    let schedule = &best.schedule;
    let mut assignments: Vec<TaskAssignment> = Vec::new();

    // 冻结任务原样带入
    for interval in &model.frozen {
        assignments.push(TaskAssignment {
            task_id: interval.task_id.clone(),
            work_package_id: interval.work_package_id.clone(),
            start: interval.start,
            end: interval.end,
            duration_minutes: (interval.end - interval.start).num_minutes(),
            resources: interval.resources.clone(),
            frozen: true,
            status: interval.status,
            segments: Vec::new(),
        });
    }

    let mut done: HashSet<&str> = HashSet::new();
    for task in &model.tasks {
        if !done.insert(task.task_id.as_str()) {
            continue;
        }
        let parts = model.parts_of(&task.task_id);
        let mut resources: Vec<String> = Vec::new();
        let mut segments = Vec::new();
        let mut duration = 0;
        for &p in &parts {
            let part = &model.tasks[p];
            if let Some(mode) = part.modes.get(schedule.modes[p]) {
                for id in mode.resource_ids() {
                    if !resources.iter().any(|r| r == id) {
                        resources.push(id.to_string());
                    }
                }
            }
            duration += schedule.ends[p] - schedule.starts[p];
            let fraction = match part.segment {
                SegmentKind::Whole => 1.0,
                SegmentKind::Partial { fraction } | SegmentKind::Remainder { fraction } => fraction,
            };
            segments.push(AssignmentSegment {
                start: model.to_datetime(schedule.starts[p]),
                end: model.to_datetime(schedule.ends[p]),
                scope_fraction: fraction,
            });
        }
        for material in &task.materials {
            if !resources.contains(material) {
                resources.push(material.clone());
            }
        }
        let first = parts.first().copied().unwrap_or(0);
        let last = parts.last().copied().unwrap_or(0);
        let status = ctx.snapshot.task(&task.task_id).map(|t| t.status).unwrap_or_default();
        assignments.push(TaskAssignment {
            task_id: task.task_id.clone(),
            work_package_id: model.work_packages[task.work_package].work_package_id.clone(),
            start: model.to_datetime(schedule.starts[first]),
            end: model.to_datetime(schedule.ends[last]),
            duration_minutes: duration,
            resources,
            frozen: false,
            status,
            segments: if parts.len() > 1 { segments } else { Vec::new() },
        });
    }

    assignments.sort_by(|a, b| a.start.cmp(&b.start).then_with(|| a.task_id.cmp(&b.task_id)));
    let makespan = assignments
        .iter()
        .map(|a| a.end)
        .max()
        .unwrap_or(ctx.snapshot.planning_start);
    let gate_summary: Vec<GateSummaryEntry> = ctx.snapshot.gates.iter().map(GateSummaryEntry::from).collect();

    Plan {
        plan_id: ctx.plan_id,
        version: ctx.version,
        base_version: ctx.base_version,
        created_at: ctx.created_at,
        quality: if report.proven_optimal { SolveQuality::Optimal } else { SolveQuality::Feasible },
        optimality_proven: report.proven_optimal,
        objective_value: best.score.total,
        lower_bound,
        assignments,
        makespan,
        gate_summary,
        relaxed_constraints: relaxed,
        template_selection: objective.selections(),
        snapshot: ctx.snapshot,
    }
}
