// ==========================================
// 维修准备排产系统 - 事件驱动重排
// ==========================================
// 职责: 校验事件 → 冻结已开工任务 → 应用事件载荷 → 重建模型并求解 → 版本差异
// 状态机: STABLE → EVENT_RECEIVED → REPLANNING → {STABLE (新版本), REPLAN_FAILED}
// ==========================================
// 红线: 永不原地修改计划, 总是由版本 N 与事件集产生版本 N+1
// 红线: 冻结任务的开工/完工原样带入新版本
// 红线: 重排失败时上一版本仍然有效, 并返回阻断约束
// ==========================================

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::domain::types::{ConstraintRef, TaskStatus};
use crate::domain::{
    DomainEvent, EventPayload, Plan, PlanDiff, PlanningSnapshot, ReplanPolicy, ResourceKind,
    UnavailableWindow,
};
use crate::engine::diff::PlanDiffEngine;
use crate::engine::error::EngineError;
use crate::engine::model::FrozenInterval;
use crate::engine::model_builder::{reservation_pairs, BuildOptions, ConstraintModelBuilder, ModelSettings};
use crate::engine::objective::ResolvedObjective;
use crate::engine::solver::{PlanContext, SolveStats, SolverAdapter};

/// 重排状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplanState {
    Stable,
    EventReceived,
    Replanning,
    ReplanFailed,
}

/// 重排成功结果
#[derive(Debug, Clone)]
pub struct ReplanOutcome {
    pub plan: Plan,
    pub diff: PlanDiff,
    pub policy: ReplanPolicy,
    pub frozen_tasks: Vec<String>,
    pub stats: SolveStats,
    pub transitions: Vec<ReplanState>,
}

/// 重排失败 (上一版本仍然有效)
#[derive(Debug, Clone)]
pub struct ReplanFailure {
    pub error: EngineError,
    pub blocking: Vec<ConstraintRef>,
    pub transitions: Vec<ReplanState>,
}

impl ReplanFailure {
    fn new(error: EngineError, transitions: Vec<ReplanState>) -> Self {
        Self {
            blocking: error.blocking_constraints(),
            error,
            transitions,
        }
    }
}

/// 重排请求
pub struct ReplanRequest<'a> {
    pub prior: &'a Plan,
    pub events: &'a [DomainEvent],
    /// 已消费的事件 ID
    pub consumed: &'a HashSet<String>,
    pub objective: &'a ResolvedObjective,
    pub settings: ModelSettings,
    pub new_version: u32,
    pub now: DateTime<Utc>,
}

// ==========================================
// EventReplanner
// ==========================================
pub struct EventReplanner<'a> {
    solver: &'a SolverAdapter,
}

impl<'a> EventReplanner<'a> {
    pub fn new(solver: &'a SolverAdapter) -> Self {
        Self { solver }
    }

    /// 执行一次重排
    #[instrument(skip_all, fields(plan_id = %request.prior.plan_id, base_version = request.prior.version, events = request.events.len()))]
    pub fn replan(&self, request: ReplanRequest<'_>) -> Result<ReplanOutcome, ReplanFailure> {
        let mut transitions = vec![ReplanState::Stable, ReplanState::EventReceived];
        let prior = request.prior;

        // ===== 1. 校验 =====
        if let Err(e) = validate_events(&prior.snapshot, request.events, request.consumed) {
            warn!(error = %e, "事件校验失败");
            transitions.push(ReplanState::ReplanFailed);
            return Err(ReplanFailure::new(e, transitions));
        }
        transitions.push(ReplanState::Replanning);

        let mut events: Vec<&DomainEvent> = request.events.iter().collect();
        events.sort_by_key(|e| e.effective_time);
        let effective = events
            .iter()
            .map(|e| e.effective_time)
            .max()
            .unwrap_or(request.now);
        let policy = ReplanPolicy::most_restrictive(events.iter().map(|e| e.policy));

        // ===== 2. 应用事件载荷 =====
        let mut snapshot = prior.snapshot.clone();
        for event in &events {
            if let Err(e) = apply_event(&mut snapshot, event, prior) {
                transitions.push(ReplanState::ReplanFailed);
                return Err(ReplanFailure::new(e, transitions));
            }
        }

        let touches_resources = events.iter().any(|e| {
            matches!(
                e.payload,
                EventPayload::MaterialReceipt { .. } | EventPayload::EtaChange { .. } | EventPayload::ResourceStatus { .. }
            )
        });
        if touches_resources {
            refresh_readiness_gates(&mut snapshot, effective);
        }

        // ===== 3. 冻结 =====
        let frozen = freeze_intervals(prior, &snapshot, effective, request.settings.freeze_inprogress);
        let frozen_ids: HashSet<&str> = frozen.iter().map(|f| f.task_id.as_str()).collect();

        let mut options = BuildOptions::with_settings(effective, request.settings);
        options.is_replan = true;
        options.not_before = Some(effective);
        for assignment in prior.assignments.iter().filter(|a| !frozen_ids.contains(a.task_id.as_str())) {
            options.prior_starts.insert(assignment.task_id.clone(), assignment.start);
        }
        options.start_floors = rolling_window_floors(prior, &frozen_ids, policy, effective);
        options.reservations = reservation_pairs(&snapshot, effective);
        let frozen_tasks: Vec<String> = frozen.iter().map(|f| f.task_id.clone()).collect();
        options.frozen = frozen;

        // ===== 4. 重建模型并求解 =====
        let model = match ConstraintModelBuilder::build(&snapshot, &options) {
            Ok(model) => model,
            Err(e) => {
                transitions.push(ReplanState::ReplanFailed);
                return Err(ReplanFailure::new(e.into(), transitions));
            }
        };
        let ctx = PlanContext {
            plan_id: prior.plan_id.clone(),
            version: request.new_version,
            base_version: Some(prior.version),
            snapshot,
            created_at: request.now,
        };
        let result = self.solver.solve(model, request.objective, ctx, true);
        let stats = result.stats.clone();
        let plan = match result.outcome.into_plan() {
            Ok(plan) => plan,
            Err(e) => {
                warn!(error = %e, "重排失败, 保持上一版本");
                transitions.push(ReplanState::ReplanFailed);
                return Err(ReplanFailure::new(e, transitions));
            }
        };

        // ===== 5. 差异 =====
        let diff = PlanDiffEngine::new().diff(prior, &plan);
        transitions.push(ReplanState::Stable);
        info!(
            new_version = plan.version,
            affected = diff.affected_tasks.len(),
            makespan_delta = diff.makespan_delta_minutes,
            "重排完成"
        );
        Ok(ReplanOutcome {
            plan,
            diff,
            policy,
            frozen_tasks,
            stats,
            transitions,
        })
    }
}

// ==========================================
// 校验
// ==========================================

fn invalid(event: &DomainEvent, message: impl Into<String>) -> EngineError {
    EngineError::InvalidEvent {
        event_id: event.event_id.clone(),
        message: message.into(),
    }
}

/// 校验事件作用域与载荷引用
pub fn validate_events(
    snapshot: &PlanningSnapshot,
    events: &[DomainEvent],
    consumed: &HashSet<String>,
) -> Result<(), EngineError> {
    if events.is_empty() {
        return Err(EngineError::InvalidEvent {
            event_id: String::new(),
            message: "事件列表为空".to_string(),
        });
    }
    let mut seen = HashSet::new();
    for event in events {
        if event.event_id.trim().is_empty() {
            return Err(invalid(event, "缺少事件ID"));
        }
        if consumed.contains(&event.event_id) || !seen.insert(event.event_id.as_str()) {
            return Err(invalid(event, "事件已被消费"));
        }
        if event.scope.is_empty() {
            return Err(invalid(event, "事件作用域为空"));
        }
        for id in &event.scope.work_packages {
            if snapshot.work_package(id).is_none() {
                return Err(invalid(event, format!("作用域引用了不存在的工作包: {}", id)));
            }
        }
        for id in &event.scope.task_ids {
            if snapshot.task(id).is_none() {
                return Err(invalid(event, format!("作用域引用了不存在的任务: {}", id)));
            }
        }
        for id in &event.scope.resource_ids {
            if snapshot.resource(id).is_none() {
                return Err(invalid(event, format!("作用域引用了不存在的资源: {}", id)));
            }
        }
        for id in &event.scope.gate_ids {
            if snapshot.gate(id).is_none() {
                return Err(invalid(event, format!("作用域引用了不存在的门禁: {}", id)));
            }
        }
        validate_payload(snapshot, event)?;
    }
    Ok(())
}

fn validate_payload(snapshot: &PlanningSnapshot, event: &DomainEvent) -> Result<(), EngineError> {
    let material = |resource_id: &str| -> Result<(), EngineError> {
        match snapshot.resource(resource_id) {
            Some(r) if r.is_material() => Ok(()),
            Some(_) => Err(invalid(event, format!("资源不是航材: {}", resource_id))),
            None => Err(invalid(event, format!("载荷引用了不存在的资源: {}", resource_id))),
        }
    };
    match &event.payload {
        EventPayload::EtaChange { resource_id, .. } | EventPayload::MaterialReceipt { resource_id, .. } => {
            material(resource_id)
        }
        EventPayload::ResourceStatus { resource_id, unavailable_from, unavailable_until, .. } => {
            if snapshot.resource(resource_id).is_none() {
                return Err(invalid(event, format!("载荷引用了不存在的资源: {}", resource_id)));
            }
            if unavailable_until < unavailable_from {
                return Err(invalid(event, "不可用时段结束早于开始"));
            }
            Ok(())
        }
        EventPayload::Weather { start, end, .. } => {
            if end < start {
                return Err(invalid(event, "天气影响时段结束早于开始"));
            }
            if event.scope.resource_ids.is_empty() {
                return Err(invalid(event, "天气事件需要指定受影响资源"));
            }
            Ok(())
        }
        EventPayload::ThirdPartyAck { gate_id, .. } => match snapshot.gate(gate_id) {
            Some(_) => Ok(()),
            None => Err(invalid(event, format!("载荷引用了不存在的门禁: {}", gate_id))),
        },
        EventPayload::SapUpdate { instruction_id, .. } => {
            if instruction_id.trim().is_empty() {
                return Err(invalid(event, "缺少SAP指令号"));
            }
            Ok(())
        }
        EventPayload::TaskProgress { task_id, .. } => match snapshot.task(task_id) {
            Some(_) => Ok(()),
            None => Err(invalid(event, format!("载荷引用了不存在的任务: {}", task_id))),
        },
    }
}

// ==========================================
// 应用载荷
// ==========================================

fn apply_event(snapshot: &mut PlanningSnapshot, event: &DomainEvent, prior: &Plan) -> Result<(), EngineError> {
    match &event.payload {
        EventPayload::EtaChange { resource_id, new_eta, .. } => {
            if let Some(r) = snapshot.resource_mut(resource_id) {
                if let ResourceKind::Material { eta, .. } = &mut r.kind {
                    *eta = Some(*new_eta);
                }
            }
        }
        EventPayload::MaterialReceipt { resource_id, available_quantity } => {
            if let Some(r) = snapshot.resource_mut(resource_id) {
                if let ResourceKind::Material { available_quantity: q, eta, .. } = &mut r.kind {
                    *q = *available_quantity;
                    // 到货即在库: 更晚的 ETA 提前到到货时刻
                    if eta.map_or(true, |e| e > event.effective_time) {
                        *eta = Some(event.effective_time);
                    }
                }
                r.capacity = (*available_quantity).max(1);
            }
        }
        EventPayload::SapUpdate { instruction_id, new_status, .. } => {
            for gate in snapshot
                .gates
                .iter_mut()
                .filter(|g| g.pending_conditions.iter().any(|c| c == instruction_id))
            {
                gate.satisfy_condition(instruction_id, event.effective_time)?;
                info!(gate_id = %gate.gate_id, instruction_id = %instruction_id, status = %new_status, "SAP 指令满足门禁条件");
            }
        }
        EventPayload::Weather { weather_type, start, end, .. } => {
            for resource_id in &event.scope.resource_ids {
                if let Some(r) = snapshot.resource_mut(resource_id) {
                    r.calendar.push(UnavailableWindow {
                        start: *start,
                        end: *end,
                        reason: Some(format!("weather:{}", weather_type)),
                    });
                }
            }
        }
        EventPayload::ThirdPartyAck { gate_id, confirmed, expected_resolution, .. } => {
            if let Some(gate) = snapshot.gate_mut(gate_id) {
                gate.resolution_eta = if *confirmed { *expected_resolution } else { None };
            }
        }
        EventPayload::ResourceStatus { resource_id, unavailable_from, unavailable_until, reason } => {
            if let Some(r) = snapshot.resource_mut(resource_id) {
                r.calendar.push(UnavailableWindow {
                    start: *unavailable_from,
                    end: *unavailable_until,
                    reason: reason.clone(),
                });
            }
        }
        EventPayload::TaskProgress { task_id, status, at } => {
            let planned = prior.assignment(task_id).map(|a| (a.start, a.end));
            let crew = prior.assignment(task_id).map(|a| a.resources.clone()).unwrap_or_default();
            if let Some(task) = snapshot.task_mut(task_id) {
                task.status = *status;
                if status.is_started() && task.assigned_resources.is_empty() {
                    task.assigned_resources = crew;
                }
                match status {
                    TaskStatus::InProgress => {
                        task.actual_start.get_or_insert(*at);
                    }
                    TaskStatus::Completed => {
                        if task.actual_start.is_none() {
                            task.actual_start = Some(planned.map_or(*at, |(s, _)| s.min(*at)));
                        }
                        task.actual_end = Some(*at);
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

/// 航材/工装状态变化后重新推导就绪类门禁
fn refresh_readiness_gates(snapshot: &mut PlanningSnapshot, at: DateTime<Utc>) {
    let ready: Vec<String> = snapshot
        .gates
        .iter()
        .filter(|g| g.is_readiness_gate() && !g.passed)
        .filter(|g| snapshot.readiness_satisfied(g, at) == Some(true))
        .map(|g| g.gate_id.clone())
        .collect();
    for gate_id in ready {
        if let Some(gate) = snapshot.gate_mut(&gate_id) {
            let transition = gate.confirm_readiness(at);
            info!(gate_id = %gate_id, gate_type = %gate.gate_type, ?transition, "资源就绪门禁重新评估");
        }
    }
}

// ==========================================
// 冻结与滚动窗口
// ==========================================

/// 冻结区间: 上一版本已冻结 / 已开工或已完工 / 计划开工不晚于事件生效时刻
pub(crate) fn freeze_intervals(
    prior: &Plan,
    snapshot: &PlanningSnapshot,
    effective: DateTime<Utc>,
    freeze_inprogress: bool,
) -> Vec<FrozenInterval> {
    let mut frozen = Vec::new();
    for a in &prior.assignments {
        let Some(task) = snapshot.task(&a.task_id) else { continue };
        if task.status == TaskStatus::Cancelled {
            continue;
        }
        let interval = |start: DateTime<Utc>, end: DateTime<Utc>| FrozenInterval {
            task_id: a.task_id.clone(),
            work_package_id: a.work_package_id.clone(),
            start,
            end,
            resources: a.resources.clone(),
            status: task.status,
        };
        // 已开工任务以实际时间为准, 覆盖上一版本的冻结区间
        if task.status.is_started() {
            let start = task.actual_start.unwrap_or(a.start);
            let end = task
                .actual_end
                .unwrap_or(start + Duration::minutes(a.duration_minutes))
                .max(start);
            frozen.push(interval(start, end));
        } else if a.frozen {
            frozen.push(interval(a.start, a.end));
        } else if freeze_inprogress && a.start <= effective {
            frozen.push(interval(a.start, a.end));
        }
    }
    frozen
}

/// 滚动窗口外的任务不早于原计划开工
fn rolling_window_floors(
    prior: &Plan,
    frozen: &HashSet<&str>,
    policy: ReplanPolicy,
    effective: DateTime<Utc>,
) -> HashMap<String, DateTime<Utc>> {
    let ReplanPolicy::RollingWindow { window_hours } = policy else {
        return HashMap::new();
    };
    let window_end = effective + Duration::hours(window_hours.max(0));
    prior
        .assignments
        .iter()
        .filter(|a| !frozen.contains(a.task_id.as_str()) && a.start > window_end)
        .map(|a| (a.task_id.clone(), a.start))
        .collect()
}
