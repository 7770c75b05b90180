// ==========================================
// 维修准备排产系统 - 抢占管理
// ==========================================
// 职责: 触发判断 → 选择被抢占任务 → 护栏检查 → 预留重解 → 恢复提升 → 审计记录
// 触发: SLA 缓冲低于阈值 / 显式加急 / 关键路径延误超过阈值
// ==========================================
// 红线: 护栏永不被静默突破, 超限时拒绝并给出限值与观测值
// 红线: 每次成功抢占恰好产生一条 PreemptionRecord
// 红线: 被抢占工作包必须获得恢复优先级提升, 防止饿死
// ==========================================

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::scheduler_config::GuardrailConfig;
use crate::domain::types::TaskStatus;
use crate::domain::{
    Plan, PlanDiff, PlanningSnapshot, PreemptionRecord, PreemptionReservation, PreemptionTrigger,
    RecoveryAction, RecoveryBoost, RecoveryPlan, TaskAssignment,
};
use crate::engine::diff::PlanDiffEngine;
use crate::engine::error::{EngineError, EngineResult, GuardrailKind, GuardrailViolation, ModelError};
use crate::engine::model_builder::{reservation_pairs, BuildOptions, ConstraintModelBuilder, ModelSettings};
use crate::engine::objective::ResolvedObjective;
use crate::engine::replanner::freeze_intervals;
use crate::engine::solver::{PlanContext, SolveStats, SolverAdapter};

/// 抢占请求
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreemptionRequest {
    /// 发起抢占的工作包
    pub work_package_id: String,
    #[serde(default)]
    pub approver: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// 抢占输入
pub struct PreemptionInput<'a> {
    pub prior: &'a Plan,
    pub request: &'a PreemptionRequest,
    /// 已有抢占记录 (用于滚动24h计数)
    pub history: &'a [PreemptionRecord],
    pub objective: &'a ResolvedObjective,
    pub settings: ModelSettings,
    pub new_version: u32,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PreemptionOutcome {
    pub plan: Plan,
    pub diff: PlanDiff,
    pub record: PreemptionRecord,
    pub stats: SolveStats,
}

/// 资源池扫描结果: 满足触发条件的工作包
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreemptionCandidate {
    pub work_package_id: String,
    pub effective_priority: u32,
    /// 截止减预计完工 (分钟)
    pub sla_buffer_minutes: Option<i64>,
    pub triggers: Vec<PreemptionTrigger>,
    /// 与其他工作包共用的资源
    pub shared_resources: Vec<String>,
}

/// 被抢占的任务对 (抢占方任务, 被抢占任务, 共享资源)
#[derive(Debug, Clone, PartialEq)]
struct Victim {
    preempting_task: String,
    task_id: String,
    work_package_id: String,
    resources: Vec<String>,
}

// ==========================================
// PreemptionManager
// ==========================================
pub struct PreemptionManager<'a> {
    solver: &'a SolverAdapter,
    guardrails: &'a GuardrailConfig,
}

impl<'a> PreemptionManager<'a> {
    pub fn new(solver: &'a SolverAdapter, guardrails: &'a GuardrailConfig) -> Self {
        Self { solver, guardrails }
    }

    /// 评估触发条件
    pub fn evaluate_triggers(
        &self,
        plan: &Plan,
        work_package_id: &str,
        settings: ModelSettings,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<PreemptionTrigger>> {
        let snapshot = &plan.snapshot;
        let Some(wp) = snapshot.work_package(work_package_id) else {
            return Err(unknown_work_package(work_package_id));
        };
        let mut triggers = Vec::new();

        let completion = plan.work_package_end(work_package_id);
        if let Some(completion) = completion {
            let deadline = wp
                .deadline
                .unwrap_or(snapshot.planning_start + Duration::days(settings.prep_window_days));
            let buffer = (deadline - completion).num_minutes();
            let threshold = self.guardrails.sla_buffer_threshold_hours * 60;
            if buffer <= threshold {
                triggers.push(PreemptionTrigger::SlaBuffer {
                    buffer_minutes: buffer,
                    threshold_minutes: threshold,
                });
            }
        }

        if wp.urgent {
            triggers.push(PreemptionTrigger::UrgentFlag);
        }

        if let Some(completion) = completion {
            let earliest = resource_free_completion(snapshot, work_package_id, settings, now)?;
            if let Some(earliest) = earliest {
                let delay = (completion - earliest).num_minutes();
                let threshold = self.guardrails.critical_path_delay_threshold_hours * 60;
                if delay > threshold {
                    triggers.push(PreemptionTrigger::CriticalPathDelay {
                        delay_minutes: delay,
                        threshold_minutes: threshold,
                    });
                }
            }
        }
        Ok(triggers)
    }

    /// 扫描共用资源池的全部工作包, 返回满足触发条件者
    ///
    /// 排序: 有效优先级降序, 再按 SLA 缓冲升序
    pub fn evaluate_pool(
        &self,
        plan: &Plan,
        settings: ModelSettings,
        now: DateTime<Utc>,
    ) -> EngineResult<Vec<PreemptionCandidate>> {
        let snapshot = &plan.snapshot;
        let pools = resource_pools(snapshot);
        let mut candidates = Vec::new();
        for wp in &snapshot.work_packages {
            let Some(shared) = pools.get(wp.work_package_id.as_str()) else { continue };
            let triggers = self.evaluate_triggers(plan, &wp.work_package_id, settings, now)?;
            if triggers.is_empty() {
                continue;
            }
            let deadline = wp
                .deadline
                .unwrap_or(snapshot.planning_start + Duration::days(settings.prep_window_days));
            candidates.push(PreemptionCandidate {
                work_package_id: wp.work_package_id.clone(),
                effective_priority: wp.effective_priority(now),
                sla_buffer_minutes: plan
                    .work_package_end(&wp.work_package_id)
                    .map(|end| (deadline - end).num_minutes()),
                triggers,
                shared_resources: shared.iter().cloned().collect(),
            });
        }
        candidates.sort_by(|a, b| {
            b.effective_priority
                .cmp(&a.effective_priority)
                .then_with(|| {
                    a.sla_buffer_minutes
                        .unwrap_or(i64::MAX)
                        .cmp(&b.sla_buffer_minutes.unwrap_or(i64::MAX))
                })
                .then_with(|| a.work_package_id.cmp(&b.work_package_id))
        });
        info!(candidates = candidates.len(), "资源池抢占触发扫描完成");
        Ok(candidates)
    }

    /// 执行抢占
    #[instrument(skip_all, fields(plan_id = %input.prior.plan_id, work_package_id = %input.request.work_package_id))]
    pub fn preempt(&self, input: PreemptionInput<'_>) -> EngineResult<PreemptionOutcome> {
        let prior = input.prior;
        let wp_id = input.request.work_package_id.as_str();

        // ===== 1. 触发 =====
        let triggers = self.evaluate_triggers(prior, wp_id, input.settings, input.now)?;
        if triggers.is_empty() {
            return Err(EngineError::NotTriggered {
                work_package_id: wp_id.to_string(),
                reason: format!(
                    "SLA 缓冲高于 {}h, 未加急, 关键路径延误未超过 {}h",
                    self.guardrails.sla_buffer_threshold_hours, self.guardrails.critical_path_delay_threshold_hours
                ),
            });
        }

        // ===== 2. 审批 =====
        let approver = input.request.approver.clone().filter(|a| !a.trim().is_empty());
        if self.guardrails.require_approval && approver.is_none() {
            return Err(EngineError::ApprovalRequired {
                work_package_id: wp_id.to_string(),
            });
        }

        // ===== 3. 选择被抢占任务 =====
        let frozen = freeze_intervals(prior, &prior.snapshot, input.now, input.settings.freeze_inprogress);
        let frozen_ids: HashSet<&str> = frozen.iter().map(|f| f.task_id.as_str()).collect();
        let victims = select_victims(prior, wp_id, &frozen_ids, input.now);
        if victims.is_empty() {
            return Err(EngineError::NoPreemptableTask {
                work_package_id: wp_id.to_string(),
            });
        }
        let victim_wps: BTreeSet<String> = victims.iter().map(|v| v.work_package_id.clone()).collect();

        // ===== 4. 次数护栏 =====
        let window_start = input.now - Duration::hours(24);
        for involved in std::iter::once(wp_id).chain(victim_wps.iter().map(|s| s.as_str())) {
            let count = input
                .history
                .iter()
                .filter(|r| r.created_at > window_start && r.created_at <= input.now && r.involves(involved))
                .count() as i64;
            let limit = self.guardrails.max_preemptions_per_day as i64;
            if count + 1 > limit {
                let violation = GuardrailViolation {
                    guardrail: GuardrailKind::MaxPreemptionsPerDay,
                    work_package_id: involved.to_string(),
                    limit,
                    observed: count + 1,
                    explanation: format!("工作包 {} 滚动24h内已参与 {} 次抢占, 上限 {}", involved, count, limit),
                };
                warn!(work_package_id = %involved, count, limit, "抢占次数护栏拦截");
                return Err(EngineError::GuardrailExceeded(violation));
            }
        }

        // ===== 5. 恢复提升写入新快照 =====
        let record_id = Uuid::new_v4().to_string();
        let boost_until = input.now + Duration::hours(self.guardrails.recovery_window_hours);
        let mut snapshot = prior.snapshot.clone();
        for id in &victim_wps {
            if let Some(wp) = snapshot.work_package_mut(id) {
                wp.recovery_boost = Some(RecoveryBoost {
                    priority_boost: self.guardrails.recovery_priority_boost,
                    until: boost_until,
                    source_record_id: record_id.clone(),
                });
            }
        }

        // ===== 6. 预留重解 =====
        let mut options = BuildOptions::with_settings(input.now, input.settings);
        options.is_replan = true;
        options.not_before = Some(input.now);
        for a in prior.assignments.iter().filter(|a| !frozen_ids.contains(a.task_id.as_str())) {
            options.prior_starts.insert(a.task_id.clone(), a.start);
        }
        // 预留写入快照, 有效期内后续重排继续生效
        snapshot.reservations.retain(|r| r.expires_at > input.now);
        snapshot.reservations.extend(victims.iter().map(|v| PreemptionReservation {
            preemption_id: record_id.clone(),
            preempting_task: v.preempting_task.clone(),
            preempted_task: v.task_id.clone(),
            expires_at: boost_until,
        }));
        options.reservations = reservation_pairs(&snapshot, input.now);
        options.frozen = frozen;

        let model = ConstraintModelBuilder::build(&snapshot, &options)?;
        let ctx = PlanContext {
            plan_id: prior.plan_id.clone(),
            version: input.new_version,
            base_version: Some(prior.version),
            snapshot,
            created_at: input.now,
        };
        let result = self.solver.solve(model, input.objective, ctx, true);
        let stats = result.stats.clone();
        let plan = result.outcome.into_plan()?;

        // ===== 7. 时长护栏 =====
        let delay_minutes = victims
            .iter()
            .filter_map(|v| {
                let before = prior.assignment(&v.task_id)?;
                let after = plan.assignment(&v.task_id)?;
                Some((after.start - before.start).num_minutes())
            })
            .max()
            .unwrap_or(0)
            .max(0);
        let limit = self.guardrails.max_preemption_hours * 60;
        if delay_minutes > limit {
            warn!(delay_minutes, limit, "抢占时长护栏拦截");
            return Err(EngineError::GuardrailExceeded(GuardrailViolation {
                guardrail: GuardrailKind::MaxPreemptionHours,
                work_package_id: wp_id.to_string(),
                limit,
                observed: delay_minutes,
                explanation: format!("单次抢占延误 {} 分钟, 上限 {} 分钟", delay_minutes, limit),
            }));
        }

        // ===== 8. 审计记录 =====
        let diff = PlanDiffEngine::new().diff(prior, &plan);
        let record = build_record(
            record_id,
            prior,
            &plan,
            &diff,
            wp_id,
            &victims,
            triggers,
            input.request,
            approver,
            delay_minutes,
            boost_until,
            self.guardrails.recovery_priority_boost,
            input.now,
        );
        info!(
            record_id = %record.record_id,
            preempted = ?record.preempted_work_package_ids,
            delay_minutes,
            "抢占生效"
        );
        Ok(PreemptionOutcome { plan, diff, record, stats })
    }
}

fn unknown_work_package(work_package_id: &str) -> EngineError {
    EngineError::Model(ModelError::UnknownReference {
        kind: "work_package".to_string(),
        id: work_package_id.to_string(),
        referenced_by: "preemption".to_string(),
    })
}

/// 资源无关的最早完工 (只考虑前置/下界)
fn resource_free_completion(
    snapshot: &PlanningSnapshot,
    work_package_id: &str,
    settings: ModelSettings,
    now: DateTime<Utc>,
) -> EngineResult<Option<DateTime<Utc>>> {
    let model = ConstraintModelBuilder::build(snapshot, &BuildOptions::with_settings(now, settings))?;
    let Some(w) = model.work_package_index(work_package_id) else {
        return Ok(None);
    };
    let es = model.earliest_starts();
    let end = model
        .tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| t.work_package == w)
        .map(|(i, t)| es[i] + t.min_duration())
        .chain(model.work_packages[w].frozen_end)
        .max();
    Ok(end.map(|m| model.to_datetime(m)))
}

/// 非航材资源的槽位键 (独占组成员共用一个键)
fn slot_key(snapshot: &PlanningSnapshot, resource_id: &str) -> Option<String> {
    let r = snapshot.resource(resource_id)?;
    if r.is_material() {
        return None;
    }
    Some(r.exclusive_group().map_or_else(|| resource_id.to_string(), |g| format!("group:{}", g)))
}

/// 工作包 → 与其他工作包共用的资源
fn resource_pools(snapshot: &PlanningSnapshot) -> HashMap<&str, BTreeSet<String>> {
    let mut users: HashMap<String, BTreeSet<&str>> = HashMap::new();
    for task in snapshot.tasks.iter().filter(|t| !t.status.is_started() && t.status != TaskStatus::Cancelled) {
        for req in &task.required_resources {
            if let Some(key) = slot_key(snapshot, &req.resource_id) {
                users.entry(key).or_default().insert(task.work_package_id.as_str());
            }
        }
    }
    let mut pools: HashMap<&str, BTreeSet<String>> = HashMap::new();
    for task in snapshot.tasks.iter().filter(|t| !t.status.is_started() && t.status != TaskStatus::Cancelled) {
        for req in &task.required_resources {
            let Some(key) = slot_key(snapshot, &req.resource_id) else { continue };
            if users.get(&key).map_or(false, |wps| wps.len() > 1) {
                pools
                    .entry(task.work_package_id.as_str())
                    .or_default()
                    .insert(req.resource_id.clone());
            }
        }
    }
    pools
}

/// 共享资源 (同一资源或同一独占组)
fn shared_resources(snapshot: &PlanningSnapshot, a: &TaskAssignment, b: &TaskAssignment) -> Vec<String> {
    let b_keys: HashSet<String> = b.resources.iter().filter_map(|id| slot_key(snapshot, id)).collect();
    a.resources
        .iter()
        .filter(|id| slot_key(snapshot, id).map_or(false, |k| b_keys.contains(&k)))
        .cloned()
        .collect()
}

/// 低优先级、未开工、共享资源且排在抢占方之前的任务
fn select_victims(plan: &Plan, work_package_id: &str, frozen: &HashSet<&str>, now: DateTime<Utc>) -> Vec<Victim> {
    let snapshot = &plan.snapshot;
    let priority = |id: &str| snapshot.work_package(id).map_or(0, |w| w.effective_priority(now));
    let own_priority = priority(work_package_id);

    let mut victims: Vec<Victim> = Vec::new();
    let own: Vec<&TaskAssignment> = plan
        .assignments
        .iter()
        .filter(|a| a.work_package_id == work_package_id && !frozen.contains(a.task_id.as_str()))
        .collect();
    for p in &own {
        for v in plan.assignments.iter().filter(|v| {
            v.work_package_id != work_package_id
                && !frozen.contains(v.task_id.as_str())
                && !v.status.is_started()
                && v.start < p.start
                && priority(&v.work_package_id) < own_priority
        }) {
            let resources = shared_resources(snapshot, p, v);
            if resources.is_empty() || victims.iter().any(|x| x.task_id == v.task_id) {
                continue;
            }
            victims.push(Victim {
                preempting_task: p.task_id.clone(),
                task_id: v.task_id.clone(),
                work_package_id: v.work_package_id.clone(),
                resources,
            });
        }
    }
    victims
}

#[allow(clippy::too_many_arguments)]
fn build_record(
    record_id: String,
    prior: &Plan,
    plan: &Plan,
    diff: &PlanDiff,
    work_package_id: &str,
    victims: &[Victim],
    triggers: Vec<PreemptionTrigger>,
    request: &PreemptionRequest,
    approver: Option<String>,
    delay_minutes: i64,
    boost_until: DateTime<Utc>,
    boost: u32,
    now: DateTime<Utc>,
) -> PreemptionRecord {
    let preempted: BTreeSet<String> = victims.iter().map(|v| v.work_package_id.clone()).collect();
    let resources: BTreeSet<String> = victims.iter().flat_map(|v| v.resources.iter().cloned()).collect();

    let mut impacted: BTreeSet<String> = victims.iter().map(|v| v.task_id.clone()).collect();
    for d in &diff.delays {
        let victim_side = plan
            .assignment(&d.task_id)
            .map_or(false, |a| preempted.contains(&a.work_package_id));
        if victim_side {
            impacted.insert(d.task_id.clone());
        }
    }

    let actions: Vec<RecoveryAction> = preempted
        .iter()
        .map(|id| RecoveryAction {
            work_package_id: id.clone(),
            priority_boost: boost,
            boost_until,
            expected_completion: plan.work_package_end(id),
        })
        .collect();
    let expected_recovery_time = actions
        .iter()
        .filter_map(|a| a.expected_completion)
        .max()
        .unwrap_or(boost_until);
    let notes = actions
        .iter()
        .map(|a| {
            let before = prior.work_package_end(&a.work_package_id);
            match (before, a.expected_completion) {
                (Some(b), Some(e)) => format!(
                    "{} 完工由 {} 调整为 {}, 恢复期内优先级 +{}",
                    a.work_package_id,
                    b.to_rfc3339(),
                    e.to_rfc3339(),
                    boost
                ),
                _ => format!("{} 恢复期内优先级 +{}", a.work_package_id, boost),
            }
        })
        .collect();

    let reason = request.reason.clone().unwrap_or_else(|| {
        let names: Vec<String> = triggers
            .iter()
            .map(|t| match t {
                PreemptionTrigger::SlaBuffer { buffer_minutes, .. } => format!("SLA缓冲{}分钟", buffer_minutes),
                PreemptionTrigger::UrgentFlag => "加急".to_string(),
                PreemptionTrigger::CriticalPathDelay { delay_minutes, .. } => {
                    format!("关键路径延误{}分钟", delay_minutes)
                }
            })
            .collect();
        format!("{} 抢占: {}", work_package_id, names.join(", "))
    });

    PreemptionRecord {
        record_id,
        plan_id: plan.plan_id.clone(),
        from_version: prior.version,
        to_version: plan.version,
        preempting_work_package_id: work_package_id.to_string(),
        preempted_work_package_ids: preempted.into_iter().collect(),
        resource_ids: resources.into_iter().collect(),
        triggers,
        reason,
        impacted_tasks: impacted.into_iter().collect(),
        delay_minutes,
        recovery_plan: RecoveryPlan {
            actions,
            expected_recovery_time,
            notes,
        },
        approver,
        created_at: now,
    }
}
