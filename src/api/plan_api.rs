// ==========================================
// 维修准备排产系统 - 计划 API
// ==========================================
// 职责: 生成计划 / 应用事件 / 摘要 / 交接确认 / 抢占 / 版本查询
// 红线: 每次变更都是基于版本 N 的乐观提交 N+1, 失败时上一版本保持权威
// 红线: 同一计划同一时刻至多一个变更在途
// 红线: 求解前读取快照, 求解后持久化, 求解过程中不做 I/O
// ==========================================

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::api::clock::{Clock, SystemClock};
use crate::api::error::{ApiError, ApiResult};
use crate::api::plan_guard::PlanGuard;
use crate::config::objective_policy::{ObjectivePolicy, PriorityTemplate, TemplateRef, WeightOverrides};
use crate::config::scheduler_config::SchedulerConfig;
use crate::config::ConfigManager;
use crate::domain::types::SolveQuality;
use crate::domain::{
    DomainEvent, Evidence, Gate, GateSummaryEntry, GateTarget, GateTransition, Plan, PlanDiff, PlanningSnapshot,
    PreemptionRecord, RelaxedConstraint, ReplanPolicy, TaskAssignment,
};
use crate::engine::events::{OptionalEventPublisher, PlanEvent, PlanEventPublisher, PlanEventType};
use crate::engine::model_builder::{BuildOptions, ConstraintModelBuilder, ModelSettings};
use crate::engine::objective::{ObjectiveEngine, ResolvedObjective};
use crate::engine::preemption::{PreemptionCandidate, PreemptionInput, PreemptionManager, PreemptionRequest};
use crate::engine::replanner::{EventReplanner, ReplanRequest, ReplanState};
use crate::engine::solver::{PlanContext, SolveStats, SolverAdapter};
use crate::engine::summary::{PlanSummary, PlanSummaryEngine};
use crate::repository::{
    EventLogRepository, LoggedEvent, PlanHeader, PlanRepository, PreemptionCommit, PreemptionRepository,
    VersionCommit,
};

// ==========================================
// 请求 / 响应
// ==========================================

/// 生成配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateConfig {
    #[serde(default)]
    pub prep_window_days: Option<i64>,
    /// 显式指定模板 (覆盖策略选择, 对本计划全部工作包生效)
    #[serde(default)]
    pub objective_template: Option<PriorityTemplate>,
    /// 指定策略版本, 缺省取当前版本
    #[serde(default)]
    pub objective_policy_version: Option<u32>,
    #[serde(default)]
    pub weight_overrides: Option<WeightOverrides>,
    #[serde(default)]
    pub freeze_inprogress: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratePlanRequest {
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub snapshot: PlanningSnapshot,
    #[serde(default)]
    pub config: GenerateConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratePlanResponse {
    pub plan_id: String,
    pub version: u32,
    pub quality: SolveQuality,
    pub optimality_proven: bool,
    pub gates: Vec<GateSummaryEntry>,
    pub preparation_tasks: Vec<TaskAssignment>,
    pub makespan: DateTime<Utc>,
    pub relaxed_constraints: Vec<RelaxedConstraint>,
    /// 幂等重放时为 None
    pub stats: Option<SolveStats>,
    /// 是否为幂等重放
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyEventsResponse {
    pub plan_id: String,
    pub version: u32,
    pub diff: PlanDiff,
    pub new_makespan: DateTime<Utc>,
    pub policy: ReplanPolicy,
    pub frozen_tasks: Vec<String>,
    pub transitions: Vec<ReplanState>,
    pub stats: SolveStats,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmHandoverResponse {
    pub plan_id: String,
    /// 提交后的版本 (门禁此前已通过时不产生新版本)
    pub version: u32,
    pub status: GateTransition,
    pub updated_gate: Gate,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreemptResponse {
    pub plan_id: String,
    pub version: u32,
    pub diff: PlanDiff,
    pub record: PreemptionRecord,
    pub new_makespan: DateTime<Utc>,
    pub stats: SolveStats,
}

/// 参与幂等指纹的输入
#[derive(Serialize)]
struct FingerprintInput<'a> {
    snapshot: &'a PlanningSnapshot,
    config: &'a GenerateConfig,
}

// ==========================================
// PlanApi - 计划 API
// ==========================================
pub struct PlanApi {
    plan_repo: Arc<PlanRepository>,
    event_log_repo: Arc<EventLogRepository>,
    preemption_repo: Arc<PreemptionRepository>,
    config_manager: Arc<ConfigManager>,
    config: SchedulerConfig,
    solver: SolverAdapter,
    guard: PlanGuard,
    clock: Arc<dyn Clock>,
    // 事件发布器（依赖倒置：看板/消息总线在外部实现）
    event_publisher: OptionalEventPublisher,
}

impl PlanApi {
    pub fn new(
        plan_repo: Arc<PlanRepository>,
        event_log_repo: Arc<EventLogRepository>,
        preemption_repo: Arc<PreemptionRepository>,
        config_manager: Arc<ConfigManager>,
        config: SchedulerConfig,
        event_publisher: Option<Arc<dyn PlanEventPublisher>>,
    ) -> Self {
        let event_publisher = match event_publisher {
            Some(p) => OptionalEventPublisher::with_publisher(p),
            None => OptionalEventPublisher::none(),
        };
        Self {
            plan_repo,
            event_log_repo,
            preemption_repo,
            config_manager,
            solver: SolverAdapter::new(config.budgets.clone()),
            guard: PlanGuard::new(config.busy_policy),
            config,
            clock: Arc::new(SystemClock),
            event_publisher,
        }
    }

    /// 替换时钟 (测试/回放)
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ==========================================
    // GeneratePlan
    // ==========================================

    /// 生成计划 (幂等)
    ///
    /// - 同一幂等键 + 相同输入指纹: 返回已存储的计划
    /// - 同一幂等键 + 不同输入: IdempotencyConflict
    #[instrument(skip(self, request), fields(idempotency_key = ?request.idempotency_key, tasks = request.snapshot.tasks.len()))]
    pub fn generate_plan(&self, request: GeneratePlanRequest) -> ApiResult<GeneratePlanResponse> {
        let key = match request.idempotency_key.as_deref().map(str::trim) {
            Some("") => return Err(ApiError::InvalidInput("幂等键不能为空字符串".to_string())),
            other => other.map(str::to_string),
        };
        let fingerprint = fingerprint(&request)?;

        // 同一幂等键的并发请求串行化
        let _lease = match &key {
            Some(k) => Some(self.guard.acquire(&format!("idempotency:{}", k))?),
            None => None,
        };

        if let Some(k) = &key {
            if let Some(header) = self.plan_repo.find_by_idempotency_key(k)? {
                if header.input_fingerprint != fingerprint {
                    return Err(ApiError::IdempotencyConflict { key: k.clone() });
                }
                let plan = self
                    .plan_repo
                    .find_version(&header.plan_id, 1)?
                    .ok_or_else(|| ApiError::NotFound(format!("计划 {} 版本 1 不存在", header.plan_id)))?;
                info!(plan_id = %plan.plan_id, "幂等重放, 返回已存储计划");
                return Ok(generate_response(&plan, None, true));
            }
        }

        let now = self.clock.now();
        let settings = ModelSettings {
            prep_window_days: request.config.prep_window_days.unwrap_or(self.config.prep_window_days),
            switch_buffer_minutes: self.config.switch_buffer_minutes,
            freeze_inprogress: request.config.freeze_inprogress.unwrap_or(self.config.freeze_inprogress),
        };
        if settings.prep_window_days <= 0 {
            return Err(ApiError::InvalidInput(format!(
                "prep_window_days 必须为正: {}",
                settings.prep_window_days
            )));
        }

        let policy = match request.config.objective_policy_version {
            Some(v) => self
                .config_manager
                .objective_policy(v)?
                .ok_or_else(|| ApiError::NotFound(format!("目标策略版本 {} 不存在", v)))?,
            None => self.config_manager.current_objective_policy(now)?,
        };
        let request_template = request_template(&request.config, &policy)?;

        let model = ConstraintModelBuilder::build(&request.snapshot, &BuildOptions::with_settings(now, settings))?;
        let objective = ObjectiveEngine::resolve(&policy, &request.snapshot, now, request_template.as_ref());

        let plan_id = Uuid::new_v4().to_string();
        let ctx = PlanContext {
            plan_id: plan_id.clone(),
            version: 1,
            base_version: None,
            snapshot: request.snapshot,
            created_at: now,
        };
        let result = self.solver.solve(model, &objective, ctx, false);
        let stats = result.stats;
        let plan = result.outcome.into_plan()?;

        let header = PlanHeader {
            plan_id: plan_id.clone(),
            current_version: 1,
            idempotency_key: key,
            input_fingerprint: fingerprint,
            settings,
            objective_policy_version: policy.version,
            request_template,
            created_at: now,
            updated_at: now,
        };
        self.plan_repo.create(&header, &plan)?;

        self.event_publisher.publish(PlanEvent::full_scope(
            &plan_id,
            1,
            PlanEventType::PlanGenerated,
            Some("PlanApi::generate_plan".to_string()),
        ));
        info!(plan_id = %plan_id, quality = ?plan.quality, makespan = %plan.makespan, "计划已生成");
        Ok(generate_response(&plan, Some(stats), false))
    }

    // ==========================================
    // ApplyEvents
    // ==========================================

    /// 应用领域事件并重排, 成功时提交新版本并记录事件
    #[instrument(skip(self, events), fields(plan_id = %plan_id, events = events.len()))]
    pub fn apply_events(&self, plan_id: &str, events: Vec<DomainEvent>) -> ApiResult<ApplyEventsResponse> {
        if events.is_empty() {
            return Err(ApiError::InvalidInput("事件列表为空".to_string()));
        }
        let _lease = self.guard.acquire(plan_id)?;
        let (header, prior) = self.load_current(plan_id)?;
        let now = self.clock.now();
        let objective = self.resolve_objective(&header, &prior.snapshot, now)?;
        let consumed = self.event_log_repo.consumed_event_ids()?;

        let replanner = EventReplanner::new(&self.solver);
        let outcome = match replanner.replan(ReplanRequest {
            prior: &prior,
            events: &events,
            consumed: &consumed,
            objective: &objective,
            settings: header.settings,
            new_version: prior.version + 1,
            now,
        }) {
            Ok(outcome) => outcome,
            Err(failure) => {
                warn!(
                    error = %failure.error,
                    blocking = ?failure.blocking,
                    "重排失败, 计划保持版本 {}",
                    prior.version
                );
                self.event_publisher.publish(PlanEvent::full_scope(
                    plan_id,
                    prior.version,
                    PlanEventType::ReplanFailed,
                    Some(failure.error.to_string()),
                ));
                return Err(failure.error.into());
            }
        };

        self.plan_repo.commit_version(VersionCommit {
            plan: &outcome.plan,
            base_version: prior.version,
            events: &events,
            preemption: None,
        })?;

        let affected = affected_work_packages(&outcome.plan, &outcome.diff.affected_tasks);
        self.event_publisher.publish(PlanEvent::scoped(
            plan_id,
            outcome.plan.version,
            PlanEventType::PlanReplanned,
            Some("PlanApi::apply_events".to_string()),
            affected,
        ));
        Ok(ApplyEventsResponse {
            plan_id: plan_id.to_string(),
            version: outcome.plan.version,
            new_makespan: outcome.plan.makespan,
            diff: outcome.diff,
            policy: outcome.policy,
            frozen_tasks: outcome.frozen_tasks,
            transitions: outcome.transitions,
            stats: outcome.stats,
        })
    }

    // ==========================================
    // Summarize (只读)
    // ==========================================

    pub fn summarize(&self, plan_id: &str) -> ApiResult<PlanSummary> {
        let (header, plan) = self.load_current(plan_id)?;
        Ok(PlanSummaryEngine::new(self.config.sla_risk_threshold_hours).summarize(&plan, header.settings))
    }

    // ==========================================
    // ConfirmHandover
    // ==========================================

    /// 提交交接证据; 门禁状态变化时提交新版本 (不重解)
    ///
    /// prep_id 可以是门禁 ID, 也可以是门禁所挂的准备任务 ID
    #[instrument(skip(self, evidence), fields(plan_id = %plan_id, prep_id = %prep_id))]
    pub fn confirm_handover(
        &self,
        plan_id: &str,
        prep_id: &str,
        evidence: Vec<Evidence>,
    ) -> ApiResult<ConfirmHandoverResponse> {
        if evidence.is_empty() {
            return Err(ApiError::InvalidInput("未提交任何证据".to_string()));
        }
        let _lease = self.guard.acquire(plan_id)?;
        let (_, prior) = self.load_current(plan_id)?;

        let gate_id = find_gate_id(&prior.snapshot, prep_id)
            .ok_or_else(|| ApiError::NotFound(format!("准备项 {} 没有对应的门禁", prep_id)))?;

        let mut next = prior.clone();
        let gate = next
            .snapshot
            .gate_mut(&gate_id)
            .ok_or_else(|| ApiError::NotFound(format!("门禁 {} 不存在", gate_id)))?;
        // 同批多份证据中途通过时, 后续证据返回 AlreadyPassed, 保留最后一次实际迁移
        let mut status = GateTransition::AlreadyPassed;
        for item in evidence {
            let transition = gate.submit_evidence(item)?;
            if !matches!(transition, GateTransition::AlreadyPassed) {
                status = transition;
            }
        }
        let updated_gate = gate.clone();

        if matches!(status, GateTransition::AlreadyPassed) {
            return Ok(ConfirmHandoverResponse {
                plan_id: plan_id.to_string(),
                version: prior.version,
                passed: updated_gate.passed,
                status,
                updated_gate,
            });
        }

        next.version = prior.version + 1;
        next.base_version = Some(prior.version);
        next.created_at = self.clock.now();
        next.refresh_gate_summary();
        self.plan_repo.commit_version(VersionCommit {
            plan: &next,
            base_version: prior.version,
            events: &[],
            preemption: None,
        })?;

        self.event_publisher.publish(PlanEvent::full_scope(
            plan_id,
            next.version,
            PlanEventType::HandoverConfirmed,
            Some(format!("gate:{}", gate_id)),
        ));
        info!(gate_id = %gate_id, passed = updated_gate.passed, version = next.version, "交接证据已记录");
        Ok(ConfirmHandoverResponse {
            plan_id: plan_id.to_string(),
            version: next.version,
            passed: updated_gate.passed,
            status,
            updated_gate,
        })
    }

    // ==========================================
    // Preempt
    // ==========================================

    #[instrument(skip(self, request), fields(plan_id = %plan_id, work_package_id = %request.work_package_id))]
    pub fn preempt(&self, plan_id: &str, request: PreemptionRequest) -> ApiResult<PreemptResponse> {
        let _lease = self.guard.acquire(plan_id)?;
        let (header, prior) = self.load_current(plan_id)?;
        let now = self.clock.now();
        let objective = self.resolve_objective(&header, &prior.snapshot, now)?;
        let history = self.preemption_repo.list_since(now - Duration::hours(24))?;

        let manager = PreemptionManager::new(&self.solver, &self.config.guardrails);
        let outcome = manager.preempt(PreemptionInput {
            prior: &prior,
            request: &request,
            history: &history,
            objective: &objective,
            settings: header.settings,
            new_version: prior.version + 1,
            now,
        })?;

        self.plan_repo.commit_version(VersionCommit {
            plan: &outcome.plan,
            base_version: prior.version,
            events: &[],
            preemption: Some(PreemptionCommit {
                record: &outcome.record,
                max_per_day: self.config.guardrails.max_preemptions_per_day,
            }),
        })?;

        let mut involved = vec![outcome.record.preempting_work_package_id.clone()];
        involved.extend(outcome.record.preempted_work_package_ids.iter().cloned());
        self.event_publisher.publish(PlanEvent::scoped(
            plan_id,
            outcome.plan.version,
            PlanEventType::PreemptionApplied,
            Some(outcome.record.record_id.clone()),
            involved,
        ));
        Ok(PreemptResponse {
            plan_id: plan_id.to_string(),
            version: outcome.plan.version,
            new_makespan: outcome.plan.makespan,
            diff: outcome.diff,
            record: outcome.record,
            stats: outcome.stats,
        })
    }

    /// 资源池内满足抢占触发条件的工作包 (只读)
    pub fn preemption_candidates(&self, plan_id: &str) -> ApiResult<Vec<PreemptionCandidate>> {
        let (header, plan) = self.load_current(plan_id)?;
        let manager = PreemptionManager::new(&self.solver, &self.config.guardrails);
        Ok(manager.evaluate_pool(&plan, header.settings, self.clock.now())?)
    }

    // ==========================================
    // 查询
    // ==========================================

    /// 读取计划; version 缺省取最新
    pub fn get_plan(&self, plan_id: &str, version: Option<u32>) -> ApiResult<Plan> {
        let plan = match version {
            Some(v) => self.plan_repo.find_version(plan_id, v)?,
            None => self.plan_repo.find_latest(plan_id)?,
        };
        plan.ok_or_else(|| ApiError::NotFound(format!("计划 {} 版本 {:?} 不存在", plan_id, version)))
    }

    pub fn list_versions(&self, plan_id: &str) -> ApiResult<Vec<u32>> {
        Ok(self.plan_repo.list_versions(plan_id)?)
    }

    pub fn event_history(&self, plan_id: &str) -> ApiResult<Vec<LoggedEvent>> {
        Ok(self.event_log_repo.list_by_plan(plan_id)?)
    }

    pub fn preemption_history(&self, plan_id: &str) -> ApiResult<Vec<PreemptionRecord>> {
        Ok(self.preemption_repo.list_by_plan(plan_id)?)
    }

    // ==========================================
    // 内部
    // ==========================================

    fn load_current(&self, plan_id: &str) -> ApiResult<(PlanHeader, Plan)> {
        let header = self
            .plan_repo
            .find_header(plan_id)?
            .ok_or_else(|| ApiError::NotFound(format!("计划 {} 不存在", plan_id)))?;
        let plan = self
            .plan_repo
            .find_version(plan_id, header.current_version)?
            .ok_or_else(|| ApiError::NotFound(format!("计划 {} 版本 {} 不存在", plan_id, header.current_version)))?;
        Ok((header, plan))
    }

    /// 沿用计划生成时固定的策略版本与请求模板
    fn resolve_objective(
        &self,
        header: &PlanHeader,
        snapshot: &PlanningSnapshot,
        now: DateTime<Utc>,
    ) -> ApiResult<ResolvedObjective> {
        let policy = match self.config_manager.objective_policy(header.objective_policy_version)? {
            Some(p) => p,
            None => {
                warn!(
                    policy_version = header.objective_policy_version,
                    "计划固定的策略版本不存在, 改用当前版本"
                );
                self.config_manager.current_objective_policy(now)?
            }
        };
        Ok(ObjectiveEngine::resolve(&policy, snapshot, now, header.request_template.as_ref()))
    }
}

fn fingerprint(request: &GeneratePlanRequest) -> ApiResult<String> {
    // 经 Value 中转, 对象键有序
    let value = serde_json::to_value(FingerprintInput {
        snapshot: &request.snapshot,
        config: &request.config,
    })
    .map_err(|e| ApiError::InvalidInput(format!("请求无法序列化: {}", e)))?;
    let digest = Sha256::digest(value.to_string().as_bytes());
    Ok(format!("{:x}", digest))
}

fn request_template(config: &GenerateConfig, policy: &ObjectivePolicy) -> ApiResult<Option<TemplateRef>> {
    if config.objective_template.is_none() && config.weight_overrides.is_none() {
        return Ok(None);
    }
    let template = TemplateRef {
        template: config.objective_template.unwrap_or(policy.global.template),
        overrides: config.weight_overrides.clone().unwrap_or_default(),
    };
    template.overrides.validate().map_err(ApiError::InvalidInput)?;
    Ok(Some(template))
}

fn generate_response(plan: &Plan, stats: Option<SolveStats>, replayed: bool) -> GeneratePlanResponse {
    GeneratePlanResponse {
        plan_id: plan.plan_id.clone(),
        version: plan.version,
        quality: plan.quality,
        optimality_proven: plan.optimality_proven,
        gates: plan.gate_summary.clone(),
        preparation_tasks: plan.assignments.clone(),
        makespan: plan.makespan,
        relaxed_constraints: plan.relaxed_constraints.clone(),
        stats,
        replayed,
    }
}

fn find_gate_id(snapshot: &PlanningSnapshot, prep_id: &str) -> Option<String> {
    if let Some(gate) = snapshot.gate(prep_id) {
        return Some(gate.gate_id.clone());
    }
    snapshot
        .gates
        .iter()
        .find(|g| matches!(&g.target, GateTarget::Task { task_id } if task_id == prep_id))
        .map(|g| g.gate_id.clone())
}

fn affected_work_packages(plan: &Plan, tasks: &[String]) -> Vec<String> {
    let mut ids: Vec<String> = tasks
        .iter()
        .filter_map(|t| plan.assignment(t).map(|a| a.work_package_id.clone()))
        .collect();
    ids.sort();
    ids.dedup();
    ids
}
