// ==========================================
// 维修准备排产系统 - 约束模型构建器
// ==========================================
// 职责: 把实体快照翻译成可求解的约束模型
// 输入: PlanningSnapshot + 冻结区间 + 构建选项
// 输出: ScheduleModel
// ==========================================
// 红线: 前置图有环时在求解前立即失败 (ModelError::CyclicDependency)
// 红线: 引用不存在的资源立即失败 (ModelError::UnknownResource)
// 红线: 门禁状态视为快照时刻的只读输入
// ==========================================

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::domain::types::{ConstraintRef, Criticality, TaskStatus};
use crate::domain::{PlanningSnapshot, PreparationTask, Resource, ResourceKind};
use crate::engine::error::ModelError;
use crate::engine::model::{
    Blocker, Demand, ExecutionMode, FixedOccupation, FrozenInterval, HardDeadline, Minutes,
    ModelTask, Precedence, Release, ResourceSlot, ScheduleModel, SegmentKind, SlotKind,
    WorkPackageModel,
};

/// 计划级建模参数 (随计划头保存, 重排沿用)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelSettings {
    pub prep_window_days: i64,
    pub switch_buffer_minutes: i64,
    pub freeze_inprogress: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            prep_window_days: 2,
            switch_buffer_minutes: 30,
            freeze_inprogress: true,
        }
    }
}

/// 构建选项
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub prep_window_days: i64,
    pub switch_buffer_minutes: i64,
    /// 快照中 IN_PROGRESS 的任务是否冻结在实际时间
    pub freeze_inprogress: bool,
    /// 上一版本带入的冻结区间
    pub frozen: Vec<FrozenInterval>,
    /// 上一版本的计划开工 (连续性偏好)
    pub prior_starts: HashMap<String, DateTime<Utc>>,
    /// 滚动窗口外任务的开工下界
    pub start_floors: HashMap<String, DateTime<Utc>>,
    /// 抢占预留: (抢占任务, 被抢占任务)
    pub reservations: Vec<(String, String)>,
    /// 未冻结任务的统一开工下界 (重排时为事件生效时刻)
    pub not_before: Option<DateTime<Utc>>,
    /// 计算有效优先级的时刻
    pub evaluation_time: DateTime<Utc>,
    pub is_replan: bool,
}

impl BuildOptions {
    pub fn new(evaluation_time: DateTime<Utc>) -> Self {
        Self::with_settings(evaluation_time, ModelSettings::default())
    }

    pub fn with_settings(evaluation_time: DateTime<Utc>, settings: ModelSettings) -> Self {
        Self {
            prep_window_days: settings.prep_window_days,
            switch_buffer_minutes: settings.switch_buffer_minutes,
            freeze_inprogress: settings.freeze_inprogress,
            frozen: Vec::new(),
            prior_starts: HashMap::new(),
            start_floors: HashMap::new(),
            reservations: Vec::new(),
            not_before: None,
            evaluation_time,
            is_replan: false,
        }
    }
}

/// 部分齐套拆分参数
struct PartialKit {
    fraction: f64,
    remainder_releases: Vec<Release>,
    remainder_blockers: Vec<Blocker>,
}

// ==========================================
// ConstraintModelBuilder
// ==========================================
pub struct ConstraintModelBuilder;

impl ConstraintModelBuilder {
    /// 构建约束模型
    #[instrument(skip(snapshot, options), fields(tasks = snapshot.tasks.len(), frozen = options.frozen.len()))]
    pub fn build(snapshot: &PlanningSnapshot, options: &BuildOptions) -> Result<ScheduleModel, ModelError> {
        validate_snapshot(snapshot)?;
        let domain_order = topological_sort(snapshot)?;

        let origin = snapshot.planning_start;
        let mut model = ScheduleModel {
            origin,
            tasks: Vec::new(),
            index: HashMap::new(),
            precedences: Vec::new(),
            preds: Vec::new(),
            succs: Vec::new(),
            topo_order: Vec::new(),
            slots: Vec::new(),
            fixed: Vec::new(),
            frozen: Vec::new(),
            work_packages: Vec::new(),
            locations: Vec::new(),
            switch_buffer: options.switch_buffer_minutes.max(0),
            is_replan: options.is_replan,
        };

        // ===== 槽位 =====
        let slot_of = build_slots(snapshot, &mut model.slots);

        // ===== 工作包 =====
        let window_end = origin + Duration::days(options.prep_window_days.max(0));
        for wp in &snapshot.work_packages {
            model.work_packages.push(WorkPackageModel {
                work_package_id: wp.work_package_id.clone(),
                priority: wp.effective_priority(options.evaluation_time),
                deadline: model.minutes_floor(wp.deadline.unwrap_or(window_end)),
                frozen_end: None,
            });
        }

        // ===== 日历屏蔽 =====
        for resource in snapshot.resources.iter().filter(|r| !r.is_material()) {
            let Some(&slot) = slot_of.get(&resource.resource_id) else { continue };
            for window in &resource.calendar {
                let start = model.minutes_floor(window.start);
                let end = model.minutes_ceil(window.end);
                if end <= 0 || end <= start {
                    continue;
                }
                model.fixed.push(FixedOccupation {
                    slot,
                    start,
                    end,
                    quantity: resource.capacity.max(1),
                    location: None,
                    work_package: None,
                    label: format!("calendar:{}", resource.resource_id),
                });
            }
        }

        // ===== 冻结区间 =====
        let frozen = collect_frozen(snapshot, options);
        let frozen_ids: HashSet<&str> = frozen.iter().map(|f| f.task_id.as_str()).collect();
        let mut frozen_end_by_task: HashMap<&str, Minutes> = HashMap::new();
        for interval in &frozen {
            let start = model.minutes_floor(interval.start);
            let end = model.minutes_ceil(interval.end);
            frozen_end_by_task.insert(interval.task_id.as_str(), end);
            let task = snapshot.task(&interval.task_id);
            let location = task
                .and_then(|t| t.location.as_deref())
                .map(|loc| intern_location(&mut model.locations, loc));
            let wp_index = model.work_package_index(&interval.work_package_id);
            if let Some(w) = wp_index {
                let wp = &mut model.work_packages[w];
                wp.frozen_end = Some(wp.frozen_end.map_or(end, |e| e.max(end)));
            }
            for resource_id in &interval.resources {
                let Some(&slot) = slot_of.get(resource_id) else { continue };
                let quantity = task
                    .and_then(|t| t.required_resources.iter().find(|r| &r.resource_id == resource_id))
                    .map(|r| if r.exclusive { model.slots[slot].capacity() } else { r.quantity })
                    .unwrap_or(1);
                model.fixed.push(FixedOccupation {
                    slot,
                    start,
                    end,
                    quantity: if model.slots[slot].is_exclusive() { 1 } else { quantity },
                    location,
                    work_package: wp_index,
                    label: format!("frozen:{}", interval.task_id),
                });
            }
        }

        // ===== 任务 =====
        let schedulable: Vec<&PreparationTask> = domain_order
            .iter()
            .filter_map(|id| snapshot.task(id))
            .filter(|t| t.status != TaskStatus::Cancelled && !frozen_ids.contains(t.task_id.as_str()))
            .collect();

        // 业务任务 → (首段, 末段)
        let mut span: HashMap<&str, (usize, usize)> = HashMap::new();

        for task in &schedulable {
            let Some(wp_index) = model.work_package_index(&task.work_package_id) else {
                return Err(ModelError::UnknownReference {
                    kind: "work_package".to_string(),
                    id: task.work_package_id.clone(),
                    referenced_by: task.task_id.clone(),
                });
            };
            let priority = model.work_packages[wp_index].priority;
            let location = task
                .location
                .as_deref()
                .map(|loc| intern_location(&mut model.locations, loc));

            let (modes, mut blockers) = build_modes(task, snapshot, &slot_of, &model.slots)?;

            // ----- 开工下界 -----
            let mut releases = Vec::new();
            if let Some(es) = task.earliest_start {
                releases.push(Release {
                    at: model.minutes_ceil(es),
                    source: ConstraintRef::EarliestStart { task_id: task.task_id.clone() },
                    relaxable: false,
                });
            }
            if let Some(eta) = task.manual_eta {
                releases.push(Release {
                    at: model.minutes_ceil(eta),
                    source: ConstraintRef::ManualEta { task_id: task.task_id.clone() },
                    relaxable: false,
                });
            }
            for pred in &task.predecessors {
                if let Some(&end) = frozen_end_by_task.get(pred.as_str()) {
                    releases.push(Release {
                        at: end,
                        source: ConstraintRef::Precedence {
                            predecessor: pred.clone(),
                            successor: task.task_id.clone(),
                        },
                        relaxable: false,
                    });
                }
            }
            if let Some(at) = options.not_before.filter(|at| *at > origin) {
                releases.push(Release {
                    at: model.minutes_ceil(at),
                    source: ConstraintRef::EarliestStart { task_id: task.task_id.clone() },
                    relaxable: false,
                });
            }
            if let Some(floor) = options.start_floors.get(&task.task_id) {
                releases.push(Release {
                    at: model.minutes_ceil(*floor),
                    source: ConstraintRef::RollingWindow { task_id: task.task_id.clone() },
                    relaxable: false,
                });
            }

            // ----- 门禁 -----
            for gate in snapshot.gates_blocking(task).filter(|g| !g.passed) {
                let source = ConstraintRef::Gate {
                    gate_id: gate.gate_id.clone(),
                    task_id: task.task_id.clone(),
                };
                match gate.resolution_eta {
                    Some(eta) => releases.push(Release {
                        at: model.minutes_ceil(eta),
                        source,
                        relaxable: false,
                    }),
                    None => blockers.push(Blocker {
                        source,
                        relaxable: false,
                        criticality: Criticality::High,
                    }),
                }
            }

            // ----- 航材 -----
            let (materials, partial) = apply_materials(task, snapshot, &model, &mut releases, &mut blockers);

            // ----- 时间窗 -----
            let hard_deadline = if task.has_hard_deadline() {
                task.latest_finish.map(|lf| HardDeadline {
                    at: model.minutes_floor(lf),
                    relaxable: task.relaxable,
                    criticality: task.criticality,
                })
            } else {
                None
            };
            let soft_deadline = if hard_deadline.is_none() {
                task.latest_finish.map(|lf| model.minutes_floor(lf))
            } else {
                None
            };
            let prior_start = options
                .prior_starts
                .get(&task.task_id)
                .map(|s| model.minutes_floor(*s));

            let base = ModelTask {
                key: task.task_id.clone(),
                task_id: task.task_id.clone(),
                work_package: wp_index,
                segment: SegmentKind::Whole,
                releases,
                blockers,
                hard_deadline,
                soft_deadline,
                modes,
                materials,
                location,
                priority,
                criticality: task.criticality,
                preferred: task.preferred_resources.clone(),
                prior_start,
            };

            match partial {
                Some(kit) if base.min_duration() >= 2 => {
                    let (first, second) = split_task(base, kit);
                    let a = push_task(&mut model, first);
                    let b = push_task(&mut model, second);
                    model.precedences.push(Precedence {
                        pred: a,
                        succ: b,
                        source: ConstraintRef::Precedence {
                            predecessor: model.tasks[a].key.clone(),
                            successor: model.tasks[b].key.clone(),
                        },
                    });
                    span.insert(task.task_id.as_str(), (a, b));
                }
                Some(kit) => {
                    // 工期过短不拆分, 整体等待到货
                    let mut whole = base;
                    whole.releases.extend(kit.remainder_releases);
                    whole.blockers.extend(kit.remainder_blockers);
                    let i = push_task(&mut model, whole);
                    span.insert(task.task_id.as_str(), (i, i));
                }
                None => {
                    let i = push_task(&mut model, base);
                    span.insert(task.task_id.as_str(), (i, i));
                }
            }
        }

        // ===== 前置关系 =====
        for task in &schedulable {
            let (first, _) = span[task.task_id.as_str()];
            for pred in &task.predecessors {
                if let Some(&(_, pred_last)) = span.get(pred.as_str()) {
                    model.precedences.push(Precedence {
                        pred: pred_last,
                        succ: first,
                        source: ConstraintRef::Precedence {
                            predecessor: pred.clone(),
                            successor: task.task_id.clone(),
                        },
                    });
                }
            }
        }
        for (preempting, preempted) in &options.reservations {
            let (Some(&(_, a_last)), Some(&(b_first, _))) =
                (span.get(preempting.as_str()), span.get(preempted.as_str()))
            else {
                continue;
            };
            model.precedences.push(Precedence {
                pred: a_last,
                succ: b_first,
                source: ConstraintRef::Reservation {
                    preempting_task: preempting.clone(),
                    preempted_task: preempted.clone(),
                },
            });
        }

        model.frozen = frozen;
        finalize_graph(&mut model)?;

        debug!(
            model_tasks = model.tasks.len(),
            slots = model.slots.len(),
            fixed = model.fixed.len(),
            "约束模型构建完成"
        );
        Ok(model)
    }
}

/// 快照中在指定时刻仍有效的预留 (抢占任务, 被抢占任务)
pub fn reservation_pairs(snapshot: &PlanningSnapshot, at: DateTime<Utc>) -> Vec<(String, String)> {
    snapshot
        .active_reservations(at)
        .map(|r| (r.preempting_task.clone(), r.preempted_task.clone()))
        .collect()
}

fn push_task(model: &mut ScheduleModel, task: ModelTask) -> usize {
    let i = model.tasks.len();
    model.index.insert(task.key.clone(), i);
    model.tasks.push(task);
    i
}

fn intern_location(locations: &mut Vec<String>, location: &str) -> usize {
    match locations.iter().position(|l| l == location) {
        Some(i) => i,
        None => {
            locations.push(location.to_string());
            locations.len() - 1
        }
    }
}

// ==========================================
// 校验
// ==========================================

/// 快照一致性校验 (标识唯一、引用存在、元数据合法)
pub fn validate_snapshot(snapshot: &PlanningSnapshot) -> Result<(), ModelError> {
    check_unique("work_package", snapshot.work_packages.iter().map(|w| w.work_package_id.as_str()))?;
    check_unique("task", snapshot.tasks.iter().map(|t| t.task_id.as_str()))?;
    check_unique("resource", snapshot.resources.iter().map(|r| r.resource_id.as_str()))?;
    check_unique("gate", snapshot.gates.iter().map(|g| g.gate_id.as_str()))?;

    for resource in &snapshot.resources {
        validate_resource(resource)?;
    }

    for task in &snapshot.tasks {
        if snapshot.work_package(&task.work_package_id).is_none() {
            return Err(ModelError::UnknownReference {
                kind: "work_package".to_string(),
                id: task.work_package_id.clone(),
                referenced_by: task.task_id.clone(),
            });
        }
        if task.base_duration_minutes < 0 {
            return Err(ModelError::InvalidMetadata {
                entity: "task".to_string(),
                id: task.task_id.clone(),
                message: format!("工期为负: {}", task.base_duration_minutes),
            });
        }
        for pred in &task.predecessors {
            if snapshot.task(pred).is_none() {
                return Err(ModelError::UnknownReference {
                    kind: "task".to_string(),
                    id: pred.clone(),
                    referenced_by: task.task_id.clone(),
                });
            }
        }
        for req in &task.required_resources {
            if snapshot.resource(&req.resource_id).is_none() {
                return Err(ModelError::UnknownResource {
                    task_id: task.task_id.clone(),
                    resource_id: req.resource_id.clone(),
                });
            }
            if req.quantity == 0 {
                return Err(ModelError::InvalidMetadata {
                    entity: "task".to_string(),
                    id: task.task_id.clone(),
                    message: format!("资源需求数量为0: {}", req.resource_id),
                });
            }
        }
        for preferred in &task.preferred_resources {
            if snapshot.resource(preferred).is_none() {
                return Err(ModelError::UnknownResource {
                    task_id: task.task_id.clone(),
                    resource_id: preferred.clone(),
                });
            }
        }
    }

    for gate in &snapshot.gates {
        let (kind, id) = match &gate.target {
            crate::domain::GateTarget::Task { task_id } => ("task", task_id),
            crate::domain::GateTarget::WorkPackage { work_package_id } => ("work_package", work_package_id),
        };
        let exists = match kind {
            "task" => snapshot.task(id).is_some(),
            _ => snapshot.work_package(id).is_some(),
        };
        if !exists {
            return Err(ModelError::UnknownReference {
                kind: kind.to_string(),
                id: id.clone(),
                referenced_by: gate.gate_id.clone(),
            });
        }
    }
    Ok(())
}

fn check_unique<'a>(kind: &str, ids: impl Iterator<Item = &'a str>) -> Result<(), ModelError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ModelError::DuplicateId {
                kind: kind.to_string(),
                id: id.to_string(),
            });
        }
    }
    Ok(())
}

fn validate_resource(resource: &Resource) -> Result<(), ModelError> {
    let invalid = |message: String| ModelError::InvalidMetadata {
        entity: "resource".to_string(),
        id: resource.resource_id.clone(),
        message,
    };
    if !resource.is_material() && resource.capacity == 0 {
        return Err(invalid("容量为0".to_string()));
    }
    if let ResourceKind::Human { performance_factors, .. } = &resource.kind {
        for (job, factor) in performance_factors {
            if !factor.is_finite() || *factor <= 0.0 {
                return Err(invalid(format!("绩效系数无效: {}={}", job, factor)));
            }
        }
    }
    for window in &resource.calendar {
        if window.end < window.start {
            return Err(invalid("不可用时段结束早于开始".to_string()));
        }
    }
    Ok(())
}

// ==========================================
// 拓扑排序 (Kahn) 与环检测
// ==========================================

/// 对全部非取消任务做拓扑排序, 有环时返回环上任务
pub fn topological_sort(snapshot: &PlanningSnapshot) -> Result<Vec<String>, ModelError> {
    let ids: Vec<&str> = snapshot
        .tasks
        .iter()
        .filter(|t| t.status != TaskStatus::Cancelled)
        .map(|t| t.task_id.as_str())
        .collect();
    let live: HashSet<&str> = ids.iter().copied().collect();

    let mut in_degree: HashMap<&str, usize> = ids.iter().map(|id| (*id, 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut predecessors: HashMap<&str, Vec<&str>> = HashMap::new();
    for task in snapshot.tasks.iter().filter(|t| live.contains(t.task_id.as_str())) {
        let preds: BTreeSet<&str> = task
            .predecessors
            .iter()
            .map(|p| p.as_str())
            .filter(|p| live.contains(p))
            .collect();
        for pred in preds {
            successors.entry(pred).or_default().push(task.task_id.as_str());
            predecessors.entry(task.task_id.as_str()).or_default().push(pred);
            *in_degree.entry(task.task_id.as_str()).or_insert(0) += 1;
        }
    }

    let mut queue: VecDeque<&str> = ids.iter().copied().filter(|id| in_degree[id] == 0).collect();
    let mut order = Vec::with_capacity(ids.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        if let Some(succs) = successors.get(id) {
            for succ in succs {
                if let Some(d) = in_degree.get_mut(succ) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(succ);
                    }
                }
            }
        }
    }

    if order.len() == ids.len() {
        return Ok(order);
    }

    let remaining: HashSet<&str> = ids
        .iter()
        .copied()
        .filter(|id| in_degree.get(id).copied().unwrap_or(0) > 0)
        .collect();
    Err(ModelError::CyclicDependency {
        cycle: find_cycle(&ids, &remaining, &predecessors),
    })
}

/// 沿前置方向回溯, 直到遇到已访问节点
fn find_cycle(
    ids: &[&str],
    remaining: &HashSet<&str>,
    predecessors: &HashMap<&str, Vec<&str>>,
) -> Vec<String> {
    let Some(start) = ids.iter().copied().find(|id| remaining.contains(id)) else {
        return Vec::new();
    };
    let mut path: Vec<&str> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut current = start;
    loop {
        if let Some(&pos) = position.get(current) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.reverse();
            return cycle;
        }
        position.insert(current, path.len());
        path.push(current);
        let next = predecessors
            .get(current)
            .and_then(|preds| preds.iter().copied().find(|p| remaining.contains(p)));
        match next {
            Some(p) => current = p,
            None => return path.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// 模型任务的前驱/后继邻接表与拓扑序
fn finalize_graph(model: &mut ScheduleModel) -> Result<(), ModelError> {
    let n = model.tasks.len();
    model.preds = vec![Vec::new(); n];
    model.succs = vec![Vec::new(); n];
    for p in &model.precedences {
        if !model.succs[p.pred].contains(&p.succ) {
            model.succs[p.pred].push(p.succ);
            model.preds[p.succ].push(p.pred);
        }
    }

    let mut in_degree: Vec<usize> = model.preds.iter().map(|p| p.len()).collect();
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(i) = queue.pop_front() {
        order.push(i);
        for &s in &model.succs[i] {
            in_degree[s] -= 1;
            if in_degree[s] == 0 {
                queue.push_back(s);
            }
        }
    }
    if order.len() != n {
        // 只有预留边会在这里引入环
        let cycle = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| model.tasks[i].key.clone())
            .collect();
        return Err(ModelError::CyclicDependency { cycle });
    }
    model.topo_order = order;
    Ok(())
}

// ==========================================
// 槽位 / 冻结 / 执行模式 / 航材
// ==========================================

fn build_slots(snapshot: &PlanningSnapshot, slots: &mut Vec<ResourceSlot>) -> HashMap<String, usize> {
    let mut slot_of = HashMap::new();
    let mut group_slot: HashMap<String, usize> = HashMap::new();
    for resource in snapshot.resources.iter().filter(|r| !r.is_material()) {
        if let Some(group) = resource.exclusive_group() {
            let idx = *group_slot.entry(group.to_string()).or_insert_with(|| {
                slots.push(ResourceSlot {
                    key: format!("group:{}", group),
                    kind: SlotKind::Exclusive,
                    members: Vec::new(),
                });
                slots.len() - 1
            });
            slots[idx].members.push(resource.resource_id.clone());
            slot_of.insert(resource.resource_id.clone(), idx);
            continue;
        }
        let kind = if resource.is_exclusive() {
            SlotKind::Exclusive
        } else {
            SlotKind::Cumulative { capacity: resource.capacity }
        };
        slots.push(ResourceSlot {
            key: resource.resource_id.clone(),
            kind,
            members: vec![resource.resource_id.clone()],
        });
        slot_of.insert(resource.resource_id.clone(), slots.len() - 1);
    }
    slot_of
}

/// 合并显式冻结区间与快照中已开工任务
fn collect_frozen(snapshot: &PlanningSnapshot, options: &BuildOptions) -> Vec<FrozenInterval> {
    let mut frozen = options.frozen.clone();
    let known: HashSet<String> = frozen.iter().map(|f| f.task_id.clone()).collect();
    for task in &snapshot.tasks {
        if known.contains(&task.task_id) {
            continue;
        }
        let freeze = match task.status {
            TaskStatus::Completed => true,
            TaskStatus::InProgress => options.freeze_inprogress,
            _ => false,
        };
        if !freeze {
            continue;
        }
        let duration = Duration::minutes(task.base_duration_minutes);
        let start = task
            .actual_start
            .or_else(|| task.actual_end.map(|end| end - duration))
            .unwrap_or(snapshot.planning_start);
        let end = task.actual_end.unwrap_or(start + duration).max(start);
        frozen.push(FrozenInterval {
            task_id: task.task_id.clone(),
            work_package_id: task.work_package_id.clone(),
            start,
            end,
            resources: frozen_resources(task, snapshot),
            status: task.status,
        });
    }
    frozen
}

/// 已开工任务占用的资源: 显式需求 + 实际分配 (缺省时取首个具备资质的人员)
fn frozen_resources(task: &PreparationTask, snapshot: &PlanningSnapshot) -> Vec<String> {
    let mut resources: Vec<String> = task.required_resources.iter().map(|r| r.resource_id.clone()).collect();
    for id in &task.assigned_resources {
        if !resources.contains(id) {
            resources.push(id.clone());
        }
    }
    let has_human = resources
        .iter()
        .filter_map(|id| snapshot.resource(id))
        .any(|r| matches!(r.kind, ResourceKind::Human { .. }));
    if !has_human && !task.required_qualifications.is_empty() {
        let crew = snapshot
            .resources
            .iter()
            .filter(|r| r.has_qualifications(&task.required_qualifications))
            .min_by(|a, b| a.resource_id.cmp(&b.resource_id));
        if let Some(human) = crew {
            debug!(task_id = %task.task_id, resource_id = %human.resource_id, "已开工任务未记录人员, 按资质占用");
            resources.push(human.resource_id.clone());
        }
    }
    resources
}

fn build_modes(
    task: &PreparationTask,
    snapshot: &PlanningSnapshot,
    slot_of: &HashMap<String, usize>,
    slots: &[ResourceSlot],
) -> Result<(Vec<ExecutionMode>, Vec<Blocker>), ModelError> {
    let mut fixed: Vec<Demand> = Vec::new();
    let mut explicit_humans: Vec<&Resource> = Vec::new();
    for req in &task.required_resources {
        let Some(resource) = snapshot.resource(&req.resource_id) else {
            return Err(ModelError::UnknownResource {
                task_id: task.task_id.clone(),
                resource_id: req.resource_id.clone(),
            });
        };
        if resource.is_material() {
            continue;
        }
        if matches!(resource.kind, ResourceKind::Human { .. }) {
            explicit_humans.push(resource);
        }
        let Some(&slot) = slot_of.get(&req.resource_id) else { continue };
        let quantity = if slots[slot].is_exclusive() {
            1
        } else if req.exclusive {
            slots[slot].capacity()
        } else {
            req.quantity
        };
        merge_demand(&mut fixed, slots, Demand { slot, resource_id: req.resource_id.clone(), quantity });
    }

    // 人员候选
    let mut crews: Vec<Vec<&Resource>> = Vec::new();
    if task.required_qualifications.is_empty() {
        crews.push(explicit_humans.clone());
    } else if !explicit_humans.is_empty() {
        if let Some(unqualified) = explicit_humans
            .iter()
            .find(|h| !h.has_qualifications(&task.required_qualifications))
        {
            debug!(task_id = %task.task_id, resource_id = %unqualified.resource_id, "指定人员资质不足");
            return Err(ModelError::MissingQualification {
                task_id: task.task_id.clone(),
                qualifications: task.required_qualifications.clone(),
            });
        }
        crews.push(explicit_humans.clone());
    } else {
        let mut candidates: Vec<&Resource> = snapshot
            .resources
            .iter()
            .filter(|r| r.has_qualifications(&task.required_qualifications))
            .collect();
        candidates.sort_by(|a, b| a.resource_id.cmp(&b.resource_id));
        if candidates.is_empty() {
            return Err(ModelError::MissingQualification {
                task_id: task.task_id.clone(),
                qualifications: task.required_qualifications.clone(),
            });
        }
        for candidate in candidates {
            crews.push(vec![candidate]);
        }
    }

    let mut modes = Vec::new();
    let mut blockers = Vec::new();
    let mut over_capacity: Option<String> = None;
    for crew in crews {
        let mut demands = fixed.clone();
        for human in &crew {
            if let Some(&slot) = slot_of.get(&human.resource_id) {
                if !demands.iter().any(|d| d.resource_id == human.resource_id) {
                    merge_demand(
                        &mut demands,
                        slots,
                        Demand { slot, resource_id: human.resource_id.clone(), quantity: 1 },
                    );
                }
            }
        }
        if let Some(d) = demands.iter().find(|d| d.quantity > slots[d.slot].capacity()) {
            over_capacity.get_or_insert_with(|| d.resource_id.clone());
            continue;
        }
        let factor = crew
            .iter()
            .map(|h| h.performance_factor(task.job_type.as_deref()))
            .fold(f64::INFINITY, f64::min);
        let duration = if factor.is_finite() {
            (task.base_duration_minutes as f64 / factor).ceil() as Minutes
        } else {
            task.base_duration_minutes
        };
        modes.push(ExecutionMode { duration, demands });
    }

    if modes.is_empty() {
        let resource_id = over_capacity.unwrap_or_default();
        blockers.push(Blocker {
            source: ConstraintRef::Capacity { resource_id, task_id: task.task_id.clone() },
            relaxable: false,
            criticality: Criticality::High,
        });
        // 保留一个无资源模式, 仅供解释使用; 求解前会因 blocker 被拒绝
        modes.push(ExecutionMode { duration: task.base_duration_minutes, demands: Vec::new() });
    }
    Ok((modes, blockers))
}

fn merge_demand(demands: &mut Vec<Demand>, slots: &[ResourceSlot], demand: Demand) {
    if let Some(existing) = demands.iter_mut().find(|d| d.slot == demand.slot) {
        // 同一独占组内的多个成员共用一个槽位, 不累加
        if !slots[demand.slot].is_exclusive() {
            existing.quantity += demand.quantity;
        }
        return;
    }
    demands.push(demand);
}

/// 航材约束: 齐套下界 / 缺料阻断 / 部分齐套拆分
fn apply_materials(
    task: &PreparationTask,
    snapshot: &PlanningSnapshot,
    model: &ScheduleModel,
    releases: &mut Vec<Release>,
    blockers: &mut Vec<Blocker>,
) -> (Vec<String>, Option<PartialKit>) {
    let mut materials = Vec::new();
    let mut partial: Option<PartialKit> = None;

    for req in &task.required_resources {
        let Some(resource) = snapshot.resource(&req.resource_id) else { continue };
        let ResourceKind::Material { must_kit, allow_partial, available_quantity, eta } = &resource.kind else {
            continue;
        };
        materials.push(req.resource_id.clone());

        let shortage = *available_quantity < req.quantity;
        // 必须齐套是硬约束, 不参与松弛
        let relaxable = !*must_kit && req.criticality == Criticality::Low;
        let source = ConstraintRef::MaterialKit {
            task_id: task.task_id.clone(),
            resource_id: req.resource_id.clone(),
        };
        let eta_release = eta.map(|e| Release { at: model.minutes_ceil(e), source: source.clone(), relaxable });
        let blocker = Blocker { source: source.clone(), relaxable, criticality: req.criticality };

        if *allow_partial && shortage && *available_quantity > 0 {
            let fraction = *available_quantity as f64 / req.quantity as f64;
            let kit = partial.get_or_insert(PartialKit {
                fraction,
                remainder_releases: Vec::new(),
                remainder_blockers: Vec::new(),
            });
            kit.fraction = kit.fraction.min(fraction);
            match eta_release {
                Some(r) => kit.remainder_releases.push(r),
                None => kit.remainder_blockers.push(blocker),
            }
            continue;
        }

        if *must_kit || *allow_partial {
            // 必须齐套: 开工 >= max(ETA, 全量可用时刻)
            match (shortage, eta_release) {
                (_, Some(r)) => releases.push(r),
                (true, None) => blockers.push(blocker),
                (false, None) => {}
            }
        }
    }
    (materials, partial)
}

/// 拆分为 #partial / #rest 两段
fn split_task(base: ModelTask, kit: PartialKit) -> (ModelTask, ModelTask) {
    let fraction = kit.fraction.clamp(0.0, 1.0);
    let mut first = base.clone();
    let mut second = base;

    first.key = format!("{}#partial", first.task_id);
    first.segment = SegmentKind::Partial { fraction };
    first.hard_deadline = None;
    first.soft_deadline = None;

    second.key = format!("{}#rest", second.task_id);
    second.segment = SegmentKind::Remainder { fraction: 1.0 - fraction };
    second.prior_start = None;
    second.preferred = Vec::new();
    second.releases.extend(kit.remainder_releases);
    second.blockers.extend(kit.remainder_blockers);

    for (m1, m2) in first.modes.iter_mut().zip(second.modes.iter_mut()) {
        let total = m1.duration;
        let head = ((total as f64 * fraction).ceil() as Minutes).clamp(1, total - 1);
        m1.duration = head;
        m2.duration = total - head;
    }
    (first, second)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Gate, GateTarget, GateType, ResourceRequirement, WorkPackage};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    fn snapshot(tasks: Vec<PreparationTask>, resources: Vec<Resource>) -> PlanningSnapshot {
        PlanningSnapshot {
            planning_start: t0(),
            work_packages: vec![WorkPackage::new("WP1", 1)],
            tasks,
            resources,
            gates: vec![],
            reservations: vec![],
        }
    }

    #[test]
    fn test_cycle_detected_before_solve() {
        let mut a = PreparationTask::new("A", "WP1", 10);
        let mut b = PreparationTask::new("B", "WP1", 10);
        let mut c = PreparationTask::new("C", "WP1", 10);
        a.predecessors = vec!["C".into()];
        b.predecessors = vec!["A".into()];
        c.predecessors = vec!["B".into()];
        let snap = snapshot(vec![a, b, c], vec![]);

        match ConstraintModelBuilder::build(&snap, &BuildOptions::new(t0())) {
            Err(ModelError::CyclicDependency { cycle }) => {
                assert_eq!(cycle.len(), 3);
                for id in ["A", "B", "C"] {
                    assert!(cycle.iter().any(|c| c == id));
                }
            }
            other => panic!("应检测到环, 实际: {:?}", other.map(|m| m.tasks.len())),
        }
    }

    #[test]
    fn test_unknown_resource_rejected() {
        let mut a = PreparationTask::new("A", "WP1", 10);
        a.required_resources.push(ResourceRequirement::new("CRANE-9", 1));
        let snap = snapshot(vec![a], vec![]);
        let err = ConstraintModelBuilder::build(&snap, &BuildOptions::new(t0())).unwrap_err();
        assert_eq!(
            err,
            ModelError::UnknownResource { task_id: "A".into(), resource_id: "CRANE-9".into() }
        );
    }

    #[test]
    fn test_qualified_humans_become_alternative_modes() {
        let mut fast = Resource::human("TECH-FAST", 1, &["borescope"]);
        if let ResourceKind::Human { performance_factors, .. } = &mut fast.kind {
            performance_factors.insert("inspection".into(), 2.0);
        }
        let slow = Resource::human("TECH-SLOW", 1, &["borescope"]);
        let other = Resource::human("TECH-NDT", 1, &["ndt"]);

        let mut task = PreparationTask::new("A", "WP1", 90);
        task.job_type = Some("inspection".into());
        task.required_qualifications = vec!["borescope".into()];
        let snap = snapshot(vec![task], vec![fast, slow, other]);

        let model = ConstraintModelBuilder::build(&snap, &BuildOptions::new(t0())).unwrap();
        let durations: Vec<i64> = model.tasks[0].modes.iter().map(|m| m.duration).collect();
        assert_eq!(durations, vec![45, 90]);
    }

    #[test]
    fn test_missing_qualification() {
        let mut task = PreparationTask::new("A", "WP1", 90);
        task.required_qualifications = vec!["x-ray".into()];
        let snap = snapshot(vec![task], vec![Resource::human("TECH-1", 1, &["ndt"])]);
        assert!(matches!(
            ConstraintModelBuilder::build(&snap, &BuildOptions::new(t0())),
            Err(ModelError::MissingQualification { .. })
        ));
    }

    #[test]
    fn test_exclusive_group_shares_one_slot() {
        let c1 = Resource::equipment("CRANE-1", false, Some("BAY-A-CRANES"));
        let c2 = Resource::equipment("CRANE-2", false, Some("BAY-A-CRANES"));
        let mut a = PreparationTask::new("A", "WP1", 30);
        a.required_resources.push(ResourceRequirement::new("CRANE-1", 1));
        let mut b = PreparationTask::new("B", "WP1", 30);
        b.required_resources.push(ResourceRequirement::new("CRANE-2", 1));
        let snap = snapshot(vec![a, b], vec![c1, c2]);

        let model = ConstraintModelBuilder::build(&snap, &BuildOptions::new(t0())).unwrap();
        assert_eq!(model.slots.len(), 1);
        assert_eq!(model.tasks[0].modes[0].demands[0].slot, model.tasks[1].modes[0].demands[0].slot);
    }

    #[test]
    fn test_gate_without_eta_blocks_and_with_eta_releases() {
        let mut gate_task = PreparationTask::new("G-TASK", "WP1", 0);
        gate_task.is_gate = true;
        let mut after = PreparationTask::new("AFTER", "WP1", 30);
        after.predecessors = vec!["G-TASK".into()];
        let mut snap = snapshot(vec![gate_task, after], vec![]);
        snap.gates.push(Gate::new(
            "G1",
            GateType::CriticalToolsReady,
            GateTarget::Task { task_id: "G-TASK".into() },
        ));

        let model = ConstraintModelBuilder::build(&snap, &BuildOptions::new(t0())).unwrap();
        let after_task = model.task_by_key("AFTER").unwrap();
        assert_eq!(after_task.blockers.len(), 1);

        snap.gates[0].resolution_eta = Some(t0() + Duration::hours(6));
        let model = ConstraintModelBuilder::build(&snap, &BuildOptions::new(t0())).unwrap();
        let after_task = model.task_by_key("AFTER").unwrap();
        assert!(after_task.blockers.is_empty());
        assert_eq!(after_task.release(), 360);
    }

    #[test]
    fn test_frozen_task_occupies_assigned_technician() {
        let mut running = PreparationTask::new("A", "WP1", 120);
        running.required_qualifications = vec!["borescope".into()];
        running.status = TaskStatus::InProgress;
        running.actual_start = Some(t0());
        running.assigned_resources = vec!["TECH-2".into()];
        let snap = snapshot(
            vec![running],
            vec![
                Resource::human("TECH-1", 1, &["borescope"]),
                Resource::human("TECH-2", 1, &["borescope"]),
            ],
        );

        let model = ConstraintModelBuilder::build(&snap, &BuildOptions::new(t0())).unwrap();
        assert_eq!(model.frozen[0].resources, vec!["TECH-2".to_string()]);
        let occupied: Vec<&str> = model
            .fixed
            .iter()
            .filter(|f| f.label == "frozen:A")
            .map(|f| model.slots[f.slot].key.as_str())
            .collect();
        assert_eq!(occupied, vec!["TECH-2"]);
    }

    #[test]
    fn test_must_kit_blocker_never_relaxable() {
        let mut a = PreparationTask::new("A", "WP1", 60);
        let mut req = ResourceRequirement::new("SEAL-KIT", 5);
        req.criticality = Criticality::Low;
        a.required_resources.push(req);
        let snap = snapshot(vec![a], vec![Resource::material("SEAL-KIT", 3, true)]);

        let mut model = ConstraintModelBuilder::build(&snap, &BuildOptions::new(t0())).unwrap();
        let source = ConstraintRef::MaterialKit { task_id: "A".into(), resource_id: "SEAL-KIT".into() };
        assert_eq!(model.tasks[0].blockers.len(), 1);
        assert!(!model.tasks[0].blockers[0].relaxable);
        assert!(model.relax(&[source]).is_empty());
        assert_eq!(model.tasks[0].blockers.len(), 1);
    }

    #[test]
    fn test_partial_kit_splits_task() {
        let mut kit = Resource::material("SEAL-KIT", 2, true);
        if let ResourceKind::Material { allow_partial, eta, .. } = &mut kit.kind {
            *allow_partial = true;
            *eta = Some(t0() + Duration::hours(10));
        }
        let mut a = PreparationTask::new("A", "WP1", 100);
        a.required_resources.push(ResourceRequirement::new("SEAL-KIT", 4));
        let mut b = PreparationTask::new("B", "WP1", 10);
        b.predecessors = vec!["A".into()];
        let snap = snapshot(vec![a, b], vec![kit]);

        let model = ConstraintModelBuilder::build(&snap, &BuildOptions::new(t0())).unwrap();
        let head = model.task_by_key("A#partial").unwrap();
        let rest = model.task_by_key("A#rest").unwrap();
        assert_eq!(head.modes[0].duration, 50);
        assert_eq!(rest.modes[0].duration, 50);
        assert_eq!(head.release(), 0);
        assert_eq!(rest.release(), 600);

        // B 接在剩余段之后
        let b_idx = model.index["B"];
        let rest_idx = model.index["A#rest"];
        assert_eq!(model.preds[b_idx], vec![rest_idx]);
    }
}
