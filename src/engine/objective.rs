// ==========================================
// 维修准备排产系统 - 目标/优先级引擎
// ==========================================
// 职责: 按工作包解析模板权重, 计算四项目标与资源无关下界
// 目标项: SLA/截止超期 > 等待时间 > 切换成本 > 偏好/连续性
// ==========================================
// 红线: 策略版本由调用方显式传入; 灰度在建模前按工作包求值一次
// 红线: 加权结果统一放大 1000 倍取整, 下界与目标值用同一套整数口径
// ==========================================

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::objective_policy::{ObjectivePolicy, ObjectiveWeights, SelectionSource, TemplateRef};
use crate::domain::{PlanningSnapshot, TemplateSelection};
use crate::engine::model::{Minutes, ScheduleModel};

/// 偏好资源未命中的等效分钟
pub const PREFERENCE_MISS_MINUTES: i64 = 60;

const WEIGHT_SCALE: f64 = 1000.0;

/// 单工作包解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct WorkPackageObjective {
    pub weights: ObjectiveWeights,
    pub selection: TemplateSelection,
}

/// 本次求解使用的目标
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedObjective {
    pub policy_version: u32,
    pub per_work_package: BTreeMap<String, WorkPackageObjective>,
    pub fallback: ObjectiveWeights,
}

impl ResolvedObjective {
    pub fn weights_for(&self, work_package_id: &str) -> ObjectiveWeights {
        self.per_work_package
            .get(work_package_id)
            .map(|o| o.weights)
            .unwrap_or(self.fallback)
    }

    pub fn selections(&self) -> BTreeMap<String, TemplateSelection> {
        self.per_work_package
            .iter()
            .map(|(id, o)| (id.clone(), o.selection.clone()))
            .collect()
    }
}

// ==========================================
// ObjectiveEngine - 模板选择
// ==========================================
pub struct ObjectiveEngine;

impl ObjectiveEngine {
    /// 为快照中每个工作包选择模板
    ///
    /// request_template 非空时 (请求显式指定模板), 对本次请求的所有工作包生效
    pub fn resolve(
        policy: &ObjectivePolicy,
        snapshot: &PlanningSnapshot,
        at: DateTime<Utc>,
        request_template: Option<&TemplateRef>,
    ) -> ResolvedObjective {
        let mut per_work_package = BTreeMap::new();
        for wp in &snapshot.work_packages {
            let (template, source) = match request_template {
                Some(t) => (t.clone(), "REQUEST"),
                None => {
                    let (t, source) = policy.select_for(&wp.work_package_id, at);
                    (t, source.as_str())
                }
            };
            per_work_package.insert(
                wp.work_package_id.clone(),
                WorkPackageObjective {
                    weights: template.resolve(),
                    selection: TemplateSelection {
                        template: template.label(),
                        policy_version: policy.version,
                        source: source.to_string(),
                    },
                },
            );
        }
        let fallback = match request_template {
            Some(t) => t.resolve(),
            None => policy.select_for("", at).0.resolve(),
        };
        ResolvedObjective {
            policy_version: policy.version,
            per_work_package,
            fallback,
        }
    }

    /// 全局来源判断 (用于日志)
    pub fn is_uniform(resolved: &ResolvedObjective) -> bool {
        let mut sources = resolved.per_work_package.values().map(|o| o.selection.source.as_str());
        match sources.next() {
            Some(first) => first == SelectionSource::Global.as_str() && sources.all(|s| s == first),
            None => true,
        }
    }
}

// ==========================================
// ObjectiveScore - 目标值
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ObjectiveScore {
    /// 各项原始量 (分钟)
    pub sla_minutes: i64,
    pub wait_minutes: i64,
    pub switch_minutes: i64,
    pub preference_minutes: i64,
    /// 加权总值 (放大 1000 倍)
    pub total: i64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Terms {
    sla: i64,
    wait: i64,
    switch: i64,
    preference: i64,
}

/// 按模型任务索引的候选解
pub struct ScheduleView<'a> {
    pub starts: &'a [Minutes],
    pub ends: &'a [Minutes],
    pub modes: &'a [usize],
}

// ==========================================
// ObjectiveEvaluator - 目标计算
// ==========================================
pub struct ObjectiveEvaluator {
    /// 按模型工作包索引的整数权重 (sla, wait, switch, preference)
    scaled: Vec<[i64; 4]>,
}

impl ObjectiveEvaluator {
    pub fn new(model: &ScheduleModel, objective: &ResolvedObjective) -> Self {
        let scaled = model
            .work_packages
            .iter()
            .map(|wp| {
                let w = objective.weights_for(&wp.work_package_id);
                [
                    scale(w.sla_violation),
                    scale(w.wait_time),
                    scale(w.switch_cost),
                    scale(w.preference),
                ]
            })
            .collect();
        Self { scaled }
    }

    fn combine(&self, per_wp: &[Terms]) -> ObjectiveScore {
        let mut score = ObjectiveScore::default();
        for (w, t) in self.scaled.iter().zip(per_wp) {
            score.sla_minutes += t.sla;
            score.wait_minutes += t.wait;
            score.switch_minutes += t.switch;
            score.preference_minutes += t.preference;
            score.total += w[0] * t.sla + w[1] * t.wait + w[2] * t.switch + w[3] * t.preference;
        }
        score
    }

    /// 计算候选解目标值
    pub fn evaluate(&self, model: &ScheduleModel, view: &ScheduleView<'_>) -> ObjectiveScore {
        let mut per_wp = vec![Terms::default(); model.work_packages.len()];
        let mut wp_end: Vec<Option<Minutes>> = model.work_packages.iter().map(|w| w.frozen_end).collect();

        for (i, task) in model.tasks.iter().enumerate() {
            let terms = &mut per_wp[task.work_package];
            let start = view.starts[i];
            let end = view.ends[i];

            if let Some(soft) = task.soft_deadline {
                terms.sla += (end - soft).max(0);
            }

            let ready = model.preds[i]
                .iter()
                .map(|&p| view.ends[p])
                .fold(task.release(), Minutes::max);
            terms.wait += (start - ready).max(0);

            if !task.mode_hits_preference(view.modes[i]) {
                terms.preference += PREFERENCE_MISS_MINUTES;
            }
            if let Some(prior) = task.prior_start {
                terms.preference += (start - prior).abs();
            }

            let e = &mut wp_end[task.work_package];
            *e = Some(e.map_or(end, |x| x.max(end)));
        }

        for (w, wp) in model.work_packages.iter().enumerate() {
            if let Some(end) = wp_end[w] {
                per_wp[w].sla += (end - wp.deadline).max(0);
            }
        }

        for (wp, minutes) in switch_costs(model, view) {
            per_wp[wp].switch += minutes;
        }

        self.combine(&per_wp)
    }

    /// 资源无关下界: 以最早开工 + 最短工期估计不可避免的超期与偏离
    pub fn lower_bound(&self, model: &ScheduleModel, earliest_starts: &[Minutes]) -> ObjectiveScore {
        let mut per_wp = vec![Terms::default(); model.work_packages.len()];
        let mut wp_end: Vec<Option<Minutes>> = model.work_packages.iter().map(|w| w.frozen_end).collect();

        for (i, task) in model.tasks.iter().enumerate() {
            let terms = &mut per_wp[task.work_package];
            let es = earliest_starts[i];
            let ef = es + task.min_duration();
            if let Some(soft) = task.soft_deadline {
                terms.sla += (ef - soft).max(0);
            }
            if !task.preference_attainable() {
                terms.preference += PREFERENCE_MISS_MINUTES;
            }
            if let Some(prior) = task.prior_start {
                terms.preference += (es - prior).max(0);
            }
            let e = &mut wp_end[task.work_package];
            *e = Some(e.map_or(ef, |x| x.max(ef)));
        }
        for (w, wp) in model.work_packages.iter().enumerate() {
            if let Some(end) = wp_end[w] {
                per_wp[w].sla += (end - wp.deadline).max(0);
            }
        }
        self.combine(&per_wp)
    }
}

fn scale(weight: f64) -> i64 {
    (weight * WEIGHT_SCALE).round() as i64
}

/// 独占槽位上相邻作业的异地切换, 计入后一作业所属工作包
fn switch_costs(model: &ScheduleModel, view: &ScheduleView<'_>) -> Vec<(usize, i64)> {
    if model.switch_buffer == 0 {
        return Vec::new();
    }
    // (start, location, work_package, is_model_task)
    let mut per_slot: Vec<Vec<(Minutes, Option<usize>, Option<usize>, bool)>> = vec![Vec::new(); model.slots.len()];
    for (i, task) in model.tasks.iter().enumerate() {
        if view.ends[i] <= view.starts[i] {
            continue;
        }
        if let Some(mode) = task.modes.get(view.modes[i]) {
            for d in &mode.demands {
                if model.slots[d.slot].is_exclusive() {
                    per_slot[d.slot].push((view.starts[i], task.location, Some(task.work_package), true));
                }
            }
        }
    }
    for occ in model.fixed.iter().filter(|o| o.location.is_some()) {
        if model.slots[occ.slot].is_exclusive() {
            per_slot[occ.slot].push((occ.start, occ.location, occ.work_package, false));
        }
    }

    let mut costs = Vec::new();
    for mut seq in per_slot {
        seq.sort_by_key(|e| e.0);
        for pair in seq.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            let switched = matches!((prev.1, next.1), (Some(a), Some(b)) if a != b);
            if switched && (prev.3 || next.3) {
                if let Some(wp) = next.2.or(prev.2) {
                    costs.push((wp, model.switch_buffer));
                }
            }
        }
    }
    costs
}
