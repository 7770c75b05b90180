// ==========================================
// 维修准备排产系统 - 约束模型
// ==========================================
// 职责: 建模器的输出, 求解器的输入
// 时间单位: 相对 origin (快照 planning_start) 的整数分钟
// ==========================================
// 约束组成:
// - 任务区间 (start, end, duration), 执行模式 = 可选人员 × 绩效工期
// - 前置关系 end(p) <= start(s)
// - 下界 (最早开工/人工ETA/门禁/齐套/冻结前置/滚动窗口)
// - 独占槽位 (no-overlap + 异地切换缓冲) / 累积槽位 (容量)
// - 固定占用 (日历屏蔽/冻结区间)
// ==========================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::domain::types::{ConstraintRef, Criticality, TaskStatus};
use crate::domain::RelaxedConstraint;

pub type Minutes = i64;

/// 无截止时的远期哨兵
pub const FAR_FUTURE: Minutes = i64::MAX / 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    Exclusive,
    Cumulative { capacity: u32 },
}

/// 资源槽位 (独占组的全部成员共享一个槽位)
#[derive(Debug, Clone)]
pub struct ResourceSlot {
    pub key: String,
    pub kind: SlotKind,
    pub members: Vec<String>,
}

impl ResourceSlot {
    pub fn is_exclusive(&self) -> bool {
        matches!(self.kind, SlotKind::Exclusive)
    }

    pub fn capacity(&self) -> u32 {
        match self.kind {
            SlotKind::Exclusive => 1,
            SlotKind::Cumulative { capacity } => capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Demand {
    pub slot: usize,
    pub resource_id: String,
    pub quantity: u32,
}

/// 执行模式 (同一任务的可选人员组合)
#[derive(Debug, Clone)]
pub struct ExecutionMode {
    pub duration: Minutes,
    pub demands: Vec<Demand>,
}

impl ExecutionMode {
    pub fn resource_ids(&self) -> impl Iterator<Item = &str> {
        self.demands.iter().map(|d| d.resource_id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SegmentKind {
    Whole,
    /// 部分齐套先行段
    Partial { fraction: f64 },
    /// 到货后的剩余段
    Remainder { fraction: f64 },
}

/// 开工下界
#[derive(Debug, Clone, PartialEq)]
pub struct Release {
    pub at: Minutes,
    pub source: ConstraintRef,
    pub relaxable: bool,
}

/// 无界下界 (门禁无ETA / 缺料无ETA / 需求超容量), 求解时拒绝
#[derive(Debug, Clone, PartialEq)]
pub struct Blocker {
    pub source: ConstraintRef,
    pub relaxable: bool,
    pub criticality: Criticality,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HardDeadline {
    pub at: Minutes,
    pub relaxable: bool,
    pub criticality: Criticality,
}

#[derive(Debug, Clone)]
pub struct ModelTask {
    /// 模型内键 (部分齐套拆分时带 #partial / #rest 后缀)
    pub key: String,
    pub task_id: String,
    pub work_package: usize,
    pub segment: SegmentKind,
    pub releases: Vec<Release>,
    pub blockers: Vec<Blocker>,
    pub hard_deadline: Option<HardDeadline>,
    pub soft_deadline: Option<Minutes>,
    pub modes: Vec<ExecutionMode>,
    /// 航材 (不占时间槽位, 仅计入分配结果)
    pub materials: Vec<String>,
    pub location: Option<usize>,
    pub priority: u32,
    pub criticality: Criticality,
    pub preferred: Vec<String>,
    pub prior_start: Option<Minutes>,
}

impl ModelTask {
    pub fn release(&self) -> Minutes {
        self.releases.iter().map(|r| r.at).max().unwrap_or(0).max(0)
    }

    /// 起决定作用的下界
    pub fn binding_release(&self) -> Option<&Release> {
        self.releases.iter().filter(|r| r.at > 0).max_by_key(|r| r.at)
    }

    pub fn min_duration(&self) -> Minutes {
        self.modes.iter().map(|m| m.duration).min().unwrap_or(0)
    }

    /// 是否存在满足偏好资源的执行模式
    pub fn preference_attainable(&self) -> bool {
        self.preferred.is_empty()
            || self
                .modes
                .iter()
                .any(|m| m.resource_ids().any(|r| self.preferred.iter().any(|p| p == r)))
    }

    pub fn mode_hits_preference(&self, mode: usize) -> bool {
        self.preferred.is_empty()
            || self.modes.get(mode).map_or(false, |m| {
                m.resource_ids().any(|r| self.preferred.iter().any(|p| p == r))
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Precedence {
    pub pred: usize,
    pub succ: usize,
    pub source: ConstraintRef,
}

/// 固定占用 (日历/冻结/预留)
#[derive(Debug, Clone, PartialEq)]
pub struct FixedOccupation {
    pub slot: usize,
    pub start: Minutes,
    pub end: Minutes,
    pub quantity: u32,
    pub location: Option<usize>,
    pub work_package: Option<usize>,
    pub label: String,
}

/// 冻结区间 (来自上一版本, 原样带入)
#[derive(Debug, Clone, PartialEq)]
pub struct FrozenInterval {
    pub task_id: String,
    pub work_package_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub resources: Vec<String>,
    pub status: TaskStatus,
}

#[derive(Debug, Clone)]
pub struct WorkPackageModel {
    pub work_package_id: String,
    pub priority: u32,
    /// SLA (软), 未配置时为准备窗口末端
    pub deadline: Minutes,
    /// 冻结任务的最晚完工
    pub frozen_end: Option<Minutes>,
}

/// 约束模型
#[derive(Debug, Clone)]
pub struct ScheduleModel {
    pub origin: DateTime<Utc>,
    pub tasks: Vec<ModelTask>,
    pub index: HashMap<String, usize>,
    pub precedences: Vec<Precedence>,
    pub preds: Vec<Vec<usize>>,
    pub succs: Vec<Vec<usize>>,
    pub topo_order: Vec<usize>,
    pub slots: Vec<ResourceSlot>,
    pub fixed: Vec<FixedOccupation>,
    pub frozen: Vec<FrozenInterval>,
    pub work_packages: Vec<WorkPackageModel>,
    pub locations: Vec<String>,
    pub switch_buffer: Minutes,
    pub is_replan: bool,
}

impl ScheduleModel {
    /// 下界取整: 向上取整到分钟, 保证不早于真实时间
    pub fn minutes_ceil(&self, at: DateTime<Utc>) -> Minutes {
        let secs = (at - self.origin).num_seconds();
        secs.div_euclid(60) + if secs.rem_euclid(60) > 0 { 1 } else { 0 }
    }

    /// 上界取整: 向下取整到分钟
    pub fn minutes_floor(&self, at: DateTime<Utc>) -> Minutes {
        (at - self.origin).num_seconds().div_euclid(60)
    }

    pub fn to_datetime(&self, minutes: Minutes) -> DateTime<Utc> {
        self.origin + Duration::minutes(minutes)
    }

    pub fn task_by_key(&self, key: &str) -> Option<&ModelTask> {
        self.index.get(key).map(|&i| &self.tasks[i])
    }

    /// 同一业务任务的全部模型段
    pub fn parts_of(&self, task_id: &str) -> Vec<usize> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.task_id == task_id)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn work_package_index(&self, work_package_id: &str) -> Option<usize> {
        self.work_packages
            .iter()
            .position(|w| w.work_package_id == work_package_id)
    }

    /// 资源无关的最早开工 (前向传播)
    pub fn earliest_starts(&self) -> Vec<Minutes> {
        let mut es: Vec<Minutes> = self.tasks.iter().map(|t| t.release()).collect();
        for &i in &self.topo_order {
            let finish = es[i] + self.tasks[i].min_duration();
            for &s in &self.succs[i] {
                if finish > es[s] {
                    es[s] = finish;
                }
            }
        }
        es
    }

    /// 资源无关的最晚开工 (后向传播, 以硬/软截止与工作包 SLA 为上界)
    pub fn latest_starts(&self) -> Vec<Minutes> {
        let n = self.tasks.len();
        let mut lf: Vec<Minutes> = (0..n)
            .map(|i| {
                let t = &self.tasks[i];
                let mut bound = self.work_packages[t.work_package].deadline;
                if let Some(h) = &t.hard_deadline {
                    bound = bound.min(h.at);
                }
                if let Some(s) = t.soft_deadline {
                    bound = bound.min(s);
                }
                bound
            })
            .collect();
        for &i in self.topo_order.iter().rev() {
            for &s in &self.succs[i] {
                let succ_ls = lf[s] - self.tasks[s].min_duration();
                if succ_ls < lf[i] {
                    lf[i] = succ_ls;
                }
            }
        }
        (0..n).map(|i| lf[i] - self.tasks[i].min_duration()).collect()
    }

    /// 松弛: 硬截止转软截止, 低关键度的非必须齐套航材约束移除
    ///
    /// 门禁/独占/容量/必须齐套约束不在可松弛范围内, 传入时忽略
    pub fn relax(&mut self, constraints: &[ConstraintRef]) -> Vec<RelaxedConstraint> {
        let mut relaxed = Vec::new();
        for constraint in constraints {
            match constraint {
                ConstraintRef::HardDeadline { task_id } => {
                    let mut done = None;
                    for task in self.tasks.iter_mut().filter(|t| &t.task_id == task_id) {
                        if let Some(h) = task.hard_deadline.take() {
                            if !h.relaxable {
                                task.hard_deadline = Some(h);
                                continue;
                            }
                            task.soft_deadline = Some(task.soft_deadline.map_or(h.at, |s| s.min(h.at)));
                            done = Some(h.criticality);
                        }
                    }
                    if let Some(criticality) = done {
                        relaxed.push(RelaxedConstraint {
                            constraint: constraint.clone(),
                            criticality,
                            reason: "硬截止不可达, 转为软截止 (超期计入惩罚)".to_string(),
                        });
                    }
                }
                ConstraintRef::MaterialKit { task_id, .. } => {
                    let mut done = None;
                    for task in self.tasks.iter_mut().filter(|t| &t.task_id == task_id) {
                        let before = task.releases.len() + task.blockers.len();
                        let mut crit = None;
                        task.blockers.retain(|b| {
                            let hit = &b.source == constraint && b.relaxable;
                            if hit {
                                crit = Some(b.criticality);
                            }
                            !hit
                        });
                        task.releases.retain(|r| !(&r.source == constraint && r.relaxable));
                        if task.releases.len() + task.blockers.len() < before {
                            done = Some(crit.unwrap_or(Criticality::Low));
                        }
                    }
                    if let Some(criticality) = done {
                        relaxed.push(RelaxedConstraint {
                            constraint: constraint.clone(),
                            criticality,
                            reason: "低关键度航材齐套约束被放宽".to_string(),
                        });
                    }
                }
                _ => {}
            }
        }
        relaxed
    }
}
