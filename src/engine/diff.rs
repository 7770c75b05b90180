// ==========================================
// 维修准备排产系统 - 版本差异引擎
// ==========================================
// 职责: 比较相邻计划版本, 输出受影响任务/延误/资源改派/完工变化
// 输入: 前后两个计划版本
// 输出: PlanDiff (随重排结果返回, 并写入事件日志)
// ==========================================

use std::collections::BTreeSet;

use crate::domain::{Plan, PlanDiff, ResourceReallocation, TaskAssignment, TaskDelay};

// ==========================================
// PlanDiffEngine - 版本差异引擎
// ==========================================
// 红线: 无状态引擎, 所有方法都是纯函数
#[derive(Debug, Default)]
pub struct PlanDiffEngine;

impl PlanDiffEngine {
    pub fn new() -> Self {
        Self
    }

    /// 生成版本差异
    pub fn diff(&self, before: &Plan, after: &Plan) -> PlanDiff {
        let delays = self.analyze_delays(before, after);
        let resource_reallocation = self.analyze_reallocation(before, after);

        // 受影响任务: 时间变化 + 改派 + 新增/移除
        let mut affected: BTreeSet<String> = BTreeSet::new();
        for a in &after.assignments {
            if let Some(b) = before.assignment(&a.task_id) {
                if a.start != b.start || a.end != b.end {
                    affected.insert(a.task_id.clone());
                }
            }
        }
        affected.extend(resource_reallocation.iter().map(|r| r.task_id.clone()));
        for a in &after.assignments {
            if before.assignment(&a.task_id).is_none() {
                affected.insert(a.task_id.clone());
            }
        }
        for b in &before.assignments {
            if after.assignment(&b.task_id).is_none() {
                affected.insert(b.task_id.clone());
            }
        }

        PlanDiff {
            from_version: before.version,
            to_version: after.version,
            affected_tasks: affected.into_iter().collect(),
            delays,
            resource_reallocation,
            makespan_delta_minutes: (after.makespan - before.makespan).num_minutes(),
        }
    }

    /// 延后的任务 (开工或完工晚于上一版本)
    fn analyze_delays(&self, before: &Plan, after: &Plan) -> Vec<TaskDelay> {
        let mut delays: Vec<TaskDelay> = after
            .assignments
            .iter()
            .filter_map(|a| {
                let b = before.assignment(&a.task_id)?;
                let start_delay = (a.start - b.start).num_minutes();
                let end_delay = (a.end - b.end).num_minutes();
                if start_delay <= 0 && end_delay <= 0 {
                    return None;
                }
                Some(TaskDelay {
                    task_id: a.task_id.clone(),
                    start_delay_minutes: start_delay,
                    end_delay_minutes: end_delay,
                })
            })
            .collect();
        delays.sort_by(|x, y| x.task_id.cmp(&y.task_id));
        delays
    }

    fn analyze_reallocation(&self, before: &Plan, after: &Plan) -> Vec<ResourceReallocation> {
        let mut changes: Vec<ResourceReallocation> = after
            .assignments
            .iter()
            .filter_map(|a| {
                let b = before.assignment(&a.task_id)?;
                if same_resources(a, b) {
                    return None;
                }
                Some(ResourceReallocation {
                    task_id: a.task_id.clone(),
                    from: b.resources.clone(),
                    to: a.resources.clone(),
                })
            })
            .collect();
        changes.sort_by(|x, y| x.task_id.cmp(&y.task_id));
        changes
    }
}

fn same_resources(a: &TaskAssignment, b: &TaskAssignment) -> bool {
    let x: BTreeSet<&str> = a.resources.iter().map(|s| s.as_str()).collect();
    let y: BTreeSet<&str> = b.resources.iter().map(|s| s.as_str()).collect();
    x == y
}
