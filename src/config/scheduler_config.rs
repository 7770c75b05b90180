// ==========================================
// 维修准备排产系统 - 排产参数
// ==========================================
// 职责: 求解时间预算、抢占护栏、并发策略、建模参数
// 默认值可被 config_kv 覆写 (见 ConfigManager::load_scheduler_config)
// ==========================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 分档求解时间预算
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveBudgetConfig {
    pub small_tier_max_tasks: usize,  // 小规模上限: 100
    pub small_tier_secs: u64,         // 小规模预算: 5s
    pub medium_tier_max_tasks: usize, // 中规模上限: 500
    pub medium_tier_secs: u64,        // 中规模预算: 20s
    pub large_tier_secs: u64,         // 大规模预算: 60s
    pub replan_ratio: f64,            // 重排预算占比: 0.4
    pub max_iterations: usize,        // 搜索迭代上限 (所有 worker 合计)
    pub num_workers: usize,           // 并行搜索 worker 数: 4
    pub random_seed: u64,             // 随机种子 (可复现)
}

impl Default for SolveBudgetConfig {
    fn default() -> Self {
        Self {
            small_tier_max_tasks: 100,
            small_tier_secs: 5,
            medium_tier_max_tasks: 500,
            medium_tier_secs: 20,
            large_tier_secs: 60,
            replan_ratio: 0.4,
            max_iterations: 2000,
            num_workers: 4,
            random_seed: 42,
        }
    }
}

impl SolveBudgetConfig {
    /// 按任务规模取时间预算; 重排按比例缩短
    pub fn budget_for(&self, task_count: usize, is_replan: bool) -> Duration {
        let secs = if task_count <= self.small_tier_max_tasks {
            self.small_tier_secs
        } else if task_count <= self.medium_tier_max_tasks {
            self.medium_tier_secs
        } else {
            self.large_tier_secs
        };
        let full = Duration::from_secs(secs);
        if is_replan {
            full.mul_f64(self.replan_ratio.clamp(0.05, 1.0))
        } else {
            full
        }
    }
}

/// 抢占护栏
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardrailConfig {
    pub max_preemptions_per_day: u32,          // 每工作包滚动24h抢占上限: 2
    pub max_preemption_hours: i64,             // 单次抢占最大延误: 4h
    pub require_approval: bool,                // 是否需要审批人
    pub recovery_priority_boost: u32,          // 被抢占方恢复优先级加成: 10
    pub recovery_window_hours: i64,            // 恢复窗口: 24h
    pub sla_buffer_threshold_hours: i64,       // SLA 缓冲触发阈值: 12h
    pub critical_path_delay_threshold_hours: i64, // 关键路径延误阈值: 2h
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            max_preemptions_per_day: 2,
            max_preemption_hours: 4,
            require_approval: false,
            recovery_priority_boost: 10,
            recovery_window_hours: 24,
            sla_buffer_threshold_hours: 12,
            critical_path_delay_threshold_hours: 2,
        }
    }
}

/// 同一计划并发变更时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BusyPolicy {
    /// 立即返回 PlanBusy
    Reject,
    /// 等待在途请求结束, 超时后返回 PlanBusy
    Wait { timeout_ms: u64 },
}

impl Default for BusyPolicy {
    fn default() -> Self {
        BusyPolicy::Reject
    }
}

/// 排产配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub prep_window_days: i64,       // 默认准备窗口: 2天 (无 SLA 工作包的软截止)
    pub switch_buffer_minutes: i64,  // 异地切换缓冲: 30分钟
    pub freeze_inprogress: bool,     // 重排时冻结已到计划开工时间的任务
    pub sla_risk_threshold_hours: i64, // SLA 风险阈值: 12h
    pub busy_policy: BusyPolicy,
    pub budgets: SolveBudgetConfig,
    pub guardrails: GuardrailConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            prep_window_days: 2,
            switch_buffer_minutes: 30,
            freeze_inprogress: true,
            sla_risk_threshold_hours: 12,
            busy_policy: BusyPolicy::Reject,
            budgets: SolveBudgetConfig::default(),
            guardrails: GuardrailConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_tiers() {
        let b = SolveBudgetConfig::default();
        assert_eq!(b.budget_for(80, false), Duration::from_secs(5));
        assert_eq!(b.budget_for(100, false), Duration::from_secs(5));
        assert_eq!(b.budget_for(101, false), Duration::from_secs(20));
        assert_eq!(b.budget_for(501, false), Duration::from_secs(60));
        assert_eq!(b.budget_for(80, true), Duration::from_secs(2));
    }
}
