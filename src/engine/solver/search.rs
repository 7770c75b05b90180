// ==========================================
// 维修准备排产系统 - 多起点搜索
// ==========================================
// 职责: 串行调度生成 (SGS) 解码 + 种子化随机扰动的并行多起点搜索
// 红线: 搜索热路径内无阻塞 I/O; 超时/迭代上限/证明最优时协作式停止
// 红线: 超时返回迄今最好的可行解, 而不是空结果
// ==========================================
// 流程:
// 1. 确定性启发式顺序 (调用线程内依次解码)
// 2. rayon worker 各自持有 StdRng(seed + worker), 扰动基准顺序或当前最好解
// 3. 目标值等于下界即证明最优, 通知所有 worker 停止
// ==========================================

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::engine::model::{Minutes, ScheduleModel};
use crate::engine::objective::{ObjectiveEvaluator, ObjectiveScore, ScheduleView};

use super::timeline::Timelines;

/// 解码后的排程 (按模型任务索引)
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    pub starts: Vec<Minutes>,
    pub ends: Vec<Minutes>,
    pub modes: Vec<usize>,
}

impl Schedule {
    pub fn view(&self) -> ScheduleView<'_> {
        ScheduleView {
            starts: &self.starts,
            ends: &self.ends,
            modes: &self.modes,
        }
    }
}

/// 候选解
#[derive(Debug, Clone)]
pub struct Candidate {
    pub schedule: Schedule,
    pub score: ObjectiveScore,
    /// 违反硬截止的模型任务
    pub violations: Vec<usize>,
    /// 硬截止总超期 (分钟)
    pub overrun: Minutes,
}

impl Candidate {
    pub fn is_feasible(&self) -> bool {
        self.violations.is_empty()
    }

    /// 可行优先, 其次超期更少, 最后目标值更小
    fn better_than(&self, other: &Candidate) -> bool {
        match (self.is_feasible(), other.is_feasible()) {
            (true, false) => true,
            (false, true) => false,
            _ => match self.overrun.cmp(&other.overrun) {
                CmpOrdering::Less => true,
                CmpOrdering::Greater => false,
                CmpOrdering::Equal => self.score.total < other.score.total,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub deadline: Instant,
    pub max_iterations: usize,
    pub workers: usize,
    pub seed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchReport {
    pub best: Option<Candidate>,
    pub iterations: usize,
    pub proven_optimal: bool,
    pub timed_out: bool,
}

impl SearchReport {
    fn absorb(&mut self, candidate: Candidate) {
        let replace = match &self.best {
            None => true,
            Some(current) => candidate.better_than(current),
        };
        if replace {
            self.best = Some(candidate);
        }
    }

    pub fn feasible(&self) -> Option<&Candidate> {
        self.best.as_ref().filter(|c| c.is_feasible())
    }

    fn reached_bound(&self, lower_bound: i64) -> bool {
        self.feasible().map_or(false, |c| c.score.total <= lower_bound)
    }
}

// ==========================================
// SGS 解码
// ==========================================

/// 按优先键 (越小越先) 串行生成排程
pub fn decode(model: &ScheduleModel, base: &Timelines, keys: &[f64]) -> Schedule {
    let n = model.tasks.len();
    let mut timelines = base.clone();
    let mut starts = vec![0; n];
    let mut ends = vec![0; n];
    let mut modes = vec![0; n];
    let mut pending: Vec<usize> = model.preds.iter().map(|p| p.len()).collect();
    let mut ready_at: Vec<Minutes> = model.tasks.iter().map(|t| t.release()).collect();
    let mut eligible: Vec<usize> = (0..n).filter(|&i| pending[i] == 0).collect();

    while !eligible.is_empty() {
        let mut pick = 0;
        for pos in 1..eligible.len() {
            let (a, b) = (eligible[pos], eligible[pick]);
            if keys[a] < keys[b] || (keys[a] == keys[b] && a < b) {
                pick = pos;
            }
        }
        let i = eligible.swap_remove(pick);
        let task = &model.tasks[i];
        let ready = ready_at[i];

        let mut chosen: Option<(Minutes, Minutes, bool, usize)> = None;
        for (m, mode) in task.modes.iter().enumerate() {
            let Some(t) = timelines.earliest_start(&mode.demands, ready, mode.duration, task.location, model.switch_buffer)
            else {
                continue;
            };
            let end = t + mode.duration;
            let miss = !task.mode_hits_preference(m);
            let better = match chosen {
                None => true,
                Some((_, best_end, best_miss, _)) => (end, miss) < (best_end, best_miss),
            };
            if better {
                chosen = Some((t, end, miss, m));
            }
        }
        let (start, end, _, m) = chosen.unwrap_or((ready, ready + task.min_duration(), false, 0));
        if let Some(mode) = task.modes.get(m) {
            timelines.reserve(&mode.demands, start, end, task.location);
        }
        starts[i] = start;
        ends[i] = end;
        modes[i] = m;

        for &s in &model.succs[i] {
            ready_at[s] = ready_at[s].max(end);
            pending[s] -= 1;
            if pending[s] == 0 {
                eligible.push(s);
            }
        }
    }

    Schedule { starts, ends, modes }
}

fn evaluate(model: &ScheduleModel, evaluator: &ObjectiveEvaluator, schedule: Schedule) -> Candidate {
    let mut violations = Vec::new();
    let mut overrun = 0;
    for (i, task) in model.tasks.iter().enumerate() {
        if let Some(h) = &task.hard_deadline {
            if schedule.ends[i] > h.at {
                violations.push(i);
                overrun += schedule.ends[i] - h.at;
            }
        }
    }
    let score = evaluator.evaluate(model, &schedule.view());
    Candidate { schedule, score, violations, overrun }
}

// ==========================================
// 启发式顺序
// ==========================================

fn ranks_from<K: Ord>(n: usize, key: impl Fn(usize) -> K) -> Vec<f64> {
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| (key(i), i));
    let mut ranks = vec![0.0; n];
    for (r, &i) in order.iter().enumerate() {
        ranks[i] = r as f64;
    }
    ranks
}

/// 确定性启发式: 首个为基准顺序
pub fn heuristic_orders(model: &ScheduleModel) -> Vec<Vec<f64>> {
    let n = model.tasks.len();
    let es = model.earliest_starts();
    let ls = model.latest_starts();
    let prio = |i: usize| -(model.tasks[i].priority as i64);

    let primary = if model.is_replan {
        ranks_from(n, |i| (model.tasks[i].prior_start.unwrap_or(es[i]), ls[i], prio(i)))
    } else {
        ranks_from(n, |i| (ls[i], prio(i), es[i]))
    };
    vec![
        primary,
        ranks_from(n, |i| (prio(i), ls[i], es[i])),
        ranks_from(n, |i| (es[i], ls[i], prio(i))),
    ]
}

// ==========================================
// 并行搜索
// ==========================================

struct WorkerContext<'a> {
    model: &'a ScheduleModel,
    evaluator: &'a ObjectiveEvaluator,
    base: &'a Timelines,
    base_keys: &'a [f64],
    seed_schedule: Option<&'a Schedule>,
    lower_bound: i64,
    deadline: Instant,
    quota: usize,
    seed: u64,
    stop: &'a AtomicBool,
}

#[derive(Default)]
struct WorkerResult {
    report: SearchReport,
}

fn run_worker(ctx: &WorkerContext<'_>, worker: usize) -> WorkerResult {
    let n = ctx.model.tasks.len();
    let mut rng = StdRng::seed_from_u64(ctx.seed.wrapping_add((worker as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)));
    let spread = (n as f64 * 0.2).max(2.0);
    let mut result = WorkerResult::default();
    let mut incumbent: Option<Schedule> = ctx.seed_schedule.cloned();

    for _ in 0..ctx.quota {
        if ctx.stop.load(Ordering::Relaxed) {
            break;
        }
        if Instant::now() >= ctx.deadline {
            result.report.timed_out = true;
            break;
        }

        let keys: Vec<f64> = match (&incumbent, rng.random_bool(0.5)) {
            (Some(s), true) => {
                let jitter = s.ends.iter().zip(&s.starts).map(|(e, st)| (e - st) as f64).sum::<f64>() / n as f64;
                (0..n)
                    .map(|i| s.starts[i] as f64 + rng.random_range(0.0..jitter.max(1.0)))
                    .collect()
            }
            _ => ctx
                .base_keys
                .iter()
                .map(|&r| r + rng.random_range(0.0..spread))
                .collect(),
        };

        let schedule = decode(ctx.model, ctx.base, &keys);
        let candidate = evaluate(ctx.model, ctx.evaluator, schedule);
        result.report.iterations += 1;

        let improves = match &result.report.best {
            None => true,
            Some(current) => candidate.better_than(current),
        };
        if improves {
            incumbent = Some(candidate.schedule.clone());
            result.report.absorb(candidate);
            if result.report.reached_bound(ctx.lower_bound) {
                result.report.proven_optimal = true;
                ctx.stop.store(true, Ordering::Relaxed);
                break;
            }
        }
    }
    result
}

/// 执行搜索
pub fn run_search(
    model: &ScheduleModel,
    evaluator: &ObjectiveEvaluator,
    lower_bound: i64,
    settings: &SearchSettings,
) -> SearchReport {
    let base = Timelines::from_model(model);
    let orders = heuristic_orders(model);
    let mut report = SearchReport::default();

    for keys in &orders {
        if Instant::now() >= settings.deadline && report.best.is_some() {
            report.timed_out = true;
            return report;
        }
        let candidate = evaluate(model, evaluator, decode(model, &base, keys));
        report.iterations += 1;
        report.absorb(candidate);
        if report.reached_bound(lower_bound) {
            report.proven_optimal = true;
            return report;
        }
    }

    let remaining = settings.max_iterations.saturating_sub(report.iterations);
    if remaining == 0 || model.tasks.len() < 2 {
        return report;
    }

    let workers = settings.workers.max(1);
    let stop = AtomicBool::new(false);
    let seed_schedule = report.best.as_ref().map(|c| c.schedule.clone());
    let ctx = WorkerContext {
        model,
        evaluator,
        base: &base,
        base_keys: &orders[0],
        seed_schedule: seed_schedule.as_ref(),
        lower_bound,
        deadline: settings.deadline,
        quota: remaining.div_ceil(workers),
        seed: settings.seed,
        stop: &stop,
    };

    let results: Vec<WorkerResult> = match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
        Ok(pool) => pool.install(|| (0..workers).into_par_iter().map(|w| run_worker(&ctx, w)).collect()),
        Err(err) => {
            warn!(error = %err, "搜索线程池创建失败, 退化为单线程");
            (0..workers).map(|w| run_worker(&ctx, w)).collect()
        }
    };

    for result in results {
        report.iterations += result.report.iterations;
        report.timed_out |= result.report.timed_out;
        if let Some(candidate) = result.report.best {
            report.absorb(candidate);
        }
    }
    report.proven_optimal = report.reached_bound(lower_bound);
    debug!(
        iterations = report.iterations,
        proven_optimal = report.proven_optimal,
        timed_out = report.timed_out,
        "搜索结束"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::objective_policy::{ObjectivePolicy, PriorityTemplate, TemplateRef};
    use crate::domain::{PlanningSnapshot, PreparationTask, Resource, ResourceRequirement, WorkPackage};
    use crate::engine::model_builder::{BuildOptions, ConstraintModelBuilder};
    use crate::engine::objective::ObjectiveEngine;
    use chrono::{DateTime, TimeZone, Utc};
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_decode_respects_precedence_and_exclusive() {
        let crane = Resource::equipment("CRANE-1", true, None);
        let mut a = PreparationTask::new("A", "WP1", 60);
        a.required_resources.push(ResourceRequirement::new("CRANE-1", 1));
        let mut b = PreparationTask::new("B", "WP1", 30);
        b.required_resources.push(ResourceRequirement::new("CRANE-1", 1));
        let mut c = PreparationTask::new("C", "WP1", 10);
        c.predecessors = vec!["A".into(), "B".into()];
        let snap = PlanningSnapshot {
            planning_start: t0(),
            work_packages: vec![WorkPackage::new("WP1", 1)],
            tasks: vec![a, b, c],
            resources: vec![crane],
            gates: vec![],
            reservations: vec![],
        };
        let model = ConstraintModelBuilder::build(&snap, &BuildOptions::new(t0())).unwrap();
        let base = Timelines::from_model(&model);
        let keys = heuristic_orders(&model).remove(0);
        let s = decode(&model, &base, &keys);

        let (ia, ib, ic) = (model.index["A"], model.index["B"], model.index["C"]);
        assert!(s.ends[ia] <= s.starts[ib] || s.ends[ib] <= s.starts[ia]);
        assert!(s.starts[ic] >= s.ends[ia].max(s.ends[ib]));
    }

    #[test]
    fn test_search_is_optimal_without_contention() {
        let tasks: Vec<PreparationTask> = (0..10)
            .map(|i| {
                let mut t = PreparationTask::new(&format!("T{}", i), "WP1", 30);
                if i > 0 {
                    t.predecessors = vec![format!("T{}", i - 1)];
                }
                t
            })
            .collect();
        let snap = PlanningSnapshot {
            planning_start: t0(),
            work_packages: vec![WorkPackage::new("WP1", 1)],
            tasks,
            resources: vec![],
            gates: vec![],
            reservations: vec![],
        };
        let model = ConstraintModelBuilder::build(&snap, &BuildOptions::new(t0())).unwrap();
        let policy = ObjectivePolicy::initial(TemplateRef::new(PriorityTemplate::Balanced), t0());
        let resolved = ObjectiveEngine::resolve(&policy, &snap, t0(), None);
        let evaluator = ObjectiveEvaluator::new(&model, &resolved);
        let lb = evaluator.lower_bound(&model, &model.earliest_starts()).total;

        let report = run_search(
            &model,
            &evaluator,
            lb,
            &SearchSettings {
                deadline: Instant::now() + Duration::from_secs(5),
                max_iterations: 100,
                workers: 2,
                seed: 7,
            },
        );
        assert!(report.proven_optimal);
        assert_eq!(report.iterations, 1);
        let best = report.feasible().unwrap();
        assert_eq!(best.schedule.ends[model.index["T9"]], 300);
    }
}
