// ==========================================
// 抢占集成测试
// ==========================================
// 覆盖: 抢占生效与审计、恢复提升、次数/时长护栏、审批、触发条件
// ==========================================


use std::sync::Arc;
use std::thread;

use chrono::Duration;

use mro_prep_aps::api::ApiError;
use mro_prep_aps::config::{PriorityTemplate, TemplateRef};
use mro_prep_aps::domain::{DomainEvent, EventPayload, EventScope, PreemptionTrigger, ReplanPolicy, Resource};
use mro_prep_aps::engine::{GuardrailKind, PreemptionRequest};
use test_helpers::*;

/// WP-A (优先级 5, 截止 +16h) 与 WP-B (优先级 3, 截止 +5h) 共用一个工位
fn shared_bay(env: &TestEnv) -> String {
    let snap = snapshot(
        vec![wp("WP-A", 5, Some(16)), wp("WP-B", 3, Some(5))],
        vec![
            task("A-1", "WP-A", 180, &[("BAY-A", 1)]),
            task("B-1", "WP-B", 180, &[("BAY-A", 1)]),
        ],
        vec![Resource::workspace("BAY-A", 1)],
    );
    env.plan_api.generate_plan(request(snap)).unwrap().plan_id
}

fn preempt_a(approver: Option<&str>) -> PreemptionRequest {
    PreemptionRequest {
        work_package_id: "WP-A".into(),
        approver: approver.map(str::to_string),
        reason: Some("AOG 保障".into()),
    }
}

#[test]
fn test_preemption_moves_lower_priority_work_and_is_audited() {
    let env = TestEnv::new();
    env.config_api
        .apply_template(TemplateRef::new(PriorityTemplate::ProtectSla), Some(vec!["WP-A".into()]))
        .unwrap();
    let plan_id = shared_bay(&env);
    let prior = env.plan_api.get_plan(&plan_id, None).unwrap();
    assert_eq!(prior.assignment("B-1").unwrap().start, t0());

    let resp = env.plan_api.preempt(&plan_id, preempt_a(Some("duty-manager"))).unwrap();
    assert_eq!(resp.version, 2);
    assert_eq!(resp.record.delay_minutes, 180);
    assert_eq!(resp.record.preempting_work_package_id, "WP-A");
    assert_eq!(resp.record.preempted_work_package_ids, vec!["WP-B".to_string()]);
    assert_eq!(resp.record.approver.as_deref(), Some("duty-manager"));
    assert_eq!(resp.record.from_version, 1);
    assert_eq!(resp.record.to_version, 2);
    assert!(resp
        .record
        .triggers
        .iter()
        .any(|t| matches!(t, PreemptionTrigger::SlaBuffer { .. })));

    let plan = env.plan_api.get_plan(&plan_id, None).unwrap();
    let a = plan.assignment("A-1").unwrap();
    let b = plan.assignment("B-1").unwrap();
    assert!(a.end <= b.start);
    assert_no_double_booking(&plan);

    // 被抢占方获得恢复提升
    let boost = plan.snapshot.work_package("WP-B").unwrap().recovery_boost.clone().unwrap();
    assert_eq!(boost.priority_boost, 10);
    assert_eq!(boost.source_record_id, resp.record.record_id);

    // 恰好一条审计记录, 与版本同事务写入
    let history = env.plan_api.preemption_history(&plan_id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].record_id, resp.record.record_id);
    assert!(env.published_types().contains(&"PreemptionApplied".to_string()));

    // 模板选择沿用生成时固定的策略版本
    assert_eq!(plan.template_selection["WP-A"].template, "protect_sla");
    assert_eq!(plan.template_selection["WP-A"].source, "SCOPED");
}

#[test]
fn test_daily_count_guardrail_spans_plans() {
    let env = TestEnv::new();
    for _ in 0..2 {
        let plan_id = shared_bay(&env);
        env.plan_api.preempt(&plan_id, preempt_a(Some("duty-manager"))).unwrap();
    }

    let third = shared_bay(&env);
    match env.plan_api.preempt(&third, preempt_a(Some("duty-manager"))) {
        Err(ApiError::GuardrailExceeded(v)) => {
            assert_eq!(v.guardrail, GuardrailKind::MaxPreemptionsPerDay);
            assert_eq!(v.limit, 2);
            assert_eq!(v.observed, 3);
        }
        other => panic!("应被次数护栏拦截: {:?}", other.map(|r| r.version)),
    }
    assert_eq!(env.plan_api.list_versions(&third).unwrap(), vec![1]);
    assert!(env.plan_api.preemption_history(&third).unwrap().is_empty());
}

#[test]
fn test_duration_guardrail_rejects_long_delay() {
    let env = TestEnv::with_config(&[("guardrail.max_preemption_hours", "2")]);
    let plan_id = shared_bay(&env);

    match env.plan_api.preempt(&plan_id, preempt_a(Some("duty-manager"))) {
        Err(ApiError::GuardrailExceeded(v)) => {
            assert_eq!(v.guardrail, GuardrailKind::MaxPreemptionHours);
            assert_eq!(v.limit, 120);
            assert_eq!(v.observed, 180);
            assert!(!v.explanation.is_empty());
        }
        other => panic!("应被时长护栏拦截: {:?}", other.map(|r| r.version)),
    }
    // 护栏拦截不留痕迹
    assert_eq!(env.plan_api.list_versions(&plan_id).unwrap(), vec![1]);
    assert!(env.plan_api.preemption_history(&plan_id).unwrap().is_empty());
}

#[test]
fn test_approval_required_when_configured() {
    let env = TestEnv::with_config(&[("guardrail.require_approval", "true")]);
    let plan_id = shared_bay(&env);

    assert!(matches!(
        env.plan_api.preempt(&plan_id, preempt_a(None)),
        Err(ApiError::ApprovalRequired { .. })
    ));
    // 空白审批人视同未审批
    assert!(matches!(
        env.plan_api.preempt(&plan_id, preempt_a(Some("  "))),
        Err(ApiError::ApprovalRequired { .. })
    ));
    assert!(env.plan_api.preempt(&plan_id, preempt_a(Some("duty-manager"))).is_ok());
}

#[test]
fn test_not_triggered_when_buffer_is_comfortable() {
    let env = TestEnv::with_config(&[("guardrail.critical_path_delay_threshold_hours", "4")]);
    let snap = snapshot(
        vec![wp("WP-A", 5, Some(120)), wp("WP-B", 3, Some(5))],
        vec![
            task("A-1", "WP-A", 180, &[("BAY-A", 1)]),
            task("B-1", "WP-B", 180, &[("BAY-A", 1)]),
        ],
        vec![Resource::workspace("BAY-A", 1)],
    );
    let plan_id = env.plan_api.generate_plan(request(snap)).unwrap().plan_id;
    let err = env
        .plan_api
        .preempt(&plan_id, preempt_a(Some("duty-manager")))
        .unwrap_err();
    assert!(matches!(err, ApiError::PreemptionNotTriggered { .. }));
    assert!(!err.is_retryable());
}

#[test]
fn test_urgent_flag_triggers_but_needs_victims() {
    let env = TestEnv::new();
    let mut urgent = wp("WP-A", 5, Some(120));
    urgent.urgent = true;
    // 与 WP-B 无共享资源
    let snap = snapshot(
        vec![urgent, wp("WP-B", 3, Some(48))],
        vec![
            task("A-1", "WP-A", 60, &[("BAY-A", 1)]),
            task("B-1", "WP-B", 60, &[("BAY-B", 1)]),
        ],
        vec![Resource::workspace("BAY-A", 1), Resource::workspace("BAY-B", 1)],
    );
    let plan_id = env.plan_api.generate_plan(request(snap)).unwrap().plan_id;
    assert!(matches!(
        env.plan_api.preempt(&plan_id, preempt_a(Some("duty-manager"))),
        Err(ApiError::NoPreemptableTask { .. })
    ));
}

#[test]
fn test_repeat_preemption_after_recovery_is_not_triggered() {
    let env = TestEnv::new();
    let plan_id = shared_bay(&env);
    env.plan_api.preempt(&plan_id, preempt_a(Some("duty-manager"))).unwrap();

    // WP-A 已排在前面, SLA 缓冲恢复到阈值以上
    assert!(matches!(
        env.plan_api.preempt(&plan_id, preempt_a(Some("duty-manager"))),
        Err(ApiError::PreemptionNotTriggered { .. })
    ));
    assert_eq!(env.plan_api.list_versions(&plan_id).unwrap(), vec![1, 2]);
    assert_eq!(env.plan_api.preemption_history(&plan_id).unwrap().len(), 1);
}

#[test]
fn test_preemption_order_survives_unrelated_replan() {
    let env = TestEnv::new();
    let plan_id = shared_bay(&env);
    let resp = env.plan_api.preempt(&plan_id, preempt_a(Some("duty-manager"))).unwrap();

    let preempted = env.plan_api.get_plan(&plan_id, None).unwrap();
    let reservation = &preempted.snapshot.reservations[0];
    assert_eq!(reservation.preemption_id, resp.record.record_id);
    assert_eq!((reservation.preempting_task.as_str(), reservation.preempted_task.as_str()), ("A-1", "B-1"));

    // 与两个工作包都无关的远期工位停用
    let outage = DomainEvent {
        event_id: "E-LIGHTING".into(),
        effective_time: t0() - Duration::hours(1),
        payload: EventPayload::ResourceStatus {
            resource_id: "BAY-A".into(),
            unavailable_from: hours(40),
            unavailable_until: hours(41),
            reason: Some("lighting repair".into()),
        },
        scope: EventScope {
            resource_ids: vec!["BAY-A".into()],
            ..EventScope::default()
        },
        policy: ReplanPolicy::ReplanUnstarted,
        source: None,
    };
    let replanned = env.plan_api.apply_events(&plan_id, vec![outage]).unwrap();
    assert_eq!(replanned.version, 3);

    let plan = env.plan_api.get_plan(&plan_id, None).unwrap();
    let a = plan.assignment("A-1").unwrap();
    let b = plan.assignment("B-1").unwrap();
    assert_eq!(a.start, t0());
    assert!(a.end <= b.start);
    assert_eq!(plan.snapshot.reservations.len(), 1);
    assert_eq!(env.plan_api.preemption_history(&plan_id).unwrap().len(), 1);
}

#[test]
fn test_concurrent_preemptions_on_different_plans_respect_daily_count() {
    let env = TestEnv::new();
    let first = shared_bay(&env);
    env.plan_api.preempt(&first, preempt_a(Some("duty-manager"))).unwrap();

    // 两个计划同时为 WP-A 抢占, 只剩一次额度
    let plans = [shared_bay(&env), shared_bay(&env)];
    let handles: Vec<_> = plans
        .iter()
        .cloned()
        .map(|plan_id| {
            let api = Arc::clone(&env.plan_api);
            thread::spawn(move || api.preempt(&plan_id, preempt_a(Some("duty-manager"))))
        })
        .collect();

    let mut succeeded = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(_) => succeeded += 1,
            Err(ApiError::GuardrailExceeded(v)) => {
                assert_eq!(v.guardrail, GuardrailKind::MaxPreemptionsPerDay);
                assert_eq!(v.limit, 2);
                assert_eq!(v.observed, 3);
                rejected += 1;
            }
            Err(other) => panic!("意外错误: {}", other),
        }
    }
    assert_eq!((succeeded, rejected), (1, 1));

    let total: usize = std::iter::once(&first)
        .chain(plans.iter())
        .map(|id| env.plan_api.preemption_history(id).unwrap().len())
        .sum();
    assert_eq!(total, 2);
}

#[test]
fn test_candidates_scan_whole_resource_pool() {
    let env = TestEnv::new();
    let plan_id = shared_bay(&env);

    let candidates = env.plan_api.preemption_candidates(&plan_id).unwrap();
    let ids: Vec<&str> = candidates.iter().map(|c| c.work_package_id.as_str()).collect();
    assert_eq!(ids, vec!["WP-A", "WP-B"]);
    assert_eq!(candidates[0].shared_resources, vec!["BAY-A".to_string()]);
    // 只读扫描, 不产生版本
    assert_eq!(env.plan_api.list_versions(&plan_id).unwrap(), vec![1]);
}
