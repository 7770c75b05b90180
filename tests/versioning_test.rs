// ==========================================
// 版本与并发集成测试
// ==========================================
// 覆盖: 乐观版本冲突、同计划串行化、多计划并行生成、
//       交接确认版本化、目标策略灰度影响模板选择
// ==========================================


use std::sync::Arc;
use std::thread;

use chrono::Duration;

use mro_prep_aps::api::{ApiError, RolloutRequest};
use mro_prep_aps::config::{PriorityTemplate, TemplateRef};
use mro_prep_aps::domain::{
    DomainEvent, EventPayload, EventScope, Evidence, EvidenceType, Gate, GateTarget, GateTransition, GateType,
    ReplanPolicy, Resource,
};
use mro_prep_aps::repository::VersionCommit;
use test_helpers::*;

fn bay_plan(env: &TestEnv) -> String {
    let snap = snapshot(
        vec![wp("WP-A", 3, Some(24))],
        vec![
            task("T1", "WP-A", 60, &[("BAY-1", 1)]),
            after(task("T2", "WP-A", 60, &[("BAY-1", 1)]), &["T1"]),
        ],
        vec![Resource::workspace("BAY-1", 1)],
    );
    env.plan_api.generate_plan(request(snap)).unwrap().plan_id
}

fn outage(id: &str, from_h: i64) -> DomainEvent {
    DomainEvent {
        event_id: id.to_string(),
        effective_time: t0() - Duration::hours(1),
        payload: EventPayload::ResourceStatus {
            resource_id: "BAY-1".into(),
            unavailable_from: hours(from_h),
            unavailable_until: hours(from_h) + Duration::minutes(30),
            reason: Some("lighting repair".into()),
        },
        scope: EventScope {
            resource_ids: vec!["BAY-1".into()],
            ..EventScope::default()
        },
        policy: ReplanPolicy::ReplanUnstarted,
        source: None,
    }
}

fn evidence(kind: EvidenceType) -> Evidence {
    Evidence {
        evidence_type: kind,
        content: "handover-0042.pdf".into(),
        submitted_by: "qec-lead".into(),
        submitted_at: t0(),
    }
}

#[test]
fn test_stale_base_version_is_rejected() {
    let env = TestEnv::new();
    let plan_id = bay_plan(&env);
    let v1 = env.plan_api.get_plan(&plan_id, Some(1)).unwrap();

    env.plan_api.apply_events(&plan_id, vec![outage("E-1", 10)]).unwrap();

    // 基于 v1 的另一次提交
    let mut stale = v1.clone();
    stale.version = 2;
    stale.base_version = Some(1);
    let err = env
        .plan_repo
        .commit_version(VersionCommit {
            plan: &stale,
            base_version: 1,
            events: &[],
            preemption: None,
        })
        .unwrap_err();
    let err: ApiError = err.into();
    match &err {
        ApiError::VersionConflict { expected, actual, .. } => {
            assert_eq!(*expected, 1);
            assert_eq!(*actual, 2);
        }
        other => panic!("应为版本冲突: {:?}", other),
    }
    assert!(err.is_retryable());
    assert_eq!(env.plan_api.list_versions(&plan_id).unwrap(), vec![1, 2]);
}

#[test]
fn test_concurrent_mutations_on_one_plan_never_lose_updates() {
    let env = TestEnv::with_config(&[("busy_policy", r#"{"mode":"wait","timeout_ms":30000}"#)]);
    let plan_id = bay_plan(&env);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let api = Arc::clone(&env.plan_api);
            let plan_id = plan_id.clone();
            thread::spawn(move || api.apply_events(&plan_id, vec![outage(&format!("E-{}", i), 20 + i)]))
        })
        .collect();
    let mut versions: Vec<u32> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap().version)
        .collect();
    versions.sort_unstable();

    assert_eq!(versions, vec![2, 3, 4, 5]);
    assert_eq!(env.plan_api.list_versions(&plan_id).unwrap(), vec![1, 2, 3, 4, 5]);
    // 每个事件恰好被一个版本消费
    let history = env.plan_api.event_history(&plan_id).unwrap();
    assert_eq!(history.len(), 4);
    let mut consumed_by: Vec<u32> = history.iter().map(|e| e.version).collect();
    consumed_by.sort_unstable();
    assert_eq!(consumed_by, vec![2, 3, 4, 5]);
}

#[test]
fn test_reject_policy_reports_busy_or_succeeds() {
    let env = TestEnv::new();
    let plan_id = bay_plan(&env);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let api = Arc::clone(&env.plan_api);
            let plan_id = plan_id.clone();
            thread::spawn(move || api.apply_events(&plan_id, vec![outage(&format!("R-{}", i), 20 + i)]))
        })
        .collect();
    let mut succeeded = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(_) => succeeded += 1,
            Err(err @ ApiError::PlanBusy { .. }) => assert!(err.is_retryable()),
            Err(other) => panic!("意外错误: {}", other),
        }
    }
    assert!(succeeded >= 1);
    assert_eq!(env.plan_api.list_versions(&plan_id).unwrap().len(), succeeded + 1);
}

#[test]
fn test_independent_plans_generate_in_parallel() {
    let env = TestEnv::new();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let api = Arc::clone(&env.plan_api);
            thread::spawn(move || {
                let wp_id = format!("WP-{}", i);
                let snap = snapshot(
                    vec![wp(&wp_id, 3, Some(24))],
                    vec![
                        task(&format!("{}-T1", wp_id), &wp_id, 45, &[("CRANE-1", 1)]),
                        task(&format!("{}-T2", wp_id), &wp_id, 45, &[("CRANE-1", 1)]),
                    ],
                    vec![Resource::equipment("CRANE-1", true, None)],
                );
                api.generate_plan(request(snap))
            })
        })
        .collect();
    let mut plan_ids: Vec<String> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap().plan_id)
        .collect();
    plan_ids.sort();
    plan_ids.dedup();
    assert_eq!(plan_ids.len(), 4);
    for plan_id in &plan_ids {
        let plan = env.plan_api.get_plan(plan_id, None).unwrap();
        assert_eq!(plan.version, 1);
        assert_no_double_booking(&plan);
    }
}

#[test]
fn test_handover_confirmation_creates_new_version() {
    let env = TestEnv::new();
    let mut check = task("T-QEC", "WP-A", 0, &[]);
    check.is_gate = true;
    let mut snap = snapshot(
        vec![wp("WP-A", 3, None)],
        vec![check, after(task("T-HANG", "WP-A", 90, &[]), &["T-QEC"])],
        vec![],
    );
    let mut gate = Gate::new(
        "G-QEC",
        GateType::QecShelfHandover,
        GateTarget::Task {
            task_id: "T-QEC".into(),
        },
    );
    gate.required_evidence = vec![EvidenceType::HandoverForm, EvidenceType::Signature];
    gate.resolution_eta = Some(hours(4));
    snap.gates.push(gate);
    let plan_id = env.plan_api.generate_plan(request(snap)).unwrap().plan_id;

    // 证据不全: 仍待定, 但证据已记入新版本
    let partial = env
        .plan_api
        .confirm_handover(&plan_id, "G-QEC", vec![evidence(EvidenceType::HandoverForm)])
        .unwrap();
    assert!(!partial.passed);
    assert_eq!(partial.version, 2);
    match &partial.status {
        GateTransition::StillPending { missing_evidence, .. } => {
            assert_eq!(missing_evidence, &vec![EvidenceType::Signature]);
        }
        other => panic!("应仍待定: {:?}", other),
    }

    let done = env
        .plan_api
        .confirm_handover(&plan_id, "T-QEC", vec![evidence(EvidenceType::Signature)])
        .unwrap();
    assert!(done.passed);
    assert_eq!(done.version, 3);
    assert_eq!(done.status, GateTransition::Passed);
    assert!(done.updated_gate.passed);

    let summary = env.plan_api.summarize(&plan_id).unwrap();
    assert_eq!(summary.gate_pass_rate, 1.0);
    assert!(env.published_types().contains(&"HandoverConfirmed".to_string()));

    assert_eq!(env.plan_api.list_versions(&plan_id).unwrap(), vec![1, 2, 3]);
}

#[test]
fn test_invalid_evidence_is_rejected_without_new_version() {
    let env = TestEnv::new();
    let mut snap = snapshot(vec![wp("WP-A", 3, None)], vec![task("T1", "WP-A", 30, &[])], vec![]);
    let mut gate = Gate::new(
        "G-DOC",
        GateType::DocReady,
        GateTarget::WorkPackage {
            work_package_id: "WP-A".into(),
        },
    );
    gate.required_evidence = vec![EvidenceType::Document];
    gate.resolution_eta = Some(hours(1));
    snap.gates.push(gate);
    let plan_id = env.plan_api.generate_plan(request(snap)).unwrap().plan_id;

    let mut blank = evidence(EvidenceType::Document);
    blank.content = "   ".into();
    assert!(matches!(
        env.plan_api.confirm_handover(&plan_id, "G-DOC", vec![blank]),
        Err(ApiError::Gate(_))
    ));
    assert_eq!(env.plan_api.list_versions(&plan_id).unwrap(), vec![1]);
}

#[test]
fn test_rollout_changes_template_selection_until_expiry() {
    let env = TestEnv::new();
    let policy = env
        .config_api
        .start_rollout(RolloutRequest {
            candidate: TemplateRef::new(PriorityTemplate::CostMin),
            fraction: 1.0,
            scope: Some(vec!["WP-A".into()]),
            duration_hours: 6,
        })
        .unwrap();
    assert_eq!(policy.version, 2);

    let two_wps = || {
        snapshot(
            vec![wp("WP-A", 3, None), wp("WP-B", 3, None)],
            vec![task("A", "WP-A", 30, &[]), task("B", "WP-B", 30, &[])],
            vec![],
        )
    };
    let plan_id = env.plan_api.generate_plan(request(two_wps())).unwrap().plan_id;
    let plan = env.plan_api.get_plan(&plan_id, None).unwrap();
    assert_eq!(plan.template_selection["WP-A"].template, "cost_min");
    assert_eq!(plan.template_selection["WP-A"].source, "ROLLOUT");
    assert_eq!(plan.template_selection["WP-A"].policy_version, 2);
    assert_eq!(plan.template_selection["WP-B"].source, "GLOBAL");

    // 灰度到期后, 新计划回到全局模板
    env.clock.set(t0() + Duration::hours(6));
    let later_id = env.plan_api.generate_plan(request(two_wps())).unwrap().plan_id;
    let later = env.plan_api.get_plan(&later_id, None).unwrap();
    assert_eq!(later.template_selection["WP-A"].source, "GLOBAL");

    // 回滚后策略版本递增, 历史版本可查
    let rolled_back = env.config_api.rollback_rollout().unwrap();
    assert_eq!(rolled_back.version, 3);
    assert_eq!(env.config_api.get_policy(2).unwrap().version, 2);
    assert!(matches!(env.config_api.get_policy(99), Err(ApiError::NotFound(_))));
}
