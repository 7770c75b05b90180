// ==========================================
// 事件驱动重排集成测试
// ==========================================
// 覆盖: ETA 变更只影响下游、到货解锁、冻结稳定性、
//       失败保持上一版本、事件只消费一次、滚动窗口
// ==========================================


use chrono::Duration;

use mro_prep_aps::api::ApiError;
use mro_prep_aps::domain::{
    ConstraintRef, DomainEvent, EventPayload, EventScope, Gate, GateTarget, GateType, ReplanPolicy, Resource,
    RiskLevel, TaskStatus,
};
use test_helpers::*;

/// T1/T4 独立; T2 需齐套 KIT-1 (ETA +2h); T3 在 T2 之后
fn kit_plan(env: &TestEnv) -> String {
    let snap = snapshot(
        vec![wp("WP1", 1, None)],
        vec![
            task("T1", "WP1", 60, &[]),
            task("T2", "WP1", 60, &[("KIT-1", 5)]),
            after(task("T3", "WP1", 30, &[]), &["T2"]),
            task("T4", "WP1", 90, &[]),
        ],
        vec![material("KIT-1", 5, true, Some(2))],
    );
    env.plan_api.generate_plan(request(snap)).unwrap().plan_id
}

fn resource_event(id: &str, at: chrono::DateTime<chrono::Utc>, resource_id: &str, payload: EventPayload) -> DomainEvent {
    DomainEvent {
        event_id: id.to_string(),
        effective_time: at,
        payload,
        scope: EventScope {
            resource_ids: vec![resource_id.to_string()],
            ..EventScope::default()
        },
        policy: ReplanPolicy::ReplanUnstarted,
        source: Some("SAP-MM".to_string()),
    }
}

fn eta_change(id: &str, new_eta_hours: i64) -> DomainEvent {
    resource_event(
        id,
        t0() - Duration::hours(1),
        "KIT-1",
        EventPayload::EtaChange {
            resource_id: "KIT-1".into(),
            old_eta: Some(hours(2)),
            new_eta: hours(new_eta_hours),
        },
    )
}

fn progress(id: &str, task_id: &str, status: TaskStatus, at: chrono::DateTime<chrono::Utc>) -> DomainEvent {
    DomainEvent {
        event_id: id.to_string(),
        effective_time: at,
        payload: EventPayload::TaskProgress {
            task_id: task_id.to_string(),
            status,
            at,
        },
        scope: EventScope {
            task_ids: vec![task_id.to_string()],
            ..EventScope::default()
        },
        policy: ReplanPolicy::ReplanUnstarted,
        source: Some("shop-floor".to_string()),
    }
}

#[test]
fn test_eta_slip_delays_only_dependent_tasks() {
    let env = TestEnv::new();
    let plan_id = kit_plan(&env);
    let prior = env.plan_api.get_plan(&plan_id, None).unwrap();
    assert_eq!(prior.assignment("T2").unwrap().start, hours(2));

    let resp = env.plan_api.apply_events(&plan_id, vec![eta_change("E-ETA-1", 10)]).unwrap();

    assert_eq!(resp.version, 2);
    assert_eq!(resp.diff.from_version, 1);
    assert_eq!(resp.diff.to_version, 2);
    assert_eq!(resp.diff.affected_tasks, vec!["T2".to_string(), "T3".to_string()]);
    assert!(resp.diff.delays.iter().all(|d| d.start_delay_minutes == 480));
    assert_eq!(resp.policy, ReplanPolicy::ReplanUnstarted);

    let current = env.plan_api.get_plan(&plan_id, None).unwrap();
    assert_eq!(current.base_version, Some(1));
    for id in ["T1", "T4"] {
        let before = prior.assignment(id).unwrap();
        let now = current.assignment(id).unwrap();
        assert_eq!((before.start, before.end), (now.start, now.end));
    }
    assert_eq!(resp.new_makespan, hours(10) + Duration::minutes(90));

    // 上一版本保持不变, 可回溯
    let v1 = env.plan_api.get_plan(&plan_id, Some(1)).unwrap();
    assert_eq!(v1.assignment("T2").unwrap().start, hours(2));
    assert_eq!(env.plan_api.list_versions(&plan_id).unwrap(), vec![1, 2]);
    assert_eq!(
        env.published_types(),
        vec!["PlanGenerated".to_string(), "PlanReplanned".to_string()]
    );
}

#[test]
fn test_material_receipt_pulls_kitted_task_forward() {
    let env = TestEnv::new();
    let snap = snapshot(
        vec![wp("WP-A", 3, None)],
        vec![task("FIT-SEAL", "WP-A", 60, &[("SEAL-KIT", 5)])],
        vec![material("SEAL-KIT", 3, true, Some(6))],
    );
    let plan_id = env.plan_api.generate_plan(request(snap)).unwrap().plan_id;
    let before = env.plan_api.get_plan(&plan_id, None).unwrap();
    assert!(before.assignment("FIT-SEAL").unwrap().start >= hours(6));

    env.clock.set(hours(1));
    let receipt = resource_event(
        "E-GR-1",
        hours(1),
        "SEAL-KIT",
        EventPayload::MaterialReceipt {
            resource_id: "SEAL-KIT".into(),
            available_quantity: 5,
        },
    );
    let resp = env.plan_api.apply_events(&plan_id, vec![receipt]).unwrap();

    let fit = env.plan_api.get_plan(&plan_id, None).unwrap();
    let fit = fit.assignment("FIT-SEAL").unwrap();
    assert_eq!(fit.start, hours(1));
    assert!(resp.diff.makespan_delta_minutes < 0);
}

#[test]
fn test_started_tasks_keep_their_intervals() {
    let env = TestEnv::new();
    let plan_id = kit_plan(&env);
    let prior = env.plan_api.get_plan(&plan_id, None).unwrap();
    let t1 = prior.assignment("T1").unwrap().clone();

    env.clock.set(t0());
    let resp = env
        .plan_api
        .apply_events(
            &plan_id,
            vec![progress("E-P-1", "T1", TaskStatus::InProgress, t0()), eta_change("E-ETA-2", 10)],
        )
        .unwrap();
    assert!(resp.frozen_tasks.contains(&"T1".to_string()));

    let v2 = env.plan_api.get_plan(&plan_id, None).unwrap();
    let after = v2.assignment("T1").unwrap();
    assert!(after.frozen);
    assert_eq!((after.start, after.end), (t1.start, t1.end));
    assert_eq!(after.status, TaskStatus::InProgress);
    assert!(!resp.diff.affected_tasks.contains(&"T1".to_string()));

    // 提前完工: 冻结区间以实际完工时间收尾
    let done_at = t0() + Duration::minutes(50);
    env.clock.set(done_at);
    env.plan_api
        .apply_events(&plan_id, vec![progress("E-P-2", "T1", TaskStatus::Completed, done_at)])
        .unwrap();
    let v3 = env.plan_api.get_plan(&plan_id, None).unwrap();
    let t1_done = v3.assignment("T1").unwrap();
    assert_eq!(t1_done.start, t1.start);
    assert_eq!(t1_done.end, done_at);
    assert_eq!(t1_done.status, TaskStatus::Completed);
}

#[test]
fn test_weather_window_pushes_crane_task() {
    let env = TestEnv::new();
    let snap = snapshot(
        vec![wp("WP-A", 3, None)],
        vec![task("LIFT", "WP-A", 60, &[("CRANE-1", 1)])],
        vec![Resource::equipment("CRANE-1", true, None)],
    );
    let plan_id = env.plan_api.generate_plan(request(snap)).unwrap().plan_id;
    assert_eq!(env.plan_api.get_plan(&plan_id, None).unwrap().assignment("LIFT").unwrap().start, t0());

    let storm = resource_event(
        "E-WX-1",
        t0() - Duration::hours(1),
        "CRANE-1",
        EventPayload::Weather {
            weather_type: "high_wind".into(),
            severity: Some("severe".into()),
            start: t0(),
            end: hours(4),
        },
    );
    env.plan_api.apply_events(&plan_id, vec![storm]).unwrap();
    let lift = env.plan_api.get_plan(&plan_id, None).unwrap();
    assert!(lift.assignment("LIFT").unwrap().start >= hours(4));
}

#[test]
fn test_sap_release_opens_work_package_gate() {
    let env = TestEnv::new();
    let mut snap = snapshot(vec![wp("WP-A", 3, None)], vec![task("T1", "WP-A", 60, &[])], vec![]);
    let mut gate = Gate::new(
        "G-SAP",
        GateType::DocReady,
        GateTarget::WorkPackage {
            work_package_id: "WP-A".into(),
        },
    );
    gate.pending_conditions = vec!["SAP-4711".into()];
    gate.resolution_eta = Some(hours(8));
    snap.gates.push(gate);
    let plan_id = env.plan_api.generate_plan(request(snap)).unwrap().plan_id;
    assert!(env.plan_api.get_plan(&plan_id, None).unwrap().assignment("T1").unwrap().start >= hours(8));

    env.clock.set(t0());
    let released = DomainEvent {
        event_id: "E-SAP-1".into(),
        effective_time: t0(),
        payload: EventPayload::SapUpdate {
            instruction_id: "SAP-4711".into(),
            old_status: Some("CRTD".into()),
            new_status: "REL".into(),
        },
        scope: EventScope {
            gate_ids: vec!["G-SAP".into()],
            ..EventScope::default()
        },
        policy: ReplanPolicy::ReplanUnstarted,
        source: Some("SAP-PM".into()),
    };
    env.plan_api.apply_events(&plan_id, vec![released]).unwrap();

    let plan = env.plan_api.get_plan(&plan_id, None).unwrap();
    assert!(plan.snapshot.gate("G-SAP").unwrap().passed);
    assert_eq!(plan.assignment("T1").unwrap().start, t0());
    assert!(plan.gate_summary.iter().all(|g| g.passed));
}

#[test]
fn test_material_receipt_passes_materials_ready_gate() {
    let env = TestEnv::new();
    let mut snap = snapshot(
        vec![wp("WP-A", 3, None)],
        vec![
            task("FIT-SEAL", "WP-A", 60, &[("SEAL-KIT", 5)]),
            task("PREP-BAY", "WP-A", 30, &[]),
        ],
        vec![material("SEAL-KIT", 3, true, Some(12))],
    );
    let mut gate = Gate::new(
        "G-KIT",
        GateType::MaterialsReady,
        GateTarget::WorkPackage {
            work_package_id: "WP-A".into(),
        },
    );
    gate.resolution_eta = Some(hours(12));
    snap.gates.push(gate);
    let plan_id = env.plan_api.generate_plan(request(snap)).unwrap().plan_id;
    let before = env.plan_api.get_plan(&plan_id, None).unwrap();
    assert!(before.assignment("PREP-BAY").unwrap().start >= hours(12));

    env.clock.set(t0());
    let receipt = resource_event(
        "E-GR-KIT",
        t0(),
        "SEAL-KIT",
        EventPayload::MaterialReceipt {
            resource_id: "SEAL-KIT".into(),
            available_quantity: 5,
        },
    );
    env.plan_api.apply_events(&plan_id, vec![receipt]).unwrap();

    let plan = env.plan_api.get_plan(&plan_id, None).unwrap();
    let gate = plan.snapshot.gate("G-KIT").unwrap();
    assert!(gate.passed);
    assert_eq!(gate.passed_at, Some(t0()));
    assert!(plan.gate_summary.iter().all(|g| g.passed));
    assert_eq!(plan.assignment("PREP-BAY").unwrap().start, t0());
    assert_eq!(plan.assignment("FIT-SEAL").unwrap().start, t0());
}

#[test]
fn test_partial_receipt_keeps_materials_ready_gate_closed() {
    let env = TestEnv::new();
    let mut snap = snapshot(
        vec![wp("WP-A", 3, None)],
        vec![task("FIT-SEAL", "WP-A", 60, &[("SEAL-KIT", 5)])],
        vec![material("SEAL-KIT", 1, true, Some(12))],
    );
    let mut gate = Gate::new(
        "G-KIT",
        GateType::MaterialsReady,
        GateTarget::WorkPackage {
            work_package_id: "WP-A".into(),
        },
    );
    gate.resolution_eta = Some(hours(12));
    snap.gates.push(gate);
    let plan_id = env.plan_api.generate_plan(request(snap)).unwrap().plan_id;

    let receipt = resource_event(
        "E-GR-PART",
        t0() - Duration::hours(1),
        "SEAL-KIT",
        EventPayload::MaterialReceipt {
            resource_id: "SEAL-KIT".into(),
            available_quantity: 4,
        },
    );
    // 到货不足: 航材无新 ETA, 门禁仍未通过
    let mut with_eta = receipt.clone();
    with_eta.event_id = "E-ETA-REST".into();
    with_eta.payload = EventPayload::EtaChange {
        resource_id: "SEAL-KIT".into(),
        old_eta: Some(hours(12)),
        new_eta: hours(12),
    };
    env.plan_api.apply_events(&plan_id, vec![receipt, with_eta]).unwrap();

    let plan = env.plan_api.get_plan(&plan_id, None).unwrap();
    assert!(!plan.snapshot.gate("G-KIT").unwrap().passed);
    assert!(plan.assignment("FIT-SEAL").unwrap().start >= hours(12));
}

#[test]
fn test_failed_replan_keeps_prior_version_and_consumes_nothing() {
    let env = TestEnv::new();
    let mut snap = snapshot(vec![wp("WP-A", 3, None)], vec![task("T1", "WP-A", 60, &[])], vec![]);
    let mut gate = Gate::new(
        "G-VENDOR",
        GateType::AssessmentComplete,
        GateTarget::WorkPackage {
            work_package_id: "WP-A".into(),
        },
    );
    gate.resolution_eta = Some(hours(4));
    snap.gates.push(gate);
    let plan_id = env.plan_api.generate_plan(request(snap)).unwrap().plan_id;

    let ack = |confirmed: bool, resolution: Option<i64>| DomainEvent {
        event_id: "E-ACK-1".into(),
        effective_time: t0() - Duration::hours(1),
        payload: EventPayload::ThirdPartyAck {
            gate_id: "G-VENDOR".into(),
            party: "engine-oem".into(),
            confirmed,
            expected_resolution: resolution.map(hours),
        },
        scope: EventScope {
            gate_ids: vec!["G-VENDOR".into()],
            ..EventScope::default()
        },
        policy: ReplanPolicy::ReplanUnstarted,
        source: None,
    };

    // 撤回确认: 门禁无预计解除时间 → 不可行
    match env.plan_api.apply_events(&plan_id, vec![ack(false, None)]) {
        Err(err @ ApiError::Infeasible(_)) => {
            assert!(err.blocking_constraints().contains(&ConstraintRef::Gate {
                gate_id: "G-VENDOR".into(),
                task_id: "T1".into(),
            }));
        }
        other => panic!("应不可行: {:?}", other.map(|r| r.version)),
    }
    assert_eq!(env.plan_api.list_versions(&plan_id).unwrap(), vec![1]);
    assert!(env.plan_api.event_history(&plan_id).unwrap().is_empty());

    // 失败批次未消费事件, 同一 event_id 可再次提交
    let resp = env.plan_api.apply_events(&plan_id, vec![ack(true, Some(2))]).unwrap();
    assert_eq!(resp.version, 2);
    let plan = env.plan_api.get_plan(&plan_id, None).unwrap();
    assert_eq!(plan.assignment("T1").unwrap().start, hours(2));
    assert_eq!(
        env.published_types(),
        vec![
            "PlanGenerated".to_string(),
            "ReplanFailed".to_string(),
            "PlanReplanned".to_string()
        ]
    );
}

#[test]
fn test_consumed_event_cannot_be_replayed() {
    let env = TestEnv::new();
    let plan_id = kit_plan(&env);
    env.plan_api.apply_events(&plan_id, vec![eta_change("E-ONCE", 6)]).unwrap();

    let history = env.plan_api.event_history(&plan_id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].version, 2);
    assert_eq!(history[0].event.event_id, "E-ONCE");

    match env.plan_api.apply_events(&plan_id, vec![eta_change("E-ONCE", 8)]) {
        Err(ApiError::InvalidEvent { event_id, .. }) => assert_eq!(event_id, "E-ONCE"),
        other => panic!("重复事件应被拒绝: {:?}", other.map(|r| r.version)),
    }
    assert_eq!(env.plan_api.list_versions(&plan_id).unwrap(), vec![1, 2]);
}

#[test]
fn test_event_with_unknown_scope_is_rejected() {
    let env = TestEnv::new();
    let plan_id = kit_plan(&env);
    let mut event = eta_change("E-BAD", 6);
    event.scope.resource_ids = vec!["KIT-404".into()];
    assert!(matches!(
        env.plan_api.apply_events(&plan_id, vec![event]),
        Err(ApiError::InvalidEvent { .. })
    ));

    let mut unscoped = eta_change("E-NOSCOPE", 6);
    unscoped.scope = EventScope::default();
    assert!(matches!(
        env.plan_api.apply_events(&plan_id, vec![unscoped]),
        Err(ApiError::InvalidEvent { .. })
    ));
    assert_eq!(env.plan_api.list_versions(&plan_id).unwrap(), vec![1]);
}

#[test]
fn test_rolling_window_holds_tasks_beyond_window() {
    let fixture = || {
        snapshot(
            vec![wp("WP-A", 3, None)],
            vec![
                task("FIT-SEAL", "WP-A", 60, &[("SEAL-KIT", 5)]),
                task("PREP-BAY", "WP-A", 60, &[("BAY-X", 1)]),
            ],
            vec![material("SEAL-KIT", 3, true, Some(6)), Resource::workspace("BAY-X", 1)],
        )
    };
    let receipt = || {
        resource_event(
            "E-GR-9",
            hours(1),
            "SEAL-KIT",
            EventPayload::MaterialReceipt {
                resource_id: "SEAL-KIT".into(),
                available_quantity: 5,
            },
        )
    };

    // 仅 ReplanUnstarted: 到货后提前到到货时刻
    let open = TestEnv::new();
    let open_plan = open.plan_api.generate_plan(request(fixture())).unwrap().plan_id;
    open.clock.set(hours(1));
    open.plan_api.apply_events(&open_plan, vec![receipt()]).unwrap();
    let moved = open.plan_api.get_plan(&open_plan, None).unwrap();
    assert_eq!(moved.assignment("FIT-SEAL").unwrap().start, hours(1));

    // 同批含 2h 滚动窗口: 最严格策略生效, 窗口外任务不提前
    let held = TestEnv::new();
    let held_plan = held.plan_api.generate_plan(request(fixture())).unwrap().plan_id;
    held.clock.set(hours(1));
    let mut maintenance = resource_event(
        "E-BAY-1",
        hours(1),
        "BAY-X",
        EventPayload::ResourceStatus {
            resource_id: "BAY-X".into(),
            unavailable_from: hours(20),
            unavailable_until: hours(21),
            reason: Some("floor coating".into()),
        },
    );
    maintenance.policy = ReplanPolicy::RollingWindow { window_hours: 2 };
    let resp = held
        .plan_api
        .apply_events(&held_plan, vec![receipt(), maintenance])
        .unwrap();
    assert_eq!(resp.policy, ReplanPolicy::RollingWindow { window_hours: 2 });
    let kept = held.plan_api.get_plan(&held_plan, None).unwrap();
    assert_eq!(kept.assignment("FIT-SEAL").unwrap().start, hours(6));
}

#[test]
fn test_summary_reports_gates_risks_and_critical_path() {
    let env = TestEnv::new();
    let mut check = task("T-CHECK", "WP-A", 0, &[]);
    check.is_gate = true;
    let mut snap = snapshot(
        vec![wp("WP-A", 5, Some(3)), wp("WP-B", 1, Some(72))],
        vec![
            check,
            after(task("T-KIT", "WP-A", 120, &[("BAY-1", 1)]), &["T-CHECK"]),
            task("T-B", "WP-B", 60, &[("BAY-1", 1)]),
        ],
        vec![Resource::workspace("BAY-1", 1)],
    );
    let mut gate = Gate::new(
        "G-1",
        GateType::QecShelfHandover,
        GateTarget::Task {
            task_id: "T-CHECK".into(),
        },
    );
    gate.required_evidence = vec![mro_prep_aps::domain::EvidenceType::HandoverForm];
    gate.resolution_eta = Some(hours(2));
    snap.gates.push(gate);
    let plan_id = env.plan_api.generate_plan(request(snap)).unwrap().plan_id;

    let summary = env.plan_api.summarize(&plan_id).unwrap();
    assert_eq!(summary.version, 1);
    assert_eq!(summary.gate_pass_rate, 0.0);
    assert_eq!(summary.gates.len(), 1);
    let plan = env.plan_api.get_plan(&plan_id, None).unwrap();
    assert_eq!(summary.expected_ready_time, plan.makespan);

    // T-KIT 最早 +2h 开工, 2h 工期, 超过 +3h 截止
    let wp_a = summary
        .sla_risks
        .iter()
        .find(|r| r.work_package_id == "WP-A" && r.gate_id.is_none())
        .unwrap();
    assert_eq!(wp_a.level, RiskLevel::Red);
    assert!(wp_a.buffer_minutes.unwrap() < 0);
    let wp_b = summary.sla_risks.iter().find(|r| r.work_package_id == "WP-B").unwrap();
    assert_eq!(wp_b.level, RiskLevel::Green);

    assert_eq!(summary.critical_path.last().map(String::as_str), Some("T-KIT"));
    assert_eq!(summary.kpis.task_count, 3);

    // 只读: 摘要不产生新版本
    assert_eq!(env.plan_api.list_versions(&plan_id).unwrap(), vec![1]);
}
