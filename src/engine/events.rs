// ==========================================
// 维修准备排产系统 - 引擎层事件发布
// ==========================================
// 职责: 定义计划事件发布 trait, 实现依赖倒置
// 说明: Engine 层定义 trait, 外部 (看板/消息总线) 实现适配器
// ==========================================

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::sync::Arc;

// ==========================================
// 计划事件类型
// ==========================================

/// 计划事件触发类型
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanEventType {
    /// 新计划生成
    PlanGenerated,
    /// 事件驱动重排生成新版本
    PlanReplanned,
    /// 重排失败, 计划保持上一版本
    ReplanFailed,
    /// 抢占生效
    PreemptionApplied,
    /// 交接确认 (门禁通过)
    HandoverConfirmed,
    /// 目标策略变更
    PolicyChanged,
}

impl PlanEventType {
    pub fn as_str(&self) -> &str {
        match self {
            PlanEventType::PlanGenerated => "PlanGenerated",
            PlanEventType::PlanReplanned => "PlanReplanned",
            PlanEventType::ReplanFailed => "ReplanFailed",
            PlanEventType::PreemptionApplied => "PreemptionApplied",
            PlanEventType::HandoverConfirmed => "HandoverConfirmed",
            PlanEventType::PolicyChanged => "PolicyChanged",
        }
    }
}

/// 计划事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanEvent {
    pub plan_id: String,
    /// 事件对应的计划版本
    pub version: u32,
    pub event_type: PlanEventType,
    /// 事件来源描述
    pub source: Option<String>,
    /// 受影响的工作包 (None 表示全部)
    pub affected_work_packages: Option<Vec<String>>,
    pub is_full_scope: bool,
}

impl PlanEvent {
    /// 创建全量事件
    pub fn full_scope(plan_id: &str, version: u32, event_type: PlanEventType, source: Option<String>) -> Self {
        Self {
            plan_id: plan_id.to_string(),
            version,
            event_type,
            source,
            affected_work_packages: None,
            is_full_scope: true,
        }
    }

    /// 创建增量事件
    pub fn scoped(
        plan_id: &str,
        version: u32,
        event_type: PlanEventType,
        source: Option<String>,
        work_packages: Vec<String>,
    ) -> Self {
        Self {
            plan_id: plan_id.to_string(),
            version,
            event_type,
            source,
            affected_work_packages: Some(work_packages),
            is_full_scope: false,
        }
    }
}

// ==========================================
// 事件发布 Trait
// ==========================================

/// 计划事件发布者
///
/// # 返回
/// - `Ok(id)`: 下游分配的消息 ID (不支持时为空字符串)
/// - `Err`: 发布失败 (调用方只记录日志, 不影响计划提交)
pub trait PlanEventPublisher: Send + Sync {
    fn publish(&self, event: PlanEvent) -> Result<String, Box<dyn Error + Send + Sync>>;
}

/// 空操作事件发布者 (单元测试/CLI)
#[derive(Debug, Clone, Default)]
pub struct NoOpEventPublisher;

impl PlanEventPublisher for NoOpEventPublisher {
    fn publish(&self, event: PlanEvent) -> Result<String, Box<dyn Error + Send + Sync>> {
        tracing::debug!(
            "NoOpEventPublisher: 跳过事件发布 - plan_id={}, version={}, event_type={}",
            event.plan_id,
            event.version,
            event.event_type.as_str()
        );
        Ok(String::new())
    }
}

/// 可选的事件发布者包装
pub struct OptionalEventPublisher {
    inner: Option<Arc<dyn PlanEventPublisher>>,
}

impl OptionalEventPublisher {
    pub fn with_publisher(publisher: Arc<dyn PlanEventPublisher>) -> Self {
        Self {
            inner: Some(publisher),
        }
    }

    pub fn none() -> Self {
        Self { inner: None }
    }

    /// 发布事件 (失败只记录告警)
    pub fn publish(&self, event: PlanEvent) {
        let Some(publisher) = &self.inner else {
            tracing::debug!(
                "OptionalEventPublisher: 未配置发布者, 跳过事件 - plan_id={}, event_type={}",
                event.plan_id,
                event.event_type.as_str()
            );
            return;
        };
        let event_type = event.event_type.as_str().to_string();
        if let Err(e) = publisher.publish(event) {
            tracing::warn!(event_type = %event_type, error = %e, "计划事件发布失败");
        }
    }

    pub fn is_configured(&self) -> bool {
        self.inner.is_some()
    }
}

impl Default for OptionalEventPublisher {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder(Mutex<Vec<PlanEvent>>);

    impl PlanEventPublisher for Recorder {
        fn publish(&self, event: PlanEvent) -> Result<String, Box<dyn Error + Send + Sync>> {
            self.0.lock().unwrap().push(event);
            Ok("MSG-1".to_string())
        }
    }

    #[test]
    fn test_plan_event_scoped() {
        let event = PlanEvent::scoped(
            "P1",
            3,
            PlanEventType::PreemptionApplied,
            Some("PreemptionManager".to_string()),
            vec!["WP-A".to_string(), "WP-B".to_string()],
        );
        assert!(!event.is_full_scope);
        assert_eq!(event.affected_work_packages.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_noop_publisher() {
        let event = PlanEvent::full_scope("P1", 1, PlanEventType::PlanGenerated, None);
        let result = NoOpEventPublisher.publish(event);
        assert!(result.unwrap().is_empty());
    }

    #[test]
    fn test_optional_publisher_forwards() {
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let publisher = OptionalEventPublisher::with_publisher(recorder.clone());
        assert!(publisher.is_configured());

        publisher.publish(PlanEvent::full_scope("P1", 2, PlanEventType::PlanReplanned, None));
        let events = recorder.0.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, PlanEventType::PlanReplanned);
    }

    #[test]
    fn test_optional_publisher_none() {
        let publisher = OptionalEventPublisher::none();
        assert!(!publisher.is_configured());
        publisher.publish(PlanEvent::full_scope("P1", 1, PlanEventType::HandoverConfirmed, None));
    }
}
