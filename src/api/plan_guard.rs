// ==========================================
// 维修准备排产系统 - 计划在途变更守卫
// ==========================================
// 职责: 同一计划同一时刻至多一个变更 (重排/抢占/交接确认)
// 策略: Reject 立即返回 PlanBusy; Wait 在条件变量上等待, 超时返回 PlanBusy
// 说明: 不同计划互不阻塞
// ==========================================

use std::collections::HashSet;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::api::error::{ApiError, ApiResult};
use crate::config::scheduler_config::BusyPolicy;

pub struct PlanGuard {
    inflight: Mutex<HashSet<String>>,
    released: Condvar,
    policy: BusyPolicy,
}

/// 在途租约, 析构时释放
pub struct PlanLease<'a> {
    guard: &'a PlanGuard,
    key: String,
}

impl PlanGuard {
    pub fn new(policy: BusyPolicy) -> Self {
        Self {
            inflight: Mutex::new(HashSet::new()),
            released: Condvar::new(),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        // 集合内容只在持锁期间增删, 中毒后仍可继续使用
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn acquire(&self, key: &str) -> ApiResult<PlanLease<'_>> {
        let mut set = self.lock();
        if set.contains(key) {
            match self.policy {
                BusyPolicy::Reject => {
                    tracing::info!(plan_id = key, "计划正在变更, 拒绝新请求");
                    return Err(ApiError::PlanBusy { plan_id: key.to_string() });
                }
                BusyPolicy::Wait { timeout_ms } => {
                    let (next, _) = self
                        .released
                        .wait_timeout_while(set, Duration::from_millis(timeout_ms), |s| s.contains(key))
                        .unwrap_or_else(|e| e.into_inner());
                    set = next;
                    if set.contains(key) {
                        tracing::info!(plan_id = key, timeout_ms, "等待在途变更超时");
                        return Err(ApiError::PlanBusy { plan_id: key.to_string() });
                    }
                }
            }
        }
        set.insert(key.to_string());
        Ok(PlanLease {
            guard: self,
            key: key.to_string(),
        })
    }

    pub fn is_busy(&self, key: &str) -> bool {
        self.lock().contains(key)
    }
}

impl Drop for PlanLease<'_> {
    fn drop(&mut self) {
        self.guard.lock().remove(&self.key);
        self.guard.released.notify_all();
    }
}
