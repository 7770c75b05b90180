// ==========================================
// 维修准备排产系统 - 目标优先级模板与策略版本
// ==========================================
// 职责: 模板 (名称 → 权重向量)、作用域覆盖、灰度发布的选择逻辑
// 红线: 策略对象不可变, 每次变更产生新版本; 求解时显式传入, 不使用可变全局量
// 红线: 灰度是建模前按工作包一次性求值的选择策略, 不是求解器特性
// ==========================================
// 存储位置: config_kv (scope_id='global', key='objective_policy/v{version}')
// ==========================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ==========================================
// PriorityTemplate - 预设模板
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityTemplate {
    Balanced,
    ProtectSla,
    CostMin,
}

impl PriorityTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityTemplate::Balanced => "balanced",
            PriorityTemplate::ProtectSla => "protect_sla",
            PriorityTemplate::CostMin => "cost_min",
        }
    }

    pub fn title_cn(&self) -> &'static str {
        match self {
            PriorityTemplate::Balanced => "均衡",
            PriorityTemplate::ProtectSla => "保障SLA",
            PriorityTemplate::CostMin => "成本最低",
        }
    }

    /// 模板默认权重 (sla, wait, switch, preference)
    pub fn default_weights(&self) -> ObjectiveWeights {
        match self {
            PriorityTemplate::Balanced => ObjectiveWeights::new(1000.0, 10.0, 5.0, 1.0),
            PriorityTemplate::ProtectSla => ObjectiveWeights::new(10000.0, 5.0, 2.0, 1.0),
            PriorityTemplate::CostMin => ObjectiveWeights::new(500.0, 5.0, 20.0, 2.0),
        }
    }
}

impl Default for PriorityTemplate {
    fn default() -> Self {
        PriorityTemplate::Balanced
    }
}

impl std::str::FromStr for PriorityTemplate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "balanced" => Ok(PriorityTemplate::Balanced),
            "protect_sla" | "protect-sla" => Ok(PriorityTemplate::ProtectSla),
            "cost_min" | "cost-min" => Ok(PriorityTemplate::CostMin),
            other => Err(format!("未知优先级模板: {}", other)),
        }
    }
}

// ==========================================
// 权重
// ==========================================

/// 四项目标权重
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectiveWeights {
    pub sla_violation: f64,
    pub wait_time: f64,
    pub switch_cost: f64,
    pub preference: f64,
}

impl ObjectiveWeights {
    pub const fn new(sla_violation: f64, wait_time: f64, switch_cost: f64, preference: f64) -> Self {
        Self {
            sla_violation,
            wait_time,
            switch_cost,
            preference,
        }
    }
}

/// 权重覆盖 (字段级, 未填写沿用模板值)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WeightOverrides {
    #[serde(default)]
    pub sla_violation: Option<f64>,
    #[serde(default)]
    pub wait_time: Option<f64>,
    #[serde(default)]
    pub switch_cost: Option<f64>,
    #[serde(default)]
    pub preference: Option<f64>,
}

impl WeightOverrides {
    pub fn is_empty(&self) -> bool {
        self.sla_violation.is_none()
            && self.wait_time.is_none()
            && self.switch_cost.is_none()
            && self.preference.is_none()
    }

    /// 校验覆盖值 (必须为有限非负数)
    pub fn validate(&self) -> Result<(), String> {
        let fields = [
            ("sla_violation", self.sla_violation),
            ("wait_time", self.wait_time),
            ("switch_cost", self.switch_cost),
            ("preference", self.preference),
        ];
        for (name, value) in fields {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(format!("权重覆盖无效: {}={}", name, v));
                }
            }
        }
        Ok(())
    }
}

/// 模板引用 = 模板 + 覆盖
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TemplateRef {
    pub template: PriorityTemplate,
    #[serde(default)]
    pub overrides: WeightOverrides,
}

impl TemplateRef {
    pub fn new(template: PriorityTemplate) -> Self {
        Self {
            template,
            overrides: WeightOverrides::default(),
        }
    }

    pub fn resolve(&self) -> ObjectiveWeights {
        let base = self.template.default_weights();
        ObjectiveWeights {
            sla_violation: self.overrides.sla_violation.unwrap_or(base.sla_violation),
            wait_time: self.overrides.wait_time.unwrap_or(base.wait_time),
            switch_cost: self.overrides.switch_cost.unwrap_or(base.switch_cost),
            preference: self.overrides.preference.unwrap_or(base.preference),
        }
    }

    pub fn label(&self) -> String {
        if self.overrides.is_empty() {
            self.template.as_str().to_string()
        } else {
            format!("{}+overrides", self.template.as_str())
        }
    }
}

// ==========================================
// 作用域与灰度
// ==========================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopedTemplate {
    pub work_packages: Vec<String>,
    pub template: TemplateRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolloutState {
    Running,
    Promoted,
    RolledBack,
}

/// 灰度发布
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrayscaleRollout {
    pub rollout_id: String,
    pub candidate: TemplateRef,
    /// 进入灰度的工作包比例 (0~1)
    pub fraction: f64,
    /// 仅对这些工作包灰度, None 表示全部
    #[serde(default)]
    pub scope: Option<Vec<String>>,
    pub starts_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub state: RolloutState,
}

impl GrayscaleRollout {
    /// 稳定分桶: sha256(rollout_id:work_package_id) 前 8 字节映射到 [0,1)
    pub fn bucket(&self, work_package_id: &str) -> f64 {
        let mut hasher = Sha256::new();
        hasher.update(self.rollout_id.as_bytes());
        hasher.update(b":");
        hasher.update(work_package_id.as_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(head) as f64) / (u64::MAX as f64 + 1.0)
    }

    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.state == RolloutState::Running && at >= self.starts_at && at < self.expires_at
    }

    pub fn covers(&self, work_package_id: &str, at: DateTime<Utc>) -> bool {
        if !self.is_active_at(at) {
            return false;
        }
        let in_scope = match &self.scope {
            Some(ids) => ids.iter().any(|id| id == work_package_id),
            None => true,
        };
        in_scope && self.bucket(work_package_id) < self.fraction
    }
}

/// 模板选择来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionSource {
    Global,
    Scoped,
    Rollout,
}

impl SelectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionSource::Global => "GLOBAL",
            SelectionSource::Scoped => "SCOPED",
            SelectionSource::Rollout => "ROLLOUT",
        }
    }
}

// ==========================================
// ObjectivePolicy - 版本化策略对象
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectivePolicy {
    pub version: u32,
    pub global: TemplateRef,
    #[serde(default)]
    pub scoped: Vec<ScopedTemplate>,
    #[serde(default)]
    pub rollout: Option<GrayscaleRollout>,
    pub created_at: DateTime<Utc>,
}

impl ObjectivePolicy {
    pub fn initial(template: TemplateRef, at: DateTime<Utc>) -> Self {
        Self {
            version: 1,
            global: template,
            scoped: Vec::new(),
            rollout: None,
            created_at: at,
        }
    }

    fn next(&self, at: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.created_at = at;
        next
    }

    /// 应用模板, 返回新版本
    ///
    /// - scope 为空: 全局生效, 清除作用域覆盖
    /// - scope 非空: 仅对列出的工作包生效, 其它工作包沿用原模板
    pub fn apply_template(
        &self,
        template: TemplateRef,
        scope: Option<&[String]>,
        at: DateTime<Utc>,
    ) -> Result<Self, String> {
        template.overrides.validate()?;
        let mut next = self.next(at);
        match scope {
            None => {
                next.global = template;
                next.scoped.clear();
            }
            Some(ids) if ids.is_empty() => {
                return Err("作用域工作包列表为空".to_string());
            }
            Some(ids) => {
                for entry in next.scoped.iter_mut() {
                    entry.work_packages.retain(|w| !ids.contains(w));
                }
                next.scoped.retain(|entry| !entry.work_packages.is_empty());
                next.scoped.push(ScopedTemplate {
                    work_packages: ids.to_vec(),
                    template,
                });
            }
        }
        Ok(next)
    }

    pub fn start_rollout(&self, rollout: GrayscaleRollout, at: DateTime<Utc>) -> Result<Self, String> {
        if !(0.0..=1.0).contains(&rollout.fraction) {
            return Err(format!("灰度比例无效: {}", rollout.fraction));
        }
        if rollout.expires_at <= rollout.starts_at {
            return Err("灰度结束时间必须晚于开始时间".to_string());
        }
        if let Some(current) = &self.rollout {
            if current.is_active_at(at) {
                return Err(format!("已有进行中的灰度: {}", current.rollout_id));
            }
        }
        rollout.candidate.overrides.validate()?;

        let mut next = self.next(at);
        next.rollout = Some(GrayscaleRollout {
            state: RolloutState::Running,
            ..rollout
        });
        Ok(next)
    }

    /// 灰度转正: 候选模板成为作用域 (或全局) 模板
    pub fn promote_rollout(&self, at: DateTime<Utc>) -> Result<Self, String> {
        let rollout = match &self.rollout {
            Some(r) if r.state == RolloutState::Running => r.clone(),
            _ => return Err("没有可转正的灰度".to_string()),
        };
        let mut next = match &rollout.scope {
            Some(ids) => self.apply_template(rollout.candidate.clone(), Some(ids), at)?,
            None => self.apply_template(rollout.candidate.clone(), None, at)?,
        };
        next.rollout = Some(GrayscaleRollout {
            state: RolloutState::Promoted,
            ..rollout
        });
        Ok(next)
    }

    pub fn rollback_rollout(&self, at: DateTime<Utc>) -> Result<Self, String> {
        let rollout = match &self.rollout {
            Some(r) if r.state == RolloutState::Running => r.clone(),
            _ => return Err("没有可回滚的灰度".to_string()),
        };
        let mut next = self.next(at);
        next.rollout = Some(GrayscaleRollout {
            state: RolloutState::RolledBack,
            ..rollout
        });
        Ok(next)
    }

    /// 为工作包选择模板 (灰度 > 作用域 > 全局)
    pub fn select_for(&self, work_package_id: &str, at: DateTime<Utc>) -> (TemplateRef, SelectionSource) {
        if let Some(rollout) = &self.rollout {
            if rollout.covers(work_package_id, at) {
                return (rollout.candidate.clone(), SelectionSource::Rollout);
            }
        }
        // 后写入的作用域覆盖优先
        if let Some(entry) = self
            .scoped
            .iter()
            .rev()
            .find(|entry| entry.work_packages.iter().any(|w| w == work_package_id))
        {
            return (entry.template.clone(), SelectionSource::Scoped);
        }
        (self.global.clone(), SelectionSource::Global)
    }
}
