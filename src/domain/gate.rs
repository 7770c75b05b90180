// ==========================================
// 维修准备排产系统 - 门禁
// ==========================================
// 职责: 门禁条件与证据提交的显式状态迁移
// 红线: 门禁未通过时, 被门禁的任务不得早于门禁解除时间开工
// 红线: passed 只能通过迁移函数翻转, 建模器只读取快照中的门禁状态
// ==========================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::types::{EvidenceType, GateType};

/// 门禁挂载目标
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateTarget {
    /// 挂在门禁任务上, 阻断该任务的后续任务
    Task { task_id: String },
    /// 挂在工作包上, 阻断该工作包内所有非门禁任务
    WorkPackage { work_package_id: String },
}

/// 证据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub evidence_type: EvidenceType,
    pub content: String,
    pub submitted_by: String,
    pub submitted_at: DateTime<Utc>,
}

/// 门禁状态迁移结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateTransition {
    /// 本次迁移使门禁通过
    Passed,
    /// 仍有缺失证据或未满足条件
    StillPending {
        missing_evidence: Vec<EvidenceType>,
        pending_conditions: Vec<String>,
    },
    /// 门禁此前已通过
    AlreadyPassed,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GateError {
    #[error("证据无效: gate_id={gate_id}, 原因={reason}")]
    InvalidEvidence { gate_id: String, reason: String },

    #[error("门禁条件不存在: gate_id={gate_id}, condition={condition}")]
    UnknownCondition { gate_id: String, condition: String },
}

/// 门禁
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gate {
    pub gate_id: String,
    #[serde(default)]
    pub name: String,
    pub gate_type: GateType,
    pub target: GateTarget,
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub passed_at: Option<DateTime<Utc>>,
    /// 预计解除时间 (未通过且无ETA时, 被门禁任务无法排产)
    #[serde(default)]
    pub resolution_eta: Option<DateTime<Utc>>,
    #[serde(default)]
    pub required_evidence: Vec<EvidenceType>,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    /// 外部条件 (例如 SAP 指令号), 由事件满足
    #[serde(default)]
    pub pending_conditions: Vec<String>,
}

impl Gate {
    pub fn new(gate_id: &str, gate_type: GateType, target: GateTarget) -> Self {
        Self {
            gate_id: gate_id.to_string(),
            name: gate_id.to_string(),
            gate_type,
            target,
            passed: false,
            passed_at: None,
            resolution_eta: None,
            required_evidence: Vec::new(),
            evidence: Vec::new(),
            pending_conditions: Vec::new(),
        }
    }

    pub fn missing_evidence(&self) -> Vec<EvidenceType> {
        let mut missing: Vec<EvidenceType> = self
            .required_evidence
            .iter()
            .filter(|required| !self.evidence.iter().any(|e| e.evidence_type == **required))
            .copied()
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }

    /// 提交证据 (外部证据处理器同步调用)
    pub fn submit_evidence(
        &mut self,
        evidence: Evidence,
    ) -> Result<GateTransition, GateError> {
        if self.passed {
            return Ok(GateTransition::AlreadyPassed);
        }
        if evidence.content.trim().is_empty() {
            return Err(GateError::InvalidEvidence {
                gate_id: self.gate_id.clone(),
                reason: "证据内容为空".to_string(),
            });
        }
        if evidence.submitted_by.trim().is_empty() {
            return Err(GateError::InvalidEvidence {
                gate_id: self.gate_id.clone(),
                reason: "缺少提交人".to_string(),
            });
        }

        let at = evidence.submitted_at;
        self.evidence.push(evidence);
        Ok(self.evaluate(at))
    }

    /// 满足外部条件 (例如 SAP 指令状态更新)
    pub fn satisfy_condition(
        &mut self,
        condition: &str,
        at: DateTime<Utc>,
    ) -> Result<GateTransition, GateError> {
        if self.passed {
            return Ok(GateTransition::AlreadyPassed);
        }
        let before = self.pending_conditions.len();
        self.pending_conditions.retain(|c| c != condition);
        if self.pending_conditions.len() == before {
            return Err(GateError::UnknownCondition {
                gate_id: self.gate_id.clone(),
                condition: condition.to_string(),
            });
        }
        Ok(self.evaluate(at))
    }

    /// 资源就绪类门禁: 底层资源条件已满足, 其余证据/条件仍需齐全
    pub fn confirm_readiness(&mut self, at: DateTime<Utc>) -> GateTransition {
        if self.passed {
            return GateTransition::AlreadyPassed;
        }
        self.evaluate(at)
    }

    /// 是否由资源状态推导 (航材齐套 / 关键工装就绪)
    pub fn is_readiness_gate(&self) -> bool {
        matches!(self.gate_type, GateType::MaterialsReady | GateType::CriticalToolsReady)
    }

    fn evaluate(&mut self, at: DateTime<Utc>) -> GateTransition {
        let missing_evidence = self.missing_evidence();
        if missing_evidence.is_empty() && self.pending_conditions.is_empty() {
            self.passed = true;
            self.passed_at = Some(at);
            GateTransition::Passed
        } else {
            GateTransition::StillPending {
                missing_evidence,
                pending_conditions: self.pending_conditions.clone(),
            }
        }
    }

    /// 门禁解除时间: 已通过取通过时间, 否则取预计解除时间
    pub fn resolution_time(&self) -> Option<DateTime<Utc>> {
        if self.passed {
            self.passed_at
        } else {
            self.resolution_eta
        }
    }
}
