// ==========================================
// 维修准备排产系统 - 计划数据仓储
// ==========================================
// 表: plan_header (当前版本/幂等键/输入指纹/建模参数)
//     plan_version (每版本一份 JSON 文档)
// 红线: Repository 不含业务逻辑
// 红线: 版本提交是乐观并发, 基线版本不匹配时拒绝; 版本行只插入不更新
// ==========================================

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::config::objective_policy::TemplateRef;
use crate::domain::{DomainEvent, Plan, PreemptionRecord};
use crate::engine::model_builder::ModelSettings;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::event_log_repo::append_events;
use crate::repository::preemption_repo::{append_record, count_involving};

/// 计划头
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanHeader {
    pub plan_id: String,
    pub current_version: u32,
    pub idempotency_key: Option<String>,
    /// 生成请求的 SHA-256 指纹
    pub input_fingerprint: String,
    /// 建模参数, 后续重排/抢占沿用
    pub settings: ModelSettings,
    pub objective_policy_version: u32,
    /// 请求显式指定的模板 (覆盖策略选择)
    pub request_template: Option<TemplateRef>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 一次版本提交的全部内容 (同一事务写入)
pub struct VersionCommit<'a> {
    pub plan: &'a Plan,
    pub base_version: u32,
    /// 本版本消费的领域事件
    pub events: &'a [DomainEvent],
    pub preemption: Option<PreemptionCommit<'a>>,
}

/// 随版本写入的抢占记录, 提交时在同一事务内复核滚动24h次数
#[derive(Clone, Copy)]
pub struct PreemptionCommit<'a> {
    pub record: &'a PreemptionRecord,
    pub max_per_day: u32,
}

// ==========================================
// PlanRepository - 计划仓储
// ==========================================
pub struct PlanRepository {
    conn: Arc<Mutex<Connection>>,
}

impl PlanRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// 获取数据库连接
    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 创建计划 (计划头 + 版本 1)
    pub fn create(&self, header: &PlanHeader, plan: &Plan) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            r#"INSERT INTO plan_header (
                plan_id, current_version, idempotency_key, input_fingerprint,
                settings_json, objective_policy_version, request_template_json,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                header.plan_id,
                header.current_version,
                header.idempotency_key,
                header.input_fingerprint,
                serde_json::to_string(&header.settings)?,
                header.objective_policy_version,
                header
                    .request_template
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                header.created_at.to_rfc3339(),
                header.updated_at.to_rfc3339(),
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(_, Some(msg))) if msg.contains("idempotency_key") => {
                return Err(RepositoryError::IdempotencyConflict {
                    key: header.idempotency_key.clone().unwrap_or_default(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        insert_version(&tx, plan)?;
        tx.commit()?;
        Ok(())
    }

    /// 提交新版本
    ///
    /// # 返回
    /// - `Err(VersionConflict)`: 当前版本已不是 base_version
    pub fn commit_version(&self, commit: VersionCommit<'_>) -> RepositoryResult<()> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction()?;
        let plan = commit.plan;

        let current: u32 = tx
            .query_row(
                "SELECT current_version FROM plan_header WHERE plan_id = ?1",
                params![plan.plan_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| RepositoryError::NotFound {
                entity: "plan_header".to_string(),
                id: plan.plan_id.clone(),
            })?;
        if current != commit.base_version || plan.version != commit.base_version + 1 {
            return Err(RepositoryError::VersionConflict {
                plan_id: plan.plan_id.clone(),
                expected: commit.base_version,
                actual: current,
            });
        }

        tx.execute(
            "UPDATE plan_header SET current_version = ?1, updated_at = ?2 \
             WHERE plan_id = ?3 AND current_version = ?4",
            params![plan.version, plan.created_at.to_rfc3339(), plan.plan_id, commit.base_version],
        )?;
        insert_version(&tx, plan)?;
        append_events(&tx, &plan.plan_id, plan.version, commit.events, plan.created_at)?;
        if let Some(preemption) = commit.preemption {
            check_preemption_limit(&tx, preemption)?;
            append_record(&tx, preemption.record)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn find_header(&self, plan_id: &str) -> RepositoryResult<Option<PlanHeader>> {
        let conn = self.get_conn()?;
        let header = conn
            .query_row(
                &format!("{} WHERE plan_id = ?1", HEADER_SELECT),
                params![plan_id],
                map_header,
            )
            .optional()?;
        Ok(header)
    }

    pub fn find_by_idempotency_key(&self, key: &str) -> RepositoryResult<Option<PlanHeader>> {
        let conn = self.get_conn()?;
        let header = conn
            .query_row(
                &format!("{} WHERE idempotency_key = ?1", HEADER_SELECT),
                params![key],
                map_header,
            )
            .optional()?;
        Ok(header)
    }

    /// 按版本号读取计划
    pub fn find_version(&self, plan_id: &str, version: u32) -> RepositoryResult<Option<Plan>> {
        let conn = self.get_conn()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT plan_json FROM plan_version WHERE plan_id = ?1 AND version = ?2",
                params![plan_id, version],
                |row| row.get(0),
            )
            .optional()?;
        raw.map(|json| serde_json::from_str(&json).map_err(RepositoryError::from))
            .transpose()
    }

    /// 读取最新版本
    pub fn find_latest(&self, plan_id: &str) -> RepositoryResult<Option<Plan>> {
        let Some(header) = self.find_header(plan_id)? else {
            return Ok(None);
        };
        self.find_version(plan_id, header.current_version)
    }

    pub fn list_versions(&self, plan_id: &str) -> RepositoryResult<Vec<u32>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT version FROM plan_version WHERE plan_id = ?1 ORDER BY version")?;
        let versions = stmt
            .query_map(params![plan_id], |row| row.get(0))?
            .collect::<Result<Vec<u32>, _>>()?;
        Ok(versions)
    }
}

const HEADER_SELECT: &str = r#"SELECT plan_id, current_version, idempotency_key, input_fingerprint,
        settings_json, objective_policy_version, request_template_json, created_at, updated_at
   FROM plan_header"#;

fn insert_version(conn: &Connection, plan: &Plan) -> RepositoryResult<()> {
    conn.execute(
        r#"INSERT INTO plan_version (plan_id, version, base_version, plan_json, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5)"#,
        params![
            plan.plan_id,
            plan.version,
            plan.base_version,
            serde_json::to_string(plan)?,
            plan.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// 其他计划的并发抢占可能已在预检之后写入记录, 这里按提交时的数据复核
fn check_preemption_limit(conn: &Connection, preemption: PreemptionCommit<'_>) -> RepositoryResult<()> {
    let record = preemption.record;
    let since = record.created_at - Duration::hours(24);
    let limit = preemption.max_per_day as i64;
    let involved = std::iter::once(&record.preempting_work_package_id).chain(record.preempted_work_package_ids.iter());
    for work_package_id in involved {
        let observed = count_involving(conn, work_package_id, since, record.created_at)? + 1;
        if observed > limit {
            return Err(RepositoryError::PreemptionLimitExceeded {
                work_package_id: work_package_id.clone(),
                limit,
                observed,
            });
        }
    }
    Ok(())
}

fn json_column<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

pub(crate) fn time_column(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

/// 映射数据库行到 PlanHeader
fn map_header(row: &rusqlite::Row) -> rusqlite::Result<PlanHeader> {
    let template: Option<String> = row.get(6)?;
    Ok(PlanHeader {
        plan_id: row.get(0)?,
        current_version: row.get(1)?,
        idempotency_key: row.get(2)?,
        input_fingerprint: row.get(3)?,
        settings: json_column(4, &row.get::<_, String>(4)?)?,
        objective_policy_version: row.get(5)?,
        request_template: template.map(|raw| json_column(6, &raw)).transpose()?,
        created_at: time_column(7, &row.get::<_, String>(7)?)?,
        updated_at: time_column(8, &row.get::<_, String>(8)?)?,
    })
}
