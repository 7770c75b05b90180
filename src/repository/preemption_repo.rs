// ==========================================
// 维修准备排产系统 - 抢占记录仓储
// ==========================================
// 表: preemption_record (只追加, 触发器拦截修改/删除)
// 用途: 审计 + 护栏滚动24h计数
// ==========================================

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

use crate::domain::PreemptionRecord;
use crate::repository::error::{RepositoryError, RepositoryResult};

pub struct PreemptionRepository {
    conn: Arc<Mutex<Connection>>,
}

impl PreemptionRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 指定时间之后创建的全部记录 (护栏计数)
    pub fn list_since(&self, since: DateTime<Utc>) -> RepositoryResult<Vec<PreemptionRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT record_json FROM preemption_record WHERE created_at > ?1 ORDER BY created_at, record_id",
        )?;
        let rows = stmt
            .query_map(params![since.to_rfc3339()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        decode_all(rows)
    }

    pub fn list_by_plan(&self, plan_id: &str) -> RepositoryResult<Vec<PreemptionRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT record_json FROM preemption_record WHERE plan_id = ?1 ORDER BY to_version",
        )?;
        let rows = stmt
            .query_map(params![plan_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        decode_all(rows)
    }
}

fn decode_all(rows: Vec<String>) -> RepositoryResult<Vec<PreemptionRecord>> {
    rows.iter()
        .map(|raw| serde_json::from_str(raw).map_err(RepositoryError::from))
        .collect()
}

/// 在调用方事务内追加记录
///
/// created_at 统一存 UTC RFC3339, 字符串序即时间序
pub(crate) fn append_record(conn: &Connection, record: &PreemptionRecord) -> RepositoryResult<()> {
    conn.execute(
        r#"INSERT INTO preemption_record (
            record_id, plan_id, from_version, to_version,
            preempting_work_package_id, record_json, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
        params![
            record.record_id,
            record.plan_id,
            record.from_version,
            record.to_version,
            record.preempting_work_package_id,
            serde_json::to_string(record)?,
            record.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// 在调用方事务内统计工作包在 (since, until] 内参与的抢占次数
pub(crate) fn count_involving(
    conn: &Connection,
    work_package_id: &str,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> RepositoryResult<i64> {
    let mut stmt = conn.prepare(
        "SELECT record_json FROM preemption_record WHERE created_at > ?1 AND created_at <= ?2",
    )?;
    let rows = stmt
        .query_map(params![since.to_rfc3339(), until.to_rfc3339()], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let count = decode_all(rows)?
        .iter()
        .filter(|r| r.involves(work_package_id))
        .count();
    Ok(count as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RecoveryPlan;
    use chrono::{Duration, TimeZone};

    fn setup_test_db() -> Arc<Mutex<Connection>> {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::configure_sqlite_connection(&conn).unwrap();
        crate::db::init_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO plan_header (plan_id, current_version, input_fingerprint, settings_json, \
             objective_policy_version, created_at, updated_at) VALUES ('P1', 1, 'x', '{}', 1, 't', 't')",
            [],
        )
        .unwrap();
        Arc::new(Mutex::new(conn))
    }

    fn make_record(id: &str, created_at: DateTime<Utc>) -> PreemptionRecord {
        PreemptionRecord {
            record_id: id.to_string(),
            plan_id: "P1".into(),
            from_version: 1,
            to_version: 2,
            preempting_work_package_id: "WP-A".into(),
            preempted_work_package_ids: vec!["WP-B".into()],
            resource_ids: vec!["BAY-A".into()],
            triggers: vec![],
            reason: "test".into(),
            impacted_tasks: vec!["B-1".into()],
            delay_minutes: 180,
            recovery_plan: RecoveryPlan {
                actions: vec![],
                expected_recovery_time: created_at,
                notes: vec![],
            },
            approver: None,
            created_at,
        }
    }

    #[test]
    fn test_list_since_window() {
        let conn = setup_test_db();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        {
            let guard = conn.lock().unwrap();
            append_record(&guard, &make_record("R1", t0 - Duration::hours(30))).unwrap();
            append_record(&guard, &make_record("R2", t0 - Duration::hours(2))).unwrap();
        }
        let repo = PreemptionRepository::new(conn);
        let recent = repo.list_since(t0 - Duration::hours(24)).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].record_id, "R2");
        assert_eq!(repo.list_by_plan("P1").unwrap().len(), 2);
    }

    #[test]
    fn test_count_involving_counts_both_roles() {
        let conn = setup_test_db();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let guard = conn.lock().unwrap();
        append_record(&guard, &make_record("R1", t0 - Duration::hours(30))).unwrap();
        append_record(&guard, &make_record("R2", t0 - Duration::hours(2))).unwrap();
        let since = t0 - Duration::hours(24);
        assert_eq!(count_involving(&guard, "WP-A", since, t0).unwrap(), 1);
        assert_eq!(count_involving(&guard, "WP-B", since, t0).unwrap(), 1);
        assert_eq!(count_involving(&guard, "WP-C", since, t0).unwrap(), 0);
    }

    #[test]
    fn test_records_are_append_only() {
        let conn = setup_test_db();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let guard = conn.lock().unwrap();
        append_record(&guard, &make_record("R1", t0)).unwrap();
        let result: RepositoryResult<usize> = guard
            .execute("DELETE FROM preemption_record", [])
            .map_err(RepositoryError::from);
        assert!(matches!(result, Err(RepositoryError::AppendOnlyViolation(_))));
    }
}
