// ==========================================
// 维修准备排产系统 - 领域事件日志仓储
// ==========================================
// 表: event_log (只追加, 触发器拦截修改/删除)
// 红线: 事件只在其产生的新版本提交时写入, 失败的重排不消费事件
// ==========================================

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::domain::DomainEvent;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::plan_repo::time_column;

/// 已记录的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub seq: i64,
    pub plan_id: String,
    /// 消费该事件的计划版本
    pub version: u32,
    pub event: DomainEvent,
    pub recorded_at: DateTime<Utc>,
}

// ==========================================
// EventLogRepository - 事件日志仓储
// ==========================================
pub struct EventLogRepository {
    conn: Arc<Mutex<Connection>>,
}

impl EventLogRepository {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 已消费的事件 ID (全部计划)
    pub fn consumed_event_ids(&self) -> RepositoryResult<HashSet<String>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare("SELECT event_id FROM event_log")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<String>, _>>()?;
        Ok(ids)
    }

    /// 按追加顺序列出计划的事件 (用于回放/审计)
    pub fn list_by_plan(&self, plan_id: &str) -> RepositoryResult<Vec<LoggedEvent>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            r#"SELECT seq, plan_id, version, event_json, recorded_at
               FROM event_log WHERE plan_id = ?1 ORDER BY seq"#,
        )?;
        let events = stmt
            .query_map(params![plan_id], |row| {
                let raw: String = row.get(3)?;
                let event: DomainEvent = serde_json::from_str(&raw).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
                })?;
                Ok(LoggedEvent {
                    seq: row.get(0)?,
                    plan_id: row.get(1)?,
                    version: row.get(2)?,
                    event,
                    recorded_at: time_column(4, &row.get::<_, String>(4)?)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(events)
    }
}

/// 在调用方事务内追加事件
pub(crate) fn append_events(
    conn: &Connection,
    plan_id: &str,
    version: u32,
    events: &[DomainEvent],
    recorded_at: DateTime<Utc>,
) -> RepositoryResult<()> {
    let mut stmt = conn.prepare(
        r#"INSERT INTO event_log (event_id, plan_id, version, event_json, effective_time, recorded_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
    )?;
    for event in events {
        stmt.execute(params![
            event.event_id,
            plan_id,
            version,
            serde_json::to_string(event)?,
            event.effective_time.to_rfc3339(),
            recorded_at.to_rfc3339(),
        ])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventPayload, EventScope, ReplanPolicy};
    use chrono::TimeZone;

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

    fn make_event(id: &str) -> DomainEvent {
        let t0 = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        DomainEvent {
            event_id: id.to_string(),
            effective_time: t0,
            payload: EventPayload::EtaChange {
                resource_id: "KIT-1".into(),
                old_eta: None,
                new_eta: t0,
            },
            scope: EventScope {
                resource_ids: vec!["KIT-1".into()],
                ..EventScope::default()
            },
            policy: ReplanPolicy::ReplanUnstarted,
            source: None,
        }
    }

    #[test]
    fn test_append_and_list() {
        let conn = setup_test_db();
        {
            let guard = conn.lock().unwrap();
            let t = Utc.with_ymd_and_hms(2026, 3, 1, 1, 0, 0).unwrap();
            append_events(&guard, "P1", 2, &[make_event("E1"), make_event("E2")], t).unwrap();
        }
        let repo = EventLogRepository::new(conn);
        let events = repo.list_by_plan("P1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.event_id, "E1");
        assert_eq!(events[1].version, 2);
        assert!(repo.consumed_event_ids().unwrap().contains("E2"));
    }

    #[test]
    fn test_duplicate_event_rejected() {
        let conn = setup_test_db();
        let guard = conn.lock().unwrap();
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 1, 0, 0).unwrap();
        append_events(&guard, "P1", 2, &[make_event("E1")], t).unwrap();
        assert!(matches!(
            append_events(&guard, "P1", 3, &[make_event("E1")], t),
            Err(RepositoryError::UniqueConstraintViolation(_))
        ));
    }
}
