// ==========================================
// 维修准备排产系统 - SQLite 连接初始化
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为 (外键 / WAL / busy_timeout)
// - 建表幂等, 事件日志与抢占记录只追加 (触发器拦截 UPDATE/DELETE)
// ==========================================

use rusqlite::Connection;
use rusqlite::OptionalExtension;
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要“每个连接”单独开启
/// - busy_timeout 需要“每个连接”单独配置
/// - 内存库不支持 WAL, journal_mode 返回 memory, 忽略即可
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 建表 (幂等)
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
          version INTEGER PRIMARY KEY,
          applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS plan_header (
          plan_id TEXT PRIMARY KEY,
          current_version INTEGER NOT NULL,
          idempotency_key TEXT UNIQUE,
          input_fingerprint TEXT NOT NULL,
          settings_json TEXT NOT NULL,
          objective_policy_version INTEGER NOT NULL,
          request_template_json TEXT,
          created_at TEXT NOT NULL,
          updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS plan_version (
          plan_id TEXT NOT NULL REFERENCES plan_header(plan_id),
          version INTEGER NOT NULL,
          base_version INTEGER,
          plan_json TEXT NOT NULL,
          created_at TEXT NOT NULL,
          PRIMARY KEY (plan_id, version)
        );

        CREATE TABLE IF NOT EXISTS event_log (
          seq INTEGER PRIMARY KEY AUTOINCREMENT,
          event_id TEXT NOT NULL UNIQUE,
          plan_id TEXT NOT NULL REFERENCES plan_header(plan_id),
          version INTEGER NOT NULL,
          event_json TEXT NOT NULL,
          effective_time TEXT NOT NULL,
          recorded_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_event_log_plan
          ON event_log(plan_id, seq);

        CREATE TRIGGER IF NOT EXISTS trg_event_log_no_update
          BEFORE UPDATE ON event_log
          BEGIN SELECT RAISE(ABORT, 'event_log is append-only'); END;
        CREATE TRIGGER IF NOT EXISTS trg_event_log_no_delete
          BEFORE DELETE ON event_log
          BEGIN SELECT RAISE(ABORT, 'event_log is append-only'); END;

        CREATE TABLE IF NOT EXISTS preemption_record (
          record_id TEXT PRIMARY KEY,
          plan_id TEXT NOT NULL REFERENCES plan_header(plan_id),
          from_version INTEGER NOT NULL,
          to_version INTEGER NOT NULL,
          preempting_work_package_id TEXT NOT NULL,
          record_json TEXT NOT NULL,
          created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_preemption_created
          ON preemption_record(created_at);

        CREATE TRIGGER IF NOT EXISTS trg_preemption_no_update
          BEFORE UPDATE ON preemption_record
          BEGIN SELECT RAISE(ABORT, 'preemption_record is append-only'); END;
        CREATE TRIGGER IF NOT EXISTS trg_preemption_no_delete
          BEFORE DELETE ON preemption_record
          BEGIN SELECT RAISE(ABORT, 'preemption_record is append-only'); END;

        CREATE TABLE IF NOT EXISTS config_kv (
          scope_id TEXT NOT NULL,
          key TEXT NOT NULL,
          value TEXT NOT NULL,
          updated_at TEXT NOT NULL DEFAULT (datetime('now')),
          PRIMARY KEY (scope_id, key)
        );
        "#,
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [CURRENT_SCHEMA_VERSION],
    )?;
    Ok(())
}

/// 读取 schema_version（若表不存在则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}
