// ==========================================
// 维修准备排产系统 - 应用状态
// ==========================================
// 职责: 管理应用级别的共享状态和API实例
// ==========================================

use std::sync::{Arc, Mutex};

use crate::api::{ConfigApi, PlanApi};
use crate::config::config_manager::ConfigManager;
use crate::config::scheduler_config::SchedulerConfig;
use crate::engine::PlanEventPublisher;
use crate::repository::{EventLogRepository, PlanRepository, PreemptionRepository};

/// 应用状态
///
/// 所有仓储共享同一个 SQLite 连接
pub struct AppState {
    /// 数据库路径
    pub db_path: String,

    /// 计划API
    pub plan_api: Arc<PlanApi>,

    /// 配置管理API
    pub config_api: Arc<ConfigApi>,

    /// 启动时加载的排产配置
    pub scheduler_config: SchedulerConfig,
}

impl AppState {
    /// 创建新的AppState实例
    ///
    /// 打开数据库并初始化表结构, 从 config_kv 加载排产配置后创建各 API
    pub fn new(db_path: String) -> Result<Self, String> {
        Self::with_publisher(db_path, None)
    }

    pub fn with_publisher(
        db_path: String,
        event_publisher: Option<Arc<dyn PlanEventPublisher>>,
    ) -> Result<Self, String> {
        tracing::info!("初始化AppState，数据库路径: {}", db_path);

        let conn = crate::db::open_sqlite_connection(&db_path).map_err(|e| format!("无法打开数据库: {}", e))?;
        crate::db::init_schema(&conn).map_err(|e| format!("数据库表结构初始化失败: {}", e))?;
        let conn = Arc::new(Mutex::new(conn));

        // ==========================================
        // 初始化Repository层
        // ==========================================
        let plan_repo = Arc::new(PlanRepository::new(conn.clone()));
        let event_log_repo = Arc::new(EventLogRepository::new(conn.clone()));
        let preemption_repo = Arc::new(PreemptionRepository::new(conn.clone()));

        let config_manager = Arc::new(
            ConfigManager::from_connection(conn.clone()).map_err(|e| format!("无法创建ConfigManager: {}", e))?,
        );
        let scheduler_config = config_manager
            .load_scheduler_config()
            .map_err(|e| format!("排产配置加载失败: {}", e))?;

        // ==========================================
        // 初始化API层
        // ==========================================
        let plan_api = Arc::new(PlanApi::new(
            plan_repo,
            event_log_repo,
            preemption_repo,
            config_manager.clone(),
            scheduler_config.clone(),
            event_publisher,
        ));
        let config_api = Arc::new(ConfigApi::new(conn, config_manager));

        tracing::info!("AppState初始化完成");
        Ok(Self {
            db_path,
            plan_api,
            config_api,
            scheduler_config,
        })
    }
}

/// 获取默认数据库路径
///
/// 优先级: 环境变量 MRO_PREP_APS_DB_PATH > 用户数据目录 > 当前目录
pub fn get_default_db_path() -> String {
    use std::path::PathBuf;

    if let Ok(path) = std::env::var("MRO_PREP_APS_DB_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let mut path = PathBuf::from("./mro_prep_aps.db");
    if let Some(data_dir) = dirs::data_dir() {
        let dir = data_dir.join("mro-prep-aps");
        if std::fs::create_dir_all(&dir).is_ok() {
            path = dir.join("mro_prep_aps.db");
        }
    }
    path.to_string_lossy().to_string()
}
