// ==========================================
// 仓库出库释放系统 - 应用状态
// ==========================================
// 职责: 组装仓储、引擎与API实例 (组合根)
// 连接约定:
//   - 共享连接: 工作单元、仓储、配置
//   - 独立连接: 租约仓储、数量账本 (避免与工作单元互相阻塞)
// ==========================================

use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::api::{ChannelApi, ReleaseApi};
use crate::config::config_manager::ConfigManager;
use crate::config::release_config_trait::ReleaseConfig;
use crate::engine::context::ReleaseContext;
use crate::engine::driver::SchedulerDriver;
use crate::engine::events::{OptionalEventPublisher, ReleaseEventPublisher};
use crate::engine::release_service::ReleaseService;
use crate::repository::{
    action_log_repo::ActionLogRepository,
    channel_repo::ChannelRepository,
    demand_line_repo::DemandLineRepository,
    ledger_repo::SqliteQuantityLedger,
    lock_repo::TransferLockRepository,
    plan_repo::PlanRepository,
    schema::ensure_schema,
    transfer_repo::TransferRepository,
};

/// 应用状态
///
/// 包含所有API实例和共享资源
pub struct AppState {
    /// 数据库路径
    pub db_path: String,

    /// 启动时加载的配置快照
    pub config: ReleaseConfig,
    pub config_manager: Arc<ConfigManager>,

    /// 释放API
    pub release_api: Arc<ReleaseApi>,

    /// 通道API
    pub channel_api: Arc<ChannelApi>,

    /// 调度驱动器
    pub driver: Arc<SchedulerDriver>,

    pub release_service: Arc<ReleaseService>,

    // 仓储 (供查询与测试造数)
    pub transfer_repo: Arc<TransferRepository>,
    pub line_repo: Arc<DemandLineRepository>,
    pub channel_repo: Arc<ChannelRepository>,
    pub plan_repo: Arc<PlanRepository>,
    pub ledger: Arc<SqliteQuantityLedger>,
    pub locks: Arc<TransferLockRepository>,

    /// 操作日志仓储（用于审计追踪）
    pub action_log_repo: Arc<ActionLogRepository>,
}

impl AppState {
    /// 创建新的AppState实例 (不发布事件)
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    ///
    /// # 返回
    /// - Ok(AppState): 应用状态实例
    /// - Err(String): 初始化错误
    pub async fn new(db_path: String) -> Result<Self, String> {
        Self::build(db_path, None).await
    }

    /// 创建AppState实例,释放信号发送到给定发布器
    pub async fn with_publisher(
        db_path: String,
        publisher: Arc<dyn ReleaseEventPublisher>,
    ) -> Result<Self, String> {
        Self::build(db_path, Some(publisher)).await
    }

    async fn build(
        db_path: String,
        publisher: Option<Arc<dyn ReleaseEventPublisher>>,
    ) -> Result<Self, String> {
        tracing::info!("初始化AppState，数据库路径: {}", db_path);

        // 创建数据库连接（共享连接）
        let conn = crate::db::open_shared_connection(&db_path)
            .map_err(|e| format!("无法打开数据库: {}", e))?;
        {
            let guard = conn.lock().map_err(|e| format!("启动时锁获取失败: {}", e))?;
            ensure_schema(&guard).map_err(|e| format!("数据库结构初始化失败: {}", e))?;
        }

        // ==========================================
        // 配置
        // ==========================================
        let config_manager = Arc::new(
            ConfigManager::from_connection(conn.clone())
                .map_err(|e| format!("无法创建ConfigManager: {}", e))?,
        );
        let config = ReleaseConfig::load(config_manager.as_ref())
            .await
            .map_err(|e| format!("配置加载失败: {}", e))?;
        tracing::info!(
            horizon_days = config.window.horizon_days,
            lock_lease_seconds = config.lock_lease_seconds,
            tie_break = config.tie_break.as_str(),
            "释放配置已加载"
        );

        // ==========================================
        // 初始化Repository层
        // ==========================================
        let transfer_repo = Arc::new(TransferRepository::new(conn.clone()));
        let line_repo = Arc::new(DemandLineRepository::new(conn.clone()));
        let channel_repo = Arc::new(ChannelRepository::new(conn.clone()));
        let plan_repo = Arc::new(PlanRepository::new(conn.clone()));
        let action_log_repo = Arc::new(ActionLogRepository::new(conn.clone()));

        // 独立连接
        let ledger = Arc::new(
            SqliteQuantityLedger::new(&db_path)
                .map_err(|e| format!("无法创建SqliteQuantityLedger: {}", e))?,
        );
        let locks = Arc::new(
            TransferLockRepository::new(&db_path, config.lock_lease_seconds)
                .map_err(|e| format!("无法创建TransferLockRepository: {}", e))?,
        );

        // ==========================================
        // 初始化Engine层
        // ==========================================
        let event_publisher = match &publisher {
            Some(p) => OptionalEventPublisher::with_publisher(p.clone()),
            None => OptionalEventPublisher::none(),
        };

        let mut service = ReleaseService::new(conn.clone(), locks.clone(), ledger.clone(), &config);
        if let Some(p) = publisher {
            service = service.with_publisher(p);
        }
        let release_service = Arc::new(service);

        let driver = Arc::new(SchedulerDriver::new(
            release_service.clone(),
            channel_repo.clone(),
            transfer_repo.clone(),
        ));

        // ==========================================
        // 初始化API层
        // ==========================================
        let release_api = Arc::new(ReleaseApi::new(
            release_service.clone(),
            transfer_repo.clone(),
            line_repo.clone(),
            channel_repo.clone(),
        ));
        let channel_api = Arc::new(ChannelApi::new(
            conn.clone(),
            channel_repo.clone(),
            plan_repo.clone(),
            event_publisher,
        ));

        tracing::info!("AppState初始化完成");

        Ok(Self {
            db_path,
            config,
            config_manager,
            release_api,
            channel_api,
            driver,
            release_service,
            transfer_repo,
            line_repo,
            channel_repo,
            plan_repo,
            ledger,
            locks,
            action_log_repo,
        })
    }

    /// 按已加载配置构造请求上下文
    pub fn context(&self, actor: &str, now: NaiveDateTime) -> ReleaseContext {
        ReleaseContext::from_config(actor, now, &self.config)
    }
}

/// 获取默认数据库路径
///
/// 优先使用环境变量 OUTBOUND_RELEASE_DB_PATH,否则使用用户数据目录
pub fn get_default_db_path() -> String {
    use std::path::PathBuf;

    if let Ok(path) = std::env::var("OUTBOUND_RELEASE_DB_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let mut path = PathBuf::from("./outbound_release.db");
    if let Some(data_dir) = dirs::data_dir() {
        // 开发环境使用独立目录，避免污染生产数据
        #[cfg(debug_assertions)]
        {
            path = data_dir.join("outbound-release-dev");
        }

        #[cfg(not(debug_assertions))]
        {
            path = data_dir.join("outbound-release");
        }

        if let Err(e) = std::fs::create_dir_all(&path) {
            tracing::warn!("无法创建数据目录 {}: {}", path.display(), e);
        }
        path = path.join("outbound_release.db");
    }

    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_get_default_db_path() {
        let path = get_default_db_path();
        assert!(path.ends_with(".db"));
    }

    #[tokio::test]
    async fn test_app_state_initializes_schema_and_config() {
        let file = NamedTempFile::new().unwrap();
        let db_path = file.path().to_str().unwrap().to_string();

        let state = AppState::new(db_path.clone()).await.unwrap();
        assert_eq!(state.config, ReleaseConfig::default());
        assert!(state.channel_repo.list_all().unwrap().is_empty());

        // 重复初始化幂等
        let again = AppState::new(db_path).await.unwrap();
        assert_eq!(again.config.max_stale_retries, 2);
    }
}
