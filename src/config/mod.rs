// ==========================================
// 仓库出库释放系统 - 配置层
// ==========================================
// 职责: 系统配置管理 (公司级可用量时间窗、并发参数、分配平局规则)
// 存储: config_kv 表
// ==========================================

pub mod config_manager;
pub mod release_config_trait;

// 重导出核心配置管理器
pub use config_manager::{config_keys, ConfigManager};
pub use release_config_trait::{ConfigError, ReleaseConfig, ReleaseConfigReader};
