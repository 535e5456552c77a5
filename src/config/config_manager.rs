// ==========================================
// 仓库出库释放系统 - 配置管理器
// ==========================================
// 职责: 配置加载、查询、覆写管理
// 存储: config_kv 表 (key-value + scope)
// ==========================================

use crate::config::release_config_trait::{ConfigError, ReleaseConfigReader};
use crate::db::open_sqlite_connection;
use crate::domain::types::TieBreakPolicy;
use crate::repository::error::RepositoryResult;
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> Result<Self, ConfigError> {
        let conn = open_sqlite_connection(db_path)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：为保证连接行为一致，会对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Result<Self, ConfigError> {
        {
            let conn_guard = conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
            crate::db::configure_sqlite_connection(&conn_guard)?;
        }

        Ok(Self { conn })
    }

    /// 从 config_kv 表读取配置值（scope_id='global'）
    fn get_config_value(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;

        let result = conn.query_row(
            "SELECT value FROM config_kv WHERE scope_id = 'global' AND key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        );

        match result {
            Ok(value) => Ok(Some(value)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(Box::new(e)),
        }
    }

    /// 写入 global scope 的配置值 (UPSERT)
    pub fn set_global_value(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let conn = self.conn.lock().map_err(|e| format!("锁获取失败: {}", e))?;
        conn.execute(
            r#"
            INSERT INTO config_kv (scope_id, key, value, updated_at)
            VALUES ('global', ?1, ?2, datetime('now'))
            ON CONFLICT(scope_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
            params![key, value],
        )?;
        tracing::info!(config_key = key, value, "配置已更新");
        Ok(())
    }

    /// 从 config_kv 表读取配置值，带默认值
    fn get_config_or_default(&self, key: &str, default: &str) -> Result<String, ConfigError> {
        Ok(self.get_config_value(key)?.unwrap_or_else(|| default.to_string()))
    }

    /// 读取并解析数值配置; 格式错误时告警并回退默认值
    fn get_parsed_or_default<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + Copy + std::fmt::Display,
    {
        match self.get_config_value(key)? {
            Some(raw) => match raw.trim().parse::<T>() {
                Ok(v) => Ok(v),
                Err(_) => {
                    tracing::warn!(
                        config_key = key,
                        raw_value = %raw,
                        default = %default,
                        "配置格式错误，使用默认值"
                    );
                    Ok(default)
                }
            },
            None => Ok(default),
        }
    }

    /// 全局配置快照, 写入释放/计划启动的审计载荷
    ///
    /// 在调用方检查点内读取, 与本次工作单元看到的配置一致
    pub fn snapshot_with(conn: &Connection) -> RepositoryResult<JsonValue> {
        let mut stmt = conn.prepare(
            "SELECT key, value FROM config_kv WHERE scope_id = 'global' ORDER BY key",
        )?;
        let config_map = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<rusqlite::Result<BTreeMap<String, String>>>()?;
        Ok(json!(config_map))
    }
}

// ==========================================
// ReleaseConfigReader Trait 实现
// ==========================================
#[async_trait]
impl ReleaseConfigReader for ConfigManager {
    async fn get_reservation_horizon_days(&self) -> Result<i64, ConfigError> {
        let v = self.get_parsed_or_default(config_keys::RESERVATION_HORIZON_DAYS, 0i64)?;
        Ok(v.max(0))
    }

    async fn get_max_preparation_lead_time_minutes(&self) -> Result<i64, ConfigError> {
        let v = self.get_parsed_or_default(config_keys::MAX_PREPARATION_LEAD_TIME_MINUTES, 0i64)?;
        Ok(v.max(0))
    }

    async fn get_lock_lease_seconds(&self) -> Result<i64, ConfigError> {
        let v = self.get_parsed_or_default(config_keys::LOCK_LEASE_SECONDS, 300i64)?;
        Ok(v.max(1))
    }

    async fn get_max_stale_retries(&self) -> Result<u32, ConfigError> {
        self.get_parsed_or_default(config_keys::MAX_STALE_RETRIES, 2u32)
    }

    async fn get_manual_lock_wait_ms(&self) -> Result<u64, ConfigError> {
        self.get_parsed_or_default(config_keys::MANUAL_LOCK_WAIT_MS, 2000u64)
    }

    async fn get_assignment_tie_break(&self) -> Result<TieBreakPolicy, ConfigError> {
        let value = self.get_config_or_default(config_keys::ASSIGNMENT_TIE_BREAK, "priority_first")?;
        Ok(TieBreakPolicy::from_str(&value).unwrap_or_else(|e| {
            tracing::warn!(config_key = config_keys::ASSIGNMENT_TIE_BREAK, error = %e, "使用默认平局规则");
            TieBreakPolicy::PriorityFirst
        }))
    }
}

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    // 可用量时间窗
    pub const RESERVATION_HORIZON_DAYS: &str = "release.reservation_horizon_days";
    pub const MAX_PREPARATION_LEAD_TIME_MINUTES: &str = "release.max_preparation_lead_time_minutes";

    // 并发
    pub const LOCK_LEASE_SECONDS: &str = "release.lock_lease_seconds";
    pub const MAX_STALE_RETRIES: &str = "release.max_stale_retries";
    pub const MANUAL_LOCK_WAIT_MS: &str = "release.manual_lock_wait_ms";

    // 通道分配
    pub const ASSIGNMENT_TIE_BREAK: &str = "release.assignment_tie_break";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::release_config_trait::ReleaseConfig;

    fn manager() -> ConfigManager {
        let conn = Connection::open_in_memory().unwrap();
        crate::repository::schema::ensure_schema(&conn).unwrap();
        ConfigManager::from_connection(Arc::new(Mutex::new(conn))).unwrap()
    }

    #[tokio::test]
    async fn test_defaults() {
        let cfg = ReleaseConfig::load(&manager()).await.unwrap();
        assert_eq!(cfg, ReleaseConfig::default());
    }

    #[tokio::test]
    async fn test_overrides_and_bad_values() {
        let m = manager();
        m.set_global_value(config_keys::RESERVATION_HORIZON_DAYS, "3").unwrap();
        m.set_global_value(config_keys::MAX_STALE_RETRIES, "not-a-number").unwrap();
        m.set_global_value(config_keys::ASSIGNMENT_TIE_BREAK, "specificity_first").unwrap();

        let cfg = ReleaseConfig::load(&m).await.unwrap();
        assert_eq!(cfg.window.horizon_days, 3);
        assert_eq!(cfg.max_stale_retries, 2);
        assert_eq!(cfg.tie_break, TieBreakPolicy::SpecificityFirst);

        let snapshot = ConfigManager::snapshot_with(&m.conn.lock().unwrap()).unwrap();
        assert_eq!(snapshot[config_keys::RESERVATION_HORIZON_DAYS], "3");
        assert_eq!(snapshot[config_keys::ASSIGNMENT_TIE_BREAK], "specificity_first");
    }
}
