// ==========================================
// 仓库出库释放系统 - 释放配置读取 Trait
// ==========================================
// 职责: 定义释放引擎所需的配置读取接口（不包含实现）
// 红线: 不包含配置写入、不包含业务逻辑
// ==========================================

use crate::domain::plan::AvailabilityWindow;
use crate::domain::types::TieBreakPolicy;
use async_trait::async_trait;
use std::error::Error;

pub type ConfigError = Box<dyn Error + Send + Sync>;

// ==========================================
// ReleaseConfigReader Trait
// ==========================================
// 实现者: ConfigManager（从 config_kv 表读取）
#[async_trait]
pub trait ReleaseConfigReader: Send + Sync {
    /// 预留时间窗 (天): now+N 天内预计入库量计入可用
    ///
    /// # 默认值
    /// - 0
    async fn get_reservation_horizon_days(&self) -> Result<i64, ConfigError>;

    /// 最大备货提前期 (分钟): 释放后计划日期 = now + 提前期
    ///
    /// # 默认值
    /// - 0
    async fn get_max_preparation_lead_time_minutes(&self) -> Result<i64, ConfigError>;

    /// 调拨单租约有效期 (秒)
    ///
    /// # 默认值
    /// - 300
    async fn get_lock_lease_seconds(&self) -> Result<i64, ConfigError>;

    /// 需求行过期 (乐观锁冲突) 时的最大重试次数
    ///
    /// # 默认值
    /// - 2
    async fn get_max_stale_retries(&self) -> Result<u32, ConfigError>;

    /// 人工入口等待租约的毫秒数
    ///
    /// # 默认值
    /// - 2000
    async fn get_manual_lock_wait_ms(&self) -> Result<u64, ConfigError>;

    /// 通道分配平局规则
    ///
    /// # 默认值
    /// - priority_first
    async fn get_assignment_tie_break(&self) -> Result<TieBreakPolicy, ConfigError>;

    /// 组合为可用量时间窗
    async fn get_availability_window(&self) -> Result<AvailabilityWindow, ConfigError> {
        Ok(AvailabilityWindow {
            horizon_days: self.get_reservation_horizon_days().await?,
            max_preparation_lead_time_minutes: self.get_max_preparation_lead_time_minutes().await?,
        })
    }
}

// ==========================================
// ReleaseConfig - 一次加载后的配置快照
// ==========================================
// 引擎为同步代码,在入口处异步读取一次后以值传递
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseConfig {
    pub window: AvailabilityWindow,
    pub lock_lease_seconds: i64,
    pub max_stale_retries: u32,
    pub manual_lock_wait_ms: u64,
    pub tie_break: TieBreakPolicy,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            window: AvailabilityWindow::default(),
            lock_lease_seconds: 300,
            max_stale_retries: 2,
            manual_lock_wait_ms: 2000,
            tie_break: TieBreakPolicy::PriorityFirst,
        }
    }
}

impl ReleaseConfig {
    /// 从读取器加载全部配置项
    pub async fn load<R: ReleaseConfigReader + ?Sized>(reader: &R) -> Result<Self, ConfigError> {
        Ok(Self {
            window: reader.get_availability_window().await?,
            lock_lease_seconds: reader.get_lock_lease_seconds().await?,
            max_stale_retries: reader.get_max_stale_retries().await?,
            manual_lock_wait_ms: reader.get_manual_lock_wait_ms().await?,
            tie_break: reader.get_assignment_tie_break().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MockConfigReader;

    #[async_trait]
    impl ReleaseConfigReader for MockConfigReader {
        async fn get_reservation_horizon_days(&self) -> Result<i64, ConfigError> {
            Ok(2)
        }

        async fn get_max_preparation_lead_time_minutes(&self) -> Result<i64, ConfigError> {
            Ok(45)
        }

        async fn get_lock_lease_seconds(&self) -> Result<i64, ConfigError> {
            Ok(60)
        }

        async fn get_max_stale_retries(&self) -> Result<u32, ConfigError> {
            Ok(5)
        }

        async fn get_manual_lock_wait_ms(&self) -> Result<u64, ConfigError> {
            Ok(100)
        }

        async fn get_assignment_tie_break(&self) -> Result<TieBreakPolicy, ConfigError> {
            Ok(TieBreakPolicy::SpecificityFirst)
        }
    }

    #[tokio::test]
    async fn test_load_from_reader() {
        let cfg = ReleaseConfig::load(&MockConfigReader).await.unwrap();
        assert_eq!(
            cfg.window,
            AvailabilityWindow {
                horizon_days: 2,
                max_preparation_lead_time_minutes: 45,
            }
        );
        assert_eq!(cfg.lock_lease_seconds, 60);
        assert_eq!(cfg.max_stale_retries, 5);
        assert_eq!(cfg.manual_lock_wait_ms, 100);
        assert_eq!(cfg.tie_break, TieBreakPolicy::SpecificityFirst);
    }
}
