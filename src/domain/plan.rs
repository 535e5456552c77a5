// ==========================================
// 仓库出库释放系统 - 备货计划领域模型
// ==========================================
// 用途: 按计划批量唤醒多个释放通道
// ==========================================

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

// ==========================================
// ChannelPreparationPlan - 通道备货计划
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPreparationPlan {
    pub plan_id: String,
    pub name: String,
    pub last_launch_date: Option<NaiveDate>, // 最近一次启动的业务日期
    pub created_at: NaiveDateTime,
}

// ==========================================
// AvailabilityWindow - 可用量时间窗口 (公司级配置)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    /// 预留视野 (天): now + N 天内的入库计入可用量
    pub horizon_days: i64,
    /// 最大备货提前期 (分钟): 释放后调拨单计划日期 = now + 提前期
    pub max_preparation_lead_time_minutes: i64,
}

impl Default for AvailabilityWindow {
    fn default() -> Self {
        Self {
            horizon_days: 0,
            max_preparation_lead_time_minutes: 0,
        }
    }
}

impl AvailabilityWindow {
    /// 可用量视野截止时间
    pub fn horizon(&self, now: NaiveDateTime) -> NaiveDateTime {
        now + chrono::Duration::days(self.horizon_days.max(0))
    }

    /// 释放后的预计计划时间
    pub fn expected_date(&self, now: NaiveDateTime) -> NaiveDateTime {
        now + chrono::Duration::minutes(self.max_preparation_lead_time_minutes.max(0))
    }
}
