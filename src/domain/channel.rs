// ==========================================
// 仓库出库释放系统 - 释放通道领域模型
// ==========================================
// 释放通道 = 带分配条件的执行通道,按批次节奏释放调拨单
// 约定: 未设置的条件视为通配
// ==========================================

use crate::domain::types::{BatchMode, ChannelState};
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ==========================================
// GeoZone - 地理区域 (多边形)
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoZone {
    /// 顶点 (lat, lon),首尾不必重复
    pub polygon: Vec<(f64, f64)>,
}

impl GeoZone {
    /// 射线法判断点是否在多边形内
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        let n = self.polygon.len();
        if n < 3 {
            return false;
        }
        let mut inside = false;
        let mut j = n - 1;
        for i in 0..n {
            let (yi, xi) = self.polygon[i];
            let (yj, xj) = self.polygon[j];
            if (yi > lat) != (yj > lat) && lon < (xj - xi) * (lat - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

// ==========================================
// ReleaseChannel - 释放通道
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseChannel {
    pub channel_id: String,
    pub name: String,
    pub sequence: i32,                     // 优先级序号,越小越优先
    pub state: ChannelState,
    pub batch_mode: BatchMode,

    // ===== 分配条件 (空 = 通配) =====
    pub partner_ids: Vec<String>,
    pub carrier_ids: Vec<String>,
    pub delivery_weekdays: Vec<u32>,       // 1=周一 ... 7=周日
    pub geo_zone: Option<GeoZone>,
    pub warehouse_id: Option<String>,
    pub exclude_public_holidays: bool,

    // ===== 备货计划 =====
    pub preparation_plan_id: Option<String>,
    pub last_wake_date: Option<NaiveDate>,

    pub updated_at: NaiveDateTime,
}

// ==========================================
// HolidayCalendar - 公共假日日历 (只读参考数据)
// ==========================================
#[derive(Debug, Clone, Default)]
pub struct HolidayCalendar {
    dates: HashSet<NaiveDate>,
}

impl HolidayCalendar {
    pub fn new(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            dates: dates.into_iter().collect(),
        }
    }

    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_zone_contains() {
        let zone = GeoZone {
            polygon: vec![(0.0, 0.0), (0.0, 10.0), (10.0, 10.0), (10.0, 0.0)],
        };
        assert!(zone.contains(5.0, 5.0));
        assert!(!zone.contains(15.0, 5.0));
        assert!(!zone.contains(-1.0, -1.0));
    }

    #[test]
    fn test_degenerate_zone() {
        let zone = GeoZone {
            polygon: vec![(0.0, 0.0), (1.0, 1.0)],
        };
        assert!(!zone.contains(0.5, 0.5));
    }

    #[test]
    fn test_holiday_calendar() {
        let d = NaiveDate::from_ymd_opt(2026, 5, 1).unwrap();
        let cal = HolidayCalendar::new([d]);
        assert!(cal.is_holiday(d));
        assert!(!cal.is_holiday(d.succ_opt().unwrap()));
    }
}
