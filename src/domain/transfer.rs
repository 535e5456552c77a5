// ==========================================
// 仓库出库释放系统 - 调拨单领域模型
// ==========================================
// 调拨单 = 共享来源/目的单据上下文的一组需求行
// 红线: 整单发货策略下,所有行一起释放或都不释放
// ==========================================

use crate::domain::demand_line::DemandLine;
use crate::domain::types::ShippingPolicy;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

// ==========================================
// Transfer - 调拨单
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub transfer_id: String,
    pub name: String,

    // ===== 业务伙伴与承运 =====
    pub partner_id: Option<String>,
    pub commercial_partner_id: Option<String>, // 顶层客户实体
    pub carrier_id: Option<String>,
    pub warehouse_id: Option<String>,          // 仓库/配送中心
    pub delivery_lat: Option<f64>,             // 送货坐标 (地理区域匹配)
    pub delivery_lon: Option<f64>,

    // ===== 计划 =====
    pub shipping_policy: ShippingPolicy,
    pub scheduled_date: NaiveDateTime,
    pub commitment_date: Option<NaiveDateTime>,

    // ===== 释放相关 =====
    pub release_channel_id: Option<String>,
    pub last_release_date: Option<NaiveDateTime>,
    pub confirmed_at: NaiveDateTime,           // 最近一次确认时间
    pub needs_release: bool,                   // 派生字段,由 recompute_flags 维护
    pub is_closed: bool,                       // 所有行终态后关闭

    // ===== 欠单来源 =====
    pub backorder_of: Option<String>,
}

impl Transfer {
    /// 是否处于释放中 (最近释放时间晚于最近确认时间)
    pub fn is_mid_release(&self) -> bool {
        match self.last_release_date {
            Some(released) => released > self.confirmed_at,
            None => false,
        }
    }

    /// 分组键: 商业伙伴优先,缺省回落到伙伴
    pub fn grouping_partner(&self) -> Option<&str> {
        self.commercial_partner_id
            .as_deref()
            .or(self.partner_id.as_deref())
    }
}

// ==========================================
// 派生字段重算 (显式纯函数)
// ==========================================

/// 派生标志
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferFlags {
    pub needs_release: bool,
    pub is_closed: bool,
}

/// 根据需求行重算调拨单派生标志
///
/// - needs_release: 存在待释放的非终态行
/// - is_closed: 至少一行且全部终态
pub fn compute_flags(lines: &[DemandLine]) -> TransferFlags {
    let needs_release = lines.iter().any(|l| l.is_pending_release());
    let is_closed = !lines.is_empty() && lines.iter().all(|l| l.is_terminal());
    TransferFlags {
        needs_release,
        is_closed,
    }
}

/// 应用派生标志,返回是否有变化
pub fn apply_flags(transfer: &mut Transfer, flags: TransferFlags) -> bool {
    let changed =
        transfer.needs_release != flags.needs_release || transfer.is_closed != flags.is_closed;
    transfer.needs_release = flags.needs_release;
    transfer.is_closed = flags.is_closed;
    changed
}
