// ==========================================
// 仓库出库释放系统 - 需求行领域模型
// ==========================================
// 需求行 = 单个产品从来源库位到目的库位的请求数量
// 红线: reserved_qty 永不超过 requested_qty
// 红线: Done / Cancelled 行不可修改
// ==========================================

use crate::domain::quantity;
use crate::domain::types::LineState;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ==========================================
// DemandLine - 需求行
// ==========================================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandLine {
    // ===== 标识 =====
    pub line_id: String,                 // 需求行ID (稳定标识)
    pub transfer_id: String,             // 所属调拨单
    pub group_id: Option<String>,        // 需求组 (如销售订单)

    // ===== 产品与库位 =====
    pub product_id: String,
    pub source_location_id: String,      // 来源库位子树根
    pub dest_location_id: String,
    pub uom_rounding: Decimal,           // 计量单位舍入步长

    // ===== 数量 =====
    pub requested_qty: Decimal,          // 请求数量
    pub reserved_qty: Decimal,           // 已预留(已释放)数量
    pub picked_qty: Decimal,             // 已拣货数量 (执行子系统回报)

    // ===== 状态与标志 =====
    pub state: LineState,
    pub needs_release: bool,
    pub release_blocked: bool,
    pub released_at: Option<NaiveDateTime>,

    // ===== 路由相关属性 (拆分时继承,合并时比对) =====
    pub route_id: Option<String>,
    pub no_backorder_at_release: bool,   // 路由禁止释放时产生欠单
    pub carrier_id: Option<String>,
    pub service_level: Option<String>,
    pub requires_other_lines: bool,      // 发货需要同单其他行一起

    // ===== 承诺顺序 =====
    pub priority: i32,                   // 越大越优先
    pub date_priority: NaiveDateTime,    // 同优先级按时间先后

    // ===== 欠单回溯 (非拥有引用,仅用于查询) =====
    pub is_backorder_of: Option<String>,

    // ===== 乐观锁 =====
    pub revision: i32,
}

impl DemandLine {
    /// 是否终态
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// 是否已释放
    pub fn is_released(&self) -> bool {
        self.released_at.is_some() && !self.needs_release
    }

    /// 是否处于待释放状态
    pub fn is_pending_release(&self) -> bool {
        self.needs_release && !self.is_terminal()
    }

    /// 未预留的剩余数量
    pub fn unreserved_qty(&self) -> Decimal {
        (self.requested_qty - self.reserved_qty).max(Decimal::ZERO)
    }

    /// 是否已开始实物处理
    pub fn has_started_processing(&self) -> bool {
        !quantity::is_zero(self.picked_qty, self.uom_rounding)
    }

    /// 校验数量不变量
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.requested_qty < Decimal::ZERO {
            return Err(format!("需求行{}请求数量为负: {}", self.line_id, self.requested_qty));
        }
        if quantity::compare(self.reserved_qty, self.requested_qty, self.uom_rounding)
            == std::cmp::Ordering::Greater
        {
            return Err(format!(
                "需求行{}预留数量{}超过请求数量{}",
                self.line_id, self.reserved_qty, self.requested_qty
            ));
        }
        Ok(())
    }

    /// 标记为已释放
    ///
    /// 释放数量等于当前请求数量 (拆分已在此之前完成)
    pub fn mark_released(&mut self, now: NaiveDateTime) {
        self.reserved_qty = self.requested_qty;
        self.needs_release = false;
        self.released_at = Some(now);
        self.state = LineState::Assigned;
    }

    /// 撤销释放,回到待释放状态
    pub fn mark_unreleased(&mut self) {
        self.reserved_qty = Decimal::ZERO;
        self.needs_release = true;
        self.released_at = None;
        self.state = LineState::Confirmed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn line() -> DemandLine {
        DemandLine {
            line_id: "L1".to_string(),
            transfer_id: "T1".to_string(),
            group_id: None,
            product_id: "P1".to_string(),
            source_location_id: "WH/STOCK".to_string(),
            dest_location_id: "CUSTOMER".to_string(),
            uom_rounding: dec!(0.01),
            requested_qty: dec!(10),
            reserved_qty: dec!(0),
            picked_qty: dec!(0),
            state: LineState::Confirmed,
            needs_release: true,
            release_blocked: false,
            released_at: None,
            route_id: None,
            no_backorder_at_release: false,
            carrier_id: None,
            service_level: None,
            requires_other_lines: false,
            priority: 0,
            date_priority: NaiveDate::from_ymd_opt(2026, 1, 5)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap(),
            is_backorder_of: None,
            revision: 0,
        }
    }

    #[test]
    fn test_release_cycle() {
        let mut l = line();
        let now = l.date_priority;
        assert!(l.is_pending_release());
        l.mark_released(now);
        assert!(l.is_released());
        assert_eq!(l.reserved_qty, dec!(10));
        assert!(l.check_invariants().is_ok());
        l.mark_unreleased();
        assert!(l.is_pending_release());
        assert_eq!(l.reserved_qty, dec!(0));
    }

    #[test]
    fn test_invariant_violation() {
        let mut l = line();
        l.reserved_qty = dec!(10.5);
        assert!(l.check_invariants().is_err());
        // 舍入容差内不算超额
        l.reserved_qty = dec!(10.004);
        assert!(l.check_invariants().is_ok());
    }
}
