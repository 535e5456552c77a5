// ==========================================
// 仓库出库释放系统 - 需求行拆分/合并
// ==========================================
// 拆分: 可释放部分留在原行, 剩余部分成为欠单行 (is_backorder_of = 原行)
// 合并: 路由相关属性完全一致且均未开始拣货时, 合并回一行并退役另一行
// 守恒: 拆分前请求量 = 拆分后原行 + 欠单行, 精确相等
// ==========================================

use crate::domain::demand_line::DemandLine;
use crate::domain::quantity;
use crate::domain::types::LineState;
use crate::engine::error::{EngineError, EngineResult};
use rust_decimal::Decimal;
use std::cmp::Ordering;

/// 合并兼容键
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergeKey {
    pub product_id: String,
    pub source_location_id: String,
    pub dest_location_id: String,
    pub route_id: Option<String>,
    pub carrier_id: Option<String>,
    pub service_level: Option<String>,
    pub group_id: Option<String>,
    pub release_blocked: bool,
    pub requires_other_lines: bool,
    pub no_backorder_at_release: bool,
    /// 待释放 / 已释放
    pub pending: bool,
}

pub fn merge_key(line: &DemandLine) -> MergeKey {
    MergeKey {
        product_id: line.product_id.clone(),
        source_location_id: line.source_location_id.clone(),
        dest_location_id: line.dest_location_id.clone(),
        route_id: line.route_id.clone(),
        carrier_id: line.carrier_id.clone(),
        service_level: line.service_level.clone(),
        group_id: line.group_id.clone(),
        release_blocked: line.release_blocked,
        requires_other_lines: line.requires_other_lines,
        no_backorder_at_release: line.no_backorder_at_release,
        pending: line.needs_release,
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MoveSplitter;

impl MoveSplitter {
    pub fn new() -> Self {
        Self
    }

    /// 按可释放数量拆分
    ///
    /// # 返回
    /// - Ok(None): 可释放数量等于请求量, 无需拆分
    /// - Ok(Some(backorder)): 新欠单行 (尚未落库, transfer_id 仍为原调拨单)
    pub fn split(&self, line: &mut DemandLine, release_qty: Decimal) -> EngineResult<Option<DemandLine>> {
        if line.is_terminal() {
            return Err(EngineError::ImmutableLine {
                line_id: line.line_id.clone(),
                state: line.state,
            });
        }

        let release_qty = quantity::round_down(release_qty, line.uom_rounding);
        if quantity::compare(release_qty, line.requested_qty, line.uom_rounding) != Ordering::Less {
            return Ok(None);
        }
        if quantity::is_zero(release_qty, line.uom_rounding) || release_qty < Decimal::ZERO {
            return Err(EngineError::InvalidSplit {
                line_id: line.line_id.clone(),
                release_qty,
                requested: line.requested_qty,
            });
        }
        if line.no_backorder_at_release {
            return Err(EngineError::BackorderForbidden {
                line_id: line.line_id.clone(),
            });
        }

        let remainder = line.requested_qty - release_qty;
        let backorder = DemandLine {
            line_id: uuid::Uuid::new_v4().to_string(),
            transfer_id: line.transfer_id.clone(),
            group_id: line.group_id.clone(),
            product_id: line.product_id.clone(),
            source_location_id: line.source_location_id.clone(),
            dest_location_id: line.dest_location_id.clone(),
            uom_rounding: line.uom_rounding,
            requested_qty: remainder,
            reserved_qty: Decimal::ZERO,
            picked_qty: Decimal::ZERO,
            state: LineState::Confirmed,
            needs_release: true,
            release_blocked: line.release_blocked,
            released_at: None,
            route_id: line.route_id.clone(),
            no_backorder_at_release: line.no_backorder_at_release,
            carrier_id: line.carrier_id.clone(),
            service_level: line.service_level.clone(),
            requires_other_lines: line.requires_other_lines,
            priority: line.priority,
            date_priority: line.date_priority,
            is_backorder_of: Some(line.line_id.clone()),
            revision: 0,
        };

        line.requested_qty = release_qty;
        if line.reserved_qty > release_qty {
            line.reserved_qty = release_qty;
        }

        tracing::debug!(
            line_id = %line.line_id,
            backorder_id = %backorder.line_id,
            released = %release_qty,
            remainder = %remainder,
            "需求行拆分"
        );
        Ok(Some(backorder))
    }

    /// 两行能否合并; 不能时给出原因
    pub fn can_merge(&self, a: &DemandLine, b: &DemandLine) -> Result<(), String> {
        if a.line_id == b.line_id {
            return Err(format!("同一行不能与自身合并: {}", a.line_id));
        }
        if a.is_terminal() || b.is_terminal() {
            return Err("终态行不可合并".to_string());
        }
        if a.has_started_processing() || b.has_started_processing() {
            return Err("已开始拣货的行不可合并".to_string());
        }
        if a.uom_rounding != b.uom_rounding {
            return Err("计量单位不一致".to_string());
        }
        if merge_key(a) != merge_key(b) {
            return Err(format!("路由属性不一致: {} vs {}", a.line_id, b.line_id));
        }
        Ok(())
    }

    /// 合并: retire 的数量并入 keep, retire 以取消状态退役
    pub fn merge(&self, keep: &mut DemandLine, retire: &mut DemandLine) -> EngineResult<()> {
        self.can_merge(keep, retire)
            .map_err(|reason| EngineError::MergeRejected { reason })?;

        keep.requested_qty += retire.requested_qty;
        keep.reserved_qty += retire.reserved_qty;
        // 保留更早的承诺位置
        if retire.priority > keep.priority
            || (retire.priority == keep.priority && retire.date_priority < keep.date_priority)
        {
            keep.priority = retire.priority;
            keep.date_priority = retire.date_priority;
        }

        retire.requested_qty = Decimal::ZERO;
        retire.reserved_qty = Decimal::ZERO;
        retire.needs_release = false;
        retire.state = LineState::Cancelled;

        tracing::debug!(keep = %keep.line_id, retired = %retire.line_id, "需求行合并");
        Ok(())
    }

    /// 单据内合并同键的待释放行
    ///
    /// 按传入顺序保留先出现的行; 返回 (保留行, 退役行) 对
    pub fn consolidate(&self, lines: &mut [DemandLine]) -> Vec<(String, String)> {
        let mut merged = Vec::new();
        for i in 0..lines.len() {
            if !lines[i].is_pending_release() {
                continue;
            }
            for j in (i + 1)..lines.len() {
                if !lines[j].is_pending_release() {
                    continue;
                }
                let (head, tail) = lines.split_at_mut(j);
                let keep = &mut head[i];
                let retire = &mut tail[0];
                if self.can_merge(keep, retire).is_ok() && self.merge(keep, retire).is_ok() {
                    merged.push((keep.line_id.clone(), retire.line_id.clone()));
                }
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn line(id: &str, requested: Decimal) -> DemandLine {
        DemandLine {
            line_id: id.to_string(),
            transfer_id: "T1".to_string(),
            group_id: Some("SO1".to_string()),
            product_id: "P1".to_string(),
            source_location_id: "WH".to_string(),
            dest_location_id: "CUSTOMER".to_string(),
            uom_rounding: dec!(0.001),
            requested_qty: requested,
            reserved_qty: dec!(0),
            picked_qty: dec!(0),
            state: LineState::Confirmed,
            needs_release: true,
            release_blocked: false,
            released_at: None,
            route_id: Some("R1".to_string()),
            no_backorder_at_release: false,
            carrier_id: Some("DHL".to_string()),
            service_level: Some("express".to_string()),
            requires_other_lines: true,
            priority: 1,
            date_priority: NaiveDate::from_ymd_opt(2026, 3, 2)
                .unwrap()
                .and_hms_opt(8, 0, 0)
                .unwrap(),
            is_backorder_of: None,
            revision: 3,
        }
    }

    #[test]
    fn test_split_conserves_quantity_and_copies_routing() {
        let splitter = MoveSplitter::new();
        let mut original = line("L1", dec!(10.125));
        let before = original.requested_qty;

        let backorder = splitter.split(&mut original, dec!(4.5)).unwrap().unwrap();
        assert_eq!(original.requested_qty + backorder.requested_qty, before);
        assert_eq!(original.requested_qty, dec!(4.5));
        assert_eq!(backorder.requested_qty, dec!(5.625));
        assert_eq!(backorder.is_backorder_of.as_deref(), Some("L1"));
        assert_eq!(backorder.carrier_id, original.carrier_id);
        assert_eq!(backorder.service_level, original.service_level);
        assert!(backorder.requires_other_lines);
        assert!(backorder.needs_release);
        assert_eq!(backorder.revision, 0);
    }

    #[test]
    fn test_split_full_quantity_is_noop() {
        let splitter = MoveSplitter::new();
        let mut original = line("L1", dec!(10));
        assert!(splitter.split(&mut original, dec!(10)).unwrap().is_none());
        assert!(splitter.split(&mut original, dec!(12)).unwrap().is_none());
        assert_eq!(original.requested_qty, dec!(10));
    }

    #[test]
    fn test_split_rejections() {
        let splitter = MoveSplitter::new();
        let mut original = line("L1", dec!(10));
        assert!(matches!(
            splitter.split(&mut original, dec!(0)),
            Err(EngineError::InvalidSplit { .. })
        ));

        original.no_backorder_at_release = true;
        assert!(matches!(
            splitter.split(&mut original, dec!(4)),
            Err(EngineError::BackorderForbidden { .. })
        ));
        assert_eq!(original.requested_qty, dec!(10));
    }

    #[test]
    fn test_split_then_merge_restores_original() {
        let splitter = MoveSplitter::new();
        let mut original = line("L1", dec!(10));
        let mut backorder = splitter.split(&mut original, dec!(4)).unwrap().unwrap();

        splitter.merge(&mut original, &mut backorder).unwrap();
        assert_eq!(original.requested_qty, dec!(10));
        assert_eq!(backorder.state, LineState::Cancelled);
        assert_eq!(backorder.requested_qty, dec!(0));
    }

    #[test]
    fn test_merge_rejects_started_or_different_lines() {
        let splitter = MoveSplitter::new();
        let mut a = line("A", dec!(5));
        let mut b = line("B", dec!(5));
        b.carrier_id = Some("UPS".to_string());
        assert!(splitter.merge(&mut a, &mut b).is_err());

        let mut c = line("C", dec!(5));
        c.picked_qty = dec!(1);
        assert!(splitter.merge(&mut a, &mut c).is_err());
        assert_eq!(a.requested_qty, dec!(5));
    }

    #[test]
    fn test_consolidate() {
        let splitter = MoveSplitter::new();
        let mut lines = vec![line("A", dec!(1)), line("B", dec!(2)), line("C", dec!(3))];
        lines[1].product_id = "P2".to_string();

        let merged = splitter.consolidate(&mut lines);
        assert_eq!(merged, vec![("A".to_string(), "C".to_string())]);
        assert_eq!(lines[0].requested_qty, dec!(4));
        assert_eq!(lines[2].state, LineState::Cancelled);
    }
}
