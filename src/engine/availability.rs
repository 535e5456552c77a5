// ==========================================
// 仓库出库释放系统 - 可用量计算 (Available-to-Promise)
// ==========================================
// 输入: 候选需求行 + 同产品的竞争需求行 + 时间窗
// 输出: 每个候选行当前可承诺数量
// 规则:
// - 可用量 = 子树内在库量 + 时间窗内预计入库量 (排除不可用库位)
// - 承诺在前的待释放行与已释放行的预留量先行扣减
// - 竞争行仅限来源子树与本行重叠者 (一方是另一方的祖先或相同)
// - 结果按计量单位步长向下取整, 半个步长以内视为零
// 红线: 纯计算, 不写库; 账本读取按 (产品, 子树) 批量进行
// ==========================================

use crate::domain::demand_line::DemandLine;
use crate::domain::quantity;
use crate::repository::error::RepositoryResult;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

// ==========================================
// 库存数量账本 (外部协作方)
// ==========================================

/// 单个库位上的数量
#[derive(Debug, Clone, PartialEq)]
pub struct LocationQuantity {
    pub location_id: String,
    pub on_hand: Decimal,
    pub incoming: Decimal,
    /// 自身或祖先被标记为"不计入立即可用"
    pub excluded_from_usable: bool,
}

/// 可用总量: 剔除排除库位后汇总
pub fn usable_total(rows: &[LocationQuantity]) -> Decimal {
    rows.iter()
        .filter(|r| !r.excluded_from_usable)
        .map(|r| r.on_hand + r.incoming)
        .sum()
}

pub trait QuantityLedger: Send + Sync {
    /// 子树内各库位的在库/预计入库量 (预计日期不晚于 horizon)
    fn location_quantities(
        &self,
        product_id: &str,
        location_subtree: &str,
        horizon: NaiveDateTime,
    ) -> RepositoryResult<Vec<LocationQuantity>>;

    /// 库位物化路径 ("WH/STOCK/"); 未登记的库位返回 None
    fn location_path(&self, _location_id: &str) -> RepositoryResult<Option<String>> {
        Ok(None)
    }

    fn available_quantity(
        &self,
        product_id: &str,
        location_subtree: &str,
        horizon: NaiveDateTime,
    ) -> RepositoryResult<Decimal> {
        Ok(usable_total(&self.location_quantities(
            product_id,
            location_subtree,
            horizon,
        )?))
    }
}

// ==========================================
// 计算结果
// ==========================================

#[derive(Debug, Clone, PartialEq)]
pub struct LineAvailability {
    pub line_id: String,
    pub product_id: String,
    pub requested: Decimal,
    /// 子树可用总量
    pub usable: Decimal,
    /// 承诺在前的需求占用
    pub promised_before: Decimal,
    /// 可承诺数量 (0 ≤ available ≤ requested)
    pub available: Decimal,
}

#[derive(Debug, Clone, Default)]
pub struct AvailabilitySnapshot {
    by_line: HashMap<String, LineAvailability>,
}

impl AvailabilitySnapshot {
    pub fn get(&self, line_id: &str) -> Option<&LineAvailability> {
        self.by_line.get(line_id)
    }

    /// 未计算的行视为不可用
    pub fn available(&self, line_id: &str) -> Decimal {
        self.by_line
            .get(line_id)
            .map(|a| a.available)
            .unwrap_or(Decimal::ZERO)
    }

    pub fn len(&self) -> usize {
        self.by_line.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_line.is_empty()
    }
}

/// 承诺顺序: 优先级降序, 日期优先级升序, 行ID升序
pub fn promise_order(a: &DemandLine, b: &DemandLine) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.date_priority.cmp(&b.date_priority))
        .then_with(|| a.line_id.cmp(&b.line_id))
}

/// 两个来源子树是否重叠: 路径互为前缀; 路径未知时按库位ID相等判断
pub fn subtrees_overlap(
    a_id: &str,
    a_path: Option<&str>,
    b_id: &str,
    b_path: Option<&str>,
) -> bool {
    if a_id == b_id {
        return true;
    }
    match (a_path, b_path) {
        (Some(a), Some(b)) => a.starts_with(b) || b.starts_with(a),
        _ => false,
    }
}

/// 是否参与承诺排队 (待释放、未阻断、非终态)
fn is_queued(line: &DemandLine) -> bool {
    line.is_pending_release() && !line.release_blocked
}

/// 单行可承诺数量 (纯函数)
///
/// competitors 为同产品、来源子树重叠的活动需求行, 可以包含 line 本身
pub fn compute_line_availability(
    line: &DemandLine,
    usable: Decimal,
    competitors: &[DemandLine],
) -> LineAvailability {
    let mut promised_before = Decimal::ZERO;
    for other in competitors {
        if other.line_id == line.line_id
            || other.product_id != line.product_id
            || other.is_terminal()
        {
            continue;
        }
        if is_queued(other) {
            if promise_order(other, line) == Ordering::Less {
                promised_before += other.requested_qty;
            }
        } else if !other.needs_release {
            promised_before += other.reserved_qty;
        }
    }

    let raw = quantity::clamp(usable - promised_before, line.requested_qty);
    let mut available = quantity::round_down(raw, line.uom_rounding);
    if quantity::is_zero(available, line.uom_rounding) {
        available = Decimal::ZERO;
    }

    LineAvailability {
        line_id: line.line_id.clone(),
        product_id: line.product_id.clone(),
        requested: line.requested_qty,
        usable,
        promised_before,
        available,
    }
}

// ==========================================
// AvailabilityCalculator
// ==========================================
pub struct AvailabilityCalculator {
    ledger: Arc<dyn QuantityLedger>,
}

impl AvailabilityCalculator {
    pub fn new(ledger: Arc<dyn QuantityLedger>) -> Self {
        Self { ledger }
    }

    /// 对候选行批量计算可承诺数量
    ///
    /// # 参数
    /// - candidates: 需要计算的行
    /// - competitors: 涉及产品上的活动需求行 (含候选行的最新状态), 按来源子树再行过滤
    /// - horizon: 预计入库截止时间
    #[tracing::instrument(skip_all, fields(candidates = candidates.len()))]
    pub fn snapshot(
        &self,
        candidates: &[DemandLine],
        competitors: &[DemandLine],
        horizon: NaiveDateTime,
    ) -> RepositoryResult<AvailabilitySnapshot> {
        // 每个 (产品, 来源子树) 只读一次账本
        let keys: HashSet<(&str, &str)> = candidates
            .iter()
            .map(|l| (l.product_id.as_str(), l.source_location_id.as_str()))
            .collect();
        let mut usable: HashMap<(&str, &str), Decimal> = HashMap::with_capacity(keys.len());
        for (product_id, subtree) in keys {
            let qty = self.ledger.available_quantity(product_id, subtree, horizon)?;
            usable.insert((product_id, subtree), qty);
        }

        let mut by_product: BTreeMap<&str, Vec<DemandLine>> = BTreeMap::new();
        for c in competitors {
            by_product.entry(c.product_id.as_str()).or_default().push(c.clone());
        }
        // 候选行可能比竞争集合更新 (尚未落库), 以候选行为准
        for l in candidates {
            let bucket = by_product.entry(l.product_id.as_str()).or_default();
            match bucket.iter_mut().find(|c| c.line_id == l.line_id) {
                Some(existing) => *existing = l.clone(),
                None => bucket.push(l.clone()),
            }
        }

        let mut paths: HashMap<String, Option<String>> = HashMap::new();
        for l in by_product.values().flatten() {
            if !paths.contains_key(&l.source_location_id) {
                let path = self.ledger.location_path(&l.source_location_id)?;
                paths.insert(l.source_location_id.clone(), path);
            }
        }
        let path_of = |id: &str| paths.get(id).and_then(|p| p.as_deref());

        let mut by_line = HashMap::with_capacity(candidates.len());
        for line in candidates {
            let total = usable
                .get(&(line.product_id.as_str(), line.source_location_id.as_str()))
                .copied()
                .unwrap_or(Decimal::ZERO);
            let pool: Vec<DemandLine> = by_product
                .get(line.product_id.as_str())
                .map(Vec::as_slice)
                .unwrap_or(&[])
                .iter()
                .filter(|c| {
                    subtrees_overlap(
                        &line.source_location_id,
                        path_of(&line.source_location_id),
                        &c.source_location_id,
                        path_of(&c.source_location_id),
                    )
                })
                .cloned()
                .collect();
            let result = compute_line_availability(line, total, &pool);
            tracing::debug!(
                line_id = %line.line_id,
                usable = %result.usable,
                promised_before = %result.promised_before,
                available = %result.available,
                "可承诺数量"
            );
            by_line.insert(line.line_id.clone(), result);
        }

        Ok(AvailabilitySnapshot { by_line })
    }
}
