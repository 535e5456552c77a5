// ==========================================
// 仓库出库释放系统 - 释放决策引擎
// ==========================================
// 行级: 有序规则列表, 第一个给出结论的规则生效
//   Blocked → TerminalLine → FullAvailability → NoBackorder
//   → PartialAvailability → NothingAvailable
// 单据级: 行级结论之后依次应用单据规则
//   RequiresOtherLines → AllAtOnce (取最小值聚合)
// 红线: 纯决策, 不写库; 每个结论必须带 reason
// ==========================================

use crate::domain::demand_line::DemandLine;
use crate::domain::quantity;
use crate::domain::transfer::Transfer;
use crate::domain::types::{LineState, ReleaseDecision, ShippingPolicy, SkipReason};
use crate::engine::availability::AvailabilitySnapshot;
use rust_decimal::Decimal;
use std::cmp::Ordering;

// ==========================================
// 行级结论
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub struct LineVerdict {
    pub line_id: String,
    pub decision: ReleaseDecision,
    /// 本次可释放数量 (非就绪时为 0)
    pub release_qty: Decimal,
    /// 不参与本次释放的原因 (终态/已释放); None 表示参与决策
    pub skip: Option<SkipReason>,
    pub reason: String,
}

impl LineVerdict {
    fn new(line: &DemandLine, decision: ReleaseDecision, release_qty: Decimal, reason: &str) -> Self {
        Self {
            line_id: line.line_id.clone(),
            decision,
            release_qty,
            skip: None,
            reason: reason.to_string(),
        }
    }

    fn skipped(line: &DemandLine, skip: SkipReason) -> Self {
        Self {
            line_id: line.line_id.clone(),
            decision: ReleaseDecision::NotReady,
            release_qty: Decimal::ZERO,
            skip: Some(skip),
            reason: skip.as_str().to_string(),
        }
    }

    /// 是否参与本次释放决策
    pub fn is_candidate(&self) -> bool {
        self.skip.is_none()
    }

    fn downgrade(&mut self, decision: ReleaseDecision, reason: &str) {
        if decision < self.decision {
            self.decision = decision;
            self.release_qty = Decimal::ZERO;
            self.reason = reason.to_string();
        }
    }
}

// ==========================================
// 行级规则
// ==========================================
pub trait ReleaseRule: Send + Sync {
    fn name(&self) -> &'static str;

    /// 返回 None 表示本规则不适用, 交给下一条规则
    fn evaluate(&self, line: &DemandLine, available: Decimal) -> Option<LineVerdict>;
}

pub struct BlockedRule;

impl ReleaseRule for BlockedRule {
    fn name(&self) -> &'static str {
        "blocked"
    }

    fn evaluate(&self, line: &DemandLine, _available: Decimal) -> Option<LineVerdict> {
        if line.release_blocked && line.is_pending_release() {
            return Some(LineVerdict::new(line, ReleaseDecision::Blocked, Decimal::ZERO, "release_blocked"));
        }
        None
    }
}

pub struct TerminalLineRule;

impl ReleaseRule for TerminalLineRule {
    fn name(&self) -> &'static str {
        "terminal_line"
    }

    fn evaluate(&self, line: &DemandLine, _available: Decimal) -> Option<LineVerdict> {
        match line.state {
            LineState::Cancelled => Some(LineVerdict::skipped(line, SkipReason::Cancelled)),
            LineState::Done => Some(LineVerdict::skipped(line, SkipReason::Done)),
            _ if !line.needs_release => Some(LineVerdict::skipped(line, SkipReason::AlreadyReleased)),
            _ => None,
        }
    }
}

pub struct FullAvailabilityRule;

impl ReleaseRule for FullAvailabilityRule {
    fn name(&self) -> &'static str {
        "full_availability"
    }

    fn evaluate(&self, line: &DemandLine, available: Decimal) -> Option<LineVerdict> {
        if quantity::compare(available, line.requested_qty, line.uom_rounding) != Ordering::Less {
            return Some(LineVerdict::new(
                line,
                ReleaseDecision::ReadyFull,
                line.requested_qty,
                "available >= requested",
            ));
        }
        None
    }
}

pub struct NoBackorderRule;

impl ReleaseRule for NoBackorderRule {
    fn name(&self) -> &'static str {
        "no_backorder_at_release"
    }

    fn evaluate(&self, line: &DemandLine, available: Decimal) -> Option<LineVerdict> {
        if line.no_backorder_at_release && !quantity::is_zero(available, line.uom_rounding) {
            return Some(LineVerdict::new(
                line,
                ReleaseDecision::NotReady,
                Decimal::ZERO,
                "route forbids backorder, waiting for full quantity",
            ));
        }
        None
    }
}

pub struct PartialAvailabilityRule;

impl ReleaseRule for PartialAvailabilityRule {
    fn name(&self) -> &'static str {
        "partial_availability"
    }

    fn evaluate(&self, line: &DemandLine, available: Decimal) -> Option<LineVerdict> {
        if !quantity::is_zero(available, line.uom_rounding) {
            return Some(LineVerdict::new(
                line,
                ReleaseDecision::ReadyPartial,
                available,
                "0 < available < requested",
            ));
        }
        None
    }
}

pub struct NothingAvailableRule;

impl ReleaseRule for NothingAvailableRule {
    fn name(&self) -> &'static str {
        "nothing_available"
    }

    fn evaluate(&self, line: &DemandLine, _available: Decimal) -> Option<LineVerdict> {
        Some(LineVerdict::new(line, ReleaseDecision::NotReady, Decimal::ZERO, "available = 0"))
    }
}

// ==========================================
// 单据级规则
// ==========================================
pub trait TransferRule: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, transfer: &Transfer, lines: &[DemandLine], verdicts: &mut [LineVerdict]);
}

/// "发货需要同单其他行": 同单有待释放行未就绪时, 该行也不释放
pub struct RequiresOtherLinesRule;

impl TransferRule for RequiresOtherLinesRule {
    fn name(&self) -> &'static str {
        "requires_other_lines"
    }

    fn apply(&self, _transfer: &Transfer, lines: &[DemandLine], verdicts: &mut [LineVerdict]) {
        let sibling_waiting = |line_id: &str, verdicts: &[LineVerdict]| {
            verdicts
                .iter()
                .any(|v| v.is_candidate() && v.line_id != line_id && !v.decision.is_ready())
        };

        let mut to_downgrade = Vec::new();
        for line in lines.iter().filter(|l| l.requires_other_lines) {
            if sibling_waiting(&line.line_id, verdicts) {
                to_downgrade.push(line.line_id.clone());
            }
        }
        for v in verdicts.iter_mut() {
            if v.is_candidate() && to_downgrade.contains(&v.line_id) {
                v.downgrade(ReleaseDecision::NotReady, "requires other lines");
            }
        }
    }
}

/// 整单发货: 全部行同时就绪才释放, 绝不拆分
pub struct AllAtOnceRule;

impl TransferRule for AllAtOnceRule {
    fn name(&self) -> &'static str {
        "all_at_once"
    }

    fn apply(&self, transfer: &Transfer, _lines: &[DemandLine], verdicts: &mut [LineVerdict]) {
        if transfer.shipping_policy != ShippingPolicy::AllAtOnce {
            return;
        }
        let Some(min) = verdicts
            .iter()
            .filter(|v| v.is_candidate())
            .map(|v| v.decision)
            .min()
        else {
            return;
        };
        if min == ReleaseDecision::ReadyFull {
            return;
        }
        // READY(partial) 聚合后视为 NOT_READY
        let aggregate = min.min(ReleaseDecision::NotReady);
        for v in verdicts.iter_mut().filter(|v| v.is_candidate()) {
            v.downgrade(aggregate, "all_at_once: other lines not fully available");
        }
    }
}

// ==========================================
// 单据级结论
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub struct TransferVerdict {
    pub transfer_id: String,
    pub decision: ReleaseDecision,
    pub lines: Vec<LineVerdict>,
}

impl TransferVerdict {
    pub fn ready_lines(&self) -> impl Iterator<Item = &LineVerdict> {
        self.lines
            .iter()
            .filter(|v| v.is_candidate() && v.decision.is_ready())
    }

    pub fn has_candidates(&self) -> bool {
        self.lines.iter().any(|v| v.is_candidate())
    }
}

/// 汇总单据结论
///
/// - 无候选行: NOT_READY
/// - 有就绪行: 全部候选行全量就绪为 READY(full), 否则 READY(partial)
/// - 无就绪行: 存在阻断行为 BLOCKED, 否则 NOT_READY
fn summarize(verdicts: &[LineVerdict]) -> ReleaseDecision {
    let candidates: Vec<&LineVerdict> = verdicts.iter().filter(|v| v.is_candidate()).collect();
    if candidates.is_empty() {
        return ReleaseDecision::NotReady;
    }
    if candidates.iter().any(|v| v.decision.is_ready()) {
        if candidates.iter().all(|v| v.decision == ReleaseDecision::ReadyFull) {
            ReleaseDecision::ReadyFull
        } else {
            ReleaseDecision::ReadyPartial
        }
    } else if candidates.iter().any(|v| v.decision == ReleaseDecision::Blocked) {
        ReleaseDecision::Blocked
    } else {
        ReleaseDecision::NotReady
    }
}

// ==========================================
// DecisionEngine
// ==========================================
pub struct DecisionEngine {
    line_rules: Vec<Box<dyn ReleaseRule>>,
    transfer_rules: Vec<Box<dyn TransferRule>>,
}

impl Default for DecisionEngine {
    fn default() -> Self {
        Self {
            line_rules: vec![
                Box::new(BlockedRule),
                Box::new(TerminalLineRule),
                Box::new(FullAvailabilityRule),
                Box::new(NoBackorderRule),
                Box::new(PartialAvailabilityRule),
                Box::new(NothingAvailableRule),
            ],
            transfer_rules: vec![Box::new(RequiresOtherLinesRule), Box::new(AllAtOnceRule)],
        }
    }
}

impl DecisionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在指定位置插入行级规则 (越界时追加到末尾之前)
    pub fn with_rule_at(mut self, index: usize, rule: Box<dyn ReleaseRule>) -> Self {
        let idx = index.min(self.line_rules.len().saturating_sub(1));
        self.line_rules.insert(idx, rule);
        self
    }

    pub fn with_transfer_rule(mut self, rule: Box<dyn TransferRule>) -> Self {
        self.transfer_rules.push(rule);
        self
    }

    pub fn rule_names(&self) -> Vec<&'static str> {
        self.line_rules.iter().map(|r| r.name()).collect()
    }

    pub fn decide_line(&self, line: &DemandLine, available: Decimal) -> LineVerdict {
        for rule in &self.line_rules {
            if let Some(verdict) = rule.evaluate(line, available) {
                return verdict;
            }
        }
        LineVerdict::new(line, ReleaseDecision::NotReady, Decimal::ZERO, "no rule matched")
    }

    /// 对调拨单全部行决策
    pub fn decide_transfer(
        &self,
        transfer: &Transfer,
        lines: &[DemandLine],
        snapshot: &AvailabilitySnapshot,
    ) -> TransferVerdict {
        let mut verdicts: Vec<LineVerdict> = lines
            .iter()
            .map(|l| self.decide_line(l, snapshot.available(&l.line_id)))
            .collect();

        for rule in &self.transfer_rules {
            rule.apply(transfer, lines, &mut verdicts);
        }

        let decision = summarize(&verdicts);
        tracing::debug!(
            transfer_id = %transfer.transfer_id,
            decision = %decision,
            lines = verdicts.len(),
            "释放决策"
        );

        TransferVerdict {
            transfer_id: transfer.transfer_id.clone(),
            decision,
            lines: verdicts,
        }
    }
}
