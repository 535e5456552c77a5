// ==========================================
// 仓库出库释放系统 - 领域类型定义
// ==========================================
// 职责: 需求行/调拨单/释放通道的状态与策略枚举
// 序列化格式: snake_case (与数据库一致)
// ==========================================

use serde::{Deserialize, Serialize};
use std::fmt;

// ==========================================
// 需求行状态 (Demand Line State)
// ==========================================
// Done / Cancelled 为终态,终态行不可再修改
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineState {
    Draft,              // 草稿
    Confirmed,          // 已确认,等待释放
    PartiallyAvailable, // 部分可用
    Assigned,           // 已预留
    Done,               // 已完成
    Cancelled,          // 已取消
}

impl LineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineState::Draft => "draft",
            LineState::Confirmed => "confirmed",
            LineState::PartiallyAvailable => "partially_available",
            LineState::Assigned => "assigned",
            LineState::Done => "done",
            LineState::Cancelled => "cancelled",
        }
    }

    /// 从数据库字符串解析
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "draft" => Some(LineState::Draft),
            "confirmed" => Some(LineState::Confirmed),
            "partially_available" => Some(LineState::PartiallyAvailable),
            "assigned" => Some(LineState::Assigned),
            "done" => Some(LineState::Done),
            "cancelled" => Some(LineState::Cancelled),
            _ => None,
        }
    }

    /// 是否终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, LineState::Done | LineState::Cancelled)
    }
}

impl fmt::Display for LineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 发货策略 (Shipping Policy)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShippingPolicy {
    AsSoonAsPossible, // 尽快发货,允许部分释放
    AllAtOnce,        // 整单发货,全部释放或全部不释放
}

impl ShippingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShippingPolicy::AsSoonAsPossible => "as_soon_as_possible",
            ShippingPolicy::AllAtOnce => "all_at_once",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "as_soon_as_possible" | "direct" => Some(ShippingPolicy::AsSoonAsPossible),
            "all_at_once" | "one" => Some(ShippingPolicy::AllAtOnce),
            _ => None,
        }
    }
}

impl fmt::Display for ShippingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 释放通道状态 (Channel State)
// ==========================================
// 生命周期: draft → open → locked → asleep → open → ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Draft,  // 未启用
    Open,   // 开放: 接受分配,执行释放
    Locked, // 锁定: 不接受新分配,继续释放已分配
    Asleep, // 休眠: 等待下一个备货窗口
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Draft => "draft",
            ChannelState::Open => "open",
            ChannelState::Locked => "locked",
            ChannelState::Asleep => "asleep",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "draft" => Some(ChannelState::Draft),
            "open" => Some(ChannelState::Open),
            "locked" => Some(ChannelState::Locked),
            "asleep" => Some(ChannelState::Asleep),
            _ => None,
        }
    }

    /// 是否接受新调拨单分配
    pub fn accepts_assignment(&self) -> bool {
        matches!(self, ChannelState::Open | ChannelState::Draft)
    }

    /// 是否可以执行释放
    pub fn can_release(&self) -> bool {
        matches!(self, ChannelState::Open | ChannelState::Locked)
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 批次模式 (Batch Mode)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    Manual,           // 仅人工触发释放
    Automatic,        // 新调拨单到达即检查释放
    GroupedByPartner, // 同一商业伙伴的调拨单全部就绪后整体释放
}

impl BatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchMode::Manual => "manual",
            BatchMode::Automatic => "automatic",
            BatchMode::GroupedByPartner => "grouped_by_partner",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "manual" => Some(BatchMode::Manual),
            "automatic" => Some(BatchMode::Automatic),
            "grouped_by_partner" => Some(BatchMode::GroupedByPartner),
            _ => None,
        }
    }
}

impl fmt::Display for BatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 释放决策 (Release Decision)
// ==========================================
// 顺序: Blocked < NotReady < ReadyPartial < ReadyFull
// 整单发货时取各行决策的最小值
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseDecision {
    Blocked,      // 人工阻断
    NotReady,     // 可用量不足
    ReadyPartial, // 部分可释放,需要拆分
    ReadyFull,    // 全量可释放
}

impl ReleaseDecision {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReleaseDecision::ReadyPartial | ReleaseDecision::ReadyFull)
    }
}

impl fmt::Display for ReleaseDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseDecision::Blocked => write!(f, "BLOCKED"),
            ReleaseDecision::NotReady => write!(f, "NOT_READY"),
            ReleaseDecision::ReadyPartial => write!(f, "READY_PARTIAL"),
            ReleaseDecision::ReadyFull => write!(f, "READY_FULL"),
        }
    }
}

// ==========================================
// 跳过原因 (Skip Reason)
// ==========================================
// 人工释放/撤销释放时逐行返回
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Blocked,
    NotReady,
    AlreadyReleased,
    Cancelled,
    Done,
    AlreadyConsumed,
    LockedByOtherWorker,
    NotFound,
    ChannelNotReleasable,
    /// 单据级处理失败 (本批其余调拨单继续)
    Failed,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Blocked => "blocked",
            SkipReason::NotReady => "not_ready",
            SkipReason::AlreadyReleased => "already_released",
            SkipReason::Cancelled => "cancelled",
            SkipReason::Done => "done",
            SkipReason::AlreadyConsumed => "already_consumed",
            SkipReason::LockedByOtherWorker => "locked_by_other_worker",
            SkipReason::NotFound => "not_found",
            SkipReason::ChannelNotReleasable => "channel_not_releasable",
            SkipReason::Failed => "failed",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ==========================================
// 通道分配平局规则 (Tie-break Policy)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreakPolicy {
    /// 先按优先级序号,再按条件具体程度
    #[default]
    PriorityFirst,
    /// 先按条件具体程度,再按优先级序号
    SpecificityFirst,
}

impl TieBreakPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TieBreakPolicy::PriorityFirst => "priority_first",
            TieBreakPolicy::SpecificityFirst => "specificity_first",
        }
    }
}

impl std::str::FromStr for TieBreakPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "priority_first" | "priority-first" => Ok(TieBreakPolicy::PriorityFirst),
            "specificity_first" | "specificity-first" => Ok(TieBreakPolicy::SpecificityFirst),
            other => Err(format!("未知平局规则: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_ordering() {
        assert!(ReleaseDecision::Blocked < ReleaseDecision::NotReady);
        assert!(ReleaseDecision::NotReady < ReleaseDecision::ReadyPartial);
        assert!(ReleaseDecision::ReadyPartial < ReleaseDecision::ReadyFull);
        let min = [ReleaseDecision::ReadyFull, ReleaseDecision::NotReady]
            .into_iter()
            .min()
            .unwrap();
        assert_eq!(min, ReleaseDecision::NotReady);
    }

    #[test]
    fn test_state_parse() {
        assert_eq!(LineState::parse("partially_available"), Some(LineState::PartiallyAvailable));
        assert_eq!(ChannelState::parse("ASLEEP"), Some(ChannelState::Asleep));
        assert_eq!(ShippingPolicy::parse("one"), Some(ShippingPolicy::AllAtOnce));
        assert!(LineState::parse("bogus").is_none());
    }

    #[test]
    fn test_channel_state_guards() {
        assert!(ChannelState::Open.accepts_assignment());
        assert!(!ChannelState::Locked.accepts_assignment());
        assert!(ChannelState::Locked.can_release());
        assert!(!ChannelState::Asleep.can_release());
    }

    #[test]
    fn test_tie_break_from_str() {
        assert_eq!(
            "specificity_first".parse::<TieBreakPolicy>().unwrap(),
            TieBreakPolicy::SpecificityFirst
        );
        assert!("whatever".parse::<TieBreakPolicy>().is_err());
    }
}
