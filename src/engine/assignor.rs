// ==========================================
// 仓库出库释放系统 - 释放通道分配
// ==========================================
// 每个通道一条谓词链 (AND); 未设置的条件视为通配
// 候选通道: 状态接受分配 (open/draft), 或当前所属的 locked 通道
// 平局规则可配置: PriorityFirst / SpecificityFirst
// 幂等: 结果不变时不写库
// 安全: 调拨单处于释放中时不重新分配 (除非 force)
// ==========================================

use crate::domain::channel::{HolidayCalendar, ReleaseChannel};
use crate::domain::transfer::Transfer;
use crate::domain::types::{ChannelState, TieBreakPolicy};
use crate::engine::error::EngineResult;
use crate::repository::transfer_repo::TransferRepository;
use chrono::Datelike;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

// ==========================================
// 谓词
// ==========================================
pub trait ChannelPredicate: Send + Sync {
    fn name(&self) -> &'static str;

    /// 通道是否设置了本条件 (计入具体程度)
    fn is_set(&self, channel: &ReleaseChannel) -> bool;

    /// 仅在 is_set 为真时调用
    fn accepts(&self, channel: &ReleaseChannel, transfer: &Transfer, holidays: &HolidayCalendar) -> bool;
}

pub struct PartnerPredicate;

impl ChannelPredicate for PartnerPredicate {
    fn name(&self) -> &'static str {
        "partner"
    }

    fn is_set(&self, channel: &ReleaseChannel) -> bool {
        !channel.partner_ids.is_empty()
    }

    fn accepts(&self, channel: &ReleaseChannel, transfer: &Transfer, _holidays: &HolidayCalendar) -> bool {
        [&transfer.partner_id, &transfer.commercial_partner_id]
            .into_iter()
            .flatten()
            .any(|p| channel.partner_ids.iter().any(|c| c == p))
    }
}

pub struct CarrierPredicate;

impl ChannelPredicate for CarrierPredicate {
    fn name(&self) -> &'static str {
        "carrier"
    }

    fn is_set(&self, channel: &ReleaseChannel) -> bool {
        !channel.carrier_ids.is_empty()
    }

    fn accepts(&self, channel: &ReleaseChannel, transfer: &Transfer, _holidays: &HolidayCalendar) -> bool {
        match &transfer.carrier_id {
            Some(carrier) => channel.carrier_ids.iter().any(|c| c == carrier),
            None => false,
        }
    }
}

pub struct DeliveryWeekdayPredicate;

impl ChannelPredicate for DeliveryWeekdayPredicate {
    fn name(&self) -> &'static str {
        "delivery_weekday"
    }

    fn is_set(&self, channel: &ReleaseChannel) -> bool {
        !channel.delivery_weekdays.is_empty()
    }

    fn accepts(&self, channel: &ReleaseChannel, transfer: &Transfer, _holidays: &HolidayCalendar) -> bool {
        let weekday = transfer.scheduled_date.weekday().number_from_monday();
        channel.delivery_weekdays.contains(&weekday)
    }
}

pub struct GeoZonePredicate;

impl ChannelPredicate for GeoZonePredicate {
    fn name(&self) -> &'static str {
        "geo_zone"
    }

    fn is_set(&self, channel: &ReleaseChannel) -> bool {
        channel.geo_zone.is_some()
    }

    fn accepts(&self, channel: &ReleaseChannel, transfer: &Transfer, _holidays: &HolidayCalendar) -> bool {
        match (&channel.geo_zone, transfer.delivery_lat, transfer.delivery_lon) {
            (Some(zone), Some(lat), Some(lon)) => zone.contains(lat, lon),
            _ => false,
        }
    }
}

pub struct DepotPredicate;

impl ChannelPredicate for DepotPredicate {
    fn name(&self) -> &'static str {
        "depot"
    }

    fn is_set(&self, channel: &ReleaseChannel) -> bool {
        channel.warehouse_id.is_some()
    }

    fn accepts(&self, channel: &ReleaseChannel, transfer: &Transfer, _holidays: &HolidayCalendar) -> bool {
        channel.warehouse_id.is_some() && channel.warehouse_id == transfer.warehouse_id
    }
}

pub struct PublicHolidayPredicate;

impl ChannelPredicate for PublicHolidayPredicate {
    fn name(&self) -> &'static str {
        "public_holiday"
    }

    fn is_set(&self, channel: &ReleaseChannel) -> bool {
        channel.exclude_public_holidays
    }

    fn accepts(&self, _channel: &ReleaseChannel, transfer: &Transfer, holidays: &HolidayCalendar) -> bool {
        !holidays.is_holiday(transfer.scheduled_date.date())
    }
}

// ==========================================
// 分配结果
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AssignmentOutcome {
    Assigned {
        channel_id: String,
        previous: Option<String>,
    },
    Unchanged {
        channel_id: String,
    },
    Unassigned {
        previous: Option<String>,
    },
    SkippedMidRelease,
    SkippedClosed,
}

impl AssignmentOutcome {
    /// 分配后的通道
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            AssignmentOutcome::Assigned { channel_id, .. }
            | AssignmentOutcome::Unchanged { channel_id } => Some(channel_id),
            _ => None,
        }
    }

    /// 是否需要写库
    pub fn is_change(&self) -> bool {
        match self {
            AssignmentOutcome::Assigned { .. } => true,
            AssignmentOutcome::Unassigned { previous } => previous.is_some(),
            _ => false,
        }
    }
}

// ==========================================
// ChannelAssignor
// ==========================================
pub struct ChannelAssignor {
    predicates: Vec<Box<dyn ChannelPredicate>>,
}

impl Default for ChannelAssignor {
    fn default() -> Self {
        Self {
            predicates: vec![
                Box::new(PartnerPredicate),
                Box::new(CarrierPredicate),
                Box::new(DeliveryWeekdayPredicate),
                Box::new(GeoZonePredicate),
                Box::new(DepotPredicate),
                Box::new(PublicHolidayPredicate),
            ],
        }
    }
}

impl ChannelAssignor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_predicate(mut self, predicate: Box<dyn ChannelPredicate>) -> Self {
        self.predicates.push(predicate);
        self
    }

    /// 通道已设置的条件数
    pub fn specificity(&self, channel: &ReleaseChannel) -> usize {
        self.predicates.iter().filter(|p| p.is_set(channel)).count()
    }

    /// 谓词链是否接受调拨单
    pub fn matches(&self, channel: &ReleaseChannel, transfer: &Transfer, holidays: &HolidayCalendar) -> bool {
        self.predicates
            .iter()
            .all(|p| !p.is_set(channel) || p.accepts(channel, transfer, holidays))
    }

    /// 选出最优通道
    pub fn select<'c>(
        &self,
        transfer: &Transfer,
        channels: &'c [ReleaseChannel],
        holidays: &HolidayCalendar,
        policy: TieBreakPolicy,
    ) -> Option<&'c ReleaseChannel> {
        let current = transfer.release_channel_id.as_deref();
        let mut eligible: Vec<(&ReleaseChannel, usize)> = channels
            .iter()
            .filter(|c| {
                c.state.accepts_assignment()
                    || (c.state == ChannelState::Locked && Some(c.channel_id.as_str()) == current)
            })
            .filter(|c| self.matches(c, transfer, holidays))
            .map(|c| (c, self.specificity(c)))
            .collect();

        eligible.sort_by(|(a, sa), (b, sb)| {
            let by_sequence = a.sequence.cmp(&b.sequence);
            let by_specificity = sb.cmp(sa);
            let primary = match policy {
                TieBreakPolicy::PriorityFirst => by_sequence.then(by_specificity),
                TieBreakPolicy::SpecificityFirst => by_specificity.then(by_sequence),
            };
            if primary != Ordering::Equal {
                primary
            } else {
                a.channel_id.cmp(&b.channel_id)
            }
        });

        eligible.first().map(|(c, _)| *c)
    }

    /// 计算分配结果 (不写库)
    pub fn decide(
        &self,
        transfer: &Transfer,
        channels: &[ReleaseChannel],
        holidays: &HolidayCalendar,
        policy: TieBreakPolicy,
        force: bool,
    ) -> AssignmentOutcome {
        if transfer.is_closed {
            return AssignmentOutcome::SkippedClosed;
        }
        // 仅阻止在通道间迁移; 无通道的调拨单 (如休眠延后) 照常分配
        if transfer.is_mid_release() && transfer.release_channel_id.is_some() && !force {
            return AssignmentOutcome::SkippedMidRelease;
        }

        let previous = transfer.release_channel_id.clone();
        match self.select(transfer, channels, holidays, policy) {
            Some(channel) if previous.as_deref() == Some(channel.channel_id.as_str()) => {
                AssignmentOutcome::Unchanged {
                    channel_id: channel.channel_id.clone(),
                }
            }
            Some(channel) => AssignmentOutcome::Assigned {
                channel_id: channel.channel_id.clone(),
                previous,
            },
            None => AssignmentOutcome::Unassigned { previous },
        }
    }

    /// 计算并落库 (在调用方检查点内)
    pub fn assign_with(
        &self,
        conn: &Connection,
        transfer: &mut Transfer,
        channels: &[ReleaseChannel],
        holidays: &HolidayCalendar,
        policy: TieBreakPolicy,
        force: bool,
    ) -> EngineResult<AssignmentOutcome> {
        let outcome = self.decide(transfer, channels, holidays, policy, force);
        if outcome.is_change() {
            transfer.release_channel_id = outcome.channel_id().map(str::to_string);
            TransferRepository::update_with(conn, transfer)?;
            tracing::info!(
                transfer_id = %transfer.transfer_id,
                channel_id = ?transfer.release_channel_id,
                "通道分配变更"
            );
        }
        Ok(outcome)
    }
}
