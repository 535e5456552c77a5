// ==========================================
// 仓库出库释放系统 - 释放通道状态机
// ==========================================
// 允许的转换:
//   draft  → open    (启用)
//   open   → locked  (锁定批次)
//   locked → open    (解锁)
//   open/locked → asleep (休眠, 需无待释放工作或显式延后)
//   asleep → open    (唤醒)
// 每次转换写 action_log
// ==========================================

use crate::config::config_manager::ConfigManager;
use crate::domain::action_log::{ActionLog, ActionType};
use crate::domain::channel::ReleaseChannel;
use crate::domain::types::ChannelState;
use crate::engine::context::ReleaseContext;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::events::ReleaseEvent;
use crate::repository::action_log_repo::ActionLogRepository;
use crate::repository::channel_repo::ChannelRepository;
use crate::repository::plan_repo::PlanRepository;
use crate::repository::transfer_repo::TransferRepository;
use chrono::NaiveDate;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// 状态转换是否合法
pub fn can_transition(from: ChannelState, to: ChannelState) -> bool {
    use ChannelState::*;
    matches!(
        (from, to),
        (Draft, Open) | (Open, Locked) | (Locked, Open) | (Open, Asleep) | (Locked, Asleep) | (Asleep, Open)
    )
}

/// 状态转换结果
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub channel: ReleaseChannel,
    pub from: ChannelState,
    /// 延后休眠时被解除分配的调拨单
    pub unassigned_transfer_ids: Vec<String>,
    pub events: Vec<ReleaseEvent>,
}

/// 备货计划启动结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaunchReport {
    pub plan_id: String,
    pub as_of_date: Option<NaiveDate>,
    pub woken: Vec<String>,
    /// 节假日跳过的通道
    pub skipped_holiday: Vec<String>,
    /// 非休眠状态,无需唤醒
    pub not_asleep: Vec<String>,
    #[serde(skip)]
    pub events: Vec<ReleaseEvent>,
}

pub struct ChannelStateMachine;

impl ChannelStateMachine {
    /// 执行状态转换 (在调用方检查点内)
    ///
    /// # 参数
    /// - defer_pending: 休眠时若仍有待释放调拨单,解除其分配而不是拒绝
    pub fn transition_with(
        conn: &Connection,
        channel_id: &str,
        to: ChannelState,
        ctx: &ReleaseContext,
        defer_pending: bool,
    ) -> EngineResult<TransitionOutcome> {
        let mut channel = ChannelRepository::find_by_id_with(conn, channel_id)?.ok_or_else(|| {
            EngineError::NotFound {
                entity: "ReleaseChannel",
                id: channel_id.to_string(),
            }
        })?;
        let from = channel.state;

        if !can_transition(from, to) {
            return Err(EngineError::InvalidTransition {
                channel_id: channel_id.to_string(),
                from,
                to,
            });
        }

        let mut unassigned = Vec::new();
        if to == ChannelState::Asleep {
            let pending = TransferRepository::count_pending_by_channel_with(conn, channel_id)?;
            if pending > 0 {
                if !defer_pending {
                    return Err(EngineError::ChannelHasPendingWork {
                        channel_id: channel_id.to_string(),
                        pending,
                    });
                }
                unassigned = TransferRepository::unassign_pending_by_channel_with(conn, channel_id)?;
            }
        }

        channel.state = to;
        if to == ChannelState::Open && from == ChannelState::Asleep {
            channel.last_wake_date = Some(ctx.now.date());
        }
        channel.updated_at = ctx.now;
        ChannelRepository::update_state_with(conn, &channel)?;

        let log = ActionLog::new(ActionType::ChannelTransition, &ctx.actor, ctx.now)
            .with_channel(channel_id)
            .with_payload(json!({
                "from": from.as_str(),
                "to": to.as_str(),
                "defer_pending": defer_pending,
            }))
            .with_impact(json!({ "unassigned_transfers": unassigned }));
        ActionLogRepository::insert_with(conn, &log)?;

        tracing::info!(
            channel_id,
            from = %from,
            to = %to,
            unassigned = unassigned.len(),
            "通道状态变更"
        );

        let mut events = vec![ReleaseEvent::ChannelStateChanged {
            channel_id: channel_id.to_string(),
            from,
            to,
        }];
        events.extend(unassigned.iter().map(|id| ReleaseEvent::ChannelAssigned {
            transfer_id: id.clone(),
            channel_id: None,
        }));

        Ok(TransitionOutcome {
            channel,
            from,
            unassigned_transfer_ids: unassigned,
            events,
        })
    }

    /// 启动备货计划: 唤醒计划内全部休眠通道
    ///
    /// as_of_date 为公共节假日时,排除节假日的通道保持休眠
    pub fn launch_plan_with(
        conn: &Connection,
        plan_id: &str,
        as_of_date: NaiveDate,
        ctx: &ReleaseContext,
    ) -> EngineResult<LaunchReport> {
        if PlanRepository::find_by_id_with(conn, plan_id)?.is_none() {
            return Err(EngineError::NotFound {
                entity: "ChannelPreparationPlan",
                id: plan_id.to_string(),
            });
        }
        let holidays = PlanRepository::load_holiday_calendar_with(conn)?;
        let is_holiday = holidays.is_holiday(as_of_date);

        let mut report = LaunchReport {
            plan_id: plan_id.to_string(),
            as_of_date: Some(as_of_date),
            ..Default::default()
        };

        for channel in ChannelRepository::list_by_plan_with(conn, plan_id)? {
            if channel.state != ChannelState::Asleep {
                report.not_asleep.push(channel.channel_id);
                continue;
            }
            if is_holiday && channel.exclude_public_holidays {
                report.skipped_holiday.push(channel.channel_id);
                continue;
            }
            let outcome = Self::transition_with(conn, &channel.channel_id, ChannelState::Open, ctx, false)?;
            report.events.extend(outcome.events);
            report.woken.push(channel.channel_id);
        }

        PlanRepository::update_last_launch_with(conn, plan_id, as_of_date)?;

        let log = ActionLog::new(ActionType::LaunchPlan, &ctx.actor, ctx.now)
            .with_payload(json!({
                "plan_id": plan_id,
                "as_of_date": as_of_date.to_string(),
                "config": ConfigManager::snapshot_with(conn)?,
            }))
            .with_impact(json!({
                "woken": report.woken,
                "skipped_holiday": report.skipped_holiday,
            }));
        ActionLogRepository::insert_with(conn, &log)?;

        tracing::info!(
            plan_id,
            as_of = %as_of_date,
            woken = report.woken.len(),
            skipped_holiday = report.skipped_holiday.len(),
            "备货计划启动"
        );
        Ok(report)
    }
}
