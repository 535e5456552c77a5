// ==========================================
// 仓库出库释放系统 - 通道 API
// ==========================================
// 职责: 通道生命周期命令、备货计划启动、通道/计划维护
// 约定: 每个命令在独立检查点内执行,提交后发布事件
// ==========================================

use chrono::NaiveDate;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::api::error::{ApiError, ApiResult};
use crate::domain::channel::ReleaseChannel;
use crate::domain::plan::ChannelPreparationPlan;
use crate::domain::types::ChannelState;
use crate::engine::channel_state::{ChannelStateMachine, LaunchReport, TransitionOutcome};
use crate::engine::context::ReleaseContext;
use crate::engine::error::EngineError;
use crate::engine::events::OptionalEventPublisher;
use crate::repository::channel_repo::ChannelRepository;
use crate::repository::checkpoint::run_in_checkpoint;
use crate::repository::plan_repo::PlanRepository;

/// 通道API
pub struct ChannelApi {
    conn: Arc<Mutex<Connection>>,
    channel_repo: Arc<ChannelRepository>,
    plan_repo: Arc<PlanRepository>,
    publisher: OptionalEventPublisher,
}

impl ChannelApi {
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        channel_repo: Arc<ChannelRepository>,
        plan_repo: Arc<PlanRepository>,
        publisher: OptionalEventPublisher,
    ) -> Self {
        Self {
            conn,
            channel_repo,
            plan_repo,
            publisher,
        }
    }

    // ==========================================
    // 生命周期命令
    // ==========================================

    /// draft → open
    pub fn activate(&self, ctx: &ReleaseContext, channel_id: &str) -> ApiResult<TransitionOutcome> {
        self.transition(ctx, channel_id, Some(ChannelState::Draft), ChannelState::Open, false, "channel_activate")
    }

    /// open → locked (停止接收新分配,继续释放)
    pub fn lock(&self, ctx: &ReleaseContext, channel_id: &str) -> ApiResult<TransitionOutcome> {
        self.transition(ctx, channel_id, None, ChannelState::Locked, false, "channel_lock")
    }

    /// locked → open
    pub fn unlock(&self, ctx: &ReleaseContext, channel_id: &str) -> ApiResult<TransitionOutcome> {
        self.transition(ctx, channel_id, Some(ChannelState::Locked), ChannelState::Open, false, "channel_unlock")
    }

    /// open/locked → asleep
    ///
    /// 仍有待释放调拨单时: defer_pending=false 拒绝; true 解除其分配,下一轮重新分配
    pub fn sleep(
        &self,
        ctx: &ReleaseContext,
        channel_id: &str,
        defer_pending: bool,
    ) -> ApiResult<TransitionOutcome> {
        self.transition(ctx, channel_id, None, ChannelState::Asleep, defer_pending, "channel_sleep")
    }

    /// asleep → open
    pub fn wake(&self, ctx: &ReleaseContext, channel_id: &str) -> ApiResult<TransitionOutcome> {
        self.transition(ctx, channel_id, Some(ChannelState::Asleep), ChannelState::Open, false, "channel_wake")
    }

    /// 启动备货计划: 唤醒计划内全部休眠通道
    pub fn launch_plan(
        &self,
        ctx: &ReleaseContext,
        plan_id: &str,
        as_of_date: NaiveDate,
    ) -> ApiResult<LaunchReport> {
        let report = {
            let conn = self.get_conn()?;
            run_in_checkpoint(&conn, "launch_plan", |c| {
                ChannelStateMachine::launch_plan_with(c, plan_id, as_of_date, ctx)
            })?
        };
        self.publisher.publish_all(report.events.clone());
        info!(
            actor = %ctx.actor,
            plan_id,
            %as_of_date,
            woken = report.woken.len(),
            skipped_holiday = report.skipped_holiday.len(),
            "备货计划已启动"
        );
        Ok(report)
    }

    /// expected_from: 命令要求的起始状态 (同为 → open 的 activate/unlock/wake 需区分)
    fn transition(
        &self,
        ctx: &ReleaseContext,
        channel_id: &str,
        expected_from: Option<ChannelState>,
        to: ChannelState,
        defer_pending: bool,
        checkpoint_name: &str,
    ) -> ApiResult<TransitionOutcome> {
        if channel_id.trim().is_empty() {
            return Err(ApiError::InvalidInput("通道ID不能为空".to_string()));
        }
        let outcome = {
            let conn = self.get_conn()?;
            run_in_checkpoint(&conn, checkpoint_name, |c| {
                if let Some(expected) = expected_from {
                    let current = ChannelRepository::find_by_id_with(c, channel_id)?
                        .map(|ch| ch.state)
                        .ok_or_else(|| EngineError::NotFound {
                            entity: "ReleaseChannel",
                            id: channel_id.to_string(),
                        })?;
                    if current != expected {
                        return Err(EngineError::InvalidTransition {
                            channel_id: channel_id.to_string(),
                            from: current,
                            to,
                        });
                    }
                }
                ChannelStateMachine::transition_with(c, channel_id, to, ctx, defer_pending)
            })?
        };
        self.publisher.publish_all(outcome.events.clone());
        Ok(outcome)
    }

    // ==========================================
    // 维护
    // ==========================================

    /// 新建通道 (始终从草稿状态开始)
    pub fn create_channel(&self, ctx: &ReleaseContext, mut channel: ReleaseChannel) -> ApiResult<ReleaseChannel> {
        if channel.name.trim().is_empty() {
            return Err(ApiError::InvalidInput("通道名称不能为空".to_string()));
        }
        if let Some(day) = channel.delivery_weekdays.iter().find(|d| !(1..=7).contains(*d)) {
            return Err(ApiError::InvalidInput(format!("交货星期超出范围 [1, 7]: {}", day)));
        }
        if let Some(zone) = &channel.geo_zone {
            if zone.polygon.len() < 3 {
                return Err(ApiError::InvalidInput("地理区域至少需要3个顶点".to_string()));
            }
        }
        if let Some(plan_id) = &channel.preparation_plan_id {
            if self.plan_repo.find_by_id(plan_id)?.is_none() {
                return Err(ApiError::NotFound(format!("ChannelPreparationPlan(id={})不存在", plan_id)));
            }
        }

        if channel.channel_id.trim().is_empty() {
            channel.channel_id = uuid::Uuid::new_v4().to_string();
        }
        channel.state = ChannelState::Draft;
        channel.last_wake_date = None;
        channel.updated_at = ctx.now;
        self.channel_repo.insert(&channel)?;

        info!(
            actor = %ctx.actor,
            channel_id = %channel.channel_id,
            batch_mode = channel.batch_mode.as_str(),
            "通道已创建"
        );
        Ok(channel)
    }

    pub fn create_plan(&self, ctx: &ReleaseContext, name: &str) -> ApiResult<ChannelPreparationPlan> {
        if name.trim().is_empty() {
            return Err(ApiError::InvalidInput("备货计划名称不能为空".to_string()));
        }
        let plan = ChannelPreparationPlan {
            plan_id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            last_launch_date: None,
            created_at: ctx.now,
        };
        self.plan_repo.insert(&plan)?;
        info!(actor = %ctx.actor, plan_id = %plan.plan_id, "备货计划已创建");
        Ok(plan)
    }

    /// 维护公共节假日日历
    pub fn add_holiday(&self, date: NaiveDate, name: Option<&str>) -> ApiResult<()> {
        Ok(self.plan_repo.add_holiday(date, name)?)
    }

    pub fn get_channel(&self, channel_id: &str) -> ApiResult<ReleaseChannel> {
        self.channel_repo
            .find_by_id(channel_id)?
            .ok_or_else(|| ApiError::NotFound(format!("ReleaseChannel(id={})不存在", channel_id)))
    }

    pub fn list_channels(&self) -> ApiResult<Vec<ReleaseChannel>> {
        Ok(self.channel_repo.list_all()?)
    }

    fn get_conn(&self) -> ApiResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| ApiError::DatabaseConnectionError(format!("数据库锁获取失败: {}", e)))
    }
}
