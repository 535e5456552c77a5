// ==========================================
// 仓库出库释放系统 - 调度驱动器
// ==========================================
// 一轮 (pass):
//   1. 为未分配通道的待释放调拨单分配通道
//   2. 选择通道 (定时: automatic / grouped_by_partner; 人工: 任意指定通道)
//   3. 批量预筛 (一次快照,不持有租约) → 跳过零可用量调拨单
//   4. 逐调拨单在租约下执行释放工作单元
// 单据级失败记录后继续; 致命错误 (存储不可用) 中止整轮
// 超时: 不再拉取新调拨单, 正在处理的调拨单完成提交或回滚后返回
// ==========================================

use crate::domain::transfer::Transfer;
use crate::domain::types::{BatchMode, ReleaseDecision};
use crate::engine::assignor::AssignmentOutcome;
use crate::engine::context::ReleaseContext;
use crate::engine::decision::TransferVerdict;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::release_service::{ReleaseRequest, ReleaseService, TransferReleaseResult};
use crate::repository::channel_repo::ChannelRepository;
use crate::repository::transfer_repo::TransferRepository;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::instrument;

/// 触发方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassTrigger {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone)]
pub struct PassOptions {
    pub trigger: PassTrigger,
    /// 为空时按触发方式选择通道
    pub channel_ids: Vec<String>,
    pub deadline: Option<Instant>,
}

impl PassOptions {
    pub fn scheduled() -> Self {
        Self {
            trigger: PassTrigger::Scheduled,
            channel_ids: Vec::new(),
            deadline: None,
        }
    }

    pub fn manual(channel_ids: Vec<String>) -> Self {
        Self {
            trigger: PassTrigger::Manual,
            channel_ids,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn expired(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }
}

/// 一轮结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    pub channels: Vec<String>,
    pub released: Vec<String>,
    pub not_ready: Vec<String>,
    pub blocked: Vec<String>,
    /// 租约被占用,下一轮重试
    pub contended: Vec<String>,
    pub failed: Vec<String>,
    /// 本轮因争用或读取失败跳过的通道
    pub skipped_channels: Vec<String>,
    pub backorder_transfers: Vec<String>,
    pub assignments: Vec<(String, AssignmentOutcome)>,
    pub timed_out: bool,
}

impl PassReport {
    fn record_release(&mut self, result: &TransferReleaseResult) {
        if result.contended {
            self.contended.push(result.transfer_id.clone());
        } else if result.released_count() > 0 {
            self.released.push(result.transfer_id.clone());
        } else if result.decision == ReleaseDecision::Blocked {
            self.blocked.push(result.transfer_id.clone());
        } else {
            self.not_ready.push(result.transfer_id.clone());
        }
        if let Some(bo) = &result.backorder_transfer_id {
            self.backorder_transfers.push(bo.clone());
        }
    }

    fn record_verdict(&mut self, verdict: &TransferVerdict) {
        if verdict.decision == ReleaseDecision::Blocked {
            self.blocked.push(verdict.transfer_id.clone());
        } else {
            self.not_ready.push(verdict.transfer_id.clone());
        }
    }
}

pub struct SchedulerDriver {
    service: Arc<ReleaseService>,
    channel_repo: Arc<ChannelRepository>,
    transfer_repo: Arc<TransferRepository>,
}

impl SchedulerDriver {
    pub fn new(
        service: Arc<ReleaseService>,
        channel_repo: Arc<ChannelRepository>,
        transfer_repo: Arc<TransferRepository>,
    ) -> Self {
        Self {
            service,
            channel_repo,
            transfer_repo,
        }
    }

    /// 执行一轮
    #[instrument(skip(self, ctx, options), fields(trigger = ?options.trigger, worker = %ctx.worker_id))]
    pub fn run_pass(&self, ctx: &ReleaseContext, options: &PassOptions) -> EngineResult<PassReport> {
        let started = Instant::now();
        let mut report = PassReport::default();

        // 1. 分配未分配的调拨单
        for transfer in self.transfer_repo.list_unassigned_needing_release()? {
            if options.expired() {
                report.timed_out = true;
                return Ok(report);
            }
            match self.service.assign_transfer(ctx, &transfer.transfer_id, false, None) {
                Ok(Some(outcome)) => report.assignments.push((transfer.transfer_id, outcome)),
                Ok(None) => report.contended.push(transfer.transfer_id),
                Err(e) => self.handle_error(&mut report, &transfer.transfer_id, e)?,
            }
        }

        // 2. 选择通道
        let channels: Vec<_> = self
            .channel_repo
            .list_all()?
            .into_iter()
            .filter(|c| c.state.can_release())
            .filter(|c| {
                if !options.channel_ids.is_empty() {
                    options.channel_ids.contains(&c.channel_id)
                } else {
                    match options.trigger {
                        PassTrigger::Scheduled => {
                            matches!(c.batch_mode, BatchMode::Automatic | BatchMode::GroupedByPartner)
                        }
                        PassTrigger::Manual => true,
                    }
                }
            })
            .collect();

        for channel in channels {
            if options.expired() {
                report.timed_out = true;
                break;
            }
            report.channels.push(channel.channel_id.clone());
            let transfers = match self.transfer_repo.list_needing_release_by_channel(&channel.channel_id) {
                Ok(transfers) => transfers,
                Err(e) => {
                    self.skip_channel(&mut report, &channel.channel_id, e.into())?;
                    continue;
                }
            };
            if transfers.is_empty() {
                continue;
            }

            // 3. 预筛
            let verdicts = match self.service.preview(ctx, &transfers) {
                Ok(verdicts) => verdicts,
                Err(e) => {
                    self.skip_channel(&mut report, &channel.channel_id, e)?;
                    continue;
                }
            };
            let finished = match channel.batch_mode {
                BatchMode::GroupedByPartner => {
                    self.release_grouped(ctx, options, &transfers, &verdicts, &mut report)?
                }
                BatchMode::Automatic | BatchMode::Manual => {
                    self.release_each(ctx, options, &transfers, &verdicts, &mut report)?
                }
            };
            if !finished {
                report.timed_out = true;
                break;
            }
        }

        tracing::info!(
            channels = report.channels.len(),
            released = report.released.len(),
            not_ready = report.not_ready.len(),
            blocked = report.blocked.len(),
            contended = report.contended.len(),
            failed = report.failed.len(),
            skipped_channels = report.skipped_channels.len(),
            backorders = report.backorder_transfers.len(),
            timed_out = report.timed_out,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "调度轮次完成"
        );
        Ok(report)
    }

    /// 逐调拨单释放; 返回 false 表示超时中断
    fn release_each(
        &self,
        ctx: &ReleaseContext,
        options: &PassOptions,
        transfers: &[Transfer],
        verdicts: &[TransferVerdict],
        report: &mut PassReport,
    ) -> EngineResult<bool> {
        for (transfer, verdict) in transfers.iter().zip(verdicts) {
            if options.expired() {
                return Ok(false);
            }
            if !verdict.decision.is_ready() {
                report.record_verdict(verdict);
                continue;
            }
            self.release_one(ctx, ReleaseRequest::whole(&transfer.transfer_id), report)?;
        }
        Ok(true)
    }

    /// 按商业伙伴分组: 组内全部整单就绪才释放, 否则整组不释放
    ///
    /// 每个调拨单仍在各自租约下释放 (不跨调拨单持锁)
    fn release_grouped(
        &self,
        ctx: &ReleaseContext,
        options: &PassOptions,
        transfers: &[Transfer],
        verdicts: &[TransferVerdict],
        report: &mut PassReport,
    ) -> EngineResult<bool> {
        let mut groups: BTreeMap<String, Vec<(&Transfer, &TransferVerdict)>> = BTreeMap::new();
        for (transfer, verdict) in transfers.iter().zip(verdicts) {
            let key = transfer
                .grouping_partner()
                .map(str::to_string)
                .unwrap_or_else(|| format!("transfer:{}", transfer.transfer_id));
            groups.entry(key).or_default().push((transfer, verdict));
        }

        for (partner, members) in groups {
            if options.expired() {
                return Ok(false);
            }
            let all_full = members
                .iter()
                .all(|(_, v)| v.decision == ReleaseDecision::ReadyFull);
            if !all_full {
                tracing::debug!(partner = %partner, members = members.len(), "伙伴分组未全部就绪");
                for (_, verdict) in &members {
                    report.record_verdict(verdict);
                }
                continue;
            }
            for (transfer, _) in members {
                let request = ReleaseRequest::whole(&transfer.transfer_id).full_only();
                self.release_one(ctx, request, report)?;
            }
        }
        Ok(true)
    }

    fn release_one(
        &self,
        ctx: &ReleaseContext,
        request: ReleaseRequest,
        report: &mut PassReport,
    ) -> EngineResult<()> {
        match self.service.release_transfer(ctx, &request) {
            Ok(result) => {
                report.record_release(&result);
                if let Some(outcome) = result.backorder_assignment {
                    if let Some(bo) = result.backorder_transfer_id {
                        report.assignments.push((bo, outcome));
                    }
                }
                Ok(())
            }
            Err(e) => self.handle_error(report, &request.transfer_id, e),
        }
    }

    /// 通道级读取失败: 致命错误上抛, 其余跳过该通道
    fn skip_channel(&self, report: &mut PassReport, channel_id: &str, e: EngineError) -> EngineResult<()> {
        if e.is_fatal() {
            tracing::error!(channel_id, error = %e, "存储不可用,中止调度轮次");
            return Err(e);
        }
        if e.is_contention() {
            tracing::debug!(channel_id, error = %e, "通道读取争用,下一轮重试");
        } else {
            tracing::warn!(channel_id, error = %e, "通道处理失败,继续本轮");
        }
        report.skipped_channels.push(channel_id.to_string());
        Ok(())
    }

    /// 致命错误上抛; 争用延后; 其他单据级失败记录后继续
    fn handle_error(&self, report: &mut PassReport, transfer_id: &str, e: EngineError) -> EngineResult<()> {
        if e.is_fatal() {
            tracing::error!(transfer_id, error = %e, "存储不可用,中止调度轮次");
            return Err(e);
        }
        if e.is_contention() {
            tracing::debug!(transfer_id, error = %e, "调拨单争用,下一轮重试");
            report.contended.push(transfer_id.to_string());
        } else {
            tracing::warn!(transfer_id, error = %e, "调拨单处理失败,继续本轮");
            report.failed.push(transfer_id.to_string());
        }
        Ok(())
    }
}
