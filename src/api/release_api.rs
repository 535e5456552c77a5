// ==========================================
// 仓库出库释放系统 - 释放 API
// ==========================================
// 职责: 人工释放/撤销释放、通道分配、看板计数、执行子系统回报
// 约定: 部分结果不是异常,调用方按行检查结果
// 约定: 人工入口在租约被占用时最多等待 manual_lock_wait
// ==========================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::error::{ApiError, ApiResult};
use crate::domain::demand_line::DemandLine;
use crate::domain::types::{BatchMode, ChannelState, SkipReason};
use crate::engine::assignor::AssignmentOutcome;
use crate::engine::context::ReleaseContext;
use crate::engine::error::EngineError;
use crate::engine::release_service::{
    LineResult, ReleaseRequest, ReleaseService, TransferReleaseResult, UnreleaseOutcome,
};
use crate::repository::channel_repo::ChannelRepository;
use crate::repository::demand_line_repo::DemandLineRepository;
use crate::repository::transfer_repo::TransferRepository;

// ==========================================
// ReleaseReport - 人工释放结果
// ==========================================

/// 释放总体结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseOutcome {
    /// 全部行按需求量释放
    Ok,
    /// 部分释放 (有跳过行或产生欠单)
    Partial,
    /// 没有释放任何行,且存在阻断行
    Blocked,
    NotReady,
}

impl ReleaseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseOutcome::Ok => "ok",
            ReleaseOutcome::Partial => "partial",
            ReleaseOutcome::Blocked => "blocked",
            ReleaseOutcome::NotReady => "not_ready",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseReport {
    pub outcome: ReleaseOutcome,
    pub lines: Vec<LineResult>,
    pub released_count: usize,
    pub skipped_count: usize,
    pub backorder_transfer_ids: Vec<String>,
    /// 工作单元失败并已回滚的调拨单 (其行记为跳过)
    pub failed_transfer_ids: Vec<String>,
}

impl ReleaseReport {
    fn from_results(results: Vec<TransferReleaseResult>) -> Self {
        let mut lines = Vec::new();
        let mut backorder_transfer_ids = Vec::new();
        let mut failed_transfer_ids = Vec::new();
        for result in results {
            if result.is_failed() {
                failed_transfer_ids.push(result.transfer_id.clone());
            }
            lines.extend(result.lines);
            if let Some(bo) = result.backorder_transfer_id {
                backorder_transfer_ids.push(bo);
            }
        }
        let released_count = lines.iter().filter(|l| l.is_released()).count();
        let skipped_count = lines.len() - released_count;

        let outcome = if released_count > 0 {
            if skipped_count == 0 && backorder_transfer_ids.is_empty() {
                ReleaseOutcome::Ok
            } else {
                ReleaseOutcome::Partial
            }
        } else if lines.iter().any(|l| l.skip == Some(SkipReason::Blocked)) {
            ReleaseOutcome::Blocked
        } else {
            ReleaseOutcome::NotReady
        };

        Self {
            outcome,
            lines,
            released_count,
            skipped_count,
            backorder_transfer_ids,
            failed_transfer_ids,
        }
    }

    /// 按原因统计跳过行
    pub fn skip_summary(&self) -> BTreeMap<&'static str, usize> {
        let mut summary = BTreeMap::new();
        for reason in self.lines.iter().filter_map(|l| l.skip) {
            *summary.entry(reason.as_str()).or_insert(0) += 1;
        }
        summary
    }
}

// ==========================================
// AssignReport - 通道分配结果
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignReport {
    /// transfer_id → 当前通道 (None = 未分配)
    pub channels: BTreeMap<String, Option<String>>,
    pub outcomes: BTreeMap<String, AssignmentOutcome>,
    /// 租约被占用,留给下一轮调度
    pub deferred: Vec<String>,
    /// 分配到自动通道后立即释放的调拨单
    pub auto_released: Vec<String>,
}

// ==========================================
// ReleaseApi
// ==========================================

/// 释放API
///
/// 职责：
/// 1. 人工释放 (调拨单/需求行) 与撤销释放
/// 2. 通道分配 (分配到自动通道后立即尝试释放)
/// 3. 看板计数
/// 4. 执行子系统回报 (阻断、拣货进度、取消)
pub struct ReleaseApi {
    service: Arc<ReleaseService>,
    transfer_repo: Arc<TransferRepository>,
    line_repo: Arc<DemandLineRepository>,
    channel_repo: Arc<ChannelRepository>,
}

impl ReleaseApi {
    pub fn new(
        service: Arc<ReleaseService>,
        transfer_repo: Arc<TransferRepository>,
        line_repo: Arc<DemandLineRepository>,
        channel_repo: Arc<ChannelRepository>,
    ) -> Self {
        Self {
            service,
            transfer_repo,
            line_repo,
            channel_repo,
        }
    }

    // ==========================================
    // 释放 / 撤销释放
    // ==========================================

    /// 人工释放调拨单 (全部行)
    ///
    /// # 返回
    /// - Ok(ReleaseReport): 逐行结果; 部分释放不是错误
    /// - Err(ApiError::NotFound): 任一调拨单不存在 (不做任何处理)
    pub fn release_transfers(
        &self,
        ctx: &ReleaseContext,
        transfer_ids: &[String],
    ) -> ApiResult<ReleaseReport> {
        let transfer_ids = dedup_ids(transfer_ids, "调拨单ID")?;
        let found = self.transfer_repo.find_by_ids(&transfer_ids)?;
        if let Some(missing) = transfer_ids
            .iter()
            .find(|id| !found.iter().any(|t| &t.transfer_id == *id))
        {
            return Err(ApiError::NotFound(format!("Transfer(id={})不存在", missing)));
        }

        let wait = self.service.manual_lock_wait();
        let mut results = Vec::with_capacity(transfer_ids.len());
        for transfer_id in &transfer_ids {
            let request = ReleaseRequest::whole(transfer_id).with_lock_wait(wait);
            let result = match self.service.release_transfer(ctx, &request) {
                Ok(result) => result,
                Err(e) => {
                    let line_ids: Vec<String> = self
                        .line_repo
                        .find_by_transfer(transfer_id)?
                        .into_iter()
                        .map(|l| l.line_id)
                        .collect();
                    Self::failed_result(transfer_id, &line_ids, e)?
                }
            };
            results.push(result);
        }

        let report = ReleaseReport::from_results(results);
        info!(
            actor = %ctx.actor,
            transfers = transfer_ids.len(),
            released = report.released_count,
            skipped = report.skipped_count,
            outcome = report.outcome.as_str(),
            "人工释放调拨单"
        );
        Ok(report)
    }

    /// 人工释放需求行 (按所属调拨单分组处理)
    pub fn release_lines(&self, ctx: &ReleaseContext, line_ids: &[String]) -> ApiResult<ReleaseReport> {
        let line_ids = dedup_ids(line_ids, "需求行ID")?;
        let lines = self.line_repo.find_by_ids(&line_ids)?;
        if let Some(missing) = line_ids
            .iter()
            .find(|id| !lines.iter().any(|l| &l.line_id == *id))
        {
            return Err(ApiError::NotFound(format!("DemandLine(id={})不存在", missing)));
        }

        let mut by_transfer: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for line in &lines {
            by_transfer
                .entry(line.transfer_id.clone())
                .or_default()
                .push(line.line_id.clone());
        }

        let wait = self.service.manual_lock_wait();
        let mut results = Vec::with_capacity(by_transfer.len());
        for (transfer_id, ids) in by_transfer {
            let request = ReleaseRequest::lines(&transfer_id, ids.clone()).with_lock_wait(wait);
            let result = match self.service.release_transfer(ctx, &request) {
                Ok(result) => result,
                Err(e) => Self::failed_result(&transfer_id, &ids, e)?,
            };
            results.push(result);
        }

        let report = ReleaseReport::from_results(results);
        info!(
            actor = %ctx.actor,
            lines = line_ids.len(),
            released = report.released_count,
            skipped = report.skipped_count,
            outcome = report.outcome.as_str(),
            "人工释放需求行"
        );
        Ok(report)
    }

    /// 单个调拨单失败不影响本批其余调拨单; 存储不可用时整体返回错误
    fn failed_result(
        transfer_id: &str,
        line_ids: &[String],
        e: EngineError,
    ) -> ApiResult<TransferReleaseResult> {
        if e.is_fatal() {
            return Err(e.into());
        }
        warn!(transfer_id = %transfer_id, error = %e, "调拨单释放失败,继续处理本批其余调拨单");
        Ok(TransferReleaseResult::failed(transfer_id, line_ids, &e))
    }

    /// 撤销释放
    ///
    /// safe=true 时,任一行已被执行子系统消耗则该调拨单整体拒绝
    pub fn unrelease(
        &self,
        ctx: &ReleaseContext,
        transfer_ids: &[String],
        safe: bool,
    ) -> ApiResult<Vec<UnreleaseOutcome>> {
        let transfer_ids = dedup_ids(transfer_ids, "调拨单ID")?;
        let wait = self.service.manual_lock_wait();
        let mut outcomes = Vec::with_capacity(transfer_ids.len());
        for transfer_id in &transfer_ids {
            let outcome = self
                .service
                .unrelease_transfer(ctx, transfer_id, safe, Some(wait))?;
            if let UnreleaseOutcome::Rejected { reason, .. } = &outcome {
                debug!(transfer_id = %transfer_id, reason = reason.code(), "撤销释放被拒绝");
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    // ==========================================
    // 通道分配
    // ==========================================

    /// 为调拨单分配通道 (强制重新计算)
    ///
    /// 分配到开放的自动通道后立即尝试释放
    pub fn assign_channel(&self, ctx: &ReleaseContext, transfer_ids: &[String]) -> ApiResult<AssignReport> {
        let transfer_ids = dedup_ids(transfer_ids, "调拨单ID")?;
        let found = self.transfer_repo.find_by_ids(&transfer_ids)?;
        if let Some(missing) = transfer_ids
            .iter()
            .find(|id| !found.iter().any(|t| &t.transfer_id == *id))
        {
            return Err(ApiError::NotFound(format!("Transfer(id={})不存在", missing)));
        }

        let wait = self.service.manual_lock_wait();
        let mut report = AssignReport::default();

        for transfer_id in &transfer_ids {
            let assigned = match self.service.assign_transfer(ctx, transfer_id, true, Some(wait)) {
                Ok(assigned) => assigned,
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    warn!(transfer_id = %transfer_id, error = %e, "通道分配失败,留给下一轮调度");
                    None
                }
            };
            match assigned {
                Some(outcome) => {
                    if outcome.is_change() {
                        if let Some(channel_id) = outcome.channel_id() {
                            if self.offer_release(ctx, transfer_id, channel_id)? {
                                report.auto_released.push(transfer_id.clone());
                            }
                        }
                    }
                    report.outcomes.insert(transfer_id.clone(), outcome);
                }
                None => report.deferred.push(transfer_id.clone()),
            }

            let current = self
                .transfer_repo
                .find_by_id(transfer_id)?
                .and_then(|t| t.release_channel_id);
            report.channels.insert(transfer_id.clone(), current);
        }

        info!(
            actor = %ctx.actor,
            transfers = transfer_ids.len(),
            assigned = report.channels.values().filter(|c| c.is_some()).count(),
            deferred = report.deferred.len(),
            auto_released = report.auto_released.len(),
            "人工分配通道"
        );
        Ok(report)
    }

    /// 开放的自动通道: 分配后立即释放
    fn offer_release(&self, ctx: &ReleaseContext, transfer_id: &str, channel_id: &str) -> ApiResult<bool> {
        let channel = match self.channel_repo.find_by_id(channel_id)? {
            Some(c) => c,
            None => return Ok(false),
        };
        if channel.state != ChannelState::Open || channel.batch_mode != BatchMode::Automatic {
            return Ok(false);
        }
        let request = ReleaseRequest::whole(transfer_id).with_lock_wait(self.service.manual_lock_wait());
        match self.service.release_transfer(ctx, &request) {
            Ok(result) => Ok(result.released_count() > 0),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => {
                // 分配已提交, 释放留给调度轮次
                warn!(transfer_id = %transfer_id, error = %e, "分配后立即释放失败");
                Ok(false)
            }
        }
    }

    // ==========================================
    // 看板计数
    // ==========================================

    /// 产品的待释放需求行数
    pub fn needs_release_count_for_product(&self, product_id: &str) -> ApiResult<i64> {
        if product_id.trim().is_empty() {
            return Err(ApiError::InvalidInput("产品ID不能为空".to_string()));
        }
        Ok(self.line_repo.count_needs_release_by_product(product_id)?)
    }

    /// 调拨单的待释放需求行数
    pub fn needs_release_count_for_transfer(&self, transfer_id: &str) -> ApiResult<i64> {
        if transfer_id.trim().is_empty() {
            return Err(ApiError::InvalidInput("调拨单ID不能为空".to_string()));
        }
        Ok(self.line_repo.count_needs_release_by_transfer(transfer_id)?)
    }

    // ==========================================
    // 行级操作 (操作人 / 执行子系统)
    // ==========================================

    pub fn set_release_blocked(
        &self,
        ctx: &ReleaseContext,
        line_id: &str,
        blocked: bool,
    ) -> ApiResult<DemandLine> {
        Ok(self.service.set_release_blocked(ctx, line_id, blocked)?)
    }

    /// 拣货进度回报; done=true 时行进入终态
    pub fn record_line_progress(
        &self,
        ctx: &ReleaseContext,
        line_id: &str,
        picked_qty: rust_decimal::Decimal,
        done: bool,
    ) -> ApiResult<DemandLine> {
        Ok(self.service.record_line_progress(ctx, line_id, picked_qty, done)?)
    }

    pub fn cancel_lines(
        &self,
        ctx: &ReleaseContext,
        transfer_id: &str,
        line_ids: &[String],
    ) -> ApiResult<Vec<LineResult>> {
        let line_ids = dedup_ids(line_ids, "需求行ID")?;
        Ok(self.service.cancel_lines(ctx, transfer_id, &line_ids)?)
    }
}

/// 去重并校验非空 (保持输入顺序)
fn dedup_ids(ids: &[String], label: &str) -> ApiResult<Vec<String>> {
    if ids.is_empty() {
        return Err(ApiError::InvalidInput(format!("{}列表不能为空", label)));
    }
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if id.trim().is_empty() {
            return Err(ApiError::InvalidInput(format!("{}不能为空", label)));
        }
        if !out.contains(id) {
            out.push(id.clone());
        }
    }
    Ok(out)
}
