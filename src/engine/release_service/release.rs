use super::{LineResult, LineScope, ReleaseRequest, ReleaseService, TransferReleaseResult};
use crate::config::config_manager::ConfigManager;
use crate::domain::action_log::{ActionLog, ActionType};
use crate::domain::demand_line::DemandLine;
use crate::domain::transfer::{apply_flags, compute_flags, Transfer};
use crate::domain::types::{ReleaseDecision, ShippingPolicy, SkipReason};
use crate::engine::assignor::AssignmentOutcome;
use crate::engine::availability::AvailabilitySnapshot;
use crate::engine::context::ReleaseContext;
use crate::engine::decision::TransferVerdict;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::events::{ReleaseEvent, ReleasedLine};
use crate::repository::action_log_repo::ActionLogRepository;
use crate::repository::channel_repo::ChannelRepository;
use crate::repository::demand_line_repo::DemandLineRepository;
use crate::repository::plan_repo::PlanRepository;
use crate::repository::transfer_repo::TransferRepository;
use rusqlite::Connection;
use serde_json::json;
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;
use tracing::instrument;

impl ReleaseService {
    // ==========================================
    // 释放
    // ==========================================

    /// 释放一个调拨单 (或其中部分行)
    ///
    /// 租约被占用时返回 contended 结果,不报错
    #[instrument(skip(self, ctx, request), fields(transfer_id = %request.transfer_id))]
    pub fn release_transfer(
        &self,
        ctx: &ReleaseContext,
        request: &ReleaseRequest,
    ) -> EngineResult<TransferReleaseResult> {
        let outcome = self.run_locked(
            ctx,
            &request.transfer_id,
            request.lock_wait,
            "release_transfer",
            |conn| self.release_unit(conn, ctx, request),
        )?;

        match outcome {
            Some(result) => {
                tracing::info!(
                    transfer_id = %result.transfer_id,
                    decision = %result.decision,
                    released = result.released_count(),
                    skipped = result.skipped_count(),
                    backorder = ?result.backorder_transfer_id,
                    "调拨单释放完成"
                );
                Ok(result)
            }
            None => {
                tracing::debug!(transfer_id = %request.transfer_id, "调拨单租约被占用,跳过");
                let line_ids = match &request.scope {
                    LineScope::All => Vec::new(),
                    LineScope::Lines(ids) => ids.clone(),
                };
                Ok(TransferReleaseResult::contended(&request.transfer_id, &line_ids))
            }
        }
    }

    fn release_unit(
        &self,
        conn: &Connection,
        ctx: &ReleaseContext,
        request: &ReleaseRequest,
    ) -> EngineResult<(TransferReleaseResult, Vec<ReleaseEvent>)> {
        let mut transfer = TransferRepository::find_by_id_with(conn, &request.transfer_id)?
            .ok_or_else(|| EngineError::NotFound {
                entity: "Transfer",
                id: request.transfer_id.clone(),
            })?;
        let mut lines = DemandLineRepository::find_by_transfer_with(conn, &transfer.transfer_id)?;

        // 范围: 整单发货策略下指定行扩展为全部行
        let known: HashSet<&str> = lines.iter().map(|l| l.line_id.as_str()).collect();
        let mut results: Vec<LineResult> = Vec::new();
        let in_scope: HashSet<String> = match &request.scope {
            LineScope::Lines(ids) if transfer.shipping_policy != ShippingPolicy::AllAtOnce => {
                for id in ids.iter().filter(|id| !known.contains(id.as_str())) {
                    results.push(LineResult::skipped(id, &transfer.transfer_id, SkipReason::NotFound));
                }
                ids.iter().filter(|id| known.contains(id.as_str())).cloned().collect()
            }
            _ => lines.iter().map(|l| l.line_id.clone()).collect(),
        };

        // 通道未处于可释放状态
        if let Some(channel_id) = &transfer.release_channel_id {
            let releasable = ChannelRepository::find_by_id_with(conn, channel_id)?
                .map(|c| c.state.can_release())
                .unwrap_or(false);
            if !releasable {
                results.extend(
                    lines
                        .iter()
                        .filter(|l| in_scope.contains(&l.line_id))
                        .map(|l| LineResult::skipped(&l.line_id, &l.transfer_id, SkipReason::ChannelNotReleasable)),
                );
                let result = TransferReleaseResult {
                    transfer_id: transfer.transfer_id.clone(),
                    decision: ReleaseDecision::NotReady,
                    lines: results,
                    backorder_transfer_id: None,
                    backorder_assignment: None,
                    contended: false,
                };
                return Ok((result, Vec::new()));
            }
        }

        let snapshot = self.snapshot_with(conn, ctx, &lines)?;
        let verdict = self.decision.decide_transfer(&transfer, &lines, &snapshot);
        let full_only_blocked = request.require_full && verdict.decision != ReleaseDecision::ReadyFull;

        let mut released_lines = Vec::new();
        let mut backorders: Vec<DemandLine> = Vec::new();

        for (line, line_verdict) in lines.iter_mut().zip(verdict.lines.iter()) {
            if !in_scope.contains(&line.line_id) {
                continue;
            }
            if let Some(skip) = line_verdict.skip {
                results.push(LineResult::skipped(&line.line_id, &line.transfer_id, skip));
                continue;
            }
            if full_only_blocked || !line_verdict.decision.is_ready() {
                let reason = if line_verdict.decision == ReleaseDecision::Blocked {
                    SkipReason::Blocked
                } else {
                    SkipReason::NotReady
                };
                results.push(LineResult::skipped(&line.line_id, &line.transfer_id, reason));
                continue;
            }

            let backorder = self.splitter.split(line, line_verdict.release_qty)?;
            line.mark_released(ctx.now);
            DemandLineRepository::update_with(conn, line)?;

            let mut result = LineResult::released(&line.line_id, &line.transfer_id, line.requested_qty);
            if let Some(b) = backorder {
                result.backorder_line_id = Some(b.line_id.clone());
                backorders.push(b);
            }
            released_lines.push(ReleasedLine {
                line_id: line.line_id.clone(),
                product_id: line.product_id.clone(),
                quantity: line.requested_qty,
            });
            results.push(result);
        }

        let mut events = Vec::new();
        let mut backorder_transfer_id = None;
        let mut backorder_assignment = None;

        if !released_lines.is_empty() {
            if !backorders.is_empty() {
                let (bo_transfer, outcome, bo_events) =
                    self.create_backorder_transfer(conn, ctx, &transfer, backorders)?;
                backorder_transfer_id = Some(bo_transfer);
                backorder_assignment = Some(outcome);
                events.extend(bo_events);
            }

            transfer.last_release_date = Some(ctx.now);
            transfer.scheduled_date = ctx.window.expected_date(ctx.now);
            apply_flags(&mut transfer, compute_flags(&lines));
            TransferRepository::update_with(conn, &transfer)?;

            let log = ActionLog::new(ActionType::Release, &ctx.actor, ctx.now)
                .with_transfer(&transfer.transfer_id)
                .with_payload(json!({
                    "lines": released_lines,
                    "backorder_transfer_id": backorder_transfer_id,
                    "config": ConfigManager::snapshot_with(conn)?,
                }))
                .with_impact(json!({
                    "decision": verdict.decision.to_string(),
                    "released": released_lines.len(),
                    "skipped": results.iter().filter(|r| !r.is_released()).count(),
                    "needs_release": transfer.needs_release,
                }));
            ActionLogRepository::insert_with(conn, &log)?;

            events.insert(
                0,
                ReleaseEvent::LinesReleased {
                    transfer_id: transfer.transfer_id.clone(),
                    lines: released_lines,
                    released_at: ctx.now,
                },
            );
        }

        let result = TransferReleaseResult {
            transfer_id: transfer.transfer_id.clone(),
            decision: verdict.decision,
            lines: results,
            backorder_transfer_id,
            backorder_assignment,
            contended: false,
        };
        Ok((result, events))
    }

    /// 欠单行归入新的欠单调拨单并立即分配通道
    fn create_backorder_transfer(
        &self,
        conn: &Connection,
        ctx: &ReleaseContext,
        origin: &Transfer,
        mut backorders: Vec<DemandLine>,
    ) -> EngineResult<(String, AssignmentOutcome, Vec<ReleaseEvent>)> {
        let mut bo = Transfer {
            transfer_id: uuid::Uuid::new_v4().to_string(),
            name: format!("{}/BO", origin.name),
            release_channel_id: None,
            last_release_date: None,
            confirmed_at: ctx.now,
            needs_release: true,
            is_closed: false,
            backorder_of: Some(origin.transfer_id.clone()),
            ..origin.clone()
        };
        TransferRepository::insert_with(conn, &bo)?;

        for line in backorders.iter_mut() {
            line.transfer_id = bo.transfer_id.clone();
        }
        self.splitter.consolidate(&mut backorders);
        let mut line_ids = Vec::new();
        for line in backorders.iter().filter(|l| !l.is_terminal()) {
            DemandLineRepository::insert_with(conn, line)?;
            line_ids.push(line.line_id.clone());
        }

        let channels = ChannelRepository::list_all_with(conn)?;
        let holidays = PlanRepository::load_holiday_calendar_with(conn)?;
        let outcome = self
            .assignor
            .assign_with(conn, &mut bo, &channels, &holidays, ctx.tie_break, false)?;

        let mut log = ActionLog::new(ActionType::AssignChannel, &ctx.actor, ctx.now)
            .with_transfer(&bo.transfer_id)
            .with_payload(json!({ "origin_transfer_id": origin.transfer_id, "lines": line_ids }))
            .with_impact(serde_json::to_value(&outcome).unwrap_or_default());
        if let Some(channel_id) = outcome.channel_id() {
            log = log.with_channel(channel_id);
        }
        ActionLogRepository::insert_with(conn, &log)?;

        tracing::info!(
            origin = %origin.transfer_id,
            backorder = %bo.transfer_id,
            lines = line_ids.len(),
            channel_id = ?outcome.channel_id(),
            "欠单调拨单已创建"
        );

        let events = vec![
            ReleaseEvent::BackorderCreated {
                origin_transfer_id: origin.transfer_id.clone(),
                backorder_transfer_id: bo.transfer_id.clone(),
                line_ids,
            },
            ReleaseEvent::ChannelAssigned {
                transfer_id: bo.transfer_id.clone(),
                channel_id: outcome.channel_id().map(str::to_string),
            },
        ];
        Ok((bo.transfer_id, outcome, events))
    }

    /// 对一组行按产品批量计算可用量 (竞争集合 = 同产品全部活动行)
    fn snapshot_with(
        &self,
        conn: &Connection,
        ctx: &ReleaseContext,
        candidates: &[DemandLine],
    ) -> EngineResult<AvailabilitySnapshot> {
        let products: BTreeSet<&str> = candidates.iter().map(|l| l.product_id.as_str()).collect();
        let mut competitors = Vec::new();
        for product_id in products {
            competitors.extend(DemandLineRepository::find_active_by_product_with(conn, product_id)?);
        }
        Ok(self.calculator.snapshot(candidates, &competitors, ctx.horizon())?)
    }

    // ==========================================
    // 预筛 (不持有租约)
    // ==========================================

    /// 一次批量快照对多个调拨单给出决策,用于驱动器排序与跳过
    ///
    /// 结果只作参考,持有租约后会重新计算
    #[instrument(skip_all, fields(transfers = transfers.len()))]
    pub fn preview(&self, ctx: &ReleaseContext, transfers: &[Transfer]) -> EngineResult<Vec<TransferVerdict>> {
        let conn = self.get_conn()?;
        let mut per_transfer = Vec::with_capacity(transfers.len());
        let mut all_lines = Vec::new();
        for t in transfers {
            let lines = DemandLineRepository::find_by_transfer_with(&conn, &t.transfer_id)?;
            all_lines.extend(lines.iter().cloned());
            per_transfer.push(lines);
        }

        let snapshot = self.snapshot_with(&conn, ctx, &all_lines)?;
        Ok(transfers
            .iter()
            .zip(per_transfer.iter())
            .map(|(t, lines)| self.decision.decide_transfer(t, lines, &snapshot))
            .collect())
    }

    // ==========================================
    // 通道分配
    // ==========================================

    /// 为调拨单分配通道
    ///
    /// 租约被占用时返回 None (调度器下一轮重试)
    #[instrument(skip(self, ctx), fields(transfer_id = %transfer_id))]
    pub fn assign_transfer(
        &self,
        ctx: &ReleaseContext,
        transfer_id: &str,
        force: bool,
        lock_wait: Option<Duration>,
    ) -> EngineResult<Option<AssignmentOutcome>> {
        self.run_locked(ctx, transfer_id, lock_wait, "assign_transfer", |conn| {
            let mut transfer = TransferRepository::find_by_id_with(conn, transfer_id)?.ok_or_else(|| {
                EngineError::NotFound {
                    entity: "Transfer",
                    id: transfer_id.to_string(),
                }
            })?;
            let channels = ChannelRepository::list_all_with(conn)?;
            let holidays = PlanRepository::load_holiday_calendar_with(conn)?;
            let outcome = self
                .assignor
                .assign_with(conn, &mut transfer, &channels, &holidays, ctx.tie_break, force)?;

            let mut events = Vec::new();
            if outcome.is_change() {
                let mut log = ActionLog::new(ActionType::AssignChannel, &ctx.actor, ctx.now)
                    .with_transfer(transfer_id)
                    .with_payload(json!({ "force": force }))
                    .with_impact(serde_json::to_value(&outcome).unwrap_or_default());
                if let Some(channel_id) = outcome.channel_id() {
                    log = log.with_channel(channel_id);
                }
                ActionLogRepository::insert_with(conn, &log)?;
                events.push(ReleaseEvent::ChannelAssigned {
                    transfer_id: transfer_id.to_string(),
                    channel_id: outcome.channel_id().map(str::to_string),
                });
            }
            Ok((outcome, events))
        })
    }
}
