use super::{LineResult, ReleaseService};
use crate::domain::action_log::{ActionLog, ActionType};
use crate::domain::demand_line::DemandLine;
use crate::domain::quantity;
use crate::domain::transfer::{apply_flags, compute_flags};
use crate::domain::types::{LineState, SkipReason};
use crate::engine::context::ReleaseContext;
use crate::engine::error::{EngineError, EngineResult};
use crate::repository::action_log_repo::ActionLogRepository;
use crate::repository::demand_line_repo::DemandLineRepository;
use crate::repository::error::RepositoryError;
use crate::repository::transfer_repo::TransferRepository;
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde_json::json;
use std::cmp::Ordering;

fn load_line(conn: &Connection, line_id: &str) -> EngineResult<DemandLine> {
    DemandLineRepository::find_by_id_with(conn, line_id)?.ok_or_else(|| EngineError::NotFound {
        entity: "DemandLine",
        id: line_id.to_string(),
    })
}

fn ensure_mutable(line: &DemandLine) -> EngineResult<()> {
    if line.is_terminal() {
        return Err(EngineError::ImmutableLine {
            line_id: line.line_id.clone(),
            state: line.state,
        });
    }
    Ok(())
}

/// 行变更后重算所属调拨单派生标志
fn refresh_transfer_flags(conn: &Connection, transfer_id: &str) -> EngineResult<()> {
    let mut transfer = TransferRepository::find_by_id_with(conn, transfer_id)?.ok_or_else(|| {
        EngineError::NotFound {
            entity: "Transfer",
            id: transfer_id.to_string(),
        }
    })?;
    let lines = DemandLineRepository::find_by_transfer_with(conn, transfer_id)?;
    if apply_flags(&mut transfer, compute_flags(&lines)) {
        TransferRepository::update_with(conn, &transfer)?;
    }
    Ok(())
}

fn lock_busy(transfer_id: &str) -> EngineError {
    EngineError::Repository(RepositoryError::Busy(format!("调拨单租约被占用: {}", transfer_id)))
}

impl ReleaseService {
    /// 操作人阻断/解除阻断需求行
    pub fn set_release_blocked(
        &self,
        ctx: &ReleaseContext,
        line_id: &str,
        blocked: bool,
    ) -> EngineResult<DemandLine> {
        let transfer_id = {
            let conn = self.get_conn()?;
            load_line(&conn, line_id)?.transfer_id
        };

        let updated = self.run_locked(ctx, &transfer_id, Some(self.manual_lock_wait), "set_release_blocked", |conn| {
            let mut line = load_line(conn, line_id)?;
            ensure_mutable(&line)?;
            if line.release_blocked == blocked {
                return Ok((line, Vec::new()));
            }
            line.release_blocked = blocked;
            DemandLineRepository::update_with(conn, &mut line)?;

            let action = if blocked {
                ActionType::BlockRelease
            } else {
                ActionType::UnblockRelease
            };
            let log = ActionLog::new(action, &ctx.actor, ctx.now)
                .with_transfer(&line.transfer_id)
                .with_payload(json!({ "line_id": line.line_id }));
            ActionLogRepository::insert_with(conn, &log)?;
            tracing::info!(line_id = %line.line_id, blocked, "需求行阻断状态变更");
            Ok((line, Vec::new()))
        })?;
        updated.ok_or_else(|| lock_busy(&transfer_id))
    }

    /// 执行子系统回报拣货进度; done=true 时行进入终态
    pub fn record_line_progress(
        &self,
        ctx: &ReleaseContext,
        line_id: &str,
        picked_qty: Decimal,
        done: bool,
    ) -> EngineResult<DemandLine> {
        let transfer_id = {
            let conn = self.get_conn()?;
            load_line(&conn, line_id)?.transfer_id
        };

        let updated = self.run_locked(ctx, &transfer_id, Some(self.manual_lock_wait), "record_line_progress", |conn| {
            let mut line = load_line(conn, line_id)?;
            ensure_mutable(&line)?;
            if picked_qty < Decimal::ZERO
                || quantity::compare(picked_qty, line.requested_qty, line.uom_rounding) == Ordering::Greater
            {
                return Err(EngineError::Validation(format!(
                    "拣货数量{}超出范围 [0, {}]: line_id={}",
                    picked_qty, line.requested_qty, line.line_id
                )));
            }
            if !line.is_released() && !quantity::is_zero(picked_qty, line.uom_rounding) {
                return Err(EngineError::Validation(format!(
                    "需求行尚未释放,不能回报拣货: line_id={}",
                    line.line_id
                )));
            }

            line.picked_qty = picked_qty;
            if done {
                line.state = LineState::Done;
                line.needs_release = false;
            }
            DemandLineRepository::update_with(conn, &mut line)?;
            refresh_transfer_flags(conn, &line.transfer_id)?;
            tracing::debug!(line_id = %line.line_id, picked = %picked_qty, done, "拣货进度");
            Ok((line, Vec::new()))
        })?;
        updated.ok_or_else(|| lock_busy(&transfer_id))
    }

    /// 取消需求行 (同一调拨单内)
    ///
    /// 终态行与已开始拣货的行逐行跳过并给出原因
    pub fn cancel_lines(
        &self,
        ctx: &ReleaseContext,
        transfer_id: &str,
        line_ids: &[String],
    ) -> EngineResult<Vec<LineResult>> {
        let results = self.run_locked(ctx, transfer_id, Some(self.manual_lock_wait), "cancel_lines", |conn| {
            let mut results = Vec::with_capacity(line_ids.len());
            let mut cancelled = Vec::new();
            for line_id in line_ids {
                let mut line = match DemandLineRepository::find_by_id_with(conn, line_id)? {
                    Some(l) if l.transfer_id == transfer_id => l,
                    _ => {
                        results.push(LineResult::skipped(line_id, transfer_id, SkipReason::NotFound));
                        continue;
                    }
                };
                let skip = match line.state {
                    LineState::Cancelled => Some(SkipReason::Cancelled),
                    LineState::Done => Some(SkipReason::Done),
                    _ if line.has_started_processing() => Some(SkipReason::AlreadyConsumed),
                    _ => None,
                };
                if let Some(reason) = skip {
                    results.push(LineResult::skipped(line_id, transfer_id, reason));
                    continue;
                }

                let qty = line.requested_qty;
                line.state = LineState::Cancelled;
                line.needs_release = false;
                line.reserved_qty = Decimal::ZERO;
                DemandLineRepository::update_with(conn, &mut line)?;
                results.push(LineResult::released(line_id, transfer_id, qty));
                cancelled.push(line_id.clone());
            }

            if !cancelled.is_empty() {
                refresh_transfer_flags(conn, transfer_id)?;
                let log = ActionLog::new(ActionType::CancelLines, &ctx.actor, ctx.now)
                    .with_transfer(transfer_id)
                    .with_payload(json!({ "lines": cancelled }));
                ActionLogRepository::insert_with(conn, &log)?;
                tracing::info!(transfer_id, cancelled = cancelled.len(), "需求行已取消");
            }
            Ok((results, Vec::new()))
        })?;
        results.ok_or_else(|| lock_busy(transfer_id))
    }
}
