use super::{LineResult, ReleaseService};
use crate::domain::action_log::{ActionLog, ActionType};
use crate::domain::demand_line::DemandLine;
use crate::domain::transfer::{apply_flags, compute_flags};
use crate::domain::types::{LineState, SkipReason};
use crate::engine::context::ReleaseContext;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::events::ReleaseEvent;
use crate::repository::action_log_repo::ActionLogRepository;
use crate::repository::demand_line_repo::DemandLineRepository;
use crate::repository::transfer_repo::TransferRepository;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tracing::instrument;

/// 撤销释放被拒绝的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnreleaseRejection {
    /// 没有已释放的行
    NotReleased,
    /// 安全模式下已有行被执行子系统消耗
    AlreadyConsumed { line_ids: Vec<String> },
    LockedByOtherWorker,
}

impl UnreleaseRejection {
    pub fn code(&self) -> &'static str {
        match self {
            UnreleaseRejection::NotReleased => "not_released",
            UnreleaseRejection::AlreadyConsumed { .. } => "already_consumed",
            UnreleaseRejection::LockedByOtherWorker => "locked_by_other_worker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnreleaseOutcome {
    Unreleased {
        transfer_id: String,
        lines: Vec<LineResult>,
        /// 撤销后合并的 (保留行, 退役行)
        merged: Vec<(String, String)>,
    },
    Rejected {
        transfer_id: String,
        reason: UnreleaseRejection,
    },
}

/// 已被执行子系统消耗 (已拣货或已完成)
fn is_consumed(line: &DemandLine) -> bool {
    line.state == LineState::Done || line.has_started_processing()
}

/// 曾被释放且未取消的行
fn was_released(line: &DemandLine) -> bool {
    line.released_at.is_some() && !line.needs_release && line.state != LineState::Cancelled
}

impl ReleaseService {
    /// 撤销调拨单的释放
    ///
    /// - safe=true: 任何已释放行被消耗则整体拒绝
    /// - safe=false: 跳过已消耗行,撤销其余行
    #[instrument(skip(self, ctx), fields(transfer_id = %transfer_id, safe))]
    pub fn unrelease_transfer(
        &self,
        ctx: &ReleaseContext,
        transfer_id: &str,
        safe: bool,
        lock_wait: Option<Duration>,
    ) -> EngineResult<UnreleaseOutcome> {
        let outcome = self.run_locked(ctx, transfer_id, lock_wait, "unrelease_transfer", |conn| {
            let mut transfer = TransferRepository::find_by_id_with(conn, transfer_id)?.ok_or_else(|| {
                EngineError::NotFound {
                    entity: "Transfer",
                    id: transfer_id.to_string(),
                }
            })?;
            let mut lines = DemandLineRepository::find_by_transfer_with(conn, transfer_id)?;

            let released: Vec<&DemandLine> = lines.iter().filter(|l| was_released(l)).collect();
            if released.is_empty() {
                return Ok((
                    UnreleaseOutcome::Rejected {
                        transfer_id: transfer_id.to_string(),
                        reason: UnreleaseRejection::NotReleased,
                    },
                    Vec::new(),
                ));
            }
            let consumed: Vec<String> = released
                .iter()
                .filter(|l| is_consumed(l))
                .map(|l| l.line_id.clone())
                .collect();
            if safe && !consumed.is_empty() {
                return Ok((
                    UnreleaseOutcome::Rejected {
                        transfer_id: transfer_id.to_string(),
                        reason: UnreleaseRejection::AlreadyConsumed { line_ids: consumed },
                    },
                    Vec::new(),
                ));
            }

            let mut results = Vec::new();
            let mut changed: HashSet<String> = HashSet::new();
            for line in lines.iter_mut().filter(|l| was_released(l)) {
                if is_consumed(line) {
                    let reason = if line.state == LineState::Done {
                        SkipReason::Done
                    } else {
                        SkipReason::AlreadyConsumed
                    };
                    results.push(LineResult::skipped(&line.line_id, transfer_id, reason));
                    continue;
                }
                let qty = line.reserved_qty;
                line.mark_unreleased();
                changed.insert(line.line_id.clone());
                results.push(LineResult::released(&line.line_id, transfer_id, qty));
            }

            // 撤销后与同单待释放行合并
            let merged = self.splitter.consolidate(&mut lines);
            for (keep, retire) in &merged {
                changed.insert(keep.clone());
                changed.insert(retire.clone());
            }
            for line in lines.iter_mut().filter(|l| changed.contains(&l.line_id)) {
                DemandLineRepository::update_with(conn, line)?;
            }

            let unreleased_ids: Vec<String> = results
                .iter()
                .filter(|r| r.is_released())
                .map(|r| r.line_id.clone())
                .collect();

            // 仍有已消耗的释放行时保持释放中
            if !lines.iter().any(was_released) {
                transfer.last_release_date = None;
            }
            apply_flags(&mut transfer, compute_flags(&lines));
            TransferRepository::update_with(conn, &transfer)?;

            let log = ActionLog::new(ActionType::Unrelease, &ctx.actor, ctx.now)
                .with_transfer(transfer_id)
                .with_payload(json!({ "safe": safe, "lines": unreleased_ids }))
                .with_impact(json!({
                    "skipped": results.len() - unreleased_ids.len(),
                    "merged": merged.len(),
                }));
            ActionLogRepository::insert_with(conn, &log)?;

            tracing::info!(
                transfer_id,
                unreleased = unreleased_ids.len(),
                merged = merged.len(),
                "撤销释放完成"
            );

            let events = if unreleased_ids.is_empty() {
                Vec::new()
            } else {
                vec![ReleaseEvent::LinesUnreleased {
                    transfer_id: transfer_id.to_string(),
                    line_ids: unreleased_ids,
                }]
            };
            Ok((
                UnreleaseOutcome::Unreleased {
                    transfer_id: transfer_id.to_string(),
                    lines: results,
                    merged,
                },
                events,
            ))
        })?;

        Ok(outcome.unwrap_or_else(|| UnreleaseOutcome::Rejected {
            transfer_id: transfer_id.to_string(),
            reason: UnreleaseRejection::LockedByOtherWorker,
        }))
    }
}
