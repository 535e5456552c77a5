// ==========================================
// 仓库出库释放系统 - 释放服务 (工作单元编排)
// ==========================================
// 单个调拨单的工作单元:
//   租约 → 检查点 → 加载行 → 可用量快照 → 决策 → 拆分
//   → 落库(版本校验) → 欠单分配 → 派生标志 → 审计 → 提交 → 释放租约 → 发布事件
// 红线: 同一工作者同一时刻最多持有一个调拨单租约
// 红线: 事件只在提交后发布
// ==========================================

mod line_ops;
mod release;
mod unrelease;

#[cfg(test)]
mod tests;

use crate::config::release_config_trait::ReleaseConfig;
use crate::domain::types::{ReleaseDecision, SkipReason};
use crate::engine::assignor::{AssignmentOutcome, ChannelAssignor};
use crate::engine::availability::{AvailabilityCalculator, QuantityLedger};
use crate::engine::context::ReleaseContext;
use crate::engine::decision::DecisionEngine;
use crate::engine::error::{EngineError, EngineResult};
use crate::engine::events::{OptionalEventPublisher, ReleaseEvent, ReleaseEventPublisher};
use crate::engine::splitter::MoveSplitter;
use crate::repository::checkpoint::run_in_checkpoint;
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::lock_repo::TransferLockRepository;
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub use unrelease::{UnreleaseOutcome, UnreleaseRejection};

// ==========================================
// 请求与结果
// ==========================================

/// 释放范围
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineScope {
    /// 调拨单全部行
    All,
    /// 指定行 (整单发货策略下扩展为全部行)
    Lines(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    pub transfer_id: String,
    pub scope: LineScope,
    /// None: 租约被占用时立即放弃 (调度器)
    pub lock_wait: Option<Duration>,
    /// 仅在整单全量就绪时释放 (按伙伴分组批次)
    pub require_full: bool,
}

impl ReleaseRequest {
    pub fn whole(transfer_id: &str) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            scope: LineScope::All,
            lock_wait: None,
            require_full: false,
        }
    }

    pub fn lines(transfer_id: &str, line_ids: Vec<String>) -> Self {
        Self {
            scope: LineScope::Lines(line_ids),
            ..Self::whole(transfer_id)
        }
    }

    pub fn with_lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = Some(wait);
        self
    }

    pub fn full_only(mut self) -> Self {
        self.require_full = true;
        self
    }
}

/// 单行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineResult {
    pub line_id: String,
    pub transfer_id: String,
    pub released_qty: Decimal,
    pub skip: Option<SkipReason>,
    /// 拆分产生的欠单行
    pub backorder_line_id: Option<String>,
}

impl LineResult {
    pub fn released(line_id: &str, transfer_id: &str, qty: Decimal) -> Self {
        Self {
            line_id: line_id.to_string(),
            transfer_id: transfer_id.to_string(),
            released_qty: qty,
            skip: None,
            backorder_line_id: None,
        }
    }

    pub fn skipped(line_id: &str, transfer_id: &str, reason: SkipReason) -> Self {
        Self {
            line_id: line_id.to_string(),
            transfer_id: transfer_id.to_string(),
            released_qty: Decimal::ZERO,
            skip: Some(reason),
            backorder_line_id: None,
        }
    }

    pub fn is_released(&self) -> bool {
        self.skip.is_none()
    }
}

/// 单个调拨单的释放结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferReleaseResult {
    pub transfer_id: String,
    pub decision: ReleaseDecision,
    pub lines: Vec<LineResult>,
    pub backorder_transfer_id: Option<String>,
    pub backorder_assignment: Option<AssignmentOutcome>,
    /// 租约被其他工作者持有,未处理
    pub contended: bool,
}

impl TransferReleaseResult {
    pub(crate) fn contended(transfer_id: &str, line_ids: &[String]) -> Self {
        Self::skipped_all(transfer_id, line_ids, SkipReason::LockedByOtherWorker)
    }

    /// 工作单元失败 (已回滚): 争用记为租约占用, 其他记为失败
    pub fn failed(transfer_id: &str, line_ids: &[String], error: &EngineError) -> Self {
        if error.is_contention() {
            Self::contended(transfer_id, line_ids)
        } else {
            Self::skipped_all(transfer_id, line_ids, SkipReason::Failed)
        }
    }

    fn skipped_all(transfer_id: &str, line_ids: &[String], reason: SkipReason) -> Self {
        Self {
            transfer_id: transfer_id.to_string(),
            decision: ReleaseDecision::NotReady,
            lines: line_ids
                .iter()
                .map(|id| LineResult::skipped(id, transfer_id, reason))
                .collect(),
            backorder_transfer_id: None,
            backorder_assignment: None,
            contended: reason == SkipReason::LockedByOtherWorker,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.lines.iter().any(|l| l.skip == Some(SkipReason::Failed))
    }

    pub fn released_count(&self) -> usize {
        self.lines.iter().filter(|l| l.is_released()).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.lines.len() - self.released_count()
    }
}

// ==========================================
// ReleaseService
// ==========================================
pub struct ReleaseService {
    conn: Arc<Mutex<Connection>>,
    locks: Arc<TransferLockRepository>,
    calculator: AvailabilityCalculator,
    decision: DecisionEngine,
    splitter: MoveSplitter,
    assignor: ChannelAssignor,
    publisher: OptionalEventPublisher,
    max_stale_retries: u32,
    manual_lock_wait: Duration,
}

impl ReleaseService {
    /// # 参数
    /// - conn: 工作单元使用的连接
    /// - locks: 租约仓储 (独立连接,避免与工作单元互相阻塞)
    /// - ledger: 数量账本 (独立连接)
    pub fn new(
        conn: Arc<Mutex<Connection>>,
        locks: Arc<TransferLockRepository>,
        ledger: Arc<dyn QuantityLedger>,
        config: &ReleaseConfig,
    ) -> Self {
        Self {
            conn,
            locks,
            calculator: AvailabilityCalculator::new(ledger),
            decision: DecisionEngine::new(),
            splitter: MoveSplitter::new(),
            assignor: ChannelAssignor::new(),
            publisher: OptionalEventPublisher::none(),
            max_stale_retries: config.max_stale_retries,
            manual_lock_wait: Duration::from_millis(config.manual_lock_wait_ms),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn ReleaseEventPublisher>) -> Self {
        self.publisher = OptionalEventPublisher::with_publisher(publisher);
        self
    }

    pub fn with_decision_engine(mut self, decision: DecisionEngine) -> Self {
        self.decision = decision;
        self
    }

    pub fn with_assignor(mut self, assignor: ChannelAssignor) -> Self {
        self.assignor = assignor;
        self
    }

    /// 人工入口的租约等待时长
    pub fn manual_lock_wait(&self) -> Duration {
        self.manual_lock_wait
    }

    fn get_conn(&self) -> RepositoryResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    /// 在调拨单租约 + 检查点内执行工作单元
    ///
    /// - 租约获取失败返回 Ok(None)
    /// - 争用类错误 (忙/版本冲突) 按 max_stale_retries 重试,每次重新加载
    /// - 事件在提交并释放租约后发布
    fn run_locked<T, F>(
        &self,
        ctx: &ReleaseContext,
        transfer_id: &str,
        lock_wait: Option<Duration>,
        checkpoint_name: &str,
        mut unit: F,
    ) -> EngineResult<Option<T>>
    where
        F: FnMut(&Connection) -> EngineResult<(T, Vec<ReleaseEvent>)>,
    {
        let guard = match lock_wait {
            Some(wait) => self.locks.acquire_with_wait(transfer_id, &ctx.worker_id, wait)?,
            None => self.locks.try_acquire(transfer_id, &ctx.worker_id)?,
        };
        let guard = match guard {
            Some(g) => g,
            None => return Ok(None),
        };

        let mut attempt = 0;
        let result = loop {
            let outcome = {
                let conn = self.get_conn()?;
                run_in_checkpoint(&conn, checkpoint_name, |c| unit(c))
            };
            match outcome {
                Err(e) if e.is_contention() && attempt < self.max_stale_retries => {
                    attempt += 1;
                    tracing::warn!(transfer_id, attempt, error = %e, "工作单元争用,重新加载后重试");
                }
                other => break other,
            }
        };

        if let Err(e) = guard.release() {
            tracing::warn!(transfer_id, error = %e, "租约释放失败,等待过期");
        }

        let (value, events) = result?;
        self.publisher.publish_all(events);
        Ok(Some(value))
    }
}
