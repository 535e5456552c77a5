// ==========================================
// 仓库出库释放系统 - 引擎层错误类型
// ==========================================
// 职责: 拆分/合并/分配/通道状态机的规则违反
// 存储层错误透传, 由调用方区分争用 / 致命 / 单据级失败
// ==========================================

use crate::domain::types::{ChannelState, LineState};
use crate::repository::error::RepositoryError;
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: &'static str, id: String },

    // ===== 拆分/合并 =====
    #[error("拆分数量无效: line_id={line_id}, release_qty={release_qty}, requested={requested}")]
    InvalidSplit {
        line_id: String,
        release_qty: Decimal,
        requested: Decimal,
    },

    #[error("路由禁止欠单, 不可拆分: line_id={line_id}")]
    BackorderForbidden { line_id: String },

    #[error("需求行不可合并: {reason}")]
    MergeRejected { reason: String },

    #[error("需求行已为终态, 不可修改: line_id={line_id}, state={state}")]
    ImmutableLine { line_id: String, state: LineState },

    // ===== 通道状态机 =====
    #[error("无效的通道状态转换: channel={channel_id}, {from} -> {to}")]
    InvalidTransition {
        channel_id: String,
        from: ChannelState,
        to: ChannelState,
    },

    #[error("通道仍有待释放工作: channel={channel_id}, pending={pending}")]
    ChannelHasPendingWork { channel_id: String, pending: i64 },

    #[error("数据验证失败: {0}")]
    Validation(String),
}

impl EngineError {
    /// 争用: 调度器延后重试,不向用户暴露
    pub fn is_contention(&self) -> bool {
        matches!(self, EngineError::Repository(e) if e.is_contention())
    }

    /// 致命: 存储不可用或事务边界损坏, 中止整个驱动轮次
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Repository(
                RepositoryError::DatabaseConnectionError(_)
                    | RepositoryError::DatabaseTransactionError(_)
                    | RepositoryError::LockError(_)
            )
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
