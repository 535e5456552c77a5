// ==========================================
// 仓库出库释放系统 - API层错误类型
// ==========================================
// 职责: 定义API层错误类型,转换仓储/引擎错误为带原因码的错误
// 约定: 校验失败必须带原因码,不可静默忽略
// ==========================================

use crate::engine::error::EngineError;
use crate::repository::error::RepositoryError;
use thiserror::Error;

/// API层错误类型
#[derive(Error, Debug)]
pub enum ApiError {
    // ==========================================
    // 业务规则错误
    // ==========================================
    #[error("无效输入: {0}")]
    InvalidInput(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    /// 操作被拒绝 (带原因码)
    #[error("操作被拒绝[{code}]: {message}")]
    Rejected { code: String, message: String },

    #[error("业务规则违反: {0}")]
    BusinessRuleViolation(String),

    #[error("无效的状态转换: from={from} to={to}")]
    InvalidStateTransition { from: String, to: String },

    // ==========================================
    // 并发控制错误
    // ==========================================
    /// 租约或数据库被占用,稍后重试
    #[error("资源争用: {0}")]
    Contention(String),

    #[error("乐观锁冲突: {0}")]
    OptimisticLockFailure(String),

    // ==========================================
    // 数据访问错误
    // ==========================================
    #[error("数据库错误: {0}")]
    DatabaseError(String),

    #[error("数据库连接失败: {0}")]
    DatabaseConnectionError(String),

    #[error("数据库事务失败: {0}")]
    DatabaseTransactionError(String),

    #[error("数据验证失败: {0}")]
    ValidationError(String),

    // ==========================================
    // 通用错误
    // ==========================================
    #[error("内部错误: {0}")]
    InternalError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ApiError {
    /// 机器可读的原因码
    pub fn reason_code(&self) -> &str {
        match self {
            ApiError::InvalidInput(_) => "invalid_input",
            ApiError::NotFound(_) => "not_found",
            ApiError::Rejected { code, .. } => code,
            ApiError::BusinessRuleViolation(_) => "business_rule_violation",
            ApiError::InvalidStateTransition { .. } => "invalid_state_transition",
            ApiError::Contention(_) => "contention",
            ApiError::OptimisticLockFailure(_) => "stale_revision",
            ApiError::DatabaseError(_)
            | ApiError::DatabaseConnectionError(_)
            | ApiError::DatabaseTransactionError(_) => "storage",
            ApiError::ValidationError(_) => "validation",
            ApiError::InternalError(_) | ApiError::Other(_) => "internal",
        }
    }
}

// ==========================================
// 从 RepositoryError 转换
// ==========================================
impl From<RepositoryError> for ApiError {
    fn from(err: RepositoryError) -> Self {
        match err {
            // 并发控制错误
            RepositoryError::OptimisticLockFailure { entity, id, expected } => {
                ApiError::OptimisticLockFailure(format!(
                    "{}(id={})已被其他工作者修改（期望revision={}）",
                    entity, id, expected
                ))
            }
            RepositoryError::Busy(msg) => ApiError::Contention(msg),

            // 数据库错误
            RepositoryError::NotFound { entity, id } => {
                ApiError::NotFound(format!("{}(id={})不存在", entity, id))
            }
            RepositoryError::DatabaseConnectionError(msg) => ApiError::DatabaseConnectionError(msg),
            RepositoryError::DatabaseTransactionError(msg) => {
                ApiError::DatabaseTransactionError(msg)
            }
            RepositoryError::LockError(msg) => {
                ApiError::DatabaseConnectionError(format!("数据库锁获取失败: {}", msg))
            }
            RepositoryError::DatabaseQueryError(msg) => ApiError::DatabaseError(msg),
            RepositoryError::UniqueConstraintViolation(msg) => {
                ApiError::BusinessRuleViolation(format!("唯一约束违反: {}", msg))
            }
            RepositoryError::ForeignKeyViolation(msg) => {
                ApiError::BusinessRuleViolation(format!("外键约束违反: {}", msg))
            }

            // 业务规则错误
            RepositoryError::BusinessRuleViolation(msg) => ApiError::BusinessRuleViolation(msg),
            RepositoryError::InvalidStateTransition { from, to } => {
                ApiError::InvalidStateTransition { from, to }
            }

            // 数据质量错误
            RepositoryError::ValidationError(msg) => ApiError::ValidationError(msg),
            RepositoryError::FieldValueError { field, message } => {
                ApiError::InvalidInput(format!("字段{}错误: {}", field, message))
            }

            // 通用错误
            RepositoryError::InternalError(msg) => ApiError::InternalError(msg),
            RepositoryError::Other(err) => ApiError::Other(err),
        }
    }
}

// ==========================================
// 从 EngineError 转换
// ==========================================
impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Repository(e) => e.into(),
            EngineError::NotFound { entity, id } => {
                ApiError::NotFound(format!("{}(id={})不存在", entity, id))
            }
            EngineError::ImmutableLine { line_id, state } => ApiError::Rejected {
                code: state.as_str().to_string(),
                message: format!("需求行{}已为终态({}),不可修改", line_id, state),
            },
            EngineError::InvalidTransition { channel_id, from, to } => {
                ApiError::InvalidStateTransition {
                    from: format!("{}:{}", channel_id, from),
                    to: to.to_string(),
                }
            }
            EngineError::ChannelHasPendingWork { channel_id, pending } => ApiError::Rejected {
                code: "pending_work".to_string(),
                message: format!("通道{}仍有{}个待释放调拨单", channel_id, pending),
            },
            e @ EngineError::BackorderForbidden { .. } => ApiError::Rejected {
                code: "backorder_forbidden".to_string(),
                message: e.to_string(),
            },
            e @ (EngineError::InvalidSplit { .. } | EngineError::MergeRejected { .. }) => {
                ApiError::BusinessRuleViolation(e.to_string())
            }
            EngineError::Validation(msg) => ApiError::ValidationError(msg),
        }
    }
}

/// Result 类型别名
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{ChannelState, LineState};

    #[test]
    fn test_repository_error_conversion() {
        let repo_err = RepositoryError::NotFound {
            entity: "Transfer".to_string(),
            id: "T001".to_string(),
        };
        let api_err: ApiError = repo_err.into();
        match api_err {
            ApiError::NotFound(msg) => {
                assert!(msg.contains("Transfer"));
                assert!(msg.contains("T001"));
            }
            _ => panic!("Expected NotFound"),
        }

        let busy: ApiError = RepositoryError::Busy("database is locked".to_string()).into();
        assert_eq!(busy.reason_code(), "contention");
    }

    #[test]
    fn test_engine_error_reason_codes() {
        let cancelled: ApiError = EngineError::ImmutableLine {
            line_id: "L1".to_string(),
            state: LineState::Cancelled,
        }
        .into();
        assert_eq!(cancelled.reason_code(), "cancelled");

        let pending: ApiError = EngineError::ChannelHasPendingWork {
            channel_id: "C1".to_string(),
            pending: 3,
        }
        .into();
        assert_eq!(pending.reason_code(), "pending_work");

        let transition: ApiError = EngineError::InvalidTransition {
            channel_id: "C1".to_string(),
            from: ChannelState::Draft,
            to: ChannelState::Asleep,
        }
        .into();
        assert!(matches!(transition, ApiError::InvalidStateTransition { .. }));

        let stale: ApiError = EngineError::Repository(RepositoryError::OptimisticLockFailure {
            entity: "DemandLine".to_string(),
            id: "L1".to_string(),
            expected: 2,
        })
        .into();
        assert_eq!(stale.reason_code(), "stale_revision");
    }
}
