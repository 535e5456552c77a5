// ==========================================
// 仓库出库释放系统 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// ==========================================
// 职责: 提供数据访问接口,屏蔽数据库细节
// 约束: 所有查询使用参数化,防止 SQL 注入
// 事务: 由 checkpoint 模块提供作用域检查点,仓储的 *_with 方法在其中复用同一连接
// ==========================================

pub mod action_log_repo;
pub mod channel_repo;
pub mod checkpoint;
pub mod demand_line_repo;
pub mod error;
pub mod ledger_repo;
pub mod lock_repo;
pub mod plan_repo;
pub mod schema;
pub mod transfer_repo;

// 重导出核心仓储
pub use action_log_repo::ActionLogRepository;
pub use channel_repo::ChannelRepository;
pub use checkpoint::{run_in_checkpoint, ScopedCheckpoint};
pub use demand_line_repo::DemandLineRepository;
pub use error::{RepositoryError, RepositoryResult};
pub use ledger_repo::SqliteQuantityLedger;
pub use lock_repo::{TransferLease, TransferLockGuard, TransferLockRepository};
pub use plan_repo::PlanRepository;
pub use schema::ensure_schema;
pub use transfer_repo::TransferRepository;
