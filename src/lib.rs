// ==========================================
// 仓库出库释放系统 - 核心库
// ==========================================
// 职责: 可承诺量计算、释放决策、拆分合并、释放通道分配与生命周期
// 技术栈: Rust + SQLite
// 并发: 调拨单租约 + 作用域检查点,多工作者不重复分配同一库存
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 实体与类型
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 引擎层 - 业务规则
pub mod engine;

// 配置层 - 系统配置
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一）
pub mod db;

// 日志系统
pub mod logging;

// API 层 - 业务接口
pub mod api;

// 应用层 - 组合根
pub mod app;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::types::{
    BatchMode, ChannelState, LineState, ReleaseDecision, ShippingPolicy, SkipReason,
    TieBreakPolicy,
};

// 领域实体
pub use domain::{
    ActionLog, ActionType, ChannelPreparationPlan, DemandLine, ReleaseChannel, Transfer,
};

// 引擎
pub use engine::{
    AvailabilityCalculator, ChannelAssignor, ChannelStateMachine, DecisionEngine, MoveSplitter,
    ReleaseContext, ReleaseService, SchedulerDriver,
};

// API
pub use api::{ApiError, ApiResult, ChannelApi, ReleaseApi};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "仓库出库释放系统";
