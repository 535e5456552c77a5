// ==========================================
// 仓库出库释放系统 - 领域模型层
// ==========================================
// 职责: 定义领域实体、类型与纯不变量
// 红线: 不含数据访问逻辑,不含引擎逻辑
// ==========================================

pub mod action_log;
pub mod channel;
pub mod demand_line;
pub mod plan;
pub mod quantity;
pub mod transfer;
pub mod types;

// 重导出核心类型
pub use action_log::{ActionLog, ActionType};
pub use channel::{GeoZone, HolidayCalendar, ReleaseChannel};
pub use demand_line::DemandLine;
pub use plan::{AvailabilityWindow, ChannelPreparationPlan};
pub use transfer::{compute_flags, Transfer, TransferFlags};
pub use types::{
    BatchMode, ChannelState, LineState, ReleaseDecision, ShippingPolicy, SkipReason,
    TieBreakPolicy,
};
