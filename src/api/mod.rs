// ==========================================
// 仓库出库释放系统 - API 层
// ==========================================
// 职责: 对外入口 (人工释放/撤销、通道分配、通道生命周期、看板查询)
// ==========================================

pub mod channel_api;
pub mod error;
pub mod release_api;

// 重导出核心类型
pub use channel_api::ChannelApi;
pub use error::{ApiError, ApiResult};
pub use release_api::{AssignReport, ReleaseApi, ReleaseOutcome, ReleaseReport};
