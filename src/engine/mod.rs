// ==========================================
// 仓库出库释放系统 - 引擎层
// ==========================================
// 职责: 可用量计算、释放决策、拆分合并、通道分配、通道状态机、工作单元编排
// 红线: 决策必须输出 reason; SQL 只出现在仓储层
// ==========================================

pub mod assignor;
pub mod availability;
pub mod channel_state;
pub mod context;
pub mod decision;
pub mod driver;
pub mod error;
pub mod events;
pub mod release_service;
pub mod splitter;

// 重导出核心引擎
pub use assignor::{AssignmentOutcome, ChannelAssignor, ChannelPredicate};
pub use availability::{AvailabilityCalculator, AvailabilitySnapshot, LineAvailability, QuantityLedger};
pub use channel_state::{can_transition, ChannelStateMachine, LaunchReport, TransitionOutcome};
pub use context::ReleaseContext;
pub use decision::{DecisionEngine, LineVerdict, ReleaseRule, TransferRule, TransferVerdict};
pub use driver::{PassOptions, PassReport, PassTrigger, SchedulerDriver};
pub use error::{EngineError, EngineResult};
pub use events::{NoOpEventPublisher, OptionalEventPublisher, ReleaseEvent, ReleaseEventPublisher};
pub use release_service::{
    LineResult, LineScope, ReleaseRequest, ReleaseService, TransferReleaseResult, UnreleaseOutcome,
    UnreleaseRejection,
};
pub use splitter::{merge_key, MergeKey, MoveSplitter};
