// ==========================================
// 仓库出库释放系统 - 请求上下文
// ==========================================
// 显式传入每次引擎调用: 操作人、业务时间、可用量时间窗、工作者标识、分配平局规则
// ==========================================

use crate::config::release_config_trait::ReleaseConfig;
use crate::domain::plan::AvailabilityWindow;
use crate::domain::types::TieBreakPolicy;
use chrono::NaiveDateTime;

#[derive(Debug, Clone)]
pub struct ReleaseContext {
    pub actor: String,
    pub now: NaiveDateTime,
    pub window: AvailabilityWindow,
    /// 租约持有者标识 (每个工作者唯一)
    pub worker_id: String,
    pub tie_break: TieBreakPolicy,
}

impl ReleaseContext {
    pub fn new(actor: &str, now: NaiveDateTime) -> Self {
        Self {
            actor: actor.to_string(),
            now,
            window: AvailabilityWindow::default(),
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            tie_break: TieBreakPolicy::default(),
        }
    }

    pub fn from_config(actor: &str, now: NaiveDateTime, config: &ReleaseConfig) -> Self {
        Self::new(actor, now)
            .with_window(config.window)
            .with_tie_break(config.tie_break)
    }

    pub fn with_window(mut self, window: AvailabilityWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_tie_break(mut self, tie_break: TieBreakPolicy) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// 预计入库量的截止时间
    pub fn horizon(&self) -> NaiveDateTime {
        self.window.horizon(self.now)
    }
}
