// ==========================================
// 仓库出库释放系统 - 操作日志领域模型
// ==========================================
// 红线: 释放/撤销/分配/通道状态变更必须记录
// 用途: 审计追踪
// ==========================================

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ==========================================
// ActionLog - 操作日志
// ==========================================
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionLog {
    pub action_id: String,
    pub action_type: String,             // ActionType::as_str()
    pub action_ts: NaiveDateTime,
    pub actor: String,

    // ===== 关联对象 =====
    pub transfer_id: Option<String>,
    pub channel_id: Option<String>,

    // ===== 负载与影响 =====
    pub payload_json: Option<JsonValue>,
    pub impact_summary_json: Option<JsonValue>,
    pub detail: Option<String>,
}

impl ActionLog {
    /// 创建新日志 (自动生成ID)
    pub fn new(action_type: ActionType, actor: &str, action_ts: NaiveDateTime) -> Self {
        Self {
            action_id: uuid::Uuid::new_v4().to_string(),
            action_type: action_type.as_str().to_string(),
            action_ts,
            actor: actor.to_string(),
            transfer_id: None,
            channel_id: None,
            payload_json: None,
            impact_summary_json: None,
            detail: None,
        }
    }

    pub fn with_transfer(mut self, transfer_id: &str) -> Self {
        self.transfer_id = Some(transfer_id.to_string());
        self
    }

    pub fn with_channel(mut self, channel_id: &str) -> Self {
        self.channel_id = Some(channel_id.to_string());
        self
    }

    pub fn with_payload(mut self, payload: JsonValue) -> Self {
        self.payload_json = Some(payload);
        self
    }

    pub fn with_impact(mut self, impact: JsonValue) -> Self {
        self.impact_summary_json = Some(impact);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ==========================================
// ActionType - 操作类型
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    Release,           // 释放
    Unrelease,         // 撤销释放
    AssignChannel,     // 通道分配
    ChannelTransition, // 通道状态变更
    LaunchPlan,        // 启动备货计划
    BlockRelease,      // 阻断释放
    UnblockRelease,    // 解除阻断
    CancelLines,       // 取消需求行
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Release => "RELEASE",
            ActionType::Unrelease => "UNRELEASE",
            ActionType::AssignChannel => "ASSIGN_CHANNEL",
            ActionType::ChannelTransition => "CHANNEL_TRANSITION",
            ActionType::LaunchPlan => "LAUNCH_PLAN",
            ActionType::BlockRelease => "BLOCK_RELEASE",
            ActionType::UnblockRelease => "UNBLOCK_RELEASE",
            ActionType::CancelLines => "CANCEL_LINES",
        }
    }
}
