// ==========================================
// 仓库出库释放系统 - 引擎层事件发布
// ==========================================
// 职责: 定义释放事件发布 trait (通知执行子系统开始拣货)
// 约定: 事件只在检查点提交后发布,回滚的工作不产生事件
// ==========================================

use crate::domain::types::ChannelState;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::sync::Arc;

// ==========================================
// 释放事件
// ==========================================

/// 单行释放信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleasedLine {
    pub line_id: String,
    pub product_id: String,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ReleaseEvent {
    /// 需求行已释放,执行子系统可开始拣货
    LinesReleased {
        transfer_id: String,
        lines: Vec<ReleasedLine>,
        released_at: NaiveDateTime,
    },
    /// 释放已撤销
    LinesUnreleased {
        transfer_id: String,
        line_ids: Vec<String>,
    },
    /// 产生欠单调拨单
    BackorderCreated {
        origin_transfer_id: String,
        backorder_transfer_id: String,
        line_ids: Vec<String>,
    },
    /// 通道分配变更 (None = 解除分配)
    ChannelAssigned {
        transfer_id: String,
        channel_id: Option<String>,
    },
    ChannelStateChanged {
        channel_id: String,
        from: ChannelState,
        to: ChannelState,
    },
}

impl ReleaseEvent {
    /// 事件类型标识
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseEvent::LinesReleased { .. } => "LinesReleased",
            ReleaseEvent::LinesUnreleased { .. } => "LinesUnreleased",
            ReleaseEvent::BackorderCreated { .. } => "BackorderCreated",
            ReleaseEvent::ChannelAssigned { .. } => "ChannelAssigned",
            ReleaseEvent::ChannelStateChanged { .. } => "ChannelStateChanged",
        }
    }

    /// 事件所属实体 (调拨单或通道)
    pub fn subject_id(&self) -> &str {
        match self {
            ReleaseEvent::LinesReleased { transfer_id, .. }
            | ReleaseEvent::LinesUnreleased { transfer_id, .. }
            | ReleaseEvent::ChannelAssigned { transfer_id, .. } => transfer_id,
            ReleaseEvent::BackorderCreated {
                backorder_transfer_id,
                ..
            } => backorder_transfer_id,
            ReleaseEvent::ChannelStateChanged { channel_id, .. } => channel_id,
        }
    }
}

// ==========================================
// 事件发布 Trait
// ==========================================

/// 释放事件发布者
///
/// # 返回
/// - `Ok(message_id)`: 下游消息 ID（如果支持）或空字符串
/// - `Err`: 发布失败 (只记录日志,不回滚已提交的工作)
pub trait ReleaseEventPublisher: Send + Sync {
    fn publish(&self, event: ReleaseEvent) -> Result<String, Box<dyn Error + Send + Sync>>;
}

/// 空操作事件发布者
#[derive(Debug, Clone, Default)]
pub struct NoOpEventPublisher;

impl ReleaseEventPublisher for NoOpEventPublisher {
    fn publish(&self, event: ReleaseEvent) -> Result<String, Box<dyn Error + Send + Sync>> {
        tracing::debug!(
            event_type = event.as_str(),
            subject = event.subject_id(),
            "NoOpEventPublisher: 跳过事件发布"
        );
        Ok(String::new())
    }
}

/// 可选的事件发布者包装
pub struct OptionalEventPublisher {
    inner: Option<Arc<dyn ReleaseEventPublisher>>,
}

impl OptionalEventPublisher {
    pub fn with_publisher(publisher: Arc<dyn ReleaseEventPublisher>) -> Self {
        Self {
            inner: Some(publisher),
        }
    }

    pub fn none() -> Self {
        Self { inner: None }
    }

    pub fn publish(&self, event: ReleaseEvent) -> Result<String, Box<dyn Error + Send + Sync>> {
        match &self.inner {
            Some(publisher) => publisher.publish(event),
            None => Ok(String::new()),
        }
    }

    /// 批量发布; 单个失败只记 warn
    pub fn publish_all(&self, events: Vec<ReleaseEvent>) {
        for event in events {
            let event_type = event.as_str();
            let subject = event.subject_id().to_string();
            if let Err(e) = self.publish(event) {
                tracing::warn!(event_type, subject = %subject, error = %e, "事件发布失败");
            }
        }
    }

    pub fn is_configured(&self) -> bool {
        self.inner.is_some()
    }
}

impl Default for OptionalEventPublisher {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingPublisher {
        seen: Mutex<Vec<String>>,
    }

    impl ReleaseEventPublisher for RecordingPublisher {
        fn publish(&self, event: ReleaseEvent) -> Result<String, Box<dyn Error + Send + Sync>> {
            if event.subject_id() == "BROKEN" {
                return Err("downstream unavailable".into());
            }
            self.seen.lock().unwrap().push(event.as_str().to_string());
            Ok("msg-1".to_string())
        }
    }

    #[test]
    fn test_optional_publisher_none() {
        let publisher = OptionalEventPublisher::none();
        assert!(!publisher.is_configured());
        let result = publisher.publish(ReleaseEvent::LinesUnreleased {
            transfer_id: "T1".to_string(),
            line_ids: vec![],
        });
        assert_eq!(result.unwrap(), "");
    }

    #[test]
    fn test_publish_all_continues_after_failure() {
        let recorder = Arc::new(RecordingPublisher::default());
        let publisher = OptionalEventPublisher::with_publisher(recorder.clone());
        publisher.publish_all(vec![
            ReleaseEvent::ChannelAssigned {
                transfer_id: "BROKEN".to_string(),
                channel_id: None,
            },
            ReleaseEvent::ChannelStateChanged {
                channel_id: "C1".to_string(),
                from: ChannelState::Open,
                to: ChannelState::Locked,
            },
        ]);
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["ChannelStateChanged".to_string()]);
    }

    #[test]
    fn test_event_serialization_tag() {
        let event = ReleaseEvent::BackorderCreated {
            origin_transfer_id: "T1".to_string(),
            backorder_transfer_id: "T2".to_string(),
            line_ids: vec!["L9".to_string()],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "backorder_created");
        assert_eq!(event.subject_id(), "T2");
    }
}
