//! 进程内消息总线
//!
//! 主题 × 消费组的扇出模型：每个消费组持有独立的无界 mpsc 队列，
//! 组内按发布顺序投递（覆盖按 taskId 分区有序的要求）。
//! 投递语义为至少一次：总线不做去重，消费方必须按 (taskId, stepId, attempt) 幂等处理。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};

use crate::bus::Envelope;

/// 消息总线 trait：发布到主题，按消费组订阅
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// 发布消息到主题，扇出到该主题的所有消费组
    async fn publish(&self, topic: &str, envelope: Envelope);

    /// 以消费组身份订阅主题；同组同主题重复订阅会替换旧队列（单消费者分区模型）
    async fn subscribe(&self, topic: &str, group: &str) -> Subscription;
}

/// 订阅句柄：组内有序的消息流
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

/// 进程内实现：topic -> (group -> sender)
#[derive(Default)]
pub struct InProcessBus {
    topics: RwLock<HashMap<String, HashMap<String, mpsc::UnboundedSender<Envelope>>>>,
}

impl InProcessBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish(&self, topic: &str, envelope: Envelope) {
        let topics = self.topics.read().await;
        let Some(groups) = topics.get(topic) else {
            tracing::debug!(topic, correlation_id = %envelope.correlation_id, "No subscriber, message dropped");
            return;
        };
        for (group, tx) in groups {
            if tx.send(envelope.clone()).is_err() {
                tracing::debug!(topic, group, "Consumer group gone");
            }
        }
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.write().await;
        topics
            .entry(topic.to_string())
            .or_default()
            .insert(group.to_string(), tx);
        Subscription { rx }
    }
}
