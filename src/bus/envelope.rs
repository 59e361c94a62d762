//! 总线消息协议定义
//!
//! 统一的消息信封：所有属于同一任务生命周期的消息以 taskId 作为 correlationId 关联。

use serde::{Deserialize, Serialize};

/// 消息优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

/// 消息类型（tagged variant，状态机转移由消息触发，便于确定性测试）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    /// 新意图进入编排器
    TaskRequest {
        intent: String,
        role_scope: String,
    },

    /// 规划智能体产出 Plan
    PlanProposed {
        plan_id: String,
        version: u32,
        step_count: usize,
        aggregate_risk: f64,
        context_degraded: bool,
    },

    /// 安全门裁决
    SecurityDecision {
        plan_id: String,
        decision: String,
        risk_score: f64,
    },

    /// 单步下发给执行智能体；(task, step, attempt) 构成去重键
    StepDispatch {
        step_id: String,
        attempt: u32,
        payload: serde_json::Value,
    },

    /// 执行智能体回报结果（Memory 与 Learning 同时消费）
    StepResult {
        step_id: String,
        attempt: u32,
        outcome: String,
        output: serde_json::Value,
    },

    /// 上下文检索请求
    MemoryQuery {
        role_scope: String,
        query_terms: Vec<String>,
        limit: usize,
    },

    /// 上下文检索结果
    MemoryResult {
        hits: Vec<serde_json::Value>,
    },

    /// 人工反馈（学习智能体消费）
    Feedback {
        rating: u8,
        notes: Option<String>,
    },

    /// 取消任务：任意非终态均可触发，在途 Step 结果仍被等待并补偿
    Cancel,
}

/// 消息信封（总线载荷）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_id: String,
    pub receiver_id: String,
    pub message: BusMessage,
    #[serde(default)]
    pub priority: Priority,
    /// 毫秒时间戳
    pub timestamp: i64,
    /// 同一任务生命周期内所有消息共享 taskId
    pub correlation_id: String,
}

impl Envelope {
    pub fn new(
        sender_id: &str,
        receiver_id: &str,
        correlation_id: &str,
        message: BusMessage,
    ) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            message,
            priority: Priority::default(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            correlation_id: correlation_id.to_string(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// 主题名：每个智能体从专属主题拉取，分区键 = taskId
pub mod topic {
    pub const TASK_LIFECYCLE: &str = "task.lifecycle";
    pub const PLAN_PROPOSED: &str = "plan.proposed";
    pub const SECURITY_DECISION: &str = "security.decision";
    pub const STEP_DISPATCH: &str = "step.dispatch";
    pub const STEP_RESULT: &str = "step.result";
    pub const MEMORY_CONTEXT: &str = "memory.context";
    pub const FEEDBACK: &str = "learning.feedback";
    pub const CANCEL: &str = "task.cancel";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_serde_roundtrip() {
        let env = Envelope::new(
            "orchestrator",
            "executor",
            "task_abc",
            BusMessage::StepDispatch {
                step_id: "step_1".into(),
                attempt: 1,
                payload: serde_json::json!({"action": "open_application"}),
            },
        );
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"type\":\"step_dispatch\""));
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.correlation_id, "task_abc");
    }
}
