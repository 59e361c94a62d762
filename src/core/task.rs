//! 任务定义：生命周期状态与终态摘要
//!
//! Task 由编排器在收到意图时创建，只有编排器可变更；COMPLETED/FAILED/CANCELLED 为终态。

use serde::{Deserialize, Serialize};

use crate::executor::StepResult;

/// 任务 ID
pub type TaskId = String;

/// 任务生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// 已创建，等待规划
    Pending,
    /// 正在分解意图
    Planning,
    /// 等待人工确认令牌
    AwaitingConfirmation,
    /// 正在执行
    Running,
    /// 某 Step 失败，退避重试中
    Retrying,
    /// 重试耗尽，按完成顺序逆序补偿中
    RollingBack,
    /// 全部 Step 成功
    Completed,
    /// 终态失败（含 RiskExceeded / ConfirmationTimeout / 执行耗尽）
    Failed,
    /// 被外部 CANCEL 消息终止
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// 补偿完整度：终态失败时上报给调用方
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completeness {
    /// 所有已生效 Step 的补偿均成功
    Full,
    /// 部分补偿失败（已记录 RollbackFailure）
    Partial,
    /// 无需补偿（没有已生效的 Step）
    NotRequired,
}

/// 任务记录：一个意图对应一个 Task，至多一个活跃实例
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// 任务 ID，同时作为全生命周期消息的 correlationId
    pub id: TaskId,
    /// 原始用户意图
    pub intent: String,
    /// 角色上下文（记忆检索按此裁剪）
    pub role_scope: String,
    pub status: TaskStatus,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
    /// 当前 Plan 版本号（重规划递增），0 表示尚未产出 Plan
    pub plan_version: u32,
    /// 终态摘要，进入终态时填充
    pub outcome: Option<TaskOutcome>,
}

impl Task {
    pub fn new(intent: String, role_scope: String) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            intent,
            role_scope,
            status: TaskStatus::Pending,
            created_at: chrono::Utc::now().timestamp_millis(),
            plan_version: 0,
            outcome: None,
        }
    }

    /// correlationId：任务全生命周期消息的关联键
    pub fn correlation_id(&self) -> &str {
        &self.id
    }
}

/// 终态摘要：调用方可见的失败原因、责任 Step 与补偿完整度
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    /// 失败原因（RiskExceeded / ConfirmationTimeout / Step 描述等）
    pub reason: Option<String>,
    /// 导致失败的 Step id
    pub failed_step: Option<String>,
    pub completeness: Completeness,
    /// 最后一条 StepResult（供 GET /tasks/{id} 返回）
    pub last_result: Option<StepResult>,
}

impl TaskOutcome {
    pub fn completed(last_result: Option<StepResult>) -> Self {
        Self {
            status: TaskStatus::Completed,
            reason: None,
            failed_step: None,
            completeness: Completeness::NotRequired,
            last_result,
        }
    }
}
