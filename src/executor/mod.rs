//! 执行智能体：状态机驱动的 Plan 执行
//!
//! - **engine**: 重试 / 回滚 / 并行调度 / 幂等去重的主状态机
//! - **runner**: StepRunner 接口与能力注册表（外部 CUA / 工具运行器的接入点）
//! - **toolspec**: 动态工具规范的 schema 校验

pub mod engine;
pub mod runner;
pub mod toolspec;

pub use engine::{ExecutionEngine, ExecutionOutcome, ExecutionReport};
pub use runner::{CapabilityRegistry, RunnerError, SimulatedRunner, StepRunner};
pub use toolspec::{SandboxProfile, ToolKind, ToolSpec, ToolSpecError};

use serde::{Deserialize, Serialize};

/// 单次尝试的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    Success,
    Failed,
    Timeout,
}

/// StepResult：追加式记录，由执行智能体产出，Memory 与 Learning 消费
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    /// 从 1 开始；(taskId, stepId, attempt) 构成去重键
    pub attempt: u32,
    pub outcome: StepOutcome,
    pub output: serde_json::Value,
    /// 毫秒时间戳
    pub timestamp: i64,
}

impl StepResult {
    pub fn new(step_id: &str, attempt: u32, outcome: StepOutcome, output: serde_json::Value) -> Self {
        Self {
            step_id: step_id.to_string(),
            attempt,
            outcome,
            output,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
