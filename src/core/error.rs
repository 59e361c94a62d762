//! 编排错误分类
//!
//! 传播策略：规划 / 安全门错误立即终止任务并对调用方可见；执行错误按策略透明重试，
//! 耗尽后触发回滚；重复消息只记日志不外抛。

use thiserror::Error;

/// 任务编排过程中可能出现的错误（规划、安全门、执行、记忆、租约等）
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Step 依赖图存在环，规划期拒绝，任务不会启动
    #[error("Plan cycle detected: {0}")]
    PlanCycle(String),

    /// 风险 >= MEDIUM 的副作用 Step 未定义补偿动作
    #[error("Missing compensation for step {0}")]
    MissingCompensation(String),

    /// 聚合风险达到 HIGH_THRESHOLD，安全门直接拒绝
    #[error("Risk exceeded: score {score:.3} >= threshold {threshold:.3}")]
    RiskExceeded { score: f64, threshold: f64 },

    /// 等待确认令牌超时
    #[error("Confirmation timed out for task {0}")]
    ConfirmationTimeout(String),

    /// 单步执行失败（重试耗尽前对调用方不可见）
    #[error("Step execution failed: {0}")]
    StepExecution(String),

    /// 补偿动作失败：记录但不阻断后续回滚，最终以 completeness 标志上报
    #[error("Rollback failure on step {0}")]
    RollbackFailure(String),

    /// 记忆存储不可用：规划以空上下文降级继续
    #[error("Memory unavailable: {0}")]
    MemoryUnavailable(String),

    /// 任务租约已被其他实例持有
    #[error("Lease held for task {0}")]
    LeaseHeld(String),

    /// 确认令牌无效或已过期 / 已使用
    #[error("Invalid confirmation token")]
    InvalidToken,

    /// 指定的任务不存在
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// 任务已处于终态，取消等生命周期操作不再接受
    #[error("Task already terminal: {0}")]
    TaskAlreadyTerminal(String),

    /// Plan 中出现能力注册表无法解析的动作类别
    #[error("No executor registered for category {0}")]
    UnresolvedCapability(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl OrchestratorError {
    /// 是否属于规划期错误（任务从未启动，直接对调用方可见）
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            Self::PlanCycle(_) | Self::MissingCompensation(_) | Self::UnresolvedCapability(_)
        )
    }
}
