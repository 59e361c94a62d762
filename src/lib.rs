//! Archi - Rust 多智能体任务编排核心
//!
//! 模块划分：
//! - **api**: REST 接口（任务提交 / 查询 / 确认 / 取消 / 反馈 / 健康检查）
//! - **bus**: 异步消息总线（主题 + 消费组，按 correlationId 关联）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 任务生命周期、租约、编排器、错误分类
//! - **executor**: 执行状态机（重试 / 回滚 / 并行调度 / 幂等去重）与能力注册表
//! - **learning**: 学习智能体（按动作类别的有界 EMA 权重）
//! - **memory**: 关系图记忆存储与相关性排序检索
//! - **observability**: tracing 初始化
//! - **planner**: 意图分解、依赖图校验与重规划
//! - **security**: 安全门（风险评分、确认令牌）与哈希链审计日志

pub mod api;
pub mod bus;
pub mod config;
pub mod core;
pub mod executor;
pub mod learning;
pub mod memory;
pub mod observability;
pub mod planner;
pub mod security;
