//! 记忆智能体：关系图存储与相关性检索
//!
//! - **graph**: 追加式节点 / 边存储，检索按 词项相关性 + 时间衰减 + 图中心性 排序
//! - 不可用时规划方以空上下文降级继续，Plan 标记 context_degraded

pub mod graph;

pub use graph::{GraphMemory, MemoryEdge, MemoryNode};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Task;
use crate::executor::StepResult;
use crate::planner::Plan;

#[derive(Error, Debug)]
pub enum MemoryError {
    /// 存储不可达；调用方降级而非阻塞
    #[error("Memory store unavailable: {0}")]
    Unavailable(String),
}

/// 检索命中（MEMORY_RESULT 载荷）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextHit {
    pub entity: String,
    pub relevance_score: f64,
    /// 新鲜度（0..1，半衰期衰减后的值）
    pub recency: f64,
    pub source_context: String,
}

/// 记忆存储接口
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// 按角色检索相关上下文，结果按综合分降序
    async fn retrieve_context(
        &self,
        role_scope: &str,
        query_terms: &[String],
        limit: usize,
    ) -> Result<Vec<ContextHit>, MemoryError>;

    /// 追加一次执行的节点与边；从不删除既有历史
    async fn record_execution(
        &self,
        task: &Task,
        plan: &Plan,
        results: &[StepResult],
    ) -> Result<(), MemoryError>;
}

/// 恒不可用的存储：降级路径联调与测试用
pub struct UnavailableMemory;

#[async_trait]
impl MemoryStore for UnavailableMemory {
    async fn retrieve_context(
        &self,
        _role_scope: &str,
        _query_terms: &[String],
        _limit: usize,
    ) -> Result<Vec<ContextHit>, MemoryError> {
        Err(MemoryError::Unavailable("simulated outage".into()))
    }

    async fn record_execution(
        &self,
        _task: &Task,
        _plan: &Plan,
        _results: &[StepResult],
    ) -> Result<(), MemoryError> {
        Err(MemoryError::Unavailable("simulated outage".into()))
    }
}
