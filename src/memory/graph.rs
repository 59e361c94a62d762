//! 关系图记忆
//!
//! 节点 = 实体（意图、动作目标），边 = 执行产生的关联。
//! 全部写入为追加式：节点只更新时间戳与活跃度，边以「标记 superseded + 追加新边」
//! 的方式修订置信度，历史永不删除（学习回路依赖完整历史）。
//!
//! 检索排序三信号：
//! 1. 词项相关性：查询词与节点实体 / 上下文的匹配比例
//! 2. 时间衰减：0.5^(elapsed / half_life)，同分时更新更近者在前
//! 3. 图中心性：节点度数相对候选集内最大度数的占比

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::MemorySection;
use crate::core::Task;
use crate::executor::{StepOutcome, StepResult};
use crate::memory::{ContextHit, MemoryError, MemoryStore};
use crate::planner::Plan;

/// 图节点：一个实体及其最近上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: String,
    pub entity: String,
    pub role_scope: String,
    /// 最近一次写入该实体时的摘要上下文
    pub source_context: String,
    /// 毫秒时间戳
    pub created_at: i64,
    pub updated_at: i64,
}

/// 图边：两实体间的一次执行关联
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEdge {
    pub id: String,
    pub from: String,
    pub to: String,
    /// 关系名（动作名）
    pub relation: String,
    /// 0..1，成功执行推高，失败压低
    pub confidence: f64,
    pub created_at: i64,
    /// 被新版本替代；保留在存储中供历史分析
    pub superseded: bool,
}

#[derive(Default)]
struct GraphInner {
    nodes: Vec<MemoryNode>,
    edges: Vec<MemoryEdge>,
    /// (role_scope, entity) -> nodes 下标
    index: HashMap<(String, String), usize>,
}

/// 进程内关系图存储
pub struct GraphMemory {
    inner: RwLock<GraphInner>,
    config: MemorySection,
}

impl GraphMemory {
    pub fn new(config: MemorySection) -> Self {
        Self {
            inner: RwLock::new(GraphInner::default()),
            config,
        }
    }

    /// 写入或触碰节点：已存在则只更新上下文与时间戳
    async fn upsert_node(&self, role_scope: &str, entity: &str, context: &str, now: i64) -> String {
        let mut inner = self.inner.write().await;
        let key = (role_scope.to_string(), entity.to_string());
        if let Some(&idx) = inner.index.get(&key) {
            let node = &mut inner.nodes[idx];
            node.source_context = context.to_string();
            node.updated_at = now;
            return node.id.clone();
        }
        let node = MemoryNode {
            id: format!("node_{}", uuid::Uuid::new_v4()),
            entity: entity.to_string(),
            role_scope: role_scope.to_string(),
            source_context: context.to_string(),
            created_at: now,
            updated_at: now,
        };
        let id = node.id.clone();
        let idx = inner.nodes.len();
        inner.nodes.push(node);
        inner.index.insert(key, idx);
        id
    }

    /// 写入边：同 (from, to, relation) 的旧边标记 superseded，追加新边
    async fn record_edge(&self, from: &str, to: &str, relation: &str, confidence: f64, now: i64) {
        let mut inner = self.inner.write().await;
        for edge in inner.edges.iter_mut() {
            if edge.from == from && edge.to == to && edge.relation == relation {
                edge.superseded = true;
            }
        }
        inner.edges.push(MemoryEdge {
            id: format!("edge_{}", uuid::Uuid::new_v4()),
            from: from.to_string(),
            to: to.to_string(),
            relation: relation.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            created_at: now,
            superseded: false,
        });
    }

    #[cfg(test)]
    pub(crate) async fn edge_count(&self) -> (usize, usize) {
        let inner = self.inner.read().await;
        let active = inner.edges.iter().filter(|e| !e.superseded).count();
        (active, inner.edges.len())
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_string())
        .collect()
}

/// 词项匹配比例：命中的查询词数 / 查询词总数
fn relevance(query_terms: &[String], node: &MemoryNode) -> f64 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let mut haystack = tokenize(&node.entity);
    haystack.extend(tokenize(&node.source_context));
    let matched = query_terms
        .iter()
        .filter(|term| haystack.iter().any(|t| t == &term.to_lowercase()))
        .count();
    matched as f64 / query_terms.len() as f64
}

/// 半衰期衰减：elapsed = half_life 时降为 0.5
fn recency(updated_at: i64, now: i64, half_life_secs: u64) -> f64 {
    let elapsed_secs = ((now - updated_at).max(0) as f64) / 1000.0;
    0.5_f64.powf(elapsed_secs / half_life_secs.max(1) as f64)
}

#[async_trait]
impl MemoryStore for GraphMemory {
    async fn retrieve_context(
        &self,
        role_scope: &str,
        query_terms: &[String],
        limit: usize,
    ) -> Result<Vec<ContextHit>, MemoryError> {
        let inner = self.inner.read().await;
        let now = chrono::Utc::now().timestamp_millis();

        // 未被替代的边才计入度数
        let mut degree: HashMap<&str, usize> = HashMap::new();
        for edge in inner.edges.iter().filter(|e| !e.superseded) {
            *degree.entry(edge.from.as_str()).or_insert(0) += 1;
            *degree.entry(edge.to.as_str()).or_insert(0) += 1;
        }

        let candidates: Vec<&MemoryNode> = inner
            .nodes
            .iter()
            .filter(|n| n.role_scope == role_scope)
            .collect();
        let max_degree = candidates
            .iter()
            .map(|n| degree.get(n.id.as_str()).copied().unwrap_or(0))
            .max()
            .unwrap_or(0)
            .max(1);

        let mut scored: Vec<(f64, f64, i64, ContextHit)> = candidates
            .into_iter()
            .map(|node| {
                let rel = relevance(query_terms, node);
                let rec = recency(node.updated_at, now, self.config.recency_half_life_secs);
                let centrality =
                    degree.get(node.id.as_str()).copied().unwrap_or(0) as f64 / max_degree as f64;
                let score = self.config.relevance_weight * rel
                    + self.config.recency_weight * rec
                    + self.config.centrality_weight * centrality;
                (
                    score,
                    rec,
                    node.updated_at,
                    ContextHit {
                        entity: node.entity.clone(),
                        relevance_score: rel,
                        recency: rec,
                        source_context: node.source_context.clone(),
                    },
                )
            })
            .filter(|(score, ..)| *score > 0.0)
            .collect();

        // 综合分降序，同分按最近更新在前
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.2.cmp(&a.2))
        });

        Ok(scored.into_iter().take(limit).map(|(.., hit)| hit).collect())
    }

    async fn record_execution(
        &self,
        task: &Task,
        plan: &Plan,
        results: &[StepResult],
    ) -> Result<(), MemoryError> {
        let now = chrono::Utc::now().timestamp_millis();
        let intent_node = self
            .upsert_node(&task.role_scope, &task.intent, &format!("task {}", task.id), now)
            .await;

        for step in &plan.steps {
            let attempts: Vec<&StepResult> =
                results.iter().filter(|r| r.step_id == step.id).collect();
            if attempts.is_empty() {
                continue;
            }
            let succeeded = attempts.iter().any(|r| r.outcome == StepOutcome::Success);
            let context = format!(
                "{} {} ({} attempts, {})",
                step.action.name,
                step.action.target,
                attempts.len(),
                if succeeded { "succeeded" } else { "failed" },
            );
            let target_node = self
                .upsert_node(&task.role_scope, &step.action.target, &context, now)
                .await;

            // 置信度 = 成功 / 尝试次数，反映该关联的稳定性
            let confidence = attempts
                .iter()
                .filter(|r| r.outcome == StepOutcome::Success)
                .count() as f64
                / attempts.len() as f64;
            self.record_edge(&intent_node, &target_node, &step.action.name, confidence, now)
                .await;
        }
        tracing::debug!(task_id = %task.id, steps = plan.steps.len(), "Execution recorded to memory graph");
        Ok(())
    }
}
