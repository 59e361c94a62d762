//! 执行器接口与能力注册表
//!
//! StepRunner 是外部效果执行方（CUA / 工具运行器）的接入点；
//! 注册表把动作类别映射到有限的已注册执行器集合，在 Plan 校验期解析，不做运行时反射。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::planner::{ActionCategory, ActionDescriptor};

/// 单步执行错误（重试耗尽前对调用方不可见）
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Action failed: {0}")]
    Failed(String),
    #[error("Action timed out")]
    Timeout,
}

/// 执行器 trait：执行动作描述符，返回不透明的输出载荷
///
/// 补偿动作同样通过 execute 下发（补偿本身也是一个 ActionDescriptor）。
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// 执行器标识（审计与日志用）
    fn id(&self) -> &str;

    async fn execute(&self, action: &ActionDescriptor) -> Result<serde_json::Value, RunnerError>;
}

/// 能力注册表：动作类别 -> 执行器
#[derive(Default)]
pub struct CapabilityRegistry {
    runners: HashMap<ActionCategory, Arc<dyn StepRunner>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, category: ActionCategory, runner: Arc<dyn StepRunner>) {
        self.runners.insert(category, runner);
    }

    pub fn resolve(&self, category: ActionCategory) -> Option<Arc<dyn StepRunner>> {
        self.runners.get(&category).cloned()
    }

    /// Plan 校验期调用：所有类别必须可解析
    pub fn can_resolve(&self, category: ActionCategory) -> bool {
        self.runners.contains_key(&category)
    }

    pub fn categories(&self) -> Vec<ActionCategory> {
        self.runners.keys().copied().collect()
    }
}

/// 模拟执行器：外部协作方（CUA 引擎等）不在本 crate 范围内，
/// 默认装配用它回显动作并宣告成功，联调与测试共用
pub struct SimulatedRunner {
    id: String,
}

impl SimulatedRunner {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[async_trait]
impl StepRunner for SimulatedRunner {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&self, action: &ActionDescriptor) -> Result<serde_json::Value, RunnerError> {
        tracing::debug!(runner = %self.id, action = %action.name, target = %action.target, "Simulated execution");
        Ok(serde_json::json!({
            "runner": self.id,
            "action": action.name,
            "target": action.target,
            "simulated": true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::Sensitivity;

    fn action(name: &str) -> ActionDescriptor {
        ActionDescriptor {
            category: ActionCategory::Read,
            name: name.into(),
            target: "doc".into(),
            sensitivity: Sensitivity::Public,
            parameters: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_registry_resolution() {
        let mut registry = CapabilityRegistry::new();
        registry.register(ActionCategory::Read, Arc::new(SimulatedRunner::new("sim_read")));

        assert!(registry.can_resolve(ActionCategory::Read));
        assert!(!registry.can_resolve(ActionCategory::Financial));

        let runner = registry.resolve(ActionCategory::Read).unwrap();
        let out = runner.execute(&action("open_document")).await.unwrap();
        assert_eq!(out["action"], "open_document");
    }
}
