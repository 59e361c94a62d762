//! 组件装配：统一的初始化逻辑
//!
//! API 入口与测试共用同一套装配，避免两处注册差异。
//! 默认执行器为 SimulatedRunner；接入真实 CUA / 工具运行器时按类别替换注册。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::{LeaseManager, Orchestrator};
use crate::executor::{CapabilityRegistry, ExecutionEngine, SimulatedRunner, StepRunner};
use crate::learning::LearningEngine;
use crate::memory::{GraphMemory, MemoryStore};
use crate::planner::{ActionCategory, Planner};
use crate::security::{AuditLog, SecurityGate};
use crate::bus::{InProcessBus, MessageBus};

/// 装配完成的组件集合
pub struct Components {
    pub orchestrator: Arc<Orchestrator>,
    pub bus: Arc<dyn MessageBus>,
    pub audit: Arc<AuditLog>,
    pub learning: Arc<LearningEngine>,
    pub leases: Arc<LeaseManager>,
}

/// 按配置装配全部组件（默认注册表：四类动作各挂一个 SimulatedRunner）
pub fn build_components(config: AppConfig) -> Components {
    let mut registry = CapabilityRegistry::new();
    for category in [
        ActionCategory::Read,
        ActionCategory::WriteState,
        ActionCategory::Financial,
        ActionCategory::DesktopAutomation,
    ] {
        let runner: Arc<dyn StepRunner> =
            Arc::new(SimulatedRunner::new(&format!("sim_{category}")));
        registry.register(category, runner);
    }
    build_with_registry(config, registry)
}

/// 用自定义注册表装配（真实执行器接入点）
pub fn build_with_registry(config: AppConfig, registry: CapabilityRegistry) -> Components {
    let bus: Arc<dyn MessageBus> = InProcessBus::new();

    let audit = Arc::new(match &config.app.data_root {
        Some(root) => AuditLog::with_file(root.join("audit.jsonl")),
        None => AuditLog::new(),
    });
    let learning = Arc::new(LearningEngine::new(config.learning.clone()));
    let gate = Arc::new(SecurityGate::new(
        config.security.clone(),
        Arc::clone(&learning),
        Arc::clone(&audit),
    ));
    let memory: Arc<dyn MemoryStore> = Arc::new(GraphMemory::new(config.memory.clone()));
    let engine = Arc::new(ExecutionEngine::new(
        Arc::new(registry),
        Arc::clone(&bus),
        Arc::clone(&audit),
        config.execution.clone(),
    ));
    let leases = Arc::new(LeaseManager::new(Duration::from_millis(
        config.execution.lease_ttl_ms,
    )));
    let planner = Planner::new(&config.execution);

    let orchestrator = Orchestrator::new(
        config,
        Arc::clone(&bus),
        planner,
        gate,
        engine,
        memory,
        Arc::clone(&learning),
        Arc::clone(&leases),
    );

    Components {
        orchestrator,
        bus,
        audit,
        learning,
        leases,
    }
}
