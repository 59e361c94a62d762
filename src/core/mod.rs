//! 核心编排层：错误分类、任务生命周期、租约与组件装配

pub mod builder;
pub mod error;
pub mod lease;
pub mod orchestrator;
pub mod task;

pub use builder::{build_components, build_with_registry, Components};
pub use error::OrchestratorError;
pub use lease::LeaseManager;
pub use orchestrator::{Orchestrator, PlanSummary, TaskSnapshot};
pub use task::{Completeness, Task, TaskId, TaskOutcome, TaskStatus};
