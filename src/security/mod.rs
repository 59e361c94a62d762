//! 安全门与审计：风险评分、确认令牌、哈希链审计日志

pub mod audit;
pub mod gate;

pub use audit::{AuditDecision, AuditEntry, AuditError, AuditLog};
pub use gate::{Decision, SecurityGate};
