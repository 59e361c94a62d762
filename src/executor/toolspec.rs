//! 动态工具规范
//!
//! 生成式工具以带标签的 ToolSpec 表示，注册前按固定 schema 校验，
//! 绝不作为未经检查的临时代码执行。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 工具种类（固定集合，注册表按此限定行为）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// 脚本模板（参数化，不可自由拼接）
    Script,
    /// 桌面自动化序列
    Automation,
    /// 外部服务集成
    Integration,
}

/// 沙箱档位
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxProfile {
    /// 只读，无网络
    ReadOnly,
    /// 可写工作目录
    Workspace,
    /// 可出网（仅 Integration 允许）
    Network,
}

/// 动态工具规范
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub kind: ToolKind,
    pub sandbox_profile: SandboxProfile,
    /// 参数 schema（对象，键为参数名）
    pub parameters: serde_json::Value,
}

#[derive(Error, Debug)]
pub enum ToolSpecError {
    #[error("Tool name must be non-empty snake_case, got {0:?}")]
    InvalidName(String),
    #[error("Parameters must be a JSON object")]
    InvalidParameters,
    #[error("Sandbox profile {0:?} not allowed for kind {1:?}")]
    SandboxMismatch(SandboxProfile, ToolKind),
}

impl ToolSpec {
    /// 注册前校验：名称合法、参数为对象、沙箱档位与种类匹配
    pub fn validate(&self) -> Result<(), ToolSpecError> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !valid_name {
            return Err(ToolSpecError::InvalidName(self.name.clone()));
        }
        if !self.parameters.is_object() {
            return Err(ToolSpecError::InvalidParameters);
        }
        if self.sandbox_profile == SandboxProfile::Network && self.kind != ToolKind::Integration {
            return Err(ToolSpecError::SandboxMismatch(self.sandbox_profile, self.kind));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, kind: ToolKind, sandbox: SandboxProfile) -> ToolSpec {
        ToolSpec {
            name: name.into(),
            kind,
            sandbox_profile: sandbox,
            parameters: serde_json::json!({}),
        }
    }

    #[test]
    fn test_valid_spec() {
        assert!(spec("report_export", ToolKind::Script, SandboxProfile::Workspace)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_bad_name_rejected() {
        assert!(matches!(
            spec("Report Export!", ToolKind::Script, SandboxProfile::ReadOnly).validate(),
            Err(ToolSpecError::InvalidName(_))
        ));
    }

    #[test]
    fn test_network_only_for_integration() {
        assert!(matches!(
            spec("fetcher", ToolKind::Script, SandboxProfile::Network).validate(),
            Err(ToolSpecError::SandboxMismatch(_, _))
        ));
        assert!(spec("fetcher", ToolKind::Integration, SandboxProfile::Network)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_non_object_parameters_rejected() {
        let mut s = spec("exporter", ToolKind::Script, SandboxProfile::ReadOnly);
        s.parameters = serde_json::json!([1, 2, 3]);
        assert!(matches!(s.validate(), Err(ToolSpecError::InvalidParameters)));
    }
}
