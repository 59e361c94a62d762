//! 规划类型定义
//!
//! Plan / Step / 动作描述符 / 风险等级 / 重试策略。
//! Plan 一经安全门接受即不可变，重规划产生引用原 taskId 的新版本。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type PlanId = String;
pub type StepId = String;

/// 动作类别：能力注册表按此解析执行器，安全门按此取基础权重
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    /// 只读（打开文档、查询状态）
    Read,
    /// 改写系统状态（写文件、发送邮件、安装）
    WriteState,
    /// 资金类操作（支付、转账）
    Financial,
    /// 桌面自动化（点击、输入，交由外部 CUA 执行器）
    DesktopAutomation,
}

impl ActionCategory {
    /// 类别基础风险权重（0..1）
    pub fn base_weight(self) -> f64 {
        match self {
            Self::Read => 0.1,
            Self::DesktopAutomation => 0.35,
            Self::WriteState => 0.5,
            Self::Financial => 0.9,
        }
    }
}

impl std::fmt::Display for ActionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::WriteState => write!(f, "write_state"),
            Self::Financial => write!(f, "financial"),
            Self::DesktopAutomation => write!(f, "desktop_automation"),
        }
    }
}

/// 目标数据敏感级（数据分类）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sensitivity {
    Public,
    Internal,
    Confidential,
}

impl Sensitivity {
    pub fn weight(self) -> f64 {
        match self {
            Self::Public => 0.0,
            Self::Internal => 0.1,
            Self::Confidential => 0.25,
        }
    }
}

/// 风险等级初分类（规划期），精确分数由安全门计算
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// 动作描述符：对外部执行器不透明的载荷
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub category: ActionCategory,
    /// 动作名（open_application / type / compose_email 等，沿用 CUA 动作词表）
    pub name: String,
    /// 目标（元素、文件、收件人等标识）
    pub target: String,
    pub sensitivity: Sensitivity,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// 重试策略：指数退避，第 n 次重试前等待 backoff_base_ms * 2^(n-1)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

/// 单步：一个委托给外部执行器的工作单元
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub plan_id: PlanId,
    /// 拓扑序内的位置
    pub sequence_index: usize,
    pub depends_on: Vec<StepId>,
    pub action: ActionDescriptor,
    /// 规划期初分类
    pub risk: RiskLevel,
    /// 语义上撤销该步效果的补偿动作；risk >= MEDIUM 的副作用步必须定义
    pub compensating_action: Option<ActionDescriptor>,
    pub retry_policy: RetryPolicy,
    /// 与前后步无依赖边时可并发调度
    pub parallel_safe: bool,
    /// 预估时长（秒）
    pub estimated_duration_secs: u64,
}

impl Step {
    /// 是否有副作用（只读步视为无副作用，无需补偿）
    pub fn has_side_effects(&self) -> bool {
        !matches!(self.action.category, ActionCategory::Read)
    }
}

/// Plan：一个意图分解出的有序、依赖标注的 Step 序列
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub task_id: String,
    /// 版本号，重规划递增；旧版本标记 superseded，从不原地修改
    pub version: u32,
    /// 按拓扑序排列
    pub steps: Vec<Step>,
    pub estimated_duration_secs: u64,
    /// 安全门计算后回填
    pub aggregate_risk: f64,
    /// 记忆不可用降级规划时置位
    pub context_degraded: bool,
    pub superseded: bool,
    pub created_at: i64,
}

impl Plan {
    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// id -> Step 索引
    pub fn step_map(&self) -> HashMap<&str, &Step> {
        self.steps.iter().map(|s| (s.id.as_str(), s)).collect()
    }
}

/// 规划期错误：任务从未启动，直接对调用方可见
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("Cyclic dependency detected among steps: {0}")]
    Cycle(String),
    #[error("Step {0} has risk >= MEDIUM and side effects but no compensating action")]
    MissingCompensation(StepId),
    #[error("Step {0} references unknown dependency {1}")]
    UnknownDependency(StepId, StepId),
    #[error("Empty plan for intent")]
    Empty,
}
