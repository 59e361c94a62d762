//! 规划智能体：意图分解与 Plan 校验
//!
//! 输入意图文本 + 角色上下文包，输出按依赖拓扑序排列的 Plan。
//! 分解基于规则模板（非目标：不定义 LLM 提示策略），校验保证无环、
//! 且 risk >= MEDIUM 的副作用步必须定义补偿动作。

pub mod graph;
pub mod types;

pub use graph::PlanGraph;
pub use types::{
    ActionCategory, ActionDescriptor, Plan, PlanError, PlanId, RetryPolicy, RiskLevel,
    Sensitivity, Step, StepId,
};

use crate::config::ExecutionSection;
use crate::core::Task;
use crate::memory::ContextHit;

/// 角色上下文包：记忆检索结果；记忆不可用时 degraded 置位、hits 为空
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    pub hits: Vec<ContextHit>,
    pub degraded: bool,
}

/// 分解出的单步草稿（组装成 Step 前的中间形态）
struct StepDraft {
    action: ActionDescriptor,
    risk: RiskLevel,
    compensating_action: Option<ActionDescriptor>,
    estimated_duration_secs: u64,
}

/// 规划智能体
pub struct Planner {
    default_retry: RetryPolicy,
}

impl Planner {
    pub fn new(execution: &ExecutionSection) -> Self {
        Self {
            default_retry: RetryPolicy {
                max_attempts: execution.default_max_attempts,
                backoff_base_ms: execution.backoff_base_ms,
            },
        }
    }

    /// 分解意图为 Plan；version 由编排器按重规划次数递增
    pub fn plan(
        &self,
        task: &Task,
        context: &ContextBundle,
        version: u32,
    ) -> Result<Plan, PlanError> {
        let drafts = decompose(&task.intent);
        if drafts.is_empty() {
            return Err(PlanError::Empty);
        }

        let plan_id = format!("plan_{}", uuid::Uuid::new_v4());
        let mut steps = Vec::with_capacity(drafts.len());
        let mut prev: Option<StepId> = None;

        for (i, draft) in drafts.into_iter().enumerate() {
            let id = format!("step_{}_{}", version, i);
            // 模板分解产出严格顺序链；无依赖边的并行调度由执行引擎按图推进
            let depends_on = match &prev {
                Some(p) => vec![p.clone()],
                None => Vec::new(),
            };
            let step = Step {
                id: id.clone(),
                plan_id: plan_id.clone(),
                sequence_index: i,
                depends_on,
                action: draft.action,
                risk: draft.risk,
                compensating_action: draft.compensating_action,
                retry_policy: self.default_retry,
                parallel_safe: false,
                estimated_duration_secs: draft.estimated_duration_secs,
            };
            prev = Some(id);
            steps.push(step);
        }

        validate(&mut steps)?;

        let estimated_duration_secs = steps.iter().map(|s| s.estimated_duration_secs).sum();
        Ok(Plan {
            id: plan_id,
            task_id: task.id.clone(),
            version,
            steps,
            estimated_duration_secs,
            aggregate_risk: 0.0,
            context_degraded: context.degraded,
            superseded: false,
            created_at: chrono::Utc::now().timestamp_millis(),
        })
    }
}

/// 校验：无环（PlanCycleError）、补偿完整性（MissingCompensationError），
/// 并按拓扑序重排 sequence_index
fn validate(steps: &mut [Step]) -> Result<(), PlanError> {
    let graph = PlanGraph::new(steps)?;
    let order = graph.topological_order()?;

    for step in steps.iter() {
        if step.risk >= RiskLevel::Medium
            && step.has_side_effects()
            && step.compensating_action.is_none()
        {
            return Err(PlanError::MissingCompensation(step.id.clone()));
        }
    }

    let position: std::collections::HashMap<&str, usize> = order
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    for step in steps.iter_mut() {
        step.sequence_index = position[step.id.as_str()];
    }
    steps.sort_by_key(|s| s.sequence_index);
    Ok(())
}

/// 规则模板分解：按连接词切分子句，再按动词词表映射动作类别
fn decompose(intent: &str) -> Vec<StepDraft> {
    let mut drafts = Vec::new();
    for clause in split_clauses(intent) {
        let lower = clause.to_lowercase();

        // 邮件摘要模板：展开为「提取摘要 + 撰写邮件」两步
        if lower.contains("email") && (lower.contains("summary") || lower.contains("summarize")) {
            drafts.push(read_draft("extract_summary", &clause));
            drafts.push(StepDraft {
                action: ActionDescriptor {
                    category: ActionCategory::WriteState,
                    name: "compose_email".into(),
                    target: clause.clone(),
                    sensitivity: classify_sensitivity(&lower),
                    parameters: serde_json::Value::Null,
                },
                risk: RiskLevel::Medium,
                compensating_action: Some(ActionDescriptor {
                    category: ActionCategory::WriteState,
                    name: "recall_email".into(),
                    target: clause.clone(),
                    sensitivity: classify_sensitivity(&lower),
                    parameters: serde_json::Value::Null,
                }),
                estimated_duration_secs: 10,
            });
            continue;
        }

        let (category, name, compensation) = classify_action(&lower);
        let sensitivity = classify_sensitivity(&lower);
        let risk = match category {
            ActionCategory::Read => RiskLevel::Low,
            ActionCategory::WriteState | ActionCategory::DesktopAutomation => RiskLevel::Medium,
            ActionCategory::Financial => RiskLevel::High,
        };
        drafts.push(StepDraft {
            action: ActionDescriptor {
                category,
                name: name.into(),
                target: clause.clone(),
                sensitivity,
                parameters: serde_json::Value::Null,
            },
            risk,
            compensating_action: compensation.map(|comp| ActionDescriptor {
                category,
                name: comp.into(),
                target: clause.clone(),
                sensitivity,
                parameters: serde_json::Value::Null,
            }),
            estimated_duration_secs: 5,
        });
    }
    drafts
}

fn split_clauses(intent: &str) -> Vec<String> {
    intent
        .split(" and ")
        .flat_map(|part| part.split(" then "))
        .flat_map(|part| part.split(';'))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn read_draft(name: &str, clause: &str) -> StepDraft {
    StepDraft {
        action: ActionDescriptor {
            category: ActionCategory::Read,
            name: name.into(),
            target: clause.to_string(),
            sensitivity: classify_sensitivity(&clause.to_lowercase()),
            parameters: serde_json::Value::Null,
        },
        risk: RiskLevel::Low,
        compensating_action: None,
        estimated_duration_secs: 3,
    }
}

/// 动词词表 -> (类别, 动作名, 补偿动作名)
fn classify_action(lower: &str) -> (ActionCategory, &'static str, Option<&'static str>) {
    const FINANCIAL: &[&str] = &["pay", "purchase", "transfer", "refund", "invoice"];
    const EMAIL: &[&str] = &["email", "send", "mail", "reply"];
    const DELETE: &[&str] = &["delete", "remove", "uninstall"];
    const WRITE: &[&str] = &["write", "save", "create", "install", "rename", "edit"];
    const DESKTOP: &[&str] = &["click", "scroll", "press", "drag"];
    const READ: &[&str] = &["open", "read", "show", "view", "list", "check", "extract", "find"];

    if FINANCIAL.iter().any(|w| lower.contains(w)) {
        (ActionCategory::Financial, "execute_transaction", Some("reverse_transaction"))
    } else if EMAIL.iter().any(|w| lower.contains(w)) {
        (ActionCategory::WriteState, "compose_email", Some("recall_email"))
    } else if DELETE.iter().any(|w| lower.contains(w)) {
        (ActionCategory::WriteState, "delete_item", Some("restore_item"))
    } else if WRITE.iter().any(|w| lower.contains(w)) {
        (ActionCategory::WriteState, "apply_change", Some("undo_change"))
    } else if DESKTOP.iter().any(|w| lower.contains(w)) {
        (ActionCategory::DesktopAutomation, "desktop_input", Some("desktop_undo"))
    } else if READ.iter().any(|w| lower.contains(w)) {
        (ActionCategory::Read, "open_document", None)
    } else {
        // 未识别动词按桌面自动化处理，交给外部执行器解释
        (ActionCategory::DesktopAutomation, "perform_action", Some("desktop_undo"))
    }
}

fn classify_sensitivity(lower: &str) -> Sensitivity {
    const CONFIDENTIAL: &[&str] = &["password", "salary", "bank", "credential", "contract"];
    const INTERNAL: &[&str] = &["report", "internal", "quarterly", "budget", "roadmap"];

    if CONFIDENTIAL.iter().any(|w| lower.contains(w)) {
        Sensitivity::Confidential
    } else if INTERNAL.iter().any(|w| lower.contains(w)) {
        Sensitivity::Internal
    } else {
        Sensitivity::Public
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionSection;
    use crate::core::Task;

    fn planner() -> Planner {
        Planner::new(&ExecutionSection::default())
    }

    #[test]
    fn test_quarterly_report_scenario_decomposition() {
        let task = Task::new(
            "open quarterly report and email summary".into(),
            "analyst".into(),
        );
        let plan = planner().plan(&task, &ContextBundle::default(), 1).unwrap();

        let names: Vec<_> = plan.steps.iter().map(|s| s.action.name.as_str()).collect();
        assert_eq!(names, vec!["open_document", "extract_summary", "compose_email"]);

        let compose = &plan.steps[2];
        assert_eq!(compose.risk, RiskLevel::Medium);
        assert!(compose.compensating_action.is_some());
    }

    #[test]
    fn test_financial_intent_classified_high() {
        let task = Task::new("transfer money to vendor".into(), "finance".into());
        let plan = planner().plan(&task, &ContextBundle::default(), 1).unwrap();
        assert_eq!(plan.steps[0].risk, RiskLevel::High);
        assert_eq!(plan.steps[0].action.category, ActionCategory::Financial);
    }

    #[test]
    fn test_degraded_context_flagged() {
        let task = Task::new("open dashboard".into(), "ops".into());
        let bundle = ContextBundle { hits: Vec::new(), degraded: true };
        let plan = planner().plan(&task, &bundle, 1).unwrap();
        assert!(plan.context_degraded);
    }

    #[test]
    fn test_empty_intent_rejected() {
        let task = Task::new("   ".into(), "ops".into());
        assert!(matches!(
            planner().plan(&task, &ContextBundle::default(), 1),
            Err(PlanError::Empty)
        ));
    }

    #[test]
    fn test_missing_compensation_rejected() {
        // 人工构造：MEDIUM 副作用步去掉补偿后校验必须失败
        let task = Task::new("send status email".into(), "ops".into());
        let mut plan = planner().plan(&task, &ContextBundle::default(), 1).unwrap();
        plan.steps[0].compensating_action = None;
        assert!(matches!(
            validate(&mut plan.steps),
            Err(PlanError::MissingCompensation(_))
        ));
    }

    #[test]
    fn test_steps_in_topological_order() {
        let task = Task::new(
            "open report then write notes then email summary to team".into(),
            "analyst".into(),
        );
        let plan = planner().plan(&task, &ContextBundle::default(), 1).unwrap();
        let map = plan.step_map();
        for step in &plan.steps {
            for dep in &step.depends_on {
                assert!(map[dep.as_str()].sequence_index < step.sequence_index);
            }
        }
    }
}
