//! 执行状态机
//!
//! PENDING → RUNNING → {STEP_SUCCEEDED → 推进依赖图 | STEP_FAILED → RETRYING / ROLLING_BACK}
//! → COMPLETED | FAILED | CANCELLED
//!
//! - 失败按 Step 的重试策略指数退避，耗尽后对所有已生效 Step 按完成顺序逆序补偿
//! - 并行安全 Step 受 Semaphore 限流并发下发，结果在单一决策点串行应用
//! - 结果应用以 (taskId, stepId, attempt) 幂等去重，容忍总线重复投递
//! - 取消是消息驱动的：在途 Step 结果仍被等待，落地成功的同样参与补偿

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::bus::{topic, BusMessage, Envelope, MessageBus};
use crate::config::ExecutionSection;
use crate::core::{Completeness, TaskStatus};
use crate::executor::runner::CapabilityRegistry;
use crate::executor::{StepOutcome, StepResult};
use crate::planner::{Plan, PlanGraph, Step, StepId};
use crate::security::{AuditDecision, AuditLog};

/// 执行终态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Completed,
    Failed { step_id: StepId, reason: String },
    Cancelled,
}

/// 执行报告：调用方可见的终态摘要素材
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: ExecutionOutcome,
    /// 全部尝试的追加式记录（含重试与超时）
    pub results: Vec<StepResult>,
    pub completeness: Completeness,
}

/// 单步执行任务发往决策点的内部事件
struct AttemptEvent {
    step_id: StepId,
    result: StepResult,
    /// 本步不再有后续尝试（成功、重试耗尽或取消中止）
    terminal: bool,
}

/// 决策点状态：结果的串行应用与幂等去重（独立出来便于性质测试）
#[derive(Default)]
pub(crate) struct DecisionState {
    applied: HashSet<(StepId, u32)>,
    pub(crate) results: Vec<StepResult>,
    /// 成功步按完成顺序记录，回滚按此逆序
    pub(crate) completion_order: Vec<StepId>,
}

impl DecisionState {
    /// 应用一条结果；重复投递返回 false 且状态不变
    pub(crate) fn apply(&mut self, result: StepResult) -> bool {
        let key = (result.step_id.clone(), result.attempt);
        if !self.applied.insert(key) {
            tracing::debug!(step_id = %result.step_id, attempt = result.attempt, "Duplicate step result ignored");
            return false;
        }
        if result.outcome == StepOutcome::Success {
            self.completion_order.push(result.step_id.clone());
        }
        self.results.push(result);
        true
    }
}

/// 执行引擎
pub struct ExecutionEngine {
    registry: Arc<CapabilityRegistry>,
    bus: Arc<dyn MessageBus>,
    audit: Arc<AuditLog>,
    config: ExecutionSection,
}

impl ExecutionEngine {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        bus: Arc<dyn MessageBus>,
        audit: Arc<AuditLog>,
        config: ExecutionSection,
    ) -> Self {
        Self {
            registry,
            bus,
            audit,
            config,
        }
    }

    /// Plan 校验期解析：所有动作类别必须有已注册的执行器
    pub fn resolve_capabilities(&self, plan: &Plan) -> Result<(), String> {
        for step in &plan.steps {
            if !self.registry.can_resolve(step.action.category) {
                return Err(step.action.category.to_string());
            }
        }
        Ok(())
    }

    /// 驱动一个 Plan 到终态；status_tx 向编排器投影 RETRYING / ROLLING_BACK
    pub async fn run(
        &self,
        task_id: &str,
        plan: &Plan,
        cancel: CancellationToken,
        status_tx: watch::Sender<TaskStatus>,
    ) -> ExecutionReport {
        let mut graph = match PlanGraph::new(&plan.steps) {
            Ok(g) => g,
            Err(e) => {
                // Plan 已过校验，图构建失败属于内部缺陷
                return ExecutionReport {
                    outcome: ExecutionOutcome::Failed {
                        step_id: String::new(),
                        reason: e.to_string(),
                    },
                    results: Vec::new(),
                    completeness: Completeness::NotRequired,
                };
            }
        };

        let steps = plan.step_map();
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_steps.max(1)));
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<AttemptEvent>();

        let mut state = DecisionState::default();
        let mut in_flight: HashSet<StepId> = HashSet::new();
        let mut done: HashSet<StepId> = HashSet::new();
        let mut failed_step: Option<(StepId, String)> = None;
        let mut cancelling = false;

        for step_id in graph.ready(&done) {
            let step = steps[step_id.as_str()];
            self.dispatch(task_id, step, &semaphore, &event_tx, &cancel);
            in_flight.insert(step_id);
        }

        // 决策点：结果串行应用，再推进依赖图
        while !in_flight.is_empty() {
            tokio::select! {
                _ = cancel.cancelled(), if !cancelling => {
                    tracing::info!(task_id, "Cancellation requested, draining in-flight steps");
                    cancelling = true;
                }
                Some(event) = event_rx.recv() => {
                    let AttemptEvent { step_id, result, terminal } = event;
                    let outcome = result.outcome;
                    let attempt = result.attempt;
                    if !state.apply(result.clone()) {
                        continue;
                    }
                    self.publish_result(task_id, &result).await;

                    match outcome {
                        StepOutcome::Success => {
                            in_flight.remove(&step_id);
                            done.insert(step_id.clone());
                            for next in graph.mark_completed(&step_id) {
                                if cancelling || failed_step.is_some() {
                                    continue;
                                }
                                let step = steps[next.as_str()];
                                self.dispatch(task_id, step, &semaphore, &event_tx, &cancel);
                                in_flight.insert(next);
                            }
                        }
                        StepOutcome::Failed | StepOutcome::Timeout if terminal => {
                            in_flight.remove(&step_id);
                            if failed_step.is_none() && !cancelling {
                                failed_step = Some((
                                    step_id.clone(),
                                    format!("attempt {attempt} ended with {outcome:?}"),
                                ));
                            }
                        }
                        _ => {
                            // 非终次失败：退避重试中
                            let _ = status_tx.send(TaskStatus::Retrying);
                        }
                    }
                }
                else => break,
            }
        }

        // 终态裁决与回滚
        if cancelling || (cancel.is_cancelled() && failed_step.is_none()) {
            let completeness = self.rollback(task_id, plan, &state, &status_tx).await;
            return ExecutionReport {
                outcome: ExecutionOutcome::Cancelled,
                results: state.results,
                completeness,
            };
        }

        if let Some((step_id, reason)) = failed_step {
            let completeness = self.rollback(task_id, plan, &state, &status_tx).await;
            self.audit.append(
                task_id,
                Some(&step_id),
                "executor",
                "plan_failed",
                0.0,
                AuditDecision::Rejected,
            );
            return ExecutionReport {
                outcome: ExecutionOutcome::Failed { step_id, reason },
                results: state.results,
                completeness,
            };
        }

        self.audit.append(
            task_id,
            None,
            "executor",
            "plan_completed",
            0.0,
            AuditDecision::AutoApproved,
        );
        ExecutionReport {
            outcome: ExecutionOutcome::Completed,
            results: state.results,
            completeness: Completeness::NotRequired,
        }
    }

    /// 下发一个 Step：独立任务内做限流、超时与退避重试，每次尝试回报决策点
    fn dispatch(
        &self,
        task_id: &str,
        step: &Step,
        semaphore: &Arc<Semaphore>,
        event_tx: &mpsc::UnboundedSender<AttemptEvent>,
        cancel: &CancellationToken,
    ) {
        let step = step.clone();
        let semaphore = Arc::clone(semaphore);
        let event_tx = event_tx.clone();
        let cancel = cancel.clone();
        let runner = self.registry.resolve(step.action.category);
        let bus = Arc::clone(&self.bus);
        let task_id = task_id.to_string();
        let step_timeout = Duration::from_millis(self.config.step_timeout_ms);

        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let Some(runner) = runner else {
                // 注册表解析在 Plan 校验期完成，这里只可能是注册表被并发清空
                let result = StepResult::new(
                    &step.id,
                    1,
                    StepOutcome::Failed,
                    serde_json::json!({"error": "no runner registered"}),
                );
                let _ = event_tx.send(AttemptEvent {
                    step_id: step.id.clone(),
                    result,
                    terminal: true,
                });
                return;
            };

            let max_attempts = step.retry_policy.max_attempts.max(1);
            let mut attempt = 1u32;
            loop {
                bus.publish(
                    topic::STEP_DISPATCH,
                    Envelope::new(
                        "executor",
                        "runner",
                        &task_id,
                        BusMessage::StepDispatch {
                            step_id: step.id.clone(),
                            attempt,
                            payload: step.action.parameters.clone(),
                        },
                    ),
                )
                .await;

                let attempt_result =
                    tokio::time::timeout(step_timeout, runner.execute(&step.action)).await;
                let (outcome, output) = match attempt_result {
                    Ok(Ok(value)) => (StepOutcome::Success, value),
                    Ok(Err(e)) => (StepOutcome::Failed, serde_json::json!({"error": e.to_string()})),
                    Err(_) => (StepOutcome::Timeout, serde_json::json!({"error": "step timed out"})),
                };

                let success = outcome == StepOutcome::Success;
                let exhausted = attempt >= max_attempts;
                // 取消后不再发起新尝试，本次即为终次
                let mut aborted = cancel.is_cancelled();

                if !(success || exhausted || aborted) {
                    let backoff =
                        step.retry_policy.backoff_base_ms.saturating_mul(1 << (attempt - 1));
                    // 退避期间到达的取消同样终止重试
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(backoff)) => {}
                        _ = cancel.cancelled() => aborted = true,
                    }
                }

                let terminal = success || exhausted || aborted;
                let _ = event_tx.send(AttemptEvent {
                    step_id: step.id.clone(),
                    result: StepResult::new(&step.id, attempt, outcome, output),
                    terminal,
                });
                if terminal {
                    return;
                }
                attempt += 1;
            }
        });
    }

    /// 按完成顺序逆序补偿所有已生效 Step；补偿失败记录后继续（best-effort）
    async fn rollback(
        &self,
        task_id: &str,
        plan: &Plan,
        state: &DecisionState,
        status_tx: &watch::Sender<TaskStatus>,
    ) -> Completeness {
        let steps = plan.step_map();
        let compensable: Vec<&Step> = state
            .completion_order
            .iter()
            .rev()
            .filter_map(|id| steps.get(id.as_str()).copied())
            .filter(|s| s.compensating_action.is_some())
            .collect();

        if compensable.is_empty() {
            return Completeness::NotRequired;
        }

        let _ = status_tx.send(TaskStatus::RollingBack);
        let mut all_ok = true;
        for step in compensable {
            let action = step.compensating_action.as_ref().expect("filtered above");
            let Some(runner) = self.registry.resolve(action.category) else {
                all_ok = false;
                continue;
            };
            match runner.execute(action).await {
                Ok(_) => {
                    tracing::info!(task_id, step_id = %step.id, "Compensation applied");
                }
                Err(e) => {
                    // RollbackFailure：记录但不阻断剩余补偿
                    all_ok = false;
                    tracing::warn!(task_id, step_id = %step.id, error = %e, "Compensation failed");
                    self.audit.append(
                        task_id,
                        Some(&step.id),
                        "executor",
                        "compensation_failed",
                        0.0,
                        AuditDecision::Rejected,
                    );
                }
            }
        }
        if all_ok {
            Completeness::Full
        } else {
            Completeness::Partial
        }
    }

    async fn publish_result(&self, task_id: &str, result: &StepResult) {
        self.bus
            .publish(
                topic::STEP_RESULT,
                Envelope::new(
                    "executor",
                    "orchestrator",
                    task_id,
                    BusMessage::StepResult {
                        step_id: result.step_id.clone(),
                        attempt: result.attempt,
                        outcome: format!("{:?}", result.outcome),
                        output: result.output.clone(),
                    },
                ),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use crate::executor::runner::{RunnerError, SimulatedRunner, StepRunner};
    use crate::planner::{
        ActionCategory, ActionDescriptor, RetryPolicy, RiskLevel, Sensitivity,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn descriptor(category: ActionCategory, name: &str) -> ActionDescriptor {
        ActionDescriptor {
            category,
            name: name.into(),
            target: "target".into(),
            sensitivity: Sensitivity::Public,
            parameters: serde_json::Value::Null,
        }
    }

    fn step(id: &str, deps: &[&str], category: ActionCategory, compensated: bool) -> Step {
        Step {
            id: id.into(),
            plan_id: "plan_test".into(),
            sequence_index: 0,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            action: descriptor(category, &format!("do_{id}")),
            risk: RiskLevel::Low,
            compensating_action: compensated.then(|| descriptor(category, &format!("undo_{id}"))),
            retry_policy: RetryPolicy { max_attempts: 3, backoff_base_ms: 1 },
            parallel_safe: deps.is_empty(),
            estimated_duration_secs: 1,
        }
    }

    fn plan(steps: Vec<Step>) -> Plan {
        Plan {
            id: "plan_test".into(),
            task_id: "task_test".into(),
            version: 1,
            steps,
            estimated_duration_secs: 1,
            aggregate_risk: 0.1,
            context_degraded: false,
            superseded: false,
            created_at: 0,
        }
    }

    /// 指定动作名失败的执行器；记录所有调用顺序
    struct ScriptedRunner {
        fail_actions: Vec<String>,
        calls: Mutex<Vec<String>>,
        attempts: AtomicU32,
    }

    impl ScriptedRunner {
        fn new(fail_actions: &[&str]) -> Self {
            Self {
                fail_actions: fail_actions.iter().map(|s| s.to_string()).collect(),
                calls: Mutex::new(Vec::new()),
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StepRunner for ScriptedRunner {
        fn id(&self) -> &str {
            "scripted"
        }

        async fn execute(&self, action: &ActionDescriptor) -> Result<serde_json::Value, RunnerError> {
            self.calls.lock().unwrap().push(action.name.clone());
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_actions.contains(&action.name) {
                Err(RunnerError::Failed("scripted failure".into()))
            } else {
                Ok(serde_json::json!({"ok": action.name}))
            }
        }
    }

    fn engine_with(runner: Arc<dyn StepRunner>) -> ExecutionEngine {
        let mut registry = CapabilityRegistry::new();
        for category in [
            ActionCategory::Read,
            ActionCategory::WriteState,
            ActionCategory::DesktopAutomation,
            ActionCategory::Financial,
        ] {
            registry.register(category, Arc::clone(&runner));
        }
        ExecutionEngine::new(
            Arc::new(registry),
            InProcessBus::new(),
            Arc::new(AuditLog::new()),
            ExecutionSection { backoff_base_ms: 1, ..Default::default() },
        )
    }

    #[tokio::test]
    async fn test_sequential_plan_completes() {
        let runner = Arc::new(ScriptedRunner::new(&[]));
        let engine = engine_with(runner.clone() as Arc<dyn StepRunner>);
        let p = plan(vec![
            step("a", &[], ActionCategory::Read, false),
            step("b", &["a"], ActionCategory::Read, false),
            step("c", &["b"], ActionCategory::Read, false),
        ]);
        let (status_tx, _status_rx) = watch::channel(TaskStatus::Running);
        let report = engine
            .run("task_test", &p, CancellationToken::new(), status_tx)
            .await;

        assert_eq!(report.outcome, ExecutionOutcome::Completed);
        assert_eq!(*runner.calls.lock().unwrap(), vec!["do_a", "do_b", "do_c"]);
    }

    #[tokio::test]
    async fn test_retry_until_exhaustion_then_rollback_reverse_order() {
        let runner = Arc::new(ScriptedRunner::new(&["do_c"]));
        let engine = engine_with(runner.clone() as Arc<dyn StepRunner>);
        let p = plan(vec![
            step("a", &[], ActionCategory::WriteState, true),
            step("b", &["a"], ActionCategory::WriteState, true),
            step("c", &["b"], ActionCategory::WriteState, true),
        ]);
        let (status_tx, status_rx) = watch::channel(TaskStatus::Running);
        let report = engine
            .run("task_test", &p, CancellationToken::new(), status_tx)
            .await;

        match &report.outcome {
            ExecutionOutcome::Failed { step_id, .. } => assert_eq!(step_id, "c"),
            other => panic!("Unexpected outcome: {other:?}"),
        }
        assert_eq!(report.completeness, Completeness::Full);
        // a、b 各 1 次，c 重试 3 次，补偿严格逆序：undo_b -> undo_a
        let calls = runner.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec!["do_a", "do_b", "do_c", "do_c", "do_c", "undo_b", "undo_a"]
        );
        assert_eq!(*status_rx.borrow(), TaskStatus::RollingBack);
    }

    #[tokio::test]
    async fn test_rollback_failure_is_best_effort_partial() {
        let runner = Arc::new(ScriptedRunner::new(&["do_c", "undo_b"]));
        let engine = engine_with(runner.clone() as Arc<dyn StepRunner>);
        let p = plan(vec![
            step("a", &[], ActionCategory::WriteState, true),
            step("b", &["a"], ActionCategory::WriteState, true),
            step("c", &["b"], ActionCategory::WriteState, true),
        ]);
        let (status_tx, _status_rx) = watch::channel(TaskStatus::Running);
        let report = engine
            .run("task_test", &p, CancellationToken::new(), status_tx)
            .await;

        assert_eq!(report.completeness, Completeness::Partial);
        // undo_b 失败后 undo_a 仍被执行
        let calls = runner.calls.lock().unwrap().clone();
        assert!(calls.contains(&"undo_a".to_string()));
    }

    #[tokio::test]
    async fn test_parallel_steps_bounded_and_serialized() {
        let runner = Arc::new(ScriptedRunner::new(&[]));
        let engine = engine_with(runner.clone() as Arc<dyn StepRunner>);
        // a、b、c 互不依赖，d 汇聚
        let p = plan(vec![
            step("a", &[], ActionCategory::Read, false),
            step("b", &[], ActionCategory::Read, false),
            step("c", &[], ActionCategory::Read, false),
            step("d", &["a", "b", "c"], ActionCategory::Read, false),
        ]);
        let (status_tx, _status_rx) = watch::channel(TaskStatus::Running);
        let report = engine
            .run("task_test", &p, CancellationToken::new(), status_tx)
            .await;

        assert_eq!(report.outcome, ExecutionOutcome::Completed);
        let calls = runner.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls.last().unwrap(), "do_d");
    }

    #[tokio::test]
    async fn test_cancellation_compensates_completed_steps() {
        let runner = Arc::new(ScriptedRunner::new(&[]));
        let engine = engine_with(runner.clone() as Arc<dyn StepRunner>);
        let p = plan(vec![step("a", &[], ActionCategory::WriteState, true)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (status_tx, _status_rx) = watch::channel(TaskStatus::Running);
        let report = engine.run("task_test", &p, cancel, status_tx).await;

        assert_eq!(report.outcome, ExecutionOutcome::Cancelled);
        // 已下发的 a 仍被等待，落地成功后被补偿
        let calls = runner.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["do_a", "undo_a"]);
        assert_eq!(report.completeness, Completeness::Full);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_stops_retries() {
        let runner = Arc::new(ScriptedRunner::new(&["do_a"]));
        let engine = engine_with(runner.clone() as Arc<dyn StepRunner>);
        let mut failing = step("a", &[], ActionCategory::WriteState, true);
        failing.retry_policy = RetryPolicy { max_attempts: 3, backoff_base_ms: 60_000 };
        let p = plan(vec![failing]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let (status_tx, _status_rx) = watch::channel(TaskStatus::Running);
        let report = engine.run("task_test", &p, cancel, status_tx).await;

        assert_eq!(report.outcome, ExecutionOutcome::Cancelled);
        // 第一次尝试失败后处于退避，取消到达即终止，不再有第二次尝试
        assert_eq!(*runner.calls.lock().unwrap(), vec!["do_a"]);
    }

    /// 幂等性质：同一 (stepId, attempt) 结果应用两次与一次状态相同
    #[test]
    fn test_duplicate_result_application_idempotent() {
        let mut state = DecisionState::default();
        let result = StepResult::new("step_a", 1, StepOutcome::Success, serde_json::Value::Null);

        assert!(state.apply(result.clone()));
        let results_after_first = state.results.len();
        let order_after_first = state.completion_order.clone();

        assert!(!state.apply(result));
        assert_eq!(state.results.len(), results_after_first);
        assert_eq!(state.completion_order, order_after_first);
    }

    #[test]
    fn test_distinct_attempts_both_applied() {
        let mut state = DecisionState::default();
        assert!(state.apply(StepResult::new("step_a", 1, StepOutcome::Failed, serde_json::Value::Null)));
        assert!(state.apply(StepResult::new("step_a", 2, StepOutcome::Success, serde_json::Value::Null)));
        assert_eq!(state.results.len(), 2);
        assert_eq!(state.completion_order, vec!["step_a"]);
    }
}
