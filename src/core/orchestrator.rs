//! 编排器：任务生命周期主控
//!
//! 意图入口 -> 租约 -> 记忆上下文（限时，可降级）-> 规划 -> 安全门 ->
//! （必要时等待确认令牌）-> 执行引擎 -> 记忆落盘 + 学习回路 -> 终态摘要。
//! 执行不可恢复失败时最多触发一次自动重规划，旧 Plan 标记 superseded 从不改写。

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::bus::{topic, BusMessage, Envelope, MessageBus};
use crate::config::AppConfig;
use crate::core::{
    Completeness, LeaseManager, OrchestratorError, Task, TaskId, TaskOutcome, TaskStatus,
};
use crate::executor::{ExecutionEngine, ExecutionOutcome, StepOutcome, StepResult};
use crate::learning::{FeedbackRecord, LearningEngine};
use crate::memory::MemoryStore;
use crate::planner::{ContextBundle, Plan, PlanError, Planner};
use crate::security::{Decision, SecurityGate};

/// Plan 摘要（GET /tasks/{id} 返回，不暴露完整 Step 载荷）
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub plan_id: String,
    pub version: u32,
    pub step_count: usize,
    pub aggregate_risk: f64,
    pub context_degraded: bool,
    pub superseded: bool,
}

/// 任务快照：对外查询视图
#[derive(Debug, Clone, Serialize)]
pub struct TaskSnapshot {
    #[serde(flatten)]
    pub task: Task,
    pub plan: Option<PlanSummary>,
    /// AwaitingConfirmation 期间对提交方可见的待消费令牌
    pub confirmation_token: Option<String>,
    pub last_result: Option<StepResult>,
}

/// 每任务的编排状态
struct TaskRecord {
    task: Task,
    /// 全部 Plan 版本，旧版本 superseded
    plans: Vec<Plan>,
    pending_token: Option<String>,
    confirm_tx: Option<oneshot::Sender<()>>,
    cancel: CancellationToken,
    last_result: Option<StepResult>,
}

/// 编排器
pub struct Orchestrator {
    config: AppConfig,
    /// 本实例的租约持有者标识
    holder_id: String,
    bus: Arc<dyn MessageBus>,
    planner: Planner,
    gate: Arc<SecurityGate>,
    engine: Arc<ExecutionEngine>,
    memory: Arc<dyn MemoryStore>,
    learning: Arc<LearningEngine>,
    leases: Arc<LeaseManager>,
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    /// 最近一次处理活动的毫秒时间戳（健康探针用）
    last_processed_at: AtomicI64,
    /// 后台驱动任务时取 Arc 自引用
    self_ref: Weak<Orchestrator>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        bus: Arc<dyn MessageBus>,
        planner: Planner,
        gate: Arc<SecurityGate>,
        engine: Arc<ExecutionEngine>,
        memory: Arc<dyn MemoryStore>,
        learning: Arc<LearningEngine>,
        leases: Arc<LeaseManager>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            holder_id: format!("archi_{}", uuid::Uuid::new_v4()),
            bus,
            planner,
            gate,
            engine,
            memory,
            learning,
            leases,
            tasks: RwLock::new(HashMap::new()),
            last_processed_at: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
            self_ref: self_ref.clone(),
        })
    }

    /// 提交意图：创建任务并在后台驱动至终态
    pub async fn submit(&self, intent: String, role_scope: String) -> TaskId {
        let task = Task::new(intent.clone(), role_scope.clone());
        let task_id = task.id.clone();

        self.bus
            .publish(
                topic::TASK_LIFECYCLE,
                Envelope::new(
                    "api",
                    "orchestrator",
                    &task_id,
                    BusMessage::TaskRequest { intent, role_scope },
                ),
            )
            .await;

        let mut tasks = self.tasks.write().await;
        tasks.insert(
            task_id.clone(),
            TaskRecord {
                task,
                plans: Vec::new(),
                pending_token: None,
                confirm_tx: None,
                cancel: CancellationToken::new(),
                last_result: None,
            },
        );
        drop(tasks);

        if let Some(this) = self.self_ref.upgrade() {
            let id = task_id.clone();
            tokio::spawn(async move {
                this.drive(&id).await;
            });
        }
        task_id
    }

    /// 查询快照
    pub async fn snapshot(&self, task_id: &str) -> Option<TaskSnapshot> {
        let tasks = self.tasks.read().await;
        tasks.get(task_id).map(|record| TaskSnapshot {
            task: record.task.clone(),
            plan: record.plans.last().map(|p| PlanSummary {
                plan_id: p.id.clone(),
                version: p.version,
                step_count: p.steps.len(),
                aggregate_risk: p.aggregate_risk,
                context_degraded: p.context_degraded,
                superseded: p.superseded,
            }),
            confirmation_token: record.pending_token.clone(),
            last_result: record.last_result.clone(),
        })
    }

    /// 出示确认令牌：校验通过后唤醒等待中的驱动循环
    pub async fn confirm(&self, task_id: &str, token: &str) -> Result<(), OrchestratorError> {
        self.gate.confirm(task_id, token)?;
        let mut tasks = self.tasks.write().await;
        let record = tasks
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        record.pending_token = None;
        if let Some(tx) = record.confirm_tx.take() {
            let _ = tx.send(());
        }
        Ok(())
    }

    /// 取消：任意非终态均可触发；在途 Step 被等待并补偿
    pub async fn cancel(&self, task_id: &str) -> Result<(), OrchestratorError> {
        let tasks = self.tasks.read().await;
        let record = tasks
            .get(task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        if record.task.status.is_terminal() {
            return Err(OrchestratorError::TaskAlreadyTerminal(task_id.to_string()));
        }
        record.cancel.cancel();
        drop(tasks);

        self.bus
            .publish(
                topic::CANCEL,
                Envelope::new("api", "orchestrator", task_id, BusMessage::Cancel),
            )
            .await;
        Ok(())
    }

    /// 记录人工反馈并折算进学习回路
    pub async fn submit_feedback(
        &self,
        task_id: &str,
        rating: u8,
        notes: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let classes = {
            let tasks = self.tasks.read().await;
            let record = tasks
                .get(task_id)
                .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
            record
                .plans
                .last()
                .map(|p| {
                    p.steps
                        .iter()
                        .map(|s| (s.action.category, s.action.sensitivity))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default()
        };

        self.learning.record_feedback(
            FeedbackRecord {
                task_id: task_id.to_string(),
                rating,
                notes: notes.clone(),
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            &classes,
        );
        self.bus
            .publish(
                topic::FEEDBACK,
                Envelope::new(
                    "api",
                    "learning",
                    task_id,
                    BusMessage::Feedback { rating, notes },
                ),
            )
            .await;
        Ok(())
    }

    pub fn last_processed_at(&self) -> i64 {
        self.last_processed_at.load(Ordering::Relaxed)
    }

    /// 健康状态：最近处理活动过久未更新则降级
    pub fn health_status(&self) -> &'static str {
        let elapsed = chrono::Utc::now().timestamp_millis() - self.last_processed_at();
        if elapsed > self.config.api.health_stale_after_ms as i64 {
            "degraded"
        } else {
            "ok"
        }
    }

    /// 驱动任务至终态
    async fn drive(&self, task_id: &str) {
        if let Err(e) = self.leases.acquire(task_id, &self.holder_id) {
            tracing::warn!(task_id, error = %e, "Lease unavailable, task left pending");
            return;
        }
        let renew_cancel = self.spawn_lease_renewal(task_id);

        let mut version = 1u32;
        loop {
            match self.run_one_plan(task_id, version).await {
                PlanRound::Terminal => break,
                PlanRound::Replan => {
                    tracing::info!(task_id, next_version = version + 1, "Replanning after unrecoverable failure");
                    version += 1;
                }
            }
        }

        renew_cancel.cancel();
        self.leases.release(task_id, &self.holder_id);
        self.touch();
    }

    /// 单个 Plan 版本的完整回合：规划 -> 门控 -> 执行 -> 落盘
    async fn run_one_plan(&self, task_id: &str, version: u32) -> PlanRound {
        self.set_status(task_id, TaskStatus::Planning).await;
        let (task, cancel) = {
            let tasks = self.tasks.read().await;
            let record = match tasks.get(task_id) {
                Some(r) => r,
                None => return PlanRound::Terminal,
            };
            (record.task.clone(), record.cancel.clone())
        };

        // 记忆上下文限时等待，超时或不可用则降级为空上下文
        let bundle = self.retrieve_context(&task).await;

        let plan = match self.planner.plan(&task, &bundle, version) {
            Ok(p) => p,
            Err(e) => {
                self.fail(task_id, plan_error_to_orchestrator(&e), None, Completeness::NotRequired, None)
                    .await;
                return PlanRound::Terminal;
            }
        };
        if let Err(category) = self.engine.resolve_capabilities(&plan) {
            self.fail(
                task_id,
                OrchestratorError::UnresolvedCapability(category),
                None,
                Completeness::NotRequired,
                None,
            )
            .await;
            return PlanRound::Terminal;
        }

        let decision = self.gate.evaluate(&plan);
        let mut plan = plan;
        let (score, needs_confirmation) = match &decision {
            Decision::Rejected { score } => {
                self.publish_decision(task_id, &plan, "REJECTED", *score).await;
                self.fail(
                    task_id,
                    OrchestratorError::RiskExceeded {
                        score: *score,
                        threshold: self.config.security.high_threshold,
                    },
                    None,
                    Completeness::NotRequired,
                    None,
                )
                .await;
                return PlanRound::Terminal;
            }
            Decision::RequiresConfirmation { score, token } => {
                self.publish_decision(task_id, &plan, "REQUIRES_CONFIRMATION", *score).await;
                let mut tasks = self.tasks.write().await;
                if let Some(record) = tasks.get_mut(task_id) {
                    record.pending_token = Some(token.clone());
                }
                (*score, true)
            }
            Decision::AutoApproved { score } => {
                self.publish_decision(task_id, &plan, "AUTO_APPROVED", *score).await;
                (*score, false)
            }
        };
        plan.aggregate_risk = score;
        {
            let mut tasks = self.tasks.write().await;
            if let Some(record) = tasks.get_mut(task_id) {
                record.plans.push(plan.clone());
                record.task.plan_version = version;
            }
        }

        if needs_confirmation && !self.await_confirmation(task_id, &cancel).await {
            return PlanRound::Terminal;
        }

        // 执行；watch 通道把 RETRYING / ROLLING_BACK 投影回任务状态
        self.set_status(task_id, TaskStatus::Running).await;
        let (status_tx, status_rx) = watch::channel(TaskStatus::Running);
        self.spawn_status_forwarder(task_id, status_rx);
        let report = self.engine.run(task_id, &plan, cancel, status_tx).await;
        self.touch();

        // 无论终态如何都把执行历史写进记忆与学习回路
        self.record_outcome(&task, &plan, &report.results).await;
        let last = report.results.last().cloned();
        {
            let mut tasks = self.tasks.write().await;
            if let Some(record) = tasks.get_mut(task_id) {
                record.last_result = last.clone();
            }
        }

        match report.outcome {
            ExecutionOutcome::Completed => {
                self.finish(task_id, TaskOutcome::completed(last)).await;
                PlanRound::Terminal
            }
            ExecutionOutcome::Cancelled => {
                self.finish(
                    task_id,
                    TaskOutcome {
                        status: TaskStatus::Cancelled,
                        reason: Some("cancelled by caller".into()),
                        failed_step: None,
                        completeness: report.completeness,
                        last_result: last,
                    },
                )
                .await;
                PlanRound::Terminal
            }
            ExecutionOutcome::Failed { step_id, reason } => {
                if version < self.config.execution.max_plan_versions {
                    self.supersede_plans(task_id).await;
                    return PlanRound::Replan;
                }
                self.fail(
                    task_id,
                    OrchestratorError::StepExecution(reason),
                    Some(step_id),
                    report.completeness,
                    last,
                )
                .await;
                PlanRound::Terminal
            }
        }
    }

    /// 等待确认令牌被消费；超时以 ConfirmationTimeout 失败，取消则进入 Cancelled
    async fn await_confirmation(&self, task_id: &str, cancel: &CancellationToken) -> bool {
        let (tx, rx) = oneshot::channel();
        {
            let mut tasks = self.tasks.write().await;
            let Some(record) = tasks.get_mut(task_id) else {
                return false;
            };
            // 令牌自对外可见起即可被消费，confirm 可能赶在等待方就位之前；
            // 此时 pending_token 已被清空，直接放行而不是再等一个没有发送方的通道
            if record.pending_token.is_none() {
                return true;
            }
            record.confirm_tx = Some(tx);
        }
        self.set_status(task_id, TaskStatus::AwaitingConfirmation).await;

        tokio::select! {
            confirmed = tokio::time::timeout(self.gate.confirmation_ttl(), rx) => {
                match confirmed {
                    Ok(Ok(())) => true,
                    _ => {
                        self.fail(
                            task_id,
                            OrchestratorError::ConfirmationTimeout(task_id.to_string()),
                            None,
                            Completeness::NotRequired,
                            None,
                        )
                        .await;
                        false
                    }
                }
            }
            _ = cancel.cancelled() => {
                self.finish(
                    task_id,
                    TaskOutcome {
                        status: TaskStatus::Cancelled,
                        reason: Some("cancelled before confirmation".into()),
                        failed_step: None,
                        completeness: Completeness::NotRequired,
                        last_result: None,
                    },
                )
                .await;
                false
            }
        }
    }

    async fn retrieve_context(&self, task: &Task) -> ContextBundle {
        let terms: Vec<String> = task
            .intent
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();
        self.bus
            .publish(
                topic::MEMORY_CONTEXT,
                Envelope::new(
                    "orchestrator",
                    "memory",
                    &task.id,
                    BusMessage::MemoryQuery {
                        role_scope: task.role_scope.clone(),
                        query_terms: terms.clone(),
                        limit: 5,
                    },
                ),
            )
            .await;
        let lookup = self.memory.retrieve_context(&task.role_scope, &terms, 5);
        match tokio::time::timeout(Duration::from_millis(self.config.app.context_timeout_ms), lookup)
            .await
        {
            Ok(Ok(hits)) => {
                let payload = hits
                    .iter()
                    .filter_map(|h| serde_json::to_value(h).ok())
                    .collect();
                self.bus
                    .publish(
                        topic::MEMORY_CONTEXT,
                        Envelope::new(
                            "memory",
                            "orchestrator",
                            &task.id,
                            BusMessage::MemoryResult { hits: payload },
                        ),
                    )
                    .await;
                ContextBundle { hits, degraded: false }
            }
            Ok(Err(e)) => {
                tracing::warn!(task_id = %task.id, error = %e, "Memory unavailable, planning with degraded context");
                ContextBundle { hits: Vec::new(), degraded: true }
            }
            Err(_) => {
                tracing::warn!(task_id = %task.id, "Memory lookup timed out, planning with degraded context");
                ContextBundle { hits: Vec::new(), degraded: true }
            }
        }
    }

    async fn record_outcome(&self, task: &Task, plan: &Plan, results: &[StepResult]) {
        if let Err(e) = self.memory.record_execution(task, plan, results).await {
            tracing::warn!(task_id = %task.id, error = %e, "Failed to record execution to memory");
        }
        for step in &plan.steps {
            let attempts: Vec<&StepResult> =
                results.iter().filter(|r| r.step_id == step.id).collect();
            if attempts.is_empty() {
                continue;
            }
            let success = attempts.iter().any(|r| r.outcome == StepOutcome::Success);
            self.learning
                .observe_outcome(step.action.category, step.action.sensitivity, success);
        }
    }

    async fn publish_decision(&self, task_id: &str, plan: &Plan, decision: &str, score: f64) {
        self.bus
            .publish(
                topic::SECURITY_DECISION,
                Envelope::new(
                    "security_gate",
                    "orchestrator",
                    task_id,
                    BusMessage::SecurityDecision {
                        plan_id: plan.id.clone(),
                        decision: decision.to_string(),
                        risk_score: score,
                    },
                ),
            )
            .await;
        self.bus
            .publish(
                topic::PLAN_PROPOSED,
                Envelope::new(
                    "planner",
                    "orchestrator",
                    task_id,
                    BusMessage::PlanProposed {
                        plan_id: plan.id.clone(),
                        version: plan.version,
                        step_count: plan.steps.len(),
                        aggregate_risk: score,
                        context_degraded: plan.context_degraded,
                    },
                ),
            )
            .await;
    }

    /// 非终态期间按 TTL/3 周期续约
    fn spawn_lease_renewal(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        let guard = token.clone();
        let leases = Arc::clone(&self.leases);
        let holder = self.holder_id.clone();
        let task_id = task_id.to_string();
        let period = Duration::from_millis((self.config.execution.lease_ttl_ms / 3).max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = guard.cancelled() => return,
                    _ = tokio::time::sleep(period) => {
                        if leases.renew(&task_id, &holder).is_err() {
                            tracing::warn!(%task_id, "Lease renewal rejected");
                            return;
                        }
                    }
                }
            }
        });
        token
    }

    /// 把执行引擎的 watch 状态（Retrying / RollingBack）转入任务记录
    fn spawn_status_forwarder(&self, task_id: &str, mut rx: watch::Receiver<TaskStatus>) {
        let Some(this) = self.self_ref.upgrade() else {
            return;
        };
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let status = *rx.borrow();
                let mut tasks = this.tasks.write().await;
                if let Some(record) = tasks.get_mut(&task_id) {
                    if !record.task.status.is_terminal() {
                        record.task.status = status;
                    }
                }
            }
        });
    }

    async fn set_status(&self, task_id: &str, status: TaskStatus) {
        let mut tasks = self.tasks.write().await;
        if let Some(record) = tasks.get_mut(task_id) {
            record.task.status = status;
        }
        drop(tasks);
        self.touch();
    }

    async fn supersede_plans(&self, task_id: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(record) = tasks.get_mut(task_id) {
            for plan in record.plans.iter_mut() {
                plan.superseded = true;
            }
        }
    }

    async fn fail(
        &self,
        task_id: &str,
        error: OrchestratorError,
        failed_step: Option<String>,
        completeness: Completeness,
        last_result: Option<StepResult>,
    ) {
        tracing::warn!(task_id, error = %error, "Task failed");
        self.finish(
            task_id,
            TaskOutcome {
                status: TaskStatus::Failed,
                reason: Some(error.to_string()),
                failed_step,
                completeness,
                last_result,
            },
        )
        .await;
    }

    async fn finish(&self, task_id: &str, outcome: TaskOutcome) {
        let mut tasks = self.tasks.write().await;
        if let Some(record) = tasks.get_mut(task_id) {
            record.task.status = outcome.status;
            record.task.outcome = Some(outcome);
            record.pending_token = None;
            record.confirm_tx = None;
        }
        drop(tasks);
        self.touch();
        tracing::info!(task_id, "Task reached terminal state");
    }

    fn touch(&self) {
        self.last_processed_at
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }
}

/// 重规划裁决
enum PlanRound {
    Terminal,
    Replan,
}

fn plan_error_to_orchestrator(e: &PlanError) -> OrchestratorError {
    match e {
        PlanError::Cycle(ids) => OrchestratorError::PlanCycle(ids.clone()),
        PlanError::MissingCompensation(id) => OrchestratorError::MissingCompensation(id.clone()),
        PlanError::UnknownDependency(step, dep) => {
            OrchestratorError::PlanCycle(format!("{step} -> {dep}"))
        }
        PlanError::Empty => OrchestratorError::StepExecution("empty plan".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builder::build_components;

    async fn wait_terminal(orch: &Arc<Orchestrator>, task_id: &str) -> TaskSnapshot {
        for _ in 0..200 {
            if let Some(snap) = orch.snapshot(task_id).await {
                if snap.task.status.is_terminal() {
                    return snap;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("task {task_id} did not reach a terminal state");
    }

    #[tokio::test]
    async fn test_read_only_intent_runs_to_completion() {
        let components = build_components(AppConfig::default());
        let orch = components.orchestrator;
        let id = orch.submit("open dashboard".into(), "ops".into()).await;
        let snap = wait_terminal(&orch, &id).await;

        assert_eq!(snap.task.status, TaskStatus::Completed);
        assert!(snap.last_result.is_some());
        assert!(!components.audit.is_empty());
        assert!(components.audit.verify().is_ok());
    }

    #[tokio::test]
    async fn test_medium_risk_waits_for_confirmation() {
        let components = build_components(AppConfig::default());
        let orch = components.orchestrator;
        let id = orch.submit("send status email to team".into(), "ops".into()).await;

        let token = loop {
            if let Some(snap) = orch.snapshot(&id).await {
                if let Some(token) = snap.confirmation_token {
                    assert_eq!(snap.task.status, TaskStatus::AwaitingConfirmation);
                    break token;
                }
                assert!(!snap.task.status.is_terminal(), "terminal before confirmation");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        orch.confirm(&id, &token).await.unwrap();
        let snap = wait_terminal(&orch, &id).await;
        assert_eq!(snap.task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_invalid_token_rejected() {
        let components = build_components(AppConfig::default());
        let orch = components.orchestrator;
        let id = orch.submit("send status email to team".into(), "ops".into()).await;

        while orch.snapshot(&id).await.unwrap().confirmation_token.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(
            orch.confirm(&id, "not-the-token").await,
            Err(OrchestratorError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_high_risk_rejected_without_execution() {
        let components = build_components(AppConfig::default());
        let orch = components.orchestrator;
        let id = orch
            .submit("transfer salary payment to bank".into(), "finance".into())
            .await;
        let snap = wait_terminal(&orch, &id).await;

        assert_eq!(snap.task.status, TaskStatus::Failed);
        let outcome = snap.task.outcome.unwrap();
        assert!(outcome.reason.unwrap().contains("Risk exceeded"));
        assert!(snap.last_result.is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_confirmation() {
        let components = build_components(AppConfig::default());
        let orch = components.orchestrator;
        let id = orch.submit("send status email to team".into(), "ops".into()).await;

        while orch.snapshot(&id).await.unwrap().confirmation_token.is_none() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        orch.cancel(&id).await.unwrap();
        let snap = wait_terminal(&orch, &id).await;
        assert_eq!(snap.task.status, TaskStatus::Cancelled);
    }

    /// 令牌在对外可见与驱动循环安装等待通道之间被消费时，确认不得丢失
    #[tokio::test]
    async fn test_confirm_arriving_before_waiter_is_not_lost() {
        let components = build_components(AppConfig::default());
        let orch = components.orchestrator;
        let task = Task::new("send status email to team".into(), "ops".into());
        let id = task.id.clone();
        {
            let mut tasks = orch.tasks.write().await;
            tasks.insert(
                id.clone(),
                TaskRecord {
                    task,
                    plans: Vec::new(),
                    pending_token: Some("tok".into()),
                    confirm_tx: None,
                    cancel: CancellationToken::new(),
                    last_result: None,
                },
            );
        }
        // 确认方赶在等待通道就位之前消费了令牌
        {
            let mut tasks = orch.tasks.write().await;
            let record = tasks.get_mut(&id).unwrap();
            record.pending_token = None;
            assert!(record.confirm_tx.take().is_none());
        }

        let cancel = CancellationToken::new();
        let confirmed = tokio::time::timeout(
            Duration::from_millis(250),
            orch.await_confirmation(&id, &cancel),
        )
        .await
        .expect("confirmation wakeup was lost");
        assert!(confirmed);
    }

    #[tokio::test]
    async fn test_context_lookup_flows_over_bus() {
        let components = build_components(AppConfig::default());
        let orch = components.orchestrator;
        let mut sub = components.bus.subscribe(topic::MEMORY_CONTEXT, "observer").await;
        let id = orch.submit("open dashboard".into(), "ops".into()).await;
        wait_terminal(&orch, &id).await;

        let query = sub.recv().await.unwrap();
        assert_eq!(query.correlation_id, id);
        assert!(matches!(query.message, BusMessage::MemoryQuery { .. }));
        let result = sub.recv().await.unwrap();
        assert!(matches!(result.message, BusMessage::MemoryResult { .. }));
    }

    #[tokio::test]
    async fn test_cancel_after_terminal_state_conflicts() {
        let components = build_components(AppConfig::default());
        let orch = components.orchestrator;
        let id = orch.submit("open dashboard".into(), "ops".into()).await;
        wait_terminal(&orch, &id).await;

        assert!(matches!(
            orch.cancel(&id).await,
            Err(OrchestratorError::TaskAlreadyTerminal(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_task_not_found() {
        let components = build_components(AppConfig::default());
        let orch = components.orchestrator;
        assert!(matches!(
            orch.cancel("task_ghost").await,
            Err(OrchestratorError::TaskNotFound(_))
        ));
        assert!(orch.snapshot("task_ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_feedback_folds_into_learning() {
        let components = build_components(AppConfig::default());
        let orch = components.orchestrator;
        let id = orch.submit("open dashboard".into(), "ops".into()).await;
        wait_terminal(&orch, &id).await;

        orch.submit_feedback(&id, 1, Some("opened wrong file".into()))
            .await
            .unwrap();
        assert_eq!(components.learning.feedback_for(&id).len(), 1);
    }
}
