//! 端到端编排流程测试：提交意图 -> 确认 -> 执行 -> 终态

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use archi::config::AppConfig;
use archi::core::{build_with_registry, Completeness, Orchestrator, TaskStatus};
use archi::executor::{CapabilityRegistry, RunnerError, StepRunner};
use archi::planner::{ActionCategory, ActionDescriptor};

/// 记录动作调用顺序的执行器；fail_actions 内的动作名恒失败
struct RecordingRunner {
    calls: Arc<Mutex<Vec<String>>>,
    fail_actions: Vec<String>,
}

#[async_trait]
impl StepRunner for RecordingRunner {
    fn id(&self) -> &str {
        "recording"
    }

    async fn execute(&self, action: &ActionDescriptor) -> Result<serde_json::Value, RunnerError> {
        self.calls.lock().unwrap().push(action.name.clone());
        if self.fail_actions.contains(&action.name) {
            return Err(RunnerError::Failed(format!("{} rejected", action.name)));
        }
        Ok(serde_json::json!({"done": action.name}))
    }
}

fn build(config: AppConfig, fail_actions: &[&str]) -> (Arc<Orchestrator>, Arc<Mutex<Vec<String>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut registry = CapabilityRegistry::new();
    for category in [
        ActionCategory::Read,
        ActionCategory::WriteState,
        ActionCategory::Financial,
        ActionCategory::DesktopAutomation,
    ] {
        let runner: Arc<dyn StepRunner> = Arc::new(RecordingRunner {
            calls: Arc::clone(&calls),
            fail_actions: fail_actions.iter().map(|s| s.to_string()).collect(),
        });
        registry.register(category, runner);
    }
    let components = build_with_registry(config, registry);
    (components.orchestrator, calls)
}

/// 重试退避调快，避免测试等待真实退避间隔
fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.execution.backoff_base_ms = 1;
    config
}

async fn wait_terminal(orch: &Arc<Orchestrator>, task_id: &str) -> archi::core::TaskSnapshot {
    for _ in 0..300 {
        if let Some(snap) = orch.snapshot(task_id).await {
            if snap.task.status.is_terminal() {
                return snap;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {task_id} never reached a terminal state");
}

async fn wait_token(orch: &Arc<Orchestrator>, task_id: &str) -> String {
    for _ in 0..300 {
        let snap = orch.snapshot(task_id).await.expect("task exists");
        if let Some(token) = snap.confirmation_token {
            assert_eq!(snap.task.status, TaskStatus::AwaitingConfirmation);
            return token;
        }
        assert!(
            !snap.task.status.is_terminal(),
            "task went terminal before issuing a token: {:?}",
            snap.task.outcome
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no confirmation token issued for {task_id}");
}

/// 季报场景：分解为 [打开文档, 提取摘要, 撰写邮件]，撰写邮件为 MEDIUM 档，
/// 确认后三步按序执行完成
#[tokio::test]
async fn test_quarterly_report_flow_completes_after_confirmation() {
    let (orch, calls) = build(fast_config(), &[]);
    let id = orch
        .submit("open quarterly report and email summary".into(), "analyst".into())
        .await;

    let snap = orch.snapshot(&id).await.unwrap();
    assert!(snap.plan.is_none() || !snap.task.status.is_terminal());

    let token = wait_token(&orch, &id).await;
    orch.confirm(&id, &token).await.unwrap();

    let snap = wait_terminal(&orch, &id).await;
    assert_eq!(snap.task.status, TaskStatus::Completed);
    let plan = snap.plan.unwrap();
    assert_eq!(plan.step_count, 3);
    assert!(plan.aggregate_risk >= 0.3 && plan.aggregate_risk < 0.75);

    assert_eq!(
        *calls.lock().unwrap(),
        vec!["open_document", "extract_summary", "compose_email"]
    );
}

/// 强制失败：compose_email 重试 3 次后耗尽，已生效的写步逆序补偿；
/// 补偿失败被记录，任务以 FAILED + completeness=partial 收场
#[tokio::test]
async fn test_forced_failure_rolls_back_with_partial_completeness() {
    let mut config = fast_config();
    config.execution.max_plan_versions = 1;
    let (orch, calls) = build(config, &["compose_email", "undo_change"]);

    let id = orch
        .submit("save meeting notes and email summary to boss".into(), "analyst".into())
        .await;
    let token = wait_token(&orch, &id).await;
    orch.confirm(&id, &token).await.unwrap();

    let snap = wait_terminal(&orch, &id).await;
    assert_eq!(snap.task.status, TaskStatus::Failed);
    let outcome = snap.task.outcome.unwrap();
    assert_eq!(outcome.completeness, Completeness::Partial);
    assert_eq!(outcome.failed_step.as_deref(), Some("step_1_2"));

    // apply_change 与 extract_summary 各一次，compose_email 三次，随后逆序补偿 apply_change
    assert_eq!(
        *calls.lock().unwrap(),
        vec![
            "apply_change",
            "extract_summary",
            "compose_email",
            "compose_email",
            "compose_email",
            "undo_change",
        ]
    );
}

/// 不可恢复失败触发一次自动重规划；第二版 Plan 仍失败则终态 FAILED，
/// 旧版本 Plan 标记 superseded
#[tokio::test]
async fn test_replanning_supersedes_prior_plan_version() {
    let (orch, _calls) = build(fast_config(), &["open_document"]);
    let id = orch.submit("open dashboard".into(), "ops".into()).await;

    let snap = wait_terminal(&orch, &id).await;
    assert_eq!(snap.task.status, TaskStatus::Failed);
    // 终版 Plan 为第 2 版（默认 max_plan_versions = 2）
    let plan = snap.plan.unwrap();
    assert_eq!(plan.version, 2);
    assert_eq!(snap.task.plan_version, 2);
}

/// 确认超时：时限内无人出示令牌，任务以 ConfirmationTimeout 失败
#[tokio::test]
async fn test_confirmation_timeout_fails_task() {
    let mut config = fast_config();
    config.security.confirmation_ttl_secs = 0;
    let (orch, calls) = build(config, &[]);

    let id = orch
        .submit("send status email to team".into(), "ops".into())
        .await;
    let snap = wait_terminal(&orch, &id).await;

    assert_eq!(snap.task.status, TaskStatus::Failed);
    let outcome = snap.task.outcome.unwrap();
    assert!(outcome.reason.unwrap().contains("Confirmation timed out"));
    // 未经确认不允许任何 Step 下发
    assert!(calls.lock().unwrap().is_empty());
}

/// 高风险意图被安全门直接拒绝，不进入执行
#[tokio::test]
async fn test_high_risk_intent_rejected_outright() {
    let (orch, calls) = build(fast_config(), &[]);
    let id = orch
        .submit("transfer salary payment to vendor bank".into(), "finance".into())
        .await;

    let snap = wait_terminal(&orch, &id).await;
    assert_eq!(snap.task.status, TaskStatus::Failed);
    assert!(snap.task.outcome.unwrap().reason.unwrap().contains("Risk exceeded"));
    assert!(calls.lock().unwrap().is_empty());
}
