//! 安全门：风险评分与放行裁决
//!
//! evaluate(plan) -> Decision：单步风险 = 类别权重 + 目标敏感级 + 学习信号，
//! 聚合风险 = max(步风险) 加加权和细分。裁决写入审计链之后才允许任何 Step 下发。
//! 学习乘数只会收紧不会放宽：门控取 max(基础分, 调整分)。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::config::SecuritySection;
use crate::core::OrchestratorError;
use crate::learning::LearningEngine;
use crate::planner::{Plan, Step};
use crate::security::{AuditDecision, AuditLog};

/// 裁决结果
#[derive(Debug, Clone)]
pub enum Decision {
    /// risk < LOW_THRESHOLD：自动放行
    AutoApproved { score: f64 },
    /// LOW <= risk < HIGH：需在时限内出示单次确认令牌
    RequiresConfirmation { score: f64, token: String },
    /// risk >= HIGH_THRESHOLD：直接拒绝，任务以 RiskExceeded 失败
    Rejected { score: f64 },
}

struct TokenState {
    token: String,
    issued_at: Instant,
    used: bool,
    score: f64,
}

/// 安全门
pub struct SecurityGate {
    config: SecuritySection,
    learning: Arc<LearningEngine>,
    audit: Arc<AuditLog>,
    /// taskId -> 未消费的确认令牌
    tokens: Mutex<HashMap<String, TokenState>>,
}

impl SecurityGate {
    pub fn new(config: SecuritySection, learning: Arc<LearningEngine>, audit: Arc<AuditLog>) -> Self {
        Self {
            config,
            learning,
            audit,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    /// 单步风险分：基础分与学习调整分取较大者（历史权重不能把高危动作降档）
    pub fn step_score(&self, step: &Step) -> f64 {
        let base = (step.action.category.base_weight() + step.action.sensitivity.weight()).min(1.0);
        let adjusted = (base * self.learning.multiplier(step.action.category, step.action.sensitivity)).min(1.0);
        base.max(adjusted)
    }

    /// 聚合 Plan 风险：max 为主，加权和作细分（并列时副作用多的 Plan 更高）
    pub fn plan_score(&self, plan: &Plan) -> f64 {
        if plan.steps.is_empty() {
            return 0.0;
        }
        let scores: Vec<f64> = plan.steps.iter().map(|s| self.step_score(s)).collect();
        let max = scores.iter().cloned().fold(0.0, f64::max);
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        (max + mean * 0.1).min(1.0)
    }

    /// 评估 Plan：裁决先写入审计链，再返回给编排器
    pub fn evaluate(&self, plan: &Plan) -> Decision {
        let score = self.plan_score(plan);
        let worst_step = plan
            .steps
            .iter()
            .max_by(|a, b| {
                self.step_score(a)
                    .partial_cmp(&self.step_score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|s| s.id.clone());

        // 中间档的 CONFIRMED 记录在令牌被消费时写入（仍早于任何 Step 下发）
        let decision = if score >= self.config.high_threshold {
            self.audit.append(
                &plan.task_id,
                worst_step.as_deref(),
                "security_gate",
                &format!("evaluate_plan_v{}", plan.version),
                score,
                AuditDecision::Rejected,
            );
            Decision::Rejected { score }
        } else if score >= self.config.low_threshold {
            let token = uuid::Uuid::new_v4().to_string();
            self.tokens.lock().expect("token map poisoned").insert(
                plan.task_id.clone(),
                TokenState {
                    token: token.clone(),
                    issued_at: Instant::now(),
                    used: false,
                    score,
                },
            );
            Decision::RequiresConfirmation { score, token }
        } else {
            self.audit.append(
                &plan.task_id,
                worst_step.as_deref(),
                "security_gate",
                &format!("evaluate_plan_v{}", plan.version),
                score,
                AuditDecision::AutoApproved,
            );
            Decision::AutoApproved { score }
        };

        tracing::info!(
            task_id = %plan.task_id,
            plan_version = plan.version,
            score,
            decision = ?std::mem::discriminant(&decision),
            "Security gate decision"
        );
        decision
    }

    /// 消费确认令牌：单次使用、时间盒内有效
    pub fn confirm(&self, task_id: &str, token: &str) -> Result<(), OrchestratorError> {
        let mut tokens = self.tokens.lock().expect("token map poisoned");
        let state = tokens.get_mut(task_id).ok_or(OrchestratorError::InvalidToken)?;
        let expired = state.issued_at.elapsed()
            > Duration::from_secs(self.config.confirmation_ttl_secs);
        if state.used || expired || state.token != token {
            return Err(OrchestratorError::InvalidToken);
        }
        state.used = true;
        self.audit.append(
            task_id,
            None,
            "security_gate",
            "confirm_plan",
            state.score,
            AuditDecision::Confirmed,
        );
        Ok(())
    }

    pub fn confirmation_ttl(&self) -> Duration {
        Duration::from_secs(self.config.confirmation_ttl_secs)
    }
}
