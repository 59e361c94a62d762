//! 学习智能体：执行结果与人工反馈的回路
//!
//! 按 (动作类别, 敏感级) 维护有界 EMA 失败率，导出安全门使用的风险乘数。
//! 权重修订受窗口限速（同一类对每窗口至多修订一次），防止单点异常震荡；
//! 原始观测与反馈永不被覆盖，只追加。

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::LearningSection;
use crate::planner::{ActionCategory, Sensitivity};

/// 乘数边界：学习信号能收紧或放宽评分，但幅度有界
const MULTIPLIER_MIN: f64 = 0.5;
const MULTIPLIER_MAX: f64 = 1.5;
/// 无历史时的失败率基线，对应中性乘数 1.0
const BASELINE_FAILURE: f64 = 0.25;

/// 人工反馈（1..=5 评分）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub task_id: String,
    pub rating: u8,
    pub notes: Option<String>,
    /// 毫秒时间戳
    pub timestamp: i64,
}

/// 单条原始观测（追加式历史）
#[derive(Debug, Clone)]
struct Observation {
    success: bool,
    timestamp: i64,
}

struct ClassState {
    ema_failure: f64,
    /// 上次权重修订的毫秒时间戳
    last_revision: i64,
    history: Vec<Observation>,
}

#[derive(Default)]
struct LearningInner {
    classes: HashMap<(ActionCategory, Sensitivity), ClassState>,
    feedback: Vec<FeedbackRecord>,
}

/// 学习引擎
pub struct LearningEngine {
    config: LearningSection,
    inner: Mutex<LearningInner>,
}

impl LearningEngine {
    pub fn new(config: LearningSection) -> Self {
        Self {
            config,
            inner: Mutex::new(LearningInner::default()),
        }
    }

    /// 当前风险乘数（有界 [0.5, 1.5]，无历史时为 1.0）
    pub fn multiplier(&self, category: ActionCategory, sensitivity: Sensitivity) -> f64 {
        let inner = self.inner.lock().expect("learning state poisoned");
        let ema = inner
            .classes
            .get(&(category, sensitivity))
            .map(|s| s.ema_failure)
            .unwrap_or(BASELINE_FAILURE);
        (1.0 + (ema - BASELINE_FAILURE) * 2.0).clamp(MULTIPLIER_MIN, MULTIPLIER_MAX)
    }

    /// 记录一次执行结果；EMA 修订受窗口限速，原始历史总是追加
    pub fn observe_outcome(&self, category: ActionCategory, sensitivity: Sensitivity, success: bool) {
        let now = chrono::Utc::now().timestamp_millis();
        let mut inner = self.inner.lock().expect("learning state poisoned");
        let state = inner
            .classes
            .entry((category, sensitivity))
            .or_insert_with(|| ClassState {
                ema_failure: BASELINE_FAILURE,
                last_revision: i64::MIN,
                history: Vec::new(),
            });
        state.history.push(Observation { success, timestamp: now });

        let window = self.config.revision_window_ms as i64;
        if now.saturating_sub(state.last_revision) < window {
            tracing::debug!(%category, "Weight revision suppressed by rate limit");
            return;
        }
        let observed_failure = if success { 0.0 } else { 1.0 };
        state.ema_failure = self.config.ema_alpha * observed_failure
            + (1.0 - self.config.ema_alpha) * state.ema_failure;
        state.last_revision = now;
    }

    /// 记录人工反馈并按 Plan 涉及的类别折算为成败信号（评分 >= 3 视为正向）
    pub fn record_feedback(
        &self,
        record: FeedbackRecord,
        classes: &[(ActionCategory, Sensitivity)],
    ) {
        let positive = record.rating >= 3;
        {
            let mut inner = self.inner.lock().expect("learning state poisoned");
            inner.feedback.push(record);
        }
        for &(category, sensitivity) in classes {
            self.observe_outcome(category, sensitivity, positive);
        }
    }

    pub fn feedback_for(&self, task_id: &str) -> Vec<FeedbackRecord> {
        let inner = self.inner.lock().expect("learning state poisoned");
        inner
            .feedback
            .iter()
            .filter(|f| f.task_id == task_id)
            .cloned()
            .collect()
    }

    #[cfg(test)]
    fn history_len(&self, category: ActionCategory, sensitivity: Sensitivity) -> usize {
        let inner = self.inner.lock().expect("learning state poisoned");
        inner
            .classes
            .get(&(category, sensitivity))
            .map(|s| s.history.len())
            .unwrap_or(0)
    }
}
