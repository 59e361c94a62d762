//! 哈希链审计日志
//!
//! 追加式记录：每条 AuditEntry 内嵌前一条的哈希，verify 重算整条链，
//! 任何一环不匹配即失败关闭（fail closed）。可选 JSONL 文件持久化。

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// 创世哈希：链上第一条记录的 prev_hash
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// 审计裁决
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditDecision {
    AutoApproved,
    Confirmed,
    Rejected,
}

/// 审计记录：安全门与执行智能体写入，追加后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// 链内序号
    pub sequence: u64,
    pub task_id: String,
    pub step_id: Option<String>,
    /// 写入方（security_gate / executor）
    pub actor: String,
    pub action: String,
    pub risk_score: f64,
    pub decision: AuditDecision,
    /// 毫秒时间戳
    pub timestamp: i64,
    /// 前一条记录的哈希
    pub prev_hash: String,
    /// 本条内容哈希（不含自身 hash 字段）
    pub hash: String,
}

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Chain broken at sequence {0}: hash mismatch")]
    ChainBroken(u64),
    #[error("Audit persistence failed: {0}")]
    Io(#[from] std::io::Error),
}

/// 对除 hash 外的全部字段做稳定序列化后取 SHA-256
fn entry_hash(entry: &AuditEntry) -> String {
    let mut hasher = Sha256::new();
    hasher.update(entry.sequence.to_be_bytes());
    hasher.update(entry.task_id.as_bytes());
    if let Some(step) = &entry.step_id {
        hasher.update(step.as_bytes());
    }
    hasher.update(entry.actor.as_bytes());
    hasher.update(entry.action.as_bytes());
    hasher.update(entry.risk_score.to_be_bytes());
    hasher.update(format!("{:?}", entry.decision).as_bytes());
    hasher.update(entry.timestamp.to_be_bytes());
    hasher.update(entry.prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

/// 审计日志：单写者追加（链增长由互斥锁串行化，跨实例由任务租约保证）
pub struct AuditLog {
    inner: Mutex<Vec<AuditEntry>>,
    /// JSONL 持久化路径，None 时仅内存
    file_path: Option<PathBuf>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            file_path: None,
        }
    }

    /// 启用 JSONL 文件持久化（追加式布局，每行一条内嵌前哈希的记录）
    pub fn with_file(path: impl AsRef<Path>) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            file_path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// 追加一条记录，返回其序号
    pub fn append(
        &self,
        task_id: &str,
        step_id: Option<&str>,
        actor: &str,
        action: &str,
        risk_score: f64,
        decision: AuditDecision,
    ) -> u64 {
        let mut chain = self.inner.lock().expect("audit chain poisoned");
        let prev_hash = chain
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let mut entry = AuditEntry {
            sequence: chain.len() as u64,
            task_id: task_id.to_string(),
            step_id: step_id.map(|s| s.to_string()),
            actor: actor.to_string(),
            action: action.to_string(),
            risk_score,
            decision,
            timestamp: chrono::Utc::now().timestamp_millis(),
            prev_hash,
            hash: String::new(),
        };
        entry.hash = entry_hash(&entry);

        if let Some(path) = &self.file_path {
            if let Err(e) = append_line(path, &entry) {
                tracing::warn!("Audit persistence failed: {}", e);
            }
        }

        let seq = entry.sequence;
        chain.push(entry);
        seq
    }

    /// 校验整条链：重算每条哈希并比对链接，任何不匹配返回 ChainBroken
    pub fn verify(&self) -> Result<(), AuditError> {
        let chain = self.inner.lock().expect("audit chain poisoned");
        let mut prev = GENESIS_HASH.to_string();
        for entry in chain.iter() {
            if entry.prev_hash != prev || entry_hash(entry) != entry.hash {
                return Err(AuditError::ChainBroken(entry.sequence));
            }
            prev = entry.hash.clone();
        }
        Ok(())
    }

    /// 按任务过滤的记录副本
    pub fn entries_for(&self, task_id: &str) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .expect("audit chain poisoned")
            .iter()
            .filter(|e| e.task_id == task_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("audit chain poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn tamper(&self, sequence: u64, action: &str) {
        let mut chain = self.inner.lock().unwrap();
        chain[sequence as usize].action = action.to_string();
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

fn append_line(path: &Path, entry: &AuditEntry) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let line = serde_json::to_string(entry)?;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")
}
