//! 任务租约：带 TTL 的独占执行权
//!
//! 同一 taskId 并发抢租约时恰有一个成功，保证水平扩容下的至多一次活跃执行；
//! 过期租约可被回收，任务从最后持久化的状态恢复。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::core::{OrchestratorError, TaskId};

/// 持有者标识 -> 到期时间
struct Lease {
    holder: String,
    expires_at: Instant,
}

/// 租约管理器：acquire / renew / release，过期自动可回收
pub struct LeaseManager {
    leases: Mutex<HashMap<TaskId, Lease>>,
    ttl: Duration,
}

impl LeaseManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// 尝试获取租约；已被未过期的其他持有者占用时返回 LeaseHeld
    pub fn acquire(&self, task_id: &str, holder: &str) -> Result<(), OrchestratorError> {
        let mut leases = self.leases.lock().expect("lease map poisoned");
        let now = Instant::now();
        match leases.get(task_id) {
            Some(lease) if lease.expires_at > now && lease.holder != holder => {
                Err(OrchestratorError::LeaseHeld(task_id.to_string()))
            }
            _ => {
                // 过期租约在此被回收
                leases.insert(
                    task_id.to_string(),
                    Lease {
                        holder: holder.to_string(),
                        expires_at: now + self.ttl,
                    },
                );
                Ok(())
            }
        }
    }

    /// 续约：仅当前持有者可续，任务非终态期间定期调用
    pub fn renew(&self, task_id: &str, holder: &str) -> Result<(), OrchestratorError> {
        let mut leases = self.leases.lock().expect("lease map poisoned");
        match leases.get_mut(task_id) {
            Some(lease) if lease.holder == holder => {
                lease.expires_at = Instant::now() + self.ttl;
                Ok(())
            }
            _ => Err(OrchestratorError::LeaseHeld(task_id.to_string())),
        }
    }

    /// 释放租约（任务进入终态时）
    pub fn release(&self, task_id: &str, holder: &str) {
        let mut leases = self.leases.lock().expect("lease map poisoned");
        if let Some(lease) = leases.get(task_id) {
            if lease.holder == holder {
                leases.remove(task_id);
            }
        }
    }

    /// 当前是否被有效持有（测试与健康检查用）
    pub fn is_held(&self, task_id: &str) -> bool {
        let leases = self.leases.lock().expect("lease map poisoned");
        leases
            .get(task_id)
            .map(|l| l.expires_at > Instant::now())
            .unwrap_or(false)
    }
}
