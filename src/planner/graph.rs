//! Step 依赖图
//!
//! 邻接表 + 入度表实现 Kahn 拓扑排序：环检测、就绪集计算与完成推进。

use std::collections::HashMap;

use crate::planner::types::{PlanError, Step, StepId};

/// Step 依赖图
pub struct PlanGraph {
    /// 邻接表：Step ID -> 依赖该步的后继列表
    adjacency: HashMap<StepId, Vec<StepId>>,
    /// 入度表：Step ID -> 未完成的依赖数
    in_degree: HashMap<StepId, usize>,
}

impl PlanGraph {
    /// 从 Step 列表构建依赖图；未知依赖直接报错
    pub fn new(steps: &[Step]) -> Result<Self, PlanError> {
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();

        for step in steps {
            adjacency.entry(step.id.clone()).or_default();
            in_degree.entry(step.id.clone()).or_insert(0);
        }

        for step in steps {
            for dep in &step.depends_on {
                if !in_degree.contains_key(dep) {
                    return Err(PlanError::UnknownDependency(step.id.clone(), dep.clone()));
                }
                adjacency.entry(dep.clone()).or_default().push(step.id.clone());
                *in_degree.entry(step.id.clone()).or_insert(0) += 1;
            }
        }

        Ok(Self { adjacency, in_degree })
    }

    /// Kahn 拓扑排序；处理不完全部节点说明存在环
    pub fn topological_order(&self) -> Result<Vec<StepId>, PlanError> {
        let mut in_degree = self.in_degree.clone();
        let mut queue: Vec<StepId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| id.clone())
            .collect();
        // 排序保证确定性输出
        queue.sort();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(id) = queue.pop() {
            order.push(id.clone());
            if let Some(dependents) = self.adjacency.get(&id) {
                for dep in dependents {
                    let degree = in_degree.get_mut(dep).expect("dependent in degree map");
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push(dep.clone());
                        queue.sort();
                    }
                }
            }
        }

        if order.len() != in_degree.len() {
            let cyclic: Vec<_> = in_degree
                .iter()
                .filter(|(id, _)| !order.contains(id))
                .map(|(id, _)| id.clone())
                .collect();
            return Err(PlanError::Cycle(cyclic.join(", ")));
        }
        Ok(order)
    }

    /// 当前就绪的 Step（入度为 0 且不在 done 中）
    pub fn ready(&self, done: &std::collections::HashSet<StepId>) -> Vec<StepId> {
        let mut ready: Vec<StepId> = self
            .in_degree
            .iter()
            .filter(|(id, degree)| **degree == 0 && !done.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();
        ready.sort();
        ready
    }

    /// 标记完成，返回新就绪的后继
    pub fn mark_completed(&mut self, completed: &StepId) -> Vec<StepId> {
        let mut newly_ready = Vec::new();
        if let Some(dependents) = self.adjacency.get(completed).cloned() {
            for dep in dependents {
                if let Some(degree) = self.in_degree.get_mut(&dep) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        newly_ready.push(dep);
                    }
                }
            }
        }
        // 完成节点从就绪集中排除
        self.in_degree.remove(completed);
        newly_ready.sort();
        newly_ready
    }
}
