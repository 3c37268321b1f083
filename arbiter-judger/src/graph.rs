//! Task-graph validation and the precomputed child lists.
//!
//! The graph is implicit in the task list: each task names at most one
//! earlier task as its predecessor, so the structure is a forest and
//! acyclic by construction once forward references are rejected.

use arbiter_protocol::JudgeTask;

use anyhow::Result;

pub struct TaskGraph {
    children: Vec<Vec<usize>>,
    roots: Vec<usize>,
}

pub fn build(tasks: &[JudgeTask]) -> Result<TaskGraph> {
    let mut children = vec![Vec::new(); tasks.len()];
    let mut roots = Vec::new();

    for (index, task) in tasks.iter().enumerate() {
        match task.depends_on {
            None => roots.push(index),
            Some(dep) => {
                if dep >= tasks.len() {
                    anyhow::bail!("task {}: depends_on {} is out of range", index, dep);
                }
                if dep == index {
                    anyhow::bail!("task {}: depends on itself", index);
                }
                if dep > index {
                    anyhow::bail!(
                        "task {}: forward reference to task {} is not allowed",
                        index,
                        dep
                    );
                }
                children[dep].push(index);
            }
        }
    }

    Ok(TaskGraph { children, roots })
}

impl TaskGraph {
    pub fn children(&self, index: usize) -> &[usize] {
        &self.children[index]
    }

    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}
