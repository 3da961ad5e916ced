//! Create-tile task graphs as plain values.
//!
//! A graph lists the tasks that must run for some tiles to become ready, in
//! dependency order (every node comes after the nodes it depends on). Edges
//! are derived from the nodes; nothing in a tile or task points back into a
//! graph.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::producer::Producer;
use crate::task::{CreateTileTask, Deadline, TaskId, TaskState};
use crate::tile::Tile;

/// One task of a graph with the producer that runs it.
#[derive(Clone)]
pub struct TaskNode {
    pub task: Arc<CreateTileTask>,
    pub producer: Producer,
    /// Tasks of this graph that must finish first.
    pub dependencies: Vec<TaskId>,
    /// Must run on the render thread.
    pub gpu: bool,
}

/// Tasks to run, in dependency order.
#[derive(Clone, Default)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    index: HashMap<TaskId, usize>,
}

impl TaskGraph {
    /// Create a new, empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// The graph of everything `tile` still waits for.
    pub fn for_tile(tile: &Arc<Tile>) -> Self {
        let mut graph = Self::new();
        graph.add_tile(tile);
        graph
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[TaskNode] {
        &self.nodes
    }

    pub fn contains(&self, task: TaskId) -> bool {
        self.index.contains_key(&task)
    }

    pub fn add_tile(&mut self, tile: &Arc<Tile>) {
        self.add_task(&tile.task());
    }

    /// Add an unfinished task and, before it, its unfinished dependencies.
    ///
    /// Finished tasks and tasks whose start has not completed are left out.
    pub fn add_task(&mut self, task: &Arc<CreateTileTask>) {
        if self.index.contains_key(&task.id()) || task.state() != TaskState::Pending {
            return;
        }
        let Some(producer) = task.producer() else {
            return;
        };
        let mut dependencies = Vec::new();
        for dep in task.dependencies() {
            self.add_task(&dep);
            if self.index.contains_key(&dep.id()) {
                dependencies.push(dep.id());
            }
        }
        let gpu = producer.uses_gpu();
        self.index.insert(task.id(), self.nodes.len());
        self.nodes.push(TaskNode {
            task: Arc::clone(task),
            producer,
            dependencies,
            gpu,
        });
    }

    /// Add every node of `other`.
    pub fn merge(&mut self, other: Self) {
        for node in other.nodes {
            if self.index.contains_key(&node.task.id()) {
                continue;
            }
            self.index.insert(node.task.id(), self.nodes.len());
            self.nodes.push(node);
        }
    }

    /// `(before, after)` pairs: `before` must finish before `after` starts.
    pub fn edges(&self) -> Vec<(TaskId, TaskId)> {
        self.nodes
            .iter()
            .flat_map(|node| node.dependencies.iter().map(|&dep| (dep, node.task.id())))
            .collect()
    }

    /// Earliest deadline of any node.
    pub fn deadline(&self) -> Option<Deadline> {
        self.nodes.iter().map(|n| n.task.deadline()).min()
    }

    /// Group node indices into waves; every node's dependencies are in earlier waves.
    pub fn waves(&self) -> Vec<Vec<usize>> {
        let mut depth = vec![0usize; self.nodes.len()];
        let mut waves: Vec<Vec<usize>> = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            let d = node
                .dependencies
                .iter()
                .filter_map(|dep| self.index.get(dep))
                .map(|&j| depth[j] + 1)
                .max()
                .unwrap_or(0);
            depth[i] = d;
            if waves.len() <= d {
                waves.resize_with(d + 1, Vec::new);
            }
            waves[d].push(i);
        }
        waves
    }

    /// Keep only nodes that have not run, rebuilding the index.
    pub fn retain_pending(&mut self) {
        self.nodes.retain(|n| n.task.state() == TaskState::Pending);
        self.rebuild_index();
    }

    /// Split off the nodes selected by `take`, plus everything they depend on.
    pub fn split_off(&mut self, take: impl Fn(&TaskNode) -> bool) -> Self {
        let mut selected = vec![false; self.nodes.len()];
        for i in (0..self.nodes.len()).rev() {
            if selected[i] || take(&self.nodes[i]) {
                selected[i] = true;
                for dep in &self.nodes[i].dependencies {
                    if let Some(&j) = self.index.get(dep) {
                        selected[j] = true;
                    }
                }
            }
        }
        let mut taken = Self::new();
        let mut kept = Vec::new();
        for (node, sel) in std::mem::take(&mut self.nodes).into_iter().zip(selected) {
            if sel {
                taken.index.insert(node.task.id(), taken.nodes.len());
                taken.nodes.push(node);
            } else {
                kept.push(node);
            }
        }
        self.nodes = kept;
        self.rebuild_index();
        taken
    }

    fn rebuild_index(&mut self) {
        self.index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.task.id(), i))
            .collect();
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("nodes", &self.nodes.len())
            .field("edges", &self.edges())
            .finish()
    }
}
