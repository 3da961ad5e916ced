//! Schedulers that execute create-tile task graphs.
//!
//! [`InlineScheduler`] runs a graph as soon as it is submitted.
//! [`FrameScheduler`] queues graphs submitted from any thread and runs, once
//! per frame, every task whose deadline is due plus a budget of prefetch
//! tasks. In both, CPU tasks of one dependency wave may run in parallel and
//! GPU tasks run on the calling (render) thread, batched per producer between
//! `begin_create_tile` and `end_create_tile`.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::graph::{TaskGraph, TaskNode};
use crate::producer::{Producer, TaskOutcome};

/// Accepts task graphs for execution.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, graph: TaskGraph);
}

/// Counts of task outcomes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub done: usize,
    pub failed: usize,
    /// Not runnable yet or already claimed elsewhere.
    pub skipped: usize,
}

impl RunReport {
    fn record(&mut self, outcome: TaskOutcome) {
        match outcome {
            TaskOutcome::Done => self.done += 1,
            TaskOutcome::Failed => self.failed += 1,
            TaskOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Run every node of a graph in dependency order.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn run_graph(graph: &TaskGraph, parallel: bool) -> RunReport {
    let mut report = RunReport::default();
    let nodes = graph.nodes();
    for wave in graph.waves() {
        let (gpu, cpu): (Vec<&TaskNode>, Vec<&TaskNode>) =
            wave.iter().map(|&i| &nodes[i]).partition(|n| n.gpu);

        let outcomes: Vec<TaskOutcome> = if parallel && cpu.len() > 1 {
            cpu.par_iter()
                .map(|n| n.producer.execute(&n.task))
                .collect()
        } else {
            cpu.iter().map(|n| n.producer.execute(&n.task)).collect()
        };
        outcomes.into_iter().for_each(|o| report.record(o));

        for (producer, batch) in group_by_producer(gpu) {
            if let Err(e) = producer.begin_batch() {
                tracing::error!(producer = %producer.name(), error = %e, "Failed to begin tile batch");
                for node in batch {
                    report.record(producer.fail_task(&node.task, e.to_string()));
                }
                continue;
            }
            for node in batch {
                report.record(producer.execute(&node.task));
            }
            if let Err(e) = producer.end_batch() {
                tracing::error!(producer = %producer.name(), error = %e, "Failed to end tile batch");
            }
        }
    }
    report
}

fn group_by_producer(nodes: Vec<&TaskNode>) -> Vec<(Producer, Vec<&TaskNode>)> {
    let mut groups: Vec<(Producer, Vec<&TaskNode>)> = Vec::new();
    for node in nodes {
        match groups.iter_mut().find(|(p, _)| p.ptr_eq(&node.producer)) {
            Some((_, batch)) => batch.push(node),
            None => groups.push((node.producer.clone(), vec![node])),
        }
    }
    groups
}

/// Runs graphs immediately on the calling thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineScheduler;

impl Scheduler for InlineScheduler {
    fn schedule(&self, graph: TaskGraph) {
        let report = run_graph(&graph, false);
        tracing::trace!(done = report.done, failed = report.failed, "Ran task graph inline");
    }
}

/// Configuration for [`FrameScheduler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of not-yet-due tasks run per frame.
    pub prefetch_budget: usize,
    /// Run independent CPU tasks on the rayon pool.
    pub parallel: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            prefetch_budget: 16,
            parallel: true,
        }
    }
}

impl SchedulerConfig {
    pub const fn with_prefetch_budget(mut self, budget: usize) -> Self {
        self.prefetch_budget = budget;
        self
    }

    pub const fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }
}

/// Queues graphs and runs due tasks once per frame.
pub struct FrameScheduler {
    config: SchedulerConfig,
    submit_tx: Sender<TaskGraph>,
    submit_rx: Receiver<TaskGraph>,
    queue: Mutex<TaskGraph>,
}

impl FrameScheduler {
    /// Create a new frame scheduler.
    pub fn new(config: SchedulerConfig) -> Self {
        let (submit_tx, submit_rx) = channel::unbounded();
        Self {
            config,
            submit_tx,
            submit_rx,
            queue: Mutex::new(TaskGraph::new()),
        }
    }

    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Number of queued tasks, including graphs not yet drained.
    pub fn pending(&self) -> usize {
        self.drain_submissions();
        self.queue.lock().len()
    }

    fn drain_submissions(&self) {
        let mut queue = self.queue.lock();
        while let Ok(graph) = self.submit_rx.try_recv() {
            queue.merge(graph);
        }
        queue.retain_pending();
    }

    /// Run every due task plus up to `prefetch_budget` others.
    ///
    /// A task is due when its deadline is [`Deadline::IMMEDIATE`] or not
    /// after `frame`. Tasks whose dependencies are outside this frame's
    /// selection stay queued.
    ///
    /// [`Deadline::IMMEDIATE`]: crate::task::Deadline::IMMEDIATE
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn run_frame(&self, frame: u32) -> RunReport {
        self.drain_submissions();
        let selected = {
            let mut queue = self.queue.lock();
            let mut selected = queue.split_off(|n| n.task.deadline().is_due(frame));
            if self.config.prefetch_budget > 0 && !queue.is_empty() {
                let mut order: Vec<_> = queue
                    .nodes()
                    .iter()
                    .map(|n| (n.task.deadline(), n.task.id()))
                    .collect();
                order.sort_unstable();
                order.truncate(self.config.prefetch_budget);
                let ids: Vec<_> = order.into_iter().map(|(_, id)| id).collect();
                selected.merge(queue.split_off(|n| ids.contains(&n.task.id())));
            }
            selected
        };

        let report = run_graph(&selected, self.config.parallel);
        if report.done + report.failed > 0 {
            tracing::debug!(
                frame,
                done = report.done,
                failed = report.failed,
                skipped = report.skipped,
                "Ran frame tasks"
            );
        }

        let mut leftover = selected;
        leftover.retain_pending();
        if !leftover.is_empty() {
            self.queue.lock().merge(leftover);
        }
        report
    }
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl Scheduler for FrameScheduler {
    fn schedule(&self, graph: TaskGraph) {
        if graph.is_empty() {
            return;
        }
        // The receiver lives as long as `self`.
        let _ = self.submit_tx.send(graph);
    }
}
