//! Bounded-parallel DAG scheduler
//!
//! Ready nodes are dispatched greedily (highest weight first, then plan
//! order) onto at most `max_workers` tasks. A node is ready once every hard
//! and soft dependency is terminal; a hard dependency that did not succeed
//! skips the node as `dependency_failed`. The timebox and an external abort
//! both cancel in-flight jobs cooperatively and stop dispatch; results of
//! finished nodes are kept.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::channel::mpsc;
use serde::Serialize;
use serde_json::json;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use super::graph::Dag;
use crate::audit::{AuditLog, events};
use crate::domain::{ExecutionResult, ExecutionStatus};
use crate::sandbox::{CancelToken, MemoryBudget};

pub const SKIP_DEPENDENCY_FAILED: &str = "dependency_failed";
pub const SKIP_TIMEBOX_EXCEEDED: &str = "timebox_exceeded";
pub const SKIP_ABORTED: &str = "aborted";

/// Terminal (or not yet terminal) state of a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Running,
    Succeeded,
    Failed { reason: String },
    Unreachable,
    TimedOut,
    Cancelled,
    Skipped { reason: String },
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Running => "running",
            NodeState::Succeeded => "succeeded",
            NodeState::Failed { .. } => "failed",
            NodeState::Unreachable => "unreachable",
            NodeState::TimedOut => "timed_out",
            NodeState::Cancelled => "cancelled",
            NodeState::Skipped { .. } => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeState::Pending | NodeState::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, NodeState::Succeeded)
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        NodeState::Skipped {
            reason: reason.into(),
        }
    }
}

impl From<&ExecutionStatus> for NodeState {
    fn from(status: &ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Succeeded { .. } => NodeState::Succeeded,
            ExecutionStatus::Failed { exit_code } => NodeState::Failed {
                reason: format!("exit code {}", exit_code),
            },
            ExecutionStatus::Unreachable { .. } => NodeState::Unreachable,
            ExecutionStatus::TimedOut => NodeState::TimedOut,
            ExecutionStatus::Cancelled => NodeState::Cancelled,
            ExecutionStatus::LaunchFailed { reason } => NodeState::Failed {
                reason: format!("launch failed: {}", reason),
            },
        }
    }
}

/// What an executor reports back for one node
#[derive(Debug, Clone)]
pub struct NodeRun {
    pub state: NodeState,
    pub result: Option<ExecutionResult>,
}

impl NodeRun {
    /// State derived from the sandbox status
    pub fn from_result(result: ExecutionResult) -> Self {
        Self {
            state: NodeState::from(&result.status),
            result: Some(result),
        }
    }

    pub fn failed(result: ExecutionResult, reason: impl Into<String>) -> Self {
        Self {
            state: NodeState::Failed {
                reason: reason.into(),
            },
            result: Some(result),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            state: NodeState::skipped(reason),
            result: None,
        }
    }
}

/// Outcome of one node, as streamed to the caller
#[derive(Debug, Clone)]
pub struct NodeReport {
    pub id: String,
    pub state: NodeState,
    pub result: Option<Arc<ExecutionResult>>,
    pub duration: Duration,
}

/// What a running node sees of the graph
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub cancel: CancelToken,
    /// Reports of this node's (terminal) dependencies
    pub dependencies: Vec<NodeReport>,
}

/// Runs one node. Implemented by the kernel on top of the Governor and a
/// sandbox runner, and by fakes in tests.
#[async_trait]
pub trait NodeExecutor: Send + Sync + 'static {
    /// Memory the node's job will reserve
    fn memory_mb(&self, _node: &str) -> u64 {
        0
    }

    async fn run(&self, node: &str, ctx: NodeContext) -> NodeRun;
}

/// Final state of a schedule
#[derive(Debug, Clone)]
pub struct ScheduleSummary {
    pub reports: Vec<NodeReport>,
    pub timed_out: bool,
    pub aborted: bool,
    pub elapsed: Duration,
}

impl ScheduleSummary {
    pub fn report(&self, id: &str) -> Option<&NodeReport> {
        self.reports.iter().find(|r| r.id == id)
    }
}

pub type ReportStream = mpsc::UnboundedReceiver<NodeReport>;

#[derive(Debug, Clone)]
pub struct Scheduler {
    max_workers: usize,
    timebox: Duration,
    cancel: CancelToken,
    budget: Option<MemoryBudget>,
    audit: Option<Arc<AuditLog>>,
}

impl Scheduler {
    pub fn new(max_workers: usize, timebox: Duration) -> Self {
        Self {
            max_workers: max_workers.max(1),
            timebox,
            cancel: CancelToken::new(),
            budget: None,
            audit: None,
        }
    }

    /// Share an abort signal with the caller
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_budget(mut self, budget: MemoryBudget) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Start executing `dag`. Node reports arrive on the stream as nodes
    /// reach a terminal state; the handle resolves to the full summary.
    pub fn schedule(self, dag: Dag, executor: Arc<dyn NodeExecutor>) -> (ReportStream, JoinHandle<ScheduleSummary>) {
        let (tx, rx) = mpsc::unbounded();
        let handle = tokio::spawn(Run::new(self, dag, executor, tx).drive());
        (rx, handle)
    }
}

struct Run {
    scheduler: Scheduler,
    dag: Dag,
    executor: Arc<dyn NodeExecutor>,
    tx: mpsc::UnboundedSender<NodeReport>,
    states: Vec<NodeState>,
    reports: Vec<Option<NodeReport>>,
}

impl Run {
    fn new(scheduler: Scheduler, dag: Dag, executor: Arc<dyn NodeExecutor>, tx: mpsc::UnboundedSender<NodeReport>) -> Self {
        let n = dag.len();
        Self {
            scheduler,
            dag,
            executor,
            tx,
            states: vec![NodeState::Pending; n],
            reports: vec![None; n],
        }
    }

    fn audit(&self) -> Option<&AuditLog> {
        self.scheduler.audit.as_deref()
    }

    fn finish(&mut self, idx: usize, state: NodeState, result: Option<ExecutionResult>, duration: Duration) {
        let report = NodeReport {
            id: self.dag.node(idx).id.clone(),
            state: state.clone(),
            result: result.map(Arc::new),
            duration,
        };
        self.states[idx] = state;
        // The receiver may have been dropped; the summary still has everything
        let _ = self.tx.unbounded_send(report.clone());
        self.reports[idx] = Some(report);
    }

    fn skip(&mut self, idx: usize, reason: &str, detail: serde_json::Value) {
        if let Some(audit) = self.audit() {
            audit.warn(
                events::NODE_SKIPPED,
                json!({"plugin": self.dag.node(idx).id, "reason": reason, "detail": detail}),
            );
        }
        self.finish(idx, NodeState::skipped(reason), None, Duration::ZERO);
    }

    /// Skip pending nodes whose hard dependencies failed, to a fixpoint.
    /// Returns the ready node indices, best first.
    fn ready_nodes(&mut self) -> Vec<usize> {
        loop {
            let mut changed = false;
            for idx in 0..self.dag.len() {
                if self.states[idx] != NodeState::Pending {
                    continue;
                }
                let failed_dep = self
                    .dag
                    .node(idx)
                    .hard_deps
                    .iter()
                    .find(|d| self.states[**d].is_terminal() && !self.states[**d].is_success())
                    .map(|d| self.dag.node(*d).id.clone());
                if let Some(dep) = failed_dep {
                    self.skip(idx, SKIP_DEPENDENCY_FAILED, json!({"dependency": dep}));
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut ready: Vec<usize> = (0..self.dag.len())
            .filter(|&idx| {
                self.states[idx] == NodeState::Pending
                    && self
                        .dag
                        .node(idx)
                        .all_deps()
                        .all(|d| self.states[d].is_terminal())
            })
            .collect();
        ready.sort_by(|a, b| {
            self.dag
                .node(*b)
                .weight
                .partial_cmp(&self.dag.node(*a).weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(b))
        });
        ready
    }

    async fn drive(mut self) -> ScheduleSummary {
        let started = Instant::now();
        let deadline = started + self.scheduler.timebox;
        let cancel = self.scheduler.cancel.clone();
        let mut join: JoinSet<(usize, NodeRun, Duration)> = JoinSet::new();
        let mut stopping = false;
        let mut timed_out = false;
        let mut aborted = cancel.is_cancelled();
        if aborted {
            stopping = true;
        }

        loop {
            if !stopping {
                for idx in self.ready_nodes() {
                    if join.len() >= self.scheduler.max_workers {
                        break;
                    }
                    let id = self.dag.node(idx).id.clone();
                    let reservation = match &self.scheduler.budget {
                        Some(budget) => match budget.try_reserve(self.executor.memory_mb(&id)) {
                            Some(r) => Some(r),
                            // Stays pending until running jobs release memory
                            None => continue,
                        },
                        None => None,
                    };

                    let dependencies: Vec<NodeReport> = self
                        .dag
                        .node(idx)
                        .all_deps()
                        .filter_map(|d| self.reports[d].clone())
                        .collect();
                    let ctx = NodeContext {
                        cancel: cancel.clone(),
                        dependencies,
                    };
                    self.states[idx] = NodeState::Running;
                    tracing::debug!("Dispatching {}", id);

                    let executor = self.executor.clone();
                    join.spawn(async move {
                        let node_started = Instant::now();
                        let run = AssertUnwindSafe(executor.run(&id, ctx))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| NodeRun {
                                state: NodeState::Failed {
                                    reason: "executor panicked".to_string(),
                                },
                                result: None,
                            });
                        drop(reservation);
                        (idx, run, node_started.elapsed())
                    });
                }
            }

            if join.is_empty() {
                break;
            }

            tokio::select! {
                joined = join.join_next() => {
                    if let Some(Ok((idx, run, duration))) = joined {
                        if let (NodeState::Cancelled | NodeState::TimedOut, Some(audit)) = (&run.state, self.audit()) {
                            if stopping {
                                audit.warn(events::JOB_CANCELLED, json!({"plugin": self.dag.node(idx).id}));
                            }
                        }
                        self.finish(idx, run.state, run.result, duration);
                    } else if let Some(Err(e)) = joined {
                        // Tasks catch their own panics; this only happens on runtime shutdown
                        tracing::error!("Scheduler task failed: {}", e);
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !stopping => {
                    stopping = true;
                    timed_out = true;
                    tracing::warn!("Timebox of {}s exceeded, cancelling running jobs", self.scheduler.timebox.as_secs());
                    if let Some(audit) = self.audit() {
                        audit.error(
                            events::TIMEBOX_EXCEEDED,
                            json!({"timebox_seconds": self.scheduler.timebox.as_secs(), "running": join.len()}),
                        );
                    }
                    cancel.cancel();
                }
                _ = cancel.cancelled(), if !stopping => {
                    stopping = true;
                    aborted = true;
                    tracing::warn!("Run aborted, cancelling running jobs");
                }
            }
        }

        // Anything never dispatched is recorded, never silently dropped
        let reason = if timed_out { SKIP_TIMEBOX_EXCEEDED } else { SKIP_ABORTED };
        for idx in 0..self.dag.len() {
            if matches!(self.states[idx], NodeState::Pending | NodeState::Running) {
                self.skip(idx, reason, serde_json::Value::Null);
            }
        }

        ScheduleSummary {
            reports: self.reports.into_iter().flatten().collect(),
            timed_out,
            aborted: aborted && !timed_out,
            elapsed: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Plan, PlanEntry};
    use futures::StreamExt;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Sleeps for a per-node duration unless cancelled
    struct Scripted {
        durations: HashMap<String, Duration>,
        failing: Vec<String>,
        log: Mutex<Vec<(String, &'static str, Instant)>>,
        in_flight: Mutex<(usize, usize)>,
    }

    impl Scripted {
        fn new(durations: &[(&str, u64)], failing: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                durations: durations
                    .iter()
                    .map(|(id, secs)| (id.to_string(), Duration::from_secs(*secs)))
                    .collect(),
                failing: failing.iter().map(|s| s.to_string()).collect(),
                log: Mutex::new(Vec::new()),
                in_flight: Mutex::new((0, 0)),
            })
        }

        fn events(&self) -> Vec<(String, &'static str, Instant)> {
            self.log.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl NodeExecutor for Scripted {
        async fn run(&self, node: &str, ctx: NodeContext) -> NodeRun {
            self.log.lock().unwrap().push((node.to_string(), "start", Instant::now()));
            {
                let mut f = self.in_flight.lock().unwrap();
                f.0 += 1;
                f.1 = f.1.max(f.0);
            }
            let wait = self.durations.get(node).copied().unwrap_or(Duration::from_secs(1));
            let status = tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    if self.failing.iter().any(|f| f == node) {
                        ExecutionStatus::Failed { exit_code: 1 }
                    } else {
                        ExecutionStatus::Succeeded { exit_code: 0 }
                    }
                }
                _ = ctx.cancel.cancelled() => ExecutionStatus::Cancelled,
            };
            self.in_flight.lock().unwrap().0 -= 1;
            self.log.lock().unwrap().push((node.to_string(), "end", Instant::now()));
            NodeRun::from_result(ExecutionResult::new(node, status, wait))
        }
    }

    fn dag(entries: Vec<PlanEntry>) -> Dag {
        Dag::compile(&Plan {
            plugins: entries,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn dependents_start_after_dependencies_finish() {
        let exec = Scripted::new(&[("recon", 5), ("zap", 2), ("axe", 1), ("nuclei", 1)], &[]);
        let graph = dag(vec![
            PlanEntry::new("recon"),
            PlanEntry::new("axe"),
            PlanEntry::new("zap").depends_on("recon"),
            PlanEntry::new("nuclei").soft_depends_on("zap").depends_on("recon"),
        ]);
        let (stream, handle) = Scheduler::new(4, Duration::from_secs(600)).schedule(graph.clone(), exec.clone());
        let streamed: Vec<NodeReport> = stream.collect().await;
        let summary = handle.await.unwrap();

        assert_eq!(streamed.len(), 4);
        assert!(summary.reports.iter().all(|r| r.state.is_success()));
        let events = exec.events();
        let at = |id: &str, kind: &str| events.iter().find(|e| e.0 == id && e.1 == kind).unwrap().2;
        for node in graph.nodes() {
            for dep in graph.dependencies_of(&node.id) {
                assert!(at(dep, "end") <= at(&node.id, "start"), "{} started before {}", node.id, dep);
            }
        }
        // recon and axe ran in parallel
        assert_eq!(at("recon", "start"), at("axe", "start"));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_failure_skips_dependents_but_not_siblings() {
        let exec = Scripted::new(&[], &["recon"]);
        let graph = dag(vec![
            PlanEntry::new("recon"),
            PlanEntry::new("zap").depends_on("recon"),
            PlanEntry::new("nuclei").depends_on("zap"),
            PlanEntry::new("lighthouse").soft_depends_on("recon"),
            PlanEntry::new("axe"),
        ]);
        let audit = Arc::new(AuditLog::in_memory("run_abc"));
        let (_stream, handle) = Scheduler::new(2, Duration::from_secs(600))
            .with_audit(audit.clone())
            .schedule(graph, exec);
        let summary = handle.await.unwrap();

        assert!(matches!(summary.report("recon").unwrap().state, NodeState::Failed { .. }));
        assert_eq!(summary.report("zap").unwrap().state, NodeState::skipped(SKIP_DEPENDENCY_FAILED));
        assert_eq!(summary.report("nuclei").unwrap().state, NodeState::skipped(SKIP_DEPENDENCY_FAILED));
        assert!(summary.report("lighthouse").unwrap().state.is_success());
        assert!(summary.report("axe").unwrap().state.is_success());
        assert_eq!(audit.count(events::NODE_SKIPPED), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_workers() {
        let exec = Scripted::new(&[], &[]);
        let graph = dag((0..8).map(|i| PlanEntry::new(format!("p{}", i))).collect());
        let (_stream, handle) = Scheduler::new(3, Duration::from_secs(600)).schedule(graph, exec.clone());
        handle.await.unwrap();
        assert_eq!(exec.in_flight.lock().unwrap().1, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn timebox_cancels_running_jobs_and_keeps_completed_results() {
        let exec = Scripted::new(&[("fast", 10), ("slow", 700), ("after", 1)], &[]);
        let graph = dag(vec![
            PlanEntry::new("fast"),
            PlanEntry::new("slow"),
            PlanEntry::new("after").depends_on("slow"),
        ]);
        let audit = Arc::new(AuditLog::in_memory("run_abc"));
        let (_stream, handle) = Scheduler::new(4, Duration::from_secs(600))
            .with_audit(audit.clone())
            .schedule(graph, exec);
        let summary = handle.await.unwrap();

        assert!(summary.timed_out);
        assert!(summary.report("fast").unwrap().state.is_success());
        assert!(summary.report("fast").unwrap().result.is_some());
        assert_eq!(summary.report("slow").unwrap().state, NodeState::Cancelled);
        assert_eq!(summary.report("after").unwrap().state, NodeState::skipped(SKIP_TIMEBOX_EXCEEDED));
        assert!(summary.elapsed < Duration::from_secs(700));
        assert_eq!(audit.count(events::TIMEBOX_EXCEEDED), 1);
        assert_eq!(audit.count(events::JOB_CANCELLED), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn external_abort_is_idempotent() {
        let exec = Scripted::new(&[("a", 100), ("b", 100)], &[]);
        let graph = dag(vec![PlanEntry::new("a"), PlanEntry::new("b").depends_on("a")]);
        let scheduler = Scheduler::new(1, Duration::from_secs(600));
        let cancel = scheduler.cancel_token();
        let (_stream, handle) = scheduler.schedule(graph, exec);
        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();
        cancel.cancel();
        let summary = handle.await.unwrap();
        assert!(summary.aborted);
        assert!(!summary.timed_out);
        assert_eq!(summary.report("a").unwrap().state, NodeState::Cancelled);
        assert!(matches!(summary.report("b").unwrap().state, NodeState::Skipped { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn memory_budget_limits_concurrency() {
        struct Heavy(Arc<Scripted>);

        #[async_trait]
        impl NodeExecutor for Heavy {
            fn memory_mb(&self, _node: &str) -> u64 {
                600
            }

            async fn run(&self, node: &str, ctx: NodeContext) -> NodeRun {
                self.0.run(node, ctx).await
            }
        }

        let inner = Scripted::new(&[], &[]);
        let graph = dag(vec![PlanEntry::new("a"), PlanEntry::new("b"), PlanEntry::new("c")]);
        let (_stream, handle) = Scheduler::new(3, Duration::from_secs(600))
            .with_budget(MemoryBudget::new(1024))
            .schedule(graph, Arc::new(Heavy(inner.clone())));
        let summary = handle.await.unwrap();
        assert!(summary.reports.iter().all(|r| r.state.is_success()));
        assert_eq!(inner.in_flight.lock().unwrap().1, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn smaller_jobs_fill_memory_left_by_an_oversized_one() {
        struct Mixed(Arc<Scripted>);

        #[async_trait]
        impl NodeExecutor for Mixed {
            fn memory_mb(&self, node: &str) -> u64 {
                if node == "small" { 200 } else { 600 }
            }

            async fn run(&self, node: &str, ctx: NodeContext) -> NodeRun {
                self.0.run(node, ctx).await
            }
        }

        let inner = Scripted::new(&[("a", 5), ("big", 5), ("small", 1)], &[]);
        let graph = dag(vec![PlanEntry::new("a"), PlanEntry::new("big"), PlanEntry::new("small")]);
        let (_stream, handle) = Scheduler::new(3, Duration::from_secs(600))
            .with_budget(MemoryBudget::new(1024))
            .schedule(graph, Arc::new(Mixed(inner.clone())));
        let summary = handle.await.unwrap();
        assert!(summary.reports.iter().all(|r| r.state.is_success()));

        let events = inner.events();
        let at = |id: &str, kind: &str| events.iter().find(|e| e.0 == id && e.1 == kind).unwrap().2;
        assert_eq!(at("small", "start"), at("a", "start"));
        assert!(at("big", "start") >= at("a", "end"));
    }
}
