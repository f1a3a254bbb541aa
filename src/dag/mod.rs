//! DAG engine: plan compilation and bounded-parallel scheduling

mod graph;
mod scheduler;

pub use graph::{Dag, DagNode, PlanError};
pub use scheduler::{
    NodeContext, NodeExecutor, NodeReport, NodeRun, NodeState, ReportStream, SKIP_ABORTED,
    SKIP_DEPENDENCY_FAILED, SKIP_TIMEBOX_EXCEEDED, ScheduleSummary, Scheduler,
};
