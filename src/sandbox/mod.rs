//! Sandboxed job execution
//!
//! A [`SandboxRunner`] turns an [`ExecutionSpec`] into an [`ExecutionResult`].
//! It only runs with an [`Admission`] from the Governor, and the artifacts it
//! captures are the only channel from a job back to the kernel.

mod budget;
mod process;
pub mod registry;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::domain::{ExecutionResult, ExecutionSpec};
use crate::governance::Admission;

pub use budget::{MemoryBudget, MemoryReservation};
pub use process::{Backend, CONTAINER_OUTPUT_DIR, ProcessRunner, render_docker_command};

/// Command placeholder replaced with the job's output directory
pub const OUTPUT_DIR_PLACEHOLDER: &str = "{output_dir}";
/// Command placeholder replaced with the path of the job's seed URL list
pub const SEED_URLS_PLACEHOLDER: &str = "{seed_urls_file}";
pub const SEED_URLS_FILE: &str = "seed_urls.txt";

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Invalid execution spec for {plugin}: {message}")]
    InvalidSpec { plugin: String, message: String },

    #[error("Unknown sandbox backend '{0}'")]
    UnknownBackend(String),

    #[error("Failed to prepare job directory {}: {source}", path.display())]
    JobDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch {plugin}: {message}")]
    Launch { plugin: String, message: String },
}

/// Cooperative cancellation shared by every job of a run. Cancelling is
/// idempotent and cannot be undone.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as any clone of the token
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Where and under what cancellation a single job runs
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job name used in logs and the process registry (plugin id, rerun suffix)
    pub job_id: String,
    /// Private working and output directory of the job
    pub job_dir: PathBuf,
    pub cancel: CancelToken,
    /// Time between SIGTERM and SIGKILL
    pub grace_period: Duration,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>, job_dir: impl Into<PathBuf>, cancel: CancelToken) -> Self {
        Self {
            job_id: job_id.into(),
            job_dir: job_dir.into(),
            cancel,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn seed_urls_path(&self) -> PathBuf {
        self.job_dir.join(SEED_URLS_FILE)
    }
}

/// Executes one plugin job in isolation
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run the job to a terminal state. Launch problems are reported through
    /// the result's status, never as a panic or a lost job.
    async fn execute(&self, admission: &Admission, spec: &ExecutionSpec, ctx: &JobContext) -> ExecutionResult;
}

/// Replace command placeholders for a job whose output directory is `output_dir`
pub fn substitute_placeholders(arg: &str, output_dir: &Path) -> String {
    let out = output_dir.display().to_string();
    let seeds = output_dir.join(SEED_URLS_FILE).display().to_string();
    arg.replace(SEED_URLS_PLACEHOLDER, &seeds)
        .replace(OUTPUT_DIR_PLACEHOLDER, &out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_idempotent_and_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        token.cancel();
        assert!(clone.is_cancelled());
        tokio::time::timeout(Duration::from_millis(100), clone.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn placeholders_resolve_against_output_dir() {
        let dir = Path::new("/tmp/run/artifacts/recon");
        assert_eq!(
            substitute_placeholders("--out={output_dir}/report.json", dir),
            "--out=/tmp/run/artifacts/recon/report.json"
        );
        assert_eq!(
            substitute_placeholders("{seed_urls_file}", dir),
            "/tmp/run/artifacts/recon/seed_urls.txt"
        );
    }
}
