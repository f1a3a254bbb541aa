//! Runs plugin jobs for the scheduler: configure, admit, execute, normalize

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::audit::{AuditLog, events};
use crate::dag::{NodeContext, NodeExecutor, NodeRun, NodeState};
use crate::domain::{ExecutionResult, ExecutionStatus, Finding, Plan, Policy, Target};
use crate::governance::{Governor, RunCapability, Veto};
use crate::normalize::{Normalized, Normalizer};
use crate::plugin::Plugin;
use crate::plugin::artifacts::{discovered_urls, telemetry};
use crate::sandbox::{CancelToken, JobContext, SandboxRunner};

/// Normalized output of one plugin's scheduled job
#[derive(Debug, Clone, Default)]
pub struct NodeOutput {
    pub findings: Vec<Finding>,
    /// Candidates the adapter produced before validation
    pub candidates: usize,
    pub dropped: usize,
    pub status: Option<ExecutionStatus>,
}

enum JobOutcome {
    Ran {
        result: ExecutionResult,
        normalized: Normalized,
        candidates: usize,
    },
    Vetoed(Veto),
    NotConfigured(String),
}

/// [`NodeExecutor`] backed by the Governor and a sandbox runner.
///
/// Every job goes through `Governor::admit` with the run's capability before
/// the sandbox sees it; there is no other path to `SandboxRunner::execute`.
pub struct PluginExecutor {
    plugins: BTreeMap<String, Arc<dyn Plugin>>,
    governor: Arc<Governor>,
    capability: Arc<RunCapability>,
    runner: Arc<dyn SandboxRunner>,
    target: Target,
    policy: Policy,
    plan: Plan,
    audit: Arc<AuditLog>,
    jobs_dir: PathBuf,
    grace_period: Duration,
    outputs: Mutex<BTreeMap<String, NodeOutput>>,
    seeds: Mutex<BTreeMap<String, Vec<String>>>,
}

impl PluginExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plugins: Vec<Arc<dyn Plugin>>,
        governor: Arc<Governor>,
        capability: Arc<RunCapability>,
        runner: Arc<dyn SandboxRunner>,
        target: Target,
        policy: Policy,
        plan: Plan,
        audit: Arc<AuditLog>,
        jobs_dir: PathBuf,
    ) -> Self {
        Self {
            plugins: plugins
                .into_iter()
                .map(|p| (p.meta().id.clone(), p))
                .collect(),
            governor,
            capability,
            runner,
            target,
            policy,
            plan,
            audit,
            jobs_dir,
            grace_period: crate::sandbox::DEFAULT_GRACE_PERIOD,
            outputs: Mutex::new(BTreeMap::new()),
            seeds: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    /// Output recorded for a plugin's scheduled job
    pub fn output(&self, plugin_id: &str) -> Option<NodeOutput> {
        self.outputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(plugin_id)
            .cloned()
    }

    /// Every recorded output, keyed by plugin id
    pub fn outputs(&self) -> BTreeMap<String, NodeOutput> {
        self.outputs.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Run a plugin again for verification. Returns the findings of the
    /// rerun, or `None` when it did not complete successfully.
    pub async fn rerun(&self, plugin_id: &str, attempt: u32, cancel: &CancelToken) -> Option<Vec<Finding>> {
        let plugin = self.plugins.get(plugin_id)?.clone();
        let seeds = self
            .seeds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(plugin_id)
            .cloned()
            .unwrap_or_default();
        let job_id = format!("{}-rerun-{}", plugin_id, attempt);

        match self.run_job(plugin.as_ref(), &job_id, &seeds, cancel).await {
            JobOutcome::Ran { result, normalized, .. } if result.status.is_success() => {
                self.audit.info(
                    events::VERIFICATION_RERUN,
                    json!({
                        "plugin": plugin_id,
                        "attempt": attempt,
                        "status": result.status.as_str(),
                        "findings": normalized.findings.len(),
                    }),
                );
                Some(normalized.findings)
            }
            JobOutcome::Ran { result, .. } => {
                self.audit.warn(
                    events::VERIFICATION_RERUN,
                    json!({"plugin": plugin_id, "attempt": attempt, "status": result.status.as_str()}),
                );
                None
            }
            JobOutcome::Vetoed(veto) => {
                self.audit.warn(
                    events::VERIFICATION_RERUN,
                    json!({"plugin": plugin_id, "attempt": attempt, "status": "vetoed", "reason": veto.reason()}),
                );
                None
            }
            JobOutcome::NotConfigured(message) => {
                self.audit.warn(
                    events::VERIFICATION_RERUN,
                    json!({"plugin": plugin_id, "attempt": attempt, "status": "configure_failed", "detail": message}),
                );
                None
            }
        }
    }

    /// Seed URLs for a node: the target itself, then in-scope URLs its
    /// dependencies discovered
    fn seed_urls(&self, ctx: &NodeContext) -> Vec<String> {
        let mut seeds = Vec::new();
        if self.target.target_type.is_networked() {
            seeds.push(self.target.url.clone());
        }
        let discovered = ctx
            .dependencies
            .iter()
            .filter_map(|dep| dep.result.as_ref())
            .flat_map(|result| discovered_urls(result));
        for url in self.governor.scope().filter_urls(discovered, &self.audit) {
            if !seeds.contains(&url) {
                seeds.push(url);
            }
        }
        seeds
    }

    async fn run_job(&self, plugin: &dyn Plugin, job_id: &str, seeds: &[String], cancel: &CancelToken) -> JobOutcome {
        let plugin_id = plugin.meta().id.clone();
        let spec = match plugin.configure(&self.target, &self.policy, &self.plan) {
            Ok(spec) => spec,
            Err(e) => return JobOutcome::NotConfigured(e.to_string()),
        };

        let ctx = JobContext::new(job_id, self.jobs_dir.join(job_id), cancel.clone())
            .with_grace_period(self.grace_period);
        let mut seed_file = seeds.join("\n");
        seed_file.push('\n');
        let prepared = std::fs::create_dir_all(&ctx.job_dir)
            .and_then(|_| std::fs::write(ctx.seed_urls_path(), seed_file));
        if let Err(e) = prepared {
            let status = ExecutionStatus::LaunchFailed {
                reason: format!("failed to prepare {}: {}", ctx.job_dir.display(), e),
            };
            return JobOutcome::Ran {
                result: ExecutionResult::new(&plugin_id, status, Duration::ZERO),
                normalized: Normalized::default(),
                candidates: 0,
            };
        }

        let admission = match self.governor.admit(&self.capability, &spec, cancel).await {
            Ok(admission) => admission,
            Err(veto) => return JobOutcome::Vetoed(veto),
        };

        self.audit.info(
            events::PLUGIN_STARTED,
            json!({
                "plugin": plugin_id,
                "job": job_id,
                "runner": self.runner.name(),
                "traffic": spec.traffic.as_str(),
                "timeout_seconds": spec.timeout.as_secs(),
                "memory_mb": spec.limits.memory_mb,
                "seed_urls": seeds.len(),
            }),
        );
        let result = self.runner.execute(&admission, &spec, &ctx).await;
        let host = admission.host().map(str::to_string);
        drop(admission);

        if let Some(host) = host {
            for observation in telemetry(&result, spec.telemetry_file.as_deref()) {
                self.governor.observe_status(&host, observation.status).await;
            }
        }

        let output = plugin.normalize(&result);
        let candidates = output.candidates();
        let normalized =
            Normalizer::new(self.capability.run_id(), &self.target.id, &self.audit).accept(&plugin_id, output);
        JobOutcome::Ran {
            result,
            normalized,
            candidates,
        }
    }
}

#[async_trait]
impl NodeExecutor for PluginExecutor {
    fn memory_mb(&self, node: &str) -> u64 {
        self.plugins
            .get(node)
            .and_then(|p| p.configure(&self.target, &self.policy, &self.plan).ok())
            .map(|spec| spec.limits.memory_mb)
            .unwrap_or(0)
    }

    async fn run(&self, node: &str, ctx: NodeContext) -> NodeRun {
        let Some(plugin) = self.plugins.get(node).cloned() else {
            return NodeRun::skipped("unknown_plugin");
        };
        let seeds = self.seed_urls(&ctx);
        self.seeds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(node.to_string(), seeds.clone());

        match self.run_job(plugin.as_ref(), node, &seeds, &ctx.cancel).await {
            JobOutcome::NotConfigured(message) => {
                self.audit.error(
                    events::PLUGIN_FAILED,
                    json!({"plugin": node, "reason": "configure_failed", "detail": message}),
                );
                NodeRun {
                    state: NodeState::Failed {
                        reason: format!("configure failed: {}", message),
                    },
                    result: None,
                }
            }
            JobOutcome::Vetoed(Veto::Cancelled) => NodeRun {
                state: NodeState::Cancelled,
                result: None,
            },
            JobOutcome::Vetoed(veto) => {
                self.audit.warn(
                    events::PLUGIN_SKIPPED,
                    json!({"plugin": node, "reason": veto.reason(), "detail": veto.to_string()}),
                );
                NodeRun::skipped(veto.reason())
            }
            JobOutcome::Ran {
                result,
                normalized,
                candidates,
            } => {
                let required = self.plan.entry(node).is_some_and(|e| e.required);
                let no_valid_output = required && candidates > 0 && normalized.findings.is_empty();

                let payload = json!({
                    "plugin": node,
                    "status": result.status.as_str(),
                    "exit_code": result.status.exit_code(),
                    "duration_seconds": result.duration.as_secs_f64(),
                    "findings": normalized.findings.len(),
                    "dropped": normalized.dropped,
                });
                if result.status.is_success() && !no_valid_output {
                    self.audit.info(events::PLUGIN_COMPLETED, payload);
                } else {
                    self.audit.error(events::PLUGIN_FAILED, payload);
                }

                self.outputs.lock().unwrap_or_else(|e| e.into_inner()).insert(
                    node.to_string(),
                    NodeOutput {
                        findings: normalized.findings,
                        candidates,
                        dropped: normalized.dropped,
                        status: Some(result.status.clone()),
                    },
                );

                if result.status.is_success() && no_valid_output {
                    NodeRun::failed(result, "required plugin produced no valid findings")
                } else {
                    NodeRun::from_result(result)
                }
            }
        }
    }
}
