//! The Run
//!
//! [`Kernel::run`] takes one target through a fixed sequence of phases:
//! authorize, probe, select plugins, compile the plan, schedule, verify,
//! triage, report. Each phase records to the run's audit log. The exit code
//! is classified once, at the end, from everything the phases observed.

mod executor;
mod probe;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::audit::{AuditLog, events};
use crate::config::{ConfigError, Settings};
use crate::dag::{Dag, NodeState, PlanError, SKIP_DEPENDENCY_FAILED, ScheduleSummary, Scheduler};
use crate::domain::{ExecutionStatus, ExitCode, Finding, Plan, Policy, Target, new_run_id};
use crate::error::KernelError;
use crate::governance::{
    AttackRequest, Decision, Governor, NetworkProofSource, ProofSource, RateLimiter, RunCapability, RunMode,
    TokenKey,
};
use crate::plugin::{Plugin, PluginRegistry};
use crate::report::{NodeOutcome, Report};
use crate::sandbox::{Backend, CancelToken, MemoryBudget, ProcessRunner, SandboxRunner};
use crate::triage::{Baseline, History, TriageEngine, Verification};

pub use executor::{NodeOutput, PluginExecutor};
pub use probe::{HttpProbe, ReachabilityProbe};

pub const AUDIT_FILE: &str = "audit.jsonl";
/// Per-job working directories live under `<run_dir>/jobs/`
pub const JOBS_DIR: &str = "jobs";

/// Per-run inputs that are not part of the target, policy or plan
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Fixed run id; a fresh one is generated otherwise
    pub run_id: Option<String>,
    /// Ask for Attack Mode; the run stays passive unless it is approved
    pub attack: Option<AttackRequest>,
    /// Fingerprints to exclude from gate counting when `new_findings_only` is set
    pub baseline: Option<PathBuf>,
    pub save_baseline: Option<PathBuf>,
    /// External abort signal
    pub cancel: Option<CancelToken>,
}

/// What a finished run leaves behind
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub exit: ExitCode,
    pub report: Report,
    pub run_dir: PathBuf,
    pub report_path: PathBuf,
    pub audit_path: PathBuf,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        self.exit.code()
    }
}

/// State shared by the phases of one run
struct RunContext {
    run_id: String,
    run_dir: PathBuf,
    audit: Arc<AuditLog>,
    target: Target,
    policy: Policy,
    plan: Plan,
    baseline: Option<Baseline>,
    options: RunOptions,
    cancel: CancelToken,
}

/// Findings and node outcomes gathered by the execution phases
#[derive(Default)]
struct Collected {
    findings: Vec<Finding>,
    nodes: Vec<NodeOutcome>,
    verification: Verification,
    exit: Option<(ExitCode, String)>,
}

impl Collected {
    fn classify(&mut self, exit: ExitCode, detail: impl Into<String>) {
        match &self.exit {
            Some((current, _)) if current.worst(exit) == *current => {}
            _ => self.exit = Some((exit, detail.into())),
        }
    }
}

/// Wires the Governor, scheduler, sandbox, normalizer and triage together
pub struct Kernel {
    settings: Settings,
    registry: PluginRegistry,
    runner: Arc<dyn SandboxRunner>,
    proofs: Arc<dyn ProofSource>,
    probe: Arc<dyn ReachabilityProbe>,
}

impl Kernel {
    /// A kernel using the configured sandbox backend, network proof lookups
    /// and an HTTP reachability probe
    pub fn new(settings: Settings, registry: PluginRegistry) -> Result<Self, KernelError> {
        settings.validate()?;
        let backend = Backend::from_name(&settings.sandbox.backend, &settings.sandbox.docker_binary)?;
        let probe = HttpProbe::new(Duration::from_secs(settings.probe_timeout_secs));
        Ok(Self {
            runner: Arc::new(ProcessRunner::new(backend)),
            proofs: Arc::new(NetworkProofSource::new()),
            probe: Arc::new(probe),
            settings,
            registry,
        })
    }

    pub fn with_runner(mut self, runner: Arc<dyn SandboxRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_proof_source(mut self, proofs: Arc<dyn ProofSource>) -> Self {
        self.proofs = proofs;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ReachabilityProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Execute one run.
    ///
    /// Invalid inputs are rejected before anything is written. Once the audit
    /// log is open every outcome, including a denied authorization, ends in
    /// a written report and an `Ok` carrying the exit classification.
    pub async fn run(
        &self,
        target: Target,
        policy: Policy,
        plan: Plan,
        options: RunOptions,
    ) -> Result<RunOutcome, KernelError> {
        let started_at = Utc::now();
        policy.validate().map_err(ConfigError::Invalid)?;
        if plan.plugins.is_empty() {
            return Err(PlanError::Empty.into());
        }
        let baseline = match &options.baseline {
            Some(path) => Some(Baseline::load(path).map_err(|e| ConfigError::Invalid(format!("{:#}", e)))?),
            None => None,
        };

        let run_id = options.run_id.clone().unwrap_or_else(new_run_id);
        let run_dir = self.settings.output_dir.join(&run_id);
        let audit = Arc::new(AuditLog::open(&run_dir.join(AUDIT_FILE), &run_id)?);
        let cancel = options.cancel.clone().unwrap_or_default();

        let ctx = RunContext {
            run_id,
            run_dir,
            audit,
            target,
            policy,
            plan,
            baseline,
            options,
            cancel,
        };
        ctx.audit.info(
            events::SCAN_STARTED,
            json!({
                "target": ctx.target.id,
                "type": ctx.target.target_type.as_str(),
                "url": ctx.target.url,
                "mode": ctx.plan.mode.as_str(),
                "plugins": ctx.plan.plugins.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
                "timebox_seconds": self.timebox(&ctx).as_secs(),
            }),
        );
        info!("Run {} started against {}", ctx.run_id, ctx.target.url);

        let mut report = Report::new(&ctx.run_id, &ctx.target, started_at);
        report.metadata.mode = Some(ctx.plan.mode.as_str().to_string());
        report.metadata.audit_log = ctx.audit.path().map(|p| p.display().to_string());

        // Authorization
        let governor = Arc::new(
            Governor::new(
                ctx.target.clone(),
                ctx.policy.clone(),
                ctx.audit.clone(),
                self.proofs.clone(),
                RateLimiter::spawn(ctx.policy.rate_limit.clone()),
            )
            .map_err(|e| ConfigError::Invalid(e.to_string()))?
            .with_token_key(self.settings.token_key.as_deref().and_then(TokenKey::new)),
        );
        let capability = match self.authorize(&ctx, &governor).await {
            Ok(capability) => Arc::new(capability),
            Err(reason) => {
                let nodes = ctx
                    .plan
                    .plugins
                    .iter()
                    .map(|e| NodeOutcome::skipped(&e.id, "run_denied"))
                    .collect();
                let report = report.with_nodes(nodes);
                return self.finish(&ctx, report, ExitCode::AuthBlocked, Some(reason));
            }
        };
        report.metadata.attack_session = capability.session().map(|s| s.session_id);

        // Reachability
        let mut collected = Collected::default();
        if let Err(reason) = self.check_reachable(&ctx).await {
            collected.nodes = ctx
                .plan
                .plugins
                .iter()
                .map(|e| NodeOutcome::skipped(&e.id, "target_unreachable"))
                .collect();
            collected.classify(ExitCode::TargetUnreachable, reason);
        } else {
            self.execute(&ctx, &governor, capability, &mut collected).await;
        }

        // Triage and gate, evaluated in every non-auth case
        let history_path = History::path_for(&self.settings.output_dir, &ctx.target.id);
        let mut history = History::load(&history_path, &ctx.target.id).unwrap_or_else(|e| {
            warn!("Ignoring unreadable finding history: {:#}", e);
            History::new(&ctx.target.id)
        });
        let triaged = TriageEngine::new(&ctx.policy, &ctx.audit).run(
            std::mem::take(&mut collected.findings),
            &collected.verification,
            Some(&history),
            ctx.baseline.as_ref(),
        );

        history.record_run(&triaged.findings);
        if let Err(e) = history.save(&history_path) {
            warn!("Failed to update finding history: {:#}", e);
        }
        if let Some(path) = &ctx.options.save_baseline {
            let baseline = Baseline::from_findings(&ctx.run_id, &ctx.target.id, &triaged.findings);
            match baseline.save(path) {
                Ok(()) => info!("Saved baseline of {} fingerprints to {}", baseline.fingerprints.len(), path.display()),
                Err(e) => collected.classify(ExitCode::InternalError, format!("failed to save baseline: {:#}", e)),
            }
        }

        let (mut exit, mut detail) = (triaged.gate.exit_reason, None);
        if let Some((classified, reason)) = collected.exit.take() {
            if exit.worst(classified) == classified {
                exit = classified;
                detail = Some(reason);
            }
        }

        let report = report
            .with_findings(triaged.findings)
            .with_gate(triaged.gate)
            .with_nodes(collected.nodes);
        self.finish(&ctx, report, exit, detail)
    }

    fn timebox(&self, ctx: &RunContext) -> Duration {
        let seconds = match ctx.plan.timebox_seconds {
            Some(plan) => plan.min(ctx.policy.timebox_seconds),
            None => ctx.policy.timebox_seconds,
        };
        Duration::from_secs(seconds)
    }

    /// Obtain the run capability. An `Err` carries the DENY reason.
    async fn authorize(&self, ctx: &RunContext, governor: &Governor) -> Result<RunCapability, String> {
        let mode = match &ctx.options.attack {
            Some(request) => RunMode::Attack(request.clone()),
            None => RunMode::Passive,
        };
        // Stress rates are only unlocked once a session is approved
        let rate = if ctx.plan.mode.requires_attack_mode() {
            ctx.policy.rate_limit.clone()
        } else {
            ctx.policy.rate_limit_for(ctx.plan.mode)
        };

        let capability = match governor.authorize(&ctx.run_id, &mode, rate).await {
            Decision::Allow(capability) => capability,
            Decision::AttackPending { capability, approval } => {
                ctx.audit.warn(
                    events::ATTACK_MODE_UNAVAILABLE,
                    json!({"reason": "approval_incomplete", "state": approval.state().as_str(), "mode": "passive"}),
                );
                warn!("Attack Mode approval incomplete, continuing passively");
                capability
            }
            Decision::Deny { reason } => return Err(reason),
        };

        if ctx.plan.mode.requires_attack_mode() {
            match (capability.is_attack_mode(), capability.host()) {
                (true, Some(host)) => {
                    if let Err(e) = governor.limiter().configure(host, ctx.policy.rate_limit_for(ctx.plan.mode)) {
                        warn!("Failed to apply stress rate for {}: {}", host, e);
                    }
                }
                _ => {
                    ctx.audit.warn(
                        events::ATTACK_MODE_UNAVAILABLE,
                        json!({"reason": "stress_requires_attack_mode", "mode": "passive"}),
                    );
                    warn!("Stress mode needs an approved Attack Mode session; using the policy rate");
                }
            }
        }
        Ok(capability)
    }

    async fn check_reachable(&self, ctx: &RunContext) -> Result<(), String> {
        if !self.settings.probe_reachability || !ctx.target.target_type.is_networked() {
            return Ok(());
        }
        match self.probe.probe(&ctx.target.url).await {
            Ok(status) => {
                ctx.audit.info(
                    events::REACHABILITY_CHECK,
                    json!({"url": ctx.target.url, "reachable": true, "status": status}),
                );
                Ok(())
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                ctx.audit.error(
                    events::REACHABILITY_CHECK,
                    json!({"url": ctx.target.url, "reachable": false, "error": reason}),
                );
                Err(format!("target unreachable: {}", reason))
            }
        }
    }

    /// Select, compile, schedule and verify
    async fn execute(
        &self,
        ctx: &RunContext,
        governor: &Arc<Governor>,
        capability: Arc<RunCapability>,
        collected: &mut Collected,
    ) {
        let (selected, skipped) = self.registry.select(&ctx.plan, &ctx.target, &ctx.policy);
        for skip in &skipped {
            ctx.audit.warn(
                events::PLUGIN_SKIPPED,
                json!({"plugin": skip.id, "reason": skip.reason, "detail": skip.detail}),
            );
            collected.nodes.push(NodeOutcome::skipped(&skip.id, skip.reason));
        }

        let plan = effective_plan(&ctx.plan, &selected, &ctx.audit, &mut collected.nodes);
        if plan.plugins.is_empty() {
            info!("No runnable plugins for {}", ctx.target.id);
            return;
        }
        let dag = match Dag::compile(&plan) {
            Ok(dag) => dag,
            Err(e) => {
                ctx.audit.error(events::PLUGIN_FAILED, json!({"reason": "invalid_plan", "detail": e.to_string()}));
                collected.classify(ExitCode::InternalError, format!("invalid plan: {}", e));
                return;
            }
        };
        debug!("Execution order: {}", dag.topological_order().join(" -> "));

        let jobs_dir = ctx.run_dir.join(JOBS_DIR);
        let executor = Arc::new(
            PluginExecutor::new(
                selected,
                governor.clone(),
                capability,
                self.runner.clone(),
                ctx.target.clone(),
                ctx.policy.clone(),
                plan.clone(),
                ctx.audit.clone(),
                jobs_dir,
            )
            .with_grace_period(Duration::from_secs(self.settings.sandbox.grace_period_secs)),
        );

        let timebox = self.timebox(ctx);
        let scheduler = Scheduler::new(plan.workers(self.settings.max_workers), timebox)
            .with_cancel(ctx.cancel.clone())
            .with_budget(MemoryBudget::new(self.settings.sandbox.memory_budget_mb))
            .with_audit(ctx.audit.clone());
        let (mut stream, handle) = scheduler.schedule(dag, executor.clone());
        while let Some(report) = stream.next().await {
            info!("{}: {}", report.id, report.state.as_str());
        }
        let summary = match handle.await {
            Ok(summary) => summary,
            Err(e) => {
                collected.classify(ExitCode::InternalError, format!("scheduler task failed: {}", e));
                return;
            }
        };

        if summary.timed_out {
            collected.classify(ExitCode::Timeout, format!("timebox of {}s exceeded", timebox.as_secs()));
        } else if summary.aborted {
            collected.classify(ExitCode::InternalError, "run aborted");
        } else if ctx.policy.triage.verify_reruns > 0 {
            let remaining = timebox.saturating_sub(summary.elapsed);
            let (verification, deadline_hit) =
                verify(&executor, ctx.policy.triage.verify_reruns, remaining, &ctx.cancel).await;
            collected.verification = verification;
            if deadline_hit {
                collected.classify(
                    ExitCode::Timeout,
                    format!("timebox of {}s exceeded during verification", timebox.as_secs()),
                );
            }
        }

        classify_nodes(&summary, &plan, collected);
        let outputs = executor.outputs();
        for report in &summary.reports {
            let mut outcome = NodeOutcome::from_report(report);
            if let Some(output) = outputs.get(&report.id) {
                outcome.findings = output.findings.len();
                outcome.dropped = output.dropped;
                collected.findings.extend(output.findings.iter().cloned());
            }
            collected.nodes.push(outcome);
        }
    }

    fn finish(
        &self,
        ctx: &RunContext,
        mut report: Report,
        exit: ExitCode,
        detail: Option<String>,
    ) -> Result<RunOutcome, KernelError> {
        let completed_at: DateTime<Utc> = Utc::now();
        report.finish(exit, detail.clone(), completed_at);
        let report_path = report.write(&ctx.run_dir)?;
        ctx.audit.info(
            events::REPORT_WRITTEN,
            json!({"path": report_path.display().to_string(), "findings": report.summary.total}),
        );

        let payload = json!({
            "exit_code": exit.code(),
            "exit_reason": exit.name(),
            "detail": detail,
            "findings": report.summary.total,
            "duration_seconds": report.summary.duration_seconds,
        });
        match exit {
            ExitCode::Pass | ExitCode::GateFail => ctx.audit.info(events::SCAN_COMPLETED, payload),
            _ => ctx.audit.error(events::SCAN_COMPLETED, payload),
        };
        info!("Run {} finished: {}", ctx.run_id, exit.name());

        Ok(RunOutcome {
            run_id: ctx.run_id.clone(),
            exit,
            report,
            run_dir: ctx.run_dir.clone(),
            report_path,
            audit_path: ctx.run_dir.join(AUDIT_FILE),
        })
    }
}

/// The plan restricted to runnable plugins, with manifest dependencies
/// merged in as hard edges. Entries whose hard dependencies will not run
/// are skipped as `dependency_failed`.
fn effective_plan(
    plan: &Plan,
    selected: &[Arc<dyn Plugin>],
    audit: &AuditLog,
    nodes: &mut Vec<NodeOutcome>,
) -> Plan {
    let mut runnable: BTreeSet<String> = selected.iter().map(|p| p.meta().id.clone()).collect();
    let mut effective = plan.clone();

    for entry in effective.plugins.iter_mut() {
        let Some(plugin) = selected.iter().find(|p| p.meta().id == entry.id) else {
            continue;
        };
        for dependency in plugin.dependencies() {
            if plan.entry(dependency).is_none() {
                audit.warn(
                    events::DEPENDENCY_MISSING,
                    json!({"plugin": entry.id, "dependency": dependency}),
                );
                continue;
            }
            if !entry.depends_on.contains(dependency) {
                entry.depends_on.push(dependency.clone());
            }
        }
    }

    loop {
        let blocked: Vec<String> = effective
            .plugins
            .iter()
            .filter(|e| runnable.contains(&e.id))
            .filter(|e| {
                e.depends_on
                    .iter()
                    .any(|d| plan.entry(d).is_some() && !runnable.contains(d))
            })
            .map(|e| e.id.clone())
            .collect();
        if blocked.is_empty() {
            break;
        }
        for id in blocked {
            runnable.remove(&id);
            audit.warn(
                events::NODE_SKIPPED,
                json!({"plugin": id, "reason": SKIP_DEPENDENCY_FAILED, "detail": "a hard dependency will not run"}),
            );
            nodes.push(NodeOutcome::skipped(&id, SKIP_DEPENDENCY_FAILED));
        }
    }

    effective.plugins.retain(|e| runnable.contains(&e.id));
    for entry in effective.plugins.iter_mut() {
        entry.soft_depends_on.retain(|d| runnable.contains(d));
    }
    effective
}

/// Infrastructure classification of finished nodes
fn classify_nodes(summary: &ScheduleSummary, plan: &Plan, collected: &mut Collected) {
    for report in &summary.reports {
        let required = plan.entry(&report.id).is_some_and(|e| e.required);
        let launch_failed = report
            .result
            .as_ref()
            .is_some_and(|r| matches!(r.status, ExecutionStatus::LaunchFailed { .. }));
        match &report.state {
            NodeState::Unreachable => {
                collected.classify(
                    ExitCode::TargetUnreachable,
                    format!("{} could not reach the target", report.id),
                );
            }
            NodeState::Failed { reason } if required || launch_failed => {
                collected.classify(ExitCode::InternalError, format!("{} failed: {}", report.id, reason));
            }
            _ => {}
        }
    }
}

/// Rerun every plugin that produced findings, bounded by what is left of
/// the timebox. Returns the reproduction vectors and whether the deadline
/// cut verification short.
async fn verify(
    executor: &PluginExecutor,
    reruns: u32,
    remaining: Duration,
    abort: &CancelToken,
) -> (Verification, bool) {
    let cancel = CancelToken::new();
    let watchdog = {
        let cancel = cancel.clone();
        let abort = abort.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = abort.cancelled() => {}
            }
            cancel.cancel();
        })
    };

    let mut verification = Verification::new();
    'plugins: for (plugin_id, output) in executor.outputs() {
        let succeeded = output.status.as_ref().is_some_and(ExecutionStatus::is_success);
        if output.findings.is_empty() || !succeeded {
            continue;
        }
        for attempt in 1..=reruns {
            if cancel.is_cancelled() {
                break 'plugins;
            }
            if let Some(rerun) = executor.rerun(&plugin_id, attempt, &cancel).await {
                verification.record_rerun(&output.findings, &rerun);
            }
        }
    }

    watchdog.abort();
    let deadline_hit = cancel.is_cancelled() && !abort.is_cancelled();
    (verification, deadline_hit)
}
