//! Run command implementation

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Args;

use testuniverse::config::{
    ConfigError, ENV_ATTACK_TOKEN, RunConfig, Settings, load_policy_file, target_from_url,
};
use testuniverse::governance::AttackRequest;
use testuniverse::plugin::PluginRegistry;
use testuniverse::report::Report;
use testuniverse::sandbox::{CancelToken, registry};
use testuniverse::{GateThresholds, Kernel, Plan, PlanEntry, Policy, RunOptions, ScanMode, Severity};

/// Pack used when neither a run file nor `--plugins` selects anything
const DEFAULT_PACK: &str = "mvp-webapp";

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Run file (YAML with target/policy/plan sections) or a target URL
    pub target: String,

    /// Additional run files merged over the first, section by section
    #[arg(short = 'f', long = "file")]
    pub files: Vec<PathBuf>,

    /// Policy file replacing the run file's policy section
    #[arg(long)]
    pub policy: Option<PathBuf>,

    /// Scan mode: ci, quick, deep or stress
    #[arg(long)]
    pub mode: Option<String>,

    /// Comma-separated plugin ids, replacing the plan's plugin list
    #[arg(long, value_delimiter = ',')]
    pub plugins: Vec<String>,

    /// Predefined plugin pack (mvp-webapp, mvp-security, mvp-performance)
    #[arg(long)]
    pub pack: Option<String>,

    /// Gate thresholds, e.g. critical=0,high=3
    #[arg(long)]
    pub gate: Option<String>,

    /// Timebox in seconds (can only shorten the policy timebox)
    #[arg(long)]
    pub timebox: Option<u64>,

    /// Output directory for run directories, history and baselines
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Worker pool size
    #[arg(long)]
    pub workers: Option<usize>,

    /// Request Attack Mode for the target host
    #[arg(long)]
    pub attack_mode: bool,

    /// Attack types to request (repeatable)
    #[arg(long = "attack", requires = "attack_mode")]
    pub attacks: Vec<String>,

    /// Acknowledge that active testing may disrupt the target
    #[arg(long, requires = "attack_mode")]
    pub acknowledge_risk: bool,

    /// Pre-approved Attack Mode token (defaults to the policy's token variable)
    #[arg(long, requires = "attack_mode")]
    pub attack_token: Option<String>,

    /// Baseline file of known finding fingerprints
    #[arg(long)]
    pub baseline: Option<PathBuf>,

    /// Only count findings missing from the baseline against the gate
    #[arg(long, requires = "baseline")]
    pub new_only: bool,

    /// Write this run's fingerprints as a baseline
    #[arg(long)]
    pub save_baseline: Option<PathBuf>,

    /// Print report.json instead of a summary
    #[arg(long)]
    pub json: bool,
}

fn looks_like_url(raw: &str) -> bool {
    let lower = raw.trim().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Merge run files and command-line overrides into the run inputs
fn load_inputs(args: &RunArgs) -> Result<(RunConfig, Policy, Plan)> {
    let mut config = if looks_like_url(&args.target) {
        RunConfig {
            target: Some(target_from_url(&args.target)?),
            ..Default::default()
        }
    } else {
        RunConfig::load(Path::new(&args.target))?
    };
    for file in &args.files {
        config = config.merge(RunConfig::load(file)?);
    }

    let mut policy = match &args.policy {
        Some(path) => load_policy_file(path)?,
        None => config.policy.clone().unwrap_or_default(),
    };
    if let Some(gate) = &args.gate {
        let thresholds = GateThresholds::parse(gate).map_err(ConfigError::Invalid)?;
        policy.gate.overlay(&thresholds);
    }
    if args.new_only {
        policy.new_findings_only = true;
    }

    let mut plan = config.plan.clone().unwrap_or_default();
    if let Some(pack) = &args.pack {
        plan.pack = Some(pack.clone());
    }
    if !args.plugins.is_empty() {
        plan.plugins = args.plugins.iter().map(PlanEntry::new).collect();
        if args.pack.is_none() {
            plan.pack = None;
        }
    }
    if plan.plugins.is_empty() && plan.pack.is_none() {
        plan.pack = Some(DEFAULT_PACK.to_string());
    }
    plan.expand_pack().map_err(ConfigError::Invalid)?;
    if let Some(mode) = &args.mode {
        plan.mode = ScanMode::from_str(mode)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown scan mode '{}'", mode)))?;
    }
    if let Some(timebox) = args.timebox {
        plan.timebox_seconds = Some(timebox);
    }
    if let Some(workers) = args.workers {
        plan.max_workers = Some(workers);
    }

    Ok((config, policy, plan))
}

fn attack_request(args: &RunArgs, host: Option<String>, policy: &Policy) -> Result<Option<AttackRequest>> {
    if !args.attack_mode {
        return Ok(None);
    }
    let Some(host) = host else {
        bail!("Attack Mode needs a target with a host");
    };

    let mut request = AttackRequest::new([host]);
    for attack in &args.attacks {
        request = request.with_attack(attack);
    }
    if args.acknowledge_risk {
        request = request.acknowledged();
    }
    let token = args.attack_token.clone().or_else(|| {
        [policy.attack_mode.pre_approved_token_env.as_str(), ENV_ATTACK_TOKEN]
            .into_iter()
            .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
    });
    if let Some(token) = token {
        request = request.with_token(token);
    }
    Ok(Some(request))
}

fn print_summary(report: &Report, report_path: &Path) {
    let summary = &report.summary;
    println!("Run {} against {}", report.run_id, report.target.url);
    println!();

    for node in &report.nodes {
        let reason = node.reason.as_deref().map(|r| format!(" ({})", r)).unwrap_or_default();
        println!(
            "  {:<18} {:<12} {:>3} findings{}",
            node.plugin_id, node.state, node.findings, reason
        );
    }
    println!();

    let counts: Vec<String> = Severity::ALL
        .iter()
        .map(|s| format!("{} {}", summary.by_severity.get(*s), s))
        .collect();
    println!("Findings: {} ({})", summary.total, counts.join(", "));

    if let Some(gate) = &report.gate {
        if gate.passed {
            println!("Gate: passed");
        } else {
            println!("Gate: failed");
            for violation in &gate.violations {
                println!("  {}", violation);
            }
        }
    }
    match &summary.exit_detail {
        Some(detail) => println!("Result: {} - {}", summary.exit_reason, detail),
        None => println!("Result: {}", summary.exit_reason),
    }
    println!("Report: {}", report_path.display());
}

/// Execute a run and return its exit code
pub async fn run_command(args: RunArgs, config_path: Option<&Path>) -> Result<i32> {
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let mut settings = Settings::resolve(config_path, &cwd, &|name| std::env::var(name).ok())?;
    if let Some(output) = &args.output {
        settings.output_dir = output.clone();
    }

    let (config, policy, plan) = load_inputs(&args)?;
    let target = config.target.ok_or(ConfigError::Missing("target"))?;

    let mut registry = PluginRegistry::with_builtins()?;
    for dir in &settings.plugin_dirs {
        registry.load_dir(dir);
    }

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            tracing::warn!("Interrupted, cancelling running jobs (press Ctrl-C again to kill them)");
            cancel.cancel();
            if tokio::signal::ctrl_c().await.is_ok() {
                let killed = registry::kill_all();
                tracing::warn!("Killed {} sandbox process group(s)", killed);
            }
        });
    }

    let options = RunOptions {
        attack: attack_request(&args, target.host(), &policy)?,
        baseline: args.baseline.clone(),
        save_baseline: args.save_baseline.clone(),
        cancel: Some(cancel),
        ..Default::default()
    };

    let kernel = Kernel::new(settings, registry)?;
    let outcome = kernel.run(target, policy, plan, options).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome.report)?);
    } else {
        print_summary(&outcome.report, &outcome.report_path);
    }
    Ok(outcome.exit_code())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        run: RunArgs,
    }

    fn parse(args: &[&str]) -> RunArgs {
        let mut argv = vec!["aiciv"];
        argv.extend_from_slice(args);
        TestCli::parse_from(argv).run
    }

    #[test]
    fn url_target_gets_default_pack_and_overrides() {
        let args = parse(&[
            "https://staging.shop.example",
            "--gate",
            "critical=0,high=3",
            "--mode",
            "quick",
            "--timebox",
            "300",
        ]);
        let (config, policy, plan) = load_inputs(&args).unwrap();

        assert_eq!(config.target.unwrap().id, "staging-shop-example");
        assert_eq!(policy.gate.get(Severity::High), Some(3));
        assert_eq!(plan.mode, ScanMode::Quick);
        assert_eq!(plan.timebox_seconds, Some(300));
        assert!(plan.entry("lighthouse").is_some());
    }

    #[test]
    fn explicit_plugins_replace_the_pack() {
        let args = parse(&["https://shop.example", "--plugins", "security-headers,nuclei"]);
        let (_, _, plan) = load_inputs(&args).unwrap();
        let ids: Vec<&str> = plan.plugins.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["security-headers", "nuclei"]);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let args = parse(&["https://shop.example", "--mode", "turbo"]);
        assert!(load_inputs(&args).is_err());
    }

    #[test]
    fn attack_mode_needs_the_flag() {
        let args = parse(&["https://shop.example", "--attack-mode", "--acknowledge-risk"]);
        let request = attack_request(&args, Some("shop.example".into()), &Policy::default())
            .unwrap()
            .unwrap();
        assert_eq!(request.hosts, vec!["shop.example"]);
        assert!(request.acknowledgement.is_some());

        let args = parse(&["https://shop.example"]);
        assert!(attack_request(&args, Some("shop.example".into()), &Policy::default()).unwrap().is_none());
    }
}
