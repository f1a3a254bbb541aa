//! Process and container backends
//!
//! Both backends launch a child in its own process group so a timeout or an
//! abort can signal the whole tree. The container backend renders the spec
//! as a `docker run` command line and otherwise behaves like the process one.

use std::path::{Component, Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;

use super::{JobContext, SandboxError, SandboxRunner, registry, substitute_placeholders};
use crate::domain::{
    Artifact, ExecutionResult, ExecutionSpec, ExecutionStatus, STDERR_ARTIFACT, STDOUT_ARTIFACT,
};
use crate::governance::Admission;

/// Mount point of the job directory inside a container
pub const CONTAINER_OUTPUT_DIR: &str = "/out";

/// Captured stdout/stderr are truncated beyond this size
const MAX_CAPTURE_BYTES: u64 = 16 * 1024 * 1024;

/// Variables passed through from the kernel's environment
const INHERITED_ENV: &[&str] = &["PATH", "HOME", "LANG", "TMPDIR", "DOCKER_HOST", "DOCKER_CONFIG"];

/// Environment values of the form `env:NAME` are read from the kernel's
/// environment at launch and never stored in the spec
const ENV_REFERENCE_PREFIX: &str = "env:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Process,
    Docker { binary: String },
}

impl Backend {
    pub fn from_name(name: &str, docker_binary: &str) -> Result<Self, SandboxError> {
        match name.trim().to_lowercase().as_str() {
            "process" | "local" => Ok(Backend::Process),
            "docker" | "container" => Ok(Backend::Docker {
                binary: docker_binary.to_string(),
            }),
            other => Err(SandboxError::UnknownBackend(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Process => "process",
            Backend::Docker { .. } => "docker",
        }
    }
}

fn resolve_env_value(value: &str, output_dir: &Path) -> Option<String> {
    match value.strip_prefix(ENV_REFERENCE_PREFIX) {
        Some(name) => std::env::var(name).ok(),
        None => Some(substitute_placeholders(value, output_dir)),
    }
}

/// Render a spec as a `docker run` invocation
pub fn render_docker_command(
    binary: &str,
    spec: &ExecutionSpec,
    job_dir: &Path,
    container_name: &str,
) -> Result<Vec<String>, SandboxError> {
    let image = spec.image.as_deref().ok_or_else(|| SandboxError::InvalidSpec {
        plugin: spec.plugin_id.clone(),
        message: "container backend requires an image".to_string(),
    })?;
    let container_out = Path::new(CONTAINER_OUTPUT_DIR);

    let mut argv = vec![
        binary.to_string(),
        "run".to_string(),
        "--rm".to_string(),
        "--name".to_string(),
        container_name.to_string(),
        "--network".to_string(),
        "host".to_string(),
    ];
    if spec.limits.memory_mb > 0 {
        argv.push("--memory".to_string());
        argv.push(format!("{}m", spec.limits.memory_mb));
    }
    argv.push("-v".to_string());
    argv.push(format!("{}:{}", job_dir.display(), CONTAINER_OUTPUT_DIR));
    argv.push("-w".to_string());
    argv.push(CONTAINER_OUTPUT_DIR.to_string());
    argv.push("-e".to_string());
    argv.push(format!("TESTUNIVERSE_OUTPUT_DIR={}", CONTAINER_OUTPUT_DIR));
    for (key, value) in &spec.environment {
        if let Some(value) = resolve_env_value(value, container_out) {
            argv.push("-e".to_string());
            argv.push(format!("{}={}", key, value));
        }
    }
    argv.push(image.to_string());
    argv.extend(
        spec.command
            .iter()
            .map(|arg| substitute_placeholders(arg, container_out)),
    );
    Ok(argv)
}

/// Runs jobs as local processes or containers
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    backend: Backend,
}

impl ProcessRunner {
    pub fn new(backend: Backend) -> Self {
        Self { backend }
    }

    pub fn process() -> Self {
        Self::new(Backend::Process)
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    fn build_command(&self, spec: &ExecutionSpec, ctx: &JobContext, container: &str) -> Result<Command, SandboxError> {
        if spec.command.is_empty() && spec.image.is_none() {
            return Err(SandboxError::InvalidSpec {
                plugin: spec.plugin_id.clone(),
                message: "command is empty".to_string(),
            });
        }

        let argv = match &self.backend {
            Backend::Process => spec
                .command
                .iter()
                .map(|arg| substitute_placeholders(arg, &ctx.job_dir))
                .collect::<Vec<_>>(),
            Backend::Docker { binary } => render_docker_command(binary, spec, &ctx.job_dir, container)?,
        };
        let Some((program, args)) = argv.split_first() else {
            return Err(SandboxError::InvalidSpec {
                plugin: spec.plugin_id.clone(),
                message: "command is empty".to_string(),
            });
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&ctx.job_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        cmd.env_clear();
        for key in INHERITED_ENV {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        if self.backend == Backend::Process {
            cmd.env("TESTUNIVERSE_OUTPUT_DIR", &ctx.job_dir);
            for (key, value) in &spec.environment {
                if let Some(value) = resolve_env_value(value, &ctx.job_dir) {
                    cmd.env(key, value);
                }
            }
        }

        #[cfg(unix)]
        {
            cmd.process_group(0);
            if self.backend == Backend::Process && spec.limits.memory_mb > 0 {
                let bytes = spec.limits.memory_mb.saturating_mul(1024 * 1024);
                // SAFETY: the hook only calls setrlimit, which is async-signal-safe
                unsafe {
                    cmd.pre_exec(move || limit_address_space(bytes));
                }
            }
        }

        Ok(cmd)
    }
}

#[cfg(unix)]
fn limit_address_space(bytes: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: bytes as libc::rlim_t,
        rlim_max: bytes as libc::rlim_t,
    };
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_AS, &limit) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

enum Stop {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

async fn read_capped<R: AsyncRead + Unpin>(reader: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(reader) = reader {
        if let Err(e) = reader.take(MAX_CAPTURE_BYTES).read_to_end(&mut buf).await {
            tracing::debug!("Output capture ended early: {}", e);
        }
    }
    buf
}

/// SIGTERM the group, wait out the grace period, then SIGKILL
async fn terminate(child: &mut Child, pgid: Option<u32>, grace: Duration, container: Option<(&str, &str)>) {
    match pgid {
        Some(pgid) => {
            registry::terminate_group(pgid);
        }
        None => {
            let _ = child.start_kill();
        }
    }
    if tokio::time::timeout(grace, child.wait()).await.is_ok() {
        return;
    }

    if let Some(pgid) = pgid {
        registry::kill_group(pgid);
    }
    let _ = child.start_kill();
    let _ = child.wait().await;

    // Killing the docker client does not stop the container itself
    if let Some((binary, name)) = container {
        let kill = Command::new(binary)
            .args(["kill", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = tokio::time::timeout(Duration::from_secs(10), kill).await {
            tracing::warn!("Timed out killing container {}: {}", name, e);
        }
    }
}

fn exit_code_of(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Output file names must stay inside the job directory
fn safe_relative(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    let ok = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    ok.then(|| path.to_path_buf())
}

async fn collect_artifacts(spec: &ExecutionSpec, ctx: &JobContext, stdout: Vec<u8>, stderr: Vec<u8>) -> Vec<Artifact> {
    let mut artifacts = Vec::new();

    for (name, bytes) in [(STDOUT_ARTIFACT, stdout), (STDERR_ARTIFACT, stderr)] {
        let path = ctx.job_dir.join(format!("{}.log", name));
        let artifact = match tokio::fs::write(&path, &bytes).await {
            Ok(()) => Artifact::new(name, bytes).with_path(path),
            Err(e) => {
                tracing::warn!("Failed to persist {} for {}: {}", name, ctx.job_id, e);
                Artifact::new(name, bytes)
            }
        };
        artifacts.push(artifact);
    }

    let declared = spec
        .output_files
        .iter()
        .chain(spec.telemetry_file.iter());
    for name in declared {
        let Some(relative) = safe_relative(name) else {
            tracing::warn!("{}: ignoring output file outside the job directory: {}", ctx.job_id, name);
            continue;
        };
        if artifacts.iter().any(|a| a.name == *name) {
            continue;
        }
        let path = ctx.job_dir.join(relative);
        match tokio::fs::read(&path).await {
            Ok(bytes) => artifacts.push(Artifact::new(name.clone(), bytes).with_path(path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("{}: declared output {} was not produced", ctx.job_id, name);
            }
            Err(e) => tracing::warn!("{}: failed to read {}: {}", ctx.job_id, name, e),
        }
    }

    artifacts
}

#[async_trait]
impl SandboxRunner for ProcessRunner {
    fn name(&self) -> &'static str {
        self.backend.as_str()
    }

    async fn execute(&self, admission: &Admission, spec: &ExecutionSpec, ctx: &JobContext) -> ExecutionResult {
        let started = Instant::now();
        let finish = |status: ExecutionStatus| ExecutionResult::new(spec.plugin_id.clone(), status, started.elapsed());

        if ctx.cancel.is_cancelled() {
            return finish(ExecutionStatus::Cancelled);
        }
        if let Err(source) = tokio::fs::create_dir_all(&ctx.job_dir).await {
            let err = SandboxError::JobDir {
                path: ctx.job_dir.clone(),
                source,
            };
            return finish(ExecutionStatus::LaunchFailed {
                reason: err.to_string(),
            });
        }

        let container = format!(
            "testuniverse-{}-{}",
            ctx.job_id.replace(|c: char| !c.is_ascii_alphanumeric(), "-"),
            &uuid::Uuid::new_v4().simple().to_string()[..8]
        );
        let mut cmd = match self.build_command(spec, ctx, &container) {
            Ok(cmd) => cmd,
            Err(e) => {
                return finish(ExecutionStatus::LaunchFailed {
                    reason: e.to_string(),
                });
            }
        };

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                let err = SandboxError::Launch {
                    plugin: spec.plugin_id.clone(),
                    message: e.to_string(),
                };
                tracing::warn!("{}", err);
                return finish(ExecutionStatus::LaunchFailed {
                    reason: err.to_string(),
                });
            }
        };

        let pgid = child.id();
        if let Some(pgid) = pgid {
            registry::register(&ctx.job_id, pgid, &spec.plugin_id);
        }
        tracing::info!(
            "Started {} ({} backend, {} traffic, pid {:?})",
            ctx.job_id,
            self.backend.as_str(),
            admission.traffic().as_str(),
            pgid
        );

        let stdout_task = tokio::spawn(read_capped(child.stdout.take()));
        let stderr_task = tokio::spawn(read_capped(child.stderr.take()));

        let stop = tokio::select! {
            status = child.wait() => Stop::Exited(status),
            _ = tokio::time::sleep(spec.timeout) => Stop::TimedOut,
            _ = ctx.cancel.cancelled() => Stop::Cancelled,
        };

        if matches!(stop, Stop::TimedOut | Stop::Cancelled) {
            let docker = match &self.backend {
                Backend::Docker { binary } => Some((binary.as_str(), container.as_str())),
                Backend::Process => None,
            };
            terminate(&mut child, pgid, ctx.grace_period, docker).await;
        }
        registry::unregister(&ctx.job_id);

        let capture_wait = Duration::from_secs(5);
        let stdout = match tokio::time::timeout(capture_wait, stdout_task).await {
            Ok(Ok(bytes)) => bytes,
            _ => Vec::new(),
        };
        let stderr = match tokio::time::timeout(capture_wait, stderr_task).await {
            Ok(Ok(bytes)) => bytes,
            _ => Vec::new(),
        };

        let status = match stop {
            Stop::Exited(Ok(status)) => spec.classify_exit(exit_code_of(&status)),
            Stop::Exited(Err(e)) => ExecutionStatus::LaunchFailed {
                reason: format!("failed to wait for process: {}", e),
            },
            Stop::TimedOut => ExecutionStatus::TimedOut,
            Stop::Cancelled => ExecutionStatus::Cancelled,
        };

        let mut result = finish(status);
        for artifact in collect_artifacts(spec, ctx, stdout, stderr).await {
            result = result.with_artifact(artifact);
        }
        tracing::info!(
            "{} finished: {} in {:.1}s",
            ctx.job_id,
            result.status.as_str(),
            result.duration.as_secs_f64()
        );
        result
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::governance::test_support::admission;
    use crate::sandbox::CancelToken;

    fn sh(plugin: &str, script: &str) -> ExecutionSpec {
        ExecutionSpec::new(plugin, vec!["sh".into(), "-c".into(), script.into()])
            .with_memory_mb(0)
            .with_timeout(Duration::from_secs(10))
    }

    fn ctx(dir: &Path, job: &str) -> JobContext {
        JobContext::new(job, dir.join(job), CancelToken::new()).with_grace_period(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn captures_streams_and_declared_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh(
            "recon",
            "echo hello; echo oops >&2; echo '{\"ok\":true}' > \"$TESTUNIVERSE_OUTPUT_DIR/out.json\"; exit 0",
        )
        .with_output_file("out.json")
        .with_output_file("missing.json");
        let result = ProcessRunner::process()
            .execute(&admission("recon"), &spec, &ctx(dir.path(), "recon"))
            .await;

        assert_eq!(result.status, ExecutionStatus::Succeeded { exit_code: 0 });
        assert_eq!(result.stdout().trim(), "hello");
        assert_eq!(result.stderr().trim(), "oops");
        assert!(result.artifact("out.json").unwrap().text().contains("\"ok\""));
        assert!(result.artifact("missing.json").is_none());
        assert!(dir.path().join("recon/stdout.log").exists());
    }

    #[tokio::test]
    async fn exit_codes_follow_the_spec() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = sh("zap", "exit 3");
        spec.unreachable_exit_codes = vec![3];
        let result = ProcessRunner::process()
            .execute(&admission("zap"), &spec, &ctx(dir.path(), "zap"))
            .await;
        assert_eq!(result.status, ExecutionStatus::Unreachable { exit_code: 3 });
    }

    #[tokio::test]
    async fn timeout_kills_the_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh("slow", "echo started; sleep 30 & sleep 30; wait").with_timeout(Duration::from_millis(300));
        let started = std::time::Instant::now();
        let result = ProcessRunner::process()
            .execute(&admission("slow"), &spec, &ctx(dir.path(), "slow"))
            .await;
        assert_eq!(result.status, ExecutionStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result.stdout().trim(), "started");
        assert!(registry::get("slow").is_none());
    }

    #[tokio::test]
    async fn cancellation_stops_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let spec = sh("k6", "sleep 30");
        let ctx = ctx(dir.path(), "k6");
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });
        let result = ProcessRunner::process()
            .execute(&admission("k6"), &spec, &ctx)
            .await;
        assert_eq!(result.status, ExecutionStatus::Cancelled);

        // Already cancelled: nothing is launched
        let again = ProcessRunner::process().execute(&admission("k6"), &spec, &ctx).await;
        assert_eq!(again.status, ExecutionStatus::Cancelled);
        assert!(again.artifacts.is_empty());
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ExecutionSpec::new("ghost", vec!["/nonexistent/testuniverse-tool".into()]);
        let result = ProcessRunner::process()
            .execute(&admission("ghost"), &spec, &ctx(dir.path(), "ghost"))
            .await;
        assert!(matches!(result.status, ExecutionStatus::LaunchFailed { .. }));
    }

    #[test]
    fn docker_rendering() {
        let mut spec = ExecutionSpec::new(
            "zap-baseline",
            vec!["zap-baseline.py".into(), "-J".into(), "{output_dir}/zap.json".into()],
        )
        .with_memory_mb(2048)
        .with_env("ZAP_MODE", "baseline");
        assert!(render_docker_command("docker", &spec, Path::new("/tmp/job"), "c1").is_err());

        spec.image = Some("ghcr.io/zaproxy/zaproxy:stable".into());
        let argv = render_docker_command("docker", &spec, Path::new("/tmp/job"), "c1").unwrap();
        let joined = argv.join(" ");
        assert!(joined.starts_with("docker run --rm --name c1 --network host --memory 2048m -v /tmp/job:/out"));
        assert!(joined.contains("-e ZAP_MODE=baseline"));
        assert!(joined.ends_with("ghcr.io/zaproxy/zaproxy:stable zap-baseline.py -J /out/zap.json"));
    }

    #[test]
    fn output_names_cannot_escape() {
        assert!(safe_relative("report/out.json").is_some());
        assert!(safe_relative("../etc/passwd").is_none());
        assert!(safe_relative("/etc/passwd").is_none());
        assert_eq!(Backend::from_name("docker", "podman").unwrap().as_str(), "docker");
        assert!(Backend::from_name("vm", "docker").is_err());
    }
}
