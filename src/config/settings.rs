//! Kernel settings (TOML)

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{ConfigError, ENV_CONFIG, ENV_OUTPUT_DIR, ENV_TOKEN_KEY, global_config_path};

/// Project-local settings file, checked before the global one
pub const LOCAL_SETTINGS_FILE: &str = "aiciv.toml";

fn default_max_workers() -> usize {
    4
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("testuniverse-output")
}

fn default_probe_reachability() -> bool {
    true
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_backend() -> String {
    "process".to_string()
}

fn default_memory_budget_mb() -> u64 {
    8192
}

fn default_grace_period_secs() -> u64 {
    10
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

/// Sandbox backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSettings {
    /// `process` or `docker`
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Total memory the scheduler may hand out to concurrent jobs
    #[serde(default = "default_memory_budget_mb")]
    pub memory_budget_mb: u64,

    /// Delay between SIGTERM and SIGKILL on cancellation
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,

    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            memory_budget_mb: default_memory_budget_mb(),
            grace_period_secs: default_grace_period_secs(),
            docker_binary: default_docker_binary(),
        }
    }
}

/// General kernel settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Worker pool size when the plan does not set one
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Root for run directories, histories and baselines
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    #[serde(default)]
    pub sandbox: SandboxSettings,

    /// Extra directories searched for `plugin.yaml` manifests
    #[serde(default)]
    pub plugin_dirs: Vec<PathBuf>,

    /// Probe the target before scheduling and fail fast when it is down
    #[serde(default = "default_probe_reachability")]
    pub probe_reachability: bool,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Secret that signed environment and Attack Mode tokens are checked
    /// against. Never written back out.
    #[serde(default, skip_serializing)]
    pub token_key: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            output_dir: default_output_dir(),
            sandbox: SandboxSettings::default(),
            plugin_dirs: Vec::new(),
            probe_reachability: default_probe_reachability(),
            probe_timeout_secs: default_probe_timeout_secs(),
            token_key: None,
        }
    }
}

impl Settings {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Settings = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Settings file to use: an explicit path, else `./aiciv.toml`, else the
    /// global file, whichever exists first
    pub fn locate(explicit: Option<&Path>, cwd: &Path) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        [cwd.join(LOCAL_SETTINGS_FILE), global_config_path()]
            .into_iter()
            .find(|p| p.is_file())
    }

    /// Resolve settings for a run.
    ///
    /// `TESTUNIVERSE_CONFIG` names an explicit file (which must exist);
    /// `TESTUNIVERSE_OUTPUT_DIR` overrides `output_dir` and
    /// `TESTUNIVERSE_TOKEN_KEY` overrides `token_key`. Variables are read
    /// through `env` so callers decide where they come from.
    pub fn resolve(
        explicit: Option<&Path>,
        cwd: &Path,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let from_env = env(ENV_CONFIG).filter(|v| !v.trim().is_empty()).map(PathBuf::from);
        let explicit = explicit.map(Path::to_path_buf).or(from_env);

        let mut settings = match Self::locate(explicit.as_deref(), cwd) {
            Some(path) => {
                tracing::debug!("Loading settings from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };

        if let Some(dir) = env(ENV_OUTPUT_DIR).filter(|v| !v.trim().is_empty()) {
            settings.output_dir = PathBuf::from(dir);
        }
        if let Some(key) = env(ENV_TOKEN_KEY).filter(|v| !v.trim().is_empty()) {
            settings.token_key = Some(key);
        }
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".to_string()));
        }
        if !matches!(self.sandbox.backend.as_str(), "process" | "docker") {
            return Err(ConfigError::Invalid(format!(
                "sandbox.backend must be 'process' or 'docker', got '{}'",
                self.sandbox.backend
            )));
        }
        if self.sandbox.memory_budget_mb == 0 {
            return Err(ConfigError::Invalid(
                "sandbox.memory_budget_mb must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn every_field_has_a_default() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.sandbox.grace_period_secs, 10);
        assert!(settings.probe_reachability);
    }

    #[test]
    fn parses_toml() {
        let settings: Settings = toml::from_str(
            r#"
max_workers = 8
output_dir = "/var/lib/testuniverse"
plugin_dirs = ["./plugins"]

[sandbox]
backend = "docker"
memory_budget_mb = 4096
"#,
        )
        .unwrap();
        assert_eq!(settings.max_workers, 8);
        assert_eq!(settings.sandbox.backend, "docker");
        assert_eq!(settings.sandbox.docker_binary, "docker");
        assert_eq!(settings.plugin_dirs, vec![PathBuf::from("./plugins")]);
    }

    #[test]
    fn local_file_wins_and_env_overrides_output() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LOCAL_SETTINGS_FILE), "max_workers = 2\n").unwrap();

        let settings = Settings::resolve(None, dir.path(), &no_env).unwrap();
        assert_eq!(settings.max_workers, 2);

        let env = |name: &str| (name == ENV_OUTPUT_DIR).then(|| "/tmp/tu-out".to_string());
        let settings = Settings::resolve(None, dir.path(), &env).unwrap();
        assert_eq!(settings.output_dir, PathBuf::from("/tmp/tu-out"));
    }

    #[test]
    fn token_key_comes_from_env_and_is_not_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let env = |name: &str| (name == ENV_TOKEN_KEY).then(|| "issuer-secret".to_string());
        let settings = Settings::resolve(None, dir.path(), &env).unwrap();
        assert_eq!(settings.token_key.as_deref(), Some("issuer-secret"));
        assert!(!toml::to_string(&settings).unwrap().contains("issuer-secret"));
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = |name: &str| (name == ENV_CONFIG).then(|| "/nonexistent/aiciv.toml".to_string());
        assert!(matches!(
            Settings::resolve(None, dir.path(), &env),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn rejects_unknown_backend() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[sandbox]\nbackend = \"vm\"\n").unwrap();
        assert!(matches!(Settings::from_file(&path), Err(ConfigError::Invalid(_))));
    }
}
