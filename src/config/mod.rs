//! Configuration loading: YAML run files, TOML kernel settings, environment

mod io;
mod run_file;
mod settings;

use std::path::PathBuf;

pub use io::{global_config_dir, global_config_path, write_atomic};
pub use run_file::{MAX_EXTENDS_DEPTH, RunConfig, load_policy_file, merge_policy, target_from_url};
pub use settings::{LOCAL_SETTINGS_FILE, SandboxSettings, Settings};

/// Signed authorization proof token
pub const ENV_AUTH_PROOF: &str = "TESTUNIVERSE_AUTH_PROOF";
/// Pre-approved Attack Mode token
pub const ENV_ATTACK_TOKEN: &str = "TESTUNIVERSE_ATTACK_TOKEN";
pub const ENV_LOG_LEVEL: &str = "TESTUNIVERSE_LOG_LEVEL";
/// Explicit settings file
pub const ENV_CONFIG: &str = "TESTUNIVERSE_CONFIG";
pub const ENV_OUTPUT_DIR: &str = "TESTUNIVERSE_OUTPUT_DIR";
/// Shared secret for signed authorization and Attack Mode tokens
pub const ENV_TOKEN_KEY: &str = "TESTUNIVERSE_TOKEN_KEY";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Policy inheritance cycle through {}", .0.display())]
    InheritanceCycle(PathBuf),

    #[error("Policy inheritance deeper than {max} levels at {}", path.display())]
    InheritanceTooDeep { path: PathBuf, max: usize },

    #[error("{0}")]
    Invalid(String),

    #[error("Missing {0}: pass a run file or a target URL")]
    Missing(&'static str),
}
