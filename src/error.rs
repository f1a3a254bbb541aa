//! Run-level error taxonomy and its exit-code classification

use crate::config::ConfigError;
use crate::dag::PlanError;
use crate::domain::ExitCode;
use crate::sandbox::SandboxError;

/// Errors that end a run. Each one maps to exactly one exit code.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("Authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("Out of scope: {0}")]
    OutOfScope(String),

    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("Timebox of {0}s exceeded")]
    Timeout(u64),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid plan: {0}")]
    Plan(#[from] PlanError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl KernelError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            KernelError::AuthorizationDenied(_) | KernelError::OutOfScope(_) => {
                ExitCode::AuthBlocked
            }
            KernelError::TargetUnreachable(_) => ExitCode::TargetUnreachable,
            KernelError::Timeout(_) => ExitCode::Timeout,
            KernelError::Config(_)
            | KernelError::Plan(_)
            | KernelError::Sandbox(_)
            | KernelError::Io(_)
            | KernelError::Internal(_) => ExitCode::InternalError,
        }
    }
}

impl From<anyhow::Error> for KernelError {
    fn from(err: anyhow::Error) -> Self {
        KernelError::Internal(format!("{:#}", err))
    }
}

/// Exit code for an arbitrary error surfaced at the CLI boundary
pub fn classify(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<KernelError>() {
        Some(kernel) => kernel.exit_code(),
        None => ExitCode::InternalError,
    }
}
