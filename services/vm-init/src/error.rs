//! Error types for the in-VM init.

use thiserror::Error;

/// Init errors with standardized reason codes.
///
/// Every variant is fatal: once the workload replaces this process there is
/// no recovery, so any step that fails must fail fast and loudly.
#[derive(Debug, Error)]
pub enum InitError {
    /// Could not read the run config shipped in the initrd.
    #[error("config_read_failed: {0}")]
    ConfigRead(String),

    /// Could not parse the run config JSON.
    #[error("config_parse_failed: {0}")]
    ConfigParse(String),

    /// Pseudo-filesystem mount failed.
    #[error("mount_failed: {target}: {detail}")]
    MountFailed { target: String, detail: String },

    /// Guest network configuration failed.
    #[error("net_config_failed: {0}")]
    NetConfigFailed(String),

    /// Resolved argv is empty after override resolution.
    #[error("empty_argv: no entrypoint or cmd to execute")]
    EmptyArgv,

    /// argv[0] could not be resolved against the computed PATH.
    #[error("executable_not_found: {0}")]
    ExecutableNotFound(String),

    /// Changing into the working directory failed.
    #[error("workdir_failed: {dir}: {detail}")]
    WorkdirFailed { dir: String, detail: String },

    /// The final exec call itself failed.
    #[error("exec_failed: {0}")]
    ExecFailed(String),
}

impl InitError {
    /// Standardized reason code for this error.
    pub fn reason_code(&self) -> &'static str {
        match self {
            InitError::ConfigRead(_) => "config_read_failed",
            InitError::ConfigParse(_) => "config_parse_failed",
            InitError::MountFailed { .. } => "mount_failed",
            InitError::NetConfigFailed(_) => "net_config_failed",
            InitError::EmptyArgv => "empty_argv",
            InitError::ExecutableNotFound(_) => "executable_not_found",
            InitError::WorkdirFailed { .. } => "workdir_failed",
            InitError::ExecFailed(_) => "exec_failed",
        }
    }
}
