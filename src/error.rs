use std::{fmt, io, path::PathBuf};

use thiserror::Error;

// ── Binary-level errors ───────────────────────────────────────────────────────

/// Errors that stop the installer before the orchestrator takes over.
#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("This installer must be run as root (sudo)")]
    NotRoot,

    #[error("Missing required tools: {}", .0.join(", "))]
    MissingTools(Vec<String>),

    #[error("Prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),

    #[error(transparent)]
    Pipeline(#[from] crate::pipeline::OrderError),
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// One problem found while validating a merged configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub reason: String,
}

impl Violation {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.reason)
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("invalid YAML in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("{} configuration problem(s):\n{}", .0.len(), format_violations(.0))]
    Invalid(Vec<Violation>),
}

impl ConfigError {
    /// All violations carried by this error (empty for read/parse failures).
    pub fn violations(&self) -> &[Violation] {
        match self {
            ConfigError::Invalid(v) => v,
            _ => &[],
        }
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("  - {}", v))
        .collect::<Vec<_>>()
        .join("\n")
}

// ── Step errors ───────────────────────────────────────────────────────────────

/// The environment is not ready for a step.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct PreconditionError {
    pub reason: String,
    pub remedy: Option<String>,
}

impl PreconditionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            remedy: None,
        }
    }

    pub fn with_remedy(mut self, remedy: impl Into<String>) -> Self {
        self.remedy = Some(remedy.into());
        self
    }
}

/// A privileged operation failed while a step was executing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{stage}: {reason}")]
pub struct StepError {
    pub stage: String,
    pub reason: String,
    pub recoverable: bool,
    pub remedy: Option<String>,
}

impl StepError {
    pub fn fatal(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            reason: reason.into(),
            recoverable: false,
            remedy: None,
        }
    }

    pub fn recoverable(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            recoverable: true,
            ..Self::fatal(stage, reason)
        }
    }

    pub fn with_remedy(mut self, remedy: impl Into<String>) -> Self {
        self.remedy = Some(remedy.into());
        self
    }
}

/// Outcome of `Step::execute` when it did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecuteError {
    #[error(transparent)]
    Step(#[from] StepError),

    #[error("Installation cancelled by user")]
    Cancelled,
}

/// Cleanup of a previously succeeded step failed. Reported, never fatal.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct RollbackError {
    pub reason: String,
}

impl RollbackError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

// ── Black-box system operations ───────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Command '{program}' failed with exit code {code}")]
    Failed {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("Command '{0}' not found, is it installed?")]
    NotFound(String),
}

impl CommandError {
    /// Converts into a step failure, attaching a remedy where one is known.
    pub fn into_step_error(self, stage: &str) -> StepError {
        match self {
            CommandError::NotFound(ref program) => {
                let pkg = crate::cmd::package_for(program);
                StepError::fatal(stage, self.to_string())
                    .with_remedy(format!("emerge --ask {} on the install medium", pkg))
            }
            CommandError::Failed { ref stderr, .. } if !stderr.trim().is_empty() => {
                let reason = format!("{} ({})", self, stderr.trim());
                StepError::fatal(stage, reason)
            }
            other => StepError::fatal(stage, other.to_string()),
        }
    }
}
