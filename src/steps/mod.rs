//! The step contract and the built-in installation steps.

pub mod bootloader;
pub mod confirm;
pub mod disk;
pub mod finalize;
pub mod kernel;
pub mod portage;
pub mod stage3;
pub mod system;

use std::{fmt, path::Path, sync::Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    cmd::{Invocation, System},
    config::Configuration,
    env::Environment,
    error::{ExecuteError, PreconditionError, RollbackError, StepError},
    orchestrator::CancelToken,
    report::{Event, Reporter},
};

// ── Phases ────────────────────────────────────────────────────────────────────

/// Installation phases in their fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    DiskSetup,
    Stage3,
    PackageManager,
    Kernel,
    Bootloader,
    SystemConfig,
    Finalization,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::DiskSetup,
        Phase::Stage3,
        Phase::PackageManager,
        Phase::Kernel,
        Phase::Bootloader,
        Phase::SystemConfig,
        Phase::Finalization,
    ];

    pub fn ordinal(self) -> usize {
        self as usize
    }

    pub fn title(self) -> &'static str {
        match self {
            Phase::DiskSetup => "Disk Setup",
            Phase::Stage3 => "Stage3 Extraction",
            Phase::PackageManager => "Package-Manager Configuration",
            Phase::Kernel => "Kernel",
            Phase::Bootloader => "Bootloader",
            Phase::SystemConfig => "System Configuration",
            Phase::Finalization => "Finalization",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

// ── Step contract ─────────────────────────────────────────────────────────────

/// One unit of installation work.
///
/// Steps hold no state between runs. Everything they need arrives through
/// the [`Configuration`], the [`Environment`] snapshot and the
/// [`StepContext`]; everything they produce leaves through return values
/// and the reporter.
pub trait Step: Send + Sync {
    /// Stable identifier, used in logs, results and the session file.
    fn name(&self) -> &str;

    fn phase(&self) -> Phase;

    /// Safe to execute again after a previous run already applied it.
    fn idempotent(&self) -> bool;

    /// Has a meaningful undo.
    fn revocable(&self) -> bool;

    /// Whether this configuration needs the step at all.
    fn applicable(&self, _config: &Configuration) -> bool {
        true
    }

    /// Side-effect-free readiness check.
    fn check_precondition(
        &self,
        config: &Configuration,
        env: &Environment,
    ) -> Result<(), PreconditionError>;

    fn execute(&self, ctx: &StepContext<'_>) -> Result<(), ExecuteError>;

    /// Best-effort undo. Only called for revocable steps.
    fn rollback(&self, _ctx: &StepContext<'_>) -> Result<(), RollbackError> {
        Ok(())
    }

    /// Records what later steps may assume once this one succeeded.
    fn apply_postconditions(&self, _config: &Configuration, _env: &mut Environment) {}
}

// ── Execution context ─────────────────────────────────────────────────────────

/// Everything a running step may touch. All system effects go through
/// [`StepContext::run`], [`StepContext::write`] and [`StepContext::remove`],
/// which simulate under dry-run.
pub struct StepContext<'a> {
    config: &'a Configuration,
    step: &'a str,
    dry_run: bool,
    system: &'a dyn System,
    reporter: &'a dyn Reporter,
    cancel: &'a CancelToken,
    output: Mutex<Vec<String>>,
}

impl<'a> StepContext<'a> {
    pub fn new(
        config: &'a Configuration,
        step: &'a str,
        dry_run: bool,
        system: &'a dyn System,
        reporter: &'a dyn Reporter,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            config,
            step,
            dry_run,
            system,
            reporter,
            cancel,
            output: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &'a Configuration {
        self.config
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn cancel_token(&self) -> &CancelToken {
        self.cancel
    }

    /// Reports incremental progress for the running step.
    pub fn progress(&self, percent: u8, message: impl Into<String>) {
        self.reporter.report(&Event::StepProgress {
            step: self.step.to_string(),
            percent: percent.min(100),
            message: message.into(),
        });
    }

    /// A safe point to stop at. Returns `Cancelled` once cancellation was
    /// requested.
    pub fn checkpoint(&self) -> Result<(), ExecuteError> {
        if self.cancel.is_cancelled() {
            info!("Cancellation requested, stopping at checkpoint");
            Err(ExecuteError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs a privileged command, or describes it under dry-run.
    pub fn run(&self, stage: &str, invocation: Invocation) -> Result<String, ExecuteError> {
        self.checkpoint()?;
        if self.dry_run {
            self.simulate(format!("[dry-run] would run: {}", invocation));
            return Ok(String::new());
        }
        info!("running: {}", invocation);
        let stdout = self
            .system
            .run(&invocation)
            .map_err(|e| e.into_step_error(stage))?;
        self.capture(&invocation.to_string(), &stdout);
        Ok(stdout)
    }

    pub fn write(&self, stage: &str, path: &Path, contents: &str) -> Result<(), ExecuteError> {
        self.checkpoint()?;
        if self.dry_run {
            self.simulate(format!(
                "[dry-run] would write {} ({} bytes)",
                path.display(),
                contents.len()
            ));
            return Ok(());
        }
        info!("writing {}", path.display());
        self.system
            .write_file(path, contents)
            .map_err(|e| StepError::fatal(stage, format!("cannot write {}: {}", path.display(), e)))?;
        Ok(())
    }

    pub fn remove(&self, stage: &str, path: &Path) -> Result<(), ExecuteError> {
        self.checkpoint()?;
        if self.dry_run {
            self.simulate(format!("[dry-run] would remove {}", path.display()));
            return Ok(());
        }
        info!("removing {}", path.display());
        self.system
            .remove_file(path)
            .map_err(|e| StepError::fatal(stage, format!("cannot remove {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Whether `path` is already there. Always `false` under dry-run, where
    /// nothing on the host is consulted.
    pub fn exists(&self, path: &Path) -> bool {
        !self.dry_run && self.system.exists(path)
    }

    /// Rollback counterpart of [`StepContext::run`]; ignores cancellation.
    pub fn undo(&self, invocation: Invocation) -> Result<(), RollbackError> {
        if self.dry_run {
            info!("[dry-run] would undo with: {}", invocation);
            return Ok(());
        }
        info!("undo: {}", invocation);
        self.system
            .run(&invocation)
            .map(|_| ())
            .map_err(|e| RollbackError::new(format!("{}: {}", invocation, e)))
    }

    pub fn undo_remove(&self, path: &Path) -> Result<(), RollbackError> {
        if self.dry_run {
            info!("[dry-run] would remove {}", path.display());
            return Ok(());
        }
        info!("undo: removing {}", path.display());
        self.system
            .remove_file(path)
            .map_err(|e| RollbackError::new(format!("cannot remove {}: {}", path.display(), e)))
    }

    /// Under dry-run the output lists what would have happened.
    fn simulate(&self, description: String) {
        info!("{}", description);
        if let Ok(mut output) = self.output.lock() {
            output.push(description);
        }
    }

    fn capture(&self, command: &str, stdout: &str) {
        if stdout.trim().is_empty() {
            return;
        }
        if let Ok(mut output) = self.output.lock() {
            output.push(format!("$ {}\n{}", command, stdout.trim_end()));
        }
    }

    /// Output captured from commands run so far, if any.
    pub fn into_output(self) -> Option<String> {
        let output = self.output.into_inner().unwrap_or_default();
        if output.is_empty() {
            None
        } else {
            Some(output.join("\n"))
        }
    }
}

/// Runs every undo action, keeps going past failures and reports them all.
pub(crate) fn undo_all(
    actions: impl IntoIterator<Item = Result<(), RollbackError>>,
) -> Result<(), RollbackError> {
    let failures: Vec<String> = actions
        .into_iter()
        .filter_map(|r| r.err().map(|e| e.reason))
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(RollbackError::new(failures.join("; ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_ordered() {
        let mut sorted = Phase::ALL;
        sorted.sort();
        assert_eq!(sorted, Phase::ALL);
        assert_eq!(Phase::DiskSetup.ordinal(), 0);
        assert_eq!(Phase::Finalization.ordinal(), 6);
    }

    #[test]
    fn undo_all_collects_every_failure() {
        let result = undo_all(vec![
            Err(RollbackError::new("swapoff failed")),
            Ok(()),
            Err(RollbackError::new("umount failed")),
        ]);
        assert_eq!(result.unwrap_err().reason, "swapoff failed; umount failed");
    }
}
