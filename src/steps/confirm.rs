//! Human-in-the-loop gate before anything destructive happens.
//!
//! The step blocks on a decision channel instead of talking to a terminal;
//! whatever holds the [`ConfirmationPrompt`] end (a dialoguer prompt, a
//! test) answers it.

use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::{
    config::Configuration,
    env::Environment,
    error::{ExecuteError, PreconditionError, StepError},
    steps::{Phase, Step, StepContext},
};

pub const NAME: &str = "confirm-destructive";

/// How often the wait wakes up to look at the cancel token.
const POLL: Duration = Duration::from_millis(200);

/// What the user is asked to approve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmRequest {
    pub disk: String,
    pub summary: String,
}

impl ConfirmRequest {
    pub fn for_config(config: &Configuration) -> Self {
        let layout = config
            .partitions
            .iter()
            .map(|p| format!("{} {} {}", p.mount_point, p.size, p.filesystem))
            .collect::<Vec<_>>()
            .join(", ");
        Self {
            disk: config.target_disk.clone(),
            summary: format!(
                "ALL data on {} will be erased and replaced by: {}",
                config.target_disk, layout
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Proceed,
    /// Stop so the user can edit the configuration and re-run.
    Edit,
    Cancel,
}

/// Step side of the decision channel.
#[derive(Debug)]
pub struct ConfirmationGate {
    requests: Sender<ConfirmRequest>,
    decisions: Receiver<Decision>,
    timeout: Duration,
}

/// Answering side of the decision channel.
#[derive(Debug)]
pub struct ConfirmationPrompt {
    requests: Receiver<ConfirmRequest>,
    decisions: Sender<Decision>,
}

impl ConfirmationPrompt {
    /// Blocks until the step asks; `None` once the step side is gone.
    pub fn next_request(&self) -> Option<ConfirmRequest> {
        self.requests.recv().ok()
    }

    /// Returns `false` when nobody is waiting for the answer any more.
    pub fn answer(&self, decision: Decision) -> bool {
        self.decisions.send(decision).is_ok()
    }
}

/// Creates a connected gate/prompt pair. The step waits at most `timeout`
/// for an answer.
pub fn channel(timeout: Duration) -> (ConfirmationGate, ConfirmationPrompt) {
    let (request_tx, request_rx) = bounded(1);
    let (decision_tx, decision_rx) = bounded(1);
    (
        ConfirmationGate {
            requests: request_tx,
            decisions: decision_rx,
            timeout,
        },
        ConfirmationPrompt {
            requests: request_rx,
            decisions: decision_tx,
        },
    )
}

/// Asks for explicit approval before the disk is wiped.
#[derive(Debug)]
pub struct ConfirmStep {
    gate: ConfirmationGate,
}

impl ConfirmStep {
    pub fn new(gate: ConfirmationGate) -> Self {
        Self { gate }
    }

    fn wait(&self, ctx: &StepContext<'_>) -> Result<Decision, ExecuteError> {
        let deadline = Instant::now() + self.gate.timeout;
        loop {
            ctx.checkpoint()?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StepError::recoverable(
                    "confirm",
                    format!("no answer within {}s", self.gate.timeout.as_secs()),
                )
                .with_remedy("re-run and confirm, or pass --yes")
                .into());
            }
            match self.gate.decisions.recv_timeout(remaining.min(POLL)) {
                Ok(decision) => return Ok(decision),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(StepError::recoverable("confirm", "confirmation prompt went away")
                        .with_remedy("re-run with --yes to skip the prompt")
                        .into());
                }
            }
        }
    }
}

impl Step for ConfirmStep {
    fn name(&self) -> &str {
        NAME
    }

    fn phase(&self) -> Phase {
        Phase::DiskSetup
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn revocable(&self) -> bool {
        false
    }

    fn check_precondition(
        &self,
        _config: &Configuration,
        _env: &Environment,
    ) -> Result<(), PreconditionError> {
        Ok(())
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<(), ExecuteError> {
        let request = ConfirmRequest::for_config(ctx.config());
        if ctx.dry_run() {
            ctx.progress(100, format!("[dry-run] would ask: {}", request.summary));
            return Ok(());
        }

        // answers left over from an earlier, timed-out question
        while self.gate.decisions.try_recv().is_ok() {}

        ctx.progress(0, format!("Waiting for confirmation to erase {}", request.disk));
        if self.gate.requests.send(request).is_err() {
            return Err(StepError::recoverable("confirm", "confirmation prompt went away")
                .with_remedy("re-run with --yes to skip the prompt")
                .into());
        }

        match self.wait(ctx)? {
            Decision::Proceed => {
                debug!("Destructive operations confirmed");
                ctx.progress(100, "Confirmed");
                Ok(())
            }
            Decision::Edit => Err(StepError::recoverable("confirm", "user chose to edit the configuration")
                .with_remedy("edit the configuration file and re-run")
                .into()),
            Decision::Cancel => {
                warn!("User declined the destructive operations");
                Err(ExecuteError::Cancelled)
            }
        }
    }
}
