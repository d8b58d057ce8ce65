//! Drives a [`Pipeline`] through one run.
//!
//! Steps run strictly one after another on the calling thread. The
//! orchestrator is the only writer of the [`RunState`]; a UI may read it
//! through [`Orchestrator::state`] while the run is in progress. Every
//! step error is caught here and turned into a [`StepResult`], so nothing
//! escapes a run except the final state.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, RwLock,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, info_span, warn};

use crate::{
    cmd::System,
    config::Configuration,
    env::Environment,
    error::{ExecuteError, PreconditionError, StepError},
    pipeline::Pipeline,
    report::{Event, Reporter},
    steps::{Phase, Step, StepContext},
};

// ── Cancellation ──────────────────────────────────────────────────────────────

/// Shared flag a user abort sets; steps poll it at safe checkpoints.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Run state ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    RolledBack,
}

impl StepStatus {
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Failed)
                | (Pending, Skipped)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Succeeded, RolledBack)
        )
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotStarted,
    InProgress,
    Succeeded,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Precondition,
    Step,
    Cancelled,
}

/// Why a step did not succeed, in a form the UI can show as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub stage: Option<String>,
    pub reason: String,
    pub remedy: Option<String>,
    pub recoverable: bool,
}

impl From<PreconditionError> for ErrorDetail {
    fn from(e: PreconditionError) -> Self {
        Self {
            kind: ErrorKind::Precondition,
            stage: None,
            reason: e.reason,
            remedy: e.remedy,
            recoverable: true,
        }
    }
}

impl From<StepError> for ErrorDetail {
    fn from(e: StepError) -> Self {
        Self {
            kind: ErrorKind::Step,
            stage: Some(e.stage),
            reason: e.reason,
            remedy: e.remedy,
            recoverable: e.recoverable,
        }
    }
}

impl ErrorDetail {
    fn cancelled() -> Self {
        Self {
            kind: ErrorKind::Cancelled,
            stage: None,
            reason: ExecuteError::Cancelled.to_string(),
            remedy: Some("re-run with --resume to continue".to_string()),
            recoverable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub step: String,
    pub phase: Phase,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorDetail>,
    pub output: Option<String>,
    /// Set when this step's rollback was attempted and failed.
    pub rollback_error: Option<String>,
}

impl StepResult {
    fn pending(step: &dyn Step) -> Self {
        Self {
            step: step.name().to_string(),
            phase: step.phase(),
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
            output: None,
            rollback_error: None,
        }
    }

    fn transition(&mut self, next: StepStatus) {
        debug_assert!(
            self.status.can_transition_to(next),
            "{}: {:?} -> {:?}",
            self.step,
            self.status,
            next
        );
        match next {
            StepStatus::Running => self.started_at = Some(Utc::now()),
            _ => self.finished_at = Some(Utc::now()),
        }
        self.status = next;
    }
}

/// Everything observable about one run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunState {
    pub status: RunStatus,
    pub steps: Vec<StepResult>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            status: RunStatus::NotStarted,
            steps: Vec::new(),
        }
    }
}

impl RunState {
    pub fn result(&self, step: &str) -> Option<&StepResult> {
        self.steps.iter().find(|r| r.step == step)
    }

    /// Steps whose rollback failed and need fixing by hand.
    pub fn rollback_failures(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.iter().filter(|r| r.rollback_error.is_some())
    }
}

// ── Policy ────────────────────────────────────────────────────────────────────

/// What to do once a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop and undo every revocable step that already succeeded.
    #[default]
    AbortWithRollback,
    /// Stop and leave everything as it is.
    Abort,
    /// Record recoverable step errors and keep going; anything else is
    /// handled like `AbortWithRollback`.
    ContinueOnRecoverable,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub policy: FailurePolicy,
}

/// Why the run stopped advancing early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    Failed,
    Cancelled,
}

// ── Orchestrator ──────────────────────────────────────────────────────────────

pub struct Orchestrator<'a> {
    config: &'a Configuration,
    pipeline: &'a Pipeline,
    system: &'a dyn System,
    reporter: &'a dyn Reporter,
    options: RunOptions,
    cancel: CancelToken,
    state: Arc<RwLock<RunState>>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a Configuration,
        pipeline: &'a Pipeline,
        system: &'a dyn System,
        reporter: &'a dyn Reporter,
        options: RunOptions,
    ) -> Self {
        Self {
            config,
            pipeline,
            system,
            reporter,
            options,
            cancel: CancelToken::new(),
            state: Arc::new(RwLock::new(RunState::default())),
        }
    }

    /// Handle for requesting a cooperative abort from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Live view of the run for readers on other threads.
    pub fn state(&self) -> Arc<RwLock<RunState>> {
        Arc::clone(&self.state)
    }

    fn update<R>(&self, f: impl FnOnce(&mut RunState) -> R) -> R {
        match self.state.write() {
            Ok(mut state) => f(&mut state),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn update_step(&self, index: usize, f: impl FnOnce(&mut StepResult)) {
        self.update(|state| {
            if let Some(result) = state.steps.get_mut(index) {
                f(result);
            }
        });
    }

    fn context(&self, step: &'a dyn Step) -> StepContext<'_> {
        StepContext::new(
            self.config,
            step.name(),
            self.options.dry_run,
            self.system,
            self.reporter,
            &self.cancel,
        )
    }

    /// Executes the whole pipeline against `env` and returns the final state.
    pub fn run(&self, env: &Environment) -> RunState {
        let mut env = env.clone();
        let steps = self.pipeline.steps();
        let total = steps.len();

        self.update(|state| {
            *state = RunState {
                status: RunStatus::InProgress,
                steps: Vec::with_capacity(total),
            }
        });
        info!(steps = total, dry_run = self.options.dry_run, "Installation started");

        let mut applied: Vec<usize> = Vec::new();
        let mut halt = None;
        let mut continued_past_failure = false;

        for (index, step) in steps.iter().enumerate() {
            let step = step.as_ref();
            let _span =
                info_span!("step", name = step.name(), dry_run = self.options.dry_run).entered();

            if self.cancel.is_cancelled() {
                halt = Some(Halt::Cancelled);
                break;
            }

            self.update(|state| state.steps.push(StepResult::pending(step)));

            if step.idempotent() && env.is_complete(step.name()) {
                info!("Already applied by a previous run");
                self.reporter.report(&Event::StepStarted {
                    step: step.name().to_string(),
                    phase: step.phase(),
                    index,
                    total,
                });
                self.update_step(index, |r| {
                    r.transition(StepStatus::Running);
                    r.transition(StepStatus::Succeeded);
                    r.output = Some("already applied by a previous run".to_string());
                });
                self.reporter.report(&Event::StepSucceeded {
                    step: step.name().to_string(),
                });
                continue;
            }

            if let Err(e) = step.check_precondition(self.config, &env) {
                warn!(reason = %e, "Precondition not met");
                self.reporter.report(&Event::StepFailed {
                    step: step.name().to_string(),
                    reason: e.to_string(),
                });
                self.update_step(index, |r| {
                    r.transition(StepStatus::Failed);
                    r.error = Some(e.into());
                });
                halt = Some(Halt::Failed);
                break;
            }

            self.update_step(index, |r| r.transition(StepStatus::Running));
            self.reporter.report(&Event::StepStarted {
                step: step.name().to_string(),
                phase: step.phase(),
                index,
                total,
            });

            let ctx = self.context(step);
            let outcome = step.execute(&ctx);
            let output = ctx.into_output();

            match outcome {
                Ok(()) => {
                    env.mark_complete(step.name());
                    step.apply_postconditions(self.config, &mut env);
                    applied.push(index);
                    self.update_step(index, |r| {
                        r.transition(StepStatus::Succeeded);
                        r.output = output;
                    });
                    self.reporter.report(&Event::StepSucceeded {
                        step: step.name().to_string(),
                    });
                }
                Err(ExecuteError::Cancelled) => {
                    warn!("Step cancelled");
                    self.reporter.report(&Event::StepFailed {
                        step: step.name().to_string(),
                        reason: ExecuteError::Cancelled.to_string(),
                    });
                    self.update_step(index, |r| {
                        r.transition(StepStatus::Failed);
                        r.error = Some(ErrorDetail::cancelled());
                        r.output = output;
                    });
                    halt = Some(Halt::Cancelled);
                    break;
                }
                Err(ExecuteError::Step(e)) => {
                    self.reporter.report(&Event::StepFailed {
                        step: step.name().to_string(),
                        reason: e.to_string(),
                    });
                    let keep_going = e.recoverable
                        && self.options.policy == FailurePolicy::ContinueOnRecoverable;
                    self.update_step(index, |r| {
                        r.transition(StepStatus::Failed);
                        r.error = Some(e.into());
                        r.output = output;
                    });
                    if keep_going {
                        warn!("Recoverable failure, continuing with the next step");
                        continued_past_failure = true;
                    } else {
                        halt = Some(Halt::Failed);
                        break;
                    }
                }
            }
        }

        self.update(|state| {
            for step in &steps[state.steps.len()..] {
                let mut result = StepResult::pending(step.as_ref());
                result.transition(StepStatus::Skipped);
                state.steps.push(result);
            }
        });

        if halt.is_some() && self.options.policy != FailurePolicy::Abort {
            self.roll_back(&applied);
        }

        let status = match (halt, continued_past_failure) {
            (Some(Halt::Failed), _) | (_, true) => RunStatus::Failed,
            (Some(Halt::Cancelled), false) => RunStatus::Aborted,
            (None, false) => RunStatus::Succeeded,
        };
        info!(status = ?status, "Installation finished");

        self.update(|state| {
            state.status = status;
            state.clone()
        })
    }

    /// Undoes the given steps in reverse order. A failed rollback is
    /// recorded and the remaining steps are still attempted.
    fn roll_back(&self, applied: &[usize]) {
        let steps = self.pipeline.steps();
        for &index in applied.iter().rev() {
            let step = steps[index].as_ref();
            let _span = info_span!("rollback", name = step.name(), dry_run = self.options.dry_run)
                .entered();

            if !step.revocable() {
                debug!("Not revocable, leaving in place");
                continue;
            }

            self.reporter.report(&Event::RollbackStarted {
                step: step.name().to_string(),
            });
            let ctx = self.context(step);
            let outcome = step.rollback(&ctx);
            let error = outcome.err().map(|e| e.reason);

            self.update_step(index, |r| match error {
                None => r.transition(StepStatus::RolledBack),
                Some(ref reason) => r.rollback_error = Some(reason.clone()),
            });
            self.reporter.report(&Event::RollbackResult {
                step: step.name().to_string(),
                error,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{
        cmd::HostSystem,
        config::ConfigLayer,
        error::RollbackError,
        report::MemoryReporter,
    };

    type Log = Arc<Mutex<Vec<String>>>;

    /// Records calls into a shared log instead of touching the machine.
    struct FakeStep {
        name: &'static str,
        phase: Phase,
        idempotent: bool,
        revocable: bool,
        fails_with: Option<ExecuteError>,
        rollback_fails: bool,
        cancels: bool,
        log: Log,
    }

    impl FakeStep {
        fn new(name: &'static str, phase: Phase, log: &Log) -> Self {
            Self {
                name,
                phase,
                idempotent: true,
                revocable: true,
                fails_with: None,
                rollback_fails: false,
                cancels: false,
                log: Arc::clone(log),
            }
        }

        fn boxed(self) -> Box<dyn Step> {
            Box::new(self)
        }
    }

    impl Step for FakeStep {
        fn name(&self) -> &str {
            self.name
        }

        fn phase(&self) -> Phase {
            self.phase
        }

        fn idempotent(&self) -> bool {
            self.idempotent
        }

        fn revocable(&self) -> bool {
            self.revocable
        }

        fn check_precondition(
            &self,
            _config: &Configuration,
            env: &Environment,
        ) -> Result<(), PreconditionError> {
            if !self.idempotent && env.is_complete(self.name) {
                Err(PreconditionError::new("already done"))
            } else {
                Ok(())
            }
        }

        fn execute(&self, ctx: &StepContext<'_>) -> Result<(), ExecuteError> {
            self.log.lock().unwrap().push(format!("execute {}", self.name));
            ctx.progress(50, "halfway");
            if self.cancels {
                ctx.cancel_token().cancel();
            }
            match self.fails_with {
                Some(ref e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        fn rollback(&self, _ctx: &StepContext<'_>) -> Result<(), RollbackError> {
            self.log.lock().unwrap().push(format!("rollback {}", self.name));
            if self.rollback_fails {
                Err(RollbackError::new("umount: target is busy"))
            } else {
                Ok(())
            }
        }
    }

    fn run_with(
        steps: Vec<Box<dyn Step>>,
        env: &Environment,
        policy: FailurePolicy,
    ) -> (RunState, Vec<Event>) {
        let config = ConfigLayer::defaults().validate().unwrap();
        let pipeline = Pipeline::new(steps).unwrap();
        let reporter = MemoryReporter::new();
        let options = RunOptions {
            dry_run: true,
            policy,
        };
        let state = Orchestrator::new(&config, &pipeline, &HostSystem, &reporter, options).run(env);
        (state, reporter.events())
    }

    fn run(steps: Vec<Box<dyn Step>>) -> (RunState, Vec<Event>) {
        let env = Environment::simulated(&ConfigLayer::defaults().validate().unwrap());
        run_with(steps, &env, FailurePolicy::AbortWithRollback)
    }

    fn statuses(state: &RunState) -> Vec<StepStatus> {
        state.steps.iter().map(|r| r.status).collect()
    }

    fn fatal() -> Option<ExecuteError> {
        Some(StepError::fatal("extract", "tar exited with 2").into())
    }

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn all_steps_succeed() {
        let log = log();
        let (state, events) = run(vec![
            FakeStep::new("a", Phase::DiskSetup, &log).boxed(),
            FakeStep::new("b", Phase::Stage3, &log).boxed(),
        ]);
        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(statuses(&state), vec![StepStatus::Succeeded; 2]);
        assert!(state.steps.iter().all(|r| r.started_at <= r.finished_at));
        assert_eq!(
            events.iter().filter(|e| matches!(e, Event::StepProgress { .. })).count(),
            2
        );
    }

    #[test]
    fn failure_rolls_back_revocable_predecessors_in_reverse() {
        let log = log();
        let mut not_revocable = FakeStep::new("b", Phase::Stage3, &log);
        not_revocable.revocable = false;
        let mut failing = FakeStep::new("d", Phase::Kernel, &log);
        failing.fails_with = fatal();

        let (state, events) = run(vec![
            FakeStep::new("a", Phase::DiskSetup, &log).boxed(),
            not_revocable.boxed(),
            FakeStep::new("c", Phase::PackageManager, &log).boxed(),
            failing.boxed(),
            FakeStep::new("e", Phase::Bootloader, &log).boxed(),
        ]);

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(
            statuses(&state),
            vec![
                StepStatus::RolledBack,
                StepStatus::Succeeded,
                StepStatus::RolledBack,
                StepStatus::Failed,
                StepStatus::Skipped,
            ]
        );
        assert_eq!(
            *log.lock().unwrap(),
            vec!["execute a", "execute b", "execute c", "execute d", "rollback c", "rollback a"]
        );
        assert_eq!(
            events.iter().filter(|e| matches!(e, Event::RollbackStarted { .. })).count(),
            2
        );
        let detail = state.result("d").unwrap().error.as_ref().unwrap();
        assert_eq!(detail.kind, ErrorKind::Step);
        assert_eq!(detail.stage.as_deref(), Some("extract"));
    }

    #[test]
    fn rollback_error_does_not_stop_earlier_rollbacks() {
        let log = log();
        let mut stuck = FakeStep::new("b", Phase::Stage3, &log);
        stuck.rollback_fails = true;
        let mut failing = FakeStep::new("c", Phase::Kernel, &log);
        failing.fails_with = fatal();

        let (state, _) = run(vec![
            FakeStep::new("a", Phase::DiskSetup, &log).boxed(),
            stuck.boxed(),
            failing.boxed(),
        ]);

        assert_eq!(state.status, RunStatus::Failed);
        assert!(log.lock().unwrap().ends_with(&["rollback b".to_string(), "rollback a".to_string()]));
        let b = state.result("b").unwrap();
        assert_eq!(b.status, StepStatus::Succeeded);
        assert_eq!(b.rollback_error.as_deref(), Some("umount: target is busy"));
        assert_eq!(state.result("a").unwrap().status, StepStatus::RolledBack);
        assert_eq!(state.rollback_failures().count(), 1);
    }

    #[test]
    fn abort_policy_leaves_applied_steps_alone() {
        let log = log();
        let mut failing = FakeStep::new("b", Phase::Stage3, &log);
        failing.fails_with = fatal();
        let env = Environment::simulated(&ConfigLayer::defaults().validate().unwrap());

        let (state, _) = run_with(
            vec![FakeStep::new("a", Phase::DiskSetup, &log).boxed(), failing.boxed()],
            &env,
            FailurePolicy::Abort,
        );

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(statuses(&state), vec![StepStatus::Succeeded, StepStatus::Failed]);
        assert!(!log.lock().unwrap().iter().any(|l| l.starts_with("rollback")));
    }

    #[test]
    fn recoverable_failure_can_be_skipped() {
        let log = log();
        let mut flaky = FakeStep::new("b", Phase::Stage3, &log);
        flaky.fails_with = Some(StepError::recoverable("verify", "signature server down").into());
        let env = Environment::simulated(&ConfigLayer::defaults().validate().unwrap());

        let (state, _) = run_with(
            vec![
                FakeStep::new("a", Phase::DiskSetup, &log).boxed(),
                flaky.boxed(),
                FakeStep::new("c", Phase::Kernel, &log).boxed(),
            ],
            &env,
            FailurePolicy::ContinueOnRecoverable,
        );

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(
            statuses(&state),
            vec![StepStatus::Succeeded, StepStatus::Failed, StepStatus::Succeeded]
        );
        assert!(state.result("b").unwrap().error.as_ref().unwrap().recoverable);
    }

    #[test]
    fn recoverable_failure_still_aborts_by_default() {
        let log = log();
        let mut flaky = FakeStep::new("a", Phase::DiskSetup, &log);
        flaky.fails_with = Some(StepError::recoverable("verify", "signature server down").into());
        let (state, _) = run(vec![flaky.boxed(), FakeStep::new("b", Phase::Stage3, &log).boxed()]);
        assert_eq!(statuses(&state), vec![StepStatus::Failed, StepStatus::Skipped]);
    }

    #[test]
    fn cancellation_between_steps_aborts() {
        let log = log();
        let mut cancelling = FakeStep::new("a", Phase::DiskSetup, &log);
        cancelling.cancels = true;

        let (state, _) = run(vec![cancelling.boxed(), FakeStep::new("b", Phase::Stage3, &log).boxed()]);

        assert_eq!(state.status, RunStatus::Aborted);
        assert_eq!(statuses(&state), vec![StepStatus::RolledBack, StepStatus::Skipped]);
    }

    #[test]
    fn cancelled_step_is_distinct_from_failure() {
        let log = log();
        let mut interrupted = FakeStep::new("b", Phase::Stage3, &log);
        interrupted.fails_with = Some(ExecuteError::Cancelled);

        let (state, _) = run(vec![
            FakeStep::new("a", Phase::DiskSetup, &log).boxed(),
            interrupted.boxed(),
            FakeStep::new("c", Phase::Kernel, &log).boxed(),
        ]);

        assert_eq!(state.status, RunStatus::Aborted);
        let b = state.result("b").unwrap();
        assert_eq!(b.status, StepStatus::Failed);
        assert_eq!(b.error.as_ref().unwrap().kind, ErrorKind::Cancelled);
        assert_eq!(state.result("c").unwrap().status, StepStatus::Skipped);
    }

    #[test]
    fn resumed_idempotent_step_is_a_no_op() {
        let log = log();
        let mut env = Environment::simulated(&ConfigLayer::defaults().validate().unwrap());
        env.mark_complete("a");

        let (state, _) = run_with(
            vec![
                FakeStep::new("a", Phase::DiskSetup, &log).boxed(),
                FakeStep::new("b", Phase::Stage3, &log).boxed(),
            ],
            &env,
            FailurePolicy::AbortWithRollback,
        );

        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(*log.lock().unwrap(), vec!["execute b"]);
        assert_eq!(
            state.result("a").unwrap().output.as_deref(),
            Some("already applied by a previous run")
        );
    }

    #[test]
    fn resumed_non_idempotent_step_fails_its_precondition() {
        let log = log();
        let mut once = FakeStep::new("a", Phase::DiskSetup, &log);
        once.idempotent = false;
        let mut env = Environment::simulated(&ConfigLayer::defaults().validate().unwrap());
        env.mark_complete("a");

        let (state, _) = run_with(vec![once.boxed()], &env, FailurePolicy::AbortWithRollback);

        assert_eq!(state.status, RunStatus::Failed);
        let a = state.result("a").unwrap();
        assert_eq!(a.error.as_ref().unwrap().kind, ErrorKind::Precondition);
        assert!(a.started_at.is_none());
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        use StepStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Succeeded.can_transition_to(RolledBack));
        assert!(!Failed.can_transition_to(RolledBack));
        assert!(!Skipped.can_transition_to(Running));
        assert!(RolledBack.is_terminal());
        assert!(!Running.is_terminal());
    }
}
