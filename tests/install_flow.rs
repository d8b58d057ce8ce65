//! Whole-pipeline runs against a recording stand-in for the host.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use gentoo_installer::{
    cmd::{Invocation, System},
    config::{ConfigLayer, Configuration},
    env::Environment,
    error::{CommandError, ExecuteError, PreconditionError, RollbackError, StepError},
    master_steps,
    orchestrator::{
        CancelToken, ErrorKind, FailurePolicy, Orchestrator, RunOptions, RunState, RunStatus,
        StepStatus,
    },
    report::{Event, Fanout, MemoryReporter},
    session::{Session, SessionRecorder},
    steps::{confirm, disk, finalize, portage, stage3, Phase, Step, StepContext},
    Pipeline,
};

// ── Test doubles ──────────────────────────────────────────────────────────────

/// Records every effect instead of performing it. A command whose text
/// contains the `fail_on` needle exits non-zero. Files it was told to
/// write or copy count as present afterwards.
#[derive(Default)]
struct RecordingSystem {
    calls: Mutex<Vec<String>>,
    present: Mutex<BTreeSet<PathBuf>>,
    fail_on: Mutex<Option<&'static str>>,
}

impl RecordingSystem {
    fn failing_on(needle: &'static str) -> Self {
        let system = Self::default();
        *system.fail_on.lock().unwrap() = Some(needle);
        system
    }

    fn stop_failing(&self) {
        *self.fail_on.lock().unwrap() = None;
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn position(&self, needle: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.contains(needle))
    }

    fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

impl System for RecordingSystem {
    fn run(&self, invocation: &Invocation) -> Result<String, CommandError> {
        let line = invocation.to_string();
        self.calls.lock().unwrap().push(line.clone());
        if let Some(needle) = *self.fail_on.lock().unwrap() {
            if line.contains(needle) {
                return Err(CommandError::Failed {
                    program: invocation.program.clone(),
                    code: 2,
                    stderr: "simulated failure".to_string(),
                });
            }
        }
        if invocation.program == "cp" {
            if let Some(target) = invocation.args.last() {
                self.present.lock().unwrap().insert(PathBuf::from(target));
            }
        }
        Ok(String::new())
    }

    fn write_file(&self, path: &Path, _contents: &str) -> Result<(), CommandError> {
        self.calls.lock().unwrap().push(format!("write {}", path.display()));
        self.present.lock().unwrap().insert(path.to_path_buf());
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<(), CommandError> {
        self.calls.lock().unwrap().push(format!("remove {}", path.display()));
        self.present.lock().unwrap().remove(path);
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.present.lock().unwrap().contains(path)
    }
}

/// Counts rollbacks of the wrapped step.
struct RollbackSpy<S> {
    inner: S,
    rollbacks: Arc<AtomicUsize>,
}

impl<S: Step> Step for RollbackSpy<S> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn phase(&self) -> Phase {
        self.inner.phase()
    }

    fn idempotent(&self) -> bool {
        self.inner.idempotent()
    }

    fn revocable(&self) -> bool {
        self.inner.revocable()
    }

    fn check_precondition(
        &self,
        config: &Configuration,
        env: &Environment,
    ) -> Result<(), PreconditionError> {
        self.inner.check_precondition(config, env)
    }

    fn execute(&self, ctx: &StepContext<'_>) -> Result<(), ExecuteError> {
        self.inner.execute(ctx)
    }

    fn rollback(&self, ctx: &StepContext<'_>) -> Result<(), RollbackError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        self.inner.rollback(ctx)
    }

    fn apply_postconditions(&self, config: &Configuration, env: &mut Environment) {
        self.inner.apply_postconditions(config, env)
    }
}

/// The real stage3 step with an extraction that always breaks.
struct BrokenStage3;

impl Step for BrokenStage3 {
    fn name(&self) -> &str {
        stage3::NAME
    }

    fn phase(&self) -> Phase {
        Phase::Stage3
    }

    fn idempotent(&self) -> bool {
        true
    }

    fn revocable(&self) -> bool {
        false
    }

    fn check_precondition(
        &self,
        config: &Configuration,
        env: &Environment,
    ) -> Result<(), PreconditionError> {
        stage3::Stage3Extraction.check_precondition(config, env)
    }

    fn execute(&self, _ctx: &StepContext<'_>) -> Result<(), ExecuteError> {
        Err(StepError::fatal("extract", "tarball is corrupt").into())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

const BIOS_EXT4: &str = "
target_disk: /dev/sda
partitions:
  - { mount_point: /, size: 100%, filesystem: ext4 }
bootloader: grub
";

fn config(yaml: &str) -> Configuration {
    ConfigLayer::defaults()
        .merge(ConfigLayer::from_yaml(yaml).unwrap())
        .validate()
        .unwrap()
}

fn run(
    config: &Configuration,
    pipeline: &Pipeline,
    system: &dyn System,
    env: &Environment,
    dry_run: bool,
) -> (RunState, Vec<Event>) {
    let reporter = MemoryReporter::new();
    let options = RunOptions {
        dry_run,
        ..Default::default()
    };
    let state = Orchestrator::new(config, pipeline, system, &reporter, options).run(env);
    (state, reporter.events())
}

/// What a resumed run would see after `state`: the steps it completed and
/// the mounts disk setup left in place.
fn env_after(config: &Configuration, completed: &BTreeSet<String>) -> Environment {
    let mut env = Environment::simulated(config);
    for step in completed {
        env.mark_complete(step);
    }
    if env.is_complete(disk::NAME) {
        disk::DiskSetup.apply_postconditions(config, &mut env);
    }
    env
}

fn completed_in(state: &RunState) -> BTreeSet<String> {
    state
        .steps
        .iter()
        .filter(|r| r.status == StepStatus::Succeeded)
        .map(|r| r.step.clone())
        .collect()
}

fn statuses(state: &RunState) -> Vec<StepStatus> {
    state.steps.iter().map(|r| r.status).collect()
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[test]
fn dry_run_walks_all_seven_phases_without_touching_the_host() {
    let config = config(BIOS_EXT4);
    let pipeline = Pipeline::build(master_steps(None), &config).unwrap();
    let system = RecordingSystem::default();

    let (state, events) = run(&config, &pipeline, &system, &Environment::simulated(&config), true);

    assert_eq!(state.status, RunStatus::Succeeded);
    assert_eq!(state.steps.len(), 7);
    assert!(state.steps.iter().all(|r| r.status == StepStatus::Succeeded));
    assert!(system.calls().is_empty());

    let started = events
        .iter()
        .filter(|e| matches!(e, Event::StepStarted { .. }))
        .count();
    assert_eq!(started, 7);
    let output = state.result(disk::NAME).and_then(|r| r.output.clone()).unwrap();
    assert!(output.contains("[dry-run] would run: wipefs --all /dev/sda"));
}

#[test]
fn real_run_issues_commands_in_pipeline_order() {
    let config = config("");
    let pipeline = Pipeline::build(master_steps(None), &config).unwrap();
    let system = RecordingSystem::default();

    let (state, _) = run(&config, &pipeline, &system, &Environment::simulated(&config), false);

    assert_eq!(state.status, RunStatus::Succeeded, "{:?}", state.steps);
    let calls = system.calls();
    assert_eq!(calls[0], "wipefs --all /dev/sda");

    let wipe = system.position("wipefs").unwrap();
    let extract = system.position("tar xpf").unwrap();
    let make_conf = system.position("write /mnt/gentoo/etc/portage/make.conf").unwrap();
    let grub = system.position("grub-install").unwrap();
    let fstab = system.position("genfstab -U /mnt/gentoo >> /mnt/gentoo/etc/fstab").unwrap();
    assert!(wipe < extract && extract < make_conf && make_conf < grub && grub < fstab);
    assert!(calls.last().unwrap().starts_with("swapoff"));
}

#[test]
fn stage3_failure_rolls_back_disk_setup_once() {
    let config = config("");
    let rollbacks = Arc::new(AtomicUsize::new(0));
    let mut steps = master_steps(None);
    steps[0] = Box::new(RollbackSpy {
        inner: disk::DiskSetup,
        rollbacks: Arc::clone(&rollbacks),
    });
    steps[1] = Box::new(BrokenStage3);
    let pipeline = Pipeline::build(steps, &config).unwrap();
    let system = RecordingSystem::default();

    let (state, events) = run(&config, &pipeline, &system, &Environment::simulated(&config), false);

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    assert_eq!(
        statuses(&state),
        vec![
            StepStatus::RolledBack,
            StepStatus::Failed,
            StepStatus::Skipped,
            StepStatus::Skipped,
            StepStatus::Skipped,
            StepStatus::Skipped,
            StepStatus::Skipped,
        ]
    );
    let error = state.result(stage3::NAME).and_then(|r| r.error.clone()).unwrap();
    assert_eq!(error.kind, ErrorKind::Step);
    assert_eq!(error.stage.as_deref(), Some("extract"));

    // unmount happens after the failure, never before
    let umount = system.position("umount -R /mnt/gentoo").unwrap();
    assert!(system.position("mount /dev/sda3 /mnt/gentoo").unwrap() < umount);
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::RollbackResult { step, error: None } if step == disk::NAME)));
}

#[test]
fn failing_command_surfaces_its_stage_and_stops_the_run() {
    let config = config("");
    let pipeline = Pipeline::build(master_steps(None), &config).unwrap();
    let system = RecordingSystem::failing_on("tar xpf");

    let (state, _) = run(&config, &pipeline, &system, &Environment::simulated(&config), false);

    assert_eq!(state.status, RunStatus::Failed);
    let stage3 = state.result(stage3::NAME).unwrap();
    assert_eq!(stage3.status, StepStatus::Failed);
    let error = stage3.error.as_ref().unwrap();
    assert_eq!(error.stage.as_deref(), Some("extract"));
    assert!(error.reason.contains("simulated failure"));
    assert_eq!(state.result(disk::NAME).unwrap().status, StepStatus::RolledBack);
    assert!(system.position("emerge").is_none());
}

#[test]
fn rerunning_disk_setup_against_a_finished_disk_is_refused() {
    let config = config(BIOS_EXT4);
    let pipeline = Pipeline::build(master_steps(None), &config).unwrap();
    let system = RecordingSystem::default();
    let mut env = Environment::simulated(&config);
    env.mark_complete(disk::NAME);

    let (state, _) = run(&config, &pipeline, &system, &env, false);

    assert_eq!(state.status, RunStatus::Failed);
    let result = state.result(disk::NAME).unwrap();
    assert_eq!(result.status, StepStatus::Failed);
    assert_eq!(result.error.as_ref().unwrap().kind, ErrorKind::Precondition);
    assert!(system.calls().is_empty());
}

#[test]
fn resumed_pipeline_starts_after_finished_steps() {
    let config = config(BIOS_EXT4);
    let mut env = Environment::simulated(&config);
    env.mark_complete(disk::NAME);
    env.mark_complete(stage3::NAME);
    disk::DiskSetup.apply_postconditions(&config, &mut env);

    let mut pipeline = Pipeline::build(master_steps(None), &config).unwrap();
    let skipped = pipeline.resume_after(&env.completed);
    assert_eq!(skipped, vec![disk::NAME, stage3::NAME]);

    let system = RecordingSystem::default();
    let (state, _) = run(&config, &pipeline, &system, &env, false);

    assert_eq!(state.status, RunStatus::Succeeded, "{:?}", state.steps);
    assert_eq!(state.steps.len(), 5);
    assert!(system.position("wipefs").is_none());
    assert!(system.position("tar xpf").is_none());
}

#[test]
fn resume_with_confirmation_gate_skips_finished_disk_setup() {
    let config = config(BIOS_EXT4);
    let (gate, _prompt) = confirm::channel(std::time::Duration::from_secs(1));
    let mut pipeline = Pipeline::build(master_steps(Some(gate)), &config).unwrap();
    let completed: BTreeSet<String> =
        [disk::NAME, stage3::NAME].into_iter().map(String::from).collect();

    let skipped = pipeline.resume_after(&completed);
    assert_eq!(skipped, vec![confirm::NAME, disk::NAME, stage3::NAME]);

    let system = RecordingSystem::default();
    let (state, _) = run(&config, &pipeline, &system, &env_after(&config, &completed), false);

    assert_eq!(state.status, RunStatus::Succeeded, "{:?}", state.steps);
    assert!(state.result(confirm::NAME).is_none());
    assert!(system.position("wipefs").is_none());
}

#[test]
fn session_after_rollback_makes_resume_start_over() {
    let config = config(BIOS_EXT4);
    let dir = tempfile::tempdir().unwrap();
    let session_path = dir.path().join("installer.session");

    let pipeline = Pipeline::build(master_steps(None), &config).unwrap();
    let system = RecordingSystem::failing_on("emerge-webrsync");
    let memory = MemoryReporter::new();
    let recorder = SessionRecorder::new(
        session_path.clone(),
        Session::new(config.clone()),
        &pipeline.names()[..],
    );
    let reporter = Fanout::new().with(&memory).with(&recorder);
    let state = Orchestrator::new(&config, &pipeline, &system, &reporter, RunOptions::default())
        .run(&Environment::simulated(&config));

    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.result(disk::NAME).unwrap().status, StepStatus::RolledBack);
    // stage3 cannot be undone, yet its files are gone with the filesystem
    assert_eq!(state.result(stage3::NAME).unwrap().status, StepStatus::Succeeded);
    let saved = Session::load(&session_path).unwrap();
    assert!(saved.completed.is_empty(), "{:?}", saved.completed);

    let mut resumed = Pipeline::build(master_steps(None), &config).unwrap();
    assert!(resumed.resume_after(&saved.completed).is_empty());
    let system = RecordingSystem::default();
    let (state, _) = run(&config, &resumed, &system, &env_after(&config, &saved.completed), false);

    assert_eq!(state.status, RunStatus::Succeeded, "{:?}", state.steps);
    assert!(system.position("wipefs").unwrap() < system.position("tar xpf").unwrap());
}

#[test]
fn retried_package_manager_step_keeps_the_stock_backup() {
    let config = config(BIOS_EXT4);
    let pipeline = Pipeline::build(master_steps(None), &config).unwrap();
    let system = RecordingSystem::failing_on("emerge-webrsync");
    let reporter = MemoryReporter::new();
    let options = RunOptions {
        dry_run: false,
        policy: FailurePolicy::Abort,
    };
    let first = Orchestrator::new(&config, &pipeline, &system, &reporter, options)
        .run(&Environment::simulated(&config));
    assert_eq!(first.result(portage::NAME).unwrap().status, StepStatus::Failed);

    system.stop_failing();
    let completed = completed_in(&first);
    let mut resumed = Pipeline::build(master_steps(None), &config).unwrap();
    resumed.resume_after(&completed);
    assert_eq!(resumed.names()[0], portage::NAME);
    let (second, _) = run(&config, &resumed, &system, &env_after(&config, &completed), false);

    assert_eq!(second.status, RunStatus::Succeeded, "{:?}", second.steps);
    assert_eq!(system.count("cp -a /mnt/gentoo/etc/portage/make.conf"), 1);
    assert_eq!(system.count("write /mnt/gentoo/etc/portage/make.conf"), 2);
}

#[test]
fn finalize_twice_writes_fstab_once_per_run() {
    let config = config(BIOS_EXT4);
    let system = RecordingSystem::default();
    let reporter = MemoryReporter::new();
    let cancel = CancelToken::new();

    for _ in 0..2 {
        let ctx = StepContext::new(&config, finalize::NAME, false, &system, &reporter, &cancel);
        finalize::Finalize.execute(&ctx).unwrap();
    }

    let calls = system.calls();
    let generated: Vec<_> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| c.starts_with("genfstab"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(generated.len(), 2);
    for i in generated {
        assert_eq!(calls[i - 1], "write /mnt/gentoo/etc/fstab");
    }
}
