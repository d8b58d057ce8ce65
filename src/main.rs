use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use clap::Parser;
use tracing::{info, warn};

use gentoo_installer::{
    cmd::HostSystem,
    config::{self, ConfigLayer, KernelLayer, NetworkLayer},
    env::Environment,
    error::InstallerError,
    logging::{self, LogLevel},
    orchestrator::{CancelToken, FailurePolicy, Orchestrator, RunOptions, RunStatus},
    pipeline::{master_steps, Pipeline},
    report::{Fanout, LogReporter},
    session::{Session, SessionRecorder, SESSION_FILE},
    steps::confirm,
    ui,
};

// ── Exit codes ────────────────────────────────────────────────────────────────

const EXIT_FAILED: u8 = 1;
const EXIT_CONFIG: u8 = 2;
const EXIT_PREREQUISITES: u8 = 3;
const EXIT_ABORTED: u8 = 130;

/// How long the destructive-operation prompt waits for an answer.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(600);

// ── Command line ──────────────────────────────────────────────────────────────

/// Guided Gentoo Linux installer.
#[derive(Debug, Parser)]
#[command(name = "gentoo-installer", version, about)]
struct Cli {
    /// YAML configuration file (merged over the built-in defaults)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = LogLevel::Info, ignore_case = true)]
    log_level: LogLevel,

    /// Also write a full DEBUG log to this file
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Simulate every step without touching the machine
    #[arg(long)]
    dry_run: bool,

    /// Skip host prerequisite checks and continue past recoverable step errors
    #[arg(long)]
    skip_checks: bool,

    /// On failure, stop without rolling back completed steps
    #[arg(long, conflicts_with = "skip_checks")]
    no_rollback: bool,

    /// Continue an interrupted installation of the same configuration
    #[arg(long)]
    resume: bool,

    /// Do not ask before erasing the target disk
    #[arg(short, long)]
    yes: bool,

    #[arg(long, value_name = "DEVICE")]
    target_disk: Option<String>,

    #[arg(long)]
    hostname: Option<String>,

    #[arg(long)]
    bootloader: Option<String>,

    #[arg(long)]
    profile: Option<String>,

    #[arg(long)]
    kernel_source: Option<String>,
}

impl Cli {
    /// Field overrides given on the command line, highest precedence.
    fn overrides(&self) -> ConfigLayer {
        ConfigLayer {
            target_disk: self.target_disk.clone(),
            bootloader: self.bootloader.clone(),
            profile: self.profile.clone(),
            network: self.hostname.clone().map(|hostname| NetworkLayer {
                hostname: Some(hostname),
                ..Default::default()
            }),
            kernel: self.kernel_source.clone().map(|source| KernelLayer {
                source: Some(source),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn policy(&self) -> FailurePolicy {
        if self.no_rollback {
            FailurePolicy::Abort
        } else if self.skip_checks {
            FailurePolicy::ContinueOnRecoverable
        } else {
            FailurePolicy::AbortWithRollback
        }
    }
}

// ── Interrupt handling ────────────────────────────────────────────────────────

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Turns Ctrl-C into a cooperative cancellation request instead of
/// killing the process mid-operation.
fn install_sigint_handler() {
    let handler = on_sigint as extern "C" fn(libc::c_int);
    // SAFETY: the handler only stores to an atomic, which is signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

fn watch_interrupts(cancel: &CancelToken, finished: &AtomicBool) {
    while !finished.load(Ordering::SeqCst) {
        if INTERRUPTED.swap(false, Ordering::SeqCst) {
            warn!("Interrupt received, stopping at the next safe point");
            ui::print_warning("Interrupt received. Stopping at the next safe point…");
            cancel.cancel();
        }
        thread::sleep(Duration::from_millis(100));
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.log_level, cli.log_file.as_deref()) {
        ui::print_error(&format!("Cannot set up logging: {}", e));
        return ExitCode::from(EXIT_FAILED);
    }

    match run(&cli) {
        Ok(status) => ExitCode::from(match status {
            RunStatus::Succeeded => 0,
            RunStatus::Aborted => EXIT_ABORTED,
            _ => EXIT_FAILED,
        }),
        Err(e) => {
            println!();
            ui::print_error(&e.to_string());
            ExitCode::from(match e {
                InstallerError::Config(_) => EXIT_CONFIG,
                InstallerError::NotRoot | InstallerError::MissingTools(_) => EXIT_PREREQUISITES,
                _ => EXIT_FAILED,
            })
        }
    }
}

fn run(cli: &Cli) -> Result<RunStatus, InstallerError> {
    // ── Welcome ───────────────────────────────────────────────────────────────
    ui::print_banner();
    if cli.dry_run {
        ui::print_warning("DRY-RUN MODE: no disk will be touched, no command will run.");
    }

    // ── Configuration ─────────────────────────────────────────────────────────
    let config = config::load(ConfigLayer::defaults(), cli.config.as_deref(), cli.overrides())?;

    // ── Host checks ───────────────────────────────────────────────────────────
    let system = HostSystem;
    let mut env = if cli.dry_run {
        Environment::simulated(&config)
    } else {
        let pb = ui::spinner("Probing disks, mounts and tools…");
        let env = Environment::probe(&system);
        pb.finish_and_clear();
        if !cli.skip_checks {
            check_prerequisites(&env)?;
        }
        env
    };

    let session_path = Path::new(SESSION_FILE);
    let session = (!cli.dry_run).then(|| resume_session(cli.resume, session_path, &config, &mut env));

    ui::print_plan(&config, &env);

    // ── Pipeline ──────────────────────────────────────────────────────────────
    let (gate, prompt) = if cli.yes || cli.dry_run {
        (None, None)
    } else {
        let (gate, prompt) = confirm::channel(CONFIRM_TIMEOUT);
        (Some(gate), Some(prompt))
    };
    let mut pipeline = Pipeline::build(master_steps(gate), &config)?;
    if !env.completed.is_empty() {
        let done = pipeline.resume_after(&env.completed);
        if !done.is_empty() {
            ui::print_info(&format!("Skipping finished steps: {}", done.join(", ")));
        }
    }
    info!(steps = ?pipeline.names(), "Pipeline built");

    let answering = prompt.map(|prompt| thread::spawn(move || ui::answer_confirmations(prompt)));

    let console = ui::ConsoleReporter::new();
    let recorder = session.map(|s| SessionRecorder::new(session_path, s, &pipeline.names()[..]));
    let mut reporter = Fanout::new().with(&console).with(&LogReporter);
    if let Some(ref recorder) = recorder {
        reporter = reporter.with(recorder);
    }

    let options = RunOptions {
        dry_run: cli.dry_run,
        policy: cli.policy(),
    };
    let orchestrator = Orchestrator::new(&config, &pipeline, &system, &reporter, options);
    let cancel = orchestrator.cancel_token();
    install_sigint_handler();

    // ── Run ───────────────────────────────────────────────────────────────────
    let finished = AtomicBool::new(false);
    let state = thread::scope(|s| {
        s.spawn(|| watch_interrupts(&cancel, &finished));
        let state = orchestrator.run(&env);
        finished.store(true, Ordering::SeqCst);
        state
    });

    // the prompt thread exits once the confirmation step is gone; one still
    // blocked on the terminal is left behind
    drop(orchestrator);
    drop(pipeline);
    if let Some(handle) = answering.filter(|h| h.is_finished()) {
        match handle.join() {
            Ok(Err(e)) => warn!("Confirmation prompt failed: {}", e),
            Err(_) => warn!("Confirmation prompt thread panicked"),
            Ok(Ok(())) => {}
        }
    }

    ui::print_summary(&state);
    if cli.dry_run {
        ui::print_info("Dry run complete: no changes were made.");
    } else if state.status == RunStatus::Succeeded {
        Session::clear(session_path);
    }

    Ok(state.status)
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Root and the core tools are needed before anything else makes sense.
fn check_prerequisites(env: &Environment) -> Result<(), InstallerError> {
    if env.require_root().is_err() {
        return Err(InstallerError::NotRoot);
    }
    let missing = env.missing_core_tools();
    if !missing.is_empty() {
        return Err(InstallerError::MissingTools(missing));
    }
    ui::print_success(&format!("Running as root, {} firmware detected.", env.boot_mode));
    Ok(())
}

/// Seeds `env` from a saved session when resuming the same plan; otherwise
/// starts a fresh one.
fn resume_session(
    resume: bool,
    path: &Path,
    config: &config::Configuration,
    env: &mut Environment,
) -> Session {
    match Session::load(path) {
        Some(saved) if resume && saved.matches(config) => {
            info!(completed = ?saved.completed, "Resuming saved session");
            ui::print_info(&format!(
                "Resuming: {} step(s) already completed.",
                saved.completed.len()
            ));
            env.completed.extend(saved.completed.iter().cloned());
            saved
        }
        Some(_) if resume => {
            ui::print_warning("The saved session belongs to a different configuration; starting over.");
            Session::clear(path);
            Session::new(config.clone())
        }
        Some(_) => {
            info!("Discarding stale session file");
            Session::clear(path);
            Session::new(config.clone())
        }
        None => {
            if resume {
                ui::print_warning("No saved session found; starting from the first step.");
            }
            Session::new(config.clone())
        }
    }
}
