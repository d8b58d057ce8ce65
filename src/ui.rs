use std::{sync::Mutex, time::Duration};

use console::{style, Term};
use dialoguer::Select;
use indicatif::{ProgressBar, ProgressStyle};

use crate::{
    config::Configuration,
    env::Environment,
    error::InstallerError,
    orchestrator::{RunState, RunStatus, StepStatus},
    report::{Event, Reporter},
    steps::confirm::{ConfirmationPrompt, Decision},
};

// ── Terminal helpers ──────────────────────────────────────────────────────────

fn term_width() -> usize {
    Term::stdout().size().1.max(60) as usize
}

fn rule() -> String {
    style("─".repeat(term_width().min(52))).dim().to_string()
}

// ── Banner ────────────────────────────────────────────────────────────────────

pub fn print_banner() {
    let _ = Term::stdout().clear_screen();

    let logo = [
        r"    ██████╗ ███████╗███╗   ██╗████████╗ ██████╗  ██████╗ ",
        r"   ██╔════╝ ██╔════╝████╗  ██║╚══██╔══╝██╔═══██╗██╔═══██╗",
        r"   ██║  ███╗█████╗  ██╔██╗ ██║   ██║   ██║   ██║██║   ██║",
        r"   ██║   ██║██╔══╝  ██║╚██╗██║   ██║   ██║   ██║██║   ██║",
        r"   ╚██████╔╝███████╗██║ ╚████║   ██║   ╚██████╔╝╚██████╔╝",
        r"    ╚═════╝ ╚══════╝╚═╝  ╚═══╝   ╚═╝    ╚═════╝  ╚═════╝ ",
    ];

    println!();
    for line in &logo {
        println!("{}", style(line).magenta().bold());
    }
    println!();
    println!(
        "{}",
        style(format!(
            "   Linux Installer  ·  Stage3 + Portage  ·  v{}",
            env!("CARGO_PKG_VERSION")
        ))
        .dim()
        .italic()
    );
    println!();
    println!("{}", rule());
    println!();
}

// ── Step header ───────────────────────────────────────────────────────────────

/// Prints a visually distinct numbered step header.
pub fn print_step(step: usize, total: usize, title: &str) {
    println!();
    let tag = style(format!(" {}/{} ", step, total)).black().on_magenta().bold();
    let heading = style(format!("  {}", title)).white().bold();
    println!("{}{}", tag, heading);
    println!("{}", rule());
}

// ── Feedback messages ─────────────────────────────────────────────────────────

/// Green ✓ for a finished operation.
pub fn print_success(msg: &str) {
    println!("  {}  {}", style("✓").green().bold(), style(msg).green());
}

/// Blue → for a neutral note.
pub fn print_info(msg: &str) {
    println!("  {}  {}", style("→").blue().bold(), msg);
}

/// Yellow ⚠ for a non-fatal notice.
pub fn print_warning(msg: &str) {
    println!("  {}  {}", style("⚠").yellow().bold(), style(msg).yellow());
}

/// Red ✗ for an error, written to stderr.
pub fn print_error(msg: &str) {
    eprintln!("  {}  {}", style("✗").red().bold(), style(msg).red());
}

// ── Info box ──────────────────────────────────────────────────────────────────

/// Renders a bordered key→value box in the terminal.
///
/// ```text
/// ┌─ Installation Plan ───────────────┐
/// │  Disk        /dev/sda             │
/// │  Bootloader  grub                 │
/// └───────────────────────────────────┘
/// ```
pub fn print_kv_box(title: &str, rows: &[(&str, &str)]) {
    const BOX_INNER: usize = 38;

    let dashes = "─".repeat(BOX_INNER.saturating_sub(title.chars().count() + 2));
    println!(
        "  ┌─ {} {}┐",
        style(title).white().bold(),
        style(&dashes).dim()
    );

    for (key, val) in rows {
        println!(
            "  │  {:<13}{}",
            style(*key).dim(),
            style(*val).white().bold()
        );
    }

    println!("  └{}┘", style("─".repeat(BOX_INNER + 2)).dim());
}

/// Shows what is about to be installed where.
pub fn print_plan(config: &Configuration, env: &Environment) {
    let disk = env
        .disk(&config.target_disk)
        .map(|d| d.display())
        .unwrap_or_else(|| config.target_disk.clone());
    let layout = config
        .partitions
        .iter()
        .map(|p| format!("{} {}", p.mount_point, p.size))
        .collect::<Vec<_>>()
        .join("  |  ");
    let users = if config.users.is_empty() {
        "none".to_string()
    } else {
        config
            .users
            .iter()
            .map(|u| u.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let firmware = env.boot_mode.to_string();
    let kernel = config.kernel.source.to_string();
    let bootloader = config.bootloader.to_string();
    let profile = config.profile.to_string();

    println!();
    print_kv_box(
        "Installation Plan",
        &[
            ("Disk", disk.as_str()),
            ("Layout", layout.as_str()),
            ("Firmware", firmware.as_str()),
            ("Kernel", kernel.as_str()),
            ("Bootloader", bootloader.as_str()),
            ("Profile", profile.as_str()),
            ("Hostname", config.network.hostname.as_str()),
            ("Users", users.as_str()),
        ],
    );
    println!();
}

// ── Progress bars ─────────────────────────────────────────────────────────────

/// Returns a running braille spinner.
/// Call `pb.finish_and_clear()` when done.
pub fn spinner(msg: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("  {spinner:.magenta.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.into());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Percentage bar for one running step. It only redraws on updates so a
/// prompt can share the terminal with it.
fn step_bar() -> ProgressBar {
    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::with_template("  [{bar:24.magenta/dim}] {pos:>3}%  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▉ "),
    );
    pb
}

/// Renders run events on the terminal: a header and a progress bar per step.
#[derive(Default)]
pub struct ConsoleReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self::default()
    }

    fn finish_bar(&self) {
        if let Ok(mut bar) = self.bar.lock() {
            if let Some(pb) = bar.take() {
                pb.finish_and_clear();
            }
        }
    }
}

impl Reporter for ConsoleReporter {
    fn report(&self, event: &Event) {
        match event {
            Event::StepStarted {
                step,
                phase,
                index,
                total,
            } => {
                self.finish_bar();
                print_step(index + 1, *total, &format!("{}  ·  {}", phase, step));
                if let Ok(mut bar) = self.bar.lock() {
                    *bar = Some(step_bar());
                }
            }
            Event::StepProgress {
                percent, message, ..
            } => {
                if let Ok(bar) = self.bar.lock() {
                    if let Some(ref pb) = *bar {
                        pb.set_position(u64::from(*percent));
                        pb.set_message(message.clone());
                    }
                }
            }
            Event::StepSucceeded { step } => {
                self.finish_bar();
                print_success(&format!("{} done.", step));
            }
            Event::StepFailed { step, reason } => {
                self.finish_bar();
                print_error(&format!("{} failed: {}", step, reason));
            }
            Event::RollbackStarted { step } => {
                print_warning(&format!("Rolling back {}…", step));
            }
            Event::RollbackResult { step, error: None } => {
                print_success(&format!("{} rolled back.", step));
            }
            Event::RollbackResult {
                step,
                error: Some(reason),
            } => print_error(&format!("Could not roll back {}: {}", step, reason)),
        }
    }
}

// ── Summary ───────────────────────────────────────────────────────────────────

fn status_mark(status: StepStatus) -> String {
    match status {
        StepStatus::Succeeded => style("✓").green().bold().to_string(),
        StepStatus::Failed => style("✗").red().bold().to_string(),
        StepStatus::RolledBack => style("↺").yellow().bold().to_string(),
        StepStatus::Skipped | StepStatus::Pending => style("·").dim().to_string(),
        StepStatus::Running => style("…").blue().to_string(),
    }
}

/// Prints one line per step plus every error and manual fix-up needed.
pub fn print_summary(state: &RunState) {
    println!();
    println!("{}", rule());
    for result in &state.steps {
        println!(
            "  {}  {:<18} {}",
            status_mark(result.status),
            result.step,
            style(format!("{:?}", result.status).to_lowercase()).dim()
        );
        if let Some(ref error) = result.error {
            let stage = error.stage.as_deref().map(|s| format!("[{}] ", s)).unwrap_or_default();
            println!("       {}{}", stage, style(&error.reason).red());
            if let Some(ref remedy) = error.remedy {
                println!("       {} {}", style("fix:").dim(), remedy);
            }
        }
        if let Some(ref reason) = result.rollback_error {
            println!(
                "       {} {}",
                style("rollback failed, undo by hand:").yellow(),
                reason
            );
        }
    }
    println!("{}", rule());

    match state.status {
        RunStatus::Succeeded => print_success("Installation complete. Remove the install medium and reboot."),
        RunStatus::Aborted => print_warning("Installation aborted. Re-run with --resume to continue."),
        RunStatus::Failed => print_error("Installation failed."),
        RunStatus::NotStarted | RunStatus::InProgress => {}
    }
    println!();
}

// ── Confirmation prompt ───────────────────────────────────────────────────────

/// Answers confirmation requests with an arrow-key menu until the step side
/// of the channel goes away.
pub fn answer_confirmations(prompt: ConfirmationPrompt) -> Result<(), InstallerError> {
    const CHOICES: [&str; 3] = [
        "Proceed and erase the disk",
        "Stop and edit the configuration",
        "Cancel the installation",
    ];

    while let Some(request) = prompt.next_request() {
        println!();
        print_warning(&request.summary);
        let choice = Select::new()
            .with_prompt(format!("Continue with {}?", request.disk))
            .items(&CHOICES)
            .default(2)
            .interact_opt()?;
        let decision = match choice {
            Some(0) => Decision::Proceed,
            Some(1) => Decision::Edit,
            _ => Decision::Cancel,
        };
        if !prompt.answer(decision) {
            break;
        }
    }
    Ok(())
}
