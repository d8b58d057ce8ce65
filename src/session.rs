use std::{
    collections::BTreeSet,
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    config::Configuration,
    report::{Event, Reporter},
    steps::confirm,
};

pub const SESSION_FILE: &str = "/var/tmp/gentoo-installer.session";

// ── Session state ─────────────────────────────────────────────────────────────

/// Persisted checkpoint: the plan a run was started with and the steps
/// whose effects are in place. Stored as YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub config: Configuration,
    pub completed: BTreeSet<String>,
}

impl Session {
    pub fn new(config: Configuration) -> Self {
        Self {
            config,
            completed: BTreeSet::new(),
        }
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Returns `Some(session)` if a readable checkpoint exists at `path`.
    pub fn load(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        match serde_yaml::from_str(&content) {
            Ok(session) => Some(session),
            Err(e) => {
                warn!("Ignoring unreadable session file {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let yaml = serde_yaml::to_string(self).map_err(io::Error::other)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, yaml)
    }

    /// Removes the session file (successful completion or fresh start).
    pub fn clear(path: &Path) {
        match fs::remove_file(path) {
            Ok(()) => debug!("Removed session file {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove session file {}: {}", path.display(), e),
        }
    }

    /// A session only resumes the exact plan it was recorded for.
    pub fn matches(&self, config: &Configuration) -> bool {
        self.config == *config
    }
}

// ── Recorder ──────────────────────────────────────────────────────────────────

/// Reporter that keeps the session file in step with the run.
///
/// A step that fails or is rolled back invalidates itself and everything
/// after it in `order`: later steps built on what it left behind.
#[derive(Debug)]
pub struct SessionRecorder {
    path: PathBuf,
    order: Vec<String>,
    session: Mutex<Session>,
}

impl SessionRecorder {
    /// `order` lists the run's step names in pipeline order.
    pub fn new<S: AsRef<str>>(path: impl Into<PathBuf>, session: Session, order: &[S]) -> Self {
        Self {
            path: path.into(),
            order: order.iter().map(|s| s.as_ref().to_string()).collect(),
            session: Mutex::new(session),
        }
    }

    pub fn completed(&self) -> BTreeSet<String> {
        self.session
            .lock()
            .map(|s| s.completed.clone())
            .unwrap_or_default()
    }

    fn record(&self, f: impl FnOnce(&mut BTreeSet<String>) -> bool) {
        let Ok(mut session) = self.session.lock() else {
            return;
        };
        if f(&mut session.completed) {
            if let Err(e) = session.save(&self.path) {
                warn!("Could not save session to {}: {}", self.path.display(), e);
            }
        }
    }

    fn invalidate_from(&self, step: &str) {
        let later: Vec<&String> = self.order.iter().skip_while(|s| *s != step).collect();
        self.record(|completed| {
            let mut changed = completed.remove(step);
            for name in later {
                changed |= completed.remove(name);
            }
            changed
        });
    }
}

impl Reporter for SessionRecorder {
    fn report(&self, event: &Event) {
        match event {
            // approval to erase the disk is asked again on every run
            Event::StepSucceeded { step } if step == confirm::NAME => {}
            Event::StepSucceeded { step } => self.record(|c| c.insert(step.clone())),
            Event::StepFailed { step, .. } => self.invalidate_from(step),
            Event::RollbackResult { step, error: None } => self.invalidate_from(step),
            _ => {}
        }
    }
}
