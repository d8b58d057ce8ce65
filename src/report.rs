//! Progress events and the sinks that consume them.

use std::sync::Mutex;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::steps::Phase;

/// Something observable happened during a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    StepStarted {
        step: String,
        phase: Phase,
        index: usize,
        total: usize,
    },
    StepProgress {
        step: String,
        percent: u8,
        message: String,
    },
    StepSucceeded {
        step: String,
    },
    StepFailed {
        step: String,
        reason: String,
    },
    RollbackStarted {
        step: String,
    },
    RollbackResult {
        step: String,
        error: Option<String>,
    },
}

impl Event {
    pub fn step(&self) -> &str {
        match self {
            Event::StepStarted { step, .. }
            | Event::StepProgress { step, .. }
            | Event::StepSucceeded { step }
            | Event::StepFailed { step, .. }
            | Event::RollbackStarted { step }
            | Event::RollbackResult { step, .. } => step,
        }
    }
}

/// Sink for progress events. Implementations serialize concurrent calls
/// themselves, so a step may report from worker threads.
pub trait Reporter: Send + Sync {
    fn report(&self, event: &Event);
}

/// Forwards events to the log.
#[derive(Debug, Default)]
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&self, event: &Event) {
        match event {
            Event::StepStarted {
                step,
                phase,
                index,
                total,
            } => info!(step = %step, phase = %phase, "Starting step {}/{}", index + 1, total),
            Event::StepProgress {
                step,
                percent,
                message,
            } => info!(step = %step, percent = *percent, "{}", message),
            Event::StepSucceeded { step } => info!(step = %step, "Step succeeded"),
            Event::StepFailed { step, reason } => error!(step = %step, "Step failed: {}", reason),
            Event::RollbackStarted { step } => warn!(step = %step, "Rolling back"),
            Event::RollbackResult { step, error: None } => info!(step = %step, "Rolled back"),
            Event::RollbackResult {
                step,
                error: Some(reason),
            } => error!(step = %step, "Rollback failed: {}", reason),
        }
    }
}

/// Keeps every event in memory, for UIs that poll and for tests.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    events: Mutex<Vec<Event>>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl Reporter for MemoryReporter {
    fn report(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Sends each event to several sinks in order.
#[derive(Default)]
pub struct Fanout<'a> {
    sinks: Vec<&'a dyn Reporter>,
}

impl<'a> Fanout<'a> {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn with(mut self, sink: &'a dyn Reporter) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl Reporter for Fanout<'_> {
    fn report(&self, event: &Event) {
        for sink in &self.sinks {
            sink.report(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fanout_delivers_to_every_sink() {
        let a = MemoryReporter::new();
        let b = MemoryReporter::new();
        let fanout = Fanout::new().with(&a).with(&b);

        fanout.report(&Event::StepSucceeded {
            step: "stage3".to_string(),
        });

        assert_eq!(a.events().len(), 1);
        assert_eq!(b.events(), a.events());
        assert_eq!(a.events()[0].step(), "stage3");
    }

    #[test]
    fn memory_reporter_accepts_reports_from_threads() {
        let sink = MemoryReporter::new();
        std::thread::scope(|s| {
            for i in 0..4u8 {
                let sink = &sink;
                s.spawn(move || {
                    sink.report(&Event::StepProgress {
                        step: "kernel-build".to_string(),
                        percent: i * 10,
                        message: "compiling".to_string(),
                    })
                });
            }
        });
        assert_eq!(sink.events().len(), 4);
    }
}
