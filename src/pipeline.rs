//! The ordered list of steps one run executes.

use std::{collections::BTreeSet, fmt};

use crate::{
    config::Configuration,
    steps::{
        bootloader::BootloaderInstall,
        confirm::{self, ConfirmStep, ConfirmationGate},
        disk::DiskSetup,
        finalize::Finalize,
        kernel::{KernelBinary, KernelBuild},
        portage::PackageManagerSetup,
        stage3::Stage3Extraction,
        system::SystemConfig,
        Phase, Step,
    },
};

/// Steps were handed over out of phase order.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("step '{step}' ({phase}) is listed after a step of phase {previous}")]
pub struct OrderError {
    pub step: String,
    pub phase: Phase,
    pub previous: Phase,
}

/// Every built-in step in installation order. The confirmation gate, when
/// given, guards disk setup.
pub fn master_steps(gate: Option<ConfirmationGate>) -> Vec<Box<dyn Step>> {
    let mut steps: Vec<Box<dyn Step>> = Vec::new();
    if let Some(gate) = gate {
        steps.push(Box::new(ConfirmStep::new(gate)));
    }
    steps.push(Box::new(DiskSetup));
    steps.push(Box::new(Stage3Extraction));
    steps.push(Box::new(PackageManagerSetup));
    steps.push(Box::new(KernelBuild));
    steps.push(Box::new(KernelBinary));
    steps.push(Box::new(BootloaderInstall));
    steps.push(Box::new(SystemConfig));
    steps.push(Box::new(Finalize));
    steps
}

pub struct Pipeline {
    steps: Vec<Box<dyn Step>>,
}

impl Pipeline {
    /// Takes steps as given; their phases must never go backwards.
    pub fn new(steps: Vec<Box<dyn Step>>) -> Result<Self, OrderError> {
        for pair in steps.windows(2) {
            let (previous, next) = (&pair[0], &pair[1]);
            if next.phase() < previous.phase() {
                return Err(OrderError {
                    step: next.name().to_string(),
                    phase: next.phase(),
                    previous: previous.phase(),
                });
            }
        }
        Ok(Self { steps })
    }

    /// Keeps the steps `config` needs, in their original order.
    pub fn build(steps: Vec<Box<dyn Step>>, config: &Configuration) -> Result<Self, OrderError> {
        Self::new(steps.into_iter().filter(|s| s.applicable(config)).collect())
    }

    /// Drops the leading steps a previous run already completed, so a
    /// resumed run starts at the first unfinished one. Returns the names
    /// dropped. Completed steps after that point stay and are handled as
    /// re-runs.
    ///
    /// The confirmation gate is never recorded as completed. It goes with
    /// the disk setup it guards and stays whenever that still has to run.
    pub fn resume_after(&mut self, completed: &BTreeSet<String>) -> Vec<String> {
        let mut done = self
            .steps
            .iter()
            .take_while(|s| s.name() == confirm::NAME || completed.contains(s.name()))
            .count();
        while done > 0 && self.steps[done - 1].name() == confirm::NAME {
            done -= 1;
        }
        self.steps
            .drain(..done)
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn steps(&self) -> &[Box<dyn Step>] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
