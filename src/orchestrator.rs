//! Command orchestrator
//!
//! Drives one operation through its backend:
//!
//! ```text
//! Created
//!     ↓  prepare: sandbox, seed, parameters, restore state
//! Prepared
//!     ↓  run: every step, in order
//! Executing
//!     ↓  clean_up: persist state, release sandbox
//! CleanedUp
//! ```
//!
//! The sandbox is released on every path out of `run` and `execute`,
//! including errors, and when an orchestrator is dropped mid-run.

use crate::backend::{Backend, ExecutionBackend, ImageHandle};
use crate::error::{ProvisionError, Result};
use crate::operation::OperationSpec;
use crate::process_guard::StepIo;
use crate::settings::EngineSettings;
use crate::state::StateStore;
use std::fmt;
use tracing::{debug, info, warn};

/// Lifecycle of one orchestrated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStage {
    /// Backend built, no sandbox yet
    Created,
    /// Sandbox ready, state restored
    Prepared,
    /// Steps are being run
    Executing,
    /// Sandbox released (terminal)
    CleanedUp,
}

impl RunStage {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::CleanedUp)
    }

    /// A sandbox exists in this stage.
    pub const fn holds_sandbox(self) -> bool {
        matches!(self, Self::Prepared | Self::Executing)
    }

    pub const fn description(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Prepared => "prepared",
            Self::Executing => "executing",
            Self::CleanedUp => "cleaned up",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Captured result of a single ad-hoc command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Runs one [`OperationSpec`] in its own sandbox.
#[derive(Debug)]
pub struct CommandOrchestrator {
    spec: OperationSpec,
    backend: Backend,
    state: Option<StateStore>,
    strict_exit_codes: bool,
    stage: RunStage,
}

impl CommandOrchestrator {
    /// Build the orchestrator and the backend `spec` asks for.
    ///
    /// `state` is where persisted paths are kept between runs; without it
    /// nothing is restored or saved.
    pub fn new(
        spec: OperationSpec,
        settings: &EngineSettings,
        image: Option<&ImageHandle>,
        state: Option<StateStore>,
    ) -> Result<Self> {
        let backend = Backend::for_operation(&spec, settings, image)?;
        Ok(Self {
            spec,
            backend,
            state,
            strict_exit_codes: settings.strict_exit_codes,
            stage: RunStage::Created,
        })
    }

    pub fn stage(&self) -> RunStage {
        self.stage
    }

    pub fn spec(&self) -> &OperationSpec {
        &self.spec
    }

    /// Allocate the sandbox and restore saved state into it.
    ///
    /// A missing state file is the normal first-run case. A state file
    /// that cannot be read or unpacked is logged and the run continues
    /// without it. If preparing the sandbox fails, whatever was allocated
    /// is released before the error is returned.
    pub fn prepare(&mut self, parameters: Option<&[u8]>) -> Result<()> {
        if let Err(e) = self.backend.prepare(parameters) {
            self.backend.clean_up();
            self.stage = RunStage::CleanedUp;
            return Err(e);
        }
        self.stage = RunStage::Prepared;

        if self.spec.persists_state() {
            self.restore_state();
        }
        Ok(())
    }

    /// Prepare, run every step, collect the output and clean up.
    pub fn run(mut self, parameters: Option<&[u8]>) -> Result<Vec<u8>> {
        self.prepare(parameters)?;
        let result = self.run_steps().and_then(|_| self.output());
        self.clean_up();
        result
    }

    /// Content of the result file, empty when the operation declares none.
    pub fn output(&mut self) -> Result<Vec<u8>> {
        self.backend.output()
    }

    /// Save persisted paths and release the sandbox. Idempotent.
    pub fn clean_up(&mut self) {
        if !self.stage.holds_sandbox() {
            return;
        }
        if self.spec.persists_state() {
            self.persist_state();
        }
        self.backend.clean_up();
        self.stage = RunStage::CleanedUp;
    }

    /// Run one ad-hoc argument vector in a fresh sandbox with output captured.
    ///
    /// No parameters are written. The exit code is returned as-is, whatever
    /// the strictness setting.
    pub fn execute(mut self, argv: &[String]) -> Result<ExecOutput> {
        self.prepare(None)?;
        self.stage = RunStage::Executing;

        let mut io = StepIo::capture();
        let result = self.backend.exec(argv, &mut io);
        self.clean_up();

        let exit_code = result?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(io.stdout.captured()).into_owned(),
            stderr: String::from_utf8_lossy(io.stderr.captured()).into_owned(),
            exit_code,
        })
    }

    fn run_steps(&mut self) -> Result<()> {
        self.stage = RunStage::Executing;

        for (step, argv) in self.spec.steps.iter().enumerate() {
            info!(step, command = ?argv, "running step");
            let exit_code = self.backend.exec(argv, &mut StepIo::inherit())?;

            if exit_code != 0 {
                if self.strict_exit_codes {
                    return Err(ProvisionError::StepFailed {
                        step,
                        argv: argv.join(" "),
                        exit_code,
                    });
                }
                warn!(step, exit_code, "step exited non-zero, continuing");
            }
        }
        Ok(())
    }

    fn restore_state(&mut self) {
        let Some(store) = &self.state else {
            debug!("no state location, nothing to restore");
            return;
        };

        match store.load() {
            Ok(Some(archive)) => {
                if let Err(e) = self.backend.extract_state(&archive, "") {
                    warn!(path = %store.path().display(), error = %e, "failed to restore state");
                } else {
                    debug!(path = %store.path().display(), "restored state");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(path = %store.path().display(), error = %e, "failed to read state"),
        }
    }

    fn persist_state(&mut self) {
        let Some(store) = &self.state else {
            return;
        };

        let archive = match self.backend.read_state(&self.spec.persist_paths) {
            Ok(archive) => archive,
            Err(e) => {
                warn!(error = %e, "failed to collect state");
                return;
            }
        };
        if let Err(e) = store.save(&archive) {
            warn!(path = %store.path().display(), error = %e, "failed to save state");
        }
    }
}

impl Drop for CommandOrchestrator {
    fn drop(&mut self) {
        if self.stage.holds_sandbox() {
            warn!(stage = %self.stage, "run abandoned, releasing sandbox");
            self.clean_up();
        }
    }
}
