use crate::concurrency::shutdown_requested;
use crate::lifecycle::{validate_transition, RunState};
use crate::runner::StageRunner;
use crate::stage::{standard_stages, RunResult, Stage, StageId};
use crate::{CoreError, EXIT_INTERRUPTED};
use fsboot_config::Settings;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What to do once a stage fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Abort,
    Continue,
}

impl FailurePolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        if settings.continue_on_error {
            Self::Continue
        } else {
            Self::Abort
        }
    }
}

/// Invoked once for every failed stage, before the policy is applied.
pub trait FailureHandler {
    fn on_failure(&self, failed: &RunResult, completed: &[StageId], policy: FailurePolicy);
}

/// Prints a prominent banner with enough context to resume by hand.
pub struct LogFailureHandler {
    log_dir: PathBuf,
}

impl LogFailureHandler {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            log_dir: log_dir.to_path_buf(),
        }
    }
}

impl FailureHandler for LogFailureHandler {
    fn on_failure(&self, failed: &RunResult, completed: &[StageId], policy: FailurePolicy) {
        let completed: Vec<&str> = completed.iter().map(|s| s.name()).collect();
        error!("================================================================");
        error!(
            "startup failed at stage '{}' (exit code {})",
            failed.stage, failed.exit_code
        );
        if let Some(message) = &failed.message {
            error!("reason: {message}");
        }
        if completed.is_empty() {
            error!("no stages had completed");
        } else {
            error!("stages already completed: {}", completed.join(", "));
        }
        error!(
            "stage log: {}",
            self.log_dir.join(format!("{}.log", failed.stage)).display()
        );
        match policy {
            FailurePolicy::Abort => error!(
                "remaining stages were not started; fix the problem and run `fsboot run` again"
            ),
            FailurePolicy::Continue => {
                warn!("CONTINUE_ON_ERROR is set, carrying on with the next stage");
            }
        }
        error!("================================================================");
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted { stage: StageId, exit_code: i32 },
    Interrupted { next: Option<StageId> },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub results: Vec<RunResult>,
    pub outcome: RunOutcome,
    pub state: RunState,
}

impl RunReport {
    /// Process exit status for this run.
    pub fn exit_code(&self) -> i32 {
        match &self.outcome {
            RunOutcome::Completed => self
                .results
                .iter()
                .find(|r| r.failed())
                .map_or(0, |r| r.exit_code),
            RunOutcome::Aborted { exit_code, .. } => *exit_code,
            RunOutcome::Interrupted { .. } => EXIT_INTERRUPTED,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }

    pub fn result(&self, stage: StageId) -> Option<&RunResult> {
        self.results.iter().find(|r| r.stage == stage)
    }

    /// Stages that actually ran and succeeded, in order.
    pub fn completed_stages(&self) -> Vec<StageId> {
        self.results
            .iter()
            .filter(|r| r.succeeded && !r.skipped)
            .map(|r| r.stage)
            .collect()
    }
}

/// Runs the stage list in declaration order under a failure policy.
pub struct Orchestrator<'a> {
    stages: Vec<Stage>,
    runner: StageRunner<'a>,
    policy: FailurePolicy,
    handler: Box<dyn FailureHandler + 'a>,
    interrupted: Box<dyn Fn() -> bool + 'a>,
    state: RunState,
}

impl<'a> Orchestrator<'a> {
    /// Rejects any stage list that is not in canonical dependency order.
    pub fn new(settings: &'a Settings, stages: Vec<Stage>) -> Result<Self, CoreError> {
        validate_order(&stages)?;
        Ok(Self {
            stages,
            runner: StageRunner::new(settings)?,
            policy: FailurePolicy::from_settings(settings),
            handler: Box::new(LogFailureHandler::new(&settings.log_dir)),
            interrupted: Box::new(shutdown_requested),
            state: RunState::NotStarted,
        })
    }

    pub fn standard(settings: &'a Settings) -> Result<Self, CoreError> {
        Self::new(settings, standard_stages(settings))
    }

    #[must_use]
    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_failure_handler(mut self, handler: impl FailureHandler + 'a) -> Self {
        self.handler = Box::new(handler);
        self
    }

    #[must_use]
    pub fn with_interrupt_check(mut self, check: impl Fn() -> bool + 'a) -> Self {
        self.interrupted = Box::new(check);
        self
    }

    #[must_use]
    pub fn with_sleep(mut self, sleep: impl Fn(Duration) + 'a) -> Self {
        self.runner = self.runner.with_sleep(sleep);
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn transition(&mut self, to: RunState) -> Result<(), CoreError> {
        validate_transition(self.state, to)?;
        debug!("run state {} -> {to}", self.state);
        self.state = to;
        Ok(())
    }

    fn finish(
        &mut self,
        results: Vec<RunResult>,
        outcome: RunOutcome,
    ) -> Result<RunReport, CoreError> {
        let terminal = if outcome == RunOutcome::Completed {
            RunState::Completed
        } else {
            RunState::Aborted
        };
        self.transition(terminal)?;
        Ok(RunReport {
            results,
            outcome,
            state: self.state,
        })
    }

    /// Drive every stage once. A run can only happen once per orchestrator.
    pub fn run(&mut self) -> Result<RunReport, CoreError> {
        if self.state != RunState::NotStarted {
            return Err(CoreError::InvalidTransition {
                from: self.state.to_string(),
                to: "running".to_owned(),
            });
        }

        let enabled = self.stages.iter().filter(|s| s.enabled).count();
        info!(
            "starting file server provisioning: {} stages ({enabled} enabled)",
            self.stages.len()
        );

        let mut results = Vec::with_capacity(self.stages.len());
        let mut completed = Vec::new();
        let mut first_failure: Option<StageId> = None;

        for index in 0..self.stages.len() {
            let id = self.stages[index].id;
            if (self.interrupted)() {
                warn!("shutdown requested, not starting stage {id}");
                return self.finish(results, RunOutcome::Interrupted { next: Some(id) });
            }

            self.transition(RunState::Running(id))?;
            let result = self.runner.run(&self.stages[index]);

            if result.failed() {
                self.handler.on_failure(&result, &completed, self.policy);
                first_failure.get_or_insert(id);
                if self.policy == FailurePolicy::Abort {
                    let exit_code = result.exit_code;
                    results.push(result);
                    return self.finish(results, RunOutcome::Aborted { stage: id, exit_code });
                }
            } else if !result.skipped {
                completed.push(id);
            }
            results.push(result);
        }

        match first_failure {
            Some(stage) => warn!("provisioning finished with failures, first failure at {stage}"),
            None => info!(
                "provisioning completed: {} stages ran, {} skipped",
                completed.len(),
                results.iter().filter(|r| r.skipped).count()
            ),
        }
        self.finish(results, RunOutcome::Completed)
    }
}

fn validate_order(stages: &[Stage]) -> Result<(), CoreError> {
    for pair in stages.windows(2) {
        if pair[1].id <= pair[0].id {
            return Err(CoreError::InvalidStageOrder {
                before: pair[0].id,
                after: pair[1].id,
            });
        }
    }
    Ok(())
}
