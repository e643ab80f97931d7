use crate::action::ActionContext;
use crate::concurrency::interruptible_sleep;
use crate::stage::{RunResult, Stage};
use crate::CoreError;
use fsboot_config::Settings;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Executes a single stage and reports how it went.
///
/// The runner never decides whether the overall run continues; it only
/// records the result.
pub struct StageRunner<'a> {
    settings: &'a Settings,
    env: Vec<(String, String)>,
    sleep: Box<dyn Fn(Duration) + 'a>,
}

impl<'a> StageRunner<'a> {
    pub fn new(settings: &'a Settings) -> Result<Self, CoreError> {
        Ok(Self {
            settings,
            env: settings.to_env()?,
            sleep: Box::new(interruptible_sleep),
        })
    }

    /// Replace the post-stage sleep (tests use a recorder).
    #[must_use]
    pub fn with_sleep(mut self, sleep: impl Fn(Duration) + 'a) -> Self {
        self.sleep = Box::new(sleep);
        self
    }

    pub fn run(&self, stage: &Stage) -> RunResult {
        if !stage.enabled {
            info!("skipping stage {}: disabled by configuration", stage.id);
            return RunResult::skipped(stage.id);
        }

        info!("==== starting stage {}: {} ====", stage.id, stage.description);
        debug!("stage {} runs {}", stage.id, stage.action.describe());

        let ctx = ActionContext {
            stage: stage.id,
            settings: self.settings,
            env: &self.env,
            log_path: self.settings.stage_log_path(stage.name()),
        };
        let started = Instant::now();
        match stage.action.run(&ctx) {
            Ok(output) => {
                let elapsed = started.elapsed();
                info!(
                    "==== stage {} completed in {:.1}s ====",
                    stage.id,
                    elapsed.as_secs_f64()
                );
                if !stage.post_delay.is_zero() {
                    debug!(
                        "waiting {}s for {} services to settle",
                        stage.post_delay.as_secs(),
                        stage.id
                    );
                    (self.sleep)(stage.post_delay);
                }
                RunResult::success(stage.id, elapsed, output)
            }
            Err(failure) => {
                let elapsed = started.elapsed();
                error!(
                    "==== stage {} FAILED after {:.1}s (exit code {}, {} attempt(s)): {} ====",
                    stage.id,
                    elapsed.as_secs_f64(),
                    failure.exit_code,
                    failure.attempts,
                    failure.message
                );
                RunResult::failure(stage.id, elapsed, &failure)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionFailure, ActionOutput, StageAction};
    use crate::stage::StageId;
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct Fixed {
        outcome: Result<(), i32>,
        ran: Arc<AtomicBool>,
    }

    impl StageAction for Fixed {
        fn describe(&self) -> String {
            "fixed".to_owned()
        }

        fn run(&self, ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionFailure> {
            assert!(ctx.env.iter().any(|(k, _)| k == "LOG_LEVEL"));
            self.ran.store(true, Ordering::SeqCst);
            self.outcome
                .map(|()| ActionOutput::default())
                .map_err(|code| ActionFailure::transient(code, "boom"))
        }
    }

    fn fixed(outcome: Result<(), i32>) -> (Fixed, Arc<AtomicBool>) {
        let ran = Arc::new(AtomicBool::new(false));
        (
            Fixed {
                outcome,
                ran: Arc::clone(&ran),
            },
            ran,
        )
    }

    #[test]
    fn disabled_stage_is_skipped_without_running() {
        let settings = Settings::default();
        let runner = StageRunner::new(&settings).unwrap();
        let (action, ran) = fixed(Ok(()));
        let stage = Stage::new(StageId::Nextcloud, action).enabled(false);

        let result = runner.run(&stage);
        assert!(result.skipped);
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn success_sleeps_post_delay() {
        let settings = Settings::default();
        let slept = RefCell::new(Vec::new());
        let runner = StageRunner::new(&settings)
            .unwrap()
            .with_sleep(|d| slept.borrow_mut().push(d));
        let (action, ran) = fixed(Ok(()));
        let stage = Stage::new(StageId::Network, action).with_post_delay(Duration::from_secs(5));

        let result = runner.run(&stage);
        assert!(result.succeeded && !result.skipped);
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(*slept.borrow(), vec![Duration::from_secs(5)]);
    }

    #[test]
    fn failure_reports_exit_code_and_skips_delay() {
        let settings = Settings::default();
        let slept = RefCell::new(Vec::new());
        let runner = StageRunner::new(&settings)
            .unwrap()
            .with_sleep(|d| slept.borrow_mut().push(d));
        let (action, _) = fixed(Err(42));
        let stage = Stage::new(StageId::Iscsi, action).with_post_delay(Duration::from_secs(5));

        let result = runner.run(&stage);
        assert!(!result.succeeded);
        assert_eq!(result.exit_code, 42);
        assert_eq!(result.message.as_deref(), Some("boom"));
        assert!(slept.borrow().is_empty());
    }
}
