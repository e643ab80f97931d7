use crate::probe::parse_mount_points;
use crate::retry::{retry, RetryPolicy};
use crate::stage::StageId;
use fsboot_config::Settings;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

/// Whether a failure is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    Transient,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (exit code {exit_code})")]
pub struct ActionFailure {
    pub kind: FailureKind,
    pub exit_code: i32,
    pub message: String,
    pub attempts: u32,
}

impl ActionFailure {
    fn new(kind: FailureKind, exit_code: i32, message: impl Into<String>) -> Self {
        Self {
            kind,
            // A failure never reports success.
            exit_code: if exit_code == 0 { 1 } else { exit_code },
            message: message.into(),
            attempts: 1,
        }
    }

    pub fn transient(exit_code: i32, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, exit_code, message)
    }

    pub fn fatal(exit_code: i32, message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, exit_code, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Transient
    }

    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutput {
    pub note: Option<String>,
    pub attempts: u32,
}

impl Default for ActionOutput {
    fn default() -> Self {
        Self {
            note: None,
            attempts: 1,
        }
    }
}

impl ActionOutput {
    pub fn with_note(note: impl Into<String>) -> Self {
        Self {
            note: Some(note.into()),
            attempts: 1,
        }
    }
}

/// Everything an action may look at while it runs.
pub struct ActionContext<'a> {
    pub stage: StageId,
    pub settings: &'a Settings,
    /// Settings rendered as `KEY=value` pairs for child processes.
    pub env: &'a [(String, String)],
    pub log_path: PathBuf,
}

/// The black-box unit of work behind a stage.
pub trait StageAction: Send + Sync {
    fn describe(&self) -> String;

    fn run(&self, ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionFailure>;
}

/// Runs a provisioning script, appending its output to the stage log.
///
/// Relative paths resolve against `SCRIPT_DIR`.
pub struct ScriptAction {
    script: PathBuf,
    args: Vec<String>,
}

impl ScriptAction {
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: &[&str]) -> Self {
        self.args = args.iter().map(|a| (*a).to_owned()).collect();
        self
    }

    fn resolve(&self, settings: &Settings) -> PathBuf {
        if self.script.is_absolute() {
            self.script.clone()
        } else {
            settings.script_dir.join(&self.script)
        }
    }
}

impl StageAction for ScriptAction {
    fn describe(&self) -> String {
        if self.args.is_empty() {
            format!("script {}", self.script.display())
        } else {
            format!("script {} {}", self.script.display(), self.args.join(" "))
        }
    }

    fn run(&self, ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionFailure> {
        let script = self.resolve(ctx.settings);
        if !script.is_file() {
            return Err(ActionFailure::fatal(
                127,
                format!("script not found: {}", script.display()),
            ));
        }

        let mut log = open_stage_log(&ctx.log_path).map_err(|e| {
            ActionFailure::fatal(
                1,
                format!("cannot open stage log {}: {e}", ctx.log_path.display()),
            )
        })?;
        writeln!(
            log,
            "==== {} [{}] {} ====",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            ctx.stage,
            script.display()
        )
        .map_err(|e| {
            ActionFailure::fatal(
                1,
                format!("cannot write stage log {}: {e}", ctx.log_path.display()),
            )
        })?;
        let stderr = log
            .try_clone()
            .map_err(|e| ActionFailure::fatal(1, format!("cannot duplicate log handle: {e}")))?;

        debug!("executing {}", script.display());
        let mut command = Command::new(&script);
        command
            .args(&self.args)
            .envs(ctx.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("FSBOOT_STAGE", ctx.stage.name())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr));
        let status = spawn_and_wait(&mut command).map_err(|e| {
            ActionFailure::fatal(126, format!("failed to execute {}: {e}", script.display()))
        })?;

        match (status.code(), status.signal()) {
            (Some(0), _) => Ok(ActionOutput::default()),
            (Some(code), _) => Err(ActionFailure::transient(
                code,
                format!("{} exited with status {code}", script.display()),
            )),
            (None, Some(signal)) => Err(ActionFailure::fatal(
                128 + signal,
                format!("{} was killed by signal {signal}", script.display()),
            )),
            (None, None) => Err(ActionFailure::fatal(
                1,
                format!("{} terminated abnormally", script.display()),
            )),
        }
    }
}

/// A script that is still being written (or replaced) reports ETXTBSY briefly.
fn spawn_and_wait(command: &mut Command) -> std::io::Result<std::process::ExitStatus> {
    let mut attempts = 0;
    loop {
        match command.status() {
            Err(e) if e.kind() == std::io::ErrorKind::ExecutableFileBusy && attempts < 5 => {
                attempts += 1;
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            other => return other,
        }
    }
}

fn open_stage_log(path: &Path) -> std::io::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Fails unless `path` is currently a mount point.
pub struct MountPrecondition {
    path: PathBuf,
    mounts_file: PathBuf,
}

impl MountPrecondition {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            mounts_file: PathBuf::from("/proc/self/mounts"),
        }
    }

    #[must_use]
    pub fn with_mounts_file(mut self, mounts_file: impl Into<PathBuf>) -> Self {
        self.mounts_file = mounts_file.into();
        self
    }
}

impl StageAction for MountPrecondition {
    fn describe(&self) -> String {
        format!("require mount {}", self.path.display())
    }

    fn run(&self, _ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionFailure> {
        let contents = fs::read_to_string(&self.mounts_file).map_err(|e| {
            ActionFailure::fatal(
                1,
                format!("cannot read {}: {e}", self.mounts_file.display()),
            )
        })?;
        if parse_mount_points(&contents).iter().any(|m| *m == self.path) {
            Ok(ActionOutput::with_note(format!(
                "{} is mounted",
                self.path.display()
            )))
        } else {
            Err(ActionFailure::fatal(
                1,
                format!("{} is not mounted", self.path.display()),
            ))
        }
    }
}

/// Runs actions in order, stopping at the first failure.
pub struct Sequence {
    steps: Vec<Box<dyn StageAction>>,
}

impl Sequence {
    pub fn new(steps: Vec<Box<dyn StageAction>>) -> Self {
        Self { steps }
    }
}

impl StageAction for Sequence {
    fn describe(&self) -> String {
        self.steps
            .iter()
            .map(|s| s.describe())
            .collect::<Vec<_>>()
            .join(", then ")
    }

    fn run(&self, ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionFailure> {
        let mut last = ActionOutput::default();
        for step in &self.steps {
            last = step.run(ctx)?;
        }
        Ok(last)
    }
}

/// Wraps an action in the retry executor.
pub struct Retrying {
    inner: Box<dyn StageAction>,
    policy: RetryPolicy,
}

impl Retrying {
    pub fn new(inner: impl StageAction + 'static, policy: RetryPolicy) -> Self {
        Self {
            inner: Box::new(inner),
            policy,
        }
    }
}

impl StageAction for Retrying {
    fn describe(&self) -> String {
        format!(
            "{} (up to {} attempts)",
            self.inner.describe(),
            self.policy.max_attempts
        )
    }

    fn run(&self, ctx: &ActionContext<'_>) -> Result<ActionOutput, ActionFailure> {
        retry(&self.policy, ctx.stage.name(), |attempt| {
            self.inner.run(ctx).map(|mut out| {
                out.attempts = attempt;
                out
            })
        })
    }
}
