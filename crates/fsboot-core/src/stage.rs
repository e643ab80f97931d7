use crate::action::{
    ActionFailure, ActionOutput, MountPrecondition, Retrying, ScriptAction, Sequence, StageAction,
};
use crate::retry::RetryPolicy;
use fsboot_config::Settings;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// The provisioning stages, declared in the only order they may run.
///
/// The derived `Ord` is the dependency order: each stage relies on the
/// system state left behind by the ones before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StageId {
    Network,
    Iscsi,
    Cache,
    FileSharing,
    ExternalNfs,
    Nextcloud,
}

impl StageId {
    pub const ALL: [Self; 6] = [
        Self::Network,
        Self::Iscsi,
        Self::Cache,
        Self::FileSharing,
        Self::ExternalNfs,
        Self::Nextcloud,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Iscsi => "iscsi",
            Self::Cache => "cache",
            Self::FileSharing => "file-sharing",
            Self::ExternalNfs => "external-nfs",
            Self::Nextcloud => "nextcloud",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Network => "Network configuration and package prerequisites",
            Self::Iscsi => "iSCSI discovery, login, and backing device mount",
            Self::Cache => "bcache SSD writeback cache over the iSCSI device",
            Self::FileSharing => "Samba and NFS exports of the cached filesystem",
            Self::ExternalNfs => "External NFS mount (optionally over WireGuard)",
            Self::Nextcloud => "Nextcloud sync timer",
        }
    }

    /// Script name under `SCRIPT_DIR`.
    pub fn script(self) -> &'static str {
        match self {
            Self::Network => "network-setup.sh",
            Self::Iscsi => "iscsi-setup.sh",
            Self::Cache => "cache-setup.sh",
            Self::FileSharing => "file-sharing-setup.sh",
            Self::ExternalNfs => "external-nfs-setup.sh",
            Self::Nextcloud => "nextcloud-setup.sh",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|id| id.name() == wanted)
            .ok_or_else(|| {
                let known: Vec<_> = Self::ALL.iter().map(|id| id.name()).collect();
                format!("unknown stage '{s}' (expected one of: {})", known.join(", "))
            })
    }
}

/// One provisioning step. Built once at startup and never mutated after.
pub struct Stage {
    pub id: StageId,
    pub description: String,
    pub action: Box<dyn StageAction>,
    pub enabled: bool,
    /// Pause after success, giving services time to settle.
    pub post_delay: Duration,
}

impl Stage {
    pub fn new(id: StageId, action: impl StageAction + 'static) -> Self {
        Self {
            id,
            description: id.description().to_owned(),
            action: Box::new(action),
            enabled: true,
            post_delay: Duration::ZERO,
        }
    }

    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_post_delay(mut self, delay: Duration) -> Self {
        self.post_delay = delay;
        self
    }

    pub fn name(&self) -> &'static str {
        self.id.name()
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("id", &self.id)
            .field("action", &self.action.describe())
            .field("enabled", &self.enabled)
            .field("post_delay", &self.post_delay)
            .finish_non_exhaustive()
    }
}

/// Outcome of running (or skipping) one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunResult {
    pub stage: StageId,
    pub succeeded: bool,
    pub skipped: bool,
    pub exit_code: i32,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
    pub attempts: u32,
    pub message: Option<String>,
}

impl RunResult {
    pub fn skipped(stage: StageId) -> Self {
        Self {
            stage,
            succeeded: true,
            skipped: true,
            exit_code: 0,
            duration: Duration::ZERO,
            attempts: 0,
            message: Some("disabled by configuration".to_owned()),
        }
    }

    pub fn success(stage: StageId, duration: Duration, output: ActionOutput) -> Self {
        Self {
            stage,
            succeeded: true,
            skipped: false,
            exit_code: 0,
            duration,
            attempts: output.attempts,
            message: output.note,
        }
    }

    pub fn failure(stage: StageId, duration: Duration, failure: &ActionFailure) -> Self {
        Self {
            stage,
            succeeded: false,
            skipped: false,
            exit_code: failure.exit_code,
            duration,
            attempts: failure.attempts,
            message: Some(failure.message.clone()),
        }
    }

    pub fn failed(&self) -> bool {
        !self.succeeded
    }

    pub fn status_label(&self) -> &'static str {
        if self.skipped {
            "skipped"
        } else if self.succeeded {
            "ok"
        } else {
            "failed"
        }
    }
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
}

/// The canonical file-server pipeline, gated and timed from `settings`.
pub fn standard_stages(settings: &Settings) -> Vec<Stage> {
    let retry = RetryPolicy::from_settings(settings);
    let script = |id: StageId| ScriptAction::new(id.script());

    let mut stages = vec![
        Stage::new(
            StageId::Network,
            Retrying::new(script(StageId::Network), retry),
        ),
        Stage::new(StageId::Iscsi, Retrying::new(script(StageId::Iscsi), retry)),
        Stage::new(
            StageId::Cache,
            Sequence::new(vec![
                Box::new(MountPrecondition::new(&settings.iscsi_mount_point)),
                Box::new(script(StageId::Cache)),
            ]),
        ),
        Stage::new(
            StageId::FileSharing,
            Sequence::new(vec![
                Box::new(MountPrecondition::new(&settings.cache_mount_point)),
                Box::new(script(StageId::FileSharing)),
            ]),
        ),
        Stage::new(
            StageId::ExternalNfs,
            Retrying::new(script(StageId::ExternalNfs), retry),
        )
        .enabled(settings.enable_external_nfs),
        Stage::new(StageId::Nextcloud, script(StageId::Nextcloud))
            .enabled(settings.enable_nextcloud),
    ];

    let delay = settings.service_start_delay();
    for stage in &mut stages {
        stage.post_delay = delay;
    }
    // Nothing follows the final enabled stage, so it does not wait.
    if let Some(last) = stages.iter_mut().rev().find(|s| s.enabled) {
        last.post_delay = Duration::ZERO;
    }
    stages
}
