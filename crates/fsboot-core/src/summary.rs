use crate::orchestrator::{RunOutcome, RunReport};
use crate::probe::{HostProbe, ProbeStatus};
use crate::stage::RunResult;
use crate::CoreError;
use fsboot_config::Settings;
use serde::Serialize;
use std::fmt::Write as _;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct ServiceLine {
    pub unit: String,
    pub status: ProbeStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct MountLine {
    pub path: PathBuf,
    pub mounted: bool,
}

/// Snapshot of live host state after a run, cross-checking what the stages
/// reported about themselves.
#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub generated_at: String,
    pub hostname: String,
    pub kernel: String,
    pub uptime: String,
    pub outcome: Option<String>,
    pub exit_code: Option<i32>,
    pub stages: Vec<RunResult>,
    pub settings: Vec<(String, String)>,
    pub services: Vec<ServiceLine>,
    pub wireguard: Option<String>,
    pub iscsi_sessions: Option<String>,
    pub cache_devices: Vec<String>,
    pub mounts: Vec<MountLine>,
}

const UNKNOWN: &str = "unknown";

impl Summary {
    pub fn collect(settings: &Settings, report: Option<&RunReport>, probe: &dyn HostProbe) -> Self {
        let text = |program: &str, args: &[&str]| {
            probe
                .command_output(program, args)
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| UNKNOWN.to_owned())
        };

        let mut units = vec!["iscsid".to_owned(), "smbd".to_owned(), "nfs-server".to_owned()];
        if settings.enable_wireguard {
            units.push(format!("wg-quick@{}", settings.wireguard_interface));
        }
        if settings.enable_nextcloud {
            units.push("fsboot-nextcloud.timer".to_owned());
        }
        let services = units
            .into_iter()
            .map(|unit| ServiceLine {
                status: probe.service_active(&unit),
                unit,
            })
            .collect();

        let wireguard = if settings.enable_wireguard {
            probe.command_output("wg", &["show", &settings.wireguard_interface])
        } else {
            None
        };

        let mut watched = vec![
            settings.iscsi_mount_point.clone(),
            settings.cache_mount_point.clone(),
        ];
        if settings.enable_external_nfs {
            watched.push(settings.external_nfs_mount_point.clone());
        }
        let mounted = probe.mount_points();
        let mounts = watched
            .into_iter()
            .map(|path| MountLine {
                mounted: mounted.contains(&path),
                path,
            })
            .collect();

        Self {
            generated_at: chrono::Local::now().format("%Y-%m-%d %H:%M:%S %Z").to_string(),
            hostname: text("hostname", &[]),
            kernel: text("uname", &["-r"]),
            uptime: text("uptime", &["-p"]),
            outcome: report.map(describe_outcome),
            exit_code: report.map(RunReport::exit_code),
            stages: report.map(|r| r.results.clone()).unwrap_or_default(),
            settings: settings.to_env().unwrap_or_default(),
            services,
            wireguard,
            iscsi_sessions: probe
                .command_output("iscsiadm", &["-m", "session"])
                .filter(|s| !s.is_empty()),
            cache_devices: probe.cache_devices(),
            mounts,
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "fsboot startup summary");
        let _ = writeln!(out, "======================");
        let _ = writeln!(out, "Generated: {}", self.generated_at);
        let _ = writeln!(out, "Host:      {}", self.hostname);
        let _ = writeln!(out, "Kernel:    {}", self.kernel);
        let _ = writeln!(out, "Uptime:    {}", self.uptime);

        if let Some(outcome) = &self.outcome {
            section(&mut out, "Run");
            let _ = writeln!(
                out,
                "  outcome: {outcome} (exit code {})",
                self.exit_code.unwrap_or_default()
            );
            for r in &self.stages {
                let _ = writeln!(
                    out,
                    "  {:<14} {:<8} {:>7.1}s  {}",
                    r.stage.name(),
                    r.status_label(),
                    r.duration.as_secs_f64(),
                    r.message.as_deref().unwrap_or("")
                );
            }
        }

        section(&mut out, "Configuration");
        for (key, value) in &self.settings {
            let _ = writeln!(out, "  {key} = {value}");
        }

        section(&mut out, "Services");
        for s in &self.services {
            let _ = writeln!(out, "  {:<28} {}", s.unit, s.status);
        }

        if let Some(wg) = &self.wireguard {
            section(&mut out, "WireGuard");
            indent(&mut out, wg);
        }

        section(&mut out, "iSCSI sessions");
        match &self.iscsi_sessions {
            Some(sessions) => indent(&mut out, sessions),
            None => {
                let _ = writeln!(out, "  none or unknown");
            }
        }

        section(&mut out, "Cache devices");
        if self.cache_devices.is_empty() {
            let _ = writeln!(out, "  none");
        } else {
            let _ = writeln!(out, "  {}", self.cache_devices.join(" "));
        }

        section(&mut out, "Mount points");
        for m in &self.mounts {
            let state = if m.mounted { "mounted" } else { "not mounted" };
            let _ = writeln!(out, "  {:<28} {state}", m.path.display());
        }
        out
    }

    /// Atomically replace `path` with the rendered summary.
    pub fn write_to(&self, path: &Path) -> Result<(), CoreError> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(self.render().as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Collect and persist the summary; failures are logged, never raised.
pub fn write_summary(
    settings: &Settings,
    report: Option<&RunReport>,
    probe: &dyn HostProbe,
) -> Summary {
    let summary = Summary::collect(settings, report, probe);
    let path = settings.summary_path();
    match summary.write_to(&path) {
        Ok(()) => info!("status summary written to {}", path.display()),
        Err(e) => warn!("failed to write status summary {}: {e}", path.display()),
    }
    summary
}

fn describe_outcome(report: &RunReport) -> String {
    match &report.outcome {
        RunOutcome::Completed if report.is_success() => "completed".to_owned(),
        RunOutcome::Completed => "completed with failures".to_owned(),
        RunOutcome::Aborted { stage, .. } => format!("aborted at {stage}"),
        RunOutcome::Interrupted { next: Some(stage) } => format!("interrupted before {stage}"),
        RunOutcome::Interrupted { next: None } => "interrupted".to_owned(),
    }
}

fn section(out: &mut String, title: &str) {
    let _ = writeln!(out, "\n{title}\n{}", "-".repeat(title.len()));
}

fn indent(out: &mut String, text: &str) {
    for line in text.lines() {
        let _ = writeln!(out, "  {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::RunState;
    use crate::stage::StageId;
    use std::time::Duration;

    struct FakeProbe;

    impl HostProbe for FakeProbe {
        fn service_active(&self, unit: &str) -> ProbeStatus {
            match unit {
                "smbd" => ProbeStatus::Active,
                "nfs-server" => ProbeStatus::Inactive,
                _ => ProbeStatus::Unknown,
            }
        }

        fn command_output(&self, program: &str, _args: &[&str]) -> Option<String> {
            match program {
                "hostname" => Some("nas01".to_owned()),
                "iscsiadm" => Some("tcp: [1] 10.0.0.2:3260,1 iqn.2024-01.lan:storage".to_owned()),
                _ => None,
            }
        }

        fn mount_points(&self) -> Vec<PathBuf> {
            vec![PathBuf::from("/mnt/iscsi")]
        }

        fn cache_devices(&self) -> Vec<String> {
            vec!["bcache0".to_owned()]
        }
    }

    fn aborted_report() -> RunReport {
        RunReport {
            results: vec![
                RunResult {
                    stage: StageId::Network,
                    succeeded: true,
                    skipped: false,
                    exit_code: 0,
                    duration: Duration::from_millis(1500),
                    attempts: 1,
                    message: None,
                },
                RunResult {
                    stage: StageId::Iscsi,
                    succeeded: false,
                    skipped: false,
                    exit_code: 21,
                    duration: Duration::from_secs(3),
                    attempts: 3,
                    message: Some("login failed".to_owned()),
                },
            ],
            outcome: RunOutcome::Aborted {
                stage: StageId::Iscsi,
                exit_code: 21,
            },
            state: RunState::Aborted,
        }
    }

    #[test]
    fn collect_degrades_unknown_probes() {
        let summary = Summary::collect(&Settings::default(), None, &FakeProbe);
        assert_eq!(summary.hostname, "nas01");
        assert_eq!(summary.kernel, UNKNOWN);
        assert!(summary.outcome.is_none());
        let iscsid = summary.services.iter().find(|s| s.unit == "iscsid").unwrap();
        assert_eq!(iscsid.status, ProbeStatus::Unknown);
        assert!(summary.mounts[0].mounted);
        assert!(!summary.mounts[1].mounted);
    }

    #[test]
    fn optional_services_follow_settings() {
        let settings = Settings {
            enable_wireguard: true,
            enable_nextcloud: true,
            ..Settings::default()
        };
        let summary = Summary::collect(&settings, None, &FakeProbe);
        let units: Vec<_> = summary.services.iter().map(|s| s.unit.as_str()).collect();
        assert!(units.contains(&"wg-quick@wg0"));
        assert!(units.contains(&"fsboot-nextcloud.timer"));
    }

    #[test]
    fn render_includes_run_and_status() {
        let report = aborted_report();
        let summary = Summary::collect(&Settings::default(), Some(&report), &FakeProbe);
        let text = summary.render();
        assert!(text.contains("aborted at iscsi (exit code 21)"));
        assert!(text.contains("login failed"));
        assert!(text.contains("smbd"));
        assert!(text.contains("bcache0"));
        assert!(text.contains("iqn.2024-01.lan:storage"));
        assert!(text.contains("ENABLE_NEXTCLOUD = false"));
        assert!(text.contains("not mounted"));
    }

    #[test]
    fn write_summary_persists_into_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            log_dir: dir.path().join("logs"),
            ..Settings::default()
        };
        write_summary(&settings, None, &FakeProbe);
        let text = fs::read_to_string(settings.summary_path()).unwrap();
        assert!(text.starts_with("fsboot startup summary"));
    }

    #[test]
    fn write_failure_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "").unwrap();
        let settings = Settings {
            log_dir: blocker.join("logs"),
            ..Settings::default()
        };
        let summary = write_summary(&settings, None, &FakeProbe);
        assert_eq!(summary.hostname, "nas01");
    }
}
