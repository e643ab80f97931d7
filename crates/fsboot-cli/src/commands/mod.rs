pub mod check_config;
pub mod run;
pub mod stage;
pub mod stages;
pub mod status;

use fsboot_config::Settings;
use fsboot_core::{ProbeStatus, RunResult, StartupLock};
use std::sync::atomic::{AtomicU8, Ordering};

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_LOCK_ERROR: u8 = 3;
pub const EXIT_INTERRUPTED: u8 = 130;

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, String> {
    serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization failed: {e}"))
}

/// Map a stage or run exit code onto a process exit status.
pub fn exit_status(code: i32) -> u8 {
    if code == 0 {
        EXIT_SUCCESS
    } else {
        u8::try_from(code)
            .ok()
            .filter(|c| *c != 0)
            .unwrap_or(EXIT_FAILURE)
    }
}

/// Status decided before any output is printed; a closed stdout exits with it.
static DECIDED_EXIT: AtomicU8 = AtomicU8::new(EXIT_SUCCESS);

/// Record `code` as the process status and return it.
pub fn decide_exit(code: u8) -> u8 {
    DECIDED_EXIT.store(code, Ordering::SeqCst);
    code
}

pub fn decided_exit() -> u8 {
    DECIDED_EXIT.load(Ordering::SeqCst)
}

pub fn validated(settings: &Settings) -> Result<(), String> {
    settings.validate().map_err(|e| format!("config error: {e}"))
}

pub fn acquire_lock(settings: &Settings) -> Result<StartupLock, String> {
    StartupLock::acquire(
        &settings.lock_file,
        settings.lock_timeout(),
        settings.lock_poll_interval(),
    )
    .map_err(|e| format!("startup lock: {e}"))
}

pub fn colorize_result(result: &RunResult) -> String {
    use console::Style;
    let label = result.status_label();
    match label {
        "ok" => Style::new().green().apply_to(label).to_string(),
        "failed" => Style::new().red().bold().apply_to(label).to_string(),
        "skipped" => Style::new().dim().apply_to(label).to_string(),
        other => other.to_owned(),
    }
}

pub fn colorize_probe(status: ProbeStatus) -> String {
    use console::Style;
    let label = status.to_string();
    match status {
        ProbeStatus::Active => Style::new().green().apply_to(label).to_string(),
        ProbeStatus::Inactive => Style::new().red().apply_to(label).to_string(),
        ProbeStatus::Unknown => Style::new().yellow().apply_to(label).to_string(),
    }
}

pub fn print_results(results: &[RunResult]) {
    for r in results {
        println!(
            "  {:<14} {:<8} {:>7.1}s  {}",
            r.stage.name(),
            colorize_result(r),
            r.duration.as_secs_f64(),
            r.message.as_deref().unwrap_or("")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsboot_core::StageId;

    #[test]
    fn exit_status_maps_codes() {
        assert_eq!(exit_status(0), EXIT_SUCCESS);
        assert_eq!(exit_status(21), 21);
        assert_eq!(exit_status(130), EXIT_INTERRUPTED);
        assert_eq!(exit_status(256), EXIT_FAILURE);
        assert_eq!(exit_status(-1), EXIT_FAILURE);
    }

    #[test]
    fn exit_codes_are_distinct() {
        assert_ne!(EXIT_SUCCESS, EXIT_FAILURE);
        assert_ne!(EXIT_FAILURE, EXIT_CONFIG_ERROR);
        assert_ne!(EXIT_CONFIG_ERROR, EXIT_LOCK_ERROR);
        assert_eq!(i32::from(EXIT_INTERRUPTED), fsboot_core::EXIT_INTERRUPTED);
    }

    #[test]
    fn colorize_keeps_labels() {
        let skipped = RunResult::skipped(StageId::Nextcloud);
        assert!(colorize_result(&skipped).contains("skipped"));
        assert!(colorize_probe(ProbeStatus::Unknown).contains("unknown"));
    }

    #[test]
    fn validated_prefixes_config_errors() {
        let err = validated(&Settings::default()).unwrap_err();
        assert!(err.starts_with("config error:"));
        assert!(err.contains("ISCSI_TARGET_IP"));
    }

    #[test]
    fn json_pretty_serializes_value() {
        let val = serde_json::json!({"stage": "iscsi"});
        assert!(json_pretty(&val).unwrap().contains("\"iscsi\""));
    }
}
