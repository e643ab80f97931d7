use super::{acquire_lock, decide_exit, exit_status, json_pretty, print_results, validated};
use fsboot_config::Settings;
use fsboot_core::{write_summary, Orchestrator, SystemProbe};
use tracing::info;

pub fn run(settings: &Settings, json: bool) -> Result<u8, String> {
    validated(settings)?;
    let lock = acquire_lock(settings)?;
    info!(
        "startup lock {} held by pid {}",
        lock.path().display(),
        std::process::id()
    );

    let mut orchestrator = Orchestrator::standard(settings).map_err(|e| e.to_string())?;
    let report = orchestrator.run().map_err(|e| e.to_string())?;
    write_summary(settings, Some(&report), &SystemProbe::new());
    lock.release();
    let status = decide_exit(exit_status(report.exit_code()));

    if json {
        let payload = serde_json::json!({
            "report": report,
            "exit_code": report.exit_code(),
            "summary": settings.summary_path(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("fsboot run: {}", outcome_label(&report));
        print_results(&report.results);
        println!("summary: {}", settings.summary_path().display());
    }
    Ok(status)
}

fn outcome_label(report: &fsboot_core::RunReport) -> String {
    use fsboot_core::RunOutcome;
    match &report.outcome {
        RunOutcome::Completed if report.is_success() => "completed".to_owned(),
        RunOutcome::Completed => format!("completed with failures (exit {})", report.exit_code()),
        RunOutcome::Aborted { stage, exit_code } => {
            format!("aborted at {stage} (exit {exit_code})")
        }
        RunOutcome::Interrupted { .. } => "interrupted".to_owned(),
    }
}
