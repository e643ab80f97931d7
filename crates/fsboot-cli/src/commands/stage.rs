use super::{
    acquire_lock, decide_exit, exit_status, json_pretty, print_results, validated, EXIT_SUCCESS,
};
use fsboot_config::Settings;
use fsboot_core::{standard_stages, StageId, StageRunner};
use std::time::Duration;
use tracing::warn;

pub fn run(settings: &Settings, id: StageId, force: bool, json: bool) -> Result<u8, String> {
    validated(settings)?;
    let mut stage = standard_stages(settings)
        .into_iter()
        .find(|s| s.id == id)
        .ok_or_else(|| format!("unknown stage: {id}"))?;
    if force && !stage.enabled {
        warn!("stage {id} is disabled by configuration, running it anyway (--force)");
        stage.enabled = true;
    }
    stage.post_delay = Duration::ZERO;

    let lock = acquire_lock(settings)?;
    let runner = StageRunner::new(settings).map_err(|e| e.to_string())?;
    let result = runner.run(&stage);
    lock.release();
    let status = decide_exit(if result.failed() {
        exit_status(result.exit_code)
    } else {
        EXIT_SUCCESS
    });

    if json {
        println!("{}", json_pretty(&result)?);
    } else {
        print_results(std::slice::from_ref(&result));
        println!("log: {}", settings.stage_log_path(id.name()).display());
    }
    Ok(status)
}
