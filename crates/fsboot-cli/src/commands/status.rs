use super::{colorize_probe, json_pretty, EXIT_SUCCESS};
use fsboot_config::Settings;
use fsboot_core::{StartupLock, Summary, SystemProbe};

pub fn run(settings: &Settings, json: bool) -> Result<u8, String> {
    let summary = Summary::collect(settings, None, &SystemProbe::new());
    let lock = lock_state(settings);

    if json {
        let payload = serde_json::json!({
            "lock": lock,
            "summary": summary,
        });
        println!("{}", json_pretty(&payload)?);
        return Ok(EXIT_SUCCESS);
    }

    println!("fsboot status on {} ({})\n", summary.hostname, summary.generated_at);
    println!("  startup lock: {lock}");
    println!("\nServices");
    for s in &summary.services {
        println!("  {:<28} {}", s.unit, colorize_probe(s.status));
    }
    println!("\nMount points");
    for m in &summary.mounts {
        let state = if m.mounted { "mounted" } else { "not mounted" };
        println!("  {:<28} {state}", m.path.display());
    }
    println!("\nCache devices");
    if summary.cache_devices.is_empty() {
        println!("  none");
    } else {
        println!("  {}", summary.cache_devices.join(" "));
    }
    println!("\niSCSI sessions");
    println!(
        "  {}",
        summary
            .iscsi_sessions
            .as_deref()
            .unwrap_or("none or unknown")
            .replace('\n', "\n  ")
    );
    if let Some(wg) = &summary.wireguard {
        println!("\nWireGuard");
        println!("  {}", wg.replace('\n', "\n  "));
    }
    Ok(EXIT_SUCCESS)
}

fn lock_state(settings: &Settings) -> String {
    let path = &settings.lock_file;
    match StartupLock::is_held(path) {
        Ok(true) => match StartupLock::holder(path) {
            Some(pid) => format!("held by pid {pid} (run in progress)"),
            None => "held (run in progress)".to_owned(),
        },
        Ok(false) => match StartupLock::holder(path) {
            Some(pid) => format!("free (stale marker left by pid {pid})"),
            None => "free".to_owned(),
        },
        Err(e) => format!("unknown ({e})"),
    }
}
