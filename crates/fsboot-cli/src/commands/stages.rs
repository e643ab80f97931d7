use super::{json_pretty, EXIT_SUCCESS};
use fsboot_config::Settings;
use fsboot_core::standard_stages;

pub fn run(settings: &Settings, json: bool) -> Result<u8, String> {
    let stages = standard_stages(settings);
    if json {
        let payload: Vec<_> = stages
            .iter()
            .map(|s| {
                serde_json::json!({
                    "name": s.name(),
                    "description": s.description,
                    "enabled": s.enabled,
                    "action": s.action.describe(),
                    "post_delay_secs": s.post_delay.as_secs(),
                })
            })
            .collect();
        println!("{}", json_pretty(&payload)?);
    } else {
        for (i, s) in stages.iter().enumerate() {
            let state = if s.enabled { "enabled" } else { "disabled" };
            println!("{}. {:<14} {:<9} {}", i + 1, s.name(), state, s.description);
        }
    }
    Ok(EXIT_SUCCESS)
}
