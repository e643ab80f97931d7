use super::{json_pretty, validated, EXIT_SUCCESS};
use fsboot_config::Settings;

pub fn run(settings: &Settings, json: bool) -> Result<u8, String> {
    validated(settings)?;
    let pairs = settings.to_env().map_err(|e| format!("config error: {e}"))?;
    if json {
        let map: serde_json::Map<String, serde_json::Value> = pairs
            .into_iter()
            .map(|(k, v)| (k, serde_json::Value::String(v)))
            .collect();
        println!("{}", json_pretty(&map)?);
    } else {
        for (key, value) in pairs {
            println!("{key}={value}");
        }
        println!("\nconfiguration OK");
    }
    Ok(EXIT_SUCCESS)
}
