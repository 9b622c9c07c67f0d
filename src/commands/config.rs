use crate::config::CrabViewConfig;
use std::sync::{Arc, RwLock};
use tauri::command;

lazy_static::lazy_static! {
    static ref GLOBAL_CONFIG: Arc<RwLock<CrabViewConfig>> = Arc::new(RwLock::new(CrabViewConfig::load_or_default()));
}

/// Snapshot of the active configuration, used when new streams are created
pub fn current_config() -> Result<CrabViewConfig, String> {
    let config = GLOBAL_CONFIG.read().map_err(|e| e.to_string())?;
    Ok(config.clone())
}

/// Get the current configuration
#[command]
pub async fn get_config() -> Result<CrabViewConfig, String> {
    current_config()
}

/// Update configuration. Streams already running keep the settings they
/// were started with.
#[command]
pub async fn update_config(new_config: CrabViewConfig) -> Result<(), String> {
    new_config.validate()?;

    {
        let mut config = GLOBAL_CONFIG.write().map_err(|e| e.to_string())?;
        *config = new_config.clone();
    }

    new_config
        .save_to_file(CrabViewConfig::default_path())
        .map_err(|e| e.to_string())?;

    log::info!("Configuration updated");
    Ok(())
}

/// Reset configuration to defaults
#[command]
pub async fn reset_config() -> Result<CrabViewConfig, String> {
    let default_config = CrabViewConfig::default();

    {
        let mut config = GLOBAL_CONFIG
            .write()
            .map_err(|e| format!("Failed to write config: {}", e))?;
        *config = default_config.clone();
    }

    default_config
        .save_to_file(CrabViewConfig::default_path())
        .map_err(|e| e.to_string())?;

    Ok(default_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_config_returns_valid_snapshot() {
        let config = get_config().await.unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(current_config().unwrap(), config);
    }

    #[tokio::test]
    async fn test_update_config_rejects_invalid() {
        let before = current_config().unwrap();
        let mut bad = before.clone();
        bad.signaling.url = "http://not-a-websocket".to_string();

        assert!(update_config(bad).await.is_err());
        assert_eq!(current_config().unwrap(), before);
    }
}
