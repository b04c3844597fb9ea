use std::fs;
use std::path::{Path, PathBuf};

use canopen_sdo::{ClientConfig, DEFAULT_TIMEOUT};
use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub can_interface: String,
    pub node_id: u8,
    pub eds_file_path: Option<String>,
    pub timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            can_interface: "vcan0".to_string(),
            node_id: 1,
            eds_file_path: None,
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl AppConfig {
    /// Get the path to the config file
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "canopen", "sdo-tool")
            .map(|proj_dirs| proj_dirs.config_dir().join("config.toml"))
    }

    /// Load configuration from the user config file, returns default if the
    /// file doesn't exist or on error
    pub fn load() -> Self {
        match Self::config_file_path() {
            Some(config_path) if config_path.exists() => Self::load_from(&config_path),
            _ => {
                info!("Using default configuration");
                Self::default()
            }
        }
    }

    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    return config;
                }
                Err(e) => warn!("Failed to parse config file: {}", e),
            },
            Err(e) => warn!("Failed to read config file: {}", e),
        }

        Self::default()
    }

    /// Save configuration to the user config file
    pub fn save(&self) -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_path = Self::config_file_path().ok_or("Could not determine config file path")?;
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        // Create config directory if it doesn't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, toml::to_string_pretty(self)?)?;
        info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            node_id: self.node_id,
            timeout_ms: self.timeout_ms,
        }
    }
}
