//! Settings service
//!
//! Persists per-device preferences as a JSON file in the data directory.
//! Nothing here is shared through the store.

use crate::config::SETTINGS_FILE_NAME;
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// Import behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportSettings {
    /// Whether a staged row needs a caller name to count as complete
    #[serde(default = "default_true")]
    pub require_caller_name: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            require_caller_name: default_true(),
        }
    }
}

/// Local preferences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Preferences {
    /// Name recorded as the caller on new records and imports
    #[serde(default)]
    pub display_name: Option<String>,
    /// Project selected when the engine last ran on this device
    #[serde(default)]
    pub last_active_project_id: Option<String>,
    #[serde(default)]
    pub import: ImportSettings,
}

/// Service for managing local preferences
#[derive(Clone)]
pub struct SettingsService {
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            settings_path: data_dir.join(SETTINGS_FILE_NAME),
        }
    }

    /// Load preferences from disk or create defaults if missing
    pub async fn load(&self) -> Result<Preferences> {
        if !self.settings_path.exists() {
            tracing::info!("Settings file not found, creating default preferences");
            let default = Preferences::default();
            self.save(&default).await?;
            return Ok(default);
        }

        let content = fs::read_to_string(&self.settings_path).await?;
        let preferences: Preferences = serde_json::from_str(&content)
            .map_err(|e| AppError::Generic(format!("Failed to parse settings: {}", e)))?;

        Ok(preferences)
    }

    pub async fn save(&self, preferences: &Preferences) -> Result<()> {
        let content = serde_json::to_string_pretty(preferences)
            .map_err(|e| AppError::Generic(format!("Failed to serialize settings: {}", e)))?;

        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&self.settings_path, content).await?;
        tracing::debug!("Settings saved to {:?}", self.settings_path);

        Ok(())
    }

    pub async fn set_display_name(&self, name: Option<String>) -> Result<()> {
        let mut preferences = self.load().await?;
        preferences.display_name = name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());
        self.save(&preferences).await
    }

    pub async fn set_last_active_project(&self, project_id: &str) -> Result<()> {
        let mut preferences = self.load().await?;
        if preferences.last_active_project_id.as_deref() == Some(project_id) {
            return Ok(());
        }
        preferences.last_active_project_id = Some(project_id.to_string());
        self.save(&preferences).await
    }

    pub async fn update_import(&self, import: ImportSettings) -> Result<()> {
        let mut preferences = self.load().await?;
        preferences.import = import;
        self.save(&preferences).await
    }
}
