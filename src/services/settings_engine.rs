// smartmarks Settings Engine
// Loads the application configuration from a JSON file, then applies
// environment overrides and validates the result.

use std::fs;
use std::path::Path;

use tracing::debug;

use crate::types::errors::SettingsError;
use crate::types::settings::{AppConfig, BackendKind};

/// Environment variable naming the config file.
pub const CONFIG_PATH_VAR: &str = "SMARTMARKS_CONFIG";

const DEFAULT_CONFIG_FILE: &str = "smartmarks.json";

/// Trait defining the settings engine interface.
pub trait SettingsEngineTrait {
    fn load(&mut self) -> Result<AppConfig, SettingsError>;
    fn apply_env_overrides<I>(&mut self, vars: I) -> Result<(), SettingsError>
    where
        I: IntoIterator<Item = (String, String)>;
    fn validate(&self) -> Result<(), SettingsError>;
    fn get_settings(&self) -> &AppConfig;
    fn get_config_path(&self) -> &str;
}

/// Settings engine reading a JSON config file.
pub struct SettingsEngine {
    config_path: String,
    settings: AppConfig,
}

impl SettingsEngine {
    /// Creates a new SettingsEngine.
    ///
    /// If `path_override` is `Some`, uses that path for the config file.
    /// Otherwise uses `$SMARTMARKS_CONFIG`, falling back to `smartmarks.json`
    /// in the working directory.
    pub fn new(path_override: Option<String>) -> Self {
        let config_path = path_override
            .or_else(|| std::env::var(CONFIG_PATH_VAR).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

        Self {
            config_path,
            settings: AppConfig::default(),
        }
    }

    /// Loads the file, applies the process environment and validates.
    pub fn load_from_environment(&mut self) -> Result<AppConfig, SettingsError> {
        self.load()?;
        self.apply_env_overrides(std::env::vars())?;
        self.validate()?;
        Ok(self.settings.clone())
    }
}

impl SettingsEngineTrait for SettingsEngine {
    /// Loads settings from the JSON config file.
    ///
    /// If the file does not exist, returns default settings.
    /// If the file exists but is malformed, returns a serialization error.
    fn load(&mut self) -> Result<AppConfig, SettingsError> {
        let path = Path::new(&self.config_path);

        if !path.exists() {
            debug!(path = %self.config_path, "no config file, using defaults");
            self.settings = AppConfig::default();
            return Ok(self.settings.clone());
        }

        let content = fs::read_to_string(path)
            .map_err(|e| SettingsError::IoError(format!("Failed to read config file: {}", e)))?;

        let settings: AppConfig = serde_json::from_str(&content).map_err(|e| {
            SettingsError::SerializationError(format!("Failed to parse config file: {}", e))
        })?;

        self.settings = settings;
        Ok(self.settings.clone())
    }

    /// Applies `SMARTMARKS_*` variables on top of the loaded file.
    fn apply_env_overrides<I>(&mut self, vars: I) -> Result<(), SettingsError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "SMARTMARKS_BACKEND" => {
                    self.settings.backend = match value.to_ascii_lowercase().as_str() {
                        "supabase" => BackendKind::Supabase,
                        "local" => BackendKind::Local,
                        other => {
                            return Err(SettingsError::InvalidValue(format!(
                                "Unknown backend '{}'",
                                other
                            )))
                        }
                    }
                }
                "SMARTMARKS_SUPABASE_URL" => self.settings.supabase_url = value,
                "SMARTMARKS_SUPABASE_ANON_KEY" => self.settings.anon_key = value,
                "SMARTMARKS_REDIRECT_TO" => self.settings.redirect_to = Some(value),
                "SMARTMARKS_LOG" => self.settings.log_filter = value,
                "SMARTMARKS_DB_PATH" => self.settings.local_db_path = Some(value),
                _ => {}
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), SettingsError> {
        let s = &self.settings;
        if s.backend == BackendKind::Supabase {
            if !s.supabase_url.starts_with("https://") && !s.supabase_url.starts_with("http://") {
                return Err(SettingsError::InvalidValue(format!(
                    "supabase_url must be an http(s) URL, got '{}'",
                    s.supabase_url
                )));
            }
            if s.anon_key.trim().is_empty() {
                return Err(SettingsError::InvalidValue(
                    "anon_key is required for the supabase backend".to_string(),
                ));
            }
        }
        if s.table.trim().is_empty() || s.schema.trim().is_empty() {
            return Err(SettingsError::InvalidValue(
                "schema and table must not be empty".to_string(),
            ));
        }
        if s.request_timeout_secs == 0
            || s.heartbeat_interval_secs == 0
            || s.session_check_secs == 0
            || s.feed_retry_initial_ms == 0
            || s.feed_retry_max_secs == 0
        {
            return Err(SettingsError::InvalidValue(
                "timeouts and intervals must be greater than zero".to_string(),
            ));
        }
        if s.command_buffer == 0 {
            return Err(SettingsError::InvalidValue(
                "command_buffer must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns a reference to the current in-memory settings.
    fn get_settings(&self) -> &AppConfig {
        &self.settings
    }

    /// Returns the path to the config file.
    fn get_config_path(&self) -> &str {
        &self.config_path
    }
}
