use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, path::PathBuf, time::Duration};

/// Permissions requested during authorization
pub const DEFAULT_SCOPES: &[&str] = &["weight", "sleep", "profile", "activity", "heartrate", "nutrition"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub fitbit: FitbitConfig,
    #[serde(default)]
    pub callback: CallbackConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitbitConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_scopes")]
    pub scopes: Vec<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackConfig {
    #[serde(default = "default_callback_host")]
    pub host: String,
    #[serde(default = "default_callback_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,
    #[serde(default = "default_true")]
    pub open_browser: bool,
    /// 0 keeps the listener bound until a callback arrives
    #[serde(default = "default_callback_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_token_path")]
    pub token_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Defaults
fn default_auth_url() -> String { "https://www.fitbit.com/oauth2/authorize".to_string() }
fn default_token_url() -> String { "https://api.fitbit.com/oauth2/token".to_string() }
fn default_scopes() -> Vec<String> { DEFAULT_SCOPES.iter().map(|s| s.to_string()).collect() }
fn default_request_timeout() -> u64 { 30 }
fn default_callback_host() -> String { "127.0.0.1".to_string() }
fn default_callback_port() -> u16 { 3000 }
fn default_true() -> bool { true }
fn default_callback_timeout() -> u64 { 600 }
fn default_token_path() -> PathBuf { PathBuf::from(".fitbit-token.json") }
fn default_log_level() -> String { "info".to_string() }

impl Default for FitbitConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            auth_url: default_auth_url(),
            token_url: default_token_url(),
            scopes: default_scopes(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            host: default_callback_host(),
            port: default_callback_port(),
            redirect_uri: None,
            open_browser: true,
            timeout_secs: default_callback_timeout(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            token_path: default_token_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl FitbitConfig {
    /// Both client id and secret present and non-empty
    pub fn has_credentials(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.client_id) && present(&self.client_secret)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl CallbackConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Redirect URI registered with the provider
    pub fn redirect_uri(&self) -> String {
        self.redirect_uri
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}/callback", self.port))
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config_path = env::var("FITBIT_AUTH_CONFIG").ok().or_else(|| {
            let home_config = format!(
                "{}/.config/fitbit-auth/config.toml",
                env::var("HOME").unwrap_or_default()
            );
            ["./fitbit-auth.toml".to_string(), home_config]
                .into_iter()
                .find(|path| Path::new(path).exists())
        });

        let mut config = match config_path {
            Some(path) => Self::from_file(&path)?,
            None => {
                tracing::debug!("No config file found, using defaults");
                Config::default()
            }
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML config file, substituting ${VAR} references
    pub fn from_file(path: &str) -> Result<Self> {
        // Validate config file permissions on Unix systems
        #[cfg(unix)]
        Self::validate_file_permissions(path)?;

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::from_toml_str(&content).with_context(|| format!("Failed to parse config file: {}", path))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let content = Self::substitute_env_vars(content);
        Ok(toml::from_str(&content)?)
    }

    /// FITBIT_CLIENT_ID / FITBIT_CLIENT_SECRET take precedence over the file
    fn apply_env_overrides(&mut self) {
        if let Ok(id) = env::var("FITBIT_CLIENT_ID") {
            self.fitbit.client_id = Some(id);
        }
        if let Ok(secret) = env::var("FITBIT_CLIENT_SECRET") {
            self.fitbit.client_secret = Some(secret);
        }
    }

    /// Substitute ${VAR_NAME} with environment variable values
    fn substitute_env_vars(content: &str) -> String {
        let mut result = content.to_string();
        let mut offset = 0;

        while let Some(start) = result[offset..].find("${").map(|i| i + offset) {
            let Some(end) = result[start..].find('}') else {
                break;
            };
            let var_name = &result[start + 2..start + end];
            let value = env::var(var_name).unwrap_or_default();
            result.replace_range(start..start + end + 1, &value);
            offset = start + value.len();
        }

        result
    }

    fn validate(&self) -> Result<()> {
        url::Url::parse(&self.callback.redirect_uri())
            .with_context(|| format!("Invalid redirect URI: {}", self.callback.redirect_uri()))?;

        Ok(())
    }

    /// Validate config file permissions (Unix only)
    #[cfg(unix)]
    fn validate_file_permissions(path: &str) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let path_obj = Path::new(path);

        if !path_obj.exists() {
            tracing::debug!("Config file does not exist yet: {}", path);
            return Ok(());
        }

        let metadata = fs::metadata(path_obj)
            .with_context(|| format!("Failed to read metadata for config file: {}", path))?;

        let mode = metadata.permissions().mode();

        let group_readable = (mode & 0o040) != 0;
        let others_readable = (mode & 0o004) != 0;
        let group_writable = (mode & 0o020) != 0;
        let others_writable = (mode & 0o002) != 0;

        if group_readable || others_readable {
            tracing::warn!(
                "⚠️  Config file {} has insecure permissions: {:o}",
                path,
                mode & 0o777
            );
            tracing::warn!(
                "   Recommended: chmod 600 {} (it may contain the Fitbit client secret)",
                path
            );
        }

        if group_writable || others_writable {
            anyhow::bail!(
                "Config file {} is writable by group or others (mode: {:o}). \
                This is a security risk. Run: chmod 600 {}",
                path,
                mode & 0o777,
                path
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        unsafe { env::set_var("FITBIT_AUTH_TEST_VAR", "test_value") };

        let input = "client_secret = \"${FITBIT_AUTH_TEST_VAR}\"";
        let output = Config::substitute_env_vars(input);

        assert_eq!(output, "client_secret = \"test_value\"");

        unsafe { env::remove_var("FITBIT_AUTH_TEST_VAR") };
    }

    #[test]
    fn test_env_var_substitution_missing_var_is_empty() {
        let output = Config::substitute_env_vars("a = \"${FITBIT_AUTH_SURELY_UNSET}\"\nb = \"${");
        assert_eq!(output, "a = \"\"\nb = \"${");
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.callback.port, 3000);
        assert_eq!(config.callback.redirect_uri(), "http://localhost:3000/callback");
        assert_eq!(config.callback.timeout(), Some(Duration::from_secs(600)));
        assert_eq!(config.storage.token_path, PathBuf::from(".fitbit-token.json"));
        assert_eq!(config.fitbit.scopes, vec!["weight", "sleep", "profile", "activity", "heartrate", "nutrition"]);
        assert!(!config.fitbit.has_credentials());
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = Config::from_toml_str(
            r#"
            [fitbit]
            client_id = "ABC123"
            client_secret = "s3cret"

            [callback]
            port = 8765
            timeout_secs = 0
            "#,
        )
        .unwrap();

        assert!(config.fitbit.has_credentials());
        assert_eq!(config.fitbit.token_url, "https://api.fitbit.com/oauth2/token");
        assert_eq!(config.callback.bind_addr(), "127.0.0.1:8765");
        assert_eq!(config.callback.redirect_uri(), "http://localhost:8765/callback");
        assert_eq!(config.callback.timeout(), None);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_blank_credentials_are_not_configured() {
        let mut fitbit = FitbitConfig::default();
        fitbit.client_id = Some("id".to_string());
        fitbit.client_secret = Some("   ".to_string());
        assert!(!fitbit.has_credentials());
    }

    #[test]
    fn test_validate_rejects_bad_redirect_uri() {
        let mut config = Config::default();
        config.callback.redirect_uri = Some("not a uri".to_string());
        assert!(config.validate().is_err());
    }
}
