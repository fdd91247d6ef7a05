use config::{Config, Environment, File};
use serde::Deserialize;

use crate::CLIENT_NAME;

const CONFIG_NAME: &str = "config.toml";
const DEFAULT_BASE_URL: &str = "https://api.teller.io";

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub access_token: String,
    pub base_url: String,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    pub db_file: String,
    pub reports_dir: String,
}

impl Settings {
    pub fn new(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut s = Config::builder()
            .set_default("base_url", DEFAULT_BASE_URL)?
            .set_default("db_file", default_data_path())?
            .set_default("reports_dir", "reports")?;

        if let Some(path) = config_path {
            s = s.add_source(File::with_name(path));
        } else {
            s = s.add_source(File::with_name(&default_config_path()).required(false));
        }

        // Environment takes precedence over the file, e.g. BURSAR_ACCESS_TOKEN.
        s = s.add_source(Environment::with_prefix("BURSAR"));

        s.build()?.try_deserialize()
    }

    /// Connection string for the SQLite store, creating the data directory on
    /// first use.
    pub fn db_url(&self) -> anyhow::Result<String> {
        if let Some(dir) = std::path::Path::new(&self.db_file).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        Ok(format!("sqlite://{}?mode=rwc", self.db_file))
    }
}

fn default_data_path() -> String {
    dirs::data_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()))
        .join(CLIENT_NAME)
        .join(format!("{}.db", CLIENT_NAME))
        .display()
        .to_string()
}

fn default_config_path() -> String {
    dirs::config_dir()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| std::env::temp_dir()))
        .join(CLIENT_NAME)
        .join(CONFIG_NAME)
        .display()
        .to_string()
}
