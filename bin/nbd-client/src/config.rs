use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub nbd: NbdConfig,
    pub server: ServerConfig,
    pub backend: BackendConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct NbdConfig {
    pub file: String,
    pub blocksize: u32,
    #[serde(default = "default_timeout")]
    pub timeout: u32,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct BackendConfig {
    pub name: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_timeout() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}
