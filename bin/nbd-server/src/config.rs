use serde::Deserialize;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,
    #[serde(default = "default_mem_size_bytes")]
    pub mem_size_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            max_errors: default_max_errors(),
            mem_size_bytes: default_mem_size_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct BackendsConfig {
    pub rbd: Option<RbdBackendConfig>,
}

#[derive(Debug, Deserialize)]
pub struct RbdBackendConfig {
    pub image_service_endpoint: String,
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

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    10809
}

fn default_max_errors() -> u32 {
    16
}

fn default_mem_size_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}
