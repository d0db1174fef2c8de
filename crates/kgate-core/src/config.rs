//! Process configuration from environment / CLI.

use clap::Parser;

#[derive(Debug, Clone, Parser)]
#[command(name = "kgate", about = "OpenAI/Anthropic-compatible upstream gateway")]
pub struct ProxyConfig {
    /// Shared key clients present on /v1 endpoints.
    #[arg(long, env = "PROXY_API_KEY")]
    pub proxy_api_key: String,

    /// Bearer password for the /api admin surface.
    #[arg(long, env = "ADMIN_PASSWORD")]
    pub admin_password: String,

    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Requests per minute per client; 0 disables rate limiting.
    #[arg(long, env = "RATE_LIMIT_PER_MINUTE", default_value_t = 0)]
    pub rate_limit_per_minute: u32,

    #[arg(long, env = "ENABLE_COMPRESSION", default_value_t = true)]
    pub enable_compression: bool,

    /// SQLite DSN for persisted credentials/keys/config/logs.
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://kgate.db?mode=rwc")]
    pub database_url: String,
}

impl ProxyConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
