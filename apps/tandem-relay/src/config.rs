use std::env;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// Registrations with no heartbeat for this long get swept.
    pub stale_after_seconds: u64,
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self {
            port: env::var("TANDEM_RELAY_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8791),
            stale_after_seconds: env::var("TANDEM_RELAY_STALE_AFTER")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(600),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8791,
            stale_after_seconds: 600,
        }
    }
}
