use std::env;
use std::time::Duration;

pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8791/ws";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Rendezvous relay endpoint. The single user-facing override.
    pub signaling_url: String,
    /// Whether inbound offers are accepted at all. Off by default: offers
    /// arriving while off are dropped without a reply.
    pub accept_inbound: bool,
    /// Initial signaling connect budget; the relay falls back to the local
    /// channel when it is exceeded.
    pub connect_timeout: Duration,
}

impl LinkConfig {
    pub fn from_env() -> Self {
        let signaling_url =
            env::var("TANDEM_SIGNALING_URL").unwrap_or_else(|_| DEFAULT_SIGNALING_URL.to_string());
        let accept_inbound = env::var("TANDEM_ACCEPT_INBOUND")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self {
            signaling_url,
            accept_inbound,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            accept_inbound: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}
