use std::time::Duration;

use clap::Parser;

#[derive(Debug, Parser, Clone)]
#[command(name = "session-relay")]
#[command(about = "Multi-instance WebSocket session relay with cross-instance delivery")]
pub struct Config {
    /// Address the public listener binds to.
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 3003)]
    pub port: u16,

    /// Port of the instance-to-instance listener.
    #[arg(long, env = "RELAY_INTERNAL_PORT", default_value_t = 3004)]
    pub internal_port: u16,

    /// Address peers use to reach this instance. Defaults to the host name.
    #[arg(long, env = "RELAY_ADVERTISE_ADDRESS")]
    pub advertise_address: Option<String>,

    #[arg(long, env = "RELAY_ADVERTISE_SCHEME", default_value = "http")]
    pub advertise_scheme: String,

    #[arg(long, env = "RELAY_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// `memory://` or `redis://host:port/db`.
    #[arg(long, env = "RELAY_DIRECTORY_URL", default_value = "memory://")]
    pub directory_url: String,

    #[arg(long, env = "RELAY_SHARED_SECRET", hide_env_values = true)]
    pub shared_secret: Option<String>,

    #[arg(long, env = "RELAY_SECRET_URL", conflicts_with = "shared_secret")]
    pub secret_url: Option<String>,

    #[arg(long, env = "RELAY_SECRET_CACHE_SECS", default_value_t = 300)]
    pub secret_cache_secs: u64,

    #[arg(long, env = "RELAY_KEY_PROD")]
    pub key_prod: Option<String>,

    #[arg(long, env = "RELAY_KEY_NONPROD")]
    pub key_nonprod: Option<String>,

    #[arg(long, env = "RELAY_KEY_DEV")]
    pub key_dev: Option<String>,

    #[arg(long, env = "RELAY_LOCAL_HMAC_SECRET", hide_env_values = true)]
    pub local_hmac_secret: Option<String>,

    #[arg(long, env = "RELAY_TOKEN_AUDIENCE")]
    pub token_audience: Option<String>,

    #[arg(long, env = "RELAY_FULFILLMENT_URL")]
    pub fulfillment_url: Option<String>,

    #[arg(long, env = "RELAY_LOG_FULFILLMENT_URL")]
    pub log_fulfillment_url: Option<String>,

    #[arg(long, env = "RELAY_FORWARD_TIMEOUT_MS", default_value_t = 5000)]
    pub forward_timeout_ms: u64,

    #[arg(long, env = "RELAY_DISPATCH_TIMEOUT_MS", default_value_t = 5000)]
    pub dispatch_timeout_ms: u64,

    #[arg(long, env = "RELAY_FEEDBACK_TIMEOUT_MS", default_value_t = 10000)]
    pub feedback_timeout_ms: u64,

    #[arg(long, env = "RELAY_SEND_TIMEOUT_MS", default_value_t = 5000)]
    pub send_timeout_ms: u64,

    /// Bound on every directory call, including connecting.
    #[arg(long, env = "RELAY_DIRECTORY_TIMEOUT_MS", default_value_t = 2000)]
    pub directory_timeout_ms: u64,

    #[arg(long, env = "RELAY_REAP_INTERVAL_SECS", default_value_t = 60)]
    pub reap_interval_secs: u64,

    #[arg(long, env = "RELAY_SESSION_MAX_AGE_SECS", default_value_t = 7200)]
    pub session_max_age_secs: u64,

    /// Emit directory health every N reaper cycles.
    #[arg(long, env = "RELAY_STATS_EVERY", default_value_t = 10)]
    pub stats_every: u64,

    #[arg(long, env = "RUST_LOG", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "RELAY_JSON_LOGS", default_value_t = false)]
    pub json_logs: bool,
}

impl Config {
    pub fn advertise_address(&self) -> String {
        self.advertise_address
            .clone()
            .filter(|addr| !addr.trim().is_empty())
            .or_else(|| {
                hostname::get()
                    .ok()
                    .and_then(|name| name.into_string().ok())
            })
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn instance_id(&self) -> String {
        match &self.instance_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => format!("server_{}_{}", self.advertise_address(), self.internal_port),
        }
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatch_timeout_ms)
    }

    pub fn feedback_timeout(&self) -> Duration {
        Duration::from_millis(self.feedback_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.session_max_age_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use clap::Parser;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::parse_from(["session-relay"]);
        assert_eq!(cfg.port, 3003);
        assert_eq!(cfg.internal_port, 3004);
        assert_eq!(cfg.directory_url, "memory://");
        assert_eq!(cfg.advertise_scheme, "http");
        assert_eq!(cfg.secret_cache_secs, 300);
        assert_eq!(cfg.forward_timeout_ms, 5000);
        assert_eq!(cfg.dispatch_timeout_ms, 5000);
        assert_eq!(cfg.feedback_timeout_ms, 10000);
        assert_eq!(cfg.directory_timeout_ms, 2000);
        assert_eq!(cfg.reap_interval_secs, 60);
        assert_eq!(cfg.session_max_age_secs, 7200);
        assert_eq!(cfg.stats_every, 10);
    }

    #[test]
    fn instance_id_derives_from_advertise_address_and_internal_port() {
        let cfg = Config::parse_from([
            "session-relay",
            "--advertise-address",
            "10.0.0.5",
            "--internal-port",
            "4100",
        ]);
        assert_eq!(cfg.instance_id(), "server_10.0.0.5_4100");

        let cfg = Config::parse_from(["session-relay", "--instance-id", "relay-a"]);
        assert_eq!(cfg.instance_id(), "relay-a");
    }

    #[test]
    fn shared_secret_and_secret_url_conflict() {
        let parsed = Config::try_parse_from([
            "session-relay",
            "--shared-secret",
            "x",
            "--secret-url",
            "http://localhost/secret",
        ]);
        assert!(parsed.is_err());
    }
}
