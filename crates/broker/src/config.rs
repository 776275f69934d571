// Broker server configuration.
//
// Environment variables with development defaults. Broker tunables are
// parsed into `BrokerOptions` so the library stays usable without the
// HTTP server.

use std::{net::SocketAddr, time::Duration};

use crate::broker::BrokerOptions;

const DEV_JWT_SECRET: &str = "wsbroker_local_development_jwt_secret_must_be_32_chars";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Core server configuration.
///
/// Constructed via [`ServerConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// HS256 secret used to validate bearer tokens.
    pub jwt_secret: String,
    /// Log filter directive (e.g. `info`, `wsbroker=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Subprotocols offered during the websocket handshake, in preference order.
    pub subprotocols: Vec<String>,
    pub broker: BrokerOptions,
}

impl ServerConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `WSBROKER_HOST` | `0.0.0.0` |
    /// | `WSBROKER_PORT` | `8080` |
    /// | `WSBROKER_JWT_SECRET` | dev-only placeholder |
    /// | `WSBROKER_LOG_FILTER` | `info` |
    /// | `WSBROKER_LOG_FORMAT` | `pretty` (`json` for structured output) |
    /// | `WSBROKER_REQUEST_CAPACITY` | `1024` |
    /// | `WSBROKER_REQUEST_TIMEOUT_MS` | `10000` (`0` waits forever) |
    /// | `WSBROKER_WRITE_TIMEOUT_MS` | `5000` (`0` keeps the default; writes are always bounded) |
    /// | `WSBROKER_HEARTBEAT_INTERVAL_MS` | `15000` (`0` disables) |
    /// | `WSBROKER_MAX_FRAME_BYTES` | `262144` |
    /// | `WSBROKER_RESTART_DELAY_MS` | `100` (`0` restarts immediately) |
    /// | `WSBROKER_SUBPROTOCOLS` | `wsbroker.v1` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("WSBROKER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = parse_or(&env, "WSBROKER_PORT", 8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("WSBROKER_JWT_SECRET").unwrap_or_else(|_| DEV_JWT_SECRET.into());
        let log_filter = env("WSBROKER_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("WSBROKER_LOG_FORMAT") {
            Ok(value) if value.trim().eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let subprotocols = env("WSBROKER_SUBPROTOCOLS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|protocol| !protocol.is_empty())
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_else(|_| vec!["wsbroker.v1".to_string()]);

        let defaults = BrokerOptions::default();
        let broker = BrokerOptions {
            request_capacity: parse_or(&env, "WSBROKER_REQUEST_CAPACITY", defaults.request_capacity)
                .max(1),
            request_timeout: millis(&env, "WSBROKER_REQUEST_TIMEOUT_MS", defaults.request_timeout),
            write_timeout: millis(&env, "WSBROKER_WRITE_TIMEOUT_MS", Some(defaults.write_timeout))
                .unwrap_or(defaults.write_timeout),
            heartbeat_interval: millis(
                &env,
                "WSBROKER_HEARTBEAT_INTERVAL_MS",
                defaults.heartbeat_interval,
            ),
            max_frame_bytes: parse_or(&env, "WSBROKER_MAX_FRAME_BYTES", defaults.max_frame_bytes),
            restart_delay: millis(&env, "WSBROKER_RESTART_DELAY_MS", Some(defaults.restart_delay))
                .unwrap_or(Duration::ZERO),
            respond_to_ping: defaults.respond_to_ping,
        };

        Self { listen_addr, jwt_secret, log_filter, log_format, subprotocols, broker }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn parse_or<F, T>(env: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
    T: std::str::FromStr,
{
    env(key).ok().and_then(|value| value.trim().parse().ok()).unwrap_or(default)
}

// `0` maps to `None`; unparseable values keep the default.
fn millis<F>(env: &F, key: &str, default: Option<Duration>) -> Option<Duration>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    match env(key).ok().and_then(|value| value.trim().parse::<u64>().ok()) {
        Some(0) => None,
        Some(ms) => Some(Duration::from_millis(ms)),
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = ServerConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:8080");
        assert!(cfg.is_dev_jwt_secret());
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Pretty);
        assert_eq!(cfg.subprotocols, vec!["wsbroker.v1".to_string()]);
        assert_eq!(cfg.broker, BrokerOptions::default());
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("WSBROKER_HOST", "127.0.0.1");
        m.insert("WSBROKER_PORT", "3000");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("WSBROKER_PORT", "not_a_number");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("WSBROKER_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
    }

    #[test]
    fn json_log_format() {
        let mut m = HashMap::new();
        m.insert("WSBROKER_LOG_FORMAT", "JSON");
        m.insert("WSBROKER_LOG_FILTER", "debug,wsbroker=trace");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.log_filter, "debug,wsbroker=trace");
    }

    #[test]
    fn zero_durations_disable_timeouts_and_heartbeat() {
        let mut m = HashMap::new();
        m.insert("WSBROKER_REQUEST_TIMEOUT_MS", "0");
        m.insert("WSBROKER_HEARTBEAT_INTERVAL_MS", "0");
        m.insert("WSBROKER_RESTART_DELAY_MS", "0");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.broker.request_timeout, None);
        assert_eq!(cfg.broker.heartbeat_interval, None);
        assert_eq!(cfg.broker.restart_delay, Duration::ZERO);
    }

    #[test]
    fn broker_tunables_from_env() {
        let mut m = HashMap::new();
        m.insert("WSBROKER_REQUEST_CAPACITY", "16");
        m.insert("WSBROKER_WRITE_TIMEOUT_MS", "250");
        m.insert("WSBROKER_MAX_FRAME_BYTES", "4096");
        m.insert("WSBROKER_HEARTBEAT_INTERVAL_MS", "500");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.broker.request_capacity, 16);
        assert_eq!(cfg.broker.write_timeout, Duration::from_millis(250));
        assert_eq!(cfg.broker.max_frame_bytes, 4096);
        assert_eq!(cfg.broker.heartbeat_interval, Some(Duration::from_millis(500)));
    }

    #[test]
    fn zero_write_timeout_keeps_default() {
        let mut m = HashMap::new();
        m.insert("WSBROKER_WRITE_TIMEOUT_MS", "0");
        m.insert("WSBROKER_REQUEST_CAPACITY", "0");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.broker.write_timeout, BrokerOptions::default().write_timeout);
        assert_eq!(cfg.broker.request_capacity, 1);
    }

    #[test]
    fn subprotocol_list_is_trimmed() {
        let mut m = HashMap::new();
        m.insert("WSBROKER_SUBPROTOCOLS", " chat.v2 , ,chat.v1");
        let cfg = ServerConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.subprotocols, vec!["chat.v2".to_string(), "chat.v1".to_string()]);
    }
}
