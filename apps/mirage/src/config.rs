use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Server-wide cap on simultaneous in-flight REST requests.
    pub max_concurrent_requests: usize,
    /// Upper bound on one REST request/response exchange.
    pub request_timeout: Duration,
    /// WebSocket read-deadline window; a connection that goes this long
    /// without a heartbeat response is torn down.
    pub pong_wait: Duration,
    /// Deadline for a single WebSocket write.
    pub write_wait: Duration,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: env::var("MIRAGE_HOST").unwrap_or(defaults.host),
            port: env::var("MIRAGE_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            max_concurrent_requests: env::var("MIRAGE_MAX_CONCURRENT_REQUESTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_concurrent_requests),
            request_timeout: env::var("MIRAGE_REQUEST_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            pong_wait: env::var("MIRAGE_WS_PONG_WAIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.pong_wait),
            write_wait: env::var("MIRAGE_WS_WRITE_WAIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.write_wait),
            log_level: env::var("MIRAGE_LOG_LEVEL").unwrap_or(defaults.log_level),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_concurrent_requests: 100,
            request_timeout: Duration::from_secs(30),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            log_level: "info".to_string(),
        }
    }
}
