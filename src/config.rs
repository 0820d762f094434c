use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub mail: MailConfig,
    pub qr_image_endpoint: String,
    pub default_event_name: String,
    pub session_ttl_hours: i64,
    pub scan: ScanTiming,
    pub bootstrap_admin: Option<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_key: Option<String>,
    pub from: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanTiming {
    pub sample_interval: Duration,
    pub cooldown: Duration,
    pub ready_timeout: Duration,
    /// Remote sessions without a frame or request for this long are closed.
    pub idle_timeout: Duration,
}

impl Default for ScanTiming {
    fn default() -> Self {
        Self {
            sample_interval: Duration::from_millis(250),
            cooldown: Duration::from_millis(3000),
            ready_timeout: Duration::from_millis(10_000),
            idle_timeout: Duration::from_millis(60_000),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let bootstrap_admin = match (
            optional("BOOTSTRAP_ADMIN_USERNAME"),
            optional("BOOTSTRAP_ADMIN_PASSWORD"),
        ) {
            (Some(user), Some(password)) => Some((user, password)),
            _ => None,
        };

        let interval_ms: u64 = try_load("SCAN_INTERVAL_MS", "250")?;

        Ok(Self {
            bind_address: try_load("BIND_ADDRESS", "127.0.0.1:3000")?,
            database_url: optional("DATABASE_URL"),
            database_max_connections: try_load("DATABASE_MAX_CONNECTIONS", "5")?,
            mail: MailConfig {
                api_key: optional("RESEND_API_KEY"),
                from: try_load("MAIL_FROM", "QR Attend <onboarding@resend.dev>")?,
                endpoint: try_load("MAIL_ENDPOINT", "https://api.resend.com/emails")?,
            },
            qr_image_endpoint: try_load(
                "QR_IMAGE_ENDPOINT",
                "https://api.qrserver.com/v1/create-qr-code/",
            )?,
            default_event_name: try_load("DEFAULT_EVENT_NAME", "Live Event")?,
            session_ttl_hours: try_load("SESSION_TTL_HOURS", "8")?,
            scan: ScanTiming {
                sample_interval: Duration::from_millis(interval_ms.clamp(100, 500)),
                cooldown: Duration::from_millis(try_load("SCAN_COOLDOWN_MS", "3000")?),
                ready_timeout: Duration::from_millis(try_load("CAMERA_READY_TIMEOUT_MS", "10000")?),
                idle_timeout: Duration::from_millis(try_load("SCANNER_IDLE_TIMEOUT_MS", "60000")?),
            },
            bootstrap_admin,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 3000)),
            database_url: None,
            database_max_connections: 5,
            mail: MailConfig {
                api_key: None,
                from: "QR Attend <onboarding@resend.dev>".to_string(),
                endpoint: "https://api.resend.com/emails".to_string(),
            },
            qr_image_endpoint: "https://api.qrserver.com/v1/create-qr-code/".to_string(),
            default_event_name: "Live Event".to_string(),
            session_ttl_hours: 8,
            scan: ScanTiming::default(),
            bootstrap_admin: None,
        }
    }
}

fn optional(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => {
            log::info!("{} not set", key);
            None
        }
    }
}

fn try_load<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: Display,
{
    let raw = env::var(key).unwrap_or_else(|_| {
        log::info!("{} not set, using default: {}", key, default);
        default.to_string()
    });
    raw.parse()
        .map_err(|e: T::Err| anyhow::anyhow!("{}", e))
        .with_context(|| format!("Invalid {} value `{}`", key, raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_service_conventions() {
        let config = Config::default();
        assert_eq!(config.session_ttl_hours, 8);
        assert_eq!(config.scan.cooldown, Duration::from_secs(3));
        assert_eq!(config.scan.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.default_event_name, "Live Event");
    }

    #[test]
    fn malformed_values_are_reported() {
        env::set_var("QR_ATTEND_TEST_PORTLESS", "not-a-number");
        let parsed: anyhow::Result<u16> = try_load("QR_ATTEND_TEST_PORTLESS", "1");
        assert!(parsed.is_err());
        env::remove_var("QR_ATTEND_TEST_PORTLESS");
    }
}
