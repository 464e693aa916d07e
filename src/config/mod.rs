use anyhow::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::AppError;

const DEFAULT_MAILBOX: &str = "INBOX";
const DEFAULT_POLL_INTERVAL_MINUTES: u32 = 5;
const DEFAULT_THREAD_LOOKBACK: u32 = 5;

/// Mailbox and threading settings. Everything comes from the process
/// environment; no user-authored config files are required.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    pub mailbox: String,
    pub poll_interval_minutes: u32,
    pub thread_lookback: u32,
    pub thread_max_age_days: Option<u32>,
}

/// Connection settings that are only available once every credential is set.
#[derive(Debug, Clone)]
pub struct ImapCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: bool,
}

impl MailConfig {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let tls = match get("THREADLINE_IMAP_TLS") {
            Some(raw) => parse_bool("THREADLINE_IMAP_TLS", &raw)?,
            None => true,
        };
        let port = match get("THREADLINE_IMAP_PORT") {
            Some(raw) => parse_num("THREADLINE_IMAP_PORT", &raw)?,
            None if tls => 993,
            None => 143,
        };
        let poll_interval_minutes = match get("THREADLINE_POLL_INTERVAL_MINUTES") {
            Some(raw) => parse_num("THREADLINE_POLL_INTERVAL_MINUTES", &raw)?,
            None => DEFAULT_POLL_INTERVAL_MINUTES,
        };
        if poll_interval_minutes == 0 {
            return Err(AppError::Config("THREADLINE_POLL_INTERVAL_MINUTES must be at least 1".into()).into());
        }
        let thread_lookback = match get("THREADLINE_THREAD_LOOKBACK") {
            Some(raw) => parse_num("THREADLINE_THREAD_LOOKBACK", &raw)?,
            None => DEFAULT_THREAD_LOOKBACK,
        };
        let thread_max_age_days = get("THREADLINE_THREAD_MAX_AGE_DAYS")
            .map(|raw| parse_num("THREADLINE_THREAD_MAX_AGE_DAYS", &raw))
            .transpose()?;

        Ok(Self {
            host: get("THREADLINE_IMAP_HOST"),
            port,
            username: get("THREADLINE_IMAP_USER"),
            password: get("THREADLINE_IMAP_PASSWORD"),
            tls,
            mailbox: get("THREADLINE_IMAP_MAILBOX").unwrap_or_else(|| DEFAULT_MAILBOX.to_string()),
            poll_interval_minutes,
            thread_lookback: thread_lookback.max(1),
            thread_max_age_days,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.poll_interval_minutes) * 60)
    }

    pub fn credentials(&self) -> Option<ImapCredentials> {
        Some(ImapCredentials {
            host: self.host.clone()?,
            port: self.port,
            username: self.username.clone()?,
            password: self.password.clone()?,
            tls: self.tls,
        })
    }

    /// Names of the required settings that are not set.
    pub fn missing_credentials(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.host.is_none() {
            missing.push("THREADLINE_IMAP_HOST");
        }
        if self.username.is_none() {
            missing.push("THREADLINE_IMAP_USER");
        }
        if self.password.is_none() {
            missing.push("THREADLINE_IMAP_PASSWORD");
        }
        missing
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, AppError> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::Config(format!("{key} must be a boolean, got {raw:?}"))),
    }
}

fn parse_num<T: FromStr>(key: &str, raw: &str) -> Result<T, AppError> {
    raw.parse::<T>()
        .map_err(|_| AppError::Config(format!("{key} must be a non-negative integer, got {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<MailConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        MailConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_environment_is_empty() {
        let cfg = config_from(&[]).unwrap();
        assert_eq!(cfg.port, 993);
        assert!(cfg.tls);
        assert_eq!(cfg.mailbox, "INBOX");
        assert_eq!(cfg.poll_interval(), Duration::from_secs(300));
        assert_eq!(cfg.thread_lookback, 5);
        assert_eq!(cfg.thread_max_age_days, None);
        assert!(cfg.credentials().is_none());
        assert_eq!(cfg.missing_credentials().len(), 3);
    }

    #[test]
    fn plaintext_defaults_to_port_143() {
        let cfg = config_from(&[("THREADLINE_IMAP_TLS", "false")]).unwrap();
        assert!(!cfg.tls);
        assert_eq!(cfg.port, 143);
    }

    #[test]
    fn full_credentials_are_exposed() {
        let cfg = config_from(&[
            ("THREADLINE_IMAP_HOST", "imap.example.org"),
            ("THREADLINE_IMAP_USER", "support@example.org"),
            ("THREADLINE_IMAP_PASSWORD", "hunter2"),
            ("THREADLINE_IMAP_PORT", "1993"),
        ])
        .unwrap();
        let creds = cfg.credentials().expect("credentials");
        assert_eq!(creds.host, "imap.example.org");
        assert_eq!(creds.port, 1993);
        assert!(cfg.missing_credentials().is_empty());
    }

    #[test]
    fn blank_password_counts_as_missing() {
        let cfg = config_from(&[
            ("THREADLINE_IMAP_HOST", "imap.example.org"),
            ("THREADLINE_IMAP_USER", "support@example.org"),
            ("THREADLINE_IMAP_PASSWORD", "   "),
        ])
        .unwrap();
        assert!(cfg.credentials().is_none());
        assert_eq!(cfg.missing_credentials(), vec!["THREADLINE_IMAP_PASSWORD"]);
    }

    #[test]
    fn malformed_values_are_config_errors() {
        let err = config_from(&[("THREADLINE_POLL_INTERVAL_MINUTES", "soon")]).unwrap_err();
        assert!(matches!(err.downcast_ref::<AppError>(), Some(AppError::Config(_))));

        let err = config_from(&[("THREADLINE_IMAP_TLS", "maybe")]).unwrap_err();
        assert!(matches!(err.downcast_ref::<AppError>(), Some(AppError::Config(_))));

        assert!(config_from(&[("THREADLINE_POLL_INTERVAL_MINUTES", "0")]).is_err());
    }

    #[test]
    fn staleness_cutoff_is_opt_in() {
        let cfg = config_from(&[("THREADLINE_THREAD_MAX_AGE_DAYS", "30")]).unwrap();
        assert_eq!(cfg.thread_max_age_days, Some(30));
    }
}
