//! Application configuration
//!
//! Loaded from a YAML file (`app.yaml` by default):
//!
//! ```yaml
//! server: { host: 0.0.0.0, port: 8080 }
//! to:     { host: 127.0.0.1, port: 3001 }
//! dead_check: 40
//! whitelist: []
//! blacklist: [555]
//! logger:
//!   level: { console: INFO, file: WARNING }
//! ```
//!
//! Everything except `server` and `to` has a default. The optional `notice`
//! section enables outage mail.

use std::collections::HashSet;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::logging::parse_level;
use crate::relay::config::{
    RelayConfig, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_RECONNECT_DELAY, DEFAULT_SEND_ATTEMPTS,
};
use crate::server::ServerConfig;

/// Host and port pair
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Level names for the two log sinks
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LevelConfig {
    pub console: String,
    pub file: String,
}

impl Default for LevelConfig {
    fn default() -> Self {
        Self {
            console: "INFO".into(),
            file: "WARNING".into(),
        }
    }
}

/// Rolling log files kept by default, one per day
pub const DEFAULT_MAX_LOG_FILES: usize = 14;

/// `logger` section
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub level: LevelConfig,
    /// Directory for the daily rolling log file
    pub dir: PathBuf,
    /// Daily files kept before the oldest is deleted
    pub max_files: usize,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: LevelConfig::default(),
            dir: PathBuf::from("logs"),
            max_files: DEFAULT_MAX_LOG_FILES,
        }
    }
}

/// `relay` section: engine tuning
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub send_attempts: usize,
    pub reconnect_delay_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// 0 keeps echo registrations until answered
    pub echo_ttl_secs: u64,
    /// 0 means unlimited
    pub max_connections: usize,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            send_attempts: DEFAULT_SEND_ATTEMPTS,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY.as_secs(),
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
            echo_ttl_secs: 300,
            max_connections: 0,
        }
    }
}

/// Outage mail wording
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    /// Mail subject line
    pub title: String,
    /// Sender display name
    pub subject: String,
    /// Body; `{bot_id}` is replaced
    pub content: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            title: "你的Bot掉线了".into(),
            subject: "OneBot 掉线通知".into(),
            content: "OneBot 掉线通知：\n\n({bot_id}) 掉线了，请及时处理。".into(),
        }
    }
}

fn default_smtp_port() -> u16 {
    465
}

fn default_grace_secs() -> u64 {
    60
}

/// `notice` section: SMTP outage notification
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NoticeConfig {
    pub smtp: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub sender: String,
    pub password: String,
    pub receiver: String,
    /// Outage length before a notice is sent
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,
    #[serde(default)]
    pub mail: MailConfig,
}

fn default_dead_check() -> u64 {
    40
}

/// Whole configuration file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AppConfig {
    /// Consumer listener
    pub server: Endpoint,
    /// OneBot endpoint to dial
    pub to: Endpoint,
    /// Heartbeat dead time in seconds; 0 disables the check
    #[serde(default = "default_dead_check")]
    pub dead_check: u64,
    #[serde(default)]
    pub whitelist: Vec<i64>,
    #[serde(default)]
    pub blacklist: Vec<i64>,
    #[serde(default)]
    pub logger: LoggerConfig,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub notice: Option<NoticeConfig>,
}

impl AppConfig {
    /// Read, parse and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration text
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: AppConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the relay cannot run with
    pub fn validate(&self) -> Result<()> {
        for (name, endpoint) in [("server", &self.server), ("to", &self.to)] {
            if endpoint.host.trim().is_empty() {
                return Err(Error::config(format!("{name}.host must not be empty")));
            }
            if endpoint.port == 0 {
                return Err(Error::config(format!("{name}.port must not be 0")));
            }
        }

        parse_level(&self.logger.level.console)?;
        parse_level(&self.logger.level.file)?;
        if self.logger.max_files == 0 {
            return Err(Error::config("logger.max_files must be at least 1"));
        }

        if self.relay.send_attempts == 0 {
            return Err(Error::config("relay.send_attempts must be at least 1"));
        }
        if self.relay.heartbeat_interval_secs == 0 {
            return Err(Error::config("relay.heartbeat_interval_secs must be at least 1"));
        }

        if let Some(notice) = &self.notice {
            for (name, value) in [
                ("smtp", &notice.smtp),
                ("sender", &notice.sender),
                ("receiver", &notice.receiver),
            ] {
                if value.trim().is_empty() {
                    return Err(Error::config(format!("notice.{name} must not be empty")));
                }
            }
        }

        Ok(())
    }

    /// Settings that load fine but probably do not do what was meant
    ///
    /// Returned rather than logged, since configuration is read before the
    /// subscriber exists.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        let mut overlap: Vec<i64> = self.overlapping_groups().into_iter().collect();
        overlap.sort_unstable();
        if !overlap.is_empty() {
            warnings.push(format!(
                "groups {overlap:?} are on both whitelist and blacklist; the whitelist wins"
            ));
        } else if !self.whitelist.is_empty() && !self.blacklist.is_empty() {
            warnings.push("whitelist is set, blacklist will be ignored".to_string());
        }

        warnings
    }

    /// Engine settings
    pub fn relay_config(&self) -> RelayConfig {
        let notice_grace = self
            .notice
            .as_ref()
            .map_or(Duration::from_secs(default_grace_secs()), |n| {
                Duration::from_secs(n.grace_secs)
            });
        let echo_ttl = match self.relay.echo_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        RelayConfig::default()
            .allow(self.whitelist.iter().copied())
            .deny(self.blacklist.iter().copied())
            .send_attempts(self.relay.send_attempts)
            .reconnect_delay(Duration::from_secs(self.relay.reconnect_delay_secs))
            .heartbeat_interval(Duration::from_secs(self.relay.heartbeat_interval_secs))
            .dead_time(Duration::from_secs(self.dead_check))
            .echo_ttl(echo_ttl)
            .notice_grace(notice_grace)
    }

    /// Listener settings; resolves `server.host`
    pub fn server_config(&self) -> Result<ServerConfig> {
        let addr = resolve(&self.server)?;
        Ok(ServerConfig::with_addr(addr).max_connections(self.relay.max_connections))
    }

    /// `ws://` URL of the OneBot endpoint
    pub fn upstream_url(&self) -> String {
        format!("ws://{}", self.to.authority())
    }

    /// Group ids present on both lists
    pub fn overlapping_groups(&self) -> HashSet<i64> {
        let allow: HashSet<i64> = self.whitelist.iter().copied().collect();
        self.blacklist
            .iter()
            .copied()
            .filter(|g| allow.contains(g))
            .collect()
    }
}

fn resolve(endpoint: &Endpoint) -> Result<SocketAddr> {
    (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::config(format!("server.host `{}` did not resolve", endpoint.host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    const MINIMAL: &str = r#"
server:
  host: 0.0.0.0
  port: 8080
to:
  host: 127.0.0.1
  port: 3001
"#;

    #[test]
    fn test_defaults_match_forwarder() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();

        assert_eq!(config.dead_check, 40);
        assert!(config.whitelist.is_empty());
        assert!(config.blacklist.is_empty());
        assert_eq!(config.logger.level.console, "INFO");
        assert_eq!(config.logger.level.file, "WARNING");
        assert_eq!(config.logger.dir, PathBuf::from("logs"));
        assert_eq!(config.logger.max_files, DEFAULT_MAX_LOG_FILES);
        assert!(config.notice.is_none());
        assert_eq!(config.relay, RelaySection::default());
    }

    #[test]
    fn test_relay_config_conversion() {
        let yaml = format!(
            "{MINIMAL}dead_check: 0\nwhitelist: [1, 2]\nblacklist: [3]\nrelay:\n  send_attempts: 2\n  echo_ttl_secs: 0\n"
        );
        let relay = AppConfig::from_yaml(&yaml).unwrap().relay_config();

        assert!(relay.dead_time.is_zero());
        assert_eq!(relay.send_attempts, 2);
        assert!(relay.echo_ttl.is_none());
        assert!(relay.allow_list.contains(&2));
        assert!(relay.deny_list.contains(&3));
        assert_eq!(relay.reconnect_delay, Duration::from_secs(5));
        assert_eq!(relay.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_upstream_url() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.upstream_url(), "ws://127.0.0.1:3001");

        let v6 = Endpoint {
            host: "::1".into(),
            port: 3001,
        };
        assert_eq!(v6.authority(), "[::1]:3001");
    }

    #[test]
    fn test_server_config() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        let server = assert_ok!(config.server_config());

        assert_eq!(server.bind_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(server.max_connections, 0);
    }

    #[test]
    fn test_notice_defaults() {
        let yaml = format!(
            "{MINIMAL}notice:\n  smtp: smtp.example.com\n  sender: a@example.com\n  password: pw\n  receiver: b@example.com\n"
        );
        let config = AppConfig::from_yaml(&yaml).unwrap();
        let notice = config.notice.as_ref().unwrap();

        assert_eq!(notice.port, 465);
        assert_eq!(notice.grace_secs, 60);
        assert_eq!(notice.mail, MailConfig::default());
        assert_eq!(config.relay_config().notice_grace, Duration::from_secs(60));
    }

    #[test]
    fn test_missing_section_rejected() {
        let err = AppConfig::from_yaml("server: { host: 0.0.0.0, port: 8080 }").unwrap_err();
        assert!(matches!(err, Error::Yaml(_)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero_port = MINIMAL.replace("3001", "0");
        assert!(matches!(AppConfig::from_yaml(&zero_port), Err(Error::Config(_))));

        let bad_level = format!("{MINIMAL}logger:\n  level:\n    console: LOUD\n");
        assert_err!(AppConfig::from_yaml(&bad_level));

        let no_log_files = format!("{MINIMAL}logger:\n  max_files: 0\n");
        assert!(matches!(AppConfig::from_yaml(&no_log_files), Err(Error::Config(_))));

        let no_attempts = format!("{MINIMAL}relay:\n  send_attempts: 0\n");
        assert!(matches!(AppConfig::from_yaml(&no_attempts), Err(Error::Config(_))));
    }

    #[test]
    fn test_overlapping_groups() {
        let yaml = format!("{MINIMAL}whitelist: [1, 2, 3]\nblacklist: [3, 4]\n");
        let config = AppConfig::from_yaml(&yaml).unwrap();

        assert_eq!(config.overlapping_groups(), HashSet::from([3]));
    }

    #[test]
    fn test_list_warnings() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert!(config.warnings().is_empty());

        let overlap = format!("{MINIMAL}whitelist: [4, 1, 3]\nblacklist: [3, 4]\n");
        let warnings = AppConfig::from_yaml(&overlap).unwrap().warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("[3, 4]"));

        let both = format!("{MINIMAL}whitelist: [1]\nblacklist: [2]\n");
        let warnings = AppConfig::from_yaml(&both).unwrap().warnings();
        assert_eq!(warnings, vec!["whitelist is set, blacklist will be ignored".to_string()]);
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load("/nonexistent/app.yaml").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
