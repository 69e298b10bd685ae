//! Command-line / environment configuration.
//!
//! Every option has a default, can be set through an environment variable
//! and is overridden by the matching command-line flag. The flag names keep
//! the historical `mqqt_` spelling so existing deployments keep working.
//!
//! | Flag                     | Env var                  | Default            |
//! |--------------------------|--------------------------|--------------------|
//! | `--mqqt_topic`           | `MQTT_TOPIC`             | `+/signalk/delta`  |
//! | `--mqqt_host`            | `MQTT_HOST`              | `172.30.0.1`       |
//! | `--mqqt_port`            | `MQTT_PORT`              | `1883`             |
//! | `--mqqt_username`        | `MQTT_USERNAME`          | empty              |
//! | `--mqqt_password`        | `MQTT_PASSWORD`          | empty              |
//! | `--mqqt_keepalive`       | `MQTT_KEEPALIVE`         | `60`               |
//! | `--mqqt_client_prefix`   | `MQTT_CLIENT_PREFIX`     | `mqtt-timescale`   |
//! | `--mqqt_reconnect_delay` | `MQTT_RECONNECT_DELAY`   | `5`                |
//! | `--ts_host`              | `TS_HOST`                | `172.30.0.1`       |
//! | `--ts_port`              | `TS_PORT`                | `5432`             |
//! | `--ts_username`          | `TS_USERNAME`            | `username`         |
//! | `--ts_password`          | `TS_PASSWORD`            | `password`         |
//! | `--ts_database`          | `TS_DATABASE`            | `example`          |
//! | `--ts_connect_timeout`   | `TS_CONNECT_TIMEOUT`     | `3`                |

use std::fmt;
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::PgConnectOptions;
use thiserror::Error;
use uuid::Uuid;

// ------------------------------------------------------------------ //
//  Raw command line                                                   //
// ------------------------------------------------------------------ //

/// Subscribe to an MQTT topic and insert every message into TimescaleDB.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
pub struct Cli {
    /// MQTT topic filter
    #[arg(long = "mqqt_topic", env = "MQTT_TOPIC", default_value = "+/signalk/delta")]
    pub mqqt_topic: String,

    /// MQTT host
    #[arg(long = "mqqt_host", env = "MQTT_HOST", default_value = "172.30.0.1")]
    pub mqqt_host: String,

    /// MQTT port
    #[arg(long = "mqqt_port", env = "MQTT_PORT", default_value_t = 1883)]
    pub mqqt_port: u16,

    /// MQTT username
    #[arg(long = "mqqt_username", env = "MQTT_USERNAME", default_value = "")]
    pub mqqt_username: String,

    /// MQTT password
    #[arg(
        long = "mqqt_password",
        env = "MQTT_PASSWORD",
        default_value = "",
        hide_env_values = true
    )]
    pub mqqt_password: String,

    /// MQTT keep-alive interval in seconds
    #[arg(long = "mqqt_keepalive", env = "MQTT_KEEPALIVE", default_value_t = 60)]
    pub mqqt_keepalive: u64,

    /// Prefix of the generated MQTT client id
    #[arg(
        long = "mqqt_client_prefix",
        env = "MQTT_CLIENT_PREFIX",
        default_value = "mqtt-timescale"
    )]
    pub mqqt_client_prefix: String,

    /// Seconds to wait before reconnecting after the broker connection drops
    #[arg(
        long = "mqqt_reconnect_delay",
        env = "MQTT_RECONNECT_DELAY",
        default_value_t = 5
    )]
    pub mqqt_reconnect_delay: u64,

    /// TimescaleDB host
    #[arg(long = "ts_host", env = "TS_HOST", default_value = "172.30.0.1")]
    pub ts_host: String,

    /// TimescaleDB port
    #[arg(long = "ts_port", env = "TS_PORT", default_value_t = 5432)]
    pub ts_port: u16,

    /// TimescaleDB username
    #[arg(long = "ts_username", env = "TS_USERNAME", default_value = "username")]
    pub ts_username: String,

    /// TimescaleDB password
    #[arg(
        long = "ts_password",
        env = "TS_PASSWORD",
        default_value = "password",
        hide_env_values = true
    )]
    pub ts_password: String,

    /// TimescaleDB database
    #[arg(long = "ts_database", env = "TS_DATABASE", default_value = "example")]
    pub ts_database: String,

    /// TimescaleDB connect timeout in seconds
    #[arg(long = "ts_connect_timeout", env = "TS_CONNECT_TIMEOUT", default_value_t = 3)]
    pub ts_connect_timeout: u64,
}

// ------------------------------------------------------------------ //
//  Resolved configuration                                             //
// ------------------------------------------------------------------ //

/// Problem with a configured value.
///
/// Only [`ConfigError::is_fatal`] issues stop startup. The rest are logged
/// and the process carries on, so the dependent connection fails with the
/// server's own error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} must not be 0")]
    ZeroPort(&'static str),
    #[error("invalid topic filter {filter:?}: {reason}")]
    InvalidTopicFilter { filter: String, reason: &'static str },
}

/// Broker side of the configuration.
#[derive(Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    pub client_id: String,
    pub keep_alive: Duration,
    pub reconnect_delay: Duration,
}

/// Store side of the configuration.
#[derive(Clone)]
pub struct StoreConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub connect_timeout: Duration,
}

impl ConfigError {
    /// Values no connection could ever be formed with.
    pub fn is_fatal(&self) -> bool {
        match self {
            ConfigError::Empty(name) => *name == "mqqt_topic",
            ConfigError::ZeroPort(_) | ConfigError::InvalidTopicFilter { .. } => true,
        }
    }
}

/// Immutable configuration shared by every component.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub broker: BrokerConfig,
    pub store: StoreConfig,
    /// Non-fatal issues found while resolving, for the caller to log.
    pub warnings: Vec<ConfigError>,
}

impl BridgeConfig {
    /// Parse the process arguments (and environment) into a config. Fails
    /// only on a fatal issue; see [`BridgeConfig::warnings`].
    pub fn load() -> Result<Self, ConfigError> {
        Cli::parse().try_into()
    }
}

impl TryFrom<Cli> for BridgeConfig {
    type Error = ConfigError;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let issues = [
            non_empty("mqqt_host", &cli.mqqt_host),
            non_zero("mqqt_port", cli.mqqt_port),
            validate_topic_filter(&cli.mqqt_topic),
            non_empty("ts_host", &cli.ts_host),
            non_zero("ts_port", cli.ts_port),
            non_empty("ts_database", &cli.ts_database),
        ];
        let mut warnings = Vec::new();
        for issue in issues.into_iter().filter_map(Result::err) {
            if issue.is_fatal() {
                return Err(issue);
            }
            warnings.push(issue);
        }

        let client_id = format!(
            "{}-{}-{}",
            cli.mqqt_client_prefix,
            cli.ts_database,
            Uuid::new_v4()
        );

        let broker = BrokerConfig {
            host: cli.mqqt_host,
            port: cli.mqqt_port,
            username: Some(cli.mqqt_username).filter(|u| !u.is_empty()),
            password: Some(cli.mqqt_password).filter(|p| !p.is_empty()),
            topic: cli.mqqt_topic,
            client_id,
            keep_alive: Duration::from_secs(cli.mqqt_keepalive),
            reconnect_delay: Duration::from_secs(cli.mqqt_reconnect_delay),
        };

        let store = StoreConfig {
            host: cli.ts_host,
            port: cli.ts_port,
            username: cli.ts_username,
            password: cli.ts_password,
            database: cli.ts_database,
            connect_timeout: Duration::from_secs(cli.ts_connect_timeout),
        };

        Ok(Self {
            broker,
            store,
            warnings,
        })
    }
}

fn non_empty(name: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Empty(name));
    }
    Ok(())
}

fn non_zero(name: &'static str, port: u16) -> Result<(), ConfigError> {
    if port == 0 {
        return Err(ConfigError::ZeroPort(name));
    }
    Ok(())
}

/// Check MQTT topic filter syntax: `+` must fill a whole level and `#` must
/// fill the last level.
pub fn validate_topic_filter(filter: &str) -> Result<(), ConfigError> {
    let invalid = |reason| ConfigError::InvalidTopicFilter {
        filter: filter.to_string(),
        reason,
    };

    if filter.is_empty() {
        return Err(ConfigError::Empty("mqqt_topic"));
    }
    if filter.contains('\0') {
        return Err(invalid("contains a NUL character"));
    }

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (i, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || i != last) {
            return Err(invalid("'#' must occupy the whole last level"));
        }
        if level.contains('+') && *level != "+" {
            return Err(invalid("'+' must occupy a whole level"));
        }
    }
    Ok(())
}

// ------------------------------------------------------------------ //
//  Rendering                                                          //
// ------------------------------------------------------------------ //

impl StoreConfig {
    /// Connection options for `sqlx`; values are passed structurally so no
    /// URL escaping is needed for odd passwords. An empty database name
    /// leaves the server default (the user's name) in place.
    pub fn connect_options(&self) -> PgConnectOptions {
        let options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .password(&self.password)
            .application_name("mqtt-timescale-bridge");
        if self.database.is_empty() {
            options
        } else {
            options.database(&self.database)
        }
    }

    /// `postgres://` URL with the password masked, for logging.
    pub fn redacted_url(&self) -> String {
        format!(
            "postgres://{}:***@{}:{}/{}",
            self.username, self.host, self.port, self.database
        )
    }
}

impl BrokerConfig {
    /// `mqtt://` URL with the password masked, for logging.
    pub fn redacted_url(&self) -> String {
        let user = self.username.as_deref().unwrap_or("");
        let auth = match (&self.username, &self.password) {
            (Some(_), Some(_)) => format!("{user}:***@"),
            (Some(_), None) => format!("{user}@"),
            _ => String::new(),
        };
        format!("mqtt://{}{}:{}/{}", auth, self.host, self.port, self.topic)
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("database", &self.database)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("topic", &self.topic)
            .field("client_id", &self.client_id)
            .field("keep_alive", &self.keep_alive)
            .field("reconnect_delay", &self.reconnect_delay)
            .finish()
    }
}

// ------------------------------------------------------------------ //
//  Tests                                                              //
// ------------------------------------------------------------------ //

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<BridgeConfig, ConfigError> {
        let mut argv = vec!["mqtt-timescale-bridge"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().try_into()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cli = Cli::try_parse_from(["mqtt-timescale-bridge"]).unwrap();
        // Environment overrides would break this test; only check values that
        // CI never sets.
        assert_eq!(cli.mqqt_client_prefix, "mqtt-timescale");
        assert_eq!(cli.ts_connect_timeout, 3);
        assert_eq!(cli.mqqt_keepalive, 60);
    }

    #[test]
    fn command_line_overrides_defaults() {
        let cfg = parse(&[
            "--mqqt_topic",
            "vessels/+/delta",
            "--mqqt_host",
            "broker.local",
            "--mqqt_port",
            "8883",
            "--ts_host",
            "db.local",
            "--ts_port",
            "6543",
            "--ts_username",
            "ingest",
            "--ts_password",
            "s3cret",
            "--ts_database",
            "boat",
        ])
        .unwrap();

        assert_eq!(cfg.broker.topic, "vessels/+/delta");
        assert_eq!(cfg.broker.host, "broker.local");
        assert_eq!(cfg.broker.port, 8883);
        assert_eq!(cfg.store.host, "db.local");
        assert_eq!(cfg.store.port, 6543);
        assert_eq!(cfg.store.username, "ingest");
        assert_eq!(cfg.store.password, "s3cret");
        assert_eq!(cfg.store.database, "boat");
    }

    #[test]
    fn empty_mqtt_credentials_are_omitted() {
        let cfg = parse(&["--mqqt_username", "", "--mqqt_password", ""]).unwrap();
        assert_eq!(cfg.broker.username, None);
        assert_eq!(cfg.broker.password, None);
    }

    #[test]
    fn client_id_embeds_prefix_and_database() {
        let cfg = parse(&["--ts_database", "boat", "--mqqt_client_prefix", "bridge"]).unwrap();
        assert!(cfg.broker.client_id.starts_with("bridge-boat-"));
        // uuid v4 in hyphenated form
        assert_eq!(cfg.broker.client_id.len(), "bridge-boat-".len() + 36);
    }

    #[test]
    fn non_numeric_port_is_rejected_by_parser() {
        assert!(Cli::try_parse_from(["bin", "--ts_port", "abc"]).is_err());
    }

    #[test]
    fn zero_port_is_rejected() {
        assert_eq!(
            parse(&["--mqqt_port", "0"]).unwrap_err(),
            ConfigError::ZeroPort("mqqt_port")
        );
    }

    #[test]
    fn zero_store_port_is_rejected() {
        assert_eq!(
            parse(&["--ts_port", "0"]).unwrap_err(),
            ConfigError::ZeroPort("ts_port")
        );
    }

    #[test]
    fn empty_database_is_a_warning() {
        let cfg = parse(&["--ts_database", ""]).unwrap();
        assert_eq!(cfg.warnings, vec![ConfigError::Empty("ts_database")]);
        assert_eq!(cfg.store.database, "");
        if std::env::var_os("PGDATABASE").is_none() {
            assert_eq!(cfg.store.connect_options().get_database(), None);
        }
    }

    #[test]
    fn empty_hosts_are_warnings() {
        let cfg = parse(&["--mqqt_host", "", "--ts_host", " "]).unwrap();
        assert_eq!(
            cfg.warnings,
            vec![ConfigError::Empty("mqqt_host"), ConfigError::Empty("ts_host")]
        );
    }

    #[test]
    fn clean_config_has_no_warnings() {
        let cfg = parse(&["--mqqt_host", "broker", "--ts_host", "db", "--ts_database", "boat"]).unwrap();
        assert!(cfg.warnings.is_empty());
        assert_eq!(cfg.store.connect_options().get_database(), Some("boat"));
    }

    #[test]
    fn invalid_topic_is_fatal() {
        let err = parse(&["--mqqt_topic", "a/#/b"]).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, ConfigError::InvalidTopicFilter { .. }));
        assert!(!ConfigError::Empty("ts_database").is_fatal());
        assert!(ConfigError::Empty("mqqt_topic").is_fatal());
    }

    #[test]
    fn topic_filter_wildcards() {
        assert!(validate_topic_filter("+/signalk/delta").is_ok());
        assert!(validate_topic_filter("#").is_ok());
        assert!(validate_topic_filter("vessels/#").is_ok());
        assert!(validate_topic_filter("a/+/+/b").is_ok());

        assert!(validate_topic_filter("vessels/#/delta").is_err());
        assert!(validate_topic_filter("vessels/x#").is_err());
        assert!(validate_topic_filter("vessels+/delta").is_err());
        assert_eq!(
            validate_topic_filter("").unwrap_err(),
            ConfigError::Empty("mqqt_topic")
        );
    }

    #[test]
    fn passwords_never_rendered() {
        let cfg = parse(&[
            "--ts_password",
            "hunter2",
            "--mqqt_username",
            "boat",
            "--mqqt_password",
            "hunter3",
        ])
        .unwrap();

        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(!dbg.contains("hunter3"));
        assert!(!cfg.store.redacted_url().contains("hunter2"));
        assert!(cfg.broker.redacted_url().starts_with("mqtt://boat:***@"));
    }
}
