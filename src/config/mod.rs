//! Connection configuration.
//!
//! Accepts libpq-style keyword/value strings and `postgres://` URIs,
//! fills gaps from `PG*` environment variables, password files and
//! connection service files.
mod parse;
mod pgpass;
mod service;

use std::{collections::BTreeMap, future::Future, io, pin::Pin, sync::Arc, time::Duration};

use crate::{
    connection::Connection,
    error::Notice,
    message::{Notification, DEFAULT_MIN_READ},
    net::{RawStream, Stream},
};

/// Default host when none is configured.
const DEFAULT_HOST: &str = "127.0.0.1";
/// Default PostgreSQL port.
const DEFAULT_PORT: u16 = 5432;
/// Default socket open timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// An error in the external configuration surface.
#[derive(Debug, thiserror::Error)]
pub enum ConfigParseError {
    /// Keyword/value or URI syntax error.
    #[error("invalid connection string: {0}")]
    Syntax(String),

    /// A recognized keyword carried an unusable value.
    #[error("invalid value for {keyword}: {value:?}")]
    Value { keyword: &'static str, value: String },

    /// `target_session_attrs=prefer-standby` is not supported.
    #[error("target_session_attrs=prefer-standby is not supported")]
    PreferStandby,

    /// A required field is absent.
    #[error("{0} is required")]
    Missing(&'static str),

    /// A password or service file could not be parsed.
    #[error("malformed {kind} file {path:?}, line {line}")]
    File { kind: &'static str, path: String, line: usize },

    /// The requested service has no section in the service file.
    #[error("service {0:?} not found")]
    ServiceNotFound(String),

    /// Reading an auxiliary file failed.
    #[error("cannot read {path:?}: {err}")]
    Io { path: String, err: io::Error },
}

/// Requested TLS behavior, mirroring the libpq `sslmode` keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Never attempt TLS.
    Disable,
    /// Attempt TLS, accept a plaintext fallback.
    Allow,
    /// Attempt TLS, accept a plaintext fallback.
    #[default]
    Prefer,
    /// Refuse sessions the server will not encrypt.
    Require,
    /// Like `require`; certificate verification is the upgrade
    /// function's responsibility.
    VerifyCa,
    /// Like `verify-ca`, additionally matching the host name.
    VerifyFull,
}

impl SslMode {
    pub(crate) fn parse(value: &str) -> Result<Self, ConfigParseError> {
        Ok(match value {
            "disable" => Self::Disable,
            "allow" => Self::Allow,
            "prefer" => Self::Prefer,
            "require" => Self::Require,
            "verify-ca" => Self::VerifyCa,
            "verify-full" => Self::VerifyFull,
            _ => {
                return Err(ConfigParseError::Value {
                    keyword: "sslmode",
                    value: value.to_string(),
                })
            }
        })
    }

    /// Whether a plaintext session is acceptable when the server refuses
    /// TLS.
    pub(crate) fn allows_plaintext(self) -> bool {
        matches!(self, Self::Disable | Self::Allow | Self::Prefer)
    }
}

/// Session property the connector validates after authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetSessionAttrs {
    /// Accept any server.
    #[default]
    Any,
    /// Demand a writable primary.
    ReadWrite,
    /// Demand a read-only session.
    ReadOnly,
    /// Demand a server not in hot standby.
    Primary,
    /// Demand a hot standby.
    Standby,
}

impl TargetSessionAttrs {
    pub(crate) fn parse(value: &str) -> Result<Self, ConfigParseError> {
        Ok(match value {
            "any" => Self::Any,
            "read-write" => Self::ReadWrite,
            "read-only" => Self::ReadOnly,
            "primary" => Self::Primary,
            "standby" => Self::Standby,
            "prefer-standby" => return Err(ConfigParseError::PreferStandby),
            _ => {
                return Err(ConfigParseError::Value {
                    keyword: "target_session_attrs",
                    value: value.to_string(),
                })
            }
        })
    }

    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::ReadWrite => "read-write",
            Self::ReadOnly => "read-only",
            Self::Primary => "primary",
            Self::Standby => "standby",
        }
    }
}

/// An async function upgrading an open socket to TLS.
///
/// TLS library wiring stays outside this crate; the connector only drives
/// the protocol-level negotiation and hands the socket over.
pub type TlsUpgrade = Arc<
    dyn Fn(Stream, String) -> Pin<Box<dyn Future<Output = io::Result<Box<dyn RawStream>>> + Send>>
        + Send
        + Sync,
>;

/// TLS settings for one host.
///
/// The certificate-related fields are carried verbatim for the upgrade
/// function to consume.
#[derive(Clone, Default)]
pub struct TlsConfig {
    pub mode: SslMode,
    pub upgrade: Option<TlsUpgrade>,
    pub root_cert: Option<String>,
    pub cert: Option<String>,
    pub key: Option<String>,
    pub sni: bool,
    pub min_protocol_version: Option<String>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("mode", &self.mode)
            .field("upgrade", &self.upgrade.as_ref().map(|_| ".."))
            .field("root_cert", &self.root_cert)
            .field("sni", &self.sni)
            .finish()
    }
}

/// One connection candidate.
#[derive(Debug, Clone, Default)]
pub struct HostConfig {
    /// Host name, IP address, or unix socket directory (starts with `/`).
    pub host: String,
    /// 1–65535.
    pub port: u16,
    /// Password for this host, when known.
    pub password: Option<String>,
    /// TLS negotiation settings; `None` disables the TLS request.
    pub tls: Option<TlsConfig>,
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Synchronous notice callback. An error surfaces as an I/O failure of
/// the operation that received the notice.
pub type NoticeHook = Arc<dyn Fn(Notice) -> Result<(), BoxError> + Send + Sync>;

/// Synchronous notification callback, same error contract as
/// [`NoticeHook`].
pub type NotificationHook = Arc<dyn Fn(Notification) -> Result<(), BoxError> + Send + Sync>;

/// Post-connect hook; an error closes the connection and fails the
/// connect.
pub type ConnectHook = Arc<
    dyn for<'a> Fn(&'a mut Connection) -> Pin<Box<dyn Future<Output = crate::Result<()>> + Send + 'a>>
        + Send
        + Sync,
>;

/// Session callbacks.
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_notice: Option<NoticeHook>,
    pub on_notification: Option<NotificationHook>,
    pub after_connect: Option<ConnectHook>,
    pub validate_connect: Option<ConnectHook>,
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("on_notice", &self.on_notice.is_some())
            .field("on_notification", &self.on_notification.is_some())
            .field("after_connect", &self.after_connect.is_some())
            .field("validate_connect", &self.validate_connect.is_some())
            .finish()
    }
}

/// Full connection configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Candidates tried in order until one session establishes.
    pub hosts: Vec<HostConfig>,
    /// The database user name. Required.
    pub user: String,
    /// The database to connect to. Defaults to the user name server-side.
    pub database: Option<String>,
    /// Socket open timeout per host.
    pub connect_timeout: Duration,
    /// Extra run-time parameters sent in the startup message.
    pub runtime_params: Vec<(String, String)>,
    /// Session property validated after authentication.
    pub target_session_attrs: TargetSessionAttrs,
    /// Minimum bytes requested from the socket per read.
    pub min_read_buffer_size: usize,
    /// Session callbacks.
    pub hooks: Hooks,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            user: String::new(),
            database: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            runtime_params: Vec::new(),
            target_session_attrs: TargetSessionAttrs::default(),
            min_read_buffer_size: DEFAULT_MIN_READ,
            hooks: Hooks::default(),
        }
    }
}

impl Config {
    /// Start a configuration for `user` with no hosts.
    pub fn new(user: impl Into<String>) -> Self {
        Self { user: user.into(), ..Self::default() }
    }

    /// Append a host candidate.
    pub fn host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.hosts.push(HostConfig { host: host.into(), port, ..HostConfig::default() });
        self
    }

    /// Set the password on every host configured so far.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        let password = password.into();
        for host in &mut self.hosts {
            host.password = Some(password.clone());
        }
        self
    }

    /// Set the database name.
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Apply TLS settings to every host configured so far.
    pub fn tls(mut self, tls: TlsConfig) -> Self {
        for host in &mut self.hosts {
            host.tls = Some(tls.clone());
        }
        self
    }

    /// Append a run-time parameter sent at startup.
    pub fn runtime_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.runtime_params.push((name.into(), value.into()));
        self
    }

    /// Install a notice callback.
    pub fn on_notice(mut self, hook: NoticeHook) -> Self {
        self.hooks.on_notice = Some(hook);
        self
    }

    /// Install a notification callback.
    pub fn on_notification(mut self, hook: NotificationHook) -> Self {
        self.hooks.on_notification = Some(hook);
        self
    }

    /// Install a hook that runs against every fresh connection.
    pub fn after_connect(mut self, hook: ConnectHook) -> Self {
        self.hooks.after_connect = Some(hook);
        self
    }

    /// Install a hook that accepts or rejects every fresh connection.
    pub fn validate_connect(mut self, hook: ConnectHook) -> Self {
        self.hooks.validate_connect = Some(hook);
        self
    }

    /// Parse a keyword/value string (`host=... user=...`) or a
    /// `postgres://` / `postgresql://` URI.
    ///
    /// Missing settings fall back to `PG*` environment variables, then the
    /// service and password files, then defaults.
    pub fn parse(input: &str) -> Result<Self, ConfigParseError> {
        let mut keywords = if input.starts_with("postgres://") || input.starts_with("postgresql://")
        {
            parse::parse_uri(input)?
        } else {
            parse::parse_keywords(input)?
        };
        fill_from_env(&mut keywords);
        Self::from_keywords(keywords)
    }

    /// Build a configuration purely from `PG*` environment variables and
    /// defaults.
    pub fn from_env() -> Result<Self, ConfigParseError> {
        let mut keywords = BTreeMap::new();
        fill_from_env(&mut keywords);
        Self::from_keywords(keywords)
    }

    /// Ensure the configuration can be used to connect.
    pub(crate) fn check(&self) -> Result<(), ConfigParseError> {
        if self.hosts.is_empty() {
            return Err(ConfigParseError::Missing("host"));
        }
        if self.user.is_empty() {
            return Err(ConfigParseError::Missing("user"));
        }
        for host in &self.hosts {
            if host.port == 0 {
                return Err(ConfigParseError::Value {
                    keyword: "port",
                    value: "0".into(),
                });
            }
        }
        Ok(())
    }

    /// Assemble a configuration from a resolved keyword map.
    pub(crate) fn from_keywords(
        mut keywords: BTreeMap<String, String>,
    ) -> Result<Self, ConfigParseError> {
        // a named service contributes missing keywords first
        if let Some(name) = keywords.get("service").cloned() {
            service::apply(&name, &mut keywords)?;
        }

        let mut config = Config::default();

        if let Some(user) = keywords.remove("user") {
            config.user = user;
        }
        config.database = keywords.remove("dbname");

        if let Some(value) = keywords.remove("connect_timeout") {
            let seconds: u64 = value.parse().map_err(|_| ConfigParseError::Value {
                keyword: "connect_timeout",
                value,
            })?;
            config.connect_timeout = Duration::from_secs(seconds);
        }

        if let Some(value) = keywords.remove("target_session_attrs") {
            config.target_session_attrs = TargetSessionAttrs::parse(&value)?;
        }

        let ssl_mode = match keywords.remove("sslmode") {
            Some(value) => SslMode::parse(&value)?,
            None => SslMode::default(),
        };
        let root_cert = keywords.remove("sslrootcert");
        let cert = keywords.remove("sslcert");
        let key = keywords.remove("sslkey");
        let sni = keywords.remove("sslsni").as_deref() != Some("0");
        let min_protocol_version = keywords.remove("ssl_min_protocol_version");
        let tls = match ssl_mode {
            SslMode::Disable => None,
            mode => Some(TlsConfig {
                mode,
                upgrade: None,
                root_cert,
                cert,
                key,
                sni,
                min_protocol_version,
            }),
        };

        // hosts and ports are parallel comma-separated lists; a single
        // port applies to every host
        let hosts = keywords.remove("host").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let ports = keywords.remove("port").unwrap_or_default();
        let hosts: Vec<&str> = hosts.split(',').collect();
        let ports: Vec<&str> = match ports.is_empty() {
            true => Vec::new(),
            false => ports.split(',').collect(),
        };
        if ports.len() > 1 && ports.len() != hosts.len() {
            return Err(ConfigParseError::Value {
                keyword: "port",
                value: ports.join(","),
            });
        }

        let password = keywords.remove("password");
        let passfile = keywords.remove("passfile");

        for (n, host) in hosts.iter().enumerate() {
            let port = match ports.len() {
                0 => DEFAULT_PORT,
                1 => parse_port(ports[0])?,
                _ => parse_port(ports[n])?,
            };
            config.hosts.push(HostConfig {
                host: host.to_string(),
                port,
                password: password.clone(),
                tls: tls.clone(),
            });
        }

        // fill per-host passwords from the password file
        let dbname = config.database.as_deref().unwrap_or(&config.user).to_string();
        for host in config.hosts.iter_mut().filter(|h| h.password.is_none()) {
            host.password = pgpass::lookup(
                passfile.as_deref(),
                &host.host,
                host.port,
                &dbname,
                &config.user,
            )?;
        }

        if let Some(app) = keywords.remove("application_name") {
            config.runtime_params.push(("application_name".into(), app));
        }
        if let Some(options) = keywords.remove("options") {
            config.runtime_params.push(("options".into(), options));
        }

        keywords.remove("service");
        keywords.remove("servicefile");
        if let Some((keyword, _)) = keywords.pop_first() {
            return Err(ConfigParseError::Syntax(format!(
                "unrecognized keyword {keyword:?}"
            )));
        }

        Ok(config)
    }
}

fn parse_port(value: &str) -> Result<u16, ConfigParseError> {
    match value.parse() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigParseError::Value { keyword: "port", value: value.to_string() }),
    }
}

/// Environment variables backing each keyword, consulted for keys the
/// connection string leaves unset.
const ENV_KEYWORDS: &[(&str, &str)] = &[
    ("host", "PGHOST"),
    ("port", "PGPORT"),
    ("dbname", "PGDATABASE"),
    ("user", "PGUSER"),
    ("password", "PGPASSWORD"),
    ("passfile", "PGPASSFILE"),
    ("application_name", "PGAPPNAME"),
    ("connect_timeout", "PGCONNECT_TIMEOUT"),
    ("sslmode", "PGSSLMODE"),
    ("sslkey", "PGSSLKEY"),
    ("sslcert", "PGSSLCERT"),
    ("sslrootcert", "PGSSLROOTCERT"),
    ("target_session_attrs", "PGTARGETSESSIONATTRS"),
    ("service", "PGSERVICE"),
    ("servicefile", "PGSERVICEFILE"),
];

fn fill_from_env(keywords: &mut BTreeMap<String, String>) {
    for (keyword, var) in ENV_KEYWORDS {
        if keywords.contains_key(*keyword) {
            continue;
        }
        if let Ok(value) = std::env::var(var) {
            keywords.insert(keyword.to_string(), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keywords(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn defaults() {
        let config = Config::from_keywords(keywords(&[("user", "alice")])).unwrap();
        assert_eq!(config.hosts.len(), 1);
        assert_eq!(config.hosts[0].host, "127.0.0.1");
        assert_eq!(config.hosts[0].port, 5432);
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.target_session_attrs, TargetSessionAttrs::Any);
        assert_eq!(config.min_read_buffer_size, 8192);
        // sslmode defaults to prefer
        assert_eq!(config.hosts[0].tls.as_ref().unwrap().mode, SslMode::Prefer);
    }

    #[test]
    fn multiple_hosts_share_a_single_port() {
        let config = Config::from_keywords(keywords(&[
            ("user", "alice"),
            ("host", "one,two"),
            ("port", "6000"),
        ]))
        .unwrap();
        assert_eq!(config.hosts[0].port, 6000);
        assert_eq!(config.hosts[1].port, 6000);
    }

    #[test]
    fn per_host_ports() {
        let config = Config::from_keywords(keywords(&[
            ("user", "alice"),
            ("host", "one,two"),
            ("port", "6000,6001"),
        ]))
        .unwrap();
        assert_eq!(config.hosts[0].port, 6000);
        assert_eq!(config.hosts[1].port, 6001);
    }

    #[test]
    fn mismatched_port_list_is_rejected() {
        let err = Config::from_keywords(keywords(&[
            ("user", "alice"),
            ("host", "one,two,three"),
            ("port", "6000,6001"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigParseError::Value { keyword: "port", .. }));
    }

    #[test]
    fn sslmode_disable_drops_tls() {
        let config = Config::from_keywords(keywords(&[
            ("user", "alice"),
            ("sslmode", "disable"),
        ]))
        .unwrap();
        assert!(config.hosts[0].tls.is_none());
    }

    #[test]
    fn prefer_standby_is_rejected() {
        let err = Config::from_keywords(keywords(&[
            ("user", "alice"),
            ("target_session_attrs", "prefer-standby"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigParseError::PreferStandby));
    }

    #[test]
    fn unknown_keyword_is_rejected() {
        let err =
            Config::from_keywords(keywords(&[("user", "alice"), ("bogus", "1")])).unwrap_err();
        assert!(matches!(err, ConfigParseError::Syntax(_)));
    }

    #[test]
    fn check_requires_user_and_host() {
        let config = Config::new("");
        assert!(matches!(config.check(), Err(ConfigParseError::Missing("host"))));
        let config = Config::new("").host("localhost", 5432);
        assert!(matches!(config.check(), Err(ConfigParseError::Missing("user"))));
        let config = Config::new("alice").host("localhost", 5432);
        assert!(config.check().is_ok());
    }
}
