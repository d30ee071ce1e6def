use crate::error::RouterError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3306;

pub const INCOMPATIBLE_SQL_MODES: &[&str] = &[
    "NO_ZERO_DATE",
    "ONLY_FULL_GROUP_BY",
    "STRICT_TRANS_TABLES",
    "STRICT_ALL_TABLES",
    "TRADITIONAL",
    "ANSI",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStrategy {
    #[default]
    Single,
    Dual,
}

impl FromStr for ConnectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" => Ok(ConnectionStrategy::Single),
            // "double" is the spelling older deployments use.
            "dual" | "double" => Ok(ConnectionStrategy::Dual),
            other => Err(format!("unknown connection strategy: {other}")),
        }
    }
}

impl fmt::Display for ConnectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStrategy::Single => f.write_str("single"),
            ConnectionStrategy::Dual => f.write_str("dual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostDescriptor {
    pub host: String,
    pub port: Option<u16>,
    pub socket: Option<String>,
    pub ipv6: bool,
}

impl HostDescriptor {
    pub fn parse(raw: &str) -> Option<Self> {
        static IPV6: OnceLock<Regex> = OnceLock::new();
        static PLAIN: OnceLock<Regex> = OnceLock::new();

        let (rest, socket) = match raw.find(":/") {
            Some(pos) => (&raw[..pos], Some(raw[pos + 1..].to_string())),
            None => (raw, None),
        };

        let ipv6 = rest.matches(':').count() > 1;
        let re = if ipv6 {
            IPV6.get_or_init(|| {
                Regex::new(r"^\[?(?P<host>[0-9a-fA-F:]+)(?:\]:(?P<port>\d+))?\]?$")
                    .expect("static host pattern")
            })
        } else {
            PLAIN.get_or_init(|| {
                Regex::new(r"^(?P<host>[^:/]*)(?::(?P<port>\d+))?$").expect("static host pattern")
            })
        };

        let caps = re.captures(rest)?;
        let host = caps.name("host").map(|m| m.as_str()).unwrap_or_default();
        let port = match caps.name("port") {
            Some(p) => Some(p.as_str().parse::<u16>().ok()?),
            None => None,
        };

        Some(Self {
            host: if host.is_empty() { "localhost".into() } else { host.to_string() },
            port,
            socket,
            ipv6,
        })
    }
}

impl fmt::Display for HostDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ipv6 {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        if let Some(socket) = &self.socket {
            write!(f, ":{socket}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub password: String,
    pub database: String,
    pub charset: String,
    pub collate: Option<String>,
    pub sql_modes: Option<Vec<String>>,
    pub table_prefix: String,
    pub strategy: ConnectionStrategy,
    pub debug: bool,
    pub allow_failure_return: bool,
    pub connect_timeout_ms: u64,
    pub probe_catalog: bool,
    pub strict_resolution: bool,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: None,
            user: "root".into(),
            password: String::new(),
            database: "wordpress".into(),
            charset: "utf8mb4".into(),
            collate: None,
            sql_modes: None,
            table_prefix: "wp_".into(),
            strategy: ConnectionStrategy::Single,
            debug: false,
            allow_failure_return: false,
            connect_timeout_ms: 5_000,
            probe_catalog: false,
            strict_resolution: false,
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<(), RouterError> {
        self.descriptor()?;
        if self.database.trim().is_empty() {
            return Err(RouterError::Config("database name is empty".into()));
        }
        if self.table_prefix.is_empty() {
            return Err(RouterError::Config("table prefix is empty".into()));
        }
        if self.charset.is_empty()
            || !self
                .charset
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_')
        {
            return Err(RouterError::Config(format!(
                "invalid charset: {:?}",
                self.charset
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(RouterError::Config("connect timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn descriptor(&self) -> Result<HostDescriptor, RouterError> {
        let mut desc = HostDescriptor::parse(&self.host)
            .ok_or_else(|| RouterError::Config(format!("cannot parse host {:?}", self.host)))?;
        if desc.port.is_none() && desc.socket.is_none() {
            desc.port = Some(self.port.unwrap_or(DEFAULT_PORT));
        }
        Ok(desc)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
