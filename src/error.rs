use crate::tenant::{CatalogName, TenantId};
use std::fmt;
use thiserror::Error;

pub const ER_DBACCESS_DENIED_ERROR: u16 = 1044;
pub const ER_ACCESS_DENIED_ERROR: u16 = 1045;
pub const ER_DB_CREATE_EXISTS: u16 = 1007;
pub const ER_DB_DROP_EXISTS: u16 = 1008;
pub const ER_BAD_DB_ERROR: u16 = 1049;
pub const ER_UNKNOWN_ERROR: u16 = 1105;
pub const ER_UNKNOWN_SYSTEM_VARIABLE: u16 = 1193;
pub const ER_NOT_SUPPORTED_AUTH_MODE: u16 = 1251;
pub const ER_ACCESS_DENIED_NO_PASSWORD_ERROR: u16 = 1698;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("server error {code}: {message}")]
    Server { code: u16, message: String },

    #[error("driver error: {0}")]
    Driver(String),
}

impl EngineError {
    pub fn server(code: u16, message: impl Into<String>) -> Self {
        EngineError::Server {
            code,
            message: message.into(),
        }
    }

    /// Only transport failures are worth repeating; a server answer is final.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Io(_))
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            EngineError::Server { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    Auth,
    Unreachable,
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("access denied for '{user}' at {host}: {message}")]
    Auth {
        host: String,
        user: String,
        message: String,
    },

    #[error("database server at {host} is unreachable: {message}")]
    Unreachable { host: String, message: String },

    #[error("protocol error talking to {host}: {message}")]
    Protocol {
        host: String,
        code: Option<u16>,
        message: String,
    },
}

impl ConnectionError {
    pub fn classify(host: &str, user: &str, err: EngineError) -> Self {
        match err {
            EngineError::Io(message) => ConnectionError::Unreachable {
                host: host.to_string(),
                message,
            },
            EngineError::Server { code, message }
                if matches!(
                    code,
                    ER_DBACCESS_DENIED_ERROR
                        | ER_ACCESS_DENIED_ERROR
                        | ER_NOT_SUPPORTED_AUTH_MODE
                        | ER_ACCESS_DENIED_NO_PASSWORD_ERROR
                ) =>
            {
                ConnectionError::Auth {
                    host: host.to_string(),
                    user: user.to_string(),
                    message,
                }
            }
            EngineError::Server { code, message } => ConnectionError::Protocol {
                host: host.to_string(),
                code: Some(code),
                message,
            },
            EngineError::Driver(message) => ConnectionError::Protocol {
                host: host.to_string(),
                code: None,
                message,
            },
        }
    }

    pub fn kind(&self) -> ConnectionErrorKind {
        match self {
            ConnectionError::Auth { .. } => ConnectionErrorKind::Auth,
            ConnectionError::Unreachable { .. } => ConnectionErrorKind::Unreachable,
            ConnectionError::Protocol { .. } => ConnectionErrorKind::Protocol,
        }
    }

    pub fn is_unknown_database(&self) -> bool {
        matches!(
            self,
            ConnectionError::Protocol {
                code: Some(ER_BAD_DB_ERROR),
                ..
            }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwitchError {
    #[error("catalog {catalog} is not available: {reason}")]
    TargetCatalogMissing {
        catalog: CatalogName,
        reason: String,
    },

    #[error("switch to catalog {catalog} was interrupted: {reason}")]
    SwitchInterrupted {
        catalog: CatalogName,
        reason: String,
    },

    #[error("database {database} is missing in catalog {catalog}: {reason}")]
    DatabaseMissing {
        catalog: CatalogName,
        database: String,
        reason: String,
    },

    #[error("reconnect to catalog {catalog} after discarding handle bound to {stale} failed: {source}")]
    StaleHandleReconnectFailed {
        catalog: CatalogName,
        stale: String,
        #[source]
        source: ConnectionError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error("catalog name already exists: {0}")]
    DuplicateName(String),

    #[error("engine version {found} is too low, the minimal version is {required}")]
    EngineVersionTooLow { found: String, required: String },

    #[error("error dropping catalog {name}: {reason}")]
    DropFailed { name: String, reason: String },

    #[error("invalid catalog name: {0:?}")]
    InvalidName(String),

    #[error("error creating catalog {name}: {reason}")]
    CreateFailed { name: String, reason: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub host: String,
    pub reason: String,
    pub checks: Vec<&'static str>,
}

impl Diagnostic {
    pub fn for_connection(host: &str, err: &ConnectionError) -> Self {
        let checks = match err.kind() {
            ConnectionErrorKind::Auth => vec!["Are you sure you have the correct username and password?"],
            ConnectionErrorKind::Unreachable => vec![
                "Are you sure you have typed the correct hostname?",
                "Are you sure the database server is running?",
            ],
            ConnectionErrorKind::Protocol => vec![
                "Are you sure the configured database exists?",
                "Are you sure the server supports catalogs?",
            ],
        };
        Self {
            host: host.to_string(),
            reason: err.to_string(),
            checks,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error establishing a database connection")?;
        writeln!(
            f,
            "Either the credentials are incorrect or contact with the database server at {} could not be established ({}).",
            self.host, self.reason
        )?;
        for check in &self.checks {
            writeln!(f, "  - {check}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Switch(#[from] SwitchError),

    #[error("cannot resolve tenant for table {table:?} with ambient tenant {ambient}: {reason}")]
    ResolutionAmbiguous {
        table: Option<String>,
        ambient: TenantId,
        reason: String,
    },

    #[error("catalog {catalog} is unavailable: {source}")]
    TenantUnavailable {
        catalog: CatalogName,
        #[source]
        source: ProvisionError,
    },

    #[error("connection {handle} reports catalog {actual}, expected {expected}")]
    CatalogMismatch {
        handle: u64,
        expected: CatalogName,
        actual: String,
    },

    #[error("query failed: {0}")]
    Query(#[source] EngineError),

    #[error("router halted:\n{0}")]
    Halted(Box<Diagnostic>),

    #[error("invalid configuration: {0}")]
    Config(String),
}
