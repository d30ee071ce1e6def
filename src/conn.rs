use crate::config::{HostDescriptor, RouterConfig, INCOMPATIBLE_SQL_MODES};
use crate::error::{ConnectionError, Diagnostic, EngineError, RouterError};
use crate::model::{Cell, ResultSet};
use crate::tenant::CatalogName;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use mysql::prelude::Queryable;
use mysql::{Conn, OptsBuilder, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

pub trait Session {
    fn execute(&mut self, sql: &str) -> Result<ResultSet, EngineError>;
}

#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub host: HostDescriptor,
    pub user: String,
    pub password: String,
    /// Possibly catalog-qualified (`blog_7.wordpress`).
    pub database: Option<String>,
    pub connect_timeout: Duration,
}

pub trait Connector {
    type Session: Session;

    fn open(&self, target: &ConnectTarget) -> Result<Self::Session, EngineError>;
}

const SESSION_WAIT_TIMEOUT_SECS: u32 = 28_800;

#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlConnector;

impl Connector for MysqlConnector {
    type Session = Conn;

    fn open(&self, target: &ConnectTarget) -> Result<Conn, EngineError> {
        let mut opts = OptsBuilder::new()
            .user(Some(target.user.as_str()))
            .pass(Some(target.password.as_str()))
            .db_name(target.database.as_deref())
            .tcp_connect_timeout(Some(target.connect_timeout))
            .prefer_socket(false);
        opts = match &target.host.socket {
            Some(socket) => opts.socket(Some(socket.as_str())),
            None => opts
                .ip_or_hostname(Some(target.host.host.as_str()))
                .tcp_port(target.host.port.unwrap_or(crate::config::DEFAULT_PORT)),
        };
        let mut conn = Conn::new(opts).map_err(from_mysql_error)?;
        conn.query_drop(format!("SET SESSION wait_timeout={SESSION_WAIT_TIMEOUT_SECS}"))
            .map_err(from_mysql_error)?;
        Ok(conn)
    }
}

impl Session for Conn {
    fn execute(&mut self, sql: &str) -> Result<ResultSet, EngineError> {
        let mut result = self.query_iter(sql).map_err(from_mysql_error)?;
        let columns: Vec<String> = result
            .columns()
            .as_ref()
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect();
        let affected_rows = result.affected_rows();
        let last_insert_id = result.last_insert_id();

        let mut rows = Vec::new();
        for row in result.by_ref() {
            let row = row.map_err(from_mysql_error)?;
            rows.push(row.unwrap().into_iter().map(cell_from_value).collect());
        }
        Ok(ResultSet {
            columns,
            rows,
            affected_rows,
            last_insert_id,
        })
    }
}

fn from_mysql_error(err: mysql::Error) -> EngineError {
    match err {
        mysql::Error::MySqlError(e) => EngineError::Server {
            code: e.code,
            message: e.message,
        },
        mysql::Error::IoError(e) => EngineError::Io(e.to_string()),
        mysql::Error::DriverError(mysql::DriverError::CouldNotConnect(detail)) => {
            EngineError::Io(match detail {
                Some((addr, desc, _)) => format!("could not connect to {addr}: {desc}"),
                None => "could not connect".into(),
            })
        }
        other => EngineError::Driver(other.to_string()),
    }
}

fn cell_from_value(value: Value) -> Cell {
    match value {
        Value::NULL => Cell::Null,
        Value::Int(i) => Cell::Int(i),
        Value::UInt(u) => Cell::UInt(u),
        Value::Float(f) => Cell::Float(f64::from(f)),
        Value::Double(d) => Cell::Float(d),
        Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(s) => Cell::Text(s),
            Err(e) => Cell::Bytes(e.into_bytes()),
        },
        Value::Date(y, mo, d, h, mi, s, us) => {
            let dt = NaiveDate::from_ymd_opt(i32::from(y), u32::from(mo), u32::from(d))
                .and_then(|date| {
                    date.and_hms_micro_opt(u32::from(h), u32::from(mi), u32::from(s), us)
                });
            match dt {
                Some(dt) => Cell::Text(format_datetime(dt)),
                None => Cell::Text(format!("{y:04}-{mo:02}-{d:02}")),
            }
        }
        Value::Time(neg, days, h, mi, s, us) => {
            let hours = days * 24 + u32::from(h);
            let sign = if neg { "-" } else { "" };
            let frac = NaiveTime::from_hms_micro_opt(0, 0, 0, us)
                .filter(|_| us > 0)
                .map(|t| t.format("%.6f").to_string())
                .unwrap_or_default();
            Cell::Text(format!("{sign}{hours:02}:{mi:02}:{s:02}{frac}"))
        }
    }
}

fn format_datetime(dt: NaiveDateTime) -> String {
    if dt.time() == NaiveTime::MIN {
        dt.format("%Y-%m-%d").to_string()
    } else {
        dt.format("%Y-%m-%d %H:%M:%S").to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindState {
    /// The catalog the session points at is not known.
    Unbound,
    BoundTo(CatalogName),
}

pub struct ConnectionHandle<S> {
    id: u64,
    session: S,
    state: BindState,
    charset: String,
    sql_mode: String,
}

impl<S: Session> ConnectionHandle<S> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> &BindState {
        &self.state
    }

    pub fn bound_catalog(&self) -> Option<&CatalogName> {
        match &self.state {
            BindState::BoundTo(catalog) => Some(catalog),
            BindState::Unbound => None,
        }
    }

    pub fn is_bound_to(&self, catalog: &CatalogName) -> bool {
        self.bound_catalog() == Some(catalog)
    }

    pub fn charset(&self) -> &str {
        &self.charset
    }

    pub fn sql_mode(&self) -> &str {
        &self.sql_mode
    }

    pub fn execute(&mut self, sql: &str) -> Result<ResultSet, EngineError> {
        self.session.execute(sql)
    }

    pub(crate) fn set_state(&mut self, state: BindState) {
        self.state = state;
    }

    pub fn close(self) {
        debug!(handle = self.id, catalog = ?self.bound_catalog(), "closing connection");
        drop(self.session);
    }
}

pub struct ConnectionManager<C> {
    connector: C,
    config: Arc<RouterConfig>,
    descriptor: HostDescriptor,
    next_id: u64,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, config: Arc<RouterConfig>) -> Result<Self, RouterError> {
        let descriptor = config.descriptor()?;
        Ok(Self {
            connector,
            config,
            descriptor,
            next_id: 1,
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn descriptor(&self) -> &HostDescriptor {
        &self.descriptor
    }

    pub fn connect(
        &mut self,
        catalog: &CatalogName,
    ) -> Result<ConnectionHandle<C::Session>, ConnectionError> {
        let target = ConnectTarget {
            host: self.descriptor.clone(),
            user: self.config.user.clone(),
            password: self.config.password.clone(),
            database: Some(catalog.qualify(&self.config.database)),
            connect_timeout: self.config.connect_timeout(),
        };
        let host = self.descriptor.to_string();

        let mut session = self
            .connector
            .open(&target)
            .map_err(|err| self.classify(&host, err))?;

        let charset = self.apply_charset(&mut session).map_err(|e| self.classify(&host, e))?;
        let sql_mode = self.apply_sql_mode(&mut session).map_err(|e| self.classify(&host, e))?;

        let id = self.next_id;
        self.next_id += 1;
        debug!(handle = id, %catalog, %host, "connection established");
        Ok(ConnectionHandle {
            id,
            session,
            state: BindState::BoundTo(catalog.clone()),
            charset,
            sql_mode,
        })
    }

    pub fn open(
        &mut self,
        catalog: &CatalogName,
    ) -> Result<ConnectionHandle<C::Session>, RouterError> {
        match self.connect(catalog) {
            Ok(handle) => Ok(handle),
            Err(err) if self.config.allow_failure_return => Err(RouterError::Connection(err)),
            Err(err) => {
                let diagnostic = Diagnostic::for_connection(&self.descriptor.to_string(), &err);
                error!(host = %diagnostic.host, reason = %diagnostic.reason, "error establishing a database connection");
                Err(RouterError::Halted(Box::new(diagnostic)))
            }
        }
    }

    fn classify(&self, host: &str, err: EngineError) -> ConnectionError {
        if self.config.debug {
            debug!(%host, error = ?err, "driver reported connection failure");
        }
        ConnectionError::classify(host, &self.config.user, err)
    }

    fn apply_charset(&self, session: &mut C::Session) -> Result<String, EngineError> {
        let charset = &self.config.charset;
        let stmt = match &self.config.collate {
            Some(collate) => format!("SET NAMES {charset} COLLATE {collate}"),
            None => format!("SET NAMES {charset}"),
        };
        session.execute(&stmt)?;
        Ok(charset.clone())
    }

    fn apply_sql_mode(&self, session: &mut C::Session) -> Result<String, EngineError> {
        let modes: Vec<String> = match &self.config.sql_modes {
            Some(modes) => modes.clone(),
            None => {
                let current = session.execute("SELECT @@SESSION.sql_mode")?;
                current
                    .first_text()
                    .unwrap_or_default()
                    .split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect()
            }
        };
        let mode = compatible_sql_mode(&modes);
        session.execute(&format!("SET SESSION sql_mode='{mode}'"))?;
        Ok(mode)
    }
}

pub fn compatible_sql_mode(modes: &[String]) -> String {
    modes
        .iter()
        .map(|m| m.trim().to_ascii_uppercase())
        .filter(|m| !m.is_empty() && !m.contains('\''))
        .filter(|m| !INCOMPATIBLE_SQL_MODES.contains(&m.as_str()))
        .collect::<Vec<_>>()
        .join(",")
}
