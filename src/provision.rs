use crate::config::HostDescriptor;
use crate::conn::{ConnectTarget, Connector, Session};
use crate::error::{ConnectionError, EngineError, ProvisionError, ER_DB_CREATE_EXISTS};
use crate::tenant::{CatalogName, ROOT_CATALOG};
use parking_lot::Mutex;
use rand::Rng;
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

pub const MINIMAL_ENGINE_VERSION: &str = "11.0.2";

const PASSWORD_CHARS: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*()";

pub trait CatalogDirectory {
    fn contains(&self, catalog: &CatalogName) -> Result<bool, ProvisionError>;
}

pub trait CatalogProvisioner {
    fn show(&self) -> Result<BTreeMap<String, u16>, ProvisionError>;

    fn get_port(&self, name: &str) -> Result<u16, ProvisionError>;

    fn create(&self, name: &str, user: &str, password: &str) -> Result<u16, ProvisionError>;

    fn drop(&self, name: &str) -> Result<bool, ProvisionError>;
}

/// Out-of-band installation step, e.g. a wrapper around the engine's
/// install tool followed by a server restart.
pub trait CatalogInstaller {
    fn install(&self, catalog: &CatalogName, user: &str, password: &str)
        -> Result<(), ProvisionError>;
}

pub enum InstallMethod {
    Statement,
    External(Box<dyn CatalogInstaller + Send + Sync>),
}

#[derive(Debug, Clone)]
pub struct AdminTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub connect_timeout: Duration,
}

impl AdminTarget {
    pub fn new(host: &str, port: u16, user: &str, password: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            password: password.to_string(),
            connect_timeout: Duration::from_secs(5),
        }
    }

    fn connect_target(&self) -> ConnectTarget {
        ConnectTarget {
            host: HostDescriptor {
                host: self.host.clone(),
                port: Some(self.port),
                socket: None,
                ipv6: self.host.contains(':'),
            },
            user: self.user.clone(),
            password: self.password.clone(),
            database: None,
            connect_timeout: self.connect_timeout,
        }
    }
}

pub struct SqlProvisioner<C: Connector> {
    connector: C,
    target: AdminTarget,
    session: Mutex<Option<C::Session>>,
    install: InstallMethod,
}

impl<C: Connector> SqlProvisioner<C> {
    pub fn new(connector: C, target: AdminTarget) -> Self {
        Self {
            connector,
            target,
            session: Mutex::new(None),
            install: InstallMethod::Statement,
        }
    }

    pub fn with_installer(mut self, installer: impl CatalogInstaller + Send + Sync + 'static) -> Self {
        self.install = InstallMethod::External(Box::new(installer));
        self
    }

    pub fn reset(&self) {
        *self.session.lock() = None;
    }

    fn open_checked(&self) -> Result<C::Session, ProvisionError> {
        let target = self.target.connect_target();
        let mut session = self.connector.open(&target).map_err(|err| {
            ConnectionError::classify(&target.host.to_string(), &self.target.user, err)
        })?;

        let version = session.execute("SELECT VERSION()")?;
        let found = version.first_text().unwrap_or_default().to_string();
        if !version_at_least(&found, MINIMAL_ENGINE_VERSION) {
            return Err(ProvisionError::EngineVersionTooLow {
                found,
                required: MINIMAL_ENGINE_VERSION.to_string(),
            });
        }
        debug!(version = %found, host = %self.target.host, "admin connection established");
        Ok(session)
    }

    fn with_session<T>(
        &self,
        f: impl FnOnce(&mut C::Session) -> Result<T, ProvisionError>,
    ) -> Result<T, ProvisionError> {
        let mut guard = self.session.lock();
        if guard.is_none() {
            *guard = Some(self.open_checked()?);
        }
        let Some(session) = guard.as_mut() else {
            return Err(EngineError::Driver("admin connection unavailable".into()).into());
        };
        let result = f(session);
        if matches!(&result, Err(ProvisionError::Engine(e)) if e.is_transient()) {
            *guard = None;
        }
        result
    }

    fn validate(name: &str) -> Result<CatalogName, ProvisionError> {
        CatalogName::new(name).ok_or_else(|| ProvisionError::InvalidName(name.to_string()))
    }

    fn create_failed(name: &CatalogName) -> impl Fn(EngineError) -> ProvisionError + '_ {
        move |err| match err {
            EngineError::Server { code, .. } if code == ER_DB_CREATE_EXISTS => {
                ProvisionError::DuplicateName(name.to_string())
            }
            other => ProvisionError::CreateFailed {
                name: name.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl<C: Connector> CatalogProvisioner for SqlProvisioner<C> {
    fn show(&self) -> Result<BTreeMap<String, u16>, ProvisionError> {
        let result = self.with_session(|s| Ok(s.execute("SHOW CATALOGS")?))?;
        let idx = result
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case("Catalog"))
            .unwrap_or(0);

        // Every catalog is served on the engine's own port for now.
        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.get(idx))
            .map(|cell| (cell.to_string(), self.target.port))
            .collect())
    }

    fn get_port(&self, _name: &str) -> Result<u16, ProvisionError> {
        Ok(self.target.port)
    }

    fn create(&self, name: &str, user: &str, password: &str) -> Result<u16, ProvisionError> {
        let catalog = Self::validate(name)?;
        if self.show()?.contains_key(catalog.as_str()) {
            return Err(ProvisionError::DuplicateName(name.to_string()));
        }

        match &self.install {
            InstallMethod::Statement => {
                self.with_session(|s| {
                    s.execute(&format!("CREATE CATALOG {catalog}"))
                        .map_err(Self::create_failed(&catalog))
                })?;
            }
            InstallMethod::External(installer) => {
                installer.install(&catalog, user, password)?;
                // The engine was restarted underneath the admin connection.
                self.reset();
            }
        }

        let bootstrap = self.with_session(|s| {
            let fail = Self::create_failed(&catalog);
            s.execute(&format!("USE CATALOG {catalog}")).map_err(&fail)?;
            s.execute(&format!("CREATE DATABASE {catalog}")).map_err(&fail)?;
            s.execute(&format!("USE CATALOG {ROOT_CATALOG}")).map_err(&fail)?;
            Ok(())
        });
        if let Err(err) = bootstrap {
            // The admin session may have been left inside the new catalog.
            self.reset();
            return Err(err);
        }

        info!(%catalog, "catalog created");
        self.get_port(name)
    }

    fn drop(&self, name: &str) -> Result<bool, ProvisionError> {
        let catalog = Self::validate(name)?;
        self.with_session(|s| {
            s.execute(&format!("DROP CATALOG {catalog}"))
                .map_err(|err| ProvisionError::DropFailed {
                    name: name.to_string(),
                    reason: err.to_string(),
                })
        })?;
        info!(%catalog, "catalog dropped");
        Ok(true)
    }
}

impl<C: Connector> CatalogDirectory for SqlProvisioner<C> {
    fn contains(&self, catalog: &CatalogName) -> Result<bool, ProvisionError> {
        Ok(self.show()?.contains_key(catalog.as_str()))
    }
}

/// Compares the leading `major.minor.patch` of two version strings;
/// suffixes such as `-MariaDB-log` are ignored.
pub fn version_at_least(found: &str, required: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^\s*(\d+)(?:\.(\d+))?(?:\.(\d+))?").expect("valid version regex")
    });
    let parse = |v: &str| -> Option<(u32, u32, u32)> {
        let caps = re.captures(v)?;
        let part = |i: usize| {
            caps.get(i)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0)
        };
        Some((part(1), part(2), part(3)))
    };
    match (parse(found), parse(required)) {
        (Some(f), Some(r)) => f >= r,
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteCatalogConfig {
    pub name: String,
    pub username: String,
    pub password: String,
    pub host: String,
}

impl SiteCatalogConfig {
    pub fn for_host(http_host: &str, server: &str) -> Self {
        let name: String = http_host
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
            .collect();
        Self {
            username: name.clone(),
            name,
            password: generate_password(12),
            host: server.to_string(),
        }
    }
}

pub fn generate_password(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| PASSWORD_CHARS[rng.gen_range(0..PASSWORD_CHARS.len())] as char)
        .collect()
}
