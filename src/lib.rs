pub mod auth;
pub mod backend;
pub mod config;
pub mod conn;
pub mod engine;
pub mod error;
pub mod model;
pub mod provision;
pub mod query;
pub mod resolver;
pub mod router;
pub mod switch;
pub mod tenant;

pub use config::{ConnectionStrategy, RouterConfig};
pub use conn::{Connector, MysqlConnector, Session};
pub use error::RouterError;
pub use router::Router;
pub use tenant::{CatalogName, TenantId};
