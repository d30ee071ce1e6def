use serde::{Deserialize, Serialize};
use std::fmt;

pub const ROOT_CATALOG: &str = "def";

const TENANT_CATALOG_PREFIX: &str = "blog_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TenantId(pub u64);

impl TenantId {
    pub const ROOT: TenantId = TenantId(0);

    pub fn is_root(self) -> bool {
        self.0 <= 1
    }

    pub fn catalog(self) -> CatalogName {
        CatalogName::for_tenant(self)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TenantId {
    fn from(id: u64) -> Self {
        TenantId(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CatalogName(String);

impl CatalogName {
    pub fn root() -> Self {
        CatalogName(ROOT_CATALOG.to_string())
    }

    pub fn for_tenant(tenant: TenantId) -> Self {
        if tenant.is_root() {
            Self::root()
        } else {
            CatalogName(format!("{TENANT_CATALOG_PREFIX}{}", tenant.0))
        }
    }

    pub fn new(name: impl Into<String>) -> Option<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_');
        valid.then_some(CatalogName(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == ROOT_CATALOG
    }

    pub fn qualify(&self, database: &str) -> String {
        if self.is_root() {
            database.to_string()
        } else {
            format!("{}.{}", self.0, database)
        }
    }
}

impl fmt::Display for CatalogName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CatalogName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
