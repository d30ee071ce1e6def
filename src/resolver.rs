use crate::error::RouterError;
use crate::tenant::TenantId;

/// Maps a statement's table to the tenant whose catalog must serve it.
///
/// Prefixed tables belong to the caller's ambient tenant; the table name
/// itself is not trusted to carry the tenant. Strict mode adds the checks
/// that turn the cases this cannot decide into `ResolutionAmbiguous`.
#[derive(Debug, Clone)]
pub struct TenantResolver {
    prefix: String,
    strict: bool,
}

impl TenantResolver {
    pub fn new(prefix: impl Into<String>, strict: bool) -> Self {
        Self {
            prefix: prefix.into(),
            strict,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn resolve(&self, table: &str, ambient: TenantId) -> TenantId {
        if table.starts_with(&self.prefix) {
            ambient
        } else {
            TenantId::ROOT
        }
    }

    pub fn resolve_checked(
        &self,
        table: Option<&str>,
        ambient: TenantId,
    ) -> Result<TenantId, RouterError> {
        let Some(table) = table else {
            if self.strict {
                return Err(RouterError::ResolutionAmbiguous {
                    table: None,
                    ambient,
                    reason: "statement names no table".into(),
                });
            }
            return Ok(TenantId::ROOT);
        };

        let tenant = self.resolve(table, ambient);
        if self.strict && !tenant.is_root() {
            if let Some(embedded) = self.embedded_tenant(table) {
                if embedded != tenant {
                    return Err(RouterError::ResolutionAmbiguous {
                        table: Some(table.to_string()),
                        ambient,
                        reason: format!("table carries tenant {embedded}"),
                    });
                }
            }
        }
        Ok(tenant)
    }

    /// Tenant id spelled into a `<prefix><n>_<name>` table, if any.
    fn embedded_tenant(&self, table: &str) -> Option<TenantId> {
        let rest = table.strip_prefix(&self.prefix)?;
        let (digits, _) = rest.split_once('_')?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(TenantId)
    }
}
