use crate::config::RouterConfig;
use crate::conn::{ConnectionManager, Connector};
use crate::error::{Diagnostic, RouterError};
use crate::model::ResultSet;
use crate::provision::CatalogDirectory;
use crate::query::table_from_query;
use crate::resolver::TenantResolver;
use crate::switch::{CatalogSwitch, SwitchStats};
use crate::tenant::{CatalogName, TenantId};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Router<C: Connector> {
    config: Arc<RouterConfig>,
    resolver: TenantResolver,
    switch: CatalogSwitch<C>,
    directory: Option<Box<dyn CatalogDirectory>>,
    tenant: TenantId,
    halted: Option<Diagnostic>,
}

impl<C: Connector> Router<C> {
    pub fn new(connector: C, config: RouterConfig) -> Result<Self, RouterError> {
        config.validate()?;
        let config = Arc::new(config);
        let manager = ConnectionManager::new(connector, Arc::clone(&config))?;
        debug!(
            host = %manager.descriptor(),
            strategy = %config.strategy,
            prefix = %config.table_prefix,
            "router created"
        );
        Ok(Self {
            resolver: TenantResolver::new(config.table_prefix.clone(), config.strict_resolution),
            switch: CatalogSwitch::new(manager),
            directory: None,
            tenant: TenantId::ROOT,
            halted: None,
            config,
        })
    }

    pub fn with_directory(mut self, directory: impl CatalogDirectory + 'static) -> Self {
        self.directory = Some(Box::new(directory));
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    pub fn stats(&self) -> SwitchStats {
        self.switch.stats()
    }

    pub fn active_catalog(&self) -> Option<CatalogName> {
        self.switch.active().and_then(|h| h.bound_catalog().cloned())
    }

    pub fn halted(&self) -> Option<&Diagnostic> {
        self.halted.as_ref()
    }

    pub fn connect(&mut self) -> Result<(), RouterError> {
        self.check_halted()?;
        let result = self.switch.connect();
        result.map_err(|e| note_halt(&mut self.halted, e))?;
        info!(host = %self.config.host, strategy = %self.config.strategy, "connected");
        Ok(())
    }

    /// Makes `tenant` the ambient tenant and binds its catalog right away.
    /// Returns the previous tenant. The new tenant stays ambient even when
    /// binding fails, so the next query retries the bind.
    pub fn set_tenant(&mut self, tenant: TenantId) -> Result<TenantId, RouterError> {
        self.check_halted()?;
        let previous = std::mem::replace(&mut self.tenant, tenant);
        debug!(%previous, %tenant, "ambient tenant changed");
        let directory = self.directory.as_deref();
        if let Err(e) = self.switch.ensure_bound(tenant, directory) {
            return Err(note_halt(&mut self.halted, e));
        }
        Ok(previous)
    }

    pub fn execute(&mut self, sql: &str) -> Result<ResultSet, RouterError> {
        self.check_halted()?;

        let tenant = if self.tenant.is_root() {
            TenantId::ROOT
        } else {
            let table = table_from_query(sql);
            let tenant = self.resolver.resolve_checked(table.as_deref(), self.tenant)?;
            debug!(table = ?table, ambient = %self.tenant, resolved = %tenant, "resolved tenant");
            tenant
        };

        let directory = self.directory.as_deref();
        let handle = match self.switch.ensure_bound(tenant, directory) {
            Ok(handle) => handle,
            Err(e) => return Err(note_halt(&mut self.halted, e)),
        };

        if self.config.probe_catalog {
            let expected = tenant.catalog();
            let probe = handle
                .execute("SELECT CATALOG()")
                .map_err(RouterError::Query)?;
            let actual = probe.first_text().unwrap_or_default().to_string();
            if actual != expected.as_str() {
                let id = handle.id();
                warn!(handle = id, %expected, %actual, "connection is on an unexpected catalog");
                self.switch.invalidate_active();
                return Err(RouterError::CatalogMismatch {
                    handle: id,
                    expected,
                    actual,
                });
            }
            debug!(handle = handle.id(), catalog = %actual, "catalog probe");
        }

        handle.execute(sql).map_err(RouterError::Query)
    }

    pub fn close(self) {
        let stats = self.switch.stats();
        debug!(
            switches = stats.switch_commands,
            connects = stats.connects,
            closes = stats.closes,
            retries = stats.retries,
            "router closed"
        );
        self.switch.shutdown();
    }

    fn check_halted(&self) -> Result<(), RouterError> {
        match &self.halted {
            Some(diagnostic) => Err(RouterError::Halted(Box::new(diagnostic.clone()))),
            None => Ok(()),
        }
    }
}

fn note_halt(halted: &mut Option<Diagnostic>, err: RouterError) -> RouterError {
    if let RouterError::Halted(diagnostic) = &err {
        *halted = Some((**diagnostic).clone());
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionStrategy;
    use crate::engine::{Engine, MemoryConnector};
    use crate::error::SwitchError;
    use crate::provision::{AdminTarget, SqlProvisioner};

    fn engine() -> Engine {
        Engine::new("11.7.2-MariaDB")
            .with_user("wp", "secret")
            .with_database("wordpress")
            .with_catalog("blog_5")
            .with_catalog("blog_7")
    }

    fn config() -> RouterConfig {
        RouterConfig {
            user: "wp".into(),
            password: "secret".into(),
            sql_modes: Some(vec![]),
            ..Default::default()
        }
    }

    fn router(engine: &Engine, config: RouterConfig) -> Router<MemoryConnector> {
        Router::new(MemoryConnector::new(engine.clone()), config).unwrap()
    }

    fn last_catalog(engine: &Engine) -> String {
        engine.journal().last().map(|e| e.catalog.clone()).unwrap_or_default()
    }

    #[test]
    fn prefixed_tables_run_in_the_tenant_catalog() {
        let engine = engine();
        let mut r = router(&engine, config());
        assert_eq!(r.set_tenant(TenantId(5)).unwrap(), TenantId::ROOT);

        r.execute("SELECT * FROM wp_posts").unwrap();
        assert_eq!(last_catalog(&engine), "blog_5");

        r.execute("SELECT * FROM other_table").unwrap();
        assert_eq!(last_catalog(&engine), "def");
        assert_eq!(r.tenant(), TenantId(5));
    }

    #[test]
    fn root_tenant_skips_switching() {
        let engine = engine();
        let mut r = router(&engine, config());
        r.execute("SELECT * FROM wp_posts").unwrap();
        r.execute("SELECT 1").unwrap();
        assert_eq!(r.stats().switch_commands, 0);
        assert_eq!(r.active_catalog(), Some(CatalogName::root()));
    }

    #[test]
    fn set_tenant_binds_eagerly() {
        let engine = engine();
        let mut r = router(&engine, config());
        r.set_tenant(TenantId(7)).unwrap();
        assert_eq!(r.active_catalog().map(|c| c.to_string()), Some("blog_7".into()));
        assert_eq!(r.set_tenant(TenantId(1)).unwrap(), TenantId(7));
        assert_eq!(r.active_catalog(), Some(CatalogName::root()));
    }

    #[test]
    fn probe_runs_before_the_query() {
        let engine = engine();
        let mut r = router(
            &engine,
            RouterConfig {
                probe_catalog: true,
                ..config()
            },
        );
        r.set_tenant(TenantId(5)).unwrap();
        engine.clear_journal();

        r.execute("SELECT * FROM wp_options").unwrap();
        let statements: Vec<String> = engine.journal().into_iter().map(|e| e.statement).collect();
        assert_eq!(statements, vec!["SELECT CATALOG()", "SELECT * FROM wp_options"]);
    }

    #[test]
    fn probe_detects_a_moved_connection() {
        let engine = engine();
        let mut r = router(
            &engine,
            RouterConfig {
                probe_catalog: true,
                ..config()
            },
        );
        r.connect().unwrap();
        // Moves the session behind the router's back.
        r.execute("USE CATALOG blog_7").unwrap();

        let err = r.execute("SELECT * FROM other_table").err().unwrap();
        assert!(matches!(err, RouterError::CatalogMismatch { ref actual, .. } if actual == "blog_7"));
        assert!(engine
            .journal()
            .iter()
            .all(|e| e.statement != "SELECT * FROM other_table"));

        // The binding was dropped, so the next query switches back first.
        r.execute("SELECT * FROM other_table").unwrap();
        assert_eq!(last_catalog(&engine), "def");
    }

    #[test]
    fn connection_failure_halts_the_router() {
        let engine = engine();
        engine.set_reachable(false);
        let mut r = router(&engine, config());

        assert!(matches!(r.execute("SELECT 1"), Err(RouterError::Halted(_))));
        assert!(r.halted().is_some());

        engine.set_reachable(true);
        assert!(matches!(r.execute("SELECT 1"), Err(RouterError::Halted(_))));
        assert!(engine.journal().is_empty());
    }

    #[test]
    fn connection_failure_is_returned_when_allowed() {
        let engine = engine();
        engine.set_reachable(false);
        let mut r = router(
            &engine,
            RouterConfig {
                allow_failure_return: true,
                ..config()
            },
        );
        assert!(matches!(r.connect(), Err(RouterError::Connection(_))));

        engine.set_reachable(true);
        r.connect().unwrap();
        assert!(r.halted().is_none());
    }

    #[test]
    fn strict_resolution_refuses_tableless_statements() {
        let engine = engine();
        let mut r = router(
            &engine,
            RouterConfig {
                strict_resolution: true,
                ..config()
            },
        );
        r.set_tenant(TenantId(7)).unwrap();
        engine.clear_journal();

        assert!(matches!(
            r.execute("SELECT 1"),
            Err(RouterError::ResolutionAmbiguous { .. })
        ));
        assert!(matches!(
            r.execute("SELECT * FROM wp_5_posts"),
            Err(RouterError::ResolutionAmbiguous { .. })
        ));
        assert!(engine.journal().is_empty());
    }

    #[test]
    fn dual_strategy_replaces_stale_alternate() {
        let engine = engine();
        let mut r = router(
            &engine,
            RouterConfig {
                strategy: ConnectionStrategy::Dual,
                ..config()
            },
        );
        r.set_tenant(TenantId(5)).unwrap();
        r.execute("SELECT * FROM wp_posts").unwrap();
        r.set_tenant(TenantId(7)).unwrap();
        r.execute("SELECT * FROM wp_posts").unwrap();

        assert_eq!(last_catalog(&engine), "blog_7");
        assert_eq!(r.stats().closes, 1);
        assert_eq!(r.stats().switch_commands, 0);
        r.close();
        assert_eq!(engine.closed_sessions().len(), 3);
    }

    #[test]
    fn missing_catalog_is_reported_before_switching() {
        let engine = engine();
        let directory = SqlProvisioner::new(
            MemoryConnector::new(engine.clone()),
            AdminTarget::new("sandbox", 3306, "wp", "secret"),
        );
        let mut r = router(&engine, config()).with_directory(directory);

        let err = r.set_tenant(TenantId(12)).err().unwrap();
        assert!(matches!(
            err,
            RouterError::Switch(SwitchError::TargetCatalogMissing { .. })
        ));
        assert!(engine
            .journal()
            .iter()
            .all(|e| !e.statement.starts_with("USE CATALOG")));
        assert_eq!(r.tenant(), TenantId(12));
    }

    #[test]
    fn rejects_invalid_configuration() {
        let result = Router::new(
            MemoryConnector::new(engine()),
            RouterConfig {
                table_prefix: String::new(),
                ..config()
            },
        );
        assert!(matches!(result, Err(RouterError::Config(_))));
    }
}
