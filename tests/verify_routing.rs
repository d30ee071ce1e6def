mod common;

use catalog_router::error::{ConnectionErrorKind, ProvisionError, SwitchError};
use catalog_router::provision::{AdminTarget, CatalogProvisioner, SqlProvisioner};
use catalog_router::{MysqlConnector, Router, RouterConfig, RouterError, TenantId};
use mysql::prelude::Queryable;
use mysql::{Conn, OptsBuilder};

#[test]
fn single_strategy_routes_over_the_wire() -> anyhow::Result<()> {
    let (_server, addr) = common::spawn_sandbox(&["blog_5", "blog_7"])?;
    let config = RouterConfig {
        probe_catalog: true,
        ..common::router_config(addr)
    };
    let mut router = Router::new(MysqlConnector, config)?;

    router.set_tenant(TenantId(5))?;
    router.execute("SELECT * FROM wp_posts")?;
    assert_eq!(router.active_catalog().map(|c| c.to_string()), Some("blog_5".into()));

    router.execute("SELECT * FROM other_table")?;
    assert_eq!(router.active_catalog().map(|c| c.to_string()), Some("def".into()));

    router.set_tenant(TenantId(7))?;
    router.execute("UPDATE wp_options SET option_value = 'x'")?;
    assert_eq!(router.active_catalog().map(|c| c.to_string()), Some("blog_7".into()));

    // def -> blog_5 -> def -> blog_7
    assert_eq!(router.stats().switch_commands, 3);
    assert_eq!(router.stats().connects, 1);
    router.close();
    Ok(())
}

#[test]
fn use_catalog_is_served_as_a_query() -> anyhow::Result<()> {
    let (_server, addr) = common::spawn_sandbox(&["blog_5"])?;
    let opts = OptsBuilder::new()
        .ip_or_hostname(Some("127.0.0.1"))
        .tcp_port(addr.port())
        .user(Some("root"))
        .pass(Some(common::ROOT_PASSWORD))
        .prefer_socket(false);
    let mut conn = Conn::new(opts)?;

    conn.query_drop("USE CATALOG blog_5")?;
    conn.query_drop("USE `wordpress`")?;
    let catalog: Option<String> = conn.query_first("SELECT CATALOG()")?;
    let database: Option<String> = conn.query_first("SELECT DATABASE()")?;
    assert_eq!(catalog.as_deref(), Some("blog_5"));
    assert_eq!(database.as_deref(), Some("wordpress"));

    let err = conn.query_drop("USE CATALOG blog_9").unwrap_err();
    match err {
        mysql::Error::MySqlError(e) => assert_eq!(e.code, 1049),
        other => anyhow::bail!("expected a server error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn sql_mode_is_read_and_cleaned() -> anyhow::Result<()> {
    let (_server, addr) = common::spawn_sandbox(&[])?;
    let mut router = Router::new(MysqlConnector, common::router_config(addr))?;
    router.connect()?;

    let mode = router.execute("SELECT @@SESSION.sql_mode")?;
    assert_eq!(
        mode.first_text(),
        Some("ERROR_FOR_DIVISION_BY_ZERO,NO_AUTO_CREATE_USER,NO_ENGINE_SUBSTITUTION")
    );
    Ok(())
}

#[test]
fn missing_catalog_fails_the_switch_only() -> anyhow::Result<()> {
    let (_server, addr) = common::spawn_sandbox(&["blog_5"])?;
    let mut router = Router::new(MysqlConnector, common::router_config(addr))?;

    match router.set_tenant(TenantId(9)) {
        Err(RouterError::Switch(SwitchError::TargetCatalogMissing { catalog, .. })) => {
            assert_eq!(catalog.as_str(), "blog_9")
        }
        other => anyhow::bail!("expected a missing catalog, got {other:?}"),
    }
    assert_eq!(router.active_catalog().map(|c| c.to_string()), Some("def".into()));

    router.set_tenant(TenantId(5))?;
    router.execute("SELECT * FROM wp_posts")?;
    assert_eq!(router.active_catalog().map(|c| c.to_string()), Some("blog_5".into()));
    Ok(())
}

#[test]
fn directory_blocks_unknown_catalogs() -> anyhow::Result<()> {
    let (_server, addr) = common::spawn_sandbox(&["blog_5"])?;
    let directory = SqlProvisioner::new(
        MysqlConnector,
        AdminTarget::new("127.0.0.1", addr.port(), "root", common::ROOT_PASSWORD),
    );
    let mut router =
        Router::new(MysqlConnector, common::router_config(addr))?.with_directory(directory);

    router.set_tenant(TenantId(5))?;
    assert!(matches!(
        router.set_tenant(TenantId(6)),
        Err(RouterError::Switch(SwitchError::TargetCatalogMissing { .. }))
    ));
    assert_eq!(router.stats().switch_commands, 1);
    Ok(())
}

#[test]
fn provisioner_manages_catalogs() -> anyhow::Result<()> {
    let (_server, addr) = common::spawn_sandbox(&[])?;
    let provisioner = SqlProvisioner::new(
        MysqlConnector,
        AdminTarget::new("127.0.0.1", addr.port(), "root", common::ROOT_PASSWORD),
    );

    let port = provisioner.create("shop1", "admin", "pw")?;
    assert_eq!(port, addr.port());
    let catalogs = provisioner.show()?;
    assert!(catalogs.contains_key("shop1"));
    assert!(catalogs.contains_key("def"));

    assert_eq!(
        provisioner.create("shop1", "admin", "pw"),
        Err(ProvisionError::DuplicateName("shop1".into()))
    );

    assert!(provisioner.drop("shop1")?);
    assert!(!provisioner.show()?.contains_key("shop1"));
    assert!(matches!(
        provisioner.drop("shop1"),
        Err(ProvisionError::DropFailed { .. })
    ));
    Ok(())
}

#[test]
fn unreachable_host_is_returned() -> anyhow::Result<()> {
    let config = RouterConfig {
        host: "127.0.0.1:1".into(),
        allow_failure_return: true,
        connect_timeout_ms: 1_000,
        ..Default::default()
    };
    let mut router = Router::new(MysqlConnector, config)?;
    match router.connect() {
        Err(RouterError::Connection(err)) => {
            assert_eq!(err.kind(), ConnectionErrorKind::Unreachable)
        }
        other => anyhow::bail!("expected an unreachable error, got {other:?}"),
    }
    assert!(router.halted().is_none());
    Ok(())
}

#[test]
fn bad_credentials_halt_the_router() -> anyhow::Result<()> {
    let (_server, addr) = common::spawn_sandbox(&[])?;
    let config = RouterConfig {
        password: "wrong".into(),
        allow_failure_return: false,
        ..common::router_config(addr)
    };
    let mut router = Router::new(MysqlConnector, config)?;

    match router.execute("SELECT 1") {
        Err(RouterError::Halted(diagnostic)) => {
            let rendered = diagnostic.to_string();
            assert!(rendered.contains("Error establishing a database connection"));
            assert!(rendered.contains(&format!("127.0.0.1:{}", addr.port())));
        }
        other => anyhow::bail!("expected a halt, got {other:?}"),
    }
    assert!(matches!(router.execute("SELECT 1"), Err(RouterError::Halted(_))));
    Ok(())
}
