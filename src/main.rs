use anyhow::Context;
use catalog_router::config::DEFAULT_PORT;
use catalog_router::model::ResultSet;
use catalog_router::provision::{
    generate_password, AdminTarget, CatalogProvisioner, SiteCatalogConfig, SqlProvisioner,
};
use catalog_router::{ConnectionStrategy, MysqlConnector, Router, RouterConfig, RouterError, TenantId};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "catalog-router")]
#[command(version, about = "Run statements against tenant catalogs", long_about = None)]
struct Cli {
    /// Engine address: host, host:port, host:/socket or [v6]:port
    #[arg(long, default_value = "localhost", global = true)]
    host: String,

    #[arg(long, global = true)]
    port: Option<u16>,

    #[arg(short, long, default_value = "root", global = true)]
    user: String,

    #[arg(short, long, default_value = "", global = true)]
    password: String,

    /// Working database inside every catalog
    #[arg(long, default_value = "wordpress", global = true)]
    database: String,

    /// Prefix of tenant-owned tables
    #[arg(long, default_value = "wp_", global = true)]
    prefix: String,

    /// single or dual
    #[arg(long, default_value = "single", global = true)]
    strategy: ConnectionStrategy,

    #[arg(long, global = true)]
    debug: bool,

    /// Return connection failures instead of halting
    #[arg(long, global = true)]
    allow_failure_return: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run statements as a tenant
    Query {
        #[arg(short, long, default_value_t = 0)]
        tenant: u64,

        /// Check each catalog with SHOW CATALOGS before switching to it
        #[arg(long)]
        check_catalogs: bool,

        /// Ask the engine for its catalog before every statement
        #[arg(long)]
        probe: bool,

        /// Refuse statements whose tenant cannot be determined
        #[arg(long)]
        strict: bool,

        #[arg(required = true)]
        sql: Vec<String>,
    },

    /// Manage catalogs
    Catalogs {
        #[command(subcommand)]
        action: CatalogAction,
    },
}

#[derive(Subcommand)]
enum CatalogAction {
    /// List catalogs with their ports
    Show,

    /// Port a catalog is served on
    Port { name: String },

    /// Create a catalog and its database
    Create {
        name: String,

        #[arg(long, default_value = "admin")]
        owner: String,

        /// Generated when omitted
        #[arg(long)]
        owner_password: Option<String>,
    },

    /// Create the catalog for a site host name
    Site { http_host: String },

    /// Drop a catalog
    Drop { name: String },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = RouterConfig {
        host: cli.host.clone(),
        port: cli.port,
        user: cli.user.clone(),
        password: cli.password.clone(),
        database: cli.database.clone(),
        table_prefix: cli.prefix.clone(),
        strategy: cli.strategy,
        debug: cli.debug,
        allow_failure_return: cli.allow_failure_return,
        ..Default::default()
    };

    let result = match cli.command {
        Commands::Query {
            tenant,
            check_catalogs,
            probe,
            strict,
            sql,
        } => {
            let config = RouterConfig {
                probe_catalog: probe,
                strict_resolution: strict,
                ..config
            };
            run_queries(config, TenantId(tenant), check_catalogs, &sql)
        }
        Commands::Catalogs { action } => manage_catalogs(&config, action),
    };

    if let Err(err) = &result {
        if let Some(RouterError::Halted(diagnostic)) = err.downcast_ref::<RouterError>() {
            eprint!("{diagnostic}");
            std::process::exit(1);
        }
    }
    result
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "debug"
    } else {
        "info,mysql=off,mysql_common=off"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();
}

fn provisioner(config: &RouterConfig) -> anyhow::Result<SqlProvisioner<MysqlConnector>> {
    let desc = config.descriptor()?;
    let target = AdminTarget::new(
        &desc.host,
        desc.port.unwrap_or(DEFAULT_PORT),
        &config.user,
        &config.password,
    );
    Ok(SqlProvisioner::new(MysqlConnector, target))
}

fn run_queries(
    config: RouterConfig,
    tenant: TenantId,
    check_catalogs: bool,
    statements: &[String],
) -> anyhow::Result<()> {
    let directory = if check_catalogs {
        Some(provisioner(&config)?)
    } else {
        None
    };
    let mut router = Router::new(MysqlConnector, config)?;
    if let Some(directory) = directory {
        router = router.with_directory(directory);
    }

    router.set_tenant(tenant)?;
    for sql in statements {
        let result = router
            .execute(sql)
            .with_context(|| format!("statement failed: {sql}"))?;
        print_result(&result);
    }

    let stats = router.stats();
    tracing::debug!(
        switches = stats.switch_commands,
        connects = stats.connects,
        "done"
    );
    router.close();
    Ok(())
}

fn print_result(result: &ResultSet) {
    if !result.has_rows() {
        println!("OK, {} rows affected", result.affected_rows);
        return;
    }
    println!("{}", result.columns.join("\t"));
    for row in &result.rows {
        let cells: Vec<String> = row.iter().map(|c| c.to_string()).collect();
        println!("{}", cells.join("\t"));
    }
}

fn manage_catalogs(config: &RouterConfig, action: CatalogAction) -> anyhow::Result<()> {
    let provisioner = provisioner(config)?;
    match action {
        CatalogAction::Show => {
            for (name, port) in provisioner.show()? {
                println!("{name}\t{port}");
            }
        }
        CatalogAction::Port { name } => println!("{}", provisioner.get_port(&name)?),
        CatalogAction::Create {
            name,
            owner,
            owner_password,
        } => {
            let password = owner_password.unwrap_or_else(|| generate_password(12));
            let port = provisioner.create(&name, &owner, &password)?;
            println!("created {name} on port {port}");
        }
        CatalogAction::Site { http_host } => {
            let site = SiteCatalogConfig::for_host(&http_host, &config.host);
            let port = provisioner.create(&site.name, &site.username, &site.password)?;
            println!("name\t{}", site.name);
            println!("user\t{}", site.username);
            println!("password\t{}", site.password);
            println!("host\t{}:{port}", site.host);
        }
        CatalogAction::Drop { name } => {
            provisioner.drop(&name)?;
            println!("dropped {name}");
        }
    }
    Ok(())
}
