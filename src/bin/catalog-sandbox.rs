use catalog_router::auth::SandboxCredentials;
use catalog_router::backend::SandboxBackend;
use catalog_router::engine::Engine;
use clap::Parser;
use opensrv_mysql::{AsyncMysqlIntermediary, IntermediaryOptions};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "catalog-sandbox")]
#[command(version, about = "Catalog-capable sandbox engine", long_about = None)]
struct Args {
    #[arg(long, default_value = "127.0.0.1:3306")]
    listen: String,

    #[arg(long, default_value = "root")]
    root_user: String,

    #[arg(long, default_value = "")]
    root_password: String,

    /// Version string reported to clients
    #[arg(long = "engine-version", default_value = "11.7.2-MariaDB")]
    engine_version: String,

    /// Catalog created at startup (repeatable)
    #[arg(long = "catalog")]
    catalogs: Vec<String>,

    /// Database created in every catalog (repeatable)
    #[arg(long = "database")]
    databases: Vec<String>,

    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let default = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .init();

    let mut engine = Engine::new(&args.engine_version);
    for db in &args.databases {
        engine = engine.with_database(db);
    }
    for catalog in &args.catalogs {
        engine = engine.with_catalog(catalog);
    }
    let credentials = Arc::new(SandboxCredentials::new(&args.root_user, &args.root_password));

    let listener = TcpListener::bind(&args.listen).await?;
    let local_addr = listener.local_addr()?;
    let conn_id = Arc::new(AtomicU32::new(1));
    eprintln!("catalog-sandbox listening on {local_addr}");
    info!(catalogs = ?engine.catalogs(), "sandbox ready");

    while let Ok((stream, peer)) = listener.accept().await {
        let id = conn_id.fetch_add(1, Ordering::Relaxed);
        let backend = SandboxBackend::new(&engine, Arc::clone(&credentials), id);
        tokio::spawn(async move {
            let (r, w) = tokio::io::split(stream);
            // USE CATALOG must reach the engine as a query, not as COM_INIT_DB.
            let opts = IntermediaryOptions {
                process_use_statement_on_query: true,
                reject_connection_on_dbname_absence: false,
            };
            if let Err(e) = AsyncMysqlIntermediary::run_with_options(backend, r, w, &opts).await {
                warn!(conn = id, %peer, error = %e, "connection error");
            }
        });
    }
    Ok(())
}
