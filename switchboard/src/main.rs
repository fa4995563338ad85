use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use diesel::Connection;
use diesel::PgConnection;
use diesel_migrations::embed_migrations;
use diesel_migrations::EmbeddedMigrations;
use diesel_migrations::MigrationHarness;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use switchboard::db;
use switchboard::jobs;
use switchboard::logger;
use switchboard::payments::HostedCheckoutGateway;
use switchboard::payments::PaymentGateway;
use switchboard::routes::router;
use switchboard::settings::Settings;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

#[derive(Parser)]
#[command(about = "Realtime backend for the talker/listener call marketplace")]
struct Opts {
    /// Path to the TOML settings file.
    #[arg(long, default_value = "switchboard.toml")]
    settings: PathBuf,

    /// Postgres connection string; falls back to the DATABASE_URL
    /// environment variable.
    #[arg(long)]
    database_url: Option<String>,

    /// Address the HTTP/WebSocket server listens on.
    #[arg(long, default_value = "0.0.0.0:8000")]
    listen: SocketAddr,

    /// Emit logs as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opts = Opts::parse();

    logger::init_tracing(tracing::metadata::LevelFilter::DEBUG, opts.json)?;

    let settings = Settings::new(&opts.settings).await?;

    let database_url = opts
        .database_url
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .context("--database-url or DATABASE_URL must be set")?;

    run_migrations(&database_url)?;

    let pool = db::build_pool(&database_url)?;
    let gateway: Arc<dyn PaymentGateway> = Arc::new(HostedCheckoutGateway::new(
        settings.payment_api_key.clone(),
    ));

    let _scheduler = jobs::start(pool.clone(), gateway.clone()).await?;

    let app = router(pool, settings, gateway);

    tracing::info!(listen = %opts.listen, "Starting switchboard");

    axum::Server::bind(&opts.listen)
        .serve(app.into_make_service())
        .await
        .context("HTTP server failed")?;

    Ok(())
}

fn run_migrations(database_url: &str) -> Result<()> {
    let mut conn = PgConnection::establish(database_url)
        .context("Could not connect to database for migrations")?;

    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Could not run migrations: {e}"))?;

    for migration in applied {
        tracing::info!(%migration, "Applied migration");
    }

    Ok(())
}
