/// Apply pending database migrations and exit.
///
/// Usage: migrate [--database-url URL]
///   Falls back to DATABASE_URL when the flag is absent.

use clap::Parser;

#[derive(Parser)]
#[command(name = "migrate", about = "Apply pending migrations to the school database")]
struct Args {
    /// Connection string (defaults to DATABASE_URL)
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    if let Err(e) = run(&args.database_url).await {
        tracing::error!("Migration failed: {:#}", e);
        std::process::exit(1);
    }
    tracing::info!("Migrations applied");
}

async fn run(database_url: &str) -> anyhow::Result<()> {
    let pool = ecole_api::db::create_pool(database_url, 2).await?;
    ecole_api::db::run_migrations(&pool).await?;
    pool.close().await;
    Ok(())
}
