use clap::Parser;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::{fmt, EnvFilter};

use vigil_core::feed::{FeedSource, HttpFeedSource};
use vigil_core::normalize::CountryTable;
use vigil_core::store::{MessageStore, PgMessageStore};
use vigil_core::VigilConfig;
use vigil_server::router::AppState;
use vigil_server::server;
use vigil_server::subsystems::pipeline::Pipeline;
use vigil_server::subsystems::query::QueryService;
use vigil_server::subsystems::run_control::RunController;
use vigil_server::subsystems::scheduler;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "vigil.toml")]
    config: String,

    /// Check database connectivity and exit.
    #[arg(long)]
    health: bool,

    /// Run the pipeline once, print its log and exit.
    #[arg(long)]
    run_once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (dev convenience, production uses real env vars)
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Load config
    let config = match VigilConfig::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    // Init logging; RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.service.log_level));
    fmt().with_env_filter(filter).init();

    // Connect to DB
    let pool = match vigil_core::db::create_pool(&config.database).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if args.health {
        match vigil_core::db::health_check(&pool).await {
            Ok(v) => println!("✅ PostgreSQL connected: {}", v),
            Err(e) => {
                println!("❌ PostgreSQL connection failed: {}", e);
                std::process::exit(1);
            }
        }
        println!("✅ Vigil DB health check passed");
        return Ok(());
    }

    if let Err(e) = vigil_core::db::ensure_schema(&pool).await {
        eprintln!("Failed to apply schema: {}", e);
        std::process::exit(1);
    }

    let countries = match CountryTable::load(config.countries.path.as_deref()) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            eprintln!("Failed to load country table: {}", e);
            std::process::exit(1);
        }
    };

    let feed: Arc<dyn FeedSource> = match HttpFeedSource::from_config(&config.feed) {
        Ok(f) => Arc::new(f),
        Err(e) => {
            eprintln!("Failed to build feed client: {}", e);
            std::process::exit(1);
        }
    };

    let store: Arc<dyn MessageStore> = Arc::new(PgMessageStore::new(pool));
    let backend = vigil_core::create_backend(&config);
    let pipeline = Arc::new(Pipeline::from_config(
        &config,
        feed,
        Arc::clone(&store),
        backend,
        Arc::clone(&countries),
    ));
    let controller = Arc::new(RunController::new(config.pipeline.log_capacity));

    if args.run_once {
        let job = Arc::clone(&pipeline);
        controller.start(move |reporter| async move { job.run(&reporter).await })?;
        let mut lines = controller.stream_logs();
        while let Some(line) = lines.next().await {
            println!("{}", line);
        }
        controller.join().await;

        let status = controller.status();
        println!("{}", status.step);
        if status.reason.is_some() {
            std::process::exit(1);
        }
        return Ok(());
    }

    let (tx, _rx) = broadcast::channel(1);
    let shutdown_tx = tx.clone();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    });

    // Periodic runs
    let interval = config.pipeline.schedule_interval_minutes;
    if interval > 0 {
        tokio::spawn(scheduler::run_schedule_loop(
            Arc::clone(&controller),
            Arc::clone(&pipeline),
            interval,
            tx.subscribe(),
        ));
    }

    let state = Arc::new(AppState {
        controller: Arc::clone(&controller),
        pipeline,
        query: QueryService::new(store, countries, config.pipeline.permalink_base.clone()),
        retention_days: config.pipeline.retention_days,
    });

    let socket_path = config.service.socket_path.clone();
    server::run_unix_server(&socket_path, state, tx.subscribe()).await?;

    // Let an in-flight run observe the cancel before exiting
    if controller.cancel() {
        controller.join().await;
    }

    Ok(())
}
