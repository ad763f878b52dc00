use anyhow::Context;
use log::{info, warn};
use sqlx::postgres::PgPoolOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use media_pipeline::asset_store::PgAssetStore;
use media_pipeline::bus::RabbitBus;
use media_pipeline::config::{parse_memory_limit, AppConfig};
use media_pipeline::downloader::Downloader;
use media_pipeline::engine::ImageEngine;
use media_pipeline::ingestor::Ingestor;
use media_pipeline::object_store::S3ObjectStore;
use media_pipeline::profiles::ProfileRegistry;
use media_pipeline::spool::TempSpool;
use media_pipeline::worker::Worker;

const SPOOL_SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 3600);
const SPOOL_MAX_AGE_HOURS: u64 = 48;

#[tokio::main]
async fn main() {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let args: Vec<String> = std::env::args().collect();
    let config_path = AppConfig::resolve_path(args.get(1).map(String::as_str));

    if let Err(e) = run(&config_path).await {
        eprintln!("media-worker: {e:#}");
        std::process::exit(1);
    }
}

async fn run(config_path: &Path) -> anyhow::Result<()> {
    let config = AppConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let profiles = ProfileRegistry::from_config(&config.profiles)?;
    let memory_limit = config.memory_limit.as_deref().and_then(parse_memory_limit);
    let engine = ImageEngine::new(memory_limit);
    let downloader = Downloader::new(&config.http)?;
    let objects = Arc::new(S3ObjectStore::from_config(&config.s3));
    let bus = Arc::new(RabbitBus::from_config(&config.rabbit));

    let database_url = config
        .database
        .as_ref()
        .map(|db| db.url.clone())
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .context("no database configured (set `database.url` or DATABASE_URL)")?;
    let max_connections = config.database.as_ref().map(|db| db.max_connections).unwrap_or(5);
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(&database_url)
        .await
        .context("connecting to database")?;
    PgAssetStore::migrate(&pool).await.context("applying schema migrations")?;
    let store = Arc::new(PgAssetStore::with_tables(pool, config.entities.clone()));

    let mut ingestor = Ingestor::new(profiles, engine, downloader, objects).with_bus(bus.clone());
    let spool = config.temp.as_ref().map(|t| TempSpool::new(&t.upload_dir));
    if let Some(spool) = &spool {
        ingestor = ingestor.with_spool(spool.clone());
    }
    let ingestor = Arc::new(ingestor);

    println!(
        "media-worker consuming '{}' at amqp://{}:{}",
        config.rabbit.queue, config.rabbit.host, config.rabbit.port
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, finishing the in-flight delivery");
            let _ = shutdown_tx.send(true);
        }
    });

    if let Some(spool) = spool {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SPOOL_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                match spool.cleanup(SPOOL_MAX_AGE_HOURS).await {
                    Ok(0) => {}
                    Ok(n) => info!("spool sweep removed {n} stale files"),
                    Err(e) => warn!("spool sweep failed: {e}"),
                }
            }
        });
    }

    let worker = Worker::new(config.rabbit.clone(), ingestor, store, bus);
    worker.run(shutdown_rx).await?;
    info!("worker stopped cleanly");
    Ok(())
}
