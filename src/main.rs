use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{error, info, warn};

use betstack_sync::api;
use betstack_sync::cli::{Cli, Command};
use betstack_sync::database_ops::catalog;
use betstack_sync::database_ops::db::Db;
use betstack_sync::edge::cache_syncer::CacheSyncer;
use betstack_sync::edge::endpoints::CacheTier;
use betstack_sync::edge::kv::{CloudflareKv, KvStore, Namespace};
use betstack_sync::ingest::OddsIngester;
use betstack_sync::jobs::{spawn_workers, JobQueue};
use betstack_sync::ratelimit::usage::UsageReconciler;
use betstack_sync::ratelimit::RateLimiter;
use betstack_sync::scheduler::Scheduler;
use betstack_sync::tracing::init_tracing;
use betstack_sync::util::env::{db_url, env_opt, env_parse, init_env, preflight_check};

const DEFAULT_LEAGUES: &str = "americanfootball_nfl,basketball_nba,icehockey_nhl,baseball_mlb";

const OPS_SNAPSHOT: &[&str] = &[
    "DATABASE_URL",
    "LEAGUES",
    "WORKER_COUNT",
    "API_BIND",
    "ODDS_API_BASE_URL",
];

fn league_keys() -> Vec<String> {
    env_opt("LEAGUES")
        .unwrap_or_else(|| DEFAULT_LEAGUES.into())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

async fn connect_db() -> Result<Db> {
    let max_connections = env_parse("DB_MAX_CONNECTIONS", 5u32);
    Db::connect(&db_url()?, max_connections).await
}

fn build_ingester(db: Db) -> Result<Arc<OddsIngester>> {
    let cfg = betstack_sync::provider::OddsApiConfig::from_env()?;
    let client = betstack_sync::provider::OddsApiClient::new(cfg)?;
    Ok(Arc::new(OddsIngester::new(db, client)))
}

fn build_kv() -> Result<(Arc<dyn KvStore>, Arc<dyn KvStore>)> {
    let cache: Arc<dyn KvStore> = Arc::new(CloudflareKv::from_env(Namespace::Cache)?);
    let keys: Arc<dyn KvStore> = Arc::new(CloudflareKv::from_env(Namespace::ApiKeys)?);
    Ok((cache, keys))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_env();
    init_tracing("betstack_sync=info,info")?;
    let cli = Cli::parse();

    match cli.command {
        Command::Bootstrap => {
            preflight_check("bootstrap", &["ODDS_API_KEY"], OPS_SNAPSHOT)?;
            let db = connect_db().await?;
            build_ingester(db)?.bootstrap().await?;
        }
        Command::SyncSports => {
            preflight_check("sync-sports", &["ODDS_API_KEY"], OPS_SNAPSHOT)?;
            let db = connect_db().await?;
            build_ingester(db)?.sync_sports().await?;
        }
        Command::SyncOdds { league } => {
            preflight_check("sync-odds", &["ODDS_API_KEY"], OPS_SNAPSHOT)?;
            let db = connect_db().await?;
            let Some(row) = catalog::find_league(&db, &league).await? else {
                bail!("unknown league: {league} (run sync-sports first)");
            };
            build_ingester(db)?.sync_league_odds(row.id, &row.key).await?;
        }
        Command::SyncScores { league } => {
            preflight_check("sync-scores", &["ODDS_API_KEY"], OPS_SNAPSHOT)?;
            let db = connect_db().await?;
            let Some(row) = catalog::find_league(&db, &league).await? else {
                bail!("unknown league: {league} (run sync-sports first)");
            };
            build_ingester(db)?.sync_league_scores(row.id, &row.key).await?;
        }
        Command::Propagate { tier } => {
            preflight_check(
                "propagate",
                &["CLOUDFLARE_ACCOUNT_ID", "CLOUDFLARE_API_TOKEN", "CLOUDFLARE_KV_NAMESPACE_ID"],
                OPS_SNAPSHOT,
            )?;
            let db = connect_db().await?;
            let (cache_kv, keys_kv) = build_kv()?;
            let syncer = CacheSyncer::new(db, cache_kv, keys_kv, &league_keys());
            syncer.run_tier(tier.into(), Utc::now()).await?;
        }
        Command::MirrorKeys => {
            preflight_check(
                "mirror-keys",
                &["CLOUDFLARE_ACCOUNT_ID", "CLOUDFLARE_API_TOKEN", "CLOUDFLARE_KV_KEYS_NAMESPACE_ID"],
                OPS_SNAPSHOT,
            )?;
            let db = connect_db().await?;
            let (cache_kv, keys_kv) = build_kv()?;
            CacheSyncer::new(db, cache_kv, keys_kv, &league_keys())
                .mirror_api_keys()
                .await?;
        }
        Command::ReconcileUsage => {
            preflight_check(
                "reconcile-usage",
                &["CLOUDFLARE_ACCOUNT_ID", "CLOUDFLARE_API_TOKEN", "CLOUDFLARE_KV_NAMESPACE_ID"],
                OPS_SNAPSHOT,
            )?;
            let db = connect_db().await?;
            let (cache_kv, keys_kv) = build_kv()?;
            UsageReconciler::new(db, cache_kv, keys_kv).run(Utc::now()).await?;
        }
        Command::Daemon => run_daemon().await?,
    }
    Ok(())
}

async fn run_daemon() -> Result<()> {
    preflight_check(
        "daemon",
        &[
            "ODDS_API_KEY",
            "CLOUDFLARE_ACCOUNT_ID",
            "CLOUDFLARE_API_TOKEN",
            "CLOUDFLARE_KV_NAMESPACE_ID",
            "CLOUDFLARE_KV_KEYS_NAMESPACE_ID",
        ],
        OPS_SNAPSHOT,
    )?;
    let db = connect_db().await?;
    let ingester = build_ingester(db.clone())?;
    let (cache_kv, keys_kv) = build_kv()?;
    let limiter = Arc::new(RateLimiter::new(cache_kv.clone()));
    let syncer = Arc::new(CacheSyncer::new(
        db.clone(),
        cache_kv.clone(),
        keys_kv.clone(),
        &league_keys(),
    ));
    let reconciler = Arc::new(UsageReconciler::new(db.clone(), cache_kv, keys_kv));

    let worker_count = env_parse("WORKER_COUNT", 2usize);
    let queue_capacity = env_parse("JOB_QUEUE_CAPACITY", 64usize);
    let scheduler_tick = env_parse("SCHEDULER_TICK_SECS", 60u64);
    let reconcile_tick = env_parse("RECONCILE_TICK_SECS", 3600u64);

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks: JoinSet<()> = JoinSet::new();

    // Ensure the league catalog exists before the first scheduler tick.
    if let Err(e) = ingester.sync_sports().await {
        warn!(error = %e, "initial sports sync failed, continuing with existing catalog");
    }

    let (queue, rx) = JobQueue::new(queue_capacity);
    spawn_workers(&mut tasks, worker_count, rx, queue.clone(), ingester, &shutdown_tx);

    let scheduler = Arc::new(Scheduler::new(db.clone(), queue, league_keys()));
    spawn_loop(&mut tasks, "scheduler", scheduler_tick, &shutdown_tx, move || {
        let scheduler = scheduler.clone();
        async move { scheduler.tick(Utc::now()).await.map(|_| ()) }
    });

    {
        let syncer = syncer.clone();
        spawn_loop(
            &mut tasks,
            "propagate-critical",
            CacheTier::Critical.interval_secs(),
            &shutdown_tx,
            move || {
                let syncer = syncer.clone();
                async move { syncer.run_tier(CacheTier::Critical, Utc::now()).await.map(|_| ()) }
            },
        );
    }
    {
        let syncer = syncer.clone();
        spawn_loop(
            &mut tasks,
            "propagate-static",
            CacheTier::Static.interval_secs(),
            &shutdown_tx,
            move || {
                let syncer = syncer.clone();
                async move {
                    syncer.run_tier(CacheTier::Static, Utc::now()).await?;
                    syncer.mirror_api_keys().await.map(|_| ())
                }
            },
        );
    }
    {
        let reconciler = reconciler.clone();
        spawn_loop(&mut tasks, "reconcile-usage", reconcile_tick, &shutdown_tx, move || {
            let reconciler = reconciler.clone();
            async move { reconciler.run(Utc::now()).await.map(|_| ()) }
        });
    }

    {
        let db = db.clone();
        let limiter = limiter.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tasks.spawn(async move {
            tokio::select! {
                result = api::server::run(db, limiter) => {
                    if let Err(e) = result {
                        error!(error = %e, "ops api exited");
                    }
                }
                _ = shutdown_rx.recv() => {}
            }
        });
    }

    signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(());
    while tasks.join_next().await.is_some() {}
    info!("all tasks stopped");
    Ok(())
}

/// Spawn a periodic loop that runs `job` every `period_secs` until shutdown.
/// Ticks that fall behind are delayed rather than bunched.
fn spawn_loop<F, Fut>(
    tasks: &mut JoinSet<()>,
    name: &'static str,
    period_secs: u64,
    shutdown: &broadcast::Sender<()>,
    job: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    let mut shutdown_rx = shutdown.subscribe();
    tasks.spawn(async move {
        let mut ticker = interval(Duration::from_secs(period_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = job().await {
                        error!(loop_name = name, error = %e, "periodic task failed");
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        info!(loop_name = name, "loop stopped");
    });
}
