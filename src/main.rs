//! DealPulse - Live-Game Promotion Trigger Backend
//!
//! Watches live games through multiple unreliable providers, reconciles them
//! into one consensus state, and makes auditable, idempotent decisions about
//! whether promotional offers fire.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dealpulse_backend::consensus::ConsensusEngine;
use dealpulse_backend::evidence::{EvidenceStore, InMemoryEvidenceStore};
use dealpulse_backend::models::{Config, Promotion, Team, TriggerCondition};
use dealpulse_backend::monitor::{GameMonitor, MonitorConfig};
use dealpulse_backend::sources::{
    GameDataProvider, OfficialFeedClient, ScorepanelClient, SourceFetcher, SportsfeedClient,
};
use dealpulse_backend::store::{
    DomainStore, GameCatalogEntry, InMemoryDomainStore, LogDispatcher, TriggerDispatcher,
};
use dealpulse_backend::validation::{TriggerPipeline, ValidationService};

#[derive(Debug, Parser)]
#[command(name = "dealpulse", about = "Live-game consensus and promotion trigger monitor")]
struct Args {
    /// Game ids to monitor immediately, in addition to the active catalog.
    #[arg(long = "game", value_name = "GAME_ID")]
    games: Vec<String>,

    /// Override POLL_INTERVAL_SECS from the environment.
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    /// Override CHECKPOINT_INTERVAL_SECS from the environment.
    #[arg(long)]
    checkpoint_interval_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,dealpulse_backend=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = Config::from_env()?;
    if let Some(secs) = args.poll_interval_secs {
        config.poll_interval_secs = secs;
    }
    if let Some(secs) = args.checkpoint_interval_secs {
        config.checkpoint_interval_secs = secs;
    }

    info!("🚀 DealPulse backend starting");

    let timeout = Duration::from_millis(config.fetch_timeout_ms);
    let providers: Vec<Arc<dyn GameDataProvider>> = vec![
        Arc::new(OfficialFeedClient::new(config.official_base_url.clone(), timeout)?),
        Arc::new(SportsfeedClient::new(
            config.sportsfeed_base_url.clone(),
            config.sportsfeed_api_key.as_deref(),
            timeout,
        )?),
        Arc::new(ScorepanelClient::new(
            config.scorepanel_base_url.clone(),
            config.scorepanel_api_key.as_deref(),
            timeout,
        )?),
    ];

    // All services are constructed once here and wired by reference; nothing
    // reaches for ambient singletons.
    let evidence: Arc<dyn EvidenceStore> = Arc::new(InMemoryEvidenceStore::new());
    let store = Arc::new(InMemoryDomainStore::new());
    if config.demo_seed {
        seed_demo_catalog(&store);
    }
    let domain: Arc<dyn DomainStore> = store;

    let fetcher = Arc::new(SourceFetcher::new(providers, evidence.clone()));
    let consensus = Arc::new(ConsensusEngine::new(fetcher));
    let validation = Arc::new(ValidationService::new(
        consensus.clone(),
        domain.clone(),
        evidence.clone(),
    ));
    let dispatcher: Arc<dyn TriggerDispatcher> = Arc::new(LogDispatcher);

    let monitor = Arc::new(GameMonitor::new(
        consensus,
        domain,
        evidence,
        MonitorConfig {
            poll_interval: Duration::from_secs(config.poll_interval_secs),
            checkpoint_interval: Duration::from_secs(config.checkpoint_interval_secs),
            replay_capacity: config.replay_capacity,
            game_check_timeout: Duration::from_secs(10),
        },
    ));
    monitor.register_listener(Arc::new(TriggerPipeline::new(validation, dispatcher)));

    monitor.clone().start().await?;
    for game_id in &args.games {
        monitor.monitor_game(game_id).await;
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    monitor.stop().await;

    Ok(())
}

/// Small seeded catalog for local runs (DEALPULSE_DEMO_SEED=1).
fn seed_demo_catalog(store: &InMemoryDomainStore) {
    store.seed_team(Team {
        id: "nym".to_string(),
        name: "New York Mets".to_string(),
        abbreviation: "NYM".to_string(),
    });
    store.seed_promotion(Promotion {
        id: "promo-tacos".to_string(),
        team_id: "nym".to_string(),
        title: "Free tacos on a home win".to_string(),
        trigger: TriggerCondition::TeamWin {
            team_id: "nym".to_string(),
        },
    });
    store.seed_promotion(Promotion {
        id: "promo-runs".to_string(),
        team_id: "nym".to_string(),
        title: "Half-price wings at 6 runs".to_string(),
        trigger: TriggerCondition::ScoreReached {
            team_id: "nym".to_string(),
            min_score: 6,
        },
    });
    store.seed_game(GameCatalogEntry {
        game_id: "662883".to_string(),
        home_team_id: "nym".to_string(),
        away_team_id: "atl".to_string(),
        active: true,
    });
    info!("Demo catalog seeded (1 team, 2 promotions, 1 game)");
}
