//! Persistence and Notification Collaborators
//!
//! Domain records (teams, promotions, game catalog, last-known game state)
//! live behind [`DomainStore`]; durable backends are out of scope, so the
//! in-memory implementation is the process-local seam. Notification delivery
//! mechanics likewise sit behind [`TriggerDispatcher`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

use crate::models::{Checkpoint, GameData, Promotion, PromotionValidation, Team};

/// Catalog entry tying a game to its teams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameCatalogEntry {
    pub game_id: String,
    pub home_team_id: String,
    pub away_team_id: String,
    /// Whether the monitor should pick this game up at startup.
    pub active: bool,
}

/// Keyed get/update access to domain records and the per-game state cache.
pub trait DomainStore: Send + Sync {
    fn team(&self, team_id: &str) -> Option<Team>;
    fn promotion(&self, promotion_id: &str) -> Option<Promotion>;
    fn promotions_for_team(&self, team_id: &str) -> Vec<Promotion>;
    /// The team promotions hang off for a game (the home side).
    fn team_for_game(&self, game_id: &str) -> Option<String>;
    fn active_games(&self) -> Vec<String>;

    fn last_game_state(&self, game_id: &str) -> Option<GameData>;
    /// Update the last-known state. Rejects finality regression: once a game
    /// was stored final, a non-final reading must never overwrite it.
    fn update_game_state(&self, data: &GameData) -> Result<()>;

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;
    fn latest_checkpoint(&self) -> Option<Checkpoint>;
}

/// In-memory store used for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryDomainStore {
    teams: RwLock<HashMap<String, Team>>,
    promotions: RwLock<HashMap<String, Promotion>>,
    games: RwLock<HashMap<String, GameCatalogEntry>>,
    game_states: RwLock<HashMap<String, GameData>>,
    checkpoint: RwLock<Option<Checkpoint>>,
}

impl InMemoryDomainStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_team(&self, team: Team) {
        self.teams.write().insert(team.id.clone(), team);
    }

    pub fn seed_promotion(&self, promotion: Promotion) {
        self.promotions.write().insert(promotion.id.clone(), promotion);
    }

    pub fn seed_game(&self, entry: GameCatalogEntry) {
        self.games.write().insert(entry.game_id.clone(), entry);
    }
}

impl DomainStore for InMemoryDomainStore {
    fn team(&self, team_id: &str) -> Option<Team> {
        self.teams.read().get(team_id).cloned()
    }

    fn promotion(&self, promotion_id: &str) -> Option<Promotion> {
        self.promotions.read().get(promotion_id).cloned()
    }

    fn promotions_for_team(&self, team_id: &str) -> Vec<Promotion> {
        self.promotions
            .read()
            .values()
            .filter(|p| p.team_id == team_id)
            .cloned()
            .collect()
    }

    fn team_for_game(&self, game_id: &str) -> Option<String> {
        self.games.read().get(game_id).map(|g| g.home_team_id.clone())
    }

    fn active_games(&self) -> Vec<String> {
        self.games
            .read()
            .values()
            .filter(|g| g.active)
            .map(|g| g.game_id.clone())
            .collect()
    }

    fn last_game_state(&self, game_id: &str) -> Option<GameData> {
        self.game_states.read().get(game_id).cloned()
    }

    fn update_game_state(&self, data: &GameData) -> Result<()> {
        let mut states = self.game_states.write();
        if let Some(existing) = states.get(&data.game_id) {
            if existing.is_final() && !data.is_final() {
                bail!(
                    "finality regression for game {}: stored state is final, refusing non-final update",
                    data.game_id
                );
            }
        }
        states.insert(data.game_id.clone(), data.clone());
        Ok(())
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        *self.checkpoint.write() = Some(checkpoint.clone());
        Ok(())
    }

    fn latest_checkpoint(&self) -> Option<Checkpoint> {
        self.checkpoint.read().clone()
    }
}

/// Consumes validated triggers. Delivery formatting and transport are out of
/// scope; implementations only see the immutable validation record.
#[async_trait]
pub trait TriggerDispatcher: Send + Sync {
    async fn dispatch(&self, validation: &PromotionValidation) -> Result<()>;
}

/// Dispatcher that only logs, for local runs and tests.
#[derive(Default)]
pub struct LogDispatcher;

#[async_trait]
impl TriggerDispatcher for LogDispatcher {
    async fn dispatch(&self, validation: &PromotionValidation) -> Result<()> {
        info!(
            promotion_id = %validation.promotion_id,
            game_id = %validation.game_id,
            validation_id = %validation.validation_id,
            confidence = validation.confidence,
            "📣 Promotion trigger approved for dispatch"
        );
        Ok(())
    }
}
