//! Core domain model: game readings, consensus, events, validations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic (v5) event and validation ids.
pub const DEALPULSE_UUID_NAMESPACE: Uuid = Uuid::from_u128(0x8f1d_42a7_9c3e_4b60_a512_7e0d_3c9f_55b1);

/// Status block of a single game reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStatus {
    /// Coarse state, e.g. "scheduled", "live", "final".
    pub state: String,
    /// Provider-flavored detail, e.g. "Top 7th", "Final/10".
    pub detailed_state: String,
    pub is_final: bool,
}

/// One side of the scoreboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamScore {
    pub id: String,
    pub name: String,
    pub score: u32,
}

/// Canonical normalized reading of one game from one source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameData {
    pub game_id: String,
    pub home: TeamScore,
    pub away: TeamScore,
    pub status: GameStatus,
    pub timestamp: DateTime<Utc>,
    /// Which provider produced this reading.
    pub source: String,
    pub venue: Option<String>,
    pub inning: Option<u8>,
}

impl GameData {
    pub fn is_final(&self) -> bool {
        self.status.is_final
    }

    pub fn scores(&self) -> (u32, u32) {
        (self.home.score, self.away.score)
    }

    /// Two readings agree when they report the same scores and finality.
    pub fn agrees_with(&self, other: &GameData) -> bool {
        self.scores() == other.scores() && self.status.is_final == other.status.is_final
    }
}

/// A single provider's answer for one fetch. Produced fresh per fetch, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceResponse {
    pub data: GameData,
    pub fetched_at: DateTime<Utc>,
    pub response_time_ms: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl SourceResponse {
    pub fn source(&self) -> &str {
        &self.data.source
    }
}

/// Reconciliation outcome category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusStatus {
    Confirmed,
    Provisional,
    NeedsReview,
}

impl ConsensusStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusStatus::Confirmed => "confirmed",
            ConsensusStatus::Provisional => "provisional",
            ConsensusStatus::NeedsReview => "needs_review",
        }
    }
}

/// Authoritative reconciled state for one game at one point in time.
///
/// Immutable once produced; every engine call yields a new instance pointing
/// at its own evidence bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub game_id: String,
    pub status: ConsensusStatus,
    /// In [0, 1].
    pub confidence: f64,
    /// The chosen reading.
    pub data: GameData,
    /// Hash of the source bundle this result was computed from.
    pub evidence_hash: Option<String>,
    pub decision_rationale: String,
    pub requires_reconciliation: bool,
}

/// Typed state-change categories emitted by the monitor's diff step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameEventType {
    GameStart,
    GameEnd,
    ScoreChange,
    StatusChange,
}

impl GameEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameEventType::GameStart => "game_start",
            GameEventType::GameEnd => "game_end",
            GameEventType::ScoreChange => "score_change",
            GameEventType::StatusChange => "status_change",
        }
    }
}

/// Downstream handling state of an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A detected game state change.
///
/// Immutable after evidence persistence except `processing_status` and
/// `retry_count`, which downstream handling may advance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameEvent {
    pub event_id: String,
    pub game_id: String,
    pub event_type: GameEventType,
    pub timestamp: DateTime<Utc>,
    pub previous_state: Option<GameData>,
    pub current_state: GameData,
    /// Whether this event type is eligible to trigger promotions.
    pub triggered: bool,
    pub processing_status: ProcessingStatus,
    pub retry_count: u32,
    pub evidence_hash: Option<String>,
}

impl GameEvent {
    pub fn new(
        event_type: GameEventType,
        previous_state: Option<GameData>,
        current_state: GameData,
        detected_at: DateTime<Utc>,
    ) -> Self {
        let game_id = current_state.game_id.clone();
        // Deterministic per (game, type, detection time).
        let event_id = Uuid::new_v5(
            &DEALPULSE_UUID_NAMESPACE,
            format!(
                "{}:{}:{}",
                game_id,
                event_type.as_str(),
                detected_at.timestamp_millis()
            )
            .as_bytes(),
        )
        .to_string();

        let triggered = !matches!(event_type, GameEventType::StatusChange);

        Self {
            event_id,
            game_id,
            event_type,
            timestamp: detected_at,
            previous_state,
            current_state,
            triggered,
            processing_status: ProcessingStatus::Pending,
            retry_count: 0,
            evidence_hash: None,
        }
    }
}

/// Aggregate counters carried inside checkpoints.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitorStats {
    pub cycles: u64,
    pub events_processed: u64,
    pub games_skipped: u64,
    pub games_failed: u64,
    pub avg_cycle_ms: f64,
}

impl MonitorStats {
    /// Fold one completed poll cycle into the running average.
    pub fn record_cycle(&mut self, cycle_ms: f64) {
        let n = self.cycles as f64;
        self.avg_cycle_ms = (self.avg_cycle_ms * n + cycle_ms) / (n + 1.0);
        self.cycles += 1;
    }

    pub fn summary(&self) -> String {
        format!(
            "cycles={}, events={}, skipped={}, failed={}, avg_cycle_ms={:.1}",
            self.cycles, self.events_processed, self.games_skipped, self.games_failed, self.avg_cycle_ms
        )
    }
}

/// Persisted marker of monitoring progress for crash recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub timestamp: DateTime<Utc>,
    pub last_processed_event_id: Option<String>,
    pub monitored_games: Vec<String>,
    pub stats: MonitorStats,
}

impl Checkpoint {
    pub fn new(
        last_processed_event_id: Option<String>,
        monitored_games: Vec<String>,
        stats: MonitorStats,
    ) -> Self {
        Self {
            checkpoint_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            last_processed_event_id,
            monitored_games,
            stats,
        }
    }
}

/// Outcome of one promotion validation call. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionValidation {
    /// Deterministic idempotency key for (promotion, game).
    pub validation_id: String,
    pub promotion_id: String,
    pub game_id: String,
    pub team_id: Option<String>,
    pub is_valid: bool,
    pub confidence: f64,
    /// Ordered hash lineage: consensus evidence first, then validation evidence.
    pub evidence_chain: Vec<String>,
    pub requires_manual_review: bool,
    pub rationale: String,
    pub validated_at: DateTime<Utc>,
}

/// Team catalog record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Team {
    pub id: String,
    pub name: String,
    pub abbreviation: String,
}

/// Condition under which a promotion fires, as a closed set of typed variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Fires when the game reaches a final state, regardless of outcome.
    GameEnd,
    /// Fires when the named team wins a final game.
    TeamWin { team_id: String },
    /// Fires once the named team's score reaches the threshold.
    ScoreReached { team_id: String, min_score: u32 },
}

impl TriggerCondition {
    pub fn describe(&self) -> String {
        match self {
            TriggerCondition::GameEnd => "game reaches final".to_string(),
            TriggerCondition::TeamWin { team_id } => format!("team {} wins", team_id),
            TriggerCondition::ScoreReached { team_id, min_score } => {
                format!("team {} scores {}+", team_id, min_score)
            }
        }
    }
}

/// Promotion catalog record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Promotion {
    pub id: String,
    pub team_id: String,
    pub title: String,
    pub trigger: TriggerCondition,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub poll_interval_secs: u64,
    pub checkpoint_interval_secs: u64,
    pub replay_capacity: usize,
    pub fetch_timeout_ms: u64,
    pub official_base_url: String,
    pub sportsfeed_base_url: String,
    pub sportsfeed_api_key: Option<String>,
    pub scorepanel_base_url: String,
    pub scorepanel_api_key: Option<String>,
    pub demo_seed: bool,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let poll_interval_secs = std::env::var("POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "20".to_string())
            .parse()
            .unwrap_or(20);

        let checkpoint_interval_secs = std::env::var("CHECKPOINT_INTERVAL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .unwrap_or(300);

        let replay_capacity = std::env::var("REPLAY_CAPACITY")
            .unwrap_or_else(|_| "1000".to_string())
            .parse()
            .unwrap_or(1000);

        let fetch_timeout_ms = std::env::var("FETCH_TIMEOUT_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse()
            .unwrap_or(5000);

        let official_base_url = std::env::var("OFFICIAL_FEED_BASE_URL")
            .unwrap_or_else(|_| "https://statsapi.example.com/api/v1".to_string());

        let sportsfeed_base_url = std::env::var("SPORTSFEED_BASE_URL")
            .unwrap_or_else(|_| "https://api.sportsfeed.example.com/v2".to_string());

        let sportsfeed_api_key = std::env::var("SPORTSFEED_API_KEY").ok();

        let scorepanel_base_url = std::env::var("SCOREPANEL_BASE_URL")
            .unwrap_or_else(|_| "https://scorepanel.example.com/feeds".to_string());

        let scorepanel_api_key = std::env::var("SCOREPANEL_API_KEY").ok();

        let demo_seed = std::env::var("DEALPULSE_DEMO_SEED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(false);

        Ok(Self {
            poll_interval_secs,
            checkpoint_interval_secs,
            replay_capacity,
            fetch_timeout_ms,
            official_base_url,
            sportsfeed_base_url,
            sportsfeed_api_key,
            scorepanel_base_url,
            scorepanel_api_key,
            demo_seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(source: &str, home: u32, away: u32, is_final: bool) -> GameData {
        GameData {
            game_id: "g1".to_string(),
            home: TeamScore {
                id: "t-home".to_string(),
                name: "Home".to_string(),
                score: home,
            },
            away: TeamScore {
                id: "t-away".to_string(),
                name: "Away".to_string(),
                score: away,
            },
            status: GameStatus {
                state: if is_final { "final" } else { "live" }.to_string(),
                detailed_state: String::new(),
                is_final,
            },
            timestamp: Utc::now(),
            source: source.to_string(),
            venue: None,
            inning: None,
        }
    }

    #[test]
    fn agreement_requires_scores_and_finality() {
        let a = reading("official", 3, 1, true);
        let b = reading("sportsfeed", 3, 1, true);
        let c = reading("scorepanel", 3, 1, false);
        let d = reading("scorepanel", 2, 1, true);

        assert!(a.agrees_with(&b));
        assert!(!a.agrees_with(&c));
        assert!(!a.agrees_with(&d));
    }

    #[test]
    fn event_id_is_deterministic_per_game_type_and_time() {
        let now = Utc::now();
        let cur = reading("official", 1, 0, false);
        let e1 = GameEvent::new(GameEventType::ScoreChange, None, cur.clone(), now);
        let e2 = GameEvent::new(GameEventType::ScoreChange, None, cur.clone(), now);
        let e3 = GameEvent::new(GameEventType::GameEnd, None, cur, now);

        assert_eq!(e1.event_id, e2.event_id);
        assert_ne!(e1.event_id, e3.event_id);
    }

    #[test]
    fn status_change_is_informational_only() {
        let now = Utc::now();
        let cur = reading("official", 0, 0, false);
        let status = GameEvent::new(GameEventType::StatusChange, None, cur.clone(), now);
        let score = GameEvent::new(GameEventType::ScoreChange, None, cur, now);

        assert!(!status.triggered);
        assert!(score.triggered);
    }

    #[test]
    fn trigger_condition_serializes_with_type_tag() {
        let c = TriggerCondition::TeamWin {
            team_id: "t-home".to_string(),
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "team_win");
        assert_eq!(json["team_id"], "t-home");
    }
}
