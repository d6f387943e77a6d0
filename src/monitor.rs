//! Event-Sourced Game Monitor
//!
//! Polls a dynamic set of games, diffs consensus states across cycles into
//! typed events, persists/broadcasts/buffers them, and checkpoints progress.
//! Per-game checks inside one cycle run concurrently and are settle-all
//! joined; one game's failure never aborts the cycle for the rest.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::consensus::ConsensusEngine;
use crate::evidence::{EvidencePayload, EvidenceStore};
use crate::models::{Checkpoint, GameData, GameEvent, GameEventType, MonitorStats};
use crate::store::DomainStore;

/// Version stamped into every persisted event envelope.
pub const MONITOR_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub checkpoint_interval: Duration,
    /// Ring capacity of the in-memory replay buffer.
    pub replay_capacity: usize,
    /// Budget for one game's whole check (fetch + diff + emit).
    pub game_check_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(20),
            checkpoint_interval: Duration::from_secs(300),
            replay_capacity: 1000,
            game_check_timeout: Duration::from_secs(10),
        }
    }
}

/// Receives every emitted event, in emission order, within the poll cycle.
/// Each invocation runs in its own failure boundary: an erroring listener is
/// logged and skipped, never blocking delivery to its peers.
#[async_trait]
pub trait GameEventListener: Send + Sync {
    fn name(&self) -> &str;
    async fn on_event(&self, event: &GameEvent) -> Result<()>;
}

/// Deterministic diff of two readings of one game into typed events.
///
/// The rules are independent and all evaluated every cycle; a score change
/// and a finalization in the same cycle yield two separate events.
pub fn detect_game_state_changes(
    previous: Option<&GameData>,
    current: &GameData,
    detected_at: DateTime<Utc>,
) -> Vec<GameEvent> {
    let mut events = Vec::new();

    let Some(prev) = previous else {
        if !current.is_final() {
            events.push(GameEvent::new(
                GameEventType::GameStart,
                None,
                current.clone(),
                detected_at,
            ));
        }
        return events;
    };

    if prev.scores() != current.scores() {
        events.push(GameEvent::new(
            GameEventType::ScoreChange,
            Some(prev.clone()),
            current.clone(),
            detected_at,
        ));
    }

    if !prev.is_final() && current.is_final() {
        events.push(GameEvent::new(
            GameEventType::GameEnd,
            Some(prev.clone()),
            current.clone(),
            detected_at,
        ));
    }

    let status_moved = prev.status.state != current.status.state
        || prev.status.detailed_state != current.status.detailed_state;
    if prev.is_final() == current.is_final() && status_moved {
        events.push(GameEvent::new(
            GameEventType::StatusChange,
            Some(prev.clone()),
            current.clone(),
            detected_at,
        ));
    }

    events
}

enum GameCheckOutcome {
    Events(usize),
    NoData,
    Failed,
}

struct RunningTasks {
    shutdown_tx: watch::Sender<bool>,
    poll_handle: JoinHandle<()>,
    checkpoint_handle: JoinHandle<()>,
}

pub struct GameMonitor {
    consensus: Arc<ConsensusEngine>,
    store: Arc<dyn DomainStore>,
    evidence: Arc<dyn EvidenceStore>,
    config: MonitorConfig,
    listeners: RwLock<Vec<Arc<dyn GameEventListener>>>,
    monitored: RwLock<HashSet<String>>,
    replay: Mutex<VecDeque<GameEvent>>,
    stats: Mutex<MonitorStats>,
    last_processed_event: Mutex<Option<String>>,
    running: Mutex<Option<RunningTasks>>,
}

impl GameMonitor {
    pub fn new(
        consensus: Arc<ConsensusEngine>,
        store: Arc<dyn DomainStore>,
        evidence: Arc<dyn EvidenceStore>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            consensus,
            store,
            evidence,
            config,
            listeners: RwLock::new(Vec::new()),
            monitored: RwLock::new(HashSet::new()),
            replay: Mutex::new(VecDeque::new()),
            stats: Mutex::new(MonitorStats::default()),
            last_processed_event: Mutex::new(None),
            running: Mutex::new(None),
        }
    }

    pub fn register_listener(&self, listener: Arc<dyn GameEventListener>) {
        info!(listener = listener.name(), "Event listener registered");
        self.listeners.write().push(listener);
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn monitored_games(&self) -> Vec<String> {
        let mut games: Vec<String> = self.monitored.read().iter().cloned().collect();
        games.sort();
        games
    }

    pub fn replay_events(&self) -> Vec<GameEvent> {
        self.replay.lock().iter().cloned().collect()
    }

    pub fn stats(&self) -> MonitorStats {
        self.stats.lock().clone()
    }

    /// Restore from the last checkpoint and the active-game catalog, then
    /// begin the poll and checkpoint loops.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        if self.running.lock().is_some() {
            bail!("monitor already running");
        }

        if let Some(cp) = self.store.latest_checkpoint() {
            info!(
                checkpoint_id = %cp.checkpoint_id,
                games = cp.monitored_games.len(),
                last_event = cp.last_processed_event_id.as_deref().unwrap_or("-"),
                "Resuming from checkpoint"
            );
            *self.stats.lock() = cp.stats.clone();
            *self.last_processed_event.lock() = cp.last_processed_event_id.clone();
            self.monitored.write().extend(cp.monitored_games.iter().cloned());
        }

        for game_id in self.store.active_games() {
            self.monitored.write().insert(game_id);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let poll_handle = {
            let monitor = self.clone();
            let mut shutdown = shutdown_rx.clone();
            tokio::spawn(async move {
                let mut ticker = interval(monitor.config.poll_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => monitor.run_poll_cycle().await,
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        let checkpoint_handle = {
            let monitor = self.clone();
            let mut shutdown = shutdown_rx;
            tokio::spawn(async move {
                let mut ticker = interval(monitor.config.checkpoint_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // The immediate first tick would duplicate startup state.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => monitor.write_checkpoint().await,
                        _ = shutdown.changed() => break,
                    }
                }
            })
        };

        *self.running.lock() = Some(RunningTasks {
            shutdown_tx,
            poll_handle,
            checkpoint_handle,
        });

        info!(
            games = self.monitored.read().len(),
            poll_interval = ?self.config.poll_interval,
            "🟢 Game monitor started"
        );
        Ok(())
    }

    /// Signal shutdown, let any in-flight cycle finish, then write the final
    /// checkpoint so there is no gap between processed events and recovery state.
    pub async fn stop(&self) {
        let Some(tasks) = self.running.lock().take() else {
            return;
        };

        let _ = tasks.shutdown_tx.send(true);
        if let Err(e) = tasks.poll_handle.await {
            warn!("Poll loop terminated abnormally: {}", e);
        }
        if let Err(e) = tasks.checkpoint_handle.await {
            warn!("Checkpoint loop terminated abnormally: {}", e);
        }

        self.write_checkpoint().await;
        info!(stats = %self.stats.lock().summary(), "Game monitor stopped");
    }

    /// Add a game and check it immediately, without waiting for the next tick.
    pub async fn monitor_game(&self, game_id: &str) {
        let inserted = self.monitored.write().insert(game_id.to_string());
        if inserted {
            info!(game_id, "Game added to monitored set");
        }
        let outcome = self.check_game_guarded(game_id).await;
        self.apply_outcome(outcome);
    }

    async fn run_poll_cycle(&self) {
        let games: Vec<String> = self.monitored.read().iter().cloned().collect();
        if games.is_empty() {
            return;
        }

        let started = Instant::now();
        let outcomes = join_all(games.iter().map(|g| self.check_game_guarded(g))).await;
        for outcome in outcomes {
            self.apply_outcome(outcome);
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut stats = self.stats.lock();
        stats.record_cycle(elapsed_ms);
        debug!(games = games.len(), elapsed_ms, "Poll cycle complete");
    }

    fn apply_outcome(&self, outcome: GameCheckOutcome) {
        let mut stats = self.stats.lock();
        match outcome {
            GameCheckOutcome::Events(n) => stats.events_processed += n as u64,
            GameCheckOutcome::NoData => stats.games_skipped += 1,
            GameCheckOutcome::Failed => stats.games_failed += 1,
        }
    }

    /// One game's check under its own failure boundary and time budget.
    async fn check_game_guarded(&self, game_id: &str) -> GameCheckOutcome {
        match tokio::time::timeout(self.config.game_check_timeout, self.check_game(game_id)).await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                warn!(game_id, "Game check failed: {:#}", e);
                GameCheckOutcome::Failed
            }
            Err(_) => {
                warn!(
                    game_id,
                    timeout = ?self.config.game_check_timeout,
                    "Game check timed out"
                );
                GameCheckOutcome::Failed
            }
        }
    }

    async fn check_game(&self, game_id: &str) -> Result<GameCheckOutcome> {
        let Some(consensus) = self.consensus.consensus_for_game(game_id).await? else {
            debug!(game_id, "No data yet, nothing to diff");
            return Ok(GameCheckOutcome::NoData);
        };

        let current = consensus.data.clone();
        let previous = self.store.last_game_state(game_id);

        if let Some(prev) = &previous {
            // Finality is monotonic; a regressing reading is never re-diffed.
            if prev.is_final() && !current.is_final() {
                warn!(game_id, source = %current.source, "Ignoring non-final reading for already-final game");
                return Ok(GameCheckOutcome::NoData);
            }
        }

        let events = detect_game_state_changes(previous.as_ref(), &current, Utc::now());
        let count = events.len();
        for event in events {
            self.emit_event(event).await;
        }

        self.store.update_game_state(&current)?;
        Ok(GameCheckOutcome::Events(count))
    }

    /// Persist, buffer, and broadcast one event.
    async fn emit_event(&self, mut event: GameEvent) {
        let envelope = EvidencePayload::GameEvent {
            monitor_version: MONITOR_VERSION.to_string(),
            detected_at: event.timestamp,
            event: event.clone(),
        };
        match self.evidence.put_immutable(&envelope).await {
            Ok(hash) => event.evidence_hash = Some(hash),
            Err(e) => warn!(
                event_id = %event.event_id,
                "Evidence persistence failed for event: {:#}",
                e
            ),
        }

        {
            let mut replay = self.replay.lock();
            replay.push_back(event.clone());
            while replay.len() > self.config.replay_capacity {
                replay.pop_front();
            }
        }

        info!(
            game_id = %event.game_id,
            event_type = event.event_type.as_str(),
            triggered = event.triggered,
            "🎯 Game event detected"
        );

        let listeners: Vec<Arc<dyn GameEventListener>> = self.listeners.read().clone();
        for listener in listeners {
            if let Err(e) = listener.on_event(&event).await {
                warn!(
                    listener = listener.name(),
                    event_id = %event.event_id,
                    "Listener failed, continuing delivery: {:#}",
                    e
                );
            }
        }

        *self.last_processed_event.lock() = Some(event.event_id.clone());
    }

    async fn write_checkpoint(&self) {
        let checkpoint = Checkpoint::new(
            self.last_processed_event.lock().clone(),
            self.monitored_games(),
            self.stats.lock().clone(),
        );

        if let Err(e) = self.store.save_checkpoint(&checkpoint) {
            warn!("Checkpoint store write failed: {:#}", e);
        }
        if let Err(e) = self
            .evidence
            .put_immutable(&EvidencePayload::Checkpoint {
                checkpoint: checkpoint.clone(),
            })
            .await
        {
            warn!("Checkpoint evidence write failed: {:#}", e);
        }

        debug!(
            checkpoint_id = %checkpoint.checkpoint_id,
            games = checkpoint.monitored_games.len(),
            "Checkpoint written"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::InMemoryEvidenceStore;
    use crate::models::{GameStatus, ProcessingStatus, TeamScore};
    use crate::sources::SourceFetcher;
    use crate::store::InMemoryDomainStore;

    fn reading(home: u32, away: u32, is_final: bool, detail: &str) -> GameData {
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
                detailed_state: detail.to_string(),
                is_final,
            },
            timestamp: Utc::now(),
            source: "official".to_string(),
            venue: None,
            inning: None,
        }
    }

    fn event_types(events: &[GameEvent]) -> Vec<GameEventType> {
        events.iter().map(|e| e.event_type).collect()
    }

    #[test]
    fn first_sighting_of_live_game_is_game_start() {
        let now = Utc::now();
        let events = detect_game_state_changes(None, &reading(0, 0, false, "Top 1st"), now);

        assert_eq!(event_types(&events), vec![GameEventType::GameStart]);
        assert!(events[0].triggered);
        assert!(events[0].previous_state.is_none());
        assert_eq!(events[0].processing_status, ProcessingStatus::Pending);
    }

    #[test]
    fn first_sighting_of_final_game_emits_nothing() {
        let now = Utc::now();
        let events = detect_game_state_changes(None, &reading(5, 2, true, "Final"), now);
        assert!(events.is_empty());
    }

    #[test]
    fn score_move_is_exactly_one_score_change() {
        let now = Utc::now();
        let prev = reading(2, 1, false, "Top 7th");
        let cur = reading(3, 1, false, "Top 7th");
        let events = detect_game_state_changes(Some(&prev), &cur, now);

        assert_eq!(event_types(&events), vec![GameEventType::ScoreChange]);
    }

    #[test]
    fn finalization_with_same_scores_is_exactly_one_game_end() {
        let now = Utc::now();
        let prev = reading(3, 1, false, "Bottom 9th");
        let cur = reading(3, 1, true, "Final");
        let events = detect_game_state_changes(Some(&prev), &cur, now);

        assert_eq!(event_types(&events), vec![GameEventType::GameEnd]);
    }

    #[test]
    fn score_and_finalization_in_one_cycle_are_two_events() {
        let now = Utc::now();
        let prev = reading(2, 2, false, "Bottom 9th");
        let cur = reading(3, 2, true, "Final");
        let events = detect_game_state_changes(Some(&prev), &cur, now);

        assert_eq!(
            event_types(&events),
            vec![GameEventType::ScoreChange, GameEventType::GameEnd]
        );
    }

    #[test]
    fn status_detail_drift_is_informational_status_change() {
        let now = Utc::now();
        let prev = reading(2, 1, false, "Top 7th");
        let cur = reading(2, 1, false, "Bottom 7th");
        let events = detect_game_state_changes(Some(&prev), &cur, now);

        assert_eq!(event_types(&events), vec![GameEventType::StatusChange]);
        assert!(!events[0].triggered);
    }

    #[test]
    fn diff_is_deterministic() {
        let now = Utc::now();
        let prev = reading(2, 2, false, "Bottom 9th");
        let cur = reading(3, 2, true, "Final");

        let a = event_types(&detect_game_state_changes(Some(&prev), &cur, now));
        let b = event_types(&detect_game_state_changes(Some(&prev), &cur, now));
        assert_eq!(a, b);
    }

    fn bare_monitor(config: MonitorConfig) -> (Arc<GameMonitor>, Arc<InMemoryDomainStore>) {
        let evidence = Arc::new(InMemoryEvidenceStore::new());
        let fetcher = Arc::new(SourceFetcher::new(Vec::new(), evidence.clone()));
        let consensus = Arc::new(ConsensusEngine::new(fetcher));
        let store = Arc::new(InMemoryDomainStore::new());
        let monitor = Arc::new(GameMonitor::new(consensus, store.clone(), evidence, config));
        (monitor, store)
    }

    #[tokio::test]
    async fn replay_buffer_keeps_only_most_recent_capacity() {
        let (monitor, _) = bare_monitor(MonitorConfig {
            replay_capacity: 3,
            ..Default::default()
        });

        for i in 0..5u32 {
            let event = GameEvent::new(
                GameEventType::ScoreChange,
                None,
                reading(i, 0, false, "live"),
                Utc::now() + chrono::Duration::milliseconds(i as i64),
            );
            monitor.emit_event(event).await;
        }

        let replay = monitor.replay_events();
        assert_eq!(replay.len(), 3);
        let scores: Vec<u32> = replay.iter().map(|e| e.current_state.home.score).collect();
        assert_eq!(scores, vec![2, 3, 4]);
    }

    struct FlakyListener {
        name: &'static str,
        fail: bool,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl GameEventListener for FlakyListener {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_event(&self, event: &GameEvent) -> Result<()> {
            self.seen.lock().push(event.event_id.clone());
            if self.fail {
                bail!("listener exploded");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_listener_does_not_block_peers() {
        let (monitor, _) = bare_monitor(MonitorConfig::default());
        let bad = Arc::new(FlakyListener {
            name: "bad",
            fail: true,
            seen: Mutex::new(Vec::new()),
        });
        let good = Arc::new(FlakyListener {
            name: "good",
            fail: false,
            seen: Mutex::new(Vec::new()),
        });
        monitor.register_listener(bad.clone());
        monitor.register_listener(good.clone());

        let event = GameEvent::new(
            GameEventType::GameEnd,
            None,
            reading(1, 0, true, "Final"),
            Utc::now(),
        );
        monitor.emit_event(event).await;

        assert_eq!(bad.seen.lock().len(), 1);
        assert_eq!(good.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn stop_writes_a_final_checkpoint_with_monitored_set() {
        let (monitor, store) = bare_monitor(MonitorConfig {
            poll_interval: Duration::from_millis(10),
            checkpoint_interval: Duration::from_secs(3600),
            ..Default::default()
        });

        monitor.clone().start().await.unwrap();
        monitor.monitor_game("g1").await;
        monitor.monitor_game("g2").await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        monitor.stop().await;

        assert!(!monitor.is_running());
        let checkpoint = store.latest_checkpoint().unwrap();
        assert_eq!(
            checkpoint.monitored_games,
            vec!["g1".to_string(), "g2".to_string()]
        );
        // With no providers configured every check lands as "no data".
        assert!(checkpoint.stats.games_skipped > 0);
    }

    #[tokio::test]
    async fn start_restores_monitored_set_from_checkpoint() {
        let (monitor, store) = bare_monitor(MonitorConfig {
            poll_interval: Duration::from_secs(3600),
            checkpoint_interval: Duration::from_secs(3600),
            ..Default::default()
        });

        let checkpoint = Checkpoint::new(
            Some("evt-42".to_string()),
            vec!["g7".to_string()],
            MonitorStats::default(),
        );
        store.save_checkpoint(&checkpoint).unwrap();

        monitor.clone().start().await.unwrap();
        assert_eq!(monitor.monitored_games(), vec!["g7".to_string()]);
        monitor.stop().await;
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (monitor, _) = bare_monitor(MonitorConfig {
            poll_interval: Duration::from_secs(3600),
            checkpoint_interval: Duration::from_secs(3600),
            ..Default::default()
        });

        monitor.clone().start().await.unwrap();
        assert!(monitor.clone().start().await.is_err());
        monitor.stop().await;
    }
}
