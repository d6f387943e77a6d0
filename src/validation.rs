//! Promotion Trigger Validation
//!
//! Turns a consensus state into an auditable approve/deny decision per
//! promotion. The surface is infallible: every internal failure produces a
//! terminal failed validation with a persisted failure-evidence record, never
//! a silently dropped request.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::consensus::ConsensusEngine;
use crate::evidence::{EvidencePayload, EvidenceStore};
use crate::models::{
    ConsensusResult, ConsensusStatus, GameData, GameEvent, PromotionValidation, TriggerCondition,
    DEALPULSE_UUID_NAMESPACE,
};
use crate::monitor::GameEventListener;
use crate::store::{DomainStore, TriggerDispatcher};

/// Fixed approval bar for provisional consensus. A named constant, not
/// per-call configurable, so audit rationale stays comparable over time.
pub const APPROVAL_CONFIDENCE_THRESHOLD: f64 = 0.8;

pub struct ValidationService {
    consensus: Arc<ConsensusEngine>,
    store: Arc<dyn DomainStore>,
    evidence: Arc<dyn EvidenceStore>,
}

struct PolicyOutcome {
    is_valid: bool,
    requires_manual_review: bool,
    confidence: f64,
    rationale: String,
}

impl ValidationService {
    pub fn new(
        consensus: Arc<ConsensusEngine>,
        store: Arc<dyn DomainStore>,
        evidence: Arc<dyn EvidenceStore>,
    ) -> Self {
        Self {
            consensus,
            store,
            evidence,
        }
    }

    /// Deterministic idempotency key for (promotion, game). Deduplication of
    /// repeated calls is the caller's responsibility.
    pub fn idempotency_key(promotion_id: &str, game_id: &str) -> String {
        Uuid::new_v5(
            &DEALPULSE_UUID_NAMESPACE,
            format!("validation:{}:{}", promotion_id, game_id).as_bytes(),
        )
        .to_string()
    }

    pub async fn validate_promotion_trigger(
        &self,
        promotion_id: &str,
        game_id: &str,
        trigger: &TriggerCondition,
    ) -> PromotionValidation {
        let validation_id = Self::idempotency_key(promotion_id, game_id);

        match self.try_validate(&validation_id, promotion_id, game_id, trigger).await {
            Ok(validation) => validation,
            Err(e) => {
                let error = format!("{:#}", e);
                warn!(promotion_id, game_id, "Validation failed terminally: {}", error);
                self.failed_result(validation_id, promotion_id, game_id, error)
                    .await
            }
        }
    }

    /// Fan out across every promotion configured for the game's team.
    /// Settle-all: one promotion's problem never removes the others' results.
    pub async fn validate_promotions_for_game(&self, game_id: &str) -> Vec<PromotionValidation> {
        let Some(team_id) = self.store.team_for_game(game_id) else {
            warn!(game_id, "No team on record for game, nothing to validate");
            return Vec::new();
        };

        let promotions = self.store.promotions_for_team(&team_id);
        if promotions.is_empty() {
            debug!(game_id, team_id = %team_id, "No promotions configured");
            return Vec::new();
        }

        join_all(
            promotions
                .iter()
                .map(|p| self.validate_promotion_trigger(&p.id, game_id, &p.trigger)),
        )
        .await
    }

    async fn try_validate(
        &self,
        validation_id: &str,
        promotion_id: &str,
        game_id: &str,
        trigger: &TriggerCondition,
    ) -> Result<PromotionValidation> {
        let promotion = self
            .store
            .promotion(promotion_id)
            .with_context(|| format!("promotion {} not found", promotion_id))?;

        let consensus = self
            .consensus
            .consensus_for_promotion(promotion_id, game_id)
            .await
            .context("consensus engine error")?;

        let outcome = match &consensus {
            Some(c) => apply_policy(trigger, c),
            // No source answered: not reviewable disagreement, just no data yet.
            None => PolicyOutcome {
                is_valid: false,
                requires_manual_review: false,
                confidence: 0.0,
                rationale: format!("no source data yet for game {}; cannot evaluate", game_id),
            },
        };

        let consensus_evidence = consensus.as_ref().and_then(|c| c.evidence_hash.clone());

        let payload = EvidencePayload::Validation {
            validation_id: validation_id.to_string(),
            promotion_id: promotion_id.to_string(),
            game_id: game_id.to_string(),
            consensus_evidence: consensus_evidence.clone(),
            is_valid: outcome.is_valid,
            confidence: outcome.confidence,
            rationale: outcome.rationale.clone(),
            error: None,
        };

        // Two-link lineage: consensus evidence, then this decision's record.
        let mut evidence_chain = Vec::new();
        if let Some(hash) = consensus_evidence {
            evidence_chain.push(hash);
        }
        match self.evidence.put_immutable(&payload).await {
            Ok(hash) => evidence_chain.push(hash),
            Err(e) => warn!(validation_id, "Evidence persistence failed for validation: {:#}", e),
        }

        if outcome.is_valid {
            info!(
                promotion_id,
                game_id,
                confidence = outcome.confidence,
                "Promotion trigger approved"
            );
        }

        Ok(PromotionValidation {
            validation_id: validation_id.to_string(),
            promotion_id: promotion_id.to_string(),
            game_id: game_id.to_string(),
            team_id: Some(promotion.team_id),
            is_valid: outcome.is_valid,
            confidence: outcome.confidence,
            evidence_chain,
            requires_manual_review: outcome.requires_manual_review,
            rationale: outcome.rationale,
            validated_at: Utc::now(),
        })
    }

    async fn failed_result(
        &self,
        validation_id: String,
        promotion_id: &str,
        game_id: &str,
        error: String,
    ) -> PromotionValidation {
        let rationale = format!("validation failed: {}", error);

        let payload = EvidencePayload::Validation {
            validation_id: validation_id.clone(),
            promotion_id: promotion_id.to_string(),
            game_id: game_id.to_string(),
            consensus_evidence: None,
            is_valid: false,
            confidence: 0.0,
            rationale: rationale.clone(),
            error: Some(error),
        };

        let mut evidence_chain = Vec::new();
        match self.evidence.put_immutable(&payload).await {
            Ok(hash) => evidence_chain.push(hash),
            Err(e) => warn!(
                validation_id = %validation_id,
                "Evidence persistence failed for failure record: {:#}",
                e
            ),
        }

        PromotionValidation {
            validation_id,
            promotion_id: promotion_id.to_string(),
            game_id: game_id.to_string(),
            team_id: None,
            is_valid: false,
            confidence: 0.0,
            evidence_chain,
            requires_manual_review: true,
            rationale,
            validated_at: Utc::now(),
        }
    }
}

/// Fixed approval policy over a consensus result plus the trigger condition.
fn apply_policy(trigger: &TriggerCondition, consensus: &ConsensusResult) -> PolicyOutcome {
    let (policy_pass, policy_why) = match consensus.status {
        ConsensusStatus::Confirmed => (true, "consensus confirmed".to_string()),
        ConsensusStatus::Provisional => {
            if consensus.confidence >= APPROVAL_CONFIDENCE_THRESHOLD {
                (
                    true,
                    format!(
                        "provisional consensus at {:.2} meets approval threshold {:.2}",
                        consensus.confidence, APPROVAL_CONFIDENCE_THRESHOLD
                    ),
                )
            } else {
                (
                    false,
                    format!(
                        "provisional consensus at {:.2} below approval threshold {:.2}",
                        consensus.confidence, APPROVAL_CONFIDENCE_THRESHOLD
                    ),
                )
            }
        }
        ConsensusStatus::NeedsReview => (
            false,
            "consensus needs review; auto-approval disabled".to_string(),
        ),
    };

    let condition_met = trigger_satisfied(trigger, &consensus.data);
    let is_valid = policy_pass && condition_met;

    // A denied policy gate always goes to a human; a clean "condition not
    // met" under approvable consensus is an ordinary negative.
    let requires_manual_review = !policy_pass;

    let rationale = format!(
        "{} | trigger '{}' {} | {}",
        policy_why,
        trigger.describe(),
        if condition_met { "satisfied" } else { "not satisfied" },
        consensus.decision_rationale
    );

    PolicyOutcome {
        is_valid,
        requires_manual_review,
        confidence: consensus.confidence,
        rationale,
    }
}

fn trigger_satisfied(trigger: &TriggerCondition, data: &GameData) -> bool {
    match trigger {
        TriggerCondition::GameEnd => data.is_final(),
        TriggerCondition::TeamWin { team_id } => {
            if !data.is_final() {
                return false;
            }
            let (home, away) = data.scores();
            if home > away {
                data.home.id == *team_id
            } else if away > home {
                data.away.id == *team_id
            } else {
                false
            }
        }
        TriggerCondition::ScoreReached { team_id, min_score } => {
            (data.home.id == *team_id && data.home.score >= *min_score)
                || (data.away.id == *team_id && data.away.score >= *min_score)
        }
    }
}

/// Connects monitor events to validation and dispatch: on every triggering
/// event, validate the game's promotions and hand approved ones to the
/// dispatcher.
pub struct TriggerPipeline {
    validation: Arc<ValidationService>,
    dispatcher: Arc<dyn TriggerDispatcher>,
}

impl TriggerPipeline {
    pub fn new(validation: Arc<ValidationService>, dispatcher: Arc<dyn TriggerDispatcher>) -> Self {
        Self {
            validation,
            dispatcher,
        }
    }
}

#[async_trait]
impl GameEventListener for TriggerPipeline {
    fn name(&self) -> &str {
        "trigger-pipeline"
    }

    async fn on_event(&self, event: &GameEvent) -> Result<()> {
        if !event.triggered {
            return Ok(());
        }

        let results = self.validation.validate_promotions_for_game(&event.game_id).await;
        for validation in results {
            if validation.is_valid {
                if let Err(e) = self.dispatcher.dispatch(&validation).await {
                    warn!(
                        validation_id = %validation.validation_id,
                        "Dispatch failed: {:#}",
                        e
                    );
                }
            } else {
                debug!(
                    promotion_id = %validation.promotion_id,
                    game_id = %validation.game_id,
                    rationale = %validation.rationale,
                    "Promotion not approved"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::InMemoryEvidenceStore;
    use crate::models::{GameStatus, Promotion, TeamScore};
    use crate::sources::SourceFetcher;
    use crate::store::InMemoryDomainStore;

    fn reading(home: u32, away: u32, is_final: bool) -> GameData {
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
            source: "official".to_string(),
            venue: None,
            inning: None,
        }
    }

    fn consensus_with(status: ConsensusStatus, confidence: f64, data: GameData) -> ConsensusResult {
        ConsensusResult {
            game_id: "g1".to_string(),
            status,
            confidence,
            data,
            evidence_hash: Some("bundle-hash".to_string()),
            decision_rationale: "test consensus".to_string(),
            requires_reconciliation: matches!(status, ConsensusStatus::NeedsReview),
        }
    }

    #[test]
    fn idempotency_key_is_deterministic() {
        let a = ValidationService::idempotency_key("p1", "g1");
        let b = ValidationService::idempotency_key("p1", "g1");
        let c = ValidationService::idempotency_key("p2", "g1");

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn confirmed_consensus_approves_when_condition_holds() {
        let consensus = consensus_with(ConsensusStatus::Confirmed, 0.95, reading(4, 2, true));
        let outcome = apply_policy(&TriggerCondition::GameEnd, &consensus);

        assert!(outcome.is_valid);
        assert!(!outcome.requires_manual_review);
        assert_eq!(outcome.confidence, 0.95);
    }

    #[test]
    fn low_confidence_provisional_is_denied_with_manual_review() {
        let consensus = consensus_with(ConsensusStatus::Provisional, 0.5, reading(4, 2, true));
        let outcome = apply_policy(&TriggerCondition::GameEnd, &consensus);

        assert!(!outcome.is_valid);
        assert!(outcome.requires_manual_review);
        assert!(outcome.rationale.contains("below approval threshold"));
    }

    #[test]
    fn high_confidence_provisional_is_approvable() {
        let consensus = consensus_with(ConsensusStatus::Provisional, 0.85, reading(4, 2, true));
        let outcome = apply_policy(&TriggerCondition::GameEnd, &consensus);
        assert!(outcome.is_valid);
    }

    #[test]
    fn needs_review_never_auto_approves() {
        // Even a nominally high confidence must not override the status gate.
        let consensus = consensus_with(ConsensusStatus::NeedsReview, 0.79, reading(4, 2, true));
        let outcome = apply_policy(&TriggerCondition::GameEnd, &consensus);

        assert!(!outcome.is_valid);
        assert!(outcome.requires_manual_review);
    }

    #[test]
    fn unmet_condition_is_a_clean_negative() {
        let consensus = consensus_with(ConsensusStatus::Confirmed, 0.9, reading(2, 4, true));
        let outcome = apply_policy(
            &TriggerCondition::TeamWin {
                team_id: "t-home".to_string(),
            },
            &consensus,
        );

        assert!(!outcome.is_valid);
        assert!(!outcome.requires_manual_review);
        assert!(outcome.rationale.contains("not satisfied"));
    }

    #[test]
    fn team_win_requires_finality_and_the_right_winner() {
        let home_win = reading(4, 2, true);
        let in_play = reading(4, 2, false);
        let tie = reading(3, 3, true);
        let trigger = TriggerCondition::TeamWin {
            team_id: "t-home".to_string(),
        };

        assert!(trigger_satisfied(&trigger, &home_win));
        assert!(!trigger_satisfied(&trigger, &in_play));
        assert!(!trigger_satisfied(&trigger, &tie));
        assert!(!trigger_satisfied(
            &TriggerCondition::TeamWin {
                team_id: "t-away".to_string()
            },
            &home_win
        ));
    }

    #[test]
    fn score_reached_checks_the_named_side() {
        let data = reading(5, 2, false);
        let trigger = TriggerCondition::ScoreReached {
            team_id: "t-home".to_string(),
            min_score: 5,
        };
        assert!(trigger_satisfied(&trigger, &data));
        assert!(!trigger_satisfied(
            &TriggerCondition::ScoreReached {
                team_id: "t-away".to_string(),
                min_score: 5
            },
            &data
        ));
    }

    fn bare_service() -> (ValidationService, Arc<InMemoryDomainStore>, Arc<InMemoryEvidenceStore>) {
        let evidence = Arc::new(InMemoryEvidenceStore::new());
        let fetcher = Arc::new(SourceFetcher::new(Vec::new(), evidence.clone()));
        let consensus = Arc::new(ConsensusEngine::new(fetcher));
        let store = Arc::new(InMemoryDomainStore::new());
        (
            ValidationService::new(consensus, store.clone(), evidence.clone()),
            store,
            evidence,
        )
    }

    #[tokio::test]
    async fn unknown_promotion_yields_terminal_failed_result() {
        let (service, _, evidence) = bare_service();

        let result = service
            .validate_promotion_trigger("missing", "g1", &TriggerCondition::GameEnd)
            .await;

        assert!(!result.is_valid);
        assert_eq!(result.confidence, 0.0);
        assert!(result.requires_manual_review);
        assert!(result.rationale.contains("not found"));
        // The failure itself is evidence.
        assert_eq!(evidence.len(), 1);
        assert_eq!(result.evidence_chain.len(), 1);
    }

    #[tokio::test]
    async fn no_source_data_is_not_flagged_for_review() {
        let (service, store, _) = bare_service();
        store.seed_promotion(Promotion {
            id: "p1".to_string(),
            team_id: "t-home".to_string(),
            title: "Free tacos".to_string(),
            trigger: TriggerCondition::GameEnd,
        });

        let result = service
            .validate_promotion_trigger("p1", "g1", &TriggerCondition::GameEnd)
            .await;

        assert!(!result.is_valid);
        assert!(!result.requires_manual_review);
        assert!(result.rationale.contains("no source data yet"));
    }

    #[tokio::test]
    async fn game_without_team_validates_nothing() {
        let (service, _, _) = bare_service();
        let results = service.validate_promotions_for_game("g-unknown").await;
        assert!(results.is_empty());
    }
}
