//! Consensus Reconciliation
//!
//! Reduces the answering sources' readings of one game to a single
//! authoritative state with a confidence score and an auditable rationale.
//! Disagreement is a first-class outcome, never averaged away.

use anyhow::Result;
use std::sync::Arc;
use tracing::{debug, info};

use crate::models::{ConsensusResult, ConsensusStatus, SourceResponse};
use crate::sources::{FetchOptions, SourceFetcher};

/// Confidence assigned when only one source answered.
pub const SINGLE_SOURCE_PRIOR: f64 = 0.60;
/// Base confidence when two sources fully agree.
pub const AGREEMENT_BASE_CONFIDENCE: f64 = 0.90;
/// Added per agreeing source beyond the second.
pub const AGREEMENT_SOURCE_BONUS: f64 = 0.04;
/// Agreement confidence never reaches 1.0.
pub const AGREEMENT_CONFIDENCE_CAP: f64 = 0.98;
/// Hard cap under disagreement, strictly below the approval threshold.
pub const DISAGREEMENT_CONFIDENCE_CAP: f64 = 0.50;

pub struct ConsensusEngine {
    fetcher: Arc<SourceFetcher>,
}

impl ConsensusEngine {
    pub fn new(fetcher: Arc<SourceFetcher>) -> Self {
        Self { fetcher }
    }

    /// Consensus for a validation call. `None` means no source answered:
    /// "no data yet", which callers must not conflate with NeedsReview.
    pub async fn consensus_for_promotion(
        &self,
        promotion_id: &str,
        game_id: &str,
    ) -> Result<Option<ConsensusResult>> {
        let result = self.consensus_for_game(game_id).await?;
        if let Some(r) = &result {
            debug!(
                promotion_id,
                game_id,
                status = r.status.as_str(),
                confidence = r.confidence,
                "Consensus computed for promotion"
            );
        }
        Ok(result)
    }

    pub async fn consensus_for_game(&self, game_id: &str) -> Result<Option<ConsensusResult>> {
        let report = self
            .fetcher
            .get_game_data(game_id, &FetchOptions::default())
            .await;

        if !report.success {
            debug!(
                game_id,
                error = report.error.as_deref().unwrap_or(""),
                "No data yet, consensus unavailable"
            );
            return Ok(None);
        }

        let result = Self::reconcile(game_id, &report.sources, report.evidence_hash.clone());
        if result.requires_reconciliation {
            info!(
                game_id,
                rationale = %result.decision_rationale,
                "Sources disagree, consensus flagged for review"
            );
        }
        Ok(Some(result))
    }

    /// Pure reconciliation policy over the answering sources.
    ///
    /// Callers guarantee `sources` is non-empty and priority-sorted; the
    /// highest-priority reading is the one carried in the result.
    pub fn reconcile(
        game_id: &str,
        sources: &[SourceResponse],
        evidence_hash: Option<String>,
    ) -> ConsensusResult {
        debug_assert!(!sources.is_empty());

        let chosen = sources[0].data.clone();
        let names: Vec<&str> = sources.iter().map(|s| s.source()).collect();

        if sources.len() == 1 {
            let rationale = format!(
                "single source {} answered ({}); provisional at single-source prior {:.2}",
                names[0],
                describe_reading(&sources[0]),
                SINGLE_SOURCE_PRIOR
            );
            return ConsensusResult {
                game_id: game_id.to_string(),
                status: ConsensusStatus::Provisional,
                confidence: SINGLE_SOURCE_PRIOR,
                data: chosen,
                evidence_hash,
                decision_rationale: rationale,
                requires_reconciliation: false,
            };
        }

        let all_agree = sources[1..]
            .iter()
            .all(|s| s.data.agrees_with(&sources[0].data));

        if all_agree {
            let extra = sources.len().saturating_sub(2) as f64;
            let confidence =
                (AGREEMENT_BASE_CONFIDENCE + AGREEMENT_SOURCE_BONUS * extra).min(AGREEMENT_CONFIDENCE_CAP);
            let rationale = format!(
                "{} sources ({}) agree on {}; confirmed",
                sources.len(),
                names.join(", "),
                describe_reading(&sources[0])
            );
            ConsensusResult {
                game_id: game_id.to_string(),
                status: ConsensusStatus::Confirmed,
                confidence,
                data: chosen,
                evidence_hash,
                decision_rationale: rationale,
                requires_reconciliation: false,
            }
        } else {
            let claims: Vec<String> = sources
                .iter()
                .map(|s| format!("{} reports {}", s.source(), describe_reading(s)))
                .collect();
            let rationale = format!(
                "sources disagree on score or finality: {}; needs review, confidence capped at {:.2}",
                claims.join("; "),
                DISAGREEMENT_CONFIDENCE_CAP
            );
            ConsensusResult {
                game_id: game_id.to_string(),
                status: ConsensusStatus::NeedsReview,
                confidence: DISAGREEMENT_CONFIDENCE_CAP,
                data: chosen,
                evidence_hash,
                decision_rationale: rationale,
                requires_reconciliation: true,
            }
        }
    }
}

fn describe_reading(source: &SourceResponse) -> String {
    let (home, away) = source.data.scores();
    format!(
        "{}-{} {}",
        home,
        away,
        if source.data.is_final() { "final" } else { "in play" }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::InMemoryEvidenceStore;
    use crate::models::{GameData, GameStatus, TeamScore};
    use crate::validation::APPROVAL_CONFIDENCE_THRESHOLD;
    use chrono::Utc;

    fn response(source: &str, home: u32, away: u32, is_final: bool) -> SourceResponse {
        SourceResponse {
            data: GameData {
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
            },
            fetched_at: Utc::now(),
            response_time_ms: 12,
            etag: None,
            last_modified: None,
        }
    }

    #[test]
    fn single_source_is_provisional_below_certainty() {
        let result = ConsensusEngine::reconcile("g1", &[response("official", 2, 1, false)], None);

        assert_eq!(result.status, ConsensusStatus::Provisional);
        assert_eq!(result.confidence, SINGLE_SOURCE_PRIOR);
        assert!(result.confidence < 1.0);
        assert!(!result.requires_reconciliation);
        assert!(result.decision_rationale.contains("official"));
    }

    #[test]
    fn two_agreeing_sources_confirm() {
        let sources = vec![
            response("official", 3, 1, true),
            response("sportsfeed", 3, 1, true),
        ];
        let result = ConsensusEngine::reconcile("g1", &sources, Some("abc".to_string()));

        assert_eq!(result.status, ConsensusStatus::Confirmed);
        assert_eq!(result.confidence, AGREEMENT_BASE_CONFIDENCE);
        assert_eq!(result.evidence_hash.as_deref(), Some("abc"));
        assert!(result.decision_rationale.contains("agree"));
    }

    #[test]
    fn more_agreeing_sources_raise_confidence_toward_cap() {
        let two = ConsensusEngine::reconcile(
            "g1",
            &[
                response("official", 3, 1, true),
                response("sportsfeed", 3, 1, true),
            ],
            None,
        );
        let three = ConsensusEngine::reconcile(
            "g1",
            &[
                response("official", 3, 1, true),
                response("sportsfeed", 3, 1, true),
                response("scorepanel", 3, 1, true),
            ],
            None,
        );

        assert!(three.confidence > two.confidence);
        assert!(three.confidence <= AGREEMENT_CONFIDENCE_CAP);
    }

    #[test]
    fn score_disagreement_forces_review_below_approval_threshold() {
        let sources = vec![
            response("official", 3, 1, true),
            response("scorepanel", 2, 1, true),
        ];
        let result = ConsensusEngine::reconcile("g1", &sources, None);

        assert_eq!(result.status, ConsensusStatus::NeedsReview);
        assert!(result.requires_reconciliation);
        assert!(result.confidence < APPROVAL_CONFIDENCE_THRESHOLD);
        assert!(result.decision_rationale.contains("disagree"));
    }

    #[test]
    fn finality_disagreement_also_forces_review() {
        let sources = vec![
            response("official", 3, 1, true),
            response("sportsfeed", 3, 1, false),
        ];
        let result = ConsensusEngine::reconcile("g1", &sources, None);

        assert_eq!(result.status, ConsensusStatus::NeedsReview);
        assert!(result.requires_reconciliation);
    }

    #[test]
    fn chosen_reading_is_highest_priority_source() {
        let sources = vec![
            response("official", 3, 1, true),
            response("scorepanel", 2, 1, true),
        ];
        let result = ConsensusEngine::reconcile("g1", &sources, None);
        assert_eq!(result.data.source, "official");
    }

    #[tokio::test]
    async fn no_answering_sources_means_no_consensus() {
        let evidence = Arc::new(InMemoryEvidenceStore::new());
        let fetcher = Arc::new(SourceFetcher::new(Vec::new(), evidence));
        let engine = ConsensusEngine::new(fetcher);

        let result = engine.consensus_for_game("g1").await.unwrap();
        assert!(result.is_none());
    }
}
