//! Multi-Source Fetch Layer
//!
//! Queries every configured provider concurrently with a settle-all join; a
//! provider's failure degrades that provider only. Gating order per provider:
//! token bucket first (exhaustion short-circuits without touching the network
//! or the breaker), then the provider's own circuit breaker.

use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::evidence::{EvidencePayload, EvidenceStore, SourceEvidence};
use crate::models::{GameData, SourceResponse};
use crate::resilience::{
    BreakerError, BreakerRegistry, BreakerStats, CircuitBreaker, RateLimiter,
};
use crate::sources::provider::{
    CacheValidators, GameDataProvider, ProviderError, ProviderFetch,
};

/// Per-call fetch knobs.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    /// Attach cached etag/last-modified validators when present.
    pub use_conditional_request: bool,
    /// Optional caller budget applied inside the breaker, on top of the
    /// provider's own call timeout.
    pub timeout: Option<Duration>,
    pub skip_rate_limit: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            use_conditional_request: true,
            timeout: None,
            skip_rate_limit: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFailureKind {
    RateLimited,
    BreakerOpen,
    Timeout,
    Upstream,
    DataShape,
}

/// One provider's failure inside a fan-out, for diagnostics and error text.
#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub source: String,
    pub kind: SourceFailureKind,
    pub detail: String,
}

/// Result of one multi-source fetch.
#[derive(Debug, Clone)]
pub struct FetchReport {
    /// True iff at least one provider returned data.
    pub success: bool,
    /// Headline reading: the highest-priority answering provider.
    pub data: Option<GameData>,
    pub sources: Vec<SourceResponse>,
    /// Hash of the persisted multi-source bundle, when persistence succeeded.
    pub evidence_hash: Option<String>,
    pub error: Option<String>,
    /// Providers that answered 304: no new data, not a failure.
    pub not_modified: Vec<String>,
    pub failures: Vec<SourceFailure>,
}

struct ProviderSlot {
    provider: Arc<dyn GameDataProvider>,
    breaker: Arc<CircuitBreaker>,
    limiter: RateLimiter,
    priority: u8,
}

enum SourceOutcome {
    Fetched {
        response: SourceResponse,
        raw: serde_json::Value,
    },
    NotModified {
        source: String,
    },
    Failed(SourceFailure),
}

pub struct SourceFetcher {
    slots: Vec<ProviderSlot>,
    breakers: Arc<BreakerRegistry>,
    /// Conditional-request validators keyed (provider, game), last-write-wins.
    validators: RwLock<HashMap<(String, String), CacheValidators>>,
    evidence: Arc<dyn EvidenceStore>,
}

impl SourceFetcher {
    pub fn new(providers: Vec<Arc<dyn GameDataProvider>>, evidence: Arc<dyn EvidenceStore>) -> Self {
        let breakers = Arc::new(BreakerRegistry::new());
        let mut slots: Vec<ProviderSlot> = providers
            .into_iter()
            .map(|provider| {
                let profile = provider.profile();
                ProviderSlot {
                    breaker: breakers.get_or_create(provider.name(), profile.breaker),
                    limiter: RateLimiter::new(profile.rate_limit),
                    priority: profile.priority,
                    provider,
                }
            })
            .collect();
        slots.sort_by_key(|s| s.priority);

        Self {
            slots,
            breakers,
            validators: RwLock::new(HashMap::new()),
            evidence,
        }
    }

    pub fn breaker_stats(&self) -> Vec<BreakerStats> {
        self.breakers.all_stats()
    }

    pub fn breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name)
    }

    /// Fetch one game from every provider and bundle the answers as evidence.
    pub async fn get_game_data(&self, game_id: &str, options: &FetchOptions) -> FetchReport {
        let outcomes = join_all(
            self.slots
                .iter()
                .map(|slot| self.fetch_one(slot, game_id, options)),
        )
        .await;

        let mut sources = Vec::new();
        let mut bundle = Vec::new();
        let mut not_modified = Vec::new();
        let mut failures = Vec::new();

        // join_all preserves slot order, so `sources` stays priority-sorted.
        for outcome in outcomes {
            match outcome {
                SourceOutcome::Fetched { response, raw } => {
                    bundle.push(SourceEvidence {
                        source: response.source().to_string(),
                        raw,
                        normalized: response.data.clone(),
                        response_time_ms: response.response_time_ms,
                    });
                    sources.push(response);
                }
                SourceOutcome::NotModified { source } => not_modified.push(source),
                SourceOutcome::Failed(failure) => {
                    debug!(
                        source = %failure.source,
                        kind = ?failure.kind,
                        detail = %failure.detail,
                        "Source failed"
                    );
                    failures.push(failure);
                }
            }
        }

        let evidence_hash = if sources.is_empty() {
            None
        } else {
            let payload = EvidencePayload::SourceBundle {
                game_id: game_id.to_string(),
                fetched_at: Utc::now(),
                sources: bundle,
            };
            match self.evidence.put_immutable(&payload).await {
                Ok(hash) => Some(hash),
                Err(e) => {
                    warn!(game_id, "Evidence persistence failed for source bundle: {:#}", e);
                    None
                }
            }
        };

        let success = !sources.is_empty();
        let data = sources.first().map(|s| s.data.clone());

        let error = if success {
            None
        } else {
            let mut parts: Vec<String> = Vec::new();
            if !not_modified.is_empty() {
                parts.push(format!("{} source(s) had no new data", not_modified.len()));
            }
            for f in &failures {
                parts.push(format!("{}: {}", f.source, f.detail));
            }
            if parts.is_empty() {
                parts.push("no providers configured".to_string());
            }
            Some(format!(
                "no source returned data for game {} ({})",
                game_id,
                parts.join("; ")
            ))
        };

        if !success {
            warn!(game_id, error = error.as_deref().unwrap_or(""), "Fetch produced no data");
        }

        FetchReport {
            success,
            data,
            sources,
            evidence_hash,
            error,
            not_modified,
            failures,
        }
    }

    async fn fetch_one(
        &self,
        slot: &ProviderSlot,
        game_id: &str,
        options: &FetchOptions,
    ) -> SourceOutcome {
        let name = slot.provider.name();

        if !options.skip_rate_limit {
            let decision = slot.limiter.consume();
            if !decision.allowed {
                return SourceOutcome::Failed(SourceFailure {
                    source: name.to_string(),
                    kind: SourceFailureKind::RateLimited,
                    detail: format!(
                        "rate limited, retry in {:?}",
                        decision.retry_after.unwrap_or_default()
                    ),
                });
            }
        }

        let validators = if options.use_conditional_request {
            self.validators
                .read()
                .get(&(name.to_string(), game_id.to_string()))
                .cloned()
        } else {
            None
        };

        let caller_budget = options.timeout;
        let started = Instant::now();

        let result = slot
            .breaker
            .execute(async {
                let fut = slot.provider.fetch(game_id, validators.as_ref());
                match caller_budget {
                    Some(budget) => match tokio::time::timeout(budget, fut).await {
                        Ok(r) => r.map_err(anyhow::Error::from),
                        Err(_) => Err(anyhow::anyhow!("caller budget {:?} exceeded", budget)),
                    },
                    None => fut.await.map_err(anyhow::Error::from),
                }
            })
            .await;

        let response_time_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(ProviderFetch::Fresh(payload)) => {
                if payload.etag.is_some() || payload.last_modified.is_some() {
                    self.validators.write().insert(
                        (name.to_string(), game_id.to_string()),
                        CacheValidators {
                            etag: payload.etag.clone(),
                            last_modified: payload.last_modified.clone(),
                        },
                    );
                }
                SourceOutcome::Fetched {
                    response: SourceResponse {
                        data: payload.data,
                        fetched_at: Utc::now(),
                        response_time_ms,
                        etag: payload.etag,
                        last_modified: payload.last_modified,
                    },
                    raw: payload.raw,
                }
            }
            Ok(ProviderFetch::NotModified) => {
                debug!(source = name, game_id, "Not modified, no new data");
                SourceOutcome::NotModified {
                    source: name.to_string(),
                }
            }
            Err(BreakerError::Open { retry_in, .. }) => SourceOutcome::Failed(SourceFailure {
                source: name.to_string(),
                kind: SourceFailureKind::BreakerOpen,
                detail: format!("circuit open, retry in {:?}", retry_in),
            }),
            Err(BreakerError::Timeout { after, .. }) => SourceOutcome::Failed(SourceFailure {
                source: name.to_string(),
                kind: SourceFailureKind::Timeout,
                detail: format!("timed out after {:?}", after),
            }),
            Err(BreakerError::Inner(e)) => {
                let kind = match e.downcast_ref::<ProviderError>() {
                    Some(ProviderError::DataShape { .. }) => SourceFailureKind::DataShape,
                    _ => SourceFailureKind::Upstream,
                };
                SourceOutcome::Failed(SourceFailure {
                    source: name.to_string(),
                    kind,
                    detail: format!("{:#}", e),
                })
            }
        }
    }
}
