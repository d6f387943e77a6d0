//! Upstream Game Data Providers
//!
//! Three independent read-only HTTP/JSON feeds, one schema each. Every
//! provider normalizes its payload into canonical [`GameData`]; an absent
//! competition/team block is a data-shape failure for that provider only.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;

use crate::models::{GameData, GameStatus, TeamScore};
use crate::resilience::{BreakerConfig, RateLimitConfig};

pub const OFFICIAL_SOURCE: &str = "official";
pub const SPORTSFEED_SOURCE: &str = "sportsfeed";
pub const SCOREPANEL_SOURCE: &str = "scorepanel";

/// Per-provider resilience budgets. The authoritative official feed gets the
/// loosest breaker, the aggregator the strictest.
#[derive(Debug, Clone, Copy)]
pub struct ProviderProfile {
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    /// Lower sorts first when picking the headline reading of a fetch.
    pub priority: u8,
}

/// Cached conditional-request validators for one (provider, game) pair.
#[derive(Debug, Clone, Default)]
pub struct CacheValidators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Provider-level failure taxonomy.
#[derive(Debug)]
pub enum ProviderError {
    /// Network error, timeout at the transport, or a non-success status.
    Upstream { detail: String },
    /// Payload parsed but is malformed or missing required blocks.
    DataShape { detail: String },
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Upstream { detail } => write!(f, "upstream unavailable: {}", detail),
            ProviderError::DataShape { detail } => write!(f, "data shape error: {}", detail),
        }
    }
}

impl std::error::Error for ProviderError {}

/// A provider's raw payload together with its normalized reading.
#[derive(Debug, Clone)]
pub struct ProviderPayload {
    pub raw: serde_json::Value,
    pub data: GameData,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Outcome of one provider call. `NotModified` is a distinguished non-error:
/// it never counts against the provider's breaker.
#[derive(Debug, Clone)]
pub enum ProviderFetch {
    Fresh(ProviderPayload),
    NotModified,
}

#[async_trait]
pub trait GameDataProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn profile(&self) -> ProviderProfile;
    async fn fetch(
        &self,
        game_id: &str,
        validators: Option<&CacheValidators>,
    ) -> Result<ProviderFetch, ProviderError>;
}

fn build_client(timeout: Duration, bearer: Option<&str>) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(4)
        .tcp_keepalive(Duration::from_secs(60));

    if let Some(key) = bearer {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", key).parse().context("Invalid api key")?,
        );
        builder = builder.default_headers(headers);
    }

    builder.build().context("Failed to build HTTP client")
}

fn attach_validators(
    mut req: reqwest::RequestBuilder,
    validators: Option<&CacheValidators>,
) -> reqwest::RequestBuilder {
    if let Some(v) = validators {
        if let Some(etag) = &v.etag {
            req = req.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(lm) = &v.last_modified {
            req = req.header(reqwest::header::IF_MODIFIED_SINCE, lm);
        }
    }
    req
}

fn header_string(resp: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// Shared GET path: conditional request handling, status mapping, raw JSON body.
async fn get_json(
    client: &Client,
    url: &str,
    query: &[(&str, &str)],
    validators: Option<&CacheValidators>,
) -> Result<Option<(serde_json::Value, Option<String>, Option<String>)>, ProviderError> {
    let req = attach_validators(client.get(url).query(query), validators);

    let resp = req.send().await.map_err(|e| ProviderError::Upstream {
        detail: format!("GET {} failed: {}", url, e),
    })?;

    if resp.status() == StatusCode::NOT_MODIFIED {
        return Ok(None);
    }

    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        return Err(ProviderError::Upstream {
            detail: format!("GET {} {}: {}", url, status, body),
        });
    }

    let etag = header_string(&resp, reqwest::header::ETAG);
    let last_modified = header_string(&resp, reqwest::header::LAST_MODIFIED);

    let raw = resp
        .json::<serde_json::Value>()
        .await
        .map_err(|e| ProviderError::DataShape {
            detail: format!("invalid JSON from {}: {}", url, e),
        })?;

    Ok(Some((raw, etag, last_modified)))
}

// =============================================================================
// OFFICIAL LEAGUE FEED
// =============================================================================

#[derive(Debug, Deserialize)]
struct OfficialGame {
    teams: Option<OfficialTeams>,
    status: Option<OfficialStatus>,
    venue: Option<OfficialVenue>,
    #[serde(rename = "currentInning")]
    current_inning: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct OfficialTeams {
    home: OfficialTeamEntry,
    away: OfficialTeamEntry,
}

#[derive(Debug, Deserialize)]
struct OfficialTeamEntry {
    team: OfficialTeamRef,
    score: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OfficialTeamRef {
    id: i64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct OfficialStatus {
    #[serde(rename = "abstractGameState")]
    abstract_game_state: String,
    #[serde(rename = "detailedState")]
    detailed_state: String,
}

#[derive(Debug, Deserialize)]
struct OfficialVenue {
    name: String,
}

/// Client for the league's official stats feed.
pub struct OfficialFeedClient {
    client: Client,
    base_url: String,
}

impl OfficialFeedClient {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout, None)?,
            base_url,
        })
    }

    fn normalize(raw: &serde_json::Value, game_id: &str) -> Result<GameData, ProviderError> {
        let game: OfficialGame =
            serde_json::from_value(raw.clone()).map_err(|e| ProviderError::DataShape {
                detail: format!("official payload did not match schema: {}", e),
            })?;

        let teams = game.teams.ok_or_else(|| ProviderError::DataShape {
            detail: "official payload missing teams block".to_string(),
        })?;
        let status = game.status.ok_or_else(|| ProviderError::DataShape {
            detail: "official payload missing status block".to_string(),
        })?;

        let side = |entry: OfficialTeamEntry| TeamScore {
            id: entry.team.id.to_string(),
            name: entry.team.name,
            score: entry.score.unwrap_or(0),
        };

        let is_final = status.abstract_game_state.eq_ignore_ascii_case("final");

        Ok(GameData {
            game_id: game_id.to_string(),
            home: side(teams.home),
            away: side(teams.away),
            status: GameStatus {
                state: status.abstract_game_state.to_lowercase(),
                detailed_state: status.detailed_state,
                is_final,
            },
            timestamp: Utc::now(),
            source: OFFICIAL_SOURCE.to_string(),
            venue: game.venue.map(|v| v.name),
            inning: game.current_inning,
        })
    }
}

#[async_trait]
impl GameDataProvider for OfficialFeedClient {
    fn name(&self) -> &'static str {
        OFFICIAL_SOURCE
    }

    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            breaker: BreakerConfig {
                failure_threshold: 8,
                reset_timeout: Duration::from_secs(30),
                call_timeout: Duration::from_secs(5),
            },
            rate_limit: RateLimitConfig {
                capacity: 20,
                refill_per_sec: 5.0,
            },
            priority: 0,
        }
    }

    async fn fetch(
        &self,
        game_id: &str,
        validators: Option<&CacheValidators>,
    ) -> Result<ProviderFetch, ProviderError> {
        let url = format!("{}/games/{}/linescore", self.base_url, game_id);
        match get_json(&self.client, &url, &[], validators).await? {
            None => Ok(ProviderFetch::NotModified),
            Some((raw, etag, last_modified)) => {
                let data = Self::normalize(&raw, game_id)?;
                Ok(ProviderFetch::Fresh(ProviderPayload {
                    raw,
                    data,
                    etag,
                    last_modified,
                }))
            }
        }
    }
}

// =============================================================================
// SPORTSFEED (secondary commercial feed)
// =============================================================================

#[derive(Debug, Deserialize)]
struct SportsfeedEnvelope {
    game: Option<SportsfeedGame>,
    venue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SportsfeedGame {
    home_team: SportsfeedTeam,
    away_team: SportsfeedTeam,
    state: String,
    clock: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SportsfeedTeam {
    id: String,
    name: String,
    points: u32,
}

pub struct SportsfeedClient {
    client: Client,
    base_url: String,
}

impl SportsfeedClient {
    pub fn new(base_url: String, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout, api_key)?,
            base_url,
        })
    }

    fn normalize(raw: &serde_json::Value, game_id: &str) -> Result<GameData, ProviderError> {
        let envelope: SportsfeedEnvelope =
            serde_json::from_value(raw.clone()).map_err(|e| ProviderError::DataShape {
                detail: format!("sportsfeed payload did not match schema: {}", e),
            })?;

        let game = envelope.game.ok_or_else(|| ProviderError::DataShape {
            detail: "sportsfeed payload missing game block".to_string(),
        })?;

        let is_final = game.state.eq_ignore_ascii_case("final");
        let side = |t: SportsfeedTeam| TeamScore {
            id: t.id,
            name: t.name,
            score: t.points,
        };

        Ok(GameData {
            game_id: game_id.to_string(),
            home: side(game.home_team),
            away: side(game.away_team),
            status: GameStatus {
                state: game.state.to_lowercase(),
                detailed_state: game.clock.unwrap_or_default(),
                is_final,
            },
            timestamp: Utc::now(),
            source: SPORTSFEED_SOURCE.to_string(),
            venue: envelope.venue,
            inning: None,
        })
    }
}

#[async_trait]
impl GameDataProvider for SportsfeedClient {
    fn name(&self) -> &'static str {
        SPORTSFEED_SOURCE
    }

    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            breaker: BreakerConfig {
                failure_threshold: 5,
                reset_timeout: Duration::from_secs(45),
                call_timeout: Duration::from_secs(4),
            },
            rate_limit: RateLimitConfig {
                capacity: 10,
                refill_per_sec: 2.0,
            },
            priority: 1,
        }
    }

    async fn fetch(
        &self,
        game_id: &str,
        validators: Option<&CacheValidators>,
    ) -> Result<ProviderFetch, ProviderError> {
        let url = format!("{}/scores", self.base_url);
        match get_json(&self.client, &url, &[("game", game_id)], validators).await? {
            None => Ok(ProviderFetch::NotModified),
            Some((raw, etag, last_modified)) => {
                let data = Self::normalize(&raw, game_id)?;
                Ok(ProviderFetch::Fresh(ProviderPayload {
                    raw,
                    data,
                    etag,
                    last_modified,
                }))
            }
        }
    }
}

// =============================================================================
// SCOREPANEL (public scoreboard aggregator)
// =============================================================================

#[derive(Debug, Deserialize)]
struct PanelEnvelope {
    event: Option<PanelEvent>,
}

#[derive(Debug, Deserialize)]
struct PanelEvent {
    competitors: Vec<PanelCompetitor>,
    status: PanelStatus,
    venue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PanelCompetitor {
    #[serde(rename = "homeAway")]
    home_away: String,
    id: String,
    #[serde(rename = "displayName")]
    display_name: String,
    /// The aggregator serves scores as strings.
    score: String,
}

#[derive(Debug, Deserialize)]
struct PanelStatus {
    state: String,
    completed: bool,
    detail: String,
}

pub struct ScorepanelClient {
    client: Client,
    base_url: String,
}

impl ScorepanelClient {
    pub fn new(base_url: String, api_key: Option<&str>, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout, api_key)?,
            base_url,
        })
    }

    fn normalize(raw: &serde_json::Value, game_id: &str) -> Result<GameData, ProviderError> {
        let envelope: PanelEnvelope =
            serde_json::from_value(raw.clone()).map_err(|e| ProviderError::DataShape {
                detail: format!("scorepanel payload did not match schema: {}", e),
            })?;

        let event = envelope.event.ok_or_else(|| ProviderError::DataShape {
            detail: "scorepanel payload missing event block".to_string(),
        })?;

        let mut home = None;
        let mut away = None;
        for c in event.competitors {
            let score = c.score.parse::<u32>().map_err(|_| ProviderError::DataShape {
                detail: format!("scorepanel score '{}' is not a non-negative integer", c.score),
            })?;
            let side = TeamScore {
                id: c.id,
                name: c.display_name,
                score,
            };
            match c.home_away.as_str() {
                "home" => home = Some(side),
                "away" => away = Some(side),
                other => {
                    return Err(ProviderError::DataShape {
                        detail: format!("scorepanel competitor side '{}' unknown", other),
                    })
                }
            }
        }

        let (home, away) = match (home, away) {
            (Some(h), Some(a)) => (h, a),
            _ => {
                return Err(ProviderError::DataShape {
                    detail: "scorepanel event missing home/away competitors".to_string(),
                })
            }
        };

        Ok(GameData {
            game_id: game_id.to_string(),
            home,
            away,
            status: GameStatus {
                state: event.status.state.to_lowercase(),
                detailed_state: event.status.detail,
                is_final: event.status.completed,
            },
            timestamp: Utc::now(),
            source: SCOREPANEL_SOURCE.to_string(),
            venue: event.venue,
            inning: None,
        })
    }
}

#[async_trait]
impl GameDataProvider for ScorepanelClient {
    fn name(&self) -> &'static str {
        SCOREPANEL_SOURCE
    }

    fn profile(&self) -> ProviderProfile {
        ProviderProfile {
            breaker: BreakerConfig {
                failure_threshold: 3,
                reset_timeout: Duration::from_secs(60),
                call_timeout: Duration::from_secs(3),
            },
            rate_limit: RateLimitConfig {
                capacity: 5,
                refill_per_sec: 1.0,
            },
            priority: 2,
        }
    }

    async fn fetch(
        &self,
        game_id: &str,
        validators: Option<&CacheValidators>,
    ) -> Result<ProviderFetch, ProviderError> {
        let url = format!("{}/panel/{}.json", self.base_url, game_id);
        match get_json(&self.client, &url, &[], validators).await? {
            None => Ok(ProviderFetch::NotModified),
            Some((raw, etag, last_modified)) => {
                let data = Self::normalize(&raw, game_id)?;
                Ok(ProviderFetch::Fresh(ProviderPayload {
                    raw,
                    data,
                    etag,
                    last_modified,
                }))
            }
        }
    }
}
