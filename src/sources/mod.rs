//! Multi-source game data acquisition.
//!
//! One client per upstream schema, all funneled through [`SourceFetcher`]
//! which owns the per-provider resilience state and the evidence bundling.

pub mod fetcher;
pub mod provider;

pub use fetcher::{FetchOptions, FetchReport, SourceFailure, SourceFailureKind, SourceFetcher};
pub use provider::{
    CacheValidators, GameDataProvider, OfficialFeedClient, ProviderError, ProviderFetch,
    ProviderPayload, ProviderProfile, ScorepanelClient, SportsfeedClient, OFFICIAL_SOURCE,
    SCOREPANEL_SOURCE, SPORTSFEED_SOURCE,
};
