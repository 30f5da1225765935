//! Background cache/dispatch agent.
//!
//! Sits between collaborators and the network: every outbound request goes
//! through [`Agent::on_request`], which picks a caching strategy from the URL
//! and answers from the network, a versioned cache tier, or a synthetic
//! `503`. On reconnect, [`Agent::on_reconnect`] re-arms the sync engine.

mod cache;
mod strategy;

pub use cache::{CacheStorage, CachedResponse};
pub use strategy::{classify, CacheTier, RouteRules, Strategy};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{FetchedResponse, Fetcher, ResourceRequest};
use crate::store::{DbState, StoreError, DEFERRED_SYNC_TABLE};
use crate::sync::SyncMessage;

/// Default deferred-sync tag for order submission.
pub const DEFAULT_DEFERRED_SYNC_TAG: &str = "sync-pedidos";

const SYNTHETIC_STATUS: u16 = 503;
const OFFLINE_API_BODY: &str = r#"{"ok":false,"error":"offline"}"#;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("deferred sync registration is unavailable: {0}")]
    RegistrationUnavailable(String),

    #[error("cache storage fault: {0}")]
    Cache(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    /// Build version tag; every tier name carries it.
    pub cache_version: String,
    pub api_prefix: String,
    pub auth_path: String,
    pub deferred_sync_tag: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            cache_version: env!("CARGO_PKG_VERSION").to_string(),
            api_prefix: "/api/".to_string(),
            auth_path: "/api/auth".to_string(),
            deferred_sync_tag: DEFAULT_DEFERRED_SYNC_TAG.to_string(),
        }
    }
}

impl AgentConfig {
    pub fn route_rules(&self) -> RouteRules {
        RouteRules {
            api_prefix: self.api_prefix.clone(),
            auth_path: self.auth_path.clone(),
        }
    }

    /// Names of the three tiers for the current version.
    pub fn current_cache_names(&self) -> Vec<String> {
        CacheTier::ALL
            .iter()
            .map(|tier| tier.cache_name(&self.cache_version))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Deferred sync registration
// ---------------------------------------------------------------------------

/// Host facility that wakes the sync engine once connectivity returns, even
/// with no foreground process.
pub trait DeferredSyncRegistrar: Send + Sync {
    fn register(&self, tag: &str) -> Result<(), AgentError>;
    /// Consume a registration. Returns `true` when `tag` was registered.
    fn take(&self, tag: &str) -> Result<bool, AgentError>;
    fn is_registered(&self, tag: &str) -> Result<bool, AgentError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeferredRegistration {
    tag: String,
    registered_at: DateTime<Utc>,
}

/// Registrations persisted in the `deferred_sync` table, so they survive a
/// restart of the background process.
#[derive(Debug, Clone)]
pub struct StoreDeferredSync {
    db: Arc<DbState>,
}

impl StoreDeferredSync {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }
}

impl DeferredSyncRegistrar for StoreDeferredSync {
    fn register(&self, tag: &str) -> Result<(), AgentError> {
        let registration = DeferredRegistration {
            tag: tag.to_string(),
            registered_at: Utc::now(),
        };
        self.db.put(DEFERRED_SYNC_TABLE, tag, &registration)?;
        Ok(())
    }

    fn take(&self, tag: &str) -> Result<bool, AgentError> {
        Ok(self.db.delete(DEFERRED_SYNC_TABLE, tag)?)
    }

    fn is_registered(&self, tag: &str) -> Result<bool, AgentError> {
        Ok(self
            .db
            .get::<DeferredRegistration>(DEFERRED_SYNC_TABLE, tag)?
            .is_some())
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub source: ResponseSource,
}

impl AgentResponse {
    fn network(response: FetchedResponse) -> Self {
        Self {
            status: response.status,
            content_type: response.content_type,
            body: response.body,
            source: ResponseSource::Network,
        }
    }

    fn cached(response: CachedResponse) -> Self {
        Self {
            status: response.status,
            content_type: response.content_type,
            body: response.body,
            source: ResponseSource::Cache,
        }
    }

    /// `503` placeholder: a JSON error body for API calls, empty otherwise.
    fn unavailable(is_api: bool) -> Self {
        if is_api {
            Self {
                status: SYNTHETIC_STATUS,
                content_type: Some("application/json".to_string()),
                body: OFFLINE_API_BODY.as_bytes().to_vec(),
                source: ResponseSource::Synthetic,
            }
        } else {
            Self {
                status: SYNTHETIC_STATUS,
                content_type: None,
                body: Vec::new(),
                source: ResponseSource::Synthetic,
            }
        }
    }
}

/// Reply to one intercepted request. `refresh` is set when a background
/// cache refresh was started.
#[derive(Debug)]
pub struct AgentReply {
    pub response: AgentResponse,
    pub strategy: Strategy,
    pub refresh: Option<JoinHandle<()>>,
    /// Cache storage fault hit while answering. The request was still served
    /// from the network or as a placeholder.
    pub cache_error: Option<AgentError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// A deferred sync was registered with the host.
    Registered,
    /// A wake message reached a running sync engine.
    WokeEngine,
    NoActiveEngine,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

pub struct Agent {
    cache: CacheStorage,
    fetcher: Arc<dyn Fetcher>,
    config: AgentConfig,
    rules: RouteRules,
    registrar: Option<Arc<dyn DeferredSyncRegistrar>>,
    engine_tx: Option<mpsc::Sender<SyncMessage>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("config", &self.config)
            .field("has_registrar", &self.registrar.is_some())
            .field("has_engine", &self.engine_tx.is_some())
            .finish()
    }
}

/// Fetch `request` and store the response when it is a 2xx. A failed store
/// still returns the response alongside the fault.
async fn fetch_and_store(
    fetcher: &dyn Fetcher,
    cache: &CacheStorage,
    cache_name: &str,
    request: &ResourceRequest,
) -> (Option<FetchedResponse>, Option<AgentError>) {
    match fetcher.fetch(request).await {
        Ok(response) => {
            let mut fault = None;
            if response.is_success() {
                if let Err(e) = cache.store(cache_name, &request.url, &response) {
                    error!(url = %request.url, cache = %cache_name, error = %e, "Failed to cache response");
                    fault = Some(AgentError::Cache(e));
                }
            }
            (Some(response), fault)
        }
        Err(e) => {
            debug!(url = %request.url, error = %e, "Network fetch failed");
            (None, None)
        }
    }
}

impl Agent {
    pub fn new(db: Arc<DbState>, fetcher: Arc<dyn Fetcher>, config: AgentConfig) -> Self {
        let rules = config.route_rules();
        Self {
            cache: CacheStorage::new(db),
            fetcher,
            config,
            rules,
            registrar: None,
            engine_tx: None,
        }
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn DeferredSyncRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn with_engine_channel(mut self, tx: mpsc::Sender<SyncMessage>) -> Self {
        self.engine_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn cache(&self) -> &CacheStorage {
        &self.cache
    }

    /// Purge every cache tier that does not carry the current version tag.
    pub fn activate(&self) -> Result<Vec<String>, AgentError> {
        let purged = self.cache.purge_except(&self.config.current_cache_names())?;
        if purged.is_empty() {
            debug!(version = %self.config.cache_version, "Cache tiers up to date");
        } else {
            info!(
                version = %self.config.cache_version,
                purged = ?purged,
                "Purged caches from previous versions"
            );
        }
        Ok(purged)
    }

    fn lookup(
        &self,
        cache_name: &str,
        request: &ResourceRequest,
    ) -> Result<Option<CachedResponse>, AgentError> {
        self.cache.lookup(cache_name, &request.url).map_err(|e| {
            error!(url = %request.url, cache = %cache_name, error = %e, "Cache lookup failed");
            AgentError::Cache(e)
        })
    }

    fn spawn_refresh(&self, cache_name: String, request: ResourceRequest) -> JoinHandle<()> {
        let fetcher = self.fetcher.clone();
        let cache = self.cache.clone();
        tokio::spawn(async move {
            if let (Some(response), _) =
                fetch_and_store(fetcher.as_ref(), &cache, &cache_name, &request).await
            {
                debug!(url = %request.url, status = response.status, "Background refresh finished");
            }
        })
    }

    /// Answer one outbound request.
    pub async fn on_request(&self, request: ResourceRequest) -> AgentReply {
        let strategy = classify(&request, &self.rules);
        let is_api = self.rules.is_api(request.path());

        let Some(tier) = strategy.tier() else {
            let response = match self.fetcher.fetch(&request).await {
                Ok(response) => AgentResponse::network(response),
                Err(e) => {
                    debug!(url = %request.url, error = %e, "Bypassed request failed");
                    AgentResponse::unavailable(is_api)
                }
            };
            return AgentReply {
                response,
                strategy,
                refresh: None,
                cache_error: None,
            };
        };
        let cache_name = tier.cache_name(&self.config.cache_version);

        if strategy == Strategy::NetworkFirst {
            let (response, cache_error) = self.network_first(&cache_name, &request, is_api).await;
            return AgentReply {
                response,
                strategy,
                refresh: None,
                cache_error,
            };
        }

        // Cache-first and stale-while-revalidate share the same shape: a hit
        // is served at once with a refresh behind it, a miss waits on the
        // network. A faulty cache counts as a miss.
        let (hit, lookup_error) = match self.lookup(&cache_name, &request) {
            Ok(hit) => (hit, None),
            Err(e) => (None, Some(e)),
        };
        let (response, refresh, cache_error) = match hit {
            Some(hit) => {
                let refresh = self.spawn_refresh(cache_name, request);
                (AgentResponse::cached(hit), Some(refresh), None)
            }
            None => {
                let (fetched, store_error) =
                    fetch_and_store(self.fetcher.as_ref(), &self.cache, &cache_name, &request)
                        .await;
                let response = fetched
                    .map(AgentResponse::network)
                    .unwrap_or_else(|| AgentResponse::unavailable(is_api));
                (response, None, lookup_error.or(store_error))
            }
        };

        AgentReply {
            response,
            strategy,
            refresh,
            cache_error,
        }
    }

    async fn network_first(
        &self,
        cache_name: &str,
        request: &ResourceRequest,
        is_api: bool,
    ) -> (AgentResponse, Option<AgentError>) {
        let (fetched, store_error) =
            fetch_and_store(self.fetcher.as_ref(), &self.cache, cache_name, request).await;
        match fetched {
            Some(response) if response.status < 500 => {
                (AgentResponse::network(response), store_error)
            }
            failed => {
                let lookup_error = match self.lookup(cache_name, request) {
                    Ok(Some(hit)) => {
                        debug!(url = %request.url, "Serving cached response after network failure");
                        return (AgentResponse::cached(hit), None);
                    }
                    Ok(None) => None,
                    Err(e) => Some(e),
                };
                let response = failed
                    .map(AgentResponse::network)
                    .unwrap_or_else(|| AgentResponse::unavailable(is_api));
                (response, lookup_error)
            }
        }
    }

    /// Connectivity restored: register a deferred sync with the host, or wake
    /// a running engine directly when registration is unavailable.
    pub fn on_reconnect(&self) -> ReconnectOutcome {
        if let Some(registrar) = &self.registrar {
            match registrar.register(&self.config.deferred_sync_tag) {
                Ok(()) => {
                    info!(tag = %self.config.deferred_sync_tag, "Registered deferred sync");
                    return ReconnectOutcome::Registered;
                }
                Err(e) => {
                    warn!(error = %e, "Deferred sync registration failed; waking engine directly");
                }
            }
        }

        let Some(tx) = &self.engine_tx else {
            return ReconnectOutcome::NoActiveEngine;
        };
        let wake = SyncMessage::Wake {
            reason: "reconnect".to_string(),
        };
        match tx.try_send(wake) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => ReconnectOutcome::WokeEngine,
            Err(mpsc::error::TrySendError::Closed(_)) => ReconnectOutcome::NoActiveEngine,
        }
    }

    /// Consume the pending deferred sync registration, if any.
    pub fn take_deferred_sync(&self) -> Result<bool, AgentError> {
        match &self.registrar {
            Some(registrar) => registrar.take(&self.config.deferred_sync_tag),
            None => Ok(false),
        }
    }
}
