//! Source adapters
//!
//! Each adapter implements `SourceAdapter` and is reachable only through the
//! `AdapterRegistry`, keyed by the `adapter_key` stored on the source.

pub mod boletin_nacional;
pub mod rss_feed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{AdapterError, MonitorError, Result};
use crate::http_client::HttpClientConfig;
use crate::metrics;
use crate::schemas::{CandidateRecord, Source};

pub use boletin_nacional::BoletinNacionalAdapter;
pub use rss_feed::RssFeedAdapter;

/// Contract every source satisfies
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Registry key of the adapter implementation
    fn key(&self) -> &'static str;

    /// Fetches candidates for the keyword set published after `since`.
    /// An empty result is a success.
    async fn fetch(
        &self,
        keywords: &[String],
        since: DateTime<Utc>,
    ) -> std::result::Result<Vec<CandidateRecord>, AdapterError>;
}

/// Settings shared by every adapter instance
#[derive(Debug, Clone, Default)]
pub struct AdapterSettings {
    pub http: HttpClientConfig,
}

impl AdapterSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            http: HttpClientConfig::from_config(config),
        }
    }

    /// HTTP settings for one source, including its extra headers
    pub fn http_for(&self, source: &Source) -> HttpClientConfig {
        self.http.clone().with_extra_headers(&source.adapter_config)
    }
}

/// Builds an adapter instance for a source
pub type AdapterFactory =
    Arc<dyn Fn(&Source, &AdapterSettings) -> Result<Arc<dyn SourceAdapter>> + Send + Sync>;

/// Closed set of adapter implementations, keyed by string
pub struct AdapterRegistry {
    settings: AdapterSettings,
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    /// Empty registry
    pub fn new(settings: AdapterSettings) -> Self {
        Self {
            settings,
            factories: HashMap::new(),
        }
    }

    /// Registry holding the adapters shipped with the crate
    pub fn builtin(settings: AdapterSettings) -> Self {
        let mut registry = Self::new(settings);
        registry.register(boletin_nacional::KEY, |source, settings| {
            Ok(Arc::new(BoletinNacionalAdapter::new(source, settings)?) as Arc<dyn SourceAdapter>)
        });
        registry.register(rss_feed::KEY, |source, settings| {
            Ok(Arc::new(RssFeedAdapter::new(source, settings)?) as Arc<dyn SourceAdapter>)
        });
        registry
    }

    /// Adds or replaces a factory
    pub fn register<F>(&mut self, key: impl Into<String>, factory: F)
    where
        F: Fn(&Source, &AdapterSettings) -> Result<Arc<dyn SourceAdapter>> + Send + Sync + 'static,
    {
        self.factories.insert(key.into(), Arc::new(factory));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.factories.contains_key(key)
    }

    /// Fails with `UnknownAdapter` when the key is not registered
    pub fn validate(&self, key: &str) -> Result<()> {
        if self.contains(key) {
            Ok(())
        } else {
            Err(MonitorError::UnknownAdapter(key.to_string()))
        }
    }

    /// Registered keys, sorted
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Instantiates the adapter configured on a source
    pub fn build(&self, source: &Source) -> Result<Arc<dyn SourceAdapter>> {
        let factory = self
            .factories
            .get(&source.adapter_key)
            .ok_or_else(|| MonitorError::UnknownAdapter(source.adapter_key.clone()))?;
        factory(source, &self.settings)
    }
}

/// Runs an adapter and enforces the shared output contract: every candidate
/// carries the source short name, external ids are trimmed (blank becomes
/// `None`) and blank titles are dropped.
pub async fn fetch_candidates(
    adapter: &dyn SourceAdapter,
    source: &Source,
    keywords: &[String],
    since: DateTime<Utc>,
) -> std::result::Result<Vec<CandidateRecord>, AdapterError> {
    let fetched = match adapter.fetch(keywords, since).await {
        Ok(fetched) => fetched,
        Err(e) => {
            warn!(
                source = %source.short_name,
                adapter = adapter.key(),
                kind = e.kind(),
                error = %e,
                "Adapter fetch failed"
            );
            metrics::record_adapter_error(e.kind());
            return Err(e);
        }
    };

    let total = fetched.len();
    let candidates: Vec<CandidateRecord> = fetched
        .into_iter()
        .filter(|c| !c.title.trim().is_empty())
        .map(|mut c| {
            c.source_short_name = source.short_name.clone();
            c.external_id = c
                .external_id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty());
            c
        })
        .collect();

    if candidates.len() < total {
        debug!(
            source = %source.short_name,
            dropped = total - candidates.len(),
            "Dropped candidates without title"
        );
    }
    Ok(candidates)
}

/// First non-blank string (or number) under any of `keys`
pub(crate) fn first_text(value: &serde_json::Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match value.get(*key)? {
        serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}
