//! RSS / Atom procurement feeds
//!
//! Used by portals that publish their calls for tender as a feed. The whole
//! feed is fetched once per scan; entries are kept when they mention at
//! least one keyword and were published inside the lookback window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feed_rs::model::Entry;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use tracing::info;

use super::{AdapterSettings, SourceAdapter};
use crate::error::AdapterError;
use crate::http_client::AdapterHttpClient;
use crate::matcher::{KeywordMatcher, MatchOperator};
use crate::schemas::{CandidateRecord, Source};

pub const KEY: &str = "rss_feed";

static HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").expect("valid tag regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

const NO_QUERY: [(&str, &str); 0] = [];

pub struct RssFeedAdapter {
    client: AdapterHttpClient,
    feed_url: String,
    short_name: String,
    organization: Option<String>,
}

impl RssFeedAdapter {
    /// Requires `feed_url` in the source's adapter configuration.
    /// `organization` optionally names the buying entity for every entry.
    pub fn new(source: &Source, settings: &AdapterSettings) -> Result<Self, AdapterError> {
        let config = &source.adapter_config;
        let feed_url = config
            .get("feed_url")
            .and_then(Value::as_str)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                AdapterError::Config(format!("{}: feed_url is required", source.short_name))
            })?;
        url::Url::parse(feed_url)
            .map_err(|e| AdapterError::Config(format!("{}: feed_url: {e}", source.short_name)))?;

        Ok(Self {
            client: AdapterHttpClient::new(settings.http_for(source))?,
            feed_url: feed_url.to_string(),
            short_name: source.short_name.clone(),
            organization: config
                .get("organization")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    fn to_candidate(&self, entry: &Entry, feed_title: Option<&str>) -> Option<CandidateRecord> {
        let title = entry.title.as_ref().map(|t| clean_text(&t.content))?;
        let description = entry
            .summary
            .as_ref()
            .map(|t| t.content.clone())
            .or_else(|| entry.content.as_ref().and_then(|c| c.body.clone()))
            .map(|text| clean_text(&text))
            .filter(|text| !text.is_empty());
        let link = entry.links.first().map(|l| l.href.clone());

        Some(CandidateRecord {
            description,
            organization: self
                .organization
                .clone()
                .or_else(|| feed_title.map(str::to_string)),
            external_id: Some(entry.id.clone()).filter(|id| !id.trim().is_empty()),
            published_at: entry.published.or(entry.updated),
            detail_url: link.clone(),
            raw: Some(json!({
                "id": entry.id,
                "title": title,
                "link": link,
            })),
            ..CandidateRecord::new(title.clone(), self.short_name.clone())
        })
    }
}

#[async_trait]
impl SourceAdapter for RssFeedAdapter {
    fn key(&self) -> &'static str {
        KEY
    }

    async fn fetch(
        &self,
        keywords: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<CandidateRecord>, AdapterError> {
        let body = self.client.get_bytes(&self.feed_url, &NO_QUERY).await?;
        let feed = feed_rs::parser::parse(body.as_slice())
            .map_err(|e| AdapterError::Parse(format!("{}: {e}", self.feed_url)))?;

        let feed_title = feed.title.as_ref().map(|t| clean_text(&t.content));
        let filter = KeywordMatcher::new(keywords, MatchOperator::Or);

        let candidates: Vec<CandidateRecord> = feed
            .entries
            .iter()
            .filter_map(|entry| self.to_candidate(entry, feed_title.as_deref()))
            .filter(|c| c.published_at.map_or(true, |p| p >= since))
            .filter_map(|mut c| {
                let result = filter.evaluate_candidate(&c);
                result.matched.then(|| {
                    c.suggested_keywords = result.keywords_found;
                    c
                })
            })
            .collect();

        info!(
            source = %self.short_name,
            entries = feed.entries.len(),
            candidates = candidates.len(),
            "Feed scan complete"
        );
        Ok(candidates)
    }
}

/// Strips markup and collapses whitespace
fn clean_text(text: &str) -> String {
    let stripped = HTML_TAG.replace_all(text, " ");
    WHITESPACE.replace_all(stripped.trim(), " ").into_owned()
}
