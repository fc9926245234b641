//! Corpus source contracts, the MediaWiki implementation and HTTP collaborator clients.

mod markup;
mod services;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use infoguard_storage::HttpFetcher;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use markup::is_redirect;
pub use markup::normalize_markup;
pub use services::{
    cosine_similarity, similarity_from_embeddings, topics_from_response, ClusteringServiceClient,
    EmbeddingServiceOracle,
};

pub const CRATE_NAME: &str = "infoguard-adapters";

pub const DEFAULT_API_URL: &str = "https://en.wikipedia.org/w/api.php";
pub const MAIN_NAMESPACE: i64 = 0;

/// One entry of the corpus-wide recent-changes feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentChange {
    pub title: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comment: String,
}

/// The latest revision of a document as returned by the corpus, before normalization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionSnapshot {
    pub document_id: String,
    pub revision_id: i64,
    pub parent_id: Option<i64>,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub comment: String,
    pub content: String,
}

/// Read access to the monitored corpus. `None` means "skip": the request failed after
/// retries or the response did not have the expected shape.
#[async_trait]
pub trait CorpusSource: Send + Sync {
    async fn fetch_recent_changes(&self, limit: usize) -> Option<Vec<RecentChange>>;

    async fn fetch_latest_revision(&self, document_id: &str) -> Option<RevisionSnapshot>;
}

pub struct MediaWikiSource {
    http: HttpFetcher,
    api_url: String,
}

impl MediaWikiSource {
    pub fn new(http: HttpFetcher, api_url: impl Into<String>) -> Self {
        Self {
            http,
            api_url: api_url.into(),
        }
    }
}

#[async_trait]
impl CorpusSource for MediaWikiSource {
    async fn fetch_recent_changes(&self, limit: usize) -> Option<Vec<RecentChange>> {
        let limit = limit.to_string();
        let namespace = MAIN_NAMESPACE.to_string();
        let params = [
            ("action", "query"),
            ("format", "json"),
            ("formatversion", "2"),
            ("list", "recentchanges"),
            ("rclimit", limit.as_str()),
            ("rcnamespace", namespace.as_str()),
            ("rcprop", "title|timestamp|user|comment"),
        ];
        let payload = self.http.get_json_or_skip(&self.api_url, &params).await?;
        parse_recent_changes(&payload)
    }

    async fn fetch_latest_revision(&self, document_id: &str) -> Option<RevisionSnapshot> {
        let params = [
            ("action", "query"),
            ("format", "json"),
            ("formatversion", "2"),
            ("prop", "revisions"),
            ("rvprop", "ids|timestamp|user|comment|content"),
            ("rvslots", "main"),
            ("titles", document_id),
        ];
        let payload = self.http.get_json_or_skip(&self.api_url, &params).await?;
        parse_latest_revision(document_id, &payload)
    }
}

#[derive(Debug, Deserialize)]
struct RecentChangesEnvelope {
    query: RecentChangesQuery,
}

#[derive(Debug, Deserialize)]
struct RecentChangesQuery {
    recentchanges: Vec<RecentChange>,
}

#[derive(Debug, Deserialize)]
struct RevisionsEnvelope {
    query: RevisionsQuery,
}

#[derive(Debug, Deserialize)]
struct RevisionsQuery {
    #[serde(default)]
    redirects: Vec<JsonValue>,
    #[serde(default)]
    pages: Vec<PageRecord>,
}

#[derive(Debug, Deserialize)]
struct PageRecord {
    title: Option<String>,
    #[serde(default)]
    missing: bool,
    #[serde(default)]
    invalid: bool,
    #[serde(default)]
    revisions: Vec<RevisionRecord>,
}

#[derive(Debug, Deserialize)]
struct RevisionRecord {
    revid: i64,
    #[serde(default)]
    parentid: Option<i64>,
    #[serde(default)]
    user: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    comment: String,
    slots: Option<RevisionSlots>,
}

#[derive(Debug, Deserialize)]
struct RevisionSlots {
    main: Option<MainSlot>,
}

#[derive(Debug, Deserialize)]
struct MainSlot {
    content: Option<String>,
}

pub fn parse_recent_changes(payload: &JsonValue) -> Option<Vec<RecentChange>> {
    match RecentChangesEnvelope::deserialize(payload) {
        Ok(envelope) => Some(envelope.query.recentchanges),
        Err(err) => {
            warn!(error = %err, "unexpected recent-changes payload");
            None
        }
    }
}

/// Decode the first page's first revision. Missing, invalid or redirected pages and
/// revisions without a main content slot yield `None`. A page counts as redirected when
/// the API resolved a redirect for it or its content is a `#REDIRECT` stub.
pub fn parse_latest_revision(document_id: &str, payload: &JsonValue) -> Option<RevisionSnapshot> {
    let envelope = match RevisionsEnvelope::deserialize(payload) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(document_id, error = %err, "unexpected revisions payload");
            return None;
        }
    };

    if !envelope.query.redirects.is_empty() {
        debug!(document_id, "document resolves through a redirect");
        return None;
    }
    let page = envelope.query.pages.into_iter().next()?;
    if page.missing || page.invalid {
        debug!(document_id, "page is missing or invalid");
        return None;
    }
    let revision = page.revisions.into_iter().next()?;
    let content = revision.slots?.main?.content?;
    if is_redirect(&content) {
        debug!(document_id, "document is a redirect");
        return None;
    }

    Some(RevisionSnapshot {
        document_id: page.title.unwrap_or_else(|| document_id.to_string()),
        revision_id: revision.revid,
        parent_id: revision.parentid.filter(|id| *id > 0),
        author: revision.user,
        timestamp: revision.timestamp,
        comment: revision.comment,
        content,
    })
}

/// Automated accounts are recognized by a case-insensitive `bot` in the user name.
pub fn is_automated_author(user: &str) -> bool {
    user.to_lowercase().contains("bot")
}

/// The `top_n` most frequently edited titles among human edits.
///
/// Equal counts keep the order in which titles first appeared in the feed.
pub fn top_edited_documents(changes: &[RecentChange], top_n: usize) -> Vec<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for change in changes.iter().filter(|c| !is_automated_author(&c.user)) {
        match counts.iter_mut().find(|(title, _)| *title == change.title) {
            Some((_, n)) => *n += 1,
            None => counts.push((change.title.clone(), 1)),
        }
    }
    // stable sort keeps first-seen order among ties
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    counts.into_iter().take(top_n).map(|(title, _)| title).collect()
}

pub fn load_fixture_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading fixture {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing fixture {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(title: &str, user: &str) -> RecentChange {
        RecentChange {
            title: title.into(),
            user: user.into(),
            timestamp: None,
            comment: String::new(),
        }
    }

    #[test]
    fn bot_detection_is_case_insensitive() {
        assert!(is_automated_author("ClueBot NG"));
        assert!(is_automated_author("InternetArchiveBOT"));
        assert!(is_automated_author("robotics_fan"));
        assert!(!is_automated_author("Jimbo Wales"));
    }

    #[test]
    fn top_edited_excludes_bots_and_keeps_first_seen_ties() {
        let feed = vec![
            change("Moon", "Alice"),
            change("Sun", "Bob"),
            change("Mars", "Carol"),
            change("Sun", "Dave"),
            change("Moon", "Eve"),
            change("Venus", "Frank"),
            change("Venus", "CleanupBot"),
            change("Venus", "CleanupBot"),
        ];
        assert_eq!(top_edited_documents(&feed, 3), vec!["Moon", "Sun", "Mars"]);
        assert_eq!(top_edited_documents(&feed, 10).len(), 4);
        assert!(top_edited_documents(&[], 10).is_empty());
    }

    #[test]
    fn revision_without_content_slot_is_skipped() {
        let payload = json!({
            "query": {"pages": [{
                "title": "Moon",
                "revisions": [{"revid": 9, "parentid": 8, "user": "A",
                               "timestamp": "2026-05-04T09:00:00Z", "slots": {}}]
            }]}
        });
        assert_eq!(parse_latest_revision("Moon", &payload), None);
    }

    #[test]
    fn revision_with_zero_parent_has_no_predecessor() {
        let payload = json!({
            "query": {"pages": [{
                "title": "Moon",
                "revisions": [{"revid": 1, "parentid": 0, "user": "A",
                               "timestamp": "2026-05-04T09:00:00Z",
                               "slots": {"main": {"content": "first"}}}]
            }]}
        });
        let snapshot = parse_latest_revision("Moon", &payload).expect("snapshot");
        assert_eq!(snapshot.parent_id, None);
        assert_eq!(snapshot.content, "first");
        assert_eq!(snapshot.comment, "");
    }

    #[test]
    fn resolved_redirect_is_skipped() {
        let payload = json!({
            "query": {
                "redirects": [{"from": "Luna", "to": "Moon"}],
                "pages": [{
                    "title": "Moon",
                    "revisions": [{"revid": 9, "parentid": 8, "user": "A",
                                   "timestamp": "2026-05-04T09:00:00Z",
                                   "slots": {"main": {"content": "The Moon."}}}]
                }]
            }
        });
        assert_eq!(parse_latest_revision("Luna", &payload), None);
    }

    #[test]
    fn error_envelope_is_skipped() {
        let payload = json!({"error": {"code": "maxlag", "info": "Waiting for replica"}});
        assert_eq!(parse_latest_revision("Moon", &payload), None);
        assert_eq!(parse_recent_changes(&payload), None);
    }
}
