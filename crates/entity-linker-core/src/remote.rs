//! Remote knowledge-base lookup (`wbgetentities`).
//!
//! One request resolves up to `entities_per_request` page titles. The service
//! answers with an `entities` object keyed by item id (`Q…`) for hits and by a
//! negative placeholder (`-1`, `-2`, …) carrying the requested `title` for
//! misses. Hits do not carry the title they were resolved from, so they are
//! aligned back to the input by position:
//!
//! ```text
//! names:     [ Car, Fridolin123xyz, Dog ]
//! response:  { Q1420: {..}, -1: {title: Fridolin123xyz, missing}, Q144: {..} }
//!
//! pass 1: misses by title        → Fridolin123xyz
//! pass 2: hits in document order → Car = Q1420, (skip Fridolin123xyz), Dog = Q144
//! ```
//!
//! The response is decoded into an ordered list of `(key, entry)` pairs rather
//! than a map, so document order is what the alignment walks.
//!
//! Transport is behind [`LookupTransport`]; [`HttpTransport`] talks to the real
//! API and [`MockTransport`] plays it in tests.

use crate::config::LinkerConfig;
use crate::error::{LinkError, Result, TransportError};
use crate::model::{LinkedEntity, LookupOutcome};
use parking_lot::Mutex;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Separator the API uses to join titles in one request.
pub const TITLE_SEPARATOR: char = '|';

// ============================================================================
// Transport
// ============================================================================

/// Issues one GET against the lookup API and returns the response body.
///
/// Non-success statuses must be reported as [`TransportError::Status`].
pub trait LookupTransport: Send + Sync {
    fn fetch(&self, params: &[(&'static str, String)]) -> Result<String, TransportError>;
}

impl<T: LookupTransport + ?Sized> LookupTransport for std::sync::Arc<T> {
    fn fetch(&self, params: &[(&'static str, String)]) -> Result<String, TransportError> {
        (**self).fetch(params)
    }
}

/// Blocking HTTP transport. Each instance owns its own connection pool.
pub struct HttpTransport {
    client: Client,
    api_url: url::Url,
}

impl HttpTransport {
    pub fn new(config: &LinkerConfig) -> Result<Self> {
        let api_url = url::Url::parse(&config.api_url)
            .map_err(|e| LinkError::InvalidInput(format!("invalid api url {}: {e}", config.api_url)))?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .unwrap_or_else(|_| HeaderValue::from_static("entity-linker")),
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(config.timeout())
            .build()
            .map_err(|e| LinkError::InvalidInput(format!("failed to build http client: {e}")))?;

        Ok(Self { client, api_url })
    }
}

impl LookupTransport for HttpTransport {
    fn fetch(&self, params: &[(&'static str, String)]) -> Result<String, TransportError> {
        let resp = self
            .client
            .get(self.api_url.clone())
            .query(params)
            .send()
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(TransportError::Status(resp.status().as_u16()));
        }

        resp.text().map_err(|e| TransportError::Network(e.to_string()))
    }
}

// ============================================================================
// Response shape
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawResponse {
    entities: Option<OrderedEntities>,
    error: Option<RawApiError>,
}

#[derive(Debug, Deserialize)]
struct RawApiError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    info: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEntity {
    title: Option<String>,
    descriptions: HashMap<String, RawDescription>,
}

#[derive(Debug, Deserialize)]
struct RawDescription {
    value: String,
}

/// `entities` in document order.
#[derive(Debug, Default)]
struct OrderedEntities(Vec<(String, RawEntity)>);

impl<'de> Deserialize<'de> for OrderedEntities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct OrderedVisitor;

        impl<'de> Visitor<'de> for OrderedVisitor {
            type Value = OrderedEntities;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of entities")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Self::Value, A::Error> {
                let mut out = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, RawEntity>()? {
                    out.push((key, value));
                }
                Ok(OrderedEntities(out))
            }
        }

        deserializer.deserialize_map(OrderedVisitor)
    }
}

fn is_item_id(key: &str) -> bool {
    key.starts_with('Q')
}

/// Title form used by the service: trimmed, `_` as space, first letter upper.
fn canonical_title(title: &str) -> String {
    let spaced = title.trim().replace('_', " ");
    let mut chars = spaced.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ============================================================================
// Client
// ============================================================================

/// Outcome of one batch call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchLookup {
    pub found: HashMap<String, LinkedEntity>,
    pub unresolved: BTreeSet<String>,
}

pub struct RemoteLookupClient<T = HttpTransport> {
    transport: T,
    site: String,
    language: String,
    entities_per_request: usize,
    max_attempts: u32,
    retry_base_delay: Duration,
    disambiguation_marker: String,
    requests: AtomicUsize,
}

impl RemoteLookupClient<HttpTransport> {
    pub fn from_config(config: &LinkerConfig) -> Result<Self> {
        Ok(Self::new(HttpTransport::new(config)?, config))
    }
}

impl<T: LookupTransport> RemoteLookupClient<T> {
    pub fn new(transport: T, config: &LinkerConfig) -> Self {
        Self {
            transport,
            site: config.site.clone(),
            language: config.language.clone(),
            entities_per_request: config.entities_per_request,
            max_attempts: config.max_attempts.max(1),
            retry_base_delay: config.retry_base_delay(),
            disambiguation_marker: config.disambiguation_marker.clone(),
            requests: AtomicUsize::new(0),
        }
    }

    pub fn entities_per_request(&self) -> usize {
        self.entities_per_request
    }

    /// HTTP requests issued so far, retries included.
    pub fn requests_issued(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    /// Look up at most `entities_per_request` names in one round trip.
    ///
    /// Every distinct input name ends up either in `found` or in `unresolved`.
    /// Unresolved covers pages that do not exist and disambiguation pages.
    pub fn lookup_batch(&self, names: &[String]) -> Result<BatchLookup> {
        if names.len() > self.entities_per_request {
            return Err(LinkError::InvalidBatchSize {
                size: names.len(),
                max: self.entities_per_request,
            });
        }
        if names.is_empty() {
            return Ok(BatchLookup::default());
        }

        let mut seen = HashSet::with_capacity(names.len());
        let mut distinct: Vec<String> = Vec::with_capacity(names.len());
        for name in names {
            if name.trim().is_empty() {
                return Err(LinkError::InvalidInput("entity names must not be empty".to_string()));
            }
            if name.contains(TITLE_SEPARATOR) {
                return Err(LinkError::InvalidInput(format!(
                    "entity name `{name}` contains the title separator"
                )));
            }
            if seen.insert(name.as_str()) {
                distinct.push(name.clone());
            }
        }

        // The service only normalizes single-title requests.
        let normalize = distinct.len() == 1;
        let params = self.request_params(&distinct, normalize);
        let entities = self.fetch_entities(&params)?;
        self.align(&distinct, entities)
    }

    /// Look up one name with server-side normalization.
    pub fn lookup_single(&self, name: &str) -> Result<(Option<LinkedEntity>, LookupOutcome)> {
        if name.trim().is_empty() {
            return Err(LinkError::InvalidInput("entity name must not be empty".to_string()));
        }

        let batch = self.lookup_batch(&[name.to_string()])?;
        if batch.found.len() > 1 {
            return Err(LinkError::AmbiguousLink {
                name: name.to_string(),
                count: batch.found.len(),
            });
        }

        match batch.found.into_values().next() {
            Some(entity) => Ok((Some(entity), LookupOutcome::Success)),
            None => Ok((None, LookupOutcome::NoLinkingFound)),
        }
    }

    fn request_params(&self, names: &[String], normalize: bool) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("action", "wbgetentities".to_string()),
            ("sites", self.site.clone()),
            ("titles", names.join("|")),
            ("redirects", "yes".to_string()),
            ("props", "info|descriptions".to_string()),
            ("format", "json".to_string()),
            ("languages", self.language.clone()),
        ];
        if normalize {
            params.push(("normalize", "1".to_string()));
        }
        params
    }

    /// Pause after failed attempt `attempt` (1-based): `attempt × base`.
    fn retry_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay * attempt
    }

    fn fetch_entities(&self, params: &[(&'static str, String)]) -> Result<OrderedEntities> {
        let mut last_error = TransportError::Network("no attempt made".to_string());

        for attempt in 1..=self.max_attempts {
            self.requests.fetch_add(1, Ordering::Relaxed);
            debug!(attempt, "issuing lookup request");

            match self.transport.fetch(params) {
                Ok(body) => match serde_json::from_str::<RawResponse>(&body) {
                    Ok(RawResponse {
                        entities: Some(entities),
                        ..
                    }) => return Ok(entities),
                    Ok(RawResponse { error, .. }) => {
                        let detail = error
                            .map(|e| format!(" (api error {}: {})", e.code, e.info))
                            .unwrap_or_default();
                        return Err(LinkError::Protocol(format!(
                            "response has no `entities` field{detail}"
                        )));
                    }
                    Err(e) => last_error = TransportError::Decode(e.to_string()),
                },
                Err(e) => last_error = e,
            }

            if attempt < self.max_attempts {
                let delay = self.retry_delay(attempt);
                warn!(
                    attempt,
                    max_attempts = self.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "lookup request failed, retrying"
                );
                std::thread::sleep(delay);
            }
        }

        Err(LinkError::RemoteServiceUnavailable {
            attempts: self.max_attempts,
            last_error: last_error.to_string(),
        })
    }

    fn align(&self, names: &[String], entities: OrderedEntities) -> Result<BatchLookup> {
        let mut out = BatchLookup::default();

        // Pass 1: misses carry their title.
        for (key, entity) in entities.0.iter().filter(|(k, _)| !is_item_id(k)) {
            if names.len() == 1 {
                out.unresolved.insert(names[0].clone());
                continue;
            }
            let title = entity.title.as_deref().unwrap_or_default();
            let matched = names
                .iter()
                .find(|n| n.as_str() == title && !out.unresolved.contains(*n))
                .or_else(|| {
                    let canonical = canonical_title(title);
                    names
                        .iter()
                        .find(|n| canonical_title(n) == canonical && !out.unresolved.contains(*n))
                });
            match matched {
                Some(name) => {
                    out.unresolved.insert(name.clone());
                }
                None => warn!(key = %key, title, "missing entry matches no requested name"),
            }
        }

        // Titles redirecting to one item share a key, so positions no longer
        // line up. Every name not matched as a miss is left unresolved.
        if entities.0.len() < names.len() {
            debug!(
                requested = names.len(),
                returned = entities.0.len(),
                "response collapsed entries, hits left unresolved"
            );
            out.unresolved.extend(names.iter().cloned());
            return Ok(out);
        }

        // Pass 2: hits in document order, skipping names already unresolved.
        let mut cursor = 0;
        for (key, entity) in entities.0.into_iter().filter(|(k, _)| is_item_id(k)) {
            while cursor < names.len() && out.unresolved.contains(&names[cursor]) {
                cursor += 1;
            }
            let Some(name) = names.get(cursor) else {
                return Err(LinkError::Protocol(format!(
                    "response has more entities than the {} requested names",
                    names.len()
                )));
            };

            let description = entity
                .descriptions
                .get(&self.language)
                .map(|d| d.value.clone());
            let is_disambiguation = description
                .as_deref()
                .is_some_and(|d| d.contains(&self.disambiguation_marker));

            if is_disambiguation {
                debug!(name = %name, id = %key, "disambiguation page treated as unresolved");
                out.unresolved.insert(name.clone());
            } else {
                out.found
                    .insert(name.clone(), LinkedEntity::new(name.clone(), key, description));
            }
            cursor += 1;
        }

        for name in names {
            if !out.found.contains_key(name) {
                out.unresolved.insert(name.clone());
            }
        }

        Ok(out)
    }
}

// ============================================================================
// Mock transport
// ============================================================================

/// What the mock service knows about a title.
#[derive(Debug, Clone)]
pub enum MockEntry {
    Item { id: String, description: Option<String> },
    Missing,
}

#[derive(Debug, Clone)]
enum ScriptedResponse {
    Status(u16),
    Body(String),
}

/// In-process stand-in for the lookup API.
///
/// Unknown titles answer as missing. Scripted responses (failure statuses or
/// raw bodies) are consumed first, one per request.
#[derive(Debug, Default)]
pub struct MockTransport {
    entries: HashMap<String, MockEntry>,
    scripted: Mutex<VecDeque<ScriptedResponse>>,
    requested: Mutex<Vec<Vec<String>>>,
    calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_item(mut self, title: &str, id: &str, description: Option<&str>) -> Self {
        self.entries.insert(
            title.to_string(),
            MockEntry::Item {
                id: id.to_string(),
                description: description.map(str::to_string),
            },
        );
        self
    }

    pub fn with_missing(mut self, title: &str) -> Self {
        self.entries.insert(title.to_string(), MockEntry::Missing);
        self
    }

    /// Answer the next `times` requests with `status`.
    pub fn fail_next(&self, times: usize, status: u16) {
        let mut scripted = self.scripted.lock();
        for _ in 0..times {
            scripted.push_back(ScriptedResponse::Status(status));
        }
    }

    /// Answer the next request with a raw body.
    pub fn respond_next(&self, body: &str) {
        self.scripted
            .lock()
            .push_back(ScriptedResponse::Body(body.to_string()));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Titles of every request received, in arrival order.
    pub fn requested_titles(&self) -> Vec<Vec<String>> {
        self.requested.lock().clone()
    }

    fn entry_for(&self, title: &str, normalize: bool) -> Option<&MockEntry> {
        self.entries.get(title).or_else(|| {
            if !normalize {
                return None;
            }
            let canonical = canonical_title(title);
            self.entries
                .iter()
                .find(|(k, _)| canonical_title(k) == canonical)
                .map(|(_, v)| v)
        })
    }

    fn render(&self, titles: &[String], normalize: bool) -> Result<String, TransportError> {
        let mut seen_ids = HashSet::new();
        let mut parts = Vec::with_capacity(titles.len());
        let mut missing = 0;

        for title in titles {
            match self.entry_for(title, normalize) {
                Some(MockEntry::Item { id, description }) => {
                    // Titles redirecting to one item collapse into one key.
                    if !seen_ids.insert(id.clone()) {
                        continue;
                    }
                    let mut value = serde_json::json!({
                        "type": "item",
                        "id": id,
                        "descriptions": {},
                    });
                    if let Some(d) = description {
                        value["descriptions"]["en"] = serde_json::json!({ "language": "en", "value": d });
                    }
                    parts.push(format!("{}:{}", encode(id)?, value));
                }
                Some(MockEntry::Missing) | None => {
                    missing += 1;
                    let value = serde_json::json!({
                        "site": "enwiki",
                        "title": title,
                        "missing": "",
                    });
                    parts.push(format!("{}:{}", encode(&format!("-{missing}"))?, value));
                }
            }
        }

        Ok(format!("{{\"entities\":{{{}}},\"success\":1}}", parts.join(",")))
    }
}

fn encode(s: &str) -> Result<String, TransportError> {
    serde_json::to_string(s).map_err(|e| TransportError::Decode(e.to_string()))
}

impl LookupTransport for MockTransport {
    fn fetch(&self, params: &[(&'static str, String)]) -> Result<String, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let titles: Vec<String> = params
            .iter()
            .find(|(k, _)| *k == "titles")
            .map(|(_, v)| v.split(TITLE_SEPARATOR).map(str::to_string).collect())
            .unwrap_or_default();
        let normalize = params.iter().any(|(k, v)| *k == "normalize" && v == "1");
        self.requested.lock().push(titles.clone());

        if let Some(scripted) = self.scripted.lock().pop_front() {
            return match scripted {
                ScriptedResponse::Status(status) => Err(TransportError::Status(status)),
                ScriptedResponse::Body(body) => Ok(body),
            };
        }

        self.render(&titles, normalize)
    }
}
