//! Entity linkers.
//!
//! Three implementations of [`EntityLinker`]:
//!
//! - [`CacheLinker`]: answers from the persistent cache only.
//! - [`RemoteLinker`]: answers from the lookup service only (batch, then
//!   single-name fallback with normalization).
//! - [`ResolutionProxy`]: cache first, remote for names never looked up, and
//!   every remote outcome written back so no name is sent twice.

use crate::cache::PersistentCache;
use crate::config::LinkerConfig;
use crate::error::{LinkError, Result};
use crate::model::{CacheLookup, LinkedEntity};
use crate::remote::{HttpTransport, LookupTransport, RemoteLookupClient};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;

pub trait EntityLinker {
    /// Resolve `names`, returning links for every resolvable name.
    ///
    /// Names that cannot be linked are added to `not_found`.
    fn resolve(
        &self,
        names: &[String],
        not_found: &mut BTreeSet<String>,
    ) -> Result<HashMap<String, LinkedEntity>>;

    /// Remote requests issued by this linker so far.
    fn remote_requests(&self) -> usize {
        0
    }
}

// ============================================================================
// Cache only
// ============================================================================

pub struct CacheLinker {
    cache: Arc<PersistentCache>,
}

impl CacheLinker {
    pub fn new(cache: Arc<PersistentCache>) -> Self {
        Self { cache }
    }
}

impl EntityLinker for CacheLinker {
    fn resolve(
        &self,
        names: &[String],
        not_found: &mut BTreeSet<String>,
    ) -> Result<HashMap<String, LinkedEntity>> {
        Ok(self.cache.get_many(names, not_found))
    }
}

// ============================================================================
// Remote only
// ============================================================================

pub struct RemoteLinker<T = HttpTransport> {
    client: RemoteLookupClient<T>,
    single_fallback: bool,
}

impl RemoteLinker<HttpTransport> {
    pub fn from_config(config: &LinkerConfig) -> Result<Self> {
        Ok(Self::new(
            RemoteLookupClient::from_config(config)?,
            config.single_fallback,
        ))
    }
}

impl<T: LookupTransport> RemoteLinker<T> {
    pub fn new(client: RemoteLookupClient<T>, single_fallback: bool) -> Self {
        Self {
            client,
            single_fallback,
        }
    }

    pub fn client(&self) -> &RemoteLookupClient<T> {
        &self.client
    }
}

impl<T: LookupTransport> EntityLinker for RemoteLinker<T> {
    fn resolve(
        &self,
        names: &[String],
        not_found: &mut BTreeSet<String>,
    ) -> Result<HashMap<String, LinkedEntity>> {
        let names = distinct(names);
        let mut found = HashMap::with_capacity(names.len());

        for batch in names.chunks(self.client.entities_per_request()) {
            let outcome = self.client.lookup_batch(batch)?;
            found.extend(outcome.found);

            for name in outcome.unresolved {
                // Single-name batches were already normalized.
                if !self.single_fallback || batch.len() == 1 {
                    not_found.insert(name);
                    continue;
                }
                match self.client.lookup_single(&name)? {
                    (Some(entity), _) => {
                        debug!(name = %name, id = %entity.knowledge_base_id, "resolved by single lookup");
                        found.insert(name, entity);
                    }
                    (None, _) => {
                        not_found.insert(name);
                    }
                }
            }
        }

        Ok(found)
    }

    fn remote_requests(&self) -> usize {
        self.client.requests_issued()
    }
}

// ============================================================================
// Cache + remote
// ============================================================================

pub struct ResolutionProxy<T = HttpTransport> {
    cache: Arc<PersistentCache>,
    remote: RemoteLinker<T>,
}

impl ResolutionProxy<HttpTransport> {
    pub fn from_config(cache: Arc<PersistentCache>, config: &LinkerConfig) -> Result<Self> {
        Ok(Self::new(cache, RemoteLinker::from_config(config)?))
    }
}

impl<T: LookupTransport> ResolutionProxy<T> {
    pub fn new(cache: Arc<PersistentCache>, remote: RemoteLinker<T>) -> Self {
        Self { cache, remote }
    }

    pub fn cache(&self) -> &PersistentCache {
        &self.cache
    }

    /// Resolve one name. `Ok(None)` means it is confirmed unlinkable.
    pub fn resolve_single(&self, name: &str) -> Result<Option<LinkedEntity>> {
        if name.trim().is_empty() {
            return Err(LinkError::InvalidInput("entity name must not be empty".to_string()));
        }

        match self.cache.get(name) {
            CacheLookup::Success(entity) => Ok(Some(entity)),
            CacheLookup::NoLinkingFound => Ok(None),
            CacheLookup::NotFound => {
                let (entity, _) = self.remote.client().lookup_single(name)?;
                let record = entity
                    .clone()
                    .unwrap_or_else(|| LinkedEntity::unlinkable(name));
                self.cache.persist(&record)?;
                Ok(entity)
            }
        }
    }
}

impl<T: LookupTransport> EntityLinker for ResolutionProxy<T> {
    fn resolve(
        &self,
        names: &[String],
        not_found: &mut BTreeSet<String>,
    ) -> Result<HashMap<String, LinkedEntity>> {
        let mut misses = BTreeSet::new();
        let mut cached = self.cache.get_many(names, &mut misses);

        // Split misses into never-looked-up and known-unlinkable.
        let mut fresh = Vec::new();
        for name in distinct(names) {
            if !misses.contains(&name) {
                continue;
            }
            match self.cache.get(&name) {
                CacheLookup::NotFound => fresh.push(name),
                CacheLookup::NoLinkingFound => {
                    not_found.insert(name);
                }
                // Persisted by another worker in the meantime.
                CacheLookup::Success(entity) => {
                    cached.insert(name, entity);
                }
            }
        }

        if fresh.is_empty() {
            return Ok(cached);
        }

        let mut unlinkable = BTreeSet::new();
        let remote = self.remote.resolve(&fresh, &mut unlinkable)?;

        let records: Vec<LinkedEntity> = remote
            .values()
            .cloned()
            .chain(unlinkable.iter().map(LinkedEntity::unlinkable))
            .collect();
        self.cache.persist_all(&records)?;

        debug!(
            cached = cached.len(),
            remote = remote.len(),
            unlinkable = unlinkable.len(),
            "resolved names"
        );
        not_found.extend(unlinkable);

        Ok(merge_smaller_into_larger(cached, remote))
    }

    fn remote_requests(&self) -> usize {
        self.remote.remote_requests()
    }
}

fn distinct(names: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(names.len());
    names
        .iter()
        .filter(|n| seen.insert(n.as_str()))
        .cloned()
        .collect()
}

fn merge_smaller_into_larger(
    a: HashMap<String, LinkedEntity>,
    b: HashMap<String, LinkedEntity>,
) -> HashMap<String, LinkedEntity> {
    let (mut larger, smaller) = if a.len() >= b.len() { (a, b) } else { (b, a) };
    larger.extend(smaller);
    larger
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MockTransport;
    use tempfile::tempdir;

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn proxy(
        cache: Arc<PersistentCache>,
        mock: Arc<MockTransport>,
        config: &LinkerConfig,
    ) -> ResolutionProxy<Arc<MockTransport>> {
        let client = RemoteLookupClient::new(mock, config);
        ResolutionProxy::new(cache, RemoteLinker::new(client, config.single_fallback))
    }

    fn setup() -> (tempfile::TempDir, Arc<PersistentCache>, Arc<MockTransport>, LinkerConfig) {
        let dir = tempdir().unwrap();
        let cache = Arc::new(PersistentCache::open(dir.path().join("cache.csv")).unwrap());
        let mock = Arc::new(
            MockTransport::new()
                .with_item("Car", "Q1420", Some("motor vehicle"))
                .with_item("Dog", "Q144", Some("domestic animal")),
        );
        let config = LinkerConfig {
            retry_base_delay_ms: 0,
            ..LinkerConfig::default()
        };
        (dir, cache, mock, config)
    }

    #[test]
    fn second_resolution_is_served_from_cache() {
        let (_dir, cache, mock, config) = setup();
        let p = proxy(cache, mock.clone(), &config);

        let mut not_found = BTreeSet::new();
        let first = p.resolve(&names(&["Car", "Dog"]), &mut not_found).unwrap();
        assert_eq!(first.len(), 2);
        let calls = mock.calls();

        let second = p.resolve(&names(&["Car", "Dog"]), &mut not_found).unwrap();
        assert_eq!(first, second);
        assert_eq!(mock.calls(), calls);
        assert!(not_found.is_empty());
    }

    #[test]
    fn unlinkable_names_are_cached_and_never_resent() {
        let (_dir, cache, mock, config) = setup();
        let p = proxy(cache.clone(), mock.clone(), &config);

        let mut not_found = BTreeSet::new();
        p.resolve(&names(&["Car", "Fridolin123xyz"]), &mut not_found)
            .unwrap();
        assert_eq!(not_found, BTreeSet::from(["Fridolin123xyz".to_string()]));
        assert_eq!(cache.get("Fridolin123xyz"), CacheLookup::NoLinkingFound);

        let calls = mock.calls();
        let mut again = BTreeSet::new();
        let found = p
            .resolve(&names(&["Fridolin123xyz"]), &mut again)
            .unwrap();
        assert!(found.is_empty());
        assert_eq!(again, BTreeSet::from(["Fridolin123xyz".to_string()]));
        assert_eq!(mock.calls(), calls);
    }

    #[test]
    fn batch_misses_fall_back_to_single_lookup() {
        let (_dir, cache, mock, config) = setup();
        let p = proxy(cache.clone(), mock.clone(), &config);

        let mut not_found = BTreeSet::new();
        let found = p
            .resolve(&names(&["car", "Dog", "Nope"]), &mut not_found)
            .unwrap();

        assert_eq!(found["car"].knowledge_base_id, "Q1420");
        assert_eq!(not_found, BTreeSet::from(["Nope".to_string()]));
        // one batch + two single fallbacks
        assert_eq!(mock.calls(), 3);
        assert_eq!(p.remote_requests(), 3);
    }

    #[test]
    fn redirects_to_one_item_are_linked_and_cached_correctly() {
        let (_dir, cache, _, config) = setup();
        let mock = Arc::new(
            MockTransport::new()
                .with_item("Automobile", "Q1420", Some("motor vehicle"))
                .with_item("Car", "Q1420", Some("motor vehicle"))
                .with_item("Dog", "Q144", Some("domestic animal")),
        );
        let p = proxy(cache.clone(), mock.clone(), &config);

        let mut not_found = BTreeSet::new();
        let found = p
            .resolve(&names(&["Automobile", "Car", "Dog"]), &mut not_found)
            .unwrap();

        assert!(not_found.is_empty());
        assert_eq!(found["Automobile"].knowledge_base_id, "Q1420");
        assert_eq!(found["Car"].knowledge_base_id, "Q1420");
        assert_eq!(found["Dog"].knowledge_base_id, "Q144");
        match cache.get("Car") {
            CacheLookup::Success(entity) => assert_eq!(entity.knowledge_base_id, "Q1420"),
            other => panic!("unexpected cache state: {other:?}"),
        }
        // one collapsed batch + three single lookups
        assert_eq!(mock.calls(), 4);
    }

    #[test]
    fn fallback_can_be_disabled() {
        let (_dir, cache, mock, mut config) = setup();
        config.single_fallback = false;
        let p = proxy(cache, mock.clone(), &config);

        let mut not_found = BTreeSet::new();
        let found = p.resolve(&names(&["car", "Dog"]), &mut not_found).unwrap();
        assert!(!found.contains_key("car"));
        assert!(not_found.contains("car"));
        assert_eq!(mock.calls(), 1);
    }

    #[test]
    fn remote_failure_propagates_and_persists_nothing() {
        let (_dir, cache, mock, config) = setup();
        mock.fail_next(config.max_attempts as usize, 503);
        let p = proxy(cache.clone(), mock, &config);

        let mut not_found = BTreeSet::new();
        let err = p.resolve(&names(&["Car"]), &mut not_found).unwrap_err();
        assert!(matches!(err, LinkError::RemoteServiceUnavailable { .. }));
        assert!(not_found.is_empty());
        assert_eq!(cache.get("Car"), CacheLookup::NotFound);
    }

    #[test]
    fn large_inputs_are_split_at_the_request_cap() {
        let (_dir, cache, mock, mut config) = setup();
        config.single_fallback = false;
        config.entities_per_request = 10;
        let p = proxy(cache.clone(), mock.clone(), &config);

        let input: Vec<String> = (0..25).map(|i| format!("unknown-{i}")).collect();
        let mut not_found = BTreeSet::new();
        p.resolve(&input, &mut not_found).unwrap();

        assert_eq!(not_found.len(), 25);
        assert_eq!(mock.calls(), 3);
        assert!(mock.requested_titles().iter().all(|t| t.len() <= 10));
        assert_eq!(cache.len(), 25);
    }

    #[test]
    fn resolve_single_uses_cache_then_remote() {
        let (_dir, cache, mock, config) = setup();
        let p = proxy(cache.clone(), mock.clone(), &config);

        let car = p.resolve_single("Car").unwrap().unwrap();
        assert_eq!(car.knowledge_base_id, "Q1420");
        assert!(p.resolve_single("Fridolin123xyz").unwrap().is_none());
        assert_eq!(mock.calls(), 2);

        p.resolve_single("Car").unwrap();
        p.resolve_single("Fridolin123xyz").unwrap();
        assert_eq!(mock.calls(), 2);

        assert!(matches!(
            p.resolve_single(""),
            Err(LinkError::InvalidInput(_))
        ));
    }

    #[test]
    fn cache_linker_never_touches_remote() {
        let (_dir, cache, _mock, _config) = setup();
        cache.persist(&LinkedEntity::new("Car", "Q1420", None)).unwrap();
        let linker = CacheLinker::new(cache);

        let mut not_found = BTreeSet::new();
        let found = linker
            .resolve(&names(&["Car", "Dog"]), &mut not_found)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(not_found, BTreeSet::from(["Dog".to_string()]));
        assert_eq!(linker.remote_requests(), 0);
    }

    #[test]
    fn merge_keeps_all_entries() {
        let mut a = HashMap::new();
        a.insert("Car".to_string(), LinkedEntity::new("Car", "Q1420", None));
        let mut b = HashMap::new();
        b.insert("Dog".to_string(), LinkedEntity::new("Dog", "Q144", None));
        b.insert("Cat".to_string(), LinkedEntity::new("Cat", "Q146", None));

        let merged = merge_smaller_into_larger(a, b);
        assert_eq!(merged.len(), 3);
    }
}
