//! Linking records and lookup outcomes.

/// A resolved (or confirmed unresolvable) entity name.
///
/// Identity is `source_name`. An empty `knowledge_base_id` marks a name that
/// was looked up and found to have no link; see [`LinkedEntity::is_linked`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkedEntity {
    pub source_name: String,
    pub knowledge_base_id: String,
    pub description: Option<String>,
}

impl LinkedEntity {
    pub fn new(
        source_name: impl Into<String>,
        knowledge_base_id: impl Into<String>,
        description: Option<String>,
    ) -> Self {
        Self {
            source_name: source_name.into(),
            knowledge_base_id: knowledge_base_id.into(),
            description,
        }
    }

    /// Sentinel record for a name that was looked up and has no link.
    pub fn unlinkable(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            knowledge_base_id: String::new(),
            description: None,
        }
    }

    pub fn is_linked(&self) -> bool {
        !self.knowledge_base_id.is_empty()
    }
}

impl std::fmt::Display for LinkedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, {}, {}",
            self.source_name,
            self.knowledge_base_id,
            self.description.as_deref().unwrap_or("")
        )
    }
}

/// Result of a cache lookup for one name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// Cached with a non-empty id.
    Success(LinkedEntity),
    /// Looked up before and confirmed unlinkable.
    NoLinkingFound,
    /// Never looked up.
    NotFound,
}

impl CacheLookup {
    pub fn outcome(&self) -> LookupOutcome {
        match self {
            CacheLookup::Success(_) => LookupOutcome::Success,
            CacheLookup::NoLinkingFound => LookupOutcome::NoLinkingFound,
            CacheLookup::NotFound => LookupOutcome::NotFound,
        }
    }

    pub fn into_entity(self) -> Option<LinkedEntity> {
        match self {
            CacheLookup::Success(entity) => Some(entity),
            _ => None,
        }
    }
}

/// Classification of a lookup, without the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LookupOutcome {
    Success,
    NoLinkingFound,
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlinkable_sentinel_has_empty_id() {
        let e = LinkedEntity::unlinkable("Fridolin123xyz");
        assert!(!e.is_linked());
        assert_eq!(e.knowledge_base_id, "");
        assert_eq!(e.description, None);
    }

    #[test]
    fn cache_lookup_outcome_mapping() {
        let hit = CacheLookup::Success(LinkedEntity::new("Car", "Q1420", None));
        assert_eq!(hit.outcome(), LookupOutcome::Success);
        assert_eq!(CacheLookup::NotFound.outcome(), LookupOutcome::NotFound);
        assert!(CacheLookup::NoLinkingFound.into_entity().is_none());
    }
}
