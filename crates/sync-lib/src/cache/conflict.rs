//! Conflict resolution between local and remote revisions

use crate::models::Revision;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;

/// Custom merge function registered for a key pattern
pub type ConflictResolver = Arc<dyn Fn(&Revision, &Revision) -> Value + Send + Sync>;

/// Which side a resolution kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedFrom {
    Local,
    Remote,
    Resolver,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub value: Value,
    pub from: ResolvedFrom,
    /// Timestamps were equal and remote was kept by default
    pub tie: bool,
}

/// Keep the newer revision, remote on an exact tie
pub fn newer_revision(local: &Revision, remote: &Revision) -> Resolution {
    if local.timestamp > remote.timestamp {
        Resolution {
            value: local.value.clone(),
            from: ResolvedFrom::Local,
            tie: false,
        }
    } else {
        Resolution {
            value: remote.value.clone(),
            from: ResolvedFrom::Remote,
            tie: local.timestamp == remote.timestamp,
        }
    }
}

struct Registered {
    pattern: String,
    regex: Option<Regex>,
    resolver: ConflictResolver,
}

impl Registered {
    fn matches(&self, key: &str) -> bool {
        key.contains(&self.pattern)
            || self.regex.as_ref().map(|re| re.is_match(key)).unwrap_or(false)
    }
}

/// Resolvers in registration order; the first match wins
#[derive(Default)]
pub(crate) struct ResolverRegistry {
    resolvers: RwLock<Vec<Registered>>,
}

impl ResolverRegistry {
    /// `pattern` matches as a substring, or as a regular expression when it parses as one
    pub fn register(&self, pattern: &str, resolver: ConflictResolver) {
        self.resolvers.write().push(Registered {
            pattern: pattern.to_string(),
            regex: Regex::new(pattern).ok(),
            resolver,
        });
    }

    pub fn resolve(&self, key: &str, local: &Revision, remote: &Revision) -> Resolution {
        let resolver = self
            .resolvers
            .read()
            .iter()
            .find(|r| r.matches(key))
            .map(|r| Arc::clone(&r.resolver));

        match resolver {
            Some(resolver) => Resolution {
                value: resolver(local, remote),
                from: ResolvedFrom::Resolver,
                tie: false,
            },
            None => newer_revision(local, remote),
        }
    }

    pub fn len(&self) -> usize {
        self.resolvers.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use serde_json::json;

    #[test]
    fn test_newer_timestamp_wins() {
        let now = Utc::now();
        let local = Revision::new(json!("local"), now);
        let remote = Revision::new(json!("remote"), now - Duration::seconds(5));

        let resolution = newer_revision(&local, &remote);
        assert_eq!(resolution.from, ResolvedFrom::Local);
        assert!(!resolution.tie);
    }

    #[test]
    fn test_tie_defaults_to_remote() {
        let now = Utc::now();
        let resolution = newer_revision(
            &Revision::new(json!(1), now),
            &Revision::new(json!(2), now),
        );
        assert_eq!(resolution.value, json!(2));
        assert!(resolution.tie);
    }

    #[test]
    fn test_first_matching_resolver_applies() {
        let registry = ResolverRegistry::default();
        registry.register("votes", Arc::new(|_: &Revision, _: &Revision| json!("votes-resolver")));
        registry.register(r"^proposal:\d+$", Arc::new(|l: &Revision, _: &Revision| l.value.clone()));

        let now = Utc::now();
        let local = Revision::new(json!("mine"), now - Duration::seconds(60));
        let remote = Revision::new(json!("theirs"), now);

        assert_eq!(
            registry.resolve("member:votes", &local, &remote).value,
            json!("votes-resolver")
        );
        let by_regex = registry.resolve("proposal:17", &local, &remote);
        assert_eq!(by_regex.value, json!("mine"));
        assert_eq!(by_regex.from, ResolvedFrom::Resolver);

        let default = registry.resolve("profile", &local, &remote);
        assert_eq!(default.value, json!("theirs"));
        assert_eq!(registry.len(), 2);
    }
}
